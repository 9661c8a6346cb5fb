//! Millisecond offsets and `HH:MM:SS[.mmm]` clock strings.
//!
//! The whole-second form truncates the millisecond remainder; anything that
//! needs frame accuracy (ffmpeg seeks, caption cues) uses [`to_clock_subsecond`].

/// Format milliseconds as `HH:MM:SS`, dropping the sub-second part.
#[must_use]
pub fn to_clock(ms: u64) -> String {
    let (hours, minutes, seconds, _) = components(ms);
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Format milliseconds as `HH:MM:SS.mmm`.
#[must_use]
pub fn to_clock_subsecond(ms: u64) -> String {
    let (hours, minutes, seconds, millis) = components(ms);
    format!("{hours:02}:{minutes:02}:{seconds:02}.{millis:03}")
}

/// Build a millisecond offset from clock components.
#[must_use]
pub fn from_clock(hours: u64, minutes: u64, seconds: u64, millis: u64) -> u64 {
    (hours * 3600 + minutes * 60 + seconds) * 1000 + millis
}

/// [`from_clock`] that returns `None` instead of overflowing.
#[must_use]
pub fn checked_from_clock(hours: u64, minutes: u64, seconds: u64, millis: u64) -> Option<u64> {
    hours
        .checked_mul(3600)?
        .checked_add(minutes.checked_mul(60)?)?
        .checked_add(seconds)?
        .checked_mul(1000)?
        .checked_add(millis)
}

/// Split milliseconds into `(hours, minutes, seconds, millis)`.
#[must_use]
pub fn components(ms: u64) -> (u64, u64, u64, u64) {
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let seconds = (ms % 60_000) / 1000;
    let millis = ms % 1000;
    (hours, minutes, seconds, millis)
}

/// Parse `HH:MM:SS`, `HH:MM:SS.mmm`, `MM:SS(.mmm)` or a bare millisecond count.
///
/// The fractional part is read as a decimal fraction of a second, so `.5`
/// means 500 ms.
#[must_use]
pub fn parse_clock(input: &str) -> Option<u64> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if !input.contains(':') {
        return input.parse().ok();
    }

    let (clock, fraction) = match input.split_once('.') {
        Some((clock, fraction)) => (clock, Some(fraction)),
        None => (input, None),
    };

    let parts: Vec<u64> = clock
        .split(':')
        .map(str::parse)
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    let (hours, minutes, seconds) = match parts.as_slice() {
        [h, m, s] => (*h, *m, *s),
        [m, s] => (0, *m, *s),
        _ => return None,
    };
    if minutes >= 60 || seconds >= 60 {
        return None;
    }

    let millis = match fraction {
        None => 0,
        Some(f) if f.is_empty() || f.len() > 3 || !f.bytes().all(|b| b.is_ascii_digit()) => {
            return None
        }
        Some(f) => {
            let digits: u64 = f.parse().ok()?;
            digits * 10u64.pow(3 - u32::try_from(f.len()).ok()?)
        }
    };

    checked_from_clock(hours, minutes, seconds, millis)
}
