//! Caption tracks from the free-transcription tier.
//!
//! Supports `WebVTT` (the corpus format, `{video_id}.vtt`) and SRT.

use std::fmt::Write as FmtWrite;
use std::path::{Path, PathBuf};

use crate::error::{CorpusError, Result};
use crate::store::{AnnotationDocument, Tier};
use crate::time::{components, to_clock_subsecond};

/// Caption format type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptionFormat {
    /// `WebVTT` format (.vtt) - web standard
    #[default]
    Vtt,
    /// `SubRip` format (.srt) - simple, widely compatible
    Srt,
}

impl CaptionFormat {
    /// Get file extension for this format
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Vtt => "vtt",
            Self::Srt => "srt",
        }
    }
}

/// One caption segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionCue {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

/// Cues for every annotation with a non-empty value, in tier order.
#[must_use]
pub fn cues_from_tier(tier: &Tier) -> Vec<CaptionCue> {
    tier.annotations
        .iter()
        .filter_map(|a| {
            let text = a.value.as_deref()?.trim();
            (!text.is_empty()).then(|| CaptionCue {
                start_ms: a.start_ms,
                end_ms: a.end_ms,
                text: text.to_owned(),
            })
        })
        .collect()
}

/// Render cues in the requested format.
#[must_use]
pub fn render(cues: &[CaptionCue], format: CaptionFormat) -> String {
    let mut output = String::new();
    // writing into a String cannot fail
    let _ = match format {
        CaptionFormat::Vtt => write_vtt(&mut output, cues),
        CaptionFormat::Srt => write_srt(&mut output, cues),
    };
    output
}

fn write_vtt(output: &mut String, cues: &[CaptionCue]) -> std::fmt::Result {
    writeln!(output, "WEBVTT")?;
    writeln!(output)?;
    for cue in cues {
        writeln!(
            output,
            "{} --> {}",
            to_clock_subsecond(cue.start_ms),
            to_clock_subsecond(cue.end_ms)
        )?;
        writeln!(output, "{}", cue.text)?;
        writeln!(output)?;
    }
    Ok(())
}

fn write_srt(output: &mut String, cues: &[CaptionCue]) -> std::fmt::Result {
    for (i, cue) in cues.iter().enumerate() {
        // Sequence number (1-indexed)
        writeln!(output, "{}", i + 1)?;
        writeln!(output, "{} --> {}", srt_time(cue.start_ms), srt_time(cue.end_ms))?;
        writeln!(output, "{}", cue.text)?;
        writeln!(output)?;
    }
    Ok(())
}

/// SRT timestamp (HH:MM:SS,mmm)
fn srt_time(ms: u64) -> String {
    let (hours, minutes, seconds, millis) = components(ms);
    format!("{hours:02}:{minutes:02}:{seconds:02},{millis:03}")
}

/// Render the caption track of `tier_id`.
pub fn render_document(doc: &AnnotationDocument, tier_id: &str, format: CaptionFormat) -> Result<String> {
    let tier = doc
        .tiers
        .get(tier_id)
        .ok_or_else(|| CorpusError::not_found(format!("transcription tier {tier_id}")))?;
    Ok(render(&cues_from_tier(tier), format))
}

/// Path of a video's caption file under `dir`.
#[must_use]
pub fn caption_path(dir: &Path, video_id: &str, format: CaptionFormat) -> PathBuf {
    dir.join(format!("{video_id}.{}", format.extension()))
}

/// Regenerate `{dir}/{video_id}.vtt` from the whole transcription tier.
pub fn write_track(dir: &Path, video_id: &str, doc: &AnnotationDocument, tier_id: &str) -> Result<PathBuf> {
    let content = render_document(doc, tier_id, CaptionFormat::Vtt)?;
    let path = caption_path(dir, video_id, CaptionFormat::Vtt);
    crate::store::persist::write_atomic(&path, content.as_bytes())?;
    Ok(path)
}
