//! Frame extraction via ffmpeg.
//!
//! Frames live under `{root}/{video_id}/{annotation_id}/frame_NNNN.jpg`;
//! phrase stills under `{root}/{video_id}/phrases/{annotation_id}.jpg`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::FrameStore;
use crate::error::{CorpusError, Result};
use crate::time::to_clock_subsecond;

const SERVICE: &str = "ffmpeg";

/// [`FrameStore`] backed by the ffmpeg/ffprobe binaries.
#[derive(Debug, Clone)]
pub struct FfmpegFrameStore {
    root: PathBuf,
    videos_dir: PathBuf,
    video_extension: String,
    ffmpeg_path: String,
    ffprobe_path: String,
}

impl FfmpegFrameStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, videos_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            videos_dir: videos_dir.into(),
            video_extension: "mp4".to_string(),
            ffmpeg_path: locate("ffmpeg"),
            ffprobe_path: locate("ffprobe"),
        }
    }

    #[must_use]
    pub fn with_video_extension(mut self, extension: impl Into<String>) -> Self {
        self.video_extension = extension.into();
        self
    }

    #[must_use]
    pub fn video_path(&self, video_id: &str) -> PathBuf {
        self.videos_dir
            .join(format!("{video_id}.{}", self.video_extension))
    }

    fn annotation_dir(&self, video_id: &str, annotation_id: &str) -> PathBuf {
        self.root.join(video_id).join(annotation_id)
    }

    fn still_path(&self, video_id: &str, annotation_id: &str) -> PathBuf {
        self.root
            .join(video_id)
            .join("phrases")
            .join(format!("{annotation_id}.jpg"))
    }

    fn existing_video(&self, video_id: &str) -> Result<PathBuf> {
        let path = self.video_path(video_id);
        if path.is_file() {
            Ok(path)
        } else {
            Err(CorpusError::not_found(format!("video file {}", path.display())))
        }
    }

    async fn run_ffmpeg(&self, args: &[&str]) -> Result<()> {
        let output = Command::new(&self.ffmpeg_path)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| CorpusError::external(SERVICE, format!("failed to run ffmpeg: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last_line = stderr.lines().last().unwrap_or("no output");
            return Err(CorpusError::external(
                SERVICE,
                format!("ffmpeg exited with {}: {last_line}", output.status),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl FrameStore for FfmpegFrameStore {
    #[instrument(skip(self))]
    async fn extract(
        &self,
        video_id: &str,
        annotation_id: &str,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<Vec<PathBuf>> {
        let video = self.existing_video(video_id)?;
        let dir = self.annotation_dir(video_id, annotation_id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        tokio::fs::create_dir_all(&dir).await?;

        let start = to_clock_subsecond(start_ms);
        let end = to_clock_subsecond(end_ms);
        let pattern = dir.join("frame_%04d.jpg");

        self.run_ffmpeg(&[
            "-ss",
            &start,
            "-to",
            &end,
            "-i",
            &path_arg(&video)?,
            "-q:v",
            "2", // High quality JPEG
            &path_arg(&pattern)?,
            "-y",
        ])
        .await?;

        let frames = self.frames(video_id, annotation_id).await?;
        debug!("Extracted {} frame(s) for {video_id}/{annotation_id}", frames.len());
        Ok(frames)
    }

    async fn frames(&self, video_id: &str, annotation_id: &str) -> Result<Vec<PathBuf>> {
        let dir = self.annotation_dir(video_id, annotation_id);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut frames: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "jpg" || ext == "png"))
            .collect();
        frames.sort();
        Ok(frames)
    }

    async fn delete(&self, video_id: &str, annotation_id: &str) -> Result<()> {
        let dir = self.annotation_dir(video_id, annotation_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    async fn still(&self, video_id: &str, annotation_id: &str, at_ms: u64) -> Result<PathBuf> {
        let output = self.still_path(video_id, annotation_id);
        if output.is_file() {
            return Ok(output);
        }
        let video = self.existing_video(video_id)?;
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        self.run_ffmpeg(&[
            "-ss",
            &to_clock_subsecond(at_ms),
            "-i",
            &path_arg(&video)?,
            "-frames:v",
            "1",
            "-q:v",
            "2",
            &path_arg(&output)?,
            "-y",
        ])
        .await?;
        Ok(output)
    }

    #[instrument(skip(self))]
    async fn frame_rate(&self, video_id: &str) -> Result<f64> {
        let video = self.existing_video(video_id)?;
        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_streams",
                &path_arg(&video)?,
            ])
            .output()
            .await
            .map_err(|e| CorpusError::external("ffprobe", format!("failed to run ffprobe: {e}")))?;

        if !output.status.success() {
            return Err(CorpusError::external("ffprobe", "ffprobe failed"));
        }

        let probe: FfprobeOutput = serde_json::from_slice(&output.stdout)?;
        probe
            .streams
            .iter()
            .filter(|s| s.codec_type.as_deref() == Some("video"))
            .find_map(|s| s.r_frame_rate.as_deref().and_then(parse_frame_rate))
            .ok_or_else(|| CorpusError::external("ffprobe", "no video stream with a frame rate"))
    }
}

fn locate(binary: &str) -> String {
    which::which(binary).map_or_else(|_| binary.to_string(), |p| p.to_string_lossy().to_string())
}

fn path_arg(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_owned)
        .ok_or_else(|| CorpusError::invalid(format!("non UTF-8 path {}", path.display())))
}

/// Parse an ffprobe rate such as `"30/1"`, `"30000/1001"` or `"25"`.
fn parse_frame_rate(rate: &str) -> Option<f64> {
    let fps = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse().ok()?,
    };
    (fps > 0.0).then_some(fps)
}

/// `FFprobe` JSON output structure
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    r_frame_rate: Option<String>,
}
