//! On-disk layout of the JSON projection and the atomic write helper.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{AnnotationDocument, PhraseMatch};
use crate::eaf::EafDocument;
use crate::error::{CorpusError, Result};

/// Replace `path` with `bytes` so readers only ever see the old or the new
/// content: write a uniquely named sibling temp file, flush it, then rename
/// over the target.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    if path.file_name().is_none() {
        return Err(CorpusError::invalid(format!("not a file path: {}", path.display())));
    }

    // Dropped without persisting, the temp file is removed.
    let mut file = tempfile::Builder::new()
        .prefix(".lgp-")
        .suffix(".tmp")
        .tempfile_in(parent)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| CorpusError::Io(e.error))?;
    Ok(())
}

/// Directory of `{video_id}.json` projections.
#[derive(Debug, Clone)]
pub struct AnnotationStore {
    dir: PathBuf,
}

impl AnnotationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn path_for(&self, video_id: &str) -> PathBuf {
        self.dir.join(format!("{video_id}.json"))
    }

    #[must_use]
    pub fn exists(&self, video_id: &str) -> bool {
        self.path_for(video_id).is_file()
    }

    pub fn load(&self, video_id: &str) -> Result<AnnotationDocument> {
        let path = self.path_for(video_id);
        let bytes = std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                CorpusError::not_found(format!("annotation store for video {video_id}"))
            }
            _ => CorpusError::Io(e),
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn persist(&self, video_id: &str, doc: &AnnotationDocument) -> Result<()> {
        let json = serde_json::to_vec_pretty(doc)?;
        write_atomic(&self.path_for(video_id), &json)
    }

    /// Create the projection from `eaf` unless one already exists.
    ///
    /// Returns `false` when the video was skipped. An existing projection is
    /// never rebuilt: edits reach it through the reconciliation engine.
    pub fn build_if_missing(
        &self,
        video_id: &str,
        eaf: &EafDocument,
        frame_rate: f64,
        phrase: &PhraseMatch,
    ) -> Result<bool> {
        if self.exists(video_id) {
            debug!("Annotation store for {video_id} exists, skipping build");
            return Ok(false);
        }
        let doc = AnnotationDocument::build_from_eaf(eaf, frame_rate, phrase)?;
        self.persist(video_id, &doc)?;
        Ok(true)
    }

    /// Video ids that have a projection, sorted.
    pub fn video_ids(&self) -> Result<Vec<String>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids: Vec<String> = std::fs::read_dir(&self.dir)?
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        ids.sort();
        Ok(ids)
    }
}
