//! Per-annotation embedding tables.
//!
//! Six parallel tables keyed `video_id -> annotation_id`, each persisted as
//! `{variant}_embeddings.json`. Frame-derived variants are computed together
//! from one set of frame vectors; the text variant is the encoding of the
//! lower-cased annotation value. All six are written in the same save.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::collab::{Encoder, IndexDocument};
use crate::error::Result;
use crate::store::persist::write_atomic;

pub type Vector = Vec<f32>;

/// Keyed mapping `video_id -> annotation_id -> T`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmbeddingTable<T> {
    entries: BTreeMap<String, BTreeMap<String, T>>,
}

impl<T> Default for EmbeddingTable<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> EmbeddingTable<T> {
    #[must_use]
    pub fn get(&self, video_id: &str, annotation_id: &str) -> Option<&T> {
        self.entries.get(video_id)?.get(annotation_id)
    }

    pub fn insert(&mut self, video_id: &str, annotation_id: &str, value: T) {
        self.entries
            .entry(video_id.to_owned())
            .or_default()
            .insert(annotation_id.to_owned(), value);
    }

    pub fn remove(&mut self, video_id: &str, annotation_id: &str) -> Option<T> {
        let video = self.entries.get_mut(video_id)?;
        let removed = video.remove(annotation_id);
        if video.is_empty() {
            self.entries.remove(video_id);
        }
        removed
    }

    #[must_use]
    pub fn contains(&self, video_id: &str, annotation_id: &str) -> bool {
        self.get(video_id, annotation_id).is_some()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The five frame-derived vectors of one annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameEmbeddings {
    /// Sum of up to four evenly spaced frames.
    pub base: Vector,
    pub average: Vector,
    /// The frame vector with the largest L2 norm.
    pub best: Vector,
    pub summed: Vector,
    pub all_frames: Vec<Vector>,
}

impl FrameEmbeddings {
    /// `None` when there are no frames.
    #[must_use]
    pub fn from_frames(frames: Vec<Vector>) -> Option<Self> {
        let first = frames.first()?;
        let dim = first.len();
        let n = frames.len();

        let step = (n - 1) / 4 + 1;
        let base = sum(frames.iter().step_by(step).take(4), dim);
        let summed = sum(frames.iter(), dim);
        #[allow(clippy::cast_precision_loss)]
        let average = summed.iter().map(|v| v / n as f32).collect();
        let best = frames
            .iter()
            .max_by(|a, b| l2_norm(a).total_cmp(&l2_norm(b)))
            .cloned()
            .unwrap_or_default();

        Some(Self {
            base,
            average,
            best,
            summed,
            all_frames: frames,
        })
    }
}

fn sum<'a>(vectors: impl Iterator<Item = &'a Vector>, dim: usize) -> Vector {
    let mut total = vec![0.0; dim];
    for vector in vectors {
        for (acc, v) in total.iter_mut().zip(vector) {
            *acc += v;
        }
    }
    total
}

fn l2_norm(vector: &[f32]) -> f32 {
    vector.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Encode every frame image, in order.
pub async fn embed_frames(encoder: &dyn Encoder, frames: &[PathBuf]) -> Result<Vec<Vector>> {
    let mut vectors = Vec::with_capacity(frames.len());
    for frame in frames {
        vectors.push(encoder.image_encode(frame).await?);
    }
    Ok(vectors)
}

/// Text embedding input for an annotation value.
#[must_use]
pub fn text_input(value: &str) -> String {
    value.to_lowercase()
}

/// The six embedding tables of a corpus.
#[derive(Debug, Default)]
pub struct EmbeddingStores {
    dir: PathBuf,
    pub base: EmbeddingTable<Vector>,
    pub average: EmbeddingTable<Vector>,
    pub best: EmbeddingTable<Vector>,
    pub summed: EmbeddingTable<Vector>,
    pub all_frames: EmbeddingTable<Vec<Vector>>,
    pub text: EmbeddingTable<Vector>,
}

impl EmbeddingStores {
    /// Load every table under `dir`; missing files are empty tables.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        Ok(Self {
            base: load_table(&dir, "base")?,
            average: load_table(&dir, "average")?,
            best: load_table(&dir, "best")?,
            summed: load_table(&dir, "summed")?,
            all_frames: load_table(&dir, "all_frames")?,
            text: load_table(&dir, "text")?,
            dir,
        })
    }

    pub fn save(&self) -> Result<()> {
        save_table(&self.dir, "base", &self.base)?;
        save_table(&self.dir, "average", &self.average)?;
        save_table(&self.dir, "best", &self.best)?;
        save_table(&self.dir, "summed", &self.summed)?;
        save_table(&self.dir, "all_frames", &self.all_frames)?;
        save_table(&self.dir, "text", &self.text)?;
        debug!("Saved embedding tables to {}", self.dir.display());
        Ok(())
    }

    /// Replace the frame-derived variants of one annotation.
    pub fn set_frames(&mut self, video_id: &str, annotation_id: &str, frames: FrameEmbeddings) {
        self.base.insert(video_id, annotation_id, frames.base);
        self.average.insert(video_id, annotation_id, frames.average);
        self.best.insert(video_id, annotation_id, frames.best);
        self.summed.insert(video_id, annotation_id, frames.summed);
        self.all_frames
            .insert(video_id, annotation_id, frames.all_frames);
    }

    /// Drop the frame-derived variants, e.g. when an annotation has no frames.
    pub fn clear_frames(&mut self, video_id: &str, annotation_id: &str) {
        self.base.remove(video_id, annotation_id);
        self.average.remove(video_id, annotation_id);
        self.best.remove(video_id, annotation_id);
        self.summed.remove(video_id, annotation_id);
        self.all_frames.remove(video_id, annotation_id);
    }

    pub fn set_text(&mut self, video_id: &str, annotation_id: &str, vector: Vector) {
        self.text.insert(video_id, annotation_id, vector);
    }

    /// Remove the annotation from all six tables.
    pub fn remove(&mut self, video_id: &str, annotation_id: &str) {
        self.clear_frames(video_id, annotation_id);
        self.text.remove(video_id, annotation_id);
    }

    /// Every embedded annotation has a text vector; frame variants are
    /// absent when it had no frames.
    #[must_use]
    pub fn is_embedded(&self, video_id: &str, annotation_id: &str) -> bool {
        self.text.contains(video_id, annotation_id)
    }

    /// Search-index document for an annotation with a text embedding.
    #[must_use]
    pub fn index_document(&self, video_id: &str, annotation_id: &str, value: &str) -> Option<IndexDocument> {
        Some(IndexDocument {
            video_id: video_id.to_owned(),
            annotation_id: annotation_id.to_owned(),
            annotation_value: value.to_owned(),
            base_frame_embedding: self.base.get(video_id, annotation_id).cloned(),
            average_frame_embedding: self.average.get(video_id, annotation_id).cloned(),
            best_frame_embedding: self.best.get(video_id, annotation_id).cloned(),
            annotation_embedding: self.text.get(video_id, annotation_id)?.clone(),
        })
    }
}

fn table_path(dir: &Path, variant: &str) -> PathBuf {
    dir.join(format!("{variant}_embeddings.json"))
}

fn load_table<T: DeserializeOwned>(dir: &Path, variant: &str) -> Result<EmbeddingTable<T>> {
    let path = table_path(dir, variant);
    if !path.is_file() {
        return Ok(EmbeddingTable::default());
    }
    let bytes = std::fs::read(&path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn save_table<T: Serialize>(dir: &Path, variant: &str, table: &EmbeddingTable<T>) -> Result<()> {
    write_atomic(&table_path(dir, variant), &serde_json::to_vec(table)?)
}
