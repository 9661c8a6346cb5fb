//! External collaborators: embedding encoder, frame store, search index.
//!
//! The reconciliation engine and the batch jobs only see these traits.
//! Concrete implementations are built once at startup and injected as
//! `Arc<dyn _>`; tests substitute in-memory fakes.

pub mod encoder;
pub mod frames;
pub mod opensearch;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use encoder::HttpEncoder;
pub use frames::FfmpegFrameStore;
pub use opensearch::OpenSearchIndex;

/// Dimension of every vector produced by the encoder.
pub const EMBEDDING_DIM: usize = 512;

/// Text and image embedding model. Identical input must give identical output.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn text_encode(&self, text: &str) -> Result<Vec<f32>>;

    async fn image_encode(&self, image: &Path) -> Result<Vec<f32>>;
}

/// Extracted video frames, stored per `(video_id, annotation_id)`.
#[async_trait]
pub trait FrameStore: Send + Sync {
    /// Extract the frames of `[start_ms, end_ms]`, replacing any previous set.
    async fn extract(
        &self,
        video_id: &str,
        annotation_id: &str,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<Vec<PathBuf>>;

    /// Frames already on disk, in time order. Empty when none exist.
    async fn frames(&self, video_id: &str, annotation_id: &str) -> Result<Vec<PathBuf>>;

    /// Remove every frame of the annotation. Succeeds when there are none.
    async fn delete(&self, video_id: &str, annotation_id: &str) -> Result<()>;

    /// A single still frame at `at_ms`, reused when it already exists.
    async fn still(&self, video_id: &str, annotation_id: &str, at_ms: u64) -> Result<PathBuf>;

    /// Native frame rate of the video.
    async fn frame_rate(&self, video_id: &str) -> Result<f64>;
}

/// k-NN search engine holding one document per indexed annotation.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create the index with its vector mapping if it does not exist yet.
    async fn ensure_index(&self) -> Result<()>;

    async fn upsert(&self, document: &IndexDocument) -> Result<()>;

    /// Delete a document by key. Succeeds when the document is absent.
    async fn delete(&self, id: &str) -> Result<()>;

    async fn knn_search(&self, field: VectorField, vector: &[f32], k: usize) -> Result<Vec<SearchHit>>;
}

/// Document key shared by the index and the ground-truth sets.
#[must_use]
pub fn index_key(video_id: &str, annotation_id: &str) -> String {
    format!("{video_id}_{annotation_id}")
}

/// One annotation as stored in the search index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub video_id: String,
    pub annotation_id: String,
    pub annotation_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_frame_embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_frame_embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_frame_embedding: Option<Vec<f32>>,
    pub annotation_embedding: Vec<f32>,
}

impl IndexDocument {
    #[must_use]
    pub fn id(&self) -> String {
        index_key(&self.video_id, &self.annotation_id)
    }
}

/// Vector field a k-NN query runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VectorField {
    Base,
    Average,
    Best,
    #[default]
    Annotation,
}

impl VectorField {
    pub const ALL: [VectorField; 4] = [Self::Base, Self::Average, Self::Best, Self::Annotation];

    /// Field name in the index mapping.
    #[must_use]
    pub fn field_name(self) -> &'static str {
        match self {
            Self::Base => "base_frame_embedding",
            Self::Average => "average_frame_embedding",
            Self::Best => "best_frame_embedding",
            Self::Annotation => "annotation_embedding",
        }
    }

    fn short_name(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Average => "average",
            Self::Best => "best",
            Self::Annotation => "annotation",
        }
    }
}

impl fmt::Display for VectorField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

impl FromStr for VectorField {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.short_name() == s || f.field_name() == s)
            .ok_or_else(|| format!("unknown vector field '{s}' (expected base, average, best or annotation)"))
    }
}

/// A ranked k-NN result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub video_id: Option<String>,
    pub annotation_id: Option<String>,
    pub annotation_value: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_key_format() {
        assert_eq!(index_key("12", "a7"), "12_a7");
    }

    #[test]
    fn test_vector_field_parse() {
        assert_eq!("best".parse::<VectorField>().unwrap(), VectorField::Best);
        assert_eq!(
            "average_frame_embedding".parse::<VectorField>().unwrap(),
            VectorField::Average
        );
        assert!("texture".parse::<VectorField>().is_err());
        assert_eq!(VectorField::default().field_name(), "annotation_embedding");
    }

    #[test]
    fn test_document_skips_missing_frame_vectors() {
        let doc = IndexDocument {
            video_id: "3".into(),
            annotation_id: "a1".into(),
            annotation_value: "smile".into(),
            base_frame_embedding: None,
            average_frame_embedding: None,
            best_frame_embedding: None,
            annotation_embedding: vec![0.5; 2],
        };
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json.get("base_frame_embedding").is_none());
        assert_eq!(doc.id(), "3_a1");
    }
}
