//! `lgp-corpus` - annotation tooling for Portuguese Sign Language video corpora
//!
//! # Features
//!
//! - **EAF documents**: lossless ELAN parsing, tier-name normalization, and
//!   annotation add/edit/delete with time-slot and id bookkeeping
//! - **Annotation store**: the per-video JSON projection, with the
//!   expression-to-phrase join and atomic persistence
//! - **Reconciliation**: every edit lands in both stores under a per-video
//!   lock, then frames, embeddings and the search index catch up
//! - **Batch jobs**: parse, frame extraction, embedding and reindexing over a
//!   whole corpus
//! - **Search**: k-NN text queries scored against substring ground truth
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lgp_corpus::config::CorpusConfig;
//! use lgp_corpus::collab::{FfmpegFrameStore, HttpEncoder, OpenSearchIndex};
//! use lgp_corpus::reconcile::{AddRequest, Collaborators, ReconciliationEngine, RequestContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = CorpusConfig::load(None)?;
//!     let collab = Collaborators {
//!         encoder: Arc::new(HttpEncoder::new(&config.encoder)?),
//!         frames: Arc::new(FfmpegFrameStore::new(&config.paths.frames, &config.paths.videos)),
//!         index: Arc::new(OpenSearchIndex::new(&config.opensearch)?),
//!     };
//!     let engine = ReconciliationEngine::new(config.engine_settings(), collab)?;
//!
//!     let report = engine
//!         .add(
//!             &RequestContext::new("12"),
//!             &AddRequest {
//!                 tier_id: "GLOSA_P1_EXPRESSAO".into(),
//!                 value: "sorriso".into(),
//!                 start_ms: 1_000,
//!                 end_ms: 1_500,
//!                 ref_annotation_id: None,
//!             },
//!         )
//!         .await?;
//!     println!("added {}", report.annotation_id);
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod captions;
pub mod collab;
pub mod config;
pub mod eaf;
pub mod embeddings;
pub mod error;
pub mod query;
pub mod reconcile;
pub mod store;
pub mod time;

pub use collab::{Encoder, FrameStore, IndexDocument, SearchHit, SearchIndex, VectorField};
pub use eaf::{EafDocument, TierAliases};
pub use error::{CorpusError, Result};
pub use reconcile::{CommitReport, ReconciliationEngine, RequestContext};
pub use store::{AnnotationDocument, AnnotationStore};

/// Version of lgp-corpus
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
