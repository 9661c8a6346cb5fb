pub mod annotation;
pub mod batch;
pub mod captions;
pub mod search;
pub mod show;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use lgp_corpus::collab::{FfmpegFrameStore, HttpEncoder, OpenSearchIndex};
use lgp_corpus::config::CorpusConfig;
use lgp_corpus::reconcile::{Collaborators, ReconciliationEngine};
use lgp_corpus::CommitReport;

pub fn load_config(path: Option<&Path>) -> Result<CorpusConfig> {
    CorpusConfig::load(path).context("failed to load configuration")
}

/// Wire the concrete collaborators into an engine.
pub fn build_engine(config: &CorpusConfig) -> Result<ReconciliationEngine> {
    let collab = Collaborators {
        encoder: Arc::new(HttpEncoder::new(&config.encoder)?),
        frames: Arc::new(
            FfmpegFrameStore::new(&config.paths.frames, &config.paths.videos)
                .with_video_extension(&config.paths.video_extension),
        ),
        index: Arc::new(OpenSearchIndex::new(&config.opensearch)?),
    };
    ReconciliationEngine::new(config.engine_settings(), collab)
        .context("failed to open embedding tables")
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Report on stdout, degraded derived sync on stderr.
pub fn print_report(report: &CommitReport) -> Result<()> {
    if report.derived_synced {
        eprintln!("✅ Committed {} in video {}", report.annotation_id, report.video_id);
    } else {
        eprintln!(
            "⚠️  Committed {} in video {}; derived artifacts lag behind:",
            report.annotation_id, report.video_id
        );
        for warning in &report.warnings {
            eprintln!("   {warning}");
        }
    }
    print_json(report)
}
