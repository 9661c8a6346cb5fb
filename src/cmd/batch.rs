use std::time::Instant;

use anyhow::Result;

use lgp_corpus::batch::{self, BatchSummary};
use lgp_corpus::config::CorpusConfig;

use super::{build_engine, print_json};

fn report(job: &str, summary: &BatchSummary, started: Instant) -> Result<()> {
    eprintln!(
        "📦 {job}: {} processed, {} skipped, {} failed in {:.1}s",
        summary.processed,
        summary.skipped,
        summary.failed,
        started.elapsed().as_secs_f64()
    );
    print_json(summary)
}

pub async fn cmd_parse(config: &CorpusConfig) -> Result<()> {
    let engine = build_engine(config)?;
    let started = Instant::now();
    let summary = batch::parse_all(&engine).await?;
    report("parse", &summary, started)
}

pub async fn cmd_frames(config: &CorpusConfig) -> Result<()> {
    let engine = build_engine(config)?;
    let started = Instant::now();
    let summary = batch::extract_all_frames(&engine).await?;
    report("frames", &summary, started)
}

pub async fn cmd_embed(config: &CorpusConfig) -> Result<()> {
    let engine = build_engine(config)?;
    let started = Instant::now();
    let summary = batch::embed_all(&engine).await?;
    report("embed", &summary, started)
}

pub async fn cmd_reindex(config: &CorpusConfig) -> Result<()> {
    let engine = build_engine(config)?;
    let started = Instant::now();
    let summary = batch::reindex_all(&engine).await?;
    report("reindex", &summary, started)
}

pub async fn cmd_pipeline(config: &CorpusConfig) -> Result<()> {
    let engine = build_engine(config)?;
    let started = Instant::now();
    let summary = batch::pipeline(&engine).await?;
    eprintln!(
        "✅ Pipeline finished in {:.1}s ({} parsed, {} frame sets, {} embedded, {} indexed)",
        started.elapsed().as_secs_f64(),
        summary.parse.processed,
        summary.frames.processed,
        summary.embed.processed,
        summary.reindex.processed
    );
    print_json(&summary)
}
