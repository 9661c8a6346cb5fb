use anyhow::Result;

use lgp_corpus::config::CorpusConfig;
use lgp_corpus::reconcile::{AddRequest, EditRequest, RequestContext};

use super::{build_engine, print_report};

fn context(video: &str, return_to: Option<String>) -> RequestContext {
    match return_to {
        Some(page) => RequestContext::new(video).with_return_to(page),
        None => RequestContext::new(video),
    }
}

pub async fn cmd_add(
    config: &CorpusConfig,
    video: &str,
    request: &AddRequest,
    return_to: Option<String>,
) -> Result<()> {
    let engine = build_engine(config)?;
    let report = engine.add(&context(video, return_to), request).await?;
    print_report(&report)
}

pub async fn cmd_edit(
    config: &CorpusConfig,
    video: &str,
    request: &EditRequest,
    return_to: Option<String>,
) -> Result<()> {
    let engine = build_engine(config)?;
    let report = engine.edit(&context(video, return_to), request).await?;
    print_report(&report)
}

pub async fn cmd_delete(
    config: &CorpusConfig,
    video: &str,
    tier: &str,
    id: &str,
    return_to: Option<String>,
) -> Result<()> {
    let engine = build_engine(config)?;
    let report = engine.delete(&context(video, return_to), tier, id).await?;
    print_report(&report)
}

pub async fn cmd_rate(config: &CorpusConfig, video: &str, tier: &str, id: &str, rating: u8) -> Result<()> {
    let engine = build_engine(config)?;
    let report = engine
        .rate(&RequestContext::new(video), tier, id, rating)
        .await?;
    print_report(&report)
}
