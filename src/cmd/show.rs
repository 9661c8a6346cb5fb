use anyhow::Result;

use lgp_corpus::config::CorpusConfig;

use super::{build_engine, print_json};

pub async fn cmd_show(config: &CorpusConfig, video: &str, tier: Option<&str>) -> Result<()> {
    let engine = build_engine(config)?;
    let doc = engine.load_annotations(video).await?;
    match tier {
        Some(tier_id) => print_json(doc.tier(tier_id)?),
        None => print_json(&doc),
    }
}
