use anyhow::Result;

use lgp_corpus::config::CorpusConfig;
use lgp_corpus::query;
use lgp_corpus::VectorField;

use super::{build_engine, print_json};

pub async fn cmd_search(
    config: &CorpusConfig,
    text: &str,
    field: VectorField,
    k: usize,
    tier: Option<&str>,
) -> Result<()> {
    let engine = build_engine(config)?;
    let tier_id = tier.unwrap_or(&config.tiers.expression);

    eprintln!("🔍 Searching '{text}' on {field} embeddings (k = {k})");
    let report = query::evaluate(&engine, tier_id, text, field, k).await?;
    eprintln!(
        "   {} hits, {} relevant: precision {:.2}, recall {:.2}, F1 {:.2}",
        report.hits.len(),
        report.relevant,
        report.scores.precision,
        report.scores.recall,
        report.scores.f1
    );
    print_json(&report)
}
