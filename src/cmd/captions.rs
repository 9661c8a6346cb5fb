use std::path::PathBuf;

use anyhow::Result;

use lgp_corpus::captions::{self, CaptionFormat};
use lgp_corpus::config::CorpusConfig;

use super::build_engine;

pub async fn cmd_captions(
    config: &CorpusConfig,
    video: &str,
    format: CaptionFormat,
    output: Option<PathBuf>,
) -> Result<()> {
    let engine = build_engine(config)?;
    let doc = engine.load_annotations(video).await?;
    let rendered = captions::render_document(&doc, &config.tiers.transcription, format)?;

    match output {
        Some(path) => {
            std::fs::write(&path, &rendered)?;
            eprintln!("💾 Saved {} bytes to {}", rendered.len(), path.display());
        }
        None => print!("{rendered}"),
    }
    Ok(())
}
