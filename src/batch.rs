//! Corpus maintenance jobs: parse -> frames -> embed -> reindex
//!
//! Each job walks every video, skips the ones whose output already exists,
//! and logs per-item failures without aborting the run.

use std::path::Path;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::captions;
use crate::collab::index_key;
use crate::eaf::EafDocument;
use crate::embeddings::{embed_frames, text_input, FrameEmbeddings};
use crate::error::{CorpusError, Result};
use crate::reconcile::ReconciliationEngine;
use crate::store::{Annotation, AnnotationDocument};

/// Per-job counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BatchSummary {
    fn record<T>(&mut self, item: &str, result: Result<T>) {
        match result {
            Ok(_) => self.processed += 1,
            Err(e) => {
                warn!("Skipping {item}: {e}");
                self.failed += 1;
            }
        }
    }
}

/// Summaries of a full pipeline run, in job order.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PipelineSummary {
    pub parse: BatchSummary,
    pub frames: BatchSummary,
    pub embed: BatchSummary,
    pub reindex: BatchSummary,
}

/// Video ids with an `.eaf` file in `dir`, sorted.
pub fn eaf_video_ids(dir: &Path) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "eaf") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_owned());
            }
        }
    }
    ids.sort();
    Ok(ids)
}

/// Build the annotation store and caption track of every EAF file that has
/// no projection yet.
pub async fn parse_all(engine: &ReconciliationEngine) -> Result<BatchSummary> {
    let settings = engine.settings();
    let mut summary = BatchSummary::default();

    for video_id in eaf_video_ids(&settings.eaf_dir)? {
        if engine.store().exists(&video_id) {
            debug!("{video_id} already parsed");
            summary.skipped += 1;
            continue;
        }
        let result = parse_one(engine, &video_id).await;
        summary.record(&format!("{video_id}.eaf"), result);
    }

    info!(
        processed = summary.processed,
        skipped = summary.skipped,
        failed = summary.failed,
        "Parse finished"
    );
    Ok(summary)
}

async fn parse_one(engine: &ReconciliationEngine, video_id: &str) -> Result<()> {
    let settings = engine.settings();
    let _guard = engine.locks().acquire(video_id).await;
    let eaf = EafDocument::load(&settings.eaf_path(video_id), &settings.aliases)?;
    let frame_rate = engine.probe_frame_rate(video_id).await;
    engine
        .store()
        .build_if_missing(video_id, &eaf, frame_rate, &settings.phrase)?;

    let doc = engine.store().load(video_id)?;
    if doc.tiers.contains_key(&settings.phrase.transcription_tier) {
        captions::write_track(
            &settings.captions_dir,
            video_id,
            &doc,
            &settings.phrase.transcription_tier,
        )?;
    } else {
        debug!("{video_id} has no transcription tier, no captions written");
    }
    info!("Parsed {video_id} at {frame_rate} fps");
    Ok(())
}

/// Extract frames for every indexed annotation that has none, plus one
/// still per transcription annotation at its midpoint.
pub async fn extract_all_frames(engine: &ReconciliationEngine) -> Result<BatchSummary> {
    let settings = engine.settings();
    let frames = &engine.collaborators().frames;
    let mut summary = BatchSummary::default();

    for video_id in engine.store().video_ids()? {
        let doc = match engine.store().load(&video_id) {
            Ok(doc) => doc,
            Err(e) => {
                summary.record(&format!("{video_id}.json"), Err::<(), _>(e));
                continue;
            }
        };

        for (tier_id, ann) in indexed_annotations(engine, &doc) {
            let item = index_key(&video_id, &ann.annotation_id);
            let existing = engine
                .bounded("frames", frames.frames(&video_id, &ann.annotation_id))
                .await;
            match existing {
                Ok(paths) if !paths.is_empty() => {
                    summary.skipped += 1;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    summary.record(&item, Err::<(), _>(e));
                    continue;
                }
            }
            debug!("Extracting frames for {item} in {tier_id}");
            let result = engine
                .bounded(
                    "frames",
                    frames.extract(&video_id, &ann.annotation_id, ann.start_ms, ann.end_ms),
                )
                .await;
            summary.record(&item, result);
        }

        if let Some(transcription) = doc.tiers.get(&settings.phrase.transcription_tier) {
            for ann in &transcription.annotations {
                let midpoint = ann.start_ms + ann.end_ms.saturating_sub(ann.start_ms) / 2;
                let result = engine
                    .bounded("frames", frames.still(&video_id, &ann.annotation_id, midpoint))
                    .await;
                if let Err(e) = result {
                    warn!("No phrase still for {}: {e}", index_key(&video_id, &ann.annotation_id));
                }
            }
        }
    }

    info!(
        processed = summary.processed,
        skipped = summary.skipped,
        failed = summary.failed,
        "Frame extraction finished"
    );
    Ok(summary)
}

/// Compute all six embedding variants for every indexed annotation that
/// has none yet.
pub async fn embed_all(engine: &ReconciliationEngine) -> Result<BatchSummary> {
    let collab = engine.collaborators();
    let mut summary = BatchSummary::default();

    for video_id in engine.store().video_ids()? {
        let doc = match engine.store().load(&video_id) {
            Ok(doc) => doc,
            Err(e) => {
                summary.record(&format!("{video_id}.json"), Err::<(), _>(e));
                continue;
            }
        };

        let mut computed = Vec::new();
        for (_, ann) in indexed_annotations(engine, &doc) {
            let item = index_key(&video_id, &ann.annotation_id);
            if engine
                .embeddings()
                .lock()
                .await
                .is_embedded(&video_id, &ann.annotation_id)
            {
                debug!("{item} already embedded");
                summary.skipped += 1;
                continue;
            }
            let result = async {
                let paths = engine
                    .bounded("frames", collab.frames.frames(&video_id, &ann.annotation_id))
                    .await?;
                let vectors = engine
                    .bounded("encoder", embed_frames(collab.encoder.as_ref(), &paths))
                    .await?;
                let text = engine
                    .bounded("encoder", collab.encoder.text_encode(&text_input(ann.text())))
                    .await?;
                Ok::<_, CorpusError>((FrameEmbeddings::from_frames(vectors), text))
            }
            .await;
            match result {
                Ok((frame_set, text)) => {
                    summary.processed += 1;
                    computed.push((ann.annotation_id.clone(), frame_set, text));
                }
                Err(e) => summary.record(&item, Err::<(), _>(e)),
            }
        }

        if computed.is_empty() {
            continue;
        }
        let mut tables = engine.embeddings().lock().await;
        for (annotation_id, frame_set, text) in computed {
            match frame_set {
                Some(frame_set) => tables.set_frames(&video_id, &annotation_id, frame_set),
                None => tables.clear_frames(&video_id, &annotation_id),
            }
            tables.set_text(&video_id, &annotation_id, text);
        }
        tables.save()?;
        info!("Embedded {video_id}");
    }

    info!(
        processed = summary.processed,
        skipped = summary.skipped,
        failed = summary.failed,
        "Embedding finished"
    );
    Ok(summary)
}

/// Push every embedded annotation to the search index.
pub async fn reindex_all(engine: &ReconciliationEngine) -> Result<BatchSummary> {
    let index = &engine.collaborators().index;
    engine.bounded("opensearch", index.ensure_index()).await?;
    let mut summary = BatchSummary::default();

    for video_id in engine.store().video_ids()? {
        let doc = match engine.store().load(&video_id) {
            Ok(doc) => doc,
            Err(e) => {
                summary.record(&format!("{video_id}.json"), Err::<(), _>(e));
                continue;
            }
        };

        let documents: Vec<_> = {
            let tables = engine.embeddings().lock().await;
            indexed_annotations(engine, &doc)
                .filter_map(|(_, ann)| tables.index_document(&video_id, &ann.annotation_id, ann.text()))
                .collect()
        };
        if documents.is_empty() {
            summary.skipped += 1;
            continue;
        }
        for document in documents {
            let result = engine.bounded("opensearch", index.upsert(&document)).await;
            summary.record(&document.id(), result);
        }
    }

    info!(
        processed = summary.processed,
        skipped = summary.skipped,
        failed = summary.failed,
        "Reindex finished"
    );
    Ok(summary)
}

/// All four jobs in order.
pub async fn pipeline(engine: &ReconciliationEngine) -> Result<PipelineSummary> {
    Ok(PipelineSummary {
        parse: parse_all(engine).await?,
        frames: extract_all_frames(engine).await?,
        embed: embed_all(engine).await?,
        reindex: reindex_all(engine).await?,
    })
}

fn indexed_annotations<'a>(
    engine: &'a ReconciliationEngine,
    doc: &'a AnnotationDocument,
) -> impl Iterator<Item = (&'a str, &'a Annotation)> + 'a {
    doc.tiers
        .values()
        .filter(move |tier| engine.settings().is_indexed(&tier.tier_id))
        .flat_map(|tier| tier.annotations.iter().map(move |a| (tier.tier_id.as_str(), a)))
}
