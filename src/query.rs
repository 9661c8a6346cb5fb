//! Text queries against the vector index, scored against ground truth.
//!
//! Ground truth for a query is every annotation of the searched tier whose
//! value contains the query, ignoring case.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, instrument};

use crate::collab::{index_key, Encoder, SearchHit, SearchIndex, VectorField};
use crate::embeddings::text_input;
use crate::error::{CorpusError, Result};
use crate::reconcile::ReconciliationEngine;
use crate::store::AnnotationStore;

/// Index keys of the annotations in `tier_id` whose value contains `query`.
pub fn ground_truth(store: &AnnotationStore, tier_id: &str, query: &str) -> Result<BTreeSet<String>> {
    let needle = query.to_lowercase();
    let mut relevant = BTreeSet::new();
    for video_id in store.video_ids()? {
        let doc = store.load(&video_id)?;
        let Some(tier) = doc.tiers.get(tier_id) else {
            continue;
        };
        relevant.extend(
            tier.annotations
                .iter()
                .filter(|a| a.value.as_deref().is_some_and(|v| v.to_lowercase().contains(&needle)))
                .map(|a| index_key(&video_id, &a.annotation_id)),
        );
    }
    Ok(relevant)
}

/// Encode `query` and run a k-NN search on `field`.
#[instrument(skip(encoder, index))]
pub async fn search(
    encoder: &dyn Encoder,
    index: &dyn SearchIndex,
    query: &str,
    field: VectorField,
    k: usize,
) -> Result<Vec<SearchHit>> {
    if query.trim().is_empty() {
        return Err(CorpusError::invalid("query is required"));
    }
    let vector = encoder.text_encode(&text_input(query)).await?;
    let hits = index.knn_search(field, &vector, k).await?;
    debug!("{} hits", hits.len());
    Ok(hits)
}

/// Retrieval quality of one query, each value rounded to two decimals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Scores {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl Scores {
    /// Scores of `retrieved` against `relevant`. Undefined ratios are 0.
    #[must_use]
    pub fn compute<'a>(retrieved: impl IntoIterator<Item = &'a str>, relevant: &BTreeSet<String>) -> Self {
        let retrieved: BTreeSet<&str> = retrieved.into_iter().collect();
        let hits = retrieved.iter().filter(|id| relevant.contains(**id)).count();

        let precision = ratio(hits, retrieved.len());
        let recall = ratio(hits, relevant.len());
        // F1 over the rounded precision and recall, as displayed
        let f1 = if precision + recall == 0.0 {
            0.0
        } else {
            round2(2.0 * precision * recall / (precision + recall))
        };
        Self { precision, recall, f1 }
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        round2(numerator as f64 / denominator as f64)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// A scored query.
#[derive(Debug, Clone, Serialize)]
pub struct QueryReport {
    pub query: String,
    pub field: String,
    pub tier_id: String,
    pub hits: Vec<SearchHit>,
    pub relevant: usize,
    pub scores: Scores,
}

/// Search and score against the ground truth of `tier_id`.
pub async fn evaluate(
    engine: &ReconciliationEngine,
    tier_id: &str,
    query: &str,
    field: VectorField,
    k: usize,
) -> Result<QueryReport> {
    let collab = engine.collaborators();
    let hits = engine
        .bounded(
            "opensearch",
            search(collab.encoder.as_ref(), collab.index.as_ref(), query, field, k),
        )
        .await?;
    let relevant = ground_truth(engine.store(), tier_id, query)?;
    let scores = Scores::compute(hits.iter().map(|h| h.id.as_str()), &relevant);

    Ok(QueryReport {
        query: query.to_owned(),
        field: field.to_string(),
        tier_id: tier_id.to_owned(),
        hits,
        relevant: relevant.len(),
        scores,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Annotation, AnnotationDocument, Properties, Tier};
    use indexmap::IndexMap;

    fn relevant(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_scores() {
        let scores = Scores::compute(["1_a1", "1_a2", "2_a5"], &relevant(&["1_a1", "2_a5", "3_a9", "3_a10"]));
        assert_eq!(scores.precision, 0.67);
        assert_eq!(scores.recall, 0.5);
        assert_eq!(scores.f1, 0.57);
    }

    #[test]
    fn test_undefined_scores_are_zero() {
        assert_eq!(Scores::compute([], &relevant(&["1_a1"])), Scores::default());
        assert_eq!(Scores::compute(["1_a1"], &BTreeSet::new()), Scores::default());
    }

    #[test]
    fn test_ground_truth_is_case_insensitive_substring() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnnotationStore::new(dir.path());
        let mut tiers = IndexMap::new();
        tiers.insert(
            "EXPR".to_string(),
            Tier {
                tier_id: "EXPR".to_string(),
                linguistic_type_ref: "default".to_string(),
                parent_ref: None,
                annotations: vec![
                    Annotation::new("a1", "Sorriso aberto", 0, 500),
                    Annotation::new("a2", "sobrancelhas", 500, 900),
                    Annotation::new("a3", "", 900, 1000),
                ],
            },
        );
        let doc = AnnotationDocument {
            properties: Properties {
                frame_rate: 25.0,
                last_used_annotation_id: 3,
                extra: IndexMap::new(),
            },
            tiers,
        };
        store.persist("7", &doc).unwrap();

        assert_eq!(ground_truth(&store, "EXPR", "SORRISO").unwrap(), relevant(&["7_a1"]));
        assert!(ground_truth(&store, "OTHER", "sorriso").unwrap().is_empty());
    }
}
