//! Per-video JSON projection of an EAF document.
//!
//! The projection is the read path for everything outside the EAF layer:
//! captions, embeddings, the search index and the CLI all read annotations
//! from here. Referential annotations carry denormalized copies of their
//! parent's times; [`AnnotationDocument::retime`] keeps those copies in step.

pub mod persist;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::eaf::EafDocument;
use crate::error::{CorpusError, Result};

pub use persist::AnnotationStore;

/// Which tiers take part in the phrase join and how loose it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhraseMatch {
    pub transcription_tier: String,
    pub expression_tier: String,
    pub tolerance_ms: u64,
}

impl Default for PhraseMatch {
    fn default() -> Self {
        Self {
            transcription_tier: crate::eaf::TRANSCRIPTION_TIER.to_string(),
            expression_tier: crate::eaf::EXPRESSION_TIER.to_string(),
            tolerance_ms: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    pub frame_rate: f64,
    #[serde(rename = "lastUsedAnnotationId")]
    pub last_used_annotation_id: u64,
    /// Header properties carried over from the EAF file untouched.
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub annotation_id: String,
    pub value: Option<String>,
    pub start_ms: u64,
    pub end_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phrase: Option<String>,
    /// 1 to 5; `None` until someone rates the annotation.
    #[serde(default)]
    pub user_rating: Option<u8>,
}

impl Annotation {
    #[must_use]
    pub fn new(annotation_id: impl Into<String>, value: &str, start_ms: u64, end_ms: u64) -> Self {
        Self {
            annotation_id: annotation_id.into(),
            value: non_empty(value),
            start_ms,
            end_ms,
            annotation_ref: None,
            phrase: None,
            user_rating: None,
        }
    }

    #[must_use]
    pub fn referencing(mut self, annotation_ref: impl Into<String>) -> Self {
        self.annotation_ref = Some(annotation_ref.into());
        self
    }

    /// The value, or `""` when absent.
    #[must_use]
    pub fn text(&self) -> &str {
        self.value.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub tier_id: String,
    pub linguistic_type_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_ref: Option<String>,
    pub annotations: Vec<Annotation>,
}

impl Tier {
    #[must_use]
    pub fn annotation(&self, annotation_id: &str) -> Option<&Annotation> {
        self.annotations
            .iter()
            .find(|a| a.annotation_id == annotation_id)
    }

    fn annotation_mut(&mut self, annotation_id: &str) -> Option<&mut Annotation> {
        self.annotations
            .iter_mut()
            .find(|a| a.annotation_id == annotation_id)
    }
}

/// Location of an annotation inside the projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnnotationKey {
    pub tier_id: String,
    pub annotation_id: String,
}

impl AnnotationKey {
    pub fn new(tier_id: impl Into<String>, annotation_id: impl Into<String>) -> Self {
        Self {
            tier_id: tier_id.into(),
            annotation_id: annotation_id.into(),
        }
    }
}

/// The per-video aggregate stored as `{video_id}.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationDocument {
    pub properties: Properties,
    pub tiers: IndexMap<String, Tier>,
}

impl AnnotationDocument {
    /// Project a parsed EAF document, then run the phrase join.
    pub fn build_from_eaf(eaf: &EafDocument, frame_rate: f64, phrase: &PhraseMatch) -> Result<Self> {
        let extra = eaf
            .header_properties()
            .into_iter()
            .filter(|(name, _)| name != "lastUsedAnnotationId")
            .map(|(name, value)| (name, Value::String(value)))
            .collect();

        let tiers = eaf
            .tiers()?
            .into_iter()
            .map(|tier| {
                let annotations = tier
                    .annotations
                    .iter()
                    .map(|a| {
                        let ann = Annotation::new(a.annotation_id.clone(), &a.value, a.start_ms, a.end_ms);
                        match a.annotation_ref() {
                            Some(target) => ann.referencing(target),
                            None => ann,
                        }
                    })
                    .collect();
                let projected = Tier {
                    tier_id: tier.tier_id.clone(),
                    linguistic_type_ref: tier.linguistic_type,
                    parent_ref: tier.parent_ref,
                    annotations,
                };
                (tier.tier_id, projected)
            })
            .collect();

        let mut doc = Self {
            properties: Properties {
                frame_rate,
                last_used_annotation_id: eaf.last_used_annotation_id(),
                extra,
            },
            tiers,
        };
        doc.refresh_phrases(phrase);
        Ok(doc)
    }

    pub fn tier(&self, tier_id: &str) -> Result<&Tier> {
        self.tiers
            .get(tier_id)
            .ok_or_else(|| CorpusError::not_found(format!("tier {tier_id}")))
    }

    pub fn annotation(&self, tier_id: &str, annotation_id: &str) -> Result<&Annotation> {
        self.tier(tier_id)?.annotation(annotation_id).ok_or_else(|| {
            CorpusError::not_found(format!("annotation {annotation_id} in tier {tier_id}"))
        })
    }

    fn annotation_mut(&mut self, tier_id: &str, annotation_id: &str) -> Result<&mut Annotation> {
        self.tiers
            .get_mut(tier_id)
            .ok_or_else(|| CorpusError::not_found(format!("tier {tier_id}")))?
            .annotation_mut(annotation_id)
            .ok_or_else(|| {
                CorpusError::not_found(format!("annotation {annotation_id} in tier {tier_id}"))
            })
    }

    /// Find an annotation by id in any tier.
    #[must_use]
    pub fn locate(&self, annotation_id: &str) -> Option<(&Tier, &Annotation)> {
        self.tiers
            .values()
            .find_map(|tier| tier.annotation(annotation_id).map(|a| (tier, a)))
    }

    #[must_use]
    pub fn contains_id(&self, annotation_id: &str) -> bool {
        self.locate(annotation_id).is_some()
    }

    /// Follow `annotation_ref` links up to the alignable annotation that owns
    /// the time range.
    pub fn root_alignable(&self, annotation_id: &str) -> Result<AnnotationKey> {
        let mut current = annotation_id.to_owned();
        // a chain can never be longer than the number of annotations
        let limit = self.tiers.values().map(|t| t.annotations.len()).sum::<usize>() + 1;
        for _ in 0..limit {
            let (tier, ann) = self
                .locate(&current)
                .ok_or_else(|| CorpusError::consistency(format!("dangling reference to {current}")))?;
            match &ann.annotation_ref {
                Some(parent) => current = parent.clone(),
                None => return Ok(AnnotationKey::new(&tier.tier_id, &ann.annotation_id)),
            }
        }
        Err(CorpusError::consistency(format!(
            "reference cycle through annotation {annotation_id}"
        )))
    }

    /// Referential annotations that point at `annotation_id`, transitively,
    /// parents before children.
    #[must_use]
    pub fn descendants(&self, annotation_id: &str) -> Vec<AnnotationKey> {
        let mut found: Vec<AnnotationKey> = Vec::new();
        let mut frontier = vec![annotation_id.to_owned()];
        while let Some(target) = frontier.pop() {
            for tier in self.tiers.values() {
                for ann in &tier.annotations {
                    let points_here = ann.annotation_ref.as_deref() == Some(target.as_str());
                    if points_here && !found.iter().any(|k| k.annotation_id == ann.annotation_id) {
                        found.push(AnnotationKey::new(&tier.tier_id, &ann.annotation_id));
                        frontier.push(ann.annotation_id.clone());
                    }
                }
            }
        }
        found
    }

    /// Append an annotation to a tier. Ids are unique across the document.
    pub fn insert(&mut self, tier_id: &str, annotation: Annotation) -> Result<()> {
        if self.contains_id(&annotation.annotation_id) {
            return Err(CorpusError::consistency(format!(
                "annotation id {} already exists in the annotation store",
                annotation.annotation_id
            )));
        }
        self.tiers
            .get_mut(tier_id)
            .ok_or_else(|| CorpusError::not_found(format!("tier {tier_id}")))?
            .annotations
            .push(annotation);
        Ok(())
    }

    pub fn set_value(&mut self, tier_id: &str, annotation_id: &str, value: &str) -> Result<()> {
        self.annotation_mut(tier_id, annotation_id)?.value = non_empty(value);
        Ok(())
    }

    /// Set an annotation's range and copy it into every referential
    /// descendant. Returns the descendants that were updated.
    pub fn retime(
        &mut self,
        tier_id: &str,
        annotation_id: &str,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<Vec<AnnotationKey>> {
        if start_ms > end_ms {
            return Err(CorpusError::invalid(format!(
                "start {start_ms}ms is after end {end_ms}ms"
            )));
        }
        let descendants = self.descendants(annotation_id);
        for key in std::iter::once(AnnotationKey::new(tier_id, annotation_id)).chain(descendants.iter().cloned()) {
            let ann = self.annotation_mut(&key.tier_id, &key.annotation_id)?;
            ann.start_ms = start_ms;
            ann.end_ms = end_ms;
        }
        Ok(descendants)
    }

    /// Copy the resolved times of `eaf` into every annotation present in
    /// both. Catches annotations moved through a shared time slot. Returns
    /// the annotations whose range changed.
    pub fn sync_times(&mut self, eaf: &EafDocument) -> Result<Vec<AnnotationKey>> {
        let mut changed = Vec::new();
        for tier in eaf.tiers()? {
            let Some(projected) = self.tiers.get_mut(&tier.tier_id) else {
                continue;
            };
            for ann in &tier.annotations {
                let Some(target) = projected.annotation_mut(&ann.annotation_id) else {
                    continue;
                };
                if (target.start_ms, target.end_ms) != (ann.start_ms, ann.end_ms) {
                    target.start_ms = ann.start_ms;
                    target.end_ms = ann.end_ms;
                    changed.push(AnnotationKey::new(&tier.tier_id, &ann.annotation_id));
                }
            }
        }
        Ok(changed)
    }

    /// Remove an annotation and its referential descendants.
    pub fn remove(&mut self, tier_id: &str, annotation_id: &str) -> Result<Vec<AnnotationKey>> {
        self.annotation(tier_id, annotation_id)?;
        let mut removed = vec![AnnotationKey::new(tier_id, annotation_id)];
        removed.extend(self.descendants(annotation_id));
        for key in &removed {
            if let Some(tier) = self.tiers.get_mut(&key.tier_id) {
                tier.annotations.retain(|a| a.annotation_id != key.annotation_id);
            }
        }
        Ok(removed)
    }

    pub fn set_rating(&mut self, tier_id: &str, annotation_id: &str, rating: u8) -> Result<()> {
        if !(1..=5).contains(&rating) {
            return Err(CorpusError::invalid(format!("rating {rating} is outside 1..=5")));
        }
        self.annotation_mut(tier_id, annotation_id)?.user_rating = Some(rating);
        Ok(())
    }

    /// Raise the id counter; it never decreases.
    pub fn advance_last_used(&mut self, value: u64) {
        self.properties.last_used_annotation_id = self.properties.last_used_annotation_id.max(value);
    }

    /// Recompute `phrase` for every annotation of the expression tier: the
    /// value of the first transcription annotation (document order) whose
    /// window, widened by the tolerance, contains the expression's window.
    pub fn refresh_phrases(&mut self, phrase: &PhraseMatch) {
        let Some(transcription) = self.tiers.get(&phrase.transcription_tier) else {
            return;
        };
        let windows: Vec<(u64, u64, Option<String>)> = transcription
            .annotations
            .iter()
            .map(|a| (a.start_ms, a.end_ms, a.value.clone()))
            .collect();

        let Some(expression) = self.tiers.get_mut(&phrase.expression_tier) else {
            return;
        };
        let eps = phrase.tolerance_ms;
        for ann in &mut expression.annotations {
            ann.phrase = windows
                .iter()
                .find(|(start, end, _)| {
                    start.saturating_sub(eps) <= ann.start_ms && end.saturating_add(eps) >= ann.end_ms
                })
                .and_then(|(_, _, value)| value.clone());
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_owned())
}
