//! Typed view and mutations over an ELAN document tree.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use indexmap::IndexMap;
use tracing::{debug, warn};

use super::tree::{Element, XmlTree};
use super::TierAliases;
use crate::error::{CorpusError, Result};

const LAST_USED_PROPERTY: &str = "lastUsedAnnotationId";

/// A named timestamp shared by alignable annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSlot {
    pub id: String,
    pub value_ms: u64,
    /// `false` when the slot has no `TIME_VALUE` and borrows the previous
    /// aligned slot's value.
    pub aligned: bool,
}

/// How an annotation obtains its time range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnotationKind {
    Alignable {
        time_slot_ref1: String,
        time_slot_ref2: String,
    },
    Referential {
        annotation_ref: String,
    },
}

/// An annotation with its resolved absolute time range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EafAnnotation {
    pub annotation_id: String,
    pub value: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub kind: AnnotationKind,
}

impl EafAnnotation {
    #[must_use]
    pub fn annotation_ref(&self) -> Option<&str> {
        match &self.kind {
            AnnotationKind::Referential { annotation_ref } => Some(annotation_ref),
            AnnotationKind::Alignable { .. } => None,
        }
    }

    #[must_use]
    pub fn is_alignable(&self) -> bool {
        matches!(self.kind, AnnotationKind::Alignable { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EafTier {
    pub tier_id: String,
    pub linguistic_type: String,
    pub parent_ref: Option<String>,
    /// Alignable annotations in document order, then referential ones.
    pub annotations: Vec<EafAnnotation>,
}

impl EafTier {
    #[must_use]
    pub fn is_referential(&self) -> bool {
        self.parent_ref.is_some()
    }

    #[must_use]
    pub fn annotation(&self, annotation_id: &str) -> Option<&EafAnnotation> {
        self.annotations
            .iter()
            .find(|a| a.annotation_id == annotation_id)
    }
}

/// Ids allocated by [`EafDocument::add_annotation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedAnnotation {
    pub annotation_id: String,
    /// Alignable annotation synthesized in the parent tier, if any.
    pub parent_annotation_id: Option<String>,
}

/// An annotation removed by [`EafDocument::delete_annotation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedAnnotation {
    pub tier_id: String,
    pub annotation_id: String,
}

/// Annotation as written in the file, before reference resolution.
struct RawAnnotation {
    id: String,
    value: String,
    kind: AnnotationKind,
}

struct RawTier {
    tier_id: String,
    linguistic_type: String,
    parent_ref: Option<String>,
    annotations: Vec<RawAnnotation>,
}

/// A parsed ELAN document.
#[derive(Debug, Clone)]
pub struct EafDocument {
    tree: XmlTree,
}

impl EafDocument {
    /// Parse an EAF document without tier-name normalization.
    pub fn parse(xml: &str) -> Result<Self> {
        Self::parse_with_aliases(xml, &TierAliases::new())
    }

    /// Parse an EAF document and rewrite aliased tier ids to their
    /// canonical form before anything else looks at them.
    pub fn parse_with_aliases(xml: &str, aliases: &TierAliases) -> Result<Self> {
        let tree = XmlTree::parse(xml)?;
        if tree.root().name() != "ANNOTATION_DOCUMENT" {
            return Err(CorpusError::parse(format!(
                "expected <ANNOTATION_DOCUMENT> root, found <{}>",
                tree.root().name()
            )));
        }

        let mut doc = Self { tree };
        doc.header()?;
        doc.time_order()?;
        let renamed = doc.normalize_tier_names(aliases);
        if renamed > 0 {
            debug!("Normalized {renamed} tier name(s)");
        }

        // Full validation pass: fails on missing ids, values, or slots.
        doc.tiers()?;
        Ok(doc)
    }

    /// Read and parse an `.eaf` file.
    pub fn load(path: &Path, aliases: &TierAliases) -> Result<Self> {
        let xml = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                CorpusError::not_found(format!("EAF file {}", path.display()))
            }
            _ => CorpusError::Io(e),
        })?;
        Self::parse_with_aliases(&xml, aliases)
            .map_err(|e| match e {
                CorpusError::Parse(msg) => {
                    CorpusError::Parse(format!("{}: {msg}", path.display()))
                }
                other => other,
            })
    }

    /// Write the document to `path` atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let xml = self.to_xml_string()?;
        crate::store::persist::write_atomic(path, xml.as_bytes())
    }

    pub fn to_xml_string(&self) -> Result<String> {
        self.tree.to_xml_string()
    }

    // ─── Read model ──────────────────────────────────────────────────────────

    /// `PROPERTY` entries of the header, in document order.
    #[must_use]
    pub fn header_properties(&self) -> IndexMap<String, String> {
        self.tree
            .root()
            .child("HEADER")
            .into_iter()
            .flat_map(Element::children)
            .filter(|el| el.name() == "PROPERTY")
            .filter_map(|el| Some((el.attr("NAME")?, el.text())))
            .collect()
    }

    /// Time slots with unaligned slots resolved to the previous aligned value.
    pub fn time_slots(&self) -> Result<Vec<TimeSlot>> {
        let mut slots = Vec::new();
        let mut last_value = 0;

        for el in self.time_order()?.children() {
            if el.name() != "TIME_SLOT" {
                continue;
            }
            let id = el
                .attr("TIME_SLOT_ID")
                .ok_or_else(|| CorpusError::parse("TIME_SLOT without TIME_SLOT_ID"))?;
            let slot = match el.attr("TIME_VALUE") {
                Some(raw) => {
                    let value_ms = raw.trim().parse().map_err(|_| {
                        CorpusError::parse(format!("time slot {id} has invalid TIME_VALUE {raw:?}"))
                    })?;
                    last_value = value_ms;
                    TimeSlot {
                        id,
                        value_ms,
                        aligned: true,
                    }
                }
                None => TimeSlot {
                    id,
                    value_ms: last_value,
                    aligned: false,
                },
            };
            slots.push(slot);
        }

        Ok(slots)
    }

    /// All tiers with resolved annotation times.
    ///
    /// Resolution runs in two phases over the whole document: every
    /// alignable annotation is timed first, then referential annotations are
    /// resolved against that set (following chains), so reference order in
    /// the file does not matter. References whose target does not exist
    /// anywhere are dropped with a warning.
    pub fn tiers(&self) -> Result<Vec<EafTier>> {
        let slots: HashMap<String, u64> = self
            .time_slots()?
            .into_iter()
            .map(|s| (s.id, s.value_ms))
            .collect();
        let raw_tiers = self.raw_tiers()?;

        let mut seen = HashSet::new();
        let mut times: HashMap<&str, (u64, u64)> = HashMap::new();
        let mut pending: HashMap<&str, &str> = HashMap::new();

        for tier in &raw_tiers {
            for ann in &tier.annotations {
                if !seen.insert(ann.id.as_str()) {
                    return Err(CorpusError::parse(format!(
                        "duplicate ANNOTATION_ID {}",
                        ann.id
                    )));
                }
                match &ann.kind {
                    AnnotationKind::Alignable {
                        time_slot_ref1,
                        time_slot_ref2,
                    } => {
                        let start = slot_value(&slots, time_slot_ref1, &ann.id)?;
                        let end = slot_value(&slots, time_slot_ref2, &ann.id)?;
                        times.insert(ann.id.as_str(), (start, end));
                    }
                    AnnotationKind::Referential { annotation_ref } => {
                        pending.insert(ann.id.as_str(), annotation_ref.as_str());
                    }
                }
            }
        }

        // Resolve reference chains until no further progress is possible.
        loop {
            let resolved: Vec<(&str, (u64, u64))> = pending
                .iter()
                .filter_map(|(id, target)| times.get(target).map(|t| (*id, *t)))
                .collect();
            if resolved.is_empty() {
                break;
            }
            for (id, range) in resolved {
                pending.remove(id);
                times.insert(id, range);
            }
        }
        for (id, target) in &pending {
            warn!("Dropping annotation {id}: referenced annotation {target} does not exist");
        }

        let tiers = raw_tiers
            .iter()
            .map(|tier| {
                let alignable = tier.annotations.iter().filter(|a| {
                    matches!(a.kind, AnnotationKind::Alignable { .. })
                });
                let referential = tier.annotations.iter().filter(|a| {
                    matches!(a.kind, AnnotationKind::Referential { .. })
                });
                let annotations = alignable
                    .chain(referential)
                    .filter_map(|raw| {
                        let (start_ms, end_ms) = *times.get(raw.id.as_str())?;
                        Some(EafAnnotation {
                            annotation_id: raw.id.clone(),
                            value: raw.value.clone(),
                            start_ms,
                            end_ms,
                            kind: raw.kind.clone(),
                        })
                    })
                    .collect();
                EafTier {
                    tier_id: tier.tier_id.clone(),
                    linguistic_type: tier.linguistic_type.clone(),
                    parent_ref: tier.parent_ref.clone(),
                    annotations,
                }
            })
            .collect();

        Ok(tiers)
    }

    pub fn tier(&self, tier_id: &str) -> Result<EafTier> {
        self.tiers()?
            .into_iter()
            .find(|t| t.tier_id == tier_id)
            .ok_or_else(|| CorpusError::not_found(format!("tier {tier_id}")))
    }

    /// Every `ANNOTATION_ID` present in the file, resolved or not.
    #[must_use]
    pub fn annotation_ids(&self) -> HashSet<String> {
        self.tier_elements()
            .flat_map(Element::children)
            .filter_map(annotation_inner)
            .filter_map(|inner| inner.attr("ANNOTATION_ID"))
            .collect()
    }

    /// The stored id counter, raised to the highest id actually present so a
    /// stale header can never cause a collision.
    #[must_use]
    pub fn last_used_annotation_id(&self) -> u64 {
        let stored = self
            .header_properties()
            .get(LAST_USED_PROPERTY)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        let highest = self
            .annotation_ids()
            .iter()
            .filter_map(|id| numeric_suffix(id, "a"))
            .max()
            .unwrap_or(0);
        stored.max(highest)
    }

    /// Ids the next `count` allocations would hand out, in order.
    #[must_use]
    pub fn next_annotation_ids(&self, count: u64) -> Vec<String> {
        let last = self.last_used_annotation_id();
        (1..=count).map(|i| format!("a{}", last + i)).collect()
    }

    // ─── Mutations ───────────────────────────────────────────────────────────

    /// Rewrite aliased `TIER_ID`/`PARENT_REF` attributes to canonical names.
    /// Returns the number of attributes changed.
    pub fn normalize_tier_names(&mut self, aliases: &TierAliases) -> usize {
        if aliases.is_empty() {
            return 0;
        }
        let mut renamed = 0;
        for tier in self.tier_elements_mut() {
            for attr in ["TIER_ID", "PARENT_REF"] {
                if let Some(name) = tier.attr(attr) {
                    let canonical = aliases.canonical(&name);
                    if canonical != name {
                        let canonical = canonical.to_owned();
                        tier.set_attr(attr, &canonical);
                        renamed += 1;
                    }
                }
            }
        }
        renamed
    }

    /// Raise the stored id counter; it never goes down.
    pub fn set_last_used_annotation_id(&mut self, value: u64) -> Result<()> {
        let current = self
            .header_properties()
            .get(LAST_USED_PROPERTY)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0);
        if value <= current {
            return Ok(());
        }

        let header = self
            .tree
            .root_mut()
            .child_mut("HEADER")
            .ok_or_else(|| CorpusError::parse("document has no HEADER"))?;
        let text = value.to_string();
        let existing = header.children_mut().find(|el| {
            el.name() == "PROPERTY" && el.attr("NAME").as_deref() == Some(LAST_USED_PROPERTY)
        });
        match existing {
            Some(property) => property.set_text(&text),
            None => header.push_child(
                Element::new("PROPERTY")
                    .with_attr("NAME", LAST_USED_PROPERTY)
                    .with_text(&text),
            ),
        }
        Ok(())
    }

    /// Append a time slot with the next sequential `ts<N>` id.
    ///
    /// N follows the highest existing suffix rather than the slot count, so
    /// gaps left by deletions are never refilled.
    pub fn add_time_slot(&mut self, value_ms: u64) -> Result<String> {
        let next = self
            .time_order()?
            .children()
            .filter_map(|el| el.attr("TIME_SLOT_ID"))
            .filter_map(|id| numeric_suffix(&id, "ts"))
            .max()
            .unwrap_or(0)
            + 1;
        let id = format!("ts{next}");
        self.time_order_mut()?.push_child(
            Element::new("TIME_SLOT")
                .with_attr("TIME_SLOT_ID", &id)
                .with_attr("TIME_VALUE", &value_ms.to_string()),
        );
        Ok(id)
    }

    /// Add an annotation to `tier_id`.
    ///
    /// On an alignable tier this allocates one id and two time slots. On a
    /// referential tier the new `REF_ANNOTATION` points at
    /// `ref_annotation_id` when given; otherwise an alignable annotation is
    /// synthesized in the parent tier first (parent gets the lower id) and
    /// the new annotation references it.
    pub fn add_annotation(
        &mut self,
        tier_id: &str,
        value: &str,
        start_ms: u64,
        end_ms: u64,
        ref_annotation_id: Option<&str>,
    ) -> Result<AddedAnnotation> {
        if start_ms > end_ms {
            return Err(CorpusError::invalid(format!(
                "start {start_ms}ms is after end {end_ms}ms"
            )));
        }
        let tiers = self.tiers()?;
        let tier = tiers
            .iter()
            .find(|t| t.tier_id == tier_id)
            .ok_or_else(|| CorpusError::not_found(format!("tier {tier_id}")))?;

        let parent_tier = match &tier.parent_ref {
            None => {
                if let Some(target) = ref_annotation_id {
                    return Err(CorpusError::invalid(format!(
                        "tier {tier_id} is alignable; cannot reference {target}"
                    )));
                }
                None
            }
            Some(parent_id) => Some(
                tiers
                    .iter()
                    .find(|t| &t.tier_id == parent_id)
                    .ok_or_else(|| {
                        CorpusError::consistency(format!(
                            "tier {tier_id} names missing parent tier {parent_id}"
                        ))
                    })?,
            ),
        };

        match (parent_tier, ref_annotation_id) {
            (None, _) => {
                let [id] = self.allocate_ids::<1>()?;
                let ts1 = self.add_time_slot(start_ms)?;
                let ts2 = self.add_time_slot(end_ms)?;
                self.push_annotation(tier_id, alignable_element(&id, &ts1, &ts2, value))?;
                self.commit_counter(&id)?;
                Ok(AddedAnnotation {
                    annotation_id: id,
                    parent_annotation_id: None,
                })
            }
            (Some(parent), Some(target)) => {
                if parent.annotation(target).is_none() {
                    return Err(CorpusError::not_found(format!(
                        "annotation {target} in parent tier {}",
                        parent.tier_id
                    )));
                }
                let [id] = self.allocate_ids::<1>()?;
                self.push_annotation(tier_id, reference_element(&id, target, value))?;
                self.commit_counter(&id)?;
                Ok(AddedAnnotation {
                    annotation_id: id,
                    parent_annotation_id: None,
                })
            }
            (Some(parent), None) => {
                if parent.is_referential() {
                    return Err(CorpusError::invalid(format!(
                        "parent tier {} is itself referential; pass the parent annotation explicitly",
                        parent.tier_id
                    )));
                }
                let parent_tier_id = parent.tier_id.clone();
                let [parent_id, id] = self.allocate_ids::<2>()?;
                let ts1 = self.add_time_slot(start_ms)?;
                let ts2 = self.add_time_slot(end_ms)?;
                self.push_annotation(
                    &parent_tier_id,
                    alignable_element(&parent_id, &ts1, &ts2, ""),
                )?;
                self.push_annotation(tier_id, reference_element(&id, &parent_id, value))?;
                self.commit_counter(&id)?;
                Ok(AddedAnnotation {
                    annotation_id: id,
                    parent_annotation_id: Some(parent_id),
                })
            }
        }
    }

    /// Replace an annotation's value and, for alignable annotations, the
    /// values stored in its two time slots.
    ///
    /// Referential annotations have no slots of their own: a time change on
    /// one is rejected and has to go through the parent annotation.
    pub fn edit_annotation(
        &mut self,
        tier_id: &str,
        annotation_id: &str,
        new_value: &str,
        new_start_ms: Option<u64>,
        new_end_ms: Option<u64>,
    ) -> Result<()> {
        let current = self.annotation(tier_id, annotation_id)?;
        let start = new_start_ms.unwrap_or(current.start_ms);
        let end = new_end_ms.unwrap_or(current.end_ms);
        let retimed = start != current.start_ms || end != current.end_ms;

        if retimed {
            if !current.is_alignable() {
                return Err(CorpusError::invalid(format!(
                    "annotation {annotation_id} is referential; edit the time of its parent instead"
                )));
            }
            self.retime_annotation(tier_id, annotation_id, start, end)?;
        }

        let inner = self.annotation_inner_mut(tier_id, annotation_id)?;
        let value_el = inner
            .child_mut("ANNOTATION_VALUE")
            .ok_or_else(|| CorpusError::parse(format!("annotation {annotation_id} has no value")))?;
        if value_el.text() != new_value {
            value_el.set_text(new_value);
        }
        Ok(())
    }

    /// Move an alignable annotation by rewriting its two slot values.
    /// Slots are never reallocated, so annotations sharing them move too.
    pub fn retime_annotation(
        &mut self,
        tier_id: &str,
        annotation_id: &str,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<()> {
        if start_ms > end_ms {
            return Err(CorpusError::invalid(format!(
                "start {start_ms}ms is after end {end_ms}ms"
            )));
        }
        let current = self.annotation(tier_id, annotation_id)?;
        let AnnotationKind::Alignable {
            time_slot_ref1,
            time_slot_ref2,
        } = current.kind
        else {
            return Err(CorpusError::invalid(format!(
                "annotation {annotation_id} is referential and has no time slots"
            )));
        };

        let before = self.resolved_ranges()?;
        let snapshot = self.tree.clone();
        let order = self.time_order_mut()?;
        for (slot_id, value) in [(&time_slot_ref1, start_ms), (&time_slot_ref2, end_ms)] {
            let slot = order
                .children_mut()
                .find(|el| el.attr("TIME_SLOT_ID").as_deref() == Some(slot_id.as_str()))
                .ok_or_else(|| CorpusError::consistency(format!("time slot {slot_id} vanished")))?;
            slot.set_attr("TIME_VALUE", &value.to_string());
        }

        // Shared slots move neighbours too; none of them may end up inverted.
        let inverted = self
            .resolved_ranges()?
            .into_iter()
            .filter(|(id, range)| before.get(id) != Some(range))
            .find(|(_, (start, end))| start > end);
        if let Some((id, (start, end))) = inverted {
            self.tree = snapshot;
            return Err(CorpusError::invalid(format!(
                "moving {annotation_id} to {start_ms}-{end_ms}ms would leave annotation {id} \
                 starting at {start}ms after its end at {end}ms"
            )));
        }
        Ok(())
    }

    fn resolved_ranges(&self) -> Result<HashMap<String, (u64, u64)>> {
        Ok(self
            .tiers()?
            .into_iter()
            .flat_map(|t| t.annotations)
            .map(|a| (a.annotation_id, (a.start_ms, a.end_ms)))
            .collect())
    }

    /// Remove an annotation, every referential annotation that depends on
    /// it, and any time slot no remaining annotation references.
    ///
    /// Deleting the last dependant of an empty alignable parent removes the
    /// parent too, undoing the parent synthesized by a referential add.
    pub fn delete_annotation(
        &mut self,
        tier_id: &str,
        annotation_id: &str,
    ) -> Result<Vec<RemovedAnnotation>> {
        let tiers = self.tiers()?;
        let tier = tiers
            .iter()
            .find(|t| t.tier_id == tier_id)
            .ok_or_else(|| CorpusError::not_found(format!("tier {tier_id}")))?;
        if tier.annotation(annotation_id).is_none() {
            return Err(CorpusError::not_found(format!(
                "annotation {annotation_id} in tier {tier_id}"
            )));
        }

        // Cascade over dependants, breadth-first so parents precede children.
        let mut doomed = vec![RemovedAnnotation {
            tier_id: tier_id.to_owned(),
            annotation_id: annotation_id.to_owned(),
        }];
        let mut cursor = 0;
        while cursor < doomed.len() {
            let target = doomed[cursor].annotation_id.clone();
            for t in &tiers {
                for ann in &t.annotations {
                    if ann.annotation_ref() == Some(target.as_str()) {
                        doomed.push(RemovedAnnotation {
                            tier_id: t.tier_id.clone(),
                            annotation_id: ann.annotation_id.clone(),
                        });
                    }
                }
            }
            cursor += 1;
        }

        // A parent synthesized for a referential add carries no value of its
        // own; once its last dependant goes it is removed as well.
        let parent = tier
            .annotation(annotation_id)
            .and_then(EafAnnotation::annotation_ref)
            .and_then(|parent_id| {
                tiers.iter().find_map(|t| {
                    t.annotation(parent_id)
                        .map(|a| (t.tier_id.clone(), a.clone()))
                })
            });
        if let Some((parent_tier, parent)) = parent {
            let orphaned = tiers.iter().flat_map(|t| &t.annotations).all(|a| {
                a.annotation_ref() != Some(parent.annotation_id.as_str())
                    || doomed.iter().any(|d| d.annotation_id == a.annotation_id)
            });
            if orphaned && parent.is_alignable() && parent.value.is_empty() {
                doomed.push(RemovedAnnotation {
                    tier_id: parent_tier,
                    annotation_id: parent.annotation_id,
                });
            }
        }

        let mut freed_slots = Vec::new();
        for removed in &doomed {
            let el = self
                .tier_element_mut(&removed.tier_id)?
                .remove_child_where(|el| {
                    annotation_inner(el)
                        .and_then(|inner| inner.attr("ANNOTATION_ID"))
                        .as_deref()
                        == Some(removed.annotation_id.as_str())
                })
                .ok_or_else(|| {
                    CorpusError::consistency(format!(
                        "annotation {} vanished during delete",
                        removed.annotation_id
                    ))
                })?;
            if let Some(inner) = annotation_inner(&el) {
                freed_slots.extend(inner.attr("TIME_SLOT_REF1"));
                freed_slots.extend(inner.attr("TIME_SLOT_REF2"));
            }
        }

        let still_used = self.referenced_slots();
        let order = self.time_order_mut()?;
        for slot in freed_slots {
            if !still_used.contains(&slot) {
                order.remove_child_where(|el| el.attr("TIME_SLOT_ID").as_deref() == Some(slot.as_str()));
            }
        }

        Ok(doomed)
    }

    // ─── Helpers ─────────────────────────────────────────────────────────────

    fn annotation(&self, tier_id: &str, annotation_id: &str) -> Result<EafAnnotation> {
        self.tier(tier_id)?
            .annotation(annotation_id)
            .cloned()
            .ok_or_else(|| {
                CorpusError::not_found(format!("annotation {annotation_id} in tier {tier_id}"))
            })
    }

    fn raw_tiers(&self) -> Result<Vec<RawTier>> {
        let mut ids = HashSet::new();
        let mut tiers = Vec::new();

        for tier in self.tier_elements() {
            let tier_id = tier
                .attr("TIER_ID")
                .ok_or_else(|| CorpusError::parse("TIER without TIER_ID"))?;
            if !ids.insert(tier_id.clone()) {
                return Err(CorpusError::parse(format!("duplicate TIER_ID {tier_id}")));
            }
            let linguistic_type = tier.attr("LINGUISTIC_TYPE_REF").ok_or_else(|| {
                CorpusError::parse(format!("tier {tier_id} has no LINGUISTIC_TYPE_REF"))
            })?;

            let mut annotations = Vec::new();
            for wrapper in tier.children().filter(|el| el.name() == "ANNOTATION") {
                let inner = annotation_inner(wrapper).ok_or_else(|| {
                    CorpusError::parse(format!("empty ANNOTATION in tier {tier_id}"))
                })?;
                annotations.push(raw_annotation(inner, &tier_id)?);
            }

            tiers.push(RawTier {
                parent_ref: tier.attr("PARENT_REF"),
                tier_id,
                linguistic_type,
                annotations,
            });
        }

        Ok(tiers)
    }

    fn referenced_slots(&self) -> HashSet<String> {
        self.tier_elements()
            .flat_map(Element::children)
            .filter_map(annotation_inner)
            .flat_map(|inner| [inner.attr("TIME_SLOT_REF1"), inner.attr("TIME_SLOT_REF2")])
            .flatten()
            .collect()
    }

    fn allocate_ids<const N: usize>(&self) -> Result<[String; N]> {
        let existing = self.annotation_ids();
        let last = self.last_used_annotation_id();
        let ids: [String; N] = std::array::from_fn(|i| format!("a{}", last + 1 + i as u64));
        if let Some(taken) = ids.iter().find(|id| existing.contains(*id)) {
            return Err(CorpusError::consistency(format!(
                "allocated annotation id {taken} already exists"
            )));
        }
        Ok(ids)
    }

    fn commit_counter(&mut self, highest_id: &str) -> Result<()> {
        let n = numeric_suffix(highest_id, "a")
            .ok_or_else(|| CorpusError::consistency(format!("malformed allocated id {highest_id}")))?;
        self.set_last_used_annotation_id(n)
    }

    fn push_annotation(&mut self, tier_id: &str, inner: Element) -> Result<()> {
        self.tier_element_mut(tier_id)?
            .push_child(Element::new("ANNOTATION").with_child(inner));
        Ok(())
    }

    fn header(&self) -> Result<&Element> {
        self.tree
            .root()
            .child("HEADER")
            .ok_or_else(|| CorpusError::parse("document has no HEADER"))
    }

    fn time_order(&self) -> Result<&Element> {
        self.tree
            .root()
            .child("TIME_ORDER")
            .ok_or_else(|| CorpusError::parse("document has no TIME_ORDER"))
    }

    fn time_order_mut(&mut self) -> Result<&mut Element> {
        self.tree
            .root_mut()
            .child_mut("TIME_ORDER")
            .ok_or_else(|| CorpusError::parse("document has no TIME_ORDER"))
    }

    fn tier_elements(&self) -> impl Iterator<Item = &Element> {
        self.tree.root().children().filter(|el| el.name() == "TIER")
    }

    fn tier_elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.tree
            .root_mut()
            .children_mut()
            .filter(|el| el.name() == "TIER")
    }

    fn tier_element_mut(&mut self, tier_id: &str) -> Result<&mut Element> {
        self.tier_elements_mut()
            .find(|el| el.attr("TIER_ID").as_deref() == Some(tier_id))
            .ok_or_else(|| CorpusError::not_found(format!("tier {tier_id}")))
    }

    fn annotation_inner_mut(&mut self, tier_id: &str, annotation_id: &str) -> Result<&mut Element> {
        self.tier_element_mut(tier_id)?
            .children_mut()
            .filter(|el| el.name() == "ANNOTATION")
            .filter_map(|wrapper| wrapper.children_mut().next())
            .find(|inner| inner.attr("ANNOTATION_ID").as_deref() == Some(annotation_id))
            .ok_or_else(|| {
                CorpusError::not_found(format!("annotation {annotation_id} in tier {tier_id}"))
            })
    }
}

/// The `ALIGNABLE_ANNOTATION`/`REF_ANNOTATION` inside an `ANNOTATION`.
fn annotation_inner(wrapper: &Element) -> Option<&Element> {
    if wrapper.name() != "ANNOTATION" {
        return None;
    }
    wrapper.children().next()
}

fn raw_annotation(inner: &Element, tier_id: &str) -> Result<RawAnnotation> {
    let id = inner
        .attr("ANNOTATION_ID")
        .ok_or_else(|| CorpusError::parse(format!("annotation without ANNOTATION_ID in tier {tier_id}")))?;
    let value = inner
        .child("ANNOTATION_VALUE")
        .ok_or_else(|| CorpusError::parse(format!("annotation {id} has no ANNOTATION_VALUE")))?
        .text();

    let required = |attr: &str| {
        inner
            .attr(attr)
            .ok_or_else(|| CorpusError::parse(format!("annotation {id} has no {attr}")))
    };
    let kind = match inner.name() {
        "ALIGNABLE_ANNOTATION" => AnnotationKind::Alignable {
            time_slot_ref1: required("TIME_SLOT_REF1")?,
            time_slot_ref2: required("TIME_SLOT_REF2")?,
        },
        "REF_ANNOTATION" => AnnotationKind::Referential {
            annotation_ref: required("ANNOTATION_REF")?,
        },
        other => {
            return Err(CorpusError::parse(format!(
                "unsupported annotation element <{other}> in tier {tier_id}"
            )))
        }
    };

    Ok(RawAnnotation { id, value, kind })
}

fn slot_value(slots: &HashMap<String, u64>, slot: &str, annotation_id: &str) -> Result<u64> {
    slots.get(slot).copied().ok_or_else(|| {
        CorpusError::parse(format!(
            "annotation {annotation_id} references unknown time slot {slot}"
        ))
    })
}

fn alignable_element(id: &str, ts1: &str, ts2: &str, value: &str) -> Element {
    Element::new("ALIGNABLE_ANNOTATION")
        .with_attr("ANNOTATION_ID", id)
        .with_attr("TIME_SLOT_REF1", ts1)
        .with_attr("TIME_SLOT_REF2", ts2)
        .with_child(Element::new("ANNOTATION_VALUE").with_text(value))
}

fn reference_element(id: &str, target: &str, value: &str) -> Element {
    Element::new("REF_ANNOTATION")
        .with_attr("ANNOTATION_ID", id)
        .with_attr("ANNOTATION_REF", target)
        .with_child(Element::new("ANNOTATION_VALUE").with_text(value))
}

/// `a42` with prefix `a` -> 42.
fn numeric_suffix(id: &str, prefix: &str) -> Option<u64> {
    id.strip_prefix(prefix)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ANNOTATION_DOCUMENT AUTHOR="" FORMAT="3.0" VERSION="3.0">
    <HEADER MEDIA_FILE="" TIME_UNITS="milliseconds">
        <MEDIA_DESCRIPTOR MEDIA_URL="file:///corpus/9.mp4" MIME_TYPE="video/mp4"/>
        <PROPERTY NAME="URN">urn:nl-mpi-tools-elan-eaf:9</PROPERTY>
        <PROPERTY NAME="lastUsedAnnotationId">4</PROPERTY>
    </HEADER>
    <TIME_ORDER>
        <TIME_SLOT TIME_SLOT_ID="ts1" TIME_VALUE="0"/>
        <TIME_SLOT TIME_SLOT_ID="ts2" TIME_VALUE="500"/>
        <TIME_SLOT TIME_SLOT_ID="ts3" TIME_VALUE="0"/>
        <TIME_SLOT TIME_SLOT_ID="ts4" TIME_VALUE="1000"/>
    </TIME_ORDER>
    <TIER LINGUISTIC_TYPE_REF="traducao" PARENT_REF="GLOSA" TIER_ID="TRADUCAO">
        <ANNOTATION>
            <REF_ANNOTATION ANNOTATION_ID="a4" ANNOTATION_REF="a3">
                <ANNOTATION_VALUE>sorrir</ANNOTATION_VALUE>
            </REF_ANNOTATION>
        </ANNOTATION>
    </TIER>
    <TIER LINGUISTIC_TYPE_REF="expressao" TIER_ID="EXPR">
        <ANNOTATION>
            <ALIGNABLE_ANNOTATION ANNOTATION_ID="a1" TIME_SLOT_REF1="ts1" TIME_SLOT_REF2="ts2">
                <ANNOTATION_VALUE>smile</ANNOTATION_VALUE>
            </ALIGNABLE_ANNOTATION>
        </ANNOTATION>
    </TIER>
    <TIER LINGUISTIC_TYPE_REF="texto" TIER_ID="TEXT">
        <ANNOTATION>
            <ALIGNABLE_ANNOTATION ANNOTATION_ID="a2" TIME_SLOT_REF1="ts3" TIME_SLOT_REF2="ts4">
                <ANNOTATION_VALUE>hello</ANNOTATION_VALUE>
            </ALIGNABLE_ANNOTATION>
        </ANNOTATION>
    </TIER>
    <TIER LINGUISTIC_TYPE_REF="glosa" TIER_ID="GLOSA">
        <ANNOTATION>
            <ALIGNABLE_ANNOTATION ANNOTATION_ID="a3" TIME_SLOT_REF1="ts1" TIME_SLOT_REF2="ts4">
                <ANNOTATION_VALUE>SORRIR</ANNOTATION_VALUE>
            </ALIGNABLE_ANNOTATION>
        </ANNOTATION>
    </TIER>
</ANNOTATION_DOCUMENT>
"#;

    fn slot_ids(doc: &EafDocument) -> Vec<String> {
        doc.time_slots().unwrap().into_iter().map(|s| s.id).collect()
    }

    fn ann(doc: &EafDocument, tier: &str, id: &str) -> EafAnnotation {
        doc.tier(tier).unwrap().annotation(id).cloned().unwrap()
    }

    #[test]
    fn test_parse_resolves_times() {
        let doc = EafDocument::parse(SAMPLE).unwrap();
        let expr = ann(&doc, "EXPR", "a1");
        assert_eq!((expr.start_ms, expr.end_ms), (0, 500));
        assert_eq!(expr.value, "smile");
        assert_eq!(doc.header_properties()["URN"], "urn:nl-mpi-tools-elan-eaf:9");
        assert_eq!(doc.last_used_annotation_id(), 4);
    }

    #[test]
    fn test_reference_resolves_regardless_of_tier_order() {
        // TRADUCAO precedes its parent tier GLOSA in the file.
        let doc = EafDocument::parse(SAMPLE).unwrap();
        let child = ann(&doc, "TRADUCAO", "a4");
        assert_eq!(child.annotation_ref(), Some("a3"));
        assert_eq!((child.start_ms, child.end_ms), (0, 1000));
    }

    #[test]
    fn test_dangling_reference_is_dropped() {
        let xml = SAMPLE.replace(r#"ANNOTATION_REF="a3""#, r#"ANNOTATION_REF="a99""#);
        let doc = EafDocument::parse(&xml).unwrap();
        assert!(doc.tier("TRADUCAO").unwrap().annotations.is_empty());
        // still counted for id allocation
        assert!(doc.annotation_ids().contains("a4"));
    }

    #[test]
    fn test_untouched_round_trip_is_exact() {
        let doc = EafDocument::parse(SAMPLE).unwrap();
        assert_eq!(doc.to_xml_string().unwrap(), SAMPLE);
    }

    #[test]
    fn test_reparse_after_mutation_keeps_model() {
        let mut doc = EafDocument::parse(SAMPLE).unwrap();
        doc.edit_annotation("TEXT", "a2", "olá", None, None).unwrap();
        let reparsed = EafDocument::parse(&doc.to_xml_string().unwrap()).unwrap();
        assert_eq!(reparsed.tiers().unwrap(), doc.tiers().unwrap());
        assert_eq!(reparsed.time_slots().unwrap(), doc.time_slots().unwrap());
        assert_eq!(ann(&reparsed, "TEXT", "a2").value, "olá");
    }

    #[test]
    fn test_tier_aliases_are_normalized() {
        let xml = SAMPLE.replace(r#"TIER_ID="TEXT""#, r#"TIER_ID="LP_P1 transcriÃ§Ã£o livre""#);
        let doc = EafDocument::parse_with_aliases(&xml, &TierAliases::lgp_defaults()).unwrap();
        assert!(doc.tier(super::super::TRANSCRIPTION_TIER).is_ok());
        assert!(doc.to_xml_string().unwrap().contains("LP_P1 transcrição livre"));
    }

    #[test]
    fn test_parse_errors() {
        let no_tier_id = SAMPLE.replace(r#" TIER_ID="EXPR""#, "");
        assert!(matches!(EafDocument::parse(&no_tier_id), Err(CorpusError::Parse(_))));

        let no_value = SAMPLE.replace("<ANNOTATION_VALUE>smile</ANNOTATION_VALUE>", "");
        assert!(matches!(EafDocument::parse(&no_value), Err(CorpusError::Parse(_))));

        let bad_slot = SAMPLE.replace(r#"TIME_SLOT_REF2="ts2""#, r#"TIME_SLOT_REF2="ts77""#);
        assert!(matches!(EafDocument::parse(&bad_slot), Err(CorpusError::Parse(_))));

        assert!(matches!(
            EafDocument::parse("<ANNOTATION_DOCUMENT><TIER>"),
            Err(CorpusError::Parse(_))
        ));
    }

    #[test]
    fn test_unaligned_slot_takes_previous_value() {
        let xml = SAMPLE.replace(
            r#"<TIME_SLOT TIME_SLOT_ID="ts3" TIME_VALUE="0"/>"#,
            r#"<TIME_SLOT TIME_SLOT_ID="ts3"/>"#,
        );
        let doc = EafDocument::parse(&xml).unwrap();
        let ts3 = doc.time_slots().unwrap().into_iter().find(|s| s.id == "ts3").unwrap();
        assert_eq!(ts3.value_ms, 500);
        assert!(!ts3.aligned);
    }

    #[test]
    fn test_add_time_slot_uses_highest_suffix() {
        let xml = SAMPLE.replace(
            r#"<TIME_SLOT TIME_SLOT_ID="ts4" TIME_VALUE="1000"/>"#,
            r#"<TIME_SLOT TIME_SLOT_ID="ts4" TIME_VALUE="1000"/>
        <TIME_SLOT TIME_SLOT_ID="ts9" TIME_VALUE="1200"/>"#,
        );
        let mut doc = EafDocument::parse(&xml).unwrap();
        assert_eq!(doc.add_time_slot(2000).unwrap(), "ts10");
    }

    #[test]
    fn test_add_alignable_annotation() {
        let mut doc = EafDocument::parse(SAMPLE).unwrap();
        let added = doc.add_annotation("EXPR", "frown", 1200, 1800, None).unwrap();
        assert_eq!(added.annotation_id, "a5");
        assert_eq!(added.parent_annotation_id, None);
        let new = ann(&doc, "EXPR", "a5");
        assert_eq!((new.start_ms, new.end_ms, new.value.as_str()), (1200, 1800, "frown"));
        assert_eq!(doc.header_properties()["lastUsedAnnotationId"], "5");
        assert_eq!(slot_ids(&doc).len(), 6);
    }

    #[test]
    fn test_add_referential_synthesizes_parent() {
        let mut doc = EafDocument::parse(SAMPLE).unwrap();
        let added = doc.add_annotation("TRADUCAO", "chorar", 2000, 2600, None).unwrap();
        assert_eq!(added.parent_annotation_id.as_deref(), Some("a5"));
        assert_eq!(added.annotation_id, "a6");
        let parent = ann(&doc, "GLOSA", "a5");
        let child = ann(&doc, "TRADUCAO", "a6");
        assert_eq!((parent.start_ms, parent.end_ms), (2000, 2600));
        assert_eq!((child.start_ms, child.end_ms), (2000, 2600));
        assert_eq!(child.annotation_ref(), Some("a5"));
        assert_eq!(doc.last_used_annotation_id(), 6);
    }

    #[test]
    fn test_add_referential_to_existing_parent() {
        let mut doc = EafDocument::parse(SAMPLE).unwrap();
        let added = doc
            .add_annotation("TRADUCAO", "rir", 0, 1000, Some("a3"))
            .unwrap();
        assert_eq!(added.annotation_id, "a5");
        assert_eq!(ann(&doc, "TRADUCAO", "a5").annotation_ref(), Some("a3"));

        let err = doc.add_annotation("TRADUCAO", "x", 0, 1, Some("a1")).unwrap_err();
        assert!(matches!(err, CorpusError::NotFound(_)));
        let err = doc.add_annotation("EXPR", "x", 0, 1, Some("a1")).unwrap_err();
        assert!(matches!(err, CorpusError::InvalidRequest(_)));
    }

    #[test]
    fn test_stale_counter_never_collides() {
        let xml = SAMPLE.replace(
            r#"<PROPERTY NAME="lastUsedAnnotationId">4</PROPERTY>"#,
            r#"<PROPERTY NAME="lastUsedAnnotationId">1</PROPERTY>"#,
        );
        let mut doc = EafDocument::parse(&xml).unwrap();
        let added = doc.add_annotation("EXPR", "frown", 10, 20, None).unwrap();
        assert_eq!(added.annotation_id, "a5");
    }

    #[test]
    fn test_edit_alignable_moves_slots() {
        let mut doc = EafDocument::parse(SAMPLE).unwrap();
        doc.edit_annotation("TEXT", "a2", "hello there", Some(100), Some(900))
            .unwrap();
        let text = ann(&doc, "TEXT", "a2");
        assert_eq!((text.start_ms, text.end_ms), (100, 900));
        assert_eq!(text.value, "hello there");
        // slot ids unchanged
        assert_eq!(slot_ids(&doc), vec!["ts1", "ts2", "ts3", "ts4"]);
    }

    #[test]
    fn test_edit_parent_propagates_to_reference() {
        let mut doc = EafDocument::parse(SAMPLE).unwrap();
        doc.retime_annotation("GLOSA", "a3", 0, 1500).unwrap();
        let parent = ann(&doc, "GLOSA", "a3");
        let child = ann(&doc, "TRADUCAO", "a4");
        assert_eq!((child.start_ms, child.end_ms), (parent.start_ms, parent.end_ms));
    }

    #[test]
    fn test_retime_rejects_inverting_a_slot_neighbour() {
        let mut doc = EafDocument::parse(SAMPLE).unwrap();
        // a1 = [ts1, ts2] ends at 500; moving ts1 past it would invert a1
        let err = doc.retime_annotation("GLOSA", "a3", 700, 900).unwrap_err();
        assert!(matches!(err, CorpusError::InvalidRequest(_)));
        assert_eq!(doc.to_xml_string().unwrap(), SAMPLE);
        assert_eq!((ann(&doc, "GLOSA", "a3").start_ms, ann(&doc, "GLOSA", "a3").end_ms), (0, 1000));
    }

    #[test]
    fn test_edit_referential_time_is_rejected() {
        let mut doc = EafDocument::parse(SAMPLE).unwrap();
        let err = doc
            .edit_annotation("TRADUCAO", "a4", "sorrir", Some(10), None)
            .unwrap_err();
        assert!(matches!(err, CorpusError::InvalidRequest(_)));
        // value-only edit is fine
        doc.edit_annotation("TRADUCAO", "a4", "sorriso", Some(0), Some(1000))
            .unwrap();
        assert_eq!(ann(&doc, "TRADUCAO", "a4").value, "sorriso");
    }

    #[test]
    fn test_delete_frees_unshared_slots_only() {
        let mut doc = EafDocument::parse(SAMPLE).unwrap();
        // a1 uses ts1 (shared with a3) and ts2 (exclusive)
        doc.delete_annotation("EXPR", "a1").unwrap();
        assert_eq!(slot_ids(&doc), vec!["ts1", "ts3", "ts4"]);
        assert!(doc.tier("EXPR").unwrap().annotations.is_empty());
    }

    #[test]
    fn test_delete_cascades_to_references() {
        let mut doc = EafDocument::parse(SAMPLE).unwrap();
        let removed = doc.delete_annotation("GLOSA", "a3").unwrap();
        let ids: Vec<_> = removed.iter().map(|r| r.annotation_id.as_str()).collect();
        assert_eq!(ids, vec!["a3", "a4"]);
        assert!(doc.tier("TRADUCAO").unwrap().annotations.is_empty());
    }

    #[test]
    fn test_add_then_delete_restores_tier_and_slots() {
        let mut doc = EafDocument::parse(SAMPLE).unwrap();
        let before_tier = doc.tier("EXPR").unwrap();
        let before_slots = doc.time_slots().unwrap();

        let added = doc.add_annotation("EXPR", "frown", 1200, 1800, None).unwrap();
        doc.delete_annotation("EXPR", &added.annotation_id).unwrap();

        assert_eq!(doc.tier("EXPR").unwrap(), before_tier);
        assert_eq!(doc.time_slots().unwrap(), before_slots);
        assert_eq!(doc.last_used_annotation_id(), 5);

        let again = doc.add_annotation("EXPR", "frown", 1200, 1800, None).unwrap();
        assert_eq!(again.annotation_id, "a6");
    }

    #[test]
    fn test_add_then_delete_referential_restores_parent_tier() {
        let mut doc = EafDocument::parse(SAMPLE).unwrap();
        let before_glosa = doc.tier("GLOSA").unwrap();
        let before_slots = doc.time_slots().unwrap();

        let added = doc
            .add_annotation("TRADUCAO", "rir", 1200, 1800, None)
            .unwrap();
        assert_eq!(added.parent_annotation_id.as_deref(), Some("a5"));
        let removed = doc.delete_annotation("TRADUCAO", &added.annotation_id).unwrap();
        let ids: Vec<_> = removed.iter().map(|r| r.annotation_id.as_str()).collect();
        assert_eq!(ids, vec!["a6", "a5"]);

        assert_eq!(doc.tier("GLOSA").unwrap(), before_glosa);
        assert_eq!(doc.time_slots().unwrap(), before_slots);
        assert_eq!(doc.last_used_annotation_id(), 6);
    }

    #[test]
    fn test_delete_keeps_parent_with_value() {
        let mut doc = EafDocument::parse(SAMPLE).unwrap();
        let removed = doc.delete_annotation("TRADUCAO", "a4").unwrap();
        assert_eq!(removed.len(), 1);
        assert!(doc.tier("GLOSA").unwrap().annotation("a3").is_some());
    }

    #[test]
    fn test_missing_targets_are_not_found() {
        let mut doc = EafDocument::parse(SAMPLE).unwrap();
        assert!(matches!(
            doc.delete_annotation("EXPR", "a42"),
            Err(CorpusError::NotFound(_))
        ));
        assert!(matches!(
            doc.add_annotation("NOPE", "x", 0, 1, None),
            Err(CorpusError::NotFound(_))
        ));
        assert!(matches!(
            doc.add_annotation("EXPR", "x", 10, 1, None),
            Err(CorpusError::InvalidRequest(_))
        ));
    }
}
