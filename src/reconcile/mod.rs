//! Reconciliation engine: one annotation edit as one logical transaction.
//!
//! A commit walks `Requested -> EafUpdated -> JsonUpdated ->
//! DerivedArtifactsUpdated -> Committed`, or ends in `Failed`.
//!
//! The per-video lock covers loading both stores, validating the request,
//! and the two local writes (EAF first, then JSON). Every mutation is applied
//! to in-memory copies first, so a rejected request never touches disk. Once
//! both files are written the lock is released and the derived artifacts
//! (frames, embeddings, index document, captions) are brought up to date
//! under a timeout; a failure there is reported as a warning on an otherwise
//! committed operation.

pub mod lock;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::captions;
use crate::collab::{index_key, Encoder, FrameStore, SearchIndex};
use crate::eaf::{AddedAnnotation, EafDocument, TierAliases};
use crate::embeddings::{embed_frames, text_input, EmbeddingStores, FrameEmbeddings};
use crate::error::{CorpusError, Result};
use crate::store::{Annotation, AnnotationDocument, AnnotationKey, AnnotationStore, PhraseMatch};

pub use lock::VideoLocks;

/// Locations and policies the engine runs with.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub eaf_dir: PathBuf,
    pub annotations_dir: PathBuf,
    pub captions_dir: PathBuf,
    pub embeddings_dir: PathBuf,
    pub aliases: TierAliases,
    pub phrase: PhraseMatch,
    /// Tiers whose annotations own frames, embeddings and an index document.
    pub indexed_tiers: Vec<String>,
    pub external_timeout: Duration,
    pub default_frame_rate: f64,
}

impl EngineSettings {
    #[must_use]
    pub fn eaf_path(&self, video_id: &str) -> PathBuf {
        self.eaf_dir.join(format!("{video_id}.eaf"))
    }

    #[must_use]
    pub fn is_indexed(&self, tier_id: &str) -> bool {
        self.indexed_tiers.iter().any(|t| t == tier_id)
    }
}

/// External capabilities, created once at startup.
#[derive(Clone)]
pub struct Collaborators {
    pub encoder: Arc<dyn Encoder>,
    pub frames: Arc<dyn FrameStore>,
    pub index: Arc<dyn SearchIndex>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationState {
    Requested,
    EafUpdated,
    JsonUpdated,
    DerivedArtifactsUpdated,
    Committed,
    Failed,
}

/// Per-request context. Carries what the caller needs back (such as the
/// page to return to) instead of keeping it in process-wide state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestContext {
    pub video_id: String,
    pub return_to: Option<String>,
}

impl RequestContext {
    pub fn new(video_id: impl Into<String>) -> Self {
        Self {
            video_id: video_id.into(),
            return_to: None,
        }
    }

    #[must_use]
    pub fn with_return_to(mut self, return_to: impl Into<String>) -> Self {
        self.return_to = Some(return_to.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct AddRequest {
    pub tier_id: String,
    pub value: String,
    pub start_ms: u64,
    pub end_ms: u64,
    /// Attach to this existing parent annotation instead of creating one.
    pub ref_annotation_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EditRequest {
    pub tier_id: String,
    pub annotation_id: String,
    pub value: String,
    pub start_ms: Option<u64>,
    pub end_ms: Option<u64>,
}

/// Outcome of a committed operation.
#[derive(Debug, Clone, Serialize)]
pub struct CommitReport {
    pub video_id: String,
    pub annotation_id: String,
    /// Parent synthesized by an add on a referential tier.
    pub parent_annotation_id: Option<String>,
    /// Annotations created, changed or removed by the commit.
    pub affected: Vec<AnnotationKey>,
    pub trail: Vec<OperationState>,
    /// `false` when some derived artifact could not be brought up to date.
    pub derived_synced: bool,
    pub warnings: Vec<String>,
    pub return_to: Option<String>,
}

/// State trail of one operation.
struct Transaction {
    video_id: String,
    trail: Vec<OperationState>,
}

impl Transaction {
    fn begin(video_id: &str, operation: &str) -> Self {
        debug!(video = video_id, operation, "Reconciliation requested");
        Self {
            video_id: video_id.to_owned(),
            trail: vec![OperationState::Requested],
        }
    }

    fn advance(&mut self, state: OperationState) {
        debug!(video = %self.video_id, ?state, "Reconciliation state");
        self.trail.push(state);
    }

    fn fail(&mut self, err: CorpusError) -> CorpusError {
        self.advance(OperationState::Failed);
        if err.is_rejection() {
            debug!(video = %self.video_id, "Rejected: {err}");
        } else {
            warn!(video = %self.video_id, "Failed: {err}");
        }
        err
    }
}

/// Accumulated result of the derived-artifact step.
struct DerivedSync {
    synced: bool,
    warnings: Vec<String>,
}

impl DerivedSync {
    fn new() -> Self {
        Self {
            synced: true,
            warnings: Vec::new(),
        }
    }

    fn record(&mut self, what: &str, result: Result<()>) {
        if let Err(e) = result {
            warn!("Derived sync for {what} deferred: {e}");
            self.synced = false;
            self.warnings.push(format!("{what}: {e}"));
        }
    }
}

/// How much of an annotation's derived data to regenerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refresh {
    /// New annotation: extract, embed, index.
    Create,
    /// Time range changed: drop stale frames, then as `Create`.
    Replace,
    /// Value changed only: text embedding and index document.
    TextOnly,
}

pub struct ReconciliationEngine {
    settings: EngineSettings,
    store: AnnotationStore,
    collab: Collaborators,
    embeddings: Mutex<EmbeddingStores>,
    locks: VideoLocks,
}

impl ReconciliationEngine {
    /// Build the engine and load the embedding tables.
    pub fn new(settings: EngineSettings, collab: Collaborators) -> Result<Self> {
        let embeddings = EmbeddingStores::open(&settings.embeddings_dir)?;
        Ok(Self {
            store: AnnotationStore::new(&settings.annotations_dir),
            settings,
            collab,
            embeddings: Mutex::new(embeddings),
            locks: VideoLocks::new(),
        })
    }

    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    #[must_use]
    pub fn store(&self) -> &AnnotationStore {
        &self.store
    }

    #[must_use]
    pub fn collaborators(&self) -> &Collaborators {
        &self.collab
    }

    pub(crate) fn embeddings(&self) -> &Mutex<EmbeddingStores> {
        &self.embeddings
    }

    pub(crate) fn locks(&self) -> &VideoLocks {
        &self.locks
    }

    /// Run an external call under the configured timeout.
    pub(crate) async fn bounded<T>(
        &self,
        service: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.settings.external_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CorpusError::external(
                service,
                format!("timed out after {:?}", self.settings.external_timeout),
            )),
        }
    }

    /// Frame rate from the frame store, or the configured default.
    pub(crate) async fn probe_frame_rate(&self, video_id: &str) -> f64 {
        match self
            .bounded("ffprobe", self.collab.frames.frame_rate(video_id))
            .await
        {
            Ok(fps) => fps,
            Err(e) => {
                debug!("Using default frame rate for {video_id}: {e}");
                self.settings.default_frame_rate
            }
        }
    }

    /// The annotation projection of a video, built from its EAF file on
    /// first access.
    pub async fn load_annotations(&self, video_id: &str) -> Result<AnnotationDocument> {
        if self.store.exists(video_id) {
            return self.store.load(video_id);
        }
        let _guard = self.locks.acquire(video_id).await;
        let eaf = EafDocument::load(&self.settings.eaf_path(video_id), &self.settings.aliases)?;
        let frame_rate = self.probe_frame_rate(video_id).await;
        self.store
            .build_if_missing(video_id, &eaf, frame_rate, &self.settings.phrase)?;
        self.store.load(video_id)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn add(&self, ctx: &RequestContext, request: &AddRequest) -> Result<CommitReport> {
        let video_id = ctx.video_id.as_str();
        let mut tx = Transaction::begin(video_id, "add");

        let guard = self.locks.acquire(video_id).await;
        let (mut eaf, mut doc) = self.load_pair(video_id).map_err(|e| tx.fail(e))?;
        let (added, affected) = self
            .apply_add(&mut eaf, &mut doc, request)
            .map_err(|e| tx.fail(e))?;
        self.write_both(&mut tx, &eaf, &doc)?;
        let mut derived = DerivedSync::new();
        self.refresh_captions(video_id, &doc, &affected, &mut derived);
        drop(guard);

        for key in &affected {
            if self.settings.is_indexed(&key.tier_id) {
                self.refresh(video_id, &doc, key, Refresh::Create, &mut derived)
                    .await;
            }
        }

        Ok(self.finish(
            tx,
            ctx,
            added.annotation_id,
            added.parent_annotation_id,
            affected,
            derived,
        ))
    }

    pub async fn edit(&self, ctx: &RequestContext, request: &EditRequest) -> Result<CommitReport> {
        let video_id = ctx.video_id.as_str();
        let mut tx = Transaction::begin(video_id, "edit");

        let guard = self.locks.acquire(video_id).await;
        let (mut eaf, mut doc) = self.load_pair(video_id).map_err(|e| tx.fail(e))?;
        let outcome = self
            .apply_edit(&mut eaf, &mut doc, request)
            .map_err(|e| tx.fail(e))?;
        self.write_both(&mut tx, &eaf, &doc)?;
        let edited = AnnotationKey::new(&request.tier_id, &request.annotation_id);
        let mut affected = outcome.retimed.clone();
        if !affected.contains(&edited) {
            affected.insert(0, edited.clone());
        }
        let mut derived = DerivedSync::new();
        self.refresh_captions(video_id, &doc, &affected, &mut derived);
        drop(guard);

        for key in &outcome.retimed {
            if self.settings.is_indexed(&key.tier_id) {
                self.refresh(video_id, &doc, key, Refresh::Replace, &mut derived)
                    .await;
            }
        }
        if outcome.value_changed
            && !outcome.retimed.contains(&edited)
            && self.settings.is_indexed(&edited.tier_id)
        {
            self.refresh(video_id, &doc, &edited, Refresh::TextOnly, &mut derived)
                .await;
        }

        Ok(self.finish(
            tx,
            ctx,
            request.annotation_id.clone(),
            None,
            affected,
            derived,
        ))
    }

    pub async fn delete(
        &self,
        ctx: &RequestContext,
        tier_id: &str,
        annotation_id: &str,
    ) -> Result<CommitReport> {
        let video_id = ctx.video_id.as_str();
        let mut tx = Transaction::begin(video_id, "delete");

        let guard = self.locks.acquire(video_id).await;
        let (mut eaf, mut doc) = self.load_pair(video_id).map_err(|e| tx.fail(e))?;
        let removed = self
            .apply_delete(&mut eaf, &mut doc, tier_id, annotation_id)
            .map_err(|e| tx.fail(e))?;
        self.write_both(&mut tx, &eaf, &doc)?;
        let mut derived = DerivedSync::new();
        self.refresh_captions(video_id, &doc, &removed, &mut derived);
        drop(guard);

        for key in &removed {
            self.purge(video_id, key, &mut derived).await;
        }

        Ok(self.finish(
            tx,
            ctx,
            annotation_id.to_owned(),
            None,
            removed,
            derived,
        ))
    }

    /// Set a user rating. Ratings only exist in the JSON projection.
    pub async fn rate(
        &self,
        ctx: &RequestContext,
        tier_id: &str,
        annotation_id: &str,
        rating: u8,
    ) -> Result<CommitReport> {
        let video_id = ctx.video_id.as_str();
        let mut tx = Transaction::begin(video_id, "rate");

        let guard = self.locks.acquire(video_id).await;
        let (_, mut doc) = self.load_pair(video_id).map_err(|e| tx.fail(e))?;
        doc.set_rating(tier_id, annotation_id, rating)
            .map_err(|e| tx.fail(e))?;
        self.store
            .persist(video_id, &doc)
            .map_err(|e| tx.fail(e))?;
        tx.advance(OperationState::JsonUpdated);
        drop(guard);

        Ok(self.finish(
            tx,
            ctx,
            annotation_id.to_owned(),
            None,
            vec![AnnotationKey::new(tier_id, annotation_id)],
            DerivedSync::new(),
        ))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LOCAL TRANSACTION STEPS
    // ═══════════════════════════════════════════════════════════════════════

    fn load_pair(&self, video_id: &str) -> Result<(EafDocument, AnnotationDocument)> {
        let eaf = EafDocument::load(&self.settings.eaf_path(video_id), &self.settings.aliases)?;
        let doc = if self.store.exists(video_id) {
            self.store.load(video_id)?
        } else {
            debug!("No annotation store for {video_id} yet, projecting from EAF");
            AnnotationDocument::build_from_eaf(
                &eaf,
                self.settings.default_frame_rate,
                &self.settings.phrase,
            )?
        };
        Ok((eaf, doc))
    }

    /// EAF first, then JSON. A JSON failure after the EAF write leaves the
    /// two files out of step and is reported as such.
    fn write_both(
        &self,
        tx: &mut Transaction,
        eaf: &EafDocument,
        doc: &AnnotationDocument,
    ) -> Result<()> {
        eaf.save(&self.settings.eaf_path(&tx.video_id))
            .map_err(|e| tx.fail(e))?;
        tx.advance(OperationState::EafUpdated);

        self.store.persist(&tx.video_id, doc).map_err(|e| {
            let video_id = tx.video_id.clone();
            tx.fail(CorpusError::StoresDiverged {
                video_id,
                reason: format!("EAF file written but annotation store write failed: {e}"),
            })
        })?;
        tx.advance(OperationState::JsonUpdated);
        Ok(())
    }

    fn apply_add(
        &self,
        eaf: &mut EafDocument,
        doc: &mut AnnotationDocument,
        request: &AddRequest,
    ) -> Result<(AddedAnnotation, Vec<AnnotationKey>)> {
        let tier = eaf.tier(&request.tier_id)?;
        ensure_tier(doc, &request.tier_id)?;

        let synthesizes_parent = tier.is_referential() && request.ref_annotation_id.is_none();
        if synthesizes_parent {
            if let Some(parent_tier) = &tier.parent_ref {
                ensure_tier(doc, parent_tier)?;
            }
        }
        if let Some(target) = &request.ref_annotation_id {
            if !doc.contains_id(target) {
                return Err(CorpusError::consistency(format!(
                    "parent annotation {target} is missing from the annotation store"
                )));
            }
        }
        let count = if synthesizes_parent { 2 } else { 1 };
        if let Some(taken) = eaf
            .next_annotation_ids(count)
            .into_iter()
            .find(|id| doc.contains_id(id))
        {
            return Err(CorpusError::consistency(format!(
                "next annotation id {taken} already exists in the annotation store"
            )));
        }

        let added = eaf.add_annotation(
            &request.tier_id,
            &request.value,
            request.start_ms,
            request.end_ms,
            request.ref_annotation_id.as_deref(),
        )?;

        // Project from the EAF's resolved view so both stores agree on times.
        let mut affected = Vec::new();
        if let (Some(parent_id), Some(parent_tier)) = (&added.parent_annotation_id, &tier.parent_ref) {
            let parent = resolved(eaf, parent_tier, parent_id)?;
            doc.insert(parent_tier, parent)?;
            affected.push(AnnotationKey::new(parent_tier, parent_id));
        }
        let created = resolved(eaf, &request.tier_id, &added.annotation_id)?;
        doc.insert(&request.tier_id, created)?;
        affected.push(AnnotationKey::new(&request.tier_id, &added.annotation_id));

        doc.advance_last_used(eaf.last_used_annotation_id());
        doc.refresh_phrases(&self.settings.phrase);
        Ok((added, affected))
    }

    fn apply_edit(
        &self,
        eaf: &mut EafDocument,
        doc: &mut AnnotationDocument,
        request: &EditRequest,
    ) -> Result<EditOutcome> {
        let current = eaf
            .tier(&request.tier_id)?
            .annotation(&request.annotation_id)
            .cloned()
            .ok_or_else(|| {
                CorpusError::not_found(format!(
                    "annotation {} in tier {}",
                    request.annotation_id, request.tier_id
                ))
            })?;
        let projected = doc
            .annotation(&request.tier_id, &request.annotation_id)
            .map_err(|_| {
                CorpusError::consistency(format!(
                    "annotation {} exists in the EAF file but not in the annotation store",
                    request.annotation_id
                ))
            })?;
        let value_changed = projected.text() != request.value;

        let start = request.start_ms.unwrap_or(current.start_ms);
        let end = request.end_ms.unwrap_or(current.end_ms);
        if start > end {
            return Err(CorpusError::invalid(format!(
                "start {start}ms is after end {end}ms"
            )));
        }

        let mut retimed = Vec::new();
        if (start, end) != (current.start_ms, current.end_ms) {
            // Referential annotations have no slots: move the alignable root.
            let root = if current.is_alignable() {
                AnnotationKey::new(&request.tier_id, &request.annotation_id)
            } else {
                doc.root_alignable(&request.annotation_id)?
            };
            eaf.retime_annotation(&root.tier_id, &root.annotation_id, start, end)?;
            let descendants = doc.retime(&root.tier_id, &root.annotation_id, start, end)?;
            retimed.push(root);
            retimed.extend(descendants);
            for key in doc.sync_times(eaf)? {
                if !retimed.contains(&key) {
                    retimed.push(key);
                }
            }
        }

        eaf.edit_annotation(&request.tier_id, &request.annotation_id, &request.value, None, None)?;
        doc.set_value(&request.tier_id, &request.annotation_id, &request.value)?;
        doc.refresh_phrases(&self.settings.phrase);

        Ok(EditOutcome {
            retimed,
            value_changed,
        })
    }

    fn apply_delete(
        &self,
        eaf: &mut EafDocument,
        doc: &mut AnnotationDocument,
        tier_id: &str,
        annotation_id: &str,
    ) -> Result<Vec<AnnotationKey>> {
        if eaf.tier(tier_id)?.annotation(annotation_id).is_none() {
            return Err(CorpusError::not_found(format!(
                "annotation {annotation_id} in tier {tier_id}"
            )));
        }
        doc.annotation(tier_id, annotation_id).map_err(|_| {
            CorpusError::consistency(format!(
                "annotation {annotation_id} exists in the EAF file but not in the annotation store"
            ))
        })?;

        let from_eaf_removed = eaf.delete_annotation(tier_id, annotation_id)?;
        let mut from_eaf: Vec<String> = from_eaf_removed
            .iter()
            .map(|r| r.annotation_id.clone())
            .collect();
        let mut removed = doc.remove(tier_id, annotation_id)?;
        for extra in &from_eaf_removed {
            let key = AnnotationKey::new(&extra.tier_id, &extra.annotation_id);
            if !removed.contains(&key) && doc.annotation(&key.tier_id, &key.annotation_id).is_ok() {
                removed.extend(doc.remove(&key.tier_id, &key.annotation_id)?);
            }
        }
        let mut from_json: Vec<String> = removed.iter().map(|k| k.annotation_id.clone()).collect();
        from_eaf.sort();
        from_json.sort();
        if from_eaf != from_json {
            return Err(CorpusError::consistency(format!(
                "stores disagree on what depends on {annotation_id}: EAF {from_eaf:?}, JSON {from_json:?}"
            )));
        }

        doc.refresh_phrases(&self.settings.phrase);
        Ok(removed)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DERIVED ARTIFACTS
    // ═══════════════════════════════════════════════════════════════════════

    async fn refresh(
        &self,
        video_id: &str,
        doc: &AnnotationDocument,
        key: &AnnotationKey,
        mode: Refresh,
        derived: &mut DerivedSync,
    ) {
        let Ok(ann) = doc.annotation(&key.tier_id, &key.annotation_id) else {
            return;
        };
        let result = async {
            let frames = if mode == Refresh::TextOnly {
                None
            } else {
                if mode == Refresh::Replace {
                    self.bounded("frames", self.collab.frames.delete(video_id, &ann.annotation_id))
                        .await?;
                }
                let paths = self
                    .bounded(
                        "frames",
                        self.collab
                            .frames
                            .extract(video_id, &ann.annotation_id, ann.start_ms, ann.end_ms),
                    )
                    .await?;
                let vectors = self
                    .bounded("encoder", embed_frames(self.collab.encoder.as_ref(), &paths))
                    .await?;
                Some(FrameEmbeddings::from_frames(vectors))
            };
            let text = self
                .bounded(
                    "encoder",
                    self.collab.encoder.text_encode(&text_input(ann.text())),
                )
                .await?;

            let document = {
                let mut tables = self.embeddings.lock().await;
                match frames {
                    Some(Some(frame_set)) => tables.set_frames(video_id, &ann.annotation_id, frame_set),
                    Some(None) => tables.clear_frames(video_id, &ann.annotation_id),
                    None => {}
                }
                tables.set_text(video_id, &ann.annotation_id, text);
                tables.save()?;
                tables.index_document(video_id, &ann.annotation_id, ann.text())
            };
            if let Some(document) = document {
                self.bounded("opensearch", self.collab.index.upsert(&document))
                    .await?;
            }
            Ok::<_, CorpusError>(())
        }
        .await;

        derived.record(&index_key(video_id, &key.annotation_id), result);
    }

    /// Frames, then embeddings, then the index document, so nothing
    /// externally visible outlives the annotation record.
    async fn purge(&self, video_id: &str, key: &AnnotationKey, derived: &mut DerivedSync) {
        let result = async {
            self.bounded("frames", self.collab.frames.delete(video_id, &key.annotation_id))
                .await?;
            {
                let mut tables = self.embeddings.lock().await;
                tables.remove(video_id, &key.annotation_id);
                tables.save()?;
            }
            self.bounded(
                "opensearch",
                self.collab.index.delete(&index_key(video_id, &key.annotation_id)),
            )
            .await
        }
        .await;

        derived.record(&index_key(video_id, &key.annotation_id), result);
    }

    /// Runs under the video lock so tracks land in commit order.
    fn refresh_captions(
        &self,
        video_id: &str,
        doc: &AnnotationDocument,
        affected: &[AnnotationKey],
        derived: &mut DerivedSync,
    ) {
        let tier = &self.settings.phrase.transcription_tier;
        if !affected.iter().any(|k| &k.tier_id == tier) {
            return;
        }
        let result = captions::write_track(&self.settings.captions_dir, video_id, doc, tier).map(|path| {
            debug!("Re-rendered captions {}", path.display());
        });
        derived.record(&format!("{video_id} captions"), result);
    }

    fn finish(
        &self,
        mut tx: Transaction,
        ctx: &RequestContext,
        annotation_id: String,
        parent_annotation_id: Option<String>,
        affected: Vec<AnnotationKey>,
        derived: DerivedSync,
    ) -> CommitReport {
        if derived.synced {
            tx.advance(OperationState::DerivedArtifactsUpdated);
        }
        tx.advance(OperationState::Committed);
        info!(
            video = %ctx.video_id,
            annotation = %annotation_id,
            derived_synced = derived.synced,
            "Committed"
        );

        CommitReport {
            video_id: tx.video_id,
            annotation_id,
            parent_annotation_id,
            affected,
            trail: tx.trail,
            derived_synced: derived.synced,
            warnings: derived.warnings,
            return_to: ctx.return_to.clone(),
        }
    }
}

struct EditOutcome {
    retimed: Vec<AnnotationKey>,
    value_changed: bool,
}

fn ensure_tier(doc: &AnnotationDocument, tier_id: &str) -> Result<()> {
    doc.tier(tier_id).map(|_| ()).map_err(|_| {
        CorpusError::consistency(format!(
            "tier {tier_id} exists in the EAF file but not in the annotation store"
        ))
    })
}

/// JSON annotation for an EAF annotation, with resolved times.
fn resolved(eaf: &EafDocument, tier_id: &str, annotation_id: &str) -> Result<Annotation> {
    let ann = eaf
        .tier(tier_id)?
        .annotation(annotation_id)
        .cloned()
        .ok_or_else(|| {
            CorpusError::consistency(format!("annotation {annotation_id} did not resolve after add"))
        })?;
    let projected = Annotation::new(ann.annotation_id.clone(), &ann.value, ann.start_ms, ann.end_ms);
    Ok(match ann.annotation_ref() {
        Some(target) => projected.referencing(target),
        None => projected,
    })
}
