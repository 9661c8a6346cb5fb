//! End-to-end reconciliation tests against a temp corpus directory.
//!
//! The collaborators are in-memory fakes that record every call into one
//! shared event log, so tests can assert on ordering across services.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use lgp_corpus::batch::{self, BatchSummary};
use lgp_corpus::collab::{Encoder, FrameStore, IndexDocument, SearchHit, SearchIndex, VectorField};
use lgp_corpus::eaf::{EafDocument, TierAliases};
use lgp_corpus::reconcile::{
    AddRequest, Collaborators, EditRequest, EngineSettings, OperationState, ReconciliationEngine,
    RequestContext,
};
use lgp_corpus::store::{AnnotationStore, PhraseMatch};
use lgp_corpus::CorpusError;

const VIDEO: &str = "9";

const EAF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ANNOTATION_DOCUMENT AUTHOR="" FORMAT="3.0" VERSION="3.0">
    <HEADER MEDIA_FILE="" TIME_UNITS="milliseconds">
        <PROPERTY NAME="lastUsedAnnotationId">4</PROPERTY>
    </HEADER>
    <TIME_ORDER>
        <TIME_SLOT TIME_SLOT_ID="ts1" TIME_VALUE="0"/>
        <TIME_SLOT TIME_SLOT_ID="ts2" TIME_VALUE="500"/>
        <TIME_SLOT TIME_SLOT_ID="ts3" TIME_VALUE="0"/>
        <TIME_SLOT TIME_SLOT_ID="ts4" TIME_VALUE="1000"/>
    </TIME_ORDER>
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
    <TIER LINGUISTIC_TYPE_REF="traducao" PARENT_REF="GLOSA" TIER_ID="TRADUCAO">
        <ANNOTATION>
            <REF_ANNOTATION ANNOTATION_ID="a4" ANNOTATION_REF="a3">
                <ANNOTATION_VALUE>sorrir</ANNOTATION_VALUE>
            </REF_ANNOTATION>
        </ANNOTATION>
    </TIER>
</ANNOTATION_DOCUMENT>
"#;

type Events = Arc<Mutex<Vec<String>>>;

fn log(events: &Events, event: String) {
    events.lock().unwrap().push(event);
}

struct FakeEncoder {
    events: Events,
    delay: Option<Duration>,
}

#[async_trait]
impl Encoder for FakeEncoder {
    async fn text_encode(&self, text: &str) -> lgp_corpus::Result<Vec<f32>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        log(&self.events, format!("encoder.text {text}"));
        #[allow(clippy::cast_precision_loss)]
        Ok(vec![text.len() as f32, 1.0, 0.0, 0.0])
    }

    async fn image_encode(&self, image: &Path) -> lgp_corpus::Result<Vec<f32>> {
        #[allow(clippy::cast_precision_loss)]
        Ok(vec![0.0, image.as_os_str().len() as f32, 1.0, 0.0])
    }
}

#[derive(Default)]
struct FakeFrames {
    events: Events,
    stored: Mutex<HashMap<String, Vec<PathBuf>>>,
}

#[async_trait]
impl FrameStore for FakeFrames {
    async fn extract(
        &self,
        video_id: &str,
        annotation_id: &str,
        start_ms: u64,
        end_ms: u64,
    ) -> lgp_corpus::Result<Vec<PathBuf>> {
        log(&self.events, format!("frames.extract {annotation_id} {start_ms}-{end_ms}"));
        let paths: Vec<PathBuf> = (1..=3)
            .map(|i| PathBuf::from(format!("/frames/{video_id}/{annotation_id}/frame_{i:04}.jpg")))
            .collect();
        self.stored
            .lock()
            .unwrap()
            .insert(annotation_id.to_string(), paths.clone());
        Ok(paths)
    }

    async fn frames(&self, _video_id: &str, annotation_id: &str) -> lgp_corpus::Result<Vec<PathBuf>> {
        Ok(self
            .stored
            .lock()
            .unwrap()
            .get(annotation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete(&self, _video_id: &str, annotation_id: &str) -> lgp_corpus::Result<()> {
        log(&self.events, format!("frames.delete {annotation_id}"));
        self.stored.lock().unwrap().remove(annotation_id);
        Ok(())
    }

    async fn still(&self, video_id: &str, annotation_id: &str, at_ms: u64) -> lgp_corpus::Result<PathBuf> {
        Ok(PathBuf::from(format!("/frames/{video_id}/phrases/{annotation_id}_{at_ms}.jpg")))
    }

    async fn frame_rate(&self, _video_id: &str) -> lgp_corpus::Result<f64> {
        Ok(30.0)
    }
}

#[derive(Default)]
struct FakeIndex {
    events: Events,
    documents: Mutex<HashMap<String, IndexDocument>>,
}

#[async_trait]
impl SearchIndex for FakeIndex {
    async fn ensure_index(&self) -> lgp_corpus::Result<()> {
        Ok(())
    }

    async fn upsert(&self, document: &IndexDocument) -> lgp_corpus::Result<()> {
        log(&self.events, format!("index.upsert {}", document.id()));
        self.documents
            .lock()
            .unwrap()
            .insert(document.id(), document.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> lgp_corpus::Result<()> {
        log(&self.events, format!("index.delete {id}"));
        self.documents.lock().unwrap().remove(id);
        Ok(())
    }

    async fn knn_search(&self, _field: VectorField, _vector: &[f32], _k: usize) -> lgp_corpus::Result<Vec<SearchHit>> {
        Ok(Vec::new())
    }
}

struct Corpus {
    dir: TempDir,
    events: Events,
    index: Arc<FakeIndex>,
    engine: ReconciliationEngine,
}

impl Corpus {
    fn eaf_path(&self) -> PathBuf {
        self.dir.path().join("eaf").join(format!("{VIDEO}.eaf"))
    }

    fn eaf(&self) -> EafDocument {
        EafDocument::load(&self.eaf_path(), &TierAliases::new()).unwrap()
    }

    fn store(&self) -> AnnotationStore {
        AnnotationStore::new(self.dir.path().join("annotations"))
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn position(&self, event: &str) -> usize {
        self.events()
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("{event} not recorded in {:?}", self.events()))
    }
}

fn settings(root: &Path) -> EngineSettings {
    EngineSettings {
        eaf_dir: root.join("eaf"),
        annotations_dir: root.join("annotations"),
        captions_dir: root.join("captions"),
        embeddings_dir: root.join("embeddings"),
        aliases: TierAliases::new(),
        phrase: PhraseMatch {
            transcription_tier: "TEXT".to_string(),
            expression_tier: "EXPR".to_string(),
            tolerance_ms: 10,
        },
        indexed_tiers: vec!["EXPR".to_string()],
        external_timeout: Duration::from_secs(5),
        default_frame_rate: 25.0,
    }
}

fn corpus_with(adjust: impl FnOnce(&mut EngineSettings), encoder_delay: Option<Duration>) -> Corpus {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("eaf")).unwrap();
    std::fs::write(dir.path().join("eaf").join(format!("{VIDEO}.eaf")), EAF).unwrap();

    let events: Events = Arc::default();
    let index = Arc::new(FakeIndex {
        events: Arc::clone(&events),
        ..FakeIndex::default()
    });
    let collab = Collaborators {
        encoder: Arc::new(FakeEncoder {
            events: Arc::clone(&events),
            delay: encoder_delay,
        }),
        frames: Arc::new(FakeFrames {
            events: Arc::clone(&events),
            ..FakeFrames::default()
        }),
        index: index.clone(),
    };

    let mut settings = settings(dir.path());
    adjust(&mut settings);
    let engine = ReconciliationEngine::new(settings, collab).unwrap();
    Corpus {
        dir,
        events,
        index,
        engine,
    }
}

fn corpus() -> Corpus {
    corpus_with(|_| {}, None)
}

fn ctx() -> RequestContext {
    RequestContext::new(VIDEO)
}

fn add(tier: &str, value: &str, start_ms: u64, end_ms: u64) -> AddRequest {
    AddRequest {
        tier_id: tier.to_string(),
        value: value.to_string(),
        start_ms,
        end_ms,
        ref_annotation_id: None,
    }
}

fn edit(tier: &str, id: &str, value: &str, start_ms: Option<u64>, end_ms: Option<u64>) -> EditRequest {
    EditRequest {
        tier_id: tier.to_string(),
        annotation_id: id.to_string(),
        value: value.to_string(),
        start_ms,
        end_ms,
    }
}

const FULL_TRAIL: [OperationState; 5] = [
    OperationState::Requested,
    OperationState::EafUpdated,
    OperationState::JsonUpdated,
    OperationState::DerivedArtifactsUpdated,
    OperationState::Committed,
];

// ─── Add ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn add_alignable_writes_both_stores_then_derived_artifacts() {
    let corpus = corpus();
    let report = corpus
        .engine
        .add(&ctx().with_return_to("/videos/9"), &add("EXPR", "frown", 600, 900))
        .await
        .unwrap();

    assert_eq!(report.annotation_id, "a5");
    assert_eq!(report.trail, FULL_TRAIL);
    assert!(report.derived_synced);
    assert_eq!(report.return_to.as_deref(), Some("/videos/9"));

    let eaf = corpus.eaf();
    let added = eaf.tier("EXPR").unwrap().annotation("a5").cloned().unwrap();
    assert_eq!((added.start_ms, added.end_ms), (600, 900));
    assert_eq!(eaf.last_used_annotation_id(), 5);

    let doc = corpus.store().load(VIDEO).unwrap();
    let projected = doc.annotation("EXPR", "a5").unwrap();
    assert_eq!(projected.value.as_deref(), Some("frown"));
    assert_eq!(projected.phrase.as_deref(), Some("hello"));
    assert_eq!(doc.properties.last_used_annotation_id, 5);

    assert!(corpus.position("frames.extract a5 600-900") < corpus.position("index.upsert 9_a5"));
    let indexed = corpus.index.documents.lock().unwrap().get("9_a5").cloned().unwrap();
    assert_eq!(indexed.annotation_value, "frown");
    assert!(indexed.base_frame_embedding.is_some());

    let text_table = std::fs::read_to_string(corpus.dir.path().join("embeddings/text_embeddings.json")).unwrap();
    assert!(text_table.contains("a5"));
}

#[tokio::test]
async fn add_to_referential_tier_synthesizes_parent() {
    let corpus = corpus();
    let report = corpus
        .engine
        .add(&ctx(), &add("TRADUCAO", "chorar", 1200, 1400))
        .await
        .unwrap();

    assert_eq!(report.parent_annotation_id.as_deref(), Some("a5"));
    assert_eq!(report.annotation_id, "a6");

    let doc = corpus.store().load(VIDEO).unwrap();
    let parent = doc.annotation("GLOSA", "a5").unwrap();
    let child = doc.annotation("TRADUCAO", "a6").unwrap();
    assert_eq!(child.annotation_ref.as_deref(), Some("a5"));
    assert_eq!((child.start_ms, child.end_ms), (parent.start_ms, parent.end_ms));
    assert_eq!(doc.properties.last_used_annotation_id, 6);

    let eaf = corpus.eaf();
    assert_eq!(eaf.tier("TRADUCAO").unwrap().annotation("a6").unwrap().start_ms, 1200);
}

#[tokio::test]
async fn add_with_existing_parent_reference() {
    let corpus = corpus();
    let mut request = add("TRADUCAO", "sorriso", 0, 0);
    request.ref_annotation_id = Some("a3".to_string());
    let report = corpus.engine.add(&ctx(), &request).await.unwrap();

    assert_eq!(report.annotation_id, "a5");
    assert!(report.parent_annotation_id.is_none());
    let doc = corpus.store().load(VIDEO).unwrap();
    let child = doc.annotation("TRADUCAO", "a5").unwrap();
    assert_eq!((child.start_ms, child.end_ms), (0, 1000));
}

#[tokio::test]
async fn rejected_add_leaves_files_untouched() {
    let corpus = corpus();

    let err = corpus.engine.add(&ctx(), &add("NOPE", "x", 0, 10)).await.unwrap_err();
    assert!(matches!(err, CorpusError::NotFound(_)), "{err}");

    let err = corpus.engine.add(&ctx(), &add("EXPR", "x", 900, 100)).await.unwrap_err();
    assert!(matches!(err, CorpusError::InvalidRequest(_)), "{err}");

    assert_eq!(std::fs::read_to_string(corpus.eaf_path()).unwrap(), EAF);
    assert!(!corpus.store().exists(VIDEO));
    assert!(corpus.events().is_empty());
}

#[tokio::test]
async fn add_rejects_id_already_in_annotation_store() {
    let corpus = corpus();
    let mut doc = corpus.engine.load_annotations(VIDEO).await.unwrap();
    doc.insert("TEXT", lgp_corpus::store::Annotation::new("a5", "stray", 0, 10))
        .unwrap();
    corpus.store().persist(VIDEO, &doc).unwrap();

    let err = corpus.engine.add(&ctx(), &add("EXPR", "frown", 600, 900)).await.unwrap_err();
    assert!(matches!(err, CorpusError::Consistency(_)), "{err}");
    assert_eq!(std::fs::read_to_string(corpus.eaf_path()).unwrap(), EAF);
}

#[tokio::test]
async fn concurrent_adds_to_one_video_never_lose_an_update() {
    let corpus = Arc::new(corpus());
    let first = {
        let corpus = Arc::clone(&corpus);
        tokio::spawn(async move {
            let report = corpus.engine.add(&ctx(), &add("EXPR", "one", 600, 700)).await;
            report
        })
    };
    let second = {
        let corpus = Arc::clone(&corpus);
        tokio::spawn(async move {
            let report = corpus.engine.add(&ctx(), &add("EXPR", "two", 700, 800)).await;
            report
        })
    };
    let mut ids = vec![
        first.await.unwrap().unwrap().annotation_id,
        second.await.unwrap().unwrap().annotation_id,
    ];
    ids.sort();
    assert_eq!(ids, vec!["a5", "a6"]);

    let doc = corpus.store().load(VIDEO).unwrap();
    assert_eq!(doc.tier("EXPR").unwrap().annotations.len(), 3);
    let eaf_ids = corpus.eaf().annotation_ids();
    assert!(eaf_ids.contains("a5") && eaf_ids.contains("a6"));
}

// ─── Edit ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn retiming_parent_propagates_to_children_and_shared_slots() {
    let corpus = corpus();
    let report = corpus
        .engine
        .edit(&ctx(), &edit("GLOSA", "a3", "SORRIR", Some(100), Some(900)))
        .await
        .unwrap();
    assert_eq!(report.trail, FULL_TRAIL);

    let doc = corpus.store().load(VIDEO).unwrap();
    let child = doc.annotation("TRADUCAO", "a4").unwrap();
    assert_eq!((child.start_ms, child.end_ms), (100, 900));
    // a1 starts on ts1 and a2 ends on ts4, both shared with a3
    assert_eq!(doc.annotation("EXPR", "a1").unwrap().start_ms, 100);
    assert_eq!(doc.annotation("TEXT", "a2").unwrap().end_ms, 900);

    let eaf = corpus.eaf();
    assert_eq!(eaf.tier("TRADUCAO").unwrap().annotation("a4").unwrap().end_ms, 900);

    let affected: Vec<_> = report.affected.iter().map(|k| k.annotation_id.as_str()).collect();
    for id in ["a1", "a2", "a3", "a4"] {
        assert!(affected.contains(&id), "{id} missing from {affected:?}");
    }

    // a1 is indexed: stale frames go before the new extraction
    assert!(corpus.position("frames.delete a1") < corpus.position("frames.extract a1 100-500"));
    let vtt = std::fs::read_to_string(corpus.dir.path().join("captions/9.vtt")).unwrap();
    assert!(vtt.contains("00:00:00.000 --> 00:00:00.900\nhello"));
}

#[tokio::test]
async fn retiming_referential_annotation_moves_its_root() {
    let corpus = corpus();
    corpus
        .engine
        .edit(&ctx(), &edit("TRADUCAO", "a4", "sorrir muito", Some(200), Some(800)))
        .await
        .unwrap();

    let doc = corpus.store().load(VIDEO).unwrap();
    let parent = doc.annotation("GLOSA", "a3").unwrap();
    let child = doc.annotation("TRADUCAO", "a4").unwrap();
    assert_eq!((parent.start_ms, parent.end_ms), (200, 800));
    assert_eq!((child.start_ms, child.end_ms), (200, 800));
    assert_eq!(child.value.as_deref(), Some("sorrir muito"));

    let eaf = corpus.eaf();
    assert_eq!(eaf.tier("GLOSA").unwrap().annotation("a3").unwrap().start_ms, 200);
}

#[tokio::test]
async fn value_only_edit_refreshes_text_embedding_only() {
    let corpus = corpus();
    corpus
        .engine
        .edit(&ctx(), &edit("EXPR", "a1", "Big Smile", None, None))
        .await
        .unwrap();

    let events = corpus.events();
    assert!(events.iter().all(|e| !e.starts_with("frames.")), "{events:?}");
    assert!(events.contains(&"encoder.text big smile".to_string()));
    let indexed = corpus.index.documents.lock().unwrap().get("9_a1").cloned().unwrap();
    assert_eq!(indexed.annotation_value, "Big Smile");

    let eaf = corpus.eaf();
    assert_eq!(eaf.tier("EXPR").unwrap().annotation("a1").unwrap().value, "Big Smile");
}

#[tokio::test]
async fn editing_transcription_rerenders_captions() {
    let corpus = corpus();
    corpus
        .engine
        .edit(&ctx(), &edit("TEXT", "a2", "olá", None, None))
        .await
        .unwrap();

    let vtt = std::fs::read_to_string(corpus.dir.path().join("captions/9.vtt")).unwrap();
    assert!(vtt.starts_with("WEBVTT\n\n"));
    assert!(vtt.contains("olá"));
    let doc = corpus.store().load(VIDEO).unwrap();
    assert_eq!(doc.annotation("EXPR", "a1").unwrap().phrase.as_deref(), Some("olá"));
}

#[tokio::test]
async fn retime_that_would_invert_a_slot_neighbour_is_rejected() {
    let corpus = corpus();
    // a3 shares ts1 with a1, which ends at 500
    let err = corpus
        .engine
        .edit(&ctx(), &edit("GLOSA", "a3", "SORRIR", Some(700), Some(900)))
        .await
        .unwrap_err();

    assert!(matches!(err, CorpusError::InvalidRequest(_)), "{err}");
    assert!(err.is_rejection());
    assert_eq!(std::fs::read_to_string(corpus.eaf_path()).unwrap(), EAF);
    assert!(!corpus.store().exists(VIDEO));
    assert!(corpus.events().is_empty(), "{:?}", corpus.events());
}

#[tokio::test]
async fn concurrent_transcription_edits_leave_captions_matching_the_store() {
    let corpus = Arc::new(corpus());
    let edits: Vec<_> = ["first take", "second take", "third take"]
        .into_iter()
        .map(|value| {
            let corpus = Arc::clone(&corpus);
            tokio::spawn(async move {
                let report = corpus.engine.edit(&ctx(), &edit("TEXT", "a2", value, None, None)).await;
                report
            })
        })
        .collect();
    for handle in edits {
        handle.await.unwrap().unwrap();
    }

    let doc = corpus.store().load(VIDEO).unwrap();
    let stored = doc.annotation("TEXT", "a2").unwrap().value.clone().unwrap();
    let vtt = std::fs::read_to_string(corpus.dir.path().join("captions/9.vtt")).unwrap();
    assert!(vtt.contains(&format!("00:00:01.000\n{stored}")), "{vtt}");
    let captions: Vec<_> = std::fs::read_dir(corpus.dir.path().join("captions"))
        .unwrap()
        .filter_map(std::result::Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(captions, vec!["9.vtt"]);
}

#[tokio::test]
async fn edit_missing_annotation_is_not_found() {
    let corpus = corpus();
    let err = corpus
        .engine
        .edit(&ctx(), &edit("EXPR", "a99", "x", None, None))
        .await
        .unwrap_err();
    assert!(matches!(err, CorpusError::NotFound(_)), "{err}");
}

// ─── Delete ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn delete_removes_frames_then_embeddings_then_index_document() {
    let corpus = corpus();
    corpus
        .engine
        .edit(&ctx(), &edit("EXPR", "a1", "smile", Some(0), Some(400)))
        .await
        .unwrap();
    assert!(corpus.index.documents.lock().unwrap().contains_key("9_a1"));

    let report = corpus.engine.delete(&ctx(), "EXPR", "a1").await.unwrap();
    assert_eq!(report.trail, FULL_TRAIL);

    let deleted_frames = corpus.events().iter().rposition(|e| e == "frames.delete a1").unwrap();
    assert!(deleted_frames < corpus.position("index.delete 9_a1"));
    assert!(!corpus.index.documents.lock().unwrap().contains_key("9_a1"));

    let text_table = std::fs::read_to_string(corpus.dir.path().join("embeddings/text_embeddings.json")).unwrap();
    assert!(!text_table.contains("a1"));

    // ts1 is still used by a3
    let slots: Vec<String> = corpus.eaf().time_slots().unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(slots, vec!["ts1", "ts3", "ts4"]);
}

#[tokio::test]
async fn delete_parent_cascades_in_both_stores() {
    let corpus = corpus();
    let report = corpus.engine.delete(&ctx(), "GLOSA", "a3").await.unwrap();
    let mut removed: Vec<_> = report.affected.iter().map(|k| k.annotation_id.clone()).collect();
    removed.sort();
    assert_eq!(removed, vec!["a3", "a4"]);

    let doc = corpus.store().load(VIDEO).unwrap();
    assert!(doc.tier("TRADUCAO").unwrap().annotations.is_empty());
    assert!(corpus.eaf().tier("TRADUCAO").unwrap().annotations.is_empty());
}

#[tokio::test]
async fn add_then_delete_restores_slots_but_not_counter() {
    let corpus = corpus();
    let before: Vec<String> = corpus.eaf().time_slots().unwrap().into_iter().map(|s| s.id).collect();
    let report = corpus.engine.add(&ctx(), &add("EXPR", "frown", 600, 900)).await.unwrap();
    corpus.engine.delete(&ctx(), "EXPR", &report.annotation_id).await.unwrap();

    let eaf = corpus.eaf();
    let after: Vec<String> = eaf.time_slots().unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(before, after);
    assert_eq!(eaf.last_used_annotation_id(), 5);
    let next = corpus.engine.add(&ctx(), &add("EXPR", "again", 600, 900)).await.unwrap();
    assert_eq!(next.annotation_id, "a6");
}

#[tokio::test]
async fn add_then_delete_referential_removes_synthesized_parent() {
    let corpus = corpus();
    let before: Vec<String> = corpus.eaf().time_slots().unwrap().into_iter().map(|s| s.id).collect();
    let report = corpus.engine.add(&ctx(), &add("TRADUCAO", "chorar", 1200, 1400)).await.unwrap();
    assert_eq!(report.parent_annotation_id.as_deref(), Some("a5"));

    let deleted = corpus.engine.delete(&ctx(), "TRADUCAO", "a6").await.unwrap();
    let mut removed: Vec<_> = deleted.affected.iter().map(|k| k.annotation_id.clone()).collect();
    removed.sort();
    assert_eq!(removed, vec!["a5", "a6"]);

    let eaf = corpus.eaf();
    let after: Vec<String> = eaf.time_slots().unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(before, after);
    let glosa: Vec<_> = eaf.tier("GLOSA").unwrap().annotations.into_iter().map(|a| a.annotation_id).collect();
    assert_eq!(glosa, vec!["a3"]);
    let doc = corpus.store().load(VIDEO).unwrap();
    assert_eq!(doc.tier("GLOSA").unwrap().annotations.len(), 1);
    assert_eq!(doc.tier("TRADUCAO").unwrap().annotations.len(), 1);
}

#[tokio::test]
async fn deleting_a_translation_keeps_a_glossed_parent() {
    let corpus = corpus();
    let report = corpus.engine.delete(&ctx(), "TRADUCAO", "a4").await.unwrap();
    assert_eq!(report.affected.len(), 1);
    assert!(corpus.eaf().tier("GLOSA").unwrap().annotation("a3").is_some());
}

// ─── Batch ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn batch_embed_covers_videos_with_interactive_additions() {
    let corpus = corpus();
    batch::parse_all(&corpus.engine).await.unwrap();
    corpus.engine.add(&ctx(), &add("EXPR", "frown", 600, 900)).await.unwrap();

    let embedded = batch::embed_all(&corpus.engine).await.unwrap();
    assert_eq!(
        embedded,
        BatchSummary {
            processed: 1,
            skipped: 1,
            failed: 0
        }
    );
    batch::reindex_all(&corpus.engine).await.unwrap();

    let mut indexed: Vec<_> = corpus.index.documents.lock().unwrap().keys().cloned().collect();
    indexed.sort();
    assert_eq!(indexed, vec!["9_a1", "9_a5"]);

    let again = batch::embed_all(&corpus.engine).await.unwrap();
    assert_eq!(again.processed, 0);
    assert_eq!(again.skipped, 2);
}

// ─── Rating ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn rating_touches_only_the_annotation_store() {
    let corpus = corpus();
    let report = corpus.engine.rate(&ctx(), "EXPR", "a1", 4).await.unwrap();
    assert_eq!(
        report.trail,
        vec![
            OperationState::Requested,
            OperationState::JsonUpdated,
            OperationState::DerivedArtifactsUpdated,
            OperationState::Committed
        ]
    );
    let doc = corpus.store().load(VIDEO).unwrap();
    assert_eq!(doc.annotation("EXPR", "a1").unwrap().user_rating, Some(4));
    assert_eq!(std::fs::read_to_string(corpus.eaf_path()).unwrap(), EAF);

    let err = corpus.engine.rate(&ctx(), "EXPR", "a1", 9).await.unwrap_err();
    assert!(matches!(err, CorpusError::InvalidRequest(_)), "{err}");
}

// ─── Failure semantics ───────────────────────────────────────────────────────

#[tokio::test]
async fn slow_collaborator_commits_with_warning() {
    let corpus = corpus_with(
        |s| s.external_timeout = Duration::from_millis(50),
        Some(Duration::from_millis(500)),
    );
    let report = corpus.engine.add(&ctx(), &add("EXPR", "frown", 600, 900)).await.unwrap();

    assert!(!report.derived_synced);
    assert!(!report.warnings.is_empty());
    assert!(!report.trail.contains(&OperationState::DerivedArtifactsUpdated));
    assert_eq!(report.trail.last(), Some(&OperationState::Committed));

    let doc = corpus.store().load(VIDEO).unwrap();
    assert!(doc.annotation("EXPR", "a5").is_ok());
    assert!(!corpus.index.documents.lock().unwrap().contains_key("9_a5"));
}

#[tokio::test]
async fn json_write_failure_after_eaf_write_reports_divergence() {
    let corpus = corpus_with(|s| s.annotations_dir = s.eaf_dir.join(format!("{VIDEO}.eaf")), None);
    let err = corpus.engine.add(&ctx(), &add("EXPR", "frown", 600, 900)).await.unwrap_err();

    assert!(matches!(err, CorpusError::StoresDiverged { .. }), "{err}");
    assert!(!err.is_rejection());
    // the EAF half of the commit landed
    assert!(corpus.eaf().annotation_ids().contains("a5"));
    assert!(corpus.events().is_empty());
}
