//! End-to-end tests for the interactive matching pipeline.
//!
//! The embedder is a lookup stub whose vectors realize hand-picked cosine
//! distances: with the attribute label `ceo` embedded as `A`, the nuggets
//! "Alice", "Bob", and "Tim Cook" sit at label distances 0.9, 0.85, and
//! 0.2, and "Tim Cook" sits at 0.7 / 0.5 from "Alice" / "Bob".

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tabula_core::data::{Attribute, CellState, Document, DocumentBase, Nugget};
use tabula_core::error::CoreError;
use tabula_core::interaction::{InteractionCallback, InteractionRequest, MatchFeedback};
use tabula_core::pipeline::CancelToken;
use tabula_core::signals::{ids, SignalValue};
use tabula_core::status::NoStatus;
use tabula_core::Statistics;
use tabula_match::{matching_pipeline, EmbeddingProvider, MatcherConfig};

fn label_vec() -> Vec<f32> {
    vec![1.0, 0.0, 0.0, 0.0]
}

fn tim_cook_vec() -> Vec<f32> {
    vec![0.8, 0.6, 0.0, 0.0]
}

fn alice_vec() -> Vec<f32> {
    vec![0.1, 0.366_667, 0.924_963, 0.0]
}

fn bob_vec() -> Vec<f32> {
    vec![0.15, 0.633_333, 0.273_284, 0.708_311]
}

/// Embedder that serves embeddings from a fixed text -> vector table.
struct LookupEmbedder {
    table: HashMap<String, Vec<f32>>,
}

impl LookupEmbedder {
    fn standard() -> Self {
        let mut table = HashMap::new();
        table.insert("ceo".to_string(), label_vec());
        table.insert("Alice Liddell, Founder".to_string(), bob_vec());
        Self { table }
    }
}

#[async_trait]
impl EmbeddingProvider for LookupEmbedder {
    async fn embed(&self, text: &str) -> tabula_match::Result<Vec<f32>> {
        self.table.get(text).cloned().ok_or_else(|| tabula_match::MatchError::Embedding {
            provider: "lookup".into(),
            message: format!("no embedding scripted for '{text}'"),
        })
    }

    fn dimensions(&self) -> usize {
        4
    }
}

/// Callback that replays a scripted answer sequence and logs every request.
/// Once the script runs out it answers `Stop`.
struct ScriptedCallback {
    answers: Mutex<VecDeque<MatchFeedback>>,
    log: Arc<Mutex<Vec<InteractionRequest>>>,
}

impl ScriptedCallback {
    fn new(answers: Vec<MatchFeedback>) -> (Arc<Self>, Arc<Mutex<Vec<InteractionRequest>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let callback = Arc::new(Self {
            answers: Mutex::new(answers.into_iter().collect()),
            log: Arc::clone(&log),
        });
        (callback, log)
    }
}

#[async_trait]
impl InteractionCallback for ScriptedCallback {
    async fn ask(&self, request: InteractionRequest) -> MatchFeedback {
        self.log.lock().unwrap().push(request);
        self.answers.lock().unwrap().pop_front().unwrap_or(MatchFeedback::Stop)
    }
}

fn embedded_nugget(doc_ix: usize, start: usize, end: usize, embedding: Vec<f32>) -> Nugget {
    let mut nugget = Nugget::new(doc_ix, start, end);
    nugget.signals.set(ids::TEXT_EMBEDDING, SignalValue::FloatVec(embedding));
    nugget.signals.set(ids::PROVENANCE, SignalValue::Text("stub-extractor".into()));
    nugget
}

/// Three documents, one candidate each: Alice (0.9), Bob (0.85), Tim Cook
/// (0.2), plus the `ceo` attribute.
fn ceo_base() -> DocumentBase {
    let mut doc1 = Document::new("doc-1", "Alice founded the company.");
    doc1.push_nugget(embedded_nugget(0, 0, 5, alice_vec()));
    let mut doc2 = Document::new("doc-2", "Bob chairs the board.");
    doc2.push_nugget(embedded_nugget(1, 0, 3, bob_vec()));
    let mut doc3 = Document::new("doc-3", "Tim Cook leads Apple.");
    doc3.push_nugget(embedded_nugget(2, 0, 8, tim_cook_vec()));

    let mut ceo = Attribute::new("ceo");
    ceo.signals.set(ids::LABEL, SignalValue::Text("ceo".into()));

    DocumentBase::new(vec![doc1, doc2, doc3], vec![ceo]).unwrap()
}

async fn run_with_answers(
    base: &mut DocumentBase,
    answers: Vec<MatchFeedback>,
) -> (Statistics, Arc<Mutex<Vec<InteractionRequest>>>) {
    let (callback, log) = ScriptedCallback::new(answers);
    let pipeline =
        matching_pipeline(Arc::new(LookupEmbedder::standard()), MatcherConfig::default(), 7);
    let mut statistics = Statistics::new();
    pipeline
        .run(base, callback, Arc::new(NoStatus), &mut statistics, CancelToken::new())
        .await
        .unwrap();
    (statistics, log)
}

fn cached_distance(base: &DocumentBase, doc_ix: usize, nugget_ix: usize) -> f64 {
    base.documents()[doc_ix].nuggets()[nugget_ix]
        .signals
        .float(ids::CACHED_DISTANCE)
        .expect("cached distance present")
}

#[tokio::test]
async fn cold_label_match_fills_only_the_close_nugget() {
    let mut base = ceo_base();
    let (_, log) = run_with_answers(&mut base, vec![]).await;

    // The best proposal (Tim Cook, 0.2) was offered once before the stop.
    let requests = log.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].document_index(), 2);

    assert_eq!(base.documents()[0].cell("ceo"), Some(&CellState::Empty));
    assert_eq!(base.documents()[1].cell("ceo"), Some(&CellState::Empty));
    assert_eq!(base.documents()[2].cell("ceo"), Some(&CellState::Matched(0)));

    let table = base.to_table();
    assert_eq!(table.rows[2].cells[0].as_deref(), Some("Tim Cook"));
    assert_eq!(table.rows[0].cells[0], None);
}

#[tokio::test]
async fn single_confirm_tightens_the_neighborhood() {
    let mut base = ceo_base();
    let (statistics, _) =
        run_with_answers(&mut base, vec![MatchFeedback::Confirm { nugget_index: 0 }]).await;

    // Effective distances after the confirm: min(label, to-Tim-Cook).
    assert!((cached_distance(&base, 0, 0) - 0.7).abs() < 1e-4);
    assert!((cached_distance(&base, 1, 0) - 0.5).abs() < 1e-4);
    assert!(cached_distance(&base, 2, 0).abs() < 1e-4);

    // With no negatives the threshold stays at the default, so the other
    // documents stay empty.
    assert_eq!(base.documents()[2].cell("ceo"), Some(&CellState::Matched(0)));
    assert_eq!(base.documents()[0].cell("ceo"), Some(&CellState::Empty));
    assert_eq!(base.documents()[1].cell("ceo"), Some(&CellState::Empty));

    let snapshot = statistics.snapshot();
    let loop_stats = &snapshot["ceo"]["interactive-feedback-loop"];
    assert_eq!(loop_stats["num_confirmed_match"], 1);
    assert!((loop_stats["final_max_distance"].as_f64().unwrap() - 0.35).abs() < 1e-9);
}

#[tokio::test]
async fn rejected_nugget_is_never_proposed_again() {
    let mut base = ceo_base();
    let (statistics, log) = run_with_answers(
        &mut base,
        vec![
            MatchFeedback::NoMatch,              // doc-3's Tim Cook proposal
            MatchFeedback::Reject { nugget_index: 0 }, // doc-2's Bob
            MatchFeedback::NoMatch,              // doc-2 span request
        ],
    )
    .await;

    let requests = log.lock().unwrap();
    assert_eq!(requests[0].document_index(), 2);
    assert_eq!(requests[1].document_index(), 1);
    // Bob was doc-2's only candidate; after the rejection the loop asks for
    // a hand-picked span instead of proposing Bob again.
    assert!(matches!(requests[2], InteractionRequest::PickSpan { document_index: 1, .. }));
    // Nothing afterwards concerns doc-2 again.
    for request in requests.iter().skip(3) {
        assert_ne!(request.document_index(), 1);
    }

    // With no positives the threshold stays at the default.
    let snapshot = statistics.snapshot();
    let loop_stats = &snapshot["ceo"]["interactive-feedback-loop"];
    assert_eq!(loop_stats["num_rejected"], 1);
    assert!((loop_stats["final_max_distance"].as_f64().unwrap() - 0.35).abs() < 1e-9);

    for doc in base.documents() {
        assert_eq!(doc.cell("ceo"), Some(&CellState::Empty));
    }
}

#[tokio::test]
async fn custom_span_becomes_a_confirmed_positive() {
    let mut doc0 = Document::new("doc-0", "Alice Liddell, Founder of Wonderland Inc.");
    // The extractors produced nothing for this document.
    assert!(doc0.nuggets().is_empty());
    let mut doc1 = Document::new("doc-1", "Bob chairs the board.");
    doc1.push_nugget(embedded_nugget(1, 0, 3, bob_vec()));
    let mut doc2 = Document::new("doc-2", "Tim Cook leads Apple.");
    doc2.push_nugget(embedded_nugget(2, 0, 8, tim_cook_vec()));
    let mut ceo = Attribute::new("ceo");
    ceo.signals.set(ids::LABEL, SignalValue::Text("ceo".into()));
    let mut base = DocumentBase::new(vec![doc0, doc1, doc2], vec![ceo]).unwrap();

    let (_, log) = run_with_answers(
        &mut base,
        vec![
            MatchFeedback::Confirm { nugget_index: 0 }, // Tim Cook in doc-2
            MatchFeedback::NoMatch,                     // Bob's document
            MatchFeedback::CustomSpan { start: 0, end: 22 },
        ],
    )
    .await;

    // The candidate-less document was offered for span picking last.
    let requests = log.lock().unwrap();
    assert!(matches!(requests[2], InteractionRequest::PickSpan { document_index: 0, .. }));

    // The span was synthesized into a nugget and confirmed.
    let doc0 = &base.documents()[0];
    assert_eq!(doc0.cell("ceo"), Some(&CellState::Matched(0)));
    let custom = &doc0.nuggets()[0];
    assert_eq!(custom.text(doc0), "Alice Liddell, Founder");
    assert_eq!(custom.signals.text(ids::PROVENANCE), Some("user"));
    assert!(custom.signals.vector(ids::TEXT_EMBEDDING).is_some());
    assert!(cached_distance(&base, 0, 0).abs() < 1e-9);

    // The new positive tightened the other documents' distances: Bob's
    // embedding coincides with the custom span's, so its distance folds
    // from 0.5 down to 0.
    assert!(cached_distance(&base, 1, 0).abs() < 1e-4);
}

#[tokio::test]
async fn missing_embeddings_are_rejected_before_any_mutation() {
    let mut doc = Document::new("doc-1", "Tim Cook leads Apple.");
    doc.push_nugget(Nugget::new(0, 0, 8)); // no text-embedding signal
    let mut ceo = Attribute::new("ceo");
    ceo.signals.set(ids::LABEL, SignalValue::Text("ceo".into()));
    let mut base = DocumentBase::new(vec![doc], vec![ceo]).unwrap();

    let (callback, _) = ScriptedCallback::new(vec![]);
    let pipeline =
        matching_pipeline(Arc::new(LookupEmbedder::standard()), MatcherConfig::default(), 7);
    let err = pipeline
        .run(&mut base, callback, Arc::new(NoStatus), &mut Statistics::new(), CancelToken::new())
        .await
        .unwrap_err();

    match err {
        CoreError::MissingSignal { entity, signal, stage } => {
            assert_eq!(entity, "nuggets");
            assert_eq!(signal, ids::TEXT_EMBEDDING);
            assert_eq!(stage, "compute-initial-distances");
        }
        other => panic!("expected MissingSignal, got {other:?}"),
    }

    // The pre-flight check fired before anything was touched.
    assert!(base.documents()[0].cell("ceo").is_none());
    assert!(base.attributes()[0].signals.get(ids::TEXT_EMBEDDING).is_none());
}

#[tokio::test]
async fn same_answers_and_seed_give_identical_state() {
    let answers =
        || vec![MatchFeedback::Confirm { nugget_index: 0 }, MatchFeedback::NoMatch];

    let mut first = ceo_base();
    run_with_answers(&mut first, answers()).await;
    let mut second = ceo_base();
    run_with_answers(&mut second, answers()).await;

    assert_eq!(first, second);
}

#[tokio::test]
async fn replaying_the_pipeline_over_decided_cells_changes_nothing() {
    let mut base = ceo_base();
    run_with_answers(&mut base, vec![MatchFeedback::Confirm { nugget_index: 0 }]).await;
    let decided = base.clone();

    // Every document already carries a cell, so a replay asks nothing and
    // rewrites nothing.
    let (_, log) =
        run_with_answers(&mut base, vec![MatchFeedback::Confirm { nugget_index: 0 }]).await;
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(base, decided);
}

#[tokio::test]
async fn shortlist_mode_offers_ranked_candidates() {
    let mut doc = Document::new("doc-1", "Tim Cook replaced Bob as chief executive.");
    doc.push_nugget(embedded_nugget(0, 0, 8, tim_cook_vec()));
    doc.push_nugget(embedded_nugget(0, 18, 21, bob_vec()));
    let mut ceo = Attribute::new("ceo");
    ceo.signals.set(ids::LABEL, SignalValue::Text("ceo".into()));
    let mut base = DocumentBase::new(vec![doc], vec![ceo]).unwrap();

    let (callback, log) =
        ScriptedCallback::new(vec![MatchFeedback::Confirm { nugget_index: 1 }]);
    let config = MatcherConfig::builder().shortlist_len(3).build().unwrap();
    let pipeline = matching_pipeline(Arc::new(LookupEmbedder::standard()), config, 7);
    pipeline
        .run(
            &mut base,
            callback,
            Arc::new(NoStatus),
            &mut Statistics::new(),
            CancelToken::new(),
        )
        .await
        .unwrap();

    let requests = log.lock().unwrap();
    match &requests[0] {
        InteractionRequest::ChooseFromShortlist { candidates, .. } => {
            assert_eq!(candidates.len(), 2);
            // Ordered by ascending distance: Tim Cook (0.2) before Bob (0.85).
            assert_eq!(candidates[0].nugget_index, 0);
            assert_eq!(candidates[1].nugget_index, 1);
            assert!(candidates[0].distance < candidates[1].distance);
        }
        other => panic!("expected shortlist request, got {other:?}"),
    }

    // The user confirmed the second-ranked candidate.
    assert_eq!(base.documents()[0].cell("ceo"), Some(&CellState::Matched(1)));
}

#[tokio::test]
async fn exploration_rounds_are_seed_deterministic() {
    let run = || async {
        let mut base = ceo_base();
        let (callback, log) = ScriptedCallback::new(vec![
            MatchFeedback::NoMatch,
            MatchFeedback::NoMatch,
            MatchFeedback::NoMatch,
        ]);
        let config = MatcherConfig::builder().explore_every(2).build().unwrap();
        let pipeline = matching_pipeline(Arc::new(LookupEmbedder::standard()), config, 99);
        pipeline
            .run(
                &mut base,
                callback,
                Arc::new(NoStatus),
                &mut Statistics::new(),
                CancelToken::new(),
            )
            .await
            .unwrap();
        let order: Vec<usize> =
            log.lock().unwrap().iter().map(|r| r.document_index()).collect();
        (base, order)
    };

    let (first_base, first_order) = run().await;
    let (second_base, second_order) = run().await;
    assert_eq!(first_order, second_order);
    assert_eq!(first_base, second_base);
}

/// Callback that cancels the run while the request is outstanding, then
/// answers anyway. The answer must be discarded.
struct CancelDuringAsk {
    token: CancelToken,
}

#[async_trait]
impl InteractionCallback for CancelDuringAsk {
    async fn ask(&self, _request: InteractionRequest) -> MatchFeedback {
        self.token.cancel();
        MatchFeedback::Confirm { nugget_index: 0 }
    }
}

#[tokio::test]
async fn cancellation_during_a_request_discards_the_answer() {
    let mut base = ceo_base();
    let token = CancelToken::new();
    let pipeline =
        matching_pipeline(Arc::new(LookupEmbedder::standard()), MatcherConfig::default(), 7);
    let err = pipeline
        .run(
            &mut base,
            Arc::new(CancelDuringAsk { token: token.clone() }),
            Arc::new(NoStatus),
            &mut Statistics::new(),
            token,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::UserCancelled));
    // The discarded confirm decided nothing; partial state stays consistent.
    assert!(base.documents()[2].cell("ceo").is_none());
    base.validate().unwrap();
}

/// Embedder that fails on the first call and succeeds afterwards.
struct FlakyEmbedder {
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for FlakyEmbedder {
    async fn embed(&self, _text: &str) -> tabula_match::Result<Vec<f32>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(tabula_match::MatchError::Embedding {
                provider: "flaky".into(),
                message: "transient outage".into(),
            });
        }
        Ok(label_vec())
    }

    fn dimensions(&self) -> usize {
        4
    }
}

#[tokio::test]
async fn embedding_failures_are_retried_once() {
    let mut base = ceo_base();
    let embedder = Arc::new(FlakyEmbedder { calls: AtomicUsize::new(0) });
    let pipeline = matching_pipeline(embedder.clone(), MatcherConfig::default(), 7);
    let (callback, _) = ScriptedCallback::new(vec![]);
    pipeline
        .run(&mut base, callback, Arc::new(NoStatus), &mut Statistics::new(), CancelToken::new())
        .await
        .unwrap();

    // First call failed, the retry embedded the attribute label.
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    assert!(base.attributes()[0].signals.vector(ids::TEXT_EMBEDDING).is_some());
}

/// Embedder that always fails; the retry must not mask it.
struct DownEmbedder;

#[async_trait]
impl EmbeddingProvider for DownEmbedder {
    async fn embed(&self, _text: &str) -> tabula_match::Result<Vec<f32>> {
        Err(tabula_match::MatchError::Embedding {
            provider: "down".into(),
            message: "connection refused".into(),
        })
    }

    fn dimensions(&self) -> usize {
        4
    }
}

#[tokio::test]
async fn persistent_embedding_failure_surfaces() {
    let mut base = ceo_base();
    let pipeline = matching_pipeline(Arc::new(DownEmbedder), MatcherConfig::default(), 7);
    let (callback, _) = ScriptedCallback::new(vec![]);
    let err = pipeline
        .run(&mut base, callback, Arc::new(NoStatus), &mut Statistics::new(), CancelToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::EmbeddingFailure { .. }));
}
