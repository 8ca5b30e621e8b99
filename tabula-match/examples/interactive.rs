//! # Interactive Matching Example
//!
//! Builds a small document base, runs the four matching stages with a
//! scripted "user", and prints the resulting table. Embeddings come from a
//! deterministic hash-based mock, so the example runs with **zero API
//! keys**; the resource manager holds custody of the embedder the way a
//! real deployment would hold the embedding model.
//!
//! Run: `cargo run --example interactive`

use std::sync::Arc;

use async_trait::async_trait;
use tabula_core::codec;
use tabula_core::data::{Attribute, Document, DocumentBase, Nugget};
use tabula_core::interaction::{InteractionCallback, InteractionRequest, MatchFeedback};
use tabula_core::pipeline::CancelToken;
use tabula_core::resources::ResourceManager;
use tabula_core::signals::{ids, SignalValue};
use tabula_core::status::TracingStatus;
use tabula_core::Statistics;
use tabula_match::{matching_pipeline, EmbedderResource, EmbeddingProvider, MatcherConfig};

// ---------------------------------------------------------------------------
// MockEmbedder — deterministic hash-based embeddings for demos/tests
// ---------------------------------------------------------------------------

struct MockEmbedder {
    dimensions: usize,
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    async fn embed(&self, text: &str) -> tabula_match::Result<Vec<f32>> {
        // Deterministic embedding: hash the lowercased words, then build a
        // normalised vector whose direction depends on the content.
        let hash = text
            .to_lowercase()
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        let mut embedding = vec![0.0f32; self.dimensions];
        for (i, value) in embedding.iter_mut().enumerate() {
            *value = ((hash.wrapping_add(i as u64 * 0x9E37)) as f32).sin();
        }
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            embedding.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

// ---------------------------------------------------------------------------
// Scripted user — confirms close proposals, gives up on distant ones
// ---------------------------------------------------------------------------

struct ScriptedUser;

#[async_trait]
impl InteractionCallback for ScriptedUser {
    async fn ask(&self, request: InteractionRequest) -> MatchFeedback {
        match request {
            InteractionRequest::ConfirmProposal { document_name, proposal, .. } => {
                println!(
                    "  user asked about '{document_name}' (distance {:.3})",
                    proposal.distance
                );
                if proposal.distance < 0.8 {
                    MatchFeedback::Confirm { nugget_index: proposal.nugget_index }
                } else {
                    MatchFeedback::NoMatch
                }
            }
            InteractionRequest::ChooseFromShortlist { candidates, .. } => {
                MatchFeedback::Confirm { nugget_index: candidates[0].nugget_index }
            }
            InteractionRequest::PickSpan { document_name, .. } => {
                println!("  user skipped span picking for '{document_name}'");
                MatchFeedback::NoMatch
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

async fn embed_nuggets(
    base: &mut DocumentBase,
    embedder: &dyn EmbeddingProvider,
) -> anyhow::Result<()> {
    // Stand-in for the extractor stage: every nugget arrives with its
    // surface-text embedding already attached.
    for doc_ix in 0..base.documents().len() {
        for nugget_ix in 0..base.documents()[doc_ix].nuggets().len() {
            let text = {
                let doc = &base.documents()[doc_ix];
                doc.nuggets()[nugget_ix].text(doc).to_string()
            };
            let embedding = embedder.embed(&text).await?;
            base.documents_mut()[doc_ix].nuggets_mut()[nugget_ix]
                .signals
                .set(ids::TEXT_EMBEDDING, SignalValue::FloatVec(embedding));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    // -- 1. The resource manager holds the embedder for the process -------
    let scope = ResourceManager::open();
    ResourceManager::register(EmbedderResource::IDENTIFIER, || {
        Ok(Arc::new(EmbedderResource::new(Arc::new(MockEmbedder { dimensions: 64 }))))
    });
    let resource = ResourceManager::get(EmbedderResource::IDENTIFIER)?;
    let embedder = resource
        .as_any()
        .downcast_ref::<EmbedderResource>()
        .expect("embedder resource")
        .provider();

    // -- 2. Build a document base with pre-extracted nuggets --------------
    let mut doc1 = Document::new("apple.txt", "Tim Cook is the chief executive of Apple.");
    doc1.push_nugget(Nugget::new(0, 0, 8)); // "Tim Cook"
    doc1.push_nugget(Nugget::new(0, 35, 40)); // "Apple"
    let mut doc2 = Document::new("tesla.txt", "Elon Musk runs Tesla from Austin.");
    doc2.push_nugget(Nugget::new(1, 0, 9)); // "Elon Musk"
    doc2.push_nugget(Nugget::new(1, 15, 20)); // "Tesla"
    let doc3 = Document::new("memo.txt", "Quarterly revenue exceeded projections.");

    let mut ceo = Attribute::new("ceo");
    ceo.signals.set(ids::LABEL, SignalValue::Text("chief executive officer".into()));

    let mut base = DocumentBase::new(vec![doc1, doc2, doc3], vec![ceo])?;
    embed_nuggets(&mut base, embedder.as_ref()).await?;

    // -- 3. Run the matching pipeline --------------------------------------
    let config = MatcherConfig::builder().max_feedback(5).build()?;
    let pipeline = matching_pipeline(Arc::clone(&embedder), config, 42);
    let mut statistics = Statistics::new();
    pipeline
        .run(
            &mut base,
            Arc::new(ScriptedUser),
            Arc::new(TracingStatus),
            &mut statistics,
            CancelToken::new(),
        )
        .await?;

    // -- 4. Print the resulting table --------------------------------------
    let table = base.to_table();
    println!("\n| document | {} |", table.attributes.join(" | "));
    for row in &table.rows {
        let cells: Vec<String> = row
            .cells
            .iter()
            .map(|cell| cell.clone().unwrap_or_else(|| "—".to_string()))
            .collect();
        println!("| {} | {} |", row.document, cells.join(" | "));
    }

    // -- 5. Persist and reload ---------------------------------------------
    let bytes = codec::encode(&base)?;
    let reloaded = codec::decode(&bytes)?;
    println!(
        "\npersisted {} bytes, reloaded {} documents / {} nuggets",
        bytes.len(),
        reloaded.documents().len(),
        reloaded.nugget_count()
    );

    println!("\nstatistics:\n{}", serde_json::to_string_pretty(&statistics.snapshot())?);

    scope.close();
    Ok(())
}
