//! The four matching pipeline stages and their configuration registry.
//!
//! Run in order per attribute: `embed-attribute` →
//! `compute-initial-distances` → `interactive-feedback-loop` →
//! `finalize-cells`. Each declares the signals it requires and produces; the
//! pipeline driver enforces the contracts before anything runs.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use tabula_core::data::DocumentBase;
use tabula_core::error::{CoreError, Result};
use tabula_core::pipeline::{
    Pipeline, PipelineConfig, PipelineStage, SignalContract, StageConfig, StageContext,
};
use tabula_core::signals::{ids, SignalValue};
use tabula_core::statistics::Statistics;

use crate::config::MatcherConfig;
use crate::distance::{Distance, SignalBlendDistance, TextEmbeddingDistance};
use crate::embedding::{embed_with_retry, EmbeddingProvider};
use crate::error::MatchError;
use crate::matcher;

/// Stage that embeds an attribute's label and memoizes it on the attribute.
///
/// The label comes from the attribute's `label` signal, falling back to the
/// attribute name. An attribute whose label is empty cannot be embedded and
/// is a configuration error.
pub struct EmbedAttributeStage {
    embedder: Arc<dyn EmbeddingProvider>,
}

impl EmbedAttributeStage {
    /// Create the stage with the embedding provider to use.
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl PipelineStage for EmbedAttributeStage {
    fn identifier(&self) -> &'static str {
        "embed-attribute"
    }

    fn produced_signals(&self) -> SignalContract {
        SignalContract { attributes: &[ids::TEXT_EMBEDDING], ..Default::default() }
    }

    async fn run(
        &self,
        base: &mut DocumentBase,
        attribute_index: usize,
        _ctx: &StageContext,
        statistics: &mut Statistics,
    ) -> Result<()> {
        let attribute = &base.attributes()[attribute_index];
        if attribute.signals.contains(ids::TEXT_EMBEDDING) {
            debug!(attribute = attribute.name(), "attribute embedding already present");
            statistics.record("memoized", true);
            return Ok(());
        }

        let label = attribute
            .signals
            .text(ids::LABEL)
            .unwrap_or_else(|| attribute.name())
            .trim()
            .to_string();
        if label.is_empty() {
            return Err(CoreError::MissingSignal {
                entity: format!("attribute '{}'", attribute.name()),
                signal: ids::LABEL.into(),
                stage: self.identifier().into(),
            });
        }

        let embedding = embed_with_retry(self.embedder.as_ref(), &[label.as_str()])
            .await
            .map_err(CoreError::from)?
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::EmbeddingFailure {
                cause: format!("provider returned no embedding for label '{label}'"),
            })?;

        base.attributes_mut()[attribute_index]
            .signals
            .set(ids::TEXT_EMBEDDING, SignalValue::FloatVec(embedding));
        statistics.record("label", label);
        Ok(())
    }
}

/// Stage that computes the label-based distances and initial proposals.
pub struct ComputeInitialDistancesStage {
    distance: Arc<dyn Distance>,
}

impl ComputeInitialDistancesStage {
    /// Create the stage with the distance function to rank with.
    pub fn new(distance: Arc<dyn Distance>) -> Self {
        Self { distance }
    }
}

#[async_trait]
impl PipelineStage for ComputeInitialDistancesStage {
    fn identifier(&self) -> &'static str {
        "compute-initial-distances"
    }

    fn required_signals(&self) -> SignalContract {
        SignalContract {
            nuggets: &[ids::TEXT_EMBEDDING],
            attributes: &[ids::TEXT_EMBEDDING],
            ..Default::default()
        }
    }

    fn produced_signals(&self) -> SignalContract {
        SignalContract {
            nuggets: &[ids::CACHED_DISTANCE],
            documents: &[ids::CURRENTLY_HIGHEST_RANKED],
            ..Default::default()
        }
    }

    async fn run(
        &self,
        base: &mut DocumentBase,
        attribute_index: usize,
        _ctx: &StageContext,
        statistics: &mut Statistics,
    ) -> Result<()> {
        matcher::compute_initial_ranking(base, attribute_index, self.distance.as_ref(), statistics)
    }
}

/// Stage that runs the interactive feedback loop for one attribute.
pub struct InteractiveFeedbackLoopStage {
    distance: Arc<dyn Distance>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: MatcherConfig,
}

impl InteractiveFeedbackLoopStage {
    /// Create the stage with its distance function, embedding provider (for
    /// custom spans), and matcher configuration.
    pub fn new(
        distance: Arc<dyn Distance>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: MatcherConfig,
    ) -> Self {
        Self { distance, embedder, config }
    }
}

#[async_trait]
impl PipelineStage for InteractiveFeedbackLoopStage {
    fn identifier(&self) -> &'static str {
        "interactive-feedback-loop"
    }

    fn required_signals(&self) -> SignalContract {
        SignalContract {
            nuggets: &[ids::TEXT_EMBEDDING, ids::CACHED_DISTANCE],
            attributes: &[ids::TEXT_EMBEDDING],
            ..Default::default()
        }
    }

    fn produced_signals(&self) -> SignalContract {
        SignalContract { attributes: &[ids::MAX_DISTANCE], ..Default::default() }
    }

    async fn run(
        &self,
        base: &mut DocumentBase,
        attribute_index: usize,
        ctx: &StageContext,
        statistics: &mut Statistics,
    ) -> Result<()> {
        matcher::run_feedback_loop(
            base,
            attribute_index,
            self.distance.as_ref(),
            self.embedder.as_ref(),
            &self.config,
            ctx,
            statistics,
        )
        .await
    }
}

/// Stage that decides every remaining cell by applying the threshold.
#[derive(Debug, Clone, Copy, Default)]
pub struct FinalizeCellsStage;

#[async_trait]
impl PipelineStage for FinalizeCellsStage {
    fn identifier(&self) -> &'static str {
        "finalize-cells"
    }

    fn required_signals(&self) -> SignalContract {
        SignalContract {
            nuggets: &[ids::CACHED_DISTANCE],
            attributes: &[ids::MAX_DISTANCE],
            ..Default::default()
        }
    }

    async fn run(
        &self,
        base: &mut DocumentBase,
        attribute_index: usize,
        _ctx: &StageContext,
        statistics: &mut Statistics,
    ) -> Result<()> {
        matcher::finalize_cells(base, attribute_index, statistics)
    }
}

/// Build the standard four-stage matching pipeline.
pub fn matching_pipeline(
    embedder: Arc<dyn EmbeddingProvider>,
    config: MatcherConfig,
    seed: u64,
) -> Pipeline {
    let distance: Arc<dyn Distance> = Arc::new(TextEmbeddingDistance);
    Pipeline::builder()
        .seed(seed)
        .stage(Box::new(EmbedAttributeStage::new(Arc::clone(&embedder))))
        .stage(Box::new(ComputeInitialDistancesStage::new(Arc::clone(&distance))))
        .stage(Box::new(InteractiveFeedbackLoopStage::new(distance, embedder, config)))
        .stage(Box::new(FinalizeCellsStage))
        .build()
}

/// Construct a distance function from its configuration identifier.
fn distance_from_name(name: &str) -> crate::error::Result<Arc<dyn Distance>> {
    match name {
        "text-embedding-distance" => Ok(Arc::new(TextEmbeddingDistance)),
        "signal-blend-distance" => Ok(Arc::new(SignalBlendDistance)),
        other => Err(MatchError::Config(format!("unknown distance '{other}'"))),
    }
}

/// Construct one stage from its descriptor.
///
/// Recognized identifiers: `embed-attribute`, `compute-initial-distances`,
/// `interactive-feedback-loop`, `finalize-cells`. The distance-based stages
/// accept a `distance` option; the feedback loop additionally accepts every
/// [`MatcherConfig`] field.
pub fn stage_from_config(
    config: &StageConfig,
    embedder: &Arc<dyn EmbeddingProvider>,
) -> crate::error::Result<Box<dyn PipelineStage>> {
    let distance = match config.options.get("distance") {
        Some(value) => {
            let name = value.as_str().ok_or_else(|| {
                MatchError::Config("stage option 'distance' must be a string".into())
            })?;
            distance_from_name(name)?
        }
        None => Arc::new(TextEmbeddingDistance) as Arc<dyn Distance>,
    };

    match config.identifier.as_str() {
        "embed-attribute" => Ok(Box::new(EmbedAttributeStage::new(Arc::clone(embedder)))),
        "compute-initial-distances" => Ok(Box::new(ComputeInitialDistancesStage::new(distance))),
        "interactive-feedback-loop" => {
            let mut options = config.options.clone();
            options.remove("distance");
            let matcher_config: MatcherConfig =
                serde_json::from_value(serde_json::Value::Object(options)).map_err(|e| {
                    MatchError::Config(format!("invalid feedback loop options: {e}"))
                })?;
            matcher_config.validate()?;
            Ok(Box::new(InteractiveFeedbackLoopStage::new(
                distance,
                Arc::clone(embedder),
                matcher_config,
            )))
        }
        "finalize-cells" => Ok(Box::new(FinalizeCellsStage)),
        other => Err(MatchError::Config(format!("unknown stage identifier '{other}'"))),
    }
}

/// Construct a whole pipeline from its serialized configuration.
///
/// # Errors
///
/// Returns [`MatchError::Config`] for unknown stage identifiers or invalid
/// options.
pub fn pipeline_from_config(
    config: &PipelineConfig,
    embedder: Arc<dyn EmbeddingProvider>,
) -> crate::error::Result<Pipeline> {
    let mut builder = Pipeline::builder().seed(config.seed);
    for stage in &config.stages {
        builder = builder.stage(stage_from_config(stage, &embedder)?);
    }
    Ok(builder.build())
}
