//! Pipeline driver: ordered stages over a document base.
//!
//! A pipeline executes its stages attribute by attribute, in attribute
//! registration order, never interleaved: confirmed matches on one
//! attribute can introduce nuggets that later attributes see. Before
//! anything runs, the driver simulates signal availability stage by stage
//! and rejects the pipeline with [`CoreError::MissingSignal`] if any stage's
//! requirement would be absent, so a misconfigured pipeline never mutates
//! the base.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::data::DocumentBase;
use crate::error::{CoreError, Result};
use crate::interaction::InteractionCallback;
use crate::statistics::Statistics;
use crate::status::StatusCallback;

/// Cooperative cancellation flag shared between the driver and its caller.
///
/// Checked at the start of every stage run and after every interaction
/// round; an answer that arrives after cancellation is discarded.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// The signals a stage requires or produces, per entity kind.
///
/// A nugget/document signal is considered available only when every nugget
/// or document carries it; an attribute signal when every attribute does.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalContract {
    /// Signal identifiers on nuggets.
    pub nuggets: &'static [&'static str],
    /// Signal identifiers on attributes.
    pub attributes: &'static [&'static str],
    /// Signal identifiers on documents.
    pub documents: &'static [&'static str],
}

/// Shared context handed to every stage run.
#[derive(Clone)]
pub struct StageContext {
    /// Callback for user feedback requests.
    pub interaction: Arc<dyn InteractionCallback>,
    /// Callback for progress updates.
    pub status: Arc<dyn StatusCallback>,
    /// Cooperative cancellation flag.
    pub cancel: CancelToken,
    /// Seed all stage-level randomness derives from.
    pub seed: u64,
}

/// One unit of work in a pipeline, executed once per attribute.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// Stable identifier used in configuration and statistics.
    fn identifier(&self) -> &'static str;

    /// Signals that must be present before this stage runs.
    fn required_signals(&self) -> SignalContract {
        SignalContract::default()
    }

    /// Signals this stage writes.
    fn produced_signals(&self) -> SignalContract {
        SignalContract::default()
    }

    /// Run the stage for the attribute at `attribute_index`.
    async fn run(
        &self,
        base: &mut DocumentBase,
        attribute_index: usize,
        ctx: &StageContext,
        statistics: &mut Statistics,
    ) -> Result<()>;
}

/// Descriptor for one stage in a serialized pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Identifier of the stage to construct.
    pub identifier: String,
    /// Stage-specific options.
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl StageConfig {
    /// A descriptor with no options.
    pub fn bare(identifier: impl Into<String>) -> Self {
        Self { identifier: identifier.into(), options: serde_json::Map::new() }
    }
}

/// Serialized description of a whole pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Seed for all stage-level randomness.
    #[serde(default)]
    pub seed: u64,
    /// Stage descriptors in execution order.
    pub stages: Vec<StageConfig>,
}

/// An ordered list of stages executed attribute by attribute.
pub struct Pipeline {
    stages: Vec<Box<dyn PipelineStage>>,
    seed: u64,
}

impl Pipeline {
    /// Create a pipeline from stages and a seed.
    pub fn new(stages: Vec<Box<dyn PipelineStage>>, seed: u64) -> Self {
        Self { stages, seed }
    }

    /// Create a new [`PipelineBuilder`].
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// The stages of this pipeline, in execution order.
    pub fn stages(&self) -> &[Box<dyn PipelineStage>] {
        &self.stages
    }

    /// Verify the signal contracts of every stage against the base.
    ///
    /// Walks the stages in order, starting from the signals actually present
    /// on the base and accumulating each stage's produced signals.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MissingSignal`] for the first requirement that
    /// would not be met. Nothing is mutated.
    pub fn verify(&self, base: &DocumentBase) -> Result<()> {
        let mut nuggets = covered_nugget_signals(base);
        let mut attributes = covered_attribute_signals(base);
        let mut documents = covered_document_signals(base);

        for stage in &self.stages {
            let required = stage.required_signals();
            check_available(&nuggets, required.nuggets, "nuggets", stage.identifier())?;
            check_available(&attributes, required.attributes, "attributes", stage.identifier())?;
            check_available(&documents, required.documents, "documents", stage.identifier())?;

            let produced = stage.produced_signals();
            extend_coverage(&mut nuggets, produced.nuggets);
            extend_coverage(&mut attributes, produced.attributes);
            extend_coverage(&mut documents, produced.documents);
        }
        Ok(())
    }

    /// Execute the pipeline over the base.
    ///
    /// The base gets one consistency pass (offsets, back-references, signal
    /// kinds) and the signal contracts are verified before the first stage
    /// runs. Then, for each attribute in registration order, every stage
    /// runs to completion before the next attribute starts. Step statistics
    /// (per attribute, per stage) and status updates are emitted along the
    /// way.
    ///
    /// # Errors
    ///
    /// Returns the first stage error. [`CoreError::UserCancelled`] is the
    /// cooperative outcome: the base keeps all partial results.
    pub async fn run(
        &self,
        base: &mut DocumentBase,
        interaction: Arc<dyn InteractionCallback>,
        status: Arc<dyn StatusCallback>,
        statistics: &mut Statistics,
        cancel: CancelToken,
    ) -> Result<()> {
        base.validate()?;
        self.verify(base)?;

        statistics.record("num_documents", base.documents().len());
        statistics.record("num_nuggets", base.nugget_count());
        statistics.record("seed", self.seed);

        let ctx = StageContext {
            interaction,
            status: Arc::clone(&status),
            cancel: cancel.clone(),
            seed: self.seed,
        };

        let total = base.attributes().len();
        for attribute_index in 0..total {
            let attribute = base.attributes()[attribute_index].name().to_string();
            info!(attribute = %attribute, "matching attribute");
            statistics.enter(&attribute);

            for stage in &self.stages {
                if cancel.is_cancelled() {
                    statistics.record("cancelled", true);
                    statistics.leave();
                    return Err(CoreError::UserCancelled);
                }

                status.emit(
                    stage.identifier(),
                    Some(attribute_index as f32 / total as f32),
                    &format!("running for attribute '{attribute}'"),
                );

                statistics.enter(stage.identifier());
                let started = Instant::now();
                let result = stage.run(base, attribute_index, &ctx, statistics).await;
                statistics.record("runtime_ms", started.elapsed().as_millis() as u64);
                statistics.leave();

                if let Err(err) = result {
                    if matches!(err, CoreError::UserCancelled) {
                        statistics.record("cancelled", true);
                    }
                    statistics.leave();
                    return Err(err);
                }
            }

            statistics.leave();
        }

        status.emit("pipeline", Some(1.0), "pipeline finished");
        Ok(())
    }
}

/// Builder for a [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Box<dyn PipelineStage>>,
    seed: u64,
}

impl PipelineBuilder {
    /// Append a stage.
    pub fn stage(mut self, stage: Box<dyn PipelineStage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Set the randomness seed (default 0).
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Build the pipeline.
    pub fn build(self) -> Pipeline {
        Pipeline::new(self.stages, self.seed)
    }
}

/// Signal availability for one entity kind. `None` means there are no
/// entities of that kind, so every requirement holds vacuously.
type Coverage = Option<HashSet<String>>;

fn check_available(
    available: &Coverage,
    required: &[&str],
    entity: &str,
    stage: &str,
) -> Result<()> {
    let Some(available) = available else { return Ok(()) };
    for signal in required {
        if !available.contains(*signal) {
            return Err(CoreError::MissingSignal {
                entity: entity.to_string(),
                signal: signal.to_string(),
                stage: stage.to_string(),
            });
        }
    }
    Ok(())
}

fn extend_coverage(coverage: &mut Coverage, produced: &[&str]) {
    if let Some(available) = coverage {
        available.extend(produced.iter().map(|s| s.to_string()));
    }
}

fn intersect_signal_ids<'a, I>(maps: I) -> Coverage
where
    I: Iterator<Item = &'a crate::signals::SignalMap>,
{
    let mut result: Coverage = None;
    for map in maps {
        let ids: HashSet<String> = map.iter().map(|(id, _)| id.to_string()).collect();
        result = Some(match result {
            None => ids,
            Some(acc) => acc.intersection(&ids).cloned().collect(),
        });
    }
    result
}

fn covered_nugget_signals(base: &DocumentBase) -> Coverage {
    intersect_signal_ids(base.nuggets().map(|(_, n)| &n.signals))
}

fn covered_attribute_signals(base: &DocumentBase) -> Coverage {
    intersect_signal_ids(base.attributes().iter().map(|a| &a.signals))
}

fn covered_document_signals(base: &DocumentBase) -> Coverage {
    intersect_signal_ids(base.documents().iter().map(|d| &d.signals))
}
