#![warn(missing_docs)]
//! Interactive matching engine for tabula.
//!
//! Given a document base whose nuggets already carry embeddings (the
//! extractor stage's contract), this crate decides which nugget, if any,
//! populates each cell of an attribute's column while consuming a small
//! amount of user feedback. Ranking starts from the distance to the
//! attribute's embedded label; every confirmed positive pulls its semantic
//! neighborhood closer, and the distance threshold adapts to the recorded
//! feedback after every round.
//!
//! The engine is packaged as four [`tabula_core::PipelineStage`]s;
//! see [`stages::matching_pipeline`] for the standard arrangement.

pub mod config;
pub mod distance;
pub mod embedding;
pub mod error;
mod matcher;
pub mod stages;
pub mod threshold;

pub use config::{MatcherConfig, MatcherConfigBuilder};
pub use distance::{
    cosine_distance, effective_distance, Distance, SignalBlendDistance, TextEmbeddingDistance,
};
pub use embedding::{embed_with_retry, EmbedderResource, EmbeddingProvider, HttpEmbedder};
pub use error::{MatchError, Result};
pub use matcher::RoundState;
pub use stages::{
    matching_pipeline, pipeline_from_config, stage_from_config, ComputeInitialDistancesStage,
    EmbedAttributeStage, FinalizeCellsStage, InteractiveFeedbackLoopStage,
};
pub use threshold::ThresholdAdaptor;
