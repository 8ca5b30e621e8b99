#![warn(missing_docs)]
//! Core data model and infrastructure for the tabula matching engine.
//!
//! Tabula turns an unstructured collection of text documents into a
//! structured table whose columns are user-supplied attributes. This crate
//! holds the pieces every engine component shares: the document/nugget/
//! attribute data model, the typed signal store attached to each entity, the
//! BSON persistence codec, the statistics recorder, the process-wide
//! resource manager, the user interaction and status callback protocols,
//! and the pipeline driver that executes stages attribute by attribute.
//!
//! The matching stages themselves live in `tabula-match`.

pub mod codec;
pub mod data;
pub mod error;
pub mod interaction;
pub mod pipeline;
pub mod resources;
pub mod signals;
pub mod statistics;
pub mod status;

pub use data::{Attribute, CellState, Document, DocumentBase, Nugget, Table, TableRow};
pub use error::{CoreError, Result};
pub use interaction::{InteractionCallback, InteractionRequest, MatchFeedback, NoInteraction, SpanCandidate};
pub use pipeline::{
    CancelToken, Pipeline, PipelineBuilder, PipelineConfig, PipelineStage, SignalContract,
    StageConfig, StageContext,
};
pub use resources::{Resource, ResourceManager, ResourceScope, StopwordsResource};
pub use signals::{SignalMap, SignalValue, ValueTag};
pub use statistics::Statistics;
pub use status::{NoStatus, StatusCallback, TracingStatus};
