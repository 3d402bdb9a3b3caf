//! Core model and contracts for the weft pipeline engine
//!
//! This crate holds everything the executor and the run stores agree on:
//! the pipeline/run data model, the structural graph, static validation,
//! template resolution, the expression language, the event schema, and
//! the service seams the engine consumes. Nothing here performs I/O
//! beyond what an injected service does.

pub mod config;
pub mod error;
pub mod event;
pub mod expr;
pub mod graph;
pub mod resolver;
pub mod traits;
pub mod types;
pub mod validator;
pub mod vars;

pub use config::EngineConfig;
pub use error::{
    EngineError, StepError, StoreError, ValidationError, ValidationReport,
};
pub use event::{Event, EventPayload, Topic};
pub use graph::PipelineGraph;
pub use types::{
    Pipeline, Run, RunOptions, RunState, RunSummary, Step, StepKind, StepRun, StepRunState,
};
pub use vars::VariableStore;
