//! Weft pipeline execution engine
//!
//! Accepts a validated pipeline, plans it over the dependency graph,
//! executes steps with bounded concurrency, retries and timeouts,
//! streams per-step status over the event bus, and persists a durable
//! execution record through the injected run store.
//!
//! The engine exposes no transport of its own; an RPC server embeds
//! [`Engine`] and forwards authorized calls.

pub mod bus;
pub mod engine;
mod executor;
pub mod http;
pub mod recovery;
pub mod runners;
pub mod sandbox;

pub use bus::{EventBus, EventStream};
pub use engine::Engine;
pub use http::ReqwestHttpClient;
pub use recovery::Reaper;
pub use runners::{RunnerRegistry, Services, StepContext, StepRunner};
pub use sandbox::ProcessSandbox;
