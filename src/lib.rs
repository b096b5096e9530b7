/// bpmnway: token-based BPMN process engine
///
/// This library loads BPMN 2.0 models, runs their instances as independent
/// tokio tasks, records every step to a durable event log and rebuilds
/// interrupted instances from that log on restart.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by every layer
pub mod error;

// Process definition layer - BPMN parsing and the model registry
pub mod workflow;

// Runtime execution engine - token stepping, instances and scheduling
pub mod runtime;

// Durable event log and running-instance registry
pub mod persistence;

// Transport-agnostic operations used by the HTTP layer
pub mod service;

// HTTP API layer - REST endpoints over the service facade
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{EngineError, EngineResult};
pub use runtime::{InstanceStatus, TokenEngine};
pub use server::start_server;
pub use service::ProcessService;
pub use workflow::{Element, ProcessDefinition};
