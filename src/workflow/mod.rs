/// Process Definition Layer
///
/// This module handles BPMN process definitions:
/// - Type definitions (ProcessDefinition, Element, SequenceFlow)
/// - XML graph builder
/// - Lock-free model registry using ArcSwap

// Core element and graph type definitions
pub mod types;

// BPMN XML parser (graph builder)
pub mod parser;

// Registry of loaded models keyed by file name
pub mod registry;

// Re-export commonly used types
pub use parser::parse_definition;
pub use registry::{LoadedModel, ModelRegistry};
pub use types::{Element, ProcessDefinition, SequenceFlow, Task, TaskKind};
