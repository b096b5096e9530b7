/// Runtime Execution Layer
///
/// This module moves tokens through process graphs:
/// - Token engine (one step at a time, LIFO token stack)
/// - Restricted condition evaluator for sequence flows
/// - Connectors for task side effects
/// - Instance lifecycle, replay and user-task waits
/// - Scheduler running each instance as its own tokio task
/// - Variable search over live instances

// Token step algorithm
pub mod engine;

// Sequence flow condition language
pub mod condition;

// Connector trait and HTTP connector
pub mod executor;

// Instance run loop, snapshots and replay
pub mod instance;

// Instance registry, spawning and restart recovery
pub mod scheduler;

// Query index over instance variables
pub mod search;

// Re-export main types
pub use engine::{ExecutionState, StepOutcome, TokenEngine};
pub use executor::{Connector, HttpConnector};
pub use instance::{InstanceHandle, InstanceManager, InstanceSnapshot, InstanceStatus, ProcessInstance, UserFormMessage};
pub use scheduler::InstanceScheduler;
