/// Engine error taxonomy
///
/// Every public operation of the engine returns one of these variants instead of
/// panicking. Condition failures never surface here; they degrade to `false`
/// inside the condition evaluator.
use thiserror::Error;

/// Errors reported by the process engine and its service facade
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed or unsupported process definition
    #[error("Parse error: {0}")]
    Parse(String),

    /// Unknown instance, model or task id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Event append or registry update failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Malformed search query
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// A connector side effect failed while running a task
    #[error("Task execution failed: {0}")]
    TaskExecution(String),
}

impl EngineError {
    /// Short machine-readable code used in API error payloads
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Parse(_) => "parse_error",
            EngineError::NotFound(_) => "not_found",
            EngineError::Persistence(_) => "persistence_error",
            EngineError::InvalidQuery(_) => "invalid_query",
            EngineError::TaskExecution(_) => "task_execution_error",
        }
    }

    pub(crate) fn persistence(err: anyhow::Error) -> Self {
        EngineError::Persistence(format!("{:#}", err))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
