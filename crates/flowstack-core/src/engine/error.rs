//! Engine error taxonomy.
//!
//! Configuration errors are raised before any execution and leave no partial
//! state. Step and wave failures always carry the originating step ids so the
//! run ledger can record `error_step`. Infrastructure failures are recovered
//! locally through degraded modes; everything else reaches the run record.

use flowstack_types::error::RepositoryError;
use thiserror::Error;

/// Errors that can occur while validating or executing a workflow.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid cron expression or schedule string.
    #[error("invalid schedule '{schedule}': {reason}")]
    InvalidSchedule { schedule: String, reason: String },

    /// Malformed `category.module.function` path.
    #[error("{0}")]
    MalformedModulePath(#[from] flowstack_types::module::ModulePathError),

    /// A step references a module that was never registered.
    #[error("unknown module '{0}'")]
    UnknownModule(String),

    /// Two steps share the same id.
    #[error("duplicate step id: '{0}'")]
    DuplicateStepId(String),

    /// Two steps in the same wave publish under the same key.
    #[error("steps '{first}' and '{second}' both write output key '{key}' in the same wave")]
    DuplicateOutputKey {
        key: String,
        first: String,
        second: String,
    },

    /// The dependency graph contains a cycle. Every step that could not be
    /// scheduled is listed; no single culprit is guessed.
    #[error("circular dependency among steps: {}", steps.join(", "))]
    CircularDependency { steps: Vec<String> },

    /// A single step failed during execution.
    #[error("step '{step_id}' failed: {message}")]
    StepFailed { step_id: String, message: String },

    /// Multiple sibling steps failed in one wave.
    #[error("{} step(s) failed in wave: {}", failures.len(),
        failures.iter().map(|(id, msg)| format!("'{id}': {msg}")).collect::<Vec<_>>().join("; "))]
    WaveFailed { failures: Vec<(String, String)> },

    /// Queue or lock backend unreachable. Recovered locally via degraded
    /// modes (synchronous execution, assumed leadership) -- never fatal.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    /// Workflow not found in the store.
    #[error("workflow {0} not found")]
    WorkflowNotFound(uuid::Uuid),

    /// Persistence failure from the workflow store.
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl EngineError {
    /// The failing step id, when the error is attributable to one step.
    ///
    /// For wave aggregates the first failing step is reported (the full list
    /// stays in the message).
    pub fn step_id(&self) -> Option<&str> {
        match self {
            EngineError::StepFailed { step_id, .. } => Some(step_id),
            EngineError::WaveFailed { failures } => {
                failures.first().map(|(id, _)| id.as_str())
            }
            _ => None,
        }
    }

    /// Whether this error was raised before any execution started.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidSchedule { .. }
                | EngineError::MalformedModulePath(_)
                | EngineError::UnknownModule(_)
                | EngineError::DuplicateStepId(_)
                | EngineError::DuplicateOutputKey { .. }
                | EngineError::CircularDependency { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
