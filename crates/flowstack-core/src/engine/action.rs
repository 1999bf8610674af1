//! Action-step execution: input resolution and module invocation.
//!
//! An action step resolves its templated inputs against the run context and
//! invokes the named module function through the registry. Every failure is
//! tagged with the step id before it leaves this layer.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::context::ExecutionContext;
use super::error::EngineError;
use super::registry::ModuleRegistry;

/// Resolve an action's inputs and invoke its module function.
pub async fn run_action(
    registry: &Arc<ModuleRegistry>,
    step_id: &str,
    module: &str,
    inputs: &Value,
    timeout: Duration,
    ctx: &ExecutionContext,
) -> Result<Value, EngineError> {
    let resolved = ctx.resolve(inputs);

    tracing::debug!(
        step_id,
        module,
        timeout_secs = timeout.as_secs(),
        "invoking module function"
    );

    registry
        .invoke(module, resolved, timeout)
        .await
        .map_err(|e| EngineError::StepFailed {
            step_id: step_id.to_string(),
            message: e.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
