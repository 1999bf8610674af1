//! Workflow domain types for Flowstack.
//!
//! Defines the canonical representation of a workflow: an ordered list of
//! step definitions with triggers and an optional declared return value.
//! This module also contains the execution tracking type (`WorkflowRun`)
//! that the run ledger persists.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// The visual builder and the HTTP API both convert to/from this struct.
/// It is the single source of truth for a workflow's shape; the engine never
/// sees any other representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned on first save.
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Semantic version string (e.g. "1.0.0").
    #[serde(default = "default_version")]
    pub version: String,
    /// Owning organization. `None` routes the workflow to the shared
    /// "admin" queue partition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    /// User whose credentials scheduled runs execute with. `None` means the
    /// system user (no credentials injected).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_user_id: Option<Uuid>,
    /// Whether cron/poll triggers should currently fire.
    #[serde(default = "default_active")]
    pub active: bool,
    /// Trigger configurations (manual, cron, webhook, poll).
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    /// Ordered list of step definitions.
    pub steps: Vec<StepDefinition>,
    /// Optional declared return value template. When absent, the engine
    /// auto-detects the output from step results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,
    /// How the dashboard should render the run output.
    #[serde(default)]
    pub output_display: OutputDisplayMode,
    /// Total number of completed runs (terminal writes increment this).
    #[serde(default)]
    pub run_count: u64,
    /// When the most recent run reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    /// Status of the most recent run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_status: Option<RunStatus>,
    /// Error of the most recent run, if it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_error: Option<String>,
    /// Extensible metadata (for future use / custom integrations).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_active() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in a workflow.
///
/// Internally tagged by `type` to match the JSON the builder produces:
/// ```json
/// { "type": "action", "id": "fetch", "module": "http.client.get",
///   "inputs": { "url": "{{trigger.url}}" }, "output_as": "page" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepDefinition {
    /// Invoke a registered module function with templated inputs.
    Action {
        id: String,
        /// Dotted module path: `category.module.function`.
        module: String,
        /// Templated input payload, resolved against the run context.
        #[serde(default)]
        inputs: serde_json::Value,
        /// Context key under which the result is published.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_as: Option<String>,
        /// Per-invocation timeout override in seconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    /// Conditional branching (if/else) over nested step lists.
    Condition {
        id: String,
        /// Boolean expression; template tokens are interpolated first.
        expr: String,
        #[serde(default)]
        then_steps: Vec<StepDefinition>,
        #[serde(default)]
        else_steps: Vec<StepDefinition>,
    },
    /// Run the body once per element of a resolved array.
    ForEach {
        id: String,
        /// Template token or literal array to iterate.
        items: serde_json::Value,
        body: Vec<StepDefinition>,
    },
    /// Loop the body while the condition holds, bounded by an iteration cap.
    While {
        id: String,
        condition: String,
        body: Vec<StepDefinition>,
        /// Hard iteration cap override. The engine default applies when unset.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
    },
}

impl StepDefinition {
    /// The user-assigned step id, unique within a workflow.
    pub fn id(&self) -> &str {
        match self {
            StepDefinition::Action { id, .. }
            | StepDefinition::Condition { id, .. }
            | StepDefinition::ForEach { id, .. }
            | StepDefinition::While { id, .. } => id,
        }
    }

    /// The context key this step publishes under, if any.
    pub fn output_key(&self) -> Option<&str> {
        match self {
            StepDefinition::Action { output_as, .. } => output_as.as_deref(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger Configuration
// ---------------------------------------------------------------------------

/// How a workflow can be triggered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    /// Manually triggered via the dashboard or API.
    Manual {},
    /// Cron schedule trigger, fired by the leader-elected coordinator.
    Cron {
        /// Cron expression or human-readable schedule string.
        schedule: String,
        /// Optional timezone (e.g. "America/New_York").
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    /// Incoming webhook trigger. The HTTP layer resolves the path and hands
    /// the engine a `(workflow_id, user_id, trigger_data)` tuple.
    Webhook {
        /// Webhook endpoint path (e.g. "/hooks/new-order").
        path: String,
    },
    /// Polling trigger: the leader periodically invokes a module function
    /// and fires the workflow when it reports new events.
    Poll {
        /// Dotted module path of the polling function.
        module: String,
        /// Cron expression or human-readable schedule string.
        schedule: String,
    },
}

// ---------------------------------------------------------------------------
// Run Status
// ---------------------------------------------------------------------------

/// Overall status of a workflow run. Transitions are one-way:
/// `Running -> Success` or `Running -> Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Error,
}

impl RunStatus {
    /// Whether this status is terminal (no further transitions allowed).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

// ---------------------------------------------------------------------------
// Workflow Run (ledger record)
// ---------------------------------------------------------------------------

/// A single execution instance of a workflow.
///
/// The ledger writes this record exactly twice: once at start
/// (status=Running) and once at terminal completion, together with the
/// parent workflow's aggregate fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// UUIDv7 run ID.
    pub id: Uuid,
    /// ID of the workflow definition being executed.
    pub workflow_id: Uuid,
    /// Name of the workflow (denormalized for display).
    pub workflow_name: String,
    /// Current run status.
    pub status: RunStatus,
    /// How this run was triggered (e.g. "manual", "cron", "webhook", "poll").
    pub trigger_type: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal state (None while running).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in milliseconds, set at terminal write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Resolved output (non-null for successful runs).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Error message (non-null iff status is Error).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// ID of the step that caused the failure, when attributable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_step: Option<String>,
}

// ---------------------------------------------------------------------------
// Output display
// ---------------------------------------------------------------------------

/// How the dashboard renders a run's output. Opaque to the engine; stored
/// and passed through with the definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputDisplayMode {
    #[default]
    Auto,
    Json,
    Table,
    Text,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
