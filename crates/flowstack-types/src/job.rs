//! Queue job types for the tenant-partitioned job queue.
//!
//! A `QueueJob` is the unit of work the trigger layer hands to the queue:
//! which workflow to run, for whom, and the trigger payload. Jobs are
//! partitioned by organization so one tenant's backlog cannot starve
//! another's.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved partition name for workflows without an organization.
pub const ADMIN_PARTITION: &str = "admin";

// ---------------------------------------------------------------------------
// Trigger type
// ---------------------------------------------------------------------------

/// The kind of trigger that produced a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Cron,
    Webhook,
    Poll,
}

impl TriggerType {
    /// Lowercase label used in run records and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Cron => "cron",
            TriggerType::Webhook => "webhook",
            TriggerType::Poll => "poll",
        }
    }
}

// ---------------------------------------------------------------------------
// QueueJob
// ---------------------------------------------------------------------------

/// A durable workflow-execution job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJob {
    /// UUIDv7 job ID.
    pub id: Uuid,
    /// The workflow to execute.
    pub workflow_id: Uuid,
    /// The user on whose behalf the workflow runs (credential scope).
    pub user_id: Uuid,
    /// Owning organization; `None` routes to the admin partition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    /// What fired this job.
    pub trigger_type: TriggerType,
    /// Payload injected into `variables.trigger`.
    pub trigger_data: serde_json::Value,
    /// Scheduling priority within the partition (higher claims first).
    #[serde(default)]
    pub priority: u8,
    /// Attempt number (1-based; incremented on each retry).
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    /// When the job was first enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the job may be claimed (backoff delay).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_after: Option<DateTime<Utc>>,
}

fn default_attempt() -> u32 {
    1
}

impl QueueJob {
    /// Create a first-attempt job enqueued now.
    pub fn new(
        workflow_id: Uuid,
        user_id: Uuid,
        organization_id: Option<String>,
        trigger_type: TriggerType,
        trigger_data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            user_id,
            organization_id,
            trigger_type,
            trigger_data,
            priority: 0,
            attempt: 1,
            enqueued_at: Utc::now(),
            run_after: None,
        }
    }

    /// Raise the job's scheduling priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// The queue partition this job belongs to.
    pub fn partition(&self) -> &str {
        self.organization_id.as_deref().unwrap_or(ADMIN_PARTITION)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
