//! Workflow store trait definition.
//!
//! Defines the storage interface for workflow definitions and run records.
//! The infrastructure layer (flowstack-infra) implements this trait with
//! SQLite persistence.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

use flowstack_types::error::RepositoryError;
use flowstack_types::workflow::{WorkflowDefinition, WorkflowRun};
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// The run ledger writes each run exactly twice: `create_run` at start and
/// `finish_run` at terminal completion. `finish_run` must persist the run's
/// terminal fields and the parent workflow's aggregate fields (`last_run`,
/// `last_run_status`, `run_count`, `last_run_error`) in one atomic
/// transaction, never as two independent writes.
pub trait WorkflowStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a workflow definition (insert or replace by ID).
    fn save_workflow(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow definition by its UUID.
    fn get_workflow(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// List active workflows that carry a cron or polling trigger.
    ///
    /// The leader-elected coordinator diffs its registered timers against
    /// this listing.
    fn list_scheduled(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// Delete a workflow definition by ID. Returns `true` if it existed.
    fn delete_workflow(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Persist a new run record with status `Running` (the start write).
    fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Persist a run's terminal fields and the parent workflow's aggregates
    /// in one atomic transaction (the terminal write).
    fn finish_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow run by its UUID.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// List runs for a workflow, newest first.
    fn list_runs(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;
}
