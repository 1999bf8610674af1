//! Wave-driven workflow execution and the run ledger.
//!
//! `WorkflowEngine` loads a definition, validates its structure, allocates
//! the execution context, and drives the steps wave by wave. Steps within a
//! wave run concurrently via `tokio::JoinSet`, bounded by the configured
//! concurrency; the executor always waits for every in-flight step to settle
//! before judging the wave, so partial work is never abandoned mid-flight.
//!
//! The run ledger is written exactly twice per run: once at start
//! (status=Running) and once at terminal completion, when the run's final
//! fields and the parent workflow's aggregates go through `finish_run` in a
//! single atomic store transaction.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flowstack_types::config::EngineConfig;
use flowstack_types::job::TriggerType;
use flowstack_types::module::ModulePath;
use flowstack_types::workflow::{RunStatus, StepDefinition, WorkflowRun};
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::repository::credential::CredentialSupplier;
use crate::repository::workflow::WorkflowStore;

use super::action::run_action;
use super::context::ExecutionContext;
use super::error::EngineError;
use super::expression::ConditionEvaluator;
use super::graph::DependencyGraph;
use super::registry::ModuleRegistry;
use super::waves::group_into_waves;

// ---------------------------------------------------------------------------
// Step environment
// ---------------------------------------------------------------------------

/// Shared, immutable execution environment cloned into spawned step tasks.
pub(crate) struct StepEnv {
    pub registry: Arc<ModuleRegistry>,
    pub max_step_concurrency: usize,
    pub while_iteration_cap: u32,
    pub step_timeout_secs: u64,
}

// ---------------------------------------------------------------------------
// Batch/step outcomes
// ---------------------------------------------------------------------------

/// Result of executing one sibling step list (a whole workflow, a branch,
/// or a loop body).
pub(crate) struct BatchOutcome {
    /// `(output_as, value)` pairs written during execution, in write order.
    pub entries: Vec<(String, Value)>,
    /// The result of the last successfully completed step in the final wave.
    pub last_output: Option<Value>,
}

/// Result of one step, carried back from the spawned task.
struct StepOutcome {
    entries: Vec<(String, Value)>,
    value: Value,
}

// ---------------------------------------------------------------------------
// Structural validation
// ---------------------------------------------------------------------------

/// Validate a step list before any execution or persistence.
///
/// Checks duplicate ids, cycles, same-wave output collisions, and module
/// path syntax, recursing into every nested branch and loop body.
/// Configuration errors surface here, before the run record exists.
pub fn validate_steps(steps: &[StepDefinition]) -> Result<(), EngineError> {
    let graph = DependencyGraph::build(steps)?;
    group_into_waves(steps, &graph)?;

    for step in steps {
        match step {
            StepDefinition::Action { module, .. } => {
                let _: ModulePath = module.parse()?;
            }
            StepDefinition::Condition {
                then_steps,
                else_steps,
                ..
            } => {
                validate_steps(then_steps)?;
                validate_steps(else_steps)?;
            }
            StepDefinition::ForEach { body, .. } | StepDefinition::While { body, .. } => {
                validate_steps(body)?;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Wave execution
// ---------------------------------------------------------------------------

/// Execute one sibling step list wave by wave, mutating `ctx` in place.
///
/// Boxed so control-flow steps can recurse into nested step lists.
pub(crate) fn execute_steps<'a>(
    env: &'a Arc<StepEnv>,
    steps: &'a [StepDefinition],
    ctx: &'a mut ExecutionContext,
) -> BoxFuture<'a, Result<BatchOutcome, EngineError>> {
    Box::pin(async move {
        let graph = DependencyGraph::build(steps)?;
        let waves = group_into_waves(steps, &graph)?;

        let mut outcome = BatchOutcome {
            entries: Vec::new(),
            last_output: None,
        };

        for (wave_idx, wave) in waves.iter().enumerate() {
            tracing::debug!(
                run_id = %ctx.run_id,
                wave = wave_idx,
                steps = wave.len(),
                "processing wave"
            );

            // Larger waves run in sub-batches of the configured concurrency.
            for chunk in wave.chunks(env.max_step_concurrency.max(1)) {
                let mut join_set = JoinSet::new();
                for step in chunk {
                    let step = (*step).clone();
                    let env = Arc::clone(env);
                    let snapshot = ctx.clone();
                    join_set.spawn(async move {
                        let id = step.id().to_string();
                        let result = run_step(env, step, snapshot).await;
                        (id, result)
                    });
                }

                // Wait for every in-flight step to settle -- successes are
                // collected in completion order, failures aggregated.
                let mut failures: Vec<(String, String)> = Vec::new();
                let mut successes: Vec<StepOutcome> = Vec::new();
                while let Some(joined) = join_set.join_next().await {
                    match joined {
                        Ok((_, Ok(step_outcome))) => successes.push(step_outcome),
                        Ok((id, Err(e))) => {
                            let message = failure_message(&id, e);
                            failures.push((id, message));
                        }
                        Err(join_err) => {
                            failures.push((
                                "unknown".to_string(),
                                format!("task join error: {join_err}"),
                            ));
                        }
                    }
                }

                // Apply completed work before judging the wave: a failing
                // sibling never un-does what another step already did.
                for step_outcome in successes {
                    for (key, value) in &step_outcome.entries {
                        ctx.insert_output(key, value.clone());
                    }
                    outcome.entries.extend(step_outcome.entries);
                    outcome.last_output = Some(step_outcome.value);
                }

                if !failures.is_empty() {
                    return Err(if failures.len() == 1 {
                        let (step_id, message) = failures.remove(0);
                        EngineError::StepFailed { step_id, message }
                    } else {
                        failures.sort();
                        EngineError::WaveFailed { failures }
                    });
                }
            }
        }

        Ok(outcome)
    })
}

/// Unwrap the inner message when a step error already carries this step's
/// id, so aggregate messages do not nest "step 'x' failed: step 'x' failed".
fn failure_message(id: &str, error: EngineError) -> String {
    match error {
        EngineError::StepFailed { step_id, message } if step_id == id => message,
        other => other.to_string(),
    }
}

/// Dispatch one step by type. Runs inside a spawned task with an owned
/// snapshot of the context; writes travel back as `entries`.
async fn run_step(
    env: Arc<StepEnv>,
    step: StepDefinition,
    mut ctx: ExecutionContext,
) -> Result<StepOutcome, EngineError> {
    match step {
        // -- Action: resolve inputs, invoke module, publish output --
        StepDefinition::Action {
            id,
            module,
            inputs,
            output_as,
            timeout_secs,
        } => {
            let timeout = Duration::from_secs(timeout_secs.unwrap_or(env.step_timeout_secs));
            let value = run_action(&env.registry, &id, &module, &inputs, timeout, &ctx).await?;
            let entries = output_as
                .map(|key| vec![(key, value.clone())])
                .unwrap_or_default();
            Ok(StepOutcome { entries, value })
        }

        // -- Condition: evaluate, re-enter wave scheduling on the branch --
        StepDefinition::Condition {
            id,
            expr,
            then_steps,
            else_steps,
        } => {
            // Evaluator is scoped so it is not held across the await below.
            let met = {
                let evaluator = ConditionEvaluator::new();
                evaluator
                    .evaluate_bool(&expr, &ctx.expression_context())
                    .map_err(|e| EngineError::StepFailed {
                        step_id: id.clone(),
                        message: e.to_string(),
                    })?
            };

            tracing::debug!(step_id = id.as_str(), condition_met = met, "condition evaluated");

            let branch = if met { &then_steps } else { &else_steps };
            let batch = execute_steps(&env, branch, &mut ctx).await?;
            let value = batch.last_output.clone().unwrap_or(json!(met));
            Ok(StepOutcome {
                entries: batch.entries,
                value,
            })
        }

        // -- ForEach: sequential iterations with a transient element scope --
        StepDefinition::ForEach { id, items, body } => {
            let resolved = ctx.resolve(&items);
            let array = match resolved {
                Value::Array(items) => items,
                other => {
                    return Err(EngineError::StepFailed {
                        step_id: id,
                        message: format!(
                            "items did not resolve to an array (got {})",
                            type_name(&other)
                        ),
                    });
                }
            };

            let total = array.len();
            let mut entries = Vec::new();
            for (index, element) in array.into_iter().enumerate() {
                let frame = ctx.begin_iteration(element, index);
                let result = execute_steps(&env, &body, &mut ctx).await;
                ctx.end_iteration(frame);
                entries.extend(result?.entries);
            }

            Ok(StepOutcome {
                entries,
                value: json!({ "iterations": total }),
            })
        }

        // -- While: loop with a mandatory iteration cap --
        StepDefinition::While {
            id,
            condition,
            body,
            max_iterations,
        } => {
            let cap = max_iterations.unwrap_or(env.while_iteration_cap);
            let mut entries = Vec::new();
            let mut iterations = 0u32;

            loop {
                // Fresh evaluator per check so none is held across the
                // body await below.
                let keep_going = {
                    let evaluator = ConditionEvaluator::new();
                    evaluator
                        .evaluate_bool(&condition, &ctx.expression_context())
                        .map_err(|e| EngineError::StepFailed {
                            step_id: id.clone(),
                            message: e.to_string(),
                        })?
                };
                if !keep_going {
                    break;
                }
                if iterations >= cap {
                    return Err(EngineError::StepFailed {
                        step_id: id,
                        message: format!("exceeded iteration cap of {cap}"),
                    });
                }

                let batch = execute_steps(&env, &body, &mut ctx).await?;
                entries.extend(batch.entries);
                iterations += 1;
            }

            Ok(StepOutcome {
                entries,
                value: json!({ "iterations": iterations }),
            })
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// The workflow execution engine: validation, context allocation, wave
/// execution, and the two-write run ledger.
///
/// Generic over `S: WorkflowStore` for storage flexibility.
pub struct WorkflowEngine<S: WorkflowStore> {
    store: Arc<S>,
    registry: Arc<ModuleRegistry>,
    credentials: Arc<dyn CredentialSupplier>,
    config: EngineConfig,
}

impl<S: WorkflowStore + 'static> WorkflowEngine<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<ModuleRegistry>,
        credentials: Arc<dyn CredentialSupplier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            credentials,
            config,
        }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Execute a workflow end to end and return its terminal run record.
    ///
    /// Configuration errors are raised before anything is persisted. Once
    /// the start write lands, the method always produces the terminal write
    /// before returning; execution failures are returned as errors after the
    /// failed run has been recorded.
    pub async fn execute_workflow(
        &self,
        workflow_id: Uuid,
        user_id: Uuid,
        trigger_type: TriggerType,
        trigger_data: Value,
    ) -> Result<WorkflowRun, EngineError> {
        let definition = self
            .store
            .get_workflow(&workflow_id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;

        // Fail fast on structural problems -- no partial state.
        validate_steps(&definition.steps)?;

        let credentials = self
            .credentials
            .credentials_for(&user_id)
            .await
            .map_err(|e| EngineError::Infrastructure(format!("credential supplier: {e}")))?;

        let run_id = Uuid::now_v7();
        let mut ctx = ExecutionContext::new(
            definition.id,
            run_id,
            user_id,
            credentials,
            trigger_data,
        );

        let mut run = WorkflowRun {
            id: run_id,
            workflow_id: definition.id,
            workflow_name: definition.name.clone(),
            status: RunStatus::Running,
            trigger_type: trigger_type.as_str().to_string(),
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            output: None,
            error: None,
            error_step: None,
        };
        self.store.create_run(&run).await?;

        tracing::info!(
            run_id = %run_id,
            workflow = definition.name.as_str(),
            trigger = trigger_type.as_str(),
            "starting workflow execution"
        );

        let env = Arc::new(StepEnv {
            registry: Arc::clone(&self.registry),
            max_step_concurrency: self.config.max_step_concurrency,
            while_iteration_cap: self.config.while_iteration_cap,
            step_timeout_secs: self.config.step_timeout_secs,
        });

        let result = execute_steps(&env, &definition.steps, &mut ctx).await;

        let completed_at = Utc::now();
        run.completed_at = Some(completed_at);
        run.duration_ms = Some(
            (completed_at - run.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );

        match result {
            Ok(_) => {
                run.status = RunStatus::Success;
                run.output = Some(ctx.resolve_output(definition.return_value.as_ref()));
                self.store.finish_run(&run).await?;

                tracing::info!(
                    run_id = %run_id,
                    workflow = definition.name.as_str(),
                    duration_ms = run.duration_ms,
                    "workflow completed"
                );
                Ok(run)
            }
            Err(e) => {
                run.status = RunStatus::Error;
                run.error = Some(e.to_string());
                run.error_step = e.step_id().map(String::from);

                if let Err(persist) = self.store.finish_run(&run).await {
                    tracing::error!(
                        run_id = %run_id,
                        error = %persist,
                        "failed to persist terminal run state"
                    );
                }

                tracing::warn!(
                    run_id = %run_id,
                    workflow = definition.name.as_str(),
                    error = %e,
                    "workflow failed"
                );
                Err(e)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::credential::NoCredentials;
    use flowstack_types::error::RepositoryError;
    use flowstack_types::module::ModuleDescriptor;
    use flowstack_types::workflow::{OutputDisplayMode, WorkflowDefinition};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    // -------------------------------------------------------------------
    // In-memory store
    // -------------------------------------------------------------------

    #[derive(Default)]
    struct MemStore {
        workflows: Mutex<HashMap<Uuid, WorkflowDefinition>>,
        runs: Mutex<HashMap<Uuid, WorkflowRun>>,
    }

    impl WorkflowStore for MemStore {
        async fn save_workflow(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
            self.workflows.lock().unwrap().insert(def.id, def.clone());
            Ok(())
        }

        async fn get_workflow(
            &self,
            id: &Uuid,
        ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
            Ok(self.workflows.lock().unwrap().get(id).cloned())
        }

        async fn list_scheduled(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
            Ok(vec![])
        }

        async fn delete_workflow(&self, id: &Uuid) -> Result<bool, RepositoryError> {
            Ok(self.workflows.lock().unwrap().remove(id).is_some())
        }

        async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
            self.runs.lock().unwrap().insert(run.id, run.clone());
            Ok(())
        }

        async fn finish_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
            let mut workflows = self.workflows.lock().unwrap();
            if let Some(def) = workflows.get_mut(&run.workflow_id) {
                def.run_count += 1;
                def.last_run = run.completed_at;
                def.last_run_status = Some(run.status);
                def.last_run_error = run.error.clone();
            }
            self.runs.lock().unwrap().insert(run.id, run.clone());
            Ok(())
        }

        async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
            Ok(self.runs.lock().unwrap().get(run_id).cloned())
        }

        async fn list_runs(
            &self,
            workflow_id: &Uuid,
            _limit: u32,
        ) -> Result<Vec<WorkflowRun>, RepositoryError> {
            Ok(self
                .runs
                .lock()
                .unwrap()
                .values()
                .filter(|r| &r.workflow_id == workflow_id)
                .cloned()
                .collect())
        }
    }

    // -------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------

    fn action(id: &str, module: &str, inputs: Value, output_as: Option<&str>) -> StepDefinition {
        StepDefinition::Action {
            id: id.to_string(),
            module: module.to_string(),
            inputs,
            output_as: output_as.map(String::from),
            timeout_secs: None,
        }
    }

    fn definition(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "test-workflow".to_string(),
            description: None,
            version: "1.0.0".to_string(),
            organization_id: None,
            owner_user_id: None,
            active: true,
            triggers: vec![],
            steps,
            return_value: None,
            output_display: OutputDisplayMode::Auto,
            run_count: 0,
            last_run: None,
            last_run_status: None,
            last_run_error: None,
            metadata: HashMap::new(),
        }
    }

    fn echo_registry() -> Arc<ModuleRegistry> {
        let registry = Arc::new(ModuleRegistry::new());
        registry.register(
            ModuleDescriptor::single_object("test.echo.run".parse().unwrap()),
            Arc::new(|inputs| Box::pin(async move { Ok(inputs) })),
        );
        registry
    }

    async fn engine_with(
        registry: Arc<ModuleRegistry>,
        def: &WorkflowDefinition,
    ) -> WorkflowEngine<MemStore> {
        let store = Arc::new(MemStore::default());
        store.save_workflow(def).await.unwrap();
        WorkflowEngine::new(
            store,
            registry,
            Arc::new(NoCredentials),
            EngineConfig::default(),
        )
    }

    async fn run(
        engine: &WorkflowEngine<MemStore>,
        workflow_id: Uuid,
    ) -> Result<WorkflowRun, EngineError> {
        engine
            .execute_workflow(workflow_id, Uuid::now_v7(), TriggerType::Manual, json!({}))
            .await
    }

    // -------------------------------------------------------------------
    // Happy path and output detection
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_fan_in_run_auto_detects_output() {
        let registry = echo_registry();
        let def = definition(vec![
            action("fetch_a", "test.echo.run", json!({ "v": 1 }), Some("a")),
            action("fetch_b", "test.echo.run", json!({ "v": 2 }), Some("b")),
            action(
                "combine",
                "test.echo.run",
                json!({ "x": "{{a.v}}", "y": "{{b.v}}" }),
                Some("combined"),
            ),
        ]);
        let engine = engine_with(registry, &def).await;

        let result = run(&engine, def.id).await.unwrap();
        assert_eq!(result.status, RunStatus::Success);

        let output = result.output.unwrap();
        let map = output.as_object().unwrap();
        assert_eq!(map["a"], json!({ "v": 1 }));
        assert_eq!(map["b"], json!({ "v": 2 }));
        assert_eq!(map["combined"], json!({ "x": 1, "y": 2 }));
        assert!(!map.contains_key("user"));
        assert!(!map.contains_key("trigger"));
    }

    #[tokio::test]
    async fn test_declared_return_value_used() {
        let registry = echo_registry();
        let mut def = definition(vec![action(
            "calc",
            "test.echo.run",
            json!({ "n": 9 }),
            Some("result"),
        )]);
        def.return_value = Some(json!({ "answer": "{{result.n}}" }));
        let engine = engine_with(registry, &def).await;

        let result = run(&engine, def.id).await.unwrap();
        assert_eq!(result.output, Some(json!({ "answer": 9 })));
    }

    // -------------------------------------------------------------------
    // Run ledger
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_exactly_one_terminal_run_row() {
        let registry = echo_registry();
        let def = definition(vec![action("a", "test.echo.run", json!({}), None)]);
        let engine = engine_with(registry, &def).await;

        let result = run(&engine, def.id).await.unwrap();

        let runs = engine.store().list_runs(&def.id, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        let stored = &runs[0];
        assert_eq!(stored.id, result.id);
        assert!(stored.status.is_terminal());
        assert!(stored.completed_at.unwrap() >= stored.started_at);
        assert!(stored.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_aggregates_updated_on_terminal_write() {
        let registry = echo_registry();
        let def = definition(vec![action("a", "test.echo.run", json!({}), None)]);
        let engine = engine_with(registry, &def).await;

        run(&engine, def.id).await.unwrap();

        let stored = engine.store().get_workflow(&def.id).await.unwrap().unwrap();
        assert_eq!(stored.run_count, 1);
        assert_eq!(stored.last_run_status, Some(RunStatus::Success));
        assert!(stored.last_run.is_some());
        assert!(stored.last_run_error.is_none());
    }

    #[tokio::test]
    async fn test_failed_run_records_error_step() {
        let registry = Arc::new(ModuleRegistry::new());
        registry.register(
            ModuleDescriptor::single_object("test.fail.run".parse().unwrap()),
            Arc::new(|_| Box::pin(async { Err("upstream 500".to_string()) })),
        );
        let def = definition(vec![action("sync", "test.fail.run", json!({}), None)]);
        let engine = engine_with(registry, &def).await;

        let err = run(&engine, def.id).await.unwrap_err();
        assert_eq!(err.step_id(), Some("sync"));

        let runs = engine.store().list_runs(&def.id, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Error);
        assert_eq!(runs[0].error_step.as_deref(), Some("sync"));
        assert!(runs[0].error.as_ref().unwrap().contains("upstream 500"));

        let stored = engine.store().get_workflow(&def.id).await.unwrap().unwrap();
        assert_eq!(stored.last_run_status, Some(RunStatus::Error));
        assert!(stored.last_run_error.is_some());
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_any_write() {
        let registry = echo_registry();
        let def = definition(vec![
            action("a", "test.echo.run", json!({ "v": "{{y}}" }), Some("x")),
            action("b", "test.echo.run", json!({ "v": "{{x}}" }), Some("y")),
        ]);
        let engine = engine_with(registry, &def).await;

        let err = run(&engine, def.id).await.unwrap_err();
        assert!(err.is_configuration());
        let msg = err.to_string();
        assert!(msg.contains('a') && msg.contains('b'), "got: {msg}");

        let runs = engine.store().list_runs(&def.id, 10).await.unwrap();
        assert!(runs.is_empty(), "no partial state for config errors");
    }

    // -------------------------------------------------------------------
    // Wave concurrency
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_independent_steps_run_in_parallel() {
        let registry = Arc::new(ModuleRegistry::new());
        registry.register(
            ModuleDescriptor::single_object("test.slow.run".parse().unwrap()),
            Arc::new(|inputs| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    Ok(inputs)
                })
            }),
        );
        let def = definition(vec![
            action("s1", "test.slow.run", json!({}), Some("r1")),
            action("s2", "test.slow.run", json!({}), Some("r2")),
            action("s3", "test.slow.run", json!({}), Some("r3")),
        ]);
        let engine = engine_with(registry, &def).await;

        let start = Instant::now();
        run(&engine, def.id).await.unwrap();
        let elapsed = start.elapsed();

        // ~max(Li), not sum(Li): three 80ms steps well under 240ms
        assert!(
            elapsed < Duration::from_millis(200),
            "wave should parallelize, took {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn test_wave_aggregates_sibling_failures() {
        let succeeded = Arc::new(AtomicU32::new(0));
        let registry = Arc::new(ModuleRegistry::new());
        {
            let succeeded = Arc::clone(&succeeded);
            registry.register(
                ModuleDescriptor::single_object("test.ok.run".parse().unwrap()),
                Arc::new(move |inputs| {
                    let succeeded = Arc::clone(&succeeded);
                    Box::pin(async move {
                        succeeded.fetch_add(1, Ordering::SeqCst);
                        Ok(inputs)
                    })
                }),
            );
        }
        registry.register(
            ModuleDescriptor::single_object("test.fail.run".parse().unwrap()),
            Arc::new(|_| Box::pin(async { Err("boom".to_string()) })),
        );

        let def = definition(vec![
            action("good", "test.ok.run", json!({}), Some("good_out")),
            action("bad1", "test.fail.run", json!({}), None),
            action("bad2", "test.fail.run", json!({}), None),
        ]);
        let engine = engine_with(registry, &def).await;

        let err = run(&engine, def.id).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("'bad1'"), "got: {msg}");
        assert!(msg.contains("'bad2'"), "got: {msg}");
        // The succeeding sibling still completed its work
        assert_eq!(succeeded.load(Ordering::SeqCst), 1);
    }

    // -------------------------------------------------------------------
    // Control flow
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_condition_selects_then_branch() {
        let registry = echo_registry();
        let def = definition(vec![
            action("seed", "test.echo.run", json!({ "n": 5 }), Some("seed")),
            StepDefinition::Condition {
                id: "check".to_string(),
                expr: "{{seed.n}} > 3".to_string(),
                then_steps: vec![action(
                    "then_step",
                    "test.echo.run",
                    json!({ "branch": "then" }),
                    Some("picked"),
                )],
                else_steps: vec![action(
                    "else_step",
                    "test.echo.run",
                    json!({ "branch": "else" }),
                    Some("picked"),
                )],
            },
        ]);
        let engine = engine_with(registry, &def).await;

        let result = run(&engine, def.id).await.unwrap();
        let output = result.output.unwrap();
        assert_eq!(output["picked"], json!({ "branch": "then" }));
    }

    #[tokio::test]
    async fn test_foreach_iterates_sequentially_with_scope() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(ModuleRegistry::new());
        {
            let seen = Arc::clone(&seen);
            registry.register(
                ModuleDescriptor::single_object("test.collect.run".parse().unwrap()),
                Arc::new(move |inputs| {
                    let seen = Arc::clone(&seen);
                    Box::pin(async move {
                        seen.lock().unwrap().push(inputs.clone());
                        Ok(inputs)
                    })
                }),
            );
        }

        let def = definition(vec![StepDefinition::ForEach {
            id: "each".to_string(),
            items: json!(["a", "b", "c"]),
            body: vec![action(
                "record",
                "test.collect.run",
                json!({ "item": "{{element}}", "at": "{{index}}" }),
                None,
            )],
        }]);
        let engine = engine_with(registry, &def).await;

        run(&engine, def.id).await.unwrap();

        let collected = seen.lock().unwrap().clone();
        assert_eq!(
            collected,
            vec![
                json!({ "item": "a", "at": 0 }),
                json!({ "item": "b", "at": 1 }),
                json!({ "item": "c", "at": 2 }),
            ],
            "iterations run in order with element/index bound"
        );
    }

    #[tokio::test]
    async fn test_foreach_non_array_fails_with_step_id() {
        let registry = echo_registry();
        let def = definition(vec![StepDefinition::ForEach {
            id: "each".to_string(),
            items: json!("{{missing}}"),
            body: vec![],
        }]);
        let engine = engine_with(registry, &def).await;

        let err = run(&engine, def.id).await.unwrap_err();
        assert_eq!(err.step_id(), Some("each"));
        assert!(err.to_string().contains("array"), "got: {err}");
    }

    #[tokio::test]
    async fn test_while_cap_breach_is_step_error() {
        let registry = echo_registry();
        let def = definition(vec![StepDefinition::While {
            id: "spin".to_string(),
            condition: "true".to_string(),
            body: vec![],
            max_iterations: Some(5),
        }]);
        let engine = engine_with(registry, &def).await;

        let err = run(&engine, def.id).await.unwrap_err();
        assert_eq!(err.step_id(), Some("spin"));
        assert!(err.to_string().contains("iteration cap"), "got: {err}");
    }

    #[tokio::test]
    async fn test_while_exits_when_condition_false() {
        let registry = echo_registry();
        let def = definition(vec![
            action("seed", "test.echo.run", json!({ "n": 0 }), Some("counter")),
            StepDefinition::While {
                id: "noop".to_string(),
                condition: "{{counter.n}} > 0".to_string(),
                body: vec![],
                max_iterations: Some(5),
            },
        ]);
        let engine = engine_with(registry, &def).await;
        let result = run(&engine, def.id).await.unwrap();
        assert_eq!(result.status, RunStatus::Success);
    }

    // -------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_malformed_module_path_is_config_error() {
        let registry = echo_registry();
        let def = definition(vec![action("bad", "not-a-path", json!({}), None)]);
        let engine = engine_with(registry, &def).await;

        let err = run(&engine, def.id).await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_validate_recurses_into_bodies() {
        let steps = vec![StepDefinition::Condition {
            id: "outer".to_string(),
            expr: "true".to_string(),
            then_steps: vec![
                StepDefinition::Action {
                    id: "dup".to_string(),
                    module: "a.b.c".to_string(),
                    inputs: json!({}),
                    output_as: None,
                    timeout_secs: None,
                },
                StepDefinition::Action {
                    id: "dup".to_string(),
                    module: "a.b.c".to_string(),
                    inputs: json!({}),
                    output_as: None,
                    timeout_secs: None,
                },
            ],
            else_steps: vec![],
        }];
        let err = validate_steps(&steps).unwrap_err();
        assert!(err.to_string().contains("duplicate step id"), "got: {err}");
    }

    #[tokio::test]
    async fn test_unknown_workflow() {
        let registry = echo_registry();
        let def = definition(vec![]);
        let engine = engine_with(registry, &def).await;
        let err = run(&engine, Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, EngineError::WorkflowNotFound(_)));
    }
}
