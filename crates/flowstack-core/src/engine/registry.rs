//! Module function registration and invocation.
//!
//! Integrations register each function with a static `ModuleDescriptor`
//! (parameter names + calling convention) and an async handler. The engine
//! maps resolved inputs onto the declared shape and never inspects the
//! callee to infer how to call it.
//!
//! The registry is an explicit per-process object passed by reference --
//! tests construct a fresh one per case. Invocations go through a circuit
//! breaker and rate limiter keyed by `category.module`, so all functions of
//! one integration share fate, plus a per-invocation timeout.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::Value;

use flowstack_types::module::{InputShape, ModuleDescriptor, ModulePath, ModulePathError};

use super::resilience::{BreakerConfig, CircuitBreaker, LimiterConfig, RateLimiter};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur registering or invoking a module function.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{0}")]
    MalformedPath(#[from] ModulePathError),

    #[error("unknown module '{0}'")]
    UnknownModule(String),

    #[error("inputs for positional module '{0}' must be an object")]
    InvalidInputs(String),

    #[error("circuit open for '{0}'")]
    CircuitOpen(String),

    #[error("module '{path}' timed out after {timeout_secs}s")]
    Timeout { path: String, timeout_secs: u64 },

    #[error("module '{path}' failed: {message}")]
    Invocation { path: String, message: String },
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Async handler for one module function. Receives the mapped inputs
/// (object or positional array, per the descriptor) and returns the result.
pub type ModuleHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

struct RegisteredModule {
    descriptor: ModuleDescriptor,
    handler: ModuleHandler,
}

// ---------------------------------------------------------------------------
// ModuleRegistry
// ---------------------------------------------------------------------------

/// Per-process registry of module functions with resilience wrappers.
pub struct ModuleRegistry {
    modules: DashMap<String, RegisteredModule>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    limiters: DashMap<String, Arc<RateLimiter>>,
    breaker_config: BreakerConfig,
    limiter_config: LimiterConfig,
}

impl ModuleRegistry {
    /// Create a registry with default resilience settings: breaker on, a
    /// permissive limiter (integrations tune per-service limits explicitly).
    pub fn new() -> Self {
        Self::with_resilience(
            BreakerConfig::default(),
            LimiterConfig {
                max_concurrent: 20,
                min_interval: Duration::ZERO,
                reservoir: 10_000,
                refill_interval: Duration::from_secs(60),
            },
        )
    }

    /// Create a registry with explicit breaker/limiter settings (tests use
    /// tighter windows).
    pub fn with_resilience(breaker_config: BreakerConfig, limiter_config: LimiterConfig) -> Self {
        Self {
            modules: DashMap::new(),
            breakers: DashMap::new(),
            limiters: DashMap::new(),
            breaker_config,
            limiter_config,
        }
    }

    /// Register a module function under its dotted path.
    ///
    /// Re-registering a path replaces the previous handler.
    pub fn register(&self, descriptor: ModuleDescriptor, handler: ModuleHandler) {
        let path = descriptor.path.to_string();
        tracing::debug!(module = path.as_str(), "registered module function");
        self.modules
            .insert(path, RegisteredModule { descriptor, handler });
    }

    /// Whether a module path is registered.
    pub fn contains(&self, path: &str) -> bool {
        self.modules.contains_key(path)
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Invoke a module function with already-resolved inputs.
    ///
    /// Applies, in order: path validation, input-shape mapping, circuit
    /// breaker admission, rate limiting, and the invocation timeout.
    pub async fn invoke(
        &self,
        path: &str,
        inputs: Value,
        timeout: Duration,
    ) -> Result<Value, RegistryError> {
        let parsed: ModulePath = path.parse()?;

        let (mapped, handler) = {
            let entry = self
                .modules
                .get(path)
                .ok_or_else(|| RegistryError::UnknownModule(path.to_string()))?;
            let mapped = map_inputs(&entry.descriptor, inputs)?;
            (mapped, Arc::clone(&entry.handler))
        };

        let service = parsed.service_key();
        let breaker = self.breaker(&service);
        let limiter = self.limiter(&service);

        breaker
            .try_acquire()
            .map_err(|_| RegistryError::CircuitOpen(service.clone()))?;

        let _permit = limiter.acquire().await;

        let result = tokio::time::timeout(timeout, handler(mapped)).await;
        match result {
            Ok(Ok(value)) => {
                breaker.record_success();
                Ok(value)
            }
            Ok(Err(message)) => {
                breaker.record_failure();
                Err(RegistryError::Invocation {
                    path: path.to_string(),
                    message,
                })
            }
            Err(_elapsed) => {
                breaker.record_failure();
                Err(RegistryError::Timeout {
                    path: path.to_string(),
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }

    fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.breaker_config.clone())))
            .clone()
    }

    fn limiter(&self, service: &str) -> Arc<RateLimiter> {
        self.limiters
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::new(self.limiter_config.clone())))
            .clone()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a resolved input object onto the module's declared calling shape.
fn map_inputs(descriptor: &ModuleDescriptor, inputs: Value) -> Result<Value, RegistryError> {
    match descriptor.input_shape {
        InputShape::SingleObject => Ok(inputs),
        InputShape::Positional => {
            let obj = match &inputs {
                Value::Object(map) => map,
                Value::Null => {
                    return Ok(Value::Array(
                        descriptor.params.iter().map(|_| Value::Null).collect(),
                    ));
                }
                _ => {
                    return Err(RegistryError::InvalidInputs(
                        descriptor.path.to_string(),
                    ));
                }
            };
            Ok(Value::Array(
                descriptor
                    .params
                    .iter()
                    .map(|p| obj.get(p).cloned().unwrap_or(Value::Null))
                    .collect(),
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fast_registry() -> ModuleRegistry {
        ModuleRegistry::with_resilience(
            BreakerConfig {
                error_threshold_pct: 50.0,
                min_volume: 2,
                window: Duration::from_secs(60),
                open_cooldown: Duration::from_secs(3600),
            },
            LimiterConfig {
                max_concurrent: 10,
                min_interval: Duration::ZERO,
                reservoir: 1000,
                refill_interval: Duration::from_secs(60),
            },
        )
    }

    fn echo_handler() -> ModuleHandler {
        Arc::new(|inputs| Box::pin(async move { Ok(json!({ "echo": inputs })) }))
    }

    fn failing_handler(message: &str) -> ModuleHandler {
        let message = message.to_string();
        Arc::new(move |_| {
            let message = message.clone();
            Box::pin(async move { Err(message) })
        })
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    // -----------------------------------------------------------------------
    // Registration and invocation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_single_object_passthrough() {
        let registry = fast_registry();
        let path: ModulePath = "chat.slack.post".parse().unwrap();
        registry.register(ModuleDescriptor::single_object(path), echo_handler());

        let result = registry
            .invoke("chat.slack.post", json!({ "text": "hi" }), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(result["echo"], json!({ "text": "hi" }));
    }

    #[tokio::test]
    async fn test_positional_mapping_follows_declared_order() {
        let registry = fast_registry();
        let path: ModulePath = "db.postgres.query".parse().unwrap();
        registry.register(
            ModuleDescriptor::positional(path, vec!["sql".to_string(), "limit".to_string()]),
            echo_handler(),
        );

        let result = registry
            .invoke(
                "db.postgres.query",
                json!({ "limit": 10, "sql": "select 1" }),
                TIMEOUT,
            )
            .await
            .unwrap();
        // Mapped by declared order, not input key order; missing params -> null
        assert_eq!(result["echo"], json!(["select 1", 10]));
    }

    #[tokio::test]
    async fn test_positional_missing_param_is_null() {
        let registry = fast_registry();
        let path: ModulePath = "db.postgres.query".parse().unwrap();
        registry.register(
            ModuleDescriptor::positional(path, vec!["sql".to_string(), "limit".to_string()]),
            echo_handler(),
        );

        let result = registry
            .invoke("db.postgres.query", json!({ "sql": "select 1" }), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(result["echo"], json!(["select 1", null]));
    }

    #[tokio::test]
    async fn test_unknown_module_rejected() {
        let registry = fast_registry();
        let err = registry
            .invoke("no.such.module", json!({}), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownModule(_)), "got: {err}");
    }

    #[tokio::test]
    async fn test_malformed_path_rejected() {
        let registry = fast_registry();
        let err = registry
            .invoke("not-a-path", json!({}), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::MalformedPath(_)), "got: {err}");
    }

    // -----------------------------------------------------------------------
    // Resilience integration
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_breaker_opens_and_fails_fast() {
        let registry = fast_registry();
        let path: ModulePath = "crm.hubspot.sync".parse().unwrap();
        registry.register(
            ModuleDescriptor::single_object(path),
            failing_handler("upstream 500"),
        );

        for _ in 0..2 {
            let err = registry
                .invoke("crm.hubspot.sync", json!({}), TIMEOUT)
                .await
                .unwrap_err();
            assert!(matches!(err, RegistryError::Invocation { .. }));
        }

        // Window saturated with errors: the breaker now rejects upfront.
        let err = registry
            .invoke("crm.hubspot.sync", json!({}), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::CircuitOpen(_)), "got: {err}");
    }

    #[tokio::test]
    async fn test_invocation_timeout() {
        let registry = fast_registry();
        let path: ModulePath = "mail.smtp.send".parse().unwrap();
        registry.register(
            ModuleDescriptor::single_object(path),
            Arc::new(|_| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Value::Null)
                })
            }),
        );

        let err = registry
            .invoke("mail.smtp.send", json!({}), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Timeout { .. }), "got: {err}");
    }

    #[tokio::test]
    async fn test_breakers_isolated_per_service() {
        let registry = fast_registry();
        registry.register(
            ModuleDescriptor::single_object("crm.hubspot.sync".parse().unwrap()),
            failing_handler("boom"),
        );
        registry.register(
            ModuleDescriptor::single_object("chat.slack.post".parse().unwrap()),
            echo_handler(),
        );

        for _ in 0..2 {
            let _ = registry.invoke("crm.hubspot.sync", json!({}), TIMEOUT).await;
        }

        // hubspot's open breaker must not affect slack
        assert!(
            registry
                .invoke("chat.slack.post", json!({}), TIMEOUT)
                .await
                .is_ok()
        );
    }
}
