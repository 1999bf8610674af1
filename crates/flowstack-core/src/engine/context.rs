//! Per-run execution context and output resolution.
//!
//! `ExecutionContext` is the variable namespace one run resolves against:
//! the built-in `user`, `credential`, and `trigger` keys, one top-level key
//! per injected credential alias, and one key per step `output_as`. It is
//! owned exclusively by a single run and never shared across runs; within a
//! run, the dependency graph guarantees each `output_as` key has exactly one
//! writer per wave, so no runtime locking is needed.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};
use uuid::Uuid;

use super::resolver;

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Mutable variable namespace for one workflow run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// All resolvable variables, keyed by root identifier.
    pub variables: HashMap<String, Value>,
    pub workflow_id: Uuid,
    pub run_id: Uuid,
    pub user_id: Uuid,
    /// Credential alias keys injected at start, excluded from auto-detected
    /// output.
    credential_aliases: HashSet<String>,
}

impl ExecutionContext {
    /// Allocate the context for a new run.
    ///
    /// `credentials` is the already-decrypted flat map from the credential
    /// supplier. Each alias is reachable both as `credential.<alias>` and as
    /// a top-level key, matching what workflow templates expect.
    pub fn new(
        workflow_id: Uuid,
        run_id: Uuid,
        user_id: Uuid,
        credentials: HashMap<String, Value>,
        trigger_data: Value,
    ) -> Self {
        let mut variables = HashMap::new();
        variables.insert(
            "user".to_string(),
            json!({ "id": user_id.to_string() }),
        );
        variables.insert(
            "credential".to_string(),
            Value::Object(credentials.clone().into_iter().collect()),
        );
        variables.insert("trigger".to_string(), trigger_data);

        let mut credential_aliases = HashSet::new();
        for (alias, value) in credentials {
            credential_aliases.insert(alias.clone());
            variables.insert(alias, value);
        }

        Self {
            variables,
            workflow_id,
            run_id,
            user_id,
            credential_aliases,
        }
    }

    /// Resolve a templated value against this context.
    pub fn resolve(&self, value: &Value) -> Value {
        resolver::resolve(value, &self.variables)
    }

    /// Publish a step result under its `output_as` key.
    pub fn insert_output(&mut self, key: &str, value: Value) {
        self.variables.insert(key.to_string(), value);
    }

    /// The variables map as a JSON object, for expression evaluation.
    pub fn expression_context(&self) -> Value {
        Value::Object(
            self.variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    // -----------------------------------------------------------------------
    // Loop frames
    // -----------------------------------------------------------------------

    /// Bind `element`/`index` for one loop iteration, saving the previous
    /// bindings so nesting restores correctly.
    pub fn begin_iteration(&mut self, element: Value, index: usize) -> LoopFrame {
        let frame = LoopFrame {
            prev_element: self.variables.get("element").cloned(),
            prev_index: self.variables.get("index").cloned(),
        };
        self.variables.insert("element".to_string(), element);
        self.variables.insert("index".to_string(), json!(index));
        frame
    }

    /// Restore the bindings saved by `begin_iteration`.
    pub fn end_iteration(&mut self, frame: LoopFrame) {
        match frame.prev_element {
            Some(v) => self.variables.insert("element".to_string(), v),
            None => self.variables.remove("element"),
        };
        match frame.prev_index {
            Some(v) => self.variables.insert("index".to_string(), v),
            None => self.variables.remove("index"),
        };
    }

    // -----------------------------------------------------------------------
    // Output resolution
    // -----------------------------------------------------------------------

    /// Resolve the run's final output.
    ///
    /// A declared `return_value` template wins. Otherwise the output is
    /// auto-detected: every step-output key, excluding the built-in
    /// namespaces and credential aliases. When nothing remains, the full
    /// variables map is returned as a backward-compatible default.
    pub fn resolve_output(&self, return_value: Option<&Value>) -> Value {
        if let Some(template) = return_value {
            return self.resolve(template);
        }

        let excluded = ["user", "trigger", "credential", "element", "index"];
        let detected: serde_json::Map<String, Value> = self
            .variables
            .iter()
            .filter(|(k, _)| {
                !excluded.contains(&k.as_str()) && !self.credential_aliases.contains(*k)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if detected.is_empty() {
            self.expression_context()
        } else {
            Value::Object(detected)
        }
    }
}

/// Saved `element`/`index` bindings around one loop iteration.
#[derive(Debug)]
pub struct LoopFrame {
    prev_element: Option<Value>,
    prev_index: Option<Value>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> ExecutionContext {
        let mut creds = HashMap::new();
        creds.insert("slack_token".to_string(), json!("xoxb-123"));
        ExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            creds,
            json!({ "source": "webhook", "body": { "order": 42 } }),
        )
    }

    // -----------------------------------------------------------------------
    // Namespaces
    // -----------------------------------------------------------------------

    #[test]
    fn test_builtin_namespaces_seeded() {
        let ctx = test_context();
        assert_eq!(
            ctx.resolve(&json!("{{trigger.body.order}}")),
            json!(42)
        );
        assert_eq!(
            ctx.resolve(&json!("{{credential.slack_token}}")),
            json!("xoxb-123")
        );
        // Aliases are also reachable at top level
        assert_eq!(ctx.resolve(&json!("{{slack_token}}")), json!("xoxb-123"));
    }

    #[test]
    fn test_insert_output_resolvable() {
        let mut ctx = test_context();
        ctx.insert_output("orders", json!([1, 2, 3]));
        assert_eq!(ctx.resolve(&json!("{{orders[1]}}")), json!(2));
    }

    // -----------------------------------------------------------------------
    // Loop frames
    // -----------------------------------------------------------------------

    #[test]
    fn test_iteration_bindings_restored() {
        let mut ctx = test_context();
        let frame = ctx.begin_iteration(json!("first"), 0);
        assert_eq!(ctx.resolve(&json!("{{element}}")), json!("first"));
        assert_eq!(ctx.resolve(&json!("{{index}}")), json!(0));

        // Nested iteration shadows and restores
        let inner = ctx.begin_iteration(json!("inner"), 5);
        assert_eq!(ctx.resolve(&json!("{{element}}")), json!("inner"));
        ctx.end_iteration(inner);
        assert_eq!(ctx.resolve(&json!("{{element}}")), json!("first"));

        ctx.end_iteration(frame);
        assert_eq!(ctx.resolve(&json!("{{element}}")), Value::Null);
        assert!(!ctx.variables.contains_key("index"));
    }

    // -----------------------------------------------------------------------
    // Output resolution
    // -----------------------------------------------------------------------

    #[test]
    fn test_declared_return_value_wins() {
        let mut ctx = test_context();
        ctx.insert_output("total", json!(99));
        let output = ctx.resolve_output(Some(&json!({ "grand_total": "{{total}}" })));
        assert_eq!(output, json!({ "grand_total": 99 }));
    }

    #[test]
    fn test_auto_detect_excludes_builtins_and_aliases() {
        let mut ctx = test_context();
        ctx.insert_output("a", json!(1));
        ctx.insert_output("b", json!(2));

        let output = ctx.resolve_output(None);
        let map = output.as_object().unwrap();
        assert_eq!(map.get("a"), Some(&json!(1)));
        assert_eq!(map.get("b"), Some(&json!(2)));
        assert!(!map.contains_key("user"));
        assert!(!map.contains_key("trigger"));
        assert!(!map.contains_key("credential"));
        assert!(!map.contains_key("slack_token"), "alias excluded");
    }

    #[test]
    fn test_auto_detect_falls_back_to_full_map() {
        let ctx = test_context();
        let output = ctx.resolve_output(None);
        let map = output.as_object().unwrap();
        // No step outputs: the whole variables map comes back
        assert!(map.contains_key("user"));
        assert!(map.contains_key("trigger"));
        assert!(map.contains_key("credential"));
    }
}
