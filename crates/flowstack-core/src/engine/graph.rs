//! Dependency derivation from variable references.
//!
//! Steps never declare dependencies explicitly. Instead, every templated
//! field is scanned for `{{path}}` tokens; a token whose root identifier
//! matches a sibling step's `output_as` key becomes a dependency edge.
//! Roots naming built-in context namespaces are ignored, and anything else
//! is a runtime-resolution concern, not a structural edge -- but every raw
//! reference is retained per step for diagnostics.

use std::collections::{BTreeSet, HashMap, HashSet};

use flowstack_types::workflow::StepDefinition;

use super::error::EngineError;
use super::resolver;

/// Context roots that are always present and never imply a step dependency.
pub const BUILTIN_ROOTS: &[&str] = &[
    "user",
    "credential",
    "trigger",
    "element",
    "index",
    "workflow",
    "run",
];

// ---------------------------------------------------------------------------
// DependencyGraph
// ---------------------------------------------------------------------------

/// Derived dependencies and raw references for one step.
#[derive(Debug, Clone, Default)]
pub struct StepNode {
    /// Sibling step ids this step must run after.
    pub depends_on: BTreeSet<String>,
    /// Every template path the step references, as written.
    pub variable_refs: BTreeSet<String>,
}

/// Dependency graph over one list of sibling steps.
///
/// Built per step list: the top-level workflow steps first, then again for
/// each nested branch or loop body when control flow re-enters scheduling.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashMap<String, StepNode>,
}

impl DependencyGraph {
    /// Scan `steps` and derive the dependency graph.
    ///
    /// Fails with a configuration error when two siblings share an id.
    /// Nested steps inside a Condition/ForEach/While body contribute their
    /// references to the enclosing step's node, since the whole construct
    /// is scheduled as one unit at this level.
    pub fn build(steps: &[StepDefinition]) -> Result<Self, EngineError> {
        // Map output keys to the producing sibling.
        let mut producers: HashMap<&str, &str> = HashMap::new();
        let mut seen_ids = HashSet::new();
        for step in steps {
            if !seen_ids.insert(step.id()) {
                return Err(EngineError::DuplicateStepId(step.id().to_string()));
            }
            if let Some(key) = step.output_key() {
                producers.insert(key, step.id());
            }
        }

        let mut nodes = HashMap::new();
        for step in steps {
            let mut tokens = Vec::new();
            collect_step_tokens(step, &mut tokens);

            let mut node = StepNode::default();
            for token in tokens {
                let root = resolver::root_ident(&token).to_string();
                node.variable_refs.insert(token);

                if BUILTIN_ROOTS.contains(&root.as_str()) {
                    continue;
                }
                match producers.get(root.as_str()) {
                    Some(&producer) if producer != step.id() => {
                        node.depends_on.insert(producer.to_string());
                    }
                    // Unmatched root: resolved (or not) at runtime.
                    _ => {}
                }
            }
            nodes.insert(step.id().to_string(), node);
        }

        Ok(Self { nodes })
    }

    /// The node for a step id, if present.
    pub fn node(&self, step_id: &str) -> Option<&StepNode> {
        self.nodes.get(step_id)
    }

    /// The dependency set for a step id (empty for unknown ids).
    pub fn depends_on(&self, step_id: &str) -> BTreeSet<String> {
        self.nodes
            .get(step_id)
            .map(|n| n.depends_on.clone())
            .unwrap_or_default()
    }

    /// Number of steps in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no steps.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Collect every template token a step references, recursing into nested
/// bodies so a control-flow step inherits its children's references.
fn collect_step_tokens(step: &StepDefinition, out: &mut Vec<String>) {
    match step {
        StepDefinition::Action { inputs, .. } => {
            resolver::collect_tokens(inputs, out);
        }
        StepDefinition::Condition {
            expr,
            then_steps,
            else_steps,
            ..
        } => {
            resolver::collect_tokens_str(expr, out);
            for nested in then_steps.iter().chain(else_steps.iter()) {
                collect_step_tokens(nested, out);
            }
        }
        StepDefinition::ForEach { items, body, .. } => {
            resolver::collect_tokens(items, out);
            for nested in body {
                collect_step_tokens(nested, out);
            }
        }
        StepDefinition::While {
            condition, body, ..
        } => {
            resolver::collect_tokens_str(condition, out);
            for nested in body {
                collect_step_tokens(nested, out);
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
    use serde_json::json;

    fn action(id: &str, inputs: serde_json::Value, output_as: Option<&str>) -> StepDefinition {
        StepDefinition::Action {
            id: id.to_string(),
            module: "test.module.run".to_string(),
            inputs,
            output_as: output_as.map(String::from),
            timeout_secs: None,
        }
    }

    // -----------------------------------------------------------------------
    // Edge derivation
    // -----------------------------------------------------------------------

    #[test]
    fn test_output_reference_becomes_edge() {
        let steps = vec![
            action("a", json!({}), Some("x")),
            action("b", json!({ "value": "{{x}}" }), None),
        ];
        let graph = DependencyGraph::build(&steps).unwrap();
        assert_eq!(
            graph.depends_on("b"),
            BTreeSet::from(["a".to_string()]),
            "b references a's output key"
        );
        assert!(graph.depends_on("a").is_empty());
    }

    #[test]
    fn test_nested_path_uses_root() {
        let steps = vec![
            action("fetch", json!({}), Some("page")),
            action("use", json!({ "title": "{{page.meta.title}}" }), None),
        ];
        let graph = DependencyGraph::build(&steps).unwrap();
        assert_eq!(graph.depends_on("use"), BTreeSet::from(["fetch".to_string()]));
    }

    #[test]
    fn test_builtin_roots_ignored() {
        let steps = vec![action(
            "a",
            json!({ "who": "{{user.email}}", "key": "{{credential.slack}}", "body": "{{trigger.body}}" }),
            None,
        )];
        let graph = DependencyGraph::build(&steps).unwrap();
        assert!(graph.depends_on("a").is_empty());
        // Raw references are still recorded for diagnostics
        let node = graph.node("a").unwrap();
        assert!(node.variable_refs.contains("user.email"));
        assert_eq!(node.variable_refs.len(), 3);
    }

    #[test]
    fn test_unknown_root_is_not_an_edge() {
        let steps = vec![action("a", json!({ "v": "{{mystery.field}}" }), None)];
        let graph = DependencyGraph::build(&steps).unwrap();
        assert!(graph.depends_on("a").is_empty());
        assert!(
            graph
                .node("a")
                .unwrap()
                .variable_refs
                .contains("mystery.field")
        );
    }

    #[test]
    fn test_self_reference_is_not_an_edge() {
        let steps = vec![action("a", json!({ "v": "{{x}}" }), Some("x"))];
        let graph = DependencyGraph::build(&steps).unwrap();
        assert!(graph.depends_on("a").is_empty());
    }

    // -----------------------------------------------------------------------
    // Nested bodies attribute to the enclosing step
    // -----------------------------------------------------------------------

    #[test]
    fn test_condition_nested_refs_attribute_to_parent() {
        let steps = vec![
            action("fetch", json!({}), Some("orders")),
            StepDefinition::Condition {
                id: "check".to_string(),
                expr: "{{orders}}".to_string(),
                then_steps: vec![action(
                    "notify",
                    json!({ "text": "{{orders[0].id}}" }),
                    None,
                )],
                else_steps: vec![],
            },
        ];
        let graph = DependencyGraph::build(&steps).unwrap();
        assert_eq!(
            graph.depends_on("check"),
            BTreeSet::from(["fetch".to_string()])
        );
    }

    #[test]
    fn test_while_and_foreach_bodies_scanned() {
        let steps = vec![
            action("seed", json!({}), Some("batch")),
            StepDefinition::ForEach {
                id: "each".to_string(),
                items: json!("{{batch}}"),
                body: vec![action("send", json!({ "item": "{{element}}" }), None)],
            },
            StepDefinition::While {
                id: "drain".to_string(),
                condition: "{{batch}}|length > 0".to_string(),
                body: vec![],
                max_iterations: Some(10),
            },
        ];
        let graph = DependencyGraph::build(&steps).unwrap();
        assert_eq!(graph.depends_on("each"), BTreeSet::from(["seed".to_string()]));
        assert_eq!(
            graph.depends_on("drain"),
            BTreeSet::from(["seed".to_string()])
        );
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    #[test]
    fn test_duplicate_step_id_rejected() {
        let steps = vec![action("a", json!({}), None), action("a", json!({}), None)];
        let err = DependencyGraph::build(&steps).unwrap_err();
        assert!(err.to_string().contains("duplicate step id"), "got: {err}");
    }

    #[test]
    fn test_empty_steps_ok() {
        let graph = DependencyGraph::build(&[]).unwrap();
        assert!(graph.is_empty());
    }
}
