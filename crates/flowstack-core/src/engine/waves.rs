//! Topological grouping of steps into concurrently-executable waves.
//!
//! A wave is a maximal batch of steps with no dependency edges among its
//! members. Waves form a strict sequence: every step in wave N+1 depends
//! only on outputs produced in waves 0..=N (or on built-in context).
//!
//! The algorithm repeatedly selects every not-yet-scheduled step whose
//! dependency set is covered by the already-scheduled set. An iteration
//! that selects nothing while steps remain is a cycle; the error enumerates
//! every still-unscheduled step id rather than guessing a culprit.

use std::collections::{HashMap, HashSet};

use flowstack_types::workflow::StepDefinition;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use super::error::EngineError;
use super::graph::DependencyGraph;

/// Group sibling steps into execution waves.
///
/// Definition order is preserved within each wave. Also rejects two steps
/// publishing the same `output_as` key from the same wave, since their
/// write order would be unspecified.
pub fn group_into_waves<'a>(
    steps: &'a [StepDefinition],
    graph: &DependencyGraph,
) -> Result<Vec<Vec<&'a StepDefinition>>, EngineError> {
    if steps.is_empty() {
        return Ok(vec![]);
    }

    // Model edges in a DiGraph: dependency -> dependent.
    let mut dag = DiGraph::<&str, ()>::new();
    let node_indices: Vec<NodeIndex> =
        steps.iter().map(|s| dag.add_node(s.id())).collect();
    let id_to_pos: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id(), i))
        .collect();

    for (pos, step) in steps.iter().enumerate() {
        for dep in graph.depends_on(step.id()) {
            // Producers are always siblings by construction of the graph.
            let from = node_indices[id_to_pos[dep.as_str()]];
            dag.add_edge(from, node_indices[pos], ());
        }
    }

    let mut scheduled: HashSet<&str> = HashSet::new();
    let mut remaining: Vec<usize> = (0..steps.len()).collect();
    let mut waves: Vec<Vec<&StepDefinition>> = Vec::new();

    while !remaining.is_empty() {
        let ready: Vec<usize> = remaining
            .iter()
            .copied()
            .filter(|&pos| {
                dag.neighbors_directed(node_indices[pos], Direction::Incoming)
                    .all(|n| scheduled.contains(dag[n]))
            })
            .collect();

        if ready.is_empty() {
            let mut unscheduled: Vec<String> = remaining
                .iter()
                .map(|&pos| steps[pos].id().to_string())
                .collect();
            unscheduled.sort();
            return Err(EngineError::CircularDependency {
                steps: unscheduled,
            });
        }

        let wave: Vec<&StepDefinition> = ready.iter().map(|&pos| &steps[pos]).collect();
        check_output_keys(&wave)?;

        for &pos in &ready {
            scheduled.insert(steps[pos].id());
        }
        remaining.retain(|pos| !ready.contains(pos));
        waves.push(wave);
    }

    Ok(waves)
}

/// Reject duplicate `output_as` keys within one wave.
fn check_output_keys(wave: &[&StepDefinition]) -> Result<(), EngineError> {
    let mut seen: HashMap<&str, &str> = HashMap::new();
    for step in wave {
        if let Some(key) = step.output_key() {
            if let Some(&first) = seen.get(key) {
                return Err(EngineError::DuplicateOutputKey {
                    key: key.to_string(),
                    first: first.to_string(),
                    second: step.id().to_string(),
                });
            }
            seen.insert(key, step.id());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
