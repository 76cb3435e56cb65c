// src/config/validate.rs

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::graphmap::DiGraphMap;

use crate::config::model::StepConfig;
use crate::dag::ROOT_NODE_NAME;
use crate::errors::LoadError;
use crate::task::{Step, IMMEDIATE_EXECUTION_TOKEN};

/// Validate identity and kind of every declared step.
///
/// `ids` holds the resolved ID per step (declared or generated), parallel
/// to `steps`. Checks:
/// - IDs are unique and none collides with the reserved root name
/// - exactly one of `build`, `push`, `cmd` is declared per step
pub fn validate_document_steps(steps: &[StepConfig], ids: &[String]) -> Result<(), LoadError> {
    let mut seen = HashSet::new();
    for id in ids {
        if id == ROOT_NODE_NAME || !seen.insert(id.as_str()) {
            return Err(LoadError::DuplicateStepId(id.clone()));
        }
    }

    for (step, id) in steps.iter().zip(ids) {
        let kinds = usize::from(step.build.is_some())
            + usize::from(step.push.is_some())
            + usize::from(step.cmd.is_some());
        match kinds {
            0 => return Err(LoadError::EmptyStepKind(id.clone())),
            1 => {}
            _ => return Err(LoadError::AmbiguousStepKind(id.clone())),
        }
    }

    Ok(())
}

/// Check that every ID referenced in a `when` list resolves to a known step.
pub fn validate_dependencies(steps: &[Arc<Step>]) -> Result<(), LoadError> {
    let known: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();

    for step in steps {
        for dep in &step.when {
            if dep == IMMEDIATE_EXECUTION_TOKEN {
                continue;
            }
            if !known.contains(dep.as_str()) {
                return Err(LoadError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Reject cycles by DFS coloring. The first back edge found reports the
/// cycle path in the error.
pub fn validate_acyclic(steps: &[Arc<Step>]) -> Result<(), LoadError> {
    // Edge direction: dep -> step. For `when: [a]` on step b we add a -> b.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for step in steps {
        graph.add_node(step.id.as_str());
    }
    for step in steps {
        for dep in &step.when {
            if dep != IMMEDIATE_EXECUTION_TOKEN {
                graph.add_edge(dep.as_str(), step.id.as_str(), ());
            }
        }
    }

    let mut colors: HashMap<&str, Color> = steps
        .iter()
        .map(|s| (s.id.as_str(), Color::White))
        .collect();
    let mut path: Vec<&str> = Vec::new();

    for step in steps {
        let name = step.id.as_str();
        if colors[name] == Color::White {
            visit(&graph, name, &mut colors, &mut path)?;
        }
    }

    Ok(())
}

fn visit<'a>(
    graph: &DiGraphMap<&'a str, ()>,
    node: &'a str,
    colors: &mut HashMap<&'a str, Color>,
    path: &mut Vec<&'a str>,
) -> Result<(), LoadError> {
    colors.insert(node, Color::Gray);
    path.push(node);

    for next in graph.neighbors(node) {
        match colors.get(next).copied().unwrap_or(Color::White) {
            Color::White => visit(graph, next, colors, path)?,
            Color::Gray => {
                let start = path.iter().position(|&p| p == next).unwrap_or(0);
                let cycle: Vec<&str> = path[start..]
                    .iter()
                    .copied()
                    .chain(std::iter::once(next))
                    .collect();
                return Err(LoadError::CyclicDependency {
                    path: cycle.join(" -> "),
                });
            }
            Color::Black => {}
        }
    }

    path.pop();
    colors.insert(node, Color::Black);
    Ok(())
}
