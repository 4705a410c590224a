//! Structural graph validation.
//!
//! Collects every problem instead of stopping at the first, so a caller can
//! show the whole list at once. The engine refuses to schedule a graph with
//! any issue.

use std::collections::{HashMap, HashSet};

use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use switchyard_types::error::ValidationIssue;
use switchyard_types::graph::{Connection, Graph};

use crate::step::{PortSpec, StepRegistry};

/// Outcome of [`validate`]: empty means valid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }

    /// Issues attributed to `step_id`.
    pub fn for_step<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a ValidationIssue> + 'a {
        self.issues
            .iter()
            .filter(move |i| i.step_id.as_deref() == Some(step_id))
    }

    fn push(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }
}

impl std::fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, issue) in self.issues.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

fn describe(conn: &Connection) -> String {
    format!(
        "{}.{} -> {}.{}",
        conn.source, conn.source_port, conn.target, conn.target_port
    )
}

/// Validate `graph` against the step types in `registry`.
///
/// Checks: unique step ids, registered step types, connection endpoints and
/// ports, duplicate connections, back-edges only into declared back-edge
/// ports of iterative steps and only from inside that step's loop body, and
/// acyclicity of the forward subgraph.
pub fn validate(graph: &Graph, registry: &StepRegistry) -> ValidationResult {
    let mut result = ValidationResult::default();

    if graph.steps.is_empty() {
        result.push(ValidationIssue::graph("graph has no steps"));
        return result;
    }

    // -- steps ---------------------------------------------------------------

    let mut seen: HashSet<&str> = HashSet::new();
    for step in &graph.steps {
        if !seen.insert(step.id.as_str()) {
            result.push(ValidationIssue::step(&step.id, "duplicate step id"));
        }
        if !registry.contains(&step.step_type) {
            result.push(ValidationIssue::step(
                &step.id,
                format!("unknown step type '{}'", step.step_type),
            ));
        }
    }

    // Declared ports per step id (first occurrence wins for duplicates).
    let mut inputs: HashMap<&str, Vec<PortSpec>> = HashMap::new();
    let mut outputs: HashMap<&str, Vec<String>> = HashMap::new();
    let mut iterative: HashSet<&str> = HashSet::new();
    for step in &graph.steps {
        if inputs.contains_key(step.id.as_str()) {
            continue;
        }
        if let Some(handler) = registry.get(&step.step_type) {
            inputs.insert(&step.id, handler.input_ports(&step.parameters));
            outputs.insert(&step.id, handler.output_ports(&step.parameters));
            if handler.descriptor().iterative {
                iterative.insert(&step.id);
            }
        }
    }

    // -- connections ---------------------------------------------------------

    let mut forward: Vec<&Connection> = Vec::new();
    let mut back_edges: Vec<&Connection> = Vec::new();
    let mut seen_connections: HashSet<&Connection> = HashSet::new();

    for conn in &graph.connections {
        let mut endpoints_ok = true;
        for (end, id) in [("source", &conn.source), ("target", &conn.target)] {
            if !seen.contains(id.as_str()) {
                result.push(ValidationIssue::step(
                    id,
                    format!("connection {} references unknown {end} step", describe(conn)),
                ));
                endpoints_ok = false;
            }
        }
        if !endpoints_ok {
            continue;
        }

        if !seen_connections.insert(conn) {
            result.push(ValidationIssue::step(
                &conn.target,
                format!("duplicate connection {}", describe(conn)),
            ));
            continue;
        }

        if let Some(ports) = outputs.get(conn.source.as_str()) {
            if !ports.iter().any(|p| *p == conn.source_port) {
                result.push(ValidationIssue::step(
                    &conn.source,
                    format!("undeclared output port '{}'", conn.source_port),
                ));
            }
        }

        let Some(ports) = inputs.get(conn.target.as_str()) else {
            continue;
        };
        match ports.iter().find(|p| p.name == conn.target_port) {
            None => result.push(ValidationIssue::step(
                &conn.target,
                format!("undeclared input port '{}'", conn.target_port),
            )),
            Some(port) if port.back_edge => {
                if iterative.contains(conn.target.as_str()) {
                    back_edges.push(conn);
                } else {
                    result.push(ValidationIssue::step(
                        &conn.target,
                        format!(
                            "back-edge port '{}' on a non-iterative step",
                            conn.target_port
                        ),
                    ));
                }
            }
            Some(_) => forward.push(conn),
        }
    }

    // -- acyclicity ----------------------------------------------------------

    let mut dag = DiGraph::<&str, ()>::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for step in &graph.steps {
        index
            .entry(step.id.as_str())
            .or_insert_with(|| dag.add_node(step.id.as_str()));
    }
    for conn in &forward {
        dag.add_edge(index[conn.source.as_str()], index[conn.target.as_str()], ());
    }

    if let Err(cycle) = toposort(&dag, None) {
        result.push(ValidationIssue::step(
            dag[cycle.node_id()],
            "step is part of a cycle; only iterative steps may be re-entered",
        ));
    } else {
        for conn in back_edges {
            let loop_step = index[conn.target.as_str()];
            let source = index[conn.source.as_str()];
            if !has_path_connecting(&dag, loop_step, source, None) {
                result.push(ValidationIssue::step(
                    &conn.source,
                    format!(
                        "back-edge into '{}' must come from inside its loop body",
                        conn.target
                    ),
                ));
            }
        }
    }

    result
}
