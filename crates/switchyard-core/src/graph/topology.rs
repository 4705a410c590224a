//! Execution topology derived from a validated graph.
//!
//! Splits connections into forward edges and loop back-edges, computes a
//! Kahn ordering over the forward edges of enabled steps, and answers the
//! reachability questions the scheduler asks (downstream closure, loop
//! region, reachability from a start step).

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use switchyard_types::graph::Graph;

use crate::step::StepRegistry;

#[derive(Debug, Clone)]
pub struct Topology {
    /// Enabled steps in Kahn order, ties broken by declaration order.
    order: Vec<String>,
    /// Forward connection indices by target, in declaration order.
    incoming: HashMap<String, Vec<usize>>,
    /// Forward connection indices by source, in declaration order.
    outgoing: HashMap<String, Vec<usize>>,
    /// Back-edge connection indices by source.
    back_outgoing: HashMap<String, Vec<usize>>,
    back_edges: HashSet<usize>,
    /// Enabled steps with no forward connection into them at all.
    entries: Vec<String>,
}

impl Topology {
    /// Build from a graph that already passed validation.
    ///
    /// Connections touching a disabled step are dropped entirely.
    pub fn build(graph: &Graph, registry: &StepRegistry) -> Self {
        let disabled: HashSet<&str> = graph
            .steps
            .iter()
            .filter(|s| s.disabled)
            .map(|s| s.id.as_str())
            .collect();
        let mut has_forward_input: HashSet<&str> = HashSet::new();
        let mut back_edges = HashSet::new();
        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut back_outgoing: HashMap<String, Vec<usize>> = HashMap::new();

        for (idx, conn) in graph.connections.iter().enumerate() {
            let is_back_edge = graph
                .step(&conn.target)
                .and_then(|target| {
                    let handler = registry.get(&target.step_type)?;
                    let ports = handler.input_ports(&target.parameters);
                    Some(ports.into_iter().any(|p| p.back_edge && p.name == conn.target_port))
                })
                .unwrap_or(false);

            if !is_back_edge {
                has_forward_input.insert(conn.target.as_str());
            }
            if disabled.contains(conn.source.as_str()) || disabled.contains(conn.target.as_str()) {
                continue;
            }
            if is_back_edge {
                back_edges.insert(idx);
                back_outgoing.entry(conn.source.clone()).or_default().push(idx);
            } else {
                incoming.entry(conn.target.clone()).or_default().push(idx);
                outgoing.entry(conn.source.clone()).or_default().push(idx);
            }
        }

        let order = kahn_order(graph, &incoming, &outgoing);
        let entries = order
            .iter()
            .filter(|id| !has_forward_input.contains(id.as_str()))
            .cloned()
            .collect();

        Self {
            order,
            incoming,
            outgoing,
            back_outgoing,
            back_edges,
            entries,
        }
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn incoming(&self, step_id: &str) -> &[usize] {
        self.incoming.get(step_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn outgoing(&self, step_id: &str) -> &[usize] {
        self.outgoing.get(step_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn back_outgoing(&self, step_id: &str) -> &[usize] {
        self.back_outgoing.get(step_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_back_edge(&self, connection: usize) -> bool {
        self.back_edges.contains(&connection)
    }

    /// Every step reachable from `step_id` over forward edges, excluding
    /// `step_id` itself.
    pub fn downstream(&self, graph: &Graph, step_id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([step_id]);
        while let Some(current) = queue.pop_front() {
            for &idx in self.outgoing(current) {
                let target = graph.connections[idx].target.as_str();
                if target != step_id && seen.insert(target.to_string()) {
                    queue.push_back(target);
                }
            }
        }
        seen
    }

    /// `step_id` plus everything downstream of it.
    pub fn reachable_from(&self, graph: &Graph, step_id: &str) -> BTreeSet<String> {
        let mut set = self.downstream(graph, step_id);
        set.insert(step_id.to_string());
        set
    }

    /// Every step with a forward path to `step_id`, excluding `step_id`.
    pub fn upstream(&self, graph: &Graph, step_id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([step_id]);
        while let Some(current) = queue.pop_front() {
            for &idx in self.incoming(current) {
                let source = graph.connections[idx].source.as_str();
                if source != step_id && seen.insert(source.to_string()) {
                    queue.push_back(source);
                }
            }
        }
        seen
    }

    /// The part of a loop that can feed its back-edges: every step
    /// downstream of `loop_id` with a forward path to a back-edge source
    /// targeting it, sources included.
    pub fn loop_core(&self, graph: &Graph, loop_id: &str) -> BTreeSet<String> {
        let body = self.downstream(graph, loop_id);
        let mut core = BTreeSet::new();
        for (source, edges) in &self.back_outgoing {
            let feeds_loop = edges.iter().any(|&c| graph.connections[c].target == loop_id);
            if !feeds_loop || !body.contains(source) {
                continue;
            }
            core.insert(source.clone());
            core.extend(
                self.upstream(graph, source)
                    .into_iter()
                    .filter(|id| body.contains(id)),
            );
        }
        core
    }

    /// Steps that start a run: enabled steps nothing feeds forward into.
    pub fn is_entry(&self, step_id: &str) -> bool {
        self.entries.iter().any(|e| e == step_id)
    }
}

/// Kahn's algorithm over forward edges of enabled steps. Steps left over by a cycle are appended in declaration
/// order so the result always covers every enabled step.
fn kahn_order(
    graph: &Graph,
    incoming: &HashMap<String, Vec<usize>>,
    outgoing: &HashMap<String, Vec<usize>>,
) -> Vec<String> {
    let enabled: Vec<&str> = graph
        .steps
        .iter()
        .filter(|s| !s.disabled)
        .map(|s| s.id.as_str())
        .collect();
    let mut in_degree: HashMap<&str, usize> = enabled
        .iter()
        .map(|id| {
            let degree = incoming.get(*id).map(Vec::len).unwrap_or(0);
            (*id, degree)
        })
        .collect();

    let mut queue: VecDeque<&str> = enabled
        .iter()
        .copied()
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();
    let mut order: Vec<String> = Vec::with_capacity(enabled.len());
    let mut placed: HashSet<&str> = HashSet::new();

    while let Some(id) = queue.pop_front() {
        if !placed.insert(id) {
            continue;
        }
        order.push(id.to_string());
        for &c in outgoing.get(id).map(Vec::as_slice).unwrap_or(&[]) {
            let target = graph.connections[c].target.as_str();
            if let Some(degree) = in_degree.get_mut(target) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    queue.push_back(target);
                }
            }
        }
    }

    for id in enabled {
        if !placed.contains(id) {
            order.push(id.to_string());
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use switchyard_types::graph::StepNode;

    use super::*;

    fn registry() -> StepRegistry {
        StepRegistry::with_builtins()
    }

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|s| s == id).unwrap()
    }

    #[test]
    fn kahn_order_respects_connections() {
        let graph = Graph::new("g")
            .with_step(StepNode::new("d", "merge"))
            .with_step(StepNode::new("c", "no_op"))
            .with_step(StepNode::new("b", "no_op"))
            .with_step(StepNode::new("a", "manual_trigger"))
            .connect("a", "b")
            .connect("a", "c")
            .connect_ports("b", "main", "d", "input1")
            .connect_ports("c", "main", "d", "input2");
        let topo = Topology::build(&graph, &registry());
        let order = topo.order();

        assert_eq!(order.len(), 4);
        for conn in &graph.connections {
            assert!(position(order, &conn.source) < position(order, &conn.target));
        }
        assert!(topo.is_entry("a"));
        assert!(!topo.is_entry("d"));
    }

    #[test]
    fn disabled_steps_are_left_out_of_order() {
        let graph = Graph::new("g")
            .with_step(StepNode::new("a", "manual_trigger"))
            .with_step(StepNode::new("b", "no_op").disabled())
            .with_step(StepNode::new("c", "no_op"))
            .connect("a", "b")
            .connect("b", "c");
        let topo = Topology::build(&graph, &registry());
        assert_eq!(topo.order(), ["a", "c"]);
        assert!(topo.outgoing("a").is_empty());
        assert!(topo.incoming("c").is_empty());
        // `c` is still wired, so it is not an entry.
        assert!(topo.is_entry("a"));
        assert!(!topo.is_entry("c"));
    }

    #[test]
    fn back_edges_split_from_forward_edges() {
        let graph = Graph::new("loop")
            .with_step(StepNode::new("start", "manual_trigger"))
            .with_step(StepNode::new("batch", "split_in_batches").with_param("batch_size", json!(1)))
            .with_step(StepNode::new("work", "no_op"))
            .with_step(StepNode::new("after", "no_op"))
            .connect("start", "batch")
            .connect_ports("batch", "loop", "work", "main")
            .connect_ports("work", "main", "batch", "continue")
            .connect_ports("batch", "done", "after", "main");
        let topo = Topology::build(&graph, &registry());

        assert!(topo.is_back_edge(2));
        assert_eq!(topo.back_outgoing("work"), &[2]);
        assert!(topo.outgoing("work").is_empty());
        assert_eq!(topo.incoming("batch"), &[0]);

        let body: Vec<String> = topo.downstream(&graph, "batch").into_iter().collect();
        assert_eq!(body, vec!["after", "work"]);

        let core: Vec<String> = topo.loop_core(&graph, "batch").into_iter().collect();
        assert_eq!(core, vec!["work"]);
    }

    #[test]
    fn loop_core_covers_multi_step_bodies_only() {
        let graph = Graph::new("loop")
            .with_step(StepNode::new("start", "manual_trigger"))
            .with_step(StepNode::new("batch", "split_in_batches"))
            .with_step(StepNode::new("fetch", "no_op"))
            .with_step(StepNode::new("shape", "no_op"))
            .with_step(StepNode::new("audit", "no_op"))
            .with_step(StepNode::new("after", "no_op"))
            .connect("start", "batch")
            .connect_ports("batch", "loop", "fetch", "main")
            .connect("fetch", "shape")
            .connect("fetch", "audit")
            .connect_ports("shape", "main", "batch", "continue")
            .connect_ports("batch", "done", "after", "main");
        let topo = Topology::build(&graph, &registry());

        let core: Vec<String> = topo.loop_core(&graph, "batch").into_iter().collect();
        assert_eq!(core, vec!["fetch", "shape"]);
        let up: Vec<String> = topo.upstream(&graph, "shape").into_iter().collect();
        assert_eq!(up, vec!["batch", "fetch", "start"]);
    }

    #[test]
    fn reachability_from_start_step() {
        let graph = Graph::new("g")
            .with_step(StepNode::new("a", "manual_trigger"))
            .with_step(StepNode::new("b", "no_op"))
            .with_step(StepNode::new("c", "no_op"))
            .connect("a", "b")
            .connect("b", "c");
        let topo = Topology::build(&graph, &registry());
        let reachable = topo.reachable_from(&graph, "b");
        assert!(reachable.contains("b") && reachable.contains("c"));
        assert!(!reachable.contains("a"));
    }
}
