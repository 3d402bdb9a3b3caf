//! Structural graph model over a pipeline definition
//!
//! Purely structural: construction plus accessors. Behavior (validation,
//! scheduling) lives in the validator and the executor, both of which
//! work against this model.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::error::ValidationError;
use crate::types::{Connection, Pipeline, PortRef, Step};

/// Indexed view of a pipeline's steps and connections.
pub struct PipelineGraph {
    steps: BTreeMap<String, Step>,
    connections: Vec<Connection>,
    incoming: HashMap<String, Vec<usize>>,
    outgoing: HashMap<String, Vec<usize>>,
    by_target: HashMap<PortRef, usize>,
    graph: DiGraph<String, usize>,
    nodes: HashMap<String, NodeIndex>,
}

impl PipelineGraph {
    /// Builds the model, failing with `MalformedGraph` when a connection
    /// references an unknown step or port.
    pub fn build(pipeline: &Pipeline) -> Result<Self, ValidationError> {
        let mut steps = BTreeMap::new();
        for step in &pipeline.steps {
            if steps.insert(step.id.clone(), step.clone()).is_some() {
                return Err(ValidationError::MalformedGraph(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();
        for id in steps.keys() {
            let index = graph.add_node(id.clone());
            nodes.insert(id.clone(), index);
        }

        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_target = HashMap::new();

        for (i, conn) in pipeline.connections.iter().enumerate() {
            let source_step = steps.get(&conn.source.step_id).ok_or_else(|| {
                ValidationError::MalformedGraph(format!(
                    "connection '{}' sources unknown step '{}'",
                    conn.id, conn.source.step_id
                ))
            })?;
            let target_step = steps.get(&conn.target.step_id).ok_or_else(|| {
                ValidationError::MalformedGraph(format!(
                    "connection '{}' targets unknown step '{}'",
                    conn.id, conn.target.step_id
                ))
            })?;
            if source_step.kind().output_port(&conn.source.port).is_none() {
                return Err(ValidationError::MalformedGraph(format!(
                    "connection '{}' sources unknown port '{}'",
                    conn.id, conn.source
                )));
            }
            if target_step.kind().input_port(&conn.target.port).is_none() {
                return Err(ValidationError::MalformedGraph(format!(
                    "connection '{}' targets unknown port '{}'",
                    conn.id, conn.target
                )));
            }

            incoming.entry(conn.target.step_id.clone()).or_default().push(i);
            outgoing.entry(conn.source.step_id.clone()).or_default().push(i);
            // Later duplicates are reported by the validator; keep the first.
            by_target.entry(conn.target.clone()).or_insert(i);
            graph.add_edge(
                nodes[&conn.source.step_id],
                nodes[&conn.target.step_id],
                i,
            );
        }

        Ok(Self {
            steps,
            connections: pipeline.connections.clone(),
            incoming,
            outgoing,
            by_target,
            graph,
            nodes,
        })
    }

    pub fn steps_by_id(&self) -> &BTreeMap<String, Step> {
        &self.steps
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.get(id)
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Connections terminating at `step_id`.
    pub fn incoming(&self, step_id: &str) -> impl Iterator<Item = &Connection> {
        self.incoming
            .get(step_id)
            .into_iter()
            .flatten()
            .map(|&i| &self.connections[i])
    }

    /// Connections originating at `step_id`.
    pub fn outgoing(&self, step_id: &str) -> impl Iterator<Item = &Connection> {
        self.outgoing
            .get(step_id)
            .into_iter()
            .flatten()
            .map(|&i| &self.connections[i])
    }

    /// The unique connection feeding a target port, if any.
    pub fn source_of(&self, target: &PortRef) -> Option<&Connection> {
        self.by_target.get(target).map(|&i| &self.connections[i])
    }

    /// Distinct upstream step ids of `step_id`.
    pub fn upstream(&self, step_id: &str) -> BTreeSet<&str> {
        self.incoming(step_id)
            .map(|c| c.source.step_id.as_str())
            .collect()
    }

    /// Distinct downstream step ids of `step_id`.
    pub fn downstream(&self, step_id: &str) -> BTreeSet<&str> {
        self.outgoing(step_id)
            .map(|c| c.target.step_id.as_str())
            .collect()
    }

    /// Steps with no inbound connections, in id order.
    pub fn sources(&self) -> Vec<&str> {
        self.steps
            .keys()
            .filter(|id| self.incoming(id).next().is_none())
            .map(String::as_str)
            .collect()
    }

    /// Kahn's algorithm with step-id tie-breaking for determinism.
    /// On a cycle, returns the residual step ids sorted.
    pub fn kahn_order(&self) -> Result<Vec<String>, Vec<String>> {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        for id in self.steps.keys() {
            in_degree.insert(id, 0);
        }
        for (id, node) in &self.nodes {
            // Distinct upstream steps only; parallel port connections
            // between the same pair count once.
            let degree = self
                .graph
                .neighbors_directed(*node, Direction::Incoming)
                .collect::<BTreeSet<_>>()
                .len();
            in_degree.insert(id, degree);
        }

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());

        while let Some(&id) = ready.iter().next() {
            ready.remove(id);
            order.push(id.to_string());
            for next in self.downstream(id) {
                let d = in_degree.get_mut(next).expect("known step");
                // Parallel edges between a pair count once here because
                // downstream() deduplicates; mirror that in the decrement.
                *d = d.saturating_sub(1);
                if *d == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() == self.steps.len() {
            Ok(order)
        } else {
            let mut residue: Vec<String> = self
                .steps
                .keys()
                .filter(|id| !order.contains(*id))
                .cloned()
                .collect();
            residue.sort();
            Err(residue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;

    fn transform_step(id: &str) -> Step {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            config: StepConfig::Transform(TransformConfig::Aggregate {}),
            enabled: true,
            timeout_ms: 1000,
            max_attempts: 1,
            retry_backoff: RetryBackoff::default(),
            estimate: None,
            position: Position::default(),
        }
    }

    fn conn(id: &str, from: (&str, &str), to: (&str, &str)) -> Connection {
        Connection {
            id: id.to_string(),
            source: PortRef::new(from.0, from.1),
            target: PortRef::new(to.0, to.1),
            label: None,
        }
    }

    fn pipeline(steps: Vec<Step>, connections: Vec<Connection>) -> Pipeline {
        Pipeline {
            id: "p".into(),
            name: "p".into(),
            version: "1".into(),
            variables: Default::default(),
            steps,
            connections,
        }
    }

    #[test]
    fn test_accessors() {
        let p = pipeline(
            vec![transform_step("a"), transform_step("b")],
            vec![conn("c1", ("a", "result"), ("b", "data"))],
        );
        let g = PipelineGraph::build(&p).unwrap();
        assert_eq!(g.sources(), vec!["a"]);
        assert_eq!(g.upstream("b").into_iter().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(
            g.source_of(&PortRef::new("b", "data")).unwrap().id,
            "c1"
        );
        assert!(g.source_of(&PortRef::new("a", "data")).is_none());
    }

    #[test]
    fn test_unknown_port_is_malformed() {
        let p = pipeline(
            vec![transform_step("a"), transform_step("b")],
            vec![conn("c1", ("a", "bogus"), ("b", "data"))],
        );
        assert!(matches!(
            PipelineGraph::build(&p),
            Err(ValidationError::MalformedGraph(_))
        ));
    }

    #[test]
    fn test_kahn_is_deterministic_and_detects_cycles() {
        // Diamond: a -> {b, c} -> d. Ties break by id.
        let p = pipeline(
            vec![
                transform_step("d"),
                transform_step("b"),
                transform_step("c"),
                transform_step("a"),
            ],
            vec![
                conn("c1", ("a", "result"), ("b", "data")),
                conn("c2", ("a", "result"), ("c", "data")),
                conn("c3", ("b", "result"), ("d", "data")),
            ],
        );
        let g = PipelineGraph::build(&p).unwrap();
        assert_eq!(g.kahn_order().unwrap(), vec!["a", "b", "c", "d"]);

        let cyclic = pipeline(
            vec![transform_step("a"), transform_step("b")],
            vec![
                conn("c1", ("a", "result"), ("b", "data")),
                conn("c2", ("b", "result"), ("a", "data")),
            ],
        );
        let g = PipelineGraph::build(&cyclic).unwrap();
        assert_eq!(g.kahn_order().unwrap_err(), vec!["a", "b"]);
    }
}
