//! Last-use analysis over a completed trial trace.
//!
//! Edges point reader -> callee and carry the reader's completion index. A
//! value's last use is the latest completion among its readers; a value with no
//! readers (a sink) is last used by its own completion.
//!
//! Readers are ranked by completion rather than start order. An enclosing call
//! can read a value, call a child that reads it too, and then read it again; the
//! enclosing call finishes last, so it is the one that must keep the value alive.

use super::trace::ExecutionTrace;
use crate::compute::ledger::{ComputationError, EvalResult};
use crate::store::{CallKey, Registry};
use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

/// Mapping of cache key to the completion index after which it is dead.
/// Entries keep the order in which the keys were first produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastUseTable {
    entries: Vec<(CallKey, usize)>,
    index: HashMap<CallKey, usize>,
}

impl LastUseTable {
    pub fn get(&self, key: &CallKey) -> Option<usize> {
        self.index.get(key).map(|&i| self.entries[i].1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (CallKey, usize)> + '_ {
        self.entries.iter().copied()
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

/// The call graph of one pass, one node per distinct cache key.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<CallKey, usize>,
    nodes: HashMap<CallKey, NodeIndex>,
    // Own completion index, per node
    produced: Vec<usize>,
}

impl DependencyGraph {
    pub fn from_trace(trace: &ExecutionTrace) -> EvalResult<Self> {
        if !trace.is_complete() {
            return Err(ComputationError::Model("cannot analyse a trace with unfinished calls".into()));
        }

        let mut graph: DiGraph<CallKey, usize> = DiGraph::with_capacity(trace.len(), trace.edges().len());
        let mut nodes: HashMap<CallKey, NodeIndex> = HashMap::with_capacity(trace.len());
        let mut produced: Vec<usize> = Vec::with_capacity(trace.len());

        for event in trace.events() {
            let completion = event.completion.unwrap_or_default();
            match nodes.get(&event.key) {
                // A key produced twice (recomputed after eviction) is dead after its last production.
                Some(&node) => {
                    let slot = &mut produced[node.index()];
                    *slot = (*slot).max(completion);
                }
                None => {
                    let node = graph.add_node(event.key);
                    nodes.insert(event.key, node);
                    produced.push(completion);
                }
            }
        }

        for edge in trace.edges() {
            let reader = trace.event(edge.caller).ok_or_else(|| {
                ComputationError::Model(format!("edge from unknown call #{}", edge.caller))
            })?;
            let (Some(&from), Some(&to)) = (nodes.get(&reader.key), nodes.get(&edge.callee)) else {
                return Err(ComputationError::Model("edge to a call that never ran".into()));
            };
            let weight = reader.completion.unwrap_or_default();
            match graph.find_edge(from, to) {
                Some(e) => graph[e] = graph[e].max(weight),
                None => { graph.add_edge(from, to, weight); }
            }
        }

        Ok(Self { graph, nodes, produced })
    }

    pub fn node_count(&self) -> usize { self.graph.node_count() }
    pub fn edge_count(&self) -> usize { self.graph.edge_count() }

    /// Keys that read `key` at least once.
    pub fn readers(&self, key: &CallKey) -> Vec<CallKey> {
        let Some(&node) = self.nodes.get(key) else { return Vec::new() };
        let mut readers: Vec<CallKey> = self.graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|n| self.graph[n])
            .collect();
        readers.sort();
        readers.dedup();
        readers
    }

    /// Keys with no readers other than the controller.
    pub fn sinks(&self) -> Vec<CallKey> {
        self.graph.node_indices()
            .filter(|&n| self.graph.neighbors_directed(n, Direction::Incoming).next().is_none())
            .map(|n| self.graph[n])
            .collect()
    }

    pub fn last_use(&self) -> LastUseTable {
        let mut table = LastUseTable::default();
        for node in self.graph.node_indices() {
            let own = self.produced[node.index()];
            let last = self.graph
                .edges_directed(node, Direction::Incoming)
                .map(|e| *e.weight())
                .fold(own, usize::max);
            table.index.insert(self.graph[node], table.entries.len());
            table.entries.push((self.graph[node], last));
        }
        table
    }

    /// Graphviz rendering with `name(t)` labels; edges point from reader to callee.
    pub fn to_dot<D>(&self, registry: &Registry<D>) -> String {
        let labelled = self.graph.map(|_, key| registry.label(*key).to_string(), |_, w| *w);
        format!("{}", Dot::with_config(&labelled, &[Config::EdgeNoLabel]))
    }
}

/// Convenience: trace straight to last-use table.
pub fn analyze(trace: &ExecutionTrace) -> EvalResult<LastUseTable> {
    Ok(DependencyGraph::from_trace(trace)?.last_use())
}
