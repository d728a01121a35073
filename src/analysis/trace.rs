//! The record of one evaluation pass: which calls ran, who asked for them, and
//! in what order they started and finished.

use crate::store::CallKey;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEvent {
    /// Start order within the pass.
    pub order: usize,
    pub key: CallKey,
    /// Order of the event that requested this call; `None` for controller calls.
    pub caller: Option<usize>,
    /// Finish order within the pass; `None` while the call is still open.
    pub completion: Option<usize>,
    /// Nesting depth, 1 for controller calls.
    pub depth: usize,
}

/// A read of `callee` made while event `caller` was running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub caller: usize,
    pub callee: CallKey,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    events: Vec<CallEvent>,
    edges: Vec<Edge>,
    // completion index -> event order
    finished: Vec<usize>,
}

impl ExecutionTrace {
    pub fn new() -> Self { Self::default() }

    pub(crate) fn push_event(&mut self, event: CallEvent) {
        debug_assert_eq!(event.order, self.events.len());
        self.events.push(event);
    }

    pub(crate) fn push_edge(&mut self, caller: usize, callee: CallKey) {
        self.edges.push(Edge { caller, callee });
    }

    pub(crate) fn complete(&mut self, order: usize, completion: usize) {
        debug_assert_eq!(completion, self.finished.len());
        if let Some(event) = self.events.get_mut(order) {
            event.completion = Some(completion);
        }
        self.finished.push(order);
    }

    pub fn events(&self) -> &[CallEvent] { &self.events }
    pub fn edges(&self) -> &[Edge] { &self.edges }
    pub fn event(&self, order: usize) -> Option<&CallEvent> { self.events.get(order) }

    /// Event orders in the sequence the calls finished.
    pub fn completion_order(&self) -> &[usize] { &self.finished }

    pub fn len(&self) -> usize { self.events.len() }
    pub fn is_empty(&self) -> bool { self.events.is_empty() }

    /// True when every recorded call has finished.
    pub fn is_complete(&self) -> bool { self.finished.len() == self.events.len() }

    /// Reads made by event `order`, in the order they happened.
    pub fn reads_of(&self, order: usize) -> impl Iterator<Item = &Edge> + '_ {
        self.edges.iter().filter(move |e| e.caller == order)
    }

    /// Controller-level calls, i.e. the roots of the call forest.
    pub fn roots(&self) -> impl Iterator<Item = &CallEvent> + '_ {
        self.events.iter().filter(|e| e.caller.is_none())
    }
}
