//! The per-thread operation tape.
//!
//! Recorded operations and registered variables live as [`Node`]s in an arena
//! of slots. Edges between nodes are slot indices, never pointers, and each
//! slot carries a count of the [`NodeHandle`]s that point at it: handles are
//! held by values produced by the node and by the input edges of downstream
//! nodes. A slot is reclaimed as soon as its count reaches zero, which in turn
//! releases the edges it held.
//!
//! A node keeps its backward function until a non-retained backward pass
//! consumes it. A consumed node stays in the arena (so later passes can report
//! it) but can no longer propagate gradients.

use crate::{error::Result, tensors::Tensor, variable::GradReq};
use core::cell::RefCell;
use core::marker::PhantomData;
use log::trace;
use std::borrow::Cow;
use std::rc::Rc;

/// Maps the gradients of a node's outputs to gradient contributions for its
/// inputs, in input order. `None` means no contribution.
pub(crate) type BackwardFn = dyn Fn(&[Tensor]) -> Result<Vec<Option<Tensor>>>;

/// Erases a backward closure into the shape stored on the tape.
pub(crate) fn backward_fn<F>(f: F) -> Rc<BackwardFn>
where
    F: Fn(&[Tensor]) -> Result<Vec<Option<Tensor>>> + 'static,
{
    Rc::new(f)
}

/// Index of a slot in the tape arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct NodeId(usize);

/// Gradient sink of a registered variable.
#[derive(Debug)]
pub(crate) struct VariableInfo {
    /// Shares storage with the buffer the caller registered.
    pub grad: Tensor,
    pub req: GradReq,
    pub fresh: bool,
    pub name: String,
}

pub(crate) enum NodeKind {
    Variable(VariableInfo),
    Op {
        /// `None` once consumed by a non-retained backward pass.
        backward: Option<Rc<BackwardFn>>,
        /// Training flag in effect when the forward pass ran.
        training: bool,
    },
}

/// One recorded operation or registered variable.
pub(crate) struct Node {
    pub op: Cow<'static, str>,
    pub inputs: Vec<Option<Edge>>,
    pub output_shapes: Vec<Vec<usize>>,
    pub kind: NodeKind,
    refs: usize,
}

impl Node {
    pub fn op(
        op: impl Into<Cow<'static, str>>,
        inputs: Vec<Option<Edge>>,
        output_shapes: Vec<Vec<usize>>,
        backward: Rc<BackwardFn>,
        training: bool,
    ) -> Self {
        Self {
            op: op.into(),
            inputs,
            output_shapes,
            kind: NodeKind::Op {
                backward: Some(backward),
                training,
            },
            refs: 0,
        }
    }

    pub fn variable(info: VariableInfo, shape: Vec<usize>) -> Self {
        Self {
            op: Cow::Borrowed("variable"),
            inputs: Vec::new(),
            output_shapes: vec![shape],
            kind: NodeKind::Variable(info),
            refs: 0,
        }
    }

    #[cfg(test)]
    pub fn is_consumed(&self) -> bool {
        matches!(self.kind, NodeKind::Op { backward: None, .. })
    }

    pub fn variable_info(&self) -> Option<&VariableInfo> {
        match &self.kind {
            NodeKind::Variable(info) => Some(info),
            NodeKind::Op { .. } => None,
        }
    }

    pub fn variable_info_mut(&mut self) -> Option<&mut VariableInfo> {
        match &mut self.kind {
            NodeKind::Variable(info) => Some(info),
            NodeKind::Op { .. } => None,
        }
    }

    /// Input edges as plain ids, for traversal while the graph is pinned.
    pub fn input_ids(&self) -> Vec<Option<(NodeId, usize)>> {
        self.inputs
            .iter()
            .map(|edge| edge.as_ref().map(|e| (e.node.id, e.output)))
            .collect()
    }
}

/// A counted reference to a tape slot.
///
/// Handles are bound to the thread whose tape they index.
#[derive(Debug)]
pub(crate) struct NodeHandle {
    id: NodeId,
    _thread: PhantomData<*const ()>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Gives up the handle without decrementing the count.
    fn into_id(self) -> NodeId {
        let id = self.id;
        core::mem::forget(self);
        id
    }
}

impl Clone for NodeHandle {
    fn clone(&self) -> Self {
        with_tape(|tape| tape.node_mut(self.id).refs += 1);
        Self {
            id: self.id,
            _thread: PhantomData,
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        release(self.id);
    }
}

/// The `output`-th value produced by `node`.
#[derive(Debug, Clone)]
pub(crate) struct Edge {
    pub node: NodeHandle,
    pub output: usize,
}

/// Arena of recorded nodes.
#[derive(Default)]
pub(crate) struct Tape {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    variables_created: usize,
}

impl Tape {
    pub fn node(&self, id: NodeId) -> &Node {
        self.slots[id.0]
            .as_ref()
            .expect("live handle points at a reclaimed tape slot")
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.slots[id.0]
            .as_mut()
            .expect("live handle points at a reclaimed tape slot")
    }

    fn insert(&mut self, mut node: Node) -> NodeId {
        node.refs = 1;
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(node);
                index
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        NodeId(index)
    }

    pub fn next_variable_name(&mut self) -> String {
        let name = format!("var{}", self.variables_created);
        self.variables_created += 1;
        name
    }

    fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

thread_local! {
    static TAPE: RefCell<Tape> = RefCell::new(Tape::default());
    /// Releases requested while the tape was borrowed.
    static DEFERRED: RefCell<Vec<NodeId>> = const { RefCell::new(Vec::new()) };
}

/// Runs `f` with exclusive access to this thread's tape.
///
/// `f` must not drop tensors that carry graph entries.
pub(crate) fn with_tape<R>(f: impl FnOnce(&mut Tape) -> R) -> R {
    let result = TAPE.with(|tape| f(&mut tape.borrow_mut()));
    drain_deferred();
    result
}

/// Adds a node to the tape and returns the first handle to it.
pub(crate) fn push(node: Node) -> NodeHandle {
    let id = with_tape(|tape| {
        let op = node.op.clone();
        let id = tape.insert(node);
        trace!("tape: recorded `{op}` in slot {}", id.0);
        id
    });
    NodeHandle {
        id,
        _thread: PhantomData,
    }
}

/// Number of live nodes on this thread's tape.
pub fn live_nodes() -> usize {
    TAPE.with(|tape| tape.borrow().live())
}

fn release(id: NodeId) {
    let released = TAPE.try_with(|tape| match tape.try_borrow_mut() {
        Ok(mut tape) => Some(release_in(&mut tape, id)),
        Err(_) => None,
    });
    match released {
        Ok(Some(dead)) => {
            // node contents may own tensors; drop them without the tape borrowed
            drop(dead);
            drain_deferred();
        }
        Ok(None) => DEFERRED.with(|deferred| deferred.borrow_mut().push(id)),
        // thread is shutting down, the arena goes with it
        Err(_) => {}
    }
}

fn release_in(tape: &mut Tape, id: NodeId) -> Vec<Node> {
    let mut pending = vec![id];
    let mut dead = Vec::new();
    while let Some(id) = pending.pop() {
        let node = tape.node_mut(id);
        node.refs -= 1;
        if node.refs > 0 {
            continue;
        }
        let Some(mut node) = tape.slots[id.0].take() else {
            continue;
        };
        tape.free.push(id.0);
        trace!("tape: reclaimed `{}` from slot {}", node.op, id.0);
        pending.extend(
            core::mem::take(&mut node.inputs)
                .into_iter()
                .flatten()
                .map(|edge| edge.node.into_id()),
        );
        dead.push(node);
    }
    dead
}

fn drain_deferred() {
    loop {
        let next = DEFERRED
            .try_with(|deferred| deferred.borrow_mut().pop())
            .ok()
            .flatten();
        match next {
            Some(id) => release(id),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(op: &'static str) -> Node {
        Node::op(op, Vec::new(), vec![vec![1]], backward_fn(|_: &[Tensor]| Ok(Vec::new())), false)
    }

    #[test]
    fn handles_keep_nodes_alive() {
        let before = live_nodes();
        let a = push(leaf("a"));
        let b = a.clone();
        assert_eq!(live_nodes(), before + 1);
        drop(a);
        assert_eq!(live_nodes(), before + 1);
        drop(b);
        assert_eq!(live_nodes(), before);
    }

    #[test]
    fn releasing_a_chain_reclaims_producers() {
        let before = live_nodes();
        let a = push(leaf("a"));
        let mut head = push(Node::op(
            "b",
            vec![Some(Edge { node: a, output: 0 })],
            vec![vec![1]],
            backward_fn(|_: &[Tensor]| Ok(vec![None])),
            false,
        ));
        for _ in 0..10_000 {
            head = push(Node::op(
                "c",
                vec![Some(Edge { node: head, output: 0 })],
                vec![vec![1]],
                backward_fn(|_: &[Tensor]| Ok(vec![None])),
                false,
            ));
        }
        assert_eq!(live_nodes(), before + 10_002);
        drop(head);
        assert_eq!(live_nodes(), before);
    }

    #[test]
    fn freed_slots_are_reused() {
        let a = push(leaf("a"));
        let id = a.id();
        drop(a);
        let b = push(leaf("b"));
        assert_eq!(b.id(), id);
    }
}
