//! Reverse-mode backward traversal.
//!
//! A pass starts from a set of heads (recorded values or variables), seeds
//! each with an output gradient, and walks the tape from consumers to
//! producers. A node runs its backward function exactly once, after every
//! reachable consumer has added its contribution to the node's output
//! gradients. Contributions reaching a variable leaf are summed and then
//! written into the variable's buffer according to its [`GradReq`].
//!
//! A pass is atomic: the traversal order, every gradient and every shape check
//! is computed before the first buffer is written or the first node is freed,
//! so a failing call leaves no partial state behind.
//!
//! Unless `retain_graph` is set, every node the pass visited loses its
//! backward function afterwards; reaching such a node again is a
//! [`AutogradError::GraphAlreadyConsumed`] error.
//!
//! [`GradReq`]: crate::variable::GradReq

use crate::error::{AutogradError, Result};
use crate::mode::{self, ModeState};
use crate::ops::cpu;
use crate::tape::{BackwardFn, Edge, NodeId, NodeKind, Tape, with_tape};
use crate::tensors::Tensor;
use crate::variable::GradReq;
use log::{debug, trace};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// Knobs of a backward pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackwardOptions {
    /// Keep the visited nodes alive for another pass.
    pub retain_graph: bool,
    /// Training flag seen by backward functions; defaults to the flag each
    /// node was recorded under.
    pub train_mode: Option<bool>,
}

impl BackwardOptions {
    /// Sets `retain_graph`.
    #[must_use]
    pub fn retain_graph(mut self, retain: bool) -> Self {
        self.retain_graph = retain;
        self
    }

    /// Sets `train_mode`.
    #[must_use]
    pub fn train_mode(mut self, training: bool) -> Self {
        self.train_mode = Some(training);
        self
    }
}

/// Back-propagates from `heads`, seeding each with ones.
pub fn backward(heads: &[&Tensor]) -> Result<()> {
    backward_with(heads, None, BackwardOptions::default())
}

/// Back-propagates from `heads` into the gradient buffers of every reachable
/// variable.
///
/// `head_grads`, when given, holds one seed per head. Heads without a seed,
/// and every head when `head_grads` is `None`, are seeded with ones.
///
/// # Errors
/// - [`AutogradError::NotInGraph`] if a head was neither recorded nor marked
/// - [`AutogradError::LengthMismatch`] / [`AutogradError::ShapeMismatch`] for
///   malformed seeds or gradient contributions
/// - [`AutogradError::GraphAlreadyConsumed`] if an earlier pass without
///   `retain_graph` freed part of the graph
pub fn backward_with(
    heads: &[&Tensor],
    head_grads: Option<&[Option<Tensor>]>,
    options: BackwardOptions,
) -> Result<()> {
    let pass = Pass::prepare(heads, head_grads)?;
    let mut grads = pass.run(options)?;
    pass.write_buffers(&mut grads);
    pass.finish(options.retain_graph);
    Ok(())
}

/// Computes the gradients of `heads` with respect to `variables` and returns
/// them, leaving the variables' buffers and fresh flags untouched.
///
/// Variables the heads do not depend on get zeros.
///
/// # Errors
/// As [`backward_with`], plus [`AutogradError::NotAVariable`] if an entry of
/// `variables` is not a registered variable.
pub fn grad(
    heads: &[&Tensor],
    variables: &[&Tensor],
    head_grads: Option<&[Option<Tensor>]>,
    options: BackwardOptions,
) -> Result<Vec<Tensor>> {
    let mut targets = Vec::with_capacity(variables.len());
    for var in variables {
        let edge = var.entry().ok_or(AutogradError::NotAVariable)?;
        let id = edge.node.id();
        let is_variable = with_tape(|tape| tape.node(id).variable_info().is_some());
        if !is_variable {
            return Err(AutogradError::NotAVariable);
        }
        targets.push(edge);
    }

    let pass = Pass::prepare(heads, head_grads)?;
    let mut grads = pass.run(options)?;
    let result = variables
        .iter()
        .zip(&targets)
        .map(|(var, edge)| {
            grads
                .get_mut(&edge.node.id())
                .and_then(|slots| slots[0].take())
                .unwrap_or_else(|| var.zeros_like())
        })
        .collect();
    pass.finish(options.retain_graph);
    Ok(result)
}

impl Tensor {
    /// Back-propagates from this tensor, seeded with ones.
    pub fn backward(&self) -> Result<()> {
        backward(&[self])
    }

    /// Back-propagates from this tensor with an optional seed and options.
    pub fn backward_with(&self, out_grad: Option<&Tensor>, options: BackwardOptions) -> Result<()> {
        match out_grad {
            Some(seed) => backward_with(&[self], Some(&[Some(seed.clone())]), options),
            None => backward_with(&[self], None, options),
        }
    }
}

enum Step {
    Variable,
    Op {
        backward: Rc<BackwardFn>,
        training: bool,
    },
}

/// What a pass needs from one node, copied out of the tape.
struct Visit {
    id: NodeId,
    op: Cow<'static, str>,
    inputs: Vec<Option<(NodeId, usize)>>,
    output_shapes: Vec<Vec<usize>>,
    step: Step,
}

type GradSlots = HashMap<NodeId, Vec<Option<Tensor>>>;

struct Pass {
    /// Pins the graph for the duration of the pass.
    heads: Vec<Edge>,
    seeds: Vec<Tensor>,
    /// Consumers before producers.
    order: Vec<Visit>,
    position: HashMap<NodeId, usize>,
}

impl Pass {
    fn prepare(heads: &[&Tensor], head_grads: Option<&[Option<Tensor>]>) -> Result<Self> {
        let mut edges = Vec::with_capacity(heads.len());
        for head in heads {
            edges.push(head.entry().ok_or(AutogradError::NotInGraph)?);
        }

        let seeds = match head_grads {
            Some(seeds) => {
                if seeds.len() != heads.len() {
                    return Err(AutogradError::LengthMismatch {
                        what: "head gradients",
                        expected: heads.len(),
                        got: seeds.len(),
                    });
                }
                for (head, seed) in heads.iter().zip(seeds) {
                    if let Some(seed) = seed {
                        if seed.shape() != head.shape() {
                            return Err(AutogradError::ShapeMismatch {
                                expected: head.shape().to_vec(),
                                got: seed.shape().to_vec(),
                            });
                        }
                    }
                }
                heads
                    .iter()
                    .zip(seeds)
                    .map(|(head, seed)| {
                        seed.as_ref().map_or_else(|| head.ones_like(), Tensor::detach)
                    })
                    .collect()
            }
            None => heads.iter().map(|head| head.ones_like()).collect(),
        };

        let roots: Vec<NodeId> = edges.iter().map(|edge| edge.node.id()).collect();
        let order = with_tape(|tape| topological_order(tape, &roots))?;
        let position = order
            .iter()
            .enumerate()
            .map(|(i, visit)| (visit.id, i))
            .collect();
        debug!(
            "backward: {} heads over {} nodes",
            heads.len(),
            order.len()
        );
        Ok(Self {
            heads: edges,
            seeds,
            order,
            position,
        })
    }

    fn run(&self, options: BackwardOptions) -> Result<GradSlots> {
        let mut grads: GradSlots = self
            .order
            .iter()
            .map(|visit| (visit.id, vec![None; visit.output_shapes.len()]))
            .collect();
        for (edge, seed) in self.heads.iter().zip(&self.seeds) {
            accumulate(&mut grads, edge.node.id(), edge.output, seed.clone());
        }

        let _replay = mode::scope(ModeState {
            recording: false,
            training: mode::is_training(),
        });
        for visit in &self.order {
            let Step::Op { backward, training } = &visit.step else {
                continue;
            };
            let slots = grads
                .get_mut(&visit.id)
                .map(core::mem::take)
                .unwrap_or_default();
            if slots.iter().all(Option::is_none) {
                trace!("backward: `{}` receives no gradient", visit.op);
                continue;
            }
            let out_grads: Vec<Tensor> = slots
                .into_iter()
                .zip(&visit.output_shapes)
                .map(|(grad, shape)| grad.unwrap_or_else(|| Tensor::zeros(shape.clone())))
                .collect();

            trace!("backward: `{}`", visit.op);
            let contributions = {
                let _mode = mode::scope(ModeState {
                    recording: false,
                    training: options.train_mode.unwrap_or(*training),
                });
                (backward.as_ref())(out_grads.as_slice())?
            };
            if contributions.len() != visit.inputs.len() {
                return Err(AutogradError::Function(format!(
                    "`{}` returned {} input gradients for {} inputs",
                    visit.op,
                    contributions.len(),
                    visit.inputs.len()
                )));
            }

            for (input, contribution) in visit.inputs.iter().zip(contributions) {
                let (Some((producer, output)), Some(contribution)) = (input, contribution) else {
                    continue;
                };
                let expected = &self.order[self.position[producer]].output_shapes[*output];
                if contribution.shape() != expected.as_slice() {
                    return Err(AutogradError::ShapeMismatch {
                        expected: expected.clone(),
                        got: contribution.shape().to_vec(),
                    });
                }
                accumulate(&mut grads, *producer, *output, contribution.detach());
            }
        }
        Ok(grads)
    }

    /// Writes the gradients that reached variables into their buffers.
    fn write_buffers(&self, grads: &mut GradSlots) {
        let reached: Vec<(NodeId, Tensor)> = self
            .order
            .iter()
            .filter(|visit| matches!(visit.step, Step::Variable))
            .filter_map(|visit| {
                let grad = grads.get_mut(&visit.id)?.first_mut()?.take()?;
                Some((visit.id, grad))
            })
            .collect();

        let buffers: Vec<(Tensor, GradReq)> = with_tape(|tape| {
            reached
                .iter()
                .filter_map(|(id, _)| tape.node(*id).variable_info())
                .map(|info| (info.grad.clone(), info.req))
                .collect()
        });

        for ((_, grad), (buffer, req)) in reached.iter().zip(&buffers) {
            match req {
                GradReq::Write => buffer.copy_from(grad),
                GradReq::Add => cpu::add_assign(buffer, grad),
                GradReq::Null => {}
            }
        }

        with_tape(|tape| {
            for (id, _) in &reached {
                if let Some(info) = tape.node_mut(*id).variable_info_mut() {
                    if info.req != GradReq::Null {
                        info.fresh = true;
                    }
                }
            }
        });
        debug!("backward: wrote {} variable gradients", reached.len());
    }

    /// Frees the backward functions of visited nodes unless retained.
    fn finish(self, retain_graph: bool) {
        if retain_graph {
            return;
        }
        let released: Vec<Rc<BackwardFn>> = with_tape(|tape| {
            self.order
                .iter()
                .filter_map(|visit| match &mut tape.node_mut(visit.id).kind {
                    NodeKind::Op { backward, .. } => backward.take(),
                    NodeKind::Variable(_) => None,
                })
                .collect()
        });
        trace!("backward: freed {} nodes", released.len());
        drop(released);
    }
}

fn accumulate(grads: &mut GradSlots, id: NodeId, output: usize, grad: Tensor) {
    let Some(slot) = grads.get_mut(&id).and_then(|slots| slots.get_mut(output)) else {
        return;
    };
    *slot = Some(match slot.take() {
        Some(previous) => cpu::add_values(&previous, &grad),
        None => grad,
    });
}

/// Orders every node reachable from `roots` so that consumers come before
/// their producers, failing on the first consumed node.
fn topological_order(tape: &Tape, roots: &[NodeId]) -> Result<Vec<Visit>> {
    let mut visited = HashSet::new();
    let mut post_order = Vec::new();
    let mut stack: Vec<(NodeId, bool)> = roots.iter().rev().map(|&id| (id, false)).collect();

    while let Some((id, expanded)) = stack.pop() {
        let node = tape.node(id);
        if expanded {
            let step = match &node.kind {
                NodeKind::Variable(_) => Step::Variable,
                NodeKind::Op {
                    backward: Some(backward),
                    training,
                } => Step::Op {
                    backward: Rc::clone(backward),
                    training: *training,
                },
                NodeKind::Op { backward: None, .. } => {
                    return Err(AutogradError::GraphAlreadyConsumed {
                        op: node.op.to_string(),
                    });
                }
            };
            post_order.push(Visit {
                id,
                op: node.op.clone(),
                inputs: node.input_ids(),
                output_shapes: node.output_shapes.clone(),
                step,
            });
            continue;
        }
        if !visited.insert(id) {
            continue;
        }
        stack.push((id, true));
        for (input, _) in node.input_ids().into_iter().rev().flatten() {
            if !visited.contains(&input) {
                stack.push((input, false));
            }
        }
    }

    post_order.reverse();
    Ok(post_order)
}
