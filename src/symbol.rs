//! Structural snapshots of recorded graphs.

use crate::error::{AutogradError, Result};
use crate::tape::{NodeId, NodeKind, with_tape};
use crate::tensors::Tensor;
use core::fmt;
use std::collections::HashMap;

/// One node of a [`Symbol`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolNode {
    /// Operation name, or `"variable"` for arguments.
    pub op: String,
    /// Unique name within the symbol.
    pub name: String,
    /// `(node index, output index)` of each tracked input.
    pub inputs: Vec<(usize, usize)>,
}

/// The graph reachable from a recorded value, in topological order.
///
/// Registered variables are the symbol's arguments; each appears once however
/// many paths reach it. Inputs that were never tracked are not part of the
/// symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    nodes: Vec<SymbolNode>,
    output: (usize, usize),
}

impl Symbol {
    /// Names of the argument variables, in first-use order.
    pub fn list_arguments(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|node| node.op == "variable")
            .map(|node| node.name.clone())
            .collect()
    }

    /// Names of the operation nodes, producers first.
    pub fn list_operators(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|node| node.op != "variable")
            .map(|node| node.name.clone())
            .collect()
    }

    pub fn nodes(&self) -> &[SymbolNode] {
        &self.nodes
    }

    /// `(node index, output index)` of the value the symbol was taken from.
    pub fn output(&self) -> (usize, usize) {
        self.output
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            if node.inputs.is_empty() {
                writeln!(f, "{}", node.name)?;
                continue;
            }
            let inputs: Vec<String> = node
                .inputs
                .iter()
                .map(|&(index, output)| format!("{}[{output}]", self.nodes[index].name))
                .collect();
            writeln!(f, "{} = {}({})", node.name, node.op, inputs.join(", "))?;
        }
        Ok(())
    }
}

/// Describes the graph that produced `value`.
///
/// # Errors
/// [`AutogradError::NotInGraph`] if `value` was neither recorded nor marked.
pub fn get_symbol(value: &Tensor) -> Result<Symbol> {
    let edge = value.entry().ok_or(AutogradError::NotInGraph)?;
    let root = edge.node.id();
    let symbol = with_tape(|tape| {
        let mut index: HashMap<NodeId, usize> = HashMap::new();
        let mut nodes = Vec::new();
        let mut op_counts: HashMap<String, usize> = HashMap::new();
        let mut stack = vec![(root, false)];

        while let Some((id, expanded)) = stack.pop() {
            if index.contains_key(&id) {
                continue;
            }
            let node = tape.node(id);
            let inputs = node.input_ids();
            if !expanded {
                stack.push((id, true));
                stack.extend(
                    inputs
                        .iter()
                        .rev()
                        .flatten()
                        .filter(|(input, _)| !index.contains_key(input))
                        .map(|&(input, _)| (input, false)),
                );
                continue;
            }
            let name = match &node.kind {
                NodeKind::Variable(info) => info.name.clone(),
                NodeKind::Op { .. } => {
                    let count = op_counts.entry(node.op.to_string()).or_default();
                    let name = format!("{}{count}", node.op);
                    *count += 1;
                    name
                }
            };
            let inputs = inputs
                .into_iter()
                .flatten()
                .map(|(input, output)| (index[&input], output))
                .collect();
            index.insert(id, nodes.len());
            nodes.push(SymbolNode {
                op: node.op.to_string(),
                name,
                inputs,
            });
        }
        Symbol {
            output: (index[&root], edge.output),
            nodes,
        }
    });
    Ok(symbol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode;

    #[test]
    fn untracked_value_has_no_symbol() {
        assert_eq!(get_symbol(&Tensor::ones([1])), Err(AutogradError::NotInGraph));
    }

    #[test]
    fn variable_is_its_own_symbol() {
        let x = Tensor::ones([1]);
        x.attach_grad();
        let symbol = get_symbol(&x).unwrap();
        assert_eq!(symbol.list_arguments().len(), 1);
        assert!(symbol.list_operators().is_empty());
    }

    #[test]
    fn shared_subexpressions_appear_once() {
        let x = Tensor::ones([1]);
        x.attach_grad();
        let _rec = mode::record(None);
        let a = crate::backprop::exp(&x);
        let y = &a * &a;
        let symbol = get_symbol(&y).unwrap();
        assert_eq!(symbol.list_operators(), vec!["exp0", "mul0"]);
        assert_eq!(symbol.nodes()[2].inputs, vec![(1, 0), (1, 0)]);
        assert_eq!(symbol.output(), (2, 0));
    }
}
