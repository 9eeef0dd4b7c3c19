//! Gradient graph synthesis and backward dependency analysis.
//!
//! [`build_gradient`] appends the backward graph to a forward graph and
//! determines exactly which forward inputs, outputs and output-gradients the
//! backward pass reads. Everything not referenced is pruned from what the
//! forward pass must retain, which is the executor's main memory saving: a
//! forward value no gradient node reads can be released as soon as its last
//! forward consumer has run.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::graph::{Graph, GraphError, NodeId};
use crate::ops::{AddN, ZerosLike};

/// The backward half of a cached op: output-gradient placeholders, gradient
/// entries per forward input, and the backward dependency sets.
pub struct GradInfo {
    /// Number of graph nodes belonging to the forward pass. Nodes at or past
    /// this index form the gradient graph.
    pub num_forward_nodes: usize,

    /// Output-gradient placeholder value nodes, one per forward output.
    pub ograd_ids: Vec<NodeId>,

    /// Gradient entry per forward input, or None where no gradient flows.
    pub input_grad_ids: Vec<Option<NodeId>>,

    /// Indices of forward outputs whose gradients the backward pass reads.
    pub bwd_ograd_dep: Vec<usize>,

    /// Indices of forward inputs the backward pass reads.
    pub bwd_in_dep: Vec<usize>,

    /// Indices of forward outputs the backward pass reads.
    pub bwd_out_dep: Vec<usize>,

    /// Per forward input: must its value be retained for backward?
    pub save_inputs: Vec<bool>,

    /// Per forward output: must its value be retained for backward?
    pub save_outputs: Vec<bool>,
}

impl GradInfo {
    /// Total number of inputs the backward pass consumes.
    pub fn num_backward_inputs(&self) -> usize {
        self.bwd_ograd_dep.len() + self.bwd_in_dep.len() + self.bwd_out_dep.len()
    }

    /// Return true if the gradient graph contains no operator nodes, making
    /// backward a no-op assignment.
    pub fn is_empty(&self) -> bool {
        self.input_grad_ids.iter().all(|grad| grad.is_none())
    }
}

/// Fold a list of gradient contributions to one entry into a single entry,
/// summing with an accumulation node where multiple paths contribute.
fn fold_contributions(graph: &mut Graph, contributions: &[NodeId]) -> Option<NodeId> {
    match contributions {
        [] => None,
        [single] => Some(*single),
        many => Some(graph.add_simple_op(None, Arc::new(AddN {}), many)),
    }
}

/// Build the gradient graph for `outputs` with respect to `inputs`, appending
/// its nodes to `graph`.
///
/// Each forward output is treated as receiving an incoming gradient via a
/// placeholder value node. Operators are visited in reverse topological
/// order; each operator's gradient rule emits the nodes computing its input
/// gradients, and duplicate contributions to one entry are folded with an
/// accumulation node.
///
/// Fails with [`GraphError::NoGradient`] if any contributing forward
/// operator has no gradient rule. This is a construction-time failure; it
/// can never surface at call time.
pub fn build_gradient(
    graph: &mut Graph,
    inputs: &[NodeId],
    outputs: &[NodeId],
) -> Result<GradInfo, GraphError> {
    let num_forward_nodes = graph.len();

    let ograd_ids: Vec<NodeId> = (0..outputs.len())
        .map(|i| graph.add_value(Some(&format!("ograd{}", i))))
        .collect();

    // Gradient contributions per forward value entry.
    let mut contributions: FxHashMap<NodeId, Vec<NodeId>> = FxHashMap::default();
    for (output, ograd) in outputs.iter().zip(&ograd_ids) {
        contributions.entry(*output).or_default().push(*ograd);
    }

    // Snapshot the forward operator nodes so the graph can be extended while
    // we walk them in reverse topological (= reverse arena) order.
    let fwd_ops: Vec<_> = graph
        .operators_in(0..num_forward_nodes)
        .map(|(id, node)| {
            (
                id,
                node.input_ids().to_vec(),
                node.output_ids().to_vec(),
                node.operator_arc(),
            )
        })
        .collect();

    for (_op_id, in_ids, out_ids, op) in fwd_ops.iter().rev() {
        // Skip operators that contribute to no requested gradient.
        if !out_ids.iter().any(|id| contributions.contains_key(id)) {
            continue;
        }

        let mut ograds: Vec<NodeId> = Vec::with_capacity(out_ids.len());
        for id in out_ids {
            let folded = match contributions.remove(id) {
                Some(entries) => fold_contributions(graph, &entries),
                None => None,
            };
            // An output with no incoming gradient still needs an entry to
            // hand to the gradient rule.
            let entry = match folded {
                Some(entry) => entry,
                None => graph.add_simple_op(None, Arc::new(ZerosLike {}), &[*id]),
            };
            ograds.push(entry);
        }

        let grads = op
            .gradient(graph, in_ids, out_ids, &ograds)
            .ok_or_else(|| GraphError::NoGradient {
                op: op.name().to_string(),
            })?;
        debug_assert_eq!(
            grads.len(),
            in_ids.len(),
            "gradient rule must return one entry per input"
        );

        for (input, grad) in in_ids.iter().zip(grads) {
            if let Some(grad) = grad {
                contributions.entry(*input).or_default().push(grad);
            }
        }
    }

    let input_grad_ids: Vec<Option<NodeId>> = inputs
        .iter()
        .map(|id| {
            contributions
                .remove(id)
                .and_then(|entries| fold_contributions(graph, &entries))
        })
        .collect();

    // Liveness scan: classify every forward-era entry referenced by a
    // gradient node into the dependency sets. Internal forward entries
    // (intermediate activations) are not part of the sets; they are retained
    // through full-graph ref-counting when recording.
    let input_pos: FxHashMap<NodeId, usize> =
        inputs.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    let output_pos: FxHashMap<NodeId, usize> = outputs
        .iter()
        .enumerate()
        .map(|(i, &id)| (id, i))
        .collect();
    let ograd_pos: FxHashMap<NodeId, usize> = ograd_ids
        .iter()
        .enumerate()
        .map(|(i, &id)| (id, i))
        .collect();

    let mut ograd_dep = FxHashSet::default();
    let mut in_dep = FxHashSet::default();
    let mut out_dep = FxHashSet::default();
    for (_, node) in graph.operators_in(num_forward_nodes..graph.len()) {
        for entry in node.input_ids() {
            if let Some(&pos) = ograd_pos.get(entry) {
                ograd_dep.insert(pos);
            } else if *entry < num_forward_nodes {
                if let Some(&pos) = input_pos.get(entry) {
                    in_dep.insert(pos);
                } else if let Some(&pos) = output_pos.get(entry) {
                    out_dep.insert(pos);
                }
            }
        }
    }

    let mut bwd_ograd_dep: Vec<usize> = ograd_dep.into_iter().collect();
    let mut bwd_in_dep: Vec<usize> = in_dep.into_iter().collect();
    let mut bwd_out_dep: Vec<usize> = out_dep.into_iter().collect();
    bwd_ograd_dep.sort_unstable();
    bwd_in_dep.sort_unstable();
    bwd_out_dep.sort_unstable();

    let save_inputs = (0..inputs.len())
        .map(|i| bwd_in_dep.binary_search(&i).is_ok())
        .collect();
    let save_outputs = (0..outputs.len())
        .map(|i| bwd_out_dep.binary_search(&i).is_ok())
        .collect();

    Ok(GradInfo {
        num_forward_nodes,
        ograd_ids,
        input_grad_ids,
        bwd_ograd_dep,
        bwd_in_dep,
        bwd_out_dep,
        save_inputs,
        save_outputs,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::build_gradient;
    use crate::buffer_pool::BufferPool;
    use crate::graph::{Graph, GraphError, NodeId};
    use crate::ops::{Add, InputList, Mul, Neg, OpError, Operator, OutputList, Sub};

    /// Synthetic operator with no gradient rule.
    #[derive(Debug)]
    struct NoGradOp {}

    impl Operator for NoGradOp {
        fn name(&self) -> &str {
            "NoGradOp"
        }

        fn run(&self, _pool: &BufferPool, inputs: InputList) -> Result<OutputList, OpError> {
            Ok([inputs.require(0)?.clone()].into())
        }

        fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Vec<usize>>, OpError> {
            Ok(vec![inputs[0].to_vec()])
        }
    }

    #[test]
    fn test_missing_gradient_rule_fails_fast() {
        let mut g = Graph::new();
        let x = g.add_value(Some("x"));
        let y = g.add_simple_op(None, Arc::new(NoGradOp {}), &[x]);
        let result = build_gradient(&mut g, &[x], &[y]);
        assert_eq!(
            result.err(),
            Some(GraphError::NoGradient {
                op: "NoGradOp".to_string()
            })
        );
    }

    #[test]
    fn test_constant_gradient_prunes_dependencies() {
        // y = -x. The gradient is -ograd, independent of both x and y, so
        // neither may appear in the dependency sets.
        let mut g = Graph::new();
        let x = g.add_value(Some("x"));
        let y = g.add_simple_op(None, Arc::new(Neg {}), &[x]);
        let info = build_gradient(&mut g, &[x], &[y]).unwrap();

        assert_eq!(info.bwd_ograd_dep, &[0]);
        assert!(info.bwd_in_dep.is_empty());
        assert!(info.bwd_out_dep.is_empty());
        assert_eq!(info.save_inputs, &[false]);
        assert_eq!(info.save_outputs, &[false]);
        assert_eq!(info.num_backward_inputs(), 1);
        assert!(info.input_grad_ids[0].is_some());
    }

    #[test]
    fn test_mul_retains_both_inputs() {
        let mut g = Graph::new();
        let a = g.add_value(Some("a"));
        let b = g.add_value(Some("b"));
        let y = g.add_simple_op(None, Arc::new(Mul {}), &[a, b]);
        let info = build_gradient(&mut g, &[a, b], &[y]).unwrap();

        assert_eq!(info.bwd_in_dep, &[0, 1]);
        assert_eq!(info.save_inputs, &[true, true]);
    }

    #[test]
    fn test_multiple_paths_fold_with_accumulation() {
        // y = (x - c) + (x - c2): x contributes along two paths, so its
        // gradient entry must fold them.
        let mut g = Graph::new();
        let x = g.add_value(Some("x"));
        let c = g.add_value(Some("c"));
        let c2 = g.add_value(Some("c2"));
        let p1 = g.add_simple_op(None, Arc::new(Sub {}), &[x, c]);
        let p2 = g.add_simple_op(None, Arc::new(Sub {}), &[x, c2]);
        let y = g.add_simple_op(None, Arc::new(Add {}), &[p1, p2]);
        let info = build_gradient(&mut g, &[x, c, c2], &[y]).unwrap();

        let grad_x = info.input_grad_ids[0].expect("x must have a gradient");
        // The folded entry is produced by an AddN node over both paths.
        let producer = g
            .operators_in(info.num_forward_nodes..g.len())
            .find(|(_, node)| node.output_ids() == [grad_x])
            .map(|(_, node)| node.operator().name().to_string());
        assert_eq!(producer.as_deref(), Some("AddN"));
    }

    #[test]
    fn test_unused_input_has_no_gradient() {
        let mut g = Graph::new();
        let x = g.add_value(Some("x"));
        let unused = g.add_value(Some("unused"));
        let y = g.add_simple_op(None, Arc::new(Neg {}), &[x]);
        let info = build_gradient(&mut g, &[x, unused], &[y]).unwrap();

        assert!(info.input_grad_ids[0].is_some());
        assert!(info.input_grad_ids[1].is_none());
    }

    #[test]
    fn test_ograd_placeholders_one_per_output() {
        let mut g = Graph::new();
        let x = g.add_value(Some("x"));
        let y0 = g.add_simple_op(None, Arc::new(Neg {}), &[x]);
        let y1 = g.add_simple_op(None, Arc::new(Neg {}), &[x]);
        let info = build_gradient(&mut g, &[x], &[y0, y1]).unwrap();

        assert_eq!(info.ograd_ids.len(), 2);
        let grad_x: Vec<Option<NodeId>> = info.input_grad_ids.clone();
        // Both output gradients flow into x, folded with an accumulation.
        assert!(grad_x[0].is_some());
        assert_eq!(info.bwd_ograd_dep, &[0, 1]);
    }
}
