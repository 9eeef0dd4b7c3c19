//! Shape, element-type and storage inference over a graph range.
//!
//! Inference runs once per distinct call signature and annotates every value
//! entry in the range with its shape, dtype and storage kind, and every
//! operator node with its dispatch mode. Shape and dtype inference are
//! monotonic fixpoint passes: entries only ever move from unknown to known,
//! and sweeps repeat until nothing changes. Storage inference additionally
//! selects the compute path (dense vs sparse-aware) per node; a node with no
//! supported path for its operand storage kinds fails the call, it is never
//! silently worked around here.

use std::ops::Range;

use crate::exec::RunError;
use crate::graph::{Graph, Node, NodeId};
use crate::ops::DispatchMode;
use crate::tensor::{DType, StorageKind};

/// Per-call annotations for every node of a graph.
///
/// Indexed by [`NodeId`]; `dispatch` is only meaningful for operator nodes,
/// the other fields only for value and constant entries. Annotations are
/// call-local state owned by the execution state, never shared between
/// states.
pub struct Annotations {
    pub shapes: Vec<Option<Vec<usize>>>,
    pub dtypes: Vec<Option<DType>>,
    pub storage: Vec<Option<StorageKind>>,
    pub dispatch: Vec<Option<DispatchMode>>,
}

impl Annotations {
    pub fn new(num_nodes: usize) -> Annotations {
        Annotations {
            shapes: vec![None; num_nodes],
            dtypes: vec![None; num_nodes],
            storage: vec![None; num_nodes],
            dispatch: vec![None; num_nodes],
        }
    }

    /// Annotate one value entry with a concrete shape, dtype and storage.
    pub fn seed(&mut self, id: NodeId, shape: Vec<usize>, dtype: DType, storage: StorageKind) {
        self.shapes[id] = Some(shape);
        self.dtypes[id] = Some(dtype);
        self.storage[id] = Some(storage);
    }

    pub fn shape(&self, id: NodeId) -> Option<&[usize]> {
        self.shapes[id].as_deref()
    }

    /// Clear annotations for entries in `range`, keeping the rest.
    pub fn clear_range(&mut self, range: Range<NodeId>) {
        for id in range {
            self.shapes[id] = None;
            self.dtypes[id] = None;
            self.storage[id] = None;
            self.dispatch[id] = None;
        }
    }
}

/// Annotate all constant nodes with the shape/dtype/storage of their value.
pub fn seed_constants(graph: &Graph, annot: &mut Annotations) {
    for (id, node) in graph.iter() {
        if let Node::Constant(constant) = node {
            let value = constant.value();
            annot.seed(
                id,
                value.shape().to_vec(),
                value.dtype(),
                value.storage_kind(),
            );
        }
    }
}

/// Run shape, dtype and storage inference over the operator nodes in `range`.
///
/// Entries read by the range (graph inputs, constants, annotations from an
/// earlier range) must already be seeded. Fails with
/// [`RunError::PlanningError`] if the passes converge with entries still
/// unknown, and with [`RunError::UnsupportedDispatch`] if some node has no
/// compute path for its inferred operand storage kinds.
pub fn infer_range(
    graph: &Graph,
    annot: &mut Annotations,
    range: Range<NodeId>,
) -> Result<(), RunError> {
    loop {
        let mut changed = false;

        for (op_id, node) in graph.operators_in(range.clone()) {
            if annot.dispatch[op_id].is_some() {
                continue;
            }

            let mut in_shapes: Vec<&[usize]> = Vec::with_capacity(node.input_ids().len());
            let mut in_dtypes: Vec<DType> = Vec::with_capacity(node.input_ids().len());
            let mut in_storage: Vec<StorageKind> = Vec::with_capacity(node.input_ids().len());
            let inputs_known = node.input_ids().iter().all(|&input| {
                match (
                    annot.shapes[input].as_deref(),
                    annot.dtypes[input],
                    annot.storage[input],
                ) {
                    (Some(shape), Some(dtype), Some(storage)) => {
                        in_shapes.push(shape);
                        in_dtypes.push(dtype);
                        in_storage.push(storage);
                        true
                    }
                    _ => false,
                }
            });
            if !inputs_known {
                continue;
            }

            let op = node.operator();
            let op_error = |error| RunError::OperatorError {
                name: graph.node_name(op_id),
                error,
            };
            let out_shapes = op.infer_shapes(&in_shapes).map_err(op_error)?;
            let out_dtypes = op.infer_dtypes(&in_dtypes).map_err(op_error)?;
            let (out_storage, dispatch) =
                op.infer_storage(&in_storage)
                    .ok_or_else(|| RunError::UnsupportedDispatch {
                        name: graph.node_name(op_id),
                    })?;
            if out_shapes.len() != node.output_ids().len()
                || out_dtypes.len() != node.output_ids().len()
                || out_storage.len() != node.output_ids().len()
            {
                return Err(RunError::PlanningError(format!(
                    "operator \"{}\" inferred a mismatched output count",
                    graph.node_name(op_id)
                )));
            }

            for (((&output, shape), dtype), storage) in node
                .output_ids()
                .iter()
                .zip(out_shapes)
                .zip(out_dtypes)
                .zip(out_storage)
            {
                annot.seed(output, shape, dtype, storage);
            }
            annot.dispatch[op_id] = Some(dispatch);
            changed = true;
        }

        if !changed {
            break;
        }
    }

    // Convergence check: every operator in the range must be resolved.
    for (op_id, _) in graph.operators_in(range) {
        if annot.dispatch[op_id].is_none() {
            return Err(RunError::PlanningError(format!(
                "inference did not converge for operator \"{}\"",
                graph.node_name(op_id)
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{infer_range, seed_constants, Annotations};
    use crate::exec::RunError;
    use crate::graph::Graph;
    use crate::ops::{Add, DispatchMode, Neg, SgdUpdate, SumAll};
    use crate::tensor::{DType, StorageKind, Tensor};

    #[test]
    fn test_infer_chain() {
        let mut g = Graph::new();
        let x = g.add_value(Some("x"));
        let c = g.add_constant(Some("c"), Tensor::from_scalar(1.0f32).into());
        let sum = g.add_simple_op(None, Arc::new(Add {}), &[x, c]);
        let total = g.add_simple_op(None, Arc::new(SumAll {}), &[sum]);

        let mut annot = Annotations::new(g.len());
        seed_constants(&g, &mut annot);
        annot.seed(x, vec![2, 3], DType::F32, StorageKind::Dense);
        infer_range(&g, &mut annot, 0..g.len()).unwrap();

        assert_eq!(annot.shape(sum), Some([2, 3].as_slice()));
        assert_eq!(annot.shape(total), Some([].as_slice()));
        assert_eq!(annot.dtypes[total], Some(DType::F32));
        assert_eq!(annot.storage[sum], Some(StorageKind::Dense));
    }

    #[test]
    fn test_infer_unseeded_input_fails() {
        let mut g = Graph::new();
        let x = g.add_value(Some("x"));
        let y = g.add_simple_op(Some("neg"), Arc::new(Neg {}), &[x]);

        let mut annot = Annotations::new(g.len());
        let result = infer_range(&g, &mut annot, 0..g.len());
        assert!(matches!(result, Err(RunError::PlanningError(_))));
        assert!(annot.shape(y).is_none());
    }

    #[test]
    fn test_unsupported_dispatch() {
        // Add has no sparse-aware path, so a row-sparse operand must be
        // rejected rather than silently densified.
        let mut g = Graph::new();
        let x = g.add_value(Some("x"));
        let y = g.add_value(Some("y"));
        g.add_simple_op(Some("add"), Arc::new(Add {}), &[x, y]);

        let mut annot = Annotations::new(g.len());
        annot.seed(x, vec![4, 2], DType::F32, StorageKind::RowSparse);
        annot.seed(y, vec![4, 2], DType::F32, StorageKind::Dense);
        let result = infer_range(&g, &mut annot, 0..g.len());
        assert_eq!(
            result.err(),
            Some(RunError::UnsupportedDispatch {
                name: "add".to_string()
            })
        );
    }

    #[test]
    fn test_sparse_dispatch_selected() {
        let mut g = Graph::new();
        let w = g.add_value(Some("w"));
        let grad = g.add_value(Some("grad"));
        let out = g.add_value(None);
        let update = g.add_op(Some("sgd"), Arc::new(SgdUpdate::default()), &[w, grad], &[out]);

        let mut annot = Annotations::new(g.len());
        annot.seed(w, vec![4, 2], DType::F32, StorageKind::Dense);
        annot.seed(grad, vec![4, 2], DType::F32, StorageKind::RowSparse);
        infer_range(&g, &mut annot, 0..g.len()).unwrap();

        assert_eq!(annot.dispatch[update], Some(DispatchMode::SparseAware));
        assert_eq!(annot.storage[out], Some(StorageKind::Dense));
    }
}
