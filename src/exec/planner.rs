//! Call planning: signature matching, inference re-runs and bulk
//! segmentation.

use crate::exec::{ExecState, RunError, Segment, WriteReq};
use crate::gradient::GradInfo;
use crate::graph::{Graph, NodeId};
use crate::infer::{infer_range, seed_constants, Annotations};
use crate::tensor::{DType, StorageKind, Value};

/// One input's contribution to a call signature.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct SigItem {
    shape: Vec<usize>,
    dtype: DType,
    storage: StorageKind,
}

impl SigItem {
    fn of(value: &Value) -> SigItem {
        SigItem {
            shape: value.shape().to_vec(),
            dtype: value.dtype(),
            storage: value.storage_kind(),
        }
    }
}

/// The tuple of shapes, element types and storage kinds of a call's inputs,
/// used to decide whether a cached plan is reusable.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Signature {
    items: Vec<SigItem>,
    recording: bool,
    /// Backward-only: requested write semantics, which affect planning of
    /// gradient outputs.
    reqs: Vec<WriteReq>,
}

impl Signature {
    pub(crate) fn forward(inputs: &[Value], recording: bool) -> Signature {
        Signature {
            items: inputs.iter().map(SigItem::of).collect(),
            recording,
            reqs: Vec::new(),
        }
    }

    pub(crate) fn backward(ograds: &[Value], reqs: &[WriteReq]) -> Signature {
        Signature {
            items: ograds.iter().map(SigItem::of).collect(),
            recording: true,
            reqs: reqs.to_vec(),
        }
    }
}

/// Validate the current forward inputs against the state's cached plan,
/// re-running inference and segmentation on mismatch.
///
/// Returns true if the plan was rebuilt after having been built before (a
/// re-plan, as opposed to the initial plan).
pub(crate) fn set_forward_graph(
    graph: &Graph,
    grad: &GradInfo,
    state: &mut ExecState,
    input_ids: &[NodeId],
    inputs: &[Value],
    recording: bool,
    bulk_size: usize,
) -> Result<bool, RunError> {
    let sig = Signature::forward(inputs, recording);
    if state.annot.is_some() && state.fwd_sig.as_ref() == Some(&sig) {
        return Ok(false);
    }

    let mut annot = Annotations::new(graph.len());
    seed_constants(graph, &mut annot);
    for (&id, value) in input_ids.iter().zip(inputs) {
        annot.seed(id, value.shape().to_vec(), value.dtype(), value.storage_kind());
    }
    infer_range(graph, &mut annot, 0..grad.num_forward_nodes)?;

    let replanned = state.fwd_sig.is_some();
    if replanned {
        state.replans += 1;
    }
    state.annot = Some(annot);
    state.fwd_sig = Some(sig);
    state.fwd_segments = make_segments(graph, 0..grad.num_forward_nodes, bulk_size);

    // A new forward plan invalidates everything built on top of the old one.
    state.bwd_sig = None;
    state.static_fwd = None;
    state.static_bwd = None;

    Ok(replanned)
}

/// Validate the current backward inputs against the state's cached backward
/// plan, extending inference over the gradient graph on mismatch.
pub(crate) fn set_backward_graph(
    graph: &Graph,
    grad: &GradInfo,
    state: &mut ExecState,
    ograds: &[Value],
    reqs: &[WriteReq],
    bulk_size: usize,
) -> Result<bool, RunError> {
    let sig = Signature::backward(ograds, reqs);
    if state.bwd_sig.as_ref() == Some(&sig) {
        return Ok(false);
    }

    let annot = state
        .annot
        .as_mut()
        .ok_or(RunError::StateMismatch("forward has not run on this state"))?;
    annot.clear_range(grad.num_forward_nodes..graph.len());
    for (&id, value) in grad.ograd_ids.iter().zip(ograds) {
        annot.seed(id, value.shape().to_vec(), value.dtype(), value.storage_kind());
    }
    infer_range(graph, annot, grad.num_forward_nodes..graph.len())?;

    state.bwd_sig = Some(sig);
    state.bwd_segments = make_segments(graph, grad.num_forward_nodes..graph.len(), bulk_size);
    state.static_bwd = None;

    Ok(true)
}

/// Partition the operator nodes in `range` into bulk segments of at most
/// `bulk_size` operators.
///
/// Boundaries are forced at the range ends, at operators that require their
/// result synchronously, and at operators that mutate inputs in place; such
/// operators are submitted in a segment of their own.
pub(crate) fn make_segments(
    graph: &Graph,
    range: std::ops::Range<NodeId>,
    bulk_size: usize,
) -> Vec<Segment> {
    let range_end = range.end;
    let mut segments = Vec::new();
    let mut start: Option<NodeId> = None;
    let mut count = 0;

    for (op_id, node) in graph.operators_in(range) {
        let barrier = node.operator().requires_sync() || !node.operator().mutated_inputs().is_empty();
        if barrier {
            if let Some(seg_start) = start.take() {
                segments.push(Segment {
                    start: seg_start,
                    end: op_id,
                });
            }
            segments.push(Segment {
                start: op_id,
                end: op_id + 1,
            });
            count = 0;
            continue;
        }

        if start.is_none() {
            start = Some(op_id);
            count = 0;
        }
        count += 1;
        if count >= bulk_size.max(1) {
            segments.push(Segment {
                start: start.take().expect("segment start set"),
                end: op_id + 1,
            });
        }
    }
    if let Some(seg_start) = start {
        segments.push(Segment {
            start: seg_start,
            end: range_end,
        });
    }
    segments
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{make_segments, Signature};
    use crate::buffer_pool::BufferPool;
    use crate::exec::WriteReq;
    use crate::graph::Graph;
    use crate::ops::{InputList, Neg, OpError, Operator, OutputList, SgdUpdate};
    use crate::tensor::{Tensor, Value};

    #[derive(Debug)]
    struct SyncOp {}

    impl Operator for SyncOp {
        fn name(&self) -> &str {
            "SyncOp"
        }

        fn run(&self, _pool: &BufferPool, inputs: InputList) -> Result<OutputList, OpError> {
            Ok([inputs.require(0)?.clone()].into())
        }

        fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Vec<usize>>, OpError> {
            Ok(vec![inputs[0].to_vec()])
        }

        fn requires_sync(&self) -> bool {
            true
        }
    }

    fn chain(graph: &mut Graph, mut id: usize, count: usize) -> usize {
        for _ in 0..count {
            id = graph.add_simple_op(None, Arc::new(Neg {}), &[id]);
        }
        id
    }

    #[test]
    fn test_signatures_compare_by_shape_type_storage() {
        let a: Value = Tensor::from_data(&[4, 8], vec![0.; 32]).into();
        let b: Value = Tensor::from_data(&[16, 8], vec![0.; 128]).into();
        assert_eq!(
            Signature::forward(&[a.clone()], false),
            Signature::forward(&[a.clone()], false)
        );
        assert_ne!(
            Signature::forward(&[a.clone()], false),
            Signature::forward(&[b], false)
        );
        assert_ne!(
            Signature::forward(&[a.clone()], false),
            Signature::forward(&[a.clone()], true)
        );
        assert_ne!(
            Signature::backward(&[a.clone()], &[WriteReq::Write]),
            Signature::backward(&[a], &[WriteReq::Add])
        );
    }

    #[test]
    fn test_segments_respect_bulk_size() {
        let mut g = Graph::new();
        let x = g.add_value(Some("x"));
        chain(&mut g, x, 7);

        let segments = make_segments(&g, 0..g.len(), 3);
        let op_counts: Vec<usize> = segments
            .iter()
            .map(|seg| g.operators_in(seg.start..seg.end).count())
            .collect();
        assert_eq!(op_counts, vec![3, 3, 1]);
    }

    #[test]
    fn test_sync_op_forces_boundary() {
        let mut g = Graph::new();
        let x = g.add_value(Some("x"));
        let mid = chain(&mut g, x, 2);
        let synced = g.add_simple_op(Some("sync"), Arc::new(SyncOp {}), &[mid]);
        chain(&mut g, synced, 2);

        let segments = make_segments(&g, 0..g.len(), 10);
        let op_counts: Vec<usize> = segments
            .iter()
            .map(|seg| g.operators_in(seg.start..seg.end).count())
            .collect();
        // The sync op runs in a segment of its own.
        assert_eq!(op_counts, vec![2, 1, 2]);
    }

    #[test]
    fn test_mutating_op_forces_boundary() {
        let mut g = Graph::new();
        let w = g.add_value(Some("w"));
        let grad = g.add_value(Some("grad"));
        let neg = g.add_simple_op(None, Arc::new(Neg {}), &[grad]);
        g.add_simple_op(Some("sgd"), Arc::new(SgdUpdate::default()), &[w, neg]);

        let segments = make_segments(&g, 0..g.len(), 10);
        let op_counts: Vec<usize> = segments
            .iter()
            .map(|seg| g.operators_in(seg.start..seg.end).count())
            .collect();
        assert_eq!(op_counts, vec![1, 1]);
    }
}
