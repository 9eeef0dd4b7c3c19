//! Static memory planning and execution.
//!
//! On the first run for a signature, the planner computes each internal
//! entry's lifetime (producing node to last consumer) and greedily assigns a
//! minimal set of reusable buffer slots such that no two simultaneously-live
//! entries share a slot. Candidates must match the slot's element type and
//! count exactly, which maximizes reuse without resizing. In-place and
//! add-to opportunities are detected here and recorded as the request type
//! for the node's output; run time never revisits those decisions.
//!
//! Subsequent runs with a matching signature skip planning entirely and
//! execute node ranges against the preplanned buffers via [`run_ops`],
//! which is where this mode's steady-state throughput comes from.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::buffer_pool::BufferPool;
use crate::exec::dynamic::{ExecCtx, RunState};
use crate::exec::{ExecState, RunError};
use crate::graph::{Graph, NodeId};
use crate::infer::Annotations;
use crate::ops::{DispatchMode, InputList, OutputList};
use crate::tensor::{DType, StorageKind, Value};

/// How a node writes its first output under a static plan.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum StaticReq {
    /// Write into the assigned slot's buffer.
    Write,

    /// Reuse the first input's buffer, which dies at this node.
    Inplace,

    /// Accumulate the remaining inputs into the first input's buffer.
    AddTo,
}

/// Element type and count of one reusable buffer slot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct SlotSpec {
    pub dtype: DType,
    pub len: usize,
}

/// The cached {entry → slot} assignment for one node range and signature.
pub(crate) struct StaticPlan {
    pub entry_slot: FxHashMap<NodeId, usize>,
    pub node_req: FxHashMap<NodeId, StaticReq>,
    pub last_use: FxHashMap<NodeId, NodeId>,
    pub slots: Vec<SlotSpec>,
}

/// A slot's concrete buffer while no entry occupies it.
pub(crate) enum SlotBuf {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

impl SlotBuf {
    fn from_value(value: Value) -> Option<SlotBuf> {
        match value {
            Value::Float(t) => t.into_data().map(SlotBuf::F32),
            Value::Int(t) => t.into_data().map(SlotBuf::I32),
        }
    }

    /// Hand the buffer to the pool so the next allocation of this size
    /// reuses it.
    fn seed_into(self, pool: &BufferPool) {
        match self {
            SlotBuf::F32(buf) => pool.add(buf),
            SlotBuf::I32(buf) => pool.add(buf),
        }
    }
}

/// A static plan together with the allocated slot buffers, cached in the
/// execution state across calls.
pub(crate) struct StaticMem {
    pub plan: StaticPlan,
    pub slot_bufs: Vec<Option<SlotBuf>>,
}

impl StaticMem {
    pub(crate) fn new(plan: StaticPlan) -> StaticMem {
        let num_slots = plan.slots.len();
        StaticMem {
            plan,
            slot_bufs: (0..num_slots).map(|_| None).collect(),
        }
    }
}

/// Compute the slot assignment for the operator nodes in `range`.
///
/// `external` lists entries whose storage is managed outside the plan:
/// graph inputs and outputs, constants, and values that must survive the
/// range (anything retained for backward). Only dense internal entries are
/// slot-planned; everything else gets a per-call allocation.
pub(crate) fn plan(
    graph: &Graph,
    annot: &Annotations,
    range: std::ops::Range<NodeId>,
    external: &FxHashSet<NodeId>,
) -> StaticPlan {
    let mut last_use: FxHashMap<NodeId, NodeId> = FxHashMap::default();
    for (op_id, node) in graph.operators_in(range.clone()) {
        for &input in node.input_ids() {
            last_use.insert(input, op_id);
        }
    }

    let mut slots: Vec<SlotSpec> = Vec::new();
    let mut free: Vec<usize> = Vec::new();
    let mut entry_slot: FxHashMap<NodeId, usize> = FxHashMap::default();
    let mut node_req: FxHashMap<NodeId, StaticReq> = FxHashMap::default();

    let entry_spec = |id: NodeId| -> Option<SlotSpec> {
        match (annot.dtypes[id], annot.shape(id), annot.storage[id]) {
            (Some(dtype), Some(shape), Some(StorageKind::Dense)) => Some(SlotSpec {
                dtype,
                len: shape.iter().product(),
            }),
            _ => None,
        }
    };

    for (op_id, node) in graph.operators_in(range.clone()) {
        let op = node.operator();
        let Some(&out0) = node.output_ids().first() else {
            continue;
        };
        let out_spec = entry_spec(out0).filter(|_| !external.contains(&out0));

        // In-place: the first input dies at this node and matches the
        // output's size and type, so the output can take over its slot.
        let first_input = node.input_ids().first().copied();
        let in_place = match (&out_spec, first_input) {
            (Some(out_spec), Some(first)) => {
                op.can_run_in_place()
                    && annot.dispatch[op_id] == Some(DispatchMode::Dense)
                    && entry_slot.contains_key(&first)
                    && last_use.get(&first) == Some(&op_id)
                    && node.input_ids().iter().filter(|&&id| id == first).count() == 1
                    && entry_spec(first).as_ref() == Some(out_spec)
            }
            _ => false,
        };

        if in_place {
            let first = first_input.expect("in-place requires a first input");
            let slot = entry_slot[&first];
            entry_slot.insert(out0, slot);
            let req = if op.is_accumulation() {
                StaticReq::AddTo
            } else {
                StaticReq::Inplace
            };
            node_req.insert(op_id, req);
        } else if let Some(spec) = out_spec {
            let reuse = free
                .iter()
                .position(|&slot| slots[slot] == spec)
                .map(|pos| free.remove(pos));
            let slot = reuse.unwrap_or_else(|| {
                slots.push(spec);
                slots.len() - 1
            });
            entry_slot.insert(out0, slot);
            node_req.insert(op_id, StaticReq::Write);
        }

        // Slots of entries that die at this node become reusable for later
        // nodes. A slot taken over in place stays live under the output.
        for &input in node.input_ids() {
            if in_place && first_input == Some(input) {
                continue;
            }
            if last_use.get(&input) == Some(&op_id) {
                if let Some(&slot) = entry_slot.get(&input) {
                    if !free.contains(&slot) {
                        free.push(slot);
                    }
                }
            }
        }
    }

    StaticPlan {
        entry_slot,
        node_req,
        last_use,
        slots,
    }
}

/// Rewind a state's logical buffers without deallocating its planned slots.
///
/// With `keep_fwd` set, only entries at or past `boundary` (the gradient
/// graph) are cleared, preserving forward values for backward execution.
pub(crate) fn reset_state(state: &mut ExecState, recording: bool, keep_fwd: bool, boundary: NodeId) {
    let start = if keep_fwd { boundary } else { 0 };
    for buffer in state.buffers[start..].iter_mut() {
        *buffer = None;
    }
    state.recording = recording;
}

/// Execute the operator nodes in `[start, end)` against the preplanned
/// buffers.
///
/// At most one logical writer occupies a slot at any point in the schedule:
/// a node writing a planned entry either takes over a dead input's buffer
/// (in-place / add-to) or allocates from the pool seeded with its slot's
/// buffer; the buffer returns to the slot when the entry dies.
pub(crate) fn run_ops(
    env: &ExecCtx,
    rs: &mut RunState,
    mem: &mut StaticMem,
    start: NodeId,
    end: NodeId,
) -> Result<(), RunError> {
    for (op_id, node) in env.graph.operators_in(start..end) {
        let op = node.operator();
        let dispatch = env.annot.dispatch[op_id].ok_or_else(|| {
            RunError::PlanningError(format!(
                "operator \"{}\" was not planned",
                env.graph.node_name(op_id)
            ))
        })?;
        let req = mem.plan.node_req.get(&op_id).copied();

        // For a slot-writing node, seed the pool with the slot's buffer so
        // the operator's output allocation reuses it.
        if req == Some(StaticReq::Write) {
            let out0 = node.output_ids()[0];
            if let Some(&slot) = mem.plan.entry_slot.get(&out0) {
                if let Some(buf) = mem.slot_bufs[slot].take() {
                    buf.seed_into(env.pool);
                }
            }
        }

        let in_place = matches!(req, Some(StaticReq::Inplace) | Some(StaticReq::AddTo));
        let in_place_input = if in_place {
            let first = node.input_ids()[0];
            Some(rs.buffers[first].take().ok_or_else(|| {
                RunError::PlanningError(format!(
                    "planned in-place input \"{}\" has no buffer",
                    env.graph.node_name(first)
                ))
            })?)
        } else {
            None
        };

        let mut op_inputs = InputList::new();
        let skip_first = if in_place { 1 } else { 0 };
        for &input in &node.input_ids()[skip_first..] {
            let value = if let Some(value) = rs.buffers[input].as_ref() {
                value
            } else if let Some(&pos) = rs.input_pos.get(&input) {
                &rs.caller_inputs[pos]
            } else if let Some(value) = env.graph.constant_value(input) {
                value
            } else {
                return Err(RunError::PlanningError(format!(
                    "no value available for \"{}\" required by \"{}\"",
                    env.graph.node_name(input),
                    env.graph.node_name(op_id)
                )));
            };
            op_inputs.push(value);
        }

        let result: Result<OutputList, _> = match in_place_input {
            Some(owned) => op
                .run_in_place(env.pool, owned, op_inputs)
                .map(|out| [out].into()),
            None => match dispatch {
                DispatchMode::Dense => op.run(env.pool, op_inputs),
                DispatchMode::SparseAware => op.run_sparse(env.pool, op_inputs),
            },
        };
        let outputs = result.map_err(|error| RunError::OperatorError {
            name: env.graph.node_name(op_id),
            error,
        })?;
        if outputs.len() != node.output_ids().len() {
            return Err(RunError::OutputMismatch(
                "operator output count did not match expected count",
            ));
        }

        for (updated, &input_index) in outputs.iter().zip(op.mutated_inputs()) {
            let entry = node.input_ids()[input_index];
            if let Some(&pos) = rs.input_pos.get(&entry) {
                rs.caller_inputs[pos] = updated.clone();
            }
        }

        for (&output, value) in node.output_ids().iter().zip(outputs) {
            rs.buffers[output] = Some(value);
        }

        // Entries dying at this node return their buffer to their slot for
        // the next occupant.
        for &input in node.input_ids() {
            if mem.plan.last_use.get(&input) != Some(&op_id) {
                continue;
            }
            if let Some(&slot) = mem.plan.entry_slot.get(&input) {
                if let Some(value) = rs.buffers[input].take() {
                    mem.slot_bufs[slot] = SlotBuf::from_value(value);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rustc_hash::{FxHashMap, FxHashSet};

    use super::{plan, run_ops, StaticMem, StaticReq};
    use crate::buffer_pool::BufferPool;
    use crate::exec::dynamic::{ExecCtx, RunState};
    use crate::graph::{Graph, NodeRefCount};
    use crate::infer::{infer_range, seed_constants, Annotations};
    use crate::ops::{AddN, InputList, Neg, OpError, Operator, OutputList};
    use crate::tensor::{DType, StorageKind, Tensor, Value};

    /// Copy operator without an in-place path, so planned entries keep
    /// distinct slots unless their lifetimes are disjoint.
    #[derive(Debug)]
    struct CopyOp {}

    impl Operator for CopyOp {
        fn name(&self) -> &str {
            "CopyOp"
        }

        fn run(&self, pool: &BufferPool, inputs: InputList) -> Result<OutputList, OpError> {
            let input = inputs.require_float(0)?;
            let data = input.data().ok_or(OpError::IncorrectInputType)?;
            let mut out = pool.alloc::<f32>(data.len());
            out.extend_from_slice(data);
            Ok([Tensor::from_data(input.shape(), out).into()].into())
        }

        fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Vec<usize>>, OpError> {
            Ok(vec![inputs[0].to_vec()])
        }
    }

    fn annotated(graph: &Graph, input: usize, shape: &[usize]) -> Annotations {
        let mut annot = Annotations::new(graph.len());
        seed_constants(graph, &mut annot);
        annot.seed(input, shape.to_vec(), DType::F32, StorageKind::Dense);
        infer_range(graph, &mut annot, 0..graph.len()).unwrap();
        annot
    }

    #[test]
    fn test_overlapping_lifetimes_need_distinct_slots() {
        // Three intermediates all alive until the final fold: they must be
        // planned into at least three distinct slots.
        let mut g = Graph::new();
        let x = g.add_value(Some("x"));
        let a = g.add_simple_op(None, Arc::new(CopyOp {}), &[x]);
        let b = g.add_simple_op(None, Arc::new(CopyOp {}), &[x]);
        let c = g.add_simple_op(None, Arc::new(CopyOp {}), &[x]);
        let out = g.add_simple_op(None, Arc::new(AddN {}), &[a, b, c]);

        let annot = annotated(&g, x, &[4]);
        let external: FxHashSet<usize> = [x, out].into_iter().collect();
        let plan = plan(&g, &annot, 0..g.len(), &external);

        assert!(plan.slots.len() >= 3);
        let (sa, sb, sc) = (
            plan.entry_slot[&a],
            plan.entry_slot[&b],
            plan.entry_slot[&c],
        );
        assert!(sa != sb && sb != sc && sa != sc);
    }

    #[test]
    fn test_disjoint_lifetimes_share_slots() {
        // A straight chain: t1 dies when t2 is produced, so t3 can reuse
        // t1's slot and the plan needs only two slots.
        let mut g = Graph::new();
        let x = g.add_value(Some("x"));
        let t1 = g.add_simple_op(None, Arc::new(CopyOp {}), &[x]);
        let t2 = g.add_simple_op(None, Arc::new(CopyOp {}), &[t1]);
        let t3 = g.add_simple_op(None, Arc::new(CopyOp {}), &[t2]);
        let out = g.add_simple_op(None, Arc::new(CopyOp {}), &[t3]);

        let annot = annotated(&g, x, &[4]);
        let external: FxHashSet<usize> = [x, out].into_iter().collect();
        let plan = plan(&g, &annot, 0..g.len(), &external);

        assert_eq!(plan.slots.len(), 2);
        assert_eq!(plan.entry_slot[&t1], plan.entry_slot[&t3]);
    }

    #[test]
    fn test_in_place_and_add_to_detected() {
        let mut g = Graph::new();
        let x = g.add_value(Some("x"));
        let t1 = g.add_simple_op(None, Arc::new(CopyOp {}), &[x]);
        let t2 = g.add_simple_op(None, Arc::new(Neg {}), &[t1]);
        let t3 = g.add_simple_op(None, Arc::new(CopyOp {}), &[x]);
        let folded = g.add_simple_op(None, Arc::new(AddN {}), &[t2, t3]);
        let out = g.add_simple_op(None, Arc::new(CopyOp {}), &[folded]);

        let annot = annotated(&g, x, &[4]);
        let external: FxHashSet<usize> = [x, out].into_iter().collect();
        let plan = plan(&g, &annot, 0..g.len(), &external);

        // Neg consumes t1 in place; the fold accumulates into t2's buffer.
        let neg_op = g
            .operators_in(0..g.len())
            .find(|(_, node)| node.output_ids() == [t2])
            .map(|(id, _)| id)
            .unwrap();
        let fold_op = g
            .operators_in(0..g.len())
            .find(|(_, node)| node.output_ids() == [folded])
            .map(|(id, _)| id)
            .unwrap();
        assert_eq!(plan.node_req.get(&neg_op), Some(&StaticReq::Inplace));
        assert_eq!(plan.entry_slot[&t2], plan.entry_slot[&t1]);
        assert_eq!(plan.node_req.get(&fold_op), Some(&StaticReq::AddTo));
        assert_eq!(plan.entry_slot[&folded], plan.entry_slot[&t2]);
    }

    #[test]
    fn test_run_ops_reuses_slot_buffers_across_calls() {
        let mut g = Graph::new();
        let x = g.add_value(Some("x"));
        let t1 = g.add_simple_op(None, Arc::new(CopyOp {}), &[x]);
        let t2 = g.add_simple_op(None, Arc::new(CopyOp {}), &[t1]);
        let out = g.add_simple_op(None, Arc::new(CopyOp {}), &[t2]);

        let annot = annotated(&g, x, &[8]);
        let external: FxHashSet<usize> = [x, out].into_iter().collect();
        let mut mem = StaticMem::new(plan(&g, &annot, 0..g.len(), &external));

        let input_pos: FxHashMap<usize, usize> = [(x, 0)].into_iter().collect();
        for call in 0..2 {
            let pool = BufferPool::new();
            let env = ExecCtx {
                graph: &g,
                annot: &annot,
                pool: &pool,
                verbose: false,
            };
            let mut buffers: Vec<Option<Value>> = vec![None; g.len()];
            let mut refcount = NodeRefCount::new();
            let mut caller_inputs =
                [Value::from(Tensor::from_vec((0..8).map(|v| v as f32 + call as f32).collect()))];
            let mut rs = RunState {
                buffers: &mut buffers,
                refcount: &mut refcount,
                caller_inputs: &mut caller_inputs,
                input_pos: &input_pos,
                persist_below: 0,
            };
            run_ops(&env, &mut rs, &mut mem, 0, g.len()).unwrap();

            let result = buffers[out].take().unwrap();
            let expected: Vec<f32> = (0..8).map(|v| v as f32 + call as f32).collect();
            assert_eq!(result.as_float_ref().unwrap().data(), Some(expected.as_slice()));
            if call > 0 {
                // Slot buffers from the first call satisfied this call's
                // planned allocations.
                assert!(pool.hit_count() > 0);
            }
        }
    }
}
