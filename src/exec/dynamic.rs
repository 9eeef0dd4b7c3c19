//! Dynamic execution: evaluate nodes in topological order with fresh
//! per-call buffers.
//!
//! Because shapes may vary from call to call, nothing about buffer sizes is
//! assumed stable: every node output is allocated through the call-local
//! [`BufferPool`], and an intermediate's buffer is returned to that pool as
//! soon as its last consumer within the call has run. Buffers are never
//! preserved across calls; what survives the call is only what the backward
//! pass needs, kept alive by full-graph reference counts while recording.

use rustc_hash::FxHashMap;

use crate::buffer_pool::BufferPool;
use crate::exec::{RunError, Segment};
use crate::graph::{Graph, NodeId, NodeRefCount};
use crate::infer::Annotations;
use crate::ops::{DispatchMode, InputList, OutputList};
use crate::stream::Stream;
use crate::tensor::Value;

/// Immutable context shared by every node execution in one call.
pub(crate) struct ExecCtx<'a> {
    pub graph: &'a Graph,
    pub annot: &'a Annotations,
    pub pool: &'a BufferPool,
    pub verbose: bool,
}

/// Mutable state threaded through one call's node executions.
pub(crate) struct RunState<'a> {
    /// Per-entry buffers, indexed by node ID.
    pub buffers: &'a mut Vec<Option<Value>>,

    /// Remaining-use counts for entries; an entry hitting zero is released
    /// to the pool.
    pub refcount: &'a mut NodeRefCount,

    /// Caller-provided input values, written back to for mutable inputs.
    pub caller_inputs: &'a mut [Value],

    /// Graph input node ID to position in `caller_inputs`.
    pub input_pos: &'a FxHashMap<NodeId, usize>,

    /// Entries below this node ID are persistent: they are never consumed
    /// in place or released during this run. Backward runs set this to the
    /// forward node count so retained forward values survive replay.
    pub persist_below: NodeId,
}

/// Count how often each entry is read by operators in `range`.
///
/// The caller additionally increments entries that must outlive the run
/// (graph outputs, gradient outputs).
pub(crate) fn init_refcount(graph: &Graph, range: std::ops::Range<NodeId>) -> NodeRefCount {
    let mut refcount = NodeRefCount::new();
    for (_, node) in graph.operators_in(range) {
        for &input in node.input_ids() {
            refcount.inc(input);
        }
    }
    refcount
}

/// Execute the operator nodes in `[start, end)` in topological order.
pub(crate) fn run_op_range(
    env: &ExecCtx,
    rs: &mut RunState,
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

        // Choose an input whose buffer can be reused as the output. The
        // input must be a call-temporary with no further uses. For
        // commutative operators any input qualifies, so pick the largest;
        // otherwise only the first input's buffer has the output's layout.
        let in_place_id = if op.can_run_in_place() && dispatch == DispatchMode::Dense {
            let eligible = |id: &&NodeId| {
                let id = **id;
                id >= rs.persist_below
                    && rs.refcount.count(id) == 1
                    && rs.buffers[id].is_some()
                    && node.input_ids().iter().filter(|&&other| other == id).count() == 1
            };
            if op.is_commutative() {
                node.input_ids()
                    .iter()
                    .filter(eligible)
                    .max_by_key(|&&id| rs.buffers[id].as_ref().map(|v| v.len()).unwrap_or(0))
                    .copied()
            } else {
                node.input_ids().first().filter(eligible).copied()
            }
        } else {
            None
        };
        let in_place_input = in_place_id.map(|id| {
            rs.refcount.dec(id);
            rs.buffers[id].take().expect("in-place candidate present")
        });

        // Collect the remaining inputs as borrows from call buffers, caller
        // inputs or graph constants.
        let mut op_inputs = InputList::new();
        for &input in node.input_ids() {
            if Some(input) == in_place_id {
                continue;
            }
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

        if env.verbose {
            println!(
                "#{} {} ({})",
                op_id,
                op.name(),
                env.graph.node_name(op_id)
            );
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

        // Mutable inputs: propagate the updated value back to the caller's
        // slot before the output is stored.
        for (updated, &input_index) in outputs.iter().zip(op.mutated_inputs()) {
            let entry = node.input_ids()[input_index];
            if let Some(&pos) = rs.input_pos.get(&entry) {
                rs.caller_inputs[pos] = updated.clone();
            }
        }

        for (&output, value) in node.output_ids().iter().zip(outputs) {
            rs.buffers[output] = Some(value);
        }

        // Release buffers whose last consumer has now run.
        for &input in node.input_ids() {
            if input < rs.persist_below {
                continue;
            }
            if rs.refcount.dec(input) == Some(0) {
                if let Some(value) = rs.buffers[input].take() {
                    env.pool.release(value);
                }
            }
        }
    }
    Ok(())
}

/// Submit `segments` to `stream` in order, or run them inline in the caller's
/// context when `inline` is set (small graphs below the inlining threshold
/// skip stream dispatch entirely).
pub(crate) fn run_segments(
    env: &ExecCtx,
    rs: &mut RunState,
    segments: &[Segment],
    stream: &dyn Stream,
    inline: bool,
) -> Result<(), RunError> {
    for segment in segments {
        if inline {
            run_op_range(env, rs, segment.start, segment.end)?;
        } else {
            let mut work = || run_op_range(env, rs, segment.start, segment.end);
            stream.launch(&mut work)?;
        }
    }
    Ok(())
}
