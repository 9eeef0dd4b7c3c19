//! The cached op: repeated forward and backward execution of an
//! imperatively-built graph.
//!
//! Construction derives the gradient graph and the backward dependency sets
//! once; each call then only pays for signature matching, unless the input
//! shapes, types or storage kinds changed, in which case the affected plan
//! is rebuilt. Execution states are pooled per device context, so a busy
//! caller converges on a small set of states whose cached annotations and
//! static memory plans are reused indefinitely.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::buffer_pool::BufferPool;
use crate::env::{env_flag, env_usize};
use crate::exec::dynamic::{self, ExecCtx, RunState};
use crate::exec::static_mem::{self, StaticMem};
use crate::exec::{check_uniform_context, planner, ExecState, Phase, RunError, WriteReq};
use crate::gradient::{build_gradient, GradInfo};
use crate::graph::{Graph, GraphError, Node, NodeId, NodeRefCount};
use crate::pool::{StateHandle, StatePool};
use crate::stream::stream_for;
use crate::tensor::{Context, Value};
use crate::threading;


/// Configuration for a [`CachedOp`]. Immutable after construction.
#[derive(Clone, Debug)]
pub struct CachedOpConfig {
    /// Graphs with fewer forward operators than this execute inline,
    /// skipping stream dispatch.
    pub inline_limit: usize,

    /// Maximum operators per bulk segment in the forward pass.
    pub forward_bulk_size: usize,

    /// Maximum operators per bulk segment in the backward pass.
    pub backward_bulk_size: usize,

    /// Preplan and reuse a fixed buffer layout per signature instead of
    /// allocating fresh buffers each call.
    pub static_memory: bool,

    /// Positions of data (argument) inputs.
    pub data_indices: Vec<usize>,

    /// Positions of trainable-parameter inputs.
    pub param_indices: Vec<usize>,

    /// Log each executed node.
    pub verbose: bool,
}

impl Default for CachedOpConfig {
    fn default() -> CachedOpConfig {
        let bulk_size = env_usize("GRADCACHE_BULK_SIZE", 15);
        CachedOpConfig {
            inline_limit: 2,
            forward_bulk_size: bulk_size,
            backward_bulk_size: bulk_size,
            static_memory: false,
            data_indices: Vec::new(),
            param_indices: Vec::new(),
            verbose: env_flag("GRADCACHE_VERBOSE", false),
        }
    }
}

/// Handle to the pooled execution state a forward call produced, consumed by
/// the matching backward call. Dropping the handle returns the state to its
/// pool.
pub type OpState = StateHandle<ExecState>;

/// A forward graph with its derived gradient graph, cached plans and pooled
/// execution states.
pub struct CachedOp {
    graph: Graph,
    input_ids: Vec<NodeId>,
    output_ids: Vec<NodeId>,

    /// Graph input node ID to argument position.
    input_pos: FxHashMap<NodeId, usize>,

    grad: GradInfo,

    /// Forward-era entries read by at least one gradient node, including
    /// internal activations. While recording, these survive the forward
    /// call inside the state.
    bwd_referenced: FxHashSet<NodeId>,

    /// Argument positions of inputs some operator updates in place.
    mutable_inputs: Vec<usize>,

    config: CachedOpConfig,

    /// Whether the forward graph is small enough to run inline.
    inlining: bool,

    states: Arc<StatePool<ExecState>>,
}

impl CachedOp {
    /// Validate `graph` and derive its gradient graph.
    ///
    /// `inputs` and `outputs` are the value nodes forming the call surface.
    /// Fails fast on structural problems and on any forward operator without
    /// a gradient rule; no partially-built op is ever returned.
    pub fn new(
        mut graph: Graph,
        inputs: &[NodeId],
        outputs: &[NodeId],
        config: CachedOpConfig,
    ) -> Result<CachedOp, GraphError> {
        if outputs.is_empty() {
            return Err(GraphError::NoOutputs);
        }
        for &id in inputs.iter().chain(outputs) {
            match graph.get_node(id) {
                None => return Err(GraphError::InvalidNodeId { id }),
                Some(Node::Value(_)) => {}
                Some(_) => return Err(GraphError::NotAValueNode { id }),
            }
        }
        for (pos, &id) in inputs.iter().enumerate() {
            if inputs[..pos].contains(&id) {
                return Err(GraphError::DuplicateInput { id });
            }
        }
        for (pos, &id) in outputs.iter().enumerate() {
            if outputs[..pos].contains(&id) {
                return Err(GraphError::DuplicateOutput { id });
            }
        }
        for (op_id, node) in graph.operators_in(0..graph.len()) {
            let op = node.operator();
            if let Some(expected) = op.num_inputs() {
                if node.input_ids().len() != expected {
                    return Err(GraphError::ArityMismatch {
                        op: graph.node_name(op_id),
                        expected,
                        actual: node.input_ids().len(),
                    });
                }
            }
            if node.output_ids().len() != op.num_outputs() {
                return Err(GraphError::ArityMismatch {
                    op: graph.node_name(op_id),
                    expected: op.num_outputs(),
                    actual: node.output_ids().len(),
                });
            }
        }

        let input_pos: FxHashMap<NodeId, usize> =
            inputs.iter().enumerate().map(|(i, &id)| (id, i)).collect();

        let mut mutable_inputs: Vec<usize> = graph
            .operators_in(0..graph.len())
            .flat_map(|(_, node)| {
                node.operator()
                    .mutated_inputs()
                    .iter()
                    .filter_map(|&index| input_pos.get(&node.input_ids()[index]).copied())
                    .collect::<Vec<_>>()
            })
            .collect();
        mutable_inputs.sort_unstable();
        mutable_inputs.dedup();

        let num_forward_ops = graph.operators_in(0..graph.len()).count();

        let grad = build_gradient(&mut graph, inputs, outputs)?;

        let mut bwd_referenced = FxHashSet::default();
        for (_, node) in graph.operators_in(grad.num_forward_nodes..graph.len()) {
            for &entry in node.input_ids() {
                if entry < grad.num_forward_nodes {
                    bwd_referenced.insert(entry);
                }
            }
        }

        // Inline execution bypasses stream dispatch, which is only safe for
        // subgraphs without in-place side effects.
        let inlining = num_forward_ops < config.inline_limit && mutable_inputs.is_empty();

        Ok(CachedOp {
            graph,
            input_ids: inputs.to_vec(),
            output_ids: outputs.to_vec(),
            input_pos,
            grad,
            bwd_referenced,
            mutable_inputs,
            config,
            inlining,
            states: Arc::new(StatePool::new()),
        })
    }

    pub fn num_inputs(&self) -> usize {
        self.input_ids.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.output_ids.len()
    }

    /// Total number of inputs the backward pass consumes: retained output
    /// gradients, forward inputs and forward outputs.
    pub fn num_backward_inputs(&self) -> usize {
        self.grad.num_backward_inputs()
    }

    /// Per forward input: must its value be saved for backward?
    pub fn save_inputs(&self) -> &[bool] {
        &self.grad.save_inputs
    }

    /// Per forward output: must its value be saved for backward?
    pub fn save_outputs(&self) -> &[bool] {
        &self.grad.save_outputs
    }

    /// Indices of forward outputs whose gradients backward reads.
    pub fn backward_ograd_deps(&self) -> &[usize] {
        &self.grad.bwd_ograd_dep
    }

    /// Indices of forward inputs backward reads.
    pub fn backward_input_deps(&self) -> &[usize] {
        &self.grad.bwd_in_dep
    }

    /// Indices of forward outputs backward reads.
    pub fn backward_output_deps(&self) -> &[usize] {
        &self.grad.bwd_out_dep
    }

    /// Argument positions updated in place by some operator (e.g. trainable
    /// parameters consumed by an optimizer update).
    pub fn mutable_input_indices(&self) -> &[usize] {
        &self.mutable_inputs
    }

    pub fn config(&self) -> &CachedOpConfig {
        &self.config
    }

    /// Number of execution states ever created for `ctx`.
    pub fn num_states(&self, ctx: Context) -> usize {
        self.states.num_states(ctx)
    }

    /// Total forward re-plans across the free states of `ctx`.
    pub fn replan_count(&self, ctx: Context) -> usize {
        let mut total = 0;
        self.states.for_each_free(ctx, |state| total += state.replan_count());
        total
    }

    /// Execute the forward graph.
    ///
    /// `inputs` is mutable because operators may update designated inputs in
    /// place; see [`CachedOp::mutable_input_indices`]. Results are written
    /// to `outputs`. With `record` set the call returns a state handle for
    /// a matching [`CachedOp::backward`] call; otherwise the state is
    /// recycled immediately and `None` is returned.
    pub fn forward(
        &self,
        inputs: &mut [Value],
        outputs: &mut [Option<Value>],
        record: bool,
    ) -> Result<Option<OpState>, RunError> {
        if inputs.len() != self.num_inputs() {
            return Err(RunError::InputMismatch(format!(
                "expected {} inputs, got {}",
                self.num_inputs(),
                inputs.len()
            )));
        }
        if outputs.len() != self.num_outputs() {
            return Err(RunError::InputMismatch(format!(
                "expected {} output slots, got {}",
                self.num_outputs(),
                outputs.len()
            )));
        }
        let ctx = check_uniform_context(inputs)?.unwrap_or_default();

        let mut handle = self
            .states
            .acquire(ctx, || ExecState::new(self.graph.len()));
        handle.reset_transient();
        handle.recording = record;

        let state = &mut *handle;
        threading::thread_pool().run(|| {
            if self.config.static_memory {
                self.static_forward(ctx, state, inputs, outputs, record)
            } else {
                self.dynamic_forward(ctx, state, inputs, outputs, record)
            }
        })?;

        Ok(record.then_some(handle))
    }

    /// Execute the backward graph against a state produced by a recording
    /// forward call.
    ///
    /// `reqs` gives the write semantics per input gradient; `igrads` are the
    /// destinations. With `retain_graph` unset the state's snapshot is
    /// discarded afterwards and a second backward fails with
    /// [`RunError::StateConsumed`].
    pub fn backward(
        &self,
        retain_graph: bool,
        handle: &mut OpState,
        ograds: &[Value],
        reqs: &[WriteReq],
        igrads: &mut [Option<Value>],
    ) -> Result<(), RunError> {
        let ctx = handle.context();
        let state = &mut **handle;
        if state.buffers.len() != self.graph.len() {
            return Err(RunError::StateMismatch(
                "state does not belong to this cached op",
            ));
        }
        if state.consumed {
            return Err(RunError::StateConsumed);
        }
        if !state.recording {
            return Err(RunError::StateMismatch("state was not recorded for backward"));
        }
        if state.phase != Phase::Completed {
            return Err(RunError::StateMismatch("forward has not completed"));
        }
        if ograds.len() != self.num_outputs() {
            return Err(RunError::InputMismatch(format!(
                "expected {} output gradients, got {}",
                self.num_outputs(),
                ograds.len()
            )));
        }
        if reqs.len() != self.num_inputs() || igrads.len() != self.num_inputs() {
            return Err(RunError::InputMismatch(format!(
                "expected {} write requests and input-gradient slots",
                self.num_inputs()
            )));
        }

        threading::thread_pool().run(|| {
            if self.config.static_memory {
                self.static_backward(ctx, state, ograds, reqs, igrads)
            } else {
                self.dynamic_backward(ctx, state, ograds, reqs, igrads)
            }
        })?;

        if !retain_graph {
            state.consume();
        }
        Ok(())
    }

    fn dynamic_forward(
        &self,
        ctx: Context,
        state: &mut ExecState,
        inputs: &mut [Value],
        outputs: &mut [Option<Value>],
        record: bool,
    ) -> Result<(), RunError> {
        planner::set_forward_graph(
            &self.graph,
            &self.grad,
            state,
            &self.input_ids,
            inputs,
            record,
            self.config.forward_bulk_size,
        )?;
        state.phase = Phase::Planned;

        let mut refcount = dynamic::init_refcount(&self.graph, 0..self.grad.num_forward_nodes);
        for &output in &self.output_ids {
            refcount.inc(output);
        }
        if record {
            for &entry in &self.bwd_referenced {
                refcount.inc(entry);
            }
        }

        let ExecState {
            ref annot,
            ref mut buffers,
            ref fwd_segments,
            ref mut phase,
            ..
        } = *state;
        let annot = annot.as_ref().expect("forward plan set");
        let pool = BufferPool::new();
        let env = ExecCtx {
            graph: &self.graph,
            annot,
            pool: &pool,
            verbose: self.config.verbose,
        };
        let mut rs = RunState {
            buffers,
            refcount: &mut refcount,
            caller_inputs: &mut *inputs,
            input_pos: &self.input_pos,
            persist_below: 0,
        };

        *phase = Phase::Running;
        dynamic::run_segments(&env, &mut rs, fwd_segments, stream_for(ctx), self.inlining)?;
        *phase = Phase::Completed;

        self.finish_forward(state, inputs, outputs, record)
    }

    fn static_forward(
        &self,
        ctx: Context,
        state: &mut ExecState,
        inputs: &mut [Value],
        outputs: &mut [Option<Value>],
        record: bool,
    ) -> Result<(), RunError> {
        planner::set_forward_graph(
            &self.graph,
            &self.grad,
            state,
            &self.input_ids,
            inputs,
            record,
            self.config.forward_bulk_size,
        )?;
        state.phase = Phase::Planned;
        static_mem::reset_state(state, record, false, self.grad.num_forward_nodes);

        if state.static_fwd.is_none() {
            let mut external: FxHashSet<NodeId> = self.output_ids.iter().copied().collect();
            if record {
                external.extend(self.bwd_referenced.iter().copied());
            }
            let annot = state.annot.as_ref().expect("forward plan set");
            let plan = static_mem::plan(
                &self.graph,
                annot,
                0..self.grad.num_forward_nodes,
                &external,
            );
            state.static_fwd = Some(StaticMem::new(plan));
        }

        let ExecState {
            ref annot,
            ref mut buffers,
            ref fwd_segments,
            ref mut static_fwd,
            ref mut phase,
            ..
        } = *state;
        let annot = annot.as_ref().expect("forward plan set");
        let mem = static_fwd.as_mut().expect("static plan built");
        let pool = BufferPool::new();
        let env = ExecCtx {
            graph: &self.graph,
            annot,
            pool: &pool,
            verbose: self.config.verbose,
        };
        let mut refcount = NodeRefCount::new();
        let mut rs = RunState {
            buffers,
            refcount: &mut refcount,
            caller_inputs: &mut *inputs,
            input_pos: &self.input_pos,
            persist_below: 0,
        };

        *phase = Phase::Running;
        let stream = stream_for(ctx);
        for segment in fwd_segments {
            let mut work = || static_mem::run_ops(&env, &mut rs, mem, segment.start, segment.end);
            stream.launch(&mut work)?;
        }
        *phase = Phase::Completed;

        self.finish_forward(state, inputs, outputs, record)
    }

    /// Write forward results to the caller and retain what backward needs.
    fn finish_forward(
        &self,
        state: &mut ExecState,
        inputs: &[Value],
        outputs: &mut [Option<Value>],
        record: bool,
    ) -> Result<(), RunError> {
        for (slot, &id) in outputs.iter_mut().zip(&self.output_ids) {
            let keep = record && self.bwd_referenced.contains(&id);
            let value = if keep {
                state.buffers[id].clone()
            } else {
                state.buffers[id].take()
            };
            let value = value
                .or_else(|| {
                    // An output can also be a graph input or constant
                    // passed straight through.
                    self.input_pos
                        .get(&id)
                        .map(|&pos| inputs[pos].clone())
                        .or_else(|| self.graph.constant_value(id).cloned())
                })
                .ok_or_else(|| {
                    RunError::PlanningError(format!(
                        "output \"{}\" was not produced",
                        self.graph.node_name(id)
                    ))
                })?;
            *slot = Some(value);
        }

        if record {
            // Backward reads saved inputs from the state, not the caller's
            // slices, which may be mutated between the calls.
            for (pos, &id) in self.input_ids.iter().enumerate() {
                if self.bwd_referenced.contains(&id) {
                    state.buffers[id] = Some(inputs[pos].clone());
                }
            }
        } else {
            state.consumed = true;
        }
        Ok(())
    }

    fn dynamic_backward(
        &self,
        ctx: Context,
        state: &mut ExecState,
        ograds: &[Value],
        reqs: &[WriteReq],
        igrads: &mut [Option<Value>],
    ) -> Result<(), RunError> {
        planner::set_backward_graph(
            &self.graph,
            &self.grad,
            state,
            ograds,
            reqs,
            self.config.backward_bulk_size,
        )?;

        let mut refcount =
            dynamic::init_refcount(&self.graph, self.grad.num_forward_nodes..self.graph.len());
        for grad in self.grad.input_grad_ids.iter().flatten() {
            refcount.inc(*grad);
        }

        let ExecState {
            ref annot,
            ref mut buffers,
            ref bwd_segments,
            ..
        } = *state;
        let annot = annot.as_ref().expect("backward plan set");
        for (&id, value) in self.grad.ograd_ids.iter().zip(ograds) {
            buffers[id] = Some(value.clone());
        }

        let pool = BufferPool::new();
        let env = ExecCtx {
            graph: &self.graph,
            annot,
            pool: &pool,
            verbose: self.config.verbose,
        };
        let mut caller_inputs: [Value; 0] = [];
        let empty_pos = FxHashMap::default();
        let mut rs = RunState {
            buffers,
            refcount: &mut refcount,
            caller_inputs: &mut caller_inputs,
            input_pos: &empty_pos,
            persist_below: self.grad.num_forward_nodes,
        };
        dynamic::run_segments(&env, &mut rs, bwd_segments, stream_for(ctx), self.inlining)?;

        self.write_input_grads(ctx, state, reqs, igrads)
    }

    fn static_backward(
        &self,
        ctx: Context,
        state: &mut ExecState,
        ograds: &[Value],
        reqs: &[WriteReq],
        igrads: &mut [Option<Value>],
    ) -> Result<(), RunError> {
        planner::set_backward_graph(
            &self.graph,
            &self.grad,
            state,
            ograds,
            reqs,
            self.config.backward_bulk_size,
        )?;
        static_mem::reset_state(state, true, true, self.grad.num_forward_nodes);

        if state.static_bwd.is_none() {
            let external: FxHashSet<NodeId> = self
                .grad
                .input_grad_ids
                .iter()
                .flatten()
                .copied()
                .collect();
            let annot = state.annot.as_ref().expect("backward plan set");
            let plan = static_mem::plan(
                &self.graph,
                annot,
                self.grad.num_forward_nodes..self.graph.len(),
                &external,
            );
            state.static_bwd = Some(StaticMem::new(plan));
        }

        let ExecState {
            ref annot,
            ref mut buffers,
            ref bwd_segments,
            ref mut static_bwd,
            ..
        } = *state;
        let annot = annot.as_ref().expect("backward plan set");
        let mem = static_bwd.as_mut().expect("static plan built");
        for (&id, value) in self.grad.ograd_ids.iter().zip(ograds) {
            buffers[id] = Some(value.clone());
        }

        let pool = BufferPool::new();
        let env = ExecCtx {
            graph: &self.graph,
            annot,
            pool: &pool,
            verbose: self.config.verbose,
        };
        let mut refcount = NodeRefCount::new();
        let mut caller_inputs: [Value; 0] = [];
        let empty_pos = FxHashMap::default();
        let mut rs = RunState {
            buffers,
            refcount: &mut refcount,
            caller_inputs: &mut caller_inputs,
            input_pos: &empty_pos,
            persist_below: self.grad.num_forward_nodes,
        };

        let stream = stream_for(ctx);
        for segment in bwd_segments {
            let mut work = || static_mem::run_ops(&env, &mut rs, mem, segment.start, segment.end);
            stream.launch(&mut work)?;
        }

        self.write_input_grads(ctx, state, reqs, igrads)
    }

    /// Apply the per-input write requests to the computed gradients.
    ///
    /// Nothing is written until the whole backward run has succeeded, so a
    /// failed call leaves every destination untouched.
    fn write_input_grads(
        &self,
        ctx: Context,
        state: &mut ExecState,
        reqs: &[WriteReq],
        igrads: &mut [Option<Value>],
    ) -> Result<(), RunError> {
        let ExecState {
            ref annot,
            ref mut buffers,
            ..
        } = *state;
        let annot = annot.as_ref().expect("plan set");
        for (pos, (req, slot)) in reqs.iter().zip(igrads.iter_mut()).enumerate() {
            let grad = self.grad.input_grad_ids[pos].and_then(|id| buffers[id].take());
            match req {
                WriteReq::Null => {}
                WriteReq::Write => {
                    let value = match grad {
                        Some(value) => value,
                        None => {
                            // No gradient flows to this input: assign zeros
                            // of the input's call-time shape.
                            let id = self.input_ids[pos];
                            let shape = annot.shape(id).ok_or(RunError::StateMismatch(
                                "input annotations missing for zero gradient",
                            ))?;
                            let dtype = annot.dtypes[id]
                                .ok_or(RunError::StateMismatch("input dtype missing"))?;
                            Value::zeros(dtype, shape, ctx)
                        }
                    };
                    *slot = Some(value);
                }
                WriteReq::Add => {
                    let Some(grad) = grad else {
                        continue;
                    };
                    let dst = slot.as_mut().ok_or(RunError::InvalidWriteRequest(
                        "accumulate requested into an empty destination",
                    ))?;
                    accumulate(dst, &grad)?;
                }
            }
        }
        Ok(())
    }
}

/// Accumulate `src` into `dst` elementwise.
///
/// Both must be dense tensors of the same shape and element type; anything
/// else is a precondition violation, reported without touching `dst`.
fn accumulate(dst: &mut Value, src: &Value) -> Result<(), RunError> {
    match (dst, src) {
        (Value::Float(dst), Value::Float(src)) if dst.shape() == src.shape() => {
            let (Some(dst_data), Some(src_data)) = (dst.data_mut(), src.data()) else {
                return Err(RunError::InvalidWriteRequest(
                    "accumulate requires dense storage",
                ));
            };
            for (d, &s) in dst_data.iter_mut().zip(src_data) {
                *d += s;
            }
            Ok(())
        }
        (Value::Int(dst), Value::Int(src)) if dst.shape() == src.shape() => {
            let (Some(dst_data), Some(src_data)) = (dst.data_mut(), src.data()) else {
                return Err(RunError::InvalidWriteRequest(
                    "accumulate requires dense storage",
                ));
            };
            for (d, &s) in dst_data.iter_mut().zip(src_data) {
                *d += s;
            }
            Ok(())
        }
        _ => Err(RunError::InvalidWriteRequest(
            "accumulate requires matching dense destination and gradient",
        )),
    }
}
