//! Execution engine: planning, dynamic and static executors.
//!
//! The planner decides whether a cached plan is reusable for the current
//! call's input signature and partitions the node sequence into bulk
//! segments; the dynamic executor allocates fresh buffers per call while the
//! static executor replays a preplanned buffer layout. Both share the
//! [`ExecState`] bundle, which ties a forward call to its eventual backward
//! call and is recycled through the state pool.

use std::error::Error;
use std::fmt;

use crate::infer::Annotations;
use crate::ops::OpError;
use crate::tensor::{Context, Value};

pub(crate) mod dynamic;
pub(crate) mod planner;
pub(crate) mod static_mem;

pub use planner::Signature;

/// Reasons why executing a cached op failed.
///
/// All failures surface synchronously to the call that triggered them and
/// are never retried internally. A failed call leaves its output slots
/// unmodified.
#[derive(Debug, Eq, PartialEq)]
pub enum RunError {
    /// A plan could not be constructed for the current inputs, including
    /// shape/type/storage inference that did not converge.
    PlanningError(String),

    /// A node has no compute path for the inferred storage-kind combination.
    UnsupportedDispatch { name: String },

    /// Execution of an operator failed.
    OperatorError { name: String, error: OpError },

    /// An operator produced a different number of outputs than its node
    /// declares.
    OutputMismatch(&'static str),

    /// A backward call was issued against a state whose graph snapshot was
    /// already consumed by a previous backward with `retain_graph` false.
    StateConsumed,

    /// A state was used in a way that does not match how it was produced.
    StateMismatch(&'static str),

    /// A write request cannot be honored by the destination buffer.
    InvalidWriteRequest(&'static str),

    /// The number or placement of call arguments does not match the cached
    /// op.
    InputMismatch(String),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::PlanningError(err) => write!(f, "planning error: {}", err),
            RunError::UnsupportedDispatch { name } => write!(
                f,
                "operator \"{}\" is unimplemented for this input configuration",
                name
            ),
            RunError::OperatorError { name, error } => {
                write!(f, "operator \"{}\" failed: {}", name, error)
            }
            RunError::OutputMismatch(err) => write!(f, "output mismatch: {}", err),
            RunError::StateConsumed => {
                write!(f, "state was already consumed; pass retain_graph to replay")
            }
            RunError::StateMismatch(err) => write!(f, "state mismatch: {}", err),
            RunError::InvalidWriteRequest(err) => write!(f, "invalid write request: {}", err),
            RunError::InputMismatch(err) => write!(f, "input mismatch: {}", err),
        }
    }
}

impl Error for RunError {}

/// Per-output write semantics for backward calls.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WriteReq {
    /// Overwrite the destination.
    Write,

    /// Accumulate into the existing destination buffer.
    Add,

    /// Skip this destination entirely.
    Null,
}

/// Phase of a single call against an execution state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Phase {
    Idle,
    Planned,
    Running,
    Completed,
}

/// A contiguous run of graph nodes submitted to a stream as one unit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Segment {
    pub start: usize,
    pub end: usize,
}

/// The reusable bundle tying a forward call to its eventual backward call:
/// cached signatures and annotations, bulk segments, per-entry buffers and
/// the static memory plans.
///
/// A state is owned exclusively by the call holding its pool handle. Cached
/// plans survive across loans; buffers and flags are transient and reset on
/// each acquisition.
pub struct ExecState {
    pub(crate) phase: Phase,
    pub(crate) recording: bool,
    pub(crate) consumed: bool,

    /// Signature the cached forward annotations were built for.
    pub(crate) fwd_sig: Option<Signature>,

    /// Signature the cached backward annotations were built for.
    pub(crate) bwd_sig: Option<Signature>,

    /// Full-graph annotations, forward entries filled by `set_forward_graph`
    /// and gradient entries by `set_backward_graph`.
    pub(crate) annot: Option<Annotations>,

    pub(crate) fwd_segments: Vec<Segment>,
    pub(crate) bwd_segments: Vec<Segment>,

    /// Per-entry value buffers, indexed by node ID.
    pub(crate) buffers: Vec<Option<Value>>,

    /// Static memory plans, built on first use per signature.
    pub(crate) static_fwd: Option<static_mem::StaticMem>,
    pub(crate) static_bwd: Option<static_mem::StaticMem>,

    /// Number of times the forward plan was rebuilt after initially being
    /// built, i.e. signature changes observed by this state.
    pub(crate) replans: usize,
}

impl ExecState {
    pub(crate) fn new(num_nodes: usize) -> ExecState {
        ExecState {
            phase: Phase::Idle,
            recording: false,
            consumed: false,
            fwd_sig: None,
            bwd_sig: None,
            annot: None,
            fwd_segments: Vec::new(),
            bwd_segments: Vec::new(),
            buffers: vec![None; num_nodes],
            static_fwd: None,
            static_bwd: None,
            replans: 0,
        }
    }

    /// Reset per-call fields, keeping cached plans and annotations.
    pub(crate) fn reset_transient(&mut self) {
        self.phase = Phase::Idle;
        self.recording = false;
        self.consumed = false;
        for buffer in self.buffers.iter_mut() {
            *buffer = None;
        }
    }

    /// Number of forward re-plans this state has performed.
    pub fn replan_count(&self) -> usize {
        self.replans
    }

    /// Drop the graph snapshot after a non-retaining backward; further
    /// backward calls against this state must fail.
    pub(crate) fn consume(&mut self) {
        self.consumed = true;
        for buffer in self.buffers.iter_mut() {
            *buffer = None;
        }
    }
}

/// Verify all values live on one device context and return it.
pub(crate) fn check_uniform_context(values: &[Value]) -> Result<Option<Context>, RunError> {
    let mut ctx = None;
    for value in values {
        match ctx {
            None => ctx = Some(value.context()),
            Some(existing) if existing == value.context() => {}
            Some(_) => {
                return Err(RunError::InputMismatch(
                    "inputs span multiple device contexts".to_string(),
                ))
            }
        }
    }
    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::{check_uniform_context, ExecState, Phase, RunError};
    use crate::tensor::{Context, Tensor, Value};

    #[test]
    fn test_reset_transient_keeps_plans() {
        let mut state = ExecState::new(4);
        state.phase = Phase::Completed;
        state.recording = true;
        state.replans = 3;
        state.buffers[1] = Some(Tensor::from_scalar(1.0f32).into());

        state.reset_transient();
        assert_eq!(state.phase, Phase::Idle);
        assert!(!state.recording);
        assert!(state.buffers[1].is_none());
        // The replan counter and cached plans survive recycling.
        assert_eq!(state.replan_count(), 3);
    }

    #[test]
    fn test_check_uniform_context() {
        let a: Value = Tensor::from_scalar(1.0f32).into();
        let b: Value = Tensor::from_scalar(2.0f32)
            .with_context(Context::Cpu(1))
            .into();
        assert_eq!(
            check_uniform_context(&[a.clone()]).unwrap(),
            Some(Context::Cpu(0))
        );
        assert!(matches!(
            check_uniform_context(&[a, b]),
            Err(RunError::InputMismatch(_))
        ));
    }
}
