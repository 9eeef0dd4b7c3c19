//! The [`Operator`] trait and the built-in operator library.
//!
//! An operator bundles everything the executor needs to know about one kind
//! of node: the dense and sparse-aware compute paths, the shape / dtype /
//! storage inference callbacks and the gradient rule. Graph nodes own their
//! operator as `Arc<dyn Operator>`, so the "registry" consulted during graph
//! building and execution is just the vtable — tests can inject synthetic
//! operators without any global registration.

use std::error::Error;
use std::fmt;
use std::fmt::Debug;

use smallvec::SmallVec;

use crate::buffer_pool::BufferPool;
use crate::graph::{Graph, NodeId};
use crate::tensor::{DType, StorageKind, Tensor, Value};

mod elementwise;
mod optimizer;
mod reduce;
mod sparse;

pub use elementwise::{Add, AddN, Identity, Mul, Neg, Sub};
pub use optimizer::{SgdMomUpdate, SgdUpdate};
pub use reduce::{BroadcastLike, SumAll, SumTo, ZerosLike};
pub use sparse::SparseDenseDiv;

/// Possible reasons why an operator may fail on a given input.
#[derive(Eq, PartialEq, Debug)]
pub enum OpError {
    /// The number of inputs was less than the required number.
    MissingInputs,

    /// An input did not have the element type the operator requires.
    IncorrectInputType,

    /// Input tensor shapes are not compatible with each other or operator
    /// attributes.
    IncompatibleInputShapes(&'static str),

    /// Input element types are not compatible with each other.
    IncompatibleInputTypes(&'static str),

    /// An input has a value that is incorrect.
    InvalidValue(&'static str),

    /// The operator has no compute path for the given storage kinds.
    UnsupportedStorage(&'static str),
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpError::MissingInputs => write!(f, "required inputs were missing"),
            OpError::IncorrectInputType => write!(f, "input had incorrect element type"),
            OpError::IncompatibleInputShapes(details) => {
                write!(f, "incompatible input shapes: {}", details)
            }
            OpError::IncompatibleInputTypes(details) => {
                write!(f, "incompatible input types: {}", details)
            }
            OpError::InvalidValue(details) => {
                write!(f, "input or attribute has invalid value: {}", details)
            }
            OpError::UnsupportedStorage(details) => {
                write!(f, "unsupported input storage: {}", details)
            }
        }
    }
}

impl Error for OpError {}

/// How a node's compute function should be dispatched, selected by storage
/// inference from the operand storage kinds.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DispatchMode {
    /// Reference dense path ([`Operator::run`]).
    Dense,

    /// Sparse-aware path ([`Operator::run_sparse`]).
    SparseAware,
}

/// An immutable list of operator input values.
pub struct InputList<'a> {
    inputs: SmallVec<[&'a Value; 4]>,
}

impl<'a> InputList<'a> {
    pub fn new() -> InputList<'a> {
        InputList {
            inputs: SmallVec::new(),
        }
    }

    pub fn push(&mut self, value: &'a Value) {
        self.inputs.push(value);
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a Value> + '_ {
        self.inputs.iter().copied()
    }

    pub fn get(&self, index: usize) -> Option<&'a Value> {
        self.inputs.get(index).copied()
    }

    pub fn require(&self, index: usize) -> Result<&'a Value, OpError> {
        self.get(index).ok_or(OpError::MissingInputs)
    }

    /// Return the input at `index` as a float tensor, or an error if it is
    /// missing or has a different element type.
    pub fn require_float(&self, index: usize) -> Result<&'a Tensor<f32>, OpError> {
        self.require(index)?
            .as_float_ref()
            .ok_or(OpError::IncorrectInputType)
    }
}

impl<'a> From<&[&'a Value]> for InputList<'a> {
    fn from(inputs: &[&'a Value]) -> InputList<'a> {
        InputList {
            inputs: inputs.iter().copied().collect(),
        }
    }
}

impl<'a> Default for InputList<'a> {
    fn default() -> Self {
        Self::new()
    }
}

/// Outputs of a single operator execution.
pub type OutputList = SmallVec<[Value; 1]>;

/// Trait for values that can be converted into the result type used by
/// [`Operator::run`].
pub trait IntoOpResult {
    fn into_op_result(self) -> Result<OutputList, OpError>;
}

impl IntoOpResult for Value {
    fn into_op_result(self) -> Result<OutputList, OpError> {
        Ok([self].into())
    }
}

impl IntoOpResult for Tensor<f32> {
    fn into_op_result(self) -> Result<OutputList, OpError> {
        Ok([self.into()].into())
    }
}

impl IntoOpResult for Tensor<i32> {
    fn into_op_result(self) -> Result<OutputList, OpError> {
        Ok([self.into()].into())
    }
}

impl<T> IntoOpResult for Result<T, OpError>
where
    T: IntoOpResult,
{
    fn into_op_result(self) -> Result<OutputList, OpError> {
        self.and_then(|out| out.into_op_result())
    }
}

/// An operator: compute paths, inference callbacks and gradient rule for one
/// kind of graph node.
pub trait Operator: Debug + Send + Sync {
    /// Return the name of this operator as used in error messages.
    fn name(&self) -> &str;

    /// Expected number of inputs, or `None` for variadic operators.
    fn num_inputs(&self) -> Option<usize> {
        Some(1)
    }

    /// Number of outputs produced by this operator.
    fn num_outputs(&self) -> usize {
        1
    }

    /// Execute the operator's dense compute path.
    fn run(&self, pool: &BufferPool, inputs: InputList) -> Result<OutputList, OpError>;

    /// Execute the operator's sparse-aware compute path.
    ///
    /// Called when storage inference selected [`DispatchMode::SparseAware`]
    /// for the node. The default has no such path.
    fn run_sparse(&self, _pool: &BufferPool, _inputs: InputList) -> Result<OutputList, OpError> {
        Err(OpError::UnsupportedStorage(
            "operator has no sparse-aware compute path",
        ))
    }

    /// Return true if this operator can reuse its first input's buffer as
    /// its output via [`Operator::run_in_place`].
    fn can_run_in_place(&self) -> bool {
        false
    }

    /// Return true if the operator's result is independent of input order.
    ///
    /// The executor may swap inputs of commutative operators to enable
    /// running them in place.
    fn is_commutative(&self) -> bool {
        false
    }

    /// Execute the operator with `input` passed by value, reusing its buffer
    /// for the output. `rest` holds the remaining inputs.
    fn run_in_place(
        &self,
        _pool: &BufferPool,
        _input: Value,
        _rest: InputList,
    ) -> Result<Value, OpError> {
        Err(OpError::InvalidValue("operator cannot run in place"))
    }

    /// Infer output shapes from input shapes.
    fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Vec<usize>>, OpError>;

    /// Infer output element types from input element types.
    ///
    /// The default requires all inputs to share one type and propagates it.
    fn infer_dtypes(&self, inputs: &[DType]) -> Result<Vec<DType>, OpError> {
        let first = *inputs.first().ok_or(OpError::MissingInputs)?;
        if inputs.iter().any(|&dtype| dtype != first) {
            return Err(OpError::IncompatibleInputTypes(
                "inputs must share one element type",
            ));
        }
        Ok(vec![first; self.num_outputs()])
    }

    /// Infer output storage kinds and select a dispatch mode from input
    /// storage kinds, or return `None` if no compute path supports the
    /// combination.
    ///
    /// The default supports only all-dense operands.
    fn infer_storage(&self, inputs: &[StorageKind]) -> Option<(Vec<StorageKind>, DispatchMode)> {
        if inputs.iter().all(|&kind| kind == StorageKind::Dense) {
            Some((
                vec![StorageKind::Dense; self.num_outputs()],
                DispatchMode::Dense,
            ))
        } else {
            None
        }
    }

    /// Append nodes computing this node's input gradients to `graph`.
    ///
    /// `inputs` and `outputs` are the forward node's value entries and
    /// `ograds` holds one gradient entry per output. Returns one entry per
    /// input (`None` where no gradient flows), or `None` if the operator is
    /// not differentiable, which makes any graph containing it fail gradient
    /// construction.
    fn gradient(
        &self,
        _graph: &mut Graph,
        _inputs: &[NodeId],
        _outputs: &[NodeId],
        _ograds: &[NodeId],
    ) -> Option<Vec<Option<NodeId>>> {
        None
    }

    /// Input indices this operator updates in place (e.g. optimizer state).
    ///
    /// The leading outputs pair up with these entries: output `i` is the
    /// updated value of input `mutated_inputs()[i]`. The executor writes
    /// them back to the caller's input slots after the node runs.
    fn mutated_inputs(&self) -> &[usize] {
        &[]
    }

    /// Return true if callers must observe this node's result synchronously.
    ///
    /// Such nodes force a bulk-segment boundary and are submitted on their
    /// own.
    fn requires_sync(&self) -> bool {
        false
    }

    /// Return true for gradient-accumulation fold nodes.
    ///
    /// The static memory planner may turn these into add-to writes against
    /// an existing buffer.
    fn is_accumulation(&self) -> bool {
        false
    }
}
