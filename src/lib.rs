//! gradcache is a caching executor for imperatively-built tensor computation
//! graphs.
//!
//! A [`Graph`] is recorded one operator at a time, then compiled into a
//! [`CachedOp`], which derives the backward (gradient) graph by symbolic
//! differentiation and analyzes exactly which forward inputs and outputs the
//! backward pass needs, so everything else can be released as soon as the
//! forward pass is done with it. Repeated calls reuse cached plans as long
//! as the input signature (shapes, element types, storage kinds) matches,
//! and pooled per-device execution states avoid rebuilding annotations from
//! scratch.
//!
//! Two execution strategies are available:
//!
//! - **Dynamic** (the default): replans when input characteristics change
//!   and allocates fresh buffers per call, reusing them within the call
//!   through a buffer pool.
//! - **Static memory** ([`CachedOpConfig::static_memory`]): precomputes a
//!   fixed buffer layout per signature using lifetime-based slot assignment
//!   and replays it across calls, trading replanning cost for steady-state
//!   throughput.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use gradcache::ops::{Mul, SumAll};
//! use gradcache::{CachedOp, CachedOpConfig, Graph, Tensor, Value, WriteReq};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // loss = sum(a * x), with scalar a.
//! let mut graph = Graph::new();
//! let a = graph.add_value(Some("a"));
//! let x = graph.add_value(Some("x"));
//! let ax = graph.add_simple_op(None, Arc::new(Mul {}), &[a, x]);
//! let loss = graph.add_simple_op(None, Arc::new(SumAll {}), &[ax]);
//! let op = CachedOp::new(graph, &[a, x], &[loss], CachedOpConfig::default())?;
//!
//! let mut inputs: Vec<Value> = vec![
//!     Tensor::from_scalar(2.0).into(),
//!     Tensor::from_vec(vec![1.0, 2.0, 3.0]).into(),
//! ];
//! let mut outputs = vec![None];
//! let mut state = op.forward(&mut inputs, &mut outputs, true)?.unwrap();
//! assert_eq!(outputs[0].as_ref().unwrap().as_float_ref().unwrap().item(), Some(12.0));
//!
//! // d loss / d a = sum(x); d loss / d x = a.
//! let ograds: Vec<Value> = vec![Tensor::from_scalar(1.0).into()];
//! let mut igrads = vec![None, None];
//! op.backward(false, &mut state, &ograds, &[WriteReq::Write; 2], &mut igrads)?;
//! assert_eq!(igrads[0].as_ref().unwrap().as_float_ref().unwrap().item(), Some(6.0));
//! # Ok(()) }
//! ```
//!
//! # Threading
//!
//! Executions run inside a crate-owned Rayon thread pool sized to the number
//! of physical cores; see [`thread_pool`]. Calls against different device
//! contexts are fully independent; calls against one context share its FIFO
//! execution stream.

mod buffer_pool;
mod cached_op;
mod env;
mod exec;
mod gradient;
mod graph;
mod infer;
mod pool;
mod stream;
mod tensor;
mod threading;

#[cfg(test)]
mod test_util;

pub mod ops;

pub use buffer_pool::BufferPool;
pub use cached_op::{CachedOp, CachedOpConfig, OpState};
pub use exec::{ExecState, RunError, Signature, WriteReq};
pub use graph::{Graph, GraphError, Node, NodeId};
pub use ops::{DispatchMode, InputList, OpError, Operator, OutputList};
pub use pool::{StateHandle, StatePool};
pub use stream::{stream_for, CpuStream, Stream};
pub use tensor::{Context, DType, StorageKind, Tensor, Value};
pub use threading::{thread_pool, ThreadPool};
