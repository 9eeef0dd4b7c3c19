//! Reduction and shape-adapting operators.
//!
//! `SumTo` and `BroadcastLike` are the shape-polymorphic halves of the
//! broadcasting arithmetic gradients: the gradient graph is built before any
//! call-time shapes are known, so collapsing or expanding a gradient to match
//! its target is deferred to these operators.

use std::sync::Arc;

use crate::buffer_pool::BufferPool;
use crate::graph::{Graph, NodeId};
use crate::ops::{InputList, IntoOpResult, OpError, Operator, OutputList};
use crate::tensor::Tensor;

/// Sum all elements of the input into a scalar.
#[derive(Debug)]
pub struct SumAll {}

impl Operator for SumAll {
    fn name(&self) -> &str {
        "SumAll"
    }

    fn run(&self, _pool: &BufferPool, inputs: InputList) -> Result<OutputList, OpError> {
        let input = inputs.require_float(0)?;
        let data = input.data().ok_or(OpError::UnsupportedStorage(
            "dense path invoked with sparse input",
        ))?;
        let total: f32 = data.iter().sum();
        Tensor::from_scalar(total)
            .with_context(input.context())
            .into_op_result()
    }

    fn infer_shapes(&self, _inputs: &[&[usize]]) -> Result<Vec<Vec<usize>>, OpError> {
        Ok(vec![Vec::new()])
    }

    fn gradient(
        &self,
        graph: &mut Graph,
        inputs: &[NodeId],
        _outputs: &[NodeId],
        ograds: &[NodeId],
    ) -> Option<Vec<Option<NodeId>>> {
        let dx = graph.add_simple_op(None, Arc::new(BroadcastLike {}), &[ograds[0], inputs[0]]);
        Some(vec![Some(dx)])
    }
}

/// Adapt the first input to the shape of the second.
///
/// A no-op copy when the shapes already match; a full reduction when the
/// target is a scalar; a fill when the source is a scalar. This mirrors the
/// scalar broadcast rules of the arithmetic operators, whose gradients must
/// collapse (or expand) a contribution back to the operand's shape without
/// knowing at graph-build time which operand was the scalar.
#[derive(Debug)]
pub struct SumTo {}

impl Operator for SumTo {
    fn name(&self) -> &str {
        "SumTo"
    }

    fn num_inputs(&self) -> Option<usize> {
        Some(2)
    }

    fn run(&self, pool: &BufferPool, inputs: InputList) -> Result<OutputList, OpError> {
        let src = inputs.require_float(0)?;
        let like = inputs.require_float(1)?;
        if src.shape() == like.shape() {
            return src.clone().into_op_result();
        }
        let data = src.data().ok_or(OpError::UnsupportedStorage(
            "dense path invoked with sparse input",
        ))?;
        if like.is_scalar() {
            let total: f32 = data.iter().sum();
            return Tensor::from_data(like.shape(), vec![total])
                .with_context(src.context())
                .into_op_result();
        }
        if src.is_scalar() {
            let len = like.len();
            let mut out = pool.alloc::<f32>(len);
            out.resize(len, data[0]);
            return Tensor::from_data(like.shape(), out)
                .with_context(src.context())
                .into_op_result();
        }
        Err(OpError::IncompatibleInputShapes(
            "source or target must be a scalar, or the shapes must match",
        ))
    }

    fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Vec<usize>>, OpError> {
        let src_len: usize = inputs[0].iter().product();
        let like_len: usize = inputs[1].iter().product();
        if inputs[0] != inputs[1] && like_len != 1 && src_len != 1 {
            return Err(OpError::IncompatibleInputShapes(
                "source or target must be a scalar, or the shapes must match",
            ));
        }
        Ok(vec![inputs[1].to_vec()])
    }
}

/// Broadcast a scalar first input to the shape of the second.
///
/// A no-op copy when the shapes already match.
#[derive(Debug)]
pub struct BroadcastLike {}

impl Operator for BroadcastLike {
    fn name(&self) -> &str {
        "BroadcastLike"
    }

    fn num_inputs(&self) -> Option<usize> {
        Some(2)
    }

    fn run(&self, pool: &BufferPool, inputs: InputList) -> Result<OutputList, OpError> {
        let src = inputs.require_float(0)?;
        let like = inputs.require_float(1)?;
        if src.shape() == like.shape() {
            return src.clone().into_op_result();
        }
        if !src.is_scalar() {
            return Err(OpError::IncompatibleInputShapes(
                "source must be a scalar or match the target shape",
            ));
        }
        let fill = src.item().ok_or(OpError::UnsupportedStorage(
            "dense path invoked with sparse input",
        ))?;
        let len = like.len();
        let mut out = pool.alloc::<f32>(len);
        out.resize(len, fill);
        Tensor::from_data(like.shape(), out)
            .with_context(src.context())
            .into_op_result()
    }

    fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Vec<usize>>, OpError> {
        let src_len: usize = inputs[0].iter().product();
        if inputs[0] != inputs[1] && src_len != 1 {
            return Err(OpError::IncompatibleInputShapes(
                "source must be a scalar or match the target shape",
            ));
        }
        Ok(vec![inputs[1].to_vec()])
    }
}

/// Produce a zero-filled tensor with the shape of the input.
#[derive(Debug)]
pub struct ZerosLike {}

impl Operator for ZerosLike {
    fn name(&self) -> &str {
        "ZerosLike"
    }

    fn run(&self, pool: &BufferPool, inputs: InputList) -> Result<OutputList, OpError> {
        let like = inputs.require_float(0)?;
        pool.alloc_zeroed(like.shape())
            .with_context(like.context())
            .into_op_result()
    }

    fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Vec<usize>>, OpError> {
        Ok(vec![inputs[0].to_vec()])
    }

    fn gradient(
        &self,
        _graph: &mut Graph,
        inputs: &[NodeId],
        _outputs: &[NodeId],
        _ograds: &[NodeId],
    ) -> Option<Vec<Option<NodeId>>> {
        Some(vec![None; inputs.len()])
    }
}

#[cfg(test)]
mod tests {
    use super::{BroadcastLike, SumAll, SumTo};
    use crate::buffer_pool::BufferPool;
    use crate::ops::{InputList, OpError, Operator};
    use crate::tensor::{Tensor, Value};

    #[test]
    fn test_sum_all() {
        let pool = BufferPool::new();
        let input: Value = Tensor::from_data(&[2, 2], vec![1., 2., 3., 4.]).into();
        let outputs = SumAll {}
            .run(&pool, InputList::from([&input].as_slice()))
            .unwrap();
        let result = outputs.into_iter().next().unwrap().into_float().unwrap();
        assert_eq!(result.shape(), &[] as &[usize]);
        assert_eq!(result.item(), Some(10.));
    }

    #[test]
    fn test_sum_to_scalar() {
        let pool = BufferPool::new();
        let src: Value = Tensor::from_vec(vec![1., 2., 3.]).into();
        let like: Value = Tensor::from_scalar(0.).into();
        let outputs = SumTo {}
            .run(&pool, InputList::from([&src, &like].as_slice()))
            .unwrap();
        let result = outputs.into_iter().next().unwrap().into_float().unwrap();
        assert_eq!(result.item(), Some(6.));
    }

    #[test]
    fn test_sum_to_same_shape_copies() {
        let pool = BufferPool::new();
        let src: Value = Tensor::from_vec(vec![1., 2.]).into();
        let like: Value = Tensor::from_vec(vec![0., 0.]).into();
        let outputs = SumTo {}
            .run(&pool, InputList::from([&src, &like].as_slice()))
            .unwrap();
        let result = outputs.into_iter().next().unwrap().into_float().unwrap();
        assert_eq!(result.data(), Some([1., 2.].as_slice()));
    }

    #[test]
    fn test_sum_to_broadcasts_scalar_source() {
        let pool = BufferPool::new();
        let src: Value = Tensor::from_scalar(2.).into();
        let like: Value = Tensor::from_vec(vec![0., 0., 0.]).into();
        let outputs = SumTo {}
            .run(&pool, InputList::from([&src, &like].as_slice()))
            .unwrap();
        let result = outputs.into_iter().next().unwrap().into_float().unwrap();
        assert_eq!(result.data(), Some([2., 2., 2.].as_slice()));
    }

    #[test]
    fn test_broadcast_like() {
        let pool = BufferPool::new();
        let src: Value = Tensor::from_scalar(3.).into();
        let like: Value = Tensor::from_data(&[2, 2], vec![0.; 4]).into();
        let outputs = BroadcastLike {}
            .run(&pool, InputList::from([&src, &like].as_slice()))
            .unwrap();
        let result = outputs.into_iter().next().unwrap().into_float().unwrap();
        assert_eq!(result.shape(), &[2, 2]);
        assert_eq!(result.data(), Some([3., 3., 3., 3.].as_slice()));
    }

    #[test]
    fn test_broadcast_like_rejects_non_scalar() {
        let pool = BufferPool::new();
        let src: Value = Tensor::from_vec(vec![1., 2.]).into();
        let like: Value = Tensor::from_data(&[3], vec![0.; 3]).into();
        let result = BroadcastLike {}.run(&pool, InputList::from([&src, &like].as_slice()));
        assert!(matches!(
            result.err(),
            Some(OpError::IncompatibleInputShapes(_))
        ));
    }
}
