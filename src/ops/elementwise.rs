//! Elementwise arithmetic operators.

use std::sync::Arc;

use crate::buffer_pool::BufferPool;
use crate::graph::{Graph, NodeId};
use crate::ops::{DispatchMode, InputList, IntoOpResult, OpError, Operator, OutputList, SumTo};
use crate::tensor::{StorageKind, Tensor, Value};

/// Apply `f` elementwise over two dense tensors.
///
/// Shapes must either match exactly, or one operand must be a scalar which is
/// broadcast against the other.
fn binary_map<F: Fn(f32, f32) -> f32>(
    pool: &BufferPool,
    a: &Tensor<f32>,
    b: &Tensor<f32>,
    f: F,
) -> Result<Tensor<f32>, OpError> {
    let a_data = a.data().ok_or(OpError::UnsupportedStorage(
        "dense path invoked with sparse input",
    ))?;
    let b_data = b.data().ok_or(OpError::UnsupportedStorage(
        "dense path invoked with sparse input",
    ))?;

    let (shape, ctx) = if a.shape() == b.shape() || b.is_scalar() {
        (a.shape(), a.context())
    } else if a.is_scalar() {
        (b.shape(), b.context())
    } else {
        return Err(OpError::IncompatibleInputShapes(
            "shapes must match or one input must be a scalar",
        ));
    };

    let len = shape.iter().product();
    let mut out = pool.alloc::<f32>(len);
    if a.shape() == b.shape() {
        out.extend(a_data.iter().zip(b_data).map(|(&x, &y)| f(x, y)));
    } else if b.is_scalar() {
        let y = b_data[0];
        out.extend(a_data.iter().map(|&x| f(x, y)));
    } else {
        let x = a_data[0];
        out.extend(b_data.iter().map(|&y| f(x, y)));
    }
    Ok(Tensor::from_data(shape, out).with_context(ctx))
}

/// Apply `f` elementwise with the output written over `a`'s buffer.
///
/// Falls back to an ordinary allocation when broadcasting would grow the
/// output beyond `a`'s shape.
fn binary_apply<F: Fn(f32, f32) -> f32>(
    pool: &BufferPool,
    mut a: Tensor<f32>,
    b: &Tensor<f32>,
    f: F,
) -> Result<Tensor<f32>, OpError> {
    if a.is_scalar() && !b.is_scalar() {
        return binary_map(pool, &a, b, f);
    }
    let b_data = b.data().ok_or(OpError::UnsupportedStorage(
        "dense path invoked with sparse input",
    ))?;
    if a.shape() == b.shape() {
        let a_data = a.data_mut().ok_or(OpError::UnsupportedStorage(
            "dense path invoked with sparse input",
        ))?;
        for (x, &y) in a_data.iter_mut().zip(b_data) {
            *x = f(*x, y);
        }
    } else if b.is_scalar() {
        let y = b_data[0];
        a.apply(|x| f(x, y));
    } else {
        return Err(OpError::IncompatibleInputShapes(
            "shapes must match or one input must be a scalar",
        ));
    }
    Ok(a)
}

/// Infer the output shape of a broadcasting binary operator.
fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>, OpError> {
    let a_len: usize = a.iter().product();
    let b_len: usize = b.iter().product();
    if a == b || b_len == 1 {
        Ok(a.to_vec())
    } else if a_len == 1 {
        Ok(b.to_vec())
    } else {
        Err(OpError::IncompatibleInputShapes(
            "shapes must match or one input must be a scalar",
        ))
    }
}

#[derive(Debug)]
pub struct Add {}

impl Operator for Add {
    fn name(&self) -> &str {
        "Add"
    }

    fn num_inputs(&self) -> Option<usize> {
        Some(2)
    }

    fn run(&self, pool: &BufferPool, inputs: InputList) -> Result<OutputList, OpError> {
        let a = inputs.require_float(0)?;
        let b = inputs.require_float(1)?;
        binary_map(pool, a, b, |x, y| x + y).into_op_result()
    }

    fn can_run_in_place(&self) -> bool {
        true
    }

    fn is_commutative(&self) -> bool {
        true
    }

    fn run_in_place(
        &self,
        pool: &BufferPool,
        input: Value,
        rest: InputList,
    ) -> Result<Value, OpError> {
        let a = input.into_float().ok_or(OpError::IncorrectInputType)?;
        let b = rest.require_float(0)?;
        Ok(binary_apply(pool, a, b, |x, y| x + y)?.into())
    }

    fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Vec<usize>>, OpError> {
        Ok(vec![broadcast_shape(inputs[0], inputs[1])?])
    }

    fn gradient(
        &self,
        graph: &mut Graph,
        inputs: &[NodeId],
        _outputs: &[NodeId],
        ograds: &[NodeId],
    ) -> Option<Vec<Option<NodeId>>> {
        let da = graph.add_simple_op(None, Arc::new(SumTo {}), &[ograds[0], inputs[0]]);
        let db = graph.add_simple_op(None, Arc::new(SumTo {}), &[ograds[0], inputs[1]]);
        Some(vec![Some(da), Some(db)])
    }
}

#[derive(Debug)]
pub struct Sub {}

impl Operator for Sub {
    fn name(&self) -> &str {
        "Sub"
    }

    fn num_inputs(&self) -> Option<usize> {
        Some(2)
    }

    fn run(&self, pool: &BufferPool, inputs: InputList) -> Result<OutputList, OpError> {
        let a = inputs.require_float(0)?;
        let b = inputs.require_float(1)?;
        if a.shape() != b.shape() {
            return Err(OpError::IncompatibleInputShapes("shapes must match"));
        }
        binary_map(pool, a, b, |x, y| x - y).into_op_result()
    }

    fn can_run_in_place(&self) -> bool {
        true
    }

    fn run_in_place(
        &self,
        pool: &BufferPool,
        input: Value,
        rest: InputList,
    ) -> Result<Value, OpError> {
        let a = input.into_float().ok_or(OpError::IncorrectInputType)?;
        let b = rest.require_float(0)?;
        if a.shape() != b.shape() {
            return Err(OpError::IncompatibleInputShapes("shapes must match"));
        }
        Ok(binary_apply(pool, a, b, |x, y| x - y)?.into())
    }

    fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Vec<usize>>, OpError> {
        if inputs[0] != inputs[1] {
            return Err(OpError::IncompatibleInputShapes("shapes must match"));
        }
        Ok(vec![inputs[0].to_vec()])
    }

    fn gradient(
        &self,
        graph: &mut Graph,
        _inputs: &[NodeId],
        _outputs: &[NodeId],
        ograds: &[NodeId],
    ) -> Option<Vec<Option<NodeId>>> {
        // Same-shape operands, so the gradients are independent of the
        // forward values and nothing needs to be retained.
        let da = graph.add_simple_op(None, Arc::new(Identity {}), &[ograds[0]]);
        let db = graph.add_simple_op(None, Arc::new(Neg {}), &[ograds[0]]);
        Some(vec![Some(da), Some(db)])
    }
}

#[derive(Debug)]
pub struct Mul {}

impl Operator for Mul {
    fn name(&self) -> &str {
        "Mul"
    }

    fn num_inputs(&self) -> Option<usize> {
        Some(2)
    }

    fn run(&self, pool: &BufferPool, inputs: InputList) -> Result<OutputList, OpError> {
        let a = inputs.require_float(0)?;
        let b = inputs.require_float(1)?;
        binary_map(pool, a, b, |x, y| x * y).into_op_result()
    }

    fn can_run_in_place(&self) -> bool {
        true
    }

    fn is_commutative(&self) -> bool {
        true
    }

    fn run_in_place(
        &self,
        pool: &BufferPool,
        input: Value,
        rest: InputList,
    ) -> Result<Value, OpError> {
        let a = input.into_float().ok_or(OpError::IncorrectInputType)?;
        let b = rest.require_float(0)?;
        Ok(binary_apply(pool, a, b, |x, y| x * y)?.into())
    }

    fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Vec<usize>>, OpError> {
        Ok(vec![broadcast_shape(inputs[0], inputs[1])?])
    }

    fn gradient(
        &self,
        graph: &mut Graph,
        inputs: &[NodeId],
        _outputs: &[NodeId],
        ograds: &[NodeId],
    ) -> Option<Vec<Option<NodeId>>> {
        let da_full = graph.add_simple_op(None, Arc::new(Mul {}), &[ograds[0], inputs[1]]);
        let da = graph.add_simple_op(None, Arc::new(SumTo {}), &[da_full, inputs[0]]);
        let db_full = graph.add_simple_op(None, Arc::new(Mul {}), &[ograds[0], inputs[0]]);
        let db = graph.add_simple_op(None, Arc::new(SumTo {}), &[db_full, inputs[1]]);
        Some(vec![Some(da), Some(db)])
    }
}

#[derive(Debug)]
pub struct Neg {}

impl Operator for Neg {
    fn name(&self) -> &str {
        "Neg"
    }

    fn run(&self, pool: &BufferPool, inputs: InputList) -> Result<OutputList, OpError> {
        let input = inputs.require_float(0)?;
        let data = input.data().ok_or(OpError::UnsupportedStorage(
            "dense path invoked with sparse input",
        ))?;
        let mut out = pool.alloc::<f32>(data.len());
        out.extend(data.iter().map(|x| -x));
        Tensor::from_data(input.shape(), out)
            .with_context(input.context())
            .into_op_result()
    }

    fn can_run_in_place(&self) -> bool {
        true
    }

    fn run_in_place(
        &self,
        _pool: &BufferPool,
        input: Value,
        _rest: InputList,
    ) -> Result<Value, OpError> {
        let mut t = input.into_float().ok_or(OpError::IncorrectInputType)?;
        t.apply(|x| -x);
        Ok(t.into())
    }

    fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Vec<usize>>, OpError> {
        Ok(vec![inputs[0].to_vec()])
    }

    fn gradient(
        &self,
        graph: &mut Graph,
        _inputs: &[NodeId],
        _outputs: &[NodeId],
        ograds: &[NodeId],
    ) -> Option<Vec<Option<NodeId>>> {
        let dx = graph.add_simple_op(None, Arc::new(Neg {}), &[ograds[0]]);
        Some(vec![Some(dx)])
    }
}

/// Copies its input unchanged.
#[derive(Debug)]
pub struct Identity {}

impl Operator for Identity {
    fn name(&self) -> &str {
        "Identity"
    }

    fn run(&self, _pool: &BufferPool, inputs: InputList) -> Result<OutputList, OpError> {
        Ok([inputs.require(0)?.clone()].into())
    }

    fn can_run_in_place(&self) -> bool {
        true
    }

    fn run_in_place(
        &self,
        _pool: &BufferPool,
        input: Value,
        _rest: InputList,
    ) -> Result<Value, OpError> {
        Ok(input)
    }

    fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Vec<usize>>, OpError> {
        Ok(vec![inputs[0].to_vec()])
    }

    fn infer_storage(&self, inputs: &[StorageKind]) -> Option<(Vec<StorageKind>, DispatchMode)> {
        // Pass-through works for any storage kind.
        Some((vec![inputs[0]], DispatchMode::Dense))
    }

    fn gradient(
        &self,
        graph: &mut Graph,
        _inputs: &[NodeId],
        _outputs: &[NodeId],
        ograds: &[NodeId],
    ) -> Option<Vec<Option<NodeId>>> {
        let dx = graph.add_simple_op(None, Arc::new(Identity {}), &[ograds[0]]);
        Some(vec![Some(dx)])
    }
}

/// Variadic elementwise sum, used to fold multiple gradient contributions to
/// one entry.
#[derive(Debug)]
pub struct AddN {}

impl Operator for AddN {
    fn name(&self) -> &str {
        "AddN"
    }

    fn num_inputs(&self) -> Option<usize> {
        None
    }

    fn run(&self, pool: &BufferPool, inputs: InputList) -> Result<OutputList, OpError> {
        let first = inputs.require_float(0)?;
        let data = first.data().ok_or(OpError::UnsupportedStorage(
            "dense path invoked with sparse input",
        ))?;
        let mut out = pool.alloc::<f32>(data.len());
        out.extend_from_slice(data);
        let mut acc = Tensor::from_data(first.shape(), out).with_context(first.context());
        for index in 1..inputs.len() {
            let next = inputs.require_float(index)?;
            acc = binary_apply(pool, acc, next, |x, y| x + y)?;
        }
        acc.into_op_result()
    }

    fn can_run_in_place(&self) -> bool {
        true
    }

    fn is_commutative(&self) -> bool {
        true
    }

    fn run_in_place(
        &self,
        pool: &BufferPool,
        input: Value,
        rest: InputList,
    ) -> Result<Value, OpError> {
        let mut acc = input.into_float().ok_or(OpError::IncorrectInputType)?;
        for index in 0..rest.len() {
            let next = rest.require_float(index)?;
            acc = binary_apply(pool, acc, next, |x, y| x + y)?;
        }
        Ok(acc.into())
    }

    fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Vec<usize>>, OpError> {
        let first = *inputs.first().ok_or(OpError::MissingInputs)?;
        if inputs.iter().any(|&shape| shape != first) {
            return Err(OpError::IncompatibleInputShapes(
                "all inputs must share one shape",
            ));
        }
        Ok(vec![first.to_vec()])
    }

    fn gradient(
        &self,
        graph: &mut Graph,
        inputs: &[NodeId],
        _outputs: &[NodeId],
        ograds: &[NodeId],
    ) -> Option<Vec<Option<NodeId>>> {
        let grads = inputs
            .iter()
            .map(|_| Some(graph.add_simple_op(None, Arc::new(Identity {}), &[ograds[0]])))
            .collect();
        Some(grads)
    }

    fn is_accumulation(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::{Add, AddN, Mul, Neg, Sub};
    use crate::buffer_pool::BufferPool;
    use crate::ops::{InputList, OpError, Operator};
    use crate::tensor::{Tensor, Value};

    fn run_binary(op: &dyn Operator, a: Tensor<f32>, b: Tensor<f32>) -> Result<Tensor<f32>, OpError> {
        let pool = BufferPool::new();
        let a: Value = a.into();
        let b: Value = b.into();
        let outputs = op.run(&pool, InputList::from([&a, &b].as_slice()))?;
        Ok(outputs.into_iter().next().unwrap().into_float().unwrap())
    }

    #[test]
    fn test_add() {
        let result = run_binary(
            &Add {},
            Tensor::from_vec(vec![1., 2., 3.]),
            Tensor::from_vec(vec![10., 20., 30.]),
        )
        .unwrap();
        assert_eq!(result.data(), Some([11., 22., 33.].as_slice()));
    }

    #[test]
    fn test_add_scalar_broadcast() {
        let result = run_binary(
            &Add {},
            Tensor::from_scalar(5.),
            Tensor::from_vec(vec![1., 2.]),
        )
        .unwrap();
        assert_eq!(result.shape(), &[2]);
        assert_eq!(result.data(), Some([6., 7.].as_slice()));
    }

    #[test]
    fn test_sub_requires_matching_shapes() {
        let result = run_binary(
            &Sub {},
            Tensor::from_vec(vec![1., 2.]),
            Tensor::from_scalar(1.),
        );
        assert_eq!(
            result.err(),
            Some(OpError::IncompatibleInputShapes("shapes must match"))
        );
    }

    #[test]
    fn test_mul() {
        let result = run_binary(
            &Mul {},
            Tensor::from_vec(vec![1., 2., 3.]),
            Tensor::from_scalar(2.),
        )
        .unwrap();
        assert_eq!(result.data(), Some([2., 4., 6.].as_slice()));
    }

    #[test]
    fn test_neg_in_place() {
        let pool = BufferPool::new();
        let input: Value = Tensor::from_vec(vec![1., -2.]).into();
        let result = Neg {}
            .run_in_place(&pool, input, InputList::new())
            .unwrap();
        assert_eq!(
            result.as_float_ref().unwrap().data(),
            Some([-1., 2.].as_slice())
        );
    }

    #[test]
    fn test_add_n() {
        let pool = BufferPool::new();
        let a: Value = Tensor::from_vec(vec![1., 2.]).into();
        let b: Value = Tensor::from_vec(vec![10., 20.]).into();
        let c: Value = Tensor::from_vec(vec![100., 200.]).into();
        let outputs = AddN {}
            .run(&pool, InputList::from([&a, &b, &c].as_slice()))
            .unwrap();
        let result = outputs.into_iter().next().unwrap().into_float().unwrap();
        assert_eq!(result.data(), Some([111., 222.].as_slice()));
    }
}
