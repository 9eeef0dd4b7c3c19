//! Optimizer update operators.
//!
//! These update their weight (and momentum state) inputs in place, making
//! them the canonical mutable-input nodes of a forward graph. They have
//! stop-gradient rules: gradients never flow through an update step.
//!
//! Both operators support a row-sparse gradient via the sparse-aware dispatch
//! path. Whether a row-sparse gradient triggers a lazy update (only stored
//! rows touched) or a standard update (weight decay applied to every row) is
//! per-operator configuration via the `lazy_update` field, selected together
//! with the operand storage kinds in `infer_storage`.

use crate::buffer_pool::BufferPool;
use crate::graph::{Graph, NodeId};
use crate::ops::{DispatchMode, InputList, IntoOpResult, OpError, Operator, OutputList};
use crate::tensor::{StorageKind, Tensor};

/// Clip `x` to `[-limit, limit]`. A negative limit disables clipping.
fn clip(x: f32, limit: f32) -> f32 {
    if limit >= 0.0 {
        x.clamp(-limit, limit)
    } else {
        x
    }
}

fn require_dense(t: &Tensor<f32>) -> Result<&[f32], OpError> {
    t.data()
        .ok_or(OpError::UnsupportedStorage("expected dense storage"))
}

/// Stochastic gradient descent update: `w = (1 - lr*wd)*w - lr*clip(rescale*g)`.
#[derive(Debug)]
pub struct SgdUpdate {
    pub lr: f32,
    pub wd: f32,
    pub rescale_grad: f32,
    /// Clip rescaled gradients to `[-clip_gradient, clip_gradient]`.
    /// Negative values disable clipping.
    pub clip_gradient: f32,
    /// Apply lazy updates when the gradient is row-sparse.
    pub lazy_update: bool,
}

impl Default for SgdUpdate {
    fn default() -> SgdUpdate {
        SgdUpdate {
            lr: 0.01,
            wd: 0.0,
            rescale_grad: 1.0,
            clip_gradient: -1.0,
            lazy_update: true,
        }
    }
}

impl SgdUpdate {
    fn updated_element(&self, w: f32, g: f32, wd: f32) -> f32 {
        (1.0 - self.lr * wd) * w - self.lr * clip(self.rescale_grad * g, self.clip_gradient)
    }
}

impl Operator for SgdUpdate {
    fn name(&self) -> &str {
        "SgdUpdate"
    }

    fn num_inputs(&self) -> Option<usize> {
        Some(2)
    }

    fn run(&self, pool: &BufferPool, inputs: InputList) -> Result<OutputList, OpError> {
        let weight = inputs.require_float(0)?;
        let grad = inputs.require_float(1)?;
        let w_data = require_dense(weight)?;
        let g_data = require_dense(grad)?;
        if weight.shape() != grad.shape() {
            return Err(OpError::IncompatibleInputShapes(
                "weight and gradient shapes must match",
            ));
        }

        let mut out = pool.alloc::<f32>(w_data.len());
        out.extend(
            w_data
                .iter()
                .zip(g_data)
                .map(|(&w, &g)| self.updated_element(w, g, self.wd)),
        );
        Tensor::from_data(weight.shape(), out)
            .with_context(weight.context())
            .into_op_result()
    }

    fn run_sparse(&self, pool: &BufferPool, inputs: InputList) -> Result<OutputList, OpError> {
        let weight = inputs.require_float(0)?;
        let grad = inputs.require_float(1)?;
        let w_data = require_dense(weight)?;
        let indices = grad
            .row_indices()
            .ok_or(OpError::UnsupportedStorage("expected row-sparse gradient"))?;
        let values = grad.row_values().expect("row-sparse tensor has values");
        if weight.shape() != grad.shape() {
            return Err(OpError::IncompatibleInputShapes(
                "weight and gradient shapes must match",
            ));
        }

        let mut out = pool.alloc::<f32>(w_data.len());
        out.extend_from_slice(w_data);

        // With standard update semantics, weight decay applies to every row
        // before the stored gradient rows are subtracted; with lazy update
        // semantics, rows without a stored gradient are left untouched.
        let mut wd = self.wd;
        if !self.lazy_update {
            let decay = 1.0 - self.lr * self.wd;
            for w in out.iter_mut() {
                *w *= decay;
            }
            wd = 0.0;
        }

        let row_len = weight.row_len();
        for (i, &row) in indices.iter().enumerate() {
            for j in 0..row_len {
                let w_i = row * row_len + j;
                let g = values[i * row_len + j];
                out[w_i] = self.updated_element(out[w_i], g, wd);
            }
        }
        Tensor::from_data(weight.shape(), out)
            .with_context(weight.context())
            .into_op_result()
    }

    fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Vec<usize>>, OpError> {
        if inputs[0] != inputs[1] {
            return Err(OpError::IncompatibleInputShapes(
                "weight and gradient shapes must match",
            ));
        }
        Ok(vec![inputs[0].to_vec()])
    }

    fn infer_storage(&self, inputs: &[StorageKind]) -> Option<(Vec<StorageKind>, DispatchMode)> {
        match (inputs[0], inputs[1]) {
            (StorageKind::Dense, StorageKind::Dense) => {
                Some((vec![StorageKind::Dense], DispatchMode::Dense))
            }
            (StorageKind::Dense, StorageKind::RowSparse) => {
                Some((vec![StorageKind::Dense], DispatchMode::SparseAware))
            }
            _ => None,
        }
    }

    fn gradient(
        &self,
        _graph: &mut Graph,
        _inputs: &[NodeId],
        _outputs: &[NodeId],
        _ograds: &[NodeId],
    ) -> Option<Vec<Option<NodeId>>> {
        // Update steps are not differentiated through.
        Some(vec![None, None])
    }

    fn mutated_inputs(&self) -> &[usize] {
        &[0]
    }
}

/// SGD with momentum:
/// `mom = momentum*mom - lr*wd*w - lr*clip(rescale*g)`, `w = w + mom`.
#[derive(Debug)]
pub struct SgdMomUpdate {
    pub lr: f32,
    pub momentum: f32,
    pub wd: f32,
    pub rescale_grad: f32,
    pub clip_gradient: f32,
    pub lazy_update: bool,
}

impl Default for SgdMomUpdate {
    fn default() -> SgdMomUpdate {
        SgdMomUpdate {
            lr: 0.01,
            momentum: 0.9,
            wd: 0.0,
            rescale_grad: 1.0,
            clip_gradient: -1.0,
            lazy_update: true,
        }
    }
}

impl SgdMomUpdate {
    fn updated_row(&self, w: &mut [f32], mom: &mut [f32], g: &[f32]) {
        for ((w, mom), &g) in w.iter_mut().zip(mom.iter_mut()).zip(g) {
            *mom = self.momentum * *mom
                - self.lr * self.wd * *w
                - self.lr * clip(self.rescale_grad * g, self.clip_gradient);
            *w += *mom;
        }
    }
}

impl Operator for SgdMomUpdate {
    fn name(&self) -> &str {
        "SgdMomUpdate"
    }

    fn num_inputs(&self) -> Option<usize> {
        Some(3)
    }

    fn num_outputs(&self) -> usize {
        2
    }

    fn run(&self, pool: &BufferPool, inputs: InputList) -> Result<OutputList, OpError> {
        let weight = inputs.require_float(0)?;
        let grad = inputs.require_float(1)?;
        let mom = inputs.require_float(2)?;
        if weight.shape() != grad.shape() || weight.shape() != mom.shape() {
            return Err(OpError::IncompatibleInputShapes(
                "weight, gradient and momentum shapes must match",
            ));
        }
        let g_data = require_dense(grad)?;

        let mut w_out = pool.alloc::<f32>(weight.len());
        w_out.extend_from_slice(require_dense(weight)?);
        let mut m_out = pool.alloc::<f32>(mom.len());
        m_out.extend_from_slice(require_dense(mom)?);

        self.updated_row(&mut w_out, &mut m_out, g_data);

        let w_out = Tensor::from_data(weight.shape(), w_out).with_context(weight.context());
        let m_out = Tensor::from_data(mom.shape(), m_out).with_context(mom.context());
        let mut outputs = OutputList::new();
        outputs.push(w_out.into());
        outputs.push(m_out.into());
        Ok(outputs)
    }

    fn run_sparse(&self, pool: &BufferPool, inputs: InputList) -> Result<OutputList, OpError> {
        let weight = inputs.require_float(0)?;
        let grad = inputs.require_float(1)?;
        let mom = inputs.require_float(2)?;
        if weight.shape() != grad.shape() || weight.shape() != mom.shape() {
            return Err(OpError::IncompatibleInputShapes(
                "weight, gradient and momentum shapes must match",
            ));
        }
        let indices = grad
            .row_indices()
            .ok_or(OpError::UnsupportedStorage("expected row-sparse gradient"))?;
        let values = grad.row_values().expect("row-sparse tensor has values");

        let mut w_out = pool.alloc::<f32>(weight.len());
        w_out.extend_from_slice(require_dense(weight)?);
        let mut m_out = pool.alloc::<f32>(mom.len());
        m_out.extend_from_slice(require_dense(mom)?);

        let row_len = weight.row_len();
        let num_rows = weight.shape()[0];
        let zero_row = vec![0.0f32; row_len];

        if self.lazy_update {
            // Only rows with a stored gradient are touched.
            for (i, &row) in indices.iter().enumerate() {
                let span = row * row_len..(row + 1) * row_len;
                self.updated_row(
                    &mut w_out[span.clone()],
                    &mut m_out[span],
                    &values[i * row_len..(i + 1) * row_len],
                );
            }
        } else {
            // Standard semantics: momentum decay and weight decay apply to
            // every row, with a zero gradient where no row is stored.
            let mut stored = indices.iter().enumerate().peekable();
            for row in 0..num_rows {
                let g_row = match stored.peek() {
                    Some(&(i, &g_idx)) if g_idx == row => {
                        stored.next();
                        &values[i * row_len..(i + 1) * row_len]
                    }
                    _ => &zero_row,
                };
                let span = row * row_len..(row + 1) * row_len;
                self.updated_row(&mut w_out[span.clone()], &mut m_out[span], g_row);
            }
        }

        let w_out = Tensor::from_data(weight.shape(), w_out).with_context(weight.context());
        let m_out = Tensor::from_data(mom.shape(), m_out).with_context(mom.context());
        let mut outputs = OutputList::new();
        outputs.push(w_out.into());
        outputs.push(m_out.into());
        Ok(outputs)
    }

    fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Vec<usize>>, OpError> {
        if inputs[0] != inputs[1] || inputs[0] != inputs[2] {
            return Err(OpError::IncompatibleInputShapes(
                "weight, gradient and momentum shapes must match",
            ));
        }
        Ok(vec![inputs[0].to_vec(), inputs[2].to_vec()])
    }

    fn infer_storage(&self, inputs: &[StorageKind]) -> Option<(Vec<StorageKind>, DispatchMode)> {
        match (inputs[0], inputs[1], inputs[2]) {
            (StorageKind::Dense, StorageKind::Dense, StorageKind::Dense) => Some((
                vec![StorageKind::Dense, StorageKind::Dense],
                DispatchMode::Dense,
            )),
            (StorageKind::Dense, StorageKind::RowSparse, StorageKind::Dense) => Some((
                vec![StorageKind::Dense, StorageKind::Dense],
                DispatchMode::SparseAware,
            )),
            _ => None,
        }
    }

    fn gradient(
        &self,
        _graph: &mut Graph,
        _inputs: &[NodeId],
        _outputs: &[NodeId],
        _ograds: &[NodeId],
    ) -> Option<Vec<Option<NodeId>>> {
        Some(vec![None, None, None])
    }

    fn mutated_inputs(&self) -> &[usize] {
        &[0, 2]
    }
}

#[cfg(test)]
mod tests {
    use super::{SgdMomUpdate, SgdUpdate};
    use crate::buffer_pool::BufferPool;
    use crate::ops::{InputList, Operator};
    use crate::tensor::{Tensor, Value};

    #[test]
    fn test_sgd_update_dense() {
        let pool = BufferPool::new();
        let weight: Value = Tensor::from_vec(vec![1.0, 2.0]).into();
        let grad: Value = Tensor::from_vec(vec![0.5, -0.5]).into();
        let op = SgdUpdate {
            lr: 0.1,
            ..Default::default()
        };
        let outputs = op
            .run(&pool, InputList::from([&weight, &grad].as_slice()))
            .unwrap();
        let updated = outputs.into_iter().next().unwrap().into_float().unwrap();
        assert_eq!(updated.data(), Some([0.95, 2.05].as_slice()));
    }

    #[test]
    fn test_sgd_update_clips_gradient() {
        let pool = BufferPool::new();
        let weight: Value = Tensor::from_vec(vec![0.0]).into();
        let grad: Value = Tensor::from_vec(vec![100.0]).into();
        let op = SgdUpdate {
            lr: 1.0,
            clip_gradient: 1.0,
            ..Default::default()
        };
        let outputs = op
            .run(&pool, InputList::from([&weight, &grad].as_slice()))
            .unwrap();
        let updated = outputs.into_iter().next().unwrap().into_float().unwrap();
        assert_eq!(updated.data(), Some([-1.0].as_slice()));
    }

    #[test]
    fn test_sgd_update_lazy_sparse() {
        let pool = BufferPool::new();
        let weight: Value = Tensor::from_data(&[3, 1], vec![1.0, 1.0, 1.0]).into();
        let grad: Value = Tensor::from_rows(&[3, 1], vec![1], vec![1.0]).into();
        let op = SgdUpdate {
            lr: 0.1,
            wd: 0.5,
            lazy_update: true,
            ..Default::default()
        };
        let outputs = op
            .run_sparse(&pool, InputList::from([&weight, &grad].as_slice()))
            .unwrap();
        let updated = outputs.into_iter().next().unwrap().into_float().unwrap();
        let data = updated.data().unwrap();
        // Rows without a stored gradient are untouched under lazy update.
        assert_eq!(data[0], 1.0);
        assert_eq!(data[2], 1.0);
        // Updated row: (1 - 0.1*0.5)*1 - 0.1*1 = 0.85
        assert!((data[1] - 0.85).abs() < 1e-6);
    }

    #[test]
    fn test_sgd_update_standard_sparse() {
        let pool = BufferPool::new();
        let weight: Value = Tensor::from_data(&[3, 1], vec![1.0, 1.0, 1.0]).into();
        let grad: Value = Tensor::from_rows(&[3, 1], vec![1], vec![1.0]).into();
        let op = SgdUpdate {
            lr: 0.1,
            wd: 0.5,
            lazy_update: false,
            ..Default::default()
        };
        let outputs = op
            .run_sparse(&pool, InputList::from([&weight, &grad].as_slice()))
            .unwrap();
        let updated = outputs.into_iter().next().unwrap().into_float().unwrap();
        let data = updated.data().unwrap();
        // All rows decay under standard update.
        assert!((data[0] - 0.95).abs() < 1e-6);
        assert!((data[2] - 0.95).abs() < 1e-6);
        assert!((data[1] - 0.85).abs() < 1e-6);
    }

    #[test]
    fn test_sgd_mom_update() {
        let pool = BufferPool::new();
        let weight: Value = Tensor::from_vec(vec![1.0]).into();
        let grad: Value = Tensor::from_vec(vec![1.0]).into();
        let mom: Value = Tensor::from_vec(vec![0.5]).into();
        let op = SgdMomUpdate {
            lr: 0.1,
            momentum: 0.9,
            wd: 0.0,
            ..Default::default()
        };
        let outputs = op
            .run(&pool, InputList::from([&weight, &grad, &mom].as_slice()))
            .unwrap();
        let mut outputs = outputs.into_iter();
        let w = outputs.next().unwrap().into_float().unwrap();
        let m = outputs.next().unwrap().into_float().unwrap();
        // mom = 0.9*0.5 - 0.1*1 = 0.35; w = 1 + 0.35 = 1.35
        assert!((m.data().unwrap()[0] - 0.35).abs() < 1e-6);
        assert!((w.data().unwrap()[0] - 1.35).abs() < 1e-6);
    }
}
