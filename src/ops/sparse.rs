//! Operators with sparse-aware compute paths.

use crate::buffer_pool::BufferPool;
use crate::graph::{Graph, NodeId};
use crate::ops::{DispatchMode, InputList, IntoOpResult, OpError, Operator, OutputList};
use crate::tensor::{StorageKind, Tensor};

/// Divide each row of a matrix by a per-row divisor.
///
/// Inputs are `[matrix, divisor]` where `divisor` holds one element per
/// matrix row. The dense path divides every row; the sparse-aware path
/// divides only the stored rows of a row-sparse matrix and produces a
/// row-sparse result with the same stored rows.
#[derive(Debug)]
pub struct SparseDenseDiv {}

impl Operator for SparseDenseDiv {
    fn name(&self) -> &str {
        "SparseDenseDiv"
    }

    fn num_inputs(&self) -> Option<usize> {
        Some(2)
    }

    fn run(&self, pool: &BufferPool, inputs: InputList) -> Result<OutputList, OpError> {
        let matrix = inputs.require_float(0)?;
        let divisor = inputs.require_float(1)?;
        let m_data = matrix.data().ok_or(OpError::UnsupportedStorage(
            "dense path invoked with sparse input",
        ))?;
        let d_data = divisor.data().ok_or(OpError::UnsupportedStorage(
            "dense path invoked with sparse input",
        ))?;
        if divisor.len() != matrix.shape()[0] {
            return Err(OpError::IncompatibleInputShapes(
                "divisor must hold one element per matrix row",
            ));
        }

        let row_len = matrix.row_len();
        let mut out = pool.alloc::<f32>(m_data.len());
        out.extend(
            m_data
                .iter()
                .enumerate()
                .map(|(i, &x)| x / d_data[i / row_len]),
        );
        Tensor::from_data(matrix.shape(), out)
            .with_context(matrix.context())
            .into_op_result()
    }

    fn run_sparse(&self, pool: &BufferPool, inputs: InputList) -> Result<OutputList, OpError> {
        let matrix = inputs.require_float(0)?;
        let divisor = inputs.require_float(1)?;
        let indices = matrix
            .row_indices()
            .ok_or(OpError::UnsupportedStorage("expected row-sparse matrix"))?;
        let values = matrix.row_values().expect("row-sparse tensor has values");
        let d_data = divisor.data().ok_or(OpError::UnsupportedStorage(
            "expected dense divisor",
        ))?;
        if divisor.len() != matrix.shape()[0] {
            return Err(OpError::IncompatibleInputShapes(
                "divisor must hold one element per matrix row",
            ));
        }

        let row_len = matrix.row_len();
        let mut out = pool.alloc::<f32>(values.len());
        for (i, &row) in indices.iter().enumerate() {
            let d = d_data[row];
            out.extend(values[i * row_len..(i + 1) * row_len].iter().map(|&x| x / d));
        }
        Tensor::from_rows(matrix.shape(), indices.to_vec(), out)
            .with_context(matrix.context())
            .into_op_result()
    }

    fn infer_shapes(&self, inputs: &[&[usize]]) -> Result<Vec<Vec<usize>>, OpError> {
        if inputs[0].is_empty() {
            return Err(OpError::IncompatibleInputShapes(
                "matrix must have rank >= 1",
            ));
        }
        let divisor_len: usize = inputs[1].iter().product();
        if divisor_len != inputs[0][0] {
            return Err(OpError::IncompatibleInputShapes(
                "divisor must hold one element per matrix row",
            ));
        }
        Ok(vec![inputs[0].to_vec()])
    }

    fn infer_storage(&self, inputs: &[StorageKind]) -> Option<(Vec<StorageKind>, DispatchMode)> {
        match (inputs[0], inputs[1]) {
            (StorageKind::Dense, StorageKind::Dense) => {
                Some((vec![StorageKind::Dense], DispatchMode::Dense))
            }
            (StorageKind::RowSparse, StorageKind::Dense) => {
                Some((vec![StorageKind::RowSparse], DispatchMode::SparseAware))
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
        // Used for inference-time normalization; not differentiated through.
        Some(vec![None, None])
    }
}
