//! Tensor and value types used for executor inputs, outputs and
//! intermediates.
//!
//! This is the interface surface the executor needs from the surrounding
//! system's array type: shape, element type, storage kind (dense or
//! sparse-row), device context, and allocation on demand. It is deliberately
//! not a general linear-algebra library.

use std::fmt;

/// Identifies the device-context "lane" a tensor lives on.
///
/// Each context owns a single execution stream, so nodes dispatched to the
/// same context run in FIFO order while different contexts are fully
/// independent.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum Context {
    Cpu(usize),
}

impl Context {
    pub fn device_index(&self) -> usize {
        match self {
            Context::Cpu(index) => *index,
        }
    }
}

impl Default for Context {
    fn default() -> Context {
        Context::Cpu(0)
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Context::Cpu(index) => write!(f, "cpu({})", index),
        }
    }
}

/// Element type of a tensor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DType {
    F32,
    I32,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::I32 => write!(f, "i32"),
        }
    }
}

/// How a tensor's elements are stored.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StorageKind {
    /// All elements stored contiguously in row-major order.
    Dense,

    /// Only a subset of rows (leading-dimension slices) are stored, identified
    /// by a sorted list of row indices. Unstored rows are implicitly zero.
    RowSparse,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Dense => write!(f, "dense"),
            StorageKind::RowSparse => write!(f, "row_sparse"),
        }
    }
}

/// Storage variants for [`Tensor`].
#[derive(Clone, Debug, PartialEq)]
enum TensorData<T> {
    Dense(Vec<T>),
    RowSparse { indices: Vec<usize>, values: Vec<T> },
}

/// An n-dimensional array with either dense or sparse-row storage.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor<T> {
    shape: Vec<usize>,
    data: TensorData<T>,
    ctx: Context,
}

impl<T: Copy + Default> Tensor<T> {
    /// Create a dense tensor from a shape and elements in row-major order.
    pub fn from_data(shape: &[usize], data: Vec<T>) -> Tensor<T> {
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "shape does not match element count"
        );
        Tensor {
            shape: shape.to_vec(),
            data: TensorData::Dense(data),
            ctx: Context::default(),
        }
    }

    /// Create a dense 1D tensor from a vec of elements.
    pub fn from_vec(data: Vec<T>) -> Tensor<T> {
        let len = data.len();
        Tensor::from_data(&[len], data)
    }

    /// Create a dense 0-dimensional tensor holding a single element.
    pub fn from_scalar(value: T) -> Tensor<T> {
        Tensor::from_data(&[], vec![value])
    }

    /// Create a dense tensor filled with the default element value.
    pub fn zeros(shape: &[usize]) -> Tensor<T> {
        let len = shape.iter().product();
        Tensor::from_data(shape, vec![T::default(); len])
    }

    /// Create a sparse-row tensor.
    ///
    /// `indices` lists the stored rows in ascending order and `values` holds
    /// `indices.len()` rows of `shape[1..]` elements each. Rows not listed
    /// are implicitly zero.
    pub fn from_rows(shape: &[usize], indices: Vec<usize>, values: Vec<T>) -> Tensor<T> {
        assert!(!shape.is_empty(), "sparse-row tensor requires rank >= 1");
        let row_len: usize = shape[1..].iter().product();
        assert_eq!(
            indices.len() * row_len,
            values.len(),
            "row count does not match value count"
        );
        assert!(
            indices.windows(2).all(|w| w[0] < w[1]),
            "row indices must be sorted and unique"
        );
        assert!(
            indices.iter().all(|&row| row < shape[0]),
            "row index out of range"
        );
        Tensor {
            shape: shape.to_vec(),
            data: TensorData::RowSparse { indices, values },
            ctx: Context::default(),
        }
    }

    /// Expand this tensor to dense storage.
    pub fn to_dense(&self) -> Tensor<T> {
        match &self.data {
            TensorData::Dense(_) => self.clone(),
            TensorData::RowSparse { indices, values } => {
                let row_len = self.row_len();
                let mut data = vec![T::default(); self.len()];
                for (i, &row) in indices.iter().enumerate() {
                    let src = &values[i * row_len..(i + 1) * row_len];
                    data[row * row_len..(row + 1) * row_len].copy_from_slice(src);
                }
                Tensor {
                    shape: self.shape.clone(),
                    data: TensorData::Dense(data),
                    ctx: self.ctx,
                }
            }
        }
    }
}

impl<T: Copy> Tensor<T> {
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of logical elements (stored or implicit).
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return true if this tensor holds a single element.
    pub fn is_scalar(&self) -> bool {
        self.len() == 1
    }

    /// Number of elements in one row (product of trailing dimensions).
    pub fn row_len(&self) -> usize {
        self.shape[1..].iter().product()
    }

    pub fn storage_kind(&self) -> StorageKind {
        match self.data {
            TensorData::Dense(_) => StorageKind::Dense,
            TensorData::RowSparse { .. } => StorageKind::RowSparse,
        }
    }

    pub fn context(&self) -> Context {
        self.ctx
    }

    pub fn with_context(mut self, ctx: Context) -> Tensor<T> {
        self.ctx = ctx;
        self
    }

    /// Return the elements of a dense tensor, or None for sparse storage.
    pub fn data(&self) -> Option<&[T]> {
        match &self.data {
            TensorData::Dense(data) => Some(data),
            TensorData::RowSparse { .. } => None,
        }
    }

    pub fn data_mut(&mut self) -> Option<&mut [T]> {
        match &mut self.data {
            TensorData::Dense(data) => Some(data),
            TensorData::RowSparse { .. } => None,
        }
    }

    /// Consume a dense tensor and return its element buffer.
    pub fn into_data(self) -> Option<Vec<T>> {
        match self.data {
            TensorData::Dense(data) => Some(data),
            TensorData::RowSparse { .. } => None,
        }
    }

    /// Stored row indices of a sparse-row tensor.
    pub fn row_indices(&self) -> Option<&[usize]> {
        match &self.data {
            TensorData::RowSparse { indices, .. } => Some(indices),
            TensorData::Dense(_) => None,
        }
    }

    /// Stored row values of a sparse-row tensor.
    pub fn row_values(&self) -> Option<&[T]> {
        match &self.data {
            TensorData::RowSparse { values, .. } => Some(values),
            TensorData::Dense(_) => None,
        }
    }

    pub fn row_values_mut(&mut self) -> Option<&mut [T]> {
        match &mut self.data {
            TensorData::RowSparse { values, .. } => Some(values),
            TensorData::Dense(_) => None,
        }
    }

    /// Return the single element of a scalar dense tensor.
    pub fn item(&self) -> Option<T> {
        match &self.data {
            TensorData::Dense(data) if data.len() == 1 => Some(data[0]),
            _ => None,
        }
    }

    /// Apply `f` to every stored element, producing a new tensor with the
    /// same shape and storage kind.
    pub fn map<F: Fn(T) -> T>(&self, f: F) -> Tensor<T> {
        let data = match &self.data {
            TensorData::Dense(data) => TensorData::Dense(data.iter().map(|&x| f(x)).collect()),
            TensorData::RowSparse { indices, values } => TensorData::RowSparse {
                indices: indices.clone(),
                values: values.iter().map(|&x| f(x)).collect(),
            },
        };
        Tensor {
            shape: self.shape.clone(),
            data,
            ctx: self.ctx,
        }
    }

    /// Apply `f` to every stored element in place.
    pub fn apply<F: Fn(T) -> T>(&mut self, f: F) {
        let data = match &mut self.data {
            TensorData::Dense(data) => data.as_mut_slice(),
            TensorData::RowSparse { values, .. } => values.as_mut_slice(),
        };
        for x in data.iter_mut() {
            *x = f(*x);
        }
    }
}

/// A tensor of any supported element type.
///
/// This is the unit of data flowing between the executor and operators:
/// graph inputs, constants, intermediate buffers and outputs are all
/// `Value`s.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Float(Tensor<f32>),
    Int(Tensor<i32>),
}

impl Value {
    /// Create a dense zero-filled value of the given type and shape.
    pub fn zeros(dtype: DType, shape: &[usize], ctx: Context) -> Value {
        match dtype {
            DType::F32 => Tensor::<f32>::zeros(shape).with_context(ctx).into(),
            DType::I32 => Tensor::<i32>::zeros(shape).with_context(ctx).into(),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Value::Float(_) => DType::F32,
            Value::Int(_) => DType::I32,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Value::Float(t) => t.shape(),
            Value::Int(t) => t.shape(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Value::Float(t) => t.len(),
            Value::Int(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn storage_kind(&self) -> StorageKind {
        match self {
            Value::Float(t) => t.storage_kind(),
            Value::Int(t) => t.storage_kind(),
        }
    }

    pub fn context(&self) -> Context {
        match self {
            Value::Float(t) => t.context(),
            Value::Int(t) => t.context(),
        }
    }

    pub fn as_float_ref(&self) -> Option<&Tensor<f32>> {
        match self {
            Value::Float(t) => Some(t),
            Value::Int(_) => None,
        }
    }

    pub fn as_float_mut(&mut self) -> Option<&mut Tensor<f32>> {
        match self {
            Value::Float(t) => Some(t),
            Value::Int(_) => None,
        }
    }

    pub fn as_int_ref(&self) -> Option<&Tensor<i32>> {
        match self {
            Value::Int(t) => Some(t),
            Value::Float(_) => None,
        }
    }

    pub fn into_float(self) -> Option<Tensor<f32>> {
        match self {
            Value::Float(t) => Some(t),
            Value::Int(_) => None,
        }
    }

    pub fn into_int(self) -> Option<Tensor<i32>> {
        match self {
            Value::Int(t) => Some(t),
            Value::Float(_) => None,
        }
    }
}

impl From<Tensor<f32>> for Value {
    fn from(t: Tensor<f32>) -> Value {
        Value::Float(t)
    }
}

impl From<Tensor<i32>> for Value {
    fn from(t: Tensor<i32>) -> Value {
        Value::Int(t)
    }
}

#[cfg(test)]
mod tests {
    use super::{Context, DType, StorageKind, Tensor, Value};

    #[test]
    fn test_dense_tensor() {
        let t = Tensor::from_data(&[2, 3], vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.len(), 6);
        assert_eq!(t.row_len(), 3);
        assert_eq!(t.storage_kind(), StorageKind::Dense);
        assert_eq!(t.context(), Context::Cpu(0));
    }

    #[test]
    fn test_scalar() {
        let t = Tensor::from_scalar(5.0f32);
        assert_eq!(t.shape(), &[] as &[usize]);
        assert!(t.is_scalar());
        assert_eq!(t.item(), Some(5.0));
    }

    #[test]
    fn test_row_sparse_to_dense() {
        let t = Tensor::from_rows(&[4, 2], vec![1, 3], vec![1.0f32, 2.0, 3.0, 4.0]);
        assert_eq!(t.storage_kind(), StorageKind::RowSparse);
        assert_eq!(t.len(), 8);

        let dense = t.to_dense();
        assert_eq!(dense.storage_kind(), StorageKind::Dense);
        assert_eq!(dense.data(), Some([0., 0., 1., 2., 0., 0., 3., 4.].as_slice()));
    }

    #[test]
    #[should_panic(expected = "sorted and unique")]
    fn test_row_sparse_unsorted_indices() {
        Tensor::from_rows(&[4, 1], vec![3, 1], vec![1.0f32, 2.0]);
    }

    #[test]
    fn test_map_preserves_storage() {
        let t = Tensor::from_rows(&[4, 1], vec![0, 2], vec![1.0f32, -2.0]);
        let mapped = t.map(|x| x * 2.0);
        assert_eq!(mapped.storage_kind(), StorageKind::RowSparse);
        assert_eq!(mapped.row_values(), Some([2.0, -4.0].as_slice()));
    }

    #[test]
    fn test_value_accessors() {
        let v: Value = Tensor::from_vec(vec![1.0f32, 2.0]).into();
        assert_eq!(v.dtype(), DType::F32);
        assert_eq!(v.shape(), &[2]);
        assert!(v.as_float_ref().is_some());
        assert!(v.as_int_ref().is_none());

        let v: Value = Tensor::from_vec(vec![1i32, 2]).into();
        assert_eq!(v.dtype(), DType::I32);
    }
}
