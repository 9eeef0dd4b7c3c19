use std::cell::RefCell;

use crate::tensor::{Tensor, Value};

/// A pool which enables reuse of element buffers within a single execution.
///
/// Reusing buffers for operator outputs, as opposed to allocating a fresh
/// buffer from the global allocator and freeing it when no longer needed,
/// avoids repeated allocator round-trips in the hot execution loop. The
/// dynamic executor returns an intermediate value's buffer here as soon as
/// its last consumer has run; the static executor seeds the pool with the
/// preplanned slot buffer before each node runs.
///
/// The pool is call-local: it is created at the start of an execution and
/// dropped at the end, so buffers are never carried across calls.
pub struct BufferPool {
    /// Buffers currently in the pool, one freelist per element type.
    f32_buffers: RefCell<Vec<Vec<f32>>>,
    i32_buffers: RefCell<Vec<Vec<i32>>>,

    /// Number of allocation requests received.
    alloc_count: RefCell<usize>,

    /// Number of allocation requests fulfilled from the pool.
    hit_count: RefCell<usize>,
}

/// Element types that have a freelist in [`BufferPool`].
pub trait PoolElement: Sized {
    fn freelist(pool: &BufferPool) -> &RefCell<Vec<Vec<Self>>>;
}

impl PoolElement for f32 {
    fn freelist(pool: &BufferPool) -> &RefCell<Vec<Vec<f32>>> {
        &pool.f32_buffers
    }
}

impl PoolElement for i32 {
    fn freelist(pool: &BufferPool) -> &RefCell<Vec<Vec<i32>>> {
        &pool.i32_buffers
    }
}

impl BufferPool {
    /// Return a new, empty pool.
    ///
    /// This is a cheap operation that does not allocate.
    pub fn new() -> BufferPool {
        BufferPool {
            f32_buffers: RefCell::new(Vec::new()),
            i32_buffers: RefCell::new(Vec::new()),
            alloc_count: RefCell::new(0),
            hit_count: RefCell::new(0),
        }
    }

    /// Allocate an empty vec with at least the given capacity.
    ///
    /// The request is satisfied by the pooled buffer whose capacity fits with
    /// the least excess, falling back to the global allocator if no pooled
    /// buffer fits.
    pub fn alloc<T: PoolElement>(&self, capacity: usize) -> Vec<T> {
        *self.alloc_count.borrow_mut() += 1;

        let buffers = T::freelist(self);
        let best_fit = buffers
            .borrow()
            .iter()
            .enumerate()
            .filter(|(_, buf)| buf.capacity() >= capacity)
            .min_by_key(|(_, buf)| buf.capacity())
            .map(|(idx, _)| idx);

        if let Some(best_fit) = best_fit {
            *self.hit_count.borrow_mut() += 1;
            buffers.borrow_mut().swap_remove(best_fit)
        } else {
            Vec::with_capacity(capacity)
        }
    }

    /// Add a buffer to the pool to satisfy future allocation requests.
    pub fn add<T: PoolElement>(&self, mut buffer: Vec<T>) {
        buffer.clear();
        T::freelist(self).borrow_mut().push(buffer);
    }

    /// Return a no-longer-needed value's buffer to the pool.
    ///
    /// Sparse-row values are dropped rather than recycled as their stored
    /// size does not track their logical shape.
    pub fn release(&self, value: Value) {
        match value {
            Value::Float(t) => {
                if let Some(buf) = t.into_data() {
                    self.add(buf);
                }
            }
            Value::Int(t) => {
                if let Some(buf) = t.into_data() {
                    self.add(buf);
                }
            }
        }
    }

    /// Allocate a dense zero-filled f32 tensor using the pool.
    pub fn alloc_zeroed(&self, shape: &[usize]) -> Tensor<f32> {
        let len = shape.iter().product();
        let mut data = self.alloc::<f32>(len);
        data.resize(len, 0.);
        Tensor::from_data(shape, data)
    }

    /// Return the total number of allocation requests.
    pub fn alloc_count(&self) -> usize {
        *self.alloc_count.borrow()
    }

    /// Return the number of allocation requests that were fulfilled using
    /// items in the pool.
    pub fn hit_count(&self) -> usize {
        *self.hit_count.borrow()
    }

    /// Return the number of buffers currently in the pool.
    pub fn len(&self) -> usize {
        self.f32_buffers.borrow().len() + self.i32_buffers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
