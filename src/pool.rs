//! Per-context pool of reusable execution states.
//!
//! The pool exists to avoid rebuilding graph annotations and buffers on
//! every call: a state carries the cached signature, inference results and
//! static memory plan of the calls that used it before. States are created
//! lazily, recycled forever and never destroyed, so pool growth is bounded
//! by the peak number of concurrently in-flight executions per context.
//!
//! Freedom is tracked by ownership rather than reference counts: `acquire`
//! moves the boxed state out of its slot into the returned handle, so a slot
//! whose box is present is free by definition and a state can never be
//! handed out twice. Dropping the handle moves the box back.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

use crate::tensor::Context;

struct PoolEntry<S> {
    /// The state, present while the entry is free and taken while on loan.
    state: Option<Box<S>>,
}

/// Pool of execution states, keyed by device context.
pub struct StatePool<S> {
    /// Guards only the slot scan and append; never held across execution.
    entries: Mutex<FxHashMap<Context, Vec<PoolEntry<S>>>>,
}

impl<S> StatePool<S> {
    pub fn new() -> StatePool<S> {
        StatePool {
            entries: Mutex::new(FxHashMap::default()),
        }
    }

    /// Acquire a free state for `ctx`, constructing a new one with
    /// `new_state` if every existing state is on loan.
    ///
    /// The caller is responsible for resetting the returned state's
    /// transient fields before use; cached plans and annotations are
    /// deliberately preserved across loans.
    pub fn acquire(self: &Arc<Self>, ctx: Context, new_state: impl FnOnce() -> S) -> StateHandle<S> {
        let mut entries = self.entries.lock().expect("state pool mutex poisoned");
        let slots = entries.entry(ctx).or_default();

        for (index, entry) in slots.iter_mut().enumerate() {
            if let Some(state) = entry.state.take() {
                return StateHandle {
                    pool: self.clone(),
                    ctx,
                    index,
                    state: Some(state),
                };
            }
        }

        slots.push(PoolEntry { state: None });
        StateHandle {
            pool: self.clone(),
            ctx,
            index: slots.len() - 1,
            state: Some(Box::new(new_state())),
        }
    }

    fn release(&self, ctx: Context, index: usize, state: Box<S>) {
        let mut entries = self.entries.lock().expect("state pool mutex poisoned");
        let slots = entries.entry(ctx).or_default();
        debug_assert!(slots[index].state.is_none(), "state released twice");
        slots[index].state = Some(state);
    }

    /// Total number of states ever created for `ctx`, free or on loan.
    pub fn num_states(&self, ctx: Context) -> usize {
        let entries = self.entries.lock().expect("state pool mutex poisoned");
        entries.get(&ctx).map(|slots| slots.len()).unwrap_or(0)
    }

    /// Number of states for `ctx` that are currently free.
    pub fn num_free(&self, ctx: Context) -> usize {
        let entries = self.entries.lock().expect("state pool mutex poisoned");
        entries
            .get(&ctx)
            .map(|slots| slots.iter().filter(|entry| entry.state.is_some()).count())
            .unwrap_or(0)
    }

    /// Visit every free state for `ctx`.
    pub fn for_each_free<F: FnMut(&S)>(&self, ctx: Context, mut visit: F) {
        let entries = self.entries.lock().expect("state pool mutex poisoned");
        if let Some(slots) = entries.get(&ctx) {
            for entry in slots {
                if let Some(state) = entry.state.as_deref() {
                    visit(state);
                }
            }
        }
    }
}

impl<S> Default for StatePool<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive loan of one pooled execution state.
///
/// The handle is the only path to the state while on loan; dropping it
/// returns the state to its pool slot.
pub struct StateHandle<S> {
    pool: Arc<StatePool<S>>,
    ctx: Context,
    index: usize,
    state: Option<Box<S>>,
}

impl<S> StateHandle<S> {
    pub fn context(&self) -> Context {
        self.ctx
    }
}

impl<S> Deref for StateHandle<S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.state.as_deref().expect("state present while on loan")
    }
}

impl<S> DerefMut for StateHandle<S> {
    fn deref_mut(&mut self) -> &mut S {
        self.state.as_deref_mut().expect("state present while on loan")
    }
}

impl<S> Drop for StateHandle<S> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            self.pool.release(self.ctx, self.index, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::StatePool;
    use crate::tensor::Context;

    #[test]
    fn test_acquire_creates_and_reuses() {
        let pool = Arc::new(StatePool::<u32>::new());
        let ctx = Context::Cpu(0);

        let mut handle = pool.acquire(ctx, || 1);
        assert_eq!(*handle, 1);
        *handle = 5;
        assert_eq!(pool.num_states(ctx), 1);
        assert_eq!(pool.num_free(ctx), 0);
        drop(handle);
        assert_eq!(pool.num_free(ctx), 1);

        // Reacquire returns the same state, not a fresh one.
        let handle = pool.acquire(ctx, || unreachable!("state should be reused"));
        assert_eq!(*handle, 5);
    }

    #[test]
    fn test_concurrent_acquires_get_distinct_states() {
        let pool = Arc::new(StatePool::<u32>::new());
        let ctx = Context::Cpu(0);

        let a = pool.acquire(ctx, || 1);
        let b = pool.acquire(ctx, || 2);
        assert_eq!(pool.num_states(ctx), 2);
        assert_eq!((*a, *b), (1, 2));
        drop(a);
        drop(b);
        assert_eq!(pool.num_free(ctx), 2);
        // Growth is append-only; releasing does not shrink the pool.
        assert_eq!(pool.num_states(ctx), 2);
    }

    #[test]
    fn test_contexts_are_independent() {
        let pool = Arc::new(StatePool::<u32>::new());
        let _a = pool.acquire(Context::Cpu(0), || 1);
        let _b = pool.acquire(Context::Cpu(1), || 2);
        assert_eq!(pool.num_states(Context::Cpu(0)), 1);
        assert_eq!(pool.num_states(Context::Cpu(1)), 1);
    }

    #[test]
    fn test_parallel_acquire() {
        let pool = Arc::new(StatePool::<usize>::new());
        let ctx = Context::Cpu(0);
        let barrier = std::sync::Barrier::new(8);

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let pool = pool.clone();
                    let barrier = &barrier;
                    scope.spawn(move || {
                        let handle = pool.acquire(ctx, || i);
                        // All loans overlap, so every thread must get its
                        // own state.
                        barrier.wait();
                        drop(handle);
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        });

        assert_eq!(pool.num_states(ctx), 8);
        assert_eq!(pool.num_free(ctx), 8);
    }
}
