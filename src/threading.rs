use std::env;
use std::sync::OnceLock;

/// A wrapper around the Rayon thread pool used to run cached graph executions.
///
/// On platforms where threads are not supported this runs operations directly
/// on the main thread.
pub struct ThreadPool {
    /// The wrapped thread pool, or None if we failed to construct one.
    pool: Option<rayon::ThreadPool>,
}

impl ThreadPool {
    /// Run a function in the thread pool.
    ///
    /// This corresponds to [`rayon::ThreadPool::install`], except on platforms
    /// where threading is not supported, where it just runs `op` directly.
    pub fn run<R: Send, Op: FnOnce() -> R + Send>(&self, op: Op) -> R {
        if let Some(pool) = self.pool.as_ref() {
            pool.install(op)
        } else {
            op()
        }
    }

    /// Create a thread pool with a given number of threads.
    pub fn with_num_threads(num_threads: usize) -> ThreadPool {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|index| format!("gradcache-{}", index))
            .build();

        ThreadPool { pool: pool.ok() }
    }
}

/// Return the [Rayon][rayon] thread pool which is used to execute cached ops.
///
/// This differs from Rayon's default global thread pool in that it is tuned for
/// CPU rather than IO-bound work by choosing a thread count based on the number
/// of physical rather than logical cores.
///
/// The thread count can be overridden at the process level by setting the
/// `GRADCACHE_NUM_THREADS` environment variable, whose value must be a number
/// between 1 and the logical core count.
///
/// [rayon]: https://github.com/rayon-rs/rayon
pub fn thread_pool() -> &'static ThreadPool {
    static THREAD_POOL: OnceLock<ThreadPool> = OnceLock::new();
    THREAD_POOL.get_or_init(|| {
        let physical_cpus = num_cpus::get_physical().max(1) as u32;

        let num_threads = if let Some(threads_var) = env::var_os("GRADCACHE_NUM_THREADS") {
            let requested_threads: Result<u32, _> = threads_var.to_string_lossy().parse();
            match requested_threads {
                Ok(n_threads) => n_threads.clamp(1, num_cpus::get() as u32),
                Err(_) => physical_cpus,
            }
        } else {
            physical_cpus
        };

        ThreadPool::with_num_threads(num_threads as usize)
    })
}

#[cfg(test)]
mod tests {
    use super::thread_pool;

    #[test]
    fn test_thread_pool_run() {
        let sum = thread_pool().run(|| (0..10).sum::<i32>());
        assert_eq!(sum, 45);
    }
}
