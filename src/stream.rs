//! Per-context execution streams.
//!
//! A stream accepts bulk segments of work and executes them in FIFO order on
//! one device context. There is one implementation per device kind, selected
//! through [`stream_for`]; executors never branch on the device kind
//! themselves.

use crate::exec::RunError;
use crate::tensor::Context;

/// A bulk segment of work submitted to a stream.
pub type Workload<'a> = &'a mut dyn FnMut() -> Result<(), RunError>;

pub trait Stream: Send + Sync {
    /// Execute a bulk segment of work on this stream.
    ///
    /// Work submitted to one stream runs in submission order; once submitted
    /// a segment runs to completion, there is no cancellation.
    fn launch(&self, work: Workload) -> Result<(), RunError>;
}

/// Stream for CPU contexts: work runs synchronously on the calling thread,
/// which trivially preserves FIFO order per calling context.
pub struct CpuStream;

impl Stream for CpuStream {
    fn launch(&self, work: Workload) -> Result<(), RunError> {
        work()
    }
}

/// Return the stream serving a context.
pub fn stream_for(ctx: Context) -> &'static dyn Stream {
    static CPU: CpuStream = CpuStream;
    match ctx {
        Context::Cpu(_) => &CPU,
    }
}

#[cfg(test)]
mod tests {
    use super::{stream_for, Stream};
    use crate::tensor::Context;

    #[test]
    fn test_cpu_stream_runs_work() {
        let stream = stream_for(Context::Cpu(0));
        let mut ran = false;
        let mut work = || {
            ran = true;
            Ok(())
        };
        stream.launch(&mut work).unwrap();
        assert!(ran);
    }
}
