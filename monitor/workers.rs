use log::{debug, warn};
use rayon::ThreadPoolBuilder;

/// How many worker threads a chart construction may use.
///
/// Every parallel phase builds its own pool and drops it before returning, so
/// no threads are held between phases. A pool that cannot be built is not an
/// error: the phase is run on the calling thread instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPlan {
    workers: usize,
}

impl WorkerPlan {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let available = num_cpus::get();
        if workers > available {
            warn!(
                "Requested {workers} workers but only {available} hardware threads are available; proceeding anyway."
            );
        }
        Self { workers }
    }

    pub fn sequential() -> Self {
        Self { workers: 1 }
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `op` inside a freshly built pool. `op` receives `true` when it is
    /// executing on the pool and should use parallel iterators.
    pub fn run<R, F>(&self, phase: &str, op: F) -> R
    where
        R: Send,
        F: FnOnce(bool) -> R + Send,
    {
        if self.workers <= 1 {
            return op(false);
        }
        match ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|idx| format!("riskwatch-worker-{idx}"))
            .build()
        {
            Ok(pool) => {
                debug!("Running {phase} on {} workers.", self.workers);
                pool.install(|| op(true))
            }
            Err(err) => {
                warn!(
                    "Could not start {} workers for {phase} ({err}); computing sequentially.",
                    self.workers
                );
                op(false)
            }
        }
    }
}

impl Default for WorkerPlan {
    fn default() -> Self {
        Self::sequential()
    }
}
