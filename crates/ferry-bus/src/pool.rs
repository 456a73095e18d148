use rayon::ThreadPool;

/// Where topic deliveries run.
pub(crate) enum WorkerPool {
    Rayon(ThreadPool),
    /// No worker threads could be created; deliveries run on the sending thread.
    Inline,
}

impl WorkerPool {
    pub(crate) fn build(prefix: &'static str, threads: usize) -> Self {
        // Thread creation can fail under low process limits. Shrink the pool before giving up
        // on threads entirely.
        let mut threads = threads.max(1);
        loop {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(move |idx| format!("{prefix}-{idx}"))
                .build()
            {
                Ok(pool) => return WorkerPool::Rayon(pool),
                Err(err) if threads > 1 => {
                    tracing::debug!(
                        target: "ferry.bus",
                        threads,
                        error = %err,
                        "worker pool creation failed; retrying with fewer threads"
                    );
                    threads = (threads / 2).max(1);
                }
                Err(err) => {
                    tracing::warn!(
                        target: "ferry.bus",
                        error = %err,
                        "no worker threads available; delivering inline"
                    );
                    return WorkerPool::Inline;
                }
            }
        }
    }

    pub(crate) fn is_inline(&self) -> bool {
        matches!(self, WorkerPool::Inline)
    }

    pub(crate) fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            WorkerPool::Rayon(pool) => pool.spawn(job),
            WorkerPool::Inline => job(),
        }
    }
}
