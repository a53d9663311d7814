use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use log::debug;
use rayon::iter::{ParallelBridge, ParallelIterator};
use thiserror::Error;

/// Token for cooperative cancellation, shared with the Ctrl-C handler.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns Err once cancellation was requested.
    pub fn check(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            Err(CancelledError)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("Operation cancelled")]
pub struct CancelledError;

/// Bounded rayon pool that feeds a lazy source to workers and hands results
/// back to the calling thread.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    jobs: usize,
}

impl WorkerPool {
    /// `None` or `Some(0)` uses the number of available cores.
    pub fn new(jobs: Option<usize>) -> Self {
        let jobs = jobs
            .filter(|&n| n > 0)
            .unwrap_or_else(rayon::current_num_threads);
        Self { jobs }
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    /// Run `work` on every item, handing each result to `sink` on the calling
    /// thread as soon as it is ready. Results arrive in completion order.
    ///
    /// Items are pulled one at a time so the source is never materialized.
    /// Workers stop taking new items once the token is cancelled or the sink
    /// returns an error; in-flight items still finish.
    pub fn run_unordered<I, T, R, W, S>(
        &self,
        items: I,
        cancel: &CancellationToken,
        work: W,
        mut sink: S,
    ) -> anyhow::Result<()>
    where
        I: Iterator<Item = T> + Send,
        T: Send,
        R: Send,
        W: Fn(T) -> R + Sync,
        S: FnMut(R) -> anyhow::Result<()>,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs)
            .build()?;
        let stop = CancellationToken::new();
        let (tx, rx) = mpsc::channel::<R>();

        let result = pool.in_place_scope(|scope| {
            let (stop, work) = (&stop, &work);
            scope.spawn(move |_| {
                items
                    .take_while(|_| !stop.is_cancelled() && !cancel.is_cancelled())
                    .par_bridge()
                    .for_each_with(tx, |tx, item| {
                        if stop.is_cancelled() || cancel.is_cancelled() {
                            return;
                        }
                        // receiver gone means the caller is unwinding
                        let _ = tx.send(work(item));
                    });
                debug!("worker pool drained");
            });

            let mut result = Ok(());
            for r in rx {
                if result.is_ok() {
                    if let Err(e) = sink(r) {
                        stop.cancel();
                        result = Err(e);
                    }
                }
            }
            result
        });

        result?;
        cancel.check()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_cancellation_token() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        let shared = token.clone();
        shared.cancel();
        assert!(token.is_cancelled());
        assert!(token.check().is_err());
    }

    #[test]
    fn test_default_jobs() {
        assert!(WorkerPool::new(None).jobs() >= 1);
        assert!(WorkerPool::new(Some(0)).jobs() >= 1);
        assert_eq!(WorkerPool::new(Some(3)).jobs(), 3);
    }

    #[test]
    fn test_every_item_processed_once() {
        let pool = WorkerPool::new(Some(4));
        let mut seen = Vec::new();
        pool.run_unordered(
            0..100u32,
            &CancellationToken::new(),
            |n| n * 2,
            |r| {
                seen.push(r);
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(seen.len(), 100);
        let unique: HashSet<u32> = seen.into_iter().collect();
        assert_eq!(unique, (0..100).map(|n| n * 2).collect());
    }

    #[test]
    fn test_sink_error_stops_the_run() {
        let pool = WorkerPool::new(Some(2));
        let mut count = 0;
        let err = pool
            .run_unordered(
                0..10_000u32,
                &CancellationToken::new(),
                |n| n,
                |_| {
                    count += 1;
                    if count == 5 {
                        anyhow::bail!("boom")
                    }
                    Ok(())
                },
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(count, 5);
    }

    #[test]
    fn test_cancelled_run_reports_cancellation() {
        let pool = WorkerPool::new(Some(2));
        let token = CancellationToken::new();
        token.cancel();
        let mut count = 0;
        let err = pool
            .run_unordered(0..10u32, &token, |n| n, |_| {
                count += 1;
                Ok(())
            })
            .unwrap_err();
        assert!(err.downcast_ref::<CancelledError>().is_some());
        assert_eq!(count, 0);
    }
}
