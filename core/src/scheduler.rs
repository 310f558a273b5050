//! Batch scheduler: fixed-size batches over a bounded pool of OS threads.
//!
//! RULES:
//!   - Batches are contiguous slices of the input, in input order.
//!   - Each worker opens its own state (a store connection) once and
//!     processes whole batches sequentially; concurrency is batch-level.
//!   - A failed or panicking batch never cancels its siblings.

use crate::{cancel::CancelToken, enricher::BatchTally, error::EnrichResult};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    /// 1-based batch number.
    pub number: usize,
    pub size:   usize,
    pub result: Result<BatchTally, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchScheduler {
    pub batch_size:  usize,
    pub max_workers: usize,
}

impl BatchScheduler {
    pub fn new(batch_size: usize, max_workers: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_workers: max_workers.max(1),
        }
    }

    /// Number of batches `len` items split into.
    pub fn batch_count(&self, len: usize) -> usize {
        len.div_ceil(self.batch_size)
    }

    /// Run `work` over every batch. Reports come back sorted by batch
    /// number; batches skipped after cancellation are reported as such.
    pub fn run<T, S, O, W>(
        &self,
        items: &[T],
        cancel: &CancelToken,
        open_worker: O,
        work: W,
    ) -> Vec<BatchReport>
    where
        T: Sync,
        O: Fn() -> EnrichResult<S> + Sync,
        W: Fn(&S, &[T]) -> EnrichResult<BatchTally> + Sync,
    {
        let batches: Vec<&[T]> = items.chunks(self.batch_size).collect();
        let workers = self.max_workers.min(batches.len());
        let next = AtomicUsize::new(0);
        let reports = Mutex::new(Vec::with_capacity(batches.len()));

        log::info!(
            "Scheduling {} items in {} batch(es) of up to {} across {} worker(s)",
            items.len(),
            batches.len(),
            self.batch_size,
            workers
        );

        std::thread::scope(|scope| {
            for worker_id in 0..workers {
                let (batches, next, reports) = (&batches, &next, &reports);
                let (open_worker, work) = (&open_worker, &work);
                scope.spawn(move || {
                    let state = match open_worker() {
                        Ok(s) => s,
                        Err(e) => {
                            // Leave this worker's share to the others.
                            log::error!("Worker {worker_id} failed to start: {e}");
                            return;
                        }
                    };
                    loop {
                        let idx = next.fetch_add(1, Ordering::SeqCst);
                        let Some(batch) = batches.get(idx) else { break };
                        let number = idx + 1;

                        let result = if cancel.is_cancelled() {
                            Err("cancelled before start".to_string())
                        } else {
                            match catch_unwind(AssertUnwindSafe(|| work(&state, batch))) {
                                Ok(Ok(tally)) => Ok(tally),
                                Ok(Err(e)) => Err(e.to_string()),
                                Err(_) => Err("worker panicked".to_string()),
                            }
                        };

                        match &result {
                            Ok(t) => log::info!(
                                "Batch {number} processed: {} resolved, {} no linkage, {} failed, {} limit rows",
                                t.resolved, t.no_linkage, t.failed, t.limit_rows
                            ),
                            Err(e) => log::error!("Error processing batch {number}: {e}"),
                        }
                        reports.lock().push(BatchReport { number, size: batch.len(), result });
                    }
                });
            }
        });

        let mut reports = reports.into_inner();
        // Batches no worker could pick up (every worker failed to start).
        let done: Vec<usize> = reports.iter().map(|r| r.number).collect();
        for (idx, batch) in batches.iter().enumerate() {
            if !done.contains(&(idx + 1)) {
                reports.push(BatchReport {
                    number: idx + 1,
                    size: batch.len(),
                    result: Err("no worker available".to_string()),
                });
            }
        }
        reports.sort_by_key(|r| r.number);
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EnrichError;
    use std::collections::HashSet;
    use std::thread::ThreadId;

    #[test]
    fn partitions_into_contiguous_batches() {
        let items: Vec<u32> = (0..7).collect();
        let seen = Mutex::new(Vec::new());
        let reports = BatchScheduler::new(3, 2).run(
            &items,
            &CancelToken::new(),
            || Ok(()),
            |_, batch| {
                seen.lock().push(batch.to_vec());
                Ok(BatchTally::default())
            },
        );

        let mut seen = seen.into_inner();
        seen.sort();
        assert_eq!(seen, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
        assert_eq!(reports.iter().map(|r| r.size).collect::<Vec<_>>(), vec![3, 3, 1]);
    }

    #[test]
    fn worker_count_is_bounded() {
        let items: Vec<u32> = (0..40).collect();
        let threads = Mutex::new(HashSet::<ThreadId>::new());
        let opened = AtomicUsize::new(0);
        BatchScheduler::new(2, 3).run(
            &items,
            &CancelToken::new(),
            || {
                opened.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            |_, _| {
                threads.lock().insert(std::thread::current().id());
                std::thread::sleep(std::time::Duration::from_millis(2));
                Ok(BatchTally::default())
            },
        );
        assert!(threads.into_inner().len() <= 3);
        assert_eq!(opened.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn failing_batch_does_not_cancel_siblings() {
        let items: Vec<u32> = (0..6).collect();
        let reports = BatchScheduler::new(2, 2).run(
            &items,
            &CancelToken::new(),
            || Ok(()),
            |_, batch| {
                if batch.contains(&2) {
                    Err(EnrichError::Config("bad batch".into()))
                } else if batch.contains(&4) {
                    panic!("boom");
                } else {
                    Ok(BatchTally { resolved: batch.len(), ..Default::default() })
                }
            },
        );
        assert_eq!(reports.len(), 3);
        assert!(reports[0].result.is_ok());
        assert!(reports[1].result.is_err());
        assert_eq!(reports[2].result, Err("worker panicked".to_string()));
    }

    #[test]
    fn cancelled_run_skips_remaining_batches() {
        let items: Vec<u32> = (0..10).collect();
        let cancel = CancelToken::new();
        cancel.cancel();
        let reports = BatchScheduler::new(5, 1).run(&items, &cancel, || Ok(()), |_, _| {
            Ok(BatchTally::default())
        });
        assert!(reports.iter().all(|r| r.result.is_err()));
    }
}
