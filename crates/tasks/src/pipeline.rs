//! Sequential, partial-failure-tolerant batch processing.
//!
//! Items are processed one at a time, in order. A failing item is logged and
//! skipped; the batch only fails when no item succeeded. When several items
//! succeed their results can be consolidated by an aggregation step, which
//! itself degrades to the first partial result if it fails.

use std::fmt::Display;
use std::future::Future;

use tracing::{debug, info, warn};

use casegen_core::CallError;

use super::types::ItemFailure;

/// The batch produced nothing usable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("batch `{batch}` has no items")]
    Empty { batch: String },
    #[error("batch `{batch}`: all {total} item(s) failed; last error: {last_error}")]
    AllItemsFailed {
        batch: String,
        total: usize,
        last_error: String,
        failures: Vec<ItemFailure>,
    },
}

/// Sequential processor over an ordered list of work items.
#[derive(Debug, Clone)]
pub struct BatchPipeline {
    name: String,
}

impl BatchPipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `transform` over every item, in order.
    ///
    /// `on_progress(position, total)` fires once per item after its attempt
    /// concludes, success or not; `position` is 1-based.
    pub async fn run<I, R, T, TFut, P, PFut>(
        &self,
        items: Vec<I>,
        mut transform: T,
        mut on_progress: P,
    ) -> Result<BatchReport<R>, PipelineError>
    where
        T: FnMut(usize, I) -> TFut,
        TFut: Future<Output = Result<R, CallError>>,
        P: FnMut(usize, usize) -> PFut,
        PFut: Future<Output = ()>,
    {
        let total = items.len();
        if total == 0 {
            warn!(batch = %self.name, "batch has no items");
            return Err(PipelineError::Empty {
                batch: self.name.clone(),
            });
        }

        let mut results = Vec::with_capacity(total);
        let mut failures = Vec::new();

        for (index, item) in items.into_iter().enumerate() {
            match transform(index, item).await {
                Ok(result) => {
                    debug!(batch = %self.name, index, total, "item processed");
                    results.push(result);
                }
                Err(err) => {
                    warn!(batch = %self.name, index, total, error = %err, "item failed; skipping");
                    failures.push(ItemFailure {
                        index,
                        kind: err.kind(),
                        message: err.message().to_string(),
                    });
                }
            }
            on_progress(index + 1, total).await;
        }

        if results.is_empty() {
            let last_error = failures
                .last()
                .map(|f| format!("{}: {}", f.kind, f.message))
                .unwrap_or_default();
            return Err(PipelineError::AllItemsFailed {
                batch: self.name.clone(),
                total,
                last_error,
                failures,
            });
        }

        info!(
            batch = %self.name,
            total,
            succeeded = results.len(),
            skipped = failures.len(),
            "batch finished"
        );

        Ok(BatchReport {
            batch: self.name.clone(),
            total,
            results,
            failures,
        })
    }
}

/// Outcome of a batch with at least one successful item.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport<R> {
    batch: String,
    total: usize,
    results: Vec<R>,
    failures: Vec<ItemFailure>,
}

impl<R> BatchReport<R> {
    pub fn total(&self) -> usize {
        self.total
    }

    /// Successful results in input order (never empty).
    pub fn results(&self) -> &[R] {
        &self.results
    }

    pub fn failures(&self) -> &[ItemFailure] {
        &self.failures
    }

    /// Produce one value from the partial results.
    ///
    /// A single result is returned as is. Several results go through
    /// `aggregate`; if that fails the first partial result is returned.
    pub async fn consolidate<A, AFut, E>(self, aggregate: A) -> Consolidated<R>
    where
        R: Clone,
        A: FnOnce(Vec<R>) -> AFut,
        AFut: Future<Output = Result<R, E>>,
        E: Display,
    {
        let succeeded = self.results.len();
        let mut results = self.results;

        if succeeded == 1 {
            let value = results.remove(0);
            return Consolidated {
                value,
                aggregated: false,
                succeeded,
                failures: self.failures,
            };
        }

        let first = results[0].clone();
        match aggregate(results).await {
            Ok(value) => Consolidated {
                value,
                aggregated: true,
                succeeded,
                failures: self.failures,
            },
            Err(err) => {
                warn!(
                    batch = %self.batch,
                    partial_results = succeeded,
                    error = %err,
                    "aggregation failed; keeping first partial result"
                );
                Consolidated {
                    value: first,
                    aggregated: false,
                    succeeded,
                    failures: self.failures,
                }
            }
        }
    }
}

/// Single consolidated value of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Consolidated<R> {
    pub value: R,
    /// Whether the aggregation step produced `value`
    pub aggregated: bool,
    /// Number of items that succeeded
    pub succeeded: usize,
    pub failures: Vec<ItemFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use casegen_core::ErrorKind;

    fn recorder() -> (Arc<Mutex<Vec<(usize, usize)>>>, impl FnMut(usize, usize) -> std::future::Ready<()>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |pos, total| {
            sink.lock().unwrap().push((pos, total));
            std::future::ready(())
        })
    }

    async fn double_unless_odd(_: usize, n: u32) -> Result<u32, CallError> {
        if n % 2 == 1 {
            Err(CallError::decode(format!("{n} is odd")))
        } else {
            Ok(n * 2)
        }
    }

    #[tokio::test]
    async fn skips_failures_and_reports_progress_per_item() {
        let (seen, on_progress) = recorder();

        let report = BatchPipeline::new("numbers")
            .run(vec![2, 3, 4], double_unless_odd, on_progress)
            .await
            .unwrap();

        assert_eq!(report.results(), &[4, 8]);
        assert_eq!(report.failures().len(), 1);
        assert_eq!(report.failures()[0].index, 1);
        assert_eq!(report.failures()[0].kind, ErrorKind::Decode);
        assert_eq!(*seen.lock().unwrap(), vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[tokio::test]
    async fn processes_items_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let log = order.clone();

        BatchPipeline::new("ordered")
            .run(
                vec!["a", "b", "c"],
                move |_, item| {
                    log.lock().unwrap().push(item);
                    async move { Ok::<_, CallError>(item) }
                },
                |_, _| async {},
            )
            .await
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn all_failures_fail_the_batch() {
        let (seen, on_progress) = recorder();

        let err = BatchPipeline::new("numbers")
            .run(vec![1, 3], double_unless_odd, on_progress)
            .await
            .unwrap_err();

        match err {
            PipelineError::AllItemsFailed { total, failures, last_error, .. } => {
                assert_eq!(total, 2);
                assert_eq!(failures.len(), 2);
                assert_eq!(last_error, "decode: 3 is odd");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_batch_is_an_error() {
        let err = BatchPipeline::new("nothing")
            .run(Vec::<u32>::new(), double_unless_odd, |_, _| async {})
            .await
            .unwrap_err();

        assert_eq!(err, PipelineError::Empty { batch: "nothing".to_string() });
    }

    #[tokio::test]
    async fn single_success_skips_aggregation() {
        let report = BatchPipeline::new("numbers")
            .run(vec![1, 4], double_unless_odd, |_, _| async {})
            .await
            .unwrap();

        let out = report
            .consolidate(|_: Vec<u32>| async { Err::<u32, _>("must not be called") })
            .await;

        assert_eq!(out.value, 8);
        assert!(!out.aggregated);
        assert_eq!(out.succeeded, 1);
        assert_eq!(out.failures.len(), 1);
    }

    #[tokio::test]
    async fn aggregates_multiple_successes() {
        let report = BatchPipeline::new("numbers")
            .run(vec![2, 3, 6], double_unless_odd, |_, _| async {})
            .await
            .unwrap();

        let out = report
            .consolidate(|parts: Vec<u32>| async move { Ok::<_, String>(parts.iter().sum()) })
            .await;

        assert_eq!(out.value, 16);
        assert!(out.aggregated);
        assert_eq!(out.succeeded, 2);
    }

    #[tokio::test]
    async fn failed_aggregation_keeps_first_partial_result() {
        let report = BatchPipeline::new("numbers")
            .run(vec![2, 4, 6], double_unless_odd, |_, _| async {})
            .await
            .unwrap();

        let out = report
            .consolidate(|_: Vec<u32>| async { Err::<u32, _>("summary model down") })
            .await;

        assert_eq!(out.value, 4);
        assert!(!out.aggregated);
        assert_eq!(out.succeeded, 3);
    }
}
