//! Branch Scheduler
//!
//! Runs independent execution paths concurrently and joins their results.
//! Used by Parallel states (one task per branch), ForEach states in parallel
//! mode (one task per item) and Operation states with `actionMode: parallel`.
//!
//! - Each task runs as its own tokio task and returns its result by value
//! - At most `max_concurrency` tasks run at once; the rest queue in input order
//! - Once the join condition is decided, remaining tasks are cancelled through
//!   a shared [`CancellationToken`] and queued tasks are never started
//! - Results come back in input order, whatever order tasks finished in

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error};
use serde_json::Value;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::{ExecutionError, StateError};

/// Future produced by a branch task.
pub type BranchFuture<T = Value> = BoxFuture<'static, Result<T, ExecutionError>>;

type BranchRun<T> = Box<dyn FnOnce(CancellationToken) -> BranchFuture<T> + Send>;

/// A named unit of work. The closure receives the token it must observe.
pub struct BranchTask<T = Value> {
    pub name: String,
    run: BranchRun<T>,
}

impl<T> BranchTask<T> {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> BranchFuture<T> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }
}

impl<T> std::fmt::Debug for BranchTask<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchTask").field("name", &self.name).finish()
    }
}

/// When the scheduler may stop waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinCondition {
    /// Every task must succeed; the first failure decides the join
    All,
    /// Decided once N tasks succeeded, or once N can no longer be reached
    AtLeast(usize),
    /// Wait for every task regardless of failures
    Settled,
}

#[derive(Debug, Clone)]
pub enum BranchStatus<T = Value> {
    Succeeded(T),
    Failed(ExecutionError),
    /// Stopped, or never started, because the join was already decided
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct BranchResult<T = Value> {
    pub name: String,
    /// Position of the task in the input sequence
    pub index: usize,
    pub status: BranchStatus<T>,
}

impl<T> BranchResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self.status, BranchStatus::Succeeded(_))
    }
}

struct JoinTracker {
    condition: JoinCondition,
    total: usize,
    succeeded: usize,
    unsuccessful: usize,
}

impl JoinTracker {
    fn new(condition: JoinCondition, total: usize) -> Self {
        Self {
            condition,
            total,
            succeeded: 0,
            unsuccessful: 0,
        }
    }

    fn record<T>(&mut self, status: &BranchStatus<T>) {
        match status {
            BranchStatus::Succeeded(_) => self.succeeded += 1,
            BranchStatus::Failed(_) | BranchStatus::Cancelled => self.unsuccessful += 1,
        }
    }

    fn decided(&self) -> bool {
        match self.condition {
            JoinCondition::All => self.unsuccessful > 0 || self.succeeded == self.total,
            JoinCondition::AtLeast(required) => {
                self.succeeded >= required || self.unsuccessful > self.total.saturating_sub(required)
            }
            JoinCondition::Settled => false,
        }
    }
}

type Joined<T> = (usize, std::thread::Result<Result<T, ExecutionError>>);

/// Fork/join executor for branch tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct BranchScheduler;

impl BranchScheduler {
    pub fn new() -> Self {
        Self
    }

    /// Runs `tasks` concurrently and returns one result per task, in input
    /// order.
    pub async fn run_concurrently<T: Send + 'static>(
        &self,
        tasks: Vec<BranchTask<T>>,
        join: JoinCondition,
        max_concurrency: Option<usize>,
        parent: &CancellationToken,
    ) -> Vec<BranchResult<T>> {
        let limit = max_concurrency.unwrap_or(tasks.len()).max(1);
        let mut fork = Fork::new(tasks, join, limit, parent.child_token());

        debug!(
            "Scheduling {} task(s), at most {} at once, join {:?}",
            fork.names.len(),
            limit,
            join
        );

        fork.fill();
        while let Some(joined) = fork.running.join_next().await {
            fork.settle(joined);
        }

        fork.finish()
    }
}

/// Bookkeeping of one `run_concurrently` call.
struct Fork<T> {
    names: Vec<String>,
    queue: VecDeque<(usize, BranchTask<T>)>,
    slots: Vec<Option<BranchStatus<T>>>,
    tracker: JoinTracker,
    running: JoinSet<Joined<T>>,
    limit: usize,
    token: CancellationToken,
}

impl<T: Send + 'static> Fork<T> {
    fn new(tasks: Vec<BranchTask<T>>, join: JoinCondition, limit: usize, token: CancellationToken) -> Self {
        let total = tasks.len();
        Self {
            names: tasks.iter().map(|t| t.name.clone()).collect(),
            queue: tasks.into_iter().enumerate().collect(),
            slots: (0..total).map(|_| None).collect(),
            tracker: JoinTracker::new(join, total),
            running: JoinSet::new(),
            limit,
            token,
        }
    }

    /// Starts queued tasks until `limit` are running.
    fn fill(&mut self) {
        while self.running.len() < self.limit && !self.token.is_cancelled() {
            let Some((index, task)) = self.queue.pop_front() else {
                break;
            };

            let future = (task.run)(self.token.clone());
            self.running
                .spawn(async move { (index, AssertUnwindSafe(future).catch_unwind().await) });
        }
    }

    /// Records a finished task, then cancels the rest or starts more.
    fn settle(&mut self, joined: Result<Joined<T>, JoinError>) {
        match joined {
            Ok((index, outcome)) => {
                let status = if self.tracker.decided() {
                    BranchStatus::Cancelled
                } else {
                    match outcome {
                        Ok(Ok(value)) => BranchStatus::Succeeded(value),
                        Ok(Err(ExecutionError::Cancelled)) => BranchStatus::Cancelled,
                        Ok(Err(e)) => BranchStatus::Failed(e),
                        Err(_) => BranchStatus::Failed(ExecutionError::BranchPanicked(
                            self.names[index].clone(),
                        )),
                    }
                };

                self.tracker.record(&status);
                self.slots[index] = Some(status);
            }
            // The slot of a lost task stays empty and is reported as cancelled.
            Err(e) => {
                error!("Branch task did not complete: {}", e);
                self.tracker.record(&BranchStatus::<T>::Cancelled);
            }
        }

        if self.tracker.decided() {
            if !self.token.is_cancelled() {
                debug!(
                    "Join decided ({} succeeded, {} not), cancelling {} running and {} queued task(s)",
                    self.tracker.succeeded,
                    self.tracker.unsuccessful,
                    self.running.len(),
                    self.queue.len()
                );
                self.token.cancel();
            }
        } else {
            self.fill();
        }
    }

    fn finish(self) -> Vec<BranchResult<T>> {
        self.slots
            .into_iter()
            .zip(self.names)
            .enumerate()
            .map(|(index, (status, name))| BranchResult {
                name,
                index,
                status: status.unwrap_or(BranchStatus::Cancelled),
            })
            .collect()
    }
}

/// Sleeps for `duration` unless `cancel` fires first.
pub async fn cancellable_sleep(duration: Duration, cancel: &CancellationToken) -> Result<(), StateError> {
    if duration.is_zero() {
        return if cancel.is_cancelled() {
            Err(StateError::Cancelled)
        } else {
            Ok(())
        };
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StateError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn delayed(name: &str, millis: u64, value: Value) -> BranchTask {
        BranchTask::new(name, move |cancel| {
            async move {
                cancellable_sleep(Duration::from_millis(millis), &cancel)
                    .await
                    .map_err(|_| ExecutionError::Cancelled)?;
                Ok(value)
            }
            .boxed()
        })
    }

    fn failing(name: &str) -> BranchTask {
        let owned = name.to_string();
        BranchTask::new(name, move |_| {
            async move { Err(ExecutionError::UnknownState(owned)) }.boxed()
        })
    }

    fn values(results: &[BranchResult]) -> Vec<Option<Value>> {
        results
            .iter()
            .map(|r| match &r.status {
                BranchStatus::Succeeded(v) => Some(v.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_results_keep_input_order() {
        let tasks = vec![
            delayed("slow", 60, json!(1)),
            delayed("medium", 30, json!(2)),
            delayed("fast", 0, json!(3)),
        ];

        let results = BranchScheduler
            .run_concurrently(tasks, JoinCondition::All, None, &CancellationToken::new())
            .await;

        assert_eq!(values(&results), vec![Some(json!(1)), Some(json!(2)), Some(json!(3))]);
        assert_eq!(results[2].name, "fast");
        assert_eq!(results[2].index, 2);
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..6)
            .map(|i| {
                let active = active.clone();
                let peak = peak.clone();
                BranchTask::new(format!("item-{}", i), move |_| {
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(json!(i))
                    }
                    .boxed()
                })
            })
            .collect();

        let results = BranchScheduler
            .run_concurrently(tasks, JoinCondition::All, Some(2), &CancellationToken::new())
            .await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(
            values(&results),
            (0..6).map(|i| Some(json!(i))).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_all_short_circuits_on_failure() {
        let started = Instant::now();
        let tasks = vec![delayed("long", 10_000, json!(1)), failing("broken")];

        let results = BranchScheduler
            .run_concurrently(tasks, JoinCondition::All, None, &CancellationToken::new())
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(results[0].status, BranchStatus::Cancelled));
        assert!(matches!(results[1].status, BranchStatus::Failed(_)));
    }

    #[tokio::test]
    async fn test_at_least_cancels_the_rest() {
        let started = Instant::now();
        let tasks = vec![
            delayed("a", 0, json!("a")),
            delayed("b", 10_000, json!("b")),
            delayed("c", 10_000, json!("c")),
        ];

        let results = BranchScheduler
            .run_concurrently(tasks, JoinCondition::AtLeast(1), None, &CancellationToken::new())
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(results[0].is_success());
        assert!(matches!(results[1].status, BranchStatus::Cancelled));
        assert!(matches!(results[2].status, BranchStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_at_least_tolerates_failures() {
        let tasks = vec![failing("a"), delayed("b", 10, json!("b")), delayed("c", 20, json!("c"))];

        let results = BranchScheduler
            .run_concurrently(tasks, JoinCondition::AtLeast(2), None, &CancellationToken::new())
            .await;

        assert_eq!(results.iter().filter(|r| r.is_success()).count(), 2);
    }

    #[tokio::test]
    async fn test_settled_waits_for_everything() {
        let tasks = vec![failing("a"), delayed("b", 20, json!("b"))];

        let results = BranchScheduler
            .run_concurrently(tasks, JoinCondition::Settled, None, &CancellationToken::new())
            .await;

        assert!(matches!(results[0].status, BranchStatus::Failed(_)));
        assert!(results[1].is_success());
    }

    #[tokio::test]
    async fn test_queued_tasks_never_start_after_decision() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let tasks = vec![
            failing("first"),
            BranchTask::new("second", move |_| {
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(json!(null))
                }
                .boxed()
            }),
        ];

        let results = BranchScheduler
            .run_concurrently(tasks, JoinCondition::All, Some(1), &CancellationToken::new())
            .await;

        assert!(!ran.load(Ordering::SeqCst));
        assert!(matches!(results[1].status, BranchStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_panicking_task_is_reported() {
        let tasks = vec![BranchTask::new("boom", |_| {
            async move {
                if true {
                    panic!("branch exploded");
                }
                Ok(json!(null))
            }
            .boxed()
        })];

        let results = BranchScheduler
            .run_concurrently(tasks, JoinCondition::Settled, None, &CancellationToken::new())
            .await;

        match &results[0].status {
            BranchStatus::Failed(ExecutionError::BranchPanicked(name)) => assert_eq!(name, "boom"),
            other => panic!("unexpected status: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lost_task_does_not_stall_the_queue() {
        let handle = tokio::spawn(std::future::pending::<()>());
        handle.abort();
        let lost = handle.await.unwrap_err();

        let tasks = vec![
            delayed("a", 0, json!(1)),
            delayed("b", 0, json!(2)),
            delayed("c", 0, json!(3)),
        ];
        let mut fork = Fork::new(tasks, JoinCondition::Settled, 1, CancellationToken::new());

        fork.settle(Err(lost));
        assert_eq!(fork.running.len(), 1);
        assert_eq!(fork.queue.len(), 2);

        while let Some(joined) = fork.running.join_next().await {
            fork.settle(joined);
        }
        let results = fork.finish();
        assert_eq!(values(&results), vec![Some(json!(1)), Some(json!(2)), Some(json!(3))]);
    }

    #[tokio::test]
    async fn test_parent_cancellation_propagates() {
        let parent = CancellationToken::new();
        parent.cancel();

        let results = BranchScheduler
            .run_concurrently(vec![delayed("a", 10_000, json!(1))], JoinCondition::All, None, &parent)
            .await;

        assert!(matches!(results[0].status, BranchStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_empty_task_list() {
        let results = BranchScheduler
            .run_concurrently(Vec::<BranchTask>::new(), JoinCondition::All, None, &CancellationToken::new())
            .await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_cancellable_sleep() {
        let cancel = CancellationToken::new();
        assert!(cancellable_sleep(Duration::from_millis(1), &cancel).await.is_ok());

        cancel.cancel();
        let err = cancellable_sleep(Duration::from_secs(60), &cancel).await.unwrap_err();
        assert!(matches!(err, StateError::Cancelled));
    }
}
