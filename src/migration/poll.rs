//! Poll-until primitive
//!
//! One loop shared by every timed wait in the migration: disk detach waits,
//! relocation task polling and task completion. Each wait is parameterized by
//! an interval, an optional deadline and a tolerance for consecutive query
//! errors, and always yields promptly to cancellation.

use crate::domain::ports::{TaskInfo, TaskRef, VmOperations};
use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outcome of a single poll query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus<T> {
    /// Condition met
    Ready(T),
    /// Not yet; the detail is reported if the deadline passes
    Pending(Option<String>),
}

/// Poll loop parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    /// Delay between queries
    pub interval: Duration,
    /// Give up after this long (`None` waits forever)
    pub timeout: Option<Duration>,
    /// Query errors tolerated in a row; 0 aborts on the first error
    pub max_consecutive_errors: u32,
}

impl PollOptions {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            timeout: None,
            max_consecutive_errors: 0,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_error_tolerance(mut self, max_consecutive_errors: u32) -> Self {
        self.max_consecutive_errors = max_consecutive_errors;
        self
    }
}

/// Run `query` every `options.interval` until it reports ready.
///
/// Errors:
/// - `Cancelled` as soon as `cancel` fires, even mid-query
/// - `Timeout` when the deadline passes, carrying the last pending detail
/// - the query's own error when the tolerance is 0, otherwise
///   `ConsecutiveErrors` once more than `max_consecutive_errors` fail in a row
pub async fn poll_until<T, F, Fut>(
    operation: &str,
    options: PollOptions,
    cancel: &CancellationToken,
    mut query: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollStatus<T>>>,
{
    let start = Instant::now();
    let mut consecutive_errors = 0u32;
    let mut last_detail: Option<String> = None;

    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = query() => outcome,
        };

        match outcome {
            Ok(PollStatus::Ready(value)) => return Ok(value),
            Ok(PollStatus::Pending(detail)) => {
                consecutive_errors = 0;
                debug!(operation, detail = ?detail, "Condition not met yet");
                last_detail = detail;
            }
            Err(e) => {
                consecutive_errors += 1;
                if consecutive_errors > options.max_consecutive_errors {
                    if options.max_consecutive_errors == 0 {
                        return Err(e);
                    }
                    return Err(Error::ConsecutiveErrors {
                        operation: operation.to_string(),
                        count: consecutive_errors,
                        last: Box::new(e),
                    });
                }
                warn!(
                    operation,
                    error = %e,
                    attempt = consecutive_errors,
                    "Poll query failed, retrying"
                );
            }
        }

        let wait = match options.timeout {
            Some(timeout) => {
                let elapsed = start.elapsed();
                if elapsed >= timeout {
                    return Err(Error::Timeout {
                        operation: operation.to_string(),
                        duration: timeout,
                        detail: last_detail,
                    });
                }
                options.interval.min(timeout - elapsed)
            }
            None => options.interval,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

/// Interval between state queries of short-lived tasks
pub const TASK_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Wait for `task` to reach a terminal state.
///
/// A failing state query aborts the wait; so does `cancel`.
pub async fn wait_for_task<E>(
    endpoint: &E,
    task: &TaskRef,
    cancel: &CancellationToken,
) -> Result<TaskInfo>
where
    E: VmOperations + ?Sized,
{
    let operation = format!("task {}", task);
    poll_until(
        &operation,
        PollOptions::new(TASK_POLL_INTERVAL),
        cancel,
        move || async move {
            let info = endpoint.task_info(task).await?;
            if info.state.is_terminal() {
                Ok(PollStatus::Ready(info))
            } else {
                Ok(PollStatus::Pending(Some(format!("{:?}", info.state))))
            }
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::simulator::{InventorySpec, SimulatedEndpoint};
    use crate::domain::ports::TaskState;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_pending() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let value = poll_until(
            "counter",
            PollOptions::new(Duration::from_secs(5)),
            &CancellationToken::new(),
            move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Ok(PollStatus::Pending(None))
                    } else {
                        Ok(PollStatus::Ready(42))
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_last_detail() {
        let started = Instant::now();
        let result: Result<()> = poll_until(
            "disk fcd-1 to detach",
            PollOptions::new(Duration::from_secs(5)).with_timeout(Duration::from_secs(60)),
            &CancellationToken::new(),
            || async { Ok(PollStatus::Pending(Some("still attached to VM worker-3".into()))) },
        )
        .await;

        assert_matches!(
            result,
            Err(Error::Timeout { duration, detail: Some(ref d), .. })
                if duration == Duration::from_secs(60) && d.contains("worker-3")
        );
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(started.elapsed() < Duration::from_secs(66));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_tolerance_returns_query_error() {
        let result: Result<()> = poll_until(
            "query",
            PollOptions::new(Duration::from_secs(5)).with_timeout(Duration::from_secs(60)),
            &CancellationToken::new(),
            || async { Err(Error::endpoint("FindFolder", "no such folder")) },
        )
        .await;

        assert_matches!(result, Err(Error::Endpoint { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_errors() {
        // fail, fail, pending, fail, fail, fail, ready: never more than 3 in a row
        let script = Arc::new(parking_lot::Mutex::new(vec![
            Some(false),
            Some(false),
            None,
            Some(false),
            Some(false),
            Some(false),
            Some(true),
        ]));
        let s = script.clone();
        let value = poll_until(
            "task",
            PollOptions::new(Duration::from_secs(30)).with_error_tolerance(3),
            &CancellationToken::new(),
            move || {
                let s = s.clone();
                async move {
                    match s.lock().remove(0) {
                        Some(true) => Ok(PollStatus::Ready("done")),
                        Some(false) => Err(Error::endpoint("TaskInfo", "503")),
                        None => Ok(PollStatus::Pending(None)),
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(value, "done");
        assert!(script.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_tolerance_exceeded() {
        let result: Result<()> = poll_until(
            "task",
            PollOptions::new(Duration::from_secs(30)).with_error_tolerance(3),
            &CancellationToken::new(),
            || async { Err(Error::endpoint("TaskInfo", "503")) },
        )
        .await;

        assert_matches!(result, Err(Error::ConsecutiveErrors { count: 4, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_wait() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result: Result<()> = poll_until(
            "forever",
            PollOptions::new(Duration::from_secs(30)),
            &cancel,
            || async { Ok(PollStatus::Pending(None)) },
        )
        .await;

        assert_matches!(result, Err(Error::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_task_returns_terminal_info() {
        let ep = SimulatedEndpoint::new(InventorySpec::single("https://vc1/sdk", "dc1", "ds1"));
        let vm = ep.add_vm("dc1", "vcm", "carrier");
        let task = ep.power_off_vm(&vm).await.unwrap();

        let info = wait_for_task(&*ep, &task, &CancellationToken::new()).await.unwrap();
        assert_eq!(info.state, TaskState::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_hung_task_yields_to_cancellation() {
        let ep = SimulatedEndpoint::new(InventorySpec::single("https://vc1/sdk", "dc1", "ds1"));
        let vm = ep.add_vm("dc1", "vcm", "carrier");
        ep.stall_tasks();
        let task = ep.power_off_vm(&vm).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        assert_matches!(wait_for_task(&*ep, &task, &cancel).await, Err(Error::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_task_surfaces_query_error() {
        let ep = SimulatedEndpoint::new(InventorySpec::single("https://vc1/sdk", "dc1", "ds1"));
        let vm = ep.add_vm("dc1", "vcm", "carrier");
        let task = ep.power_off_vm(&vm).await.unwrap();
        ep.fail_task_queries(1);

        assert_matches!(
            wait_for_task(&*ep, &task, &CancellationToken::new()).await,
            Err(Error::Endpoint { .. })
        );
    }
}
