//! Waiting on asynchronous control-plane tasks

use crate::control::{ControlPlane, Operation, TaskHandle, TaskStatus};
use crate::error::{Error, Result};
use smol::Timer;
use std::time::{Duration, Instant};
use testbed_config::Timeouts;
use tracing::debug;

/// Deadline and poll interval for task waits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPolicy {
    /// Deadline, measured from the start of the wait
    pub timeout: Duration,
    /// Interval between status polls
    pub interval: Duration,
}

impl TaskPolicy {
    /// Build a policy from configured timeouts
    pub fn from_timeouts(timeouts: &Timeouts) -> Self {
        Self {
            timeout: timeouts.task(),
            interval: timeouts.task_poll(),
        }
    }
}

/// Poll `task` until it finishes or the deadline passes
pub async fn await_task(
    control: &dyn ControlPlane,
    task: &TaskHandle,
    policy: TaskPolicy,
) -> Result<()> {
    let deadline = Instant::now() + policy.timeout;

    loop {
        match control.task_status(task).await? {
            TaskStatus::Done => return Ok(()),
            TaskStatus::Failed(reason) => {
                return Err(Error::TaskFailed {
                    task: task.to_string(),
                    reason,
                });
            }
            TaskStatus::Pending => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::OperationTimeout {
                operation: format!("task {task}"),
                timeout: policy.timeout,
            });
        }
        Timer::after(policy.interval.min(deadline - now)).await;
    }
}

/// Submit `operation` and wait for its task
pub async fn run_operation(
    control: &dyn ControlPlane,
    operation: Operation,
    policy: TaskPolicy,
) -> Result<()> {
    let description = operation.to_string();
    let task = control.submit(operation).await?;
    debug!("Submitted {} as {}", description, task);

    await_task(control, &task, policy)
        .await
        .map_err(|e| match e {
            Error::OperationTimeout { timeout, .. } => Error::OperationTimeout {
                operation: description,
                timeout,
            },
            other => other,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::MemoryControlPlane;

    fn policy() -> TaskPolicy {
        TaskPolicy {
            timeout: Duration::from_millis(50),
            interval: Duration::from_millis(5),
        }
    }

    #[smol_potat::test]
    async fn test_done_task_returns_immediately() {
        let control = MemoryControlPlane::new();
        run_operation(&control, Operation::ApplyNetwork, policy())
            .await
            .unwrap();
    }

    #[smol_potat::test]
    async fn test_pending_task_times_out() {
        let control = MemoryControlPlane::new();
        control.hold_tasks(true);

        let start = Instant::now();
        let err = run_operation(&control, Operation::ApplyNetwork, policy())
            .await
            .unwrap_err();

        match err {
            Error::OperationTimeout { operation, timeout } => {
                assert_eq!(operation, "network reload");
                assert_eq!(timeout, Duration::from_millis(50));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[smol_potat::test]
    async fn test_failed_task_is_reported() {
        let control = MemoryControlPlane::new();
        control.fail_when(|op| matches!(op, Operation::ApplyNetwork));

        let err = run_operation(&control, Operation::ApplyNetwork, policy())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TaskFailed { .. }));
    }
}
