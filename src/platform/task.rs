use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::{PlatformConnection, PlatformError, TaskRef, TaskStatus};
use crate::config::PlatformConfig;

/// Polling schedule for platform tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskWaitPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub timeout: Duration,
}

impl TaskWaitPolicy {
    #[must_use]
    pub const fn from_config(config: &PlatformConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.task_poll_initial_ms),
            max: Duration::from_millis(config.task_poll_max_ms),
            timeout: Duration::from_secs(config.task_timeout_seconds),
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

impl Default for TaskWaitPolicy {
    fn default() -> Self {
        Self::from_config(&PlatformConfig::default())
    }
}

/// Polls `task` until it reaches a terminal state, doubling the delay between
/// polls up to `policy.max`.
///
/// # Errors
///
/// [`PlatformError::TaskFailed`] carrying the platform's message when the task
/// fails, [`PlatformError::TaskTimeout`] once `policy.timeout` has elapsed, or
/// whatever the status query itself returns.
pub async fn wait_for_task(
    conn: &dyn PlatformConnection,
    task: &TaskRef,
    policy: TaskWaitPolicy,
) -> Result<(), PlatformError> {
    let started = Instant::now();
    let mut delay = policy.initial;

    loop {
        match conn.task_status(task).await? {
            TaskStatus::Succeeded => return Ok(()),
            TaskStatus::Failed(message) => return Err(PlatformError::TaskFailed(message)),
            status @ (TaskStatus::Pending | TaskStatus::Running) => {
                debug!(task = %task, ?status, "Task not finished yet");
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= policy.timeout {
            return Err(PlatformError::TaskTimeout {
                task: task.to_string(),
                waited_secs: elapsed.as_secs(),
            });
        }

        let remaining = policy.timeout - elapsed;
        tokio::time::sleep(delay.min(remaining)).await;
        delay = policy.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{
        PowerCall, PowerState, SnapshotSpec, SnapshotTree, Utilization, VmDetail, VmSummary,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedTasks {
        statuses: Mutex<Vec<TaskStatus>>,
        polls: Mutex<usize>,
    }

    impl ScriptedTasks {
        fn new(mut statuses: Vec<TaskStatus>) -> Self {
            statuses.reverse();
            Self {
                statuses: Mutex::new(statuses),
                polls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl PlatformConnection for ScriptedTasks {
        async fn list_vms(&self) -> Result<Vec<VmSummary>, PlatformError> {
            unreachable!()
        }
        async fn get_vm(&self, _: &str) -> Result<Option<VmDetail>, PlatformError> {
            unreachable!()
        }
        async fn power_state(&self, _: &str) -> Result<PowerState, PlatformError> {
            unreachable!()
        }
        async fn power(&self, _: &str, _: PowerCall) -> Result<Option<TaskRef>, PlatformError> {
            unreachable!()
        }
        async fn utilization(&self, _: &str) -> Result<Option<Utilization>, PlatformError> {
            unreachable!()
        }
        async fn snapshots(&self, _: &str) -> Result<Vec<SnapshotTree>, PlatformError> {
            unreachable!()
        }
        async fn create_snapshot(&self, _: &str, _: &SnapshotSpec) -> Result<TaskRef, PlatformError> {
            unreachable!()
        }
        async fn task_status(&self, _: &TaskRef) -> Result<TaskStatus, PlatformError> {
            *self.polls.lock().unwrap() += 1;
            let mut statuses = self.statuses.lock().unwrap();
            Ok(statuses.pop().unwrap_or(TaskStatus::Running))
        }
        async fn logout(&self) -> Result<(), PlatformError> {
            Ok(())
        }
    }

    fn fast_policy() -> TaskWaitPolicy {
        TaskWaitPolicy {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(40),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waits_until_success() {
        let conn = ScriptedTasks::new(vec![
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Succeeded,
        ]);
        wait_for_task(&conn, &TaskRef("task-1".into()), fast_policy())
            .await
            .unwrap();
        assert_eq!(*conn.polls.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_message_is_verbatim() {
        let conn = ScriptedTasks::new(vec![
            TaskStatus::Running,
            TaskStatus::Failed("Insufficient disk space on datastore".into()),
        ]);
        let err = wait_for_task(&conn, &TaskRef("task-2".into()), fast_policy())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Insufficient disk space on datastore");
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_timeout() {
        let conn = ScriptedTasks::new(vec![]);
        let policy = TaskWaitPolicy {
            timeout: Duration::from_secs(1),
            ..fast_policy()
        };
        let err = wait_for_task(&conn, &TaskRef("task-3".into()), policy)
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::TaskTimeout { .. }));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = fast_policy();
        let mut delay = policy.initial;
        for _ in 0..10 {
            delay = policy.next_delay(delay);
        }
        assert_eq!(delay, policy.max);
    }
}
