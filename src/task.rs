//! Async task executor
//!
//! Long-running remote operations are submitted as tasks and polled at a
//! fixed interval until they leave the pending state. The task object is
//! destroyed exactly once on every exit path by a scoped guard.

use std::time::{Duration, Instant};

use crate::mgmt::{AsyncCall, OpaqueRef, TaskStatus};
use crate::session::Connection;
use crate::{Error, Result};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle of one submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Submitted,
    Polling,
    Succeeded,
    Failed,
    TimedOut,
    Destroyed,
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskPhase::Submitted => "submitted",
            TaskPhase::Polling => "polling",
            TaskPhase::Succeeded => "succeeded",
            TaskPhase::Failed => "failed",
            TaskPhase::TimedOut => "timed-out",
            TaskPhase::Destroyed => "destroyed",
        };
        write!(f, "{}", s)
    }
}

/// Owns a remote task handle; destroys it when dropped.
struct TaskGuard<'a> {
    conn: &'a Connection,
    task: OpaqueRef,
    operation: String,
    phase: TaskPhase,
}

impl<'a> TaskGuard<'a> {
    fn new(conn: &'a Connection, task: OpaqueRef, operation: &str) -> Self {
        Self {
            conn,
            task,
            operation: operation.to_string(),
            phase: TaskPhase::Submitted,
        }
    }
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        let outcome = self.phase;
        if let Err(e) = self
            .conn
            .call("task.destroy", |api, s| api.task_destroy(s, &self.task))
        {
            tracing::warn!(
                task = %self.task,
                operation = %self.operation,
                error = %e,
                "Failed to destroy task"
            );
        }
        self.phase = TaskPhase::Destroyed;
        tracing::debug!(task = %self.task, outcome = %outcome, "Task released");
    }
}

/// Submits async calls and waits for them with a wall-clock budget.
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    poll_interval: Duration,
}

impl Default for TaskExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl TaskExecutor {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Run `call` to completion and return the task's result payload.
    pub fn run(&self, conn: &Connection, call: &AsyncCall, timeout: Duration) -> Result<String> {
        self.run_verified(conn, call, timeout, |_| Ok(false))
    }

    /// Like [`run`](Self::run), but if the task handle expires mid-poll the
    /// outcome is decided by `verify`, which inspects the operation's
    /// observable effect (e.g. the VM's power state).
    pub fn run_verified<V>(
        &self,
        conn: &Connection,
        call: &AsyncCall,
        timeout: Duration,
        verify: V,
    ) -> Result<String>
    where
        V: Fn(&Connection) -> Result<bool>,
    {
        let operation = call.to_string();
        let task = conn.call(call.method(), |api, s| api.submit_async(s, call))?;
        let mut guard = TaskGuard::new(conn, task, &operation);
        tracing::debug!(task = %guard.task, operation = %operation, "Task submitted");

        let started = Instant::now();
        guard.phase = TaskPhase::Polling;
        loop {
            let polled = conn.call("task.get_record", |api, s| api.task_get_record(s, &guard.task));
            match polled {
                Ok(record) => match record.status {
                    TaskStatus::Success => {
                        guard.phase = TaskPhase::Succeeded;
                        tracing::info!(
                            operation = %operation,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Task succeeded"
                        );
                        return Ok(record.result);
                    }
                    TaskStatus::Failure => {
                        guard.phase = TaskPhase::Failed;
                        return Err(Error::TaskFailed {
                            operation,
                            task: guard.task.to_string(),
                            error_info: record.error_info,
                        });
                    }
                    TaskStatus::Cancelled => {
                        guard.phase = TaskPhase::Failed;
                        return Err(Error::TaskCancelled {
                            operation,
                            task: guard.task.to_string(),
                        });
                    }
                    TaskStatus::Pending | TaskStatus::Cancelling => {}
                },
                Err(e) if e.is_handle_invalid() => {
                    tracing::warn!(
                        task = %guard.task,
                        operation = %operation,
                        "Task handle expired, checking observable state"
                    );
                    return if verify(conn)? {
                        guard.phase = TaskPhase::Succeeded;
                        Ok(String::new())
                    } else {
                        guard.phase = TaskPhase::Failed;
                        Err(e)
                    };
                }
                Err(e) => {
                    guard.phase = TaskPhase::Failed;
                    return Err(e);
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                guard.phase = TaskPhase::TimedOut;
                if let Err(e) = conn.call("task.cancel", |api, s| api.task_cancel(s, &guard.task)) {
                    tracing::warn!(task = %guard.task, error = %e, "Failed to cancel task");
                }
                return Err(Error::Timeout {
                    operation,
                    task: guard.task.to_string(),
                    elapsed,
                });
            }
            std::thread::sleep(self.poll_interval.min(timeout - elapsed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mgmt::VmPowerState;
    use crate::testing::Fixture;

    fn executor() -> TaskExecutor {
        TaskExecutor::new(Duration::from_millis(2))
    }

    fn start_call(fx: &Fixture, name: &str) -> AsyncCall {
        let uuid = fx.sim.add_vm(name, VmPowerState::Halted, None);
        let conn = fx.conn();
        let vm = conn
            .call("VM.get_by_uuid", |api, s| api.vm_get_by_uuid(s, &uuid))
            .unwrap();
        AsyncCall::VmStart { vm, host: None }
    }

    #[test]
    fn test_success_destroys_task_once() {
        let fx = Fixture::new();
        fx.sim.set_task_latency(2);
        let call = start_call(&fx, "vm-a");
        executor().run(&fx.conn(), &call, Duration::from_secs(5)).unwrap();
        assert_eq!(fx.sim.task_destroy_counts(), vec![1]);
        assert_eq!(fx.sim.live_task_count(), 0);
    }

    #[test]
    fn test_failure_carries_error_info() {
        let fx = Fixture::new();
        fx.sim.inject_task_failure("VM.start", &["NO_HOSTS_AVAILABLE"], 1);
        let call = start_call(&fx, "vm-b");
        let err = executor().run(&fx.conn(), &call, Duration::from_secs(5)).unwrap_err();
        match err {
            Error::TaskFailed { error_info, .. } => assert_eq!(error_info, vec!["NO_HOSTS_AVAILABLE"]),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fx.sim.task_destroy_counts(), vec![1]);
    }

    #[test]
    fn test_timeout_cancels_and_destroys() {
        let fx = Fixture::new();
        fx.sim.set_hang_tasks(true);
        let call = start_call(&fx, "vm-c");
        let err = executor()
            .run(&fx.conn(), &call, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(fx.sim.call_count("task.cancel"), 1);
        assert_eq!(fx.sim.task_destroy_counts(), vec![1]);
    }

    #[test]
    fn test_expired_handle_uses_observable_state() {
        let fx = Fixture::new();
        let call = start_call(&fx, "vm-d");
        fx.sim.set_expire_task_handles(true);
        let vm = call.target().clone();
        let result = executor().run_verified(&fx.conn(), &call, Duration::from_secs(5), |conn| {
            let record = conn.call("VM.get_record", |api, s| api.vm_get_record(s, &vm))?;
            Ok(record.power_state == VmPowerState::Running)
        });
        assert!(result.is_ok());
        assert_eq!(fx.sim.task_destroy_counts(), vec![1]);
    }

    #[test]
    fn test_expired_handle_without_effect_fails() {
        let fx = Fixture::new();
        let call = start_call(&fx, "vm-e");
        fx.sim.set_expire_task_handles(true);
        let err = executor().run(&fx.conn(), &call, Duration::from_secs(5)).unwrap_err();
        assert!(err.is_handle_invalid());
    }
}
