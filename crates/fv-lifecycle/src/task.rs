//! Task submission (with duplicate-submission dedup) and the single-task
//! runner that dispatches a claimed task to the right flow (spec §4.4
//! "Idempotency & duplicate submission", §8 invariant "at most one mutator
//! active per instance at a time").

use std::sync::Arc;
use std::time::Duration;

use fv_core::error::CoreError;
use fv_core::model::{Task, TaskStatus, TaskType};
use fv_storage::Storage;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{Engine, PostCreateHooks, ProviderDirectory};

/// Submits a task, returning the existing in-flight task instead of creating
/// a second one if `instance_id` already has a `pending`/`running` task of
/// the same type (spec §4.4: a duplicate submission is idempotent, not an
/// error).
pub async fn submit_task<S: Storage>(
    storage: &S,
    user_id: &str,
    provider_id: Option<&str>,
    instance_id: Option<&str>,
    task_type: TaskType,
    task_data: serde_json::Value,
    timeout_duration_secs: u64,
    is_force_stoppable: bool,
) -> Result<Task, CoreError> {
    if let Some(id) = instance_id {
        if let Some(existing) = storage.find_in_flight_task(id, task_type).await? {
            info!(instance_id = id, task_id = %existing.id, ?task_type, "duplicate submission, returning in-flight task");
            return Ok(existing);
        }
    }

    let task = Task {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        provider_id: provider_id.map(str::to_string),
        instance_id: instance_id.map(str::to_string),
        task_type,
        task_data,
        status: TaskStatus::Pending,
        progress: 0,
        timeout_duration_secs,
        is_force_stoppable,
        error_message: None,
        created_at: chrono::Utc::now(),
        completed_at: None,
    };
    storage.insert_task(task.clone()).await?;
    Ok(task)
}

/// Claims and executes tasks one at a time, dispatching by [`TaskType`] to
/// the `create`/`actions`/`password` flows. The bounded queue and
/// provider-partitioned concurrency sit in `fv-queue`; this runner is the
/// single-task execution unit it drives.
pub struct TaskRunner<S: Storage + 'static, D: ProviderDirectory, H: PostCreateHooks> {
    engine: Arc<Engine<S, D, H>>,
}

impl<S: Storage + 'static, D: ProviderDirectory, H: PostCreateHooks> TaskRunner<S, D, H> {
    pub fn new(engine: Arc<Engine<S, D, H>>) -> Self {
        Self { engine }
    }

    /// Claims the oldest pending task (optionally provider-scoped) and runs
    /// it to completion, updating its stored status/progress throughout.
    /// Returns `Ok(None)` if there was nothing to claim.
    pub async fn claim_and_run(&self, provider_filter: Option<&str>) -> Result<Option<Task>, CoreError> {
        let Some(task) = self.engine.storage.claim_next_task(provider_filter).await? else {
            return Ok(None);
        };
        self.run(&task).await?;
        Ok(Some(task))
    }

    /// Runs an already-claimed (`running`) task through to `completed` or
    /// `failed`, persisting the terminal status either way. Bounded by the
    /// task's own `timeout_duration_secs` (spec §5 "Cancellation & timeout":
    /// every task carries a timeout, enforced by cancelling the operation).
    pub async fn run(&self, task: &Task) -> Result<(), CoreError> {
        let budget = Duration::from_secs(task.timeout_duration_secs);
        let result = match tokio::time::timeout(budget, self.dispatch(task)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(CoreError::Timeout {
                operation: format!("{:?}", task.task_type),
                elapsed_secs: task.timeout_duration_secs,
            }),
        };
        match &result {
            Ok(()) => {
                info!(
                    task_id = %task.id,
                    instance_id = ?task.instance_id,
                    provider_id = ?task.provider_id,
                    task_type = ?task.task_type,
                    "task completed"
                );
                self.engine
                    .storage
                    .update_task(&task.id, TaskStatus::Completed, 100, None)
                    .await?;
            }
            Err(e) => {
                warn!(
                    task_id = %task.id,
                    instance_id = ?task.instance_id,
                    provider_id = ?task.provider_id,
                    task_type = ?task.task_type,
                    error = %e,
                    "task failed"
                );
                self.engine
                    .storage
                    .update_task(&task.id, TaskStatus::Failed, task.progress, Some(e.to_string()))
                    .await?;
            }
        }
        result
    }

    async fn dispatch(&self, task: &Task) -> Result<(), CoreError> {
        match task.task_type {
            TaskType::Create => crate::create::run_create_task(&self.engine, task).await,
            TaskType::Start => crate::actions::run_start_task(&self.engine, task).await,
            TaskType::Stop => crate::actions::run_stop_task(&self.engine, task).await,
            TaskType::Restart => crate::actions::run_restart_task(&self.engine, task).await,
            TaskType::Reset => crate::actions::run_reset_task(&self.engine, task).await,
            TaskType::Delete => crate::actions::run_delete_task(&self.engine, task).await,
            TaskType::ResetPassword => crate::password::run_reset_password_task(&self.engine, task).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fv_storage::memory::MemoryStorage;

    #[tokio::test]
    async fn resubmitting_while_in_flight_returns_the_same_task() {
        let storage = MemoryStorage::new();
        let first = submit_task(
            &storage,
            "u1",
            Some("p1"),
            Some("i1"),
            TaskType::Start,
            serde_json::json!({}),
            60,
            false,
        )
        .await
        .unwrap();

        let second = submit_task(
            &storage,
            "u1",
            Some("p1"),
            Some("i1"),
            TaskType::Start,
            serde_json::json!({}),
            60,
            false,
        )
        .await
        .unwrap();

        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn different_instance_gets_its_own_task() {
        let storage = MemoryStorage::new();
        let first = submit_task(
            &storage,
            "u1",
            Some("p1"),
            Some("i1"),
            TaskType::Start,
            serde_json::json!({}),
            60,
            false,
        )
        .await
        .unwrap();
        let second = submit_task(
            &storage,
            "u1",
            Some("p1"),
            Some("i2"),
            TaskType::Start,
            serde_json::json!({}),
            60,
            false,
        )
        .await
        .unwrap();
        assert_ne!(first.id, second.id);
    }
}
