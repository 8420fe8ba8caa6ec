//! Start/stop/restart/reset/delete (spec §6 "Instance actions"). Each runner
//! is handed an already-claimed [`Task`] with `instance_id` set, checks
//! eligibility against the current persisted status, moves the instance
//! through its transitional state, calls the provider adapter, and settles on
//! the terminal state.

use fv_core::error::CoreError;
use fv_core::model::{Instance, InstanceStatus, Task};
use fv_storage::Storage;
use tracing::info;

use crate::state;
use crate::{Engine, PostCreateHooks, ProviderDirectory};

pub(crate) fn instance_id(task: &Task) -> Result<&str, CoreError> {
    task.instance_id.as_deref().ok_or_else(|| CoreError::ValidationFailed {
        reason: "task has no instance_id".to_string(),
    })
}

pub(crate) async fn load<S: Storage>(storage: &S, task: &Task) -> Result<Instance, CoreError> {
    storage.get_instance(instance_id(task)?).await
}

pub async fn run_start_task<S: Storage, D: ProviderDirectory, H: PostCreateHooks>(
    engine: &Engine<S, D, H>,
    task: &Task,
) -> Result<(), CoreError> {
    let instance = load(&*engine.storage, task).await?;
    if !state::start_eligible(instance.status, instance.traffic_limited) {
        return Err(CoreError::Conflict {
            reason: format!("instance {} is not eligible to start (status={})", instance.id, instance.status),
        });
    }

    engine.storage.update_instance_status(&instance.id, InstanceStatus::Starting).await?;
    let adapter = engine.directory.adapter(&instance.provider_id).await?;
    match adapter.start_instance(&instance.provider_id, &instance.id).await {
        Ok(()) => {
            engine.storage.update_instance_status(&instance.id, InstanceStatus::Running).await?;
            let refreshed = engine.storage.get_instance(&instance.id).await?;
            engine.hooks.on_instance_running(&refreshed).await?;
            info!(instance_id = %instance.id, "instance started");
            Ok(())
        }
        Err(e) => {
            engine.storage.update_instance_status(&instance.id, InstanceStatus::Stopped).await?;
            Err(e)
        }
    }
}

pub async fn run_stop_task<S: Storage, D: ProviderDirectory, H: PostCreateHooks>(
    engine: &Engine<S, D, H>,
    task: &Task,
) -> Result<(), CoreError> {
    let instance = load(&*engine.storage, task).await?;
    if !state::stop_eligible(instance.status) {
        return Err(CoreError::Conflict {
            reason: format!("instance {} is not eligible to stop (status={})", instance.id, instance.status),
        });
    }

    engine.storage.update_instance_status(&instance.id, InstanceStatus::Stopping).await?;
    let adapter = engine.directory.adapter(&instance.provider_id).await?;
    match adapter.stop_instance(&instance.provider_id, &instance.id).await {
        Ok(()) => {
            engine.storage.update_instance_status(&instance.id, InstanceStatus::Stopped).await?;
            info!(instance_id = %instance.id, "instance stopped");
            Ok(())
        }
        Err(e) => {
            engine.storage.update_instance_status(&instance.id, InstanceStatus::Running).await?;
            Err(e)
        }
    }
}

pub async fn run_restart_task<S: Storage, D: ProviderDirectory, H: PostCreateHooks>(
    engine: &Engine<S, D, H>,
    task: &Task,
) -> Result<(), CoreError> {
    let instance = load(&*engine.storage, task).await?;
    if !state::restart_eligible(instance.status, instance.traffic_limited) {
        return Err(CoreError::Conflict {
            reason: format!("instance {} is not eligible to restart (status={})", instance.id, instance.status),
        });
    }

    engine.storage.update_instance_status(&instance.id, InstanceStatus::Restarting).await?;
    let adapter = engine.directory.adapter(&instance.provider_id).await?;
    match adapter.restart_instance(&instance.provider_id, &instance.id).await {
        Ok(()) => {
            engine.storage.update_instance_status(&instance.id, InstanceStatus::Running).await?;
            info!(instance_id = %instance.id, "instance restarted");
            Ok(())
        }
        Err(e) => {
            engine.storage.update_instance_status(&instance.id, InstanceStatus::Unavailable).await?;
            Err(e)
        }
    }
}

/// A reset is a hard restart (spec §6: no adapter method distinct from
/// restart, the distinction is state-reported as `resetting` while in
/// flight rather than `restarting`).
pub async fn run_reset_task<S: Storage, D: ProviderDirectory, H: PostCreateHooks>(
    engine: &Engine<S, D, H>,
    task: &Task,
) -> Result<(), CoreError> {
    let instance = load(&*engine.storage, task).await?;
    if !state::reset_eligible(instance.status, instance.traffic_limited) {
        return Err(CoreError::Conflict {
            reason: format!("instance {} is not eligible to reset (status={})", instance.id, instance.status),
        });
    }

    engine.storage.update_instance_status(&instance.id, InstanceStatus::Resetting).await?;
    let adapter = engine.directory.adapter(&instance.provider_id).await?;
    match adapter.restart_instance(&instance.provider_id, &instance.id).await {
        Ok(()) => {
            engine.storage.update_instance_status(&instance.id, InstanceStatus::Running).await?;
            info!(instance_id = %instance.id, "instance reset");
            Ok(())
        }
        Err(e) => {
            engine.storage.update_instance_status(&instance.id, InstanceStatus::Unavailable).await?;
            Err(e)
        }
    }
}

pub async fn run_delete_task<S: Storage, D: ProviderDirectory, H: PostCreateHooks>(
    engine: &Engine<S, D, H>,
    task: &Task,
) -> Result<(), CoreError> {
    let instance = load(&*engine.storage, task).await?;
    if !state::delete_eligible(instance.status) {
        return Err(CoreError::Conflict {
            reason: format!("instance {} is already deleting", instance.id),
        });
    }

    engine.storage.update_instance_status(&instance.id, InstanceStatus::Deleting).await?;
    let adapter = engine.directory.adapter(&instance.provider_id).await?;
    adapter.delete_instance(&instance.provider_id, &instance.id).await?;

    let active_ports = engine.storage.list_active_ports(&instance.provider_id).await?;
    let ours: Vec<_> = active_ports.into_iter().filter(|p| p.instance_id == instance.id).collect();
    for mapping in &ours {
        engine.storage.release_port(&mapping.id).await?;
    }

    engine
        .storage
        .release_provider_resources(&instance.provider_id, instance.instance_type)
        .await?;
    engine.storage.delete_instance(&instance.id).await?;
    engine.hooks.on_instance_deleted(&instance.id, &instance.provider_id).await?;
    info!(instance_id = %instance.id, "instance deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seed_instance, task_for, test_engine};

    #[tokio::test]
    async fn stop_then_start_round_trip() {
        let engine = test_engine();
        engine.storage.upsert_instance(seed_instance(InstanceStatus::Running)).await.unwrap();

        run_stop_task(&engine, &task_for("i1", fv_core::model::TaskType::Stop)).await.unwrap();
        let stopped = engine.storage.get_instance("i1").await.unwrap();
        assert_eq!(stopped.status, InstanceStatus::Stopped);

        run_start_task(&engine, &task_for("i1", fv_core::model::TaskType::Start)).await.unwrap();
        let running = engine.storage.get_instance("i1").await.unwrap();
        assert_eq!(running.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn starting_an_already_running_instance_conflicts() {
        let engine = test_engine();
        engine.storage.upsert_instance(seed_instance(InstanceStatus::Running)).await.unwrap();
        let err = run_start_task(&engine, &task_for("i1", fv_core::model::TaskType::Start))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn delete_releases_ports_and_removes_the_row() {
        let engine = test_engine();
        engine.storage.upsert_instance(seed_instance(InstanceStatus::Stopped)).await.unwrap();
        engine
            .storage
            .insert_port(fv_core::model::PortMapping {
                id: "port1".to_string(),
                instance_id: "i1".to_string(),
                provider_id: "p1".to_string(),
                host_port: 10000,
                guest_port: 22,
                protocol: fv_core::model::PortProtocol::Tcp,
                is_ssh: true,
                description: Some("ssh".to_string()),
                status: fv_core::model::PortStatus::Active,
            })
            .await
            .unwrap();

        run_delete_task(&engine, &task_for("i1", fv_core::model::TaskType::Delete)).await.unwrap();
        assert!(engine.storage.get_instance("i1").await.is_err());
        assert!(engine.storage.list_active_ports("p1").await.unwrap().is_empty());
    }
}
