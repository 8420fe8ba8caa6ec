//! `fv` subcommands (spec §6 "Internal interfaces"): task submission and the
//! read-side queries a caller polls against while the daemon's task runner
//! and batch processor do the actual work in the background.

use clap::{Parser, Subcommand, ValueEnum};
use fv_core::error::CoreError;
use fv_core::model::{TaskStatus, TaskType};
use fv_storage::Storage;
use serde::Serialize;

#[derive(Parser)]
#[command(name = "fv", version, about = "fleetvisor control-plane CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the daemon: task runner loop, batch processor, transport sweeper.
    Serve,
    /// Submit an instance action task (spec §6 `InstanceAction`).
    Action {
        user_id: String,
        instance_id: String,
        #[arg(value_enum)]
        verb: ActionVerb,
    },
    /// Submit a password reset task (spec §6 `ResetInstancePassword`, step 1 of 2).
    ResetPassword { user_id: String, instance_id: String },
    /// Poll a submitted task by id.
    Task { task_id: String },
    /// Fetch an instance's current row.
    Instance { instance_id: String },
    /// `GetInstanceNewPassword` (spec §6): poll a reset-password task, returning
    /// the new password only once that specific task has completed.
    NewPassword { instance_id: String, task_id: String },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ActionVerb {
    Start,
    Stop,
    Restart,
    Reset,
    Delete,
}

impl From<ActionVerb> for TaskType {
    fn from(verb: ActionVerb) -> Self {
        match verb {
            ActionVerb::Start => TaskType::Start,
            ActionVerb::Stop => TaskType::Stop,
            ActionVerb::Restart => TaskType::Restart,
            ActionVerb::Reset => TaskType::Reset,
            ActionVerb::Delete => TaskType::Delete,
        }
    }
}

/// `GetInstanceNewPassword` (spec §6): only meaningful once the matching
/// `reset-password` task has completed; `instance.password` and
/// `task.completed_at` are the two halves of `(password, reset_unix_time)`.
#[derive(Serialize)]
struct NewPassword {
    password: Option<String>,
    reset_unix_time: Option<i64>,
}

pub async fn submit_action<S: Storage>(
    storage: &S,
    user_id: &str,
    instance_id: &str,
    verb: ActionVerb,
) -> Result<(), CoreError> {
    let task = fv_lifecycle::submit_task(
        storage,
        user_id,
        None,
        Some(instance_id),
        verb.into(),
        serde_json::json!({}),
        1800,
        matches!(verb, ActionVerb::Delete),
    )
    .await?;
    print_json(&task);
    Ok(())
}

pub async fn submit_reset_password<S: Storage>(storage: &S, user_id: &str, instance_id: &str) -> Result<(), CoreError> {
    let task = fv_lifecycle::submit_task(
        storage,
        user_id,
        None,
        Some(instance_id),
        TaskType::ResetPassword,
        serde_json::json!({}),
        300,
        false,
    )
    .await?;
    print_json(&task);
    Ok(())
}

pub async fn show_task<S: Storage>(storage: &S, task_id: &str) -> Result<(), CoreError> {
    let task = storage.get_task(task_id).await?;
    print_json(&task);
    Ok(())
}

pub async fn show_instance<S: Storage>(storage: &S, instance_id: &str) -> Result<(), CoreError> {
    let instance = storage.get_instance(instance_id).await?;
    print_json(&instance);
    Ok(())
}

/// Returns `(password, reset_unix_time)` only for the matching completed
/// `reset-password` task (spec §6); any other task id, type or status yields
/// `Conflict` so a caller can't be handed a stale or unrelated password.
pub async fn show_new_password<S: Storage>(storage: &S, instance_id: &str, task_id: &str) -> Result<(), CoreError> {
    let task = storage.get_task(task_id).await?;
    if task.instance_id.as_deref() != Some(instance_id) || task.task_type != TaskType::ResetPassword {
        return Err(CoreError::ValidationFailed {
            reason: format!("task {task_id} is not a reset-password task for instance {instance_id}"),
        });
    }
    if task.status != TaskStatus::Completed {
        return Err(CoreError::Conflict { reason: format!("task {task_id} has not completed (status={:?})", task.status) });
    }
    let instance = storage.get_instance(instance_id).await?;
    print_json(&NewPassword {
        password: instance.password,
        reset_unix_time: task.completed_at.map(|ts| ts.timestamp()),
    });
    Ok(())
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(rendered) => println!("{rendered}"),
        Err(err) => eprintln!("failed to render output as JSON: {err}"),
    }
}
