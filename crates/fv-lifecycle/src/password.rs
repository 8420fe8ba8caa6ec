//! Password reset (spec §6 "Reset password"): a random password is generated
//! locally, handed to the adapter's `set_instance_password`, and persisted
//! only after the remote call succeeds — the stored password is otherwise
//! stale and misleading.

use fv_core::error::CoreError;
use fv_core::model::Task;
use fv_storage::Storage;
use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::info;

use crate::actions::{instance_id, load};
use crate::{Engine, PostCreateHooks, ProviderDirectory};

const GENERATED_PASSWORD_LEN: usize = 16;

pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

pub async fn run_reset_password_task<S: Storage, D: ProviderDirectory, H: PostCreateHooks>(
    engine: &Engine<S, D, H>,
    task: &Task,
) -> Result<(), CoreError> {
    let instance = load(&*engine.storage, task).await?;
    let password = generate_password();

    let adapter = engine.directory.adapter(&instance.provider_id).await?;
    adapter
        .set_instance_password(&instance.provider_id, &instance.id, &password)
        .await?;

    let mut updated = instance.clone();
    updated.password = Some(password);
    engine.storage.upsert_instance(updated).await?;
    info!(instance_id = %instance_id(task)?, "password reset");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_password_has_the_expected_length_and_charset() {
        let pw = generate_password();
        assert_eq!(pw.len(), GENERATED_PASSWORD_LEN);
        assert!(pw.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn two_generated_passwords_differ() {
        assert_ne!(generate_password(), generate_password());
    }
}
