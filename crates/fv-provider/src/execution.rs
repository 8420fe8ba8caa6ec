//! Execution-rule routing (spec §4.2 "Execution-rule routing").
//!
//! `api_only` and `ssh_only` are trivial dispatch; `auto` is the interesting
//! case — try the native HTTPS path first, and on any *non-auth* error, make
//! sure the SSH channel is healthy and retry over SSH. `AuthFailed` never
//! triggers a fallback: retrying a bad credential over a different transport
//! just produces a second, equally bad, credential failure.

use fv_core::error::CoreError;
use fv_core::model::ExecutionRule;
use tracing::warn;

/// Run `via_api` or `via_ssh` (or both, in that order) per `rule`.
///
/// Both closures are synchronous-looking but may themselves be `.await`ed by
/// the caller before being passed in — this helper only decides *which* to
/// run, it doesn't own the async machinery.
pub async fn route<T, Api, Ssh>(
    rule: ExecutionRule,
    provider_id: &str,
    operation: &str,
    via_api: Api,
    via_ssh: Ssh,
) -> Result<T, CoreError>
where
    Api: AsyncFnOnce() -> Result<T, CoreError>,
    Ssh: AsyncFnOnce() -> Result<T, CoreError>,
{
    match rule {
        ExecutionRule::ApiOnly => via_api().await,
        ExecutionRule::SshOnly => via_ssh().await,
        ExecutionRule::Auto => match via_api().await {
            Ok(v) => Ok(v),
            Err(CoreError::AuthFailed { provider_id }) => Err(CoreError::AuthFailed { provider_id }),
            Err(err) => {
                warn!(provider_id, operation, error = %err, "api path failed, falling back to ssh");
                via_ssh().await
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn api_only_never_calls_ssh() {
        let result: Result<i32, CoreError> = route(
            ExecutionRule::ApiOnly,
            "p1",
            "list_instances",
            async || Ok(1),
            async || panic!("ssh path must not run"),
        )
        .await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn auto_falls_back_to_ssh_on_non_auth_error() {
        let result: Result<i32, CoreError> = route(
            ExecutionRule::Auto,
            "p1",
            "list_instances",
            async || {
                Err(CoreError::RemoteError {
                    kind: "http".into(),
                    detail: "timeout".into(),
                })
            },
            async || Ok(2),
        )
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn auto_does_not_fall_back_on_auth_failure() {
        let result: Result<i32, CoreError> = route(
            ExecutionRule::Auto,
            "p1",
            "list_instances",
            async || {
                Err(CoreError::AuthFailed {
                    provider_id: "p1".into(),
                })
            },
            async || panic!("ssh path must not run after an auth failure"),
        )
        .await;
        assert!(matches!(result, Err(CoreError::AuthFailed { .. })));
    }
}
