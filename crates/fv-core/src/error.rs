use thiserror::Error;

/// Error taxonomy surfaced by the core (spec §7). Every public operation in
/// fleetvisor's library crates resolves to one of these variants at its boundary,
/// even when the underlying cause (an SSH failure, an HTTP status, a SQL error)
/// is richer internally.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Provider handle gone; caller may retry after reconnect.
    #[error("provider {provider_id} is not connected")]
    NotConnected { provider_id: String },

    /// Credentials or token rejected; do not retry automatically.
    #[error("authentication failed for provider {provider_id}")]
    AuthFailed { provider_id: String },

    /// Remote operation exceeded its timeout.
    #[error("{operation} timed out after {elapsed_secs}s")]
    Timeout { operation: String, elapsed_secs: u64 },

    /// No free VMID/IP/port/quota; user-visible with the offending dimension.
    #[error("capacity exhausted: {dimension}")]
    CapacityExhausted { dimension: String },

    /// Name exists, duplicate SSH-port mapping, or a task is already in flight.
    #[error("conflict: {reason}")]
    Conflict { reason: String },

    /// Spec rejected before any remote call.
    #[error("validation failed: {reason}")]
    ValidationFailed { reason: String },

    /// Hypervisor returned a non-retryable error.
    #[error("remote error ({kind}): {detail}")]
    RemoteError { kind: String, detail: String },

    /// Non-fatal; logged and surfaced in status but does not fail the owning task.
    #[error("monitoring degraded: {reason}")]
    MonitoringDegraded { reason: String },
}

impl CoreError {
    /// Build a `RemoteError` without ever interpolating the raw error text, which
    /// may embed a credential (password, token, private key passphrase) from a
    /// lower layer. Call sites pass a short, pre-sanitized `detail`.
    pub fn redacted(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        CoreError::RemoteError {
            kind: kind.into(),
            detail: detail.into(),
        }
    }

    /// True for errors that a caller should retry after a bounded backoff
    /// (transient network/timeout conditions), per spec §7 propagation policy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::NotConnected { .. } | CoreError::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(
            CoreError::NotConnected {
                provider_id: "p1".into()
            }
            .is_transient()
        );
        assert!(
            CoreError::Timeout {
                operation: "create".into(),
                elapsed_secs: 30
            }
            .is_transient()
        );
        assert!(
            !CoreError::AuthFailed {
                provider_id: "p1".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn redacted_never_echoes_caller_text_directly() {
        let err = CoreError::redacted("ssh", "connect refused");
        assert_eq!(err.to_string(), "remote error (ssh): connect refused");
    }
}
