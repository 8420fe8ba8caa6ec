//! Remote shell & file transfer (spec §4.1, component C1).
//!
//! A long-lived, provider-keyed SSH connection pool. Every public method fails
//! with one of `fv_core::CoreError`'s `NotConnected`/`AuthFailed`/`Timeout`/
//! `RemoteError`/`RemoteExitNonZero`-shaped variants and never interpolates a
//! credential into an error string, matching spec §4.1's failure contract.
//!
//! Grounded on `src/infra/shell.rs`'s blocking-`Command`-with-`anyhow::Context`
//! idiom, transplanted from a local `limactl shell` invocation onto a real
//! network SSH session via `ssh2`.

mod pool;
mod sftp;

pub use pool::{ConnectParams, SshPool, SshPoolConfig};
pub use sftp::{upload_and_run_script, upload_file};

use fv_core::error::CoreError;

/// Output of a completed remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Classify a non-zero exit as a `RemoteError` carrying only the first line
    /// of stderr (spec §4.1: `RemoteExitNonZero(code, stderr_head)`), so a
    /// verbose remote error never floods a log line or leaks more than needed.
    pub fn into_result(self) -> Result<CommandOutput, CoreError> {
        if self.success() {
            Ok(self)
        } else {
            let head = self.stderr.lines().next().unwrap_or("").to_string();
            Err(CoreError::RemoteError {
                kind: "exit_non_zero".to_string(),
                detail: format!("exit {}: {}", self.exit_code, head),
            })
        }
    }
}
