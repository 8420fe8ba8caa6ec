use std::io::Write;

use fv_core::error::CoreError;
use fv_core::naming::remote_script_path;

use crate::pool::{ConnectParams, SshPool};
use crate::CommandOutput;

/// Stream a script to `/tmp/<uuid>.sh` over SFTP, chmod it executable, run it
/// with the pool's configured execute timeout, then remove it — a guaranteed
/// cleanup path even on execution failure, matching spec §4.1's "make
/// executable, execute with timeout, then removed in a defer-style guaranteed
/// cleanup path".
pub fn upload_and_run_script(
    pool: &SshPool,
    params: &ConnectParams,
    script: &str,
) -> Result<CommandOutput, CoreError> {
    let remote_path = remote_script_path();
    upload_file(pool, params, &remote_path, script.as_bytes(), 0o700)?;

    let result = pool.exec(params, &format!("bash {remote_path}"));

    // Best-effort cleanup regardless of whether the script itself succeeded;
    // a cleanup failure must never mask the original result.
    let _ = pool.exec(params, &format!("rm -f {remote_path}"));

    result
}

/// Upload `content` to `remote_path` over SFTP with an explicit octal mode
/// (spec §4.1).
pub fn upload_file(
    pool: &SshPool,
    params: &ConnectParams,
    remote_path: &str,
    content: &[u8],
    mode: i32,
) -> Result<(), CoreError> {
    pool.with_sftp(params, |sftp| {
        let mut remote_file = sftp
            .create(std::path::Path::new(remote_path))
            .map_err(|_| CoreError::redacted("sftp", "failed to create remote file"))?;
        remote_file
            .write_all(content)
            .map_err(|_| CoreError::redacted("sftp", "failed to write remote file"))?;
        sftp.setstat(
            std::path::Path::new(remote_path),
            ssh2::FileStat {
                size: None,
                uid: None,
                gid: None,
                perm: Some(mode as u32),
                atime: None,
                mtime: None,
            },
        )
        .ok();
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::SshPoolConfig;
    use std::time::Duration;

    #[test]
    fn upload_without_connection_is_not_connected() {
        let pool = SshPool::new(SshPoolConfig::default());
        let params = ConnectParams {
            provider_id: "p1".into(),
            host: "127.0.0.1".into(),
            port: 22,
            username: "root".into(),
            password: Some("x".into()),
            private_key_pem: None,
            connect_timeout: Duration::from_secs(1),
            execute_timeout: Duration::from_secs(1),
        };
        let err = upload_file(&pool, &params, "/tmp/x.sh", b"echo hi", 0o700).unwrap_err();
        assert!(matches!(err, CoreError::NotConnected { .. }));
    }
}
