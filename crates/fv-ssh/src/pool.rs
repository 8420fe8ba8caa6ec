use std::collections::HashMap;
use std::io::Read;
use std::net::TcpStream;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use fv_core::error::CoreError;
use ssh2::Session;
use tracing::{debug, info, warn};

use crate::CommandOutput;

/// Per-provider SSH connection parameters (derived from the `Provider` row, but
/// kept separate from `fv-core::model::Provider` so this crate doesn't need to
/// depend on persisted-row shapes that don't concern it — e.g. quota fields).
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub provider_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key_pem: Option<String>,
    pub connect_timeout: Duration,
    pub execute_timeout: Duration,
}

struct PooledConnection {
    session: Session,
    _stream: TcpStream,
    created_at: Instant,
    last_access: Instant,
    params: ConnectParams,
}

#[derive(Debug, Clone)]
pub struct SshPoolConfig {
    pub idle_evict_after: Duration,
}

impl Default for SshPoolConfig {
    fn default() -> Self {
        Self {
            idle_evict_after: Duration::from_secs(30 * 60),
        }
    }
}

/// Long-lived pool of SSH connections keyed by `provider_id` (spec §4.1). A
/// connection is health-checked before every use; an unhealthy connection gets
/// exactly one reconnect attempt before the caller sees an error.
pub struct SshPool {
    config: SshPoolConfig,
    connections: Mutex<HashMap<String, PooledConnection>>,
}

impl SshPool {
    pub fn new(config: SshPoolConfig) -> Self {
        Self {
            config,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Run a command on the provider's host, reusing (and health-checking) a
    /// pooled connection, connecting fresh if none exists yet.
    pub fn exec(&self, params: &ConnectParams, command: &str) -> Result<CommandOutput, CoreError> {
        self.ensure_healthy(params)?;
        self.exec_on_existing(params, command)
    }

    /// Like `exec`, but returns only stdout on success (convenience for the
    /// many call sites that just want captured text).
    pub fn exec_stdout(&self, params: &ConnectParams, command: &str) -> Result<String, CoreError> {
        Ok(self.exec(params, command)?.into_result()?.stdout)
    }

    /// Run `f` against a freshly-opened SFTP channel on the provider's pooled
    /// connection, health-checking first like `exec`.
    pub fn with_sftp<F, T>(&self, params: &ConnectParams, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(ssh2::Sftp) -> Result<T, CoreError>,
    {
        self.ensure_healthy(params)?;
        let mut guard = self.connections.lock().expect("ssh pool mutex poisoned");
        let entry = guard
            .get_mut(&params.provider_id)
            .ok_or_else(|| CoreError::NotConnected {
                provider_id: params.provider_id.clone(),
            })?;
        entry.last_access = Instant::now();
        let sftp = entry
            .session
            .sftp()
            .map_err(|_| CoreError::redacted("sftp", "failed to open sftp channel"))?;
        f(sftp)
    }

    fn exec_on_existing(&self, params: &ConnectParams, command: &str) -> Result<CommandOutput, CoreError> {
        let mut guard = self.connections.lock().expect("ssh pool mutex poisoned");
        let entry = guard
            .get_mut(&params.provider_id)
            .ok_or_else(|| CoreError::NotConnected {
                provider_id: params.provider_id.clone(),
            })?;
        entry.last_access = Instant::now();
        run_command(&entry.session, command, params.execute_timeout)
    }

    /// Health-check (send a keepalive, expect a reply within 5s); on failure,
    /// attempt exactly one reconnect with the same credentials (spec §4.1).
    fn ensure_healthy(&self, params: &ConnectParams) -> Result<(), CoreError> {
        {
            let mut guard = self.connections.lock().expect("ssh pool mutex poisoned");
            if let Some(entry) = guard.get_mut(&params.provider_id) {
                if health_check(&entry.session) {
                    return Ok(());
                }
                warn!(provider_id = %params.provider_id, "ssh connection unhealthy, reconnecting");
                guard.remove(&params.provider_id);
            }
        }
        self.connect(params)
    }

    /// Establish a fresh connection and insert it into the pool, replacing any
    /// existing entry for this provider.
    pub fn connect(&self, params: &ConnectParams) -> Result<(), CoreError> {
        let addr = format!("{}:{}", params.host, params.port);
        let tcp = TcpStream::connect_timeout(
            &addr.parse().map_err(|_| CoreError::ValidationFailed {
                reason: format!("invalid SSH host:port {addr:?}"),
            })?,
            params.connect_timeout,
        )
        .map_err(|_| CoreError::NotConnected {
            provider_id: params.provider_id.clone(),
        })?;
        tcp.set_read_timeout(Some(params.execute_timeout)).ok();

        let mut session = Session::new().map_err(|_| CoreError::redacted("ssh", "session init failed"))?;
        session.set_tcp_stream(tcp.try_clone().map_err(|_| CoreError::redacted("ssh", "tcp clone failed"))?);
        session
            .handshake()
            .map_err(|_| CoreError::redacted("ssh", "handshake failed"))?;

        authenticate(&mut session, params)?;

        info!(provider_id = %params.provider_id, host = %params.host, "ssh connected");
        let mut guard = self.connections.lock().expect("ssh pool mutex poisoned");
        guard.insert(
            params.provider_id.clone(),
            PooledConnection {
                session,
                _stream: tcp,
                created_at: Instant::now(),
                last_access: Instant::now(),
                params: params.clone(),
            },
        );
        Ok(())
    }

    pub fn disconnect(&self, provider_id: &str) {
        let mut guard = self.connections.lock().expect("ssh pool mutex poisoned");
        guard.remove(provider_id);
    }

    pub fn is_connected(&self, provider_id: &str) -> bool {
        let guard = self.connections.lock().expect("ssh pool mutex poisoned");
        guard.contains_key(provider_id)
    }

    /// Number of pooled connections right now (spec §10.5's
    /// `ssh_active_connections` gauge).
    pub fn active_connections(&self) -> usize {
        self.connections.lock().expect("ssh pool mutex poisoned").len()
    }

    /// Evict connections idle longer than `idle_evict_after` (spec §4.1
    /// background sweeper). Intended to run on a periodic tick from the
    /// daemon's root context.
    pub fn sweep_idle(&self) {
        let mut guard = self.connections.lock().expect("ssh pool mutex poisoned");
        let cutoff = self.config.idle_evict_after;
        let before = guard.len();
        guard.retain(|provider_id, entry| {
            let idle = entry.last_access.elapsed() < cutoff;
            if !idle {
                debug!(provider_id, age_secs = entry.created_at.elapsed().as_secs(), "evicting idle ssh connection");
            }
            idle
        });
        if guard.len() != before {
            info!(evicted = before - guard.len(), "ssh pool sweep complete");
        }
    }

    pub(crate) fn params_for(&self, provider_id: &str) -> Option<ConnectParams> {
        let guard = self.connections.lock().expect("ssh pool mutex poisoned");
        guard.get(provider_id).map(|e| e.params.clone())
    }
}

/// Keepalive health check: any successful low-cost round trip counts.
fn health_check(session: &Session) -> bool {
    session.keepalive_send().is_ok()
}

fn authenticate(session: &mut Session, params: &ConnectParams) -> Result<(), CoreError> {
    if let Some(key_pem) = &params.private_key_pem {
        // ssh2 requires a filesystem path for key material; stage it in a
        // process-private temp file that is removed as soon as auth returns.
        use std::io::Write;
        let mut tmp = tempfile::NamedTempFile::new()
            .map_err(|_| CoreError::redacted("ssh", "failed to stage private key"))?;
        tmp.write_all(key_pem.as_bytes())
            .map_err(|_| CoreError::redacted("ssh", "failed to stage private key"))?;
        session
            .userauth_pubkey_file(&params.username, None, tmp.path(), None)
            .map_err(|_| CoreError::AuthFailed {
                provider_id: params.provider_id.clone(),
            })?;
    } else if let Some(password) = &params.password {
        session
            .userauth_password(&params.username, password)
            .map_err(|_| CoreError::AuthFailed {
                provider_id: params.provider_id.clone(),
            })?;
    } else {
        return Err(CoreError::ValidationFailed {
            reason: "no SSH credentials configured".to_string(),
        });
    }
    if !session.authenticated() {
        return Err(CoreError::AuthFailed {
            provider_id: params.provider_id.clone(),
        });
    }
    Ok(())
}

fn run_command(session: &Session, command: &str, timeout: Duration) -> Result<CommandOutput, CoreError> {
    let mut channel = session
        .channel_session()
        .map_err(|_| CoreError::redacted("ssh", "failed to open channel"))?;
    channel
        .exec(command)
        .map_err(|_| CoreError::redacted("ssh", "failed to exec command"))?;

    let mut stdout = String::new();
    let mut stderr = String::new();
    channel
        .read_to_string(&mut stdout)
        .map_err(|_| CoreError::Timeout {
            operation: "ssh_exec".to_string(),
            elapsed_secs: timeout.as_secs(),
        })?;
    channel.stderr().read_to_string(&mut stderr).ok();
    channel.wait_close().ok();

    let exit_code = channel.exit_status().unwrap_or(-1);
    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ConnectParams {
        ConnectParams {
            provider_id: "p1".into(),
            host: "127.0.0.1".into(),
            port: 22,
            username: "root".into(),
            password: Some("x".into()),
            private_key_pem: None,
            connect_timeout: Duration::from_secs(1),
            execute_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn exec_without_connection_is_not_connected() {
        let pool = SshPool::new(SshPoolConfig::default());
        let err = pool.exec_on_existing(&params(), "echo hi").unwrap_err();
        assert!(matches!(err, CoreError::NotConnected { .. }));
    }

    #[test]
    fn is_connected_reflects_pool_state() {
        let pool = SshPool::new(SshPoolConfig::default());
        assert!(!pool.is_connected("p1"));
    }

    #[test]
    fn active_connections_is_zero_for_a_fresh_pool() {
        let pool = SshPool::new(SshPoolConfig::default());
        assert_eq!(pool.active_connections(), 0);
    }

    #[test]
    fn sweep_idle_is_a_noop_on_empty_pool() {
        let pool = SshPool::new(SshPoolConfig::default());
        pool.sweep_idle();
        assert!(!pool.is_connected("p1"));
    }
}
