//! Provider capability interface & adapters (spec §4.2, component C2).
//!
//! One [`ProviderAdapter`] implementation per hypervisor family. Every method
//! fails with a `fv_core::CoreError`; the execution-rule router in
//! [`execution`] decides, per call, whether an adapter should try its native
//! HTTPS API, its SSH/CLI path, or both in sequence.
//!
//! Grounded on `other_examples/.../riffcc-jetpack__src-provisioners-mod.rs`'s
//! `Provisioner` trait (`exists`/`ensure_exists`/`get_ip`/`destroy`), broadened
//! here to the full operation set spec §4.2 names.

pub mod adapters;
pub mod execution;
pub mod http_transport;

use std::collections::HashMap;

use async_trait::async_trait;
use fv_core::error::CoreError;
use fv_core::model::{ExecutionRule, ProviderType};
use serde::{Deserialize, Serialize};

/// Everything an adapter needs to create an instance (spec §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    pub image: String,
    pub image_url: Option<String>,
    /// CPU cores.
    pub cpu: u32,
    /// e.g. `"512m"`.
    pub memory: String,
    /// e.g. `"5g"`.
    pub disk: String,
    pub instance_type: String,
    /// `host:guest/proto` triples, e.g. `"8080:80/tcp"`.
    pub ports: Vec<String>,
    /// Free-form passthrough: `user_level`, `bandwidth_spec`, `network_type`,
    /// port-mapping method, `instance_id`, `provider_id`.
    pub metadata: HashMap<String, String>,
}

impl InstanceConfig {
    pub fn metadata_get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// `(percentage 0-100, message)` checkpoint reported by `create_instance_with_progress`.
pub type ProgressCallback<'a> = dyn FnMut(u8, &str) + Send + 'a;

/// A minimal view of a provider-side instance as reported by the adapter,
/// independent of any persisted `fv_core::model::Instance` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteInstance {
    pub id: String,
    pub name: String,
    pub status: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteImage {
    pub id: String,
    pub alias: String,
}

/// Connection parameters shared by every adapter regardless of transport.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub provider_id: String,
    pub provider_type: ProviderType,
    pub execution_rule: ExecutionRule,
    pub host: String,
    pub api_port: u16,
    pub ssh: fv_ssh::ConnectParams,
    pub api_token_id: Option<String>,
    pub api_token_secret: Option<String>,
    pub api_username: Option<String>,
    pub api_password: Option<String>,
    pub accept_invalid_certs: bool,
}

/// The provider capability interface (spec §4.2). Implementations are
/// expected to be cheap to construct and internally share the process-wide
/// `fv_ssh::SshPool` and `http_transport::TransportRegistry`.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn get_type(&self) -> ProviderType;
    fn get_name(&self) -> &str;
    fn get_version(&self) -> &str;
    fn get_supported_instance_types(&self) -> Vec<String>;

    async fn connect(&self, cfg: &NodeConfig) -> Result<(), CoreError>;
    async fn disconnect(&self, provider_id: &str) -> Result<(), CoreError>;
    async fn is_connected(&self, provider_id: &str) -> bool;
    async fn health_check(&self, provider_id: &str) -> Result<(), CoreError>;

    async fn list_instances(&self, provider_id: &str) -> Result<Vec<RemoteInstance>, CoreError>;
    async fn get_instance(&self, provider_id: &str, id: &str) -> Result<RemoteInstance, CoreError>;

    async fn create_instance(&self, provider_id: &str, cfg: &InstanceConfig) -> Result<RemoteInstance, CoreError>;

    /// Same as `create_instance`, invoking `progress` at the checkpoints named
    /// in spec §4.2 ("Progress protocol"). The default implementation simply
    /// reports start/end and delegates to `create_instance`, for adapters with
    /// no finer-grained checkpoints to report.
    async fn create_instance_with_progress(
        &self,
        provider_id: &str,
        cfg: &InstanceConfig,
        progress: &mut ProgressCallback<'_>,
    ) -> Result<RemoteInstance, CoreError> {
        progress(0, "starting create");
        let result = self.create_instance(provider_id, cfg).await;
        progress(100, "create finished");
        result
    }

    async fn start_instance(&self, provider_id: &str, id: &str) -> Result<(), CoreError>;
    async fn stop_instance(&self, provider_id: &str, id: &str) -> Result<(), CoreError>;
    async fn restart_instance(&self, provider_id: &str, id: &str) -> Result<(), CoreError>;
    async fn delete_instance(&self, provider_id: &str, id: &str) -> Result<(), CoreError>;

    async fn list_images(&self, provider_id: &str) -> Result<Vec<RemoteImage>, CoreError>;
    async fn pull_image(&self, provider_id: &str, url: &str) -> Result<RemoteImage, CoreError>;
    async fn delete_image(&self, provider_id: &str, id: &str) -> Result<(), CoreError>;

    async fn set_instance_password(&self, provider_id: &str, id: &str, password: &str) -> Result<(), CoreError>;

    async fn get_instance_ipv4(&self, provider_id: &str, name: &str) -> Result<Option<String>, CoreError>;
    async fn get_instance_ipv6(&self, provider_id: &str, name: &str) -> Result<Option<String>, CoreError>;
    async fn get_instance_public_ipv6(&self, provider_id: &str, name: &str) -> Result<Option<String>, CoreError>;

    async fn execute_ssh_command(&self, provider_id: &str, command: &str) -> Result<fv_ssh::CommandOutput, CoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_config_metadata_roundtrip() {
        let mut metadata = HashMap::new();
        metadata.insert("user_level".to_string(), "gold".to_string());
        let cfg = InstanceConfig {
            name: "box1".into(),
            image: "debian-12".into(),
            image_url: None,
            cpu: 2,
            memory: "512m".into(),
            disk: "5g".into(),
            instance_type: "container".into(),
            ports: vec!["8080:80/tcp".into()],
            metadata,
        };
        assert_eq!(cfg.metadata_get("user_level"), Some("gold"));
        assert_eq!(cfg.metadata_get("missing"), None);
    }
}
