//! LXD/Incus adapter (spec §4.2). Both hypervisors share the same adapter
//! since `incus` is a drop-in CLI/API-compatible fork of `lxc`; only the verb
//! prefix differs, selected by `ProviderType` at construction.
//!
//! Network configuration is only safe on a **stopped** instance: the `proxy`
//! device LXD uses for port mapping refuses to attach to a running container.
//! Grounded on `src/vm/instance/net.rs`'s `shell::run_in_vm` usage pattern,
//! transplanted from a local `limactl shell` call onto the SSH pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fv_core::error::CoreError;
use fv_core::model::ProviderType;
use fv_ssh::{CommandOutput, ConnectParams, SshPool};

use crate::adapters::parse_size_to_lxd;
use crate::{InstanceConfig, NodeConfig, ProgressCallback, ProviderAdapter, RemoteImage, RemoteInstance};

pub struct LxdAdapter {
    provider_type: ProviderType,
    ssh: Arc<SshPool>,
    nodes: Mutex<HashMap<String, ConnectParams>>,
}

impl LxdAdapter {
    pub fn new(provider_type: ProviderType, ssh: Arc<SshPool>) -> Self {
        assert!(matches!(provider_type, ProviderType::Lxd | ProviderType::Incus));
        Self {
            provider_type,
            ssh,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    fn verb(&self) -> &'static str {
        match self.provider_type {
            ProviderType::Incus => "incus",
            _ => "lxc",
        }
    }

    fn params(&self, provider_id: &str) -> Result<ConnectParams, CoreError> {
        self.nodes
            .lock()
            .expect("lxd node table poisoned")
            .get(provider_id)
            .cloned()
            .ok_or_else(|| CoreError::NotConnected {
                provider_id: provider_id.to_string(),
            })
    }

    fn run(&self, params: &ConnectParams, args: &str) -> Result<CommandOutput, CoreError> {
        self.ssh.exec(params, &format!("{} {args}", self.verb()))?.into_result()
    }
}

#[async_trait]
impl ProviderAdapter for LxdAdapter {
    fn get_type(&self) -> ProviderType {
        self.provider_type
    }

    fn get_name(&self) -> &str {
        self.verb()
    }

    fn get_version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn get_supported_instance_types(&self) -> Vec<String> {
        vec!["container".to_string(), "virtual-machine".to_string()]
    }

    async fn connect(&self, cfg: &NodeConfig) -> Result<(), CoreError> {
        self.ssh.connect(&cfg.ssh)?;
        self.nodes
            .lock()
            .expect("lxd node table poisoned")
            .insert(cfg.provider_id.clone(), cfg.ssh.clone());
        Ok(())
    }

    async fn disconnect(&self, provider_id: &str) -> Result<(), CoreError> {
        self.ssh.disconnect(provider_id);
        self.nodes.lock().expect("lxd node table poisoned").remove(provider_id);
        Ok(())
    }

    async fn is_connected(&self, provider_id: &str) -> bool {
        self.ssh.is_connected(provider_id)
    }

    async fn health_check(&self, provider_id: &str) -> Result<(), CoreError> {
        let params = self.params(provider_id)?;
        self.run(&params, "version")?;
        Ok(())
    }

    async fn list_instances(&self, provider_id: &str) -> Result<Vec<RemoteInstance>, CoreError> {
        let params = self.params(provider_id)?;
        let stdout = self.ssh.exec_stdout(&params, &format!("{} list --format csv -c ns4,6", self.verb()))?;
        Ok(stdout
            .lines()
            .filter(|l| !l.is_empty())
            .filter_map(|line| {
                let mut cols = line.split(',');
                let name = cols.next()?.to_string();
                let status = cols.next().unwrap_or("UNKNOWN").to_string();
                let ipv4 = cols.next().filter(|s| !s.is_empty()).map(|s| {
                    s.split(' ').next().unwrap_or(s).to_string()
                });
                let ipv6 = cols.next().filter(|s| !s.is_empty()).map(|s| {
                    s.split(' ').next().unwrap_or(s).to_string()
                });
                Some(RemoteInstance {
                    id: name.clone(),
                    name,
                    status,
                    ipv4,
                    ipv6,
                })
            })
            .collect())
    }

    async fn get_instance(&self, provider_id: &str, id: &str) -> Result<RemoteInstance, CoreError> {
        self.list_instances(provider_id)
            .await?
            .into_iter()
            .find(|i| i.id == id)
            .ok_or_else(|| CoreError::RemoteError {
                kind: self.verb().to_string(),
                detail: format!("instance {id} not found"),
            })
    }

    async fn create_instance(&self, provider_id: &str, cfg: &InstanceConfig) -> Result<RemoteInstance, CoreError> {
        let params = self.params(provider_id)?;
        let memory = parse_size_to_lxd(&cfg.memory).ok_or_else(|| CoreError::ValidationFailed {
            reason: format!("unparseable memory spec {:?}", cfg.memory),
        })?;
        let image_ref = cfg.image_url.clone().unwrap_or_else(|| cfg.image.clone());
        self.run(
            &params,
            &format!(
                "launch {image_ref} {} -c limits.cpu={} -c limits.memory={memory}",
                cfg.name, cfg.cpu
            ),
        )?;
        Ok(RemoteInstance {
            id: cfg.name.clone(),
            name: cfg.name.clone(),
            status: "running".to_string(),
            ipv4: None,
            ipv6: None,
        })
    }

    async fn create_instance_with_progress(
        &self,
        provider_id: &str,
        cfg: &InstanceConfig,
        progress: &mut ProgressCallback<'_>,
    ) -> Result<RemoteInstance, CoreError> {
        progress(20, "pulling image if absent");
        let result = self.create_instance(provider_id, cfg).await;
        progress(65, "instance launched");
        result
    }

    async fn start_instance(&self, provider_id: &str, id: &str) -> Result<(), CoreError> {
        let params = self.params(provider_id)?;
        self.run(&params, &format!("start {id}"))?;
        Ok(())
    }

    async fn stop_instance(&self, provider_id: &str, id: &str) -> Result<(), CoreError> {
        let params = self.params(provider_id)?;
        self.run(&params, &format!("stop {id}"))?;
        Ok(())
    }

    async fn restart_instance(&self, provider_id: &str, id: &str) -> Result<(), CoreError> {
        let params = self.params(provider_id)?;
        self.run(&params, &format!("restart {id}"))?;
        Ok(())
    }

    async fn delete_instance(&self, provider_id: &str, id: &str) -> Result<(), CoreError> {
        let params = self.params(provider_id)?;
        self.run(&params, &format!("delete {id} --force"))?;
        Ok(())
    }

    async fn list_images(&self, provider_id: &str) -> Result<Vec<RemoteImage>, CoreError> {
        let params = self.params(provider_id)?;
        let stdout = self.ssh.exec_stdout(&params, &format!("{} image list --format csv -c lf", self.verb()))?;
        Ok(stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| {
                let alias = l.split(',').next().unwrap_or(l).to_string();
                RemoteImage {
                    id: alias.clone(),
                    alias,
                }
            })
            .collect())
    }

    async fn pull_image(&self, provider_id: &str, url: &str) -> Result<RemoteImage, CoreError> {
        let params = self.params(provider_id)?;
        self.run(&params, &format!("image copy {url} local:"))?;
        Ok(RemoteImage {
            id: url.to_string(),
            alias: url.to_string(),
        })
    }

    async fn delete_image(&self, provider_id: &str, id: &str) -> Result<(), CoreError> {
        let params = self.params(provider_id)?;
        self.run(&params, &format!("image delete {id}"))?;
        Ok(())
    }

    async fn set_instance_password(&self, provider_id: &str, id: &str, password: &str) -> Result<(), CoreError> {
        let params = self.params(provider_id)?;
        self.ssh
            .exec(&params, &format!("{} exec {id} -- bash -c 'echo root:{password} | chpasswd'", self.verb()))?
            .into_result()?;
        Ok(())
    }

    async fn get_instance_ipv4(&self, provider_id: &str, name: &str) -> Result<Option<String>, CoreError> {
        Ok(self.get_instance(provider_id, name).await?.ipv4)
    }

    async fn get_instance_ipv6(&self, provider_id: &str, name: &str) -> Result<Option<String>, CoreError> {
        Ok(self.get_instance(provider_id, name).await?.ipv6)
    }

    async fn get_instance_public_ipv6(&self, provider_id: &str, name: &str) -> Result<Option<String>, CoreError> {
        self.get_instance_ipv6(provider_id, name).await
    }

    async fn execute_ssh_command(&self, provider_id: &str, command: &str) -> Result<CommandOutput, CoreError> {
        let params = self.params(provider_id)?;
        self.ssh.exec(&params, command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incus_uses_incus_verb() {
        let adapter = LxdAdapter::new(ProviderType::Incus, Arc::new(SshPool::new(Default::default())));
        assert_eq!(adapter.verb(), "incus");
    }

    #[test]
    fn lxd_uses_lxc_verb() {
        let adapter = LxdAdapter::new(ProviderType::Lxd, Arc::new(SshPool::new(Default::default())));
        assert_eq!(adapter.verb(), "lxc");
    }

    #[tokio::test]
    async fn unconnected_provider_is_not_connected() {
        let adapter = LxdAdapter::new(ProviderType::Lxd, Arc::new(SshPool::new(Default::default())));
        let err = adapter.list_instances("p1").await.unwrap_err();
        assert!(matches!(err, CoreError::NotConnected { .. }));
    }
}
