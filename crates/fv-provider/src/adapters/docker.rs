//! Docker adapter (spec §4.2): "thin container adapter; ports are passed at
//! create time." No VMID/internal-IP bookkeeping, no cloudinit branch — just
//! `docker` CLI verbs over the SSH pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fv_core::error::CoreError;
use fv_core::model::ProviderType;
use fv_ssh::{CommandOutput, ConnectParams, SshPool};

use crate::{InstanceConfig, NodeConfig, ProviderAdapter, RemoteImage, RemoteInstance};

pub struct DockerAdapter {
    ssh: Arc<SshPool>,
    nodes: Mutex<HashMap<String, ConnectParams>>,
}

impl DockerAdapter {
    pub fn new(ssh: Arc<SshPool>) -> Self {
        Self {
            ssh,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    fn params(&self, provider_id: &str) -> Result<ConnectParams, CoreError> {
        self.nodes
            .lock()
            .expect("docker node table poisoned")
            .get(provider_id)
            .cloned()
            .ok_or_else(|| CoreError::NotConnected {
                provider_id: provider_id.to_string(),
            })
    }
}

#[async_trait]
impl ProviderAdapter for DockerAdapter {
    fn get_type(&self) -> ProviderType {
        ProviderType::Docker
    }

    fn get_name(&self) -> &str {
        "docker"
    }

    fn get_version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn get_supported_instance_types(&self) -> Vec<String> {
        vec!["container".to_string()]
    }

    async fn connect(&self, cfg: &NodeConfig) -> Result<(), CoreError> {
        self.ssh.connect(&cfg.ssh)?;
        self.nodes
            .lock()
            .expect("docker node table poisoned")
            .insert(cfg.provider_id.clone(), cfg.ssh.clone());
        Ok(())
    }

    async fn disconnect(&self, provider_id: &str) -> Result<(), CoreError> {
        self.ssh.disconnect(provider_id);
        self.nodes.lock().expect("docker node table poisoned").remove(provider_id);
        Ok(())
    }

    async fn is_connected(&self, provider_id: &str) -> bool {
        self.ssh.is_connected(provider_id)
    }

    async fn health_check(&self, provider_id: &str) -> Result<(), CoreError> {
        let params = self.params(provider_id)?;
        self.ssh.exec(&params, "docker version --format '{{.Server.Version}}'")?.into_result()?;
        Ok(())
    }

    async fn list_instances(&self, provider_id: &str) -> Result<Vec<RemoteInstance>, CoreError> {
        let params = self.params(provider_id)?;
        let stdout = self
            .ssh
            .exec_stdout(&params, "docker ps -a --format '{{.ID}}|{{.Names}}|{{.Status}}'")?;
        Ok(stdout
            .lines()
            .filter(|l| !l.is_empty())
            .filter_map(|line| {
                let mut cols = line.splitn(3, '|');
                Some(RemoteInstance {
                    id: cols.next()?.to_string(),
                    name: cols.next()?.to_string(),
                    status: cols.next().unwrap_or("unknown").to_string(),
                    ipv4: None,
                    ipv6: None,
                })
            })
            .collect())
    }

    async fn get_instance(&self, provider_id: &str, id: &str) -> Result<RemoteInstance, CoreError> {
        self.list_instances(provider_id)
            .await?
            .into_iter()
            .find(|i| i.id == id || i.name == id)
            .ok_or_else(|| CoreError::RemoteError {
                kind: "docker".to_string(),
                detail: format!("container {id} not found"),
            })
    }

    async fn create_instance(&self, provider_id: &str, cfg: &InstanceConfig) -> Result<RemoteInstance, CoreError> {
        let params = self.params(provider_id)?;
        let ports: String = cfg
            .ports
            .iter()
            .map(|p| {
                let spec = p.trim_end_matches("/tcp").trim_end_matches("/udp");
                format!("-p {spec}")
            })
            .collect::<Vec<_>>()
            .join(" ");
        let stdout = self.ssh.exec_stdout(
            &params,
            &format!(
                "docker run -d --name {} --memory {} --cpus {} {ports} {}",
                cfg.name, cfg.memory, cfg.cpu, cfg.image
            ),
        )?;
        let id = stdout.trim().to_string();
        Ok(RemoteInstance {
            id,
            name: cfg.name.clone(),
            status: "running".to_string(),
            ipv4: None,
            ipv6: None,
        })
    }

    async fn start_instance(&self, provider_id: &str, id: &str) -> Result<(), CoreError> {
        let params = self.params(provider_id)?;
        self.ssh.exec(&params, &format!("docker start {id}"))?.into_result()?;
        Ok(())
    }

    async fn stop_instance(&self, provider_id: &str, id: &str) -> Result<(), CoreError> {
        let params = self.params(provider_id)?;
        self.ssh.exec(&params, &format!("docker stop {id}"))?.into_result()?;
        Ok(())
    }

    async fn restart_instance(&self, provider_id: &str, id: &str) -> Result<(), CoreError> {
        let params = self.params(provider_id)?;
        self.ssh.exec(&params, &format!("docker restart {id}"))?.into_result()?;
        Ok(())
    }

    async fn delete_instance(&self, provider_id: &str, id: &str) -> Result<(), CoreError> {
        let params = self.params(provider_id)?;
        self.ssh.exec(&params, &format!("docker rm -f {id}"))?.into_result()?;
        Ok(())
    }

    async fn list_images(&self, provider_id: &str) -> Result<Vec<RemoteImage>, CoreError> {
        let params = self.params(provider_id)?;
        let stdout = self
            .ssh
            .exec_stdout(&params, "docker images --format '{{.ID}}|{{.Repository}}:{{.Tag}}'")?;
        Ok(stdout
            .lines()
            .filter(|l| !l.is_empty())
            .filter_map(|line| {
                let mut cols = line.splitn(2, '|');
                Some(RemoteImage {
                    id: cols.next()?.to_string(),
                    alias: cols.next()?.to_string(),
                })
            })
            .collect())
    }

    async fn pull_image(&self, provider_id: &str, url: &str) -> Result<RemoteImage, CoreError> {
        let params = self.params(provider_id)?;
        self.ssh.exec(&params, &format!("docker pull {url}"))?.into_result()?;
        Ok(RemoteImage {
            id: url.to_string(),
            alias: url.to_string(),
        })
    }

    async fn delete_image(&self, provider_id: &str, id: &str) -> Result<(), CoreError> {
        let params = self.params(provider_id)?;
        self.ssh.exec(&params, &format!("docker rmi {id}"))?.into_result()?;
        Ok(())
    }

    async fn set_instance_password(&self, provider_id: &str, id: &str, password: &str) -> Result<(), CoreError> {
        let params = self.params(provider_id)?;
        self.ssh
            .exec(
                &params,
                &format!("docker exec {id} bash -c 'echo root:{password} | chpasswd'"),
            )?
            .into_result()?;
        Ok(())
    }

    async fn get_instance_ipv4(&self, provider_id: &str, name: &str) -> Result<Option<String>, CoreError> {
        let params = self.params(provider_id)?;
        let stdout = self.ssh.exec_stdout(
            &params,
            &format!("docker inspect -f '{{{{range .NetworkSettings.Networks}}}}{{{{.IPAddress}}}}{{{{end}}}}' {name}"),
        )?;
        let ip = stdout.trim();
        Ok(if ip.is_empty() { None } else { Some(ip.to_string()) })
    }

    async fn get_instance_ipv6(&self, _provider_id: &str, _name: &str) -> Result<Option<String>, CoreError> {
        Ok(None)
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
    fn supported_instance_types_is_container_only() {
        let adapter = DockerAdapter::new(Arc::new(SshPool::new(Default::default())));
        assert_eq!(adapter.get_supported_instance_types(), vec!["container"]);
    }

    #[tokio::test]
    async fn unconnected_provider_is_not_connected() {
        let adapter = DockerAdapter::new(Arc::new(SshPool::new(Default::default())));
        let err = adapter.list_instances("p1").await.unwrap_err();
        assert!(matches!(err, CoreError::NotConnected { .. }));
    }
}
