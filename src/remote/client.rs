// ABOUTME: SSH client for restarting PostgreSQL service units on the instance's host
// ABOUTME: Runs systemctl directly when the instance is on this machine

use anyhow::{Context, Result};
use std::net::IpAddr;
use tracing::info;

use crate::config::InstanceDescriptor;
use crate::host::{CommandSpec, Host};

/// Restarts the service behind an instance.
#[allow(async_fn_in_trait)]
pub trait UnitRestarter {
    async fn restart(&self, instance: &InstanceDescriptor) -> Result<()>;
}

pub fn is_local_host(host: &str) -> bool {
    match host.parse::<IpAddr>() {
        Ok(addr) => addr.is_loopback(),
        Err(_) => host == "localhost",
    }
}

pub struct SshClient<'a, H> {
    host: &'a H,
    ssh_user: Option<String>,
    connect_timeout_secs: u32,
}

impl<'a, H: Host> SshClient<'a, H> {
    pub fn new(host: &'a H, ssh_user: Option<String>) -> Self {
        Self {
            host,
            ssh_user,
            connect_timeout_secs: 10,
        }
    }

    pub fn restart_command(&self, instance: &InstanceDescriptor) -> CommandSpec {
        let systemctl = ["sudo", "-n", "systemctl", "restart", instance.unit_name.as_str()];
        if is_local_host(&instance.host) {
            return CommandSpec::new(systemctl[0]).args(systemctl[1..].iter().copied());
        }

        let destination = match &self.ssh_user {
            Some(user) => format!("{}@{}", user, instance.host),
            None => instance.host.clone(),
        };
        CommandSpec::new("ssh")
            .args(["-o", "BatchMode=yes", "-o"])
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs))
            .arg(destination)
            .args(systemctl)
    }
}

impl<H: Host> UnitRestarter for SshClient<'_, H> {
    async fn restart(&self, instance: &InstanceDescriptor) -> Result<()> {
        let cmd = self.restart_command(instance);
        info!("Restarting {} on {}", instance.unit_name, instance.host);
        self.host
            .run_checked(&cmd)
            .await
            .with_context(|| {
                format!(
                    "Failed to restart {} on {}",
                    instance.unit_name, instance.host
                )
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InstanceRole, Topology};
    use crate::host::fake::FakeHost;
    use crate::host::CommandOutput;
    use std::path::Path;

    fn instance(role: InstanceRole, host: &str) -> InstanceDescriptor {
        Topology::default().instance(role, Some(host), Path::new("/var/lib/postgresql/15"))
    }

    #[test]
    fn test_local_hosts() {
        assert!(is_local_host("127.0.0.1"));
        assert!(is_local_host("::1"));
        assert!(is_local_host("localhost"));
        assert!(!is_local_host("10.0.0.2"));
        assert!(!is_local_host("db.example.com"));
    }

    #[test]
    fn test_remote_restart_uses_role_unit() {
        let host = FakeHost::new();
        let client = SshClient::new(&host, Some("admin".to_string()));
        let cmd = client.restart_command(&instance(InstanceRole::Second, "10.0.0.2"));
        assert_eq!(
            cmd.to_string(),
            "ssh -o BatchMode=yes -o ConnectTimeout=10 admin@10.0.0.2 sudo -n systemctl restart postgresql@15-second.service"
        );
    }

    #[test]
    fn test_local_restart_skips_ssh() {
        let host = FakeHost::new();
        let client = SshClient::new(&host, None);
        let cmd = client.restart_command(&instance(InstanceRole::Main, "127.0.0.1"));
        assert_eq!(
            cmd.to_string(),
            "sudo -n systemctl restart postgresql@15-main.service"
        );
    }

    #[tokio::test]
    async fn test_failed_restart_is_an_error() {
        let host = FakeHost::new();
        host.respond("ssh", CommandOutput::failed(255, "Connection refused"));
        let client = SshClient::new(&host, None);

        let err = client
            .restart(&instance(InstanceRole::Main, "10.0.0.1"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to restart postgresql@15-main.service on 10.0.0.1"
        );
    }
}
