// ABOUTME: Destructive reset of both instances' directories
// ABOUTME: Stops the servers, deletes data/log/socket directories and recreates them with fixed ownership

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::config::{InstanceDescriptor, SERVICE_ACCOUNT};
use crate::host::{CommandSpec, Host};
use crate::outcome::StepOutcome;
use crate::provision::platform::Layout;
use crate::provision::service::ServiceManager;

pub const DATA_DIR_MODE: &str = "700";
pub const LOG_DIR_MODE: &str = "755";
pub const SOCKET_DIR_MODE: &str = "775";

/// Every directory the reset recreates, with its mode.
pub fn managed_directories(
    instances: &[InstanceDescriptor],
    layout: &Layout,
) -> Vec<(PathBuf, &'static str)> {
    let mut dirs: Vec<(PathBuf, &'static str)> = instances
        .iter()
        .map(|instance| (instance.data_dir.clone(), DATA_DIR_MODE))
        .collect();
    dirs.push((layout.log_dir.clone(), LOG_DIR_MODE));
    dirs.push((layout.socket_dir.clone(), SOCKET_DIR_MODE));
    dirs
}

/// Not safe to interrupt: a partial run leaves no data directory behind.
pub async fn reset_layout<H: Host>(
    host: &H,
    services: &ServiceManager,
    instances: &[InstanceDescriptor],
    layout: &Layout,
) -> Result<StepOutcome> {
    for instance in instances {
        info!("Stopping {} instance", instance.role);
        services.stop(host, instance, layout).await;
    }
    if matches!(services, ServiceManager::Systemd { .. }) {
        // The distribution's own cluster would otherwise hold port 5432.
        let cluster = CommandSpec::new("systemctl").args(["stop", "postgresql.service"]);
        match host.run(&cluster).await {
            Ok(output) if !output.success() => {
                debug!("{}: {}", cluster, output.stderr.trim())
            }
            Ok(_) => {}
            Err(e) => debug!("{}: {:#}", cluster, e),
        }
    }

    let pkill = host
        .run(&CommandSpec::new("pkill").args(["-u", SERVICE_ACCOUNT, "-x", "postgres"]))
        .await?;
    // pkill exits 1 when nothing matched.
    if pkill.status.map_or(true, |code| code > 1) {
        warn!("pkill failed: {}", pkill.stderr.trim());
    }

    let dirs = managed_directories(instances, layout);
    let paths: Vec<String> = dirs.iter().map(|(p, _)| p.display().to_string()).collect();

    host.run_checked(&CommandSpec::new("rm").arg("-rf").args(paths.iter().cloned()))
        .await
        .context("Failed to delete instance directories")?;
    host.run_checked(&CommandSpec::new("mkdir").arg("-p").args(paths.iter().cloned()))
        .await
        .context("Failed to create instance directories")?;
    host.run_checked(
        &CommandSpec::new("chown")
            .args(["-R", layout.owner.as_str()])
            .args(paths.iter().cloned()),
    )
    .await?;
    for (path, mode) in &dirs {
        host.run_checked(&CommandSpec::new("chmod").arg(*mode).arg(path.display().to_string()))
            .await?;
    }

    Ok(StepOutcome::changed(format!(
        "recreated {} directories",
        dirs.len()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InstanceRole, Topology};
    use crate::host::fake::FakeHost;
    use crate::host::CommandOutput;
    use crate::provision::platform::Platform;

    fn setup() -> (Layout, Vec<InstanceDescriptor>) {
        let layout = Platform::Debian {
            id: "debian".to_string(),
        }
        .layout(15);
        let topology = Topology::default();
        let instances = InstanceRole::ALL
            .iter()
            .map(|role| topology.instance(*role, None, &layout.data_root))
            .collect();
        (layout, instances)
    }

    #[tokio::test]
    async fn test_reset_recreates_directories_with_modes() {
        let (layout, instances) = setup();
        let services = ServiceManager::for_layout(&layout);
        let host = FakeHost::new();
        host.respond("pkill", CommandOutput::failed(1, ""));

        let outcome = reset_layout(&host, &services, &instances, &layout)
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::changed("recreated 4 directories"));

        let commands = host.commands();
        let rm = commands.iter().position(|c| c.starts_with("rm -rf")).unwrap();
        let stop = commands
            .iter()
            .position(|c| c == "systemctl stop postgresql@15-main.service")
            .unwrap();
        assert!(stop < rm, "instances must be stopped before deletion");

        assert!(host.ran(
            "rm -rf /var/lib/postgresql/15/main /var/lib/postgresql/15/second /var/log/postgresql /var/run/postgresql"
        ));
        assert!(host.ran("chmod 700 /var/lib/postgresql/15/second"));
        assert!(host.ran("chmod 755 /var/log/postgresql"));
        assert!(host.ran("chmod 775 /var/run/postgresql"));
    }

    #[tokio::test]
    async fn test_macos_reset_chowns_to_staff_group() {
        let layout = Platform::MacOs {
            prefix: PathBuf::from("/usr/local"),
        }
        .layout(15);
        let topology = Topology::default();
        let instances: Vec<InstanceDescriptor> = InstanceRole::ALL
            .iter()
            .map(|role| topology.instance(*role, None, &layout.data_root))
            .collect();
        let services = ServiceManager::for_layout(&layout);
        let host = FakeHost::new();

        reset_layout(&host, &services, &instances, &layout)
            .await
            .unwrap();
        assert!(host.ran("chown -R postgres:staff /usr/local/var/postgresql@15/main"));
        assert!(!host.ran("systemctl"));
    }

    #[tokio::test]
    async fn test_failed_delete_is_fatal() {
        let (layout, instances) = setup();
        let services = ServiceManager::for_layout(&layout);
        let host = FakeHost::new();
        host.respond("rm -rf", CommandOutput::failed(1, "Device or resource busy"));

        let err = reset_layout(&host, &services, &instances, &layout)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Failed to delete instance directories");
        assert!(!host.ran("mkdir"));
    }
}
