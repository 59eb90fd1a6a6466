// ABOUTME: Service management for the two instances
// ABOUTME: Renders systemd units on Debian and drives pg_ctl directly on macOS

use anyhow::Result;
use std::path::PathBuf;

use crate::config::{InstanceDescriptor, SERVICE_ACCOUNT};
use crate::host::{CommandSpec, Host};
use crate::provision::platform::Layout;

/// Seconds systemd and pg_ctl allow for start and stop.
pub const SERVICE_TIMEOUT_SECS: u32 = 300;

/// Lines of instance log attached to a failed start.
pub const LOG_TAIL_LINES: u32 = 20;

pub fn startup_log(instance: &InstanceDescriptor, layout: &Layout) -> PathBuf {
    layout
        .log_dir
        .join(format!("{}-startup.log", instance.unit_name.trim_end_matches(".service")))
}

pub fn render_unit(instance: &InstanceDescriptor, layout: &Layout, version: u32) -> String {
    let pg_ctl = layout.bin("pg_ctl");
    let data_dir = instance.data_dir.display();
    format!(
        "[Unit]
Description=PostgreSQL {version} database server ({role})
Documentation=man:postgres(1)
After=network.target

[Service]
Type=forking
User={account}
Group={account}
Environment=PGDATA={data_dir}
PIDFile={data_dir}/postmaster.pid
ExecStart={pg_ctl} start -D {data_dir} -l {startup_log} -w -t {timeout}
ExecStop={pg_ctl} stop -D {data_dir} -m fast -w -t {timeout}
ExecReload={pg_ctl} reload -D {data_dir}
TimeoutStartSec={timeout}
TimeoutStopSec={timeout}
Restart=on-failure

[Install]
WantedBy=multi-user.target
",
        version = version,
        role = instance.role,
        account = SERVICE_ACCOUNT,
        data_dir = data_dir,
        pg_ctl = pg_ctl,
        startup_log = startup_log(instance, layout).display(),
        timeout = SERVICE_TIMEOUT_SECS,
    )
}

/// How instances are started and stopped on this platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceManager {
    Systemd { unit_dir: PathBuf },
    PgCtl,
}

impl ServiceManager {
    pub fn for_layout(layout: &Layout) -> Self {
        match &layout.unit_dir {
            Some(unit_dir) => ServiceManager::Systemd {
                unit_dir: unit_dir.clone(),
            },
            None => ServiceManager::PgCtl,
        }
    }

    pub fn unit_path(&self, instance: &InstanceDescriptor) -> Option<PathBuf> {
        match self {
            ServiceManager::Systemd { unit_dir } => Some(unit_dir.join(&instance.unit_name)),
            ServiceManager::PgCtl => None,
        }
    }

    /// Writes one unit per instance and reloads systemd. No-op for pg_ctl.
    pub async fn install_units<H: Host>(
        &self,
        host: &H,
        instances: &[InstanceDescriptor],
        layout: &Layout,
        version: u32,
    ) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for instance in instances {
            if let Some(path) = self.unit_path(instance) {
                host.write_file(&path, &render_unit(instance, layout, version), 0o644)
                    .await?;
                written.push(path);
            }
        }
        if !written.is_empty() {
            host.run_checked(&CommandSpec::new("systemctl").arg("daemon-reload"))
                .await?;
        }
        Ok(written)
    }

    pub async fn start<H: Host>(
        &self,
        host: &H,
        instance: &InstanceDescriptor,
        layout: &Layout,
    ) -> Result<()> {
        match self {
            ServiceManager::Systemd { .. } => {
                let enable = CommandSpec::new("systemctl").args([
                    "enable",
                    "--now",
                    instance.unit_name.as_str(),
                ]);
                host.run_checked(&enable).await?;
            }
            ServiceManager::PgCtl => {
                host.run_checked(&pg_ctl_start(instance, layout)).await?;
            }
        }
        Ok(())
    }

    /// Stops an instance, ignoring failures (it may not exist yet).
    pub async fn stop<H: Host>(&self, host: &H, instance: &InstanceDescriptor, layout: &Layout) {
        let cmd = match self {
            ServiceManager::Systemd { .. } => {
                CommandSpec::new("systemctl").args(["stop", instance.unit_name.as_str()])
            }
            ServiceManager::PgCtl => CommandSpec::new(layout.bin("pg_ctl"))
                .args(["stop", "-D"])
                .arg(instance.data_dir.display().to_string())
                .args(["-m", "fast"])
                .as_user(SERVICE_ACCOUNT),
        };
        if let Ok(output) = host.run(&cmd).await {
            if !output.success() {
                tracing::debug!("{} stop: {}", instance.role, output.stderr.trim());
            }
        }
    }

    /// Last [`LOG_TAIL_LINES`] lines of diagnostics for an instance.
    ///
    /// The server writes its own errors to the startup log on every platform;
    /// under systemd the unit's journal follows it.
    pub async fn log_tail<H: Host>(
        &self,
        host: &H,
        instance: &InstanceDescriptor,
        layout: &Layout,
    ) -> String {
        let lines = LOG_TAIL_LINES.to_string();
        let log = startup_log(instance, layout).display().to_string();
        let mut sections = vec![(
            log.clone(),
            CommandSpec::new("tail")
                .args(["-n", lines.as_str()])
                .arg(log),
        )];
        if let ServiceManager::Systemd { .. } = self {
            sections.push((
                format!("journal of {}", instance.unit_name),
                CommandSpec::new("journalctl").args([
                    "-u",
                    instance.unit_name.as_str(),
                    "-n",
                    lines.as_str(),
                    "--no-pager",
                ]),
            ));
        }

        let mut out = String::new();
        for (title, cmd) in sections {
            let body = match host.run(&cmd.probe()).await {
                Ok(output) if output.success() => output.stdout,
                Ok(output) => output.stderr,
                Err(e) => format!("(no log available: {:#})", e),
            };
            out.push_str(&format!("==> {} <==\n{}", title, body));
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}

fn pg_ctl_start(instance: &InstanceDescriptor, layout: &Layout) -> CommandSpec {
    CommandSpec::new(layout.bin("pg_ctl"))
        .args(["start", "-D"])
        .arg(instance.data_dir.display().to_string())
        .arg("-l")
        .arg(startup_log(instance, layout).display().to_string())
        .args(["-w", "-t"])
        .arg(SERVICE_TIMEOUT_SECS.to_string())
        .as_user(SERVICE_ACCOUNT)
}

/// `pg_isready` probe against the instance's TCP address.
pub fn readiness_probe(instance: &InstanceDescriptor, layout: &Layout) -> CommandSpec {
    CommandSpec::new(layout.bin("pg_isready"))
        .args(["-h", instance.host.as_str()])
        .args(["-p".to_string(), instance.port.to_string()])
        .args(["-t", "2"])
        .probe()
}
