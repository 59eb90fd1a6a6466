// ABOUTME: Provisioning of two PostgreSQL instances for bidirectional logical replication
// ABOUTME: Runs each step in order and records whether it changed anything

pub mod account;
pub mod conf;
pub mod hba;
pub mod packages;
pub mod password;
pub mod platform;
pub mod reset;
pub mod service;

use anyhow::{Context, Result};
use secrecy::SecretString;
use std::net::IpAddr;
use tracing::{error, info};

use crate::config::{InstanceDescriptor, InstanceRole, Topology, ADMIN_ROLE, SERVICE_ACCOUNT};
use crate::error::SetupError;
use crate::host::{CommandSpec, Host};
use crate::outcome::{RunSummary, StepOutcome};
use crate::wait::{poll_until, PollPolicy};

pub use hba::Subnet;
pub use platform::{detect_platform, Layout, Platform};
pub use service::ServiceManager;

/// Everything the provisioner needs, already validated.
#[derive(Debug)]
pub struct InstallPlan {
    pub topology: Topology,
    pub site_ips: [Option<String>; 2],
    pub subnet: Subnet,
    pub password: SecretString,
    /// Only true when a non-default password was supplied.
    pub set_password: bool,
    /// User behind `sudo`, for tools that refuse to run as root.
    pub invoking_user: Option<String>,
}

impl InstallPlan {
    pub fn instances(&self, layout: &Layout) -> Vec<InstanceDescriptor> {
        InstanceRole::ALL
            .iter()
            .zip(&self.site_ips)
            .map(|(role, ip)| self.topology.instance(*role, ip.as_deref(), &layout.data_root))
            .collect()
    }

    /// Site IPs that the trusted subnet does not cover. Peers connecting from
    /// them would be rejected by pg_hba.conf.
    pub fn sites_outside_subnet(&self) -> Vec<&str> {
        self.site_ips
            .iter()
            .flatten()
            .map(String::as_str)
            .filter(|ip| {
                ip.parse::<IpAddr>()
                    .map_or(true, |addr| !addr.is_loopback() && !self.subnet.contains(addr))
            })
            .collect()
    }
}

pub async fn require_root<H: Host>(host: &H) -> Result<StepOutcome> {
    if host.is_dry_run() {
        return Ok(StepOutcome::unchanged("privilege check skipped in dry run"));
    }
    let output = host
        .run_checked(&CommandSpec::new("id").arg("-u").probe())
        .await?;
    match output.stdout.trim() {
        "0" => Ok(StepOutcome::unchanged("running as root")),
        uid => Err(SetupError::Environment(format!(
            "must be run as root (effective uid {}); try sudo",
            uid
        ))
        .into()),
    }
}

pub fn check_tools<H: Host>(host: &H, platform: &Platform) -> Result<StepOutcome> {
    let missing: Vec<&str> = platform
        .required_tools()
        .iter()
        .copied()
        .filter(|tool| !host.has_program(tool))
        .collect();
    if !missing.is_empty() {
        return Err(SetupError::Environment(format!(
            "required tools not found on PATH: {}",
            missing.join(", ")
        ))
        .into());
    }
    Ok(StepOutcome::unchanged(format!(
        "{} tools available",
        platform.required_tools().len()
    )))
}

pub async fn init_data_dirs<H: Host>(
    host: &H,
    instances: &[InstanceDescriptor],
    layout: &Layout,
) -> Result<StepOutcome> {
    for instance in instances {
        info!("Initializing {} data directory", instance.role);
        let initdb = CommandSpec::new(layout.bin("initdb"))
            .arg("-D")
            .arg(instance.data_dir.display().to_string())
            .args(["--auth=trust", "--encoding=UTF8"])
            .arg(format!("--username={}", ADMIN_ROLE))
            .as_user(SERVICE_ACCOUNT);
        host.run_checked(&initdb)
            .await
            .with_context(|| format!("initdb failed for the {} instance", instance.role))?;
    }
    Ok(StepOutcome::changed(format!(
        "initialized {} data directories with trust authentication",
        instances.len()
    )))
}

async fn write_owned<H: Host>(
    host: &H,
    path: &std::path::Path,
    contents: &str,
    layout: &Layout,
) -> Result<()> {
    host.write_file(path, contents, 0o600).await?;
    host.run_checked(
        &CommandSpec::new("chown").args([layout.owner.clone(), path.display().to_string()]),
    )
    .await?;
    Ok(())
}

pub async fn write_configs<H: Host>(
    host: &H,
    instances: &[InstanceDescriptor],
    layout: &Layout,
    version: u32,
) -> Result<StepOutcome> {
    for instance in instances {
        let contents =
            conf::render_postgresql_conf(instance, version, &layout.log_dir, &layout.socket_dir);
        write_owned(host, &instance.data_dir.join("postgresql.conf"), &contents, layout).await?;
    }
    Ok(StepOutcome::changed("wrote postgresql.conf for both instances"))
}

pub async fn write_hba<H: Host>(
    host: &H,
    instances: &[InstanceDescriptor],
    layout: &Layout,
    subnet: &Subnet,
) -> Result<StepOutcome> {
    let contents = hba::render_pg_hba(subnet);
    for instance in instances {
        write_owned(host, &instance.data_dir.join("pg_hba.conf"), &contents, layout).await?;
    }
    Ok(StepOutcome::changed(format!(
        "trusting localhost and {}",
        subnet
    )))
}

pub async fn start_instances<H: Host>(
    host: &H,
    services: &ServiceManager,
    instances: &[InstanceDescriptor],
    layout: &Layout,
    policy: PollPolicy,
) -> Result<StepOutcome> {
    for instance in instances {
        info!("Starting {} instance on port {}", instance.role, instance.port);
        let started = match services.start(host, instance, layout).await {
            Ok(()) if host.is_dry_run() => Ok(()),
            Ok(()) => {
                let probe = service::readiness_probe(instance, layout);
                poll_until(&format!("{} to accept connections", instance.role), policy, || async {
                    Ok(host.run(&probe).await?.success().then_some(()))
                })
                .await
                .map_err(anyhow::Error::from)
            }
            Err(e) => Err(e),
        };

        if let Err(e) = started {
            let tail = services.log_tail(host, instance, layout).await;
            error!("{} instance failed to start; last log lines:\n{}", instance.role, tail);
            return Err(e.context(format!(
                "{} instance failed to start. Last log lines:\n{}",
                instance.role,
                tail.trim_end()
            )));
        }
    }
    Ok(StepOutcome::changed(format!(
        "started {} instances",
        instances.len()
    )))
}

/// Runs the full provisioning sequence.
///
/// `confirm_reset` is asked before anything is deleted; returning `false`
/// aborts the run.
pub async fn provision<H, C>(host: &H, plan: &InstallPlan, confirm_reset: C) -> Result<RunSummary>
where
    H: Host,
    C: FnOnce(&str) -> Result<bool>,
{
    let mut summary = RunSummary::new("install");
    let version = plan.topology.version;

    summary.record("require_root", require_root(host).await?);

    let platform = detect_platform(host).await?;
    summary.record(
        "detect_platform",
        StepOutcome::unchanged(format!("detected {}", platform.name())),
    );
    summary.record("check_tools", check_tools(host, &platform)?);

    let layout = platform.layout(version);
    let instances = plan.instances(&layout);
    let services = ServiceManager::for_layout(&layout);

    summary.record(
        "install_packages",
        packages::install_packages(host, &platform, version, plan.invoking_user.as_deref())
            .await?,
    );
    summary.record(
        "ensure_service_account",
        account::ensure_service_account(host, &platform, &layout).await?,
    );

    let prompt = format!(
        "This deletes {} and {} and all data in them. Continue?",
        instances[0].data_dir.display(),
        instances[1].data_dir.display()
    );
    if !confirm_reset(&prompt)? {
        return Err(
            SetupError::Environment("reset not confirmed; nothing deleted".to_string()).into(),
        );
    }
    summary.record(
        "reset_layout",
        reset::reset_layout(host, &services, &instances, &layout).await?,
    );

    let units = services
        .install_units(host, &instances, &layout, version)
        .await?;
    summary.record(
        "install_units",
        if units.is_empty() {
            StepOutcome::unchanged("pg_ctl manages instances directly")
        } else {
            StepOutcome::changed(format!("wrote {} systemd units", units.len()))
        },
    );

    summary.record("init_data_dirs", init_data_dirs(host, &instances, &layout).await?);
    summary.record(
        "write_configs",
        write_configs(host, &instances, &layout, version).await?,
    );
    summary.record("write_hba", write_hba(host, &instances, &layout, &plan.subnet).await?);

    let timeouts = &plan.topology.timeouts;
    let start_policy = PollPolicy::from_secs(timeouts.start_secs, timeouts);
    summary.record(
        "start_instances",
        start_instances(host, &services, &instances, &layout, start_policy).await?,
    );

    if plan.set_password {
        for instance in &instances {
            let outcome = password::set_password(host, instance, &layout, &plan.password).await;
            summary.record(format!("set_password_{}", instance.role), outcome);
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_PASSWORD;
    use crate::host::fake::FakeHost;
    use crate::host::CommandOutput;
    use std::path::PathBuf;

    const DEBIAN_RELEASE: &str = "ID=debian\nVERSION_CODENAME=bookworm\n";

    fn plan() -> InstallPlan {
        let mut topology = Topology::default();
        topology.timeouts.start_secs = 0;
        topology.timeouts.poll_interval_ms = 1;
        InstallPlan {
            topology,
            site_ips: [Some("10.0.0.1".to_string()), Some("10.0.0.2".to_string())],
            subnet: "10.0.0.0/24".parse().unwrap(),
            password: SecretString::from(DEFAULT_PASSWORD.to_string()),
            set_password: false,
            invoking_user: None,
        }
    }

    fn debian_root_host() -> FakeHost {
        let host = FakeHost::new();
        host.files
            .lock()
            .unwrap()
            .insert(PathBuf::from(platform::OS_RELEASE), DEBIAN_RELEASE.to_string());
        host.respond("id -u", CommandOutput::ok("0\n"));
        host.add_path(packages::PGDG_LIST);
        host.add_path("/var/lib/postgresql");
        host
    }

    #[tokio::test]
    async fn test_non_root_is_rejected_before_any_change() {
        let host = debian_root_host();
        host.respond("id -u", CommandOutput::ok("1000\n"));

        let err = provision(&host, &plan(), |_| Ok(true)).await.unwrap_err();
        assert!(err.to_string().starts_with("Environment error: must be run as root"));
        assert_eq!(host.commands(), vec!["id -u"]);
    }

    #[tokio::test]
    async fn test_missing_tools_are_reported() {
        let host = debian_root_host();
        host.remove_program("journalctl");

        let err = provision(&host, &plan(), |_| Ok(true)).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Environment error: required tools not found on PATH: journalctl"
        );
    }

    #[tokio::test]
    async fn test_declined_reset_deletes_nothing() {
        let host = debian_root_host();

        let err = provision(&host, &plan(), |_| Ok(false)).await.unwrap_err();
        assert!(err.to_string().contains("reset not confirmed"));
        assert!(!host.ran("rm -rf"));
        assert!(!host.ran("systemctl stop"));
    }

    #[tokio::test]
    async fn test_full_sequence_on_debian() {
        let host = debian_root_host();

        let summary = provision(&host, &plan(), |_| Ok(true)).await.unwrap();

        let steps: Vec<&str> = summary.steps.iter().map(|s| s.step.as_str()).collect();
        assert_eq!(
            steps,
            vec![
                "require_root",
                "detect_platform",
                "check_tools",
                "install_packages",
                "ensure_service_account",
                "reset_layout",
                "install_units",
                "init_data_dirs",
                "write_configs",
                "write_hba",
                "start_instances",
            ]
        );
        assert!(!summary.outcome_of("install_packages").unwrap().is_changed());

        let conf = host
            .file("/var/lib/postgresql/15/second/postgresql.conf")
            .unwrap();
        assert!(conf.contains("port = 5433"));
        assert!(conf.contains("listen_addresses = 'localhost,10.0.0.2'"));
        let hba = host.file("/var/lib/postgresql/15/main/pg_hba.conf").unwrap();
        assert!(hba.contains("10.0.0.0/24"));

        let commands = host.commands();
        let initdb = commands
            .iter()
            .position(|c| c.contains("initdb -D /var/lib/postgresql/15/main --auth=trust"))
            .unwrap();
        let start = commands
            .iter()
            .position(|c| c == "systemctl enable --now postgresql@15-main.service")
            .unwrap();
        assert!(initdb < start);
        assert!(host.ran("/usr/lib/postgresql/15/bin/pg_isready -h 10.0.0.2 -p 5433 -t 2"));
    }

    #[tokio::test]
    async fn test_repeated_runs_produce_identical_files() {
        let first = debian_root_host();
        provision(&first, &plan(), |_| Ok(true)).await.unwrap();

        let second = debian_root_host();
        for (path, contents) in first.files.lock().unwrap().iter() {
            second
                .files
                .lock()
                .unwrap()
                .insert(path.clone(), contents.clone());
        }
        provision(&second, &plan(), |_| Ok(true)).await.unwrap();

        assert_eq!(*first.files.lock().unwrap(), *second.files.lock().unwrap());
        assert_eq!(first.commands(), second.commands());
    }

    #[tokio::test]
    async fn test_failed_start_includes_log_tail() {
        let host = debian_root_host();
        host.respond(
            "/usr/lib/postgresql/15/bin/pg_isready",
            CommandOutput::failed(2, "no response"),
        );
        host.respond(
            "tail -n 20 /var/log/postgresql/postgresql@15-main-startup.log",
            CommandOutput::ok("FATAL:  could not create lock file\n"),
        );
        host.respond(
            "journalctl -u postgresql@15-main.service",
            CommandOutput::ok("pg_ctl: could not start server\n"),
        );

        let err = provision(&host, &plan(), |_| Ok(true)).await.unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("main instance failed to start"));
        assert!(msg.contains("could not create lock file"));
        assert!(msg.contains("Timeout"));
        assert!(!host.ran("systemctl enable --now postgresql@15-second.service"));
    }

    #[tokio::test]
    async fn test_password_step_runs_only_for_non_default_password() {
        let host = debian_root_host();
        let mut plan = plan();
        plan.site_ips = [None, None];
        plan.set_password = true;
        plan.password = SecretString::from("changed".to_string());
        // Nothing listens in tests, so TCP fails and psql (faked) succeeds.
        plan.topology.main.port = Some(free_port());
        plan.topology.second.port = Some(free_port());

        let summary = provision(&host, &plan, |_| Ok(true)).await.unwrap();
        assert!(summary.outcome_of("set_password_main").unwrap().is_changed());
        assert!(summary.outcome_of("set_password_second").unwrap().is_changed());
    }

    #[test]
    fn test_sites_outside_subnet_are_reported() {
        let mut plan = plan();
        assert!(plan.sites_outside_subnet().is_empty());

        plan.site_ips = [Some("10.0.0.1".to_string()), Some("192.168.5.2".to_string())];
        assert_eq!(plan.sites_outside_subnet(), vec!["192.168.5.2"]);

        plan.site_ips = [Some("127.0.0.1".to_string()), None];
        assert!(plan.sites_outside_subnet().is_empty());
    }

    #[test]
    fn test_plan_debug_redacts_password() {
        let mut plan = plan();
        plan.password = SecretString::from("hunter2".to_string());
        let debug = format!("{:?}", plan);
        assert!(debug.contains("prefix: 24"));
        assert!(!debug.contains("hunter2"));
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }
}
