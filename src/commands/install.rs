// ABOUTME: Install command - provisions both PostgreSQL instances on this host
// ABOUTME: Validates positional arguments, asks before the destructive reset and runs the provisioner

use anyhow::Result;
use dialoguer::Confirm;
use secrecy::SecretString;
use std::io::IsTerminal;
use std::net::IpAddr;
use tracing::{info, warn};

use crate::config::{Topology, DEFAULT_PASSWORD};
use crate::error::SetupError;
use crate::host::SystemHost;
use crate::outcome::RunSummary;
use crate::provision::{provision, InstallPlan, Subnet};

#[derive(Debug, Clone, Default)]
pub struct InstallArgs {
    pub site1_ip1: Option<String>,
    pub site1_ip2: Option<String>,
    pub subnet: Option<String>,
    pub postgres_password: Option<String>,
    pub assume_yes: bool,
    pub dry_run: bool,
    pub start_timeout: Option<u64>,
}

fn validate_ip(value: Option<&str>, name: &str) -> Result<Option<String>, SetupError> {
    match value {
        None => Ok(None),
        Some(ip) => ip
            .parse::<IpAddr>()
            .map(|_| Some(ip.to_string()))
            .map_err(|_| {
                SetupError::Environment(format!("invalid {}: '{}' is not an IP address", name, ip))
            }),
    }
}

/// Validates arguments and merges them with the topology file.
pub fn build_plan(args: &InstallArgs, mut topology: Topology) -> Result<InstallPlan> {
    let site_ips = [
        validate_ip(args.site1_ip1.as_deref(), "site1_ip1")?,
        validate_ip(args.site1_ip2.as_deref(), "site1_ip2")?,
    ];
    let subnet: Subnet = topology.subnet_or_default(args.subnet.as_deref()).parse()?;

    let password = args
        .postgres_password
        .clone()
        .unwrap_or_else(|| DEFAULT_PASSWORD.to_string());
    let set_password = password != DEFAULT_PASSWORD;

    if let Some(secs) = args.start_timeout {
        topology.timeouts.start_secs = secs;
    }

    Ok(InstallPlan {
        topology,
        site_ips,
        subnet,
        password: SecretString::from(password),
        set_password,
        invoking_user: std::env::var("SUDO_USER").ok().filter(|u| u != "root"),
    })
}

fn confirm_reset(prompt: &str, assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    if !std::io::stdin().is_terminal() {
        return Err(SetupError::Environment(
            "refusing to delete data directories without confirmation; pass --yes".to_string(),
        )
        .into());
    }
    Ok(Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}

pub async fn install(args: InstallArgs, topology: Topology) -> Result<RunSummary> {
    let plan = build_plan(&args, topology)?;
    let host = SystemHost::new(args.dry_run);

    info!(
        "Provisioning PostgreSQL {} (trusted subnet {})",
        plan.topology.version, plan.subnet
    );
    for ip in plan.sites_outside_subnet() {
        warn!(
            "{} is outside the trusted subnet {}; replication from it will be rejected",
            ip, plan.subnet
        );
    }
    if args.dry_run {
        info!("Dry run: commands and file writes are printed, not executed");
    }

    let assume_yes = args.assume_yes || args.dry_run;
    let summary = provision(&host, &plan, |prompt| confirm_reset(prompt, assume_yes)).await?;

    info!("Both instances are running");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_do_not_set_password() {
        let plan = build_plan(&InstallArgs::default(), Topology::default()).unwrap();
        assert_eq!(plan.subnet.to_string(), "127.0.0.0/8");
        assert_eq!(plan.site_ips, [None, None]);
        assert!(!plan.set_password);
    }

    #[test]
    fn test_positional_arguments_are_applied() {
        let args = InstallArgs {
            site1_ip1: Some("10.0.0.1".to_string()),
            site1_ip2: Some("10.0.0.2".to_string()),
            subnet: Some("10.0.0.0/24".to_string()),
            postgres_password: Some("s3cret".to_string()),
            start_timeout: Some(120),
            ..InstallArgs::default()
        };
        let plan = build_plan(&args, Topology::default()).unwrap();
        assert_eq!(plan.site_ips[1].as_deref(), Some("10.0.0.2"));
        assert_eq!(plan.subnet.to_string(), "10.0.0.0/24");
        assert!(plan.set_password);
        assert_eq!(plan.topology.timeouts.start_secs, 120);
    }

    #[test]
    fn test_invalid_arguments_are_rejected() {
        let args = InstallArgs {
            site1_ip1: Some("not-an-ip".to_string()),
            ..InstallArgs::default()
        };
        let err = build_plan(&args, Topology::default()).unwrap_err();
        assert!(err.to_string().contains("'not-an-ip' is not an IP address"));

        let args = InstallArgs {
            subnet: Some("10.0.0.0/40".to_string()),
            ..InstallArgs::default()
        };
        assert!(build_plan(&args, Topology::default()).is_err());
    }

    #[test]
    fn test_assume_yes_skips_prompt() {
        assert!(confirm_reset("Continue?", true).unwrap());
    }
}
