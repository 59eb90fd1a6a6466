// ABOUTME: Test command - verifies bidirectional replication between the two instances
// ABOUTME: Builds the test plan from the topology and restarts units over SSH when needed

use anyhow::Result;
use secrecy::SecretString;
use std::path::PathBuf;
use tracing::info;

use crate::config::{InstanceRole, Topology, ADMIN_ROLE};
use crate::host::SystemHost;
use crate::outcome::RunSummary;
use crate::remote::SshClient;
use crate::replication::{run_replication_test, TestPlan};

#[derive(Debug, Clone, Default)]
pub struct TestArgs {
    pub site1_ip1: Option<String>,
    pub site1_ip2: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub ssh_user: Option<String>,
    pub passfile: Option<PathBuf>,
    pub restart_timeout: Option<u64>,
    pub convergence_timeout: Option<u64>,
}

pub fn build_plan(args: &TestArgs, mut topology: Topology) -> TestPlan {
    if let Some(secs) = args.restart_timeout {
        topology.timeouts.restart_secs = secs;
    }
    if let Some(secs) = args.convergence_timeout {
        topology.timeouts.convergence_secs = secs;
    }

    let data_root = PathBuf::from(format!("/var/lib/postgresql/{}", topology.version));
    let instances = [
        topology.instance(InstanceRole::Main, args.site1_ip1.as_deref(), &data_root),
        topology.instance(InstanceRole::Second, args.site1_ip2.as_deref(), &data_root),
    ];

    TestPlan {
        instances,
        user: args.user.clone().unwrap_or_else(|| ADMIN_ROLE.to_string()),
        password: args.password.clone().map(SecretString::from),
        database: topology.database.clone(),
        table: topology.table.clone(),
        passfile: args.passfile.clone(),
        timeouts: topology.timeouts,
    }
}

pub async fn test_replication(args: TestArgs, topology: Topology) -> Result<RunSummary> {
    let plan = build_plan(&args, topology);
    let [main, second] = &plan.instances;
    info!(
        "Testing bidirectional replication between {} and {}",
        main.address(),
        second.address()
    );

    let host = SystemHost::new(false);
    let restarter = SshClient::new(&host, args.ssh_user.clone());
    let summary = run_replication_test(&plan, &restarter).await?;

    info!("Bidirectional replication verified");
    Ok(summary)
}
