// ABOUTME: Bidirectional replication smoke test across the two instances
// ABOUTME: Sets up both pairs, inserts tagged rows on each side and polls until both converge

use anyhow::{Context, Result};
use secrecy::SecretString;
use std::path::PathBuf;
use tokio_postgres::Client;
use tracing::{info, warn};

use crate::config::{InstanceDescriptor, InstanceRole, Timeouts};
use crate::error::SetupError;
use crate::outcome::{RunSummary, StepOutcome};
use crate::postgres::{connect, ping, server_version_num, ConnectParams};
use crate::remote::UnitRestarter;
use crate::replication::monitor::{
    converged, get_replication_lag, get_subscription_status, is_replication_caught_up,
    table_snapshot, TableSnapshot,
};
use crate::replication::pair::{establish_pair, supports_origin_filter, ReplicationPair};
use crate::replication::schema::{
    create_test_table, insert_row, insert_seed_rows, live_payload, reset_database, teardown,
    SEED_ROWS,
};
use crate::replication::subscription::{wait_for_sync, SubscriptionConnInfo};
use crate::replication::wal::ensure_wal_level;
use crate::wait::{poll_until, PollPolicy};

pub struct TestPlan {
    /// Instance A (main) and instance B (second).
    pub instances: [InstanceDescriptor; 2],
    pub user: String,
    pub password: Option<SecretString>,
    pub database: String,
    pub table: String,
    /// pgpass file the subscribers' servers read, instead of a password.
    pub passfile: Option<PathBuf>,
    pub timeouts: Timeouts,
}

impl TestPlan {
    fn params(&self, instance: &InstanceDescriptor) -> ConnectParams {
        ConnectParams::for_instance(instance, &self.user, self.password.clone())
    }

    fn conninfo_template(&self) -> SubscriptionConnInfo {
        SubscriptionConnInfo {
            host: String::new(),
            port: 0,
            dbname: self.database.clone(),
            user: self.user.clone(),
            passfile: self.passfile.clone(),
        }
    }

    fn policy(&self, secs: u64) -> PollPolicy {
        PollPolicy::from_secs(secs, &self.timeouts)
    }
}

async fn check_connectivity(
    instance: &InstanceDescriptor,
    params: &ConnectParams,
) -> Result<Client> {
    let client = connect(params).await.with_context(|| {
        format!(
            "{} instance at {} is unreachable",
            instance.role,
            instance.address()
        )
    })?;
    ping(&client).await?;
    Ok(client)
}

/// Fails when the subscription is missing or disabled on `target_db`.
async fn verify_subscription_enabled(target_db: &Client, name: &str) -> Result<()> {
    match get_subscription_status(target_db, name).await? {
        Some(stats) if stats.enabled => {
            if !stats.worker_running {
                warn!(
                    "Subscription {} is enabled but its apply worker is not running",
                    name
                );
            }
            Ok(())
        }
        Some(_) => {
            Err(SetupError::Verification(format!("subscription {} is disabled", name)).into())
        }
        None => {
            Err(SetupError::Verification(format!("subscription {} does not exist", name)).into())
        }
    }
}

/// Describes how far the slot backing `pair` trails its publisher.
async fn describe_slot_lag(source_db: &Client, pair: &ReplicationPair) -> Result<String> {
    // Subscriptions create their slot under their own name.
    let slot = &pair.subscription;
    if is_replication_caught_up(source_db, slot).await? {
        return Ok(format!("{} caught up", slot));
    }
    Ok(match get_replication_lag(source_db, slot).await? {
        Some(stats) => format!(
            "{} {} ({} bytes behind)",
            slot,
            if stats.active { "active" } else { "inactive" },
            stats
                .lag_bytes
                .map_or_else(|| "unknown".to_string(), |b| b.to_string())
        ),
        None => format!("{} missing", slot),
    })
}

/// Polls both sides until they hold the same `expected` rows.
pub async fn wait_for_convergence(
    main_db: &Client,
    second_db: &Client,
    table: &str,
    expected: i64,
    policy: PollPolicy,
) -> Result<TableSnapshot> {
    let waited = poll_until("both instances to converge", policy, || async {
        let main = table_snapshot(main_db, table).await?;
        let second = table_snapshot(second_db, table).await?;
        Ok(converged(&main, &second, expected).then_some(main))
    })
    .await;

    match waited {
        Ok(snapshot) => Ok(snapshot),
        Err(SetupError::Timeout(reason)) => {
            let main = table_snapshot(main_db, table).await?;
            let second = table_snapshot(second_db, table).await?;
            Err(SetupError::Verification(format!(
                "main has {}, second has {}, expected {} rows ({})",
                main, second, expected, reason
            ))
            .into())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn run_replication_test<R: UnitRestarter>(
    plan: &TestPlan,
    restarter: &R,
) -> Result<RunSummary> {
    let mut summary = RunSummary::new("test");
    let [main, second] = &plan.instances;
    let (db, table) = (plan.database.as_str(), plan.table.as_str());
    let main_params = plan.params(main);
    let second_params = plan.params(second);

    let main_admin = check_connectivity(main, &main_params).await?;
    let second_admin = check_connectivity(second, &second_params).await?;
    summary.record(
        "check_connectivity",
        StepOutcome::unchanged(format!(
            "{} and {} reachable",
            main.address(),
            second.address()
        )),
    );

    let restart_policy = plan.policy(plan.timeouts.restart_secs);
    let (outcome, main_admin) =
        ensure_wal_level(main_admin, &main_params, main, restarter, restart_policy).await?;
    summary.record("ensure_wal_level_main", outcome);
    let (outcome, second_admin) =
        ensure_wal_level(second_admin, &second_params, second, restarter, restart_policy).await?;
    summary.record("ensure_wal_level_second", outcome);

    let origin_filter = supports_origin_filter(&[
        server_version_num(&main_admin).await?,
        server_version_num(&second_admin).await?,
    ]);

    let removed = teardown(&main_admin, &main_params, db).await?
        + teardown(&second_admin, &second_params, db).await?;
    summary.record(
        "teardown",
        match removed {
            0 => StepOutcome::unchanged("no leftover replication objects"),
            n => StepOutcome::changed(format!("removed {} replication objects", n)),
        },
    );

    reset_database(&main_admin, db).await?;
    let main_db = connect(&main_params.with_dbname(db)).await?;
    create_test_table(&main_db, table, InstanceRole::Main.id_start()).await?;
    insert_seed_rows(&main_db, table, &main.address()).await?;
    summary.record(
        "prepare_source",
        StepOutcome::changed(format!(
            "recreated {}.{} on main with {} seed rows",
            db, table, SEED_ROWS
        )),
    );

    let sync_policy = plan.policy(plan.timeouts.sync_secs);
    let convergence_policy = plan.policy(plan.timeouts.convergence_secs);
    let conninfo = plan.conninfo_template();

    let forward = ReplicationPair::forward();
    if forward.reset_target {
        reset_database(&second_admin, db).await?;
    }
    let second_db = connect(&second_params.with_dbname(db)).await?;
    create_test_table(&second_db, table, InstanceRole::Second.id_start()).await?;
    establish_pair(&forward, &main_db, &second_db, main, &conninfo, table, origin_filter).await?;
    wait_for_sync(&second_db, &forward.subscription, sync_policy).await?;
    verify_subscription_enabled(&second_db, &forward.subscription).await?;
    summary.record(
        "establish_forward",
        StepOutcome::changed(format!("{} -> {}", forward.publication, forward.subscription)),
    );

    let seeded = wait_for_convergence(
        &main_db,
        &second_db,
        table,
        SEED_ROWS as i64,
        convergence_policy,
    )
    .await?;
    summary.record(
        "verify_seed_rows",
        StepOutcome::unchanged(format!("{} on both sides", seeded)),
    );

    let reverse = ReplicationPair::reverse();
    establish_pair(&reverse, &second_db, &main_db, second, &conninfo, table, origin_filter).await?;
    wait_for_sync(&main_db, &reverse.subscription, sync_policy).await?;
    verify_subscription_enabled(&main_db, &reverse.subscription).await?;
    summary.record(
        "establish_reverse",
        StepOutcome::changed(format!("{} -> {}", reverse.publication, reverse.subscription)),
    );

    let main_id = insert_row(&main_db, table, &live_payload(&main.address())).await?;
    let second_id = insert_row(&second_db, table, &live_payload(&second.address())).await?;
    info!("Inserted live rows {} (main) and {} (second)", main_id, second_id);
    summary.record(
        "insert_live_rows",
        StepOutcome::changed(format!("ids {} and {}", main_id, second_id)),
    );

    let expected = SEED_ROWS as i64 + 2;
    let final_snapshot =
        wait_for_convergence(&main_db, &second_db, table, expected, convergence_policy).await?;
    summary.record(
        "verify_convergence",
        StepOutcome::unchanged(format!("{} on both sides", final_snapshot)),
    );

    let lag = [
        describe_slot_lag(&main_db, &forward).await?,
        describe_slot_lag(&second_db, &reverse).await?,
    ];
    summary.record("report_slot_lag", StepOutcome::unchanged(lag.join("; ")));

    Ok(summary)
}
