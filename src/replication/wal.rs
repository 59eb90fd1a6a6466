// ABOUTME: Ensures an instance runs with wal_level = logical
// ABOUTME: Applies the setting, restarts only when needed and waits for the instance to come back

use anyhow::Result;
use tokio_postgres::Client;
use tracing::info;

use crate::config::InstanceDescriptor;
use crate::error::SetupError;
use crate::outcome::StepOutcome;
use crate::postgres::{connect, ping, show_setting, ConnectParams};
use crate::remote::UnitRestarter;
use crate::wait::{poll_until, PollPolicy};

pub const REQUIRED_WAL_LEVEL: &str = "logical";

pub fn needs_restart(current: &str) -> bool {
    !current.trim().eq_ignore_ascii_case(REQUIRED_WAL_LEVEL)
}

/// Waits until `SELECT 1` succeeds on a fresh connection.
pub async fn wait_until_live(params: &ConnectParams, policy: PollPolicy) -> Result<Client> {
    let client = poll_until(&format!("{} to accept queries", params.address()), policy, || async {
        let client = connect(params).await?;
        ping(&client).await?;
        Ok(Some(client))
    })
    .await?;
    Ok(client)
}

/// Returns the outcome and a connection that is valid after any restart.
pub async fn ensure_wal_level<R: UnitRestarter>(
    client: Client,
    params: &ConnectParams,
    instance: &InstanceDescriptor,
    restarter: &R,
    policy: PollPolicy,
) -> Result<(StepOutcome, Client)> {
    let current = show_setting(&client, "wal_level").await?;
    if !needs_restart(&current) {
        return Ok((
            StepOutcome::unchanged(format!("{} already has wal_level = logical", instance.role)),
            client,
        ));
    }

    info!(
        "{} has wal_level = {}; switching to logical",
        instance.role, current
    );
    client
        .batch_execute("ALTER SYSTEM SET wal_level = 'logical'")
        .await?;
    drop(client);

    restarter.restart(instance).await?;
    let client = wait_until_live(params, policy).await?;

    let applied = show_setting(&client, "wal_level").await?;
    if needs_restart(&applied) {
        return Err(SetupError::Verification(format!(
            "{} still reports wal_level = {} after restart",
            instance.address(),
            applied
        ))
        .into());
    }

    Ok((
        StepOutcome::changed(format!(
            "{}: wal_level {} -> logical (restarted {})",
            instance.role, current, instance.unit_name
        )),
        client,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_non_logical_levels_need_restart() {
        assert!(!needs_restart("logical"));
        assert!(!needs_restart("LOGICAL\n"));
        assert!(needs_restart("replica"));
        assert!(needs_restart("minimal"));
    }
}
