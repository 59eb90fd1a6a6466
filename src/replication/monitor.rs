// ABOUTME: Replication progress and convergence checks
// ABOUTME: Table snapshots for comparing both sides, subscription status and slot lag

use anyhow::{Context, Result};
use pg_escape::quote_identifier;
use serde::Serialize;
use std::fmt;
use tokio_postgres::Client;

/// Aggregate view of the test table on one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSnapshot {
    pub count: i64,
    pub max_data: Option<String>,
    /// md5 over all payloads ordered by id.
    pub digest: Option<String>,
}

impl fmt::Display for TableSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "count={} max={}",
            self.count,
            self.max_data.as_deref().unwrap_or("NULL")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionStats {
    pub name: String,
    pub enabled: bool,
    pub worker_running: bool,
    pub received_lsn: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReplicationStats {
    pub slot_name: String,
    pub active: bool,
    /// Bytes of WAL the subscriber has not confirmed yet.
    pub lag_bytes: Option<i64>,
}

pub fn snapshot_sql(table: &str) -> String {
    format!(
        "SELECT count(*), max(data), md5(string_agg(data, E'\\n' ORDER BY id)) FROM {}",
        quote_identifier(table)
    )
}

pub async fn table_snapshot(client: &Client, table: &str) -> Result<TableSnapshot> {
    let row = client
        .query_one(&snapshot_sql(table), &[])
        .await
        .with_context(|| format!("Failed to read {}", table))?;
    Ok(TableSnapshot {
        count: row.get(0),
        max_data: row.get(1),
        digest: row.get(2),
    })
}

pub async fn get_subscription_status(
    client: &Client,
    name: &str,
) -> Result<Option<SubscriptionStats>> {
    let row = client
        .query_opt(
            "SELECT s.subname, s.subenabled, st.pid IS NOT NULL, st.received_lsn::text \
             FROM pg_subscription s \
             LEFT JOIN pg_stat_subscription st ON st.subid = s.oid AND st.relid IS NULL \
             WHERE s.subname = $1",
            &[&name],
        )
        .await
        .with_context(|| format!("Failed to read status of subscription {}", name))?;

    Ok(row.map(|row| SubscriptionStats {
        name: row.get(0),
        enabled: row.get(1),
        worker_running: row.get(2),
        received_lsn: row.get(3),
    }))
}

/// Lag of the slot backing a subscription, read on the publisher.
pub async fn get_replication_lag(
    client: &Client,
    slot_name: &str,
) -> Result<Option<SourceReplicationStats>> {
    let row = client
        .query_opt(
            "SELECT slot_name::text, active, \
                    pg_wal_lsn_diff(pg_current_wal_lsn(), confirmed_flush_lsn)::bigint \
             FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot_name],
        )
        .await
        .with_context(|| format!("Failed to read replication slot {}", slot_name))?;

    Ok(row.map(|row| SourceReplicationStats {
        slot_name: row.get(0),
        active: row.get(1),
        lag_bytes: row.get(2),
    }))
}

pub async fn is_replication_caught_up(client: &Client, slot_name: &str) -> Result<bool> {
    Ok(matches!(
        get_replication_lag(client, slot_name).await?,
        Some(SourceReplicationStats {
            active: true,
            lag_bytes: Some(lag),
            ..
        }) if lag <= 0
    ))
}

/// Both sides hold the same rows and the expected number of them.
pub fn converged(a: &TableSnapshot, b: &TableSnapshot, expected_count: i64) -> bool {
    a == b && a.count == expected_count
}
