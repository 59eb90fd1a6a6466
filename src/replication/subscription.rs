// ABOUTME: Subscription management on the target side of a replication pair
// ABOUTME: Builds credential-free connection strings and waits for initial table sync

use anyhow::{Context, Result};
use pg_escape::{quote_identifier, quote_literal};
use std::fmt;
use std::path::PathBuf;
use tokio_postgres::Client;
use tracing::{info, warn};

use crate::wait::{poll_until, PollPolicy};

/// Connection string a subscriber uses to reach its publisher.
///
/// Passwords are never embedded. Either the publisher trusts the
/// subscriber's address, or `passfile` names a pgpass file readable by the
/// subscriber's server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionConnInfo {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub passfile: Option<PathBuf>,
}

/// Quotes a libpq keyword value when it needs it.
fn conninfo_value(value: &str) -> String {
    if !value.is_empty() && !value.contains(|c: char| c.is_whitespace() || c == '\'' || c == '\\')
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\\', r"\\").replace('\'', r"\'"))
}

impl fmt::Display for SubscriptionConnInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "host={} port={} dbname={} user={}",
            conninfo_value(&self.host),
            self.port,
            conninfo_value(&self.dbname),
            conninfo_value(&self.user)
        )?;
        if let Some(passfile) = &self.passfile {
            write!(f, " passfile={}", conninfo_value(&passfile.display().to_string()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub copy_data: bool,
    /// Skip changes that were themselves replicated (PostgreSQL 16+).
    pub origin_none: bool,
}

pub fn create_subscription_sql(
    name: &str,
    conninfo: &SubscriptionConnInfo,
    publication: &str,
    options: SubscriptionOptions,
) -> String {
    let mut with = vec![format!("copy_data = {}", options.copy_data)];
    if options.origin_none {
        with.push("origin = none".to_string());
    }
    format!(
        "CREATE SUBSCRIPTION {} CONNECTION {} PUBLICATION {} WITH ({})",
        quote_identifier(name),
        quote_literal(&conninfo.to_string()),
        quote_identifier(publication),
        with.join(", ")
    )
}

/// Drops `name` if present and creates it again.
pub async fn create_subscription(
    client: &Client,
    name: &str,
    conninfo: &SubscriptionConnInfo,
    publication: &str,
    options: SubscriptionOptions,
) -> Result<()> {
    drop_subscription(client, name).await?;
    client
        .batch_execute(&create_subscription_sql(name, conninfo, publication, options))
        .await
        .with_context(|| {
            format!(
                "Failed to create subscription {} to {}:{}",
                name, conninfo.host, conninfo.port
            )
        })?;
    info!(
        "Created subscription {} to {}:{} (copy_data = {})",
        name, conninfo.host, conninfo.port, options.copy_data
    );
    Ok(())
}

/// Subscriptions in the connected database.
pub async fn list_subscriptions(client: &Client) -> Result<Vec<String>> {
    let rows = client
        .query(
            "SELECT s.subname FROM pg_subscription s \
             JOIN pg_database d ON d.oid = s.subdbid \
             WHERE d.datname = current_database() ORDER BY s.subname",
            &[],
        )
        .await
        .context("Failed to list subscriptions")?;
    Ok(rows.iter().map(|row| row.get(0)).collect())
}

/// Drops a subscription and its remote slot.
///
/// When the publisher cannot be reached the slot is detached first so the
/// local subscription can still be removed.
pub async fn drop_subscription(client: &Client, name: &str) -> Result<()> {
    let ident = quote_identifier(name);
    let drop = format!("DROP SUBSCRIPTION IF EXISTS {}", ident);
    if let Err(e) = client.batch_execute(&drop).await {
        warn!(
            "Dropping subscription {} failed ({}); detaching its slot and retrying",
            name, e
        );
        for statement in [
            format!("ALTER SUBSCRIPTION {} DISABLE", ident),
            format!("ALTER SUBSCRIPTION {} SET (slot_name = NONE)", ident),
        ] {
            client
                .batch_execute(&statement)
                .await
                .with_context(|| format!("Failed to detach slot of subscription {}", name))?;
        }
        client
            .batch_execute(&drop)
            .await
            .with_context(|| format!("Failed to drop subscription {}", name))?;
    }
    Ok(())
}

/// Waits until every table of the subscription finished its initial copy.
pub async fn wait_for_sync(client: &Client, name: &str, policy: PollPolicy) -> Result<()> {
    poll_until(&format!("initial sync of {}", name), policy, || async {
        let row = client
            .query_one(
                "SELECT count(*), count(*) FILTER (WHERE r.srsubstate NOT IN ('r', 's')) \
                 FROM pg_subscription_rel r \
                 JOIN pg_subscription s ON s.oid = r.srsubid \
                 WHERE s.subname = $1",
                &[&name],
            )
            .await?;
        let total: i64 = row.get(0);
        let pending: i64 = row.get(1);
        Ok((total > 0 && pending == 0).then_some(()))
    })
    .await?;
    info!("Subscription {} finished initial sync", name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conninfo(passfile: Option<&str>) -> SubscriptionConnInfo {
        SubscriptionConnInfo {
            host: "10.0.0.1".to_string(),
            port: 5432,
            dbname: "replication_test".to_string(),
            user: "postgres".to_string(),
            passfile: passfile.map(PathBuf::from),
        }
    }

    #[test]
    fn test_conninfo_has_no_password() {
        let rendered = conninfo(None).to_string();
        assert_eq!(
            rendered,
            "host=10.0.0.1 port=5432 dbname=replication_test user=postgres"
        );
        assert!(!rendered.contains("password"));
    }

    #[test]
    fn test_conninfo_references_passfile() {
        let rendered = conninfo(Some("/var/lib/postgresql/.pgpass")).to_string();
        assert!(rendered.ends_with(" passfile=/var/lib/postgresql/.pgpass"));

        let spaced = conninfo(Some("/etc/pg pass")).to_string();
        assert!(spaced.ends_with(r"passfile='/etc/pg pass'"));
    }

    #[test]
    fn test_create_subscription_sql() {
        let sql = create_subscription_sql(
            "sub_main_to_second",
            &conninfo(None),
            "pub_main_to_second",
            SubscriptionOptions {
                copy_data: true,
                origin_none: true,
            },
        );
        assert_eq!(
            sql,
            "CREATE SUBSCRIPTION sub_main_to_second \
             CONNECTION 'host=10.0.0.1 port=5432 dbname=replication_test user=postgres' \
             PUBLICATION pub_main_to_second WITH (copy_data = true, origin = none)"
        );
    }

    #[test]
    fn test_reverse_subscription_skips_copy() {
        let sql = create_subscription_sql(
            "sub_second_to_main",
            &conninfo(None),
            "pub_second_to_main",
            SubscriptionOptions {
                copy_data: false,
                origin_none: false,
            },
        );
        assert!(sql.ends_with("WITH (copy_data = false)"));
    }
}
