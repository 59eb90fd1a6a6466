// ABOUTME: Test database and table lifecycle on each instance
// ABOUTME: Clears leftover replication objects, recreates the database and inserts tagged rows

use anyhow::{Context, Result};
use pg_escape::{quote_identifier, quote_literal};
use tokio_postgres::Client;
use tracing::{debug, info};

use crate::postgres::{connect, database_exists, ConnectParams};
use crate::replication::publication::{drop_publication, list_publications};
use crate::replication::subscription::{drop_subscription, list_subscriptions};

pub const SEED_ROWS: usize = 3;

pub fn seed_payloads(origin: &str) -> Vec<String> {
    (1..=SEED_ROWS)
        .map(|n| format!("Test data {} from {}", n, origin))
        .collect()
}

pub fn live_payload(origin: &str) -> String {
    format!("Live data from {}", origin)
}

/// DDL for the test table. Ids step by two from `id_start` so each side
/// owns one parity.
pub fn create_table_sql(table: &str, id_start: i64) -> String {
    let seq = format!("{}_id_seq", table);
    format!(
        "CREATE SEQUENCE {seq} INCREMENT BY 2 START WITH {start}; \
         CREATE TABLE {table} (\
         id bigint PRIMARY KEY DEFAULT nextval({seq_literal}), \
         data text NOT NULL, \
         created_at timestamp DEFAULT now()); \
         ALTER SEQUENCE {seq} OWNED BY {table}.id;",
        seq = quote_identifier(&seq),
        start = id_start,
        table = quote_identifier(table),
        seq_literal = quote_literal(&quote_identifier(&seq)),
    )
}

/// Removes subscriptions, publications and orphaned slots tied to `dbname`
/// on one instance.
///
/// Dropping a database fails while either still references it.
pub async fn teardown(admin: &Client, params: &ConnectParams, dbname: &str) -> Result<usize> {
    let mut removed = 0;
    if database_exists(admin, dbname).await? {
        let client = connect(&params.with_dbname(dbname)).await?;
        for name in list_subscriptions(&client).await? {
            debug!("Dropping subscription {} on {}", name, params.address());
            drop_subscription(&client, &name).await?;
            removed += 1;
        }
        for name in list_publications(&client).await? {
            debug!("Dropping publication {} on {}", name, params.address());
            drop_publication(&client, &name).await?;
            removed += 1;
        }
    }

    let slots = admin
        .query(
            "SELECT slot_name::text FROM pg_replication_slots \
             WHERE database = $1 AND NOT active",
            &[&dbname],
        )
        .await
        .with_context(|| format!("Failed to list replication slots on {}", params.address()))?;
    for row in slots {
        let slot: String = row.get(0);
        debug!("Dropping orphaned slot {} on {}", slot, params.address());
        admin
            .execute("SELECT pg_drop_replication_slot($1)", &[&slot])
            .await
            .with_context(|| format!("Failed to drop replication slot {}", slot))?;
        removed += 1;
    }

    Ok(removed)
}

/// Drops and recreates `dbname`.
pub async fn reset_database(admin: &Client, dbname: &str) -> Result<()> {
    let ident = quote_identifier(dbname);
    admin
        .batch_execute(&format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", ident))
        .await
        .with_context(|| format!("Failed to drop database {}", dbname))?;
    admin
        .batch_execute(&format!("CREATE DATABASE {}", ident))
        .await
        .with_context(|| format!("Failed to create database {}", dbname))?;
    Ok(())
}

pub async fn create_test_table(client: &Client, table: &str, id_start: i64) -> Result<()> {
    client
        .batch_execute(&create_table_sql(table, id_start))
        .await
        .with_context(|| format!("Failed to create table {}", table))?;
    Ok(())
}

pub async fn insert_row(client: &Client, table: &str, data: &str) -> Result<i64> {
    let row = client
        .query_one(
            &format!(
                "INSERT INTO {} (data) VALUES ($1) RETURNING id",
                quote_identifier(table)
            ),
            &[&data],
        )
        .await
        .with_context(|| format!("Failed to insert into {}", table))?;
    Ok(row.get(0))
}

pub async fn insert_seed_rows(client: &Client, table: &str, origin: &str) -> Result<()> {
    for payload in seed_payloads(origin) {
        insert_row(client, table, &payload).await?;
    }
    info!("Inserted {} seed rows from {}", SEED_ROWS, origin);
    Ok(())
}
