// ABOUTME: One-way replication pairs that together form the bidirectional topology
// ABOUTME: Chooses loop-free publication scope and subscription options per server version

use anyhow::Result;
use tokio_postgres::Client;

use crate::config::{InstanceDescriptor, InstanceRole};
use crate::replication::publication::{create_publication, PublicationScope};
use crate::replication::subscription::{
    create_subscription, SubscriptionConnInfo, SubscriptionOptions,
};

/// First major version whose subscriptions accept `origin = none`.
pub const ORIGIN_FILTER_VERSION_NUM: i32 = 160000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationPair {
    pub publication: String,
    pub subscription: String,
    pub source: InstanceRole,
    pub target: InstanceRole,
    /// Copy existing rows when the subscription is created.
    pub copy_data: bool,
    /// Recreate the target database before subscribing.
    pub reset_target: bool,
}

impl ReplicationPair {
    fn between(source: InstanceRole, target: InstanceRole) -> Self {
        Self {
            publication: format!("pub_{}_to_{}", source, target),
            subscription: format!("sub_{}_to_{}", source, target),
            source,
            target,
            copy_data: true,
            reset_target: true,
        }
    }

    /// main → second; seeds the empty target from the source.
    pub fn forward() -> Self {
        Self::between(InstanceRole::Main, InstanceRole::Second)
    }

    /// second → main; the target already holds every row, so nothing is copied.
    pub fn reverse() -> Self {
        Self {
            copy_data: false,
            reset_target: false,
            ..Self::between(InstanceRole::Second, InstanceRole::Main)
        }
    }

    /// How the publication avoids echoing replicated rows back.
    ///
    /// From PostgreSQL 16 the subscriber filters by origin. Before that each
    /// side publishes only the id parity it generates.
    pub fn publication_scope(&self, table: &str, origin_filter: bool) -> PublicationScope {
        if origin_filter {
            PublicationScope::AllTables
        } else {
            PublicationScope::FilteredTable {
                table: table.to_string(),
                filter: format!("id % 2 = {}", self.source.id_start() % 2),
            }
        }
    }

    pub fn subscription_options(&self, origin_filter: bool) -> SubscriptionOptions {
        SubscriptionOptions {
            copy_data: self.copy_data,
            origin_none: origin_filter,
        }
    }
}

/// Origin filtering needs both publisher and subscriber on 16 or newer.
pub fn supports_origin_filter(versions: &[i32]) -> bool {
    versions.iter().all(|v| *v >= ORIGIN_FILTER_VERSION_NUM)
}

/// Creates the publication on the source and the subscription on the target.
///
/// The target's table must already exist.
pub async fn establish_pair(
    pair: &ReplicationPair,
    source_db: &Client,
    target_db: &Client,
    source: &InstanceDescriptor,
    conninfo_template: &SubscriptionConnInfo,
    table: &str,
    origin_filter: bool,
) -> Result<()> {
    create_publication(
        source_db,
        &pair.publication,
        &pair.publication_scope(table, origin_filter),
    )
    .await?;

    let conninfo = SubscriptionConnInfo {
        host: source.host.clone(),
        port: source.port,
        ..conninfo_template.clone()
    };
    create_subscription(
        target_db,
        &pair.subscription,
        &conninfo,
        &pair.publication,
        pair.subscription_options(origin_filter),
    )
    .await
}
