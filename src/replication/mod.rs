// ABOUTME: Replication utilities module
// ABOUTME: Handles PostgreSQL logical replication setup, verification and monitoring

pub mod monitor;
pub mod pair;
pub mod publication;
pub mod schema;
pub mod subscription;
pub mod tester;
pub mod wal;

pub use monitor::{
    get_replication_lag, get_subscription_status, is_replication_caught_up, table_snapshot,
    SourceReplicationStats, SubscriptionStats, TableSnapshot,
};
pub use pair::{establish_pair, ReplicationPair};
pub use publication::{create_publication, drop_publication, list_publications, PublicationScope};
pub use subscription::{
    create_subscription, drop_subscription, list_subscriptions, wait_for_sync,
    SubscriptionConnInfo, SubscriptionOptions,
};
pub use tester::{run_replication_test, TestPlan};
pub use wal::ensure_wal_level;
