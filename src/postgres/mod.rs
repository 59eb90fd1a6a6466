// ABOUTME: PostgreSQL connection utilities module
// ABOUTME: Connection parameters, TLS-capable connect and small catalog queries

pub mod connection;

pub use connection::{
    connect, database_exists, ping, server_version_num, show_setting, ConnectParams,
};
