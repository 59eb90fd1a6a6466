// ABOUTME: Library root for pg-bidi-setup
// ABOUTME: Provisions two PostgreSQL instances and verifies bidirectional logical replication between them

pub mod commands;
pub mod config;
pub mod error;
pub mod host;
pub mod outcome;
pub mod postgres;
pub mod provision;
pub mod remote;
pub mod replication;
pub mod wait;
