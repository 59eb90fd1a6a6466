// ABOUTME: Remote control of instances that may live on other machines
// ABOUTME: Restarts role-specific service units over SSH

pub mod client;

pub use client::{is_local_host, SshClient, UnitRestarter};
