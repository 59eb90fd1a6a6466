// ABOUTME: Shared conventions and topology configuration for both instances
// ABOUTME: Merges built-in defaults, an optional TOML file and command-line arguments

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SITE_IP: &str = "127.0.0.1";
pub const DEFAULT_SUBNET: &str = "127.0.0.0/8";
pub const DEFAULT_PASSWORD: &str = "postgres";
pub const PG_MAJOR_VERSION: u32 = 15;
pub const TEST_DATABASE: &str = "replication_test";
pub const TEST_TABLE: &str = "test_table";
pub const ADMIN_ROLE: &str = "postgres";
pub const SERVICE_ACCOUNT: &str = "postgres";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceRole {
    Main,
    Second,
}

impl InstanceRole {
    pub const ALL: [InstanceRole; 2] = [InstanceRole::Main, InstanceRole::Second];

    pub fn name(self) -> &'static str {
        match self {
            InstanceRole::Main => "main",
            InstanceRole::Second => "second",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            InstanceRole::Main => 5432,
            InstanceRole::Second => 5433,
        }
    }

    /// First id handed out by this instance's test table sequence.
    ///
    /// Both sides step by two so rows inserted on either side never collide.
    pub fn id_start(self) -> i64 {
        match self {
            InstanceRole::Main => 1,
            InstanceRole::Second => 2,
        }
    }

    pub fn unit_name(self, version: u32) -> String {
        format!("postgresql@{}-{}.service", version, self.name())
    }
}

impl fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One PostgreSQL server managed by this tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescriptor {
    pub role: InstanceRole,
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub unit_name: String,
}

impl InstanceDescriptor {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct InstanceOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    pub start_secs: u64,
    pub restart_secs: u64,
    pub sync_secs: u64,
    pub convergence_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            start_secs: 60,
            restart_secs: 30,
            sync_secs: 60,
            convergence_secs: 30,
            poll_interval_ms: 1000,
        }
    }
}

impl Timeouts {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Topology file contents. Every field is optional.
///
/// ```toml
/// version = 15
/// subnet = "10.0.0.0/24"
///
/// [main]
/// host = "10.0.0.1"
///
/// [second]
/// host = "10.0.0.2"
/// port = 5433
///
/// [timeouts]
/// convergence_secs = 60
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Topology {
    pub version: u32,
    pub subnet: Option<String>,
    pub database: String,
    pub table: String,
    pub main: InstanceOverrides,
    pub second: InstanceOverrides,
    pub timeouts: Timeouts,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            version: PG_MAJOR_VERSION,
            subnet: None,
            database: TEST_DATABASE.to_string(),
            table: TEST_TABLE.to_string(),
            main: InstanceOverrides::default(),
            second: InstanceOverrides::default(),
            timeouts: Timeouts::default(),
        }
    }
}

impl Topology {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read topology file {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Invalid topology file {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let topology: Topology = toml::from_str(contents)?;
        Ok(topology)
    }

    /// Loads the file if one was given, otherwise returns the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn overrides(&self, role: InstanceRole) -> &InstanceOverrides {
        match role {
            InstanceRole::Main => &self.main,
            InstanceRole::Second => &self.second,
        }
    }

    /// Builds the descriptor for `role`.
    ///
    /// `cli_host` wins over the file, which wins over [`DEFAULT_SITE_IP`].
    /// Data directories default to `<data_root>/<role>`.
    pub fn instance(
        &self,
        role: InstanceRole,
        cli_host: Option<&str>,
        data_root: &Path,
    ) -> InstanceDescriptor {
        let overrides = self.overrides(role);
        let host = cli_host
            .map(str::to_string)
            .or_else(|| overrides.host.clone())
            .unwrap_or_else(|| DEFAULT_SITE_IP.to_string());

        InstanceDescriptor {
            role,
            host,
            port: overrides.port.unwrap_or_else(|| role.default_port()),
            data_dir: overrides
                .data_dir
                .clone()
                .unwrap_or_else(|| data_root.join(role.name())),
            unit_name: role.unit_name(self.version),
        }
    }

    pub fn subnet_or_default<'a>(&'a self, cli_subnet: Option<&'a str>) -> &'a str {
        cli_subnet
            .or(self.subnet.as_deref())
            .unwrap_or(DEFAULT_SUBNET)
    }
}
