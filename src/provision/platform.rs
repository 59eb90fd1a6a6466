// ABOUTME: Operating system detection and per-platform filesystem layout
// ABOUTME: Supports the Debian family (apt + systemd) and macOS (Homebrew + pg_ctl)

use anyhow::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::SERVICE_ACCOUNT;
use crate::error::SetupError;
use crate::host::{CommandSpec, Host};

pub const OS_RELEASE: &str = "/etc/os-release";

const DEBIAN_FAMILY: &[&str] = &["debian", "ubuntu"];

/// Homebrew prefixes on Apple silicon and Intel, checked when `brew --prefix` fails.
const HOMEBREW_PREFIXES: &[&str] = &["/opt/homebrew", "/usr/local"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Platform {
    Debian { id: String },
    MacOs { prefix: PathBuf },
}

/// Where binaries, data, logs and sockets live for one major version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub bin_dir: PathBuf,
    pub data_root: PathBuf,
    pub log_dir: PathBuf,
    pub socket_dir: PathBuf,
    pub home_dir: PathBuf,
    /// `user:group` that owns everything the instances write.
    pub owner: String,
    /// `None` when instances are managed with `pg_ctl` directly.
    pub unit_dir: Option<PathBuf>,
}

impl Layout {
    pub fn bin(&self, program: &str) -> String {
        self.bin_dir.join(program).display().to_string()
    }
}

impl Platform {
    pub fn name(&self) -> &str {
        match self {
            Platform::Debian { id } => id,
            Platform::MacOs { .. } => "macos",
        }
    }

    pub fn layout(&self, version: u32) -> Layout {
        match self {
            Platform::Debian { .. } => Layout {
                bin_dir: PathBuf::from(format!("/usr/lib/postgresql/{}/bin", version)),
                data_root: PathBuf::from(format!("/var/lib/postgresql/{}", version)),
                log_dir: PathBuf::from("/var/log/postgresql"),
                socket_dir: PathBuf::from("/var/run/postgresql"),
                home_dir: PathBuf::from("/var/lib/postgresql"),
                owner: format!("{0}:{0}", SERVICE_ACCOUNT),
                unit_dir: Some(PathBuf::from("/etc/systemd/system")),
            },
            // sysadminctl puts new users in `staff`, not a group of their own.
            Platform::MacOs { prefix } => Layout {
                bin_dir: prefix.join(format!("opt/postgresql@{}/bin", version)),
                data_root: prefix.join(format!("var/postgresql@{}", version)),
                log_dir: prefix.join(format!("var/log/postgresql@{}", version)),
                socket_dir: PathBuf::from("/tmp/postgresql"),
                home_dir: PathBuf::from("/Users/postgres"),
                owner: format!("{}:staff", SERVICE_ACCOUNT),
                unit_dir: None,
            },
        }
    }

    /// Programs that must be on `PATH` before provisioning starts.
    pub fn required_tools(&self) -> &'static [&'static str] {
        match self {
            Platform::Debian { .. } => &[
                "apt-get",
                "dpkg",
                "systemctl",
                "journalctl",
                "useradd",
                "pkill",
                "sudo",
            ],
            Platform::MacOs { .. } => &["brew", "sysadminctl", "pkill", "sudo"],
        }
    }
}

/// Parses `KEY=value` lines of an os-release file, stripping quotes.
pub fn parse_os_release(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            (key.trim().to_string(), value.to_string())
        })
        .collect()
}

/// Returns the Debian-family platform described by an os-release file, if any.
pub fn platform_from_os_release(contents: &str) -> Option<Platform> {
    let fields = parse_os_release(contents);
    let id = fields.get("ID").map(|s| s.to_lowercase()).unwrap_or_default();
    let id_like = fields.get("ID_LIKE").map(|s| s.to_lowercase()).unwrap_or_default();

    let debian_family = DEBIAN_FAMILY.contains(&id.as_str())
        || id_like
            .split_whitespace()
            .any(|like| DEBIAN_FAMILY.contains(&like));

    debian_family.then_some(Platform::Debian { id })
}

pub async fn detect_platform<H: Host>(host: &H) -> Result<Platform> {
    let os_release = Path::new(OS_RELEASE);
    if host.path_exists(os_release).await {
        let contents = host.read_file(os_release).await?;
        if let Some(platform) = platform_from_os_release(&contents) {
            return Ok(platform);
        }
        let id = parse_os_release(&contents)
            .remove("ID")
            .unwrap_or_else(|| "unknown".to_string());
        return Err(SetupError::Environment(format!("unsupported operating system: {}", id)).into());
    }

    let uname = host.run(&CommandSpec::new("uname").arg("-s").probe()).await?;
    if uname.success() && uname.stdout.trim() == "Darwin" {
        let prefix = homebrew_prefix(host).await?;
        return Ok(Platform::MacOs { prefix });
    }

    Err(SetupError::Environment(format!(
        "unsupported operating system: {}",
        uname.stdout.trim()
    ))
    .into())
}

/// Asks Homebrew for its prefix, falling back to the first standard prefix
/// that exists.
pub async fn homebrew_prefix<H: Host>(host: &H) -> Result<PathBuf> {
    let output = host
        .run(&CommandSpec::new("brew").arg("--prefix").probe())
        .await?;
    let reported = output.stdout.trim();
    if output.success() && !reported.is_empty() {
        return Ok(PathBuf::from(reported));
    }

    for prefix in HOMEBREW_PREFIXES {
        if host.path_exists(Path::new(prefix)).await {
            return Ok(PathBuf::from(prefix));
        }
    }
    Err(SetupError::Environment("Homebrew installation not found".to_string()).into())
}
