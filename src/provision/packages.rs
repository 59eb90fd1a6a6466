// ABOUTME: Installs the PostgreSQL server packages through the OS package manager
// ABOUTME: Skips repository registration and installation when they are already present

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use crate::error::SetupError;
use crate::host::{CommandSpec, Host};
use crate::outcome::StepOutcome;
use crate::provision::platform::Platform;

pub const PGDG_LIST: &str = "/etc/apt/sources.list.d/pgdg.list";
pub const PGDG_KEYRING: &str = "/usr/share/keyrings/postgresql-archive.gpg";
const PGDG_KEY_URL: &str = "https://www.postgresql.org/media/keys/ACCC4CF8.asc";
const APT_PREREQUISITES: &[&str] = &["curl", "ca-certificates", "gnupg", "lsb-release"];

pub fn pgdg_source_line(codename: &str) -> String {
    format!(
        "deb [signed-by={}] http://apt.postgresql.org/pub/repos/apt {}-pgdg main\n",
        PGDG_KEYRING, codename
    )
}

fn apt_get() -> CommandSpec {
    CommandSpec::new("env").args(["DEBIAN_FRONTEND=noninteractive", "apt-get"])
}

pub async fn install_packages<H: Host>(
    host: &H,
    platform: &Platform,
    version: u32,
    invoking_user: Option<&str>,
) -> Result<StepOutcome> {
    match platform {
        Platform::Debian { .. } => install_debian(host, version).await,
        Platform::MacOs { .. } => install_homebrew(host, version, invoking_user).await,
    }
}

async fn install_debian<H: Host>(host: &H, version: u32) -> Result<StepOutcome> {
    let server = format!("postgresql-{}", version);
    let client = format!("postgresql-client-{}", version);
    let mut changes = Vec::new();

    if host.path_exists(Path::new(PGDG_LIST)).await {
        info!("PostgreSQL apt repository already registered");
    } else {
        info!("Registering PostgreSQL apt repository");
        host.run_checked(&apt_get().args(["install", "-y"]).args(APT_PREREQUISITES.iter().copied()))
            .await
            .context("Failed to install repository prerequisites")?;
        host.run_checked(&CommandSpec::new("sh").args([
            "-c".to_string(),
            format!(
                "curl -fsSL {} | gpg --dearmor --yes -o {}",
                PGDG_KEY_URL, PGDG_KEYRING
            ),
        ]))
        .await
        .context("Failed to import the PostgreSQL signing key")?;

        let codename = host
            .run_checked(&CommandSpec::new("lsb_release").arg("-cs").probe())
            .await?
            .stdout
            .trim()
            .to_string();
        if codename.is_empty() && !host.is_dry_run() {
            return Err(SetupError::Environment(
                "could not determine distribution codename".to_string(),
            )
            .into());
        }
        host.write_file(Path::new(PGDG_LIST), &pgdg_source_line(&codename), 0o644)
            .await?;
        changes.push("registered apt.postgresql.org");
    }

    let installed = host
        .run(&CommandSpec::new("dpkg").args(["-s", server.as_str()]).probe())
        .await?
        .success();
    if installed && changes.is_empty() {
        return Ok(StepOutcome::unchanged(format!("{} already installed", server)));
    }

    host.run_checked(&apt_get().arg("update"))
        .await
        .context("apt-get update failed")?;
    if !installed {
        info!("Installing {} and {}", server, client);
        host.run_checked(&apt_get().args(["install", "-y", server.as_str(), client.as_str()]))
            .await
            .with_context(|| format!("Failed to install {}", server))?;
        changes.push("installed server packages");
    }

    Ok(StepOutcome::changed(changes.join(", ")))
}

async fn install_homebrew<H: Host>(
    host: &H,
    version: u32,
    invoking_user: Option<&str>,
) -> Result<StepOutcome> {
    let formula = format!("postgresql@{}", version);
    // Homebrew refuses to run as root.
    let brew = |cmd: CommandSpec| match invoking_user {
        Some(user) => cmd.as_user(user),
        None => cmd,
    };

    let listed = host
        .run(&brew(CommandSpec::new("brew").args(["list", formula.as_str()]).probe()))
        .await?;
    if listed.success() {
        return Ok(StepOutcome::unchanged(format!("{} already installed", formula)));
    }

    info!("Installing {} with Homebrew", formula);
    host.run_checked(&brew(CommandSpec::new("brew").args(["install", formula.as_str()])))
        .await
        .with_context(|| format!("Failed to install {}", formula))?;
    Ok(StepOutcome::changed(format!("installed {}", formula)))
}
