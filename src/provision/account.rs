// ABOUTME: Ensures the service account that owns the data directories exists
// ABOUTME: Checks for the account and its home directory before creating either

use anyhow::{Context, Result};

use crate::config::SERVICE_ACCOUNT;
use crate::host::{CommandSpec, Host};
use crate::outcome::StepOutcome;
use crate::provision::platform::{Layout, Platform};

pub async fn ensure_service_account<H: Host>(
    host: &H,
    platform: &Platform,
    layout: &Layout,
) -> Result<StepOutcome> {
    let home = layout.home_dir.display().to_string();
    let mut changes = Vec::new();

    let exists = host
        .run(&CommandSpec::new("id").arg(SERVICE_ACCOUNT).probe())
        .await?
        .success();
    if !exists {
        let create = match platform {
            Platform::Debian { .. } => CommandSpec::new("useradd").args([
                "--system",
                "--home-dir",
                home.as_str(),
                "--shell",
                "/bin/bash",
                "--user-group",
                SERVICE_ACCOUNT,
            ]),
            Platform::MacOs { .. } => CommandSpec::new("sysadminctl").args([
                "-addUser",
                SERVICE_ACCOUNT,
                "-home",
                home.as_str(),
            ]),
        };
        host.run_checked(&create)
            .await
            .with_context(|| format!("Failed to create the {} account", SERVICE_ACCOUNT))?;
        changes.push(format!("created account {}", SERVICE_ACCOUNT));
    }

    if !host.path_exists(&layout.home_dir).await {
        host.run_checked(&CommandSpec::new("mkdir").args(["-p", home.as_str()]))
            .await?;
        host.run_checked(&CommandSpec::new("chown").args([layout.owner.as_str(), home.as_str()]))
            .await?;
        changes.push(format!("created {}", home));
    }

    if changes.is_empty() {
        Ok(StepOutcome::unchanged(format!(
            "account {} and {} exist",
            SERVICE_ACCOUNT, home
        )))
    } else {
        Ok(StepOutcome::changed(changes.join(", ")))
    }
}
