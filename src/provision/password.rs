// ABOUTME: Optional admin password change on both instances
// ABOUTME: Tries TCP first, falls back to psql over the local socket; failure is only a warning

use anyhow::Result;
use pg_escape::{quote_identifier, quote_literal};
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};

use crate::config::{InstanceDescriptor, ADMIN_ROLE, SERVICE_ACCOUNT};
use crate::host::{CommandSpec, Host};
use crate::outcome::StepOutcome;
use crate::postgres::{connect, ConnectParams};
use crate::provision::platform::Layout;

fn alter_password_sql(password: &SecretString) -> String {
    format!(
        "ALTER USER {} WITH PASSWORD {}",
        quote_identifier(ADMIN_ROLE),
        quote_literal(password.expose_secret())
    )
}

async fn set_over_tcp(instance: &InstanceDescriptor, sql: &str) -> Result<()> {
    let client = connect(&ConnectParams::new(instance.host.clone(), instance.port)).await?;
    client.batch_execute(sql).await?;
    Ok(())
}

async fn set_over_socket<H: Host>(
    host: &H,
    instance: &InstanceDescriptor,
    layout: &Layout,
    sql: &str,
) -> Result<()> {
    let psql = CommandSpec::new(layout.bin("psql"))
        .args(["-X", "-q", "-v", "ON_ERROR_STOP=1", "-d", "postgres", "-h"])
        .arg(layout.socket_dir.display().to_string())
        .arg("-p")
        .arg(instance.port.to_string())
        .stdin(format!("{};\n", sql))
        .as_user(SERVICE_ACCOUNT);
    host.run_checked(&psql).await?;
    Ok(())
}

/// Sets the admin password on one instance. Never fails the run.
pub async fn set_password<H: Host>(
    host: &H,
    instance: &InstanceDescriptor,
    layout: &Layout,
    password: &SecretString,
) -> StepOutcome {
    let sql = alter_password_sql(password);

    if host.is_dry_run() {
        println!("[dry-run] set password for {} on {}", ADMIN_ROLE, instance.address());
        return StepOutcome::changed("password set (dry run)");
    }

    match set_over_tcp(instance, &sql).await {
        Ok(()) => {
            info!("Password set on {} over TCP", instance.role);
            return StepOutcome::changed(format!("password set via {}", instance.address()));
        }
        Err(e) => warn!(
            "Could not set password on {} over TCP ({:#}); trying local socket",
            instance.role, e
        ),
    }

    match set_over_socket(host, instance, layout, &sql).await {
        Ok(()) => {
            info!("Password set on {} over local socket", instance.role);
            StepOutcome::changed("password set via local socket")
        }
        Err(e) => {
            warn!(
                "Failed to set password on {} instance: {:#}. Continuing without it.",
                instance.role, e
            );
            StepOutcome::unchanged("password not set")
        }
    }
}
