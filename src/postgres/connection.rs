// ABOUTME: Connection handling for the managed PostgreSQL instances
// ABOUTME: Connects with TLS when offered, spawns the connection driver and exposes catalog helpers

use anyhow::{Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::time::Duration;
use tokio_postgres::config::SslMode;
use tokio_postgres::{Client, Config};
use tracing::{debug, error};

use crate::config::{InstanceDescriptor, ADMIN_ROLE};
use crate::error::SetupError;

const APPLICATION_NAME: &str = "pg-bidi-setup";

#[derive(Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<SecretString>,
    pub dbname: String,
    pub connect_timeout: Duration,
}

impl ConnectParams {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: ADMIN_ROLE.to_string(),
            password: None,
            dbname: "postgres".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Admin connection to the `postgres` database of `instance`.
    pub fn for_instance(
        instance: &InstanceDescriptor,
        user: &str,
        password: Option<SecretString>,
    ) -> Self {
        Self {
            user: user.to_string(),
            password,
            ..Self::new(instance.host.clone(), instance.port)
        }
    }

    /// Same server and credentials, different database.
    pub fn with_dbname(&self, dbname: &str) -> Self {
        Self {
            dbname: dbname.to_string(),
            ..self.clone()
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("dbname", &self.dbname)
            .finish()
    }
}

impl fmt::Display for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}/{}", self.user, self.address(), self.dbname)
    }
}

/// Opens a connection and spawns its driver task.
///
/// Failures are reported as [`SetupError::Connection`].
pub async fn connect(params: &ConnectParams) -> Result<Client> {
    let mut config = Config::new();
    config
        .host(&params.host)
        .port(params.port)
        .user(&params.user)
        .dbname(&params.dbname)
        .application_name(APPLICATION_NAME)
        .ssl_mode(SslMode::Prefer)
        .connect_timeout(params.connect_timeout);
    if let Some(password) = &params.password {
        config.password(password.expose_secret());
    }

    // Packaged servers ship a self-signed snakeoil certificate.
    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .context("Failed to build TLS connector")?;
    let tls = MakeTlsConnector::new(connector);

    let (client, connection) = config
        .connect(tls)
        .await
        .map_err(|e| SetupError::Connection(format!("{}: {}", params, e)))?;

    let target = params.to_string();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("Connection to {} failed: {}", target, e);
            return;
        }
        debug!("Connection to {} closed", target);
    });

    Ok(client)
}

pub async fn ping(client: &Client) -> Result<()> {
    client
        .simple_query("SELECT 1")
        .await
        .context("Liveness query failed")?;
    Ok(())
}

pub async fn show_setting(client: &Client, name: &str) -> Result<String> {
    let row = client
        .query_one("SELECT current_setting($1)", &[&name])
        .await
        .with_context(|| format!("Failed to read setting {}", name))?;
    Ok(row.get(0))
}

/// `server_version_num`, e.g. 150004 for 15.4.
pub async fn server_version_num(client: &Client) -> Result<i32> {
    let row = client
        .query_one("SELECT current_setting('server_version_num')::int", &[])
        .await
        .context("Failed to read server version")?;
    Ok(row.get(0))
}

pub async fn database_exists(client: &Client, name: &str) -> Result<bool> {
    let row = client
        .query_opt("SELECT 1 FROM pg_database WHERE datname = $1", &[&name])
        .await
        .with_context(|| format!("Failed to look up database {}", name))?;
    Ok(row.is_some())
}
