// ABOUTME: CLI entry point for pg-bidi-setup
// ABOUTME: Parses arguments, sets up logging and dispatches to the install and test commands

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use pg_bidi_setup::commands::{self, InstallArgs, OutputFormat, TestArgs};
use pg_bidi_setup::config::Topology;

#[derive(Parser)]
#[command(name = "pg-bidi-setup")]
#[command(about = "Provision and test bidirectional PostgreSQL logical replication", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Topology file (TOML) with host, port and timeout overrides
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Format of the run summary printed on success
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install PostgreSQL and start the main and second instances (needs root)
    Install {
        /// Listen address of the main instance
        site1_ip1: Option<String>,
        /// Listen address of the second instance
        site1_ip2: Option<String>,
        /// Subnet trusted for client and replication connections
        subnet: Option<String>,
        /// Password for the postgres role
        postgres_password: Option<String>,
        /// Delete existing data directories without asking
        #[arg(short = 'y', long)]
        yes: bool,
        /// Print commands and file writes instead of performing them
        #[arg(long)]
        dry_run: bool,
        /// Seconds to wait for each instance to accept connections
        #[arg(long, value_name = "SECS")]
        start_timeout: Option<u64>,
    },
    /// Set up replication both ways and check that rows converge
    Test {
        /// Host of the main instance
        site1_ip1: Option<String>,
        /// Host of the second instance
        site1_ip2: Option<String>,
        /// Role used to connect to both instances
        #[arg(long, default_value = "postgres")]
        user: String,
        /// Password for --user
        #[arg(long, env = "PGPASSWORD", hide_env_values = true)]
        password: Option<String>,
        /// SSH user for restarting remote instances
        #[arg(long)]
        ssh_user: Option<String>,
        /// pgpass file the subscribing servers read instead of a password
        #[arg(long, value_name = "PATH")]
        passfile: Option<PathBuf>,
        /// Seconds to wait for an instance to come back after a restart
        #[arg(long, value_name = "SECS")]
        restart_timeout: Option<u64>,
        /// Seconds to wait for both instances to hold the same rows
        #[arg(long, value_name = "SECS")]
        convergence_timeout: Option<u64>,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "pg_bidi_setup=info",
        1 => "pg_bidi_setup=debug",
        _ => "pg_bidi_setup=trace,tokio_postgres=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let topology = Topology::load_or_default(cli.config.as_deref())?;

    let summary = match cli.command {
        Commands::Install {
            site1_ip1,
            site1_ip2,
            subnet,
            postgres_password,
            yes,
            dry_run,
            start_timeout,
        } => {
            let args = InstallArgs {
                site1_ip1,
                site1_ip2,
                subnet,
                postgres_password,
                assume_yes: yes,
                dry_run,
                start_timeout,
            };
            commands::install(args, topology).await?
        }
        Commands::Test {
            site1_ip1,
            site1_ip2,
            user,
            password,
            ssh_user,
            passfile,
            restart_timeout,
            convergence_timeout,
        } => {
            let args = TestArgs {
                site1_ip1,
                site1_ip2,
                user: Some(user),
                password,
                ssh_user,
                passfile,
                restart_timeout,
                convergence_timeout,
            };
            commands::test_replication(args, topology).await?
        }
    };

    commands::print_summary(&summary, cli.output)
}
