//! `selinon-rs` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`  — structurally validate a flow-registry JSON file.
//! - `dispatch`  — run one flow instance to completion offline.
//! - `serve`     — start the dispatch-trigger/trace HTTP surface.
//! - `migrate`   — run pending database migrations.

mod dispatch_cmd;
mod error;
mod server;
mod validate;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::info;

use error::CliError;

#[derive(Parser)]
#[command(name = "selinon-rs", about = "Flow dispatcher and system-state transition engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Structurally validate a flow-registry JSON file.
    Validate {
        /// Path to the flow-registry JSON file.
        path: PathBuf,
    },
    /// Run one flow instance to completion against the in-memory broker.
    Dispatch {
        /// Path to the flow-registry JSON file.
        #[arg(long)]
        flows: PathBuf,
        /// Name of the flow to start.
        flow_name: String,
        /// JSON value to use as the flow's starting `node_args`.
        #[arg(long, default_value = "null")]
        node_args: String,
    },
    /// Start the dispatch-trigger/trace HTTP surface.
    Serve {
        /// Path to the flow-registry JSON file.
        #[arg(long)]
        flows: PathBuf,
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
    },
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
}

fn load_registry(path: &Path) -> Result<fdr::FlowRegistry, CliError> {
    let file = validate::load(path)?;
    if let Err(problems) = validate::check_structural_integrity(&file) {
        return Err(CliError::Structural(problems.join("\n")));
    }
    Ok(validate::into_registry(file))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Validate { path } => match validate::load(&path) {
            Ok(file) => match validate::check_structural_integrity(&file) {
                Ok(()) => {
                    println!("flow file is structurally valid ({} flow(s))", file.flows.len());
                    Ok(())
                }
                Err(problems) => Err(CliError::Structural(problems.join("\n"))),
            },
            Err(e) => Err(e),
        },

        Command::Dispatch { flows, flow_name, node_args } => run_dispatch(&flows, &flow_name, &node_args).await,

        Command::Serve { flows, bind } => match load_registry(&flows) {
            Ok(registry) => {
                info!("starting dispatch server on {bind}");
                server::serve(&bind, registry).await.map_err(CliError::Io)
            }
            Err(e) => Err(e),
        },

        Command::Migrate { database_url } => run_migrate(&database_url).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run_dispatch(flows: &Path, flow_name: &str, node_args: &str) -> Result<(), CliError> {
    let registry = load_registry(flows)?;
    let node_args: serde_json::Value = serde_json::from_str(node_args)?;
    dispatch_cmd::run(registry, flow_name, node_args, None).await
}

async fn run_migrate(database_url: &str) -> Result<(), CliError> {
    info!("running migrations against {database_url}");
    let pool = store::pool::create_pool(database_url, 2).await?;
    store::pool::run_migrations(&pool).await?;
    info!("migrations applied successfully");
    Ok(())
}
