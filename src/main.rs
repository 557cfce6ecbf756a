mod client_config;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use init::ControlClient;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// nodectl - talk to nodeos nodes
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to the client config (defaults to ~/.nodeos/config.toml)
    #[clap(long = "nodeconfig", env = "NODECTL_CONFIG")]
    nodeconfig: Option<PathBuf>,

    /// Node address, overrides the config target
    #[clap(short, long)]
    target: Option<String>,

    /// Subcommand to execute
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download the admin kubeconfig from the node
    Kubeconfig {
        /// Where to write the kubeconfig
        #[clap(short, long, default_value = "kubeconfig")]
        output: PathBuf,
    },
    /// Show the state of every service on the node
    Status {
        /// Print JSON instead of a table
        #[clap(long)]
        json: bool,
    },
    /// Generate shell completions
    Completion {
        #[clap(value_enum)]
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match &args.command {
        Commands::Kubeconfig { output } => {
            let client = connect(&args)?;
            let contents = client
                .kubeconfig()
                .await
                .context("Failed to fetch kubeconfig")?;
            std::fs::write(output, contents)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Wrote kubeconfig to {}", output.display());
        }
        Commands::Status { json } => {
            let client = connect(&args)?;
            let services = client.status().await.context("Failed to fetch status")?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&services)?);
            } else if services.is_empty() {
                println!("No services found");
            } else {
                println!("{:<12} {:<12} {}", "SERVICE", "STATE", "LAST ERROR");
                for status in services {
                    println!(
                        "{:<12} {:<12} {}",
                        status.id,
                        status.state.to_string(),
                        status.last_error.unwrap_or_default()
                    );
                }
            }
        }
        Commands::Completion { shell } => {
            let mut cmd = Args::command();
            clap_complete::generate(*shell, &mut cmd, "nodectl", &mut std::io::stdout());
        }
    }

    Ok(())
}

fn connect(args: &Args) -> Result<ControlClient> {
    let config = client_config::resolve(args.nodeconfig.as_deref(), args.target.as_deref())?;
    debug!(address = %config.address(), "Connecting to node");
    Ok(ControlClient::new(config.address(), config.token))
}
