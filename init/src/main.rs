//! nodeos init binary.
//!
//! Runs as PID 1 on a cluster node, or as a plain process with `--no-pid1`.

use clap::Parser;
use nodeos_init::{Init, InitConfig, SupervisorConfig, CONTROL_PORT, USER_DATA_PATH};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "init",
    about = "nodeos init - service supervisor for cluster nodes",
    version
)]
struct Cli {
    /// User data document
    #[arg(long, default_value = USER_DATA_PATH)]
    userdata: PathBuf,

    /// Don't require running as PID 1
    #[arg(long)]
    no_pid1: bool,

    /// Don't mount virtual filesystems
    #[arg(long)]
    no_mount: bool,

    /// Seconds between stopping workloads and stopping containerd/udevd
    #[arg(long, default_value_t = 10)]
    shutdown_settle: u64,

    /// Control API listen address
    #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], CONTROL_PORT)))]
    control_addr: SocketAddr,

    /// Don't serve the control API
    #[arg(long)]
    no_control: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = InitConfig {
        userdata_path: cli.userdata,
        mount_filesystems: !cli.no_mount,
        require_pid1: !cli.no_pid1,
        control_addr: (!cli.no_control).then_some(cli.control_addr),
        supervisor: SupervisorConfig::default()
            .with_shutdown_settle(Duration::from_secs(cli.shutdown_settle)),
    };

    let init = Init::new(config)?;
    init.run().await?;

    Ok(())
}
