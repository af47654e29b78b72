mod config;
mod credentials;
mod dns;
mod engine;
mod error;
mod hosted_zone;
mod ssh_stream;
mod supervisor;
mod target;

use std::path::PathBuf;

use clap::Parser;

use crate::supervisor::Supervisor;

/// Multiplexed SSH tunneling daemon.
#[derive(Parser)]
#[command(name = "mogura", about = "Multiplexed SSH tunneling daemon", disable_version_flag = true)]
struct Cli {
    /// Path to the YAML config file (default: $HOME/.mogura/config.yml)
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print version and exit
    #[arg(short = 'v', long = "version")]
    version: bool,
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    env_logger::init();
    let cli = Cli::parse();

    if cli.version {
        println!("mogura {}", env!("CARGO_PKG_VERSION"));
        return 0;
    }

    let parsed_config = match config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            log::error!(target: "mogura", "{}", e);
            return 1;
        }
    };

    let supervisor = match Supervisor::start(&parsed_config.bastion, parsed_config.tunnels).await {
        Ok(s) => s,
        Err(e) => {
            log::error!(target: "mogura", "{}", e);
            return 1;
        }
    };

    match supervisor.run().await {
        Ok(()) => 0,
        Err(e) => {
            log::error!(target: "mogura", "{}", e);
            1
        }
    }
}
