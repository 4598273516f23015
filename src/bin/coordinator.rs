use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use zero_pipeline::config::ServerConfig;
use zero_pipeline::coordinator::{server, Coordinator};

/// Generation coordinator: schedules self-play workers, drives training
/// rounds, and rolls generations over.
#[derive(Parser, Debug)]
struct Args {
    /// Path to the coordinator's JSON config file. Created with defaults if
    /// it does not yet exist.
    config_path: std::path::PathBuf,
}

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let args = Args::parse();
    if let Err(err) = run(args).await {
        log::error!("fatal: {err}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> zero_pipeline::error::PipelineResult<()> {
    let config = ServerConfig::load_or_init(&args.config_path)?;
    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    let listener = TcpListener::bind(addr).await?;
    log::info!("listening on {addr}");

    let coordinator = Arc::new(Mutex::new(Coordinator::new(config, args.config_path.clone())));
    server::serve(listener, coordinator).await
}
