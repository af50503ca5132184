// scrivenerd: document server entry point.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use scrivener_daemon::config::default_data_dir;
use scrivener_daemon::runtime::DEFAULT_BIND;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "scrivenerd", version, about = "Scrivener document and generation server")]
struct Args {
    /// State directory for config.toml and documents/ (default: ~/.scrivener).
    #[arg(long, env = "SCRIVENER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Address to serve the HTTP API on.
    #[arg(long, env = "SCRIVENER_BIND", default_value = DEFAULT_BIND)]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let data_dir = match args.data_dir {
        Some(dir) => dir,
        None => default_data_dir().context("could not resolve home directory for data dir")?,
    };

    info!(data_dir = %data_dir.display(), "starting scrivener daemon");
    scrivener_daemon::runtime::run(&data_dir, args.bind)
        .await
        .context("scrivener daemon terminated unexpectedly")
}
