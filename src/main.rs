use clap::Parser;
use mindspace::{config::Config, daemon::Daemon};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Knowledge-base ingestion and retrieval daemon.
#[derive(Debug, Parser)]
#[command(name = "mindspaced", version, about)]
struct Args {
  /// Unix socket path (overrides config)
  #[arg(long, env = "MINDSPACE_SOCKET")]
  socket: Option<std::path::PathBuf>,

  /// Data directory (overrides config)
  #[arg(long, env = "MINDSPACE_DATA_DIR")]
  data_dir: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = Args::parse();

  let mut config = Config::load();
  if let Some(socket) = args.socket {
    config.daemon.socket_path = socket;
  }
  if let Some(data_dir) = args.data_dir {
    config.daemon.data_dir = data_dir;
  }

  // Exit codes: 0 on clean shutdown, 1 on unrecoverable startup error.
  if let Err(e) = Daemon::new(config).run().await {
    error!("Fatal: {e}");
    std::process::exit(1);
  }
}
