//! Daemon lifecycle: wire the service context, spawn the job workers and the
//! auto-import scheduler, run the IPC server, and shut everything down under
//! one cancellation tree.

use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
  config::Config,
  jobs::scheduler::AutoImportScheduler,
  server::{Server, ServerConfig},
  service::{ServiceError, Services},
};

pub struct Daemon {
  config: Config,
}

impl Daemon {
  pub fn new(config: Config) -> Self {
    Self { config }
  }

  /// Run the daemon until ctrl-c. Returns an error only for unrecoverable
  /// startup failures (the launcher maps those to exit code 1).
  pub async fn run(self) -> Result<(), ServiceError> {
    info!("Starting mindspace daemon");
    info!("Socket: {:?}", self.config.daemon.socket_path);
    info!("Data dir: {:?}", self.config.daemon.data_dir);

    // Master cancellation token, propagated to every component.
    let cancel = CancellationToken::new();

    let socket_path = self.config.daemon.socket_path.clone();
    let auto_import = self.config.auto_import.clone();
    let (services, runner) = Services::build(self.config).await?;

    let worker_handles = runner.spawn_workers(cancel.child_token());

    let scheduler_handle = {
      let scheduler = AutoImportScheduler::new(
        Arc::clone(&services.orchestrator),
        Arc::clone(&services.db),
        services.jobs.clone(),
        services.store.clone(),
        auto_import,
      );
      let scheduler_cancel = cancel.child_token();
      tokio::spawn(async move {
        scheduler.run(scheduler_cancel).await;
      })
    };

    let server = Server::new(ServerConfig {
      socket_path,
      services: Arc::clone(&services),
    });

    // Handle ctrl-c gracefully.
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
      if let Err(e) = signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        return;
      }
      info!("Received ctrl-c, shutting down...");
      cancel_for_signal.cancel();
    });

    if let Err(e) = server.run(cancel.child_token()).await {
      error!("Server error: {}", e);
      cancel.cancel();
      let _ = scheduler_handle.await;
      return Err(ServiceError::internal(format!("server failed to start: {e}")));
    }

    info!("Shutting down...");
    cancel.cancel();

    let _ = scheduler_handle.await;
    for handle in worker_handles {
      let _ = handle.await;
    }

    info!("Daemon shutdown complete");
    Ok(())
  }
}
