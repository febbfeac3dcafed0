//! Auto-import scheduler: a single-leader periodic scan of the library
//! directory.
//!
//! Leadership is the distributed lock `library:auto_import:lock` (TTL 300 s,
//! set-if-absent). Non-holders poll once per minute to take over if the
//! holder dies; the holder refreshes the lock on every scan iteration.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
  config::AutoImportConfig,
  db::KbDb,
  domain::tenant::TenantId,
  ingest::{orchestrator::{Orchestrator, UploadRequest}, processor},
  jobs::{Job, JobQueue},
  limits::{AUTO_IMPORT_LOCK, AUTO_IMPORT_LOCK_TTL_SECS, CounterStore, DistributedLock},
  service::error::ServiceError,
};

/// How often non-holders re-try lock acquisition.
const TAKEOVER_POLL: Duration = Duration::from_secs(60);

pub struct AutoImportScheduler {
  orchestrator: Arc<Orchestrator>,
  db: Arc<KbDb>,
  queue: JobQueue,
  lock: DistributedLock,
  config: AutoImportConfig,
}

impl AutoImportScheduler {
  pub fn new(
    orchestrator: Arc<Orchestrator>,
    db: Arc<KbDb>,
    queue: JobQueue,
    store: Arc<CounterStore>,
    config: AutoImportConfig,
  ) -> Self {
    let lock = DistributedLock::new(store, AUTO_IMPORT_LOCK, AUTO_IMPORT_LOCK_TTL_SECS);
    Self {
      orchestrator,
      db,
      queue,
      lock,
      config,
    }
  }

  /// Run until cancelled. Only the lock holder scans; everyone else polls
  /// for takeover.
  pub async fn run(self, cancel: CancellationToken) {
    if !self.config.enabled {
      info!("Library auto-import is disabled");
      return;
    }

    // Become leader, or monitor until the current leader's lock expires.
    while !self.lock.acquire().await {
      tokio::select! {
        biased;
        _ = cancel.cancelled() => {
          debug!("Auto-import monitor stopped");
          return;
        }
        _ = tokio::time::sleep(TAKEOVER_POLL) => {}
      }
    }

    let interval = Duration::from_secs(self.config.interval_minutes.max(1) * 60);
    info!(
      interval_minutes = self.config.interval_minutes,
      library_dir = %self.config.library_dir.display(),
      owner = self.lock.owner(),
      "Auto-import scheduler started (this worker holds the lock)"
    );

    loop {
      // Refresh before each scan so a long import cannot outlive the TTL.
      if !self.lock.refresh().await {
        warn!("Lost the auto-import lock, stepping down");
        return;
      }

      match self.scan_once().await {
        Ok((imported, skipped)) => {
          if imported > 0 {
            info!(imported, skipped, "Auto-import scan complete");
          } else {
            debug!(skipped, "Auto-import scan found nothing new");
          }
        }
        Err(e) => warn!(error = %e, "Auto-import scan failed"),
      }

      tokio::select! {
        biased;
        _ = cancel.cancelled() => {
          self.lock.release().await;
          info!("Auto-import scheduler stopped");
          return;
        }
        _ = tokio::time::sleep(interval) => {}
      }
    }
  }

  /// One scan: admit new library files through the normal upload path and
  /// queue their processing jobs.
  pub async fn scan_once(&self) -> Result<(usize, usize), ServiceError> {
    let tenant = TenantId(self.config.library_tenant);
    let mut imported = 0usize;
    let mut skipped = 0usize;

    let mut entries = match tokio::fs::read_dir(&self.config.library_dir).await {
      Ok(entries) => entries,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        debug!(dir = %self.config.library_dir.display(), "Library directory does not exist yet");
        return Ok((0, 0));
      }
      Err(e) => return Err(ServiceError::internal(e.to_string())),
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
      let path = entry.path();
      if !path.is_file() {
        continue;
      }
      let Some(file_name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
        continue;
      };
      let Some(file_type) = processor::type_from_extension(&file_name) else {
        skipped += 1;
        continue;
      };

      // Already imported under this name.
      if self.db.get_document_by_name(tenant, &file_name).await?.is_some() {
        skipped += 1;
        continue;
      }

      let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) => {
          warn!(path = %path.display(), error = %e, "Failed to read library file");
          skipped += 1;
          continue;
        }
      };

      match self
        .orchestrator
        .upload(
          tenant,
          UploadRequest {
            file_name: file_name.clone(),
            file_type: file_type.to_string(),
            bytes,
          },
        )
        .await
      {
        Ok(document) => {
          self
            .queue
            .enqueue(Job::Process {
              tenant,
              document_id: document.id,
            })
            .await?;
          imported += 1;
        }
        Err(e) => {
          warn!(file = %file_name, error = %e, "Library file admission failed");
          skipped += 1;
        }
      }
    }

    Ok((imported, skipped))
  }
}
