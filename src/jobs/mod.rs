//! Queue-based background job runner for document work.
//!
//! Each document is a unit of work and never spans workers. Transient
//! failures retry with exponential backoff (60·2^n seconds, three attempts);
//! terminal failures leave the document `failed` with its error message.
//! Batch jobs fan out child jobs as a group; batch counters advance as the
//! children finish.

pub mod scheduler;

use std::{sync::Arc, time::Duration};

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
  db::KbDb,
  domain::{document::DocumentId, tenant::TenantId},
  ingest::orchestrator::Orchestrator,
  service::error::ServiceError,
};

/// One queued unit of document work.
#[derive(Debug)]
pub enum Job {
  /// Run the full ingestion pipeline for a pending document.
  Process { tenant: TenantId, document_id: DocumentId },
  /// Apply new bytes with a partial reindex.
  Update {
    tenant: TenantId,
    document_id: DocumentId,
    bytes: Vec<u8>,
    new_file_name: Option<String>,
  },
  /// Fan out `Process` jobs for every document in a batch.
  Batch { tenant: TenantId, batch_id: String },
}

/// Retry policy for transient job failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  /// Backoff base: attempt n sleeps `base * 2^n`
  pub base_delay: Duration,
  /// Total attempts including the first
  pub max_attempts: u32,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      base_delay: Duration::from_secs(60),
      max_attempts: 3,
    }
  }
}

/// Handle used to enqueue jobs.
#[derive(Clone)]
pub struct JobQueue {
  tx: mpsc::Sender<Job>,
}

impl JobQueue {
  pub async fn enqueue(&self, job: Job) -> Result<(), ServiceError> {
    self
      .tx
      .send(job)
      .await
      .map_err(|_| ServiceError::internal("job queue closed"))
  }
}

pub struct JobRunner {
  orchestrator: Arc<Orchestrator>,
  db: Arc<KbDb>,
  workers: usize,
  retry: RetryPolicy,
  rx: Arc<Mutex<mpsc::Receiver<Job>>>,
  queue: JobQueue,
}

impl JobRunner {
  pub fn new(orchestrator: Arc<Orchestrator>, db: Arc<KbDb>, workers: usize, retry: RetryPolicy) -> Self {
    let (tx, rx) = mpsc::channel(256);
    Self {
      orchestrator,
      db,
      workers: workers.max(1),
      retry,
      rx: Arc::new(Mutex::new(rx)),
      queue: JobQueue { tx },
    }
  }

  pub fn queue(&self) -> JobQueue {
    self.queue.clone()
  }

  /// Spawn the worker pool. Workers run until the queue closes or the token
  /// fires.
  pub fn spawn_workers(&self, cancel: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
    info!(workers = self.workers, "Starting job workers");

    (0..self.workers)
      .map(|worker_id| {
        let rx = Arc::clone(&self.rx);
        let orchestrator = Arc::clone(&self.orchestrator);
        let db = Arc::clone(&self.db);
        let queue = self.queue.clone();
        let retry = self.retry;
        let cancel = cancel.clone();

        tokio::spawn(async move {
          loop {
            let job = {
              let mut rx = rx.lock().await;
              tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                job = rx.recv() => job,
              }
            };
            let Some(job) = job else { break };

            debug!(worker_id, "Job picked up");
            run_job(&orchestrator, &db, &queue, retry, &cancel, job).await;
          }
          debug!(worker_id, "Job worker stopped");
        })
      })
      .collect()
  }
}

async fn run_job(
  orchestrator: &Arc<Orchestrator>,
  db: &Arc<KbDb>,
  queue: &JobQueue,
  retry: RetryPolicy,
  cancel: &CancellationToken,
  job: Job,
) {
  match job {
    Job::Process { tenant, document_id } => {
      let success = run_with_retries(retry, cancel, || orchestrator.process(tenant, document_id)).await;
      finish_document_job(orchestrator, db, tenant, document_id, success).await;
    }
    Job::Update {
      tenant,
      document_id,
      bytes,
      new_file_name,
    } => {
      let success = run_with_retries(retry, cancel, || {
        let bytes = bytes.clone();
        let name = new_file_name.clone();
        async move { orchestrator.update(tenant, document_id, bytes, name).await.map(|_| ()) }
      })
      .await;
      finish_document_job(orchestrator, db, tenant, document_id, success).await;
    }
    Job::Batch { tenant, batch_id } => {
      // Fan out one Process job per member document.
      match db.list_documents_in_batch(&batch_id).await {
        Ok(documents) => {
          info!(batch_id = %batch_id, children = documents.len(), "Fanning out batch jobs");
          for document in documents {
            if queue
              .enqueue(Job::Process {
                tenant,
                document_id: document.id,
              })
              .await
              .is_err()
            {
              warn!(batch_id = %batch_id, "Queue closed during batch fan-out");
              break;
            }
          }
        }
        Err(e) => error!(batch_id = %batch_id, error = %e, "Failed to load batch documents"),
      }
    }
  }
}

/// Run an operation with exponential backoff on retryable failures.
async fn run_with_retries<F, Fut>(retry: RetryPolicy, cancel: &CancellationToken, mut operation: F) -> bool
where
  F: FnMut() -> Fut,
  Fut: std::future::Future<Output = Result<(), ServiceError>>,
{
  for attempt in 0..retry.max_attempts {
    match operation().await {
      Ok(()) => return true,
      Err(e) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
        let delay = retry.base_delay * 2u32.pow(attempt);
        warn!(
          attempt = attempt + 1,
          delay_secs = delay.as_secs(),
          error = %e,
          "Job failed transiently, backing off"
        );
        tokio::select! {
          _ = cancel.cancelled() => return false,
          _ = tokio::time::sleep(delay) => {}
        }
      }
      Err(e) => {
        error!(error = %e, kind = e.kind(), "Job failed terminally");
        return false;
      }
    }
  }
  false
}

/// Advance batch counters once a member document's job reaches a terminal
/// state.
async fn finish_document_job(
  orchestrator: &Arc<Orchestrator>,
  db: &Arc<KbDb>,
  tenant: TenantId,
  document_id: DocumentId,
  success: bool,
) {
  let Ok(Some(document)) = db.get_document(tenant, &document_id.to_string()).await else {
    return;
  };
  if let Some(batch_id) = document.batch_id
    && let Err(e) = orchestrator.record_batch_result(tenant, &batch_id.to_string(), success).await
  {
    warn!(batch_id = %batch_id, error = %e, "Failed to record batch progress");
  }
}
