//! Service layer: the operations behind every IPC endpoint, built around an
//! explicitly injected [`Services`] context (no global singletons).

pub mod documents;
pub mod error;
pub mod retrieval;

use std::sync::Arc;

pub use error::{Language, ServiceError};
use tracing::info;

use crate::{
  config::Config,
  db::KbDb,
  embed_cache::EmbeddingCache,
  ingest::{chunker::Chunker, orchestrator::Orchestrator},
  jobs::{JobQueue, JobRunner, RetryPolicy},
  keyword::KeywordIndex,
  limits::{CounterStore, TenantLimiter},
  provider::{ChatBackend, ProviderGateway},
  retrieval::RetrievalEngine,
  stream::StreamForwarder,
  vector::VectorStore,
};

/// Shared application context, constructed once at process start and passed
/// explicitly to handlers.
pub struct Services {
  pub config: Arc<Config>,
  pub db: Arc<KbDb>,
  pub vector: Arc<VectorStore>,
  pub keyword: Arc<KeywordIndex>,
  pub cache: Arc<EmbeddingCache>,
  pub limiter: Arc<TenantLimiter>,
  pub orchestrator: Arc<Orchestrator>,
  pub retrieval: Arc<RetrievalEngine>,
  pub forwarder: Arc<StreamForwarder>,
  pub chat: Arc<dyn ChatBackend>,
  pub store: Arc<CounterStore>,
  pub jobs: JobQueue,
}

impl Services {
  /// Wire every component. Returns the context plus the job runner whose
  /// workers the daemon spawns.
  pub async fn build(config: Config) -> Result<(Arc<Self>, JobRunner), ServiceError> {
    let config = Arc::new(config);

    let db = Arc::new(
      KbDb::open(&config.daemon.data_dir, config.embedding.validated_dimensions())
        .await
        .map_err(|e| ServiceError::internal(format!("database open failed: {e}")))?,
    );

    let gateway = Arc::new(ProviderGateway::from_config(&config));

    let vector = Arc::new(VectorStore::new(Arc::clone(&db), config.vector.clone()));
    let keyword = Arc::new(KeywordIndex::new(Arc::clone(&db)));
    let cache = Arc::new(EmbeddingCache::new(
      Arc::clone(&db),
      gateway.clone(),
      &config.embedding,
    ));

    let store = Arc::new(CounterStore::connect(config.limits.redis_url.as_deref()).await);
    let limiter = Arc::new(TenantLimiter::new(Arc::clone(&store), config.limits.clone()));

    let chat: Arc<dyn ChatBackend> = gateway.clone();
    let chunker = Arc::new(Chunker::from_config(&config.chunking, Some(chat.clone())));

    let ocr: Arc<dyn crate::provider::OcrBackend> = gateway.clone();
    let orchestrator = Arc::new(Orchestrator::new(
      Arc::clone(&db),
      Arc::clone(&vector),
      Arc::clone(&keyword),
      Arc::clone(&cache),
      Arc::clone(&limiter),
      chunker,
      Some(ocr),
      Arc::clone(&config),
    ));

    let rerank: Arc<dyn crate::provider::RerankBackend> = gateway.clone();
    let retrieval = Arc::new(RetrievalEngine::new(
      Arc::clone(&db),
      Arc::clone(&vector),
      Arc::clone(&keyword),
      Arc::clone(&cache),
      Some(rerank),
      Arc::clone(&limiter),
      Arc::clone(&config),
    ));

    let forwarder = Arc::new(StreamForwarder::new(gateway.dify().clone(), Arc::clone(&db)));

    // On first startup the keyword index is empty; bring it level with the
    // chunks table.
    let backfilled = keyword.backfill().await?;
    if backfilled > 0 {
      info!(backfilled, "Keyword index backfilled at startup");
    }

    let runner = JobRunner::new(
      Arc::clone(&orchestrator),
      Arc::clone(&db),
      config.ingest.job_workers,
      RetryPolicy::default(),
    );
    let jobs = runner.queue();

    let services = Arc::new(Self {
      config,
      db,
      vector,
      keyword,
      cache,
      limiter,
      orchestrator,
      retrieval,
      forwarder,
      chat,
      store,
      jobs,
    });

    Ok((services, runner))
  }
}
