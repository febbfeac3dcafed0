//! IPC server: accepts connections on a Unix socket and dispatches requests
//! to the service layer. Streaming chat responses are forwarded chunk by
//! chunk until a final `done` marker; a failed downstream write cancels the
//! upstream stream and releases its provider slot.

use std::{path::PathBuf, sync::Arc};

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::{
  codec::{Framed, LinesCodec},
  sync::CancellationToken,
};
use tracing::{debug, error, info, warn};

use crate::{
  domain::tenant::TenantId,
  ipc::{IpcError, Request, RequestData, Response, ResponseData, types::DocumentStatusPayload},
  service::{Language, ServiceError, Services},
};

pub struct ServerConfig {
  /// Path to the Unix socket for IPC
  pub socket_path: PathBuf,
  pub services: Arc<Services>,
}

/// IPC server. One task per connection; requests within a connection are
/// handled sequentially.
pub struct Server {
  config: ServerConfig,
}

impl Server {
  pub fn new(config: ServerConfig) -> Self {
    Self { config }
  }

  /// Run until the cancellation token fires.
  pub async fn run(&self, cancel: CancellationToken) -> Result<(), IpcError> {
    if self.config.socket_path.exists() {
      tokio::fs::remove_file(&self.config.socket_path).await?;
    }
    if let Some(parent) = self.config.socket_path.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }

    let listener = UnixListener::bind(&self.config.socket_path)?;
    info!("Server listening on {:?}", self.config.socket_path);

    loop {
      tokio::select! {
        biased;

        _ = cancel.cancelled() => {
          info!("Server shutting down (cancelled)");
          break;
        }

        result = listener.accept() => {
          match result {
            Ok((stream, _)) => {
              let services = Arc::clone(&self.config.services);
              let connection_cancel = cancel.child_token();
              tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, services, connection_cancel).await {
                  debug!(error = %e, "Connection ended with error");
                }
              });
            }
            Err(e) => error!("Accept error: {}", e),
          }
        }
      }
    }

    if self.config.socket_path.exists() {
      tokio::fs::remove_file(&self.config.socket_path).await?;
    }
    Ok(())
  }
}

async fn handle_connection(
  stream: UnixStream,
  services: Arc<Services>,
  cancel: CancellationToken,
) -> Result<(), IpcError> {
  debug!("Client connected");
  let framed = Framed::new(stream, LinesCodec::new());
  let (mut sink, mut stream) = framed.split();
  let mut request_count = 0u64;

  while let Some(result) = stream.next().await {
    let line = match result {
      Ok(line) => line,
      Err(e) => {
        warn!(error = %e, "Error reading from client");
        break;
      }
    };

    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }
    request_count += 1;

    let request: Request = match serde_json::from_str(trimmed) {
      Ok(request) => request,
      Err(e) => {
        warn!("Invalid request JSON: {}", e);
        let response = Response::error("unknown", -32700, "parse_error", format!("Parse error: {e}"));
        sink.send(serde_json::to_string(&response)?).await?;
        continue;
      }
    };

    let start = std::time::Instant::now();
    let id = request.id.clone();
    let tenant = TenantId(request.tenant_id);
    let language = Language::from_header(request.language.as_deref());

    // Streaming requests fan frames into the sink until done.
    if let Some(stream_request) = request.data.as_stream_request() {
      let stream_cancel = cancel.child_token();
      match services.forwarder.stream(tenant, stream_request, stream_cancel.clone()).await {
        Ok(mut frames) => {
          while let Some(frame) = frames.recv().await {
            let chunk = Response::stream_chunk(&id, frame);
            if sink.send(serde_json::to_string(&chunk)?).await.is_err() {
              // Downstream went away: propagate cancellation upstream.
              debug!("Client disconnected mid-stream, cancelling upstream");
              stream_cancel.cancel();
              return Ok(());
            }
          }
          sink.send(serde_json::to_string(&Response::stream_done(&id))?).await?;
        }
        Err(e) => {
          let response = Response::error(&id, e.code(), e.kind(), e.user_message(language));
          sink.send(serde_json::to_string(&response)?).await?;
        }
      }
      continue;
    }

    let response = match dispatch(&services, tenant, request.data).await {
      Ok(data) => Response::success(&id, data),
      Err(e) => {
        debug!(kind = e.kind(), error = %e, "Request failed");
        Response::error(&id, e.code(), e.kind(), e.user_message(language))
      }
    };
    sink.send(serde_json::to_string(&response)?).await?;

    debug!(
      id = %id,
      elapsed_ms = start.elapsed().as_millis() as u64,
      "Request completed"
    );
  }

  debug!(requests_handled = request_count, "Client disconnected");
  Ok(())
}

/// Route one non-streaming request to its service operation.
async fn dispatch(services: &Services, tenant: TenantId, data: RequestData) -> Result<ResponseData, ServiceError> {
  match data {
    RequestData::UploadDocument {
      file_name,
      file_type,
      content_base64,
    } => {
      let document = services
        .upload_document(tenant, file_name, file_type, &content_base64)
        .await?;
      Ok(ResponseData::Document(Box::new(document)))
    }
    RequestData::BatchUploadDocuments { files } => {
      let files = files
        .into_iter()
        .map(|f| (f.file_name, f.file_type, f.content_base64))
        .collect();
      let batch = services.batch_upload(tenant, files).await?;
      Ok(ResponseData::Batch(batch))
    }
    RequestData::GetBatch { batch_id } => Ok(ResponseData::Batch(services.get_batch(tenant, &batch_id).await?)),
    RequestData::ListDocuments => Ok(ResponseData::Documents(services.list_documents(tenant).await?)),
    RequestData::GetDocument { document_id } => Ok(ResponseData::Document(Box::new(
      services.get_document(tenant, &document_id).await?,
    ))),
    RequestData::UpdateDocument {
      document_id,
      file_name,
      content_base64,
    } => {
      let document = services
        .update_document(tenant, &document_id, file_name, &content_base64)
        .await?;
      Ok(ResponseData::Document(Box::new(document)))
    }
    RequestData::DeleteDocument { document_id } => {
      services.delete_document(tenant, &document_id).await?;
      Ok(ResponseData::Ack)
    }
    RequestData::GetDocumentStatus { document_id } => {
      let document = services.get_document(tenant, &document_id).await?;
      Ok(ResponseData::Status(DocumentStatusPayload::from(&document)))
    }
    RequestData::GetDocumentChunks {
      document_id,
      page,
      page_size,
    } => {
      let (chunks, total) = services.document_chunks(tenant, &document_id, page, page_size).await?;
      Ok(ResponseData::Chunks(crate::ipc::types::ChunkPage {
        chunks,
        page,
        page_size,
        total,
      }))
    }
    RequestData::RollbackDocument {
      document_id,
      version_number,
    } => {
      let document = services.rollback_document(tenant, &document_id, version_number).await?;
      Ok(ResponseData::Document(Box::new(document)))
    }
    RequestData::ListDocumentVersions { document_id } => Ok(ResponseData::Versions(
      services.document_versions(tenant, &document_id).await?,
    )),
    RequestData::UpdateDocumentMetadata {
      document_id,
      category,
      tags,
    } => {
      let document = services
        .update_document_metadata(tenant, &document_id, category, tags)
        .await?;
      Ok(ResponseData::Document(Box::new(document)))
    }
    RequestData::RetrievalTest {
      query,
      method,
      top_k,
      score_threshold,
    } => {
      let response = services
        .retrieval_test(tenant, query, method, top_k, score_threshold)
        .await?;
      Ok(ResponseData::Retrieval(Box::new(response)))
    }
    RequestData::RetrievalHistory => Ok(ResponseData::History(services.retrieval_history(tenant).await?)),
    RequestData::SubmitFeedback {
      query_id,
      kind,
      score,
      relevant_chunk_ids,
      irrelevant_chunk_ids,
    } => {
      services
        .submit_feedback(tenant, &query_id, &kind, score, relevant_chunk_ids, irrelevant_chunk_ids)
        .await?;
      Ok(ResponseData::Ack)
    }
    RequestData::CreateEvaluationDataset { name, queries } => {
      services.create_evaluation_dataset(tenant, name, queries).await?;
      Ok(ResponseData::Ack)
    }
    RequestData::ListEvaluationDatasets => Ok(ResponseData::Datasets(
      services.list_evaluation_datasets(tenant).await?,
    )),
    RequestData::RunEvaluation { dataset_id, method } => {
      let report = services.run_evaluation(tenant, &dataset_id, method).await?;
      Ok(ResponseData::Evaluation(Box::new(report)))
    }
    RequestData::CompressionMetrics => Ok(ResponseData::Compression(services.compression_metrics(tenant).await?)),
    RequestData::VectorDiagnostics => Ok(ResponseData::Diagnostics(services.vector_diagnostics(tenant).await?)),
    RequestData::GenerateGraph { prompt, model_alias } => {
      Ok(ResponseData::Generated(services.generate_graph(prompt, model_alias).await?))
    }
    RequestData::StreamChat { .. } => Err(ServiceError::internal("stream requests are handled separately")),
    RequestData::Ping => Ok(ResponseData::Pong),
  }
}
