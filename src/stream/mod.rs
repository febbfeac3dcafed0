//! SSE stream forwarder.
//!
//! Opens an upstream streaming chat (Dify-style `/chat-messages`) and
//! re-emits each upstream `data:` line to the downstream client as a
//! timestamped `data: <json>\n\n` frame. `[DONE]` or a `message_end` event
//! terminates the stream; usage from `message_end` is persisted best-effort.
//! A downstream disconnect cancels the upstream request and releases its
//! rate-limit slot.

use std::{sync::Arc, time::Instant};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
  db::{KbDb, UsageRecord},
  domain::tenant::TenantId,
  provider::DifySettings,
  service::error::ServiceError,
};

/// File attachment forwarded to the upstream chat.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamFile {
  #[serde(rename = "type")]
  pub kind: String,
  pub transfer_method: String,
  pub url: Option<String>,
  pub upload_file_id: Option<String>,
}

/// A streaming chat request from one downstream client.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRequest {
  pub message: String,
  pub user_id: String,
  pub conversation_id: Option<String>,
  pub files: Option<Vec<StreamFile>>,
  pub inputs: Option<serde_json::Value>,
}

/// One parsed upstream SSE line.
#[derive(Debug, Clone, PartialEq)]
pub enum SseLine {
  /// A `data:` payload that parsed as JSON
  Data(serde_json::Value),
  /// The `[DONE]` terminator
  Done,
}

/// Parse one upstream line. Non-`data:` lines and unparseable payloads are
/// skipped (`None`).
pub fn parse_sse_line(line: &str) -> Option<SseLine> {
  let line = line.trim();
  let payload = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))?;
  let payload = payload.trim();
  if payload.is_empty() {
    return None;
  }
  if payload == "[DONE]" {
    return Some(SseLine::Done);
  }
  serde_json::from_str(payload).ok().map(SseLine::Data)
}

/// Stamp an event with a millisecond timestamp and format the downstream
/// SSE frame.
pub fn format_frame(mut event: serde_json::Value) -> String {
  if let Some(object) = event.as_object_mut() {
    object.insert(
      "timestamp".to_string(),
      serde_json::Value::from(chrono::Utc::now().timestamp_millis()),
    );
  }
  format!("data: {event}\n\n")
}

fn synthetic_event(event: &str) -> String {
  format_frame(serde_json::json!({ "event": event }))
}

fn error_event(message: &str) -> String {
  format_frame(serde_json::json!({ "event": "error", "error": message }))
}

#[derive(Debug, Default, Deserialize)]
struct UpstreamUsage {
  #[serde(default)]
  prompt_tokens: u64,
  #[serde(default)]
  completion_tokens: u64,
  #[serde(default)]
  total_tokens: u64,
}

pub struct StreamForwarder {
  dify: DifySettings,
  db: Arc<KbDb>,
  http: reqwest::Client,
}

impl StreamForwarder {
  pub fn new(dify: DifySettings, db: Arc<KbDb>) -> Self {
    // No total timeout: streams run as long as the model talks. Stalled
    // reads are bounded by the configured socket-read timeout.
    let http = reqwest::Client::builder()
      .connect_timeout(std::time::Duration::from_secs(10))
      .read_timeout(std::time::Duration::from_secs(dify.timeout_secs))
      .build()
      .unwrap_or_default();

    Self { dify, db, http }
  }

  /// Open the upstream stream and forward frames into the returned channel.
  ///
  /// The forwarding task runs until the upstream terminates or `cancel`
  /// fires (downstream disconnect); either way the upstream connection is
  /// dropped and its concurrency slot released.
  pub async fn stream(
    &self,
    tenant: TenantId,
    request: StreamRequest,
    cancel: CancellationToken,
  ) -> Result<mpsc::Receiver<String>, ServiceError> {
    let Some(api_key) = self.dify.api_key.clone() else {
      return Err(ServiceError::ProviderInvalidKey("DIFY_API_KEY not configured".to_string()));
    };

    let guard = self.dify.limiter.acquire(true).await.map_err(ServiceError::from)?;

    let (tx, rx) = mpsc::channel::<String>(64);
    let http = self.http.clone();
    let base_url = self.dify.base_url.clone();
    let db = Arc::clone(&self.db);

    tokio::spawn(async move {
      // The guard lives for the duration of the upstream connection.
      let _guard = guard;
      let start = Instant::now();

      let mut payload = serde_json::json!({
        "inputs": request.inputs.clone().unwrap_or_else(|| serde_json::json!({})),
        "query": request.message,
        "response_mode": "streaming",
        "user": request.user_id,
        "auto_generate_name": true,
      });
      if let Some(conversation_id) = &request.conversation_id {
        payload["conversation_id"] = serde_json::Value::String(conversation_id.clone());
      }
      if let Some(files) = &request.files {
        payload["files"] = serde_json::to_value(files).unwrap_or_default();
      }

      let url = format!("{}/chat-messages", base_url.trim_end_matches('/'));
      debug!(url = %url, user = %request.user_id, "Opening upstream stream");

      let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
          debug!("Downstream disconnected before upstream connect");
          return;
        }
        result = http
          .post(&url)
          .header("Authorization", format!("Bearer {api_key}"))
          .json(&payload)
          .send() => result,
      };

      let response = match response {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => {
          let status = r.status();
          let body = r.text().await.unwrap_or_default();
          warn!(status = %status, "Upstream stream request failed");
          let _ = tx.send(error_event(&format!("HTTP {status}: {body}"))).await;
          return;
        }
        Err(e) => {
          warn!(error = %e, "Upstream stream connection failed");
          let _ = tx.send(error_event(&e.to_string())).await;
          return;
        }
      };

      let mut chunk_count = 0usize;
      let mut captured_usage: Option<UpstreamUsage> = None;
      let mut captured_conversation: Option<String> = request.conversation_id.clone();

      let mut body = response.bytes_stream();
      let mut buffer = String::new();
      let mut terminated = false;

      'forward: loop {
        let next = tokio::select! {
          biased;
          _ = cancel.cancelled() => {
            debug!(chunks = chunk_count, "Downstream disconnected, cancelling upstream");
            return;
          }
          next = body.next() => next,
        };

        let Some(bytes) = next else { break };
        let Ok(bytes) = bytes else {
          let _ = tx.send(error_event("upstream read error")).await;
          terminated = true;
          break;
        };

        buffer.push_str(&String::from_utf8_lossy(&bytes));
        while let Some(newline) = buffer.find('\n') {
          let line: String = buffer.drain(..=newline).collect();
          match parse_sse_line(&line) {
            Some(SseLine::Done) => {
              terminated = true;
              break 'forward;
            }
            Some(SseLine::Data(event)) => {
              let event_type = event.get("event").and_then(|e| e.as_str()).unwrap_or("").to_string();
              if let Some(conversation) = event.get("conversation_id").and_then(|c| c.as_str()) {
                captured_conversation = Some(conversation.to_string());
              }
              if event_type == "message_end"
                && let Some(usage) = event.get("metadata").and_then(|m| m.get("usage"))
              {
                captured_usage = serde_json::from_value(usage.clone()).ok();
              }

              chunk_count += 1;
              if tx.send(format_frame(event)).await.is_err() {
                // Receiver dropped: treat like a disconnect.
                return;
              }

              if event_type == "message_end" {
                terminated = true;
                break 'forward;
              }
            }
            None => {}
          }
        }
      }

      // Keep the transport well-formed when the upstream closed silently.
      if chunk_count == 0 {
        warn!(terminated, "Upstream stream yielded no chunks, sending synthetic completion");
        let _ = tx.send(synthetic_event("message_complete")).await;
      }

      if let Some(usage) = captured_usage {
        let record = UsageRecord {
          tenant_id: tenant,
          organization_id: None,
          conversation_id: captured_conversation,
          endpoint: "/api/ai_assistant/stream".to_string(),
          model_alias: "dify".to_string(),
          input_tokens: usage.prompt_tokens,
          output_tokens: usage.completion_tokens,
          total_tokens: if usage.total_tokens > 0 {
            usage.total_tokens
          } else {
            usage.prompt_tokens + usage.completion_tokens
          },
          response_time_ms: start.elapsed().as_secs_f64() * 1000.0,
          success: true,
        };
        // Best-effort: accounting failures never break the response.
        if let Err(e) = db.add_usage_record(&record).await {
          warn!(error = %e, "Failed to persist usage record");
        }
      }

      debug!(chunks = chunk_count, elapsed_ms = start.elapsed().as_millis() as u64, "Stream complete");
    });

    Ok(rx)
  }
}
