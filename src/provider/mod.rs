//! Provider gateway: a uniform surface over the upstream LLM, embedding and
//! rerank vendors, plus the per-route rate limiting and load balancing that
//! sits in front of them.

mod balancer;
mod client;
mod gateway;
mod rate_limit;
pub mod validation;

use std::time::Duration;

pub use balancer::LoadBalancer;
pub use client::{RerankResult, VendorClient};
pub use gateway::{DifySettings, ModelAlias, ProviderGateway, Vendor};
pub use rate_limit::{RouteGuard, RouteLimiter, SlidingWindowLimiter};
use serde::{Deserialize, Serialize};

/// Classified upstream failure, carried through every provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  Arrearage,
  InvalidKey,
  Throttling,
  Timeout,
  BadRequest,
  Transient,
  Unknown,
}

impl ErrorKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Arrearage => "arrearage",
      Self::InvalidKey => "invalid_key",
      Self::Throttling => "throttling",
      Self::Timeout => "timeout",
      Self::BadRequest => "bad_request",
      Self::Transient => "transient",
      Self::Unknown => "unknown",
    }
  }

  /// Whether a call failing with this kind may be retried (possibly on an
  /// alternate route). Arrearage and invalid-key never are.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::Throttling | Self::Timeout | Self::Transient)
  }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind:?} from {vendor}: {message}")]
pub struct ProviderError {
  pub kind: ErrorKind,
  pub vendor: String,
  pub message: String,
}

impl ProviderError {
  pub fn new(kind: ErrorKind, vendor: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      kind,
      vendor: vendor.into(),
      message: message.into(),
    }
  }

  pub fn is_retryable(&self) -> bool {
    self.kind.is_retryable()
  }

  /// Invalid vector returned by an embedding call (NaN/Inf/zero norm).
  pub fn embed_invalid_vector(vendor: impl Into<String>) -> Self {
    Self::new(
      ErrorKind::BadRequest,
      vendor,
      "embedding contains NaN/Inf or has zero norm",
    )
  }
}

/// Token accounting for one upstream call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
  pub input_tokens: u64,
  pub output_tokens: u64,
  pub total_tokens: u64,
}

/// A provider response together with its usage triple and wall time.
#[derive(Debug, Clone)]
pub struct Metered<T> {
  pub value: T,
  pub usage: Usage,
  pub elapsed: Duration,
}

/// One message in a chat conversation. `content` is either a plain string or
/// the multimodal array form used by vision calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
  pub role: String,
  pub content: serde_json::Value,
}

impl ChatMessage {
  pub fn system(text: impl Into<String>) -> Self {
    Self {
      role: "system".to_string(),
      content: serde_json::Value::String(text.into()),
    }
  }

  pub fn user(text: impl Into<String>) -> Self {
    Self {
      role: "user".to_string(),
      content: serde_json::Value::String(text.into()),
    }
  }

  /// Vision message: an inline base64 image followed by an instruction.
  pub fn user_with_image(data_url: String, text: impl Into<String>) -> Self {
    Self {
      role: "user".to_string(),
      content: serde_json::json!([
        {"type": "image_url", "image_url": {"url": data_url}},
        {"type": "text", "text": text.into()},
      ]),
    }
  }
}

/// Embedding surface of the gateway, abstracted for tests and the embedding
/// cache.
#[async_trait::async_trait]
pub trait EmbeddingBackend: Send + Sync {
  fn provider_name(&self) -> &str;
  fn model_id(&self) -> &str;
  fn dimensions(&self) -> usize;
  /// Texts per upstream call: 10 for the v4 model family, 25 otherwise.
  fn batch_size(&self) -> usize;

  /// Embed a batch. Returned vectors are validated and L2-normalized.
  async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;

  /// QPM headroom left on the embedding route in the current window.
  /// Backends without route limits report unbounded headroom.
  async fn remaining_qpm(&self) -> usize {
    usize::MAX
  }
}

/// Chat surface of the gateway.
#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync {
  async fn chat(&self, alias: ModelAlias, messages: Vec<ChatMessage>) -> Result<Metered<String>, ProviderError>;
}

/// OCR surface of the gateway (vision-capable chat).
#[async_trait::async_trait]
pub trait OcrBackend: Send + Sync {
  async fn ocr(&self, bytes: &[u8], mime: &str) -> Result<Metered<String>, ProviderError>;
}

/// Rerank surface of the gateway.
#[async_trait::async_trait]
pub trait RerankBackend: Send + Sync {
  /// Score (query, doc) pairs. Results below `threshold` are dropped, the
  /// rest sorted by score descending and truncated to `top_n`.
  async fn rerank(
    &self,
    query: &str,
    documents: &[String],
    top_n: usize,
    threshold: Option<f32>,
  ) -> Result<Vec<RerankResult>, ProviderError>;
}
