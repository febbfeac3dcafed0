//! HTTP client for OpenAI-compatible vendor endpoints.
//!
//! All configured vendors (DashScope, Volcengine/Ark, Moonshot, Tencent)
//! expose the same JSON surface for chat completions, embeddings and rerank,
//! so one client parameterized by base URL and key covers every route.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{error, trace, warn};

use super::{ChatMessage, ErrorKind, ProviderError, Usage};

#[derive(Debug, Clone)]
pub struct VendorClient {
  http: reqwest::Client,
  vendor: String,
  base_url: String,
  api_key: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
  model: &'a str,
  input: &'a [String],
  #[serde(skip_serializing_if = "Option::is_none")]
  dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
  data: Vec<EmbeddingData>,
  #[serde(default)]
  usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
  embedding: Vec<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
  #[serde(default)]
  prompt_tokens: u64,
  #[serde(default)]
  completion_tokens: u64,
  #[serde(default)]
  total_tokens: u64,
}

impl From<WireUsage> for Usage {
  fn from(w: WireUsage) -> Self {
    let total = if w.total_tokens > 0 {
      w.total_tokens
    } else {
      w.prompt_tokens + w.completion_tokens
    };
    Self {
      input_tokens: w.prompt_tokens,
      output_tokens: w.completion_tokens,
      total_tokens: total,
    }
  }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
  model: &'a str,
  messages: &'a [ChatMessage],
  stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
  choices: Vec<ChatChoiceWire>,
  #[serde(default)]
  usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceWire {
  message: ChatChoice,
}

/// The assistant message of a chat completion.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
  pub content: String,
}

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
  model: &'a str,
  query: &'a str,
  documents: &'a [String],
  top_n: usize,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
  results: Vec<RerankResultWire>,
  #[serde(default)]
  usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct RerankResultWire {
  index: usize,
  relevance_score: f32,
}

/// One reranked document: its index into the input list plus its score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RerankResult {
  pub index: usize,
  pub score: f32,
}

impl VendorClient {
  pub fn new(vendor: impl Into<String>, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
    Self {
      http: reqwest::Client::new(),
      vendor: vendor.into(),
      base_url: base_url.into(),
      api_key: api_key.into(),
    }
  }

  pub fn vendor(&self) -> &str {
    &self.vendor
  }

  /// Embed a batch of texts. The caller is responsible for batching within
  /// the model family's per-call limit.
  pub async fn embeddings(
    &self,
    model: &str,
    texts: &[String],
    dimensions: Option<usize>,
  ) -> Result<(Vec<Vec<f32>>, Usage), ProviderError> {
    if texts.is_empty() {
      return Ok((Vec::new(), Usage::default()));
    }

    let request = EmbeddingRequest {
      model,
      input: texts,
      dimensions,
    };

    let start = Instant::now();
    trace!(vendor = %self.vendor, model, batch_size = texts.len(), "Sending embedding request");

    let body: EmbeddingResponse = self.post_json("embeddings", &request).await?;

    if body.data.len() != texts.len() {
      error!(
        vendor = %self.vendor,
        expected = texts.len(),
        got = body.data.len(),
        "Batch size mismatch in embedding response"
      );
      return Err(ProviderError::new(
        ErrorKind::Unknown,
        &self.vendor,
        format!("got {} embeddings for {} inputs", body.data.len(), texts.len()),
      ));
    }

    trace!(
      vendor = %self.vendor,
      elapsed_ms = start.elapsed().as_millis() as u64,
      "Embedding response parsed"
    );

    let usage = body.usage.into();
    Ok((body.data.into_iter().map(|d| d.embedding).collect(), usage))
  }

  /// Non-streaming chat completion.
  pub async fn chat_completion(&self, model: &str, messages: &[ChatMessage]) -> Result<(String, Usage), ProviderError> {
    let request = ChatRequest {
      model,
      messages,
      stream: false,
    };

    let body: ChatResponse = self.post_json("chat/completions", &request).await?;
    let content = body
      .choices
      .into_iter()
      .next()
      .map(|c| c.message.content)
      .ok_or_else(|| ProviderError::new(ErrorKind::Unknown, &self.vendor, "no choices in chat response"))?;

    Ok((content, body.usage.into()))
  }

  /// Score (query, document) pairs with the rerank model.
  pub async fn rerank(
    &self,
    model: &str,
    query: &str,
    documents: &[String],
    top_n: usize,
  ) -> Result<(Vec<RerankResult>, Usage), ProviderError> {
    let request = RerankRequest {
      model,
      query,
      documents,
      top_n,
    };

    let body: RerankResponse = self.post_json("rerank", &request).await?;
    let results = body
      .results
      .into_iter()
      .map(|r| RerankResult {
        index: r.index,
        score: r.relevance_score,
      })
      .collect();

    Ok((results, body.usage.into()))
  }

  async fn post_json<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
    &self,
    path: &str,
    request: &Req,
  ) -> Result<Resp, ProviderError> {
    let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);

    let response = match self
      .http
      .post(&url)
      .header("Authorization", format!("Bearer {}", self.api_key))
      .header("Content-Type", "application/json")
      .json(request)
      .send()
      .await
    {
      Ok(resp) => resp,
      Err(e) => {
        warn!(vendor = %self.vendor, error = %e, "Network error calling vendor");
        if e.is_timeout() {
          return Err(ProviderError::new(ErrorKind::Timeout, &self.vendor, e.to_string()));
        }
        return Err(ProviderError::new(ErrorKind::Transient, &self.vendor, e.to_string()));
      }
    };

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(self.map_error(status.as_u16(), &body));
    }

    response
      .json::<Resp>()
      .await
      .map_err(|e| ProviderError::new(ErrorKind::Unknown, &self.vendor, format!("bad response body: {e}")))
  }

  /// Map an HTTP error status (plus vendor error body) to an error kind.
  fn map_error(&self, status: u16, body: &str) -> ProviderError {
    let kind = match status {
      401 | 403 => ErrorKind::InvalidKey,
      429 => ErrorKind::Throttling,
      400 => {
        if body.contains("Arrearage") || body.contains("insufficient balance") {
          ErrorKind::Arrearage
        } else {
          ErrorKind::BadRequest
        }
      }
      s if s >= 500 => ErrorKind::Transient,
      _ => ErrorKind::Unknown,
    };

    match kind {
      ErrorKind::InvalidKey => error!(vendor = %self.vendor, status, "Vendor authentication failed"),
      ErrorKind::Arrearage => error!(vendor = %self.vendor, status, "Vendor account in arrears"),
      _ => warn!(vendor = %self.vendor, status, kind = kind.as_str(), "Vendor request failed"),
    }

    ProviderError::new(kind, &self.vendor, format!("HTTP {status}: {body}"))
  }
}
