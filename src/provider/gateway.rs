//! The provider gateway: logical model aliases routed to concrete vendors,
//! with per-route rate limits and optional load balancing in front.

use std::{collections::HashMap, sync::Arc, time::Instant};

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
  ChatBackend, ChatMessage, EmbeddingBackend, ErrorKind, Metered, ProviderError, RerankBackend, RouteLimiter, Usage,
  client::{RerankResult, VendorClient},
  validation,
};
use crate::config::Config;

/// Logical model alias exposed to the rest of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelAlias {
  Qwen,
  Deepseek,
  Kimi,
  Doubao,
  Hunyuan,
  Dify,
}

impl ModelAlias {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Qwen => "qwen",
      Self::Deepseek => "deepseek",
      Self::Kimi => "kimi",
      Self::Doubao => "doubao",
      Self::Hunyuan => "hunyuan",
      Self::Dify => "dify",
    }
  }
}

impl std::str::FromStr for ModelAlias {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "qwen" => Ok(Self::Qwen),
      "deepseek" => Ok(Self::Deepseek),
      "kimi" => Ok(Self::Kimi),
      "doubao" => Ok(Self::Doubao),
      "hunyuan" => Ok(Self::Hunyuan),
      "dify" => Ok(Self::Dify),
      other => Err(format!("unknown model alias: {other}")),
    }
  }
}

/// Concrete vendor behind a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
  Dashscope,
  Volcengine,
  Moonshot,
  Tencent,
}

impl Vendor {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Dashscope => "dashscope",
      Self::Volcengine => "volcengine",
      Self::Moonshot => "moonshot",
      Self::Tencent => "tencent",
    }
  }
}

/// One vendor route for an alias.
struct Route {
  vendor: Vendor,
  model: String,
  client: VendorClient,
  limiter: RouteLimiter,
}

/// Settings the SSE forwarder needs to open the upstream Dify stream.
#[derive(Clone)]
pub struct DifySettings {
  pub base_url: String,
  pub api_key: Option<String>,
  pub timeout_secs: u64,
  pub limiter: RouteLimiter,
}

/// Gateway over every upstream vendor. Construct once at process start and
/// share via `Arc`.
pub struct ProviderGateway {
  routes: HashMap<ModelAlias, Vec<Arc<Route>>>,
  balancer: super::LoadBalancer,
  load_balancing_enabled: bool,

  embedding_route: Option<Arc<Route>>,
  embedding_model: String,
  embedding_dimensions: usize,

  rerank_model: String,
  ocr_model: String,

  dify: DifySettings,
  http: reqwest::Client,
}

impl ProviderGateway {
  pub fn from_config(config: &Config) -> Self {
    let p = &config.provider;

    let dashscope = p.dashscope_api_key.as_ref().map(|key| {
      (
        VendorClient::new("dashscope", &p.dashscope_base_url, key),
        RouteLimiter::new("dashscope", p.dashscope_limits.qpm_limit, p.dashscope_limits.concurrent_limit),
      )
    });
    let volcengine = p.volcengine_api_key.as_ref().map(|key| {
      (
        VendorClient::new("volcengine", &p.volcengine_base_url, key),
        RouteLimiter::new(
          "volcengine",
          p.volcengine_limits.qpm_limit,
          p.volcengine_limits.concurrent_limit,
        ),
      )
    });
    let moonshot = p.moonshot_api_key.as_ref().map(|key| {
      (
        VendorClient::new("moonshot", &p.moonshot_base_url, key),
        RouteLimiter::new("moonshot", p.moonshot_limits.qpm_limit, p.moonshot_limits.concurrent_limit),
      )
    });
    let tencent = p.tencent_api_key.as_ref().map(|key| {
      (
        VendorClient::new("tencent", &p.tencent_base_url, key),
        RouteLimiter::new("tencent", p.tencent_limits.qpm_limit, p.tencent_limits.concurrent_limit),
      )
    });

    let make_route = |pair: &Option<(VendorClient, RouteLimiter)>, vendor: Vendor, model: &str| -> Option<Arc<Route>> {
      pair.as_ref().map(|(client, limiter)| {
        Arc::new(Route {
          vendor,
          model: model.to_string(),
          client: client.clone(),
          limiter: limiter.clone(),
        })
      })
    };

    let mut routes: HashMap<ModelAlias, Vec<Arc<Route>>> = HashMap::new();
    routes.insert(
      ModelAlias::Qwen,
      make_route(&dashscope, Vendor::Dashscope, "qwen-plus").into_iter().collect(),
    );
    routes.insert(
      ModelAlias::Deepseek,
      [
        make_route(&dashscope, Vendor::Dashscope, "deepseek-v3"),
        make_route(&volcengine, Vendor::Volcengine, "deepseek-v3-250324"),
      ]
      .into_iter()
      .flatten()
      .collect(),
    );
    routes.insert(
      ModelAlias::Kimi,
      make_route(&moonshot, Vendor::Moonshot, "moonshot-v1-8k").into_iter().collect(),
    );
    routes.insert(
      ModelAlias::Doubao,
      make_route(&volcengine, Vendor::Volcengine, "doubao-1-5-pro-32k")
        .into_iter()
        .collect(),
    );
    routes.insert(
      ModelAlias::Hunyuan,
      make_route(&tencent, Vendor::Tencent, "hunyuan-turbo").into_iter().collect(),
    );

    let embedding_model = config.embedding.model.clone();
    let embedding_route = make_route(&dashscope, Vendor::Dashscope, &embedding_model);

    let dify = DifySettings {
      base_url: p.dify_base_url.clone(),
      api_key: p.dify_api_key.clone(),
      timeout_secs: p.dify_timeout_secs,
      limiter: RouteLimiter::new("dify", 6000, 500),
    };

    info!(
      load_balancing = p.load_balancing_enabled,
      strategy = ?p.load_balancing_strategy,
      embedding_model = %embedding_model,
      dimensions = config.embedding.validated_dimensions(),
      "Provider gateway initialized"
    );

    Self {
      routes,
      balancer: super::LoadBalancer::new(p.load_balancing_strategy, p.normalized_weights()),
      load_balancing_enabled: p.load_balancing_enabled,
      embedding_route,
      embedding_model,
      embedding_dimensions: config.embedding.validated_dimensions(),
      rerank_model: config.retrieval.rerank_model.clone(),
      ocr_model: p.ocr_model.clone(),
      dify,
      http: reqwest::Client::new(),
    }
  }

  /// Settings for the SSE forwarder's upstream connection.
  pub fn dify(&self) -> &DifySettings {
    &self.dify
  }

  /// QPM headroom on the embedding route, used by ingestion to fail fast
  /// before partially embedding a document.
  pub async fn embedding_headroom(&self) -> usize {
    match &self.embedding_route {
      Some(route) => route.limiter.remaining_qpm().await,
      None => 0,
    }
  }

  fn routes_for(&self, alias: ModelAlias) -> Result<&[Arc<Route>], ProviderError> {
    let routes = self.routes.get(&alias).map(|r| r.as_slice()).unwrap_or(&[]);
    if routes.is_empty() {
      return Err(ProviderError::new(
        ErrorKind::InvalidKey,
        alias.as_str(),
        "no route configured (missing API key)",
      ));
    }
    Ok(routes)
  }

  /// Run one chat call against the selected route, with at most one
  /// re-selection to an alternate route on throttling/transient failure.
  async fn chat_with_reselection(
    &self,
    alias: ModelAlias,
    messages: &[ChatMessage],
  ) -> Result<Metered<String>, ProviderError> {
    let routes = self.routes_for(alias)?;
    let vendor_names: Vec<&str> = routes.iter().map(|r| r.vendor.as_str()).collect();

    let mut exclude: Option<&str> = None;
    let mut last_error: Option<ProviderError> = None;

    for attempt in 0..2 {
      let index = if routes.len() > 1 && self.load_balancing_enabled {
        self.balancer.select(&vendor_names, exclude)
      } else {
        0
      };
      let route = &routes[index];

      let guard = route.limiter.acquire(true).await?;
      let start = Instant::now();
      match route.client.chat_completion(&route.model, messages).await {
        Ok((content, usage)) => {
          debug!(
            alias = alias.as_str(),
            vendor = route.vendor.as_str(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            total_tokens = usage.total_tokens,
            "Chat completion finished"
          );
          return Ok(Metered {
            value: content,
            usage,
            elapsed: start.elapsed(),
          });
        }
        Err(e) => {
          if matches!(e.kind, ErrorKind::Timeout | ErrorKind::Transient) {
            guard.refund().await;
          }

          let may_reselect = attempt == 0
            && routes.len() > 1
            && self.load_balancing_enabled
            && matches!(e.kind, ErrorKind::Throttling | ErrorKind::Transient);
          if may_reselect {
            warn!(
              alias = alias.as_str(),
              vendor = route.vendor.as_str(),
              kind = e.kind.as_str(),
              "Route failed, re-selecting once across alternate route"
            );
            exclude = Some(route.vendor.as_str());
            last_error = Some(e);
            continue;
          }
          return Err(e);
        }
      }
    }

    Err(last_error.unwrap_or_else(|| ProviderError::new(ErrorKind::Unknown, alias.as_str(), "route selection failed")))
  }

  /// Dify chat in blocking mode (the streaming path lives in the forwarder).
  async fn chat_dify(&self, messages: &[ChatMessage]) -> Result<Metered<String>, ProviderError> {
    let Some(api_key) = self.dify.api_key.as_ref() else {
      return Err(ProviderError::new(ErrorKind::InvalidKey, "dify", "DIFY_API_KEY not configured"));
    };

    // Dify takes a single query string; use the last user message.
    let query = messages
      .iter()
      .rev()
      .find(|m| m.role == "user")
      .and_then(|m| m.content.as_str().map(String::from))
      .unwrap_or_default();

    let guard = self.dify.limiter.acquire(true).await?;
    let start = Instant::now();

    let url = format!("{}/chat-messages", self.dify.base_url.trim_end_matches('/'));
    let response = self
      .http
      .post(&url)
      .header("Authorization", format!("Bearer {api_key}"))
      .json(&serde_json::json!({
        "inputs": {},
        "query": query,
        "response_mode": "blocking",
        "user": "gateway",
      }))
      .send()
      .await;

    let response = match response {
      Ok(r) => r,
      Err(e) => {
        guard.refund().await;
        let kind = if e.is_timeout() { ErrorKind::Timeout } else { ErrorKind::Transient };
        return Err(ProviderError::new(kind, "dify", e.to_string()));
      }
    };

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      if status.as_u16() >= 500 {
        guard.refund().await;
      }
      let kind = match status.as_u16() {
        401 | 403 => ErrorKind::InvalidKey,
        429 => ErrorKind::Throttling,
        s if s >= 500 => ErrorKind::Transient,
        _ => ErrorKind::BadRequest,
      };
      return Err(ProviderError::new(kind, "dify", format!("HTTP {status}: {body}")));
    }

    #[derive(Deserialize)]
    struct DifyBlocking {
      answer: String,
      #[serde(default)]
      metadata: serde_json::Value,
    }

    let body: DifyBlocking = response
      .json()
      .await
      .map_err(|e| ProviderError::new(ErrorKind::Unknown, "dify", e.to_string()))?;

    let usage = body
      .metadata
      .get("usage")
      .and_then(|u| serde_json::from_value::<DifyUsage>(u.clone()).ok())
      .unwrap_or_default();

    Ok(Metered {
      value: body.answer,
      usage: Usage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
      },
      elapsed: start.elapsed(),
    })
  }

  /// Extract text from an image via the vision-capable chat model.
  async fn ocr_via_vision(&self, bytes: &[u8], mime: &str) -> Result<Metered<String>, ProviderError> {
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    let data_url = format!("data:{mime};base64,{encoded}");

    let route = self
      .routes_for(ModelAlias::Qwen)?
      .first()
      .cloned()
      .ok_or_else(|| ProviderError::new(ErrorKind::InvalidKey, "dashscope", "no OCR route configured"))?;

    let messages = vec![ChatMessage::user_with_image(
      data_url,
      "Extract all text from this image. Return only the extracted text, preserving the reading order.",
    )];

    let guard = route.limiter.acquire(true).await?;
    let start = Instant::now();
    match route.client.chat_completion(&self.ocr_model, &messages).await {
      Ok((content, usage)) => Ok(Metered {
        value: content,
        usage,
        elapsed: start.elapsed(),
      }),
      Err(e) => {
        if matches!(e.kind, ErrorKind::Timeout | ErrorKind::Transient) {
          guard.refund().await;
        }
        Err(e)
      }
    }
  }

  /// Embed one sub-batch within the model family's per-call limit.
  async fn embed_single_batch(&self, route: &Route, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
    if texts.is_empty() {
      return Ok(Vec::new());
    }

    let guard = route.limiter.acquire(true).await?;
    let result = route
      .client
      .embeddings(&self.embedding_model, texts, Some(self.embedding_dimensions))
      .await;

    let (vectors, _usage) = match result {
      Ok(ok) => ok,
      Err(e) => {
        // Network errors and 5xx never hit the upstream rate limiter.
        if matches!(e.kind, ErrorKind::Timeout | ErrorKind::Transient) {
          guard.refund().await;
        }
        return Err(e);
      }
    };

    let mut normalized = Vec::with_capacity(vectors.len());
    for vector in vectors {
      match validation::validated_normalized(vector) {
        Some(v) => normalized.push(v),
        None => return Err(ProviderError::embed_invalid_vector(route.vendor.as_str())),
      }
    }

    Ok(normalized)
  }
}

#[derive(Debug, Default, Deserialize)]
struct DifyUsage {
  #[serde(default)]
  prompt_tokens: u64,
  #[serde(default)]
  completion_tokens: u64,
  #[serde(default)]
  total_tokens: u64,
}

#[async_trait::async_trait]
impl EmbeddingBackend for ProviderGateway {
  fn provider_name(&self) -> &str {
    "dashscope"
  }

  fn model_id(&self) -> &str {
    &self.embedding_model
  }

  fn dimensions(&self) -> usize {
    self.embedding_dimensions
  }

  fn batch_size(&self) -> usize {
    if self.embedding_model.contains("v4") { 10 } else { 25 }
  }

  async fn remaining_qpm(&self) -> usize {
    self.embedding_headroom().await
  }

  async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
    if texts.is_empty() {
      return Ok(Vec::new());
    }

    let route = self
      .embedding_route
      .as_ref()
      .ok_or_else(|| ProviderError::new(ErrorKind::InvalidKey, "dashscope", "no embedding route configured"))?;

    let batch_size = self.batch_size();
    let sub_batches: Vec<&[String]> = texts.chunks(batch_size).collect();
    debug!(
      batch_size = texts.len(),
      sub_batches = sub_batches.len(),
      model = %self.embedding_model,
      "Embedding batch"
    );

    // Sub-batches run concurrently; the route limiter throttles them.
    let futures: Vec<_> = sub_batches
      .into_iter()
      .enumerate()
      .map(|(index, chunk)| async move { self.embed_single_batch(route, chunk).await.map(|v| (index, v)) })
      .collect();

    let mut indexed: Vec<(usize, Vec<Vec<f32>>)> = Vec::new();
    for result in futures::future::join_all(futures).await {
      indexed.push(result?);
    }
    indexed.sort_by_key(|(index, _)| *index);

    let mut all = Vec::with_capacity(texts.len());
    for (_, vectors) in indexed {
      all.extend(vectors);
    }
    Ok(all)
  }
}

#[async_trait::async_trait]
impl ChatBackend for ProviderGateway {
  async fn chat(&self, alias: ModelAlias, messages: Vec<ChatMessage>) -> Result<Metered<String>, ProviderError> {
    match alias {
      ModelAlias::Dify => self.chat_dify(&messages).await,
      _ => self.chat_with_reselection(alias, &messages).await,
    }
  }
}

#[async_trait::async_trait]
impl super::OcrBackend for ProviderGateway {
  async fn ocr(&self, bytes: &[u8], mime: &str) -> Result<Metered<String>, ProviderError> {
    self.ocr_via_vision(bytes, mime).await
  }
}

#[async_trait::async_trait]
impl RerankBackend for ProviderGateway {
  async fn rerank(
    &self,
    query: &str,
    documents: &[String],
    top_n: usize,
    threshold: Option<f32>,
  ) -> Result<Vec<RerankResult>, ProviderError> {
    if documents.is_empty() {
      return Ok(Vec::new());
    }

    let route = self
      .routes_for(ModelAlias::Qwen)?
      .first()
      .cloned()
      .ok_or_else(|| ProviderError::new(ErrorKind::InvalidKey, "dashscope", "no rerank route configured"))?;

    let guard = route.limiter.acquire(true).await?;
    let result = route.client.rerank(&self.rerank_model, query, documents, top_n).await;

    let (mut results, _usage) = match result {
      Ok(ok) => ok,
      Err(e) => {
        if matches!(e.kind, ErrorKind::Timeout | ErrorKind::Transient) {
          guard.refund().await;
        }
        return Err(e);
      }
    };

    // Threshold filter applies after the call; then best-first, capped at top_n.
    if let Some(threshold) = threshold {
      results.retain(|r| r.score >= threshold);
    }
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    results.truncate(top_n);

    Ok(results)
  }
}
