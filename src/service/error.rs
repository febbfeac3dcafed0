//! Unified error type for service operations.
//!
//! Every failure carries a stable error kind plus a retryability flag;
//! admission and rate-limit failures additionally render a localized
//! user-facing message (Chinese or English, from the request language).

use crate::{
  db::DbError,
  ingest::{chunker::ChunkError, processor::ProcessError},
  limits::LimitExceeded,
  provider::{ErrorKind as ProviderErrorKind, ProviderError},
};

/// Request language for user-facing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Language {
  Zh,
  #[default]
  En,
}

impl Language {
  pub fn from_header(value: Option<&str>) -> Self {
    match value {
      Some(v) if v.starts_with("zh") => Self::Zh,
      _ => Self::En,
    }
  }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
  #[error("document quota exceeded: {0}")]
  QuotaExceeded(String),
  #[error("file too large: {size} bytes (max {max})")]
  FileTooLarge { size: u64, max: u64 },
  #[error("unsupported file type: {0}")]
  UnsupportedType(String),
  #[error("file content does not match claimed type: {0}")]
  TypeMismatch(String),
  #[error("text extraction failed: {0}")]
  ExtractionFailed(String),
  #[error("chunking failed: {0}")]
  ChunkingFailed(String),
  #[error("embedding produced an invalid vector: {0}")]
  EmbedInvalidVector(String),
  #[error("provider account in arrears: {0}")]
  ProviderArrearage(String),
  #[error("provider API key invalid: {0}")]
  ProviderInvalidKey(String),
  #[error("provider throttled: {0}")]
  ProviderThrottled(String),
  #[error("provider transient failure: {0}")]
  ProviderTransient(String),
  #[error("rate limited: {0}")]
  RateLimited(String),
  #[error("store write failed: {0}")]
  StoreWriteFailed(String),
  #[error("{item_type} not found: {id}")]
  NotFound { item_type: &'static str, id: String },
  #[error("forbidden: {0}")]
  Forbidden(String),
  #[error("conflict: {0}")]
  Conflict(String),
  #[error("internal error: {0}")]
  Internal(String),
}

impl ServiceError {
  /// Stable kind string carried on the wire.
  pub fn kind(&self) -> &'static str {
    match self {
      Self::QuotaExceeded(_) => "quota_exceeded",
      Self::FileTooLarge { .. } => "file_too_large",
      Self::UnsupportedType(_) => "unsupported_type",
      Self::TypeMismatch(_) => "type_mismatch",
      Self::ExtractionFailed(_) => "extraction_failed",
      Self::ChunkingFailed(_) => "chunking_failed",
      Self::EmbedInvalidVector(_) => "embed_invalid_vector",
      Self::ProviderArrearage(_) => "provider_arrearage",
      Self::ProviderInvalidKey(_) => "provider_invalid_key",
      Self::ProviderThrottled(_) => "provider_throttled",
      Self::ProviderTransient(_) => "provider_transient",
      Self::RateLimited(_) => "rate_limited",
      Self::StoreWriteFailed(_) => "store_write_failed",
      Self::NotFound { .. } => "not_found",
      Self::Forbidden(_) => "forbidden",
      Self::Conflict(_) => "conflict",
      Self::Internal(_) => "internal",
    }
  }

  /// Whether retrying (possibly on another route) can help.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      Self::ProviderThrottled(_) | Self::ProviderTransient(_) | Self::RateLimited(_) | Self::StoreWriteFailed(_)
    )
  }

  /// RPC error code, following JSON-RPC conventions:
  /// - `-32602`: invalid params (admission / validation failures)
  /// - `-32004`: not found
  /// - `-32000`: server error (everything else)
  pub fn code(&self) -> i32 {
    match self {
      Self::QuotaExceeded(_)
      | Self::FileTooLarge { .. }
      | Self::UnsupportedType(_)
      | Self::TypeMismatch(_)
      | Self::Conflict(_) => -32602,
      Self::NotFound { .. } => -32004,
      _ => -32000,
    }
  }

  /// Localized message for user-visible failures.
  pub fn user_message(&self, lang: Language) -> String {
    match (self, lang) {
      (Self::QuotaExceeded(msg), Language::Zh) => format!("文档数量已达上限：{msg}"),
      (Self::QuotaExceeded(msg), Language::En) => format!("Document limit reached: {msg}"),
      (Self::FileTooLarge { size, max }, Language::Zh) => {
        format!("文件大小（{size} 字节）超过上限（{max} 字节）")
      }
      (Self::FileTooLarge { size, max }, Language::En) => {
        format!("File size ({size} bytes) exceeds the maximum ({max} bytes)")
      }
      (Self::UnsupportedType(t), Language::Zh) => format!("不支持的文件类型：{t}"),
      (Self::UnsupportedType(t), Language::En) => format!("Unsupported file type: {t}"),
      (Self::Conflict(msg), Language::Zh) => format!("文件名冲突：{msg}"),
      (Self::Conflict(msg), Language::En) => format!("Filename conflict: {msg}"),
      (Self::RateLimited(msg), Language::Zh) => format!("请求频率过高：{msg}"),
      (Self::RateLimited(msg), Language::En) => format!("Rate limit exceeded: {msg}"),
      (Self::ProviderArrearage(_), Language::Zh) => "账号欠费，请充值后重试".to_string(),
      (Self::ProviderArrearage(_), Language::En) => "Provider account in arrears, please top up".to_string(),
      (Self::ProviderInvalidKey(_), Language::Zh) => "API密钥无效，请检查配置".to_string(),
      (Self::ProviderInvalidKey(_), Language::En) => "Invalid API key, check configuration".to_string(),
      (Self::ProviderThrottled(_), Language::Zh) => "请求频率过高，请稍后重试".to_string(),
      (Self::ProviderThrottled(_), Language::En) => "Upstream throttled, retry later".to_string(),
      (other, _) => other.to_string(),
    }
  }

  pub fn not_found(item_type: &'static str, id: impl Into<String>) -> Self {
    Self::NotFound {
      item_type,
      id: id.into(),
    }
  }

  pub fn internal(msg: impl Into<String>) -> Self {
    Self::Internal(msg.into())
  }
}

impl From<DbError> for ServiceError {
  fn from(e: DbError) -> Self {
    match e {
      DbError::NotFound(what) => Self::NotFound {
        item_type: "record",
        id: what,
      },
      DbError::InvalidInput(msg) => Self::Internal(msg),
      other => Self::StoreWriteFailed(other.to_string()),
    }
  }
}

impl From<ProviderError> for ServiceError {
  fn from(e: ProviderError) -> Self {
    let message = e.to_string();
    match e.kind {
      ProviderErrorKind::Arrearage => Self::ProviderArrearage(message),
      ProviderErrorKind::InvalidKey => Self::ProviderInvalidKey(message),
      ProviderErrorKind::Throttling => Self::ProviderThrottled(message),
      ProviderErrorKind::Timeout | ProviderErrorKind::Transient => Self::ProviderTransient(message),
      ProviderErrorKind::BadRequest if message.contains("NaN/Inf") || message.contains("zero norm") => {
        Self::EmbedInvalidVector(message)
      }
      ProviderErrorKind::BadRequest | ProviderErrorKind::Unknown => Self::Internal(message),
    }
  }
}

impl From<ChunkError> for ServiceError {
  fn from(e: ChunkError) -> Self {
    match e {
      ChunkError::CountExceeded { count, cap } => {
        Self::QuotaExceeded(format!("chunk count {count} exceeds the cap of {cap}"))
      }
      other => Self::ChunkingFailed(other.to_string()),
    }
  }
}

impl From<ProcessError> for ServiceError {
  fn from(e: ProcessError) -> Self {
    match e {
      ProcessError::TypeMismatch { claimed, detected } => Self::TypeMismatch(format!("claimed {claimed}, detected {detected}")),
      ProcessError::Unsupported(mime) => Self::UnsupportedType(mime),
      other => Self::ExtractionFailed(other.to_string()),
    }
  }
}

impl From<LimitExceeded> for ServiceError {
  fn from(e: LimitExceeded) -> Self {
    Self::RateLimited(e.to_string())
  }
}
