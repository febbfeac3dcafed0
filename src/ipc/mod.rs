//! IPC protocol: newline-delimited JSON over a Unix socket.
//!
//! One request per line; one or more responses per request. Streaming
//! operations (the SSE forwarder) emit `Stream` responses until a final
//! `done` marker; everything else answers with a single `Result` or `Error`.

pub mod types;

use serde::{Deserialize, Serialize};
pub use types::{RequestData, ResponseData};

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum IpcError {
  #[error("Ser/de error: {0}")]
  Serde(String),
  #[error("RPC error {code}: {message}")]
  Rpc { code: i32, message: String },
  #[error("IO error: {0}")]
  Io(String),
  #[error("Codec error: {0}")]
  Codec(String),
}

impl From<serde_json::Error> for IpcError {
  fn from(err: serde_json::Error) -> Self {
    IpcError::Serde(err.to_string())
  }
}

impl From<std::io::Error> for IpcError {
  fn from(err: std::io::Error) -> Self {
    IpcError::Io(err.to_string())
  }
}

impl From<tokio_util::codec::LinesCodecError> for IpcError {
  fn from(err: tokio_util::codec::LinesCodecError) -> Self {
    IpcError::Codec(err.to_string())
  }
}

// ============================================================================
// Request/Response envelopes
// ============================================================================

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
  pub id: String,
  /// Tenant the request acts for (set by the authenticating front end)
  pub tenant_id: u64,
  /// Request language for localized error messages (e.g. "zh-CN")
  pub language: Option<String>,
  #[serde(flatten)]
  pub data: RequestData,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
  pub id: String,
  #[serde(flatten)]
  pub scenario: ResponseScenario,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ResponseScenario {
  /// Final successful response
  Result { data: ResponseData },
  /// One streamed chunk; `done` marks the end of the stream
  Stream { chunk: Option<String>, done: bool },
  /// Final error response
  Error {
    code: i32,
    kind: String,
    message: String,
  },
}

impl Response {
  pub fn success(id: &str, data: ResponseData) -> Self {
    Self {
      id: id.to_string(),
      scenario: ResponseScenario::Result { data },
    }
  }

  pub fn stream_chunk(id: &str, chunk: String) -> Self {
    Self {
      id: id.to_string(),
      scenario: ResponseScenario::Stream {
        chunk: Some(chunk),
        done: false,
      },
    }
  }

  pub fn stream_done(id: &str) -> Self {
    Self {
      id: id.to_string(),
      scenario: ResponseScenario::Stream { chunk: None, done: true },
    }
  }

  pub fn error(id: &str, code: i32, kind: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      id: id.to_string(),
      scenario: ResponseScenario::Error {
        code,
        kind: kind.into(),
        message: message.into(),
      },
    }
  }

  pub fn is_final(&self) -> bool {
    match &self.scenario {
      ResponseScenario::Stream { done, .. } => *done,
      _ => true,
    }
  }
}
