//! Per-route rate limiting: a sliding-window QPM limiter plus a concurrency
//! semaphore.
//!
//! The window limiter supports a token-based refund mechanism for requests
//! that failed without consuming upstream capacity (network errors, 5xx).

use std::{
  collections::VecDeque,
  sync::Arc,
  time::{Duration, Instant},
};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace, warn};

use super::{ErrorKind, ProviderError};

/// Token returned when recording a request, used for potential refunds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitToken {
  timestamp: Instant,
  /// Distinguishes tokens recorded at the same instant
  id: u64,
}

/// Configuration for the sliding QPM window.
#[derive(Debug, Clone, Copy)]
pub struct WindowConfig {
  /// Maximum requests allowed in the window
  pub max_requests: usize,
  /// Window duration; QPM uses 60 s
  pub window: Duration,
  /// Maximum time a blocking caller waits for a slot before failing
  pub max_wait: Duration,
}

impl WindowConfig {
  pub fn qpm(max_requests: usize) -> Self {
    Self {
      max_requests,
      window: Duration::from_secs(60),
      max_wait: Duration::from_secs(30),
    }
  }
}

/// Sliding window rate limiter with refund support.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
  config: WindowConfig,
  request_records: VecDeque<(Instant, u64)>,
  next_token_id: u64,
}

impl SlidingWindowLimiter {
  pub fn new(config: WindowConfig) -> Self {
    Self {
      request_records: VecDeque::with_capacity(config.max_requests.min(4096) + 1),
      config,
      next_token_id: 0,
    }
  }

  /// Remove expired timestamps from the window.
  fn prune_expired(&mut self) {
    let cutoff = Instant::now() - self.config.window;
    while let Some(&(oldest, _)) = self.request_records.front() {
      if oldest < cutoff {
        self.request_records.pop_front();
      } else {
        break;
      }
    }
  }

  /// Requests still admissible in the current window.
  pub fn remaining(&mut self) -> usize {
    self.prune_expired();
    self.config.max_requests.saturating_sub(self.request_records.len())
  }

  fn record(&mut self) -> RateLimitToken {
    let token = RateLimitToken {
      timestamp: Instant::now(),
      id: self.next_token_id,
    };
    self.next_token_id = self.next_token_id.wrapping_add(1);
    self.request_records.push_back((token.timestamp, token.id));
    token
  }

  /// Acquire a slot now, or report how long until one frees up.
  pub fn check_and_record(&mut self) -> Result<RateLimitToken, Duration> {
    self.prune_expired();

    if self.request_records.len() < self.config.max_requests {
      return Ok(self.record());
    }

    let wait = self
      .request_records
      .front()
      .map(|&(oldest, _)| (oldest + self.config.window).saturating_duration_since(Instant::now()))
      .unwrap_or_default();
    Err(wait)
  }

  /// Refund a slot for a request that never consumed upstream capacity.
  ///
  /// Refund network errors, timeouts and 5xx responses; never refund 429 or
  /// other 4xx (the upstream counted those). Returns false when the token
  /// already expired out of the window.
  pub fn refund(&mut self, token: RateLimitToken) -> bool {
    if let Some(pos) = self
      .request_records
      .iter()
      .position(|&(ts, id)| ts == token.timestamp && id == token.id)
    {
      self.request_records.remove(pos);
      trace!(token_id = token.id, "Rate limit slot refunded");
      true
    } else {
      trace!(token_id = token.id, "Rate limit refund: token not found (may have expired)");
      false
    }
  }
}

// ============================================================================
// Route limiter
// ============================================================================

/// Combined QPM + concurrency limiter for one vendor route.
#[derive(Debug, Clone)]
pub struct RouteLimiter {
  name: String,
  qpm: Arc<Mutex<SlidingWindowLimiter>>,
  concurrency: Arc<Semaphore>,
}

impl RouteLimiter {
  pub fn new(name: impl Into<String>, qpm_limit: usize, concurrent_limit: usize) -> Self {
    Self {
      name: name.into(),
      qpm: Arc::new(Mutex::new(SlidingWindowLimiter::new(WindowConfig::qpm(qpm_limit)))),
      concurrency: Arc::new(Semaphore::new(concurrent_limit)),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// QPM slots left in the current window.
  pub async fn remaining_qpm(&self) -> usize {
    self.qpm.lock().await.remaining()
  }

  /// Acquire both a concurrency permit and a QPM slot.
  ///
  /// With `blocking` the call waits (bounded by the window's `max_wait`) for
  /// capacity; otherwise exhaustion rejects immediately with `throttling`.
  pub async fn acquire(&self, blocking: bool) -> Result<RouteGuard, ProviderError> {
    let permit = if blocking {
      Arc::clone(&self.concurrency)
        .acquire_owned()
        .await
        .map_err(|_| ProviderError::new(ErrorKind::Transient, &self.name, "limiter closed"))?
    } else {
      match Arc::clone(&self.concurrency).try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
          return Err(ProviderError::new(
            ErrorKind::Throttling,
            &self.name,
            "concurrency limit reached",
          ));
        }
      }
    };

    let start = Instant::now();
    let max_wait = { self.qpm.lock().await.config.max_wait };

    loop {
      let result = self.qpm.lock().await.check_and_record();
      match result {
        Ok(token) => {
          trace!(route = %self.name, elapsed_ms = start.elapsed().as_millis() as u64, "Rate limit slot acquired");
          return Ok(RouteGuard {
            _permit: permit,
            token: Some(token),
            qpm: Arc::clone(&self.qpm),
          });
        }
        Err(wait) if blocking => {
          if start.elapsed() + wait > max_wait {
            warn!(route = %self.name, "Rate limiter max wait time exceeded");
            return Err(ProviderError::new(
              ErrorKind::Throttling,
              &self.name,
              format!("rate limit wait exceeded {max_wait:?}"),
            ));
          }
          debug!(route = %self.name, wait_ms = wait.as_millis() as u64, "Rate limiter waiting for slot");
          tokio::time::sleep(wait).await;
        }
        Err(_) => {
          return Err(ProviderError::new(
            ErrorKind::Throttling,
            &self.name,
            "QPM limit reached",
          ));
        }
      }
    }
  }
}

/// Held for the duration of one upstream request. Dropping it releases the
/// concurrency permit; the QPM slot stays consumed unless refunded.
#[derive(Debug)]
pub struct RouteGuard {
  _permit: OwnedSemaphorePermit,
  token: Option<RateLimitToken>,
  qpm: Arc<Mutex<SlidingWindowLimiter>>,
}

impl RouteGuard {
  /// Refund the QPM slot (network error / timeout / 5xx only).
  pub async fn refund(mut self) {
    if let Some(token) = self.token.take() {
      self.qpm.lock().await.refund(token);
    }
  }
}
