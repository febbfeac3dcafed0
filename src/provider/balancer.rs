//! Route selection for aliases served by more than one vendor.

use std::{
  collections::HashMap,
  sync::atomic::{AtomicUsize, Ordering},
};

use rand::Rng;
use tracing::debug;

use crate::config::BalancingStrategy;

/// Selects among candidate vendor routes using the configured strategy.
///
/// Weighted selection uses the normalized weights (summing to exactly 100)
/// keyed by vendor name; vendors absent from the table weigh 0.
#[derive(Debug)]
pub struct LoadBalancer {
  strategy: BalancingStrategy,
  weights: HashMap<String, u32>,
  round_robin: AtomicUsize,
}

impl LoadBalancer {
  pub fn new(strategy: BalancingStrategy, weights: HashMap<String, u32>) -> Self {
    Self {
      strategy,
      weights,
      round_robin: AtomicUsize::new(0),
    }
  }

  /// Pick an index into `vendors`, optionally excluding one vendor (used for
  /// the single re-selection after a throttling/transient failure).
  pub fn select(&self, vendors: &[&str], exclude: Option<&str>) -> usize {
    let candidates: Vec<usize> = vendors
      .iter()
      .enumerate()
      .filter(|(_, v)| Some(**v) != exclude)
      .map(|(i, _)| i)
      .collect();

    if candidates.is_empty() {
      return 0;
    }
    if candidates.len() == 1 {
      return candidates[0];
    }

    let chosen = match self.strategy {
      BalancingStrategy::RoundRobin => {
        let n = self.round_robin.fetch_add(1, Ordering::Relaxed);
        candidates[n % candidates.len()]
      }
      BalancingStrategy::Random => {
        let mut rng = rand::thread_rng();
        candidates[rng.gen_range(0..candidates.len())]
      }
      BalancingStrategy::Weighted => self.select_weighted(vendors, &candidates),
    };

    debug!(
      strategy = ?self.strategy,
      vendor = vendors[chosen],
      excluded = exclude.unwrap_or("-"),
      "Route selected"
    );
    chosen
  }

  fn select_weighted(&self, vendors: &[&str], candidates: &[usize]) -> usize {
    let total: u32 = candidates
      .iter()
      .map(|&i| self.weights.get(vendors[i]).copied().unwrap_or(0))
      .sum();
    if total == 0 {
      // No usable weights among the candidates; spread evenly.
      let n = self.round_robin.fetch_add(1, Ordering::Relaxed);
      return candidates[n % candidates.len()];
    }

    let mut roll = rand::thread_rng().gen_range(0..total);
    for &i in candidates {
      let weight = self.weights.get(vendors[i]).copied().unwrap_or(0);
      if roll < weight {
        return i;
      }
      roll -= weight;
    }
    candidates[candidates.len() - 1]
  }
}
