use dmesh_types::{Address, DispatchParams};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// One observation folded into the score table after a result batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetric {
    pub address: Address,
    pub execution_time_ms: f64,
    pub error: bool,
}

impl NodeMetric {
    pub fn success(address: Address, execution_time_ms: f64) -> Self {
        Self {
            address,
            execution_time_ms,
            error: false,
        }
    }

    pub fn failure(address: Address) -> Self {
        Self {
            address,
            execution_time_ms: 0.0,
            error: true,
        }
    }
}

/// Node reliability table: address -> score in [0, 1], default 0.5.
/// Mutated only by `evaluate_nodes`; lives for the process lifetime and is
/// shared between the cooperative executor tasks.
pub struct ScoreTracker {
    scores: Arc<RwLock<HashMap<Address, f64>>>,
    default_score: f64,
    error_penalty: f64,
    outlier_penalty: f64,
    success_reward: f64,
}

impl ScoreTracker {
    pub fn new(params: &DispatchParams) -> Self {
        Self {
            scores: Arc::new(RwLock::new(HashMap::new())),
            default_score: params.default_score,
            error_penalty: params.error_penalty,
            outlier_penalty: params.outlier_penalty,
            success_reward: params.success_reward,
        }
    }

    pub async fn get_score(&self, address: &Address) -> f64 {
        let scores = self.scores.read().await;
        scores.get(address).copied().unwrap_or(self.default_score)
    }

    /// Snapshot of the current table for selection planning. Addresses the
    /// tracker has never seen must be merged in by the caller at the default
    /// score.
    pub async fn snapshot(&self) -> HashMap<Address, f64> {
        let scores = self.scores.read().await;
        scores.clone()
    }

    /// Fold one batch of metrics into the table.
    ///
    /// Error observations cost `error_penalty` (floored at 0). Successful
    /// observations are judged against the batch's execution-time spread
    /// with the IQR rule: outliers lose `outlier_penalty`, the rest gain
    /// `success_reward` (capped at 1). Addresses that reported nothing are
    /// untouched.
    pub async fn evaluate_nodes(&self, metrics: &[NodeMetric]) {
        if metrics.is_empty() {
            return;
        }

        let mut times: Vec<f64> = metrics
            .iter()
            .filter(|m| !m.error)
            .map(|m| m.execution_time_ms)
            .collect();
        times.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let fences = iqr_fences(&times);

        let mut scores = self.scores.write().await;
        for metric in metrics {
            let score = scores
                .entry(metric.address)
                .or_insert(self.default_score);

            if metric.error {
                *score = (*score - self.error_penalty).max(0.0);
                debug!(node = %metric.address, score = *score, "Node penalized for reported error");
                continue;
            }

            let (low, high) = fences.unwrap_or((f64::NEG_INFINITY, f64::INFINITY));
            if metric.execution_time_ms < low || metric.execution_time_ms > high {
                *score = (*score - self.outlier_penalty).max(0.0);
                debug!(
                    node = %metric.address,
                    execution_time_ms = metric.execution_time_ms,
                    score = *score,
                    "Execution-time outlier penalized"
                );
            } else {
                *score = (*score + self.success_reward).min(1.0);
            }
        }
    }

    /// Override a score directly. Intended for tests.
    pub async fn set_score(&self, address: Address, value: f64) {
        let mut scores = self.scores.write().await;
        scores.insert(address, value);
    }
}

impl Clone for ScoreTracker {
    fn clone(&self) -> Self {
        Self {
            scores: Arc::clone(&self.scores),
            default_score: self.default_score,
            error_penalty: self.error_penalty,
            outlier_penalty: self.outlier_penalty,
            success_reward: self.success_reward,
        }
    }
}

/// `(Q1 - 1.5*IQR, Q3 + 1.5*IQR)` over a sorted sample; `None` when there is
/// nothing to fence.
fn iqr_fences(sorted: &[f64]) -> Option<(f64, f64)> {
    if sorted.is_empty() {
        return None;
    }
    let q1 = percentile(sorted, 0.25);
    let q3 = percentile(sorted, 0.75);
    let iqr = q3 - q1;
    Some((q1 - 1.5 * iqr, q3 + 1.5 * iqr))
}

/// Linear-interpolated percentile over a sorted sample.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = p * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address::from_bytes([byte; 20])
    }

    fn tracker() -> ScoreTracker {
        ScoreTracker::new(&DispatchParams::default())
    }

    #[tokio::test]
    async fn test_unseen_address_defaults() {
        let tracker = tracker();
        assert_eq!(tracker.get_score(&addr(1)).await, 0.5);
    }

    #[tokio::test]
    async fn test_error_penalty_floors_at_zero() {
        let tracker = tracker();
        for _ in 0..10 {
            tracker
                .evaluate_nodes(&[NodeMetric::failure(addr(1))])
                .await;
        }
        assert_eq!(tracker.get_score(&addr(1)).await, 0.0);
    }

    #[tokio::test]
    async fn test_success_reward_caps_at_one() {
        let tracker = tracker();
        for _ in 0..10 {
            let batch: Vec<NodeMetric> = (1u8..=4)
                .map(|b| NodeMetric::success(addr(b), 100.0 + b as f64))
                .collect();
            tracker.evaluate_nodes(&batch).await;
        }
        let score = tracker.get_score(&addr(1)).await;
        assert_eq!(score, 1.0);
    }

    #[tokio::test]
    async fn test_scores_stay_bounded_under_mixed_sequences() {
        let tracker = tracker();
        for round in 0..50 {
            let batch = vec![
                NodeMetric::success(addr(1), 100.0),
                NodeMetric::success(addr(2), 101.0),
                NodeMetric::failure(addr(3)),
                NodeMetric::success(addr(3), if round % 2 == 0 { 99.0 } else { 5_000.0 }),
            ];
            tracker.evaluate_nodes(&batch).await;
            for b in 1u8..=3 {
                let score = tracker.get_score(&addr(b)).await;
                assert!((0.0..=1.0).contains(&score), "score {}", score);
            }
        }
    }

    #[tokio::test]
    async fn test_outlier_penalized_inliers_rewarded() {
        let tracker = tracker();
        let mut batch: Vec<NodeMetric> = (1u8..=9)
            .map(|b| NodeMetric::success(addr(b), 100.0 + b as f64))
            .collect();
        // One node an order of magnitude slower than the rest of the batch.
        batch.push(NodeMetric::success(addr(10), 5_000.0));

        tracker.evaluate_nodes(&batch).await;

        assert_eq!(tracker.get_score(&addr(1)).await, 0.75);
        assert_eq!(tracker.get_score(&addr(10)).await, 0.4);
    }

    #[tokio::test]
    async fn test_unreported_addresses_untouched() {
        let tracker = tracker();
        tracker.set_score(addr(9), 0.77).await;
        tracker
            .evaluate_nodes(&[NodeMetric::success(addr(1), 10.0)])
            .await;
        assert_eq!(tracker.get_score(&addr(9)).await, 0.77);
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let tracker = tracker();
        tracker.evaluate_nodes(&[]).await;
        assert!(tracker.snapshot().await.is_empty());
    }

    #[test]
    fn test_percentile_interpolation() {
        let sample = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&sample, 0.0), 1.0);
        assert_eq!(percentile(&sample, 1.0), 4.0);
        assert_eq!(percentile(&sample, 0.5), 2.5);
    }

    #[test]
    fn test_iqr_fences_on_tight_cluster() {
        let sample = [100.0, 101.0, 102.0, 103.0];
        let (low, high) = iqr_fences(&sample).unwrap();
        assert!(low > 95.0);
        assert!(high < 108.0);
    }
}
