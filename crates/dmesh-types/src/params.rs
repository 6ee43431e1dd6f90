use serde::{Deserialize, Serialize};

/// Engine-wide constants. Owned by the caller and injected into the
/// manager/executor/pipeline constructors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchParams {
    /// Absolute task TTL applied at publish time.
    pub task_ttl_ns: i64,
    /// Grace window past the deadline during which a result is still valid.
    pub return_deadline_ns: i64,
    /// Per-node reuse cap within one selection batch; doubles as the
    /// per-node capacity used in the aggregate-throughput check.
    pub compute_node_batch_size: usize,
    /// Worker-error republications before a task is given up on.
    pub task_retry_ceiling: u32,
    /// Empty poll rounds before `fetch` returns whatever arrived.
    pub fetch_retry_ceiling: u32,
    /// Initial poll interval; doubles on each empty round.
    pub fetch_interval_ms: u64,
    /// Backoff cap for the poll interval.
    pub fetch_interval_cap_ms: u64,
    /// Fixed retry budget for transport calls.
    pub transport_retries: u32,
    pub transport_retry_delay_ms: u64,
    /// Keypair generation attempts before giving up on a non-degenerate key.
    pub keygen_attempts: u32,
    /// False-positive rate of the per-node address filter.
    pub filter_fp_rate: f64,
    pub default_score: f64,
    pub error_penalty: f64,
    pub outlier_penalty: f64,
    pub success_reward: f64,
    /// Maximum inputs dispatched per pipeline-step round.
    pub step_batch_size: usize,
}

impl Default for DispatchParams {
    fn default() -> Self {
        Self {
            task_ttl_ns: 600 * 1_000_000_000,
            return_deadline_ns: 86_400 * 1_000_000_000,
            compute_node_batch_size: 10,
            task_retry_ceiling: 3,
            fetch_retry_ceiling: 10,
            fetch_interval_ms: 250,
            fetch_interval_cap_ms: 30_000,
            transport_retries: 3,
            transport_retry_delay_ms: 150,
            keygen_attempts: 20,
            filter_fp_rate: 0.001,
            default_score: 0.5,
            error_penalty: 0.3,
            outlier_penalty: 0.1,
            success_reward: 0.25,
            step_batch_size: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub tasks: TaskSettings,
    pub transport: TransportSettings,
    pub scoring: ScoringSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSettings {
    pub ttl_secs: i64,
    pub return_deadline_secs: i64,
    pub node_batch_size: usize,
    pub retry_ceiling: u32,
    pub step_batch_size: usize,
    pub keygen_attempts: u32,
    pub filter_fp_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    pub fetch_retry_ceiling: u32,
    pub fetch_interval_ms: u64,
    pub fetch_interval_cap_ms: u64,
    pub retries: u32,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringSettings {
    pub default_score: f64,
    pub error_penalty: f64,
    pub outlier_penalty: f64,
    pub success_reward: f64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let params = DispatchParams::default();
        Self {
            tasks: TaskSettings {
                ttl_secs: params.task_ttl_ns / 1_000_000_000,
                return_deadline_secs: params.return_deadline_ns / 1_000_000_000,
                node_batch_size: params.compute_node_batch_size,
                retry_ceiling: params.task_retry_ceiling,
                step_batch_size: params.step_batch_size,
                keygen_attempts: params.keygen_attempts,
                filter_fp_rate: params.filter_fp_rate,
            },
            transport: TransportSettings {
                fetch_retry_ceiling: params.fetch_retry_ceiling,
                fetch_interval_ms: params.fetch_interval_ms,
                fetch_interval_cap_ms: params.fetch_interval_cap_ms,
                retries: params.transport_retries,
                retry_delay_ms: params.transport_retry_delay_ms,
            },
            scoring: ScoringSettings {
                default_score: params.default_score,
                error_penalty: params.error_penalty,
                outlier_penalty: params.outlier_penalty,
                success_reward: params.success_reward,
            },
        }
    }
}

impl From<DispatchConfig> for DispatchParams {
    fn from(config: DispatchConfig) -> Self {
        Self {
            task_ttl_ns: config.tasks.ttl_secs * 1_000_000_000,
            return_deadline_ns: config.tasks.return_deadline_secs * 1_000_000_000,
            compute_node_batch_size: config.tasks.node_batch_size,
            task_retry_ceiling: config.tasks.retry_ceiling,
            fetch_retry_ceiling: config.transport.fetch_retry_ceiling,
            fetch_interval_ms: config.transport.fetch_interval_ms,
            fetch_interval_cap_ms: config.transport.fetch_interval_cap_ms,
            transport_retries: config.transport.retries,
            transport_retry_delay_ms: config.transport.retry_delay_ms,
            keygen_attempts: config.tasks.keygen_attempts,
            filter_fp_rate: config.tasks.filter_fp_rate,
            default_score: config.scoring.default_score,
            error_penalty: config.scoring.error_penalty,
            outlier_penalty: config.scoring.outlier_penalty,
            success_reward: config.scoring.success_reward,
            step_batch_size: config.tasks.step_batch_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_roundtrip_through_config() {
        let params: DispatchParams = DispatchConfig::default().into();
        assert_eq!(params, DispatchParams::default());
    }

    #[test]
    fn test_config_serde() {
        let config = DispatchConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: DispatchConfig = serde_json::from_str(&json).unwrap();
        let params: DispatchParams = back.into();
        assert_eq!(params.keygen_attempts, 20);
        assert_eq!(params.filter_fp_rate, 0.001);
    }
}
