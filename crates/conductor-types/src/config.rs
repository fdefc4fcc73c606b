//! Engine configuration types.
//!
//! `EngineConfig` represents `config.toml` in the data directory. Every field
//! has a default so a missing or partial file still yields a usable engine.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Debug override: allow runs to start on Draft versions.
    #[serde(default)]
    pub allow_draft_versions: bool,

    /// Re-read attempts after an optimistic concurrency conflict.
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,

    /// Attempt budget for steps that declare no retry policy.
    #[serde(default = "default_step_attempts")]
    pub default_step_attempts: u32,

    /// Backoff for steps that declare no retry policy.
    #[serde(default = "default_retry_backoff_ms")]
    pub default_retry_backoff_ms: u64,

    /// Capacity of the in-process integration event bus.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    #[serde(default)]
    pub compensation: CompensationConfig,

    #[serde(default)]
    pub waiting: WaitingConfig,

    #[serde(default)]
    pub sweeper: SweeperConfig,

    #[serde(default)]
    pub idempotency: IdempotencyConfig,

    #[serde(default)]
    pub bridge: BridgeConfig,
}

fn default_max_conflict_retries() -> u32 {
    5
}

fn default_step_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            allow_draft_versions: false,
            max_conflict_retries: default_max_conflict_retries(),
            default_step_attempts: default_step_attempts(),
            default_retry_backoff_ms: default_retry_backoff_ms(),
            event_bus_capacity: default_event_bus_capacity(),
            compensation: CompensationConfig::default(),
            waiting: WaitingConfig::default(),
            sweeper: SweeperConfig::default(),
            idempotency: IdempotencyConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

/// How compensation actions are executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationConfig {
    /// Attempts per compensation action. 1 means each action is invoked once.
    #[serde(default = "default_max_action_attempts")]
    pub max_action_attempts: u32,

    /// Run compensation on a spawned task instead of inside the failing call.
    #[serde(default = "default_true")]
    pub background: bool,

    /// Proxy method invoked for `wallet_reverse` actions.
    #[serde(default = "default_wallet_reverse_method")]
    pub wallet_reverse_method: String,

    /// Proxy method invoked for `payment_refund` actions.
    #[serde(default = "default_payment_refund_method")]
    pub payment_refund_method: String,
}

fn default_max_action_attempts() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_wallet_reverse_method() -> String {
    "wallet.reverse".to_string()
}

fn default_payment_refund_method() -> String {
    "payment.refund".to_string()
}

impl Default for CompensationConfig {
    fn default() -> Self {
        Self {
            max_action_attempts: default_max_action_attempts(),
            background: true,
            wallet_reverse_method: default_wallet_reverse_method(),
            payment_refund_method: default_payment_refund_method(),
        }
    }
}

/// Limits on how long a run may stay Waiting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WaitingConfig {
    /// Waiting runs older than this are cancelled by the sweeper. `None` = no limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_secs: Option<u64>,
}

/// Deadline sweeper schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_sweeper_interval_secs")]
    pub interval_secs: u64,

    /// Maximum runs handled per sweep category.
    #[serde(default = "default_sweeper_batch")]
    pub batch_size: u32,

    /// Pending, Running, or Compensating runs untouched this long are
    /// considered orphaned by a dead process and are picked up again.
    #[serde(default = "default_stale_run_secs")]
    pub stale_run_secs: u64,
}

fn default_sweeper_interval_secs() -> u64 {
    5
}

fn default_sweeper_batch() -> u32 {
    100
}

fn default_stale_run_secs() -> u64 {
    60
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweeper_interval_secs(),
            batch_size: default_sweeper_batch(),
            stale_run_secs: default_stale_run_secs(),
        }
    }
}

/// Idempotency reservation behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// An unanswered reservation older than this may be taken over.
    #[serde(default = "default_reservation_ttl_secs")]
    pub reservation_ttl_secs: u64,

    /// Poll interval while waiting for a concurrent duplicate to answer.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Give up waiting for a concurrent duplicate after this long.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

fn default_reservation_ttl_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    25
}

fn default_poll_timeout_ms() -> u64 {
    5_000
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_secs: default_reservation_ttl_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

/// Event bridge routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Definition started for each `OrderPlaced` event. `None` disables it.
    #[serde(default = "default_order_placed_definition")]
    pub order_placed_definition: Option<String>,

    /// Actor recorded on runs started by the bridge.
    #[serde(default = "default_bridge_actor")]
    pub actor: String,
}

fn default_order_placed_definition() -> Option<String> {
    Some("OrderFulfillment".to_string())
}

fn default_bridge_actor() -> String {
    "event-bridge".to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            order_placed_definition: default_order_placed_definition(),
            actor: default_bridge_actor(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert!(!config.allow_draft_versions);
        assert_eq!(config.max_conflict_retries, 5);
        assert_eq!(config.default_step_attempts, 3);
        assert_eq!(config.compensation.max_action_attempts, 1);
        assert!(config.compensation.background);
        assert!(config.waiting.max_age_secs.is_none());
        assert_eq!(config.idempotency.reservation_ttl_secs, 300);
        assert_eq!(
            config.bridge.order_placed_definition.as_deref(),
            Some("OrderFulfillment")
        );
    }

    #[test]
    fn test_engine_config_partial_toml() {
        let toml_str = r#"
allow_draft_versions = true

[compensation]
max_action_attempts = 3

[waiting]
max_age_secs = 86400
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert!(config.allow_draft_versions);
        assert_eq!(config.compensation.max_action_attempts, 3);
        assert!(config.compensation.background, "unset fields keep defaults");
        assert_eq!(config.waiting.max_age_secs, Some(86_400));
        assert_eq!(config.sweeper.interval_secs, 5);
    }

    #[test]
    fn test_engine_config_empty_toml() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.max_conflict_retries, 5);
        assert_eq!(config.compensation.wallet_reverse_method, "wallet.reverse");
    }
}
