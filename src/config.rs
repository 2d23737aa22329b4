//! Application configuration
//!
//! Explicit structs passed into each component's constructor. Values come
//! from the environment (via dotenv); configured values win and the
//! environment is only consulted where the config value is empty.

use crate::errors::{CoreError, CoreResult};
use crate::models::ProviderId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use tracing::warn;

fn env_or<T: std::str::FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Brokerage gateway connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub client_id: u32,
    pub max_client_id_retries: u32,
    pub order_timeout_ms: u64,
    pub execution_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub flatten_settle_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7497,
            client_id: 1,
            max_client_id_retries: 5,
            order_timeout_ms: 5_000,
            execution_timeout_ms: 10_000,
            heartbeat_interval_ms: 5_000,
            flatten_settle_ms: 500,
        }
    }
}

/// Local REST listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    pub port: u16,
    pub api_key: Option<String>,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            api_key: None,
        }
    }
}

/// Drift detection thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftConfig {
    pub accuracy_threshold: f64,
    pub calibration_threshold: f64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            accuracy_threshold: 0.15,
            calibration_threshold: 0.15,
        }
    }
}

/// Scoring fan-out limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoEvalConfig {
    pub max_concurrent: usize,
    pub dedup_window_min: u64,
}

impl Default for AutoEvalConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            dedup_window_min: 10,
        }
    }
}

/// Ensemble orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub weights: HashMap<ProviderId, f64>,
    pub required_agreement: f64,
    pub penalty_k: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut weights = HashMap::new();
        weights.insert(ProviderId::Gpt, 0.4);
        weights.insert(ProviderId::Gemini, 0.3);
        weights.insert(ProviderId::Claude, 0.3);
        Self {
            weights,
            required_agreement: 0.5,
            penalty_k: 1.0,
        }
    }
}

/// One external scoring provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_path: String,
    pub priors_path: String,
    pub gateway: GatewayConfig,
    pub rest: RestConfig,
    pub drift: DriftConfig,
    pub auto_eval: AutoEvalConfig,
    pub orchestrator: OrchestratorConfig,
    pub providers: HashMap<ProviderId, ProviderConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let mut providers = HashMap::new();
        for id in ProviderId::ALL {
            providers.insert(id, ProviderConfig::default());
        }
        Self {
            database_path: "./edgebot.db".to_string(),
            priors_path: "./bayesian_priors.json".to_string(),
            gateway: GatewayConfig::default(),
            rest: RestConfig::default(),
            drift: DriftConfig::default(),
            auto_eval: AutoEvalConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            providers,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let mut config = Config::default();

        config.database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| config.database_path.clone());
        config.priors_path =
            env::var("PRIORS_PATH").unwrap_or_else(|_| config.priors_path.clone());

        config.gateway.host =
            env::var("IBKR_HOST").unwrap_or_else(|_| config.gateway.host.clone());
        config.gateway.port = env_or("IBKR_PORT", config.gateway.port);
        config.gateway.client_id = env_or("IBKR_CLIENT_ID", config.gateway.client_id);
        config.gateway.max_client_id_retries =
            env_or("IBKR_MAX_CLIENT_ID_RETRIES", config.gateway.max_client_id_retries);
        config.gateway.order_timeout_ms =
            env_or("IBKR_ORDER_TIMEOUT_MS", config.gateway.order_timeout_ms);
        config.gateway.execution_timeout_ms =
            env_or("IBKR_EXECUTION_TIMEOUT_MS", config.gateway.execution_timeout_ms);
        config.gateway.heartbeat_interval_ms =
            env_or("IBKR_HEARTBEAT_INTERVAL_MS", config.gateway.heartbeat_interval_ms);
        config.gateway.flatten_settle_ms =
            env_or("FLATTEN_SETTLE_MS", config.gateway.flatten_settle_ms);

        config.rest.port = env_or("REST_PORT", config.rest.port);
        // Config wins; environment fills in only when the config value is empty.
        if config.rest.api_key.as_deref().map_or(true, str::is_empty) {
            config.rest.api_key = env::var("REST_API_KEY").ok().filter(|k| !k.is_empty());
        }

        config.drift.accuracy_threshold =
            env_or("DRIFT_ACCURACY_THRESHOLD", config.drift.accuracy_threshold);
        config.drift.calibration_threshold =
            env_or("DRIFT_CALIBRATION_THRESHOLD", config.drift.calibration_threshold);

        config.auto_eval.max_concurrent =
            env_or("AUTOEVAL_MAX_CONCURRENT", config.auto_eval.max_concurrent);
        config.auto_eval.dedup_window_min =
            env_or("AUTOEVAL_DEDUP_WINDOW_MIN", config.auto_eval.dedup_window_min);

        config.orchestrator.required_agreement = env_or(
            "ORCHESTRATOR_REQUIRED_AGREEMENT",
            config.orchestrator.required_agreement,
        );
        config.orchestrator.penalty_k =
            env_or("ORCHESTRATOR_PENALTY_K", config.orchestrator.penalty_k);
        for id in ProviderId::ALL {
            let var = format!("ORCHESTRATOR_WEIGHT_{}", id.as_str().to_uppercase());
            if let Some(w) = env::var(&var).ok().and_then(|v| v.parse::<f64>().ok()) {
                config.orchestrator.weights.insert(id, w);
            }
        }

        for id in ProviderId::ALL {
            let upper = id.as_str().to_uppercase();
            let provider = config.providers.entry(id).or_default();
            if provider.api_key.as_deref().map_or(true, str::is_empty) {
                provider.api_key = env::var(format!("{upper}_API_KEY"))
                    .ok()
                    .filter(|k| !k.is_empty());
            }
            provider.base_url = env::var(format!("{upper}_BASE_URL"))
                .ok()
                .or(provider.base_url.take());
            provider.timeout_ms = env_or(&format!("{upper}_TIMEOUT_MS"), provider.timeout_ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range values before anything is constructed from them.
    pub fn validate(&self) -> CoreResult<()> {
        if self.gateway.port == 0 {
            return Err(CoreError::validation("ibkr.port must be in 1..65535"));
        }
        if self.gateway.client_id > 32 {
            return Err(CoreError::validation("ibkr.clientId must be in 0..32"));
        }
        if self.gateway.order_timeout_ms == 0 {
            return Err(CoreError::validation("ibkr.orderTimeoutMs must be > 0"));
        }
        if self.gateway.execution_timeout_ms < self.gateway.order_timeout_ms {
            return Err(CoreError::validation(
                "ibkr.executionTimeoutMs must be >= ibkr.orderTimeoutMs",
            ));
        }
        if self.rest.port == 0 {
            return Err(CoreError::validation("rest.port must be in 1..65535"));
        }
        if self.rest.port == self.gateway.port {
            return Err(CoreError::validation("rest.port must differ from ibkr.port"));
        }
        if let Some(key) = &self.rest.api_key {
            if key.len() < 16 {
                warn!("rest.apiKey is shorter than 16 characters");
            }
        }
        if !(0.0..=1.0).contains(&self.drift.accuracy_threshold) {
            return Err(CoreError::validation("drift.accuracyThreshold must be in [0,1]"));
        }
        if !(0.0..=1.0).contains(&self.drift.calibration_threshold) {
            return Err(CoreError::validation(
                "drift.calibrationThreshold must be in [0,1]",
            ));
        }
        if !(1..=20).contains(&self.auto_eval.max_concurrent) {
            return Err(CoreError::validation("autoEval.maxConcurrent must be in [1,20]"));
        }
        if self.auto_eval.dedup_window_min == 0 {
            return Err(CoreError::validation("autoEval.dedupWindowMin must be > 0"));
        }
        for (id, w) in &self.orchestrator.weights {
            if *w < 0.0 || !w.is_finite() {
                return Err(CoreError::Validation(format!(
                    "orchestrator.weights.{id} must be non-negative"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.orchestrator.required_agreement) {
            return Err(CoreError::validation(
                "orchestrator.requiredAgreement must be in [0,1]",
            ));
        }
        for (id, provider) in &self.providers {
            if provider.timeout_ms == 0 {
                return Err(CoreError::Validation(format!(
                    "{id}.timeoutMs must be > 0"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_rest_port_clash() {
        let mut config = Config::default();
        config.rest.port = config.gateway.port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_execution_timeout_below_order_timeout() {
        let mut config = Config::default();
        config.gateway.order_timeout_ms = 10_000;
        config.gateway.execution_timeout_ms = 5_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_concurrency() {
        let mut config = Config::default();
        config.auto_eval.max_concurrent = 0;
        assert!(config.validate().is_err());
        config.auto_eval.max_concurrent = 21;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_negative_weight() {
        let mut config = Config::default();
        config.orchestrator.weights.insert(ProviderId::Gpt, -0.1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_oversize_client_id() {
        let mut config = Config::default();
        config.gateway.client_id = 33;
        assert!(config.validate().is_err());
    }
}
