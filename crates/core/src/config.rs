use serde::{Deserialize, Serialize};

use crate::errors::{OrchestratorError, OrchestratorResult};

/// Top-level application configuration.
///
/// Every tunable of the orchestration core lives here so that deployments can
/// override them via TOML file or `ORCHESTRATOR__*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub master: MasterConfig,
    #[serde(default)]
    pub slave: SlaveConfig,
    #[serde(default)]
    pub rings: RingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub master_id: String,
    /// Interval between liveness scans (seconds)
    pub liveness_check_interval_seconds: u64,
    /// A slave with no heartbeat for this long is declared dead (seconds)
    pub slave_timeout_seconds: i64,
    /// An assigned/running task with no activity for this long is failed (seconds)
    pub task_timeout_seconds: i64,
    /// Interval between task-timeout scans (seconds)
    pub task_check_interval_seconds: u64,
    /// Fallback tick of the dispatch loop when no wake-up arrives (milliseconds)
    pub dispatch_interval_ms: u64,
    /// Poll timeout of the master inbox (milliseconds)
    pub receive_timeout_ms: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            master_id: "master-001".to_string(),
            liveness_check_interval_seconds: 5,
            slave_timeout_seconds: 20,
            task_timeout_seconds: 60,
            task_check_interval_seconds: 10,
            dispatch_interval_ms: 500,
            receive_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaveConfig {
    /// Heartbeat emission interval (seconds)
    pub heartbeat_interval_seconds: u64,
    /// Device telemetry emission interval (seconds)
    pub device_status_interval_seconds: u64,
    /// How long a single registration attempt waits for the master ACK (milliseconds)
    pub registration_timeout_ms: u64,
    /// Registration attempts before the agent gives up and fails startup
    pub max_registration_attempts: u32,
    /// Base backoff between registration attempts, doubled each retry (milliseconds)
    pub registration_backoff_ms: u64,
    /// Poll timeout of the slave inbox (milliseconds)
    pub receive_timeout_ms: u64,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 5,
            device_status_interval_seconds: 10,
            registration_timeout_ms: 3000,
            max_registration_attempts: 3,
            registration_backoff_ms: 500,
            receive_timeout_ms: 1000,
        }
    }
}

/// Health thresholds and rebalancing knobs for ring placement.
///
/// The random reassignment probability is an explicit parameter so tests can
/// pin it to 0.0 or 1.0 for deterministic behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Battery level at or below this is unhealthy (percent)
    pub battery_min: f64,
    /// CPU usage at or above this is unhealthy (percent)
    pub cpu_max: f64,
    /// Memory usage at or above this is unhealthy (percent)
    pub memory_max: f64,
    /// Interval between rebalancing passes (seconds)
    pub rebalance_interval_seconds: u64,
    /// Per-pass probability that a live slave is randomly reassigned (0.0-1.0)
    pub rebalance_probability: f64,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            battery_min: 20.0,
            cpu_max: 80.0,
            memory_max: 85.0,
            rebalance_interval_seconds: 30,
            rebalance_probability: 0.1,
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional TOML file with environment overrides.
    ///
    /// Missing files are tolerated; every field falls back to its default.
    /// Environment variables use the `ORCHESTRATOR__section__field` convention.
    pub fn load(path: Option<&str>) -> OrchestratorResult<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("ORCHESTRATOR")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let loaded = builder
            .build()
            .map_err(|e| OrchestratorError::config_error(e.to_string()))?;

        let cfg: AppConfig = loaded
            .try_deserialize()
            .map_err(|e| OrchestratorError::config_error(e.to_string()))?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        self.master.validate()?;
        self.slave.validate()?;
        self.rings.validate()?;

        // The liveness monitor can only be meaningful if slaves heartbeat
        // faster than the master declares them dead.
        if self.slave.heartbeat_interval_seconds as i64 >= self.master.slave_timeout_seconds {
            return Err(OrchestratorError::config_error(format!(
                "slave.heartbeat_interval_seconds ({}) must be less than master.slave_timeout_seconds ({})",
                self.slave.heartbeat_interval_seconds, self.master.slave_timeout_seconds
            )));
        }
        Ok(())
    }
}

impl MasterConfig {
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.master_id.is_empty() {
            return Err(OrchestratorError::config_error(
                "master.master_id cannot be empty",
            ));
        }
        if self.slave_timeout_seconds <= 0 {
            return Err(OrchestratorError::config_error(
                "master.slave_timeout_seconds must be greater than 0",
            ));
        }
        if self.task_timeout_seconds <= 0 {
            return Err(OrchestratorError::config_error(
                "master.task_timeout_seconds must be greater than 0",
            ));
        }
        if self.liveness_check_interval_seconds == 0 || self.task_check_interval_seconds == 0 {
            return Err(OrchestratorError::config_error(
                "master check intervals must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl SlaveConfig {
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.heartbeat_interval_seconds == 0 {
            return Err(OrchestratorError::config_error(
                "slave.heartbeat_interval_seconds must be greater than 0",
            ));
        }
        if self.device_status_interval_seconds == 0 {
            return Err(OrchestratorError::config_error(
                "slave.device_status_interval_seconds must be greater than 0",
            ));
        }
        if self.max_registration_attempts == 0 {
            return Err(OrchestratorError::config_error(
                "slave.max_registration_attempts must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl RingConfig {
    pub fn validate(&self) -> OrchestratorResult<()> {
        for (name, value) in [
            ("rings.battery_min", self.battery_min),
            ("rings.cpu_max", self.cpu_max),
            ("rings.memory_max", self.memory_max),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(OrchestratorError::config_error(format!(
                    "{name} must be within 0-100, got {value}"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.rebalance_probability) {
            return Err(OrchestratorError::config_error(format!(
                "rings.rebalance_probability must be within 0.0-1.0, got {}",
                self.rebalance_probability
            )));
        }
        if self.rebalance_interval_seconds == 0 {
            return Err(OrchestratorError::config_error(
                "rings.rebalance_interval_seconds must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.master.master_id, "master-001");
        assert_eq!(cfg.slave.heartbeat_interval_seconds, 5);
        assert_eq!(cfg.rings.rebalance_probability, 0.1);
    }

    #[test]
    fn test_rejects_out_of_range_probability() {
        let mut cfg = AppConfig::default();
        cfg.rings.rebalance_probability = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_heartbeat_slower_than_timeout() {
        let mut cfg = AppConfig::default();
        cfg.slave.heartbeat_interval_seconds = 30;
        cfg.master.slave_timeout_seconds = 20;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_timeouts() {
        let mut cfg = AppConfig::default();
        cfg.master.slave_timeout_seconds = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.slave.max_registration_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
[master]
master_id = "master-test"
slave_timeout_seconds = 45

[rings]
rebalance_probability = 0.0
"#
        )
        .unwrap();

        let cfg = AppConfig::load(file.path().to_str()).unwrap();
        assert_eq!(cfg.master.master_id, "master-test");
        assert_eq!(cfg.master.slave_timeout_seconds, 45);
        assert_eq!(cfg.rings.rebalance_probability, 0.0);
        // untouched sections keep their defaults
        assert_eq!(cfg.slave.device_status_interval_seconds, 10);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let cfg = AppConfig::load(Some("/nonexistent/orchestrator.toml")).unwrap();
        assert_eq!(cfg.master.master_id, "master-001");
    }
}
