use std::collections::HashSet;
use std::path::{Path, PathBuf};

use hdcp_core::{HdcpConfig, Policy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),
    #[error("config parse error: {0}")]
    ParseError(String),
    #[error("config validation error: {0}")]
    ValidationError(String),
}

/// One display output and the receiver simulated behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub id: u32,
    pub name: String,
    /// Seeds the simulated receiver and cipher engine.
    pub seed: u64,
    /// Simulate a repeater with this many downstream sinks.
    #[serde(default)]
    pub repeater_devices: Option<u8>,
    /// Overrides `hdcp.policy` for this output.
    #[serde(default)]
    pub policy: Option<Policy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    // Logging
    pub log_level: String,
    pub log_json: bool,
    pub log_file: Option<PathBuf>,

    // Registry
    pub max_outputs: usize,
    pub outputs: Vec<OutputConfig>,

    // Reporting
    pub status_interval_secs: u64,
    pub settle_timeout_secs: u64,

    pub hdcp: HdcpConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            log_file: None,
            max_outputs: 4,
            outputs: vec![OutputConfig {
                id: 0,
                name: "hdmi0".to_string(),
                seed: 1,
                repeater_devices: None,
                policy: None,
            }],
            status_interval_secs: 10,
            settle_timeout_secs: 15,
            hdcp: HdcpConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileNotFound(format!("{}: {e}", path.display())))?;
        let config = Self::from_toml(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn load_from_env() -> Self {
        let mut config = Self::default();

        if let Ok(level) = std::env::var("RUST_LOG") {
            config.log_level = level;
        }
        if let Ok(level) = std::env::var("HDCP_LOG_LEVEL") {
            config.log_level = level;
        }
        if let Some(max) = env_parse("HDCP_MAX_OUTPUTS") {
            config.max_outputs = max;
        }
        if let Ok(policy) = std::env::var("HDCP_POLICY") {
            match policy.as_str() {
                "always_on" => config.hdcp.policy = Policy::AlwaysOn,
                "on_demand" => config.hdcp.policy = Policy::OnDemand,
                _ => {}
            }
        }
        if let Some(fail_closed) = env_parse("HDCP_FAIL_CLOSED") {
            config.hdcp.fail_closed = fail_closed;
        }
        if let Some(budget) = env_parse("HDCP_RETRY_BUDGET") {
            config.hdcp.retry_budget = budget;
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_outputs == 0 {
            return Err(ConfigError::ValidationError(
                "max_outputs must be at least 1".to_string(),
            ));
        }
        if self.outputs.len() > self.max_outputs {
            return Err(ConfigError::ValidationError(format!(
                "{} outputs configured but max_outputs is {}",
                self.outputs.len(),
                self.max_outputs
            )));
        }
        let mut ids = HashSet::new();
        for output in &self.outputs {
            if !ids.insert(output.id) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate output id {}",
                    output.id
                )));
            }
        }
        if self.status_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "status_interval_secs must be at least 1".to_string(),
            ));
        }
        self.hdcp
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// HDCP settings for one output, with its policy override applied.
    pub fn hdcp_for(&self, output: &OutputConfig) -> HdcpConfig {
        HdcpConfig {
            policy: output.policy.unwrap_or(self.hdcp.policy),
            ..self.hdcp.clone()
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AgentConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = AgentConfig::from_toml(
            r#"
            log_level = "debug"

            [[outputs]]
            id = 2
            name = "dp1"
            seed = 7
            repeater_devices = 3
            policy = "always_on"

            [hdcp]
            retry_budget = 2
            read_format = "short"
            "#,
        )
        .unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.max_outputs, 4);
        assert_eq!(config.outputs.len(), 1);
        assert_eq!(config.outputs[0].repeater_devices, Some(3));
        assert_eq!(config.hdcp.retry_budget, 2);
        assert_eq!(config.hdcp.bus_attempts, HdcpConfig::default().bus_attempts);
        assert!(config.validate().is_ok());

        let hdcp = config.hdcp_for(&config.outputs[0]);
        assert_eq!(hdcp.policy, Policy::AlwaysOn);
        assert_eq!(config.hdcp.policy, Policy::OnDemand);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = AgentConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(AgentConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_duplicate_output_ids_rejected() {
        let mut config = AgentConfig::default();
        config.outputs.push(config.outputs[0].clone());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(msg)) if msg.contains("duplicate")
        ));
    }

    #[test]
    fn test_too_many_outputs_rejected() {
        let mut config = AgentConfig {
            max_outputs: 1,
            ..Default::default()
        };
        let mut second = config.outputs[0].clone();
        second.id = 1;
        config.outputs.push(second);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_hdcp_section_rejected() {
        let mut config = AgentConfig::default();
        config.hdcp.bus_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(msg)) if msg.contains("bus_attempts")
        ));
    }

    #[test]
    fn test_parse_error_reported() {
        assert!(matches!(
            AgentConfig::from_toml("max_outputs = \"many\""),
            Err(ConfigError::ParseError(_))
        ));
    }
}
