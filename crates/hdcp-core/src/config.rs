//! Timing and policy configuration for an HDCP session.
//!
//! All durations are stored in milliseconds so the struct reads naturally
//! from TOML; use the accessors to get [`Duration`]s.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use hdcp_transport::BoundedRetry;

use crate::session::Policy;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid hdcp configuration: {0}")]
pub struct InvalidConfig(pub String);

/// How the receiver's Ri' is read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadFormat {
    /// Register-addressed read of offset 0x08.
    #[default]
    Long,
    /// Read from the current offset, when the bus adapter supports it.
    Short,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HdcpConfig {
    pub policy: Policy,

    // Bus retry
    pub bus_attempts: u32,
    pub bus_retry_delay_ms: u64,
    pub bcaps_attempts: u32,
    pub bcaps_backoff_ms: u64,

    // Engine waits and settle delays
    pub engine_timeout_ms: u64,
    pub key_timeout_ms: u64,
    pub sram_clear_attempts: u32,
    pub an_settle_ms: u64,
    pub r0_settle_ms: u64,
    pub sprime_settle_ms: u64,
    pub exchange_timeout_ms: u64,

    // Link verification
    pub verify_period_ms: u64,
    pub ri_attempts: u32,
    pub ri_retry_delay_ms: u64,
    pub read_format: ReadFormat,

    // Repeaters
    pub repeater_ready_timeout_ms: u64,
    pub ready_poll_ms: u64,
    pub max_downstream_devices: u8,

    // Failure handling
    pub fail_closed: bool,
    pub retry_budget: u32,
    pub renegotiate_delay_ms: u64,

    pub command_queue: usize,
}

impl Default for HdcpConfig {
    fn default() -> Self {
        Self {
            policy: Policy::OnDemand,
            bus_attempts: 15,
            bus_retry_delay_ms: 250,
            bcaps_attempts: 3,
            bcaps_backoff_ms: 100,
            engine_timeout_ms: 120,
            key_timeout_ms: 20,
            sram_clear_attempts: 6,
            an_settle_ms: 25,
            r0_settle_ms: 100,
            sprime_settle_ms: 50,
            exchange_timeout_ms: 120,
            verify_period_ms: 1500,
            ri_attempts: 3,
            ri_retry_delay_ms: 50,
            read_format: ReadFormat::Long,
            repeater_ready_timeout_ms: 5000,
            ready_poll_ms: 100,
            max_downstream_devices: 127,
            fail_closed: true,
            retry_budget: 0,
            renegotiate_delay_ms: 1750,
            command_queue: 4,
        }
    }
}

impl HdcpConfig {
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        let nonzero_counts = [
            ("bus_attempts", self.bus_attempts),
            ("bcaps_attempts", self.bcaps_attempts),
            ("ri_attempts", self.ri_attempts),
            ("sram_clear_attempts", self.sram_clear_attempts),
        ];
        for (name, value) in nonzero_counts {
            if value == 0 {
                return Err(InvalidConfig(format!("{name} must be at least 1")));
            }
        }
        if self.engine_timeout_ms == 0 || self.key_timeout_ms == 0 || self.exchange_timeout_ms == 0
        {
            return Err(InvalidConfig(
                "engine, key and exchange timeouts must be non-zero".to_string(),
            ));
        }
        if self.verify_period_ms == 0 {
            return Err(InvalidConfig("verify_period_ms must be non-zero".to_string()));
        }
        if self.ready_poll_ms == 0 || self.ready_poll_ms > self.repeater_ready_timeout_ms {
            return Err(InvalidConfig(
                "ready_poll_ms must be non-zero and no longer than repeater_ready_timeout_ms"
                    .to_string(),
            ));
        }
        if self.max_downstream_devices > 127 {
            return Err(InvalidConfig(
                "max_downstream_devices must be at most 127".to_string(),
            ));
        }
        if self.command_queue == 0 {
            return Err(InvalidConfig("command_queue must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn bus_retry(&self) -> BoundedRetry {
        BoundedRetry::new(self.bus_attempts, ms(self.bus_retry_delay_ms))
    }

    pub fn bcaps_retry(&self) -> BoundedRetry {
        BoundedRetry::new(self.bcaps_attempts, ms(self.bcaps_backoff_ms))
    }

    pub fn engine_timeout(&self) -> Duration {
        ms(self.engine_timeout_ms)
    }

    pub fn key_timeout(&self) -> Duration {
        ms(self.key_timeout_ms)
    }

    pub fn an_settle(&self) -> Duration {
        ms(self.an_settle_ms)
    }

    pub fn r0_settle(&self) -> Duration {
        ms(self.r0_settle_ms)
    }

    pub fn sprime_settle(&self) -> Duration {
        ms(self.sprime_settle_ms)
    }

    pub fn exchange_timeout(&self) -> Duration {
        ms(self.exchange_timeout_ms)
    }

    pub fn verify_period(&self) -> Duration {
        ms(self.verify_period_ms)
    }

    pub fn ri_retry_delay(&self) -> Duration {
        ms(self.ri_retry_delay_ms)
    }

    pub fn repeater_ready_timeout(&self) -> Duration {
        ms(self.repeater_ready_timeout_ms)
    }

    pub fn ready_poll(&self) -> Duration {
        ms(self.ready_poll_ms)
    }

    pub fn renegotiate_delay(&self) -> Duration {
        ms(self.renegotiate_delay_ms)
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}
