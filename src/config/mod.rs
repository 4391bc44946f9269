//! # Configuration
//!
//! TOML configuration for the gateway. Every tuning knob has a default so a
//! minimal file only needs the serial port and the device list:
//!
//! ```toml
//! [modem]
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//!
//! [logging]
//! level = "info"
//!
//! [[devices]]
//! address = "28.C3.91"
//! product_key = "F00.00.01"
//! name = "hall dimmer"
//!
//! [[devices]]
//! address = "A.1"
//! product_key = "X00.00.01"
//! ```
//!
//! Sections:
//!
//! - [`ModemConfig`] - serial link to the PLM
//! - [`TransportConfig`] - ACK wait, retries, reconnect backoff
//! - [`ModemDbConfig`] - link database download
//! - [`PollingConfig`] - device polling and liveness
//! - [`LoggingConfig`] - level and optional log file
//! - [`DeviceConfig`] - one entry per configured device
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::device::DeviceTuning;
use crate::plm::address::DeviceAddress;
use crate::plm::port::PortTuning;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub modem: ModemConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub modem_db: ModemDbConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Extra device types (TOML) merged over the built-in table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_types_file: Option<String>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemConfig {
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Serial read timeout; bounds how long the reader holds the port lock.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_baud_rate() -> u32 {
    115200
}

fn default_read_timeout_ms() -> u64 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Retransmissions after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Reconnect delays; the last one repeats.
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: Vec<u64>,
}

fn default_ack_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_reconnect_backoff_ms() -> Vec<u64> {
    vec![500, 1000, 2000, 5000, 10_000]
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemDbConfig {
    #[serde(default = "default_db_retry_timeout_ms")]
    pub retry_timeout_ms: u64,
}

fn default_db_retry_timeout_ms() -> u64 {
    120_000
}

impl Default for ModemDbConfig {
    fn default() -> Self {
        Self {
            retry_timeout_ms: default_db_retry_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// How long a direct query may stay unanswered before the device moves on.
    #[serde(default = "default_direct_ack_timeout_ms")]
    pub direct_ack_timeout_ms: u64,
    /// Consecutive unanswered polls before a device is reported unreachable.
    #[serde(default = "default_dead_device_count")]
    pub dead_device_count: u32,
}

fn default_poll_interval_secs() -> u64 {
    300
}

fn default_direct_ack_timeout_ms() -> u64 {
    6000
}

fn default_dead_device_count() -> u32 {
    10
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            direct_ack_timeout_ms: default_direct_ack_timeout_ms(),
            dead_device_count: default_dead_device_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// `xx.xx.xx` for Insteon, `H.U` for X10.
    pub address: String,
    pub product_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl DeviceConfig {
    pub fn parsed_address(&self) -> Result<DeviceAddress> {
        self.address
            .parse()
            .map_err(|e| anyhow!("Invalid device address {}: {}", self.address, e))
    }
}

impl Config {
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.modem.port.trim().is_empty() {
            return Err(anyhow!("modem.port must not be empty"));
        }
        if self.modem.baud_rate == 0 {
            return Err(anyhow!("modem.baud_rate must be positive"));
        }
        if self.transport.ack_timeout_ms == 0 {
            return Err(anyhow!("transport.ack_timeout_ms must be positive"));
        }
        if self.modem_db.retry_timeout_ms == 0 {
            return Err(anyhow!("modem_db.retry_timeout_ms must be positive"));
        }
        for dev in &self.devices {
            dev.parsed_address()?;
        }
        Ok(())
    }

    pub fn port_tuning(&self) -> PortTuning {
        let backoff = self
            .transport
            .reconnect_backoff_ms
            .iter()
            .copied()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .collect::<Vec<_>>();
        PortTuning {
            read_timeout: Duration::from_millis(self.modem.read_timeout_ms.max(1)),
            ack_timeout: Duration::from_millis(self.transport.ack_timeout_ms),
            max_retries: self.transport.max_retries,
            retry_delay: Duration::from_millis(self.transport.retry_delay_ms),
            reconnect_backoff: if backoff.is_empty() {
                PortTuning::default().reconnect_backoff
            } else {
                backoff
            },
        }
    }

    pub fn device_tuning(&self) -> DeviceTuning {
        DeviceTuning {
            direct_ack_timeout: Duration::from_millis(self.polling.direct_ack_timeout_ms),
            dead_device_count: self.polling.dead_device_count,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.polling.poll_interval_secs.max(1))
    }

    pub fn db_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.modem_db.retry_timeout_ms.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            modem: ModemConfig {
                port: "/dev/ttyUSB0".to_string(),
                baud_rate: default_baud_rate(),
                read_timeout_ms: default_read_timeout_ms(),
            },
            transport: TransportConfig::default(),
            modem_db: ModemDbConfig::default(),
            polling: PollingConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("plmgate.log".to_string()),
            },
            device_types_file: None,
            devices: vec![DeviceConfig {
                address: "28.C3.91".to_string(),
                product_key: "F00.00.01".to_string(),
                name: Some("example dimmer".to_string()),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [modem]
            port = "/dev/ttyUSB1"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.modem.baud_rate, 115200);
        assert_eq!(cfg.transport.max_retries, 3);
        assert_eq!(cfg.transport.ack_timeout_ms, 10_000);
        assert_eq!(cfg.modem_db.retry_timeout_ms, 120_000);
        assert_eq!(cfg.polling.dead_device_count, 10);
        assert!(cfg.devices.is_empty());
        cfg.validate().unwrap();
    }

    #[test]
    fn default_round_trips_through_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.devices.len(), 1);
        assert_eq!(back.devices[0].parsed_address().unwrap().to_string(), "28.C3.91");
    }

    #[test]
    fn bad_device_address_fails_validation() {
        let mut cfg = Config::default();
        cfg.devices.push(DeviceConfig {
            address: "nope".to_string(),
            product_key: "F00.00.01".to_string(),
            name: None,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_backoff_falls_back() {
        let mut cfg = Config::default();
        cfg.transport.reconnect_backoff_ms = vec![0];
        assert!(!cfg.port_tuning().reconnect_backoff.is_empty());
    }

    #[test]
    fn zero_db_retry_timeout_is_rejected() {
        let mut cfg = Config::default();
        cfg.modem_db.retry_timeout_ms = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("retry_timeout_ms"));
        assert!(cfg.db_retry_timeout() > Duration::ZERO);
    }
}
