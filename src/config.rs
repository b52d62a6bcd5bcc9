//! Configuration loading and validation
//!
//! Config is a single TOML file given by `-config` (default `./config.toml`).
//! Unlike a desktop app, a misconfigured ingest daemon must not silently fall
//! back to defaults: `load` is fail-fast — any read, parse, or validation
//! error is returned to the caller, which `main.rs` treats as `config_invalid`
//! and exits nonzero.

use crate::constants::CANONICAL_BAUD_RATES;
use crate::error::{IngestError, Result};
use crate::model::{designation_is_valid, fips_is_valid, PortKind, PortSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

// =============================================================================
// Top-level Config
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub ports: Vec<PortSpec>,
    pub detection: DetectionConfig,
    pub nats: NatsConfig,
    pub logging: LoggingConfig,
    pub monitoring: MonitoringConfig,
    pub recovery: RecoveryConfig,
    pub forwarder: ForwarderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub instance_id: String,
    pub fips_code: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "cdr-ingestd".to_string(),
            instance_id: "default".to_string(),
            fips_code: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub baud_rates: Vec<u32>,
    pub detection_timeout_sec: u64,
    pub min_bytes_for_valid: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            baud_rates: vec![9600, 19200, 4800, 38400],
            detection_timeout_sec: 5,
            min_bytes_for_valid: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub url: String,
    pub subject_prefix: String,
    pub max_reconnects: i64,
    pub reconnect_wait_sec: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            subject_prefix: "cdr".to_string(),
            max_reconnects: -1,
            reconnect_wait_sec: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub base_path: PathBuf,
    pub max_size_mb: u64,
    pub max_backups: usize,
    pub compress: bool,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("/var/log/cdr"),
            max_size_mb: 100,
            max_backups: 5,
            compress: false,
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub reconnect_delay_sec: u64,
    pub max_reconnect_delay_sec: u64,
    pub exponential_backoff: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_sec: 1,
            max_reconnect_delay_sec: 60,
            exponential_backoff: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ForwarderConfig {
    pub enabled: bool,
    pub remote_url: Option<String>,
    pub remote_subject: Option<String>,
    pub remote_creds: Option<String>,
}

// =============================================================================
// Loading
// =============================================================================

pub fn load(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path).map_err(|e| IngestError::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: Config = toml::from_str(&content).map_err(|e| IngestError::ConfigParse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    validate(&config)?;
    Ok(config)
}

// =============================================================================
// Validation (spec.md §6)
// =============================================================================

pub fn validate(config: &Config) -> Result<()> {
    if let Some(fips) = &config.app.fips_code {
        if !fips_is_valid(fips) {
            return Err(IngestError::ConfigValidation {
                field: "app.fips_code".to_string(),
                reason: format!("'{fips}' is not 10 decimal digits"),
            });
        }
    }

    if !config.nats.url.starts_with("nats://") {
        return Err(IngestError::ConfigValidation {
            field: "nats.url".to_string(),
            reason: format!("'{}' must use the nats:// scheme", config.nats.url),
        });
    }
    if config.nats.max_reconnects < -1 {
        return Err(IngestError::ConfigValidation {
            field: "nats.max_reconnects".to_string(),
            reason: "must be >= -1 (-1 = unlimited)".to_string(),
        });
    }

    if config.recovery.max_reconnect_delay_sec < config.recovery.reconnect_delay_sec {
        return Err(IngestError::ConfigValidation {
            field: "recovery.max_reconnect_delay_sec".to_string(),
            reason: "must be >= recovery.reconnect_delay_sec".to_string(),
        });
    }

    let mut designations = HashSet::new();
    let mut device_paths = HashSet::new();
    let mut http_bindings = HashSet::new();

    for port in &config.ports {
        if !designation_is_valid(&port.designation) {
            return Err(IngestError::ConfigValidation {
                field: "ports[].designation".to_string(),
                reason: format!("'{}' does not match ^[AB](1..16)$", port.designation),
            });
        }
        if !port.enabled {
            continue;
        }
        if !designations.insert(port.designation.clone()) {
            return Err(IngestError::DuplicatePort {
                field: "designation",
                value: port.designation.clone(),
            });
        }

        if let Some(fips) = &port.fips {
            if !fips_is_valid(fips) {
                return Err(IngestError::ConfigValidation {
                    field: "ports[].fips_code".to_string(),
                    reason: format!("'{fips}' is not 10 decimal digits"),
                });
            }
        }

        match port.kind {
            PortKind::Serial => {
                if let Some(baud) = port.baud {
                    if !CANONICAL_BAUD_RATES.contains(&baud) {
                        return Err(IngestError::ConfigValidation {
                            field: "ports[].baud_rate".to_string(),
                            reason: format!("{baud} is not a canonical baud rate"),
                        });
                    }
                }
                if !matches!(port.data_bits, 5 | 6 | 7 | 8) {
                    return Err(IngestError::ConfigValidation {
                        field: "ports[].data_bits".to_string(),
                        reason: format!("{} must be one of 5,6,7,8", port.data_bits),
                    });
                }
                if !device_paths.insert(port.device_path.clone()) {
                    return Err(IngestError::DuplicatePort {
                        field: "device",
                        value: port.device_path.clone(),
                    });
                }
            }
            PortKind::Http => {
                if !port.url_path.starts_with('/') {
                    return Err(IngestError::ConfigValidation {
                        field: "ports[].path".to_string(),
                        reason: format!("'{}' must begin with /", port.url_path),
                    });
                }
                let binding = (port.url_path.clone(), port.listen_port);
                if !http_bindings.insert(binding) {
                    return Err(IngestError::DuplicatePort {
                        field: "path+listen_port",
                        value: format!("{}:{}", port.url_path, port.listen_port),
                    });
                }
            }
        }
    }

    Ok(())
}
