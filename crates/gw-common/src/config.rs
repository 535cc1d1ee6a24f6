//! Gateway configuration: a line-oriented key/value file, not TOML.
//!
//! The on-disk grammar is an external contract (clients and deployment
//! scripts already write `/etc/kbusmodbusslave.conf` in this shape), so the
//! parser is hand-rolled rather than built on `serde`/`toml`. The resulting
//! [`GatewayConfig`] still derives `Serialize` so a loaded configuration can
//! be dumped as structured JSON via `tracing` for diagnostics.

use serde::Serialize;
use std::path::{Path, PathBuf};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/kbusmodbusslave.conf";

/// Gateway runtime configuration, parsed from the key/value config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayConfig {
    /// TCP and UDP port for the Modbus server.
    pub modbus_port: u16,
    /// TCP listen backlog.
    pub max_tcp_connections: i32,
    /// 0 = normal, 1 = coupler mode (every write triggers a force-update).
    pub operation_mode: i32,
    /// Per-reply post-send delay, in whole milliseconds.
    pub modbus_delay_ms: u64,
    /// RT-FIFO priority for the KBUS cycle thread, 1..99.
    pub kbus_priority: i32,
    /// Cycle period in milliseconds, 5..50.
    pub kbus_cycle_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            modbus_port: 502,
            max_tcp_connections: 5,
            operation_mode: 0,
            modbus_delay_ms: 0,
            kbus_priority: 60,
            kbus_cycle_ms: 50,
        }
    }
}

impl GatewayConfig {
    /// Whether coupler mode (force-update on every accepted write) is active.
    #[must_use]
    pub fn coupler_mode(&self) -> bool {
        self.operation_mode == 1
    }

    /// Load and parse a configuration file, starting from defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::BadValue`] if a *recognized* key has a value that does
    /// not parse or is out of its documented range. Unrecognized keys are
    /// silently ignored, matching the original reader.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e.to_string(),
        })?;
        Self::parse(&content)
    }

    /// Parse configuration text in the original key/value grammar.
    ///
    /// Lines are delimited by whitespace/newlines; a line whose first
    /// non-blank character is `#` is a comment and is skipped entirely, as is
    /// any blank line. Each remaining line is tokenized on runs of
    /// whitespace; the first token is the key, the second is the value.
    /// Lines naming a key outside the recognized set are silently skipped.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (lineno, raw_line) in content.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut tokens = line.split_whitespace();
            let Some(key) = tokens.next() else {
                continue;
            };
            let Some(value) = tokens.next() else {
                continue;
            };

            config.apply(key, value, lineno + 1)?;
        }

        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str, lineno: usize) -> Result<(), ConfigError> {
        let parse_i32 = |v: &str| {
            v.parse::<i32>().map_err(|_| ConfigError::BadValue {
                line: lineno,
                key: key.to_string(),
                value: value.to_string(),
            })
        };

        match key {
            "modbus_port" => {
                let port = parse_i32(value)?;
                self.modbus_port = u16::try_from(port).map_err(|_| ConfigError::BadValue {
                    line: lineno,
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            "max_tcp_connections" => {
                self.max_tcp_connections = parse_i32(value)?;
            }
            "operation_mode" => {
                // Clamped to {0, 1}, not rejected outright.
                self.operation_mode = if parse_i32(value)? == 1 { 1 } else { 0 };
            }
            "modbus_delay_ms" => {
                let ms = parse_i32(value)?;
                if ms < 0 {
                    return Err(ConfigError::BadValue {
                        line: lineno,
                        key: key.to_string(),
                        value: value.to_string(),
                    });
                }
                self.modbus_delay_ms = ms as u64;
            }
            "kbus_priority" => {
                let prio = parse_i32(value)?;
                if !(1..=99).contains(&prio) {
                    return Err(ConfigError::BadValue {
                        line: lineno,
                        key: key.to_string(),
                        value: value.to_string(),
                    });
                }
                self.kbus_priority = prio;
            }
            "kbus_cycle_ms" => {
                let ms = parse_i32(value)?;
                if !(5..=50).contains(&ms) {
                    return Err(ConfigError::BadValue {
                        line: lineno,
                        key: key.to_string(),
                        value: value.to_string(),
                    });
                }
                self.kbus_cycle_ms = ms as u64;
            }
            _ => {
                // Unrecognized key: fall through silently, matching the
                // original reader's unconditional scan.
            }
        }

        Ok(())
    }
}

/// Configuration-related errors. Fatal at startup.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ConfigError {
    /// File could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error message.
        source: String,
    },

    /// A recognized key had a value that failed to parse or was out of range.
    #[error("bad value for '{key}' on line {line}: '{value}'")]
    BadValue {
        /// Line number (1-based) in the config file.
        line: usize,
        /// The recognized key.
        key: String,
        /// The offending value text.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.modbus_port, 502);
        assert_eq!(config.kbus_cycle_ms, 50);
        assert_eq!(config.kbus_priority, 60);
        assert!(!config.coupler_mode());
    }

    #[test]
    fn test_parse_basic() {
        let text = "modbus_port 1502\nkbus_cycle_ms 10\n";
        let config = GatewayConfig::parse(text).unwrap();
        assert_eq!(config.modbus_port, 1502);
        assert_eq!(config.kbus_cycle_ms, 10);
    }

    #[test]
    fn test_comments_and_blank_lines_skipped() {
        let text = "# a comment\n\nmodbus_port 1234\n   # indented comment\n";
        let config = GatewayConfig::parse(text).unwrap();
        assert_eq!(config.modbus_port, 1234);
    }

    #[test]
    fn test_unrecognized_key_ignored() {
        let text = "bogus_key 99\nmodbus_port 600\n";
        let config = GatewayConfig::parse(text).unwrap();
        assert_eq!(config.modbus_port, 600);
    }

    #[test]
    fn test_operation_mode_clamped() {
        let text = "operation_mode 7\n";
        let config = GatewayConfig::parse(text).unwrap();
        assert_eq!(config.operation_mode, 0);

        let text = "operation_mode 1\n";
        let config = GatewayConfig::parse(text).unwrap();
        assert_eq!(config.operation_mode, 1);
        assert!(config.coupler_mode());
    }

    #[test]
    fn test_kbus_priority_out_of_range_is_fatal() {
        let text = "kbus_priority 0\n";
        assert!(GatewayConfig::parse(text).is_err());

        let text = "kbus_priority 100\n";
        assert!(GatewayConfig::parse(text).is_err());
    }

    #[test]
    fn test_kbus_cycle_ms_out_of_range_is_fatal() {
        assert!(GatewayConfig::parse("kbus_cycle_ms 4\n").is_err());
        assert!(GatewayConfig::parse("kbus_cycle_ms 51\n").is_err());
        assert!(GatewayConfig::parse("kbus_cycle_ms 5\n").is_ok());
        assert!(GatewayConfig::parse("kbus_cycle_ms 50\n").is_ok());
    }

    #[test]
    fn test_malformed_recognized_value_is_fatal() {
        let text = "modbus_port not_a_number\n";
        let err = GatewayConfig::parse(text).unwrap_err();
        assert!(matches!(err, ConfigError::BadValue { .. }));
    }

    #[test]
    fn test_modbus_delay_default_is_zero() {
        // Resolves the upstream "missing default" bug explicitly.
        assert_eq!(GatewayConfig::default().modbus_delay_ms, 0);
    }
}
