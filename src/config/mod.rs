use crate::metering_sml::frame::MAX_BUFFER_SIZE;
use clap::Parser;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const CONFIG_LOCATIONS: [&str; 2] = ["config/sml2mqtt.yaml", "sml2mqtt.yaml"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("unable to parse config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("{what} not found at {path}. {remedy}")]
    Missing { what: &'static str, path: PathBuf, remedy: &'static str },
}

fn mqtt_host_default() -> String { return "localhost".to_string() }
fn mqtt_port_default() -> u16 { return 1883 }
fn mqtt_keep_alive_default() -> u64 { return 60 }
fn mqtt_connect_timeout_default() -> u64 { return 10 }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct MqttConfig {
    #[serde(default="mqtt_host_default")]
    pub host: String,
    #[serde(default="mqtt_port_default")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default="mqtt_keep_alive_default")]
    pub keep_alive: u64,
    #[serde(default="mqtt_connect_timeout_default")]
    pub connect_timeout: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        MqttConfig {
            host: mqtt_host_default(),
            port: mqtt_port_default(),
            user: None,
            pass: None,
            client_name: None,
            keep_alive: mqtt_keep_alive_default(),
            connect_timeout: mqtt_connect_timeout_default(),
        }
    }
}

#[cfg(windows)]
fn serial_port_default() -> String { return "COM3".to_string() }
#[cfg(not(windows))]
fn serial_port_default() -> String { return "/dev/ttyUSB0".to_string() }
fn serial_baud_default() -> u32 { return 9600 }
fn serial_read_timeout_default() -> u64 { return 5 }
fn serial_read_budget_default() -> usize { return 3000 }
fn serial_flush_default() -> bool { return true }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct SerialConfig {
    #[serde(default="serial_port_default")]
    pub port: String,
    #[serde(default="serial_baud_default")]
    pub baud: u32,
    /// Seconds one read may take at most
    #[serde(default="serial_read_timeout_default")]
    pub read_timeout: u64,
    /// Bytes read per poll cycle
    #[serde(default="serial_read_budget_default")]
    pub read_budget: usize,
    /// Drop bytes that queued up while sleeping before each read
    #[serde(default="serial_flush_default")]
    pub flush_stale_input: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            port: serial_port_default(),
            baud: serial_baud_default(),
            read_timeout: serial_read_timeout_default(),
            read_budget: serial_read_budget_default(),
            flush_stale_input: serial_flush_default(),
        }
    }
}

fn meter_name_default() -> String { return "light".to_string() }
fn meter_interval_default() -> u64 { return 5 }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct MeterConfig {
    #[serde(default="meter_name_default")]
    pub name: String,
    /// Seconds between two poll cycles
    #[serde(default="meter_interval_default")]
    pub interval: u64,
}

impl Default for MeterConfig {
    fn default() -> Self {
        MeterConfig { name: meter_name_default(), interval: meter_interval_default() }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub meter: MeterConfig,
}

/// Command line of the publisher. Everything given here wins over the
/// config file.
#[derive(Parser, Debug, Default)]
#[command(name = "sml2mqtt", version, about = "Publish SML smart meter readings to MQTT")]
pub struct PublisherArgs {
    /// Meter name used in the MQTT topics (default: light)
    #[arg(long)]
    pub name: Option<String>,

    /// Serial port of the IR reading head (default: /dev/ttyUSB0)
    #[arg(long, value_name = "TTY", value_hint = clap::ValueHint::FilePath)]
    pub port: Option<String>,

    /// Baud rate (default: 9600)
    #[arg(long)]
    pub baud: Option<u32>,

    /// Polling interval in seconds (default: 5)
    #[arg(long)]
    pub interval: Option<u64>,

    /// Path of a YAML config file
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// MQTT broker host (default: localhost)
    #[arg(long)]
    pub broker: Option<String>,

    /// MQTT broker port (default: 1883)
    #[arg(long)]
    pub broker_port: Option<u16>,
}

impl Config {
    /// Loads the given file, or the first config found in the default
    /// locations. Without any file the defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        for candidate in CONFIG_LOCATIONS {
            let candidate = Path::new(candidate);
            if candidate.exists() {
                return Self::from_file(candidate);
            }
        }

        debug!("No config file found, using defaults");
        Ok(Config::default())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let config = Self::from_yaml(&contents)
            .map_err(|reason| ConfigError::Parse { path: path.to_path_buf(), reason })?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, String> {
        if contents.trim().is_empty() {
            return Ok(Config::default());
        }
        serde_yml::from_str(contents).map_err(|e| e.to_string())
    }

    pub fn apply_args(&mut self, args: &PublisherArgs) {
        if let Some(name) = &args.name {
            self.meter.name = name.clone();
        }
        if let Some(interval) = args.interval {
            self.meter.interval = interval;
        }
        if let Some(port) = &args.port {
            self.serial.port = port.clone();
        }
        if let Some(baud) = args.baud {
            self.serial.baud = baud;
        }
        if let Some(broker) = &args.broker {
            self.mqtt.host = broker.clone();
        }
        if let Some(port) = args.broker_port {
            self.mqtt.port = port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_meter_name(&self.meter.name)?;
        if self.meter.interval == 0 {
            return Err(ConfigError::Invalid { field: "meter.interval", reason: "must be at least 1 second".to_string() });
        }
        if self.serial.baud == 0 {
            return Err(ConfigError::Invalid { field: "serial.baud", reason: "must be positive".to_string() });
        }
        if self.serial.read_budget == 0 {
            return Err(ConfigError::Invalid { field: "serial.read_budget", reason: "must be positive".to_string() });
        }
        if self.serial.read_budget > MAX_BUFFER_SIZE {
            return Err(ConfigError::Invalid {
                field: "serial.read_budget",
                reason: format!("must not exceed the frame buffer of {} bytes", MAX_BUFFER_SIZE),
            });
        }
        if self.serial.read_timeout == 0 {
            return Err(ConfigError::Invalid { field: "serial.read_timeout", reason: "must be at least 1 second".to_string() });
        }
        if self.serial.port.is_empty() {
            return Err(ConfigError::Invalid { field: "serial.port", reason: "must not be empty".to_string() });
        }
        if self.mqtt.host.is_empty() {
            return Err(ConfigError::Invalid { field: "mqtt.host", reason: "must not be empty".to_string() });
        }
        Ok(())
    }

    pub fn client_id(&self) -> String {
        self.mqtt.client_name.clone().unwrap_or_else(|| format!("sml2mqtt-{}", self.meter.name))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.meter.interval)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.serial.read_timeout)
    }
}

/// Meter names end up as a topic level, so MQTT wildcards and separators are
/// not allowed.
pub fn validate_meter_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::Invalid { field: "meter.name", reason: "must not be empty".to_string() });
    }
    if name.contains(['+', '#', '/']) {
        return Err(ConfigError::Invalid {
            field: "meter.name",
            reason: format!("'{name}' must not contain '+', '#' or '/'"),
        });
    }
    Ok(())
}
