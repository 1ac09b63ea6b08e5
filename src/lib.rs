//! Reads SML telegrams from a smart meter's IR interface and publishes the
//! decoded readings to an MQTT broker.

pub mod config;
pub mod logbook;
pub mod metering_sml;
pub mod models;
pub mod mqtt;
pub mod poller;
pub mod serial;

// Re-export common types for easier access
pub use config::{Config, ConfigError};
pub use models::{CycleOutcome, Metrics, NoDataReason};
pub use mqtt::{MetricPublisher, MqttPublisher, TransportError};
pub use poller::{PollLoop, PollSettings};
pub use serial::{MeterSource, SerialMeter};

pub fn get_unix_ts() -> u64 {
    return std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
}
