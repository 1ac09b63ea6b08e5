use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Metric name to value, ordered by name so payloads and logs are stable.
pub type Metrics = BTreeMap<String, f64>;

/// Why a poll cycle did not publish anything. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoDataReason {
    /// The serial read returned zero bytes within the read timeout
    EmptyRead,
    /// Bytes arrived but no complete frame was among them
    NoFrames,
    /// Frames were decoded but none contained a registered value
    NoMetrics,
}

impl fmt::Display for NoDataReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            NoDataReason::EmptyRead => "nothing received from the meter",
            NoDataReason::NoFrames => "no complete SML frame received",
            NoDataReason::NoMetrics => "no known values in the received frames",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Published { metrics: Metrics },
    NoData(NoDataReason),
}

/// Payload of the aggregate topic: all metrics plus the publish time.
#[derive(Debug, Clone, Serialize)]
pub struct MeterReading<'a> {
    #[serde(flatten)]
    pub metrics: &'a Metrics,
    pub timestamp: u64,
}
