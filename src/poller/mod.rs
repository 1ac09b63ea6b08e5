use crate::config::Config;
use crate::get_unix_ts;
use crate::metering_sml::{drain_metrics, FrameAssembler};
use crate::models::{CycleOutcome, NoDataReason};
use crate::mqtt::{publish_metrics, MetricPublisher, TransportError};
use crate::serial::{MeterSource, SerialError};
use log::{debug, error, info, warn};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum CycleError {
    #[error(transparent)]
    Serial(#[from] SerialError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollSettings {
    pub meter_name: String,
    pub interval: Duration,
    pub read_budget: usize,
    pub read_timeout: Duration,
    pub flush_stale_input: bool,
}

impl From<&Config> for PollSettings {
    fn from(config: &Config) -> Self {
        PollSettings {
            meter_name: config.meter.name.clone(),
            interval: config.poll_interval(),
            read_budget: config.serial.read_budget,
            read_timeout: config.read_timeout(),
            flush_stale_input: config.serial.flush_stale_input,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Stopping,
}

/// Reads the meter, decodes what arrived and publishes the result, once per
/// interval until cancelled.
pub struct PollLoop<S: MeterSource, P: MetricPublisher> {
    source: S,
    publisher: P,
    assembler: FrameAssembler,
    settings: PollSettings,
    state: LoopState,
}

impl<S: MeterSource, P: MetricPublisher> PollLoop<S, P> {
    pub fn new(source: S, publisher: P, settings: PollSettings) -> Self {
        PollLoop { source, publisher, assembler: FrameAssembler::new(), settings, state: LoopState::Running }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// One read, decode and publish cycle.
    pub async fn poll_once(&mut self) -> Result<CycleOutcome, CycleError> {
        if self.settings.flush_stale_input {
            self.source.discard_input()?;
            // The flush broke the byte stream, a buffered partial frame can not be completed anymore
            if !self.assembler.is_empty() {
                debug!("Dropping {} buffered bytes after input flush", self.assembler.len());
            }
            self.assembler.reset();
        }

        let chunk = self.source.read_chunk(self.settings.read_budget, self.settings.read_timeout).await?;
        if chunk.is_empty() {
            return Ok(CycleOutcome::NoData(NoDataReason::EmptyRead));
        }

        self.assembler.add(&chunk);
        let summary = drain_metrics(&mut self.assembler);
        debug!("{} frames decoded ({} failed) from {} bytes", summary.frames, summary.failed_frames, chunk.len());

        if summary.frames == 0 {
            return Ok(CycleOutcome::NoData(NoDataReason::NoFrames));
        }
        if summary.metrics.is_empty() {
            return Ok(CycleOutcome::NoData(NoDataReason::NoMetrics));
        }

        publish_metrics(&mut self.publisher, &self.settings.meter_name, &summary.metrics, get_unix_ts()).await?;
        Ok(CycleOutcome::Published { metrics: summary.metrics })
    }

    /// Runs cycles until `token` is cancelled, then closes the serial port and
    /// the broker connection. Failed cycles are logged and do not end the loop.
    pub async fn run(&mut self, token: CancellationToken) {
        info!("Polling meter {} every {:?}", self.settings.meter_name, self.settings.interval);

        while !token.is_cancelled() {
            match self.poll_once().await {
                Ok(CycleOutcome::Published { metrics }) => {
                    let values: Vec<String> = metrics.iter().map(|(k, v)| format!("{k}={v}")).collect();
                    info!("{}: {}", self.settings.meter_name, values.join(", "));
                }
                Ok(CycleOutcome::NoData(reason)) => {
                    warn!("{}: {}", self.settings.meter_name, reason);
                }
                Err(e) => {
                    error!("{}: poll cycle failed: {}", self.settings.meter_name, e);
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
        }

        self.state = LoopState::Stopping;
        info!("Stopping poll loop for {}", self.settings.meter_name);
        self.source.close();
        self.publisher.close().await;
    }
}

/// Cancels `token` on Ctrl-C or SIGTERM.
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    warn!("Unable to listen for SIGTERM: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        info!("Shutdown requested");
        token.cancel();
    });
}
