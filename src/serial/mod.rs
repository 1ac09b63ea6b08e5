use crate::config::SerialConfig;
use log::{debug, info};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};

#[derive(Error, Debug)]
pub enum SerialError {
    #[error("unable to open serial port {port}: {source}")]
    Open { port: String, source: tokio_serial::Error },
    #[error("unable to discard serial input: {0}")]
    Flush(tokio_serial::Error),
    #[error("serial read failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("serial port is closed")]
    Closed,
}

/// Where the poll loop gets its bytes from.
#[allow(async_fn_in_trait)]
pub trait MeterSource {
    /// Drops bytes that arrived since the last read.
    fn discard_input(&mut self) -> Result<(), SerialError>;

    /// Reads up to `max_bytes`, returning early when `timeout` has passed.
    /// An empty result means the meter sent nothing.
    async fn read_chunk(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>, SerialError>;

    fn close(&mut self);
}

/// IR reading head on a serial port, 8N1.
pub struct SerialMeter {
    path: String,
    port: Option<SerialStream>,
}

impl SerialMeter {
    pub fn open(config: &SerialConfig) -> Result<Self, SerialError> {
        debug!("Opening serial port {} (baudrate={})", config.port, config.baud);

        let port = tokio_serial::new(&config.port, config.baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(Duration::from_secs(config.read_timeout))
            .open_native_async()
            .map_err(|source| SerialError::Open { port: config.port.clone(), source })?;

        info!("Opened serial port {} @ {}", config.port, config.baud);
        Ok(SerialMeter { path: config.port.clone(), port: Some(port) })
    }
}

impl MeterSource for SerialMeter {
    fn discard_input(&mut self) -> Result<(), SerialError> {
        let port = self.port.as_mut().ok_or(SerialError::Closed)?;
        port.clear(ClearBuffer::Input).map_err(SerialError::Flush)
    }

    async fn read_chunk(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>, SerialError> {
        let port = self.port.as_mut().ok_or(SerialError::Closed)?;
        read_with_deadline(port, max_bytes, timeout).await
    }

    fn close(&mut self) {
        // Dropping the stream closes the port
        if self.port.take().is_some() {
            info!("Closed serial port {}", self.path);
        }
    }
}

/// Collects bytes until `max_bytes` are read, the reader hits EOF or the
/// deadline for the whole read passes. Whatever arrived so far is returned.
pub async fn read_with_deadline<R>(reader: &mut R, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>, SerialError>
where
    R: AsyncRead + Unpin,
{
    let deadline = Instant::now() + timeout;
    let mut buffer = vec![0u8; max_bytes];
    let mut filled = 0;

    while filled < max_bytes {
        match tokio::time::timeout_at(deadline, reader.read(&mut buffer[filled..])).await {
            Err(_) => break,
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => break,
            Ok(Err(e)) => return Err(SerialError::Read(e)),
        }
    }

    buffer.truncate(filled);
    debug!("Read {} bytes from serial port", filled);
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_read_stops_at_budget() {
        let (mut reader, mut writer) = tokio::io::duplex(64);
        writer.write_all(&[1, 2, 3, 4, 5, 6]).await.unwrap();

        let chunk = read_with_deadline(&mut reader, 4, Duration::from_secs(5)).await.unwrap();
        assert_eq!(chunk, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_read_returns_partial_data_on_timeout() {
        let (mut reader, mut writer) = tokio::io::duplex(64);
        writer.write_all(&[9, 8, 7]).await.unwrap();

        let chunk = read_with_deadline(&mut reader, 3000, Duration::from_millis(50)).await.unwrap();
        assert_eq!(chunk, vec![9, 8, 7]);
    }

    #[tokio::test]
    async fn test_silent_line_yields_empty_chunk() {
        let (mut reader, _writer) = tokio::io::duplex(64);
        let chunk = read_with_deadline(&mut reader, 3000, Duration::from_millis(20)).await.unwrap();
        assert!(chunk.is_empty());
    }

    #[tokio::test]
    async fn test_closed_writer_ends_read() {
        let (mut reader, mut writer) = tokio::io::duplex(64);
        writer.write_all(&[1, 2]).await.unwrap();
        drop(writer);

        let chunk = read_with_deadline(&mut reader, 3000, Duration::from_secs(5)).await.unwrap();
        assert_eq!(chunk, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let config = SerialConfig { port: "/dev/does-not-exist-sml2mqtt".to_string(), ..SerialConfig::default() };
        assert!(matches!(SerialMeter::open(&config), Err(SerialError::Open { .. })));
    }
}
