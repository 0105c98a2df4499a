use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;

use super::SerialLink;
use crate::error::{AppResult, DaqError};

/// Character framing of the serial line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SerialFraming {
    /// 8 data bits, no parity, 1 stop bit
    #[default]
    EightNoneOne,
    /// 7 data bits, odd parity, 2 stop bits (PhD Ultra pumps)
    SevenOddTwo,
}

/// How the adapter decides a reply is complete.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ResponseEnd {
    /// Stop at the first occurrence of this byte
    Delimiter(u8),
    /// Stop once the line has been quiet for this long after the first byte
    Quiet(Duration),
}

/// Serial adapter for RS-232/USB-CDC communication
///
/// This adapter wraps the serialport crate and provides async I/O
/// using Tokio's blocking task executor for synchronous serial operations.
#[derive(Clone)]
pub struct SerialAdapter {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Baud rate (e.g., 19200, 115200)
    baud_rate: u32,

    framing: SerialFraming,

    /// Overall reply timeout
    timeout: Duration,

    /// Line terminator for commands (e.g., "\r\n")
    line_terminator: String,

    response_end: ResponseEnd,

    /// The actual serial port (behind Arc<Mutex> for async access)
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialAdapter {
    /// Create a new serial adapter with default settings
    ///
    /// # Arguments
    /// * `port_name` - Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    /// * `baud_rate` - Communication speed (e.g., 19200, 115200)
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            framing: SerialFraming::default(),
            timeout: Duration::from_secs(2),
            line_terminator: "\r\n".to_string(),
            response_end: ResponseEnd::Delimiter(b'\n'),
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    /// Set the character framing.
    pub fn with_framing(mut self, framing: SerialFraming) -> Self {
        self.framing = framing;
        self
    }

    /// Set the overall reply timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set how replies are terminated.
    pub fn with_response_end(mut self, response_end: ResponseEnd) -> Self {
        self.response_end = response_end;
        self
    }

    /// Whether [`connect`](Self::connect) succeeded.
    pub fn is_connected(&self) -> bool {
        #[cfg(feature = "instrument_serial")]
        {
            self.port.is_some()
        }
        #[cfg(not(feature = "instrument_serial"))]
        {
            false
        }
    }

    /// Open the port.
    pub fn connect(&mut self) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let (data_bits, parity, stop_bits) = match self.framing {
                SerialFraming::EightNoneOne => (
                    serialport::DataBits::Eight,
                    serialport::Parity::None,
                    serialport::StopBits::One,
                ),
                SerialFraming::SevenOddTwo => (
                    serialport::DataBits::Seven,
                    serialport::Parity::Odd,
                    serialport::StopBits::Two,
                ),
            };
            let port = serialport::new(&self.port_name, self.baud_rate)
                .data_bits(data_bits)
                .parity(parity)
                .stop_bits(stop_bits)
                .timeout(Duration::from_millis(50)) // Internal read timeout
                .open()
                .map_err(|e| {
                    DaqError::Instrument(format!(
                        "Failed to open serial port '{}' at {} baud: {}",
                        self.port_name, self.baud_rate, e
                    ))
                })?;

            self.port = Some(Arc::new(Mutex::new(port)));
            debug!(port = %self.port_name, baud = self.baud_rate, "Serial port opened");
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(DaqError::SerialFeatureDisabled)
        }
    }

    /// Close the port.
    pub fn disconnect(&mut self) {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.take().is_some() {
                debug!(port = %self.port_name, "Serial port closed");
            }
        }
    }

    #[cfg(feature = "instrument_serial")]
    fn port(&self) -> AppResult<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port.clone().ok_or(DaqError::SerialPortNotConnected)
    }
}

#[cfg(feature = "instrument_serial")]
fn read_reply(
    port: &mut dyn SerialPort,
    response_end: ResponseEnd,
    timeout: Duration,
    port_name: &str,
) -> AppResult<String> {
    use std::io::Read;
    use std::time::Instant;

    let mut response = Vec::new();
    let mut buffer = [0u8; 64];
    let start = Instant::now();
    let mut last_byte_at: Option<Instant> = None;

    loop {
        if start.elapsed() > timeout {
            if response.is_empty() {
                return Err(DaqError::Timeout {
                    device: port_name.to_string(),
                    timeout,
                });
            }
            break;
        }

        match port.read(&mut buffer) {
            Ok(0) => return Err(DaqError::SerialUnexpectedEof),
            Ok(n) => {
                response.extend_from_slice(&buffer[..n]);
                last_byte_at = Some(Instant::now());
                if let ResponseEnd::Delimiter(delimiter) = response_end {
                    if buffer[..n].contains(&delimiter) {
                        break;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                // Port timeout is shorter than our overall timeout
                if let (ResponseEnd::Quiet(quiet), Some(at)) = (response_end, last_byte_at) {
                    if at.elapsed() >= quiet {
                        break;
                    }
                }
            }
            Err(e) => return Err(DaqError::Io(e)),
        }
    }

    Ok(String::from_utf8_lossy(&response).trim().to_string())
}

#[async_trait]
impl SerialLink for SerialAdapter {
    fn name(&self) -> &str {
        &self.port_name
    }

    async fn send(&mut self, command: &str) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port()?;
            let command_str = format!("{}{}", command, self.line_terminator);

            // Execute blocking serial I/O on dedicated thread
            tokio::task::spawn_blocking(move || -> AppResult<()> {
                use std::io::Write;

                let mut port_guard = port.blocking_lock();
                port_guard.write_all(command_str.as_bytes())?;
                port_guard.flush()?;
                Ok(())
            })
            .await
            .map_err(|_| DaqError::TaskFailed("serial write".into()))??;

            debug!(port = %self.port_name, command = command.trim(), "Sent serial command");
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = command;
            Err(DaqError::SerialFeatureDisabled)
        }
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port()?;
            let command_str = format!("{}{}", command, self.line_terminator);
            let response_end = self.response_end;
            let timeout = self.timeout;
            let port_name = self.port_name.clone();

            let response = tokio::task::spawn_blocking(move || -> AppResult<String> {
                use std::io::Write;

                let mut port_guard = port.blocking_lock();
                port_guard.clear(serialport::ClearBuffer::Input).ok();
                port_guard.write_all(command_str.as_bytes())?;
                port_guard.flush()?;
                read_reply(&mut **port_guard, response_end, timeout, &port_name)
            })
            .await
            .map_err(|_| DaqError::TaskFailed("serial query".into()))??;

            debug!(port = %self.port_name, command = command.trim(), %response, "Serial query");
            Ok(response)
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = command;
            Err(DaqError::SerialFeatureDisabled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_adapter_creation() {
        let adapter = SerialAdapter::new("/dev/ttyUSB0", 19200).with_framing(SerialFraming::SevenOddTwo);
        assert_eq!(adapter.name(), "/dev/ttyUSB0");
        assert_eq!(adapter.baud_rate, 19200);
        assert_eq!(adapter.framing, SerialFraming::SevenOddTwo);
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn test_query_before_connect_fails() {
        let mut adapter = SerialAdapter::new("COM3", 115200);
        let err = adapter.query("A0").await.expect_err("not connected");
        #[cfg(feature = "instrument_serial")]
        assert!(matches!(err, DaqError::SerialPortNotConnected));
        #[cfg(not(feature = "instrument_serial"))]
        assert!(matches!(err, DaqError::SerialFeatureDisabled));
    }
}
