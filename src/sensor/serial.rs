//! Sensor board reached over a serial link.
//!
//! The board firmware answers two commands:
//!
//! | Command           | Reply                                         |
//! |-------------------|-----------------------------------------------|
//! | `A<channel>`      | one decimal 10-bit code, e.g. `512`           |
//! | `I<addr> <len>`   | up to `len` decimal bytes separated by spaces |
//!
//! The address is written in hex (`I27 4`). A bus transaction that got no
//! answer from the chip comes back short or empty; that is passed through
//! unchanged so the decoder can substitute the sentinel.

use async_trait::async_trait;
use tracing::trace;

use super::SensorTransport;
use crate::adapters::SerialLink;
use crate::error::{AppResult, DaqError};

/// [`SensorTransport`] speaking the board's text protocol.
pub struct SerialSensor<L: SerialLink> {
    link: L,
}

impl<L: SerialLink> SerialSensor<L> {
    /// Wrap an already connected link.
    pub fn new(link: L) -> Self {
        Self { link }
    }

    /// Give the link back.
    pub fn into_inner(self) -> L {
        self.link
    }
}

fn parse_code(reply: &str) -> AppResult<u16> {
    let code: u16 = reply
        .trim()
        .parse()
        .map_err(|_| DaqError::Instrument(format!("invalid analog reply '{}'", reply.trim())))?;
    if code > 1023 {
        return Err(DaqError::Instrument(format!(
            "analog code {} outside 10-bit range",
            code
        )));
    }
    Ok(code)
}

fn parse_bytes(reply: &str) -> AppResult<Vec<u8>> {
    reply
        .split_whitespace()
        .map(|token| {
            token
                .parse::<u8>()
                .map_err(|_| DaqError::Instrument(format!("invalid byte '{}' in reply", token)))
        })
        .collect()
}

#[async_trait]
impl<L: SerialLink> SensorTransport for SerialSensor<L> {
    async fn read_analog(&mut self, channel: usize) -> AppResult<u16> {
        let reply = self.link.query(&format!("A{}", channel)).await?;
        let code = parse_code(&reply)?;
        trace!(channel, code, "analog read");
        Ok(code)
    }

    async fn transaction(&mut self, address: u8, len: usize) -> AppResult<Vec<u8>> {
        let reply = self.link.query(&format!("I{:02x} {}", address, len)).await?;
        parse_bytes(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ScriptedLink;

    #[tokio::test]
    async fn test_analog_and_transaction_commands() {
        let link = ScriptedLink::new(|cmd| {
            Ok(match cmd {
                "A0" => "512".to_string(),
                "A1" => " 17 ".to_string(),
                "I27 4" => "31 64 102 96".to_string(),
                _ => String::new(),
            })
        });
        let transcript = link.transcript();
        let mut sensor = SerialSensor::new(link);

        assert_eq!(sensor.read_analog(0).await.unwrap(), 512);
        assert_eq!(sensor.read_analog(1).await.unwrap(), 17);
        assert_eq!(sensor.transaction(0x27, 4).await.unwrap(), vec![31, 64, 102, 96]);
        assert_eq!(transcript.lock().as_slice(), ["A0", "A1", "I27 4"]);
    }

    #[tokio::test]
    async fn test_short_transaction_is_passed_through() {
        let link = ScriptedLink::new(|_| Ok("31 64".to_string()));
        let mut sensor = SerialSensor::new(link);
        assert_eq!(sensor.transaction(0x27, 4).await.unwrap(), vec![31, 64]);
    }

    #[tokio::test]
    async fn test_out_of_range_code_is_error() {
        let link = ScriptedLink::new(|_| Ok("4000".to_string()));
        let mut sensor = SerialSensor::new(link);
        assert!(matches!(
            sensor.read_analog(0).await,
            Err(DaqError::Instrument(_))
        ));
    }
}
