//! Pressure / humidity / temperature sensor board.
//!
//! The board exposes two kinds of reads:
//!
//! - analog channels: one 10-bit code (0-1023) per read, one channel per
//!   pressure transducer;
//! - a digital transaction returning 4 bytes from the humidity/temperature
//!   chip at a fixed bus address.
//!
//! A sampling tick gathers a window of analog codes per channel plus one
//! digital transaction into a [`RawSample`], which [`decoder::SampleDecoder`]
//! turns into a [`PhysicalSample`].

pub mod decoder;
pub mod serial;

pub use decoder::{PressureSensorKind, SampleDecoder};
pub use serial::SerialSensor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;

/// Default bus address of the humidity/temperature chip.
pub const HUMIDITY_SENSOR_ADDRESS: u8 = 0x27;

/// Number of bytes in a humidity/temperature transaction.
pub const TRANSACTION_LEN: usize = 4;

/// Transport to the sensor board.
#[async_trait]
pub trait SensorTransport: Send {
    /// Read one 10-bit code from an analog channel.
    async fn read_analog(&mut self, channel: usize) -> AppResult<u16>;

    /// Request `len` bytes from the device at `address`.
    ///
    /// The board may return fewer bytes than requested when the device does
    /// not answer; callers must not assume the length.
    async fn transaction(&mut self, address: u8, len: usize) -> AppResult<Vec<u8>>;
}

/// Result of the humidity/temperature transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DigitalTransaction {
    /// Exactly four bytes were returned
    Bytes([u8; TRANSACTION_LEN]),
    /// Wrong byte count or transport failure: decoded through the sentinel
    Missing,
}

impl DigitalTransaction {
    /// Classify whatever the transport returned.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match <[u8; TRANSACTION_LEN]>::try_from(bytes) {
            Ok(bytes) => DigitalTransaction::Bytes(bytes),
            Err(_) => DigitalTransaction::Missing,
        }
    }
}

/// Raw data gathered during one sampling tick.
#[derive(Clone, Debug, PartialEq)]
pub struct RawSample {
    /// Seconds since the start of the run (monotonic clock)
    pub timestamp: f64,
    /// One window of analog codes per pressure channel
    pub analog: Vec<Vec<u16>>,
    /// Humidity/temperature transaction
    pub digital: DigitalTransaction,
}

/// Decoded sample in engineering units.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhysicalSample {
    /// Seconds since the start of the run (monotonic clock)
    pub timestamp: f64,
    /// Pressure per analog channel (Pa). NaN when a channel produced no code.
    pub pressures: Vec<f64>,
    /// Relative humidity (%)
    pub humidity: f64,
    /// Temperature (°C)
    pub temperature: f64,
    /// Humidity and temperature come from the no-data sentinel, not the chip
    pub sentinel: bool,
}

/// A quantity that can be regulated or reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MeasuredChannel {
    /// First pressure transducer
    #[default]
    Pressure1,
    /// Second pressure transducer
    Pressure2,
    /// Relative humidity
    Humidity,
    /// Temperature
    Temperature,
}

/// A single reading taken out of a [`PhysicalSample`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Reading {
    /// Value in engineering units
    pub value: f64,
    /// The value is not a real measurement (sentinel decode, missing channel)
    pub sentinel: bool,
}

impl PhysicalSample {
    /// Extract one channel.
    ///
    /// Humidity and temperature inherit the sample's sentinel flag; a pressure
    /// channel is flagged when it is missing or not finite.
    pub fn reading(&self, channel: MeasuredChannel) -> Reading {
        let pressure = |index: usize| {
            let value = self.pressures.get(index).copied().unwrap_or(f64::NAN);
            Reading {
                value,
                sentinel: !value.is_finite(),
            }
        };
        match channel {
            MeasuredChannel::Pressure1 => pressure(0),
            MeasuredChannel::Pressure2 => pressure(1),
            MeasuredChannel::Humidity => Reading {
                value: self.humidity,
                sentinel: self.sentinel,
            },
            MeasuredChannel::Temperature => Reading {
                value: self.temperature,
                sentinel: self.sentinel,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(sentinel: bool) -> PhysicalSample {
        PhysicalSample {
            timestamp: 1.0,
            pressures: vec![120.0],
            humidity: if sentinel { 0.0 } else { 45.0 },
            temperature: if sentinel { -40.0 } else { 21.5 },
            sentinel,
        }
    }

    #[test]
    fn test_transaction_length_mismatch_is_missing() {
        assert_eq!(
            DigitalTransaction::from_bytes(&[1, 2, 3, 4]),
            DigitalTransaction::Bytes([1, 2, 3, 4])
        );
        assert_eq!(DigitalTransaction::from_bytes(&[1, 2, 3]), DigitalTransaction::Missing);
        assert_eq!(DigitalTransaction::from_bytes(&[]), DigitalTransaction::Missing);
        assert_eq!(
            DigitalTransaction::from_bytes(&[1, 2, 3, 4, 5]),
            DigitalTransaction::Missing
        );
    }

    #[test]
    fn test_reading_flags() {
        let ok = sample(false);
        assert!(!ok.reading(MeasuredChannel::Humidity).sentinel);
        assert_eq!(ok.reading(MeasuredChannel::Pressure1).value, 120.0);

        // Second channel not configured
        assert!(ok.reading(MeasuredChannel::Pressure2).sentinel);

        let missing = sample(true);
        assert!(missing.reading(MeasuredChannel::Temperature).sentinel);
        // Pressure does not depend on the digital transaction
        assert!(!missing.reading(MeasuredChannel::Pressure1).sentinel);
    }
}
