//! Conversion of raw sensor data into engineering units.
//!
//! # Pressure
//!
//! Each analog code is normalised to a voltage (`code / 1023 * Vref`), the
//! voltages of one window are averaged with an unweighted running mean, and
//! the mean goes through the transducer's linear transfer function:
//!
//! ```text
//! P [Pa] = 1000 * (V / Vref - offset) / slope
//! ```
//!
//! The window holds `smoothing + 1` codes per channel; `smoothing` is a
//! configuration value.
//!
//! # Humidity and temperature
//!
//! The 4-byte transaction carries two 14-bit fields:
//!
//! ```text
//! humidity_raw    = ((b1 << 8) | b2) & 0x3FFF          (2 status bits dropped)
//! temperature_raw = ((b3 << 6) | (b4 >> 2)) & 0x3FFF
//! humidity [%]    = 100 * humidity_raw / (2^14 - 1)
//! temperature [C] = 165 * temperature_raw / (2^14 - 1) - 40
//! ```
//!
//! When the transaction did not return exactly four bytes every word is set
//! to [`SENTINEL_WORD`]. Pushed through the formulas above that always gives
//! 0 % and -40 °C, and the sample carries `sentinel = true` so nobody has to
//! guess from the values.

use serde::{Deserialize, Serialize};

use super::{DigitalTransaction, PhysicalSample, RawSample};

/// Full-scale code of the 10-bit ADC.
pub const ADC_FULL_SCALE: f64 = 1023.0;

/// Word substituted for every byte of a missing transaction.
pub const SENTINEL_WORD: u32 = 65_536;

const FIELD_MASK: u32 = 0x3FFF;
const FIELD_MAX: f64 = 16_383.0;

/// Offset of the MPX50x0 transfer function (fraction of supply).
pub const MPX_OFFSET: f64 = 0.04;

/// Differential pressure transducer fitted on the board.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PressureSensorKind {
    /// 0-10 kPa part (`Vout/Vs = 0.09 * P[kPa] + 0.04`)
    #[default]
    #[serde(rename = "mpx5010")]
    Mpx5010,
    /// 0-100 kPa part (`Vout/Vs = 0.009 * P[kPa] + 0.04`)
    #[serde(rename = "mpx5100")]
    Mpx5100,
}

impl PressureSensorKind {
    /// Sensitivity of the part, in fraction of supply per kPa.
    pub fn slope(self) -> f64 {
        match self {
            PressureSensorKind::Mpx5010 => 0.09,
            PressureSensorKind::Mpx5100 => 0.009,
        }
    }
}

/// Linear voltage-to-pressure transfer function.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PressureTransfer {
    /// Full-scale (supply) voltage
    pub vref: f64,
    /// Output at zero pressure, as a fraction of `vref`
    pub offset: f64,
    /// Sensitivity, fraction of `vref` per kPa
    pub slope: f64,
}

impl PressureTransfer {
    /// Transfer function of a known transducer powered at `vref`.
    pub fn for_sensor(kind: PressureSensorKind, vref: f64) -> Self {
        Self {
            vref,
            offset: MPX_OFFSET,
            slope: kind.slope(),
        }
    }

    /// Convert a voltage to pressure in Pa.
    pub fn pressure_pa(&self, volts: f64) -> f64 {
        1000.0 * (volts / self.vref - self.offset) / self.slope
    }
}

/// Normalise an ADC code to a voltage.
pub fn code_to_volts(code: u16, vref: f64) -> f64 {
    f64::from(code) / ADC_FULL_SCALE * vref
}

/// Unweighted running mean of the voltages of a window of codes.
///
/// Returns `None` for an empty window. A window of identical codes returns
/// exactly the voltage of that code.
pub fn mean_voltage(codes: &[u16], vref: f64) -> Option<f64> {
    if codes.is_empty() {
        return None;
    }
    let mut mean = 0.0;
    for (k, &code) in codes.iter().enumerate() {
        let volts = code_to_volts(code, vref);
        mean += (volts - mean) / (k + 1) as f64;
    }
    Some(mean)
}

/// Humidity and temperature decoded from one transaction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HumidityTemperature {
    /// Relative humidity (%)
    pub humidity: f64,
    /// Temperature (°C)
    pub temperature: f64,
    /// Values come from the sentinel substitution
    pub sentinel: bool,
}

/// Apply the bit layout and scaling to four transaction words.
fn decode_words(words: [u32; 4]) -> (f64, f64) {
    let [b1, b2, b3, b4] = words;
    let humidity_raw = ((b1 << 8) | b2) & FIELD_MASK;
    let temperature_raw = ((b3 << 6) | (b4 >> 2)) & FIELD_MASK;
    let humidity = 100.0 * f64::from(humidity_raw) / FIELD_MAX;
    let temperature = 165.0 * f64::from(temperature_raw) / FIELD_MAX - 40.0;
    (humidity, temperature)
}

/// Decode the humidity/temperature transaction.
pub fn decode_humidity_temperature(transaction: &DigitalTransaction) -> HumidityTemperature {
    let (words, sentinel) = match *transaction {
        DigitalTransaction::Bytes(bytes) => (bytes.map(u32::from), false),
        DigitalTransaction::Missing => ([SENTINEL_WORD; 4], true),
    };
    let (humidity, temperature) = decode_words(words);
    HumidityTemperature {
        humidity,
        temperature,
        sentinel,
    }
}

/// Turns [`RawSample`]s into [`PhysicalSample`]s.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleDecoder {
    transfer: PressureTransfer,
    smoothing: usize,
}

impl SampleDecoder {
    /// Decoder for `kind` transducers powered at `vref`, averaging
    /// `smoothing + 1` codes per channel and tick.
    pub fn new(kind: PressureSensorKind, vref: f64, smoothing: usize) -> Self {
        Self {
            transfer: PressureTransfer::for_sensor(kind, vref),
            smoothing,
        }
    }

    /// Number of analog codes gathered per channel and tick.
    pub fn window(&self) -> usize {
        self.smoothing + 1
    }

    /// The transfer function in use.
    pub fn transfer(&self) -> &PressureTransfer {
        &self.transfer
    }

    /// Pressure in Pa for one window of codes; NaN for an empty window.
    pub fn decode_pressure(&self, codes: &[u16]) -> f64 {
        mean_voltage(codes, self.transfer.vref)
            .map(|volts| self.transfer.pressure_pa(volts))
            .unwrap_or(f64::NAN)
    }

    /// Decode one tick.
    pub fn decode(&self, raw: &RawSample) -> PhysicalSample {
        let pressures = raw
            .analog
            .iter()
            .map(|codes| self.decode_pressure(codes))
            .collect();
        let ht = decode_humidity_temperature(&raw.digital);
        PhysicalSample {
            timestamp: raw.timestamp,
            pressures,
            humidity: ht.humidity,
            temperature: ht.temperature,
            sentinel: ht.sentinel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_sentinel_decodes_to_marker_values() {
        let ht = decode_humidity_temperature(&DigitalTransaction::Missing);
        assert_eq!(ht.humidity, 0.0);
        assert_eq!(ht.temperature, -40.0);
        assert!(ht.sentinel);
    }

    #[test]
    fn test_plausible_low_reading_is_not_sentinel() {
        // All-zero bytes decode to the same values as the sentinel...
        let ht = decode_humidity_temperature(&DigitalTransaction::Bytes([0, 0, 0, 0]));
        assert_eq!(ht.humidity, 0.0);
        assert_eq!(ht.temperature, -40.0);
        // ...but are a real reading.
        assert!(!ht.sentinel);
    }

    #[test]
    fn test_status_bits_are_masked() {
        // Status bits set, humidity field all ones
        let ht = decode_humidity_temperature(&DigitalTransaction::Bytes([0xFF, 0xFF, 0xFF, 0xFC]));
        assert_eq!(ht.humidity, 100.0);
        assert_eq!(ht.temperature, 125.0);
    }

    #[test]
    fn test_known_transaction() {
        // humidity_raw = 0x1F40 = 8000, temperature_raw = (0x66 << 6) | (0x60 >> 2) = 6552
        let ht = decode_humidity_temperature(&DigitalTransaction::Bytes([0x1F, 0x40, 0x66, 0x60]));
        assert!(approx(ht.humidity, 100.0 * 8000.0 / 16383.0));
        assert!(approx(ht.temperature, 165.0 * 6552.0 / 16383.0 - 40.0));
        assert!(!ht.sentinel);
    }

    #[test]
    fn test_pressure_transfer_function() {
        let transfer = PressureTransfer::for_sensor(PressureSensorKind::Mpx5010, 5.0);
        // Zero-pressure output sits at the offset
        assert!(approx(transfer.pressure_pa(0.04 * 5.0), 0.0));
        // 0.49 of supply is 5 kPa on the 5010
        assert!(approx(transfer.pressure_pa(0.49 * 5.0), 5000.0));

        let transfer = PressureTransfer::for_sensor(PressureSensorKind::Mpx5100, 5.0);
        assert!(approx(transfer.pressure_pa(0.49 * 5.0), 50_000.0));
    }

    #[test]
    fn test_mean_voltage_empty_window() {
        assert_eq!(mean_voltage(&[], 5.0), None);
        let decoder = SampleDecoder::new(PressureSensorKind::Mpx5010, 5.0, 3);
        assert!(decoder.decode_pressure(&[]).is_nan());
    }

    #[test]
    fn test_mean_voltage_of_mixed_window() {
        let mean = mean_voltage(&[0, 1023], 5.0).expect("non-empty");
        assert!(approx(mean, 2.5));
    }

    #[test]
    fn test_decode_full_sample() {
        let decoder = SampleDecoder::new(PressureSensorKind::Mpx5010, 5.0, 4);
        assert_eq!(decoder.window(), 5);
        let raw = RawSample {
            timestamp: 3.25,
            analog: vec![vec![500; 5], vec![41; 5]],
            digital: DigitalTransaction::Missing,
        };
        let sample = decoder.decode(&raw);
        assert_eq!(sample.timestamp, 3.25);
        assert_eq!(sample.pressures.len(), 2);
        assert!(sample.sentinel);
        assert_eq!(sample.humidity, 0.0);
        assert_eq!(sample.temperature, -40.0);
        assert_eq!(sample.pressures[0], decoder.decode_pressure(&[500]));
    }

    proptest! {
        #[test]
        fn prop_decoded_range(bytes in any::<[u8; 4]>()) {
            let ht = decode_humidity_temperature(&DigitalTransaction::Bytes(bytes));
            prop_assert!((0.0..=100.0).contains(&ht.humidity));
            prop_assert!((-40.0..=125.0).contains(&ht.temperature));
            prop_assert!(!ht.sentinel);
        }

        #[test]
        fn prop_constant_window_equals_single_sample(
            code in 0u16..=1023,
            smoothing in 0usize..64,
            vref in 3.0f64..5.5,
        ) {
            let decoder = SampleDecoder::new(PressureSensorKind::Mpx5010, vref, smoothing);
            let window = vec![code; decoder.window()];
            prop_assert_eq!(decoder.decode_pressure(&window), decoder.decode_pressure(&[code]));
        }
    }
}
