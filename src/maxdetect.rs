//! MaxDetect (RHT03 / DHT22) temperature and humidity sensors on the TTL lines.
//!
//! The sensor answers a start pulse with 40 bits: humidity and temperature as 16-bit
//! tenths, then a checksum byte. The exchange itself is done by
//! [`Hardware::max_detect_read()`](crate::Hardware::max_detect_read); this module checks
//! and decodes what came back.

use log::debug;

/// Bytes clocked out by the sensor in one exchange, checksum last.
pub type MaxDetectFrame = [u8; 5];

/// Highest plausible relative humidity, in tenths of a percent.
const HUMIDITY_MAX: i32 = 999;

/// Plausible temperature range, in tenths of a degree.
const TEMPERATURE_RANGE: std::ops::RangeInclusive<i32> = -400..=800;

/// Decode a frame into `(temperature °C, relative humidity %)`.
///
/// Returns `None` if the checksum is wrong or either value is out of range; the checksum
/// can't catch two flipped bits, which a bit-banged read does occasionally produce.
pub fn decode(frame: &MaxDetectFrame) -> Option<(f32, f32)> {
    let sum = frame[..4].iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
    if sum != frame[4] {
        debug!("MaxDetect checksum {:#04x} != {:#04x}", sum, frame[4]);
        return None;
    }

    let humidity = i32::from(u16::from_be_bytes([frame[0], frame[1]]));
    let raw = u16::from_be_bytes([frame[2], frame[3]]);
    // Sign and magnitude, not two's complement.
    let temperature = if raw & 0x8000 != 0 {
        -i32::from(raw & 0x7FFF)
    } else {
        i32::from(raw)
    };

    if humidity > HUMIDITY_MAX || !TEMPERATURE_RANGE.contains(&temperature) {
        debug!("MaxDetect reading out of range: {temperature} / {humidity}");
        return None;
    }
    Some((temperature as f32 / 10.0, humidity as f32 / 10.0))
}

#[cfg(test)]
mod test {
    use super::*;

    fn frame(humidity: u16, temperature: u16) -> MaxDetectFrame {
        let [h0, h1] = humidity.to_be_bytes();
        let [t0, t1] = temperature.to_be_bytes();
        let sum = h0.wrapping_add(h1).wrapping_add(t0).wrapping_add(t1);
        [h0, h1, t0, t1, sum]
    }

    fn assert_close(actual: f32, expected: f32) {
        assert!((actual - expected).abs() < 0.001, "Expected {expected}, got {actual}");
    }

    #[test]
    fn decodes_positive_reading() {
        let (temperature, humidity) = decode(&frame(652, 351)).expect("Bad reading");
        assert_close(temperature, 35.1);
        assert_close(humidity, 65.2);
    }

    #[test]
    fn decodes_negative_temperature() {
        let (temperature, _) = decode(&frame(400, 0x8000 | 101)).expect("Bad reading");
        assert_close(temperature, -10.1);
    }

    #[test]
    fn checksum_wraps() {
        // 0x03 + 0xE7 + 0x03 + 0x20 = 0x10D
        let reading = [0x03, 0xE7, 0x03, 0x20, 0x0D];
        let (temperature, humidity) = decode(&reading).expect("Bad reading");
        assert_close(temperature, 80.0);
        assert_close(humidity, 99.9);
    }

    #[test]
    fn bad_checksum_rejected() {
        let mut reading = frame(500, 200);
        reading[4] ^= 0x01;
        assert_eq!(decode(&reading), None);
    }

    #[test]
    fn implausible_readings_rejected() {
        assert_eq!(decode(&frame(1000, 200)), None);
        assert_eq!(decode(&frame(500, 801)), None);
        assert_eq!(decode(&frame(500, 0x8000 | 401)), None);
        assert!(decode(&frame(999, 800)).is_some());
        assert!(decode(&frame(0, 0x8000 | 400)).is_some());
    }
}
