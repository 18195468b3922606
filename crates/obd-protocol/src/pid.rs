//! OBD-II PID Definitions and Decoding
//!
//! Defines the Mode 01 Parameter IDs (PIDs) the engine knows how to request and
//! their decoding formulas. This table is the decoder registry: a response-type
//! tag resolves to a [`Pid`], and the [`Pid`] knows how to turn data bytes into
//! a value.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of lambda probe positions addressable through Mode 01
pub const LAMBDA_PROBE_COUNT: u8 = 8;

/// Request list used when the adapter did not report its supported PIDs
pub const DEFAULT_REQUEST_PIDS: [Pid; 7] = [
    Pid::Speed,
    Pid::Maf,
    Pid::Rpm,
    Pid::IntakeMap,
    Pid::IntakeAirTemp,
    Pid::EngineLoad,
    Pid::Throttle,
];

/// Mode 01 PIDs known to the decoder registry
///
/// Variants are declared in ascending PID order so the derived ordering matches
/// the numeric order of the codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Pid {
    /// Fuel system status (0x03)
    FuelSystemStatus,
    /// Calculated engine load (0x04)
    EngineLoad,
    /// Engine coolant temperature (0x05)
    CoolantTemp,
    /// Short-term fuel trim bank 1 (0x06)
    ShortFuelTrim,
    /// Long-term fuel trim bank 1 (0x07)
    LongFuelTrim,
    /// Fuel pressure (0x0A)
    FuelPressure,
    /// Intake manifold absolute pressure (0x0B)
    IntakeMap,
    /// Engine RPM (0x0C)
    Rpm,
    /// Vehicle speed (0x0D)
    Speed,
    /// Intake air temperature (0x0F)
    IntakeAirTemp,
    /// Mass air flow rate (0x10)
    Maf,
    /// Throttle position (0x11)
    Throttle,
    /// Wide-band lambda probe, equivalence ratio and voltage (0x24..=0x2B)
    LambdaVoltage(u8),
    /// Wide-band lambda probe, equivalence ratio and current (0x34..=0x3B)
    LambdaCurrent(u8),
}

impl Pid {
    /// Voltage reading of lambda probe `probe` (1-based)
    pub fn lambda_voltage(probe: u8) -> Option<Pid> {
        (1..=LAMBDA_PROBE_COUNT)
            .contains(&probe)
            .then_some(Pid::LambdaVoltage(probe))
    }

    /// Current reading of lambda probe `probe` (1-based)
    pub fn lambda_current(probe: u8) -> Option<Pid> {
        (1..=LAMBDA_PROBE_COUNT)
            .contains(&probe)
            .then_some(Pid::LambdaCurrent(probe))
    }

    /// Numeric PID code
    pub fn code(&self) -> u8 {
        match self {
            Pid::FuelSystemStatus => 0x03,
            Pid::EngineLoad => 0x04,
            Pid::CoolantTemp => 0x05,
            Pid::ShortFuelTrim => 0x06,
            Pid::LongFuelTrim => 0x07,
            Pid::FuelPressure => 0x0A,
            Pid::IntakeMap => 0x0B,
            Pid::Rpm => 0x0C,
            Pid::Speed => 0x0D,
            Pid::IntakeAirTemp => 0x0F,
            Pid::Maf => 0x10,
            Pid::Throttle => 0x11,
            Pid::LambdaVoltage(probe) => 0x23 + probe,
            Pid::LambdaCurrent(probe) => 0x33 + probe,
        }
    }

    /// Look up a PID by its numeric code
    pub fn from_code(code: u8) -> Option<Pid> {
        let pid = match code {
            0x03 => Pid::FuelSystemStatus,
            0x04 => Pid::EngineLoad,
            0x05 => Pid::CoolantTemp,
            0x06 => Pid::ShortFuelTrim,
            0x07 => Pid::LongFuelTrim,
            0x0A => Pid::FuelPressure,
            0x0B => Pid::IntakeMap,
            0x0C => Pid::Rpm,
            0x0D => Pid::Speed,
            0x0F => Pid::IntakeAirTemp,
            0x10 => Pid::Maf,
            0x11 => Pid::Throttle,
            0x24..=0x2B => Pid::LambdaVoltage(code - 0x23),
            0x34..=0x3B => Pid::LambdaCurrent(code - 0x33),
            _ => return None,
        };
        Some(pid)
    }

    /// Response-type tag: the code as two upper-case hex digits
    pub fn tag(&self) -> String {
        format!("{:02X}", self.code())
    }

    /// Look up a PID by its response-type tag (case-insensitive)
    pub fn from_tag(tag: &str) -> Option<Pid> {
        if tag.len() != 2 {
            return None;
        }
        u8::from_str_radix(tag, 16).ok().and_then(Pid::from_code)
    }

    /// Human readable command name, also the blacklist identity
    pub fn name(&self) -> String {
        match self {
            Pid::FuelSystemStatus => "Fuel System Status".to_string(),
            Pid::EngineLoad => "Engine Load".to_string(),
            Pid::CoolantTemp => "Engine Coolant Temperature".to_string(),
            Pid::ShortFuelTrim => "Short Term Fuel Trim Bank 1".to_string(),
            Pid::LongFuelTrim => "Long Term Fuel Trim Bank 1".to_string(),
            Pid::FuelPressure => "Fuel Pressure".to_string(),
            Pid::IntakeMap => "Intake Manifold Pressure".to_string(),
            Pid::Rpm => "Engine RPM".to_string(),
            Pid::Speed => "Vehicle Speed".to_string(),
            Pid::IntakeAirTemp => "Air Intake Temperature".to_string(),
            Pid::Maf => "Mass Air Flow".to_string(),
            Pid::Throttle => "Throttle Position".to_string(),
            Pid::LambdaVoltage(_) | Pid::LambdaCurrent(_) => {
                format!("O2 Lambda Probe {}", self.tag())
            }
        }
    }

    /// Get the number of data bytes a response must carry for this PID
    pub fn response_bytes(&self) -> usize {
        match self {
            Pid::Rpm | Pid::Maf => 2,
            Pid::LambdaVoltage(_) | Pid::LambdaCurrent(_) => 4,
            _ => 1,
        }
    }

    /// Lambda probe position (1-based) for lambda PIDs
    pub fn lambda_probe(&self) -> Option<u8> {
        match self {
            Pid::LambdaVoltage(probe) | Pid::LambdaCurrent(probe) => Some(*probe),
            _ => None,
        }
    }

    /// Whether this PID is one of the lambda probe readings
    pub fn is_lambda(&self) -> bool {
        self.lambda_probe().is_some()
    }

    /// Decode data bytes (status and tag already stripped) into a scalar value
    ///
    /// Returns `None` when the buffer is too short or the PID has no scalar
    /// formula (fuel system status, lambda probes).
    pub fn decode_value(&self, data: &[u8]) -> Option<f64> {
        if data.len() < self.response_bytes() {
            return None;
        }
        let a = data[0] as f64;
        let value = match self {
            // ((A*256)+B)/4
            Pid::Rpm => (a * 256.0 + data[1] as f64) / 4.0,
            // ((A*256)+B)/100 (g/s)
            Pid::Maf => (a * 256.0 + data[1] as f64) / 100.0,
            // A (km/h)
            Pid::Speed => a,
            // A (kPa)
            Pid::IntakeMap => a,
            // A - 40 (°C)
            Pid::IntakeAirTemp | Pid::CoolantTemp => a - 40.0,
            // A * 100 / 255 (%)
            Pid::EngineLoad | Pid::Throttle => a * 100.0 / 255.0,
            // 3 * A (kPa)
            Pid::FuelPressure => a * 3.0,
            // (A - 128) * 100 / 128 (%)
            Pid::ShortFuelTrim | Pid::LongFuelTrim => (a - 128.0) * 100.0 / 128.0,
            Pid::FuelSystemStatus | Pid::LambdaVoltage(_) | Pid::LambdaCurrent(_) => {
                return None
            }
        };
        Some(value)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpm_decode() {
        // 1A 2B => ((0x1A * 256) + 0x2B) / 4 = (26*256 + 43) / 4 = 6699/4 = 1674.75
        let value = Pid::Rpm.decode_value(&[0x1A, 0x2B]).unwrap();
        assert!((value - 1674.75).abs() < 0.01);
    }

    #[test]
    fn test_coolant_temp_decode() {
        // 0x73 = 115, so temp = 115 - 40 = 75°C
        let value = Pid::CoolantTemp.decode_value(&[0x73]).unwrap();
        assert!((value - 75.0).abs() < 0.01);
    }

    #[test]
    fn test_speed_decode() {
        // 0x55 = 85 km/h
        let value = Pid::Speed.decode_value(&[0x55]).unwrap();
        assert!((value - 85.0).abs() < 0.01);
    }

    #[test]
    fn test_fuel_trim_decode() {
        // 0x80 = 128, so trim = (128-128)*100/128 = 0%
        let value = Pid::ShortFuelTrim.decode_value(&[0x80]).unwrap();
        assert!((value - 0.0).abs() < 0.01);

        // 0x90 = 144, so trim = (144-128)*100/128 = 12.5%
        let value = Pid::LongFuelTrim.decode_value(&[0x90]).unwrap();
        assert!((value - 12.5).abs() < 0.01);
    }

    #[test]
    fn test_maf_and_pressure_decode() {
        // 0x01F4 = 500 => 5 g/s
        let value = Pid::Maf.decode_value(&[0x01, 0xF4]).unwrap();
        assert!((value - 5.0).abs() < 0.01);

        let value = Pid::FuelPressure.decode_value(&[0x64]).unwrap();
        assert!((value - 300.0).abs() < 0.01);
    }

    #[test]
    fn test_short_buffer_has_no_value() {
        assert_eq!(Pid::Rpm.decode_value(&[0x1A]), None);
        assert_eq!(Pid::Speed.decode_value(&[]), None);
        assert_eq!(Pid::FuelSystemStatus.decode_value(&[0x02, 0x00]), None);
    }

    #[test]
    fn test_tag_lookup() {
        assert_eq!(Pid::from_tag("0C"), Some(Pid::Rpm));
        assert_eq!(Pid::from_tag("0c"), Some(Pid::Rpm));
        assert_eq!(Pid::from_tag("24"), Some(Pid::LambdaVoltage(1)));
        assert_eq!(Pid::from_tag("3B"), Some(Pid::LambdaCurrent(8)));
        assert_eq!(Pid::from_tag("2C"), None);
        assert_eq!(Pid::from_tag("0"), None);
        assert_eq!(Pid::from_tag("ZZ"), None);
    }

    #[test]
    fn test_lambda_positions() {
        assert_eq!(Pid::lambda_voltage(0), None);
        assert_eq!(Pid::lambda_current(9), None);
        let pid = Pid::lambda_voltage(3).unwrap();
        assert_eq!(pid.code(), 0x26);
        assert_eq!(pid.name(), "O2 Lambda Probe 26");
        assert_eq!(pid.lambda_probe(), Some(3));
    }

    #[test]
    fn test_code_round_trip_for_every_known_pid() {
        for code in 0u8..=0xFF {
            if let Some(pid) = Pid::from_code(code) {
                assert_eq!(pid.code(), code);
                assert_eq!(Pid::from_tag(&pid.tag()), Some(pid));
            }
        }
    }

    #[test]
    fn test_ordering_follows_codes() {
        assert!(Pid::FuelSystemStatus < Pid::Rpm);
        assert!(Pid::Throttle < Pid::LambdaVoltage(1));
        assert!(Pid::LambdaVoltage(8) < Pid::LambdaCurrent(1));
    }
}
