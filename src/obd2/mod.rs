//! Mode 01 command registry and response decoding
//!
//! Each [ObdCommand] couples a raw request string with the SAE J1979
//! scaling formula for its response, so callers work with named commands
//! and unit tagged values instead of hex strings

mod units;

pub use units::*;

use crate::protocol::{EcuKind, EcuMessage};
use crate::{DiagError, DiagResult};

/// A sensor reading produced by one ECU
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ObdReading {
    /// ECU the reading came from
    pub ecu: EcuKind,
    /// Decoded value
    pub value: ObdValue,
}

/// One entry of the command registry: a request string plus the knowledge
/// needed to turn its response into an [ObdValue]
#[derive(Debug, Copy, Clone)]
pub struct ObdCommand {
    name: &'static str,
    desc: &'static str,
    request: &'static str,
    /// Payload bytes expected after the mode/PID echo
    response_len: u8,
    /// Restricts readings to one ECU role. `None` reads every responder
    target: Option<EcuKind>,
    /// Fast commands skip the settle delay between write and read
    fast: bool,
    decode: fn(&[u8]) -> ObdValue,
}

impl ObdCommand {
    /// Registry name, as used by [crate::Elm327Connection::query_by_name]
    pub fn name(&self) -> &str {
        self.name
    }

    /// Human readable description
    pub fn desc(&self) -> &str {
        self.desc
    }

    /// Raw request string sent to the vehicle
    pub fn request(&self) -> &str {
        self.request
    }

    /// True when the ECU answers at interactive speed
    pub fn is_fast(&self) -> bool {
        self.fast
    }

    /// Applies the command's scaling to each applicable ECU response
    pub(crate) fn decode(&self, messages: &[EcuMessage]) -> DiagResult<Vec<ObdReading>> {
        let mut readings: Vec<ObdReading> = Vec::new();
        for msg in messages {
            if let Some(target) = self.target {
                if msg.ecu() != target {
                    continue;
                }
            }
            let want = usize::from(self.response_len);
            if msg.data().len() != want {
                return Err(DiagError::InvalidResponseLength {
                    want,
                    got: msg.data().len(),
                });
            }
            readings.push(ObdReading {
                ecu: msg.ecu(),
                value: (self.decode)(msg.data()),
            });
        }
        Ok(readings)
    }
}

fn word(data: &[u8]) -> f32 {
    f32::from((u16::from(data[0]) << 8) | u16::from(data[1]))
}

/// Every mode 01 request this crate can issue by name.
///
/// Formulas follow SAE J1979. Commands are tagged fast when a warmed up ECU
/// answers them within one channel timeout; the support query is not, since
/// it can fan out to every module on the bus
pub const COMMANDS: &[ObdCommand] = &[
    ObdCommand {
        name: "Pids0120",
        desc: "Number of supported PIDs in the 01-20 range",
        request: "0100",
        response_len: 4,
        target: None,
        fast: false,
        decode: |data| {
            let count = data.iter().map(|b| b.count_ones()).sum::<u32>();
            ObdValue::new(count as f32, ObdUnit::Count)
        },
    },
    ObdCommand {
        name: "EngineLoad",
        desc: "Calculated engine load",
        request: "0104",
        response_len: 1,
        target: Some(EcuKind::Engine),
        fast: true,
        decode: |data| ObdValue::new(f32::from(data[0]) / 2.55, ObdUnit::Percent),
    },
    ObdCommand {
        name: "CoolantTemp",
        desc: "Engine coolant temperature",
        request: "0105",
        response_len: 1,
        target: Some(EcuKind::Engine),
        fast: true,
        decode: |data| ObdValue::new(f32::from(data[0]) - 40.0, ObdUnit::Celsius),
    },
    ObdCommand {
        name: "ShortFuelTrim1",
        desc: "Short term fuel trim, bank 1",
        request: "0106",
        response_len: 1,
        target: Some(EcuKind::Engine),
        fast: true,
        decode: |data| ObdValue::new(f32::from(data[0]) / 1.28 - 100.0, ObdUnit::Percent),
    },
    ObdCommand {
        name: "LongFuelTrim1",
        desc: "Long term fuel trim, bank 1",
        request: "0107",
        response_len: 1,
        target: Some(EcuKind::Engine),
        fast: true,
        decode: |data| ObdValue::new(f32::from(data[0]) / 1.28 - 100.0, ObdUnit::Percent),
    },
    ObdCommand {
        name: "FuelPressure",
        desc: "Fuel rail gauge pressure",
        request: "010A",
        response_len: 1,
        target: Some(EcuKind::Engine),
        fast: true,
        decode: |data| ObdValue::new(f32::from(data[0]) * 3.0, ObdUnit::KiloPascal),
    },
    ObdCommand {
        name: "IntakePressure",
        desc: "Intake manifold absolute pressure",
        request: "010B",
        response_len: 1,
        target: Some(EcuKind::Engine),
        fast: true,
        decode: |data| ObdValue::new(f32::from(data[0]), ObdUnit::KiloPascal),
    },
    ObdCommand {
        name: "EngineSpeed",
        desc: "Engine speed",
        request: "010C",
        response_len: 2,
        target: Some(EcuKind::Engine),
        fast: true,
        decode: |data| ObdValue::new(word(data) / 4.0, ObdUnit::Rpm),
    },
    ObdCommand {
        name: "VehicleSpeed",
        desc: "Vehicle speed",
        request: "010D",
        response_len: 1,
        target: Some(EcuKind::Engine),
        fast: true,
        decode: |data| ObdValue::new(f32::from(data[0]), ObdUnit::KilometersPerHour),
    },
    ObdCommand {
        name: "TimingAdvance",
        desc: "Timing advance before top dead centre",
        request: "010E",
        response_len: 1,
        target: Some(EcuKind::Engine),
        fast: true,
        decode: |data| ObdValue::new(f32::from(data[0]) / 2.0 - 64.0, ObdUnit::Degrees),
    },
    ObdCommand {
        name: "IntakeTemp",
        desc: "Intake air temperature",
        request: "010F",
        response_len: 1,
        target: Some(EcuKind::Engine),
        fast: true,
        decode: |data| ObdValue::new(f32::from(data[0]) - 40.0, ObdUnit::Celsius),
    },
    ObdCommand {
        name: "MassAirFlow",
        desc: "Mass air flow rate",
        request: "0110",
        response_len: 2,
        target: Some(EcuKind::Engine),
        fast: true,
        decode: |data| ObdValue::new(word(data) / 100.0, ObdUnit::GramsPerSecond),
    },
    ObdCommand {
        name: "ThrottlePosition",
        desc: "Absolute throttle position",
        request: "0111",
        response_len: 1,
        target: Some(EcuKind::Engine),
        fast: true,
        decode: |data| ObdValue::new(f32::from(data[0]) / 2.55, ObdUnit::Percent),
    },
    ObdCommand {
        name: "RunTime",
        desc: "Run time since engine start",
        request: "011F",
        response_len: 2,
        target: Some(EcuKind::Engine),
        fast: true,
        decode: |data| ObdValue::new(word(data), ObdUnit::Seconds),
    },
    ObdCommand {
        name: "FuelLevel",
        desc: "Fuel tank level",
        request: "012F",
        response_len: 1,
        target: Some(EcuKind::Engine),
        fast: true,
        decode: |data| ObdValue::new(f32::from(data[0]) / 2.55, ObdUnit::Percent),
    },
    ObdCommand {
        name: "BarometricPressure",
        desc: "Absolute barometric pressure",
        request: "0133",
        response_len: 1,
        target: Some(EcuKind::Engine),
        fast: true,
        decode: |data| ObdValue::new(f32::from(data[0]), ObdUnit::KiloPascal),
    },
    ObdCommand {
        name: "ControlModuleVoltage",
        desc: "Control module supply voltage",
        request: "0142",
        response_len: 2,
        target: Some(EcuKind::Engine),
        fast: true,
        decode: |data| ObdValue::new(word(data) / 1000.0, ObdUnit::Volts),
    },
    ObdCommand {
        name: "AmbientAirTemp",
        desc: "Ambient air temperature",
        request: "0146",
        response_len: 1,
        target: Some(EcuKind::Engine),
        fast: true,
        decode: |data| ObdValue::new(f32::from(data[0]) - 40.0, ObdUnit::Celsius),
    },
    ObdCommand {
        name: "EngineOilTemp",
        desc: "Engine oil temperature",
        request: "015C",
        response_len: 1,
        target: Some(EcuKind::Engine),
        fast: true,
        decode: |data| ObdValue::new(f32::from(data[0]) - 40.0, ObdUnit::Celsius),
    },
];

/// Finds a registry command by its exact name
pub fn resolve(name: &str) -> DiagResult<&'static ObdCommand> {
    COMMANDS
        .iter()
        .find(|cmd| cmd.name == name)
        .ok_or_else(|| DiagError::CommandNotFound(name.to_string()))
}

/// Expands a PID support bitmask into the PID numbers it declares.
///
/// `start` is the first PID the mask covers, 0x01 for the 0100 query. Bits
/// run MSB first, one per PID
pub fn decode_pid_support(start: u8, data: &[u8]) -> Vec<u8> {
    let mut pids: Vec<u8> = Vec::new();
    for (byte_idx, byte) in data.iter().enumerate() {
        let mut mask: u8 = 0b1000_0000;
        for bit in 0..8 {
            if byte & mask != 0 {
                pids.push(start.wrapping_add((byte_idx * 8 + bit) as u8));
            }
            mask >>= 1;
        }
    }
    pids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_msg(data: &[u8]) -> EcuMessage {
        EcuMessage::new(0x7E8, EcuKind::Engine, data.to_vec())
    }

    #[test]
    fn engine_speed_scaling() {
        let cmd = resolve("EngineSpeed").unwrap();
        let readings = cmd.decode(&[engine_msg(&[0x1A, 0x2B])]).unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].ecu, EcuKind::Engine);
        assert_eq!(readings[0].value, ObdValue::new(1674.75, ObdUnit::Rpm));
    }

    #[test]
    fn coolant_temp_offset() {
        let cmd = resolve("CoolantTemp").unwrap();
        let readings = cmd.decode(&[engine_msg(&[0x7B])]).unwrap();
        assert_eq!(readings[0].value, ObdValue::new(83.0, ObdUnit::Celsius));
    }

    #[test]
    fn fuel_trim_is_signed() {
        let cmd = resolve("ShortFuelTrim1").unwrap();
        let rich = cmd.decode(&[engine_msg(&[0x90])]).unwrap();
        assert_eq!(rich[0].value.value(), 12.5);
        let centred = cmd.decode(&[engine_msg(&[0x80])]).unwrap();
        assert_eq!(centred[0].value.value(), 0.0);
    }

    #[test]
    fn control_module_voltage_scaling() {
        let cmd = resolve("ControlModuleVoltage").unwrap();
        let readings = cmd.decode(&[engine_msg(&[0x33, 0x90])]).unwrap();
        assert_eq!(readings[0].value, ObdValue::new(13.2, ObdUnit::Volts));
    }

    #[test]
    fn support_bitmask_expansion() {
        let pids = decode_pid_support(0x01, &[0xBE, 0x3F, 0xA8, 0x13]);
        assert_eq!(
            pids,
            vec![
                0x01, 0x03, 0x04, 0x05, 0x06, 0x07, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10, 0x11,
                0x13, 0x15, 0x1C, 0x1F, 0x20
            ]
        );
    }

    #[test]
    fn unknown_name_is_an_error() {
        assert!(matches!(
            resolve("FluxCapacitorCharge"),
            Err(DiagError::CommandNotFound(_))
        ));
    }

    #[test]
    fn wrong_payload_length_is_rejected() {
        let cmd = resolve("EngineSpeed").unwrap();
        let err = cmd.decode(&[engine_msg(&[0x1A])]).unwrap_err();
        assert!(matches!(
            err,
            DiagError::InvalidResponseLength { want: 2, got: 1 }
        ));
    }

    #[test]
    fn readings_filter_to_the_target_ecu() {
        let cmd = resolve("VehicleSpeed").unwrap();
        let messages = [
            EcuMessage::new(0x7E8, EcuKind::Engine, vec![0x3C]),
            EcuMessage::new(0x7E9, EcuKind::Transmission, vec![0x3C]),
        ];
        let readings = cmd.decode(&messages).unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].ecu, EcuKind::Engine);
        assert_eq!(readings[0].value.value(), 60.0);
    }

    #[test]
    fn untargeted_commands_read_every_ecu() {
        let cmd = resolve("Pids0120").unwrap();
        let messages = [
            EcuMessage::new(0x7E8, EcuKind::Engine, vec![0xBE, 0x3F, 0xA8, 0x13]),
            EcuMessage::new(0x7E9, EcuKind::Transmission, vec![0x80, 0x00, 0x00, 0x01]),
        ];
        let readings = cmd.decode(&messages).unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].value.value(), 18.0);
        assert_eq!(readings[1].value.value(), 2.0);
    }

    #[test]
    fn registry_names_are_unique() {
        for (i, a) in COMMANDS.iter().enumerate() {
            for b in &COMMANDS[i + 1..] {
                assert_ne!(a.name(), b.name(), "duplicate registry name");
            }
        }
    }
}
