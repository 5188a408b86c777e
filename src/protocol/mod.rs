//! Bus protocol classification and response decoding
//!
//! An ELM327 hides the physical bus behind a line oriented text interface,
//! but the shape of those lines still depends on which protocol the adapter
//! negotiated with the vehicle. This module classifies the adapter's
//! protocol report and turns raw response lines into per ECU messages.

mod frame;
mod message;

pub use frame::*;
pub use message::*;

use std::fmt;

/// Bus protocols the adapter can negotiate with the vehicle.
///
/// The numbering follows the ELM327 `AT SP` selector digits. Protocols the
/// adapter supports but this crate does not decode (J1850 variants and the
/// 29 bit / 250 kbaud CAN flavours) classify as [ObdProtocol::Unknown]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, strum_macros::Display, strum_macros::EnumString)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ObdProtocol {
    /// ISO 9141-2, the K-line protocol with a 5 baud init
    #[strum(to_string = "ISO 9141-2")]
    Iso9141,
    /// ISO 14230-4 KWP2000 over K-line, 5 baud init
    #[strum(to_string = "ISO 14230-4 (KWP 5-baud)")]
    KwpSlow,
    /// ISO 14230-4 KWP2000 over K-line, fast init
    #[strum(to_string = "ISO 14230-4 (KWP fast)")]
    KwpFast,
    /// ISO 15765-4 CAN with 11 bit identifiers at 500 kbaud
    #[strum(to_string = "ISO 15765-4 (CAN 11/500)")]
    Can11Bit,
    /// ISO 15765-4 CAN with 29 bit identifiers at 500 kbaud
    #[strum(to_string = "ISO 15765-4 (CAN 29/500)")]
    Can29Bit,
    /// Not yet classified, or a protocol this crate cannot decode
    #[default]
    #[strum(to_string = "Unknown")]
    Unknown,
}

impl ObdProtocol {
    /// Classifies an `AT DPN` report. A leading `A` marks a protocol the
    /// adapter found by automatic search and is ignored
    pub fn from_adapter_id(id: &str) -> Self {
        let trimmed = id.trim();
        let digit = trimmed.strip_prefix(['A', 'a']).unwrap_or(trimmed);
        match digit {
            "3" => Self::Iso9141,
            "4" => Self::KwpSlow,
            "5" => Self::KwpFast,
            "6" => Self::Can11Bit,
            "7" => Self::Can29Bit,
            _ => Self::Unknown,
        }
    }

    /// Selector digit for `AT SP`. [ObdProtocol::Unknown] has none and
    /// leaves the adapter in automatic search mode
    pub fn elm_id(&self) -> Option<&'static str> {
        match self {
            Self::Iso9141 => Some("3"),
            Self::KwpSlow => Some("4"),
            Self::KwpFast => Some("5"),
            Self::Can11Bit => Some("6"),
            Self::Can29Bit => Some("7"),
            Self::Unknown => None,
        }
    }

    /// True for the ISO 15765-4 variants, which segment long responses
    /// across multiple frames
    pub fn is_can(&self) -> bool {
        matches!(self, Self::Can11Bit | Self::Can29Bit)
    }

    /// Number of leading hex digits on a response line that carry the frame
    /// header
    pub(crate) fn header_nibbles(&self) -> usize {
        match self {
            // Three header bytes on the K-line protocols
            Self::Iso9141 | Self::KwpSlow | Self::KwpFast => 6,
            Self::Can11Bit => 3,
            Self::Can29Bit => 8,
            Self::Unknown => 0,
        }
    }

    /// True where each frame ends in an 8 bit sum checksum byte
    pub(crate) fn has_checksum(&self) -> bool {
        matches!(self, Self::Iso9141 | Self::KwpSlow | Self::KwpFast)
    }

    /// Base identifier that ECU transmit addresses are offset from
    fn rx_id_base(&self) -> u32 {
        match self {
            Self::Can11Bit => 0x7E8,
            Self::Can29Bit => 0x18DA_F100,
            // K-line source addresses are used as-is
            _ => 0,
        }
    }

    /// Maps a raw transmit address to the logical ECU that owns it
    pub fn ecu_kind(&self, addr: u32) -> EcuKind {
        let offset = addr.wrapping_sub(self.rx_id_base());
        let (engine, transmission) = match self {
            Self::Can11Bit => (0x00, 0x01),
            _ => (0x10, 0x18),
        };
        if offset == engine {
            EcuKind::Engine
        } else if offset == transmission {
            EcuKind::Transmission
        } else {
            EcuKind::Unknown(addr)
        }
    }
}

/// Logical role of a responding control unit
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EcuKind {
    /// Engine control module
    Engine,
    /// Transmission control module
    Transmission,
    /// Any other module, tagged with its raw transmit address
    Unknown(u32),
}

impl fmt::Display for EcuKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Engine => write!(f, "Engine"),
            Self::Transmission => write!(f, "Transmission"),
            Self::Unknown(addr) => write!(f, "ECU 0x{addr:02X}"),
        }
    }
}

/// ECU transmit addresses seen during the handshake, each tagged with its
/// logical role, in first-observed order.
///
/// A map is built once from the broadcast probe responses and replaced
/// wholesale by the next handshake, never mutated in place
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EcuMap {
    entries: Vec<(u32, EcuKind)>,
}

impl EcuMap {
    pub(crate) fn from_messages(messages: &[EcuMessage]) -> Self {
        let mut entries: Vec<(u32, EcuKind)> = Vec::new();
        for msg in messages {
            if !entries.iter().any(|(addr, _)| *addr == msg.addr()) {
                entries.push((msg.addr(), msg.ecu()));
            }
        }
        Self { entries }
    }

    /// Role of the ECU transmitting with `addr`, if it answered the
    /// handshake probe
    pub fn kind_of(&self, addr: u32) -> Option<EcuKind> {
        self.entries
            .iter()
            .find(|(a, _)| *a == addr)
            .map(|(_, kind)| *kind)
    }

    /// Addresses in the map, in first-observed order
    pub fn addresses(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|(addr, _)| *addr)
    }

    /// Iterates `(address, role)` pairs in first-observed order
    pub fn iter(&self) -> impl Iterator<Item = &(u32, EcuKind)> {
        self.entries.iter()
    }

    /// Number of distinct ECUs that answered
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no ECU has been mapped yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_id_classification() {
        assert_eq!(ObdProtocol::from_adapter_id("3"), ObdProtocol::Iso9141);
        assert_eq!(ObdProtocol::from_adapter_id("4"), ObdProtocol::KwpSlow);
        assert_eq!(ObdProtocol::from_adapter_id("5"), ObdProtocol::KwpFast);
        assert_eq!(ObdProtocol::from_adapter_id("6"), ObdProtocol::Can11Bit);
        assert_eq!(ObdProtocol::from_adapter_id("A6"), ObdProtocol::Can11Bit);
        assert_eq!(ObdProtocol::from_adapter_id("A7"), ObdProtocol::Can29Bit);
        // J1850 PWM, not decodable here
        assert_eq!(ObdProtocol::from_adapter_id("1"), ObdProtocol::Unknown);
        assert_eq!(ObdProtocol::from_adapter_id("A0"), ObdProtocol::Unknown);
        assert_eq!(ObdProtocol::from_adapter_id(""), ObdProtocol::Unknown);
    }

    #[test]
    fn ecu_roles_11bit_can() {
        let p = ObdProtocol::Can11Bit;
        assert_eq!(p.ecu_kind(0x7E8), EcuKind::Engine);
        assert_eq!(p.ecu_kind(0x7E9), EcuKind::Transmission);
        assert_eq!(p.ecu_kind(0x7EA), EcuKind::Unknown(0x7EA));
    }

    #[test]
    fn ecu_roles_29bit_can() {
        let p = ObdProtocol::Can29Bit;
        assert_eq!(p.ecu_kind(0x18DA_F110), EcuKind::Engine);
        assert_eq!(p.ecu_kind(0x18DA_F118), EcuKind::Transmission);
        assert_eq!(p.ecu_kind(0x18DA_F121), EcuKind::Unknown(0x18DA_F121));
    }

    #[test]
    fn ecu_roles_k_line() {
        let p = ObdProtocol::Iso9141;
        assert_eq!(p.ecu_kind(0x10), EcuKind::Engine);
        assert_eq!(p.ecu_kind(0x18), EcuKind::Transmission);
        assert_eq!(p.ecu_kind(0x28), EcuKind::Unknown(0x28));
    }

    #[test]
    fn map_keeps_first_observed_order() {
        let messages = [
            EcuMessage::new(0x7E9, EcuKind::Transmission, vec![0x00]),
            EcuMessage::new(0x7E8, EcuKind::Engine, vec![0x01]),
            EcuMessage::new(0x7E9, EcuKind::Transmission, vec![0x02]),
        ];
        let map = EcuMap::from_messages(&messages);
        assert_eq!(map.len(), 2);
        assert_eq!(
            map.addresses().collect::<Vec<_>>(),
            vec![0x7E9, 0x7E8]
        );
        assert_eq!(map.kind_of(0x7E8), Some(EcuKind::Engine));
        assert_eq!(map.kind_of(0x7E0), None);
    }

    #[test]
    fn display_names() {
        assert_eq!(ObdProtocol::Can11Bit.to_string(), "ISO 15765-4 (CAN 11/500)");
        assert_eq!(EcuKind::Unknown(0x7EA).to_string(), "ECU 0x7EA");
    }
}
