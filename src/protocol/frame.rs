//! Decoding of individual adapter response lines

use crate::protocol::ObdProtocol;

/// Reason a response line could not be decoded as a frame
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The line contains a character that is not a hex digit. Adapter
    /// status strings such as `NO DATA` land here
    #[error("line contains a non hex character")]
    InvalidHex,
    /// The payload ends in the middle of a byte
    #[error("line ends with a dangling half byte")]
    OddLength,
    /// The line is shorter than the protocol's minimum frame
    #[error("line carries {0} hex digits, too short for a frame")]
    TooShort(usize),
    /// The trailing checksum byte does not match the frame content
    #[error("checksum mismatch. Frame carries 0x{want:02X}, calculated 0x{calc:02X}")]
    ChecksumMismatch {
        /// Checksum byte the frame ended with
        want: u8,
        /// Sum calculated over the received bytes
        calc: u8,
    },
    /// Decoding was attempted without a classified protocol
    #[error("no protocol has been classified for decoding")]
    NoProtocol,
}

/// One response line's worth of validated wire data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObdFrame {
    source: u32,
    data: Vec<u8>,
}

impl ObdFrame {
    /// Transmit address of the sending ECU
    pub fn source(&self) -> u32 {
        self.source
    }

    /// Frame payload. Header and checksum bytes are already stripped; on
    /// the CAN protocols the leading PCI byte is still present
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Decodes one response line according to `protocol`.
    ///
    /// Whitespace anywhere in the line is ignored, so it does not matter
    /// whether the adapter groups hex digits in byte pairs
    pub fn parse(protocol: ObdProtocol, line: &str) -> Result<Self, FrameError> {
        if protocol == ObdProtocol::Unknown {
            return Err(FrameError::NoProtocol);
        }
        let mut nibbles: Vec<u8> = Vec::with_capacity(line.len());
        for c in line.chars() {
            if c.is_ascii_whitespace() {
                continue;
            }
            nibbles.push(c.to_digit(16).ok_or(FrameError::InvalidHex)? as u8);
        }

        let header = protocol.header_nibbles();
        // Smallest decodable frame carries the header, one payload byte and
        // the checksum byte on the K-line protocols
        let min = header + 2 + if protocol.has_checksum() { 2 } else { 0 };
        if nibbles.len() < min {
            return Err(FrameError::TooShort(nibbles.len()));
        }
        if (nibbles.len() - header) % 2 != 0 {
            return Err(FrameError::OddLength);
        }

        let mut bytes: Vec<u8> = nibbles[header..]
            .chunks_exact(2)
            .map(|pair| (pair[0] << 4) | pair[1])
            .collect();

        if protocol.is_can() {
            let source = nibbles[..header]
                .iter()
                .fold(0u32, |acc, n| (acc << 4) | u32::from(*n));
            return Ok(Self { source, data: bytes });
        }

        // K-line header is priority, target address, source address. The
        // last byte of the line is an 8 bit sum over everything before it
        let header_bytes = [
            (nibbles[0] << 4) | nibbles[1],
            (nibbles[2] << 4) | nibbles[3],
            (nibbles[4] << 4) | nibbles[5],
        ];
        let Some(want) = bytes.pop() else {
            return Err(FrameError::TooShort(nibbles.len()));
        };
        let calc = header_bytes
            .iter()
            .chain(bytes.iter())
            .fold(0u8, |acc, b| acc.wrapping_add(*b));
        if calc != want {
            return Err(FrameError::ChecksumMismatch { want, calc });
        }
        Ok(Self {
            source: u32::from(header_bytes[2]),
            data: bytes,
        })
    }
}
