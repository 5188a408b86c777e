//! Reassembly of decoded frames into per ECU messages

use log::warn;

use crate::protocol::frame::ObdFrame;
use crate::protocol::{EcuKind, ObdProtocol};
use crate::{DiagError, DiagResult};

/// Leading payload bytes every positive response spends echoing the
/// requested mode and PID
const MODE_PID_ECHO: usize = 2;

/// Reassembled application payload of one ECU's response to one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcuMessage {
    addr: u32,
    ecu: EcuKind,
    data: Vec<u8>,
}

impl EcuMessage {
    pub(crate) fn new(addr: u32, ecu: EcuKind, data: Vec<u8>) -> Self {
        Self { addr, ecu, data }
    }

    /// Raw transmit address the message arrived from
    pub fn addr(&self) -> u32 {
        self.addr
    }

    /// Logical role of the transmitting ECU
    pub fn ecu(&self) -> EcuKind {
        self.ecu
    }

    /// Payload with header, checksum, transport framing and the mode/PID
    /// echo all removed
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Accumulator for one ECU's frames within a single response batch.
///
/// Implements the receiving half of the ISO 15765-2 segmentation scheme as
/// far as an ELM327 exposes it. Flow control is the adapter's job, so only
/// single, first and consecutive frames appear here
#[derive(Debug, Default)]
struct CanRx {
    started: bool,
    done: bool,
    failed: bool,
    total: usize,
    next_seq: u8,
    data: Vec<u8>,
}

impl CanRx {
    fn feed(&mut self, addr: u32, payload: &[u8]) {
        if self.failed {
            return;
        }
        if self.done {
            warn!("ECU 0x{addr:X}: frame after a completed message, ignoring");
            return;
        }
        let pci = payload[0];
        match pci >> 4 {
            // Single frame, length in the low nibble
            0x0 => {
                let len = usize::from(pci & 0x0F);
                if len == 0 || len > payload.len() - 1 {
                    warn!("ECU 0x{addr:X}: single frame length {len} does not fit the payload");
                    self.fail();
                    return;
                }
                self.data = payload[1..=len].to_vec();
                self.total = len;
                self.done = true;
            }
            // First frame, 12 bit total length
            0x1 => {
                if self.started {
                    warn!("ECU 0x{addr:X}: second first-frame in one response");
                    self.fail();
                    return;
                }
                if payload.len() < 2 {
                    warn!("ECU 0x{addr:X}: first frame too short to carry a length");
                    self.fail();
                    return;
                }
                self.total = (usize::from(pci & 0x0F) << 8) | usize::from(payload[1]);
                self.data.extend_from_slice(&payload[2..]);
                self.started = true;
                self.next_seq = 1;
                self.finish_if_complete();
            }
            // Consecutive frame, sequence index in the low nibble
            0x2 => {
                if !self.started {
                    warn!("ECU 0x{addr:X}: consecutive frame without a first frame");
                    self.fail();
                    return;
                }
                let seq = pci & 0x0F;
                if seq != self.next_seq {
                    warn!(
                        "ECU 0x{addr:X}: consecutive frame out of order. Expected index {}, got {seq}",
                        self.next_seq
                    );
                    self.fail();
                    return;
                }
                self.next_seq = (self.next_seq + 1) & 0x0F;
                self.data.extend_from_slice(&payload[1..]);
                self.finish_if_complete();
            }
            other => {
                warn!("ECU 0x{addr:X}: unsupported PCI type {other:X}");
                self.fail();
            }
        }
    }

    fn finish_if_complete(&mut self) {
        if self.data.len() >= self.total {
            // Frames are padded to 8 bytes, drop the padding
            self.data.truncate(self.total);
            self.done = true;
        }
    }

    fn fail(&mut self) {
        self.failed = true;
        self.data.clear();
    }
}

fn strip_echo(protocol: ObdProtocol, addr: u32, data: Vec<u8>) -> Option<EcuMessage> {
    if data.len() < MODE_PID_ECHO {
        warn!("ECU 0x{addr:X}: response shorter than the mode/PID echo, dropping");
        return None;
    }
    Some(EcuMessage::new(
        addr,
        protocol.ecu_kind(addr),
        data[MODE_PID_ECHO..].to_vec(),
    ))
}

fn assemble_can(protocol: ObdProtocol, frames: &[ObdFrame]) -> Vec<EcuMessage> {
    let mut rx: Vec<(u32, CanRx)> = Vec::new();
    for frame in frames {
        let source = frame.source();
        if !rx.iter().any(|(addr, _)| *addr == source) {
            rx.push((source, CanRx::default()));
        }
        if let Some((_, acc)) = rx.iter_mut().find(|(addr, _)| *addr == source) {
            acc.feed(source, frame.data());
        }
    }
    rx.into_iter()
        .filter_map(|(addr, acc)| {
            if acc.done {
                strip_echo(protocol, addr, acc.data)
            } else {
                if acc.started && !acc.failed {
                    warn!("ECU 0x{addr:X}: multi frame response never completed, dropping");
                }
                None
            }
        })
        .collect()
}

fn assemble_single(protocol: ObdProtocol, frames: &[ObdFrame]) -> Vec<EcuMessage> {
    let mut out: Vec<EcuMessage> = Vec::new();
    for frame in frames {
        if out.iter().any(|msg| msg.addr() == frame.source()) {
            warn!(
                "ECU 0x{:X}: more than one line on a single frame protocol, keeping the first",
                frame.source()
            );
            continue;
        }
        if let Some(msg) = strip_echo(protocol, frame.source(), frame.data().to_vec()) {
            out.push(msg);
        }
    }
    out
}

/// Groups validated frames by source address and reassembles them into one
/// message per responding ECU, in the order the sources first appeared
pub fn assemble_messages(protocol: ObdProtocol, frames: &[ObdFrame]) -> Vec<EcuMessage> {
    if protocol.is_can() {
        assemble_can(protocol, frames)
    } else {
        assemble_single(protocol, frames)
    }
}

/// Decodes a batch of raw response lines into per ECU messages.
///
/// Lines that fail frame validation are logged and dropped without aborting
/// the batch, since adapters interleave status text with data. Decoding
/// with [ObdProtocol::Unknown] is refused outright
pub fn decode_lines(protocol: ObdProtocol, lines: &[String]) -> DiagResult<Vec<EcuMessage>> {
    if protocol == ObdProtocol::Unknown {
        return Err(DiagError::UnknownProtocol);
    }
    let mut frames: Vec<ObdFrame> = Vec::with_capacity(lines.len());
    for line in lines {
        match ObdFrame::parse(protocol, line) {
            Ok(frame) => frames.push(frame),
            Err(reason) => warn!("Discarding line {line:?}: {reason}"),
        }
    }
    Ok(assemble_messages(protocol, &frames))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(protocol: ObdProtocol, lines: &[&str]) -> Vec<EcuMessage> {
        let lines: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        decode_lines(protocol, &lines).unwrap()
    }

    #[test]
    fn single_frame_per_ecu() {
        let messages = decode(
            ObdProtocol::Can11Bit,
            &["7E8 06 41 00 BE 3F A8 13", "7E9 06 41 00 80 00 00 01"],
        );
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].addr(), 0x7E8);
        assert_eq!(messages[0].ecu(), EcuKind::Engine);
        assert_eq!(messages[0].data(), [0xBE, 0x3F, 0xA8, 0x13]);
        assert_eq!(messages[1].ecu(), EcuKind::Transmission);
        assert_eq!(messages[1].data(), [0x80, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn multi_frame_vin_response() {
        // Mode 09 PID 02, 20 byte payload: 49 02 01 then "1D4GP00R55B123456"
        let messages = decode(
            ObdProtocol::Can11Bit,
            &[
                "7E8 10 14 49 02 01 31 44 34",
                "7E8 21 47 50 30 30 52 35 35",
                "7E8 22 42 31 32 33 34 35 36",
            ],
        );
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data().len(), 18);
        assert_eq!(messages[0].data()[0], 0x01);
        assert_eq!(&messages[0].data()[1..], b"1D4GP00R55B123456");
    }

    #[test]
    fn padding_beyond_declared_length_is_dropped() {
        let messages = decode(
            ObdProtocol::Can11Bit,
            &["7E8 10 09 41 00 01 02 03 04", "7E8 21 05 06 AA AA AA AA AA"],
        );
        assert_eq!(messages.len(), 1);
        // 9 declared, minus the 2 byte echo
        assert_eq!(messages[0].data(), [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0xAA]);
    }

    #[test]
    fn out_of_order_sequence_drops_only_that_ecu() {
        let messages = decode(
            ObdProtocol::Can11Bit,
            &[
                "7E8 10 14 49 02 01 31 44 34",
                "7E8 22 42 31 32 33 34 35 36",
                "7E9 04 41 0C 1A 2B",
            ],
        );
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].addr(), 0x7E9);
    }

    #[test]
    fn orphan_consecutive_frame_is_dropped() {
        let messages = decode(ObdProtocol::Can11Bit, &["7E8 21 47 50 30 30 52 35 35"]);
        assert!(messages.is_empty());
    }

    #[test]
    fn incomplete_multi_frame_is_dropped() {
        let messages = decode(ObdProtocol::Can11Bit, &["7E8 10 14 49 02 01 31 44 34"]);
        assert!(messages.is_empty());
    }

    #[test]
    fn k_line_keeps_first_line_per_ecu() {
        let messages = decode(
            ObdProtocol::Iso9141,
            &[
                "48 6B 10 41 00 BE 3F A8 13 BC",
                "48 6B 10 41 00 88 18 00 10 B4",
            ],
        );
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data(), [0xBE, 0x3F, 0xA8, 0x13]);
    }

    #[test]
    fn status_lines_do_not_abort_the_batch() {
        let messages = decode(
            ObdProtocol::Can11Bit,
            &["SEARCHING...", "7E8 04 41 0D 20 00"],
        );
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data(), [0x20, 0x00]);
    }

    #[test]
    fn echo_only_response_keeps_an_empty_payload() {
        let messages = decode(ObdProtocol::Can11Bit, &["7E8 02 41 0C"]);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].data().is_empty());
    }

    #[test]
    fn response_shorter_than_the_echo_is_dropped() {
        let messages = decode(ObdProtocol::Can11Bit, &["7E8 01 44"]);
        assert!(messages.is_empty());
    }

    #[test]
    fn unknown_protocol_is_an_error() {
        let lines = vec!["7E8 04 41 0D 20 00".to_string()];
        assert!(matches!(
            decode_lines(ObdProtocol::Unknown, &lines),
            Err(DiagError::UnknownProtocol)
        ));
    }
}
