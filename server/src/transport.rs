//! Per-client reliable-protocol transport.
//!
//! Game traffic after the join sequence arrives as reliable-protocol frames
//! over the client's connected UDP socket. Each client gets one
//! [`ReliableTransport`] that reassembles multi-frame messages in sequence
//! order and produces the acknowledgment frames the sender asks for. At most
//! one message is assembled at a time; the protocol acknowledges interleaved
//! messages but peers never send them in practice.
//!
//! The transport does not retransmit: inbound acks are recorded and nothing
//! else. Negative acknowledgments and the `Big`/`Extended` frame variants
//! are unsupported and such frames are dropped.

use log::{debug, warn};

use shared::{
    Frame, FRAME_ACK, FRAME_BIG, FRAME_END, FRAME_EXTENDED, FRAME_RELIABLE, FRAME_SEND_ACK,
    FRAME_START,
};

/// What handling one datagram produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FrameOutcome {
    /// A fully reassembled message, if this frame completed one.
    pub delivered: Option<Vec<u8>>,
    /// An encoded ack frame to send back, if the frame asked for one.
    pub ack: Option<Vec<u8>>,
}

enum AssemblyState {
    Idle,
    Assembling { message_id: u8, next_sequence: u8, buffer: Vec<u8> },
}

/// Reliable-protocol state for a single client.
pub struct ReliableTransport {
    state: AssemblyState,
    /// Sum of frame lengths minus their id prefixes; echoed in acks.
    bytes_received: u32,
}

impl ReliableTransport {
    pub fn new() -> Self {
        Self { state: AssemblyState::Idle, bytes_received: 0 }
    }

    pub fn bytes_received(&self) -> u32 {
        self.bytes_received
    }

    /// Handles one inbound datagram. `tick` is the current session tick,
    /// echoed in ack payloads.
    pub fn handle_datagram(&mut self, datagram: &[u8], tick: u32) -> FrameOutcome {
        let mut outcome = FrameOutcome::default();

        let (frame, id_len) = match Frame::decode(datagram) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("short frame ({} bytes): {}", datagram.len(), e);
                return outcome;
            }
        };

        if frame.flags & (FRAME_EXTENDED | FRAME_BIG) != 0 {
            warn!("unsupported frame flags {:#04x}", frame.flags);
            return outcome;
        }

        // The id prefix is excluded from the running byte count.
        self.bytes_received = self.bytes_received.wrapping_add((datagram.len() - id_len) as u32);

        // We are peer 0; anything else is misaddressed.
        if frame.to_id != 0 {
            warn!("frame addressed to peer {}", frame.to_id);
            return outcome;
        }

        if frame.flags & FRAME_ACK != 0 {
            // Record-only; there is no retransmission to cancel.
            debug!("ack for message {} sequence {}", frame.message_id, frame.sequence);
            return outcome;
        }

        let start = frame.flags & FRAME_START != 0;
        let end = frame.flags & FRAME_END != 0;
        let mut dropped = false;

        let state = std::mem::replace(&mut self.state, AssemblyState::Idle);
        self.state = match state {
            AssemblyState::Idle if start && end => {
                // Single-frame message, no buffering needed.
                outcome.delivered = Some(frame.payload.to_vec());
                AssemblyState::Idle
            }
            AssemblyState::Idle if start => AssemblyState::Assembling {
                message_id: frame.message_id,
                next_sequence: frame.sequence.wrapping_add(1),
                buffer: frame.payload.to_vec(),
            },
            AssemblyState::Idle => {
                warn!(
                    "sequence {} of message {} with no assembly in progress",
                    frame.sequence, frame.message_id
                );
                dropped = true;
                AssemblyState::Idle
            }
            AssemblyState::Assembling { message_id, next_sequence, mut buffer }
                if !start && frame.message_id == message_id && frame.sequence == next_sequence =>
            {
                buffer.extend_from_slice(frame.payload);
                if end {
                    outcome.delivered = Some(buffer);
                    AssemblyState::Idle
                } else {
                    AssemblyState::Assembling {
                        message_id,
                        next_sequence: next_sequence.wrapping_add(1),
                        buffer,
                    }
                }
            }
            AssemblyState::Assembling { message_id, next_sequence, buffer } => {
                warn!(
                    "message {} sequence {} while assembling message {} at sequence {}",
                    frame.message_id, frame.sequence, message_id, next_sequence
                );
                dropped = true;
                AssemblyState::Assembling { message_id, next_sequence, buffer }
            }
        };

        if dropped {
            return outcome;
        }

        if frame.flags & (FRAME_END | FRAME_SEND_ACK) != 0 {
            outcome.ack = Some(self.build_ack(&frame, tick));
        }

        outcome
    }

    /// An ack mirrors the frame's ids (swapped), message id, sequence and
    /// serial, reliably when the frame was reliable, and carries the running
    /// byte count plus the session tick.
    fn build_ack(&self, frame: &Frame<'_>, tick: u32) -> Vec<u8> {
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&self.bytes_received.to_le_bytes());
        payload[4..].copy_from_slice(&tick.to_le_bytes());

        let mut out = Vec::with_capacity(16);
        Frame {
            from_id: frame.to_id,
            to_id: frame.from_id,
            flags: FRAME_ACK | (frame.flags & FRAME_RELIABLE),
            message_id: frame.message_id,
            sequence: frame.sequence,
            serial: frame.serial,
            payload: &payload,
        }
        .encode(&mut out);
        out
    }
}

impl Default for ReliableTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_frame(
        flags: u8,
        message_id: u8,
        sequence: u8,
        serial: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        Frame { from_id: 1, to_id: 0, flags, message_id, sequence, serial, payload }
            .encode(&mut out);
        out
    }

    #[test]
    fn single_frame_message_delivers_immediately() {
        let mut transport = ReliableTransport::new();
        let datagram = encode_frame(FRAME_START | FRAME_END | FRAME_RELIABLE, 3, 0, 1, b"hello");

        let outcome = transport.handle_datagram(&datagram, 100);
        assert_eq!(outcome.delivered.as_deref(), Some(b"hello".as_slice()));
        assert!(outcome.ack.is_some());
    }

    #[test]
    fn multi_frame_message_assembles_in_order() {
        let mut transport = ReliableTransport::new();

        let outcome = transport.handle_datagram(
            &encode_frame(FRAME_START | FRAME_RELIABLE, 7, 0, 1, b"part A "),
            0,
        );
        assert!(outcome.delivered.is_none());
        assert!(outcome.ack.is_none());

        let outcome =
            transport.handle_datagram(&encode_frame(FRAME_RELIABLE, 7, 1, 2, b"part B "), 0);
        assert!(outcome.delivered.is_none());

        let outcome = transport.handle_datagram(
            &encode_frame(FRAME_END | FRAME_SEND_ACK | FRAME_RELIABLE, 7, 2, 3, b"part C"),
            0,
        );
        assert_eq!(outcome.delivered.as_deref(), Some(b"part A part B part C".as_slice()));
        assert!(outcome.ack.is_some());
    }

    #[test]
    fn ack_mirrors_frame_and_carries_byte_count() {
        let mut transport = ReliableTransport::new();
        let datagram =
            encode_frame(FRAME_START | FRAME_END | FRAME_SEND_ACK | FRAME_RELIABLE, 9, 4, 6, b"xyz");

        let outcome = transport.handle_datagram(&datagram, 0xABCD_1234);
        let ack = outcome.ack.unwrap();
        let (frame, _) = Frame::decode(&ack).unwrap();

        assert_eq!(frame.flags, FRAME_ACK | FRAME_RELIABLE);
        assert_eq!(frame.from_id, 0);
        assert_eq!(frame.to_id, 1);
        assert_eq!(frame.message_id, 9);
        assert_eq!(frame.sequence, 4);
        assert_eq!(frame.serial, 6);
        assert_eq!(frame.payload.len(), 8);

        // Two-byte id prefix is not counted.
        let expected_bytes = (datagram.len() - 2) as u32;
        assert_eq!(&frame.payload[..4], expected_bytes.to_le_bytes());
        assert_eq!(&frame.payload[4..], 0xABCD_1234u32.to_le_bytes());
        assert_eq!(transport.bytes_received(), expected_bytes);
    }

    #[test]
    fn unreliable_frame_gets_unreliable_ack() {
        let mut transport = ReliableTransport::new();
        let outcome =
            transport.handle_datagram(&encode_frame(FRAME_START | FRAME_END, 1, 0, 0, b"x"), 0);
        let ack = outcome.ack.unwrap();
        let (frame, _) = Frame::decode(&ack).unwrap();
        assert_eq!(frame.flags, FRAME_ACK);
    }

    #[test]
    fn send_ack_mid_message_acks_without_delivering() {
        let mut transport = ReliableTransport::new();
        transport.handle_datagram(&encode_frame(FRAME_START | FRAME_RELIABLE, 5, 0, 0, b"a"), 0);

        let outcome = transport.handle_datagram(
            &encode_frame(FRAME_SEND_ACK | FRAME_RELIABLE, 5, 1, 1, b"b"),
            0,
        );
        assert!(outcome.delivered.is_none());
        assert!(outcome.ack.is_some());

        let outcome =
            transport.handle_datagram(&encode_frame(FRAME_END | FRAME_RELIABLE, 5, 2, 2, b"c"), 0);
        assert_eq!(outcome.delivered.as_deref(), Some(b"abc".as_slice()));
    }

    #[test]
    fn sequence_mismatch_drops_frame_without_ack() {
        let mut transport = ReliableTransport::new();
        transport.handle_datagram(&encode_frame(FRAME_START | FRAME_RELIABLE, 5, 0, 0, b"a"), 0);

        // Wrong sequence: dropped, no ack even though End is set.
        let outcome = transport
            .handle_datagram(&encode_frame(FRAME_END | FRAME_RELIABLE, 5, 7, 1, b"zz"), 0);
        assert!(outcome.delivered.is_none());
        assert!(outcome.ack.is_none());

        // The assembly is still on track.
        let outcome =
            transport.handle_datagram(&encode_frame(FRAME_END | FRAME_RELIABLE, 5, 1, 1, b"b"), 0);
        assert_eq!(outcome.delivered.as_deref(), Some(b"ab".as_slice()));
    }

    #[test]
    fn message_id_mismatch_drops_frame() {
        let mut transport = ReliableTransport::new();
        transport.handle_datagram(&encode_frame(FRAME_START | FRAME_RELIABLE, 5, 0, 0, b"a"), 0);

        let outcome =
            transport.handle_datagram(&encode_frame(FRAME_RELIABLE, 6, 1, 1, b"other"), 0);
        assert!(outcome.delivered.is_none());
        assert!(outcome.ack.is_none());
    }

    #[test]
    fn start_during_assembly_is_dropped() {
        let mut transport = ReliableTransport::new();
        transport.handle_datagram(&encode_frame(FRAME_START | FRAME_RELIABLE, 5, 0, 0, b"a"), 0);

        let outcome = transport
            .handle_datagram(&encode_frame(FRAME_START | FRAME_RELIABLE, 6, 0, 1, b"x"), 0);
        assert!(outcome.delivered.is_none());

        // Original assembly unaffected.
        let outcome =
            transport.handle_datagram(&encode_frame(FRAME_END | FRAME_RELIABLE, 5, 1, 2, b"b"), 0);
        assert_eq!(outcome.delivered.as_deref(), Some(b"ab".as_slice()));
    }

    #[test]
    fn continuation_without_start_is_dropped() {
        let mut transport = ReliableTransport::new();
        let outcome =
            transport.handle_datagram(&encode_frame(FRAME_END | FRAME_RELIABLE, 5, 1, 0, b"b"), 0);
        assert!(outcome.delivered.is_none());
        assert!(outcome.ack.is_none());
    }

    #[test]
    fn unsupported_flag_bits_drop_the_frame() {
        let mut transport = ReliableTransport::new();
        for flags in [FRAME_BIG, FRAME_EXTENDED] {
            let outcome = transport.handle_datagram(
                &encode_frame(FRAME_START | FRAME_END | flags, 1, 0, 0, b"x"),
                0,
            );
            assert!(outcome.delivered.is_none());
            assert!(outcome.ack.is_none());
        }
        // Dropped before byte accounting.
        assert_eq!(transport.bytes_received(), 0);
    }

    #[test]
    fn misaddressed_frame_is_dropped_but_counted() {
        let mut transport = ReliableTransport::new();
        let mut datagram = Vec::new();
        Frame {
            from_id: 1,
            to_id: 3,
            flags: FRAME_START | FRAME_END,
            message_id: 1,
            sequence: 0,
            serial: 0,
            payload: b"x",
        }
        .encode(&mut datagram);

        let outcome = transport.handle_datagram(&datagram, 0);
        assert!(outcome.delivered.is_none());
        assert!(outcome.ack.is_none());
        assert_eq!(transport.bytes_received(), (datagram.len() - 2) as u32);
    }

    #[test]
    fn inbound_ack_is_record_only() {
        let mut transport = ReliableTransport::new();
        let outcome =
            transport.handle_datagram(&encode_frame(FRAME_ACK | FRAME_RELIABLE, 1, 0, 0, &[]), 0);
        assert!(outcome.delivered.is_none());
        assert!(outcome.ack.is_none());
    }

    #[test]
    fn byte_count_accumulates_across_frames() {
        let mut transport = ReliableTransport::new();
        let first = encode_frame(FRAME_START | FRAME_RELIABLE, 1, 0, 0, b"aaaa");
        let second = encode_frame(FRAME_END | FRAME_RELIABLE, 1, 1, 1, b"bb");

        transport.handle_datagram(&first, 0);
        transport.handle_datagram(&second, 0);

        let expected = (first.len() - 2 + second.len() - 2) as u32;
        assert_eq!(transport.bytes_received(), expected);
    }

    #[test]
    fn runt_datagram_is_ignored() {
        let mut transport = ReliableTransport::new();
        let outcome = transport.handle_datagram(&[0x01, 0x00, 0x10], 0);
        assert!(outcome.delivered.is_none());
        assert!(outcome.ack.is_none());
        assert_eq!(transport.bytes_received(), 0);
    }
}
