//! Frame layer: byte-stream deframer and frame builders.
//!
//! A frame starts with the two start-of-frame octets `0x55 0x00`. Data
//! frames carry an 8-octet prefix (SOF pair, type + frame-id high bits,
//! length, frame-id low byte, three metadata octets), 1..=256 payload
//! octets, and a little-endian CRC-32 trailer covering everything after
//! the SOF pair. Link frames (ack, nack, reset) carry only the type/id
//! pair before the trailer.
//!
//! The receive path is a byte-at-a-time state machine. State and partial
//! buffers persist across [`Framer::recv`] calls, so the transport stream
//! may be chopped arbitrarily. Once a header has been accepted the
//! machine consumes exactly the advertised number of octets: a stray SOF
//! byte inside a frame never restarts synchronization.

use crate::codec;
use crate::crc::Crc32Context;
use crate::Error;
use log::{trace, warn};

/// First start-of-frame octet.
pub const SOF1: u8 = 0x55;
/// Second start-of-frame octet.
pub const SOF2: u8 = 0x00;

/// SOF pair plus the six header octets of a data frame.
pub const HEADER_SIZE: usize = 8;
/// Octets in the CRC-32 trailer.
pub const CRC_SIZE: usize = 4;
/// Total size of a link frame on the wire.
pub const LINK_FRAME_SIZE: usize = 8;
/// Largest payload a single data frame can carry.
pub const PAYLOAD_MAX: usize = 256;
/// Largest data frame on the wire.
pub const FRAME_MAX: usize = HEADER_SIZE + PAYLOAD_MAX + CRC_SIZE;

/// Frame ids are 11 bits wide.
pub const FRAME_ID_MAX: u16 = 1 << 11;
/// Metadata is 24 bits wide.
pub const METADATA_MAX: u32 = 1 << 24;

const FRAME_TYPE_DATA: u8 = 0b000;
const FRAME_TYPE_MASK: u8 = 0x07;
const FRAME_ID_HIGH_SHIFT: u8 = 5;

/// Link frame opcodes (the low three bits of header octet 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFrameType {
    /// Everything up to and including the carried id is acknowledged.
    AckAll = 0b100,
    /// The carried id arrived, but an earlier frame is still missing.
    AckOne = 0b101,
    /// The carried id is missing at the receiver.
    NackFrameId = 0b110,
    /// The receiver hit a framing error; the carried id is its next
    /// expected frame.
    NackFramingError = 0b111,
    /// Link reinitialization request (id 0) or acknowledgement (id 1).
    Reset = 0b010,
}

/// Which acknowledgement form arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    All,
    One,
}

/// Why the peer requested a retransmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackCause {
    FrameId,
    FramingError,
}

/// Receiver of deframed events. Exactly one method fires per frame.
pub trait FrameHandler {
    fn on_frame(&mut self, frame_id: u16, metadata: u32, payload: &[u8]);
    fn on_ack(&mut self, kind: AckKind, frame_id: u16);
    fn on_nack(&mut self, cause: NackCause, frame_id: u16);
    fn on_reset(&mut self, frame_id: u16);
    fn on_frame_error(&mut self);
}

/// Receive-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramerStats {
    /// Frames that validated and were dispatched.
    pub rx_count: u32,
    /// Bytes discarded while hunting for a SOF pair, and aborted headers.
    pub rx_synchronization_errors: u32,
    /// Frames dropped for a CRC-32 mismatch.
    pub rx_mic_errors: u32,
}

enum RxState {
    SearchSof1,
    SearchSof2,
    Header,
    Payload,
    FrameCrc,
    LinkFrame,
}

/// Byte-at-a-time deframer.
pub struct Framer {
    name: String,
    state: RxState,
    header: [u8; HEADER_SIZE],
    header_count: usize,
    payload: [u8; PAYLOAD_MAX],
    payload_len: usize,
    payload_count: usize,
    crc_bytes: [u8; CRC_SIZE],
    crc_count: usize,
    crc: Crc32Context,
    stats: FramerStats,
}

impl Framer {
    pub fn new(name: &str) -> Self {
        Framer {
            name: name.to_string(),
            state: RxState::SearchSof1,
            header: [0; HEADER_SIZE],
            header_count: 0,
            payload: [0; PAYLOAD_MAX],
            payload_len: 0,
            payload_count: 0,
            crc_bytes: [0; CRC_SIZE],
            crc_count: 0,
            crc: Crc32Context::new(),
            stats: FramerStats::default(),
        }
    }

    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    /// Drop any partial frame and hunt for the next SOF pair.
    pub fn reset(&mut self) {
        self.state = RxState::SearchSof1;
    }

    pub fn recv<H: FrameHandler>(&mut self, bytes: &[u8], handler: &mut H) {
        for &byte in bytes {
            self.recv_byte(byte, handler);
        }
    }

    pub fn recv_byte<H: FrameHandler>(&mut self, byte: u8, handler: &mut H) {
        match self.state {
            RxState::SearchSof1 => {
                if byte == SOF1 {
                    self.state = RxState::SearchSof2;
                }
                // Anything else is inter-frame noise; discard.
            }
            RxState::SearchSof2 => {
                if byte == SOF2 {
                    self.begin_frame();
                } else if byte == SOF1 {
                    // Runs of SOF1 between frames are legal.
                } else {
                    self.stats.rx_synchronization_errors =
                        self.stats.rx_synchronization_errors.wrapping_add(1);
                    self.state = RxState::SearchSof1;
                }
            }
            RxState::Header => self.header_byte(byte, handler),
            RxState::Payload => {
                self.payload[self.payload_count] = byte;
                self.payload_count += 1;
                self.crc.step(byte);
                if self.payload_count == self.payload_len {
                    self.crc_count = 0;
                    self.state = RxState::FrameCrc;
                }
            }
            RxState::FrameCrc => {
                self.crc_bytes[self.crc_count] = byte;
                self.crc_count += 1;
                if self.crc_count == CRC_SIZE {
                    self.finish_data_frame(handler);
                }
            }
            RxState::LinkFrame => self.link_frame_byte(byte, handler),
        }
    }

    fn begin_frame(&mut self) {
        self.header[0] = SOF1;
        self.header[1] = SOF2;
        self.header_count = 2;
        self.crc = Crc32Context::new();
        self.state = RxState::Header;
    }

    fn header_byte<H: FrameHandler>(&mut self, byte: u8, handler: &mut H) {
        self.header[self.header_count] = byte;
        self.header_count += 1;
        self.crc.step(byte);

        if self.header_count == 3 {
            let frame_type = byte & FRAME_TYPE_MASK;
            if frame_type == FRAME_TYPE_DATA {
                return;
            }
            if link_frame_type(frame_type).is_some() {
                self.state = RxState::LinkFrame;
                return;
            }
            warn!(
                target: self.name.as_str(),
                "undefined frame type {:#05b}, resynchronizing", frame_type
            );
            self.stats.rx_synchronization_errors =
                self.stats.rx_synchronization_errors.wrapping_add(1);
            self.state = RxState::SearchSof1;
            handler.on_frame_error();
            return;
        }

        if self.header_count == HEADER_SIZE {
            self.payload_len = self.header[3] as usize + 1;
            self.payload_count = 0;
            self.state = RxState::Payload;
        }
    }

    fn finish_data_frame<H: FrameHandler>(&mut self, handler: &mut H) {
        self.state = RxState::SearchSof1;
        let received = codec::decode_u32_le(&self.crc_bytes);
        let computed = self.crc.finalize();
        if received != computed {
            warn!(
                target: self.name.as_str(),
                "frame crc mismatch: computed {:#010x}, received {:#010x}", computed, received
            );
            self.stats.rx_mic_errors = self.stats.rx_mic_errors.wrapping_add(1);
            handler.on_frame_error();
            return;
        }
        let frame_id = unpack_frame_id(self.header[2], self.header[4]);
        let metadata = (self.header[5] as u32)
            | ((self.header[6] as u32) << 8)
            | ((self.header[7] as u32) << 16);
        self.stats.rx_count = self.stats.rx_count.wrapping_add(1);
        trace!(
            target: self.name.as_str(),
            "rx data frame id={} len={}", frame_id, self.payload_len
        );
        handler.on_frame(frame_id, metadata, &self.payload[..self.payload_len]);
    }

    fn link_frame_byte<H: FrameHandler>(&mut self, byte: u8, handler: &mut H) {
        if self.header_count < 4 {
            self.header[self.header_count] = byte;
            self.header_count += 1;
            self.crc.step(byte);
            self.crc_count = 0;
            return;
        }
        self.crc_bytes[self.crc_count] = byte;
        self.crc_count += 1;
        if self.crc_count < CRC_SIZE {
            return;
        }

        self.state = RxState::SearchSof1;
        let received = codec::decode_u32_le(&self.crc_bytes);
        let computed = self.crc.finalize();
        if received != computed {
            warn!(
                target: self.name.as_str(),
                "link frame crc mismatch: computed {:#010x}, received {:#010x}",
                computed,
                received
            );
            self.stats.rx_mic_errors = self.stats.rx_mic_errors.wrapping_add(1);
            handler.on_frame_error();
            return;
        }
        let frame_id = unpack_frame_id(self.header[2], self.header[3]);
        self.stats.rx_count = self.stats.rx_count.wrapping_add(1);
        let frame_type = link_frame_type(self.header[2] & FRAME_TYPE_MASK);
        trace!(
            target: self.name.as_str(),
            "rx link frame {:?} id={}", frame_type, frame_id
        );
        match frame_type {
            Some(LinkFrameType::AckAll) => handler.on_ack(AckKind::All, frame_id),
            Some(LinkFrameType::AckOne) => handler.on_ack(AckKind::One, frame_id),
            Some(LinkFrameType::NackFrameId) => handler.on_nack(NackCause::FrameId, frame_id),
            Some(LinkFrameType::NackFramingError) => {
                handler.on_nack(NackCause::FramingError, frame_id)
            }
            Some(LinkFrameType::Reset) => handler.on_reset(frame_id),
            // Unreachable: the type was validated on entry to LinkFrame.
            None => handler.on_frame_error(),
        }
    }
}

fn link_frame_type(bits: u8) -> Option<LinkFrameType> {
    match bits {
        0b100 => Some(LinkFrameType::AckAll),
        0b101 => Some(LinkFrameType::AckOne),
        0b110 => Some(LinkFrameType::NackFrameId),
        0b111 => Some(LinkFrameType::NackFramingError),
        0b010 => Some(LinkFrameType::Reset),
        _ => None,
    }
}

fn unpack_frame_id(type_byte: u8, low_byte: u8) -> u16 {
    (((type_byte >> FRAME_ID_HIGH_SHIFT) as u16) << 8) | low_byte as u16
}

fn pack_type_byte(frame_type: u8, frame_id: u16) -> u8 {
    (((frame_id >> 8) as u8) << FRAME_ID_HIGH_SHIFT) | (frame_type & FRAME_TYPE_MASK)
}

/// Build a data frame into `out` (cleared first).
///
/// Building is a pure function of its arguments, so a retransmission is
/// byte-identical to the original transmission.
pub fn build_data_frame(
    frame_id: u16,
    metadata: u32,
    payload: &[u8],
    out: &mut Vec<u8>,
) -> Result<(), Error> {
    if frame_id >= FRAME_ID_MAX || metadata >= METADATA_MAX {
        return Err(Error::ParameterInvalid);
    }
    if payload.is_empty() || payload.len() > PAYLOAD_MAX {
        return Err(Error::ParameterInvalid);
    }
    out.clear();
    out.push(SOF1);
    out.push(SOF2);
    out.push(pack_type_byte(FRAME_TYPE_DATA, frame_id));
    out.push((payload.len() - 1) as u8);
    out.push(frame_id as u8);
    out.push(metadata as u8);
    out.push((metadata >> 8) as u8);
    out.push((metadata >> 16) as u8);
    out.extend_from_slice(payload);
    let crc = crate::crc::crc32(0, &out[2..]);
    let mut tail = [0u8; CRC_SIZE];
    codec::encode_u32_le(&mut tail, crc);
    out.extend_from_slice(&tail);
    Ok(())
}

/// Build an ack, nack, or reset frame. The id is masked to 11 bits.
pub fn build_link_frame(frame_type: LinkFrameType, frame_id: u16) -> [u8; LINK_FRAME_SIZE] {
    let frame_id = frame_id & (FRAME_ID_MAX - 1);
    let mut out = [0u8; LINK_FRAME_SIZE];
    out[0] = SOF1;
    out[1] = SOF2;
    out[2] = pack_type_byte(frame_type as u8, frame_id);
    out[3] = frame_id as u8;
    let crc = crate::crc::crc32(0, &out[2..4]);
    codec::encode_u32_le(&mut out[4..], crc);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Trace {
        frames: Vec<(u16, u32, Vec<u8>)>,
        acks: Vec<(AckKind, u16)>,
        nacks: Vec<(NackCause, u16)>,
        resets: Vec<u16>,
        errors: u32,
    }

    impl FrameHandler for Trace {
        fn on_frame(&mut self, frame_id: u16, metadata: u32, payload: &[u8]) {
            self.frames.push((frame_id, metadata, payload.to_vec()));
        }
        fn on_ack(&mut self, kind: AckKind, frame_id: u16) {
            self.acks.push((kind, frame_id));
        }
        fn on_nack(&mut self, cause: NackCause, frame_id: u16) {
            self.nacks.push((cause, frame_id));
        }
        fn on_reset(&mut self, frame_id: u16) {
            self.resets.push(frame_id);
        }
        fn on_frame_error(&mut self) {
            self.errors += 1;
        }
    }

    fn data_frame(frame_id: u16, metadata: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        build_data_frame(frame_id, metadata, payload, &mut out).unwrap();
        out
    }

    #[test]
    fn data_frame_layout() {
        let frame = data_frame(0x0123, 0x00aa_bb41, &[9, 8, 7]);
        assert_eq!(frame.len(), HEADER_SIZE + 3 + CRC_SIZE);
        assert_eq!(frame[0], SOF1);
        assert_eq!(frame[1], SOF2);
        // frame_id 0x123: high bits 0b001 in bits 7:5, type 0b000 below.
        assert_eq!(frame[2], 0b0010_0000);
        assert_eq!(frame[3], 2);
        assert_eq!(frame[4], 0x23);
        assert_eq!(&frame[5..8], &[0x41, 0xbb, 0xaa]);
        assert_eq!(&frame[8..11], &[9, 8, 7]);
    }

    #[test]
    fn parse_build_round_trip() {
        let payload: Vec<u8> = (0..=255).collect();
        let frame = data_frame(2047, 0x00ff_ffff, &payload);
        let mut framer = Framer::new("rx");
        let mut trace = Trace::default();
        framer.recv(&frame, &mut trace);
        assert_eq!(trace.frames.len(), 1);
        let (id, metadata, got) = &trace.frames[0];
        assert_eq!(*id, 2047);
        assert_eq!(*metadata, 0x00ff_ffff);
        assert_eq!(got, &payload);
        assert_eq!(framer.stats().rx_count, 1);
        assert_eq!(framer.stats().rx_synchronization_errors, 0);
    }

    #[test]
    fn link_frame_round_trip() {
        let mut framer = Framer::new("rx");
        let mut trace = Trace::default();
        framer.recv(&build_link_frame(LinkFrameType::AckAll, 7), &mut trace);
        framer.recv(&build_link_frame(LinkFrameType::AckOne, 1500), &mut trace);
        framer.recv(&build_link_frame(LinkFrameType::NackFrameId, 9), &mut trace);
        framer.recv(
            &build_link_frame(LinkFrameType::NackFramingError, 10),
            &mut trace,
        );
        framer.recv(&build_link_frame(LinkFrameType::Reset, 0), &mut trace);
        assert_eq!(trace.acks, vec![(AckKind::All, 7), (AckKind::One, 1500)]);
        assert_eq!(
            trace.nacks,
            vec![(NackCause::FrameId, 9), (NackCause::FramingError, 10)]
        );
        assert_eq!(trace.resets, vec![0]);
        assert_eq!(trace.errors, 0);
    }

    #[test]
    fn sof1_run_is_tolerated() {
        let mut bytes = vec![SOF1, SOF1];
        bytes.extend_from_slice(&data_frame(0, 0x41, &[1, 2, 3, 4]));
        let mut framer = Framer::new("rx");
        let mut trace = Trace::default();
        framer.recv(&bytes, &mut trace);
        assert_eq!(trace.frames.len(), 1);
        assert_eq!(framer.stats().rx_synchronization_errors, 0);
    }

    #[test]
    fn garbage_between_frames_resynchronizes() {
        let mut bytes = vec![0x12, 0x34, SOF1, 0x77];
        bytes.extend_from_slice(&data_frame(5, 0x41, &[1]));
        let mut framer = Framer::new("rx");
        let mut trace = Trace::default();
        framer.recv(&bytes, &mut trace);
        assert_eq!(trace.frames.len(), 1);
        assert_eq!(trace.frames[0].0, 5);
        assert_eq!(framer.stats().rx_synchronization_errors, 1);
    }

    #[test]
    fn corrupt_payload_is_one_frame_error() {
        let mut frame = data_frame(3, 0x41, &[1, 2, 3, 4, 5, 6, 7, 8]);
        frame[9] ^= 0x10;
        let mut framer = Framer::new("rx");
        let mut trace = Trace::default();
        framer.recv(&frame, &mut trace);
        assert!(trace.frames.is_empty());
        assert_eq!(trace.errors, 1);
        assert_eq!(framer.stats().rx_mic_errors, 1);
    }

    #[test]
    fn corrupt_header_is_one_frame_error() {
        let mut frame = data_frame(3, 0x0000_0341, &[1, 2, 3, 4, 5, 6, 7, 8]);
        frame[6] ^= 0x01; // metadata octet participates in the CRC
        let mut framer = Framer::new("rx");
        let mut trace = Trace::default();
        framer.recv(&frame, &mut trace);
        assert!(trace.frames.is_empty());
        assert_eq!(trace.errors, 1);
        assert_eq!(framer.stats().rx_mic_errors, 1);
    }

    #[test]
    fn stray_sof_inside_payload_does_not_resync() {
        let payload = [SOF1, SOF2, SOF1, SOF2, 0xaa];
        let frame = data_frame(9, 0x41, &payload);
        let mut framer = Framer::new("rx");
        let mut trace = Trace::default();
        framer.recv(&frame, &mut trace);
        assert_eq!(trace.frames.len(), 1);
        assert_eq!(trace.frames[0].2, payload.to_vec());
        assert_eq!(framer.stats().rx_synchronization_errors, 0);
    }

    #[test]
    fn split_delivery_across_calls() {
        let frame = data_frame(11, 0x42, &[1, 2, 3, 4, 5]);
        let mut framer = Framer::new("rx");
        let mut trace = Trace::default();
        for chunk in frame.chunks(3) {
            framer.recv(chunk, &mut trace);
        }
        assert_eq!(trace.frames.len(), 1);
        assert_eq!(trace.frames[0].0, 11);
    }

    #[test]
    fn undefined_frame_type_aborts() {
        let mut bytes = vec![SOF1, SOF2, 0b0000_0001];
        bytes.extend_from_slice(&data_frame(0, 0x41, &[1]));
        let mut framer = Framer::new("rx");
        let mut trace = Trace::default();
        framer.recv(&bytes, &mut trace);
        assert_eq!(trace.errors, 1);
        assert_eq!(trace.frames.len(), 1);
        assert_eq!(framer.stats().rx_synchronization_errors, 1);
    }

    #[test]
    fn builder_rejects_bad_parameters() {
        let mut out = Vec::new();
        assert!(build_data_frame(FRAME_ID_MAX, 0, &[1], &mut out).is_err());
        assert!(build_data_frame(0, METADATA_MAX, &[1], &mut out).is_err());
        assert!(build_data_frame(0, 0, &[], &mut out).is_err());
        assert!(build_data_frame(0, 0, &[0u8; PAYLOAD_MAX + 1], &mut out).is_err());
    }

    #[test]
    fn trailing_sof_is_ignored() {
        let mut bytes = data_frame(1, 0x41, &[0xde, 0xad]);
        bytes.push(SOF1);
        let mut framer = Framer::new("rx");
        let mut trace = Trace::default();
        framer.recv(&bytes, &mut trace);
        assert_eq!(trace.frames.len(), 1);
        assert_eq!(framer.stats().rx_synchronization_errors, 0);
    }
}
