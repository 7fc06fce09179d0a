//! Audio stream demultiplexing
//!
//! The audio connection opens with a 4-byte big-endian codec id, then
//! carries framed packets `[8B pts+flags BE][4B size BE][payload]`. Bit 63
//! of the first word flags a config packet, bit 62 a key frame, and the
//! remaining 62 bits are the PTS in microseconds. Nothing is emitted until
//! a packet is complete; malformed headers advance the buffer without
//! emission.

use crate::log_warn;

pub const FLAG_CONFIG: u64 = 1 << 63;
pub const FLAG_KEY_FRAME: u64 = 1 << 62;
pub const PTS_MASK: u64 = (1 << 62) - 1;

/// Refuse packets larger than this; the header is treated as corrupt.
const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Audio codec identifiers as sent on the wire (big-endian ASCII fourcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodecId {
    Opus,
    Aac,
    Flac,
    Raw,
    Unknown(u32),
}

impl AudioCodecId {
    pub const OPUS: u32 = 0x6F70_7573; // "opus"
    pub const AAC: u32 = 0x0061_6163; // "\0aac"
    pub const FLAC: u32 = 0x666C_6163; // "flac"
    pub const RAW: u32 = 0x0072_6177; // "\0raw"

    pub fn from_raw(raw: u32) -> Self {
        match raw {
            Self::OPUS => AudioCodecId::Opus,
            Self::AAC => AudioCodecId::Aac,
            Self::FLAC => AudioCodecId::Flac,
            Self::RAW => AudioCodecId::Raw,
            other => AudioCodecId::Unknown(other),
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            AudioCodecId::Opus => Self::OPUS,
            AudioCodecId::Aac => Self::AAC,
            AudioCodecId::Flac => Self::FLAC,
            AudioCodecId::Raw => Self::RAW,
            AudioCodecId::Unknown(other) => other,
        }
    }
}

/// One demultiplexed audio packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    pub pts_us: u64,
    pub is_config: bool,
    pub is_key: bool,
    pub payload: Vec<u8>,
}

enum ParseState {
    NeedCodecId,
    NeedPacket,
}

/// Incremental parser for the scrcpy audio stream.
pub struct AudioStreamParser {
    state: ParseState,
    buf: Vec<u8>,
    head: usize,
    codec_id: Option<AudioCodecId>,
    codec_handler: Option<Box<dyn FnMut(AudioCodecId) + Send>>,
    config_handler: Option<Box<dyn FnMut(&[u8], AudioCodecId) + Send>>,
    packet_handler: Option<Box<dyn FnMut(AudioPacket) + Send>>,
    packet_count: u64,
}

impl AudioStreamParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::NeedCodecId,
            buf: Vec::with_capacity(16 * 1024),
            head: 0,
            codec_id: None,
            codec_handler: None,
            config_handler: None,
            packet_handler: None,
            packet_count: 0,
        }
    }

    pub fn set_codec_handler(&mut self, handler: Box<dyn FnMut(AudioCodecId) + Send>) {
        self.codec_handler = Some(handler);
    }

    pub fn set_config_handler(&mut self, handler: Box<dyn FnMut(&[u8], AudioCodecId) + Send>) {
        self.config_handler = Some(handler);
    }

    pub fn set_packet_handler(&mut self, handler: Box<dyn FnMut(AudioPacket) + Send>) {
        self.packet_handler = Some(handler);
    }

    pub fn codec_id(&self) -> Option<AudioCodecId> {
        self.codec_id
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    /// Feed stream bytes, firing handlers for everything completed.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);

        if matches!(self.state, ParseState::NeedCodecId) {
            if self.remaining() < 4 {
                return;
            }
            let raw = u32::from_be_bytes(self.buf[self.head..self.head + 4].try_into().unwrap());
            self.head += 4;
            let id = AudioCodecId::from_raw(raw);
            self.codec_id = Some(id);
            self.state = ParseState::NeedPacket;
            if let Some(handler) = self.codec_handler.as_mut() {
                handler(id);
            }
        }

        while self.remaining() >= 12 {
            let data = &self.buf[self.head..];
            let pts_and_flags = u64::from_be_bytes(data[0..8].try_into().unwrap());
            let size = u32::from_be_bytes(data[8..12].try_into().unwrap()) as usize;
            if size > MAX_PACKET_SIZE {
                log_warn!("APARSE", "Dropping audio header with size {}", size);
                self.head += 12;
                continue;
            }
            if data.len() < 12 + size {
                break;
            }
            let payload = data[12..12 + size].to_vec();
            self.head += 12 + size;
            self.packet_count += 1;

            let packet = AudioPacket {
                pts_us: pts_and_flags & PTS_MASK,
                is_config: pts_and_flags & FLAG_CONFIG != 0,
                is_key: pts_and_flags & FLAG_KEY_FRAME != 0,
                payload,
            };
            if packet.is_config {
                if let (Some(handler), Some(id)) = (self.config_handler.as_mut(), self.codec_id) {
                    handler(&packet.payload, id);
                }
            }
            if let Some(handler) = self.packet_handler.as_mut() {
                handler(packet);
            }
        }
        self.compact();
    }

    pub fn reset(&mut self) {
        self.state = ParseState::NeedCodecId;
        self.buf.clear();
        self.head = 0;
        self.codec_id = None;
        self.packet_count = 0;
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.head
    }

    fn compact(&mut self) {
        if self.head == self.buf.len() {
            self.buf.clear();
            self.head = 0;
        } else if self.head > 16 * 1024 {
            self.buf.drain(..self.head);
            self.head = 0;
        }
    }
}

impl Default for AudioStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode one framed packet; test and mock-agent helper.
pub fn encode_packet(pts_us: u64, is_config: bool, is_key: bool, payload: &[u8]) -> Vec<u8> {
    let mut word = pts_us & PTS_MASK;
    if is_config {
        word |= FLAG_CONFIG;
    }
    if is_key {
        word |= FLAG_KEY_FRAME;
    }
    let mut out = Vec::with_capacity(12 + payload.len());
    out.extend_from_slice(&word.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn collecting_parser() -> (AudioStreamParser, Arc<Mutex<Vec<AudioPacket>>>) {
        let mut parser = AudioStreamParser::new();
        let packets = Arc::new(Mutex::new(Vec::new()));
        let packets_clone = packets.clone();
        parser.set_packet_handler(Box::new(move |p| {
            packets_clone.lock().unwrap().push(p);
        }));
        (parser, packets)
    }

    #[test]
    fn codec_id_is_parsed_once() {
        let (mut parser, _) = collecting_parser();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        parser.set_codec_handler(Box::new(move |id| {
            seen_clone.lock().unwrap().push(id);
        }));

        parser.append(&AudioCodecId::OPUS.to_be_bytes()[..2]);
        assert!(seen.lock().unwrap().is_empty());
        parser.append(&AudioCodecId::OPUS.to_be_bytes()[2..]);
        assert_eq!(*seen.lock().unwrap(), vec![AudioCodecId::Opus]);
        assert_eq!(parser.codec_id(), Some(AudioCodecId::Opus));
    }

    #[test]
    fn raw_codec_id_matches_wire_value() {
        assert_eq!(AudioCodecId::RAW, 0x0072_6177);
        assert_eq!(AudioCodecId::from_raw(0x0072_6177), AudioCodecId::Raw);
        assert_eq!(AudioCodecId::from_raw(0x6F70_7573), AudioCodecId::Opus);
        assert!(matches!(
            AudioCodecId::from_raw(0xDEAD_BEEF),
            AudioCodecId::Unknown(0xDEAD_BEEF)
        ));
    }

    #[test]
    fn round_trips_flags_and_pts() {
        let (mut parser, packets) = collecting_parser();
        let mut stream = AudioCodecId::AAC.to_be_bytes().to_vec();
        stream.extend_from_slice(&encode_packet(0, true, false, &[0x12, 0x10]));
        stream.extend_from_slice(&encode_packet(20_000, false, true, &[1, 2, 3]));
        stream.extend_from_slice(&encode_packet(PTS_MASK, false, false, &[]));
        parser.append(&stream);

        let packets = packets.lock().unwrap();
        assert_eq!(packets.len(), 3);
        assert!(packets[0].is_config);
        assert_eq!(packets[0].payload, vec![0x12, 0x10]);
        assert!(packets[1].is_key);
        assert_eq!(packets[1].pts_us, 20_000);
        assert_eq!(packets[2].pts_us, PTS_MASK);
    }

    #[test]
    fn config_handler_receives_codec_id() {
        let (mut parser, _) = collecting_parser();
        let configs = Arc::new(Mutex::new(Vec::new()));
        let configs_clone = configs.clone();
        parser.set_config_handler(Box::new(move |payload, id| {
            configs_clone.lock().unwrap().push((payload.to_vec(), id));
        }));

        let mut stream = AudioCodecId::AAC.to_be_bytes().to_vec();
        stream.extend_from_slice(&encode_packet(0, true, false, &[0x11, 0x90]));
        parser.append(&stream);

        let configs = configs.lock().unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].0, vec![0x11, 0x90]);
        assert_eq!(configs[0].1, AudioCodecId::Aac);
    }

    #[test]
    fn truncated_packet_is_never_emitted_early() {
        let (mut parser, packets) = collecting_parser();
        let mut stream = AudioCodecId::RAW.to_be_bytes().to_vec();
        stream.extend_from_slice(&encode_packet(1_000, false, false, &[9, 9, 9, 9]));

        // Feed everything except the last payload byte.
        parser.append(&stream[..stream.len() - 1]);
        assert!(packets.lock().unwrap().is_empty());

        // The final byte completes the packet.
        parser.append(&stream[stream.len() - 1..]);
        let packets = packets.lock().unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload, vec![9, 9, 9, 9]);
    }

    #[test]
    fn byte_at_a_time_feed_recovers_all_packets() {
        let (mut parser, packets) = collecting_parser();
        let mut stream = AudioCodecId::OPUS.to_be_bytes().to_vec();
        for k in 0..5u64 {
            stream.extend_from_slice(&encode_packet(k * 20_000, false, false, &[k as u8; 7]));
        }
        for byte in &stream {
            parser.append(std::slice::from_ref(byte));
        }
        let packets = packets.lock().unwrap();
        assert_eq!(packets.len(), 5);
        for (k, p) in packets.iter().enumerate() {
            assert_eq!(p.pts_us, k as u64 * 20_000);
            assert_eq!(p.payload, vec![k as u8; 7]);
        }
    }

    #[test]
    fn oversized_header_is_skipped() {
        let (mut parser, packets) = collecting_parser();
        let mut stream = AudioCodecId::RAW.to_be_bytes().to_vec();
        stream.extend_from_slice(&u64::to_be_bytes(0));
        stream.extend_from_slice(&u32::to_be_bytes(u32::MAX));
        stream.extend_from_slice(&encode_packet(5, false, false, &[1]));
        parser.append(&stream);

        let packets = packets.lock().unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].pts_us, 5);
    }

    #[test]
    fn reset_returns_to_codec_id_state() {
        let (mut parser, packets) = collecting_parser();
        let mut stream = AudioCodecId::RAW.to_be_bytes().to_vec();
        stream.extend_from_slice(&encode_packet(1, false, false, &[1, 2]));
        parser.append(&stream);
        assert_eq!(packets.lock().unwrap().len(), 1);

        parser.reset();
        assert!(parser.codec_id().is_none());
        let mut stream = AudioCodecId::OPUS.to_be_bytes().to_vec();
        stream.extend_from_slice(&encode_packet(2, false, false, &[3]));
        parser.append(&stream);
        assert_eq!(parser.codec_id(), Some(AudioCodecId::Opus));
        assert_eq!(packets.lock().unwrap().len(), 2);
    }
}
