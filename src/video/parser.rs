//! Video elementary-stream parsing
//!
//! Splits the incoming byte stream into whole NAL units, classifies them,
//! and tracks the current parameter sets. The stream arrives either as a
//! bare Annex-B stream or wrapped in scrcpy's per-packet framing
//! (`[8B pts+flags][4B size][payload]`), chosen per session; the two are
//! never mixed within one connection.

use crate::core::config::VideoCodec;
use crate::log_warn;

const START_CODE_4: &[u8] = &[0, 0, 0, 1];
const START_CODE_3: &[u8] = &[0, 0, 1];
/// Anything above this is treated as stream corruption, not a packet.
const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;
/// Unparsable data beyond this point is dropped to keep memory bounded.
const MAX_PENDING_BYTES: usize = 4 * 1024 * 1024;
/// Compact the internal buffer once the dead prefix grows past this.
const COMPACT_THRESHOLD: usize = 64 * 1024;

/// How NAL units are delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFraming {
    /// Raw Annex-B stream, NALs delimited by start codes.
    AnnexB,
    /// scrcpy packet framing. When `metadata_prologue` is set the stream
    /// opens with `[4B codec id][4B width][4B height]`.
    Framed { metadata_prologue: bool },
}

/// Codec id and initial dimensions sent ahead of the first packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamMetadata {
    pub codec_id: u32,
    pub width: u32,
    pub height: u32,
}

/// One whole NAL unit, start code included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalUnit {
    pub codec: VideoCodec,
    pub nal_type: u8,
    pub data: Vec<u8>,
}

impl NalUnit {
    fn from_bytes(codec: VideoCodec, data: Vec<u8>) -> Option<Self> {
        let payload = strip_start_code(&data);
        let first = *payload.first()?;
        let nal_type = match codec {
            VideoCodec::H264 => first & 0x1F,
            VideoCodec::H265 => {
                // Two-byte header; require it to be whole.
                if payload.len() < 2 {
                    return None;
                }
                (first >> 1) & 0x3F
            }
        };
        Some(Self {
            codec,
            nal_type,
            data,
        })
    }

    /// NAL bytes without the Annex-B start code.
    pub fn payload(&self) -> &[u8] {
        strip_start_code(&self.data)
    }

    pub fn is_parameter_set(&self) -> bool {
        match self.codec {
            VideoCodec::H264 => matches!(self.nal_type, 7 | 8),
            VideoCodec::H265 => matches!(self.nal_type, 32 | 33 | 34),
        }
    }

    pub fn is_sps(&self) -> bool {
        match self.codec {
            VideoCodec::H264 => self.nal_type == 7,
            VideoCodec::H265 => self.nal_type == 33,
        }
    }

    /// Whether this NAL carries picture data.
    pub fn is_vcl(&self) -> bool {
        match self.codec {
            VideoCodec::H264 => matches!(self.nal_type, 1 | 5),
            VideoCodec::H265 => self.nal_type <= 31,
        }
    }
}

fn strip_start_code(data: &[u8]) -> &[u8] {
    if data.starts_with(START_CODE_4) {
        &data[4..]
    } else if data.starts_with(START_CODE_3) {
        &data[3..]
    } else {
        data
    }
}

/// Position and length of an Annex-B start code.
struct StartCode {
    pos: usize,
    len: usize,
}

/// Find the next 3- or 4-byte start code. A zero immediately before
/// `00 00 01` belongs to the code, not to the preceding NAL.
fn find_start_code(data: &[u8]) -> Option<StartCode> {
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if i > 0 && data[i - 1] == 0 {
                return Some(StartCode {
                    pos: i - 1,
                    len: 4,
                });
            }
            return Some(StartCode { pos: i, len: 3 });
        }
        i += 1;
    }
    None
}

/// The current SPS/PPS (and VPS for H.265).
pub struct ParameterSetCache {
    codec: VideoCodec,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    vps: Option<Vec<u8>>,
}

impl ParameterSetCache {
    pub fn new(codec: VideoCodec) -> Self {
        Self {
            codec,
            sps: None,
            pps: None,
            vps: None,
        }
    }

    /// Payload bytes (no start code) of the stored sets.
    pub fn sps(&self) -> Option<&[u8]> {
        self.sps.as_deref()
    }

    pub fn pps(&self) -> Option<&[u8]> {
        self.pps.as_deref()
    }

    pub fn vps(&self) -> Option<&[u8]> {
        self.vps.as_deref()
    }

    /// True when every set the codec requires is present.
    pub fn is_complete(&self) -> bool {
        match self.codec {
            VideoCodec::H264 => self.sps.is_some() && self.pps.is_some(),
            VideoCodec::H265 => self.vps.is_some() && self.sps.is_some() && self.pps.is_some(),
        }
    }

    fn clear(&mut self) {
        self.sps = None;
        self.pps = None;
        self.vps = None;
    }
}

/// Incremental NAL-unit extractor with a parameter-set cache.
pub struct VideoStreamParser {
    codec: VideoCodec,
    framing: VideoFraming,
    buf: Vec<u8>,
    head: usize,
    awaiting_prologue: bool,
    sets: ParameterSetCache,
    sps_handler: Option<Box<dyn FnMut(&[u8]) + Send>>,
    metadata_handler: Option<Box<dyn FnMut(StreamMetadata) + Send>>,
    nal_count: u64,
}

impl VideoStreamParser {
    pub fn new(codec: VideoCodec, framing: VideoFraming) -> Self {
        Self {
            codec,
            framing,
            buf: Vec::with_capacity(256 * 1024),
            head: 0,
            awaiting_prologue: matches!(
                framing,
                VideoFraming::Framed {
                    metadata_prologue: true
                }
            ),
            sets: ParameterSetCache::new(codec),
            sps_handler: None,
            metadata_handler: None,
            nal_count: 0,
        }
    }

    /// Called with the new SPS payload whenever its bytes differ from the
    /// stored one (rotation, resolution change).
    pub fn set_sps_handler(&mut self, handler: Box<dyn FnMut(&[u8]) + Send>) {
        self.sps_handler = Some(handler);
    }

    pub fn set_metadata_handler(&mut self, handler: Box<dyn FnMut(StreamMetadata) + Send>) {
        self.metadata_handler = Some(handler);
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn parameter_sets(&self) -> &ParameterSetCache {
        &self.sets
    }

    pub fn has_complete_parameter_sets(&self) -> bool {
        self.sets.is_complete()
    }

    pub fn nal_count(&self) -> u64 {
        self.nal_count
    }

    /// Feed stream bytes; returns every NAL unit completed by this append.
    /// No NAL is returned before its terminating boundary has arrived.
    pub fn append(&mut self, bytes: &[u8]) -> Vec<NalUnit> {
        self.buf.extend_from_slice(bytes);

        let mut out = Vec::new();
        match self.framing {
            VideoFraming::AnnexB => self.scan_annex_b(&mut out),
            VideoFraming::Framed { .. } => self.scan_framed(&mut out),
        }
        self.compact();
        out
    }

    /// Drop buffered bytes and forget the parameter sets. The codec and
    /// framing configuration survive.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.head = 0;
        self.sets.clear();
        self.awaiting_prologue = matches!(
            self.framing,
            VideoFraming::Framed {
                metadata_prologue: true
            }
        );
    }

    fn scan_annex_b(&mut self, out: &mut Vec<NalUnit>) {
        loop {
            let data = &self.buf[self.head..];
            let first = match find_start_code(data) {
                Some(sc) => sc,
                None => {
                    // Keep a potential partial start code at the tail.
                    if data.len() > 3 {
                        self.head += data.len() - 3;
                    }
                    break;
                }
            };
            if first.pos > 0 {
                // Garbage before the start code.
                self.head += first.pos;
                continue;
            }
            let next = match find_start_code(&data[first.len..]) {
                Some(sc) => sc,
                None => {
                    if data.len() > MAX_PENDING_BYTES {
                        log_warn!("VPARSE", "Unterminated NAL exceeded buffer limit, dropping");
                        self.head += data.len() - 3;
                    }
                    break;
                }
            };
            let end = first.len + next.pos;
            let nal = data[..end].to_vec();
            self.head += end;
            self.accept_nal(nal, out);
        }
    }

    fn scan_framed(&mut self, out: &mut Vec<NalUnit>) {
        if self.awaiting_prologue {
            if self.buf.len() - self.head < 12 {
                return;
            }
            let data = &self.buf[self.head..self.head + 12];
            let meta = StreamMetadata {
                codec_id: u32::from_be_bytes(data[0..4].try_into().unwrap()),
                width: u32::from_be_bytes(data[4..8].try_into().unwrap()),
                height: u32::from_be_bytes(data[8..12].try_into().unwrap()),
            };
            self.head += 12;
            self.awaiting_prologue = false;
            if let Some(handler) = self.metadata_handler.as_mut() {
                handler(meta);
            }
        }

        while self.buf.len() - self.head >= 12 {
            let data = &self.buf[self.head..];
            let size = u32::from_be_bytes(data[8..12].try_into().unwrap()) as usize;
            if size > MAX_PACKET_SIZE {
                // Corrupt header; skip it and resynchronize.
                log_warn!("VPARSE", "Dropping packet header with size {}", size);
                self.head += 12;
                continue;
            }
            if data.len() < 12 + size {
                break;
            }
            let payload = data[12..12 + size].to_vec();
            self.head += 12 + size;
            self.split_packet_payload(payload, out);
        }
    }

    /// A framed payload is either an Annex-B run (possibly several NALs,
    /// e.g. SPS+PPS in one config packet) or a bare NAL without start
    /// codes, depending on the agent version.
    fn split_packet_payload(&mut self, payload: Vec<u8>, out: &mut Vec<NalUnit>) {
        if payload.is_empty() {
            return;
        }
        if !(payload.starts_with(START_CODE_3) || payload.starts_with(START_CODE_4)) {
            let mut data = Vec::with_capacity(payload.len() + 4);
            data.extend_from_slice(START_CODE_4);
            data.extend_from_slice(&payload);
            self.accept_nal(data, out);
            return;
        }
        let mut rest = &payload[..];
        while let Some(first) = find_start_code(rest) {
            let begin = first.pos;
            let body = &rest[begin + first.len..];
            let end = match find_start_code(body) {
                Some(next) => begin + first.len + next.pos,
                None => rest.len(),
            };
            self.accept_nal(rest[begin..end].to_vec(), out);
            rest = &rest[end..];
            if rest.is_empty() {
                break;
            }
        }
    }

    fn accept_nal(&mut self, data: Vec<u8>, out: &mut Vec<NalUnit>) {
        let nal = match NalUnit::from_bytes(self.codec, data) {
            Some(nal) => nal,
            None => return,
        };
        self.nal_count += 1;
        self.track_parameter_set(&nal);
        out.push(nal);
    }

    fn track_parameter_set(&mut self, nal: &NalUnit) {
        if !nal.is_parameter_set() {
            return;
        }
        let payload = nal.payload().to_vec();
        match (self.codec, nal.nal_type) {
            (VideoCodec::H264, 7) | (VideoCodec::H265, 33) => {
                let changed = self.sets.sps.as_deref() != Some(payload.as_slice());
                if changed {
                    self.sets.sps = Some(payload.clone());
                    // The old PPS belongs to the old SPS; reconfiguration
                    // waits for the matching one.
                    self.sets.pps = None;
                    if let Some(handler) = self.sps_handler.as_mut() {
                        handler(&payload);
                    }
                }
            }
            (VideoCodec::H264, 8) | (VideoCodec::H265, 34) => {
                self.sets.pps = Some(payload);
            }
            (VideoCodec::H265, 32) => {
                self.sets.vps = Some(payload);
            }
            _ => {}
        }
    }

    /// Reclaim the consumed prefix once it is large enough to matter.
    fn compact(&mut self) {
        if self.head == self.buf.len() {
            self.buf.clear();
            self.head = 0;
        } else if self.head > COMPACT_THRESHOLD {
            self.buf.drain(..self.head);
            self.head = 0;
        }
    }
}
