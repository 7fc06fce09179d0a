//! Audio decoding
//!
//! One decoder per codec, all emitting interleaved Float32 PCM. RAW is a
//! plain i16 -> f32 conversion; OPUS is self-describing from the payload;
//! AAC needs the one-time AudioSpecificConfig packet before any frame can
//! be decoded. Codec backends are feature-gated; when a backend is
//! compiled out its decoder reports an initialization failure and the
//! session carries on without audio.

use crate::audio::parser::AudioCodecId;
use crate::core::error::{MirrorError, Result};
use crate::log_verbose;

pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_CHANNELS: u16 = 2;

/// Output format of a decoder: interleaved f32 at this rate/layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
        }
    }
}

/// Decodes one codec payload per call to interleaved Float32 PCM.
pub trait AudioDecoder: Send {
    fn initialize(&mut self, sample_rate: u32, channels: u16) -> Result<()>;

    /// Handle the stream's config packet. A no-op for RAW, informational
    /// for OPUS, and the AudioSpecificConfig for AAC.
    fn process_config_packet(&mut self, payload: &[u8]) -> Result<()>;

    fn decode(&mut self, payload: &[u8], pts_us: u64, is_key: bool) -> Result<Vec<f32>>;

    fn reset(&mut self);

    fn output_format(&self) -> AudioFormat;
}

/// Build the decoder for a parsed codec id. FLAC is recognized on the
/// wire but has no decode path here.
pub fn create_audio_decoder(id: AudioCodecId) -> Result<Box<dyn AudioDecoder>> {
    match id {
        AudioCodecId::Raw => Ok(Box::new(RawAudioDecoder::new())),
        AudioCodecId::Opus => Ok(Box::new(OpusAudioDecoder::new())),
        AudioCodecId::Aac => Ok(Box::new(AacAudioDecoder::new())),
        AudioCodecId::Flac => Err(MirrorError::InitializationFailed(
            "flac streams are not supported".into(),
        )),
        AudioCodecId::Unknown(raw) => Err(MirrorError::InitializationFailed(format!(
            "unknown audio codec id {:#010x}",
            raw
        ))),
    }
}

// ---------------------------------------------------------------------------
// AudioSpecificConfig

/// Sample rates addressed by the 4-bit frequency index.
const ASC_SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

/// The first two bytes of an MPEG-4 AudioSpecificConfig: 5 bits of audio
/// object type, 4 bits of sample-rate index straddling the byte boundary,
/// 4 bits of channel configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    pub audio_object_type: u8,
    pub sample_rate_index: u8,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioSpecificConfig {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(MirrorError::InitializationFailed(format!(
                "AudioSpecificConfig too short: {} bytes",
                data.len()
            )));
        }
        let audio_object_type = data[0] >> 3;
        let sample_rate_index = ((data[0] & 0x07) << 1) | (data[1] >> 7);
        let channels = u16::from((data[1] >> 3) & 0x0F);

        let sample_rate = *ASC_SAMPLE_RATES
            .get(sample_rate_index as usize)
            .ok_or_else(|| {
                MirrorError::InitializationFailed(format!(
                    "unsupported sample-rate index {}",
                    sample_rate_index
                ))
            })?;
        if channels == 0 {
            return Err(MirrorError::InitializationFailed(
                "AudioSpecificConfig without channel configuration".into(),
            ));
        }

        Ok(Self {
            audio_object_type,
            sample_rate_index,
            sample_rate,
            channels,
        })
    }
}

// ---------------------------------------------------------------------------
// RAW

/// Little-endian signed 16-bit PCM to Float32.
pub struct RawAudioDecoder {
    format: AudioFormat,
}

impl RawAudioDecoder {
    pub fn new() -> Self {
        Self {
            format: AudioFormat::default(),
        }
    }
}

impl Default for RawAudioDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDecoder for RawAudioDecoder {
    fn initialize(&mut self, sample_rate: u32, channels: u16) -> Result<()> {
        self.format = AudioFormat {
            sample_rate,
            channels,
        };
        Ok(())
    }

    fn process_config_packet(&mut self, _payload: &[u8]) -> Result<()> {
        Ok(())
    }

    fn decode(&mut self, payload: &[u8], _pts_us: u64, _is_key: bool) -> Result<Vec<f32>> {
        let frame_bytes = usize::from(self.format.channels) * 2;
        if frame_bytes == 0 || payload.len() % frame_bytes != 0 {
            return Err(MirrorError::DecodeFailed(format!(
                "raw payload of {} bytes is not a whole number of {}-byte frames",
                payload.len(),
                frame_bytes
            )));
        }
        Ok(payload
            .chunks_exact(2)
            .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / 32768.0)
            .collect())
    }

    fn reset(&mut self) {}

    fn output_format(&self) -> AudioFormat {
        self.format
    }
}

// ---------------------------------------------------------------------------
// OPUS

#[cfg(feature = "opus")]
pub struct OpusAudioDecoder {
    decoder: Option<opus::Decoder>,
    format: AudioFormat,
}

#[cfg(feature = "opus")]
impl OpusAudioDecoder {
    /// Longest opus frame is 120 ms: 5760 samples per channel at 48 kHz.
    const MAX_FRAME_SAMPLES: usize = 5760;

    pub fn new() -> Self {
        Self {
            decoder: None,
            format: AudioFormat::default(),
        }
    }
}

#[cfg(feature = "opus")]
impl Default for OpusAudioDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "opus")]
impl AudioDecoder for OpusAudioDecoder {
    fn initialize(&mut self, sample_rate: u32, channels: u16) -> Result<()> {
        let opus_channels = match channels {
            1 => opus::Channels::Mono,
            2 => opus::Channels::Stereo,
            other => {
                return Err(MirrorError::InitializationFailed(format!(
                    "unsupported channel count {}",
                    other
                )))
            }
        };
        let decoder = opus::Decoder::new(sample_rate, opus_channels)
            .map_err(|e| MirrorError::InitializationFailed(format!("opus: {:?}", e)))?;
        self.decoder = Some(decoder);
        self.format = AudioFormat {
            sample_rate,
            channels,
        };
        Ok(())
    }

    fn process_config_packet(&mut self, payload: &[u8]) -> Result<()> {
        // The opus stream is self-describing; the config packet only
        // carries the OpusHead the agent saw.
        log_verbose!("AUDIO", "Opus config packet ({} bytes)", payload.len());
        Ok(())
    }

    fn decode(&mut self, payload: &[u8], _pts_us: u64, _is_key: bool) -> Result<Vec<f32>> {
        let channels = usize::from(self.format.channels);
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| MirrorError::DecodeFailed("opus decoder not initialized".into()))?;
        let mut pcm = vec![0f32; Self::MAX_FRAME_SAMPLES * channels];
        let samples = decoder
            .decode_float(payload, &mut pcm, false)
            .map_err(|e| MirrorError::DecodeFailed(format!("opus: {:?}", e)))?;
        pcm.truncate(samples * channels);
        Ok(pcm)
    }

    fn reset(&mut self) {
        if let Some(decoder) = self.decoder.as_mut() {
            let _ = decoder.reset_state();
        }
    }

    fn output_format(&self) -> AudioFormat {
        self.format
    }
}

/// Stub when the crate is built without the `opus` feature.
#[cfg(not(feature = "opus"))]
pub struct OpusAudioDecoder {
    format: AudioFormat,
}

#[cfg(not(feature = "opus"))]
impl OpusAudioDecoder {
    pub fn new() -> Self {
        Self {
            format: AudioFormat::default(),
        }
    }
}

#[cfg(not(feature = "opus"))]
impl Default for OpusAudioDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(feature = "opus"))]
impl AudioDecoder for OpusAudioDecoder {
    fn initialize(&mut self, _sample_rate: u32, _channels: u16) -> Result<()> {
        Err(MirrorError::InitializationFailed(
            "built without the opus feature".into(),
        ))
    }

    fn process_config_packet(&mut self, _payload: &[u8]) -> Result<()> {
        Ok(())
    }

    fn decode(&mut self, _payload: &[u8], _pts_us: u64, _is_key: bool) -> Result<Vec<f32>> {
        Err(MirrorError::DecodeFailed(
            "built without the opus feature".into(),
        ))
    }

    fn reset(&mut self) {}

    fn output_format(&self) -> AudioFormat {
        self.format
    }
}

// ---------------------------------------------------------------------------
// AAC

/// AAC-LC via fdk-aac. The AudioSpecificConfig packet is handed verbatim
/// to the decoder's raw-config entry point; we parse it ourselves only to
/// learn the output format.
#[cfg(feature = "aac")]
pub struct AacAudioDecoder {
    decoder: Option<fdk_aac::dec::Decoder>,
    config: Option<AudioSpecificConfig>,
    format: AudioFormat,
}

#[cfg(feature = "aac")]
impl AacAudioDecoder {
    /// 1024 samples per AAC frame, up to 8 channels.
    const MAX_FRAME_SAMPLES: usize = 1024 * 8;

    pub fn new() -> Self {
        Self {
            decoder: None,
            config: None,
            format: AudioFormat::default(),
        }
    }

    /// The parsed config, once the stream's config packet has arrived.
    pub fn audio_specific_config(&self) -> Option<AudioSpecificConfig> {
        self.config
    }
}

#[cfg(feature = "aac")]
impl Default for AacAudioDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "aac")]
impl AudioDecoder for AacAudioDecoder {
    fn initialize(&mut self, sample_rate: u32, channels: u16) -> Result<()> {
        self.format = AudioFormat {
            sample_rate,
            channels,
        };
        Ok(())
    }

    fn process_config_packet(&mut self, payload: &[u8]) -> Result<()> {
        let config = AudioSpecificConfig::parse(payload)?;
        log_verbose!(
            "AUDIO",
            "AAC config: object_type={}, {} Hz, {} ch",
            config.audio_object_type,
            config.sample_rate,
            config.channels
        );

        let mut decoder = fdk_aac::dec::Decoder::new(fdk_aac::dec::Transport::Raw);
        decoder
            .config_raw(payload)
            .map_err(|e| MirrorError::InitializationFailed(format!("fdk-aac: {:?}", e)))?;
        self.decoder = Some(decoder);
        self.format = AudioFormat {
            sample_rate: config.sample_rate,
            channels: config.channels,
        };
        self.config = Some(config);
        Ok(())
    }

    fn decode(&mut self, payload: &[u8], _pts_us: u64, _is_key: bool) -> Result<Vec<f32>> {
        let decoder = self.decoder.as_mut().ok_or_else(|| {
            MirrorError::DecodeFailed("aac config packet not received yet".into())
        })?;
        decoder
            .fill(payload)
            .map_err(|e| MirrorError::DecodeFailed(format!("fdk-aac fill: {:?}", e)))?;

        let mut pcm = vec![0i16; Self::MAX_FRAME_SAMPLES];
        decoder
            .decode_frame(&mut pcm)
            .map_err(|e| MirrorError::DecodeFailed(format!("fdk-aac decode: {:?}", e)))?;
        let produced = decoder.decoded_frame_size().min(pcm.len());
        Ok(pcm[..produced]
            .iter()
            .map(|&s| s as f32 / 32768.0)
            .collect())
    }

    fn reset(&mut self) {
        // A fresh config packet rebuilds the decoder.
        self.decoder = None;
        self.config = None;
    }

    fn output_format(&self) -> AudioFormat {
        self.format
    }
}

/// Stub when the crate is built without the `aac` feature.
#[cfg(not(feature = "aac"))]
pub struct AacAudioDecoder {
    format: AudioFormat,
}

#[cfg(not(feature = "aac"))]
impl AacAudioDecoder {
    pub fn new() -> Self {
        Self {
            format: AudioFormat::default(),
        }
    }
}

#[cfg(not(feature = "aac"))]
impl Default for AacAudioDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(feature = "aac"))]
impl AudioDecoder for AacAudioDecoder {
    fn initialize(&mut self, _sample_rate: u32, _channels: u16) -> Result<()> {
        Err(MirrorError::InitializationFailed(
            "built without the aac feature".into(),
        ))
    }

    fn process_config_packet(&mut self, payload: &[u8]) -> Result<()> {
        // Still validate the config so malformed streams are reported.
        AudioSpecificConfig::parse(payload).map(|_| ())
    }

    fn decode(&mut self, _payload: &[u8], _pts_us: u64, _is_key: bool) -> Result<Vec<f32>> {
        Err(MirrorError::DecodeFailed(
            "built without the aac feature".into(),
        ))
    }

    fn reset(&mut self) {}

    fn output_format(&self) -> AudioFormat {
        self.format
    }
}
