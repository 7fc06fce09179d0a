//! Video decoding
//!
//! The decoder interface is fixed; implementations are platform-specific
//! and hardware-preferred. The bundled software implementation uses
//! OpenH264 and therefore only accepts H.264 initialization.

use crate::core::error::Result;
use crate::core::frame::VideoFrame;
use crate::video::parser::NalUnit;

/// Accepts parameter sets and VCL NALs, produces decoded frames.
///
/// `initialize_*` must be called before `decode`; `is_ready` gates input.
/// `reset` destroys decoder state and is used on SPS change.
pub trait VideoDecoder: Send {
    fn initialize_h264(&mut self, sps: &[u8], pps: &[u8]) -> Result<()>;

    fn initialize_h265(&mut self, vps: &[u8], sps: &[u8], pps: &[u8]) -> Result<()>;

    fn is_ready(&self) -> bool;

    fn decode(&mut self, nal: &NalUnit) -> Result<Vec<VideoFrame>>;

    fn reset(&mut self);
}

#[cfg(feature = "openh264")]
pub use openh264_impl::OpenH264Decoder;

#[cfg(feature = "openh264")]
mod openh264_impl {
    use super::VideoDecoder;
    use crate::core::error::{MirrorError, Result};
    use crate::core::frame::VideoFrame;
    use crate::log_debug;
    use crate::video::parser::NalUnit;
    use openh264::decoder::Decoder;
    use openh264::formats::YUVSource;
    use std::sync::Arc;
    use std::time::Instant;

    const START_CODE: &[u8] = &[0, 0, 0, 1];

    /// Software H.264 decoder producing packed I420 frames.
    pub struct OpenH264Decoder {
        decoder: Option<Decoder>,
        frame_count: u64,
    }

    impl OpenH264Decoder {
        pub fn new() -> Self {
            Self {
                decoder: None,
                frame_count: 0,
            }
        }

        fn feed(&mut self, data: &[u8], frames_out: &mut Vec<VideoFrame>) -> Result<()> {
            let decoder = self
                .decoder
                .as_mut()
                .ok_or_else(|| MirrorError::DecodeFailed("decoder not initialized".into()))?;
            match decoder.decode(data) {
                Ok(Some(yuv)) => {
                    self.frame_count += 1;
                    let (width, height) = yuv.dimensions();
                    let (y_stride, u_stride, _v_stride) = yuv.strides();
                    let w = width;
                    let h = height;
                    let uv_w = w / 2;
                    let uv_h = h / 2;

                    // Pack the planes; the source strides may be padded.
                    let y_src = yuv.y();
                    let mut y = Vec::with_capacity(w * h);
                    for row in 0..h {
                        y.extend_from_slice(&y_src[row * y_stride..row * y_stride + w]);
                    }
                    let u_src = yuv.u();
                    let mut u = Vec::with_capacity(uv_w * uv_h);
                    for row in 0..uv_h {
                        u.extend_from_slice(&u_src[row * u_stride..row * u_stride + uv_w]);
                    }
                    let v_src = yuv.v();
                    let mut v = Vec::with_capacity(uv_w * uv_h);
                    for row in 0..uv_h {
                        v.extend_from_slice(&v_src[row * u_stride..row * u_stride + uv_w]);
                    }

                    frames_out.push(VideoFrame {
                        width: w as u32,
                        height: h as u32,
                        y_plane: Arc::new(y),
                        u_plane: Arc::new(u),
                        v_plane: Arc::new(v),
                        y_stride: w,
                        uv_stride: uv_w,
                        presented_at: Instant::now(),
                    });

                    if self.frame_count % 600 == 0 {
                        log_debug!("DEC", "Decoded {} frames", self.frame_count);
                    }
                    Ok(())
                }
                Ok(None) => Ok(()),
                Err(e) => Err(MirrorError::DecodeFailed(format!("openh264: {:?}", e))),
            }
        }

        fn feed_parameter_set(&mut self, payload: &[u8]) -> Result<()> {
            let mut nal = Vec::with_capacity(payload.len() + 4);
            nal.extend_from_slice(START_CODE);
            nal.extend_from_slice(payload);
            let mut sink = Vec::new();
            self.feed(&nal, &mut sink)
        }
    }

    impl Default for OpenH264Decoder {
        fn default() -> Self {
            Self::new()
        }
    }

    impl VideoDecoder for OpenH264Decoder {
        fn initialize_h264(&mut self, sps: &[u8], pps: &[u8]) -> Result<()> {
            let decoder = Decoder::new()
                .map_err(|e| MirrorError::InitializationFailed(format!("openh264: {:?}", e)))?;
            self.decoder = Some(decoder);
            self.feed_parameter_set(sps)
                .and_then(|_| self.feed_parameter_set(pps))
                .map_err(|e| {
                    self.decoder = None;
                    MirrorError::InitializationFailed(e.to_string())
                })
        }

        fn initialize_h265(&mut self, _vps: &[u8], _sps: &[u8], _pps: &[u8]) -> Result<()> {
            Err(MirrorError::InitializationFailed(
                "the software decoder only supports h264".into(),
            ))
        }

        fn is_ready(&self) -> bool {
            self.decoder.is_some()
        }

        fn decode(&mut self, nal: &NalUnit) -> Result<Vec<VideoFrame>> {
            let mut frames = Vec::new();
            self.feed(&nal.data, &mut frames)?;
            Ok(frames)
        }

        fn reset(&mut self) {
            self.decoder = None;
        }
    }
}
