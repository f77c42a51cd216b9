//! In-process FFmpeg extractor (feature `ffmpeg`)
//!
//! Probes stream properties and decodes a single frame near a timestamp,
//! scaled straight to thumbnail size by swscale. The packet loop checks the
//! abort flag, so a timed-out decode stops at the next packet.

use std::path::Path;
use std::sync::Once;

use image::RgbaImage;
use log::{trace, warn};
use playa_ffmpeg as ffmpeg;

use super::media::{ThumbSize, VideoProbe};
use super::traits::{AbortFlag, ExtractError, FrameExtractor};

static FFMPEG_INIT: Once = Once::new();

fn init_ffmpeg() {
    FFMPEG_INIT.call_once(|| {
        if let Err(e) = ffmpeg::init() {
            warn!("FFmpeg init failed: {}", e);
        }
        unsafe {
            // Corrupt files are expected; keep libav quiet
            ffmpeg::ffi::av_log_set_level(ffmpeg::ffi::AV_LOG_QUIET);
        }
    });
}

#[derive(Debug, Clone, Default)]
pub struct FfmpegExtractor;

impl FfmpegExtractor {
    pub fn new() -> Self {
        init_ffmpeg();
        Self
    }
}

fn open(path: &Path) -> Result<ffmpeg::format::context::Input, ExtractError> {
    init_ffmpeg();
    ffmpeg::format::input(path).map_err(|e| ExtractError::Open(e.to_string()))
}

impl FrameExtractor for FfmpegExtractor {
    fn name(&self) -> &'static str {
        "ffmpeg-lib"
    }

    fn probe(&self, path: &Path, abort: &AbortFlag) -> Result<VideoProbe, ExtractError> {
        let ictx = open(path)?;
        abort.check()?;

        let stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or(ExtractError::NoVideoStream)?;

        let time_base = stream.time_base();
        let mut duration_secs = if time_base.denominator() != 0 {
            stream.duration() as f64 * time_base.numerator() as f64
                / time_base.denominator() as f64
        } else {
            0.0
        };
        if !(duration_secs.is_finite() && duration_secs > 0.0) {
            // Container duration (AV_TIME_BASE units) when the stream has none
            duration_secs = ictx.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64;
        }
        if !(duration_secs.is_finite() && duration_secs > 0.0) {
            duration_secs = 0.0;
        }

        let rate = stream.avg_frame_rate();
        let fps = if rate.denominator() != 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            0.0
        };

        let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| ExtractError::Decode(format!("decoder context: {}", e)))?
            .decoder()
            .video()
            .map_err(|e| ExtractError::Decode(format!("video decoder: {}", e)))?;

        Ok(VideoProbe {
            duration_secs,
            width: decoder.width(),
            height: decoder.height(),
            fps,
        })
    }

    fn extract_frame(
        &self,
        path: &Path,
        offset_secs: f64,
        max_size: ThumbSize,
        abort: &AbortFlag,
    ) -> Result<RgbaImage, ExtractError> {
        let mut ictx = open(path)?;
        abort.check()?;

        let stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or(ExtractError::NoVideoStream)?;
        let stream_idx = stream.index();
        let time_base = stream.time_base();

        let mut decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| ExtractError::Decode(format!("decoder context: {}", e)))?
            .decoder()
            .video()
            .map_err(|e| ExtractError::Decode(format!("video decoder: {}", e)))?;

        let (src_w, src_h) = (decoder.width(), decoder.height());
        let (dst_w, dst_h) = max_size.fit(src_w, src_h);

        let mut scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            src_w,
            src_h,
            ffmpeg::format::Pixel::RGBA,
            dst_w,
            dst_h,
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .map_err(|e| ExtractError::Decode(format!("scaler: {}", e)))?;

        // Target timestamp in stream time base
        let target_ts = if time_base.numerator() > 0 {
            Some(
                (offset_secs.max(0.0) * time_base.denominator() as f64
                    / time_base.numerator() as f64) as i64,
            )
        } else {
            None
        };

        if let Some(target_ts) = target_ts {
            let seek_ret = unsafe {
                ffmpeg::ffi::av_seek_frame(
                    ictx.as_mut_ptr(),
                    stream_idx as i32,
                    target_ts,
                    ffmpeg::ffi::AVSEEK_FLAG_BACKWARD,
                )
            };
            if seek_ret < 0 {
                warn!(
                    "Seek failed in {} (ret={}), decoding from start",
                    path.display(),
                    seek_ret
                );
            }
        }

        let mut decoded = ffmpeg::util::frame::video::Video::empty();
        for (stream, packet) in ictx.packets() {
            abort.check()?;
            if stream.index() != stream_idx {
                continue;
            }
            if decoder.send_packet(&packet).is_err() {
                // Damaged packet; keep going, later ones may decode
                continue;
            }
            while decoder.receive_frame(&mut decoded).is_ok() {
                let reached = match (target_ts, decoded.pts()) {
                    (Some(target), Some(pts)) => pts >= target,
                    _ => true,
                };
                if !reached {
                    continue;
                }

                let mut rgba = ffmpeg::util::frame::video::Video::empty();
                scaler
                    .run(&decoded, &mut rgba)
                    .map_err(|e| ExtractError::Decode(format!("scale: {}", e)))?;

                let stride = rgba.stride(0);
                let row_bytes = dst_w as usize * 4;
                let data = rgba.data(0);
                let mut pixels = vec![0u8; row_bytes * dst_h as usize];
                for y in 0..dst_h as usize {
                    pixels[y * row_bytes..(y + 1) * row_bytes]
                        .copy_from_slice(&data[y * stride..y * stride + row_bytes]);
                }

                trace!(
                    "Decoded {}x{} frame from {} @ {:.1}s",
                    dst_w,
                    dst_h,
                    path.display(),
                    offset_secs
                );
                return RgbaImage::from_raw(dst_w, dst_h, pixels)
                    .ok_or_else(|| ExtractError::Decode("frame buffer size mismatch".into()));
            }
        }

        Err(ExtractError::FrameNotFound(offset_secs))
    }
}
