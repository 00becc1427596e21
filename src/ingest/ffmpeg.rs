//! FFmpeg capture backend for local files and RTSP/RTMP/UDP streams.
//!
//! Decoded frames are scaled straight to the requested resolution in RGB24.
//! End of input closes the handle; the owning `FrameSource` then reopens it,
//! so local files loop.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg::frame::Video;

use super::{CaptureBackend, CaptureSettings};
use crate::frame::Frame;

pub struct FfmpegBackend {
    location: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    ended: bool,
}

impl FfmpegBackend {
    pub fn open(location: &str, settings: &CaptureSettings) -> Result<Self> {
        ffmpeg::init().context("ffmpeg init")?;

        let mut options = ffmpeg::Dictionary::new();
        let lower = location.to_ascii_lowercase();
        if lower.starts_with("rtsp://") || lower.starts_with("rtsps://") {
            options.set("rtsp_transport", "tcp");
        }
        if lower.contains("://") {
            let micros = settings.timeout.as_micros().to_string();
            options.set("timeout", &micros);
            options.set("rw_timeout", &micros);
            options.set("fflags", "nobuffer");
        }

        let input = ffmpeg::format::input_with_dictionary(&location, options)
            .with_context(|| format!("failed to open '{}' with ffmpeg", location))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("{} has no video track", location))?;
        let stream_index = input_stream.index();
        let decoder = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .and_then(|codec| codec.decoder().video())
            .with_context(|| format!("no usable video decoder for {}", location))?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            settings.width,
            settings.height,
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("ffmpeg RGB24 scaler")?;

        log::info!(
            "FfmpegBackend: opened {} ({}x{} native)",
            location,
            decoder.width(),
            decoder.height()
        );

        Ok(Self {
            location: location.to_string(),
            input,
            stream_index,
            decoder,
            scaler,
            ended: false,
        })
    }

    fn decode_next(&mut self) -> Result<Video> {
        let mut decoded = Video::empty();
        if self.decoder.receive_frame(&mut decoded).is_ok() {
            return Ok(decoded);
        }

        let stream_index = self.stream_index;
        for (_, packet) in self
            .input
            .packets()
            .filter(|(stream, _)| stream.index() == stream_index)
        {
            self.decoder
                .send_packet(&packet)
                .with_context(|| format!("decode packet from {}", self.location))?;
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return Ok(decoded);
            }
        }

        self.ended = true;
        Err(anyhow!("{} ended", self.location))
    }
}

impl CaptureBackend for FfmpegBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn is_opened(&self) -> bool {
        !self.ended
    }

    fn read(&mut self) -> Result<Frame> {
        let decoded = self.decode_next()?;
        let mut scaled = Video::empty();
        self.scaler
            .run(&decoded, &mut scaled)
            .with_context(|| format!("scale {} frame", self.location))?;
        Frame::new(packed_rgb(&scaled)?, scaled.width(), scaled.height())
    }

    fn drain(&mut self, max_frames: usize) {
        for _ in 0..max_frames {
            if self.decode_next().is_err() {
                break;
            }
        }
    }
}

/// Copy plane 0 without the per-row padding ffmpeg may add.
fn packed_rgb(video: &Video) -> Result<Vec<u8>> {
    let row = video.width() as usize * 3;
    let rows = video.height() as usize;
    let stride = video.stride(0);
    let data = video.data(0);
    if stride == row {
        return data
            .get(..row * rows)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| anyhow!("ffmpeg frame is shorter than {} bytes", row * rows));
    }
    let mut packed = Vec::with_capacity(row * rows);
    for line in data.chunks(stride).take(rows) {
        packed.extend_from_slice(
            line.get(..row)
                .ok_or_else(|| anyhow!("ffmpeg frame row shorter than {} bytes", row))?,
        );
    }
    Ok(packed)
}
