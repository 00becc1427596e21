//! HTTP MJPEG / JPEG snapshot backend.
//!
//! Covers IP cameras and phone webcam apps that serve either a
//! `multipart/x-mixed-replace` MJPEG stream or a single JPEG per request.
//!
//! A transport error on the multipart stream closes the handle so the owning
//! `FrameSource` reconnects. A corrupt JPEG is a failed read only.

use anyhow::{anyhow, Context, Result};
use std::io::Read;

use super::{CaptureBackend, CaptureSettings};
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

pub struct MjpegBackend {
    url: String,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    last_error: Option<String>,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg,
}

impl MjpegBackend {
    pub fn connect(url: &str, settings: &CaptureSettings) -> Result<Self> {
        url::Url::parse(url).with_context(|| format!("parse stream url {}", url))?;
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(settings.timeout)
            .timeout_read(settings.timeout)
            .build();

        let response = agent
            .get(url)
            .call()
            .with_context(|| format!("connect to http stream {}", url))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        let stream = if content_type.contains("multipart") {
            HttpStream::Mjpeg(MjpegStream::new(response.into_reader()))
        } else {
            HttpStream::SingleJpeg
        };
        log::info!(
            "MjpegBackend: connected to {} ({})",
            url,
            match stream {
                HttpStream::Mjpeg(_) => "mjpeg",
                HttpStream::SingleJpeg => "jpeg snapshots",
            }
        );

        Ok(Self {
            url: url.to_string(),
            agent,
            stream: Some(stream),
            last_error: None,
        })
    }

    fn fetch_single_jpeg(&self) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("fetch jpeg snapshot from {}", self.url))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES as u64)
            .read_to_end(&mut bytes)
            .context("read jpeg snapshot")?;
        if bytes.is_empty() {
            return Err(anyhow!("empty jpeg snapshot"));
        }
        Ok(bytes)
    }
}

impl CaptureBackend for MjpegBackend {
    fn name(&self) -> &'static str {
        "mjpeg"
    }

    fn is_opened(&self) -> bool {
        self.stream.is_some() && self.last_error.is_none()
    }

    fn read(&mut self) -> Result<Frame> {
        let jpeg_bytes = match self.stream {
            Some(HttpStream::Mjpeg(ref mut stream)) => stream.read_next_jpeg(),
            Some(HttpStream::SingleJpeg) => self.fetch_single_jpeg(),
            None => return Err(anyhow!("http stream {} is closed", self.url)),
        };
        let jpeg_bytes = match jpeg_bytes {
            Ok(bytes) => bytes,
            Err(err) => {
                if matches!(self.stream, Some(HttpStream::Mjpeg(_))) {
                    self.last_error = Some(err.to_string());
                    self.stream = None;
                }
                return Err(err);
            }
        };
        decode_jpeg(&jpeg_bytes)
    }

    fn drain(&mut self, max_frames: usize) {
        let Some(HttpStream::Mjpeg(stream)) = self.stream.as_mut() else {
            return;
        };
        match stream.skip_frames(max_frames) {
            Ok(dropped) => log::debug!("MjpegBackend: skipped {} queued frames", dropped),
            Err(err) => {
                log::warn!("MjpegBackend: drain of {} failed: {:#}", self.url, err);
                self.last_error = Some(err.to_string());
                self.stream = None;
            }
        }
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some(frame) = self.take_buffered_jpeg() {
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }

    fn take_buffered_jpeg(&mut self) -> Option<Vec<u8>> {
        let (start, end) = find_jpeg_bounds(&self.buffer)?;
        let frame = self.buffer[start..end].to_vec();
        self.buffer.drain(..end);
        Some(frame)
    }

    /// Pull and discard the next `max_frames` payloads, buffered or not.
    ///
    /// Blocks on the stream like a read does, bounded by the read timeout.
    fn skip_frames(&mut self, max_frames: usize) -> Result<usize> {
        for skipped in 0..max_frames {
            self.read_next_jpeg()
                .with_context(|| format!("skip frame {} of {}", skipped + 1, max_frames))?;
        }
        Ok(max_frames)
    }
}

fn decode_jpeg(bytes: &[u8]) -> Result<Frame> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    Frame::from_rgb_image(image.into_rgb8())
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn jpeg(rgb: [u8; 3]) -> Vec<u8> {
        let image = image::RgbImage::from_pixel(8, 8, image::Rgb(rgb));
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, image::ImageFormat::Jpeg)
            .expect("encode jpeg");
        out.into_inner()
    }

    fn multipart(frames: &[Vec<u8>]) -> Vec<u8> {
        let mut body = Vec::new();
        for frame in frames {
            body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            body.extend_from_slice(frame);
            body.extend_from_slice(b"\r\n");
        }
        body
    }

    #[test]
    fn finds_jpeg_bounds() {
        let buf = [0x00, 0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9, 0x00];
        assert_eq!(find_jpeg_bounds(&buf), Some((1, 7)));
        assert_eq!(find_jpeg_bounds(&[0xFF, 0xD8, 0x00]), None);
    }

    #[test]
    fn reads_frames_from_multipart_body() -> Result<()> {
        let body = multipart(&[jpeg([200, 0, 0]), jpeg([0, 200, 0])]);
        let mut stream = MjpegStream::new(Box::new(Cursor::new(body)));

        let first = decode_jpeg(&stream.read_next_jpeg()?)?;
        assert_eq!(first.dimensions(), (8, 8));
        assert!(first.pixels()[0] > 150);

        let second = decode_jpeg(&stream.read_next_jpeg()?)?;
        assert!(second.pixels()[1] > 150);

        assert!(stream.read_next_jpeg().is_err(), "stream end is an error");
        Ok(())
    }

    /// Stand-in payload the size of a real camera frame, tagged with `tag`.
    fn large_payload(tag: u8) -> Vec<u8> {
        let mut payload = vec![0xFF, 0xD8, tag];
        payload.resize(20 * 1024, tag);
        payload.extend_from_slice(&[0xFF, 0xD9]);
        payload
    }

    #[test]
    fn skip_reads_past_queued_frames_on_the_wire() -> Result<()> {
        let frames: Vec<Vec<u8>> = (1..=5).map(large_payload).collect();
        let mut stream = MjpegStream::new(Box::new(Cursor::new(multipart(&frames))));

        assert_eq!(stream.read_next_jpeg()?, frames[0]);
        assert_eq!(stream.skip_frames(3)?, 3);
        assert_eq!(stream.read_next_jpeg()?, frames[4]);
        Ok(())
    }

    #[test]
    fn skip_uses_buffered_frames_first() -> Result<()> {
        let body = multipart(&[jpeg([10, 0, 0]), jpeg([20, 0, 0]), jpeg([0, 0, 250])]);
        let mut stream = MjpegStream::new(Box::new(Cursor::new(Vec::new())));
        stream.buffer = body;

        assert_eq!(stream.skip_frames(2)?, 2);
        let newest = decode_jpeg(&stream.read_next_jpeg()?)?;
        assert!(newest.pixels()[2] > 200);
        Ok(())
    }

    #[test]
    fn skip_past_stream_end_is_an_error() {
        let body = multipart(&[large_payload(1)]);
        let mut stream = MjpegStream::new(Box::new(Cursor::new(body)));
        assert!(stream.skip_frames(3).is_err());
    }
}
