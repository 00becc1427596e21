//! V4L2 capture backend for local devices addressed by index.
//!
//! Index `N` opens `/dev/videoN` and requests RGB24 at the configured
//! resolution and frame rate. When the driver refuses the format the device's
//! current format is used; non-RGB formats are rejected at read time.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use v4l::prelude::MmapStream;

use super::{CaptureBackend, CaptureSettings};
use crate::frame::Frame;

const MMAP_BUFFERS: u32 = 4;

fn rgb24() -> v4l::FourCC {
    v4l::FourCC::new(b"RGB3")
}

pub struct V4l2Backend {
    device_path: String,
    state: DeviceState,
    width: u32,
    height: u32,
    rgb: bool,
    failed: Option<String>,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: MmapStream<'this, v4l::Device>,
}

impl V4l2Backend {
    pub fn open(index: u32, settings: &CaptureSettings) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let device_path = format!("/dev/video{}", index);
        let device = v4l::Device::new(index as usize)
            .with_context(|| format!("open v4l2 device {}", device_path))?;
        let mut format = device
            .format()
            .with_context(|| format!("query format of {}", device_path))?;
        format.width = settings.width;
        format.height = settings.height;
        format.fourcc = rgb24();

        let format = match Capture::set_format(&device, &format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Backend: failed to set format on {}: {}",
                    device_path,
                    err
                );
                device
                    .format()
                    .with_context(|| format!("query fallback format of {}", device_path))?
            }
        };

        if settings.fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(settings.fps);
            if let Err(err) = Capture::set_params(&device, &params) {
                log::warn!("V4l2Backend: failed to set fps on {}: {}", device_path, err);
            }
        }

        let state = DeviceStateTryBuilder {
            device,
            stream_builder: |device| {
                MmapStream::with_buffers(device, Type::VideoCapture, MMAP_BUFFERS)
                    .map_err(|err| anyhow!("mmap stream on /dev/video{}: {}", index, err))
            },
        }
        .try_build()?;

        log::info!(
            "V4l2Backend: opened {} ({}x{} {})",
            device_path,
            format.width,
            format.height,
            format.fourcc
        );

        Ok(Self {
            device_path,
            state,
            width: format.width,
            height: format.height,
            rgb: format.fourcc == rgb24(),
            failed: None,
        })
    }
}

impl CaptureBackend for V4l2Backend {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn is_opened(&self) -> bool {
        self.failed.is_none()
    }

    fn read(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;
        if !self.rgb {
            return Err(anyhow!(
                "{} does not deliver RGB24 frames",
                self.device_path
            ));
        }
        let expected = (self.width as usize) * (self.height as usize) * 3;
        let pixels = self
            .state
            .with_stream_mut(|stream| stream.next().map(|(buf, _meta)| buf.to_vec()))
            .map_err(|err| {
                let message = format!("{}: {}", self.device_path, err);
                self.failed = Some(message.clone());
                anyhow!(message)
            })?;
        if pixels.len() < expected {
            return Err(anyhow!(
                "short v4l2 frame: {} of {} bytes",
                pixels.len(),
                expected
            ));
        }
        let mut pixels = pixels;
        pixels.truncate(expected);
        Frame::new(pixels, self.width, self.height)
    }
}
