//! Continuous V4L2 webcam capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameSource, DARK_FRAME_RATIO};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Buffers queued in the mmap stream.
const STREAM_BUFFERS: u32 = 4;
/// Highest `/dev/videoN` probed by [`Camera::list_devices`].
const MAX_VIDEO_NODES: u32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("device does not support video capture")]
    CaptureNotSupported,
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel layouts the camera can hand us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2, luma kept.
    Yuyv,
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            _ => None,
        }
    }
}

/// An open webcam streaming grayscale frames.
///
/// The mmap stream starts on the first read and stays up between frames.
/// A failed dequeue tears it down; the next read starts a fresh one, so a
/// briefly unplugged camera recovers without reopening the device.
pub struct Camera {
    device: Device,
    stream: Option<MmapStream<'static>>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open `device_path` (e.g. "/dev/video0") asking for `width`x`height`.
    ///
    /// The driver may settle on another size; [`Camera::width`] and
    /// [`Camera::height`] hold what was negotiated.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }
        let device = Device::with_path(device_path).map_err(|e| open_error(device_path, &e))?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("querying capabilities: {e}")))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CameraError::CaptureNotSupported);
        }

        let (pixel_format, width, height) = negotiate(&device, width, height)?;
        tracing::info!(device = device_path, card = %caps.card, width, height, format = ?pixel_format, "camera ready");

        Ok(Self {
            device,
            stream: None,
            width,
            height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    /// Block until the next frame and return it as grayscale.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        if self.stream.is_none() {
            let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
                .map_err(|e| CameraError::CaptureFailed(format!("starting stream: {e}")))?;
            tracing::debug!(device = %self.device_path, "stream started");
            self.stream = Some(stream);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(CameraError::CaptureFailed("stream unavailable".into()));
        };

        let dequeued = stream.next().map(|(buf, meta)| (buf.to_vec(), meta.sequence));
        let (raw, sequence) = match dequeued {
            Ok(pair) => pair,
            Err(e) => {
                self.stream = None;
                return Err(CameraError::CaptureFailed(format!("dequeue: {e}")));
            }
        };

        let data = gray_pixels(self.pixel_format, &raw, self.width, self.height)?;
        Ok(Frame {
            is_dark: frame::is_dark_frame(&data, DARK_FRAME_RATIO),
            data,
            width: self.width,
            height: self.height,
            sequence,
        })
    }

    /// Capture-capable V4L2 nodes, for `rollcall devices`.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..MAX_VIDEO_NODES)
            .map(|n| format!("/dev/video{n}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| capture_node(&path))
            .collect()
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.stream.take();
        tracing::info!(device = %self.device_path, "camera released");
    }
}

fn open_error(device_path: &str, e: &std::io::Error) -> CameraError {
    if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
        CameraError::DeviceBusy(device_path.to_string())
    } else {
        CameraError::DeviceNotFound(format!("{device_path}: {e}"))
    }
}

/// Ask for YUYV at the requested size and accept YUYV or GREY back.
fn negotiate(device: &Device, width: u32, height: u32) -> Result<(PixelFormat, u32, u32), CameraError> {
    let mut wanted = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("reading format: {e}")))?;
    wanted.fourcc = FourCC::new(b"YUYV");
    wanted.width = width;
    wanted.height = height;

    let got = device
        .set_format(&wanted)
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("setting format: {e}")))?;
    let pixel_format = PixelFormat::from_fourcc(got.fourcc).ok_or_else(|| {
        CameraError::FormatNegotiationFailed(format!("driver offered {:?}, need YUYV or GREY", got.fourcc))
    })?;
    Ok((pixel_format, got.width, got.height))
}

fn gray_pixels(format: PixelFormat, raw: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CameraError> {
    match format {
        PixelFormat::Yuyv => frame::yuyv_to_grayscale(raw, width, height)
            .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion: {e}"))),
        PixelFormat::Grey => {
            let pixels = (width as usize) * (height as usize);
            raw.get(..pixels).map(<[u8]>::to_vec).ok_or_else(|| {
                CameraError::CaptureFailed(format!("GREY buffer holds {} bytes, need {pixels}", raw.len()))
            })
        }
    }
}

fn capture_node(path: &str) -> Option<DeviceInfo> {
    let caps = Device::with_path(path).ok()?.query_caps().ok()?;
    caps.capabilities.contains(Flags::VIDEO_CAPTURE).then(|| DeviceInfo {
        path: path.to_string(),
        name: caps.card,
        driver: caps.driver,
        bus: caps.bus,
    })
}
