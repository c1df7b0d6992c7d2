//! Frame type and the capture seam: YUYV conversion and dark detection.

use crate::camera::CameraError;

/// A captured grayscale webcam frame.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Grayscale pixel data, row-major (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Driver sequence number; 0 for frames not read from a device.
    pub sequence: u32,
    /// Too dark to be worth running face detection on.
    pub is_dark: bool,
}

impl Frame {
    /// Wrap an already-grayscale buffer, e.g. a decoded still image.
    pub fn from_gray(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        let expected = (width as usize) * (height as usize);
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        let is_dark = is_dark_frame(&data, DARK_FRAME_RATIO);
        Ok(Self {
            data,
            width,
            height,
            sequence: 0,
            is_dark,
        })
    }
}

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_RATIO: f32 = 0.95;

/// Anything that hands the session loop one frame at a time.
///
/// Reads block until a frame is available; an error means no frame was
/// produced and the caller decides whether to retry.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Frame, CameraError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        (**self).next_frame()
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by keeping the Y samples.
///
/// Two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width as usize) * (height as usize) * 2;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// True when more than `threshold_pct` of pixels are below 32.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
