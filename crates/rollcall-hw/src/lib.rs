//! rollcall-hw: Webcam capture for the attendance station.
//!
//! Provides V4L2-based camera access and the grayscale [`Frame`] type the
//! rest of the workspace consumes through the [`FrameSource`] trait.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError, FrameSource};
