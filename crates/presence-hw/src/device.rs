//! Video device and stream contracts.

use crate::frame::Frame;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("no video input device found")]
    NoDeviceFound,
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("no render surface after {attempts} attempts")]
    SurfaceNotFound { attempts: u32 },
    #[error("camera not ready after {0:?}")]
    InitTimeout(Duration),
    #[error("camera start already in progress")]
    StartInProgress,
    #[error("camera start aborted by stop")]
    Aborted,
}

/// Info about a discovered video input device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Backend-specific identifier (a device path for V4L2).
    pub id: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Parameters for opening a video-only stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    /// Exact device to open; `None` lets the backend pick its default.
    pub device_id: Option<String>,
    pub ideal_width: u32,
    pub ideal_height: u32,
}

/// A source of video devices.
///
/// Both calls may block; the session runs them on the blocking pool.
pub trait VideoBackend: Send + Sync + 'static {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, CameraError>;
    fn open(&self, request: &StreamRequest) -> Result<Arc<dyn VideoStream>, CameraError>;
}

/// An open, live video stream.
pub trait VideoStream: Send + Sync {
    fn device_id(&self) -> &str;
    /// Negotiated (width, height).
    fn resolution(&self) -> (u32, u32);
    /// Block until the next frame is available.
    fn read_frame(&self) -> Result<Frame, CameraError>;
    /// Release the device. Idempotent; reads after stop fail.
    fn stop(&self);
}
