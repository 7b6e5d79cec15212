//! V4L2 video backend via the `v4l` crate.

use crate::device::{CameraError, DeviceInfo, StreamRequest, VideoBackend, VideoStream};
use crate::frame::{self, Frame};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const DEFAULT_DEVICE: &str = "/dev/video0";
const MAX_DEVICE_INDEX: u32 = 16;

/// Negotiated pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

/// Open V4L2 device with a negotiated format.
struct Camera {
    device: Device,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

impl Camera {
    fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                CameraError::PermissionDenied(device_path.to_string())
            } else if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        // The driver may substitute its closest supported size or format.
        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            PixelFormat::Y16
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            )));
        };

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "camera opened"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        })
    }

    fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4).map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let gray = match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, self.width, self.height),
            PixelFormat::Grey => frame::grey_to_grayscale(buf, self.width, self.height),
            PixelFormat::Y16 => frame::y16_to_grayscale(buf, self.width, self.height),
        }
        .map_err(|e| CameraError::CaptureFailed(format!("{:?} conversion failed: {e}", self.pixel_format)))?;

        Ok(Frame::new(gray, self.width, self.height, meta.sequence))
    }
}

/// Live V4L2 stream. Dropping the camera closes the device.
struct V4lStream {
    device_id: String,
    resolution: (u32, u32),
    camera: Mutex<Option<Camera>>,
}

impl VideoStream for V4lStream {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn read_frame(&self) -> Result<Frame, CameraError> {
        let guard = self.camera.lock().unwrap_or_else(PoisonError::into_inner);
        let camera = guard
            .as_ref()
            .ok_or_else(|| CameraError::CaptureFailed("stream stopped".into()))?;
        camera.capture_frame()
    }

    fn stop(&self) {
        let released = self
            .camera
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if released.is_some() {
            tracing::info!(device = %self.device_id, "camera released");
        }
    }
}

/// Linux video capture devices under `/dev/video*`.
#[derive(Debug, Clone, Copy, Default)]
pub struct V4lBackend;

impl VideoBackend for V4lBackend {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, CameraError> {
        let mut devices = Vec::new();

        for i in 0..MAX_DEVICE_INDEX {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                id: path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        Ok(devices)
    }

    fn open(&self, request: &StreamRequest) -> Result<Arc<dyn VideoStream>, CameraError> {
        let path = request.device_id.as_deref().unwrap_or(DEFAULT_DEVICE);
        let camera = Camera::open(path, request.ideal_width, request.ideal_height)?;
        Ok(Arc::new(V4lStream {
            device_id: path.to_string(),
            resolution: (camera.width, camera.height),
            camera: Mutex::new(Some(camera)),
        }))
    }
}
