//! presence-hw — Camera capture for face attendance.
//!
//! A [`CaptureSession`] acquires a video stream from a [`VideoBackend`],
//! binds it to a render [`Surface`] handed out by a [`SurfaceProvider`], and
//! waits for the surface to report it can render frames. The V4L2 backend
//! covers Linux webcams; other platforms plug in their own backend.

pub mod device;
pub mod frame;
pub mod session;
pub mod surface;
pub mod v4l2;

pub use device::{CameraError, DeviceInfo, StreamRequest, VideoBackend, VideoStream};
pub use frame::Frame;
pub use session::{CaptureOptions, CaptureSession, SessionState};
pub use surface::{FrameSurface, Surface, SurfaceProvider, SurfaceSlot};
pub use v4l2::V4lBackend;
