//! presence-engine — Face enrollment and live recognition for attendance.
//!
//! [`FaceRecognitionEngine`] ties an embedding provider, the descriptor
//! store and a camera session together. Callers start the camera, then
//! either enroll a subject or run a recognition loop that reports matches
//! through a callback.

pub mod config;
pub mod engine;
mod enrollment;
mod recognition;

#[cfg(test)]
mod testing;

pub use config::{CameraConfig, Config, ConfigError};
pub use engine::{Detection, EngineError, EngineOptions, EngineStatus, FaceRecognitionEngine};
pub use enrollment::EnrollReport;
pub use recognition::RecognitionHandle;
