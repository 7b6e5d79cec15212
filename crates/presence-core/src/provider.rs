//! Contract for the face detection + embedding capability.
//!
//! The network itself lives outside this workspace. The engine only needs
//! something that can load its models once and then turn a grayscale frame
//! into zero or more descriptors.

use crate::types::DetectedFace;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("embedding models not loaded")]
    NotInitialized,
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

/// Face detection and embedding.
///
/// Calls are blocking; the engine runs them off the async executor.
pub trait EmbeddingProvider: Send {
    /// Load models. Returns `Ok(true)` once the provider is ready for
    /// [`detect_faces`](Self::detect_faces). Safe to call repeatedly.
    fn initialize(&mut self) -> Result<bool, ProviderError>;

    /// Detect faces in an 8-bit grayscale frame of `width * height` bytes.
    ///
    /// Faces are returned in detector order; callers that only want one face
    /// take the first.
    fn detect_faces(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, ProviderError>;
}

impl<P: EmbeddingProvider + ?Sized> EmbeddingProvider for Box<P> {
    fn initialize(&mut self) -> Result<bool, ProviderError> {
        (**self).initialize()
    }

    fn detect_faces(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, ProviderError> {
        (**self).detect_faces(frame, width, height)
    }
}
