//! presence-core — Face descriptor model and matching for attendance.
//!
//! Holds the data types shared by the store, camera and engine crates,
//! the Euclidean nearest-neighbour matcher, and the contract an
//! embedding provider must fulfil.

pub mod matcher;
pub mod provider;
pub mod types;

pub use matcher::{confidence, EuclideanMatcher, Match, MatchOutcome, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use provider::{EmbeddingProvider, ProviderError};
pub use types::{
    BoundingBox, DetectedFace, Descriptor, FaceDescriptor, Recognition, RecognitionOutcome, Subject,
    UserType, UserTypeParseError, DESCRIPTOR_DIM,
};
