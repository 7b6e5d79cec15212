use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Descriptor length produced by the reference embedding provider.
pub const DESCRIPTOR_DIM: usize = 128;

/// Kind of person a descriptor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Student,
    Employee,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Student => "student",
            UserType::Employee => "employee",
        }
    }
}

impl fmt::Display for UserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid user type: {0:?} (expected \"student\" or \"employee\")")]
pub struct UserTypeParseError(pub String);

impl FromStr for UserType {
    type Err = UserTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(UserType::Student),
            "employee" => Ok(UserType::Employee),
            other => Err(UserTypeParseError(other.to_string())),
        }
    }
}

/// A person known to the attendance system.
///
/// `user_id` alone is not unique across types; the pair is the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub user_id: String,
    pub user_type: UserType,
}

impl Subject {
    pub fn new(user_id: impl Into<String>, user_type: UserType) -> Self {
        Self {
            user_id: user_id.into(),
            user_type,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_type, self.user_id)
    }
}

/// Face embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor {
    pub values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Compute Euclidean distance between two descriptors.
    ///
    /// Only meaningful for descriptors of equal length; extra trailing
    /// components of the longer vector are ignored.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Little-endian `f32` encoding used for persistence.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Decode a little-endian `f32` buffer. Returns `None` when the buffer
    /// length is not a multiple of four.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Some(Self { values })
    }
}

impl From<Vec<f32>> for Descriptor {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// An enrolled descriptor as persisted by the store. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDescriptor {
    pub id: String,
    pub user_id: String,
    pub user_type: UserType,
    pub descriptor: Descriptor,
    /// Capture time, milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl FaceDescriptor {
    pub fn subject(&self) -> Subject {
        Subject::new(self.user_id.clone(), self.user_type)
    }

    pub fn belongs_to(&self, subject: &Subject) -> bool {
        self.user_id == subject.user_id && self.user_type == subject.user_type
    }
}

/// Region of a detected face in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector score for this region.
    pub score: f32,
}

/// One face found by an embedding provider.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub descriptor: Descriptor,
    pub region: BoundingBox,
}

/// A positive identification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recognition {
    pub subject: Subject,
    pub distance: f32,
    /// In [0, 1]; 1 at distance zero, 0 at or beyond the threshold.
    pub confidence: f32,
}

/// What a single recognition attempt saw.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionOutcome {
    /// No face in the frame.
    NoFace,
    /// A face was present but nothing enrolled was close enough.
    /// `distance` is `None` when the gallery had no comparable entries.
    Unmatched { distance: Option<f32> },
    Matched(Recognition),
}

impl RecognitionOutcome {
    pub fn recognition(&self) -> Option<&Recognition> {
        match self {
            RecognitionOutcome::Matched(r) => Some(r),
            _ => None,
        }
    }

    pub fn face_present(&self) -> bool {
        !matches!(self, RecognitionOutcome::NoFace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_type_round_trip_strings() {
        assert_eq!("student".parse::<UserType>().unwrap(), UserType::Student);
        assert_eq!("employee".parse::<UserType>().unwrap(), UserType::Employee);
        assert_eq!(UserType::Employee.to_string(), "employee");
    }

    #[test]
    fn test_user_type_rejects_unknown() {
        let err = "visitor".parse::<UserType>().unwrap_err();
        assert!(err.to_string().contains("visitor"));
        assert!("Student".parse::<UserType>().is_err());
    }

    #[test]
    fn test_user_type_serde_lowercase() {
        let json = serde_json::to_string(&UserType::Student).unwrap();
        assert_eq!(json, "\"student\"");
        let back: UserType = serde_json::from_str("\"employee\"").unwrap();
        assert_eq!(back, UserType::Employee);
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Descriptor::new(vec![0.0, 0.0]);
        let b = Descriptor::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_le_bytes_decode_rejects_partial_float() {
        assert!(Descriptor::from_le_bytes(&[0, 0, 128]).is_none());
        let d = Descriptor::from_le_bytes(&1.5f32.to_le_bytes()).unwrap();
        assert_eq!(d.values, vec![1.5]);
    }

    #[test]
    fn test_descriptor_serializes_as_plain_array() {
        let d: Descriptor = serde_json::from_str("[0.25, -1.0]").unwrap();
        assert_eq!(d.values, vec![0.25, -1.0]);
    }

    #[test]
    fn test_subject_membership() {
        let record = FaceDescriptor {
            id: "42_1".into(),
            user_id: "42".into(),
            user_type: UserType::Student,
            descriptor: Descriptor::new(vec![0.0]),
            timestamp: 0,
        };
        assert!(record.belongs_to(&Subject::new("42", UserType::Student)));
        assert!(!record.belongs_to(&Subject::new("42", UserType::Employee)));
        assert_eq!(record.subject().to_string(), "student:42");
    }

    #[test]
    fn test_outcome_accessors() {
        assert!(!RecognitionOutcome::NoFace.face_present());
        assert!(RecognitionOutcome::Unmatched { distance: Some(0.9) }.face_present());
        assert!(RecognitionOutcome::Unmatched { distance: None }.recognition().is_none());
    }
}
