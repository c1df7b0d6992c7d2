use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Student identifier as printed on an ID card code.
///
/// Opaque token; the only normalisation is trimming surrounding whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StudentId(String);

impl StudentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StudentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("student identifier is empty")]
pub struct EmptyStudentId;

impl FromStr for StudentId {
    type Err = EmptyStudentId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(EmptyStudentId);
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Face signature vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceSignature {
    pub values: Vec<f32>,
}

impl FaceSignature {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance between two signatures.
    ///
    /// Signatures of different length are never comparable and report
    /// an infinite distance.
    pub fn distance(&self, other: &FaceSignature) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Little-endian f32 encoding used by the identity store.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Inverse of [`to_bytes`](Self::to_bytes). `None` if the length is not a multiple of 4.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self { values })
    }
}

/// Region of a frame that contains a face.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// A registered student and their signature.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub student_id: StudentId,
    pub signature: FaceSignature,
}

/// Outcome of comparing a probe signature against the enrolled gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Identity that satisfied the tolerance, if any.
    pub student_id: Option<StudentId>,
    /// Distance to the matched entry, or to the closest entry on a miss.
    /// `None` for an empty gallery.
    pub distance: Option<f32>,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        self.student_id.is_some()
    }
}

/// Strategy for comparing a probe signature against a gallery.
pub trait Matcher {
    fn compare(&self, probe: &FaceSignature, gallery: &[Enrollment], tolerance: f32) -> MatchResult;
}

/// Gallery-order matcher: the first entry strictly closer than the
/// tolerance wins, even if a later entry is closer still.
pub struct FirstMatch;

impl Matcher for FirstMatch {
    fn compare(&self, probe: &FaceSignature, gallery: &[Enrollment], tolerance: f32) -> MatchResult {
        let mut closest: Option<f32> = None;

        for entry in gallery {
            let distance = probe.distance(&entry.signature);
            if distance < tolerance {
                return MatchResult {
                    student_id: Some(entry.student_id.clone()),
                    distance: Some(distance),
                };
            }
            if closest.map_or(true, |c| distance < c) {
                closest = Some(distance);
            }
        }

        MatchResult {
            student_id: None,
            distance: closest,
        }
    }
}
