//! Frame-level identity resolution on top of a [`FaceEncoder`].

use crate::encoder::{EncoderError, FaceEncoder};
use crate::store::{IdentityStore, StoreError};
use crate::types::{FaceSignature, FirstMatch, MatchResult, Matcher, StudentId};
use thiserror::Error;

/// Default match tolerance on signature distance.
pub const DEFAULT_TOLERANCE: f32 = 0.5;

#[derive(Error, Debug)]
pub enum MatcherError {
    #[error("no face found in frame")]
    NoFace,
    #[error("ambiguous subject: {faces} faces visible, registration needs exactly one")]
    AmbiguousSubject { faces: usize },
    #[error("encoder: {0}")]
    Encoder(#[from] EncoderError),
    #[error("identity store: {0}")]
    Store(#[from] StoreError),
}

impl MatcherError {
    /// Whether the error is about what the camera saw rather than a broken component.
    pub fn is_subject_error(&self) -> bool {
        matches!(self, Self::NoFace | Self::AmbiguousSubject { .. })
    }
}

/// What one recognition pass saw.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sighting {
    /// Faces located in the frame.
    pub faces: usize,
    /// First of them that matched a registration.
    pub student_id: Option<StudentId>,
}

impl Sighting {
    /// Somebody is in view but nobody matched.
    pub fn is_stranger(&self) -> bool {
        self.faces > 0 && self.student_id.is_none()
    }
}

/// Resolves faces in a frame to registered students.
pub struct IdentityMatcher {
    encoder: Box<dyn FaceEncoder>,
    matcher: Box<dyn Matcher>,
    tolerance: f32,
}

impl IdentityMatcher {
    pub fn new(encoder: Box<dyn FaceEncoder>, tolerance: f32) -> Self {
        Self {
            encoder,
            matcher: Box::new(FirstMatch),
            tolerance,
        }
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    /// Signature of the single face in the frame.
    ///
    /// Registration needs an unambiguous subject: zero faces is
    /// [`MatcherError::NoFace`], more than one is [`MatcherError::AmbiguousSubject`].
    pub fn extract_single(&mut self, frame: &[u8], width: u32, height: u32) -> Result<FaceSignature, MatcherError> {
        let faces = self.encoder.locate(frame, width, height)?;
        match faces.as_slice() {
            [] => Err(MatcherError::NoFace),
            [face] => Ok(self.encoder.encode(frame, width, height, face)?),
            _ => Err(MatcherError::AmbiguousSubject { faces: faces.len() }),
        }
    }

    /// First registered student seen in the frame, if any.
    ///
    /// Every visible face is tried in detection order. A sighting with faces
    /// but no student means somebody unregistered is in view; it is not an error.
    pub fn recognize(
        &mut self,
        store: &mut IdentityStore,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Sighting, MatcherError> {
        let faces = self.encoder.locate(frame, width, height)?;
        let gallery = store.all()?;
        if gallery.is_empty() {
            return Ok(Sighting {
                faces: faces.len(),
                student_id: None,
            });
        }

        for face in &faces {
            let signature = self.encoder.encode(frame, width, height, face)?;
            let MatchResult { student_id, distance } = self.matcher.compare(&signature, gallery, self.tolerance);
            if let Some(id) = student_id {
                tracing::debug!(id = %id, distance = ?distance, "face recognized");
                return Ok(Sighting {
                    faces: faces.len(),
                    student_id: Some(id),
                });
            }
            tracing::trace!(closest = ?distance, "face not in gallery");
        }

        Ok(Sighting {
            faces: faces.len(),
            student_id: None,
        })
    }

    /// Register the single face in `frame` under `id`.
    ///
    /// The store is only touched once a signature has been extracted, so a
    /// rejected frame leaves existing registrations as they were.
    pub fn register(
        &mut self,
        store: &mut IdentityStore,
        id: &StudentId,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(), MatcherError> {
        let signature = self.extract_single(frame, width, height)?;
        store.add(id, &signature, Some((frame, width, height)))?;
        tracing::info!(id = %id, dim = signature.dim(), "face registered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FaceRegion;

    /// Scripted encoder: the first pixel of a frame selects a scene.
    ///
    /// Scene `n` shows one face per entry of `scenes[n]`, and each face
    /// encodes to the listed signature.
    struct SceneEncoder {
        scenes: Vec<Vec<Vec<f32>>>,
    }

    impl FaceEncoder for SceneEncoder {
        fn locate(&mut self, frame: &[u8], _w: u32, _h: u32) -> Result<Vec<FaceRegion>, EncoderError> {
            let scene = frame.first().copied().unwrap_or(0) as usize;
            let faces = self.scenes.get(scene).map(Vec::len).unwrap_or(0);
            Ok((0..faces)
                .map(|i| FaceRegion {
                    x: i as f32,
                    y: 0.0,
                    width: 1.0,
                    height: 1.0,
                    confidence: 0.9,
                })
                .collect())
        }

        fn encode(&mut self, frame: &[u8], _w: u32, _h: u32, face: &FaceRegion) -> Result<FaceSignature, EncoderError> {
            let scene = frame.first().copied().unwrap_or(0) as usize;
            let values = self.scenes[scene][face.x as usize].clone();
            Ok(FaceSignature::new(values))
        }
    }

    fn matcher(scenes: Vec<Vec<Vec<f32>>>) -> IdentityMatcher {
        IdentityMatcher::new(Box::new(SceneEncoder { scenes }), DEFAULT_TOLERANCE)
    }

    fn frame(scene: u8) -> Vec<u8> {
        vec![scene; 4]
    }

    fn id(s: &str) -> StudentId {
        s.parse().unwrap()
    }

    #[test]
    fn test_extract_single_requires_one_face() {
        let mut m = matcher(vec![vec![], vec![vec![1.0, 0.0]], vec![vec![1.0, 0.0], vec![0.0, 1.0]]]);
        assert!(matches!(m.extract_single(&frame(0), 2, 2), Err(MatcherError::NoFace)));
        assert_eq!(m.extract_single(&frame(1), 2, 2).unwrap().values, vec![1.0, 0.0]);
        assert!(matches!(
            m.extract_single(&frame(2), 2, 2),
            Err(MatcherError::AmbiguousSubject { faces: 2 })
        ));
    }

    #[test]
    fn test_register_rejects_two_faces_without_mutation() {
        let mut store = IdentityStore::open_in_memory().unwrap();
        store.add(&id("EXIST1"), &FaceSignature::new(vec![9.0, 9.0]), None).unwrap();

        let mut m = matcher(vec![vec![vec![1.0, 0.0], vec![0.0, 1.0]]]);
        let err = m.register(&mut store, &id("NEW1"), &frame(0), 2, 2).unwrap_err();
        assert!(matches!(err, MatcherError::AmbiguousSubject { faces: 2 }));
        assert!(err.is_subject_error());

        let all = store.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].student_id, id("EXIST1"));
    }

    #[test]
    fn test_register_then_recognize() {
        let mut store = IdentityStore::open_in_memory().unwrap();
        let mut m = matcher(vec![vec![vec![1.0, 0.0]], vec![vec![1.1, 0.1]], vec![vec![5.0, 5.0]]]);

        m.register(&mut store, &id("21CS001"), &frame(0), 2, 2).unwrap();
        assert_eq!(m.recognize(&mut store, &frame(1), 2, 2).unwrap().student_id, Some(id("21CS001")));
        let stranger = m.recognize(&mut store, &frame(2), 2, 2).unwrap();
        assert_eq!(stranger.student_id, None);
        assert!(stranger.is_stranger());
    }

    #[test]
    fn test_recognize_empty_store_still_counts_faces() {
        let mut store = IdentityStore::open_in_memory().unwrap();
        let mut m = matcher(vec![vec![vec![1.0, 0.0]]]);
        assert_eq!(
            m.recognize(&mut store, &frame(0), 2, 2).unwrap(),
            Sighting {
                faces: 1,
                student_id: None
            }
        );
    }

    #[test]
    fn test_empty_view_is_not_a_stranger() {
        let mut store = IdentityStore::open_in_memory().unwrap();
        store.add(&id("A1"), &FaceSignature::new(vec![1.0, 0.0]), None).unwrap();
        let mut m = matcher(vec![vec![]]);
        let sighting = m.recognize(&mut store, &frame(0), 2, 2).unwrap();
        assert_eq!(sighting.faces, 0);
        assert!(!sighting.is_stranger());
    }

    #[test]
    fn test_recognize_any_face_in_crowd() {
        // Recognition does not need an isolated subject.
        let mut store = IdentityStore::open_in_memory().unwrap();
        store.add(&id("B"), &FaceSignature::new(vec![0.0, 1.0]), None).unwrap();
        let mut m = matcher(vec![vec![vec![7.0, 7.0], vec![0.0, 1.05]]]);
        let sighting = m.recognize(&mut store, &frame(0), 2, 2).unwrap();
        assert_eq!(sighting.faces, 2);
        assert_eq!(sighting.student_id, Some(id("B")));
    }
}
