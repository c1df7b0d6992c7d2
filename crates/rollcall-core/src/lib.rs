//! rollcall-core: Identity resolution for the attendance station.
//!
//! Locates faces and extracts signatures (SCRFD + ArcFace via ONNX
//! Runtime), matches them against the registered students, persists the
//! registrations, and reads printed ID codes for the registration fallback.

pub mod code;
pub mod encoder;
pub mod matcher;
pub mod store;
pub mod types;

pub use code::{CodeDecoder, CodeFamily, CodeReader, CodeScanner, LinearDecoder, QrDecoder};
pub use encoder::{EncoderError, FaceEncoder, OnnxFaceEncoder};
pub use matcher::{IdentityMatcher, MatcherError, Sighting, DEFAULT_TOLERANCE};
pub use store::{IdentityStore, Removal, StoreError};
pub use types::{Enrollment, FaceRegion, FaceSignature, FirstMatch, MatchResult, Matcher, StudentId};
