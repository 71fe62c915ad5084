//! Inference engine module
//!
//! Provides the building blocks of the cascade:
//! - Model stages with batching and sync/async execution
//! - Tensor layout contracts per stage kind
//! - Detection and attribute decoders

pub mod attribute;
pub mod contract;
pub mod detector;
pub mod loader;
pub mod preprocess;
pub mod stage;

pub use attribute::{AgeGender, Emotions, FaceAttributes, HeadPose, Landmarks, Liveness};
pub use detector::{BoundingBox, BoxAdjustment, Detection, DetectionParams, FaceDetector};
pub use stage::{EnqueueStatus, ModelStage, StageConfig, StageKind, StagePhase};
