//! Service layer types

use crate::engine::{
    AgeGender, Detection, Emotions, FaceAttributes, HeadPose, Landmarks, Liveness, StageKind,
};
use crate::error::CascadeError;

/// Results of one secondary stage for one frame
///
/// `results[i]` belongs to the i-th face enqueued into the stage, which is
/// the i-th detection unless the stage ran out of batch capacity.
#[derive(Debug)]
pub struct StageOutput {
    pub kind: StageKind,
    pub results: Result<Vec<FaceAttributes>, CascadeError>,
}

/// Everything the cascade produced for one frame
#[derive(Debug, Default)]
pub struct FrameResults {
    pub detections: Vec<Detection>,
    pub stages: Vec<StageOutput>,
}

/// Per-face view joining detections with every stage result
#[derive(Debug, Clone, Copy)]
pub struct FaceSummary<'a> {
    pub detection: &'a Detection,
    pub age_gender: Option<&'a AgeGender>,
    pub head_pose: Option<&'a HeadPose>,
    pub emotions: Option<&'a Emotions>,
    pub landmarks: Option<&'a Landmarks>,
    pub liveness: Option<&'a Liveness>,
}

impl FrameResults {
    pub fn stage(&self, kind: StageKind) -> Option<&StageOutput> {
        self.stages.iter().find(|s| s.kind == kind)
    }

    /// Decoded results of a stage, `None` if it did not run or failed
    pub fn attributes(&self, kind: StageKind) -> Option<&[FaceAttributes]> {
        self.stage(kind)?.results.as_deref().ok()
    }

    /// Stages whose decode failed for this frame
    pub fn errors(&self) -> impl Iterator<Item = (StageKind, &CascadeError)> {
        self.stages
            .iter()
            .filter_map(|s| s.results.as_ref().err().map(|e| (s.kind, e)))
    }

    pub fn faces(&self) -> Vec<FaceSummary<'_>> {
        self.detections
            .iter()
            .enumerate()
            .map(|(i, detection)| {
                let mut summary = FaceSummary {
                    detection,
                    age_gender: None,
                    head_pose: None,
                    emotions: None,
                    landmarks: None,
                    liveness: None,
                };
                for output in &self.stages {
                    let Some(attributes) = output.results.as_ref().ok().and_then(|r| r.get(i)) else {
                        continue;
                    };
                    match attributes {
                        FaceAttributes::AgeGender(v) => summary.age_gender = Some(v),
                        FaceAttributes::HeadPose(v) => summary.head_pose = Some(v),
                        FaceAttributes::Emotions(v) => summary.emotions = Some(v),
                        FaceAttributes::Landmarks(v) => summary.landmarks = Some(v),
                        FaceAttributes::Antispoofing(v) => summary.liveness = Some(v),
                    }
                }
                summary
            })
            .collect()
    }
}
