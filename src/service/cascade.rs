//! Face cascade - per-frame orchestration
//!
//! Runs the face detector on a frame, crops every detection and feeds the
//! crops through all enabled secondary stages in one batch per stage.

use image::RgbImage;
use tracing::{debug, info, warn};

use crate::backend::InferenceBackend;
use crate::config::Config;
use crate::engine::preprocess::crop_face;
use crate::engine::{loader, EnqueueStatus, FaceDetector, ModelStage, StageKind};
use crate::error::Result;
use crate::utils::timer::{LatencyReport, LatencyTracker};

use super::types::{FrameResults, StageOutput};

pub const TIMER_TOTAL: &str = "total";
pub const TIMER_DETECTION: &str = "detection";
pub const TIMER_ANALYTICS: &str = "face_analytics";

/// Detector plus secondary stages sharing one backend
pub struct FaceCascade<B: InferenceBackend> {
    detector: FaceDetector<B>,
    stages: Vec<ModelStage<B>>,
    timer: LatencyTracker,
}

impl<B: InferenceBackend> FaceCascade<B> {
    /// Build every stage from configuration; nothing is loaded yet
    pub fn new(config: &Config) -> Self {
        let detector = FaceDetector::new(
            config.stage_config(StageKind::FaceDetection),
            config.detection_params(),
        );
        let stages = StageKind::SECONDARY
            .iter()
            .map(|&kind| ModelStage::new(kind, config.stage_config(kind)))
            .collect();
        Self::from_parts(detector, stages)
    }

    pub fn from_parts(detector: FaceDetector<B>, stages: Vec<ModelStage<B>>) -> Self {
        Self {
            detector,
            stages,
            timer: LatencyTracker::new(),
        }
    }

    /// Bind every stage to `backend`; the first failure aborts loading
    pub fn load(&mut self, backend: &B) -> Result<()> {
        loader::load(self.detector.stage_mut(), backend)?;
        for stage in self.stages.iter_mut() {
            loader::load(stage, backend)?;
        }

        let enabled: Vec<&str> = self
            .stages
            .iter()
            .filter(|s| s.is_enabled())
            .map(|s| s.name())
            .collect();
        info!("Face analytics enabled: {:?}", enabled);
        Ok(())
    }

    pub fn detector(&self) -> &FaceDetector<B> {
        &self.detector
    }

    pub fn stage(&self, kind: StageKind) -> Option<&ModelStage<B>> {
        self.stages.iter().find(|s| s.kind() == kind)
    }

    /// Run the whole cascade on one frame
    ///
    /// Decode failures of a secondary stage are reported in that stage's
    /// output; backend failures abort the frame.
    pub fn process(&mut self, frame: &RgbImage) -> Result<FrameResults> {
        if frame.width() == 0 || frame.height() == 0 {
            warn!("Skipping empty frame");
            return Ok(FrameResults::default());
        }

        // A previous frame may have failed halfway through.
        self.detector.reset();
        for stage in self.stages.iter_mut() {
            stage.reset();
        }

        self.timer.start(TIMER_TOTAL);

        self.timer.start(TIMER_DETECTION);
        self.detector.enqueue(frame)?;
        self.detector.submit()?;
        self.detector.wait()?;
        let detections = self.detector.fetch_results()?.to_vec();
        self.timer.finish(TIMER_DETECTION)?;

        self.timer.start(TIMER_ANALYTICS);
        let mut queued = vec![0usize; self.stages.len()];
        for detection in &detections {
            let Some(crop) = crop_face(frame, &detection.location) else {
                continue;
            };
            for (stage, count) in self.stages.iter_mut().zip(queued.iter_mut()) {
                if let EnqueueStatus::Queued(_) = stage.enqueue(&crop)? {
                    *count += 1;
                }
            }
        }

        for stage in self.stages.iter_mut() {
            stage.submit()?;
        }
        for stage in self.stages.iter_mut() {
            stage.wait()?;
        }

        let mut outputs = Vec::new();
        for (stage, &count) in self.stages.iter().zip(queued.iter()) {
            if !stage.is_enabled() {
                continue;
            }
            let results = (0..count).map(|i| stage.decode(i)).collect::<Result<Vec<_>>>();
            if let Err(e) = &results {
                warn!("{}", e);
            }
            outputs.push(StageOutput {
                kind: stage.kind(),
                results,
            });
        }
        self.timer.finish(TIMER_ANALYTICS)?;
        self.timer.finish(TIMER_TOTAL)?;

        debug!(
            "Frame processed: {} faces, {} analytics stages",
            detections.len(),
            outputs.len()
        );

        Ok(FrameResults {
            detections,
            stages: outputs,
        })
    }

    pub fn latency_tracker(&self) -> &LatencyTracker {
        &self.timer
    }

    pub fn latency_report(&self) -> LatencyReport {
        self.timer.report()
    }
}
