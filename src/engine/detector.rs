//! Primary face detector
//!
//! Runs the detection network on a whole frame and turns its output into
//! frame-space boxes. Two output layouts are understood:
//! - a single SSD DetectionOutput `[1, 1, N, 7]` of normalized rows
//! - `boxes` `[N, 5]` in network pixels plus integer `labels` `[N]`
//!
//! Every box is enlarged into a square around its center before it is
//! reported, so crops give the secondary networks some context.

use image::RgbImage;
use serde::Serialize;
use tracing::debug;

use crate::backend::{InferRequest, InferenceBackend, TensorView};
use crate::error::{CascadeError, Result};

use super::contract::{DetectionLayout, OutputBindings, BOXES_OBJECT_SIZE, SSD_OBJECT_SIZE};
use super::stage::{EnqueueStatus, ModelStage, StageConfig, StageKind};

/// Integer pixel rectangle in frame coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// One detected face
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Detection {
    pub label: i32,
    pub confidence: f32,
    pub location: BoundingBox,
}

/// Square enlargement applied to raw boxes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxAdjustment {
    pub enlarge: f32,
    pub dx: f32,
    pub dy: f32,
}

impl Default for BoxAdjustment {
    fn default() -> Self {
        Self {
            enlarge: 1.2,
            dx: 1.0,
            dy: 1.0,
        }
    }
}

impl BoxAdjustment {
    /// Square of side `enlarge * max(w, h)` around the box center
    ///
    /// The result is not clamped to the frame.
    pub fn apply(&self, raw: BoundingBox) -> BoundingBox {
        let center_x = raw.x + raw.width / 2;
        let center_y = raw.y + raw.height / 2;
        let max_side = raw.width.max(raw.height);

        let side = (self.enlarge * max_side as f32) as i32;

        BoundingBox {
            x: center_x - (self.dx * side as f32 / 2.0).floor() as i32,
            y: center_y - (self.dy * side as f32 / 2.0).floor() as i32,
            width: side,
            height: side,
        }
    }
}

/// Detection thresholds and box post-processing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    /// Detections must be strictly above this confidence
    pub threshold: f32,
    pub adjustment: BoxAdjustment,
    /// Log every proposal, including those below the threshold
    pub raw_output: bool,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            adjustment: BoxAdjustment::default(),
            raw_output: false,
        }
    }
}

/// Frame and network sizes used to map boxes back to the frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameGeometry {
    pub frame_width: f32,
    pub frame_height: f32,
    pub net_width: f32,
    pub net_height: f32,
}

/// Face detector stage with cached results
pub struct FaceDetector<B: InferenceBackend> {
    stage: ModelStage<B>,
    params: DetectionParams,
    frame_size: (u32, u32),
    results: Option<Vec<Detection>>,
}

impl<B: InferenceBackend> FaceDetector<B> {
    pub fn new(config: StageConfig, params: DetectionParams) -> Self {
        Self {
            stage: ModelStage::new(StageKind::FaceDetection, config),
            params,
            frame_size: (0, 0),
            results: None,
        }
    }

    pub fn stage(&self) -> &ModelStage<B> {
        &self.stage
    }

    pub fn stage_mut(&mut self) -> &mut ModelStage<B> {
        &mut self.stage
    }

    pub fn params(&self) -> &DetectionParams {
        &self.params
    }

    pub fn is_enabled(&self) -> bool {
        self.stage.is_enabled()
    }

    /// Replace the pending frame
    pub fn enqueue(&mut self, frame: &RgbImage) -> Result<EnqueueStatus> {
        let status = self.stage.enqueue(frame)?;
        if let EnqueueStatus::Queued(_) = status {
            self.frame_size = frame.dimensions();
            self.results = None;
        }
        Ok(status)
    }

    pub fn submit(&mut self) -> Result<()> {
        self.results = None;
        self.stage.submit()
    }

    pub fn wait(&mut self) -> Result<()> {
        self.stage.wait()
    }

    /// Drop the pending frame and any cached detections
    pub fn reset(&mut self) {
        self.stage.reset();
        self.results = None;
    }

    /// Detections of the last submitted frame, decoded once per submit
    pub fn fetch_results(&mut self) -> Result<&[Detection]> {
        if self.results.is_none() {
            let detections = self.decode()?;
            self.results = Some(detections);
        }
        Ok(self.results.as_deref().unwrap_or_default())
    }

    fn decode(&self) -> Result<Vec<Detection>> {
        let stage = StageKind::FaceDetection.display_name();
        let Some((bindings, request)) = self.stage.ready_outputs()? else {
            return Ok(Vec::new());
        };
        let OutputBindings::Detection(layout) = bindings else {
            return Err(CascadeError::contract(stage, "not a detection network"));
        };
        let Some(input) = self.stage.input() else {
            return Ok(Vec::new());
        };

        let geometry = FrameGeometry {
            frame_width: self.frame_size.0 as f32,
            frame_height: self.frame_size.1 as f32,
            net_width: input.width() as f32,
            net_height: input.height() as f32,
        };

        let detections = match layout {
            DetectionLayout::Ssd { output, max_proposals } => {
                decode_ssd(request.output(output)?, *max_proposals, &geometry, &self.params)?
            }
            DetectionLayout::BoxesLabels {
                boxes,
                labels,
                max_proposals,
            } => decode_boxes(
                request.output(boxes)?,
                request.output(labels)?,
                *max_proposals,
                &geometry,
                &self.params,
            )?,
        };

        debug!("{} faces detected", detections.len());
        Ok(detections)
    }
}

fn accept(proposal: usize, label: i32, confidence: f32, raw: BoundingBox, params: &DetectionParams) -> Option<Detection> {
    let location = params.adjustment.apply(raw);
    let detection = Detection {
        label,
        confidence,
        location,
    };

    if params.raw_output {
        let rendered = if confidence > params.threshold {
            " WILL BE RENDERED!"
        } else {
            ""
        };
        debug!(
            "[{},{}] element, prob = {:.6}    ({},{})-({},{}){}",
            proposal,
            label,
            confidence,
            location.x,
            location.y,
            location.width,
            location.height,
            rendered
        );
    }

    (confidence > params.threshold).then_some(detection)
}

/// Decode SSD rows `[image_id, label, conf, x_min, y_min, x_max, y_max]`
///
/// Decoding stops at the first row with a negative image id.
pub fn decode_ssd(
    output: TensorView<'_>,
    max_proposals: usize,
    geometry: &FrameGeometry,
    params: &DetectionParams,
) -> Result<Vec<Detection>> {
    let stage = StageKind::FaceDetection.display_name();
    let rows = output
        .as_f32()
        .map_err(|e| CascadeError::contract(stage, e.to_string()))?;

    let mut detections = Vec::new();
    for (i, row) in rows.chunks_exact(SSD_OBJECT_SIZE).take(max_proposals).enumerate() {
        if row[0] < 0.0 {
            break;
        }
        let confidence = row[2];
        if confidence <= params.threshold && !params.raw_output {
            continue;
        }

        let x = (row[3] * geometry.frame_width) as i32;
        let y = (row[4] * geometry.frame_height) as i32;
        let raw = BoundingBox {
            x,
            y,
            width: (row[5] * geometry.frame_width) as i32 - x,
            height: (row[6] * geometry.frame_height) as i32 - y,
        };

        detections.extend(accept(i, row[1] as i32, confidence, raw, params));
    }
    Ok(detections)
}

/// Decode `boxes` rows `[x_min, y_min, x_max, y_max, conf]` in network pixels
pub fn decode_boxes(
    boxes: TensorView<'_>,
    labels: TensorView<'_>,
    max_proposals: usize,
    geometry: &FrameGeometry,
    params: &DetectionParams,
) -> Result<Vec<Detection>> {
    let stage = StageKind::FaceDetection.display_name();
    let rows = boxes
        .as_f32()
        .map_err(|e| CascadeError::contract(stage, e.to_string()))?;
    let labels = labels
        .as_i32()
        .map_err(|e| CascadeError::contract(stage, e.to_string()))?;

    let scale_x = geometry.frame_width / geometry.net_width;
    let scale_y = geometry.frame_height / geometry.net_height;

    let mut detections = Vec::new();
    for (i, row) in rows.chunks_exact(BOXES_OBJECT_SIZE).take(max_proposals).enumerate() {
        let confidence = row[4];
        if confidence <= params.threshold && !params.raw_output {
            continue;
        }
        let label = labels.get(i).copied().ok_or_else(|| {
            CascadeError::contract(stage, format!("no label for proposal {}", i))
        })?;

        let x = (row[0] * scale_x) as i32;
        let y = (row[1] * scale_y) as i32;
        let raw = BoundingBox {
            x,
            y,
            width: (row[2] * scale_x) as i32 - x,
            height: (row[3] * scale_y) as i32 - y,
        };

        detections.extend(accept(i, label, confidence, raw, params));
    }
    Ok(detections)
}
