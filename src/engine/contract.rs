//! Tensor layout contracts
//!
//! Every stage kind expects a fixed input/output layout from its model. The
//! expectations live in one table; `validate` checks a model against the
//! entry for its kind and resolves the tensor names the decoders read.

use crate::backend::{ElementType, TensorInfo};
use crate::error::{CascadeError, Result};

use super::stage::StageKind;

/// Output names of the head pose network
pub const HEAD_POSE_ROLL: &str = "angle_r_fc";
pub const HEAD_POSE_PITCH: &str = "angle_p_fc";
pub const HEAD_POSE_YAW: &str = "angle_y_fc";

/// Output name of the facial landmarks network
pub const LANDMARKS_OUTPUT: &str = "align_fc3";

/// 35 (x, y) pairs
pub const LANDMARKS_VALUES: usize = 70;

/// Width of one SSD DetectionOutput row
pub const SSD_OBJECT_SIZE: usize = 7;

/// Width of one row of the `boxes` output
pub const BOXES_OBJECT_SIZE: usize = 5;

/// One named output a kind requires
#[derive(Debug, Clone, Copy)]
struct NamedOutput {
    name: &'static str,
    last_dim: Option<usize>,
}

/// Expected shape table entry
#[derive(Debug, Clone, Copy)]
struct Expectation {
    /// Exact number of outputs, if fixed
    outputs: Option<usize>,
    /// Outputs that must exist by name
    named: &'static [NamedOutput],
    /// Channel dimension every output must have
    channels: Option<usize>,
}

const fn expectation(kind: StageKind) -> Expectation {
    match kind {
        // Either one SSD output or boxes + labels; resolved by detection_layout.
        StageKind::FaceDetection => Expectation {
            outputs: None,
            named: &[],
            channels: None,
        },
        StageKind::AgeGender => Expectation {
            outputs: Some(2),
            named: &[],
            channels: None,
        },
        StageKind::HeadPose => Expectation {
            outputs: None,
            named: &[
                NamedOutput { name: HEAD_POSE_ROLL, last_dim: None },
                NamedOutput { name: HEAD_POSE_PITCH, last_dim: None },
                NamedOutput { name: HEAD_POSE_YAW, last_dim: None },
            ],
            channels: None,
        },
        // Channel count is checked against the label set when decoding.
        StageKind::Emotions => Expectation {
            outputs: Some(1),
            named: &[],
            channels: None,
        },
        StageKind::FacialLandmarks => Expectation {
            outputs: None,
            named: &[NamedOutput {
                name: LANDMARKS_OUTPUT,
                last_dim: Some(LANDMARKS_VALUES),
            }],
            channels: None,
        },
        StageKind::Antispoofing => Expectation {
            outputs: Some(1),
            named: &[],
            channels: Some(2),
        },
    }
}

/// The image input of a stage, NCHW
#[derive(Debug, Clone, PartialEq)]
pub struct InputBinding {
    pub name: String,
    pub dims: Vec<usize>,
}

impl InputBinding {
    pub fn batch(&self) -> usize {
        self.dims[0]
    }

    pub fn channels(&self) -> usize {
        self.dims[1]
    }

    pub fn height(&self) -> usize {
        self.dims[2]
    }

    pub fn width(&self) -> usize {
        self.dims[3]
    }
}

/// Output format of the primary detector
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionLayout {
    /// Single [1, 1, N, 7] tensor of normalized rows
    Ssd { output: String, max_proposals: usize },
    /// `boxes` [N, 5] in network pixels plus I32 `labels` [N]
    BoxesLabels {
        boxes: String,
        labels: String,
        max_proposals: usize,
    },
}

/// Resolved output names, per stage kind
#[derive(Debug, Clone, PartialEq)]
pub enum OutputBindings {
    Detection(DetectionLayout),
    AgeGender { age: String, gender: String },
    HeadPose { roll: String, pitch: String, yaw: String },
    Emotions { output: String },
    Landmarks { output: String },
    Antispoofing { probability: String },
}

/// A validated model layout
#[derive(Debug, Clone, PartialEq)]
pub struct Contract {
    pub input: InputBinding,
    pub outputs: OutputBindings,
}

/// Check a model layout against the expectations for `kind`
pub fn validate(kind: StageKind, inputs: &[TensorInfo], outputs: &[TensorInfo]) -> Result<Contract> {
    let stage = kind.display_name();

    if inputs.len() != 1 {
        return Err(CascadeError::contract(
            stage,
            format!("network should have only one input, found {}", inputs.len()),
        ));
    }
    let input = &inputs[0];
    if input.rank() != 4 {
        return Err(CascadeError::contract(
            stage,
            format!("input '{}' should be NCHW, got dims {:?}", input.name, input.dims),
        ));
    }
    let input = InputBinding {
        name: input.name.clone(),
        dims: input.dims.clone(),
    };

    let expected = expectation(kind);

    if let Some(count) = expected.outputs {
        if outputs.len() != count {
            return Err(CascadeError::contract(
                stage,
                format!(
                    "network should have {} output layer(s), found {}",
                    count,
                    outputs.len()
                ),
            ));
        }
    }

    for required in expected.named {
        let output = find(outputs, required.name).ok_or_else(|| {
            CascadeError::contract(stage, format!("there is no {} output in the network", required.name))
        })?;
        if let Some(last) = required.last_dim {
            if output.last_dim() != Some(last) {
                return Err(CascadeError::contract(
                    stage,
                    format!(
                        "output '{}' should have {} as the last dimension, got dims {:?}",
                        output.name, last, output.dims
                    ),
                ));
            }
        }
    }

    if let Some(channels) = expected.channels {
        if let Some(bad) = outputs.iter().find(|o| o.channels() != Some(channels)) {
            return Err(CascadeError::contract(
                stage,
                format!(
                    "output '{}' should have {} channels, got dims {:?}",
                    bad.name, channels, bad.dims
                ),
            ));
        }
    }

    let bindings = match kind {
        StageKind::FaceDetection => OutputBindings::Detection(detection_layout(outputs)?),
        StageKind::AgeGender => age_gender_bindings(outputs)?,
        StageKind::HeadPose => OutputBindings::HeadPose {
            roll: HEAD_POSE_ROLL.to_string(),
            pitch: HEAD_POSE_PITCH.to_string(),
            yaw: HEAD_POSE_YAW.to_string(),
        },
        StageKind::Emotions => OutputBindings::Emotions {
            output: outputs[0].name.clone(),
        },
        StageKind::FacialLandmarks => OutputBindings::Landmarks {
            output: LANDMARKS_OUTPUT.to_string(),
        },
        StageKind::Antispoofing => OutputBindings::Antispoofing {
            probability: outputs[0].name.clone(),
        },
    };

    Ok(Contract {
        input,
        outputs: bindings,
    })
}

fn find<'a>(outputs: &'a [TensorInfo], name: &str) -> Option<&'a TensorInfo> {
    outputs.iter().find(|o| o.name == name)
}

fn detection_layout(outputs: &[TensorInfo]) -> Result<DetectionLayout> {
    let stage = StageKind::FaceDetection.display_name();

    if let [output] = outputs {
        if output.last_dim() != Some(SSD_OBJECT_SIZE) {
            return Err(CascadeError::contract(
                stage,
                format!(
                    "output layer should have {} as a last dimension, got dims {:?}",
                    SSD_OBJECT_SIZE, output.dims
                ),
            ));
        }
        if output.rank() != 4 {
            return Err(CascadeError::contract(
                stage,
                format!("output should have 4 dimensions, but had {}", output.rank()),
            ));
        }
        return Ok(DetectionLayout::Ssd {
            output: output.name.clone(),
            max_proposals: output.dims[2],
        });
    }

    let boxes = outputs
        .iter()
        .find(|o| o.rank() == 2 && o.last_dim() == Some(BOXES_OBJECT_SIZE));
    let labels = outputs
        .iter()
        .find(|o| o.rank() == 1 && o.element_type == ElementType::I32);

    match (boxes, labels) {
        (Some(boxes), Some(labels)) => Ok(DetectionLayout::BoxesLabels {
            boxes: boxes.name.clone(),
            labels: labels.name.clone(),
            max_proposals: boxes.dims[0],
        }),
        _ => Err(CascadeError::contract(
            stage,
            "network must contain either single DetectionOutput or 'boxes' [nx5] and 'labels' [n] \
             at least, where 'n' is a number of detected objects",
        )),
    }
}

fn age_gender_bindings(outputs: &[TensorInfo]) -> Result<OutputBindings> {
    let stage = StageKind::AgeGender.display_name();
    let age = outputs.iter().find(|o| o.channels() == Some(1));
    let gender = outputs.iter().find(|o| o.channels() == Some(2));

    match (age, gender) {
        (Some(age), Some(gender)) => Ok(OutputBindings::AgeGender {
            age: age.name.clone(),
            gender: gender.name.clone(),
        }),
        _ => Err(CascadeError::contract(
            stage,
            format!(
                "expected an age output [N, 1] and a gender output [N, 2], got {:?}",
                outputs.iter().map(|o| (&o.name, &o.dims)).collect::<Vec<_>>()
            ),
        )),
    }
}
