//! Face attribute decoders
//!
//! Turns the raw outputs of the secondary stages into typed per-face
//! attributes. Each decoder reads one batch row and never looks past the end
//! of the tensor it was given.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::backend::{InferRequest, TensorView};
use crate::error::{CascadeError, Result};

use super::contract::OutputBindings;

/// Default label set of the emotions network, in output order
pub const DEFAULT_EMOTION_LABELS: [&str; 5] = ["neutral", "happy", "sad", "surprise", "anger"];

pub fn default_emotion_labels() -> Vec<String> {
    DEFAULT_EMOTION_LABELS.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AgeGender {
    /// Years
    pub age: f32,
    pub male_probability: f32,
}

impl AgeGender {
    pub fn is_male(&self) -> bool {
        self.male_probability > 0.5
    }
}

/// Euler angles in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeadPose {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
}

/// Probability per emotion label
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Emotions(pub BTreeMap<String, f32>);

impl Emotions {
    /// Label with the highest probability
    pub fn dominant(&self) -> Option<(&str, f32)> {
        self.0
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(label, p)| (label.as_str(), *p))
    }

    pub fn get(&self, label: &str) -> Option<f32> {
        self.0.get(label).copied()
    }
}

/// Landmark points, normalized to the face crop
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Landmarks(pub Vec<(f32, f32)>);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Liveness {
    /// Percent, 0..100
    pub real_face_probability: f32,
}

/// Decoded output of one secondary stage for one face
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceAttributes {
    AgeGender(AgeGender),
    HeadPose(HeadPose),
    Emotions(Emotions),
    Landmarks(Landmarks),
    Antispoofing(Liveness),
}

/// Decode batch row `index` of a completed request
pub fn decode<R: InferRequest>(
    stage: &'static str,
    bindings: &OutputBindings,
    request: &R,
    index: usize,
    labels: &[String],
    raw_output: bool,
) -> Result<FaceAttributes> {
    let attributes = match bindings {
        OutputBindings::AgeGender { age, gender } => FaceAttributes::AgeGender(decode_age_gender(
            stage,
            request.output(age)?,
            request.output(gender)?,
            index,
        )?),
        OutputBindings::HeadPose { roll, pitch, yaw } => FaceAttributes::HeadPose(decode_head_pose(
            stage,
            request.output(roll)?,
            request.output(pitch)?,
            request.output(yaw)?,
            index,
        )?),
        OutputBindings::Emotions { output } => FaceAttributes::Emotions(decode_emotions(
            stage,
            request.output(output)?,
            index,
            labels,
        )?),
        OutputBindings::Landmarks { output } => {
            FaceAttributes::Landmarks(decode_landmarks(stage, request.output(output)?, index)?)
        }
        OutputBindings::Antispoofing { probability } => FaceAttributes::Antispoofing(
            decode_liveness(stage, request.output(probability)?, index)?,
        ),
        OutputBindings::Detection(_) => {
            return Err(CascadeError::contract(
                stage,
                "detections are decoded by the face detector",
            ))
        }
    };

    if raw_output {
        debug!("[{}] {}: {:?}", index, stage, attributes);
    }
    Ok(attributes)
}

fn values<'a>(stage: &'static str, view: &TensorView<'a>) -> Result<&'a [f32]> {
    view.as_f32()
        .map_err(|e| CascadeError::contract(stage, e.to_string()))
}

fn value_at(stage: &'static str, view: &TensorView<'_>, i: usize) -> Result<f32> {
    values(stage, view)?.get(i).copied().ok_or_else(|| {
        CascadeError::contract(
            stage,
            format!(
                "output '{}' {:?} has no element {}",
                view.name(),
                view.dims(),
                i
            ),
        )
    })
}

fn row<'a>(stage: &'static str, view: &TensorView<'a>, start: usize, len: usize) -> Result<&'a [f32]> {
    values(stage, view)?.get(start..start + len).ok_or_else(|| {
        CascadeError::contract(
            stage,
            format!(
                "output '{}' {:?} has no elements {}..{}",
                view.name(),
                view.dims(),
                start,
                start + len
            ),
        )
    })
}

pub fn decode_age_gender(
    stage: &'static str,
    age: TensorView<'_>,
    gender: TensorView<'_>,
    index: usize,
) -> Result<AgeGender> {
    Ok(AgeGender {
        age: value_at(stage, &age, index)? * 100.0,
        male_probability: value_at(stage, &gender, index * 2 + 1)?,
    })
}

pub fn decode_head_pose(
    stage: &'static str,
    roll: TensorView<'_>,
    pitch: TensorView<'_>,
    yaw: TensorView<'_>,
    index: usize,
) -> Result<HeadPose> {
    Ok(HeadPose {
        yaw: value_at(stage, &yaw, index)?,
        pitch: value_at(stage, &pitch, index)?,
        roll: value_at(stage, &roll, index)?,
    })
}

pub fn decode_emotions(
    stage: &'static str,
    output: TensorView<'_>,
    index: usize,
    labels: &[String],
) -> Result<Emotions> {
    let channels = output.dims().get(1).copied().unwrap_or(0);
    if channels != labels.len() {
        return Err(CascadeError::contract(
            stage,
            format!(
                "output size ({}) of the emotions network is not equal to the number of labels ({})",
                channels,
                labels.len()
            ),
        ));
    }

    let probs = row(stage, &output, index * channels, channels)?;
    Ok(Emotions(
        labels.iter().cloned().zip(probs.iter().copied()).collect(),
    ))
}

pub fn decode_landmarks(stage: &'static str, output: TensorView<'_>, index: usize) -> Result<Landmarks> {
    let values_per_face = output.dims().get(1).copied().unwrap_or(0);
    let normed = row(stage, &output, index * values_per_face, values_per_face)?;

    Ok(Landmarks(
        normed.chunks_exact(2).map(|p| (p[0], p[1])).collect(),
    ))
}

pub fn decode_liveness(stage: &'static str, output: TensorView<'_>, index: usize) -> Result<Liveness> {
    Ok(Liveness {
        real_face_probability: value_at(stage, &output, index * 2)? * 100.0,
    })
}
