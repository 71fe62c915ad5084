//! Face cascade configuration

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::engine::attribute::default_emotion_labels;
use crate::engine::{BoxAdjustment, DetectionParams, StageConfig, StageKind};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub inference: InferenceConfig,
    pub detection: DetectionConfig,
    pub stages: StagesConfig,
    pub analytics: AnalyticsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Default device for every stage
    pub device: String,
    pub async_mode: bool,
    pub raw_output: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub model: PathBuf,
    pub device: Option<String>,
    pub threshold: f32,
    pub bb_enlarge_coefficient: f32,
    pub bb_dx_coefficient: f32,
    pub bb_dy_coefficient: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Empty disables the stage
    pub model: PathBuf,
    pub device: Option<String>,
    pub max_batch: usize,
    pub dynamic_batch: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    pub age_gender: ModelConfig,
    pub head_pose: ModelConfig,
    pub emotions: ModelConfig,
    pub landmarks: ModelConfig,
    pub antispoofing: ModelConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub emotion_labels: Vec<String>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            device: "CPU".to_string(),
            async_mode: false,
            raw_output: false,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            model: PathBuf::from("models/face-detection-adas-0001.xml"),
            device: None,
            threshold: 0.5,
            bb_enlarge_coefficient: 1.2,
            bb_dx_coefficient: 1.0,
            bb_dy_coefficient: 1.0,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: PathBuf::new(),
            device: None,
            max_batch: 16,
            dynamic_batch: false,
        }
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            emotion_labels: default_emotion_labels(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn default_path() -> &'static str {
        "config.toml"
    }

    fn model_config(&self, kind: StageKind) -> Option<&ModelConfig> {
        match kind {
            StageKind::FaceDetection => None,
            StageKind::AgeGender => Some(&self.stages.age_gender),
            StageKind::HeadPose => Some(&self.stages.head_pose),
            StageKind::Emotions => Some(&self.stages.emotions),
            StageKind::FacialLandmarks => Some(&self.stages.landmarks),
            StageKind::Antispoofing => Some(&self.stages.antispoofing),
        }
    }

    /// Construction settings for one stage
    pub fn stage_config(&self, kind: StageKind) -> StageConfig {
        let inference = &self.inference;

        let config = match self.model_config(kind) {
            None => {
                let device = self.detection.device.as_ref().unwrap_or(&inference.device);
                StageConfig::new(self.detection.model.clone(), device.clone()).with_max_batch(1)
            }
            Some(stage) => {
                let device = stage.device.as_ref().unwrap_or(&inference.device);
                StageConfig::new(stage.model.clone(), device.clone())
                    .with_max_batch(stage.max_batch)
                    .with_dynamic_batch(stage.dynamic_batch)
            }
        };

        let config = config
            .with_async(inference.async_mode)
            .with_raw_output(inference.raw_output);

        if kind == StageKind::Emotions {
            config.with_labels(self.analytics.emotion_labels.clone())
        } else {
            config
        }
    }

    pub fn detection_params(&self) -> DetectionParams {
        DetectionParams {
            threshold: self.detection.threshold,
            adjustment: BoxAdjustment {
                enlarge: self.detection.bb_enlarge_coefficient,
                dx: self.detection.bb_dx_coefficient,
                dy: self.detection.bb_dy_coefficient,
            },
            raw_output: self.inference.raw_output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.inference.device, "CPU");
        assert_eq!(config.detection.threshold, 0.5);
        assert_eq!(config.analytics.emotion_labels.len(), 5);

        let age_gender = config.stage_config(StageKind::AgeGender);
        assert!(!age_gender.is_configured());
        assert_eq!(age_gender.max_batch, 16);

        let detection = config.stage_config(StageKind::FaceDetection);
        assert!(detection.is_configured());
        assert_eq!(detection.max_batch, 1);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[inference]
device = "GPU"
async_mode = true

[detection]
threshold = 0.7
bb_enlarge_coefficient = 1.4

[stages.emotions]
model = "models/emotions.xml"
max_batch = 4
dynamic_batch = true

[stages.head_pose]
model = "models/head-pose.xml"
device = "CPU"

[analytics]
emotion_labels = ["calm", "joy"]
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.detection.threshold, 0.7);
        assert_eq!(config.detection.bb_dx_coefficient, 1.0);
        assert_eq!(config.detection_params().adjustment.enlarge, 1.4);

        let emotions = config.stage_config(StageKind::Emotions);
        assert_eq!(emotions.model, PathBuf::from("models/emotions.xml"));
        assert_eq!(emotions.device, "GPU");
        assert_eq!(emotions.max_batch, 4);
        assert!(emotions.dynamic_batch);
        assert!(emotions.async_mode);
        assert_eq!(emotions.labels, vec!["calm".to_string(), "joy".to_string()]);

        let head_pose = config.stage_config(StageKind::HeadPose);
        assert_eq!(head_pose.device, "CPU");
        assert_eq!(head_pose.max_batch, 16);
        assert!(head_pose.labels.is_empty());

        assert!(!config.stage_config(StageKind::Antispoofing).is_configured());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Config::load("does/not/exist.toml").is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[inference\ndevice = ").unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
