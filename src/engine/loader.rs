//! Stage loading
//!
//! Decides the per-device options for a stage and binds it to a backend.

use tracing::{info, warn};

use crate::backend::{supports_dynamic_batch, DeviceConfig, InferenceBackend};
use crate::error::Result;

use super::stage::ModelStage;

/// Device options a stage will be compiled with
pub fn device_config<B: InferenceBackend>(stage: &ModelStage<B>) -> DeviceConfig {
    let config = stage.config();
    let dynamic_batch = config.dynamic_batch && supports_dynamic_batch(&config.device);
    if config.dynamic_batch && !dynamic_batch {
        warn!(
            "{}: dynamic batch is not supported on {}, using a fixed batch",
            stage.kind(),
            config.device
        );
    }
    DeviceConfig { dynamic_batch }
}

/// Load a stage's model into `backend`
///
/// Stages without a model path are marked disabled and never reach the
/// backend.
pub fn load<B: InferenceBackend>(stage: &mut ModelStage<B>, backend: &B) -> Result<()> {
    if !stage.is_configured() {
        return stage.bind(backend, &DeviceConfig::default());
    }

    info!("Loading network files for {}", stage.kind());
    let device_config = device_config(stage);
    stage.bind(backend, &device_config)?;

    info!(
        "{} loaded from {} on {}",
        stage.kind(),
        stage.config().model.display(),
        stage.config().device
    );
    info!("\tBatch size is set to {}", stage.max_batch());
    if device_config.dynamic_batch {
        info!("\tDynamic batch enabled");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCall, ScriptedBackend, ScriptedModel};
    use crate::engine::stage::{StageConfig, StageKind};

    fn backend() -> ScriptedBackend {
        let backend = ScriptedBackend::new();
        backend.register(
            "hp.xml",
            ScriptedModel::new()
                .with_input("data", &[1, 3, 60, 60])
                .with_f32_output("angle_r_fc", &[1, 1], vec![0.0])
                .with_f32_output("angle_p_fc", &[1, 1], vec![0.0])
                .with_f32_output("angle_y_fc", &[1, 1], vec![0.0]),
        );
        backend
    }

    fn compiled_with(backend: &ScriptedBackend) -> Option<(String, bool)> {
        backend.calls().into_iter().find_map(|c| match c {
            BackendCall::Compile {
                device,
                dynamic_batch,
                ..
            } => Some((device, dynamic_batch)),
            _ => None,
        })
    }

    #[test]
    fn test_dynamic_batch_on_cpu() {
        let backend = backend();
        let mut stage = ModelStage::new(
            StageKind::HeadPose,
            StageConfig::new("hp.xml", "CPU")
                .with_max_batch(16)
                .with_dynamic_batch(true),
        );
        load(&mut stage, &backend).unwrap();
        assert!(stage.is_enabled());
        assert_eq!(compiled_with(&backend), Some(("CPU".to_string(), true)));
    }

    #[test]
    fn test_dynamic_batch_ignored_on_other_devices() {
        let backend = backend();
        let mut stage = ModelStage::new(
            StageKind::HeadPose,
            StageConfig::new("hp.xml", "MYRIAD").with_dynamic_batch(true),
        );
        load(&mut stage, &backend).unwrap();
        assert_eq!(compiled_with(&backend), Some(("MYRIAD".to_string(), false)));
    }

    #[test]
    fn test_load_order() {
        let backend = backend();
        let mut stage = ModelStage::new(
            StageKind::HeadPose,
            StageConfig::new("hp.xml", "CPU").with_max_batch(4),
        );
        load(&mut stage, &backend).unwrap();

        let calls = backend.calls();
        assert!(matches!(calls[0], BackendCall::LoadModel(_)));
        assert!(matches!(calls[1], BackendCall::SetBatchSize { batch: 4, .. }));
        assert!(matches!(calls[2], BackendCall::Compile { .. }));
        assert!(matches!(calls.last(), Some(BackendCall::CreateRequest(_))));
    }

    #[test]
    fn test_missing_model_file() {
        let backend = backend();
        let mut stage = ModelStage::new(StageKind::HeadPose, StageConfig::new("missing.xml", "CPU"));
        assert!(load(&mut stage, &backend).is_err());
        assert!(!stage.is_enabled());
    }

    #[test]
    fn test_unconfigured_stage_skips_backend() {
        let backend = backend();
        let mut stage: ModelStage<ScriptedBackend> =
            ModelStage::new(StageKind::Emotions, StageConfig::disabled());
        load(&mut stage, &backend).unwrap();
        assert!(!stage.is_enabled());
        assert!(backend.calls().is_empty());
    }
}
