//! Model stage
//!
//! One loaded network plus its batching state. A stage is created inert from
//! its configuration, becomes enabled (or permanently disabled) when bound,
//! and then cycles through enqueue → submit → wait → decode for every batch.

use std::fmt;
use std::path::PathBuf;

use image::RgbImage;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::{DeviceConfig, InferRequest, InferenceBackend};
use crate::error::{CascadeError, Result};

use super::attribute::{self, FaceAttributes};
use super::contract::{self, Contract, InputBinding, OutputBindings};
use super::preprocess;

/// The fixed set of networks the cascade knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    FaceDetection,
    AgeGender,
    HeadPose,
    Emotions,
    FacialLandmarks,
    Antispoofing,
}

impl StageKind {
    /// Stages that run on face crops, in submission order
    pub const SECONDARY: [StageKind; 5] = [
        StageKind::AgeGender,
        StageKind::HeadPose,
        StageKind::Emotions,
        StageKind::FacialLandmarks,
        StageKind::Antispoofing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::FaceDetection => "face_detection",
            StageKind::AgeGender => "age_gender",
            StageKind::HeadPose => "head_pose",
            StageKind::Emotions => "emotions",
            StageKind::FacialLandmarks => "landmarks",
            StageKind::Antispoofing => "antispoofing",
        }
    }

    /// Human readable name used in logs and errors
    pub const fn display_name(&self) -> &'static str {
        match self {
            StageKind::FaceDetection => "Face Detection",
            StageKind::AgeGender => "Age/Gender Recognition",
            StageKind::HeadPose => "Head Pose Estimation",
            StageKind::Emotions => "Emotions Recognition",
            StageKind::FacialLandmarks => "Facial Landmarks Estimation",
            StageKind::Antispoofing => "Antispoofing",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Construction-time settings of one stage
#[derive(Debug, Clone, PartialEq)]
pub struct StageConfig {
    /// Model artifact; empty disables the stage
    pub model: PathBuf,
    pub device: String,
    pub max_batch: usize,
    pub dynamic_batch: bool,
    pub async_mode: bool,
    pub raw_output: bool,
    /// Class names for label-mapping stages (emotions)
    pub labels: Vec<String>,
}

impl StageConfig {
    pub fn new(model: impl Into<PathBuf>, device: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            device: device.into(),
            max_batch: 1,
            dynamic_batch: false,
            async_mode: false,
            raw_output: false,
            labels: Vec::new(),
        }
    }

    /// A stage without a model path
    pub fn disabled() -> Self {
        Self::new(PathBuf::new(), "CPU")
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    pub fn with_dynamic_batch(mut self, dynamic_batch: bool) -> Self {
        self.dynamic_batch = dynamic_batch;
        self
    }

    pub fn with_async(mut self, async_mode: bool) -> Self {
        self.async_mode = async_mode;
        self
    }

    pub fn with_raw_output(mut self, raw_output: bool) -> Self {
        self.raw_output = raw_output;
        self
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn is_configured(&self) -> bool {
        !self.model.as_os_str().is_empty()
    }
}

/// Observable lifecycle position of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePhase {
    /// Configured but not bound yet
    Unbound,
    /// No model path; every operation is a no-op
    Disabled,
    /// Bound, nothing enqueued
    Idle,
    /// Inputs written, not submitted
    Enqueued,
    /// Asynchronous run started, `wait` pending
    InFlight,
    /// Outputs of the last submit can be decoded
    Ready,
}

/// Outcome of one `enqueue`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueStatus {
    /// Written into this batch slot
    Queued(usize),
    /// Batch already full; the input was dropped for this stage
    Dropped,
    /// Stage is disabled
    Skipped,
}

struct Bound<B: InferenceBackend> {
    // Owns the compiled network the request was created from.
    _model: B::Model,
    request: B::Request,
    contract: Contract,
    dynamic_batch: bool,
    request_batch: usize,
    enqueued: usize,
    last_batch: usize,
    phase: StagePhase,
}

enum State<B: InferenceBackend> {
    Unbound,
    Disabled,
    Bound(Bound<B>),
}

/// A single network of the cascade
pub struct ModelStage<B: InferenceBackend> {
    kind: StageKind,
    config: StageConfig,
    state: State<B>,
}

impl<B: InferenceBackend> ModelStage<B> {
    /// Create an inert stage; nothing is validated until `bind`
    pub fn new(kind: StageKind, mut config: StageConfig) -> Self {
        if kind == StageKind::FaceDetection {
            // One frame in, one frame out.
            config.max_batch = 1;
        }
        config.max_batch = config.max_batch.max(1);

        if config.async_mode {
            debug!("Use async mode for {}", kind);
        }

        Self {
            kind,
            config,
            state: State::Unbound,
        }
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.display_name()
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    /// True once the stage has been bound to a loaded model
    pub fn is_enabled(&self) -> bool {
        matches!(self.state, State::Bound(_))
    }

    pub fn phase(&self) -> StagePhase {
        match &self.state {
            State::Unbound => StagePhase::Unbound,
            State::Disabled => StagePhase::Disabled,
            State::Bound(bound) => bound.phase,
        }
    }

    pub fn max_batch(&self) -> usize {
        self.config.max_batch
    }

    /// Inputs written since the last submit
    pub fn enqueued(&self) -> usize {
        match &self.state {
            State::Bound(bound) => bound.enqueued,
            _ => 0,
        }
    }

    /// Size of the last submitted batch, zero once a new batch starts
    pub fn last_batch(&self) -> usize {
        match &self.state {
            State::Bound(bound) => bound.last_batch,
            _ => 0,
        }
    }

    /// Input layout of the bound model
    pub fn input(&self) -> Option<&InputBinding> {
        match &self.state {
            State::Bound(bound) => Some(&bound.contract.input),
            _ => None,
        }
    }

    /// Load, validate and allocate a request for the model
    ///
    /// A stage without a model path becomes permanently disabled without
    /// touching the backend.
    pub fn bind(&mut self, backend: &B, device_config: &DeviceConfig) -> Result<()> {
        if !self.config.is_configured() {
            if !matches!(self.state, State::Disabled) {
                info!("{} DISABLED", self.kind);
                self.state = State::Disabled;
            }
            return Ok(());
        }

        let mut model = backend.load_model(&self.config.model)?;
        backend.set_batch_size(&mut model, self.config.max_batch)?;
        backend.compile(&mut model, &self.config.device, device_config)?;

        let inputs = backend.input_info(&model)?;
        let outputs = backend.output_info(&model)?;
        let contract = contract::validate(self.kind, &inputs, &outputs)?;
        let request = backend.create_request(&model)?;

        debug!(
            "{} bound: input {} {:?}, outputs {:?}",
            self.kind, contract.input.name, contract.input.dims, contract.outputs
        );

        self.state = State::Bound(Bound {
            _model: model,
            request,
            request_batch: self.config.max_batch,
            contract,
            dynamic_batch: device_config.dynamic_batch,
            enqueued: 0,
            last_batch: 0,
            phase: StagePhase::Idle,
        });
        Ok(())
    }

    fn bound_mut(&mut self) -> Result<Option<&mut Bound<B>>> {
        match &mut self.state {
            State::Bound(bound) => Ok(Some(bound)),
            State::Disabled => Ok(None),
            State::Unbound if !self.config.is_configured() => Ok(None),
            State::Unbound => Err(CascadeError::NotBound(self.kind.display_name())),
        }
    }

    fn bound(&self) -> Result<Option<&Bound<B>>> {
        match &self.state {
            State::Bound(bound) => Ok(Some(bound)),
            State::Disabled => Ok(None),
            State::Unbound if !self.config.is_configured() => Ok(None),
            State::Unbound => Err(CascadeError::NotBound(self.kind.display_name())),
        }
    }

    /// Copy an image into the next free batch slot
    ///
    /// The face detector always writes slot 0 and replaces any frame that was
    /// not submitted yet. Other stages drop inputs once `max_batch` is reached.
    pub fn enqueue(&mut self, image: &RgbImage) -> Result<EnqueueStatus> {
        let kind = self.kind;
        let max_batch = self.config.max_batch;
        let Some(bound) = self.bound_mut()? else {
            return Ok(EnqueueStatus::Skipped);
        };

        match bound.phase {
            StagePhase::InFlight => return Err(CascadeError::ResultsPending(kind.display_name())),
            StagePhase::Ready | StagePhase::Idle => bound.last_batch = 0,
            _ => {}
        }

        let slot = if kind == StageKind::FaceDetection {
            0
        } else {
            if bound.enqueued == max_batch {
                warn!(
                    "{}",
                    CascadeError::CapacityExceeded {
                        stage: kind.display_name(),
                        max_batch,
                    }
                );
                return Ok(EnqueueStatus::Dropped);
            }
            bound.enqueued
        };

        let input = bound.request.input_mut(&bound.contract.input.name)?;
        preprocess::write_slot(kind.display_name(), image, input, slot)?;

        bound.enqueued = slot + 1;
        bound.phase = StagePhase::Enqueued;
        Ok(EnqueueStatus::Queued(slot))
    }

    /// Run the enqueued batch; no-op when nothing is enqueued
    ///
    /// The batch is consumed even when the backend fails, so a failed run
    /// never leaks inputs into the next batch.
    pub fn submit(&mut self) -> Result<()> {
        let async_mode = self.config.async_mode;
        let Some(bound) = self.bound_mut()? else {
            return Ok(());
        };
        if bound.enqueued == 0 {
            return Ok(());
        }

        let batch = bound.enqueued;
        bound.enqueued = 0;
        bound.last_batch = 0;
        bound.phase = StagePhase::Idle;

        if bound.dynamic_batch && batch != bound.request_batch {
            bound.request.set_batch(batch)?;
            bound.request_batch = batch;
        }

        if async_mode {
            bound.request.start_async()?;
            bound.phase = StagePhase::InFlight;
        } else {
            bound.request.infer()?;
            bound.phase = StagePhase::Ready;
        }

        bound.last_batch = batch;
        Ok(())
    }

    /// Block until the last asynchronous submit completes
    pub fn wait(&mut self) -> Result<()> {
        if !self.config.async_mode {
            return Ok(());
        }
        let Some(bound) = self.bound_mut()? else {
            return Ok(());
        };
        if bound.phase == StagePhase::InFlight {
            bound.phase = StagePhase::Idle;
            let batch = std::mem::take(&mut bound.last_batch);
            bound.request.wait()?;
            bound.last_batch = batch;
            bound.phase = StagePhase::Ready;
        }
        Ok(())
    }

    /// Drop any pending batch and settle an in-flight request
    ///
    /// Leaves the stage idle with no decodable results. A failing wait is
    /// logged, the stage is idle either way.
    pub fn reset(&mut self) {
        let kind = self.kind;
        let State::Bound(bound) = &mut self.state else {
            return;
        };
        if bound.phase == StagePhase::InFlight {
            if let Err(e) = bound.request.wait() {
                warn!("{}: discarding failed request: {}", kind, e);
            }
        }
        bound.enqueued = 0;
        bound.last_batch = 0;
        bound.phase = StagePhase::Idle;
    }

    /// Output bindings and request of a completed batch
    pub(crate) fn ready_outputs(&self) -> Result<Option<(&OutputBindings, &B::Request)>> {
        let Some(bound) = self.bound()? else {
            return Ok(None);
        };
        match bound.phase {
            StagePhase::InFlight => Err(CascadeError::ResultsPending(self.kind.display_name())),
            StagePhase::Ready => Ok(Some((&bound.contract.outputs, &bound.request))),
            _ => Ok(None),
        }
    }

    /// Decode the attributes of the face enqueued at `index` in the last batch
    pub fn decode(&self, index: usize) -> Result<FaceAttributes> {
        let stage = self.kind.display_name();
        let len = self.last_batch();
        if index >= len {
            return Err(CascadeError::IndexOutOfRange { stage, index, len });
        }
        let Some((bindings, request)) = self.ready_outputs()? else {
            return Err(CascadeError::IndexOutOfRange { stage, index, len: 0 });
        };

        attribute::decode(
            stage,
            bindings,
            request,
            index,
            &self.config.labels,
            self.config.raw_output,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::backend::{BackendCall, ScriptedBackend, ScriptedModel};

    const ANTISPOOF: &str = "antispoofing.xml";

    fn antispoof_backend(rows: usize) -> ScriptedBackend {
        let backend = ScriptedBackend::new();
        let mut prob = Vec::new();
        for i in 0..rows {
            prob.push(i as f32 / 100.0);
            prob.push(1.0 - i as f32 / 100.0);
        }
        backend.register(
            ANTISPOOF,
            ScriptedModel::new()
                .with_input("data", &[1, 3, 8, 8])
                .with_f32_output("prob", &[rows, 2], prob),
        );
        backend
    }

    fn face() -> RgbImage {
        RgbImage::from_pixel(8, 8, image::Rgb([10, 20, 30]))
    }

    fn bound_stage(backend: &ScriptedBackend, config: StageConfig) -> ModelStage<ScriptedBackend> {
        let mut stage = ModelStage::new(StageKind::Antispoofing, config);
        stage.bind(backend, &DeviceConfig::default()).unwrap();
        stage
    }

    #[test]
    fn test_disabled_stage_never_calls_backend() {
        let backend = antispoof_backend(1);
        let mut stage: ModelStage<ScriptedBackend> =
            ModelStage::new(StageKind::Antispoofing, StageConfig::disabled().with_async(true));

        assert!(!stage.is_enabled());
        stage.bind(&backend, &DeviceConfig::default()).unwrap();
        assert_eq!(stage.phase(), StagePhase::Disabled);
        assert_eq!(stage.enqueue(&face()).unwrap(), EnqueueStatus::Skipped);
        stage.submit().unwrap();
        stage.wait().unwrap();
        assert!(stage.decode(0).is_err());
        assert!(!stage.is_enabled());

        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_unbound_configured_stage_errors() {
        let mut stage: ModelStage<ScriptedBackend> =
            ModelStage::new(StageKind::Antispoofing, StageConfig::new(ANTISPOOF, "CPU"));
        assert!(matches!(stage.enqueue(&face()), Err(CascadeError::NotBound(_))));
    }

    #[test]
    fn test_bind_marks_enabled() {
        let backend = antispoof_backend(1);
        let stage = bound_stage(&backend, StageConfig::new(ANTISPOOF, "CPU").with_max_batch(4));
        assert!(stage.is_enabled());
        assert_eq!(stage.phase(), StagePhase::Idle);
        assert_eq!(stage.input().unwrap().dims, vec![4, 3, 8, 8]);
        assert!(backend
            .calls()
            .contains(&BackendCall::SetBatchSize { model: ANTISPOOF.into(), batch: 4 }));
    }

    #[test]
    fn test_bind_contract_violation() {
        let backend = ScriptedBackend::new();
        backend.register(
            ANTISPOOF,
            ScriptedModel::new()
                .with_input("data", &[1, 3, 8, 8])
                .with_f32_output("prob", &[1, 2], vec![0.5, 0.5])
                .with_f32_output("extra", &[1, 2], vec![0.5, 0.5]),
        );
        let mut stage = ModelStage::new(StageKind::Antispoofing, StageConfig::new(ANTISPOOF, "CPU"));
        let err = stage.bind(&backend, &DeviceConfig::default()).unwrap_err();
        assert!(err.is_contract_violation());
        assert!(!stage.is_enabled());
        assert_eq!(stage.phase(), StagePhase::Unbound);
    }

    #[test]
    fn test_capacity_exceeded_drops_input() {
        let backend = antispoof_backend(16);
        let mut stage = bound_stage(&backend, StageConfig::new(ANTISPOOF, "CPU").with_max_batch(16));

        for slot in 0..16 {
            assert_eq!(stage.enqueue(&face()).unwrap(), EnqueueStatus::Queued(slot));
        }
        assert_eq!(stage.enqueue(&face()).unwrap(), EnqueueStatus::Dropped);
        assert_eq!(stage.enqueued(), 16);

        stage.submit().unwrap();
        assert_eq!(stage.last_batch(), 16);
        assert_eq!(stage.enqueued(), 0);
    }

    #[test]
    fn test_submit_without_inputs_is_noop() {
        let backend = antispoof_backend(1);
        let mut stage = bound_stage(&backend, StageConfig::new(ANTISPOOF, "CPU"));
        let before = backend.calls().len();
        stage.submit().unwrap();
        assert_eq!(backend.calls().len(), before);
        assert_eq!(stage.phase(), StagePhase::Idle);
    }

    #[test]
    fn test_decode_bounds() {
        let backend = antispoof_backend(4);
        let mut stage = bound_stage(&backend, StageConfig::new(ANTISPOOF, "CPU").with_max_batch(4));
        stage.enqueue(&face()).unwrap();
        stage.enqueue(&face()).unwrap();
        stage.submit().unwrap();

        match stage.decode(1).unwrap() {
            FaceAttributes::Antispoofing(liveness) => {
                assert!((liveness.real_face_probability - 1.0).abs() < 1e-4);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(matches!(
            stage.decode(2),
            Err(CascadeError::IndexOutOfRange { index: 2, len: 2, .. })
        ));

        // A new batch invalidates the previous results.
        stage.enqueue(&face()).unwrap();
        assert!(matches!(stage.decode(0), Err(CascadeError::IndexOutOfRange { .. })));
    }

    #[test]
    fn test_async_requires_wait() {
        let backend = antispoof_backend(1);
        let mut stage = bound_stage(&backend, StageConfig::new(ANTISPOOF, "CPU").with_async(true));
        stage.enqueue(&face()).unwrap();
        stage.submit().unwrap();
        assert_eq!(stage.phase(), StagePhase::InFlight);
        assert!(matches!(stage.decode(0), Err(CascadeError::ResultsPending(_))));

        stage.wait().unwrap();
        assert_eq!(stage.phase(), StagePhase::Ready);
        assert!(stage.decode(0).is_ok());
    }

    #[test]
    fn test_sync_wait_skips_backend() {
        let backend = antispoof_backend(1);
        let mut stage = bound_stage(&backend, StageConfig::new(ANTISPOOF, "CPU"));
        stage.enqueue(&face()).unwrap();
        stage.submit().unwrap();
        stage.wait().unwrap();
        assert!(!backend.calls().contains(&BackendCall::Wait(ANTISPOOF.into())));
        assert!(backend.calls().contains(&BackendCall::Infer(ANTISPOOF.into())));
    }

    #[test]
    fn test_dynamic_batch_resizes_request() {
        let backend = antispoof_backend(8);
        let mut stage = ModelStage::new(
            StageKind::Antispoofing,
            StageConfig::new(ANTISPOOF, "CPU").with_max_batch(8),
        );
        stage
            .bind(&backend, &DeviceConfig { dynamic_batch: true })
            .unwrap();

        for _ in 0..3 {
            stage.enqueue(&face()).unwrap();
        }
        stage.submit().unwrap();
        for _ in 0..3 {
            stage.enqueue(&face()).unwrap();
        }
        stage.submit().unwrap();

        let resizes: Vec<_> = backend
            .calls_for(Path::new(ANTISPOOF))
            .into_iter()
            .filter(|c| matches!(c, BackendCall::SetBatch { .. }))
            .collect();
        assert_eq!(
            resizes,
            vec![BackendCall::SetBatch { model: ANTISPOOF.into(), batch: 3 }]
        );
    }

    #[test]
    fn test_failed_submit_consumes_batch() {
        let backend = antispoof_backend(4);
        let mut stage = bound_stage(&backend, StageConfig::new(ANTISPOOF, "CPU").with_max_batch(4));
        stage.enqueue(&face()).unwrap();
        stage.enqueue(&face()).unwrap();

        backend.fail_next_run(ANTISPOOF);
        assert!(matches!(stage.submit(), Err(CascadeError::Backend(_))));
        assert_eq!(stage.enqueued(), 0);
        assert_eq!(stage.last_batch(), 0);
        assert_eq!(stage.phase(), StagePhase::Idle);

        assert_eq!(stage.enqueue(&face()).unwrap(), EnqueueStatus::Queued(0));
        stage.submit().unwrap();
        assert_eq!(stage.last_batch(), 1);
        assert!(stage.decode(0).is_ok());
        assert!(stage.decode(1).is_err());
    }

    #[test]
    fn test_failed_async_start_leaves_stage_usable() {
        let backend = antispoof_backend(1);
        let mut stage = bound_stage(&backend, StageConfig::new(ANTISPOOF, "CPU").with_async(true));
        stage.enqueue(&face()).unwrap();

        backend.fail_next_run(ANTISPOOF);
        assert!(stage.submit().is_err());
        assert_eq!(stage.phase(), StagePhase::Idle);

        assert_eq!(stage.enqueue(&face()).unwrap(), EnqueueStatus::Queued(0));
        stage.submit().unwrap();
        stage.wait().unwrap();
        assert!(stage.decode(0).is_ok());
    }

    #[test]
    fn test_reset_settles_in_flight_request() {
        let backend = antispoof_backend(2);
        let mut stage = bound_stage(
            &backend,
            StageConfig::new(ANTISPOOF, "CPU").with_max_batch(2).with_async(true),
        );
        stage.enqueue(&face()).unwrap();
        stage.submit().unwrap();
        assert!(matches!(stage.enqueue(&face()), Err(CascadeError::ResultsPending(_))));

        stage.reset();
        assert_eq!(stage.phase(), StagePhase::Idle);
        assert_eq!(stage.enqueued(), 0);
        assert!(backend.calls().contains(&BackendCall::Wait(ANTISPOOF.into())));
        assert!(matches!(stage.decode(0), Err(CascadeError::IndexOutOfRange { len: 0, .. })));

        assert_eq!(stage.enqueue(&face()).unwrap(), EnqueueStatus::Queued(0));
        stage.enqueue(&face()).unwrap();
        stage.reset();
        assert_eq!(stage.enqueued(), 0);
    }

    #[test]
    fn test_detector_batch_forced_to_one() {
        let stage: ModelStage<ScriptedBackend> = ModelStage::new(
            StageKind::FaceDetection,
            StageConfig::new("fd.xml", "CPU").with_max_batch(8),
        );
        assert_eq!(stage.max_batch(), 1);
    }
}
