//! Scripted in-memory backend
//!
//! Serves fixed output tensors for registered model paths and records every
//! call it receives. Used to drive the cascade without a real runtime.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;
use tracing::debug;

use super::{
    DeviceConfig, InferRequest, InferenceBackend, OwnedTensor, TensorData, TensorInfo, TensorView,
    TensorViewMut,
};
use crate::error::BackendError;

/// A call received by the scripted backend
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    LoadModel(PathBuf),
    SetBatchSize { model: PathBuf, batch: usize },
    Compile {
        model: PathBuf,
        device: String,
        dynamic_batch: bool,
    },
    InputInfo(PathBuf),
    OutputInfo(PathBuf),
    CreateRequest(PathBuf),
    GetInput { model: PathBuf, name: String },
    GetOutput { model: PathBuf, name: String },
    SetBatch { model: PathBuf, batch: usize },
    Infer(PathBuf),
    StartAsync(PathBuf),
    Wait(PathBuf),
}

impl BackendCall {
    /// Model path the call was made for
    pub fn model(&self) -> &Path {
        match self {
            BackendCall::LoadModel(p)
            | BackendCall::InputInfo(p)
            | BackendCall::OutputInfo(p)
            | BackendCall::CreateRequest(p)
            | BackendCall::Infer(p)
            | BackendCall::StartAsync(p)
            | BackendCall::Wait(p) => p,
            BackendCall::SetBatchSize { model, .. }
            | BackendCall::Compile { model, .. }
            | BackendCall::GetInput { model, .. }
            | BackendCall::GetOutput { model, .. }
            | BackendCall::SetBatch { model, .. } => model,
        }
    }
}

type CallLog = Arc<Mutex<Vec<BackendCall>>>;
type FailureSet = Arc<Mutex<HashSet<PathBuf>>>;

/// Tensor layout and canned outputs of one model
#[derive(Debug, Clone, Default)]
pub struct ScriptedModel {
    inputs: Vec<TensorInfo>,
    outputs: Vec<OwnedTensor>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an f32 input
    pub fn with_input(mut self, name: &str, dims: &[usize]) -> Self {
        self.inputs.push(TensorInfo::f32(name, dims));
        self
    }

    pub fn with_output(mut self, name: &str, dims: &[usize], data: TensorData) -> Self {
        self.outputs.push(OwnedTensor {
            name: name.to_string(),
            dims: dims.to_vec(),
            data,
        });
        self
    }

    pub fn with_f32_output(self, name: &str, dims: &[usize], data: Vec<f32>) -> Self {
        self.with_output(name, dims, TensorData::F32(data))
    }

    pub fn with_i32_output(self, name: &str, dims: &[usize], data: Vec<i32>) -> Self {
        self.with_output(name, dims, TensorData::I32(data))
    }
}

/// Backend that replays scripted outputs
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    models: Mutex<HashMap<PathBuf, Arc<Mutex<ScriptedModel>>>>,
    calls: CallLog,
    failures: FailureSet,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model under a path
    pub fn register(&self, path: impl Into<PathBuf>, model: ScriptedModel) {
        self.models
            .lock()
            .insert(path.into(), Arc::new(Mutex::new(model)));
    }

    /// Replace the data served for one output; visible to the next run
    pub fn set_output(&self, path: &Path, name: &str, dims: &[usize], data: TensorData) -> bool {
        let models = self.models.lock();
        let Some(model) = models.get(path) else {
            return false;
        };
        let mut model = model.lock();
        match model.outputs.iter_mut().find(|t| t.name == name) {
            Some(tensor) => {
                tensor.dims = dims.to_vec();
                tensor.data = data;
                true
            }
            None => false,
        }
    }

    /// Make the next `infer` or `start_async` on `path` fail
    pub fn fail_next_run(&self, path: impl Into<PathBuf>) {
        self.failures.lock().insert(path.into());
    }

    /// Snapshot of every call received so far
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    /// Calls made for one model path
    pub fn calls_for(&self, path: &Path) -> Vec<BackendCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.model() == path)
            .cloned()
            .collect()
    }

    fn record(&self, call: BackendCall) {
        self.calls.lock().push(call);
    }
}

/// Model loaded from a [`ScriptedBackend`]
#[derive(Debug)]
pub struct ScriptedHandle {
    path: PathBuf,
    model: Arc<Mutex<ScriptedModel>>,
    inputs: Vec<TensorInfo>,
    compiled: bool,
}

impl InferenceBackend for ScriptedBackend {
    type Model = ScriptedHandle;
    type Request = ScriptedRequest;

    fn load_model(&self, path: &Path) -> Result<ScriptedHandle, BackendError> {
        self.record(BackendCall::LoadModel(path.to_path_buf()));
        let model = self
            .models
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("model file not found: {}", path.display()))?;
        let inputs = model.lock().inputs.clone();
        Ok(ScriptedHandle {
            path: path.to_path_buf(),
            model,
            inputs,
            compiled: false,
        })
    }

    fn set_batch_size(&self, model: &mut ScriptedHandle, batch: usize) -> Result<(), BackendError> {
        self.record(BackendCall::SetBatchSize {
            model: model.path.clone(),
            batch,
        });
        for input in model.inputs.iter_mut() {
            if let Some(n) = input.dims.first_mut() {
                *n = batch;
            }
        }
        Ok(())
    }

    fn compile(
        &self,
        model: &mut ScriptedHandle,
        device: &str,
        config: &DeviceConfig,
    ) -> Result<(), BackendError> {
        self.record(BackendCall::Compile {
            model: model.path.clone(),
            device: device.to_string(),
            dynamic_batch: config.dynamic_batch,
        });
        model.compiled = true;
        Ok(())
    }

    fn input_info(&self, model: &ScriptedHandle) -> Result<Vec<TensorInfo>, BackendError> {
        self.record(BackendCall::InputInfo(model.path.clone()));
        Ok(model.inputs.clone())
    }

    fn output_info(&self, model: &ScriptedHandle) -> Result<Vec<TensorInfo>, BackendError> {
        self.record(BackendCall::OutputInfo(model.path.clone()));
        let model = model.model.lock();
        Ok(model
            .outputs
            .iter()
            .map(|t| TensorInfo::new(t.name.clone(), &t.dims, t.data.element_type()))
            .collect())
    }

    fn create_request(&self, model: &ScriptedHandle) -> Result<ScriptedRequest, BackendError> {
        self.record(BackendCall::CreateRequest(model.path.clone()));
        if !model.compiled {
            return Err(anyhow!("{} has not been compiled", model.path.display()).into());
        }

        let inputs = model
            .inputs
            .iter()
            .map(|info| {
                let len = info.dims.iter().product();
                (info.name.clone(), (info.dims.clone(), vec![0.0f32; len]))
            })
            .collect();

        Ok(ScriptedRequest {
            path: model.path.clone(),
            model: model.model.clone(),
            calls: self.calls.clone(),
            failures: self.failures.clone(),
            inputs,
            outputs: HashMap::new(),
            batch: model.inputs.first().and_then(|i| i.dims.first().copied()).unwrap_or(1),
            pending: false,
        })
    }
}

/// Request created by a [`ScriptedBackend`]
#[derive(Debug)]
pub struct ScriptedRequest {
    path: PathBuf,
    model: Arc<Mutex<ScriptedModel>>,
    calls: CallLog,
    failures: FailureSet,
    inputs: HashMap<String, (Vec<usize>, Vec<f32>)>,
    outputs: HashMap<String, OwnedTensor>,
    batch: usize,
    pending: bool,
}

impl ScriptedRequest {
    /// Current contents of an input buffer
    pub fn input(&self, name: &str) -> Option<&[f32]> {
        self.inputs.get(name).map(|(_, data)| data.as_slice())
    }

    /// Batch requested through `set_batch`
    pub fn batch(&self) -> usize {
        self.batch
    }

    fn record(&self, call: BackendCall) {
        self.calls.lock().push(call);
    }

    fn injected_failure(&self) -> Result<(), BackendError> {
        if self.failures.lock().remove(&self.path) {
            return Err(anyhow!("scripted failure of {}", self.path.display()).into());
        }
        Ok(())
    }

    fn complete(&mut self) {
        let model = self.model.lock();
        self.outputs = model
            .outputs
            .iter()
            .map(|t| (t.name.clone(), t.clone()))
            .collect();
        self.pending = false;
        debug!("Scripted run of {} finished", self.path.display());
    }
}

impl InferRequest for ScriptedRequest {
    fn input_mut(&mut self, name: &str) -> Result<TensorViewMut<'_>, BackendError> {
        self.record(BackendCall::GetInput {
            model: self.path.clone(),
            name: name.to_string(),
        });
        let (dims, data) = self
            .inputs
            .get_mut(name)
            .ok_or_else(|| BackendError::UnknownTensor(name.to_string()))?;
        Ok(TensorViewMut { dims, data })
    }

    fn output(&self, name: &str) -> Result<TensorView<'_>, BackendError> {
        self.record(BackendCall::GetOutput {
            model: self.path.clone(),
            name: name.to_string(),
        });
        if self.pending {
            return Err(BackendError::Busy);
        }
        self.outputs
            .get(name)
            .map(OwnedTensor::view)
            .ok_or_else(|| BackendError::UnknownTensor(name.to_string()))
    }

    fn set_batch(&mut self, batch: usize) -> Result<(), BackendError> {
        self.record(BackendCall::SetBatch {
            model: self.path.clone(),
            batch,
        });
        self.batch = batch;
        Ok(())
    }

    fn infer(&mut self) -> Result<(), BackendError> {
        self.record(BackendCall::Infer(self.path.clone()));
        self.outputs.clear();
        self.injected_failure()?;
        self.complete();
        Ok(())
    }

    fn start_async(&mut self) -> Result<(), BackendError> {
        self.record(BackendCall::StartAsync(self.path.clone()));
        self.outputs.clear();
        self.injected_failure()?;
        self.pending = true;
        Ok(())
    }

    fn wait(&mut self) -> Result<(), BackendError> {
        self.record(BackendCall::Wait(self.path.clone()));
        if self.pending {
            self.complete();
        }
        Ok(())
    }
}
