//! Inference backend capability
//!
//! The cascade never runs a network itself. It talks to a backend that can:
//! - read a model artifact and report its tensor layout
//! - compile it for a device
//! - hand out inference requests with named input/output tensors
//!
//! Output views borrow the request, so they cannot be held across the next
//! submit on that request.

#[cfg(any(test, feature = "testing"))]
pub mod scripted;

#[cfg(feature = "openvino")]
pub mod openvino;

use std::path::Path;

use crate::error::BackendError;

#[cfg(any(test, feature = "testing"))]
pub use scripted::{BackendCall, ScriptedBackend, ScriptedModel};

#[cfg(feature = "openvino")]
pub use self::openvino::OpenVinoBackend;

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    F32,
    I32,
}

impl ElementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::F32 => "f32",
            ElementType::I32 => "i32",
        }
    }
}

/// Shape descriptor of a model input or output
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub name: String,
    pub dims: Vec<usize>,
    pub element_type: ElementType,
}

impl TensorInfo {
    pub fn new(name: impl Into<String>, dims: &[usize], element_type: ElementType) -> Self {
        Self {
            name: name.into(),
            dims: dims.to_vec(),
            element_type,
        }
    }

    pub fn f32(name: impl Into<String>, dims: &[usize]) -> Self {
        Self::new(name, dims, ElementType::F32)
    }

    pub fn i32(name: impl Into<String>, dims: &[usize]) -> Self {
        Self::new(name, dims, ElementType::I32)
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn last_dim(&self) -> Option<usize> {
        self.dims.last().copied()
    }

    /// Dimension at index 1 (channels for NCHW, columns for [N, C])
    pub fn channels(&self) -> Option<usize> {
        self.dims.get(1).copied()
    }
}

/// Owned tensor contents
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

impl TensorData {
    pub fn element_type(&self) -> ElementType {
        match self {
            TensorData::F32(_) => ElementType::F32,
            TensorData::I32(_) => ElementType::I32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tensor held by a request
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedTensor {
    pub name: String,
    pub dims: Vec<usize>,
    pub data: TensorData,
}

impl OwnedTensor {
    pub fn view(&self) -> TensorView<'_> {
        let data = match &self.data {
            TensorData::F32(v) => TensorSlice::F32(v),
            TensorData::I32(v) => TensorSlice::I32(v),
        };
        TensorView {
            name: &self.name,
            dims: &self.dims,
            data,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum TensorSlice<'a> {
    F32(&'a [f32]),
    I32(&'a [i32]),
}

/// Read-only view of an output tensor, valid until the request is reused
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
    name: &'a str,
    dims: &'a [usize],
    data: TensorSlice<'a>,
}

impl<'a> TensorView<'a> {
    pub fn new(name: &'a str, dims: &'a [usize], data: TensorSlice<'a>) -> Self {
        Self { name, dims, data }
    }

    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn dims(&self) -> &'a [usize] {
        self.dims
    }

    pub fn element_type(&self) -> ElementType {
        match self.data {
            TensorSlice::F32(_) => ElementType::F32,
            TensorSlice::I32(_) => ElementType::I32,
        }
    }

    pub fn as_f32(&self) -> Result<&'a [f32], BackendError> {
        match self.data {
            TensorSlice::F32(v) => Ok(v),
            TensorSlice::I32(_) => Err(self.type_mismatch(ElementType::F32)),
        }
    }

    pub fn as_i32(&self) -> Result<&'a [i32], BackendError> {
        match self.data {
            TensorSlice::I32(v) => Ok(v),
            TensorSlice::F32(_) => Err(self.type_mismatch(ElementType::I32)),
        }
    }

    fn type_mismatch(&self, expected: ElementType) -> BackendError {
        BackendError::ElementType {
            name: self.name.to_string(),
            expected: expected.as_str(),
            actual: self.element_type().as_str(),
        }
    }
}

/// Writable view of an input tensor (planar f32, sized for the max batch)
#[derive(Debug)]
pub struct TensorViewMut<'a> {
    pub dims: &'a [usize],
    pub data: &'a mut [f32],
}

/// Device-specific options applied when a model is compiled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Allow the request batch to be resized per submit
    pub dynamic_batch: bool,
}

/// Only CPU and GPU plugins can resize the batch of a compiled network
pub fn supports_dynamic_batch(device: &str) -> bool {
    device.contains("CPU") || device.contains("GPU")
}

/// A runtime that loads models and creates inference requests
pub trait InferenceBackend {
    type Model;
    type Request: InferRequest;

    /// Read a model artifact from disk
    fn load_model(&self, path: &Path) -> Result<Self::Model, BackendError>;

    /// Set the maximum batch the model is compiled for
    fn set_batch_size(&self, model: &mut Self::Model, batch: usize) -> Result<(), BackendError>;

    /// Compile the model for a device
    fn compile(
        &self,
        model: &mut Self::Model,
        device: &str,
        config: &DeviceConfig,
    ) -> Result<(), BackendError>;

    fn input_info(&self, model: &Self::Model) -> Result<Vec<TensorInfo>, BackendError>;

    fn output_info(&self, model: &Self::Model) -> Result<Vec<TensorInfo>, BackendError>;

    /// Allocate an inference request for a compiled model
    fn create_request(&self, model: &Self::Model) -> Result<Self::Request, BackendError>;
}

/// One inference request with its bound tensors
pub trait InferRequest {
    fn input_mut(&mut self, name: &str) -> Result<TensorViewMut<'_>, BackendError>;

    fn output(&self, name: &str) -> Result<TensorView<'_>, BackendError>;

    /// Resize the batch used by the next run (dynamic batch only)
    fn set_batch(&mut self, batch: usize) -> Result<(), BackendError>;

    /// Run and block until the outputs are ready
    fn infer(&mut self) -> Result<(), BackendError>;

    /// Start a run and return immediately
    fn start_async(&mut self) -> Result<(), BackendError>;

    /// Block until the last `start_async` completes
    fn wait(&mut self) -> Result<(), BackendError>;
}
