//! OpenVINO backend
//!
//! Reads IR/ONNX models with an OpenVINO `Core`, compiles them for the
//! requested device and runs them through `InferRequest`s. Outputs are copied
//! out of the runtime tensors once a run completes.
//!
//! A batch larger than the one the network was exported with runs as several
//! back-to-back requests of the native batch; their outputs are concatenated
//! along the batch dimension. Only f32 and i32 tensors are supported.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use openvino::{CompiledModel, Core, ElementType as OvElementType, InferRequest as OvRequest, Model, Shape, Tensor};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{
    DeviceConfig, ElementType, InferRequest, InferenceBackend, OwnedTensor, TensorData, TensorInfo,
    TensorView, TensorViewMut,
};
use crate::error::BackendError;

/// OpenVINO runtime shared by every stage
pub struct OpenVinoBackend {
    core: Mutex<Core>,
}

impl OpenVinoBackend {
    pub fn new() -> anyhow::Result<Self> {
        let core = Core::new().context("Failed to create OpenVINO core")?;
        Ok(Self {
            core: Mutex::new(core),
        })
    }
}

/// A model read from disk and, after `compile`, bound to a device
pub struct OpenVinoModel {
    path: PathBuf,
    model: Model,
    batch: usize,
    native_batch: usize,
    compiled: Option<CompiledModel>,
    inputs: Vec<TensorInfo>,
    outputs: Vec<TensorInfo>,
}

fn ov_err(e: openvino::InferenceError) -> BackendError {
    BackendError::Runtime(e.into())
}

fn map_element_type(name: &str, element_type: OvElementType) -> Result<ElementType, BackendError> {
    match element_type {
        OvElementType::F32 => Ok(ElementType::F32),
        OvElementType::I32 => Ok(ElementType::I32),
        other => Err(anyhow!("tensor {} has unsupported element type {:?}", name, other).into()),
    }
}

fn element_type(name: &str, t: &Tensor) -> Result<ElementType, BackendError> {
    map_element_type(name, t.get_element_type().map_err(ov_err)?)
}

/// Requests of `native` items needed to cover `batch` items
fn chunk_count(batch: usize, native: usize) -> usize {
    batch.max(1).div_ceil(native.max(1))
}

/// Output dims as seen by the caller once `chunks` runs are concatenated
fn batched_dims(name: &str, dims: &[usize], native: usize, chunks: usize) -> Result<Vec<usize>, BackendError> {
    let mut dims = dims.to_vec();
    if chunks == 1 {
        return Ok(dims);
    }
    match dims.first_mut() {
        Some(n) if *n == native => {
            *n = native * chunks;
            Ok(dims)
        }
        _ => Err(anyhow!(
            "output {} {:?} has no batch dimension of {}, cannot run {} batches",
            name,
            dims,
            native,
            chunks
        )
        .into()),
    }
}

/// Fail unless `available` bytes hold `total` 4-byte elements
fn check_len(name: &str, available: usize, total: usize) -> Result<(), BackendError> {
    let needed = total * std::mem::size_of::<f32>();
    if available < needed {
        return Err(anyhow!(
            "tensor {} holds {} bytes, its shape needs {}",
            name,
            available,
            needed
        )
        .into());
    }
    Ok(())
}

/// Append one chunk of output rows to the rows collected so far
fn append_batch(acc: &mut OwnedTensor, part: OwnedTensor) -> Result<(), BackendError> {
    match (&mut acc.data, part.data) {
        (TensorData::F32(a), TensorData::F32(b)) => a.extend(b),
        (TensorData::I32(a), TensorData::I32(b)) => a.extend(b),
        (a, b) => {
            return Err(BackendError::ElementType {
                name: acc.name.clone(),
                expected: a.element_type().as_str(),
                actual: b.element_type().as_str(),
            })
        }
    }
    if let (Some(n), Some(m)) = (acc.dims.first_mut(), part.dims.first()) {
        *n += *m;
    }
    Ok(())
}

fn tensor_dims(t: &Tensor) -> Result<Vec<usize>, BackendError> {
    let shape = t.get_shape().map_err(ov_err)?;
    Ok(shape.get_dimensions().iter().map(|&d| d.max(0) as usize).collect())
}

/// Read tensor contents into an owned buffer
fn read_tensor(name: &str, tensor: &Tensor) -> Result<OwnedTensor, BackendError> {
    let dims = tensor_dims(tensor)?;
    let total: usize = dims.iter().product();
    let element_type = element_type(name, tensor)?;
    let raw = tensor.get_raw_data().map_err(ov_err)?;
    check_len(name, raw.len(), total)?;

    let data = match element_type {
        ElementType::I32 => TensorData::I32(unsafe {
            std::slice::from_raw_parts(raw.as_ptr() as *const i32, total).to_vec()
        }),
        ElementType::F32 => TensorData::F32(unsafe {
            std::slice::from_raw_parts(raw.as_ptr() as *const f32, total).to_vec()
        }),
    };

    Ok(OwnedTensor {
        name: name.to_string(),
        dims,
        data,
    })
}

impl InferenceBackend for OpenVinoBackend {
    type Model = OpenVinoModel;
    type Request = OpenVinoRequest;

    fn load_model(&self, path: &Path) -> Result<OpenVinoModel, BackendError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("model path is not valid UTF-8: {}", path.display()))?;

        info!("Reading model from {}", path_str);
        let model = self
            .core
            .lock()
            .read_model_from_file(path_str, "")
            .map_err(ov_err)?;

        Ok(OpenVinoModel {
            path: path.to_path_buf(),
            model,
            batch: 1,
            native_batch: 1,
            compiled: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
        })
    }

    fn set_batch_size(&self, model: &mut OpenVinoModel, batch: usize) -> Result<(), BackendError> {
        // Applied at compile time, once the native batch is known.
        model.batch = batch.max(1);
        Ok(())
    }

    fn compile(
        &self,
        model: &mut OpenVinoModel,
        device: &str,
        config: &DeviceConfig,
    ) -> Result<(), BackendError> {
        let mut compiled = self
            .core
            .lock()
            .compile_model(&model.model, device.into())
            .map_err(ov_err)?;

        // Probe tensor layouts through a throwaway request.
        let probe = compiled.create_infer_request().map_err(ov_err)?;

        let mut native_batch = None;
        let mut inputs = Vec::new();
        for i in 0..model.model.get_inputs_len().map_err(ov_err)? {
            let name = model
                .model
                .get_input_by_index(i)
                .and_then(|n| n.get_name())
                .map_err(ov_err)?;
            let tensor = probe.get_tensor(&name).map_err(ov_err)?;
            if element_type(&name, &tensor)? != ElementType::F32 {
                return Err(anyhow!("input {} of {} is not f32", name, model.path.display()).into());
            }
            let mut dims = tensor_dims(&tensor)?;
            if let Some(n) = dims.first_mut() {
                native_batch.get_or_insert((*n).max(1));
                *n = model.batch;
            }
            inputs.push(TensorInfo::new(name, &dims, ElementType::F32));
        }

        let native_batch = native_batch.unwrap_or(1);
        let chunks = chunk_count(model.batch, native_batch);
        if chunks > 1 {
            info!(
                "{} has a native batch of {}, batches of {} run as {} requests",
                model.path.display(),
                native_batch,
                model.batch,
                chunks
            );
        }
        if config.dynamic_batch {
            debug!(
                "Dynamic batch enabled for {}, runs cover the enqueued batch only",
                model.path.display()
            );
        }

        let mut outputs = Vec::new();
        for i in 0..model.model.get_outputs_len().map_err(ov_err)? {
            let name = model
                .model
                .get_output_by_index(i)
                .and_then(|n| n.get_name())
                .map_err(ov_err)?;
            let tensor = probe.get_tensor(&name).map_err(ov_err)?;
            let ty = element_type(&name, &tensor)?;
            let dims = batched_dims(&name, &tensor_dims(&tensor)?, native_batch, chunks)?;
            outputs.push(TensorInfo::new(name, &dims, ty));
        }

        debug!(
            "{} compiled for {}: inputs {:?}, outputs {:?}",
            model.path.display(),
            device,
            inputs,
            outputs
        );

        model.inputs = inputs;
        model.outputs = outputs;
        model.native_batch = native_batch;
        model.compiled = Some(compiled);
        Ok(())
    }

    fn input_info(&self, model: &OpenVinoModel) -> Result<Vec<TensorInfo>, BackendError> {
        Ok(model.inputs.clone())
    }

    fn output_info(&self, model: &OpenVinoModel) -> Result<Vec<TensorInfo>, BackendError> {
        Ok(model.outputs.clone())
    }

    fn create_request(&self, model: &OpenVinoModel) -> Result<OpenVinoRequest, BackendError> {
        // CompiledModel::create_infer_request needs &mut; the model stays owned by the stage.
        let compiled = model
            .compiled
            .as_ref()
            .ok_or_else(|| anyhow!("{} has not been compiled", model.path.display()))?;
        let request = unsafe {
            let ptr = compiled as *const CompiledModel as *mut CompiledModel;
            (*ptr).create_infer_request().map_err(ov_err)?
        };

        let inputs = model
            .inputs
            .iter()
            .map(|info| {
                let len = info.dims.iter().product();
                (info.name.clone(), (info.dims.clone(), vec![0.0f32; len]))
            })
            .collect();

        Ok(OpenVinoRequest {
            request,
            inputs,
            output_names: model.outputs.iter().map(|o| o.name.clone()).collect(),
            outputs: HashMap::new(),
            native_batch: model.native_batch,
            batch: model.batch,
            pending_chunk: None,
        })
    }
}

/// Inference request with host-side input buffers
pub struct OpenVinoRequest {
    request: OvRequest,
    inputs: HashMap<String, (Vec<usize>, Vec<f32>)>,
    output_names: Vec<String>,
    outputs: HashMap<String, OwnedTensor>,
    native_batch: usize,
    batch: usize,
    /// Chunk started by `start_async` and not collected yet
    pending_chunk: Option<usize>,
}

impl OpenVinoRequest {
    fn chunks(&self) -> usize {
        chunk_count(self.batch, self.native_batch)
    }

    /// Copy the slots of chunk `chunk` into native-batch runtime tensors
    ///
    /// Slots past the end of the host buffer are zero-filled.
    fn upload_chunk(&mut self, chunk: usize) -> Result<(), BackendError> {
        let native = self.native_batch;
        for (name, (dims, data)) in &self.inputs {
            let per_item: usize = dims.iter().skip(1).product();
            let mut run_dims: Vec<i64> = dims.iter().map(|&d| d as i64).collect();
            if let Some(n) = run_dims.first_mut() {
                *n = native as i64;
            }

            let shape = Shape::new(&run_dims).map_err(ov_err)?;
            let mut tensor = Tensor::new(OvElementType::F32, &shape).map_err(ov_err)?;
            let start = (chunk * native * per_item).min(data.len());
            let src = &data[start..];

            let raw = tensor.get_raw_data_mut().map_err(ov_err)?;
            raw.fill(0);
            let len = (native * per_item)
                .min(src.len())
                .min(raw.len() / std::mem::size_of::<f32>());
            unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr(), raw.as_mut_ptr() as *mut f32, len);
            }
            self.request.set_tensor(name, &tensor).map_err(ov_err)?;
        }
        Ok(())
    }

    /// Read the outputs of the last run, appending to earlier chunks
    fn collect_chunk(&mut self, chunk: usize) -> Result<(), BackendError> {
        if chunk == 0 {
            self.outputs.clear();
        }
        for name in &self.output_names {
            let tensor = self.request.get_tensor(name).map_err(ov_err)?;
            let part = read_tensor(name, &tensor)?;
            match self.outputs.get_mut(name) {
                Some(acc) => append_batch(acc, part)?,
                None => {
                    self.outputs.insert(name.clone(), part);
                }
            }
        }
        Ok(())
    }

    fn run_chunk(&mut self, chunk: usize) -> Result<(), BackendError> {
        self.upload_chunk(chunk)?;
        self.request.infer().map_err(ov_err)?;
        self.collect_chunk(chunk)
    }
}

impl InferRequest for OpenVinoRequest {
    fn input_mut(&mut self, name: &str) -> Result<TensorViewMut<'_>, BackendError> {
        let (dims, data) = self
            .inputs
            .get_mut(name)
            .ok_or_else(|| BackendError::UnknownTensor(name.to_string()))?;
        Ok(TensorViewMut { dims, data })
    }

    fn output(&self, name: &str) -> Result<TensorView<'_>, BackendError> {
        if self.pending_chunk.is_some() {
            return Err(BackendError::Busy);
        }
        self.outputs
            .get(name)
            .map(OwnedTensor::view)
            .ok_or_else(|| BackendError::UnknownTensor(name.to_string()))
    }

    fn set_batch(&mut self, batch: usize) -> Result<(), BackendError> {
        self.batch = batch.max(1);
        Ok(())
    }

    fn infer(&mut self) -> Result<(), BackendError> {
        self.pending_chunk = None;
        self.outputs.clear();
        for chunk in 0..self.chunks() {
            self.run_chunk(chunk)?;
        }
        Ok(())
    }

    /// Runs all but the last chunk synchronously, then starts the last one
    fn start_async(&mut self) -> Result<(), BackendError> {
        self.pending_chunk = None;
        self.outputs.clear();
        let last = self.chunks() - 1;
        for chunk in 0..last {
            self.run_chunk(chunk)?;
        }
        self.upload_chunk(last)?;
        self.request.infer_async().map_err(ov_err)?;
        self.pending_chunk = Some(last);
        Ok(())
    }

    fn wait(&mut self) -> Result<(), BackendError> {
        let Some(chunk) = self.pending_chunk.take() else {
            return Ok(());
        };
        self.request.wait(-1).map_err(ov_err)?;
        self.collect_chunk(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(name: &str, dims: &[usize], data: TensorData) -> OwnedTensor {
        OwnedTensor {
            name: name.to_string(),
            dims: dims.to_vec(),
            data,
        }
    }

    #[test]
    fn test_only_f32_and_i32_are_mapped() {
        assert_eq!(map_element_type("prob", OvElementType::F32).unwrap(), ElementType::F32);
        assert_eq!(map_element_type("labels", OvElementType::I32).unwrap(), ElementType::I32);
        for other in [OvElementType::F16, OvElementType::U8, OvElementType::I64] {
            let err = map_element_type("labels", other).unwrap_err();
            assert!(matches!(err, BackendError::Runtime(_)));
            assert!(err.to_string().contains("unsupported element type"));
        }
    }

    #[test]
    fn test_short_buffer_rejected() {
        assert!(check_len("prob", 8, 2).is_ok());
        assert!(check_len("prob", 7, 2).is_err());
        // A half-precision buffer is half the size an f32 read would need.
        assert!(check_len("prob", 2 * 16, 16).is_err());
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(16, 1), 16);
        assert_eq!(chunk_count(16, 16), 1);
        assert_eq!(chunk_count(5, 4), 2);
        assert_eq!(chunk_count(2, 8), 1);
        assert_eq!(chunk_count(0, 0), 1);
    }

    #[test]
    fn test_batched_output_dims() {
        assert_eq!(batched_dims("prob", &[1, 2], 1, 16).unwrap(), vec![16, 2]);
        assert_eq!(batched_dims("prob", &[4, 2], 4, 4).unwrap(), vec![16, 2]);
        assert_eq!(batched_dims("out", &[1, 1, 200, 7], 1, 1).unwrap(), vec![1, 1, 200, 7]);
        assert!(batched_dims("out", &[200, 7], 1, 16).is_err());
    }

    #[test]
    fn test_append_batch_concatenates_rows() {
        let mut acc = tensor("prob", &[1, 2], TensorData::F32(vec![0.9, 0.1]));
        append_batch(&mut acc, tensor("prob", &[1, 2], TensorData::F32(vec![0.3, 0.7]))).unwrap();
        assert_eq!(acc.dims, vec![2, 2]);
        assert_eq!(acc.data, TensorData::F32(vec![0.9, 0.1, 0.3, 0.7]));

        let err = append_batch(&mut acc, tensor("prob", &[1, 2], TensorData::I32(vec![1, 2]))).unwrap_err();
        assert!(matches!(err, BackendError::ElementType { expected: "f32", actual: "i32", .. }));
    }
}
