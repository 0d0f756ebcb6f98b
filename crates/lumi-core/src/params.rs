//! Named parameter storage.
//!
//! Every trainable tensor of a model lives here as a candle [`Var`] under a
//! stable dotted name (`layers.3.attn.q_proj.weight`, ...). Model components
//! hold clones of the underlying tensors, so in-place updates made through
//! the store (optimizer steps, [`ParameterStore::restore`],
//! [`ParameterStore::load`]) are visible to the next forward pass.
//!
//! # Example
//!
//! ```ignore
//! let snapshot = model.params().snapshot()?;
//! model.params().save("step_1000.safetensors")?;
//! model.params().restore(&snapshot)?;
//! ```

use crate::error::{LumiError, Result};
use crate::rng::SeededRng;
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use safetensors::SafeTensors;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

/// Detached copy of every parameter, keyed by name.
pub type StateSnapshot = BTreeMap<String, Tensor>;

/// Sorted collection of named trainable parameters.
#[derive(Debug)]
pub struct ParameterStore {
    vars: BTreeMap<String, Var>,
    device: Device,
    dtype: DType,
}

impl ParameterStore {
    /// Create an empty store whose parameters live on `device` in `dtype`.
    pub fn new(device: &Device, dtype: DType) -> Self {
        Self {
            vars: BTreeMap::new(),
            device: device.clone(),
            dtype,
        }
    }

    /// Register a parameter drawn from N(0, std).
    pub(crate) fn normal(
        &mut self,
        name: impl Into<String>,
        shape: (usize, usize),
        std: f64,
        rng: &mut SeededRng,
    ) -> Result<Tensor> {
        let values = rng.normal_vec(shape.0 * shape.1, 0.0, std)?;
        let tensor = Tensor::from_vec(values, shape, &self.device)?.to_dtype(self.dtype)?;
        self.insert(name.into(), tensor)
    }

    /// Register a gain vector initialized to ones.
    pub(crate) fn ones(&mut self, name: impl Into<String>, len: usize) -> Result<Tensor> {
        let tensor = Tensor::ones(len, self.dtype, &self.device)?;
        self.insert(name.into(), tensor)
    }

    fn insert(&mut self, name: String, tensor: Tensor) -> Result<Tensor> {
        if self.vars.contains_key(&name) {
            return Err(LumiError::Parameter(format!("duplicate parameter {name}")));
        }
        let var = Var::from_tensor(&tensor)?;
        let handle = var.as_tensor().clone();
        self.vars.insert(name, var);
        Ok(handle)
    }

    /// Multiply a parameter in place by `factor`.
    pub(crate) fn scale(&self, name: &str, factor: f64) -> Result<()> {
        let var = self.var(name)?;
        let scaled = (var.as_tensor() * factor)?;
        var.set(&scaled)?;
        Ok(())
    }

    /// Look up a parameter.
    pub fn get(&self, name: &str) -> Option<&Var> {
        self.vars.get(name)
    }

    /// Look up a parameter, returning an error if not found.
    pub fn var(&self, name: &str) -> Result<&Var> {
        self.vars
            .get(name)
            .ok_or_else(|| LumiError::Parameter(format!("unknown parameter {name}")))
    }

    /// Parameters in name order.
    pub fn named_parameters(&self) -> impl Iterator<Item = (&str, &Var)> {
        self.vars.iter().map(|(name, var)| (name.as_str(), var))
    }

    /// Parameters whose name starts with `prefix`.
    pub fn with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a Var)> {
        self.named_parameters()
            .filter(move |(name, _)| name.starts_with(prefix))
    }

    /// Every variable, for handing to an optimizer.
    pub fn all_vars(&self) -> Vec<Var> {
        self.vars.values().cloned().collect()
    }

    /// Parameter names in order.
    pub fn names(&self) -> Vec<&str> {
        self.vars.keys().map(|s| s.as_str()).collect()
    }

    /// Number of named tensors.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Check if the store holds no parameters.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Total scalar parameter count.
    pub fn num_parameters(&self) -> usize {
        self.vars.values().map(|v| v.elem_count()).sum()
    }

    /// Storage dtype.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Storage device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Gradients for every parameter present in `grads`, in name order.
    pub fn gradients(&self, grads: &GradStore) -> Vec<(String, Tensor)> {
        self.vars
            .iter()
            .filter_map(|(name, var)| grads.get(var.as_tensor()).map(|g| (name.clone(), g.clone())))
            .collect()
    }

    /// Copy every parameter value, detached from the graph.
    pub fn snapshot(&self) -> Result<StateSnapshot> {
        self.vars
            .iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().detach().copy()?)))
            .collect()
    }

    /// Overwrite parameter values from a snapshot.
    ///
    /// The snapshot must name exactly this store's parameters with matching
    /// shapes. Values are cast to the storage dtype and device. Nothing is
    /// written unless every entry checks out.
    pub fn restore(&self, snapshot: &StateSnapshot) -> Result<()> {
        for name in snapshot.keys() {
            if !self.vars.contains_key(name) {
                return Err(LumiError::Parameter(format!("unknown parameter {name} in snapshot")));
            }
        }
        for (name, var) in &self.vars {
            let value = snapshot
                .get(name)
                .ok_or_else(|| LumiError::Parameter(format!("snapshot is missing {name}")))?;
            if value.dims() != var.dims() {
                return Err(LumiError::ShapeMismatch(format!(
                    "{name}: expected {:?}, snapshot has {:?}",
                    var.dims(),
                    value.dims()
                )));
            }
        }

        for (name, var) in &self.vars {
            if let Some(value) = snapshot.get(name) {
                let value = value.to_device(&self.device)?.to_dtype(self.dtype)?;
                var.set(&value)?;
            }
        }
        tracing::debug!(tensors = self.vars.len(), "restored parameters");
        Ok(())
    }

    /// Write every parameter to a safetensors file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let tensors: HashMap<String, Tensor> = self
            .vars
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
            .collect();
        candle_core::safetensors::save(&tensors, path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), tensors = tensors.len(), "saved parameters");
        Ok(())
    }

    /// Read a safetensors file written by [`ParameterStore::save`] and
    /// restore from it.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        let safetensors = SafeTensors::deserialize(&data).map_err(|e| {
            LumiError::SafeTensors(format!("failed to deserialize {}: {}", path.display(), e))
        })?;

        let mut snapshot = StateSnapshot::new();
        for (name, view) in safetensors.tensors() {
            let tensor = view_to_tensor(&view, &self.device)?;
            snapshot.insert(name.to_string(), tensor);
        }
        self.restore(&snapshot)
    }
}

/// Convert a SafeTensors view to a Candle tensor.
fn view_to_tensor(view: &safetensors::tensor::TensorView, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let data = view.data();

    let tensor = match view.dtype() {
        safetensors::Dtype::F32 => {
            let values: Vec<f32> = bytemuck::pod_collect_to_vec(data);
            Tensor::from_vec(values, shape.as_slice(), device)?
        }
        safetensors::Dtype::F16 => {
            let values: Vec<half::f16> = bytemuck::pod_collect_to_vec(data);
            Tensor::from_vec(values, shape.as_slice(), device)?
        }
        safetensors::Dtype::BF16 => {
            let values: Vec<half::bf16> = bytemuck::pod_collect_to_vec(data);
            Tensor::from_vec(values, shape.as_slice(), device)?
        }
        safetensors::Dtype::F64 => {
            let values: Vec<f64> = bytemuck::pod_collect_to_vec(data);
            Tensor::from_vec(values, shape.as_slice(), device)?
        }
        other => {
            return Err(LumiError::SafeTensors(format!(
                "unsupported parameter dtype: {:?}",
                other
            )));
        }
    };

    Ok(tensor)
}
