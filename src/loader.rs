//! Building a model from its configuration and merging checkpoint weights.

use std::path::Path;

use burn::tensor::{backend::Backend, Tensor, TensorData};
use log::{info, warn};

use crate::checkpoint::{Checkpoint, StateDict, TensorSnapshot};
use crate::config::InferenceConfig;
use crate::error::{Error, Result};
use crate::model::latent_diffusion::LatentDiffusion;
use crate::model::load::{Layout, ParamMapper};

/// Outcome of a non-strict merge, every list sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub matched: Vec<String>,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

/// Replaces parameters with checkpoint tensors, consuming the entries it
/// uses. Parameters without an entry keep their initial values.
pub struct StateDictLoader {
    state_dict: StateDict,
    matched: Vec<String>,
    missing: Vec<String>,
}

impl StateDictLoader {
    pub fn new(state_dict: StateDict) -> Self {
        Self {
            state_dict,
            matched: Vec::new(),
            missing: Vec::new(),
        }
    }

    /// Whatever was not consumed is reported as unexpected.
    pub fn finish(self) -> LoadReport {
        let mut matched = self.matched;
        let mut missing = self.missing;
        matched.sort();
        missing.sort();

        LoadReport {
            matched,
            missing,
            unexpected: self.state_dict.keys(),
        }
    }
}

impl<B: Backend> ParamMapper<B> for StateDictLoader {
    fn map<const D: usize>(&mut self, key: &str, tensor: Tensor<B, D>, layout: Layout) -> Result<Tensor<B, D>> {
        let expected = layout.stored_shape(tensor.dims());

        let snapshot = match self.state_dict.take(key) {
            Some(snapshot) => snapshot,
            None => {
                self.missing.push(key.to_string());
                return Ok(tensor);
            }
        };

        if snapshot.shape != expected {
            return Err(Error::ShapeMismatch {
                key: key.to_string(),
                expected,
                found: snapshot.shape,
            });
        }

        let data = TensorData::new(snapshot.values, snapshot.shape);
        let loaded = Tensor::<B, D>::from_data(data.convert::<B::FloatElem>(), &tensor.device());
        self.matched.push(key.to_string());

        Ok(match layout {
            Layout::Transposed if D >= 2 => loaded.swap_dims(D - 2, D - 1),
            _ => loaded,
        })
    }
}

/// Collects parameters into a [`StateDict`] in checkpoint layout.
#[derive(Default)]
pub struct StateDictExporter {
    state_dict: StateDict,
}

impl StateDictExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_state_dict(self) -> StateDict {
        self.state_dict
    }
}

impl<B: Backend> ParamMapper<B> for StateDictExporter {
    fn map<const D: usize>(&mut self, key: &str, tensor: Tensor<B, D>, layout: Layout) -> Result<Tensor<B, D>> {
        let stored = match layout {
            Layout::Transposed if D >= 2 => tensor.clone().swap_dims(D - 2, D - 1),
            _ => tensor.clone(),
        };

        let shape = stored.dims().to_vec();
        let values = stored
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| Error::TensorData(format!("{}: {:?}", key, e)))?;
        let snapshot = TensorSnapshot::new(shape, values).map_err(|e| Error::TensorData(format!("{}: {}", key, e)))?;
        self.state_dict.insert(key, snapshot);

        Ok(tensor)
    }
}

/// Merges `state_dict` into `model` without requiring the key sets to agree.
pub fn merge_state_dict<B: Backend>(
    model: LatentDiffusion<B>,
    state_dict: StateDict,
) -> Result<(LatentDiffusion<B>, LoadReport)> {
    let mut loader = StateDictLoader::new(state_dict);
    let model = model.map(&mut loader)?;

    Ok((model, loader.finish()))
}

/// The model's parameters and schedule buffers under their checkpoint names.
pub fn state_dict<B: Backend>(model: &LatentDiffusion<B>) -> Result<StateDict> {
    let mut exporter = StateDictExporter::new();
    model.clone().map(&mut exporter)?;

    Ok(exporter.into_state_dict())
}

/// Builds the model described by `config` and loads the weights in
/// `ckpt_path` into it.
pub fn load_model_from_config<B: Backend, P: AsRef<Path>>(
    config: &InferenceConfig,
    ckpt_path: P,
    device: &B::Device,
    verbose: bool,
) -> Result<(LatentDiffusion<B>, LoadReport)> {
    let ckpt_path = ckpt_path.as_ref();
    info!("Loading model from {}", ckpt_path.display());

    let checkpoint = Checkpoint::load(ckpt_path)?;
    if let Some(step) = checkpoint.global_step {
        info!("Global Step: {}", step);
    }

    let model = LatentDiffusion::from_config(config, device)?;
    let (model, report) = merge_state_dict(model, checkpoint.state_dict)?;

    if verbose {
        if !report.missing.is_empty() {
            warn!("missing keys:");
            warn!("{:?}", report.missing);
        }
        if !report.unexpected.is_empty() {
            warn!("unexpected keys:");
            warn!("{:?}", report.unexpected);
        }
    }

    Ok((model, report))
}
