//! Text-to-image inference over a model directory holding the SD v1 files.

use std::marker::PhantomData;
use std::path::Path;

use burn::tensor::{backend::Backend, Tensor};
use image::RgbImage;
use log::debug;
use num_traits::ToPrimitive;

use crate::config::InferenceConfig;
use crate::error::{Error, Result};
use crate::loader::{load_model_from_config, LoadReport};
use crate::model::latent_diffusion::{DiffusionModel, LatentDiffusion};
use crate::sampler::DdimSampler;

pub const CONFIG_FILE: &str = "v1-inference.yml";
pub const CHECKPOINT_FILE: &str = "sd-v1-4.ckpt";
pub const VOCAB_FILE: &str = "bpe_simple_vocab_16e6.txt";

pub const GUIDANCE_SCALE: f64 = 7.5;
pub const ETA: f64 = 0.0;

const N_CHANNEL_IMAGE: usize = 3;

/// A loaded model and its sampler. Each call to [`predict_step`] is
/// independent; nothing but the weights is kept between calls.
///
/// [`predict_step`]: StableDiffusionModel::predict_step
pub struct StableDiffusionModel<B: Backend, M: DiffusionModel<B> = LatentDiffusion<B>> {
    model: M,
    sampler: DdimSampler,
    _backend: PhantomData<B>,
}

impl<B: Backend> StableDiffusionModel<B> {
    /// Loads `v1-inference.yml` and `sd-v1-4.ckpt` from `model_path`.
    pub fn new<P: AsRef<Path>>(model_path: P, device: &B::Device) -> Result<Self> {
        Self::load(model_path, device, false).map(|(adapter, _)| adapter)
    }

    /// Like [`new`](Self::new), also returning the checkpoint merge report.
    /// With `verbose`, missing and unexpected keys are logged.
    pub fn load<P: AsRef<Path>>(model_path: P, device: &B::Device, verbose: bool) -> Result<(Self, LoadReport)> {
        let model_path = model_path.as_ref();

        let mut config = InferenceConfig::load(model_path.join(CONFIG_FILE))?;
        config.set_cond_stage_device(format!("{:?}", device));

        let vocab = config
            .params()
            .cond_stage_config
            .params
            .vocab
            .clone()
            .unwrap_or_else(|| VOCAB_FILE.to_string());
        config.set_vocab_path(model_path.join(vocab));

        let (model, report) = load_model_from_config(&config, model_path.join(CHECKPOINT_FILE), device, verbose)?;
        let sampler = DdimSampler::new(&model);

        Ok((Self::from_parts(model, sampler), report))
    }
}

impl<B: Backend, M: DiffusionModel<B>> StableDiffusionModel<B, M> {
    pub fn from_parts(model: M, sampler: DdimSampler) -> Self {
        Self {
            model,
            sampler,
            _backend: PhantomData,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn sampler(&self) -> &DdimSampler {
        &self.sampler
    }

    /// One image per prompt, in prompt order.
    ///
    /// The latent is `height / f` by `width / f` (floor division, `f` the
    /// autoencoder's downscale factor), so images come back at the nearest
    /// multiple of `f` at or below the requested size.
    pub fn predict_step(
        &self,
        prompts: &[String],
        batch_idx: usize,
        height: usize,
        width: usize,
        num_inference_steps: usize,
    ) -> Result<Vec<RgbImage>> {
        debug!("predict_step for batch {} with {} prompts", batch_idx, prompts.len());

        if prompts.is_empty() {
            return Ok(Vec::new());
        }

        let factor = self.model.downscale_factor();
        let (latent_height, latent_width) = (height / factor, width / factor);
        if latent_height == 0 || latent_width == 0 {
            return Err(Error::InvalidInput(format!(
                "{}x{} is smaller than one latent cell of {} pixels",
                height, width, factor
            )));
        }

        let n_batch = prompts.len();
        let unconditional_conditioning = self.model.learned_conditioning(&vec![String::new(); n_batch]);
        let conditioning = self.model.learned_conditioning(prompts);

        let shape = [n_batch, self.model.latent_channels(), latent_height, latent_width];
        let latent = self.sampler.sample(
            &self.model,
            num_inference_steps,
            conditioning,
            Some(unconditional_conditioning),
            shape,
            GUIDANCE_SCALE,
            ETA,
            None,
        )?;

        let decoded = self.model.decode_first_stage(latent);
        to_images(decoded)
    }
}

/// `[n, 3, h, w]` in roughly `[-1, 1]` to 8-bit RGB images.
fn to_images<B: Backend>(x: Tensor<B, 4>) -> Result<Vec<RgbImage>> {
    let [n_batch, n_channel, height, width] = x.dims();
    if n_channel != N_CHANNEL_IMAGE {
        return Err(Error::TensorData(format!(
            "decoder produced {} channels, expected {}",
            n_channel, N_CHANNEL_IMAGE
        )));
    }

    let x = ((x + 1.0) / 2.0).clamp(0.0, 1.0).mul_scalar(255.0);
    let x = x.swap_dims(1, 2).swap_dims(2, 3);

    let flattened = x
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| Error::TensorData(format!("{:?}", e)))?;

    let num_elements_per_image = n_channel * height * width;
    (0..n_batch)
        .map(|b| {
            let start = b * num_elements_per_image;
            let end = start + num_elements_per_image;

            let pixels: Vec<u8> = flattened[start..end]
                .iter()
                .map(|v| v.to_u8().unwrap_or(0))
                .collect();
            RgbImage::from_raw(width as u32, height as u32, pixels)
                .ok_or_else(|| Error::TensorData(format!("image {} has the wrong number of pixels", b)))
        })
        .collect()
}
