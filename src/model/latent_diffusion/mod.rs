//! Text-conditioned latent diffusion: CLIP conditioning, U-Net denoiser,
//! KL autoencoder and the noise schedule they were trained with.

pub mod load;

use burn::tensor::{backend::Backend, Tensor};
use log::debug;

use super::autoencoder::{Autoencoder, AutoencoderConfig};
use super::clip::{ClipConfig, FrozenClipEmbedder};
use super::unet::{UNet, UNetConfig};
use crate::config::InferenceConfig;
use crate::error::{Error, Result};
use crate::tokenizer::SimpleTokenizer;

/// What a sampler and the inference adapter need from a diffusion model.
pub trait DiffusionModel<B: Backend> {
    /// `[n_prompt, n_ctx, n_state]` cross-attention context.
    fn learned_conditioning(&self, prompts: &[String]) -> Tensor<B, 3>;

    /// Predicted noise for latents `x` at (possibly per-sample) timesteps `t`.
    fn apply_model(&self, x: Tensor<B, 4>, t: Tensor<B, 1>, context: Tensor<B, 3>) -> Tensor<B, 4>;

    /// Latents to pixels roughly in `[-1, 1]`.
    fn decode_first_stage(&self, z: Tensor<B, 4>) -> Tensor<B, 4>;

    fn alphas_cumprod(&self) -> &[f64];

    fn num_timesteps(&self) -> usize {
        self.alphas_cumprod().len()
    }

    fn latent_channels(&self) -> usize;

    /// Pixels per latent cell along each spatial axis.
    fn downscale_factor(&self) -> usize;

    fn device(&self) -> B::Device;
}

/// Discrete forward-process schedule, `betas[t]` and `alphas_cumprod[t]`.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    /// The "linear" LDM schedule, linear in `sqrt(beta)`.
    pub fn linear(linear_start: f64, linear_end: f64, n_timesteps: usize) -> Self {
        let (start, end) = (linear_start.sqrt(), linear_end.sqrt());
        let betas = (0..n_timesteps)
            .map(|i| {
                let frac = if n_timesteps > 1 {
                    i as f64 / (n_timesteps - 1) as f64
                } else {
                    0.0
                };
                let b = start + (end - start) * frac;
                b * b
            })
            .collect();

        Self::from_betas(betas)
    }

    pub fn from_betas(betas: Vec<f64>) -> Self {
        let alphas_cumprod = betas
            .iter()
            .scan(1.0, |acc, beta| {
                *acc *= 1.0 - beta;
                Some(*acc)
            })
            .collect();

        Self {
            betas,
            alphas_cumprod,
        }
    }

    pub fn from_alphas_cumprod(alphas_cumprod: Vec<f64>) -> Self {
        let betas = alphas_cumprod
            .iter()
            .enumerate()
            .map(|(t, a)| match t {
                0 => 1.0 - a,
                _ => 1.0 - a / alphas_cumprod[t - 1],
            })
            .collect();

        Self {
            betas,
            alphas_cumprod,
        }
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn len(&self) -> usize {
        self.betas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.betas.is_empty()
    }

    /// Every derived schedule buffer a DDPM checkpoint carries, by name.
    pub fn buffers(&self) -> Vec<(&'static str, Vec<f64>)> {
        let betas = &self.betas;
        let ac = &self.alphas_cumprod;
        let ac_prev: Vec<f64> = std::iter::once(1.0).chain(ac.iter().copied()).take(ac.len()).collect();

        let map = |f: &dyn Fn(usize) -> f64| (0..ac.len()).map(f).collect::<Vec<f64>>();

        let posterior_variance = map(&|t| betas[t] * (1.0 - ac_prev[t]) / (1.0 - ac[t]));
        let posterior_log_variance_clipped = posterior_variance.iter().map(|v| v.max(1e-20).ln()).collect();

        vec![
            ("betas", betas.clone()),
            ("alphas_cumprod", ac.clone()),
            ("alphas_cumprod_prev", ac_prev.clone()),
            ("sqrt_alphas_cumprod", map(&|t| ac[t].sqrt())),
            ("sqrt_one_minus_alphas_cumprod", map(&|t| (1.0 - ac[t]).sqrt())),
            ("log_one_minus_alphas_cumprod", map(&|t| (1.0 - ac[t]).ln())),
            ("sqrt_recip_alphas_cumprod", map(&|t| (1.0 / ac[t]).sqrt())),
            ("sqrt_recipm1_alphas_cumprod", map(&|t| (1.0 / ac[t] - 1.0).sqrt())),
            ("posterior_variance", posterior_variance),
            ("posterior_log_variance_clipped", posterior_log_variance_clipped),
            (
                "posterior_mean_coef1",
                map(&|t| betas[t] * ac_prev[t].sqrt() / (1.0 - ac[t])),
            ),
            (
                "posterior_mean_coef2",
                map(&|t| (1.0 - ac_prev[t]) * (1.0 - betas[t]).sqrt() / (1.0 - ac[t])),
            ),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct LatentDiffusion<B: Backend> {
    cond_stage: FrozenClipEmbedder<B>,
    diffusion_model: UNet<B>,
    first_stage: Autoencoder<B>,
    schedule: NoiseSchedule,
    scale_factor: f64,
    channels: usize,
    downscale_factor: usize,
    device: B::Device,
}

impl<B: Backend> LatentDiffusion<B> {
    /// Builds a freshly initialised model. The tokenizer merges file is read
    /// from `cond_stage_config.params.vocab`.
    pub fn from_config(config: &InferenceConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let params = config.params();

        let cond = &params.cond_stage_config.params;
        let vocab = cond
            .vocab
            .as_ref()
            .ok_or_else(|| Error::Config("cond_stage_config.params.vocab must name the BPE merges file".into()))?;
        let tokenizer = SimpleTokenizer::new(vocab)?;
        if tokenizer.vocab_size() > cond.vocab_size {
            return Err(Error::Config(format!(
                "tokenizer has {} tokens but the text encoder embeds only {}",
                tokenizer.vocab_size(),
                cond.vocab_size
            )));
        }
        debug!(
            "Text encoder on {}",
            cond.device.as_deref().unwrap_or("the default device")
        );

        let transformer = ClipConfig::from_params(cond).init(device);
        let cond_stage = FrozenClipEmbedder::new(tokenizer, transformer, cond.max_length);
        let diffusion_model = UNetConfig::from_params(&params.unet_config.params)?.init(device);
        let first_stage = AutoencoderConfig::from_params(&params.first_stage_config.params).init(device);
        let schedule = NoiseSchedule::linear(params.linear_start, params.linear_end, params.timesteps);

        Ok(Self {
            cond_stage,
            diffusion_model,
            first_stage,
            schedule,
            scale_factor: params.scale_factor,
            channels: params.channels,
            downscale_factor: config.latent_downscale_factor(),
            device: device.clone(),
        })
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    pub fn cond_stage(&self) -> &FrozenClipEmbedder<B> {
        &self.cond_stage
    }

    pub fn diffusion_model(&self) -> &UNet<B> {
        &self.diffusion_model
    }

    pub fn first_stage(&self) -> &Autoencoder<B> {
        &self.first_stage
    }

    /// Latents of images in `[-1, 1]`, scaled into the diffusion space.
    pub fn encode_first_stage(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.first_stage.encode(x).mul_scalar(self.scale_factor)
    }
}

impl<B: Backend> DiffusionModel<B> for LatentDiffusion<B> {
    fn learned_conditioning(&self, prompts: &[String]) -> Tensor<B, 3> {
        self.cond_stage.encode(prompts, &self.device)
    }

    fn apply_model(&self, x: Tensor<B, 4>, t: Tensor<B, 1>, context: Tensor<B, 3>) -> Tensor<B, 4> {
        self.diffusion_model.forward(x, t, context)
    }

    fn decode_first_stage(&self, z: Tensor<B, 4>) -> Tensor<B, 4> {
        self.first_stage.decode(z.div_scalar(self.scale_factor))
    }

    fn alphas_cumprod(&self) -> &[f64] {
        self.schedule.alphas_cumprod()
    }

    fn latent_channels(&self) -> usize {
        self.channels
    }

    fn downscale_factor(&self) -> usize {
        self.downscale_factor
    }

    fn device(&self) -> B::Device {
        self.device.clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::Path;

    use super::*;
    use crate::config::{ComponentSpec, CondStageParams, LatentDiffusionParams, ModelSpec};
    use crate::model::autoencoder;
    use crate::model::unet;
    use crate::tokenizer::tests::TINY_MERGES;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    pub(crate) const TINY_TIMESTEPS: usize = 20;

    /// Smallest configuration every component accepts, with the merges file
    /// at `vocab`.
    pub(crate) fn tiny_config(vocab: Option<&Path>) -> InferenceConfig {
        InferenceConfig {
            model: ModelSpec {
                target: "ldm.models.diffusion.ddpm.LatentDiffusion".into(),
                params: LatentDiffusionParams {
                    linear_start: 0.00085,
                    linear_end: 0.012,
                    timesteps: TINY_TIMESTEPS,
                    channels: 4,
                    scale_factor: 0.18215,
                    use_ema: false,
                    conditioning_key: "crossattn".into(),
                    unet_config: ComponentSpec {
                        target: "ldm.modules.diffusionmodules.openaimodel.UNetModel".into(),
                        params: unet::tests::tiny_params(),
                    },
                    first_stage_config: ComponentSpec {
                        target: "ldm.models.autoencoder.AutoencoderKL".into(),
                        params: autoencoder::tests::tiny_params(),
                    },
                    cond_stage_config: ComponentSpec {
                        target: "ldm.modules.encoders.modules.FrozenCLIPEmbedder".into(),
                        params: CondStageParams {
                            max_length: 8,
                            vocab: vocab.map(|p| p.display().to_string()),
                            vocab_size: 517,
                            hidden_size: 8,
                            num_attention_heads: 2,
                            num_hidden_layers: 1,
                            ..CondStageParams::default()
                        },
                    },
                },
            },
        }
    }

    /// Writes the tiny merges file into `dir` and returns a config pointing at it.
    pub(crate) fn tiny_config_in(dir: &Path) -> InferenceConfig {
        let vocab = dir.join("merges.txt");
        std::fs::write(&vocab, TINY_MERGES).unwrap();
        tiny_config(Some(&vocab))
    }

    #[test]
    fn linear_schedule_is_quadratic_in_sqrt_beta() {
        let schedule = NoiseSchedule::linear(0.00085, 0.012, 1000);

        assert_eq!(schedule.len(), 1000);
        assert!((schedule.betas()[0] - 0.00085).abs() < 1e-12);
        assert!((schedule.betas()[999] - 0.012).abs() < 1e-12);
        assert!((schedule.alphas_cumprod()[0] - (1.0 - 0.00085)).abs() < 1e-12);
        // SD v1 reference value
        assert!((schedule.alphas_cumprod()[999] - 0.0047).abs() < 1e-4);
        assert!(schedule.alphas_cumprod().windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn betas_are_recovered_from_alphas_cumprod() {
        let schedule = NoiseSchedule::linear(0.001, 0.02, 50);
        let rebuilt = NoiseSchedule::from_alphas_cumprod(schedule.alphas_cumprod().to_vec());

        for (a, b) in schedule.betas().iter().zip(rebuilt.betas()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn buffers_cover_the_ddpm_layout() {
        let schedule = NoiseSchedule::linear(0.00085, 0.012, 10);
        let buffers = schedule.buffers();

        assert_eq!(buffers.len(), 12);
        assert!(buffers.iter().all(|(_, values)| values.len() == 10));

        let prev = &buffers.iter().find(|(name, _)| *name == "alphas_cumprod_prev").unwrap().1;
        assert_eq!(prev[0], 1.0);
        assert_eq!(prev[1], schedule.alphas_cumprod()[0]);
    }

    #[test]
    fn model_is_built_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config_in(dir.path());
        let device = NdArrayDevice::Cpu;

        let model = LatentDiffusion::<TestBackend>::from_config(&config, &device).unwrap();
        assert_eq!(model.num_timesteps(), TINY_TIMESTEPS);
        assert_eq!(model.latent_channels(), 4);
        assert_eq!(model.downscale_factor(), 2);

        let context = model.learned_conditioning(&["a cat".to_string(), String::new()]);
        assert_eq!(context.dims(), [2, 8, 8]);

        let z = Tensor::<TestBackend, 4>::zeros([2, 4, 4, 6], &device);
        let t = Tensor::<TestBackend, 1>::from_floats([1.0, 11.0], &device);
        assert_eq!(model.apply_model(z.clone(), t, context).dims(), [2, 4, 4, 6]);
        assert_eq!(model.decode_first_stage(z).dims(), [2, 3, 8, 12]);

        let image = Tensor::<TestBackend, 4>::zeros([1, 3, 8, 8], &device);
        assert_eq!(model.encode_first_stage(image).dims(), [1, 4, 4, 4]);
    }

    #[test]
    fn missing_vocab_is_a_config_error() {
        let err = LatentDiffusion::<TestBackend>::from_config(&tiny_config(None), &NdArrayDevice::Cpu).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn oversized_tokenizer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = tiny_config_in(dir.path());
        config.model.params.cond_stage_config.params.vocab_size = 100;

        let err = LatentDiffusion::<TestBackend>::from_config(&config, &NdArrayDevice::Cpu).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
