//! Typed view of the LDM inference YAML (`v1-inference.yml`).
//!
//! Only the keys that shape the inference graph are modelled; anything else
//! in the file (training schedulers, loss configs, monitors) is ignored.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const LATENT_DIFFUSION_TARGET: &str = "LatentDiffusion";
const UNET_TARGET: &str = "UNetModel";
const AUTOENCODER_TARGET: &str = "AutoencoderKL";
const CLIP_EMBEDDER_TARGET: &str = "FrozenCLIPEmbedder";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub model: ModelSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub target: String,
    pub params: LatentDiffusionParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSpec<P> {
    pub target: String,
    #[serde(default)]
    pub params: P,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatentDiffusionParams {
    #[serde(default = "default_linear_start")]
    pub linear_start: f64,
    #[serde(default = "default_linear_end")]
    pub linear_end: f64,
    #[serde(default = "default_timesteps")]
    pub timesteps: usize,
    #[serde(default = "default_channels")]
    pub channels: usize,
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
    #[serde(default)]
    pub use_ema: bool,
    #[serde(default = "default_conditioning_key")]
    pub conditioning_key: String,
    pub unet_config: ComponentSpec<UNetParams>,
    pub first_stage_config: ComponentSpec<FirstStageParams>,
    pub cond_stage_config: ComponentSpec<CondStageParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UNetParams {
    #[serde(default = "default_channels")]
    pub in_channels: usize,
    #[serde(default = "default_channels")]
    pub out_channels: usize,
    pub model_channels: usize,
    #[serde(default)]
    pub attention_resolutions: Vec<usize>,
    pub num_res_blocks: usize,
    pub channel_mult: Vec<usize>,
    #[serde(default = "default_unset")]
    pub num_heads: i64,
    #[serde(default = "default_unset")]
    pub num_head_channels: i64,
    #[serde(default)]
    pub use_spatial_transformer: bool,
    #[serde(default = "default_transformer_depth")]
    pub transformer_depth: usize,
    pub context_dim: Option<usize>,
    #[serde(default)]
    pub use_linear_in_transformer: bool,
}

impl Default for UNetParams {
    fn default() -> Self {
        Self {
            in_channels: 4,
            out_channels: 4,
            model_channels: 320,
            attention_resolutions: vec![4, 2, 1],
            num_res_blocks: 2,
            channel_mult: vec![1, 2, 4, 4],
            num_heads: 8,
            num_head_channels: -1,
            use_spatial_transformer: true,
            transformer_depth: 1,
            context_dim: Some(768),
            use_linear_in_transformer: false,
        }
    }
}

impl UNetParams {
    /// Number of attention heads and channels per head for a block with
    /// `n_channels` channels.
    pub fn attention_heads(&self, n_channels: usize) -> Result<(usize, usize)> {
        let (n_head, n_head_channels) = if self.num_head_channels <= 0 {
            if self.num_heads <= 0 {
                return Err(Error::Config(
                    "either num_heads or num_head_channels must be set".into(),
                ));
            }
            let n_head = self.num_heads as usize;
            (n_head, n_channels / n_head)
        } else {
            let n_head_channels = self.num_head_channels as usize;
            (n_channels / n_head_channels, n_head_channels)
        };

        if n_head == 0 || n_head * n_head_channels != n_channels {
            return Err(Error::Config(format!(
                "{} channels cannot be split into attention heads ({} x {})",
                n_channels, n_head, n_head_channels
            )));
        }

        Ok((n_head, n_head_channels))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirstStageParams {
    pub embed_dim: usize,
    pub ddconfig: DdConfig,
}

impl Default for FirstStageParams {
    fn default() -> Self {
        Self {
            embed_dim: 4,
            ddconfig: DdConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdConfig {
    #[serde(default = "default_true")]
    pub double_z: bool,
    pub z_channels: usize,
    #[serde(default = "default_image_channels")]
    pub in_channels: usize,
    #[serde(default = "default_image_channels")]
    pub out_ch: usize,
    pub ch: usize,
    pub ch_mult: Vec<usize>,
    pub num_res_blocks: usize,
    #[serde(default)]
    pub attn_resolutions: Vec<usize>,
}

impl Default for DdConfig {
    fn default() -> Self {
        Self {
            double_z: true,
            z_channels: 4,
            in_channels: 3,
            out_ch: 3,
            ch: 128,
            ch_mult: vec![1, 2, 4, 4],
            num_res_blocks: 2,
            attn_resolutions: vec![],
        }
    }
}

/// Parameters of the frozen CLIP text encoder. The YAML for SD v1 leaves
/// these empty, so the defaults describe ViT-L/14's text tower.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CondStageParams {
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default)]
    pub vocab: Option<String>,
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_attention_heads")]
    pub num_attention_heads: usize,
    #[serde(default = "default_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

impl Default for CondStageParams {
    fn default() -> Self {
        Self {
            device: None,
            max_length: default_max_length(),
            vocab: None,
            vocab_size: default_vocab_size(),
            hidden_size: default_hidden_size(),
            num_attention_heads: default_attention_heads(),
            num_hidden_layers: default_hidden_layers(),
            layer_norm_eps: default_layer_norm_eps(),
        }
    }
}

impl InferenceConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        serde_yaml::from_str(&text).map_err(|source| Error::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn params(&self) -> &LatentDiffusionParams {
        &self.model.params
    }

    /// Records the compute device the text encoder runs on.
    pub fn set_cond_stage_device(&mut self, device: impl Into<String>) {
        self.model.params.cond_stage_config.params.device = Some(device.into());
    }

    /// Points the text encoder at its BPE merges file.
    pub fn set_vocab_path(&mut self, path: impl AsRef<Path>) {
        self.model.params.cond_stage_config.params.vocab = Some(path.as_ref().display().to_string());
    }

    /// Spatial compression between pixel space and latent space.
    pub fn latent_downscale_factor(&self) -> usize {
        let n_levels = self.params().first_stage_config.params.ddconfig.ch_mult.len();
        1 << n_levels.saturating_sub(1)
    }

    /// Rejects configurations the model builders cannot honour.
    pub fn validate(&self) -> Result<()> {
        let params = self.params();

        check_target(&self.model.target, LATENT_DIFFUSION_TARGET)?;
        check_target(&params.unet_config.target, UNET_TARGET)?;
        check_target(&params.first_stage_config.target, AUTOENCODER_TARGET)?;
        check_target(&params.cond_stage_config.target, CLIP_EMBEDDER_TARGET)?;

        if params.conditioning_key != "crossattn" {
            return Err(Error::Config(format!(
                "conditioning_key {:?} is not supported, expected \"crossattn\"",
                params.conditioning_key
            )));
        }

        let unet = &params.unet_config.params;
        if !unet.use_spatial_transformer {
            return Err(Error::Config(
                "the denoiser must use spatial transformers for text conditioning".into(),
            ));
        }
        if unet.use_linear_in_transformer {
            return Err(Error::Config(
                "linear transformer projections are not supported".into(),
            ));
        }
        if unet.channel_mult.is_empty() || unet.num_res_blocks == 0 {
            return Err(Error::Config(
                "unet channel_mult and num_res_blocks must not be empty".into(),
            ));
        }
        if unet.in_channels != params.channels {
            return Err(Error::Config(format!(
                "unet expects {} input channels but the latent space has {}",
                unet.in_channels, params.channels
            )));
        }

        let cond = &params.cond_stage_config.params;
        match unet.context_dim {
            Some(dim) if dim == cond.hidden_size => {}
            Some(dim) => {
                return Err(Error::Config(format!(
                    "unet context_dim {} does not match the text encoder width {}",
                    dim, cond.hidden_size
                )))
            }
            None => return Err(Error::Config("unet context_dim must be set".into())),
        }
        if cond.hidden_size % cond.num_attention_heads != 0 {
            return Err(Error::Config(format!(
                "text encoder width {} is not divisible by {} heads",
                cond.hidden_size, cond.num_attention_heads
            )));
        }

        let first_stage = &params.first_stage_config.params;
        if !first_stage.ddconfig.attn_resolutions.is_empty() {
            return Err(Error::Config(
                "autoencoder attention outside the middle block is not supported".into(),
            ));
        }
        if !first_stage.ddconfig.double_z {
            return Err(Error::Config(
                "autoencoder must predict mean and log-variance (double_z)".into(),
            ));
        }
        if first_stage.ddconfig.ch_mult.is_empty() {
            return Err(Error::Config("autoencoder ch_mult must not be empty".into()));
        }
        if first_stage.embed_dim != params.channels {
            return Err(Error::Config(format!(
                "autoencoder embed_dim {} does not match the latent channels {}",
                first_stage.embed_dim, params.channels
            )));
        }
        if params.timesteps == 0 {
            return Err(Error::Config("timesteps must be positive".into()));
        }
        let in_unit = |v: f64| v > 0.0 && v < 1.0;
        if !(in_unit(params.linear_start) && in_unit(params.linear_end) && params.linear_start < params.linear_end) {
            return Err(Error::Config(format!(
                "noise schedule needs 0 < linear_start < linear_end < 1, got {} and {}",
                params.linear_start, params.linear_end
            )));
        }

        Ok(())
    }
}

fn check_target(target: &str, expected: &str) -> Result<()> {
    let name = target.rsplit('.').next().unwrap_or(target);
    if name == expected {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "unsupported target {}, expected {}",
            target, expected
        )))
    }
}

fn default_linear_start() -> f64 {
    0.00085
}

fn default_linear_end() -> f64 {
    0.012
}

fn default_timesteps() -> usize {
    1000
}

fn default_channels() -> usize {
    4
}

fn default_scale_factor() -> f64 {
    1.0
}

fn default_conditioning_key() -> String {
    "crossattn".into()
}

fn default_unset() -> i64 {
    -1
}

fn default_transformer_depth() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_image_channels() -> usize {
    3
}

fn default_max_length() -> usize {
    77
}

fn default_vocab_size() -> usize {
    49408
}

fn default_hidden_size() -> usize {
    768
}

fn default_attention_heads() -> usize {
    12
}

fn default_hidden_layers() -> usize {
    12
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

#[cfg(test)]
mod tests {
    use super::*;

    const V1_INFERENCE: &str = r#"
model:
  base_learning_rate: 1.0e-04
  target: ldm.models.diffusion.ddpm.LatentDiffusion
  params:
    linear_start: 0.00085
    linear_end: 0.0120
    num_timesteps_cond: 1
    log_every_t: 200
    timesteps: 1000
    first_stage_key: "jpg"
    cond_stage_key: "txt"
    image_size: 64
    channels: 4
    cond_stage_trainable: false
    conditioning_key: crossattn
    monitor: val/loss_simple_ema
    scale_factor: 0.18215
    use_ema: False

    scheduler_config:
      target: ldm.lr_scheduler.LambdaLinearScheduler
      params:
        warm_up_steps: [ 10000 ]
        cycle_lengths: [ 10000000000000 ]
        f_start: [ 1.e-6 ]
        f_max: [ 1. ]
        f_min: [ 1. ]

    unet_config:
      target: ldm.modules.diffusionmodules.openaimodel.UNetModel
      params:
        image_size: 32
        in_channels: 4
        out_channels: 4
        model_channels: 320
        attention_resolutions: [ 4, 2, 1 ]
        num_res_blocks: 2
        channel_mult: [ 1, 2, 4, 4 ]
        num_heads: 8
        use_spatial_transformer: True
        transformer_depth: 1
        context_dim: 768
        use_checkpoint: True
        legacy: False

    first_stage_config:
      target: ldm.models.autoencoder.AutoencoderKL
      params:
        embed_dim: 4
        monitor: val/rec_loss
        ddconfig:
          double_z: true
          z_channels: 4
          resolution: 256
          in_channels: 3
          out_ch: 3
          ch: 128
          ch_mult:
          - 1
          - 2
          - 4
          - 4
          num_res_blocks: 2
          attn_resolutions: []
          dropout: 0.0
        lossconfig:
          target: torch.nn.Identity

    cond_stage_config:
      target: ldm.modules.encoders.modules.FrozenCLIPEmbedder
"#;

    #[test]
    fn parses_reference_inference_yaml() {
        let config: InferenceConfig = serde_yaml::from_str(V1_INFERENCE).unwrap();
        config.validate().unwrap();

        let params = config.params();
        assert_eq!(params.timesteps, 1000);
        assert_eq!(params.scale_factor, 0.18215);
        assert!(!params.use_ema);
        assert_eq!(params.unet_config.params.channel_mult, vec![1, 2, 4, 4]);
        assert_eq!(params.unet_config.params.context_dim, Some(768));
        assert_eq!(params.cond_stage_config.params.max_length, 77);
        assert_eq!(params.cond_stage_config.params.device, None);
        assert_eq!(config.latent_downscale_factor(), 8);
    }

    #[test]
    fn device_injection_only_touches_cond_stage() {
        let mut config: InferenceConfig = serde_yaml::from_str(V1_INFERENCE).unwrap();
        config.set_cond_stage_device("Cpu");

        assert_eq!(
            config.params().cond_stage_config.params.device.as_deref(),
            Some("Cpu")
        );
        assert_eq!(config.params().unet_config.params.model_channels, 320);
    }

    #[test]
    fn attention_heads_follow_num_heads() {
        let unet = UNetParams::default();
        assert_eq!(unet.attention_heads(320).unwrap(), (8, 40));
        assert_eq!(unet.attention_heads(1280).unwrap(), (8, 160));

        let by_width = UNetParams {
            num_heads: -1,
            num_head_channels: 64,
            ..UNetParams::default()
        };
        assert_eq!(by_width.attention_heads(320).unwrap(), (5, 64));
        assert!(by_width.attention_heads(100).is_err());
    }

    #[test]
    fn rejects_unknown_targets() {
        let mut config: InferenceConfig = serde_yaml::from_str(V1_INFERENCE).unwrap();
        config.model.params.first_stage_config.target = "ldm.models.autoencoder.VQModel".into();

        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_context_width_mismatch() {
        let mut config: InferenceConfig = serde_yaml::from_str(V1_INFERENCE).unwrap();
        config.model.params.unet_config.params.context_dim = Some(1024);

        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_out_of_order_noise_schedule() {
        let mut config: InferenceConfig = serde_yaml::from_str(V1_INFERENCE).unwrap();
        config.model.params.linear_start = 0.012;
        config.model.params.linear_end = 0.00085;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.model.params.linear_start = 0.00085;
        config.model.params.linear_end = 1.5;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
