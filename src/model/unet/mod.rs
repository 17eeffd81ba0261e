pub mod load;

use burn::{
    config::Config,
    module::Module,
    nn::{
        self,
        conv::{Conv2d, Conv2dConfig},
        PaddingConfig2d,
    },
    tensor::{
        activation::{gelu, silu},
        backend::Backend,
        Tensor,
    },
};

use super::attention::qkv_attention;
use super::groupnorm::*;
use crate::config::UNetParams;
use crate::error::Result as CrateResult;

const N_GROUP: usize = 32;
const TRANSFORMER_NORM_EPS: f64 = 1e-6;

/// Sinusoidal embedding of (possibly fractional) timesteps, `[n, dim]`.
pub fn timestep_embedding<B: Backend>(timesteps: Tensor<B, 1>, dim: usize, max_period: usize) -> Tensor<B, 2> {
    let half = dim / 2;
    let device = timesteps.device();

    let freqs = Tensor::<B, 1, burn::tensor::Int>::arange(0..half as i64, &device)
        .float()
        .mul_scalar(-(max_period as f64).ln() / half as f64)
        .exp();
    let args = timesteps.unsqueeze_dim::<2>(1) * freqs.unsqueeze_dim::<2>(0);

    Tensor::cat(vec![args.clone().cos(), args.sin()], 1)
}

#[derive(Config, Debug)]
pub struct UNetConfig {
    n_channels_in: usize,
    n_channels_out: usize,
    n_channels_model: usize,
    channel_mult: Vec<usize>,
    n_res_blocks: usize,
    attention_resolutions: Vec<usize>,
    /// Heads and channels per head for every attention width, as (width, heads).
    attention_heads: Vec<(usize, usize)>,
    n_transformer_depth: usize,
    n_context_state: usize,
}

impl UNetConfig {
    pub fn from_params(params: &UNetParams) -> CrateResult<Self> {
        let mut attention_heads = Vec::new();
        for mult in &params.channel_mult {
            let width = params.model_channels * mult;
            let (n_head, _) = params.attention_heads(width)?;
            attention_heads.push((width, n_head));
        }

        Ok(Self::new(
            params.in_channels,
            params.out_channels,
            params.model_channels,
            params.channel_mult.clone(),
            params.num_res_blocks,
            params.attention_resolutions.clone(),
            attention_heads,
            params.transformer_depth,
            params.context_dim.unwrap_or_default(),
        ))
    }

    fn n_head(&self, n_channels: usize) -> usize {
        self.attention_heads
            .iter()
            .find(|(width, _)| *width == n_channels)
            .map(|(_, n_head)| *n_head)
            .unwrap_or(1)
    }

    fn transformer<B: Backend>(&self, n_channels: usize, device: &B::Device) -> SpatialTransformer<B> {
        SpatialTransformerConfig::new(
            n_channels,
            self.n_context_state,
            self.n_head(n_channels),
            self.n_transformer_depth,
        )
        .init(device)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> UNet<B> {
        let n_channels_embed = self.n_channels_model * 4;

        let lin1_time_embed = nn::LinearConfig::new(self.n_channels_model, n_channels_embed).init(device);
        let lin2_time_embed = nn::LinearConfig::new(n_channels_embed, n_channels_embed).init(device);

        let mut input_blocks = vec![UNetBlock {
            conv: Some(
                Conv2dConfig::new([self.n_channels_in, self.n_channels_model], [3, 3])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device),
            ),
            ..UNetBlock::empty()
        }];
        let mut skip_channels = vec![self.n_channels_model];
        let mut n_channel = self.n_channels_model;
        let mut downscale = 1;

        for (level, mult) in self.channel_mult.iter().enumerate() {
            for _ in 0..self.n_res_blocks {
                let n_channel_out = self.n_channels_model * mult;
                let res = ResBlockConfig::new(n_channel, n_channels_embed, n_channel_out).init(device);
                n_channel = n_channel_out;

                let transformer = self
                    .attention_resolutions
                    .contains(&downscale)
                    .then(|| self.transformer(n_channel, device));

                input_blocks.push(UNetBlock {
                    res: Some(res),
                    transformer,
                    ..UNetBlock::empty()
                });
                skip_channels.push(n_channel);
            }

            if level != self.channel_mult.len() - 1 {
                input_blocks.push(UNetBlock {
                    downsample: Some(DownsampleConfig::new(n_channel).init(device)),
                    ..UNetBlock::empty()
                });
                skip_channels.push(n_channel);
                downscale *= 2;
            }
        }

        let middle_block = ResTransformerResConfig::new(
            n_channel,
            n_channels_embed,
            self.n_context_state,
            self.n_head(n_channel),
            self.n_transformer_depth,
        )
        .init(device);

        let mut output_blocks = Vec::new();
        for (level, mult) in self.channel_mult.iter().enumerate().rev() {
            for i in 0..=self.n_res_blocks {
                let n_skip = skip_channels.pop().unwrap_or_default();
                let n_channel_out = self.n_channels_model * mult;
                let res = ResBlockConfig::new(n_channel + n_skip, n_channels_embed, n_channel_out).init(device);
                n_channel = n_channel_out;

                let transformer = self
                    .attention_resolutions
                    .contains(&downscale)
                    .then(|| self.transformer(n_channel, device));

                let upsample = if level != 0 && i == self.n_res_blocks {
                    downscale /= 2;
                    Some(UpsampleConfig::new(n_channel).init(device))
                } else {
                    None
                };

                output_blocks.push(UNetBlock {
                    res: Some(res),
                    transformer,
                    upsample,
                    ..UNetBlock::empty()
                });
            }
        }

        let norm_out = GroupNormConfig::new(N_GROUP, n_channel).init(device);
        let conv_out = Conv2dConfig::new([n_channel, self.n_channels_out], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        UNet {
            n_channels_model: self.n_channels_model,
            lin1_time_embed,
            lin2_time_embed,
            input_blocks,
            middle_block,
            output_blocks,
            norm_out,
            conv_out,
        }
    }
}

/// Text-conditioned denoiser predicting the noise in a latent.
#[derive(Module, Debug)]
pub struct UNet<B: Backend> {
    n_channels_model: usize,
    lin1_time_embed: nn::Linear<B>,
    lin2_time_embed: nn::Linear<B>,
    input_blocks: Vec<UNetBlock<B>>,
    middle_block: ResTransformerRes<B>,
    output_blocks: Vec<UNetBlock<B>>,
    norm_out: GroupNorm<B>,
    conv_out: Conv2d<B>,
}

impl<B: Backend> UNet<B> {
    pub fn forward(&self, x: Tensor<B, 4>, timesteps: Tensor<B, 1>, context: Tensor<B, 3>) -> Tensor<B, 4> {
        let t_emb = timestep_embedding(timesteps, self.n_channels_model, 10000);
        let emb = self.lin1_time_embed.forward(t_emb);
        let emb = silu(emb);
        let emb = self.lin2_time_embed.forward(emb);

        let mut saved_inputs = Vec::with_capacity(self.input_blocks.len());
        let mut x = x;

        for block in &self.input_blocks {
            x = block.forward(x, emb.clone(), context.clone());
            saved_inputs.push(x.clone());
        }

        x = self.middle_block.forward(x, emb.clone(), context.clone());

        for block in &self.output_blocks {
            if let Some(skip) = saved_inputs.pop() {
                // odd sizes: upsampling overshoots the skip by one cell
                let [n_batch, _, height, width] = skip.dims();
                let [_, n_channel_x, height_x, width_x] = x.dims();
                if (height_x, width_x) != (height, width) {
                    x = x.slice([0..n_batch, 0..n_channel_x, 0..height, 0..width]);
                }
                x = Tensor::cat(vec![x, skip], 1);
            }
            x = block.forward(x, emb.clone(), context.clone());
        }

        let x = self.norm_out.forward(x);
        let x = silu(x);
        self.conv_out.forward(x)
    }
}

/// One entry of the input or output block lists. Layers run in field order;
/// absent layers are skipped.
#[derive(Module, Debug)]
pub struct UNetBlock<B: Backend> {
    conv: Option<Conv2d<B>>,
    res: Option<ResBlock<B>>,
    transformer: Option<SpatialTransformer<B>>,
    downsample: Option<Conv2d<B>>,
    upsample: Option<Upsample<B>>,
}

impl<B: Backend> UNetBlock<B> {
    fn empty() -> Self {
        Self {
            conv: None,
            res: None,
            transformer: None,
            downsample: None,
            upsample: None,
        }
    }

    fn forward(&self, x: Tensor<B, 4>, emb: Tensor<B, 2>, context: Tensor<B, 3>) -> Tensor<B, 4> {
        let mut x = x;
        if let Some(conv) = &self.conv {
            x = conv.forward(x);
        }
        if let Some(res) = &self.res {
            x = res.forward(x, emb);
        }
        if let Some(transformer) = &self.transformer {
            x = transformer.forward(x, context);
        }
        if let Some(downsample) = &self.downsample {
            x = downsample.forward(x);
        }
        if let Some(upsample) = &self.upsample {
            x = upsample.forward(x);
        }
        x
    }
}

#[derive(Config)]
pub struct ResTransformerResConfig {
    n_channels: usize,
    n_channels_embed: usize,
    n_context_state: usize,
    n_head: usize,
    n_depth: usize,
}

impl ResTransformerResConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> ResTransformerRes<B> {
        let res1 = ResBlockConfig::new(self.n_channels, self.n_channels_embed, self.n_channels).init(device);
        let transformer =
            SpatialTransformerConfig::new(self.n_channels, self.n_context_state, self.n_head, self.n_depth)
                .init(device);
        let res2 = ResBlockConfig::new(self.n_channels, self.n_channels_embed, self.n_channels).init(device);

        ResTransformerRes {
            res1,
            transformer,
            res2,
        }
    }
}

#[derive(Module, Debug)]
pub struct ResTransformerRes<B: Backend> {
    res1: ResBlock<B>,
    transformer: SpatialTransformer<B>,
    res2: ResBlock<B>,
}

impl<B: Backend> ResTransformerRes<B> {
    fn forward(&self, x: Tensor<B, 4>, emb: Tensor<B, 2>, context: Tensor<B, 3>) -> Tensor<B, 4> {
        let x = self.res1.forward(x, emb.clone());
        let x = self.transformer.forward(x, context);
        self.res2.forward(x, emb)
    }
}

#[derive(Config)]
pub struct UpsampleConfig {
    n_channels: usize,
}

impl UpsampleConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> Upsample<B> {
        let conv = Conv2dConfig::new([self.n_channels, self.n_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        Upsample { conv }
    }
}

/// Nearest-neighbour 2x upsampling followed by a 3x3 convolution.
#[derive(Module, Debug)]
pub struct Upsample<B: Backend> {
    conv: Conv2d<B>,
}

impl<B: Backend> Upsample<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(upsample_nearest(x))
    }
}

pub fn upsample_nearest<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [n_batch, n_channel, height, width] = x.dims();
    x.reshape([n_batch, n_channel, height, 1, width, 1])
        .repeat_dim(3, 2)
        .repeat_dim(5, 2)
        .reshape([n_batch, n_channel, 2 * height, 2 * width])
}

#[derive(Config)]
pub struct DownsampleConfig {
    n_channels: usize,
}

impl DownsampleConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> Conv2d<B> {
        Conv2dConfig::new([self.n_channels, self.n_channels], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device)
    }
}

#[derive(Config)]
pub struct SpatialTransformerConfig {
    n_channels: usize,
    n_context_state: usize,
    n_head: usize,
    n_depth: usize,
}

impl SpatialTransformerConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> SpatialTransformer<B> {
        let norm = GroupNormConfig::new(N_GROUP, self.n_channels)
            .with_eps(TRANSFORMER_NORM_EPS)
            .init(device);
        let proj_in = Conv2dConfig::new([self.n_channels, self.n_channels], [1, 1]).init(device);
        let blocks = (0..self.n_depth)
            .map(|_| TransformerBlockConfig::new(self.n_channels, self.n_context_state, self.n_head).init(device))
            .collect();
        let proj_out = Conv2dConfig::new([self.n_channels, self.n_channels], [1, 1]).init(device);

        SpatialTransformer {
            norm,
            proj_in,
            blocks,
            proj_out,
        }
    }
}

#[derive(Module, Debug)]
pub struct SpatialTransformer<B: Backend> {
    norm: GroupNorm<B>,
    proj_in: Conv2d<B>,
    blocks: Vec<TransformerBlock<B>>,
    proj_out: Conv2d<B>,
}

impl<B: Backend> SpatialTransformer<B> {
    fn forward(&self, x: Tensor<B, 4>, context: Tensor<B, 3>) -> Tensor<B, 4> {
        let [n_batch, n_channel, height, width] = x.dims();

        let x_in = x.clone();

        let x = self.norm.forward(x);
        let x = self.proj_in.forward(x);
        let mut x = x.reshape([n_batch, n_channel, height * width]).swap_dims(1, 2);

        for block in &self.blocks {
            x = block.forward(x, context.clone());
        }

        let x = x.swap_dims(1, 2).reshape([n_batch, n_channel, height, width]);

        x_in + self.proj_out.forward(x)
    }
}

#[derive(Config)]
pub struct TransformerBlockConfig {
    n_state: usize,
    n_context_state: usize,
    n_head: usize,
}

impl TransformerBlockConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> TransformerBlock<B> {
        let norm1 = nn::LayerNormConfig::new(self.n_state).init(device);
        let attn1 = MultiHeadAttentionConfig::new(self.n_state, self.n_state, self.n_head).init(device);
        let norm2 = nn::LayerNormConfig::new(self.n_state).init(device);
        let attn2 = MultiHeadAttentionConfig::new(self.n_state, self.n_context_state, self.n_head).init(device);
        let norm3 = nn::LayerNormConfig::new(self.n_state).init(device);
        let mlp = MLPConfig::new(self.n_state, 4).init(device);

        TransformerBlock {
            norm1,
            attn1,
            norm2,
            attn2,
            norm3,
            mlp,
        }
    }
}

#[derive(Module, Debug)]
pub struct TransformerBlock<B: Backend> {
    norm1: nn::LayerNorm<B>,
    attn1: MultiHeadAttention<B>,
    norm2: nn::LayerNorm<B>,
    attn2: MultiHeadAttention<B>,
    norm3: nn::LayerNorm<B>,
    mlp: MLP<B>,
}

impl<B: Backend> TransformerBlock<B> {
    fn forward(&self, x: Tensor<B, 3>, context: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = x.clone() + self.attn1.forward(self.norm1.forward(x), None);
        let x = x.clone() + self.attn2.forward(self.norm2.forward(x), Some(context));
        x.clone() + self.mlp.forward(self.norm3.forward(x))
    }
}

#[derive(Config)]
pub struct MLPConfig {
    n_state: usize,
    mult: usize,
}

impl MLPConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MLP<B> {
        let n_state_hidden = self.n_state * self.mult;
        let geglu = GEGLUConfig::new(self.n_state, n_state_hidden).init(device);
        let lin = nn::LinearConfig::new(n_state_hidden, self.n_state).init(device);

        MLP { geglu, lin }
    }
}

#[derive(Module, Debug)]
pub struct MLP<B: Backend> {
    geglu: GEGLU<B>,
    lin: nn::Linear<B>,
}

impl<B: Backend> MLP<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.lin.forward(self.geglu.forward(x))
    }
}

#[derive(Config)]
pub struct GEGLUConfig {
    n_state_in: usize,
    n_state_out: usize,
}

impl GEGLUConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> GEGLU<B> {
        let proj = nn::LinearConfig::new(self.n_state_in, 2 * self.n_state_out).init(device);

        GEGLU { proj }
    }
}

#[derive(Module, Debug)]
pub struct GEGLU<B: Backend> {
    proj: nn::Linear<B>,
}

impl<B: Backend> GEGLU<B> {
    fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let projected = self.proj.forward(x);
        let [n_batch, n_ctx, n_state] = projected.dims();

        let n_state_out = n_state / 2;

        let x = projected.clone().slice([0..n_batch, 0..n_ctx, 0..n_state_out]);
        let gate = projected.slice([0..n_batch, 0..n_ctx, n_state_out..n_state]);

        x * gelu(gate)
    }
}

#[derive(Config)]
pub struct MultiHeadAttentionConfig {
    n_state: usize,
    n_context_state: usize,
    n_head: usize,
}

impl MultiHeadAttentionConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> MultiHeadAttention<B> {
        assert!(
            self.n_state % self.n_head == 0,
            "State size {} must be a multiple of head size {}",
            self.n_state,
            self.n_head
        );

        MultiHeadAttention {
            n_head: self.n_head,
            query: nn::LinearConfig::new(self.n_state, self.n_state)
                .with_bias(false)
                .init(device),
            key: nn::LinearConfig::new(self.n_context_state, self.n_state)
                .with_bias(false)
                .init(device),
            value: nn::LinearConfig::new(self.n_context_state, self.n_state)
                .with_bias(false)
                .init(device),
            out: nn::LinearConfig::new(self.n_state, self.n_state).init(device),
        }
    }
}

#[derive(Module, Debug)]
pub struct MultiHeadAttention<B: Backend> {
    n_head: usize,
    query: nn::Linear<B>,
    key: nn::Linear<B>,
    value: nn::Linear<B>,
    out: nn::Linear<B>,
}

impl<B: Backend> MultiHeadAttention<B> {
    pub fn forward(&self, x: Tensor<B, 3>, context: Option<Tensor<B, 3>>) -> Tensor<B, 3> {
        let xa = context.unwrap_or_else(|| x.clone());

        let q = self.query.forward(x);
        let k = self.key.forward(xa.clone());
        let v = self.value.forward(xa);

        let wv = qkv_attention(q, k, v, None, self.n_head);

        self.out.forward(wv)
    }
}

#[derive(Config)]
pub struct ResBlockConfig {
    n_channels_in: usize,
    n_channels_embed: usize,
    n_channels_out: usize,
}

impl ResBlockConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> ResBlock<B> {
        let norm_in = GroupNormConfig::new(N_GROUP, self.n_channels_in).init(device);
        let conv_in = Conv2dConfig::new([self.n_channels_in, self.n_channels_out], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        let lin_embed = nn::LinearConfig::new(self.n_channels_embed, self.n_channels_out).init(device);

        let norm_out = GroupNormConfig::new(N_GROUP, self.n_channels_out).init(device);
        let conv_out = Conv2dConfig::new([self.n_channels_out, self.n_channels_out], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        let skip_connection = if self.n_channels_in != self.n_channels_out {
            Some(Conv2dConfig::new([self.n_channels_in, self.n_channels_out], [1, 1]).init(device))
        } else {
            None
        };

        ResBlock {
            norm_in,
            conv_in,
            lin_embed,
            norm_out,
            conv_out,
            skip_connection,
        }
    }
}

#[derive(Module, Debug)]
pub struct ResBlock<B: Backend> {
    norm_in: GroupNorm<B>,
    conv_in: Conv2d<B>,
    lin_embed: nn::Linear<B>,
    norm_out: GroupNorm<B>,
    conv_out: Conv2d<B>,
    skip_connection: Option<Conv2d<B>>,
}

impl<B: Backend> ResBlock<B> {
    fn forward(&self, x: Tensor<B, 4>, embed: Tensor<B, 2>) -> Tensor<B, 4> {
        let h = self.norm_in.forward(x.clone());
        let h = silu(h);
        let h = self.conv_in.forward(h);

        let embed_out = self.lin_embed.forward(silu(embed));

        let [n_batch_embed, n_state_embed] = embed_out.dims();
        let h = h + embed_out.reshape([n_batch_embed, n_state_embed, 1, 1]);

        let h = self.norm_out.forward(h);
        let h = silu(h);
        let h = self.conv_out.forward(h);

        if let Some(skipc) = self.skip_connection.as_ref() {
            skipc.forward(x) + h
        } else {
            x + h
        }
    }
}
