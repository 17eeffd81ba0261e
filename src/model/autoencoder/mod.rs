pub mod load;

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        PaddingConfig2d,
    },
    tensor::{activation::silu, backend::Backend, Tensor},
};

use super::attention::qkv_attention;
use super::groupnorm::*;
use super::unet::upsample_nearest;
use crate::config::FirstStageParams;

const N_GROUP: usize = 32;
const NORM_EPS: f64 = 1e-6;

#[derive(Config, Debug)]
pub struct AutoencoderConfig {
    n_channels_image_in: usize,
    n_channels_image_out: usize,
    n_channels_base: usize,
    channel_mult: Vec<usize>,
    n_res_blocks: usize,
    n_channels_z: usize,
    n_channels_embed: usize,
}

impl AutoencoderConfig {
    pub fn from_params(params: &FirstStageParams) -> Self {
        let dd = &params.ddconfig;
        Self::new(
            dd.in_channels,
            dd.out_ch,
            dd.ch,
            dd.ch_mult.clone(),
            dd.num_res_blocks,
            dd.z_channels,
            params.embed_dim,
        )
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Autoencoder<B> {
        let encoder = EncoderConfig::new(
            self.n_channels_image_in,
            self.n_channels_base,
            self.channel_mult.clone(),
            self.n_res_blocks,
            2 * self.n_channels_z,
        )
        .init(device);
        let decoder = DecoderConfig::new(
            self.n_channels_z,
            self.n_channels_base,
            self.channel_mult.clone(),
            self.n_res_blocks,
            self.n_channels_image_out,
        )
        .init(device);
        let quant_conv =
            Conv2dConfig::new([2 * self.n_channels_z, 2 * self.n_channels_embed], [1, 1]).init(device);
        let post_quant_conv =
            Conv2dConfig::new([self.n_channels_embed, self.n_channels_z], [1, 1]).init(device);

        Autoencoder {
            n_channels_embed: self.n_channels_embed,
            encoder,
            decoder,
            quant_conv,
            post_quant_conv,
        }
    }
}

/// KL-regularized autoencoder between pixel space and latent space.
#[derive(Module, Debug)]
pub struct Autoencoder<B: Backend> {
    n_channels_embed: usize,
    encoder: Encoder<B>,
    decoder: Decoder<B>,
    quant_conv: Conv2d<B>,
    post_quant_conv: Conv2d<B>,
}

impl<B: Backend> Autoencoder<B> {
    /// Mean of the latent posterior for images in `[-1, 1]`.
    pub fn encode(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [n_batch, _, height, width] = x.dims();
        let moments = self.quant_conv.forward(self.encoder.forward(x));
        let [_, _, h, w] = moments.dims();
        debug_assert!(h <= height && w <= width);

        moments.slice([0..n_batch, 0..self.n_channels_embed, 0..h, 0..w])
    }

    /// Pixels roughly in `[-1, 1]` for the given latents.
    pub fn decode(&self, latent: Tensor<B, 4>) -> Tensor<B, 4> {
        let latent = self.post_quant_conv.forward(latent);
        self.decoder.forward(latent)
    }
}

#[derive(Config)]
pub struct EncoderConfig {
    n_channels_in: usize,
    n_channels_base: usize,
    channel_mult: Vec<usize>,
    n_res_blocks: usize,
    n_channels_out: usize,
}

impl EncoderConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> Encoder<B> {
        let conv_in = Conv2dConfig::new([self.n_channels_in, self.n_channels_base], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        let mut n_channel = self.n_channels_base;
        let levels = self
            .channel_mult
            .iter()
            .enumerate()
            .map(|(i, mult)| {
                let n_channel_out = self.n_channels_base * mult;
                let blocks = (0..self.n_res_blocks)
                    .map(|_| {
                        let block = ResnetBlockConfig::new(n_channel, n_channel_out).init(device);
                        n_channel = n_channel_out;
                        block
                    })
                    .collect();
                let downsample = (i != self.channel_mult.len() - 1)
                    .then(|| DownsampleConfig::new(n_channel_out).init(device));

                EncoderLevel { blocks, downsample }
            })
            .collect();

        let mid = MidConfig::new(n_channel).init(device);
        let norm_out = GroupNormConfig::new(N_GROUP, n_channel).with_eps(NORM_EPS).init(device);
        let conv_out = Conv2dConfig::new([n_channel, self.n_channels_out], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        Encoder {
            conv_in,
            levels,
            mid,
            norm_out,
            conv_out,
        }
    }
}

#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    conv_in: Conv2d<B>,
    levels: Vec<EncoderLevel<B>>,
    mid: Mid<B>,
    norm_out: GroupNorm<B>,
    conv_out: Conv2d<B>,
}

impl<B: Backend> Encoder<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = self.conv_in.forward(x);

        for level in &self.levels {
            x = level.forward(x);
        }

        let x = self.mid.forward(x);
        self.conv_out.forward(silu(self.norm_out.forward(x)))
    }
}

#[derive(Module, Debug)]
pub struct EncoderLevel<B: Backend> {
    blocks: Vec<ResnetBlock<B>>,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> EncoderLevel<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = x;
        for block in &self.blocks {
            x = block.forward(x);
        }

        match &self.downsample {
            Some(d) => d.forward(x),
            None => x,
        }
    }
}

#[derive(Config)]
pub struct DecoderConfig {
    n_channels_z: usize,
    n_channels_base: usize,
    channel_mult: Vec<usize>,
    n_res_blocks: usize,
    n_channels_out: usize,
}

impl DecoderConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> Decoder<B> {
        let mut n_channel = self.n_channels_base * self.channel_mult.last().copied().unwrap_or(1);

        let conv_in = Conv2dConfig::new([self.n_channels_z, n_channel], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let mid = MidConfig::new(n_channel).init(device);

        // execution order: deepest level first
        let levels = self
            .channel_mult
            .iter()
            .enumerate()
            .rev()
            .map(|(i, mult)| {
                let n_channel_out = self.n_channels_base * mult;
                let blocks = (0..=self.n_res_blocks)
                    .map(|_| {
                        let block = ResnetBlockConfig::new(n_channel, n_channel_out).init(device);
                        n_channel = n_channel_out;
                        block
                    })
                    .collect();
                let upsample = (i != 0).then(|| {
                    Conv2dConfig::new([n_channel_out, n_channel_out], [3, 3])
                        .with_padding(PaddingConfig2d::Explicit(1, 1))
                        .init(device)
                });

                DecoderLevel { blocks, upsample }
            })
            .collect();

        let norm_out = GroupNormConfig::new(N_GROUP, n_channel).with_eps(NORM_EPS).init(device);
        let conv_out = Conv2dConfig::new([n_channel, self.n_channels_out], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        Decoder {
            conv_in,
            mid,
            levels,
            norm_out,
            conv_out,
        }
    }
}

#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    conv_in: Conv2d<B>,
    mid: Mid<B>,
    levels: Vec<DecoderLevel<B>>,
    norm_out: GroupNorm<B>,
    conv_out: Conv2d<B>,
}

impl<B: Backend> Decoder<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv_in.forward(x);
        let mut x = self.mid.forward(x);

        for level in &self.levels {
            x = level.forward(x);
        }

        self.conv_out.forward(silu(self.norm_out.forward(x)))
    }
}

#[derive(Module, Debug)]
pub struct DecoderLevel<B: Backend> {
    blocks: Vec<ResnetBlock<B>>,
    upsample: Option<Conv2d<B>>,
}

impl<B: Backend> DecoderLevel<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = x;
        for block in &self.blocks {
            x = block.forward(x);
        }

        match &self.upsample {
            Some(conv) => conv.forward(upsample_nearest(x)),
            None => x,
        }
    }
}

#[derive(Config)]
pub struct DownsampleConfig {
    n_channels: usize,
}

impl DownsampleConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> Downsample<B> {
        let conv = Conv2dConfig::new([self.n_channels, self.n_channels], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Valid)
            .init(device);

        Downsample { conv }
    }
}

/// Stride-2 convolution after zero padding the right and bottom edges by one.
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
}

impl<B: Backend> Downsample<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [n_batch, n_channel, height, width] = x.dims();
        let device = x.device();

        let x = Tensor::cat(vec![x, Tensor::zeros([n_batch, n_channel, height, 1], &device)], 3);
        let x = Tensor::cat(vec![x, Tensor::zeros([n_batch, n_channel, 1, width + 1], &device)], 2);

        self.conv.forward(x)
    }
}

#[derive(Config)]
pub struct MidConfig {
    n_channel: usize,
}

impl MidConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> Mid<B> {
        let block_1 = ResnetBlockConfig::new(self.n_channel, self.n_channel).init(device);
        let attn = ConvSelfAttentionBlockConfig::new(self.n_channel).init(device);
        let block_2 = ResnetBlockConfig::new(self.n_channel, self.n_channel).init(device);

        Mid {
            block_1,
            attn,
            block_2,
        }
    }
}

#[derive(Module, Debug)]
pub struct Mid<B: Backend> {
    block_1: ResnetBlock<B>,
    attn: ConvSelfAttentionBlock<B>,
    block_2: ResnetBlock<B>,
}

impl<B: Backend> Mid<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.block_1.forward(x);
        let x = self.attn.forward(x);
        self.block_2.forward(x)
    }
}

#[derive(Config)]
pub struct ResnetBlockConfig {
    in_channels: usize,
    out_channels: usize,
}

impl ResnetBlockConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> ResnetBlock<B> {
        let norm1 = GroupNormConfig::new(N_GROUP, self.in_channels)
            .with_eps(NORM_EPS)
            .init(device);
        let conv1 = Conv2dConfig::new([self.in_channels, self.out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let norm2 = GroupNormConfig::new(N_GROUP, self.out_channels)
            .with_eps(NORM_EPS)
            .init(device);
        let conv2 = Conv2dConfig::new([self.out_channels, self.out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let nin_shortcut = if self.in_channels != self.out_channels {
            Some(Conv2dConfig::new([self.in_channels, self.out_channels], [1, 1]).init(device))
        } else {
            None
        };

        ResnetBlock {
            norm1,
            conv1,
            norm2,
            conv2,
            nin_shortcut,
        }
    }
}

#[derive(Module, Debug)]
pub struct ResnetBlock<B: Backend> {
    norm1: GroupNorm<B>,
    conv1: Conv2d<B>,
    norm2: GroupNorm<B>,
    conv2: Conv2d<B>,
    nin_shortcut: Option<Conv2d<B>>,
}

impl<B: Backend> ResnetBlock<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let h = self.conv1.forward(silu(self.norm1.forward(x.clone())));
        let h = self.conv2.forward(silu(self.norm2.forward(h)));

        if let Some(ns) = self.nin_shortcut.as_ref() {
            ns.forward(x) + h
        } else {
            x + h
        }
    }
}

#[derive(Config)]
pub struct ConvSelfAttentionBlockConfig {
    n_channel: usize,
}

impl ConvSelfAttentionBlockConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> ConvSelfAttentionBlock<B> {
        let norm = GroupNormConfig::new(N_GROUP, self.n_channel)
            .with_eps(NORM_EPS)
            .init(device);
        let q = Conv2dConfig::new([self.n_channel, self.n_channel], [1, 1]).init(device);
        let k = Conv2dConfig::new([self.n_channel, self.n_channel], [1, 1]).init(device);
        let v = Conv2dConfig::new([self.n_channel, self.n_channel], [1, 1]).init(device);
        let proj_out = Conv2dConfig::new([self.n_channel, self.n_channel], [1, 1]).init(device);

        ConvSelfAttentionBlock {
            norm,
            q,
            k,
            v,
            proj_out,
        }
    }
}

#[derive(Module, Debug)]
pub struct ConvSelfAttentionBlock<B: Backend> {
    norm: GroupNorm<B>,
    q: Conv2d<B>,
    k: Conv2d<B>,
    v: Conv2d<B>,
    proj_out: Conv2d<B>,
}

impl<B: Backend> ConvSelfAttentionBlock<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [n_batch, n_channel, height, width] = x.dims();

        let h = self.norm.forward(x.clone());

        let flatten = |t: Tensor<B, 4>| t.reshape([n_batch, n_channel, height * width]).swap_dims(1, 2);
        let q = flatten(self.q.forward(h.clone()));
        let k = flatten(self.k.forward(h.clone()));
        let v = flatten(self.v.forward(h));

        let wv = qkv_attention(q, k, v, None, 1)
            .swap_dims(1, 2)
            .reshape([n_batch, n_channel, height, width]);

        x + self.proj_out.forward(wv)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::DdConfig;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    pub(crate) fn tiny_params() -> FirstStageParams {
        FirstStageParams {
            embed_dim: 4,
            ddconfig: DdConfig {
                double_z: true,
                z_channels: 4,
                in_channels: 3,
                out_ch: 3,
                ch: 32,
                ch_mult: vec![1, 2],
                num_res_blocks: 1,
                attn_resolutions: vec![],
            },
        }
    }

    #[test]
    fn decode_upsamples_by_the_downscale_factor() {
        let device = NdArrayDevice::Cpu;
        let autoencoder = AutoencoderConfig::from_params(&tiny_params()).init::<TestBackend>(&device);

        let latent = Tensor::<TestBackend, 4>::zeros([2, 4, 3, 5], &device);
        assert_eq!(autoencoder.decode(latent).dims(), [2, 3, 6, 10]);
    }

    #[test]
    fn encode_returns_posterior_mean_channels() {
        let device = NdArrayDevice::Cpu;
        let autoencoder = AutoencoderConfig::from_params(&tiny_params()).init::<TestBackend>(&device);

        let image = Tensor::<TestBackend, 4>::zeros([1, 3, 8, 8], &device);
        assert_eq!(autoencoder.encode(image).dims(), [1, 4, 4, 4]);
    }

    #[test]
    fn downsample_pads_right_and_bottom() {
        let device = NdArrayDevice::Cpu;
        let down = DownsampleConfig::new(32).init::<TestBackend>(&device);

        let x = Tensor::<TestBackend, 4>::zeros([1, 32, 8, 8], &device);
        assert_eq!(down.forward(x).dims(), [1, 32, 4, 4]);

        // one padded row/column only, so an odd side rounds down
        let x = Tensor::<TestBackend, 4>::zeros([1, 32, 7, 8], &device);
        assert_eq!(down.forward(x).dims(), [1, 32, 3, 4]);
    }
}
