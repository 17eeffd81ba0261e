use burn::tensor::backend::Backend;

use super::*;
use crate::error::Result;
use crate::model::groupnorm::load::map_group_norm;
use crate::model::load::{join, map_conv2d, ParamMapper};

fn map_conv_self_attention_block<B: Backend, M: ParamMapper<B>>(
    mapper: &mut M,
    path: &str,
    block: ConvSelfAttentionBlock<B>,
) -> Result<ConvSelfAttentionBlock<B>> {
    Ok(ConvSelfAttentionBlock {
        norm: map_group_norm(mapper, &join(path, "norm"), block.norm)?,
        q: map_conv2d(mapper, &join(path, "q"), block.q)?,
        k: map_conv2d(mapper, &join(path, "k"), block.k)?,
        v: map_conv2d(mapper, &join(path, "v"), block.v)?,
        proj_out: map_conv2d(mapper, &join(path, "proj_out"), block.proj_out)?,
    })
}

fn map_resnet_block<B: Backend, M: ParamMapper<B>>(
    mapper: &mut M,
    path: &str,
    block: ResnetBlock<B>,
) -> Result<ResnetBlock<B>> {
    Ok(ResnetBlock {
        norm1: map_group_norm(mapper, &join(path, "norm1"), block.norm1)?,
        conv1: map_conv2d(mapper, &join(path, "conv1"), block.conv1)?,
        norm2: map_group_norm(mapper, &join(path, "norm2"), block.norm2)?,
        conv2: map_conv2d(mapper, &join(path, "conv2"), block.conv2)?,
        nin_shortcut: block
            .nin_shortcut
            .map(|conv| map_conv2d(mapper, &join(path, "nin_shortcut"), conv))
            .transpose()?,
    })
}

fn map_resnet_blocks<B: Backend, M: ParamMapper<B>>(
    mapper: &mut M,
    path: &str,
    blocks: Vec<ResnetBlock<B>>,
) -> Result<Vec<ResnetBlock<B>>> {
    blocks
        .into_iter()
        .enumerate()
        .map(|(j, block)| map_resnet_block(mapper, &format!("{}.block.{}", path, j), block))
        .collect()
}

fn map_mid<B: Backend, M: ParamMapper<B>>(mapper: &mut M, path: &str, mid: Mid<B>) -> Result<Mid<B>> {
    Ok(Mid {
        block_1: map_resnet_block(mapper, &join(path, "block_1"), mid.block_1)?,
        attn: map_conv_self_attention_block(mapper, &join(path, "attn_1"), mid.attn)?,
        block_2: map_resnet_block(mapper, &join(path, "block_2"), mid.block_2)?,
    })
}

fn map_encoder<B: Backend, M: ParamMapper<B>>(mapper: &mut M, path: &str, encoder: Encoder<B>) -> Result<Encoder<B>> {
    let conv_in = map_conv2d(mapper, &join(path, "conv_in"), encoder.conv_in)?;

    let levels = encoder
        .levels
        .into_iter()
        .enumerate()
        .map(|(i, level)| -> Result<EncoderLevel<B>> {
            let level_path = format!("{}.down.{}", path, i);
            Ok(EncoderLevel {
                blocks: map_resnet_blocks(mapper, &level_path, level.blocks)?,
                downsample: level
                    .downsample
                    .map(|d| {
                        map_conv2d(mapper, &join(&level_path, "downsample.conv"), d.conv)
                            .map(|conv| Downsample { conv })
                    })
                    .transpose()?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Encoder {
        conv_in,
        levels,
        mid: map_mid(mapper, &join(path, "mid"), encoder.mid)?,
        norm_out: map_group_norm(mapper, &join(path, "norm_out"), encoder.norm_out)?,
        conv_out: map_conv2d(mapper, &join(path, "conv_out"), encoder.conv_out)?,
    })
}

/// Decoder levels run deepest first, while checkpoint keys `up.i` count
/// from the full-resolution level.
fn map_decoder<B: Backend, M: ParamMapper<B>>(mapper: &mut M, path: &str, decoder: Decoder<B>) -> Result<Decoder<B>> {
    let conv_in = map_conv2d(mapper, &join(path, "conv_in"), decoder.conv_in)?;
    let mid = map_mid(mapper, &join(path, "mid"), decoder.mid)?;

    let n_levels = decoder.levels.len();
    let levels = decoder
        .levels
        .into_iter()
        .enumerate()
        .map(|(k, level)| -> Result<DecoderLevel<B>> {
            let level_path = format!("{}.up.{}", path, n_levels - 1 - k);
            Ok(DecoderLevel {
                blocks: map_resnet_blocks(mapper, &level_path, level.blocks)?,
                upsample: level
                    .upsample
                    .map(|conv| map_conv2d(mapper, &join(&level_path, "upsample.conv"), conv))
                    .transpose()?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Decoder {
        conv_in,
        mid,
        levels,
        norm_out: map_group_norm(mapper, &join(path, "norm_out"), decoder.norm_out)?,
        conv_out: map_conv2d(mapper, &join(path, "conv_out"), decoder.conv_out)?,
    })
}

/// Parameters follow the `AutoencoderKL` naming under `path`
/// (`first_stage_model` in SD v1 checkpoints).
pub fn map_autoencoder<B: Backend, M: ParamMapper<B>>(
    mapper: &mut M,
    path: &str,
    autoencoder: Autoencoder<B>,
) -> Result<Autoencoder<B>> {
    Ok(Autoencoder {
        n_channels_embed: autoencoder.n_channels_embed,
        encoder: map_encoder(mapper, &join(path, "encoder"), autoencoder.encoder)?,
        decoder: map_decoder(mapper, &join(path, "decoder"), autoencoder.decoder)?,
        quant_conv: map_conv2d(mapper, &join(path, "quant_conv"), autoencoder.quant_conv)?,
        post_quant_conv: map_conv2d(mapper, &join(path, "post_quant_conv"), autoencoder.post_quant_conv)?,
    })
}
