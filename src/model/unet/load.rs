use burn::tensor::backend::Backend;

use super::*;
use crate::error::Result;
use crate::model::groupnorm::load::map_group_norm;
use crate::model::load::{join, map_conv2d, map_layer_norm, map_linear, ParamMapper};

pub fn map_res_block<B: Backend, M: ParamMapper<B>>(mapper: &mut M, path: &str, block: ResBlock<B>) -> Result<ResBlock<B>> {
    Ok(ResBlock {
        norm_in: map_group_norm(mapper, &join(path, "in_layers.0"), block.norm_in)?,
        conv_in: map_conv2d(mapper, &join(path, "in_layers.2"), block.conv_in)?,
        lin_embed: map_linear(mapper, &join(path, "emb_layers.1"), block.lin_embed)?,
        norm_out: map_group_norm(mapper, &join(path, "out_layers.0"), block.norm_out)?,
        conv_out: map_conv2d(mapper, &join(path, "out_layers.3"), block.conv_out)?,
        skip_connection: block
            .skip_connection
            .map(|conv| map_conv2d(mapper, &join(path, "skip_connection"), conv))
            .transpose()?,
    })
}

pub fn map_multi_head_attention<B: Backend, M: ParamMapper<B>>(
    mapper: &mut M,
    path: &str,
    attn: MultiHeadAttention<B>,
) -> Result<MultiHeadAttention<B>> {
    Ok(MultiHeadAttention {
        n_head: attn.n_head,
        query: map_linear(mapper, &join(path, "to_q"), attn.query)?,
        key: map_linear(mapper, &join(path, "to_k"), attn.key)?,
        value: map_linear(mapper, &join(path, "to_v"), attn.value)?,
        out: map_linear(mapper, &join(path, "to_out.0"), attn.out)?,
    })
}

pub fn map_mlp<B: Backend, M: ParamMapper<B>>(mapper: &mut M, path: &str, mlp: MLP<B>) -> Result<MLP<B>> {
    Ok(MLP {
        geglu: GEGLU {
            proj: map_linear(mapper, &join(path, "net.0.proj"), mlp.geglu.proj)?,
        },
        lin: map_linear(mapper, &join(path, "net.2"), mlp.lin)?,
    })
}

pub fn map_transformer_block<B: Backend, M: ParamMapper<B>>(
    mapper: &mut M,
    path: &str,
    block: TransformerBlock<B>,
) -> Result<TransformerBlock<B>> {
    Ok(TransformerBlock {
        norm1: map_layer_norm(mapper, &join(path, "norm1"), block.norm1)?,
        attn1: map_multi_head_attention(mapper, &join(path, "attn1"), block.attn1)?,
        norm2: map_layer_norm(mapper, &join(path, "norm2"), block.norm2)?,
        attn2: map_multi_head_attention(mapper, &join(path, "attn2"), block.attn2)?,
        norm3: map_layer_norm(mapper, &join(path, "norm3"), block.norm3)?,
        mlp: map_mlp(mapper, &join(path, "ff"), block.mlp)?,
    })
}

pub fn map_spatial_transformer<B: Backend, M: ParamMapper<B>>(
    mapper: &mut M,
    path: &str,
    transformer: SpatialTransformer<B>,
) -> Result<SpatialTransformer<B>> {
    let blocks = transformer
        .blocks
        .into_iter()
        .enumerate()
        .map(|(i, block)| map_transformer_block(mapper, &format!("{}.transformer_blocks.{}", path, i), block))
        .collect::<Result<Vec<_>>>()?;

    Ok(SpatialTransformer {
        norm: map_group_norm(mapper, &join(path, "norm"), transformer.norm)?,
        proj_in: map_conv2d(mapper, &join(path, "proj_in"), transformer.proj_in)?,
        blocks,
        proj_out: map_conv2d(mapper, &join(path, "proj_out"), transformer.proj_out)?,
    })
}

/// Layers inside one block are numbered in execution order, as in the
/// sequential containers of the checkpoint.
fn map_unet_block<B: Backend, M: ParamMapper<B>>(mapper: &mut M, path: &str, block: UNetBlock<B>) -> Result<UNetBlock<B>> {
    let mut index = 0;
    let mut next = || {
        let key = format!("{}.{}", path, index);
        index += 1;
        key
    };

    let conv = match block.conv {
        Some(conv) => Some(map_conv2d(mapper, &next(), conv)?),
        None => None,
    };
    let res = match block.res {
        Some(res) => Some(map_res_block(mapper, &next(), res)?),
        None => None,
    };
    let transformer = match block.transformer {
        Some(t) => Some(map_spatial_transformer(mapper, &next(), t)?),
        None => None,
    };
    let downsample = match block.downsample {
        Some(conv) => Some(map_conv2d(mapper, &join(&next(), "op"), conv)?),
        None => None,
    };
    let upsample = match block.upsample {
        Some(up) => Some(Upsample {
            conv: map_conv2d(mapper, &join(&next(), "conv"), up.conv)?,
        }),
        None => None,
    };

    Ok(UNetBlock {
        conv,
        res,
        transformer,
        downsample,
        upsample,
    })
}

/// Parameters follow the LDM `openaimodel.UNetModel` naming under `path`
/// (`model.diffusion_model` in SD v1 checkpoints).
pub fn map_unet<B: Backend, M: ParamMapper<B>>(mapper: &mut M, path: &str, unet: UNet<B>) -> Result<UNet<B>> {
    let lin1_time_embed = map_linear(mapper, &join(path, "time_embed.0"), unet.lin1_time_embed)?;
    let lin2_time_embed = map_linear(mapper, &join(path, "time_embed.2"), unet.lin2_time_embed)?;

    let input_blocks = unet
        .input_blocks
        .into_iter()
        .enumerate()
        .map(|(i, block)| map_unet_block(mapper, &format!("{}.input_blocks.{}", path, i), block))
        .collect::<Result<Vec<_>>>()?;

    let middle = join(path, "middle_block");
    let middle_block = ResTransformerRes {
        res1: map_res_block(mapper, &join(&middle, "0"), unet.middle_block.res1)?,
        transformer: map_spatial_transformer(mapper, &join(&middle, "1"), unet.middle_block.transformer)?,
        res2: map_res_block(mapper, &join(&middle, "2"), unet.middle_block.res2)?,
    };

    let output_blocks = unet
        .output_blocks
        .into_iter()
        .enumerate()
        .map(|(i, block)| map_unet_block(mapper, &format!("{}.output_blocks.{}", path, i), block))
        .collect::<Result<Vec<_>>>()?;

    let norm_out = map_group_norm(mapper, &join(path, "out.0"), unet.norm_out)?;
    let conv_out = map_conv2d(mapper, &join(path, "out.2"), unet.conv_out)?;

    Ok(UNet {
        n_channels_model: unet.n_channels_model,
        lin1_time_embed,
        lin2_time_embed,
        input_blocks,
        middle_block,
        output_blocks,
        norm_out,
        conv_out,
    })
}
