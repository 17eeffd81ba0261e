use burn::tensor::backend::Backend;

use super::*;
use crate::error::Result;
use crate::model::load::{join, map_embedding, map_layer_norm, map_linear, Layout, ParamMapper};

fn map_mlp<B: Backend, M: ParamMapper<B>>(mapper: &mut M, path: &str, mlp: MLP<B>) -> Result<MLP<B>> {
    Ok(MLP {
        fc1: map_linear(mapper, &join(path, "fc1"), mlp.fc1)?,
        fc2: map_linear(mapper, &join(path, "fc2"), mlp.fc2)?,
    })
}

fn map_self_attention<B: Backend, M: ParamMapper<B>>(
    mapper: &mut M,
    path: &str,
    attn: MultiHeadSelfAttention<B>,
) -> Result<MultiHeadSelfAttention<B>> {
    Ok(MultiHeadSelfAttention {
        n_head: attn.n_head,
        query: map_linear(mapper, &join(path, "q_proj"), attn.query)?,
        key: map_linear(mapper, &join(path, "k_proj"), attn.key)?,
        value: map_linear(mapper, &join(path, "v_proj"), attn.value)?,
        out: map_linear(mapper, &join(path, "out_proj"), attn.out)?,
    })
}

fn map_residual_attention_block<B: Backend, M: ParamMapper<B>>(
    mapper: &mut M,
    path: &str,
    block: ResidualAttentionBlock<B>,
) -> Result<ResidualAttentionBlock<B>> {
    Ok(ResidualAttentionBlock {
        attn: map_self_attention(mapper, &join(path, "self_attn"), block.attn)?,
        attn_ln: map_layer_norm(mapper, &join(path, "layer_norm1"), block.attn_ln)?,
        mlp: map_mlp(mapper, &join(path, "mlp"), block.mlp)?,
        mlp_ln: map_layer_norm(mapper, &join(path, "layer_norm2"), block.mlp_ln)?,
    })
}

/// Parameters follow the Hugging Face `CLIPTextModel` naming under `path`
/// (`cond_stage_model.transformer.text_model` in SD v1 checkpoints).
pub fn map_clip<B: Backend, M: ParamMapper<B>>(
    mapper: &mut M,
    path: &str,
    clip: ClipTextTransformer<B>,
) -> Result<ClipTextTransformer<B>> {
    let embeddings = join(path, "embeddings");
    let token_embedding = map_embedding(mapper, &join(&embeddings, "token_embedding"), clip.token_embedding)?;
    let position_embedding =
        map_embedding(mapper, &join(&embeddings, "position_embedding"), clip.position_embedding)?;

    // Persistent `position_ids` buffer, always `0..n_ctx`.
    let n_ctx = position_embedding.weight.dims()[0];
    let position_ids = Tensor::<B, 1, Int>::arange(0..n_ctx as i64, &position_embedding.weight.device())
        .float()
        .unsqueeze::<2>();
    mapper.map(&join(&embeddings, "position_ids"), position_ids, Layout::Native)?;

    let blocks = clip
        .blocks
        .into_iter()
        .enumerate()
        .map(|(i, block)| {
            map_residual_attention_block(mapper, &format!("{}.encoder.layers.{}", path, i), block)
        })
        .collect::<Result<Vec<_>>>()?;

    let final_layer_norm = map_layer_norm(mapper, &join(path, "final_layer_norm"), clip.final_layer_norm)?;

    Ok(ClipTextTransformer {
        token_embedding,
        position_embedding,
        blocks,
        final_layer_norm,
    })
}
