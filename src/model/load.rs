use burn::{
    module::Param,
    nn::{self, conv},
    tensor::{backend::Backend, Tensor},
};

use crate::error::Result;

/// How a parameter is laid out in a checkpoint relative to burn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Native,
    /// Stored `[out, in]`, burn keeps linear weights as `[in, out]`.
    Transposed,
}

impl Layout {
    pub fn stored_shape<const D: usize>(&self, dims: [usize; D]) -> Vec<usize> {
        let mut shape = dims.to_vec();
        if *self == Layout::Transposed && D >= 2 {
            shape.swap(D - 2, D - 1);
        }
        shape
    }
}

/// Walks every named parameter of a model. Loading from a checkpoint and
/// exporting to one are both mappers; the key layout lives in the `map_*`
/// functions of each component.
pub trait ParamMapper<B: Backend> {
    fn map<const D: usize>(
        &mut self,
        key: &str,
        tensor: Tensor<B, D>,
        layout: Layout,
    ) -> Result<Tensor<B, D>>;
}

pub fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}

pub fn map_param<B: Backend, M: ParamMapper<B>, const D: usize>(
    mapper: &mut M,
    key: &str,
    param: Param<Tensor<B, D>>,
    layout: Layout,
) -> Result<Param<Tensor<B, D>>> {
    mapper
        .map(key, param.val(), layout)
        .map(Param::from_tensor)
}

pub fn map_linear<B: Backend, M: ParamMapper<B>>(
    mapper: &mut M,
    path: &str,
    mut linear: nn::Linear<B>,
) -> Result<nn::Linear<B>> {
    linear.weight = map_param(mapper, &join(path, "weight"), linear.weight, Layout::Transposed)?;
    linear.bias = linear
        .bias
        .map(|b| map_param(mapper, &join(path, "bias"), b, Layout::Native))
        .transpose()?;

    Ok(linear)
}

pub fn map_conv2d<B: Backend, M: ParamMapper<B>>(
    mapper: &mut M,
    path: &str,
    mut conv2d: conv::Conv2d<B>,
) -> Result<conv::Conv2d<B>> {
    conv2d.weight = map_param(mapper, &join(path, "weight"), conv2d.weight, Layout::Native)?;
    conv2d.bias = conv2d
        .bias
        .map(|b| map_param(mapper, &join(path, "bias"), b, Layout::Native))
        .transpose()?;

    Ok(conv2d)
}

pub fn map_layer_norm<B: Backend, M: ParamMapper<B>>(
    mapper: &mut M,
    path: &str,
    mut layer_norm: nn::LayerNorm<B>,
) -> Result<nn::LayerNorm<B>> {
    layer_norm.gamma = map_param(mapper, &join(path, "weight"), layer_norm.gamma, Layout::Native)?;
    layer_norm.beta = map_param(mapper, &join(path, "bias"), layer_norm.beta, Layout::Native)?;

    Ok(layer_norm)
}

pub fn map_embedding<B: Backend, M: ParamMapper<B>>(
    mapper: &mut M,
    path: &str,
    mut embedding: nn::Embedding<B>,
) -> Result<nn::Embedding<B>> {
    embedding.weight = map_param(mapper, &join(path, "weight"), embedding.weight, Layout::Native)?;

    Ok(embedding)
}
