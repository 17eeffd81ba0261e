use burn::tensor::backend::Backend;

use super::GroupNorm;
use crate::error::Result;
use crate::model::load::{join, map_param, Layout, ParamMapper};

pub fn map_group_norm<B: Backend, M: ParamMapper<B>>(
    mapper: &mut M,
    path: &str,
    mut norm: GroupNorm<B>,
) -> Result<GroupNorm<B>> {
    norm.gamma = map_param(mapper, &join(path, "weight"), norm.gamma, Layout::Native)?;
    norm.beta = map_param(mapper, &join(path, "bias"), norm.beta, Layout::Native)?;

    Ok(norm)
}
