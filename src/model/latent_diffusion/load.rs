use burn::tensor::{backend::Backend, Tensor, TensorData};

use super::*;
use crate::model::autoencoder::load::map_autoencoder;
use crate::model::clip::load::map_clip;
use crate::model::load::{Layout, ParamMapper};
use crate::model::unet::load::map_unet;

pub const DIFFUSION_MODEL_PREFIX: &str = "model.diffusion_model";
pub const FIRST_STAGE_PREFIX: &str = "first_stage_model";
pub const COND_STAGE_PREFIX: &str = "cond_stage_model.transformer.text_model";

/// Maps the schedule buffers. Only `alphas_cumprod` is read back; the other
/// buffers are derived from it.
fn map_schedule<B: Backend, M: ParamMapper<B>>(
    mapper: &mut M,
    schedule: NoiseSchedule,
    device: &B::Device,
) -> Result<NoiseSchedule> {
    let mut alphas_cumprod = None;

    for (name, values) in schedule.buffers() {
        let n = values.len();
        let data = TensorData::new(values.into_iter().map(|v| v as f32).collect::<Vec<_>>(), [n]);
        let tensor = Tensor::<B, 1>::from_data(data.convert::<B::FloatElem>(), device);

        let mapped = mapper.map(name, tensor, Layout::Native)?;
        if name == "alphas_cumprod" {
            let values = mapped
                .into_data()
                .convert::<f64>()
                .to_vec::<f64>()
                .map_err(|e| Error::TensorData(format!("{}: {:?}", name, e)))?;
            alphas_cumprod = Some(values);
        }
    }

    Ok(alphas_cumprod
        .map(NoiseSchedule::from_alphas_cumprod)
        .unwrap_or(schedule))
}

impl<B: Backend> LatentDiffusion<B> {
    /// Passes every parameter and schedule buffer through `mapper` under its
    /// LDM checkpoint name.
    pub fn map<M: ParamMapper<B>>(self, mapper: &mut M) -> Result<Self> {
        let schedule = map_schedule(mapper, self.schedule, &self.device)?;

        let diffusion_model = map_unet(mapper, DIFFUSION_MODEL_PREFIX, self.diffusion_model)?;
        let first_stage = map_autoencoder(mapper, FIRST_STAGE_PREFIX, self.first_stage)?;
        let transformer = map_clip(mapper, COND_STAGE_PREFIX, self.cond_stage.transformer().clone())?;
        let cond_stage = self.cond_stage.replace_transformer(transformer);

        Ok(Self {
            cond_stage,
            diffusion_model,
            first_stage,
            schedule,
            ..self
        })
    }
}
