//! Deterministic-capable DDIM sampling over a [`DiffusionModel`].

use burn::tensor::{backend::Backend, Distribution, Tensor};
use log::debug;

use crate::error::{Error, Result};
use crate::model::latent_diffusion::DiffusionModel;

/// Per-step coefficients for one sampling run, indexed in forward order.
#[derive(Debug, Clone, PartialEq)]
pub struct DdimSchedule {
    pub timesteps: Vec<usize>,
    pub alphas: Vec<f64>,
    pub alphas_prev: Vec<f64>,
    pub sigmas: Vec<f64>,
}

impl DdimSchedule {
    pub fn len(&self) -> usize {
        self.timesteps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timesteps.is_empty()
    }
}

/// DDIM sampler bound to the training schedule of one model.
#[derive(Debug, Clone)]
pub struct DdimSampler {
    alphas_cumprod: Vec<f64>,
}

impl DdimSampler {
    pub fn new<B: Backend, M: DiffusionModel<B>>(model: &M) -> Self {
        Self {
            alphas_cumprod: model.alphas_cumprod().to_vec(),
        }
    }

    pub fn num_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    /// Uniform discretisation of the training timesteps into `n_steps`
    /// sampling steps. Step counts that do not divide the number of training
    /// timesteps yield `ceil(T / (T / n_steps))` steps.
    pub fn make_schedule(&self, n_steps: usize, eta: f64) -> Result<DdimSchedule> {
        let n_train = self.num_timesteps();
        if n_steps == 0 || n_steps > n_train {
            return Err(Error::InvalidInput(format!(
                "number of sampling steps must be in 1..={}, got {}",
                n_train, n_steps
            )));
        }

        let stride = n_train / n_steps;
        let timesteps: Vec<usize> = (0..n_train).step_by(stride).map(|t| t + 1).collect();

        // the shifted grid reaches T when stride is 1
        let alpha_at = |t: usize| self.alphas_cumprod[t.min(n_train - 1)];

        let alphas: Vec<f64> = timesteps.iter().map(|&t| alpha_at(t)).collect();
        let alphas_prev: Vec<f64> = std::iter::once(self.alphas_cumprod[0])
            .chain(alphas.iter().copied())
            .take(alphas.len())
            .collect();
        let sigmas = alphas
            .iter()
            .zip(&alphas_prev)
            .map(|(a, a_prev)| eta * ((1.0 - a_prev) / (1.0 - a) * (1.0 - a / a_prev)).sqrt())
            .collect();

        Ok(DdimSchedule {
            timesteps,
            alphas,
            alphas_prev,
            sigmas,
        })
    }

    /// Runs the reverse process from `x_t` (or fresh Gaussian noise) with
    /// classifier-free guidance.
    ///
    /// `shape` is `[n_batch, channels, height, width]` of the latent. When an
    /// unconditional context is given and `guidance_scale != 1`, both
    /// contexts share one doubled batch per step.
    #[allow(clippy::too_many_arguments)]
    pub fn sample<B: Backend, M: DiffusionModel<B>>(
        &self,
        model: &M,
        n_steps: usize,
        conditioning: Tensor<B, 3>,
        unconditional_conditioning: Option<Tensor<B, 3>>,
        shape: [usize; 4],
        guidance_scale: f64,
        eta: f64,
        x_t: Option<Tensor<B, 4>>,
    ) -> Result<Tensor<B, 4>> {
        let schedule = self.make_schedule(n_steps, eta)?;
        let device = model.device();
        let n_batch = shape[0];

        if conditioning.dims()[0] != n_batch {
            return Err(Error::InvalidInput(format!(
                "{} conditioning rows for a batch of {}",
                conditioning.dims()[0],
                n_batch
            )));
        }

        let mut x = match x_t {
            Some(x) if x.dims() == shape => x,
            Some(x) => {
                return Err(Error::InvalidInput(format!(
                    "initial latent has shape {:?}, expected {:?}",
                    x.dims(),
                    shape
                )))
            }
            None => Tensor::random(shape, Distribution::Normal(0.0, 1.0), &device),
        };

        let guided_context = match unconditional_conditioning {
            Some(uc) if guidance_scale != 1.0 => Some(Tensor::cat(vec![uc, conditioning.clone()], 0)),
            _ => None,
        };

        let total = schedule.len();
        debug!("Running DDIM sampling with {} timesteps", total);

        for (i, index) in (0..total).rev().enumerate() {
            let step = schedule.timesteps[index];
            debug!("DDIM step {}/{} (t = {})", i + 1, total, step);

            let e_t = match &guided_context {
                Some(context) => {
                    let x_in = Tensor::cat(vec![x.clone(), x.clone()], 0);
                    let t_in = Tensor::<B, 1>::full([2 * n_batch], step as f32, &device);
                    let out = model.apply_model(x_in, t_in, context.clone());

                    let [_, c, h, w] = shape;
                    let e_uncond = out.clone().slice([0..n_batch, 0..c, 0..h, 0..w]);
                    let e_cond = out.slice([n_batch..2 * n_batch, 0..c, 0..h, 0..w]);
                    e_uncond.clone() + (e_cond - e_uncond).mul_scalar(guidance_scale)
                }
                None => {
                    let t_in = Tensor::<B, 1>::full([n_batch], step as f32, &device);
                    model.apply_model(x.clone(), t_in, conditioning.clone())
                }
            };

            let a_t = schedule.alphas[index];
            let a_prev = schedule.alphas_prev[index];
            let sigma_t = schedule.sigmas[index];

            let pred_x0 = (x - e_t.clone().mul_scalar((1.0 - a_t).sqrt())).div_scalar(a_t.sqrt());
            let dir_xt = e_t.mul_scalar((1.0 - a_prev - sigma_t * sigma_t).max(0.0).sqrt());

            x = pred_x0.mul_scalar(a_prev.sqrt()) + dir_xt;
            if sigma_t > 0.0 {
                let noise = Tensor::random(shape, Distribution::Normal(0.0, 1.0), &device);
                x = x + noise.mul_scalar(sigma_t);
            }
        }

        Ok(x)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::model::latent_diffusion::NoiseSchedule;
    use burn::tensor::TensorData;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    /// Predicts a constant noise per context row and records the timesteps it saw.
    pub(crate) struct StubModel {
        pub alphas_cumprod: Vec<f64>,
        pub channels: usize,
        pub downscale: usize,
        pub decoded_value: f32,
        pub seen_timesteps: RefCell<Vec<f32>>,
    }

    impl StubModel {
        pub(crate) fn new(n_timesteps: usize) -> Self {
            Self {
                alphas_cumprod: NoiseSchedule::linear(0.00085, 0.012, n_timesteps)
                    .alphas_cumprod()
                    .to_vec(),
                channels: 4,
                downscale: 8,
                decoded_value: 0.0,
                seen_timesteps: RefCell::new(Vec::new()),
            }
        }
    }

    impl DiffusionModel<TestBackend> for StubModel {
        /// Row `i` holds the prompt length, so predictions differ per prompt.
        fn learned_conditioning(&self, prompts: &[String]) -> Tensor<TestBackend, 3> {
            let values: Vec<f32> = prompts.iter().map(|p| p.len() as f32).collect();
            let data = TensorData::new(values, [prompts.len(), 1, 1]);
            Tensor::from_data(data, &NdArrayDevice::Cpu)
        }

        fn apply_model(
            &self,
            x: Tensor<TestBackend, 4>,
            t: Tensor<TestBackend, 1>,
            context: Tensor<TestBackend, 3>,
        ) -> Tensor<TestBackend, 4> {
            self.seen_timesteps
                .borrow_mut()
                .extend(t.into_data().to_vec::<f32>().unwrap());

            let [n, c, h, w] = x.dims();
            let per_row = context.reshape([n, 1, 1, 1]).mul_scalar(0.01);
            x.zeros_like() + per_row.repeat_dim(1, c).repeat_dim(2, h).repeat_dim(3, w)
        }

        /// Sample `i` decodes to the constant `decoded_value + 0.5 * i`.
        fn decode_first_stage(&self, z: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 4> {
            let [n, _, h, w] = z.dims();
            let (height, width) = (h * self.downscale, w * self.downscale);
            let per_image = 3 * height * width;

            let values: Vec<f32> = (0..n * per_image)
                .map(|k| self.decoded_value + 0.5 * (k / per_image) as f32)
                .collect();
            Tensor::from_data(TensorData::new(values, [n, 3, height, width]), &NdArrayDevice::Cpu)
        }

        fn alphas_cumprod(&self) -> &[f64] {
            &self.alphas_cumprod
        }

        fn latent_channels(&self) -> usize {
            self.channels
        }

        fn downscale_factor(&self) -> usize {
            self.downscale
        }

        fn device(&self) -> NdArrayDevice {
            NdArrayDevice::Cpu
        }
    }

    #[test]
    fn schedule_is_uniform_and_shifted() {
        let model = StubModel::new(1000);
        let sampler = DdimSampler::new(&model);
        let schedule = sampler.make_schedule(50, 0.0).unwrap();

        assert_eq!(schedule.len(), 50);
        assert_eq!(schedule.timesteps[0], 1);
        assert_eq!(schedule.timesteps[1], 21);
        assert_eq!(schedule.timesteps[49], 981);
        assert_eq!(schedule.alphas[0], model.alphas_cumprod[1]);
        assert_eq!(schedule.alphas_prev[0], model.alphas_cumprod[0]);
        assert_eq!(schedule.alphas_prev[1], model.alphas_cumprod[1]);
        assert!(schedule.sigmas.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn non_dividing_step_counts_follow_the_stride() {
        let sampler = DdimSampler::new(&StubModel::new(1000));

        // stride 1000 / 300 = 3 gives ceil(1000 / 3) steps
        assert_eq!(sampler.make_schedule(300, 0.0).unwrap().len(), 334);

        let full = sampler.make_schedule(1000, 0.0).unwrap();
        assert_eq!(full.len(), 1000);
        assert_eq!(full.timesteps[999], 1000);
        assert!(full.alphas[999] > 0.0);
    }

    #[test]
    fn eta_produces_positive_sigmas() {
        let sampler = DdimSampler::new(&StubModel::new(1000));
        let schedule = sampler.make_schedule(10, 1.0).unwrap();

        assert!(schedule.sigmas.iter().skip(1).all(|s| *s > 0.0));
    }

    #[test]
    fn step_count_is_validated() {
        let sampler = DdimSampler::new(&StubModel::new(100));

        assert!(matches!(sampler.make_schedule(0, 0.0), Err(Error::InvalidInput(_))));
        assert!(matches!(sampler.make_schedule(101, 0.0), Err(Error::InvalidInput(_))));
        assert!(sampler.make_schedule(100, 0.0).is_ok());
    }

    #[test]
    fn guidance_doubles_the_batch_and_visits_timesteps_in_reverse() {
        let model = StubModel::new(100);
        let sampler = DdimSampler::new(&model);
        let c = model.learned_conditioning(&["ab".to_string(), "abcd".to_string()]);
        let uc = model.learned_conditioning(&[String::new(), String::new()]);

        let out = sampler
            .sample(&model, 4, c, Some(uc), [2, 4, 3, 2], 7.5, 0.0, None)
            .unwrap();
        assert_eq!(out.dims(), [2, 4, 3, 2]);

        let seen = model.seen_timesteps.borrow();
        // four steps, each over a doubled batch of two
        assert_eq!(seen.len(), 16);
        assert_eq!(&seen[..4], &[76.0; 4]);
        assert_eq!(&seen[12..], &[1.0; 4]);
    }

    #[test]
    fn sampling_from_a_fixed_start_is_deterministic() {
        let device = NdArrayDevice::Cpu;
        let model = StubModel::new(100);
        let sampler = DdimSampler::new(&model);
        let prompts = ["a".to_string()];
        let x_t = Tensor::<TestBackend, 4>::ones([1, 4, 2, 2], &device);

        let run = || {
            sampler
                .sample(
                    &model,
                    10,
                    model.learned_conditioning(&prompts),
                    Some(model.learned_conditioning(&[String::new()])),
                    [1, 4, 2, 2],
                    7.5,
                    0.0,
                    Some(x_t.clone()),
                )
                .unwrap()
                .into_data()
                .to_vec::<f32>()
                .unwrap()
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn single_step_recovers_the_predicted_sample() {
        let device = NdArrayDevice::Cpu;
        let model = StubModel::new(100);
        let sampler = DdimSampler::new(&model);
        let x_t = Tensor::<TestBackend, 4>::ones([1, 1, 1, 1], &device);

        // no unconditional context: e = 0.01 * len("abc")
        let out = sampler
            .sample(
                &model,
                1,
                model.learned_conditioning(&["abc".to_string()]),
                None,
                [1, 1, 1, 1],
                7.5,
                0.0,
                Some(x_t),
            )
            .unwrap();
        let value = out.into_data().to_vec::<f32>().unwrap()[0] as f64;

        let (a, a_prev, e) = (model.alphas_cumprod[1], model.alphas_cumprod[0], 0.03);
        let pred_x0 = (1.0 - (1.0 - a).sqrt() * e) / a.sqrt();
        let expected = a_prev.sqrt() * pred_x0 + (1.0 - a_prev).sqrt() * e;
        assert!((value - expected).abs() < 1e-5);
    }

    #[test]
    fn mismatched_initial_latent_is_rejected() {
        let device = NdArrayDevice::Cpu;
        let model = StubModel::new(100);
        let sampler = DdimSampler::new(&model);

        let result = sampler.sample(
            &model,
            5,
            model.learned_conditioning(&["a".to_string()]),
            None,
            [1, 4, 2, 2],
            7.5,
            0.0,
            Some(Tensor::<TestBackend, 4>::ones([1, 4, 3, 3], &device)),
        );
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
