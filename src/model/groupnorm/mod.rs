pub mod load;

use burn::{
    config::Config,
    module::{Module, Param},
    tensor::{backend::Backend, Tensor},
};

#[derive(Config)]
pub struct GroupNormConfig {
    n_group: usize,
    n_channel: usize,
    #[config(default = 1e-5)]
    eps: f64,
}

impl GroupNormConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> GroupNorm<B> {
        assert!(
            self.n_channel % self.n_group == 0,
            "The number of channels {} must be divisible by the number of groups {}",
            self.n_channel,
            self.n_group
        );

        GroupNorm {
            n_group: self.n_group,
            n_channel: self.n_channel,
            gamma: Param::from_tensor(Tensor::ones([self.n_channel], device)),
            beta: Param::from_tensor(Tensor::zeros([self.n_channel], device)),
            eps: self.eps,
        }
    }
}

#[derive(Module, Debug)]
pub struct GroupNorm<B: Backend> {
    n_group: usize,
    n_channel: usize,
    gamma: Param<Tensor<B, 1>>,
    beta: Param<Tensor<B, 1>>,
    eps: f64,
}

impl<B: Backend> GroupNorm<B> {
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let shape = x.shape();
        let n_batch = shape.dims[0];
        let num_elements = shape.num_elements();

        let mut affine_shape = [1; D];
        affine_shape[1] = self.n_channel;

        layernorm(
            x.reshape([
                n_batch,
                self.n_group,
                num_elements / (n_batch * self.n_group),
            ]),
            self.eps,
        )
        .reshape(shape)
        .mul(self.gamma.val().reshape(affine_shape))
        .add(self.beta.val().reshape(affine_shape))
    }
}

/// Normalizes over the last dimension without an affine transform.
pub fn layernorm<B: Backend, const D: usize>(x: Tensor<B, D>, eps: f64) -> Tensor<B, D> {
    let u = x.clone() - x.mean_dim(D - 1);
    u.clone()
        .div((u.clone() * u).mean_dim(D - 1).add_scalar(eps).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn normalizes_each_group_independently() {
        let device = NdArrayDevice::Cpu;
        let norm = GroupNormConfig::new(2, 4).init::<TestBackend>(&device);

        // group 0 holds channels 0..2, group 1 channels 2..4
        let x = Tensor::<TestBackend, 3>::from_data(
            TensorData::new(vec![1.0f32, 3.0, 1.0, 3.0, 10.0, 10.0, 30.0, 30.0], [1, 4, 2]),
            &device,
        );
        let y: Vec<f32> = norm.forward(x).into_data().to_vec().unwrap();

        let expected = [-1.0, 1.0, -1.0, 1.0, -1.0, -1.0, 1.0, 1.0];
        for (got, want) in y.iter().zip(expected) {
            assert!((got - want).abs() < 1e-3, "{:?}", y);
        }
    }
}
