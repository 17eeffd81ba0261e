use burn::tensor::{activation::softmax, backend::Backend, Tensor};

use std::f32::NEG_INFINITY;

/// Scaled dot-product attention over `n_head` heads. `q` is `[batch, q_ctx, state]`,
/// `k` and `v` are `[batch, k_ctx, state]`.
pub fn qkv_attention<B: Backend>(
    q: Tensor<B, 3>,
    k: Tensor<B, 3>,
    v: Tensor<B, 3>,
    mask: Option<Tensor<B, 2>>,
    n_head: usize,
) -> Tensor<B, 3> {
    let [n_batch, n_qctx, n_state] = q.dims();
    let [_, n_ctx, _] = k.dims();

    let scale = (n_state as f64 / n_head as f64).powf(-0.25);
    let n_hstate = n_state / n_head;

    let q = q.reshape([n_batch, n_qctx, n_head, n_hstate]).swap_dims(1, 2) * scale;
    let k = k
        .reshape([n_batch, n_ctx, n_head, n_hstate])
        .swap_dims(1, 2)
        .transpose()
        * scale;
    let v = v.reshape([n_batch, n_ctx, n_head, n_hstate]).swap_dims(1, 2);

    let qk = q.matmul(k);

    // apply mask
    let qk = if let Some(mask) = mask {
        qk + mask.slice([0..n_qctx, 0..n_ctx]).unsqueeze::<4>()
    } else {
        qk
    };

    // normalize value weightings
    let w = softmax(qk, 3);
    w.matmul(v).swap_dims(1, 2).flatten(2, 3)
}

/// Causal mask: position `i` may only attend to positions `<= i`.
pub fn attn_decoder_mask<B: Backend>(seq_length: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut mask = Tensor::<B, 2>::zeros([seq_length, seq_length], device);

    for i in 0..seq_length.saturating_sub(1) {
        let values =
            Tensor::<B, 2>::zeros([1, seq_length - (i + 1)], device).add_scalar(NEG_INFINITY);
        mask = mask.slice_assign([i..i + 1, i + 1..seq_length], values);
    }

    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn decoder_mask_is_strictly_upper_triangular() {
        let mask = attn_decoder_mask::<TestBackend>(3, &NdArrayDevice::Cpu);
        let values: Vec<f32> = mask.into_data().to_vec().unwrap();

        for row in 0..3 {
            for col in 0..3 {
                let v = values[row * 3 + col];
                if col > row {
                    assert!(v.is_infinite() && v < 0.0);
                } else {
                    assert_eq!(v, 0.0);
                }
            }
        }
    }

    #[test]
    fn masked_attention_ignores_future_positions() {
        let device = NdArrayDevice::Cpu;
        let q = Tensor::<TestBackend, 3>::ones([1, 2, 4], &device);
        let k = Tensor::<TestBackend, 3>::ones([1, 2, 4], &device);
        let v = Tensor::<TestBackend, 3>::from_floats([[[1.0, 1.0, 1.0, 1.0], [5.0, 5.0, 5.0, 5.0]]], &device);

        let out = qkv_attention(q, k, v, Some(attn_decoder_mask(2, &device)), 2);
        let values: Vec<f32> = out.into_data().to_vec().unwrap();

        // first position sees only itself, second averages both
        assert!(values[..4].iter().all(|x| (x - 1.0).abs() < 1e-5));
        assert!(values[4..].iter().all(|x| (x - 3.0).abs() < 1e-5));
    }
}
