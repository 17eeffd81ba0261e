pub mod load;

use burn::{
    config::Config,
    module::Module,
    nn,
    tensor::{activation::sigmoid, backend::Backend, Int, Tensor, TensorData},
};

use crate::config::CondStageParams;
use crate::model::attention::{attn_decoder_mask, qkv_attention};
use crate::tokenizer::SimpleTokenizer;

#[derive(Config)]
pub struct ClipConfig {
    n_vocab: usize,
    n_state: usize,
    n_head: usize,
    n_ctx: usize,
    n_layer: usize,
    #[config(default = 1e-5)]
    layer_norm_eps: f64,
}

impl ClipConfig {
    pub fn from_params(params: &CondStageParams) -> Self {
        Self::new(
            params.vocab_size,
            params.hidden_size,
            params.num_attention_heads,
            params.max_length,
            params.num_hidden_layers,
        )
        .with_layer_norm_eps(params.layer_norm_eps)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ClipTextTransformer<B> {
        let token_embedding = nn::EmbeddingConfig::new(self.n_vocab, self.n_state).init(device);
        let position_embedding = nn::EmbeddingConfig::new(self.n_ctx, self.n_state).init(device);
        let blocks = (0..self.n_layer)
            .map(|_| {
                ResidualAttentionBlockConfig::new(self.n_state, self.n_head)
                    .with_layer_norm_eps(self.layer_norm_eps)
                    .init(device)
            })
            .collect();
        let final_layer_norm = nn::LayerNormConfig::new(self.n_state)
            .with_epsilon(self.layer_norm_eps)
            .init(device);

        ClipTextTransformer {
            token_embedding,
            position_embedding,
            blocks,
            final_layer_norm,
        }
    }
}

/// CLIP text tower: causal pre-LN transformer returning the final hidden states.
#[derive(Module, Debug)]
pub struct ClipTextTransformer<B: Backend> {
    token_embedding: nn::Embedding<B>,
    position_embedding: nn::Embedding<B>,
    blocks: Vec<ResidualAttentionBlock<B>>,
    final_layer_norm: nn::LayerNorm<B>,
}

impl<B: Backend> ClipTextTransformer<B> {
    pub fn forward(&self, x: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let [_, seq_len] = x.dims();

        let mask = attn_decoder_mask(seq_len, &x.device());

        let embedded = self.token_embedding.forward(x)
            + self
                .position_embedding
                .weight
                .val()
                .slice([0..seq_len])
                .unsqueeze();

        let mut x = embedded;
        for block in &self.blocks {
            x = block.forward(x, mask.clone());
        }

        self.final_layer_norm.forward(x)
    }

    pub fn context_length(&self) -> usize {
        self.position_embedding.weight.dims()[0]
    }
}

/// Tokenizer and text transformer with fixed-length padding, the text
/// conditioning stage of the latent diffusion model.
#[derive(Debug, Clone)]
pub struct FrozenClipEmbedder<B: Backend> {
    tokenizer: SimpleTokenizer,
    transformer: ClipTextTransformer<B>,
    max_length: usize,
}

impl<B: Backend> FrozenClipEmbedder<B> {
    pub fn new(tokenizer: SimpleTokenizer, transformer: ClipTextTransformer<B>, max_length: usize) -> Self {
        Self {
            tokenizer,
            transformer,
            max_length,
        }
    }

    pub fn transformer(&self) -> &ClipTextTransformer<B> {
        &self.transformer
    }

    pub(crate) fn replace_transformer(self, transformer: ClipTextTransformer<B>) -> Self {
        Self { transformer, ..self }
    }

    /// Start token, BPE tokens, end token, then end tokens up to `max_length`.
    pub fn tokenize(&self, text: &str) -> Vec<u32> {
        let start = self.tokenizer.start_token();
        let end = self.tokenizer.end_token();

        let mut tokens = vec![start];
        tokens.extend(
            self.tokenizer
                .encode(text)
                .into_iter()
                .take(self.max_length.saturating_sub(2)),
        );
        tokens.push(end);
        tokens.resize(self.max_length, end);

        tokens
    }

    /// `[n_prompt, max_length, n_state]` hidden states.
    pub fn encode(&self, prompts: &[String], device: &B::Device) -> Tensor<B, 3> {
        let tokens: Vec<i32> = prompts
            .iter()
            .flat_map(|p| self.tokenize(p))
            .map(|t| t as i32)
            .collect();

        let data = TensorData::new(tokens, [prompts.len(), self.max_length]);
        let input = Tensor::<B, 2, Int>::from_data(data.convert::<B::IntElem>(), device);

        self.transformer.forward(input)
    }
}

#[derive(Config)]
pub struct ResidualAttentionBlockConfig {
    n_state: usize,
    n_head: usize,
    #[config(default = 1e-5)]
    layer_norm_eps: f64,
}

impl ResidualAttentionBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResidualAttentionBlock<B> {
        let attn = MultiHeadSelfAttentionConfig::new(self.n_state, self.n_head).init(device);
        let attn_ln = nn::LayerNormConfig::new(self.n_state)
            .with_epsilon(self.layer_norm_eps)
            .init(device);

        let mlp = MLPConfig::new(self.n_state, 4 * self.n_state).init(device);
        let mlp_ln = nn::LayerNormConfig::new(self.n_state)
            .with_epsilon(self.layer_norm_eps)
            .init(device);

        ResidualAttentionBlock {
            attn,
            attn_ln,
            mlp,
            mlp_ln,
        }
    }
}

#[derive(Module, Debug)]
pub struct ResidualAttentionBlock<B: Backend> {
    attn: MultiHeadSelfAttention<B>,
    attn_ln: nn::LayerNorm<B>,
    mlp: MLP<B>,
    mlp_ln: nn::LayerNorm<B>,
}

impl<B: Backend> ResidualAttentionBlock<B> {
    fn forward(&self, x: Tensor<B, 3>, mask: Tensor<B, 2>) -> Tensor<B, 3> {
        let x = x.clone() + self.attn.forward(self.attn_ln.forward(x), Some(mask));
        x.clone() + self.mlp.forward(self.mlp_ln.forward(x))
    }
}

#[derive(Config)]
pub struct MultiHeadSelfAttentionConfig {
    n_state: usize,
    n_head: usize,
}

impl MultiHeadSelfAttentionConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> MultiHeadSelfAttention<B> {
        assert!(
            self.n_state % self.n_head == 0,
            "State size {} must be a multiple of head size {}",
            self.n_state,
            self.n_head
        );

        MultiHeadSelfAttention {
            n_head: self.n_head,
            query: nn::LinearConfig::new(self.n_state, self.n_state).init(device),
            key: nn::LinearConfig::new(self.n_state, self.n_state).init(device),
            value: nn::LinearConfig::new(self.n_state, self.n_state).init(device),
            out: nn::LinearConfig::new(self.n_state, self.n_state).init(device),
        }
    }
}

#[derive(Module, Debug)]
pub struct MultiHeadSelfAttention<B: Backend> {
    n_head: usize,
    query: nn::Linear<B>,
    key: nn::Linear<B>,
    value: nn::Linear<B>,
    out: nn::Linear<B>,
}

impl<B: Backend> MultiHeadSelfAttention<B> {
    pub fn forward(&self, x: Tensor<B, 3>, mask: Option<Tensor<B, 2>>) -> Tensor<B, 3> {
        let q = self.query.forward(x.clone());
        let k = self.key.forward(x.clone());
        let v = self.value.forward(x);

        let wv = qkv_attention(q, k, v, mask, self.n_head);

        self.out.forward(wv)
    }
}

#[derive(Config, Debug)]
pub struct MLPConfig {
    input_size: usize,
    hidden_size: usize,
}

impl MLPConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> MLP<B> {
        let fc1 = nn::LinearConfig::new(self.input_size, self.hidden_size).init(device);
        let fc2 = nn::LinearConfig::new(self.hidden_size, self.input_size).init(device);

        MLP { fc1, fc2 }
    }
}

#[derive(Module, Debug)]
pub struct MLP<B: Backend> {
    fc1: nn::Linear<B>,
    fc2: nn::Linear<B>,
}

impl<B: Backend> MLP<B> {
    fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let x = self.fc1.forward(x);
        let x = quick_gelu(x);
        self.fc2.forward(x)
    }
}

fn quick_gelu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone() * sigmoid(x * 1.702)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    use crate::tokenizer::tests::tiny_tokenizer;

    type TestBackend = NdArray<f32>;

    fn tiny_embedder(max_length: usize) -> FrozenClipEmbedder<TestBackend> {
        let tokenizer = tiny_tokenizer();
        let transformer = ClipConfig::new(tokenizer.vocab_size(), 8, 2, max_length, 2)
            .init::<TestBackend>(&NdArrayDevice::Cpu);
        FrozenClipEmbedder::new(tokenizer, transformer, max_length)
    }

    #[test]
    fn tokens_are_wrapped_and_padded_with_end_token() {
        let embedder = tiny_embedder(8);
        let start = embedder.tokenizer.start_token();
        let end = embedder.tokenizer.end_token();

        let tokens = embedder.tokenize("a cat");
        assert_eq!(tokens.len(), 8);
        assert_eq!(tokens[0], start);
        assert!(tokens[1..3].iter().all(|t| *t != start && *t != end));
        assert!(tokens[3..].iter().all(|t| *t == end));

        let empty = embedder.tokenize("");
        assert_eq!(empty[0], start);
        assert!(empty[1..].iter().all(|t| *t == end));
    }

    #[test]
    fn long_prompts_are_truncated_before_the_end_token() {
        let embedder = tiny_embedder(4);
        let tokens = embedder.tokenize("a cat a cat a cat");

        assert_eq!(tokens.len(), 4);
        assert_eq!(tokens[3], embedder.tokenizer.end_token());
    }

    #[test]
    fn encode_returns_one_context_per_prompt() {
        let embedder = tiny_embedder(6);
        let prompts = vec!["a cat".to_string(), String::new(), "tac".to_string()];

        let context = embedder.encode(&prompts, &NdArrayDevice::Cpu);
        assert_eq!(context.dims(), [3, 6, 8]);
        assert_eq!(embedder.transformer().context_length(), 6);
    }
}
