use tch::{
    Device, IndexOp, Kind, Reduction, Tensor,
    nn::{self, Embedding, LayerNorm, Linear, ModuleT, Path, VarStore},
};
use tracing::debug;

use crate::{
    config::ModelConfig,
    constants::{EOS_TOKEN, FFN_EXPANSION},
    error::{Error, Result},
};

/// Anything that owns learned tensors.
pub trait Parameters {
    /// The learned tensors of this unit, in a stable order.
    fn parameters(&self) -> Vec<&Tensor>;

    /// Total number of learned scalars.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.numel()).sum()
    }
}

fn linear_parameters(linear: &Linear) -> Vec<&Tensor> {
    std::iter::once(&linear.ws).chain(linear.bs.as_ref()).collect()
}

fn layer_norm_parameters(norm: &LayerNorm) -> Vec<&Tensor> {
    norm.ws.iter().chain(norm.bs.iter()).collect()
}

fn no_bias() -> nn::LinearConfig {
    nn::LinearConfig {
        bias: false,
        ..Default::default()
    }
}

/// Boolean `[max_length, max_length]` matrix that is `true` strictly above the
/// diagonal, i.e. where a query at row `i` would look at a future key `j > i`.
/// Built once per model; heads hold storage-sharing views of it.
#[derive(Debug)]
pub struct CausalMask {
    future: Tensor,
}

impl CausalMask {
    pub fn new(max_length: i64, device: Device) -> Self {
        let future = Tensor::ones(&[max_length, max_length], (Kind::Bool, device)).triu(1);
        CausalMask { future }
    }

    /// The top-left `[seq_len, seq_len]` corner of the mask.
    pub fn future(&self, seq_len: i64) -> Tensor {
        self.future.i((..seq_len, ..seq_len))
    }

    /// Another handle on the same storage.
    pub fn share(&self) -> CausalMask {
        CausalMask {
            future: self.future.shallow_clone(),
        }
    }
}

/// Single-head causal self-attention.
/// Takes an input of shape [batch, seq_len, dim_embed] and produces
/// [batch, seq_len, head_size], where each position's output is a weighted
/// combination of the values at that position and the ones before it.
#[derive(Debug)]
pub struct AttentionHead {
    key: Linear,   // Projects dim_embed -> head_size
    query: Linear, // Projects dim_embed -> head_size
    value: Linear, // Projects dim_embed -> head_size
    mask: CausalMask,
    scale: f64,
    dropout: f64,
}

impl AttentionHead {
    pub fn new(vs: &Path, config: &ModelConfig, mask: &CausalMask) -> Self {
        let head_size = config.head_size();
        // Three projections of the same shape that do not share weights.
        let key = nn::linear(vs / "key", config.dim_embed, head_size, no_bias());
        let query = nn::linear(vs / "query", config.dim_embed, head_size, no_bias());
        let value = nn::linear(vs / "value", config.dim_embed, head_size, no_bias());
        AttentionHead {
            key,
            query,
            value,
            mask: mask.share(),
            // Scaled by the full embedding width, not the head size.
            scale: (config.dim_embed as f64).powf(-0.5),
            dropout: config.dropout,
        }
    }

    /// Attention distribution over keys for every query: [batch, seq_len, seq_len].
    pub fn attention_weights_t(&self, input: &Tensor, train: bool) -> Tensor {
        let seq_len = input.size()[1];
        // [batch, seq_len, head_size]
        let key = input.apply(&self.key);
        // [batch, seq_len, head_size]
        let query = input.apply(&self.query);
        // Q @ K^T: [batch, seq_len, head_size] @ [batch, head_size, seq_len] -> [batch, seq_len, seq_len]
        let scores = query.matmul(&key.transpose(-2, -1)) * self.scale;
        // Future positions go to -inf so the softmax gives them exactly zero weight.
        let scores = scores.masked_fill(&self.mask.future(seq_len), f64::NEG_INFINITY);
        scores.softmax(-1, Kind::Float).dropout(self.dropout, train)
    }

    pub fn attention_weights(&self, input: &Tensor) -> Tensor {
        self.attention_weights_t(input, false)
    }
}

impl ModuleT for AttentionHead {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        let weights = self.attention_weights_t(input, train);
        // [batch, seq_len, seq_len] @ [batch, seq_len, head_size] -> [batch, seq_len, head_size]
        weights.matmul(&input.apply(&self.value))
    }
}

impl Parameters for AttentionHead {
    fn parameters(&self) -> Vec<&Tensor> {
        [&self.key, &self.query, &self.value]
            .into_iter()
            .flat_map(linear_parameters)
            .collect()
    }
}

/// Several attention heads over the same input, concatenated and projected
/// back to the embedding width.
#[derive(Debug)]
pub struct MultiHeadAttention {
    heads: Vec<AttentionHead>,
    project: Linear,
    dropout: f64,
}

impl MultiHeadAttention {
    pub fn new(vs: &Path, config: &ModelConfig, mask: &CausalMask) -> MultiHeadAttention {
        let heads_path = vs / "heads";
        let heads = (0..config.num_heads)
            .map(|i| AttentionHead::new(&(&heads_path / i), config, mask))
            .collect();
        let project = nn::linear(
            vs / "project",
            config.head_size() * config.num_heads,
            config.dim_embed,
            Default::default(),
        );
        MultiHeadAttention {
            heads,
            project,
            dropout: config.dropout,
        }
    }
}

impl ModuleT for MultiHeadAttention {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        // Vec of [batch, seq_len, head_size]
        let outputs: Vec<Tensor> = self
            .heads
            .iter()
            .map(|head| head.forward_t(input, train))
            .collect();
        // [batch, seq_len, head_size * num_heads]
        let concatenated = Tensor::cat(&outputs, -1);
        concatenated
            .apply(&self.project)
            .dropout(self.dropout, train)
    }
}

impl Parameters for MultiHeadAttention {
    fn parameters(&self) -> Vec<&Tensor> {
        self.heads
            .iter()
            .flat_map(|head| head.parameters())
            .chain(linear_parameters(&self.project))
            .collect()
    }
}

/// Position-wise two-layer network: dim_embed -> 4 * dim_embed -> ReLU -> dim_embed.
#[derive(Debug)]
pub struct FeedForward {
    expand: Linear,
    contract: Linear,
    dropout: f64,
}

impl FeedForward {
    pub fn new(vs: &Path, config: &ModelConfig) -> FeedForward {
        let hidden = FFN_EXPANSION * config.dim_embed;
        let expand = nn::linear(vs / "expand", config.dim_embed, hidden, Default::default());
        let contract = nn::linear(vs / "contract", hidden, config.dim_embed, Default::default());
        FeedForward {
            expand,
            contract,
            dropout: config.dropout,
        }
    }
}

impl ModuleT for FeedForward {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        input
            .apply(&self.expand)
            .relu()
            .apply(&self.contract)
            .dropout(self.dropout, train)
    }
}

impl Parameters for FeedForward {
    fn parameters(&self) -> Vec<&Tensor> {
        linear_parameters(&self.expand)
            .into_iter()
            .chain(linear_parameters(&self.contract))
            .collect()
    }
}

/// Attention then feed-forward, each normalized first and added onto the
/// residual stream.
#[derive(Debug)]
pub struct TransformerBlock {
    attention: MultiHeadAttention,
    feed_forward: FeedForward,
    layer_norm1: LayerNorm,
    layer_norm2: LayerNorm,
}

impl TransformerBlock {
    pub fn new(vs: &Path, config: &ModelConfig, mask: &CausalMask) -> TransformerBlock {
        TransformerBlock {
            attention: MultiHeadAttention::new(&(vs / "attention"), config, mask),
            feed_forward: FeedForward::new(&(vs / "feed_forward"), config),
            layer_norm1: nn::layer_norm(vs / "layer_norm1", vec![config.dim_embed], Default::default()),
            layer_norm2: nn::layer_norm(vs / "layer_norm2", vec![config.dim_embed], Default::default()),
        }
    }
}

impl ModuleT for TransformerBlock {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        let output = input
            + input
                .apply(&self.layer_norm1)
                .apply_t(&self.attention, train);
        &output
            + output
                .apply(&self.layer_norm2)
                .apply_t(&self.feed_forward, train)
    }
}

impl Parameters for TransformerBlock {
    fn parameters(&self) -> Vec<&Tensor> {
        self.attention
            .parameters()
            .into_iter()
            .chain(self.feed_forward.parameters())
            .chain(layer_norm_parameters(&self.layer_norm1))
            .chain(layer_norm_parameters(&self.layer_norm2))
            .collect()
    }
}

/// Decoder-only transformer language model.
///
/// The model owns the [`VarStore`] holding all of its variables, so an
/// optimizer, a checkpoint or a deep copy can be made from it directly.
pub struct LanguageModel {
    var_store: VarStore,
    config: ModelConfig,
    token_embedding: Embedding,
    position_embedding: Embedding,
    blocks: Vec<TransformerBlock>,
    layer_norm_final: LayerNorm,
    project: Linear,
}

impl LanguageModel {
    pub fn new(config: &ModelConfig, device: Device) -> Result<Self> {
        config.validate()?;
        let var_store = VarStore::new(device);
        let mask = CausalMask::new(config.max_length, device);
        let (token_embedding, position_embedding, blocks, layer_norm_final, project) = {
            let root = var_store.root();
            let token_embedding = nn::embedding(
                &root / "token_embedding",
                config.vocab_size,
                config.dim_embed,
                Default::default(),
            );
            let position_embedding = nn::embedding(
                &root / "position_embedding",
                config.max_length,
                config.dim_embed,
                Default::default(),
            );
            let blocks_path = &root / "blocks";
            let blocks = (0..config.num_layers)
                .map(|i| TransformerBlock::new(&(&blocks_path / i), config, &mask))
                .collect();
            let layer_norm_final = nn::layer_norm(
                &root / "layer_norm_final",
                vec![config.dim_embed],
                Default::default(),
            );
            let project = nn::linear(
                &root / "project",
                config.dim_embed,
                config.vocab_size,
                Default::default(),
            );
            (token_embedding, position_embedding, blocks, layer_norm_final, project)
        };
        Ok(LanguageModel {
            var_store,
            config: config.clone(),
            token_embedding,
            position_embedding,
            blocks,
            layer_norm_final,
            project,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> Device {
        self.var_store.device()
    }

    pub fn var_store(&self) -> &VarStore {
        &self.var_store
    }

    pub fn var_store_mut(&mut self) -> &mut VarStore {
        &mut self.var_store
    }

    /// A structurally identical model on its own variable store, holding a
    /// copy of every current value. Nothing is shared with `self`.
    pub fn try_clone(&self) -> Result<Self> {
        let mut copy = LanguageModel::new(&self.config, self.device())?;
        copy.var_store.copy(&self.var_store)?;
        Ok(copy)
    }

    /// Stops gradient tracking on every variable.
    pub fn freeze(&mut self) {
        self.var_store.freeze();
    }

    /// Eval-mode forward pass with a mean-reduced loss.
    pub fn forward(
        &self,
        token_ids: &Tensor,
        targets: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        self.forward_t(token_ids, targets, true, false)
    }

    /// Takes token ids of shape [batch, seq_len] and returns logits of shape
    /// [batch, seq_len, vocab_size]. When `targets` of the same shape are given,
    /// also returns the cross-entropy loss: a scalar mean if `reduce_loss`,
    /// otherwise one loss per token, shape [batch * seq_len].
    pub fn forward_t(
        &self,
        token_ids: &Tensor,
        targets: Option<&Tensor>,
        reduce_loss: bool,
        train: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        self.check_token_ids(token_ids)?;
        let logits = self.logits_t(token_ids, train);
        let Some(targets) = targets else {
            return Ok((logits, None));
        };
        if targets.size() != token_ids.size() {
            return Err(Error::ShapeMismatch {
                expected: token_ids.size(),
                actual: targets.size(),
            });
        }
        self.check_range(targets)?;
        // Flatten [batch, seq_len, vocab_size] -> [batch * seq_len, vocab_size]
        let flat_logits = logits.reshape([-1, self.config.vocab_size]);
        // Flatten [batch, seq_len] -> [batch * seq_len]
        let flat_targets = targets.reshape([-1]);
        let reduction = if reduce_loss {
            Reduction::Mean
        } else {
            Reduction::None
        };
        let loss =
            flat_logits.cross_entropy_loss::<Tensor>(&flat_targets, None, reduction, -100, 0.0);
        Ok((logits, Some(loss)))
    }

    /// Extends every prompt row by sampling up to `max_new_tokens` tokens.
    ///
    /// Each step looks at the last `max_length` tokens only. A row is finished
    /// once it samples the end-of-sequence token; finished rows are padded with
    /// that token, and generation stops when all rows are finished.
    pub fn generate(&self, token_ids: &Tensor, max_new_tokens: usize) -> Result<Tensor> {
        let size = token_ids.size();
        if size.len() != 2 {
            return Err(Error::InvalidTokenShape(size));
        }
        if size[0] == 0 || size[1] == 0 {
            return Err(Error::EmptySequence);
        }
        let _no_grad_guard = tch::no_grad_guard();
        let mut token_ids = token_ids.to_device(self.device());
        let mut finished = Tensor::zeros(&[size[0], 1], (Kind::Bool, self.device()));
        for step in 0..max_new_tokens {
            // Sliding window over the most recent tokens: [batch, min(seq_len, max_length)]
            let seq_len = token_ids.size()[1];
            let window_len = seq_len.min(self.config.max_length);
            let window = token_ids.narrow(1, seq_len - window_len, window_len);
            let (logits, _) = self.forward_t(&window, None, true, false)?;
            // Only the final position predicts the next token: [batch, vocab_size]
            let final_logits = logits.i((.., -1, ..));
            let probabilities = final_logits.softmax(-1, Kind::Float);
            // [batch, 1]
            let sampled = probabilities
                .multinomial(1, false)
                .masked_fill(&finished, EOS_TOKEN);
            token_ids = Tensor::cat(&[&token_ids, &sampled], 1);
            finished = finished.logical_or(&sampled.eq(EOS_TOKEN));
            if i64::try_from(&finished.all().to_kind(Kind::Int64))? == 1 {
                debug!("end of sequence after {} new tokens", step + 1);
                break;
            }
        }
        Ok(token_ids)
    }

    // Token embedding plus position embedding: [batch, seq_len] -> [batch, seq_len, dim_embed]
    fn embed(&self, token_ids: &Tensor) -> Tensor {
        let seq_len = token_ids.size()[1];
        // [batch, seq_len, dim_embed]
        let token_embedding = token_ids.apply(&self.token_embedding);
        // [seq_len, dim_embed], broadcast over the batch by the addition
        let positions = Tensor::arange(seq_len, (Kind::Int64, token_ids.device()));
        let position_embedding = positions.apply(&self.position_embedding);
        token_embedding + position_embedding
    }

    fn logits_t(&self, token_ids: &Tensor, train: bool) -> Tensor {
        let embedding = self.embed(token_ids);
        self.blocks
            .iter()
            .fold(embedding, |hidden, block| hidden.apply_t(block, train))
            .apply(&self.layer_norm_final)
            .apply(&self.project)
    }

    fn check_token_ids(&self, token_ids: &Tensor) -> Result<()> {
        let size = token_ids.size();
        if size.len() != 2 {
            return Err(Error::InvalidTokenShape(size));
        }
        if size[0] == 0 || size[1] == 0 {
            return Err(Error::EmptySequence);
        }
        if size[1] > self.config.max_length {
            return Err(Error::ContextTooLong {
                len: size[1],
                max: self.config.max_length,
            });
        }
        self.check_range(token_ids)
    }

    fn check_range(&self, token_ids: &Tensor) -> Result<()> {
        if token_ids.numel() == 0 {
            return Ok(());
        }
        let min = i64::try_from(&token_ids.min())?;
        let max = i64::try_from(&token_ids.max())?;
        let vocab_size = self.config.vocab_size;
        for id in [min, max] {
            if !(0..vocab_size).contains(&id) {
                return Err(Error::TokenOutOfRange { id, vocab_size });
            }
        }
        Ok(())
    }
}

impl Parameters for LanguageModel {
    fn parameters(&self) -> Vec<&Tensor> {
        [&self.token_embedding.ws, &self.position_embedding.ws]
            .into_iter()
            .chain(self.blocks.iter().flat_map(|block| block.parameters()))
            .chain(layer_norm_parameters(&self.layer_norm_final))
            .chain(linear_parameters(&self.project))
            .collect()
    }
}
