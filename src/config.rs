//! Run configuration.
//!
//! Every field has a default, so a config file only needs to name what it
//! changes. A file like
//!
//! ```json
//! { "model": { "dim_embed": 32 }, "training": { "iterations": 100 } }
//! ```
//!
//! keeps every other setting at its default.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tch::Device;

use crate::{
    constants::{
        BATCH_SIZE, DPO_BETA, DPO_POSITIVE_WEIGHT, EMBEDDING_DIM, EVALUATION_INTERVAL,
        EVALUATION_ITERATIONS, HEADS, LAYERS, LEARNING_RATE, MAX_LENGTH, SEED, TRAIN_ITERATIONS,
    },
    error::{Error, Result},
};

/// Shape of a [`LanguageModel`](crate::model::LanguageModel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Number of distinct token ids. Normally taken from the tokenizer.
    pub vocab_size: i64,
    /// Width of every token vector inside the model.
    pub dim_embed: i64,
    /// Maximum context length, also the number of position embeddings.
    pub max_length: i64,
    /// Attention heads per block.
    pub num_heads: i64,
    /// Number of transformer blocks.
    pub num_layers: i64,
    /// Dropout probability applied in train mode. 0.0 disables dropout.
    pub dropout: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            vocab_size: 0,
            dim_embed: EMBEDDING_DIM,
            max_length: MAX_LENGTH,
            num_heads: HEADS,
            num_layers: LAYERS,
            dropout: 0.0,
        }
    }
}

impl ModelConfig {
    pub fn new(
        vocab_size: i64,
        dim_embed: i64,
        max_length: i64,
        num_heads: i64,
        num_layers: i64,
    ) -> Self {
        ModelConfig {
            vocab_size,
            dim_embed,
            max_length,
            num_heads,
            num_layers,
            dropout: 0.0,
        }
    }

    /// Output width of a single attention head.
    pub fn head_size(&self) -> i64 {
        self.dim_embed / self.num_heads
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("vocab_size", self.vocab_size),
            ("dim_embed", self.dim_embed),
            ("max_length", self.max_length),
            ("num_heads", self.num_heads),
            ("num_layers", self.num_layers),
        ] {
            if value <= 0 {
                return Err(Error::ZeroDimension(name));
            }
        }
        if self.dim_embed % self.num_heads != 0 {
            return Err(Error::HeadsDoNotDivideEmbedding {
                dim_embed: self.dim_embed,
                num_heads: self.num_heads,
            });
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::InvalidDropout(self.dropout));
        }
        Ok(())
    }
}

/// Settings shared by pretraining and fine-tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Pretraining steps.
    pub iterations: usize,
    /// Fine-tuning passes over the data.
    pub epochs: usize,
    /// Steps between two evaluations.
    pub eval_interval: usize,
    /// Validation batches averaged per pretraining evaluation.
    pub eval_iters: usize,
    pub seed: u64,
    /// Tokens generated for the sample printed at each evaluation.
    pub sample_tokens: usize,
    /// Prompt for pretraining samples. Defaults to the first validation character.
    pub pretrain_prompt: Option<String>,
    /// Instruction prompt for fine-tuning samples. Defaults to the first validation example.
    pub finetune_prompt: Option<String>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            batch_size: BATCH_SIZE,
            learning_rate: LEARNING_RATE,
            iterations: TRAIN_ITERATIONS,
            epochs: 1,
            eval_interval: EVALUATION_INTERVAL,
            eval_iters: EVALUATION_ITERATIONS,
            seed: SEED,
            sample_tokens: 100,
            pretrain_prompt: None,
            finetune_prompt: None,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("batch_size", self.batch_size),
            ("eval_interval", self.eval_interval),
            ("eval_iters", self.eval_iters),
        ] {
            if value == 0 {
                return Err(Error::ZeroDimension(name));
            }
        }
        Ok(())
    }
}

/// Settings of the DPO stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    pub beta: f64,
    pub positive_weight: f64,
    pub learning_rate: f64,
    pub epochs: usize,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        AlignmentConfig {
            beta: DPO_BETA,
            positive_weight: DPO_POSITIVE_WEIGHT,
            learning_rate: LEARNING_RATE / 10.0,
            epochs: 1,
        }
    }
}

impl AlignmentConfig {
    pub fn validate(&self) -> Result<()> {
        validate_dpo_parameters(self.beta, self.positive_weight)
    }
}

pub(crate) fn validate_dpo_parameters(beta: f64, positive_weight: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&positive_weight) {
        return Err(Error::PositiveWeightOutOfRange(positive_weight));
    }
    if !beta.is_finite() || beta <= 0.0 {
        return Err(Error::InvalidBeta(beta));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub alignment: AlignmentConfig,
}

impl RunConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Validates the training and alignment sections. The model section is
    /// validated once the vocabulary size is known.
    pub fn validate(&self) -> Result<()> {
        self.training.validate()?;
        self.alignment.validate()
    }
}

/// Parses `cpu`, `cuda`, `cuda:N`, `mps` or `auto`.
pub fn parse_device(name: &str) -> std::result::Result<Device, String> {
    match name {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::Cuda(0)),
        "mps" => Ok(Device::Mps),
        "auto" => Ok(Device::cuda_if_available()),
        other => match other.strip_prefix("cuda:") {
            Some(index) => index
                .parse::<usize>()
                .map(Device::Cuda)
                .map_err(|_| format!("invalid cuda device index: {index}")),
            None => Err(format!("unknown device: {other}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_model_config_is_valid_once_vocab_is_known() {
        let mut config = ModelConfig::default();
        assert!(matches!(
            config.validate(),
            Err(Error::ZeroDimension("vocab_size"))
        ));
        config.vocab_size = 100;
        assert!(config.validate().is_ok());
        assert_eq!(config.head_size(), EMBEDDING_DIM / HEADS);
    }

    #[test]
    fn test_heads_must_divide_embedding() {
        let config = ModelConfig::new(5, 10, 4, 3, 1);
        assert!(matches!(
            config.validate(),
            Err(Error::HeadsDoNotDivideEmbedding {
                dim_embed: 10,
                num_heads: 3
            })
        ));
    }

    #[test]
    fn test_dropout_range() {
        let mut config = ModelConfig::new(5, 8, 4, 2, 1);
        config.dropout = 1.0;
        assert!(matches!(config.validate(), Err(Error::InvalidDropout(_))));
        config.dropout = 0.2;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_alignment_validation() {
        let mut config = AlignmentConfig::default();
        assert!(config.validate().is_ok());
        config.positive_weight = 1.2;
        assert!(matches!(
            config.validate(),
            Err(Error::PositiveWeightOutOfRange(_))
        ));
        config.positive_weight = 0.5;
        config.beta = 0.0;
        assert!(matches!(config.validate(), Err(Error::InvalidBeta(_))));
    }

    #[test]
    fn test_partial_config_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "model": {{ "dim_embed": 32 }}, "alignment": {{ "beta": 0.5 }} }}"#
        )
        .unwrap();
        let config = RunConfig::from_file(file.path()).unwrap();
        assert_eq!(config.model.dim_embed, 32);
        assert_eq!(config.model.num_heads, HEADS);
        assert_eq!(config.alignment.beta, 0.5);
        assert_eq!(config.alignment.positive_weight, DPO_POSITIVE_WEIGHT);
        assert_eq!(config.training, TrainingConfig::default());
    }

    #[test]
    fn test_parse_device() {
        assert_eq!(parse_device("cpu"), Ok(Device::Cpu));
        assert_eq!(parse_device("cuda"), Ok(Device::Cuda(0)));
        assert_eq!(parse_device("cuda:2"), Ok(Device::Cuda(2)));
        assert!(parse_device("cuda:x").is_err());
        assert!(parse_device("tpu").is_err());
    }
}
