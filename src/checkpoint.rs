//! Saving and restoring a model together with its vocabulary.
//!
//! A checkpoint is a directory holding `config.json`, `vocab.json` and
//! `weights.safetensors`.

use std::path::Path;

use anyhow::{Context, Result};
use tch::Device;
use tracing::info;

use crate::{config::ModelConfig, model::LanguageModel, tokenizer::Tokenizer};

const CONFIG_FILE: &str = "config.json";
const VOCAB_FILE: &str = "vocab.json";
const WEIGHTS_FILE: &str = "weights.safetensors";

pub fn save(dir: &Path, model: &LanguageModel, tokenizer: &Tokenizer) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("unable to create checkpoint directory {}", dir.display()))?;
    std::fs::write(
        dir.join(CONFIG_FILE),
        serde_json::to_string_pretty(model.config())?,
    )?;
    std::fs::write(dir.join(VOCAB_FILE), serde_json::to_string(tokenizer)?)?;
    model
        .var_store()
        .save(dir.join(WEIGHTS_FILE))
        .context("unable to save weights")?;
    info!("saved checkpoint to {}", dir.display());
    Ok(())
}

pub fn load(dir: &Path, device: Device) -> Result<(LanguageModel, Tokenizer)> {
    let config: ModelConfig = serde_json::from_str(
        &std::fs::read_to_string(dir.join(CONFIG_FILE))
            .with_context(|| format!("no model config in {}", dir.display()))?,
    )?;
    let tokenizer: Tokenizer = serde_json::from_str(
        &std::fs::read_to_string(dir.join(VOCAB_FILE))
            .with_context(|| format!("no vocabulary in {}", dir.display()))?,
    )?;
    anyhow::ensure!(
        tokenizer.vocab_size() == config.vocab_size,
        "vocabulary has {} tokens but the model expects {}",
        tokenizer.vocab_size(),
        config.vocab_size
    );
    let mut model = LanguageModel::new(&config, device)?;
    model
        .var_store_mut()
        .load(dir.join(WEIGHTS_FILE))
        .context("unable to load checkpoint")?;
    info!("loaded checkpoint from {}", dir.display());
    Ok((model, tokenizer))
}
