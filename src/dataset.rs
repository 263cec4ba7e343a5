use std::{fmt, path::Path};

use anyhow::{Context, Result, bail};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use serde::{Deserialize, Serialize};
use tch::{Device, Tensor};
use tracing::{debug, info};

use crate::{
    constants::{
        EOS_CHAR, EOS_TOKEN, INPUT_MARKER, INSTRUCTION_MARKER, RESPONSE_MARKER,
        TRAIN_VALIDATION_SPLIT,
    },
    tokenizer::Tokenizer,
};

/// `<INS>{instruction}<INP>{input}<RES>`, the prefix a response is generated from.
pub fn format_prompt(instruction: &str, input: &str) -> String {
    format!("{INSTRUCTION_MARKER}{instruction}{INPUT_MARKER}{input}{RESPONSE_MARKER}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionExample {
    pub instruction: String,
    #[serde(default)]
    pub input: String,
    pub output: String,
}

impl InstructionExample {
    pub fn prompt(&self) -> String {
        format_prompt(&self.instruction, &self.input)
    }

    /// Prompt, response and the end-of-sequence character.
    pub fn text(&self) -> String {
        format!("{}{}{EOS_CHAR}", self.prompt(), self.output)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceExample {
    pub instruction: String,
    #[serde(default)]
    pub input: String,
    pub chosen: String,
    pub rejected: String,
}

impl PreferenceExample {
    pub fn prompt(&self) -> String {
        format_prompt(&self.instruction, &self.input)
    }

    pub fn chosen_text(&self) -> String {
        format!("{}{}{EOS_CHAR}", self.prompt(), self.chosen)
    }

    pub fn rejected_text(&self) -> String {
        format!("{}{}{EOS_CHAR}", self.prompt(), self.rejected)
    }
}

/// Raw text for all three training stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Corpus {
    pub pretrain: Vec<String>,
    pub finetune: Vec<InstructionExample>,
    pub alignment: Vec<PreferenceExample>,
}

impl Corpus {
    /// Loads a JSON corpus file, or merges every `*.json` file under a directory.
    pub fn load(path: &Path) -> Result<Self> {
        if path.is_file() {
            return Self::load_file(path);
        }
        let mut corpus = Corpus::default();
        for file_path in Self::enumerate_files(path) {
            corpus.merge(Self::load_file(&file_path)?);
        }
        if corpus.is_empty() {
            bail!("no data found under {}", path.display());
        }
        Ok(corpus)
    }

    fn load_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
    }

    fn enumerate_files(data_dir: &Path) -> Vec<std::path::PathBuf> {
        walkdir::WalkDir::new(data_dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .map(|e| e.into_path())
            .collect()
    }

    fn merge(&mut self, other: Corpus) {
        self.pretrain.extend(other.pretrain);
        self.finetune.extend(other.finetune);
        self.alignment.extend(other.alignment);
    }

    pub fn is_empty(&self) -> bool {
        self.pretrain.is_empty() && self.finetune.is_empty() && self.alignment.is_empty()
    }

    /// Every text the model will ever see, for building a vocabulary.
    pub fn texts(&self) -> Vec<String> {
        let mut texts = self.pretrain.clone();
        texts.extend(self.finetune.iter().map(InstructionExample::text));
        for example in &self.alignment {
            texts.push(example.chosen_text());
            texts.push(example.rejected_text());
        }
        texts
    }

    pub fn build_tokenizer(&self) -> Tokenizer {
        let texts = self.texts();
        Tokenizer::from_corpus(texts.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Validation,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Validation => write!(f, "validation"),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Splits<T> {
    train: T,
    validation: T,
}

impl<T> Splits<T> {
    fn get(&self, split: Split) -> &T {
        match split {
            Split::Train => &self.train,
            Split::Validation => &self.validation,
        }
    }
}

/// Shuffles `items` and cuts them into train and validation parts.
fn split_items<T>(mut items: Vec<T>, rng: &mut StdRng) -> Splits<Vec<T>> {
    items.shuffle(rng);
    let train_len = ((items.len() as f32) * TRAIN_VALIDATION_SPLIT).ceil() as usize;
    let validation = items.split_off(train_len.min(items.len()));
    Splits {
        train: items,
        validation,
    }
}

/// A (preferred, dispreferred) pair of padded batches with identical shapes.
#[derive(Debug)]
pub struct PreferenceBatch {
    pub positive_ids: Tensor,
    pub positive_targets: Tensor,
    pub negative_ids: Tensor,
    pub negative_targets: Tensor,
}

/// Tokenized data for all stages, ready to be cut into batches.
#[derive(Debug)]
pub struct DataSet {
    tokenizer: Tokenizer,
    device: Device,
    block_size: i64,
    batch_size: usize,
    rng: StdRng,
    pretrain: Splits<Vec<i64>>,
    finetune: Splits<Vec<Vec<i64>>>,
    alignment: Splits<Vec<(Vec<i64>, Vec<i64>)>>,
    sample_prompt: Option<String>,
}

impl DataSet {
    pub fn new(
        corpus: &Corpus,
        tokenizer: Tokenizer,
        block_size: i64,
        batch_size: usize,
        seed: u64,
        device: Device,
    ) -> Result<Self> {
        if block_size < 1 || batch_size == 0 {
            bail!("block size and batch size must be positive");
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let max_tokens = block_size as usize + 1;

        // One token stream for pretraining, each text closed by end-of-sequence.
        let mut stream = Vec::new();
        for text in &corpus.pretrain {
            stream.extend(tokenizer.encode(text)?);
            stream.push(EOS_TOKEN);
        }
        let train_len = ((stream.len() as f32) * TRAIN_VALIDATION_SPLIT) as usize;
        let validation = stream.split_off(train_len);
        let pretrain = Splits {
            train: stream,
            validation,
        };

        let finetune_examples: Vec<InstructionExample> = corpus.finetune.clone();
        let finetune_examples = split_items(finetune_examples, &mut rng);
        let sample_prompt = finetune_examples
            .validation
            .first()
            .or(finetune_examples.train.first())
            .map(InstructionExample::prompt);
        let encode_all = |examples: &[InstructionExample]| -> Result<Vec<Vec<i64>>> {
            examples
                .iter()
                .map(|example| {
                    let mut tokens = tokenizer.encode(&example.text())?;
                    tokens.truncate(max_tokens);
                    Ok(tokens)
                })
                .collect()
        };
        let finetune = Splits {
            train: encode_all(&finetune_examples.train)?,
            validation: encode_all(&finetune_examples.validation)?,
        };

        let mut pairs = Vec::with_capacity(corpus.alignment.len());
        for example in &corpus.alignment {
            let mut chosen = tokenizer.encode(&example.chosen_text())?;
            let mut rejected = tokenizer.encode(&example.rejected_text())?;
            chosen.truncate(max_tokens);
            rejected.truncate(max_tokens);
            pairs.push((chosen, rejected));
        }
        let alignment = split_items(pairs, &mut rng);

        info!(
            "dataset: {} pretraining tokens, {} fine-tuning examples, {} preference pairs",
            pretrain.train.len() + pretrain.validation.len(),
            corpus.finetune.len(),
            corpus.alignment.len()
        );
        Ok(DataSet {
            tokenizer,
            device,
            block_size,
            batch_size,
            rng,
            pretrain,
            finetune,
            alignment,
            sample_prompt,
        })
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Prompt of the first held-out instruction example, if there is one.
    pub fn sample_prompt(&self) -> Option<&str> {
        self.sample_prompt.as_deref()
    }

    /// First token of the pretraining validation stream (or the train stream).
    pub fn first_pretrain_token(&self) -> Option<i64> {
        self.pretrain
            .validation
            .first()
            .or(self.pretrain.train.first())
            .copied()
    }

    /// `batch_size` random windows of the pretraining stream, each input of
    /// shape [batch, block_size] with targets shifted one token to the right.
    pub fn pretrain_batch(&mut self, split: Split) -> Result<(Tensor, Tensor)> {
        let block = self.block_size as usize;
        let stream = self.pretrain.get(split);
        if stream.len() <= block {
            bail!(
                "{} pretraining split has {} tokens, need more than {}",
                split,
                stream.len(),
                block
            );
        }
        let mut inputs = Vec::with_capacity(self.batch_size * block);
        let mut targets = Vec::with_capacity(self.batch_size * block);
        for _ in 0..self.batch_size {
            let start = self.rng.random_range(0..stream.len() - block);
            inputs.extend_from_slice(&stream[start..start + block]);
            targets.extend_from_slice(&stream[start + 1..start + block + 1]);
        }
        let shape = [self.batch_size as i64, self.block_size];
        Ok((
            Tensor::from_slice(&inputs).view(shape).to_device(self.device),
            Tensor::from_slice(&targets).view(shape).to_device(self.device),
        ))
    }

    /// One pass over the instruction examples, shuffled for the training split.
    pub fn finetune_batches(&mut self, split: Split) -> FinetuneBatches {
        let mut sequences = self.finetune.get(split).clone();
        if split == Split::Train {
            sequences.shuffle(&mut self.rng);
        }
        debug!("{} fine-tuning sequences in {} split", sequences.len(), split);
        FinetuneBatches {
            sequences,
            batch_size: self.batch_size,
            device: self.device,
        }
    }

    /// One pass over the preference pairs, shuffled for the training split.
    pub fn preference_batches(&mut self, split: Split) -> PreferenceBatches {
        let mut pairs = self.alignment.get(split).clone();
        if split == Split::Train {
            pairs.shuffle(&mut self.rng);
        }
        PreferenceBatches {
            pairs,
            batch_size: self.batch_size,
            device: self.device,
        }
    }
}

/// Pads every sequence with end-of-sequence tokens to `len` and splits it into
/// inputs (all but the last token) and targets (all but the first).
fn to_padded_batch<'a>(
    sequences: impl ExactSizeIterator<Item = &'a [i64]>,
    len: usize,
    device: Device,
) -> (Tensor, Tensor) {
    let batch = sequences.len() as i64;
    let mut inputs = Vec::with_capacity(batch as usize * (len - 1));
    let mut targets = Vec::with_capacity(batch as usize * (len - 1));
    for sequence in sequences {
        let mut padded = sequence.to_vec();
        padded.resize(len, EOS_TOKEN);
        inputs.extend_from_slice(&padded[..len - 1]);
        targets.extend_from_slice(&padded[1..]);
    }
    let shape = [batch, len as i64 - 1];
    (
        Tensor::from_slice(&inputs).view(shape).to_device(device),
        Tensor::from_slice(&targets).view(shape).to_device(device),
    )
}

#[derive(Debug)]
pub struct FinetuneBatches {
    sequences: Vec<Vec<i64>>,
    batch_size: usize,
    device: Device,
}

impl Iterator for FinetuneBatches {
    type Item = (Tensor, Tensor); // (input, target) padded to the longest sequence

    fn next(&mut self) -> Option<Self::Item> {
        if self.sequences.is_empty() {
            return None;
        }
        let take = self.batch_size.min(self.sequences.len());
        let chunk: Vec<Vec<i64>> = self.sequences.drain(..take).collect();
        // At least two tokens so that inputs and targets are non-empty.
        let len = chunk.iter().map(Vec::len).max().unwrap_or(0).max(2);
        Some(to_padded_batch(
            chunk.iter().map(Vec::as_slice),
            len,
            self.device,
        ))
    }
}

#[derive(Debug)]
pub struct PreferenceBatches {
    pairs: Vec<(Vec<i64>, Vec<i64>)>,
    batch_size: usize,
    device: Device,
}

impl Iterator for PreferenceBatches {
    type Item = PreferenceBatch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pairs.is_empty() {
            return None;
        }
        let take = self.batch_size.min(self.pairs.len());
        let chunk: Vec<(Vec<i64>, Vec<i64>)> = self.pairs.drain(..take).collect();
        // Both sides share one length so rewards line up token by token.
        let len = chunk
            .iter()
            .map(|(chosen, rejected)| chosen.len().max(rejected.len()))
            .max()
            .unwrap_or(0)
            .max(2);
        let (positive_ids, positive_targets) = to_padded_batch(
            chunk.iter().map(|(chosen, _)| chosen.as_slice()),
            len,
            self.device,
        );
        let (negative_ids, negative_targets) = to_padded_batch(
            chunk.iter().map(|(_, rejected)| rejected.as_slice()),
            len,
            self.device,
        );
        Some(PreferenceBatch {
            positive_ids,
            positive_targets,
            negative_ids,
            negative_targets,
        })
    }
}
