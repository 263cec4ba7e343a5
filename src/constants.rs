/// Token ID of the end-of-sequence sentinel. The tokenizer always maps `'\0'` here.
pub const EOS_TOKEN: i64 = 0;
/// The character the sentinel decodes from and encodes to.
pub const EOS_CHAR: char = '\0';

/// Markers of the instruction prompt template.
pub const INSTRUCTION_MARKER: &str = "<INS>";
pub const INPUT_MARKER: &str = "<INP>";
pub const RESPONSE_MARKER: &str = "<RES>";

/// The maximum context length, which is also the number of learned position embeddings.
pub const MAX_LENGTH: i64 = 256;
/// The number of dimensions in the embedding space.
pub const EMBEDDING_DIM: i64 = 64;
/// The number of "heads" (attention passes)
pub const HEADS: i64 = 4;
/// Number of layers
pub const LAYERS: i64 = 4;
/// The feed-forward hidden layer is this many times wider than the embedding.
pub const FFN_EXPANSION: i64 = 4;

pub const BATCH_SIZE: usize = 16;
pub const LEARNING_RATE: f64 = 1e-3;
pub const TRAIN_ITERATIONS: usize = 500;
pub const EVALUATION_INTERVAL: usize = 50;
pub const EVALUATION_ITERATIONS: usize = 100;
pub const SEED: u64 = 1993;

/// Default alignment strength for DPO.
pub const DPO_BETA: f64 = 0.1;
/// Default share of the preferred-sample reward in the DPO reward margin.
pub const DPO_POSITIVE_WEIGHT: f64 = 0.8;

/// The fraction of the dataset to be used for training; the rest is used for validation.
pub const TRAIN_VALIDATION_SPLIT: f32 = 0.9;
