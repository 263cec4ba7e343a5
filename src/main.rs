use std::{
    ffi::CString,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tch::Device;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tutorial_llm::{
    checkpoint,
    config::{RunConfig, parse_device},
    dataset::{Corpus, DataSet, format_prompt},
    generate::Generator,
    model::LanguageModel,
    tokenizer::Tokenizer,
    train::{Aligner, StageReport, Trainer},
};

/// Pretrain, fine-tune, align and sample a small character-level transformer.
#[derive(Parser)]
#[command(name = "tutorial-llm")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// cpu, cuda, cuda:N, mps or auto
    #[arg(long, global = true, default_value = "auto")]
    device: String,

    /// Shared library to load before looking for CUDA
    #[arg(long, global = true)]
    cuda_library: Option<PathBuf>,

    /// JSON run configuration; missing fields keep their defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a fresh model on the pretraining texts
    Pretrain {
        /// Corpus file, or a directory of corpus files
        #[arg(value_name = "DATA")]
        data: PathBuf,

        /// Checkpoint directory to write
        #[arg(short, long)]
        output: PathBuf,

        /// Write the evaluation records here as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Continue training a checkpoint on instruction examples
    Finetune {
        #[arg(value_name = "DATA")]
        data: PathBuf,

        /// Checkpoint directory to start from
        #[arg(long)]
        checkpoint: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Align a fine-tuned checkpoint on preference pairs with DPO
    Align {
        #[arg(value_name = "DATA")]
        data: PathBuf,

        #[arg(long)]
        checkpoint: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Stream a completion from a checkpoint
    Generate {
        #[arg(long)]
        checkpoint: PathBuf,

        #[arg(value_name = "PROMPT")]
        prompt: String,

        /// Treat PROMPT as an instruction and wrap it in the prompt template
        #[arg(long)]
        instruction: bool,

        /// Input for the instruction template
        #[arg(long, default_value = "")]
        input: String,

        #[arg(short, long, default_value = "1.0")]
        temperature: f64,

        /// Maximum characters to generate
        #[arg(short = 'n', long, default_value = "2048")]
        max_length: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    if let Some(library) = &cli.cuda_library {
        load_cuda_library(library)?;
    }
    // Resolved after the CUDA library is loaded so that `auto` can find it.
    let device: Device = parse_device(&cli.device).map_err(anyhow::Error::msg)?;
    info!("using device {:?}", device);
    let config = match &cli.config {
        Some(path) => RunConfig::from_file(path)
            .with_context(|| format!("failed to read config {}", path.display()))?,
        None => RunConfig::default(),
    };
    config.validate()?;

    match cli.command {
        Commands::Pretrain {
            data,
            output,
            report,
        } => {
            let corpus = Corpus::load(&data)?;
            let tokenizer = corpus.build_tokenizer();
            let mut model_config = config.model.clone();
            model_config.vocab_size = tokenizer.vocab_size();
            tch::manual_seed(config.training.seed as i64);
            let model = LanguageModel::new(&model_config, device)?;
            let dataset = build_dataset(&corpus, tokenizer, &model, &config)?;
            let mut trainer = Trainer::new(model, dataset, &config.training)?;
            let stage_report = trainer.pretrain()?;
            let (model, dataset) = trainer.into_parts();
            finish(&output, &model, dataset.tokenizer(), &stage_report, report)
        }
        Commands::Finetune {
            data,
            checkpoint,
            output,
            report,
        } => {
            let corpus = Corpus::load(&data)?;
            let (model, tokenizer) = checkpoint::load(&checkpoint, device)?;
            tch::manual_seed(config.training.seed as i64);
            let dataset = build_dataset(&corpus, tokenizer, &model, &config)?;
            let mut trainer = Trainer::new(model, dataset, &config.training)?;
            let stage_report = trainer.finetune()?;
            let (model, dataset) = trainer.into_parts();
            finish(&output, &model, dataset.tokenizer(), &stage_report, report)
        }
        Commands::Align {
            data,
            checkpoint,
            output,
            report,
        } => {
            let corpus = Corpus::load(&data)?;
            let (model, tokenizer) = checkpoint::load(&checkpoint, device)?;
            tch::manual_seed(config.training.seed as i64);
            let dataset = build_dataset(&corpus, tokenizer, &model, &config)?;
            let mut aligner = Aligner::new(model, dataset, &config.training, &config.alignment)?;
            let stage_report = aligner.align()?;
            let (model, dataset) = aligner.into_parts();
            finish(&output, &model, dataset.tokenizer(), &stage_report, report)
        }
        Commands::Generate {
            checkpoint,
            prompt,
            instruction,
            input,
            temperature,
            max_length,
        } => {
            let mut generator = Generator::new(&checkpoint, device)?;
            generator.set_temperature(temperature)?;
            generator.set_max_length(max_length);
            let prompt = if instruction {
                format_prompt(&prompt, &input)
            } else {
                prompt
            };
            let mut stdout = std::io::stdout().lock();
            write!(stdout, "{}", prompt)?;
            for c in generator.prompt(&prompt)? {
                write!(stdout, "{}", c)?;
                stdout.flush()?;
            }
            writeln!(stdout)?;
            Ok(())
        }
    }
}

fn build_dataset(
    corpus: &Corpus,
    tokenizer: Tokenizer,
    model: &LanguageModel,
    config: &RunConfig,
) -> Result<DataSet> {
    DataSet::new(
        corpus,
        tokenizer,
        model.config().max_length,
        config.training.batch_size,
        config.training.seed,
        model.device(),
    )
    .context("failed to prepare the dataset")
}

fn finish(
    output: &Path,
    model: &LanguageModel,
    tokenizer: &Tokenizer,
    stage_report: &StageReport,
    report: Option<PathBuf>,
) -> Result<()> {
    checkpoint::save(output, model, tokenizer)?;
    if let Some(path) = report {
        std::fs::write(&path, serde_json::to_string_pretty(stage_report)?)
            .with_context(|| format!("failed to write report {}", path.display()))?;
    }
    Ok(())
}

// Kludge to load CUDA since libtorch seems to load it lazily, causing is_available to return false.
fn load_cuda_library(path: &Path) -> Result<()> {
    let name = CString::new(path.to_string_lossy().as_bytes())?;
    let handle = unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_LAZY) };
    if handle.is_null() {
        warn!("could not load {}", path.display());
    }
    if !tch::Cuda::is_available() {
        warn!("CUDA is not available");
    }
    Ok(())
}
