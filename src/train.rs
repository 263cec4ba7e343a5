use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tch::{
    Tensor,
    nn::{AdamW, Optimizer, OptimizerConfig},
};
use tracing::{info, warn};

use crate::{
    config::{AlignmentConfig, TrainingConfig},
    dataset::{DataSet, PreferenceBatch, Split},
    dpo::DpoWrapper,
    model::{LanguageModel, Parameters},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Pretrain,
    Finetune,
    Align,
}

/// What was measured at one evaluation point.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationRecord {
    pub epoch: usize,
    pub step: usize,
    /// Mean training loss since the previous evaluation, if any step ran.
    pub train_loss: Option<f64>,
    pub validation_loss: Option<f64>,
    /// Mean validation reward margin (alignment only).
    pub reward_margin: Option<f64>,
    pub sample: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub records: Vec<EvaluationRecord>,
}

/// Running mean of the losses since the last evaluation.
#[derive(Debug, Default)]
struct LossMeter {
    sum: f64,
    count: usize,
}

impl LossMeter {
    fn add(&mut self, loss: f64) {
        self.sum += loss;
        self.count += 1;
    }

    fn take(&mut self) -> Option<f64> {
        let mean = (self.count > 0).then(|| self.sum / self.count as f64);
        *self = LossMeter::default();
        mean
    }
}

fn logits_loss(
    model: &LanguageModel,
    input: &Tensor,
    target: &Tensor,
    train: bool,
) -> Result<Tensor> {
    let (_, loss) = model.forward_t(input, Some(target), true, train)?;
    loss.ok_or_else(|| anyhow!("model returned no loss"))
}

/// Pretraining and supervised fine-tuning of a [`LanguageModel`].
pub struct Trainer {
    model: LanguageModel,
    optimizer: Optimizer,
    dataset: DataSet,
    config: TrainingConfig,
}

impl Trainer {
    pub fn new(model: LanguageModel, dataset: DataSet, config: &TrainingConfig) -> Result<Trainer> {
        config.validate()?;
        let optimizer = AdamW::default()
            .build(model.var_store(), config.learning_rate)
            .context("failed to create AdamW optimizer")?;
        info!(
            "{:.3}M parameters",
            model.num_parameters() as f64 / 1e6
        );
        Ok(Trainer {
            model,
            optimizer,
            dataset,
            config: config.clone(),
        })
    }

    pub fn model(&self) -> &LanguageModel {
        &self.model
    }

    pub fn into_parts(self) -> (LanguageModel, DataSet) {
        (self.model, self.dataset)
    }

    /// Trains on random windows of the pretraining corpus for the configured
    /// number of iterations, evaluating every `eval_interval` steps and before
    /// the last one.
    pub fn pretrain(&mut self) -> Result<StageReport> {
        let iterations = self.config.iterations;
        let mut records = Vec::new();
        let mut meter = LossMeter::default();
        for iteration in 0..iterations {
            if iteration % self.config.eval_interval == 0 || iteration == iterations - 1 {
                let record = EvaluationRecord {
                    epoch: 0,
                    step: iteration,
                    train_loss: meter.take(),
                    validation_loss: Some(self.estimate_pretrain_loss()?),
                    reward_margin: None,
                    sample: Some(self.pretrain_sample()?),
                };
                log_record(Stage::Pretrain, &record);
                records.push(record);
            }
            let (input, target) = self.dataset.pretrain_batch(Split::Train)?;
            let loss = self.train_step(&input, &target)?;
            meter.add(loss);
        }
        Ok(StageReport {
            stage: Stage::Pretrain,
            records,
        })
    }

    /// Runs the configured number of epochs over the instruction examples.
    pub fn finetune(&mut self) -> Result<StageReport> {
        let mut records = Vec::new();
        let mut meter = LossMeter::default();
        let mut step = 0;
        for epoch in 0..self.config.epochs {
            let batches = self.dataset.finetune_batches(Split::Train);
            for (iteration, (input, target)) in batches.enumerate() {
                if iteration % self.config.eval_interval == 0 {
                    let record = self.finetune_record(epoch, step, meter.take())?;
                    records.push(record);
                }
                meter.add(self.train_step(&input, &target)?);
                step += 1;
            }
        }
        if step == 0 {
            warn!("no fine-tuning data, nothing to do");
        }
        let record = self.finetune_record(self.config.epochs, step, meter.take())?;
        records.push(record);
        Ok(StageReport {
            stage: Stage::Finetune,
            records,
        })
    }

    // Perform one training step.
    fn train_step(&mut self, input: &Tensor, target: &Tensor) -> Result<f64> {
        let loss = logits_loss(&self.model, input, target, true)?;
        // backprop gradients, apply AdamW update
        self.optimizer.backward_step(&loss);
        Ok(f64::try_from(&loss)?)
    }

    fn estimate_pretrain_loss(&mut self) -> Result<f64> {
        let _no_grad_guard = tch::no_grad_guard();
        let mut total = 0.0;
        for _ in 0..self.config.eval_iters {
            let (input, target) = self.dataset.pretrain_batch(Split::Validation)?;
            total += f64::try_from(&logits_loss(&self.model, &input, &target, false)?)?;
        }
        Ok(total / self.config.eval_iters as f64)
    }

    fn estimate_finetune_loss(&mut self) -> Result<Option<f64>> {
        let _no_grad_guard = tch::no_grad_guard();
        let mut meter = LossMeter::default();
        for (input, target) in self.dataset.finetune_batches(Split::Validation) {
            meter.add(f64::try_from(&logits_loss(&self.model, &input, &target, false)?)?);
        }
        Ok(meter.take())
    }

    fn finetune_record(
        &mut self,
        epoch: usize,
        step: usize,
        train_loss: Option<f64>,
    ) -> Result<EvaluationRecord> {
        let record = EvaluationRecord {
            epoch,
            step,
            train_loss,
            validation_loss: self.estimate_finetune_loss()?,
            reward_margin: None,
            sample: self.finetune_sample()?,
        };
        log_record(Stage::Finetune, &record);
        Ok(record)
    }

    fn pretrain_sample(&self) -> Result<String> {
        let prompt = match &self.config.pretrain_prompt {
            Some(text) => self.dataset.tokenizer().encode(text)?,
            None => self.dataset.first_pretrain_token().into_iter().collect(),
        };
        if prompt.is_empty() {
            return Ok(String::new());
        }
        let tokens = self.generate(&prompt)?;
        self.dataset.tokenizer().decode(&tokens)
    }

    /// The model's response to the sample instruction, without the prompt.
    fn finetune_sample(&self) -> Result<Option<String>> {
        let Some(prompt) = self
            .config
            .finetune_prompt
            .as_deref()
            .or(self.dataset.sample_prompt())
        else {
            return Ok(None);
        };
        let tokens = self.generate(&self.dataset.tokenizer().encode(prompt)?)?;
        let text = self.dataset.tokenizer().decode(&tokens)?;
        Ok(Some(text.chars().skip(prompt.chars().count()).collect()))
    }

    fn generate(&self, prompt: &[i64]) -> Result<Vec<i64>> {
        let prompt = Tensor::from_slice(prompt)
            .to_device(self.model.device())
            .unsqueeze(0);
        let output = self.model.generate(&prompt, self.config.sample_tokens)?;
        Ok(Vec::<i64>::try_from(&output.get(0))?)
    }
}

/// Preference alignment of a fine-tuned model with DPO.
pub struct Aligner {
    dpo: DpoWrapper,
    optimizer: Optimizer,
    dataset: DataSet,
    eval_interval: usize,
    epochs: usize,
}

impl Aligner {
    pub fn new(
        model: LanguageModel,
        dataset: DataSet,
        training: &TrainingConfig,
        alignment: &AlignmentConfig,
    ) -> Result<Aligner> {
        training.validate()?;
        let dpo = DpoWrapper::new(model, alignment.beta, alignment.positive_weight)?;
        let optimizer = AdamW::default()
            .build(dpo.aligned().var_store(), alignment.learning_rate)
            .context("failed to create AdamW optimizer")?;
        Ok(Aligner {
            dpo,
            optimizer,
            dataset,
            eval_interval: training.eval_interval,
            epochs: alignment.epochs,
        })
    }

    pub fn dpo(&self) -> &DpoWrapper {
        &self.dpo
    }

    /// Gives back the aligned model and the dataset.
    pub fn into_parts(self) -> (LanguageModel, DataSet) {
        (self.dpo.into_aligned(), self.dataset)
    }

    pub fn align(&mut self) -> Result<StageReport> {
        let mut records = Vec::new();
        let mut meter = LossMeter::default();
        let mut step = 0;
        for epoch in 0..self.epochs {
            let batches = self.dataset.preference_batches(Split::Train);
            for (iteration, batch) in batches.enumerate() {
                if iteration % self.eval_interval == 0 {
                    records.push(self.align_record(epoch, step, meter.take())?);
                }
                let output = self.dpo.forward_t(
                    &batch.positive_ids,
                    &batch.positive_targets,
                    &batch.negative_ids,
                    &batch.negative_targets,
                    true,
                )?;
                self.optimizer.backward_step(&output.loss);
                meter.add(f64::try_from(&output.loss)?);
                step += 1;
            }
        }
        if step == 0 {
            warn!("no preference pairs, nothing to align");
        }
        records.push(self.align_record(self.epochs, step, meter.take())?);
        Ok(StageReport {
            stage: Stage::Align,
            records,
        })
    }

    fn align_record(
        &mut self,
        epoch: usize,
        step: usize,
        train_loss: Option<f64>,
    ) -> Result<EvaluationRecord> {
        let (validation_loss, reward_margin) = match self.validation_loss()? {
            Some((loss, margin)) => (Some(loss), Some(margin)),
            None => (None, None),
        };
        let record = EvaluationRecord {
            epoch,
            step,
            train_loss,
            validation_loss,
            reward_margin,
            sample: None,
        };
        log_record(Stage::Align, &record);
        Ok(record)
    }

    /// Mean DPO loss and reward margin over the validation pairs.
    fn validation_loss(&mut self) -> Result<Option<(f64, f64)>> {
        let _no_grad_guard = tch::no_grad_guard();
        let mut losses = LossMeter::default();
        let mut margins = LossMeter::default();
        for batch in self.dataset.preference_batches(Split::Validation) {
            let PreferenceBatch {
                positive_ids,
                positive_targets,
                negative_ids,
                negative_targets,
            } = batch;
            let output = self.dpo.forward(
                &positive_ids,
                &positive_targets,
                &negative_ids,
                &negative_targets,
            )?;
            losses.add(f64::try_from(&output.loss)?);
            margins.add(f64::try_from(&output.reward_margin)?);
        }
        Ok(losses.take().zip(margins.take()))
    }
}

fn log_record(stage: Stage, record: &EvaluationRecord) {
    let show = |value: Option<f64>| value.map_or("-".to_string(), |v| format!("{v:.4}"));
    info!(
        "{:?} epoch {}, step {}: train loss {}, val loss {}, reward margin {}",
        stage,
        record.epoch,
        record.step,
        show(record.train_loss),
        show(record.validation_loss),
        show(record.reward_margin),
    );
    if let Some(sample) = &record.sample {
        info!("sample: {}", sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ModelConfig,
        dataset::{Corpus, InstructionExample, PreferenceExample},
    };
    use tch::Device;

    fn corpus() -> Corpus {
        Corpus {
            pretrain: (0..20)
                .map(|i| format!("def foo_{}():\n    return {}", i, i))
                .collect(),
            finetune: (0..12)
                .map(|i| InstructionExample {
                    instruction: "call".to_string(),
                    input: format!("{}", i),
                    output: format!("foo_{}()", i),
                })
                .collect(),
            alignment: (0..12)
                .map(|i| PreferenceExample {
                    instruction: "call".to_string(),
                    input: format!("{}", i),
                    chosen: format!("foo_{}()", i),
                    rejected: "return".to_string(),
                })
                .collect(),
        }
    }

    fn training_config() -> TrainingConfig {
        TrainingConfig {
            batch_size: 4,
            iterations: 5,
            eval_interval: 2,
            eval_iters: 2,
            sample_tokens: 5,
            ..Default::default()
        }
    }

    fn setup() -> (LanguageModel, DataSet) {
        tch::manual_seed(1993);
        let corpus = corpus();
        let tokenizer = corpus.build_tokenizer();
        let config = ModelConfig::new(tokenizer.vocab_size(), 16, 32, 2, 1);
        let model = LanguageModel::new(&config, Device::Cpu).unwrap();
        let dataset = DataSet::new(&corpus, tokenizer, 32, 4, 1993, Device::Cpu).unwrap();
        (model, dataset)
    }

    fn setup_trainer() -> Trainer {
        let (model, dataset) = setup();
        Trainer::new(model, dataset, &training_config()).unwrap()
    }

    #[test]
    fn test_train_step_loss_is_finite() {
        let mut trainer = setup_trainer();
        let before: Vec<Tensor> = trainer.model().parameters().iter().map(|p| p.copy()).collect();
        let (input, target) = trainer.dataset.pretrain_batch(Split::Train).unwrap();
        let loss = trainer.train_step(&input, &target).unwrap();
        assert!(loss.is_finite(), "Loss should be a finite number, got {}", loss);
        assert!(loss > 0.0, "Cross-entropy loss should be positive, got {}", loss);
        let updated = trainer
            .model()
            .parameters()
            .iter()
            .zip(&before)
            .any(|(after, before)| !after.equal(before));
        assert!(updated, "a training step should update the weights");
    }

    #[test]
    fn test_train_step_loss_decreases() {
        let mut trainer = setup_trainer();
        // Train on the same batch repeatedly: loss should decrease
        let (input, target) = trainer.dataset.pretrain_batch(Split::Train).unwrap();
        let first_loss = trainer.train_step(&input, &target).unwrap();
        let mut last_loss = first_loss;
        for _ in 0..50 {
            last_loss = trainer.train_step(&input, &target).unwrap();
        }
        assert!(
            last_loss < first_loss,
            "Loss should decrease after repeated training on same input: first={}, last={}",
            first_loss,
            last_loss
        );
    }

    #[test]
    fn test_pretrain_evaluates_on_schedule() {
        let mut trainer = setup_trainer();
        let report = trainer.pretrain().unwrap();
        assert_eq!(report.stage, Stage::Pretrain);
        let steps: Vec<usize> = report.records.iter().map(|r| r.step).collect();
        assert_eq!(steps, vec![0, 2, 4]);
        assert!(report.records[0].train_loss.is_none());
        for record in &report.records[1..] {
            assert!(record.train_loss.unwrap().is_finite());
        }
        for record in &report.records {
            assert!(record.validation_loss.unwrap().is_finite());
            assert!(record.sample.is_some());
        }
    }

    #[test]
    fn test_finetune_reports_validation_loss_and_sample() {
        let mut trainer = setup_trainer();
        let report = trainer.finetune().unwrap();
        assert_eq!(report.stage, Stage::Finetune);
        // 11 training examples in batches of 4: evaluations before steps 0 and 2, plus the final one.
        assert_eq!(report.records.len(), 3);
        let last = report.records.last().unwrap();
        assert_eq!(last.step, 3);
        assert!(last.train_loss.unwrap().is_finite());
        assert!(last.validation_loss.unwrap().is_finite());
        let sample = last.sample.as_ref().unwrap();
        assert!(!sample.contains("<RES>"), "prompt should be stripped: {}", sample);
    }

    #[test]
    fn test_alignment_starts_at_ln_two() {
        let (model, dataset) = setup();
        let mut aligner = Aligner::new(
            model,
            dataset,
            &training_config(),
            &AlignmentConfig::default(),
        )
        .unwrap();
        let report = aligner.align().unwrap();
        assert_eq!(report.stage, Stage::Align);
        let first = &report.records[0];
        assert!((first.validation_loss.unwrap() - std::f64::consts::LN_2).abs() < 1e-5);
        assert!(first.reward_margin.unwrap().abs() < 1e-6);
        let last = report.records.last().unwrap();
        assert!(last.train_loss.unwrap().is_finite());
        let (model, _) = aligner.into_parts();
        assert!(model.var_store().variables().values().all(|v| v.requires_grad()));
    }

    #[test]
    fn test_invalid_alignment_config_is_rejected() {
        let (model, dataset) = setup();
        let alignment = AlignmentConfig {
            positive_weight: 2.0,
            ..Default::default()
        };
        assert!(Aligner::new(model, dataset, &training_config(), &alignment).is_err());
    }
}
