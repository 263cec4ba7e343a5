use std::{path::Path, rc::Rc};

use anyhow::{Result, bail};
use tch::{Device, IndexOp, Kind::Float, Tensor};
use tracing::warn;

use crate::{checkpoint, constants::EOS_TOKEN, model::LanguageModel, tokenizer::Tokenizer};

/// Streams completions from a saved checkpoint, one character at a time.
pub struct Generator {
    model: Rc<LanguageModel>,
    tokenizer: Tokenizer,
    temperature: f64,
    max_length: usize,
}

impl Generator {
    pub fn new(checkpoint_dir: &Path, device: Device) -> Result<Generator> {
        let (model, tokenizer) = checkpoint::load(checkpoint_dir, device)?;
        Ok(Generator::from_model(model, tokenizer))
    }

    pub fn from_model(model: LanguageModel, tokenizer: Tokenizer) -> Generator {
        Generator {
            model: Rc::new(model),
            tokenizer,
            temperature: 1.0,
            max_length: 2048,
        }
    }

    pub fn set_temperature(&mut self, temperature: f64) -> Result<()> {
        if !temperature.is_finite() || temperature <= 0.0 {
            bail!("temperature must be positive, got {}", temperature);
        }
        self.temperature = temperature;
        Ok(())
    }

    /// Upper bound on generated characters per response.
    pub fn set_max_length(&mut self, max_length: usize) {
        self.max_length = max_length;
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn prompt(&self, prompt: &str) -> Result<Response> {
        // Turn the prompt into a sequence of tokens
        let prompt_tokens = self.tokenizer.encode(prompt)?;
        if prompt_tokens.is_empty() {
            bail!("prompt is empty");
        }
        // Turn the tokens into a 1D tensor [seq_len], then unsqueeze to [batch, seq_len]
        let prompt_tensor = Tensor::from_slice(&prompt_tokens)
            .to_device(self.model.device())
            .unsqueeze(0);
        // Long prompts keep only their last max_length tokens.
        let len = prompt_tensor.size()[1];
        let context = self.model.config().max_length.min(len);
        let prompt_tensor = prompt_tensor.narrow(1, len - context, context);
        Ok(Response {
            // Disable gradient tracking since we're not training now.
            _no_grad_guard: tch::no_grad_guard(),
            model: self.model.clone(),
            tokenizer: self.tokenizer.clone(),
            response_length: 0,
            window_tensor: prompt_tensor,
            temperature: self.temperature,
            max_length: self.max_length,
        })
    }
}

pub struct Response {
    _no_grad_guard: tch::NoGradGuard,
    model: Rc<LanguageModel>,
    tokenizer: Tokenizer,
    response_length: usize,
    window_tensor: Tensor,
    temperature: f64,
    max_length: usize,
}

impl Response {
    fn sample(&mut self) -> Result<i64> {
        // Get the logits (raw prediction) from the model as 3D [1, seq_len, vocab_size]
        let (model_logits, _) = self.model.forward(&self.window_tensor, None)?;
        // Get the final logit (predicts next token) [vocab_size]
        let final_window_logit = model_logits.i((0, -1, ..));
        let temp_adjusted_logit = final_window_logit / self.temperature;
        let softmaxed_logit = temp_adjusted_logit.softmax(-1, Float);
        let sampled_token_tensor = softmaxed_logit.multinomial(1, false);
        let sampled_token = i64::try_from(&sampled_token_tensor)?;
        if sampled_token != EOS_TOKEN {
            // Append the token, keeping at most max_length tokens of context.
            let window = Tensor::cat(&[&self.window_tensor, &sampled_token_tensor.unsqueeze(0)], 1);
            let len = window.size()[1];
            let context = self.model.config().max_length;
            self.window_tensor = if len > context {
                window.narrow(1, len - context, context)
            } else {
                window
            };
        }
        Ok(sampled_token)
    }
}

impl Iterator for Response {
    type Item = char;

    fn next(&mut self) -> Option<Self::Item> {
        if self.response_length >= self.max_length {
            return None;
        }
        self.response_length += 1;
        let token = match self.sample() {
            Ok(token) => token,
            Err(err) => {
                warn!("generation stopped: {}", err);
                return None;
            }
        };
        // Break if it's EOS.
        if token == EOS_TOKEN {
            self.max_length = 0;
            return None;
        }
        decode_token(&self.tokenizer, token)
    }
}

fn decode_token(tokenizer: &Tokenizer, token: i64) -> Option<char> {
    match tokenizer.decode(&[token]) {
        Ok(text) => text.chars().next(),
        Err(err) => {
            warn!("generation stopped: {}", err);
            None
        }
    }
}
