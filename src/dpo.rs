//! Direct Preference Optimization over a pair of language models.
//!
//! The wrapper owns the model being aligned and a frozen copy of it taken at
//! construction. Rewards measure how far the aligned model has moved away from
//! the reference: towards preferred continuations (lower loss than the
//! reference) and away from dispreferred ones (higher loss than the reference).

use tch::{Kind, Tensor};

use crate::{
    config::validate_dpo_parameters,
    error::{Error, Result},
    model::LanguageModel,
};

/// Output of one DPO forward pass.
#[derive(Debug)]
pub struct DpoLoss {
    /// Scalar training loss, differentiable w.r.t. the aligned model.
    pub loss: Tensor,
    /// Mean reward margin over all tokens, as a scalar.
    pub reward_margin: Tensor,
}

pub struct DpoWrapper {
    aligned: LanguageModel,
    reference: LanguageModel,
    beta: f64,
    positive_weight: f64,
}

impl DpoWrapper {
    /// Wraps `model` for alignment. `beta` scales the margin inside the
    /// sigmoid; `positive_weight` in [0, 1] is the share of the preferred-sample
    /// reward in the margin, the rest going to the dispreferred-sample reward.
    pub fn new(model: LanguageModel, beta: f64, positive_weight: f64) -> Result<Self> {
        validate_dpo_parameters(beta, positive_weight)?;
        let mut reference = model.try_clone()?;
        reference.freeze();
        Ok(DpoWrapper {
            aligned: model,
            reference,
            beta,
            positive_weight,
        })
    }

    pub fn aligned(&self) -> &LanguageModel {
        &self.aligned
    }

    pub fn reference(&self) -> &LanguageModel {
        &self.reference
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn positive_weight(&self) -> f64 {
        self.positive_weight
    }

    /// Gives back the aligned model, dropping the reference.
    pub fn into_aligned(self) -> LanguageModel {
        self.aligned
    }

    /// [`forward_t`](Self::forward_t) with the aligned model in eval mode.
    pub fn forward(
        &self,
        positive_token_ids: &Tensor,
        positive_targets: &Tensor,
        negative_token_ids: &Tensor,
        negative_targets: &Tensor,
    ) -> Result<DpoLoss> {
        self.forward_t(
            positive_token_ids,
            positive_targets,
            negative_token_ids,
            negative_targets,
            false,
        )
    }

    /// Computes the DPO loss for paired batches of preferred ("positive") and
    /// dispreferred ("negative") sequences. Both batches must have the same
    /// shape since rewards are combined token by token.
    pub fn forward_t(
        &self,
        positive_token_ids: &Tensor,
        positive_targets: &Tensor,
        negative_token_ids: &Tensor,
        negative_targets: &Tensor,
        train: bool,
    ) -> Result<DpoLoss> {
        if positive_token_ids.size() != negative_token_ids.size() {
            return Err(Error::ShapeMismatch {
                expected: positive_token_ids.size(),
                actual: negative_token_ids.size(),
            });
        }
        // Per-token losses, [batch * seq_len] each.
        let positive_loss =
            per_token_loss(&self.aligned, positive_token_ids, positive_targets, train)?;
        let negative_loss =
            per_token_loss(&self.aligned, negative_token_ids, negative_targets, train)?;
        let (reference_positive_loss, reference_negative_loss) = tch::no_grad(|| {
            Ok::<_, Error>((
                per_token_loss(&self.reference, positive_token_ids, positive_targets, false)?,
                per_token_loss(&self.reference, negative_token_ids, negative_targets, false)?,
            ))
        })?;

        // Doing better than the reference on preferred data is rewarded...
        let positive_reward = reference_positive_loss - positive_loss;
        // ...and so is doing worse than the reference on dispreferred data.
        let negative_reward = negative_loss - reference_negative_loss;
        let reward_margin = positive_reward * self.positive_weight
            + negative_reward * (1.0 - self.positive_weight);
        let loss = -(&reward_margin * self.beta)
            .log_sigmoid()
            .mean(Kind::Float);
        Ok(DpoLoss {
            loss,
            reward_margin: reward_margin.mean(Kind::Float),
        })
    }
}

fn per_token_loss(
    model: &LanguageModel,
    token_ids: &Tensor,
    targets: &Tensor,
    train: bool,
) -> Result<Tensor> {
    let (_, loss) = model.forward_t(token_ids, Some(targets), false, train)?;
    loss.ok_or(Error::EmptySequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use std::collections::HashMap;
    use tch::{
        Device,
        nn::{OptimizerConfig, Sgd},
    };

    fn fresh_model() -> LanguageModel {
        LanguageModel::new(&ModelConfig::new(5, 8, 4, 2, 1), Device::Cpu).unwrap()
    }

    fn pair() -> (Tensor, Tensor, Tensor, Tensor) {
        (
            Tensor::from_slice2(&[&[1i64, 2, 3, 4], &[2, 3, 4, 1]]),
            Tensor::from_slice2(&[&[2i64, 3, 4, 0], &[3, 4, 1, 0]]),
            Tensor::from_slice2(&[&[1i64, 2, 3, 4], &[2, 3, 4, 1]]),
            Tensor::from_slice2(&[&[4i64, 4, 4, 4], &[1, 1, 1, 1]]),
        )
    }

    #[test]
    fn test_invalid_hyperparameters() {
        assert!(matches!(
            DpoWrapper::new(fresh_model(), 0.1, 1.5),
            Err(Error::PositiveWeightOutOfRange(_))
        ));
        assert!(matches!(
            DpoWrapper::new(fresh_model(), -1.0, 0.5),
            Err(Error::InvalidBeta(_))
        ));
    }

    #[test]
    fn test_fresh_wrapper_has_zero_margin() {
        let dpo = DpoWrapper::new(fresh_model(), 0.1, 0.8).unwrap();
        let (pos_ids, pos_targets, neg_ids, neg_targets) = pair();
        let output = dpo
            .forward(&pos_ids, &pos_targets, &neg_ids, &neg_targets)
            .unwrap();
        let margin = f64::try_from(&output.reward_margin).unwrap();
        let loss = f64::try_from(&output.loss).unwrap();
        assert!(margin.abs() < 1e-6, "margin should be ~0, got {}", margin);
        assert!(
            (loss - std::f64::consts::LN_2).abs() < 1e-5,
            "loss should be ~ln 2, got {}",
            loss
        );
    }

    #[test]
    fn test_loss_and_margin_follow_rewards() {
        tch::manual_seed(3);
        let dpo = DpoWrapper::new(fresh_model(), 0.1, 0.8).unwrap();
        assert_eq!(dpo.beta(), 0.1);
        assert_eq!(dpo.positive_weight(), 0.8);
        // Move the aligned model away from the reference.
        tch::no_grad(|| {
            for (_, mut variable) in dpo.aligned().var_store().variables() {
                let noise = variable.randn_like() * 0.5;
                let _ = variable.g_add_(&noise);
            }
        });
        let (pos_ids, pos_targets, neg_ids, neg_targets) = pair();
        let output = dpo
            .forward(&pos_ids, &pos_targets, &neg_ids, &neg_targets)
            .unwrap();

        let token_losses = |model: &LanguageModel, ids: &Tensor, targets: &Tensor| {
            let (_, loss) = model.forward_t(ids, Some(targets), false, false).unwrap();
            loss.unwrap()
        };
        let aligned_pos = token_losses(dpo.aligned(), &pos_ids, &pos_targets);
        let aligned_neg = token_losses(dpo.aligned(), &neg_ids, &neg_targets);
        let reference_pos = token_losses(dpo.reference(), &pos_ids, &pos_targets);
        let reference_neg = token_losses(dpo.reference(), &neg_ids, &neg_targets);
        let margin = (reference_pos - aligned_pos) * 0.8 + (aligned_neg - reference_neg) * 0.2;
        let expected_loss = -(&margin * 0.1).log_sigmoid().mean(Kind::Float);
        let expected_margin = f64::try_from(&margin.mean(Kind::Float)).unwrap();
        let expected_loss = f64::try_from(&expected_loss).unwrap();

        let actual_margin = f64::try_from(&output.reward_margin).unwrap();
        let actual_loss = f64::try_from(&output.loss).unwrap();
        assert!(expected_margin.abs() > 1e-3, "models should differ, margin {}", expected_margin);
        assert!(
            (actual_margin - expected_margin).abs() < 1e-6,
            "margin {} != {}",
            actual_margin,
            expected_margin
        );
        assert!(
            (actual_loss - expected_loss).abs() < 1e-6,
            "loss {} != {}",
            actual_loss,
            expected_loss
        );
    }

    #[test]
    fn test_identical_batches_give_ln_two() {
        let dpo = DpoWrapper::new(fresh_model(), 0.1, 0.8).unwrap();
        let (ids, targets, _, _) = pair();
        let output = dpo.forward(&ids, &targets, &ids, &targets).unwrap();
        let loss = f64::try_from(&output.loss).unwrap();
        assert!((loss - 0.693).abs() < 1e-3);
    }

    #[test]
    fn test_reference_is_frozen() {
        let dpo = DpoWrapper::new(fresh_model(), 0.1, 0.8).unwrap();
        for (name, variable) in dpo.reference().var_store().variables() {
            assert!(!variable.requires_grad(), "{} is not frozen", name);
        }
        for (name, variable) in dpo.aligned().var_store().variables() {
            assert!(variable.requires_grad(), "{} is frozen", name);
        }
    }

    #[test]
    fn test_loss_only_reaches_aligned_model() {
        let dpo = DpoWrapper::new(fresh_model(), 0.1, 0.8).unwrap();
        let (pos_ids, pos_targets, neg_ids, neg_targets) = pair();
        let output = dpo
            .forward_t(&pos_ids, &pos_targets, &neg_ids, &neg_targets, true)
            .unwrap();
        output.loss.backward();
        let aligned_grads = dpo
            .aligned()
            .var_store()
            .trainable_variables()
            .iter()
            .filter(|v| v.grad().defined())
            .count();
        assert!(aligned_grads > 0);
        for (name, variable) in dpo.reference().var_store().variables() {
            assert!(!variable.grad().defined(), "{} received a gradient", name);
        }
    }

    #[test]
    fn test_training_moves_margin_up_and_leaves_reference() {
        tch::manual_seed(11);
        let dpo = DpoWrapper::new(fresh_model(), 1.0, 0.5).unwrap();
        let mut optimizer = Sgd::default()
            .build(dpo.aligned().var_store(), 0.1)
            .unwrap();
        let (pos_ids, pos_targets, neg_ids, neg_targets) = pair();
        let reference_before: HashMap<String, Tensor> = dpo
            .reference()
            .var_store()
            .variables()
            .into_iter()
            .map(|(name, v)| (name, v.copy()))
            .collect();

        let mut margin = 0.0;
        for _ in 0..20 {
            let output = dpo
                .forward_t(&pos_ids, &pos_targets, &neg_ids, &neg_targets, true)
                .unwrap();
            optimizer.backward_step(&output.loss);
            margin = f64::try_from(&output.reward_margin).unwrap();
        }
        assert!(margin > 0.0, "margin should grow, got {}", margin);

        for (name, after) in dpo.reference().var_store().variables() {
            let before = &reference_before[&name];
            let diff = f64::try_from(&(before - &after).abs().max()).unwrap();
            assert_eq!(diff, 0.0, "{} changed during alignment", name);
        }
    }

    #[test]
    fn test_mismatched_pairs_are_rejected() {
        let dpo = DpoWrapper::new(fresh_model(), 0.1, 0.8).unwrap();
        let (pos_ids, pos_targets, _, _) = pair();
        let short = Tensor::from_slice2(&[&[1i64, 2], &[2, 3]]);
        assert!(matches!(
            dpo.forward(&pos_ids, &pos_targets, &short, &short),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
