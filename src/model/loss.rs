//! Detection objective: smooth-L1 box regression plus focal classification.
//!
//! Targets follow the usual encoder contract: label `> 0` is a positive anchor
//! of that (1-based) class, `0` is background and `-1` is ignored. Ignored
//! anchors take part in neither term; box targets are read at positives only.

use burn::prelude::*;
use burn::tensor::activation::sigmoid;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ALPHA: f32 = 0.25;
pub const GAMMA: f32 = 2.0;
pub const DEFAULT_EPS: f32 = 1e-7;

/// Which focal-loss formulation scores the classification term.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FocalVariant {
    /// `w * BCEWithLogits(x, t)` with `w = alpha_t * (1 - p_t)^gamma`.
    Direct,
    /// `-alpha_t * log(clamp(sigmoid(2 x_t + 1), eps, 1 - eps)) / 2`.
    Clamped { eps: f32 },
}

impl Default for FocalVariant {
    fn default() -> Self {
        FocalVariant::Clamped { eps: DEFAULT_EPS }
    }
}

impl FocalVariant {
    /// Elementwise loss for logits `x` against one-hot targets `t`.
    pub fn apply<B: Backend, const D: usize>(self, x: Tensor<B, D>, t: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            FocalVariant::Direct => focal_loss_direct(x, t),
            FocalVariant::Clamped { eps } => focal_loss_clamped(x, t, eps),
        }
    }
}

/// What to do when the combined loss is NaN or infinite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NanPolicy {
    /// Log a warning and hand the loss back to the caller.
    #[default]
    Warn,
    /// Return [`LossError::NonFinite`].
    Fail,
}

#[derive(Debug, Error, PartialEq)]
pub enum LossError {
    #[error("{name} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        name: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("labels span [{min}, {max}], expected values in [-1, {num_classes}]")]
    LabelOutOfRange {
        min: i64,
        max: i64,
        num_classes: usize,
    },
    #[error("loss is not finite ({value}): loc_loss={loc_loss}, cls_loss={cls_loss}")]
    NonFinite {
        value: f32,
        loc_loss: f32,
        cls_loss: f32,
    },
}

/// Running record of reported losses.
///
/// Owned by whoever drives the loss; reset it between runs. There is no
/// internal locking, so workers training in parallel need one instance each
/// or their own synchronization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossDiagnostics {
    loss_total: f64,
    rounds: u64,
    non_finite: u64,
}

impl LossDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a finite loss; non-finite values are counted but kept out of the average.
    pub fn record(&mut self, loss: f32) {
        if loss.is_finite() {
            self.loss_total += loss as f64;
            self.rounds += 1;
        } else {
            self.non_finite += 1;
        }
    }

    /// Arithmetic mean of every recorded loss, 0 before the first.
    pub fn running_average(&self) -> f64 {
        if self.rounds == 0 {
            0.0
        } else {
            self.loss_total / self.rounds as f64
        }
    }

    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    pub fn non_finite(&self) -> u64 {
        self.non_finite
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Result of one loss evaluation.
#[derive(Debug, Clone)]
pub struct LossOutput<B: Backend> {
    /// Scalar loss `[1]`, still attached to the graph.
    pub loss: Tensor<B, 1>,
    /// Localization term per positive anchor per image.
    pub loc_loss: f32,
    /// Classification term per positive anchor per image.
    pub cls_loss: f32,
    /// Positive anchor count, floored at 1.
    pub num_positive: usize,
    /// Running mean of the loss after this call.
    pub running_average: f64,
}

#[derive(Debug, Clone)]
pub struct FocalLoss {
    num_classes: usize,
    variant: FocalVariant,
    nan_policy: NanPolicy,
}

impl FocalLoss {
    pub fn new(num_classes: usize, variant: FocalVariant, nan_policy: NanPolicy) -> Self {
        assert!(num_classes > 0, "num_classes must be at least 1");
        log::info!(
            "FocalLoss init: num_classes = {}, variant = {:?}, nan_policy = {:?}",
            num_classes,
            variant,
            nan_policy
        );
        Self {
            num_classes,
            variant,
            nan_policy,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn variant(&self) -> FocalVariant {
        self.variant
    }

    /// `(loc_loss + cls_loss) / num_positive / batch_size`.
    ///
    /// * `loc_preds`, `loc_targets`: `[N, A, 4]`
    /// * `cls_preds`: `[N, A, C]` logits
    /// * `cls_targets`: `[N, A]` labels in `-1..=C`
    pub fn forward<B: Backend>(
        &self,
        loc_preds: Tensor<B, 3>,
        loc_targets: Tensor<B, 3>,
        cls_preds: Tensor<B, 3>,
        cls_targets: Tensor<B, 2, Int>,
        diagnostics: &mut LossDiagnostics,
    ) -> Result<LossOutput<B>, LossError> {
        self.check_shapes(&loc_preds, &loc_targets, &cls_preds, &cls_targets)?;
        self.check_labels(&cls_targets)?;
        let [batch_size, _] = cls_targets.dims();

        let num_positive = count_positive(cls_targets.clone()).max(1);

        let loc_sum = localization_loss(loc_preds, loc_targets, cls_targets.clone());
        let cls_sum = self.classification_loss(cls_preds, cls_targets);

        let loc_term = loc_sum / num_positive as f32;
        let cls_term = cls_sum / num_positive as f32;
        let loss = (loc_term.clone() + cls_term.clone()) / batch_size as f32;

        let value = scalar(loss.clone());
        let loc_loss = scalar(loc_term) / batch_size as f32;
        let cls_loss = scalar(cls_term) / batch_size as f32;

        diagnostics.record(value);
        let running_average = diagnostics.running_average();

        log::debug!(
            "loc_loss: {:.4} | cls_loss: {:.4} | avg_loss: {:.4} (num_pos = {}, batch = {})",
            loc_loss,
            cls_loss,
            running_average,
            num_positive,
            batch_size
        );

        if !value.is_finite() {
            log::warn!(
                "non-finite loss {} (loc_loss = {}, cls_loss = {}, variant = {:?})",
                value,
                loc_loss,
                cls_loss,
                self.variant
            );
            if self.nan_policy == NanPolicy::Fail {
                return Err(LossError::NonFinite {
                    value,
                    loc_loss,
                    cls_loss,
                });
            }
        }

        Ok(LossOutput {
            loss,
            loc_loss,
            cls_loss,
            num_positive,
            running_average,
        })
    }

    /// Summed focal loss over non-ignored anchors.
    pub fn classification_loss<B: Backend>(
        &self,
        cls_preds: Tensor<B, 3>,
        cls_targets: Tensor<B, 2, Int>,
    ) -> Tensor<B, 1> {
        let [batch, anchors, classes] = cls_preds.dims();

        let ignored = cls_targets
            .clone()
            .lower_elem(0)
            .reshape([batch, anchors, 1])
            .repeat_dim(2, classes);
        let targets = encode_labels(cls_targets, self.num_classes);

        // Zero the logits first so ignored rows cannot produce NaN either.
        let logits = cls_preds.mask_fill(ignored.clone(), 0.0);
        self.variant
            .apply(logits, targets)
            .mask_fill(ignored, 0.0)
            .sum()
    }

    fn check_shapes<B: Backend>(
        &self,
        loc_preds: &Tensor<B, 3>,
        loc_targets: &Tensor<B, 3>,
        cls_preds: &Tensor<B, 3>,
        cls_targets: &Tensor<B, 2, Int>,
    ) -> Result<(), LossError> {
        let [batch, anchors] = cls_targets.dims();

        let check = |name: &'static str, actual: Vec<usize>, expected: Vec<usize>| {
            if actual == expected {
                Ok(())
            } else {
                Err(LossError::ShapeMismatch {
                    name,
                    expected,
                    actual,
                })
            }
        };

        check("loc_preds", loc_preds.dims().to_vec(), vec![batch, anchors, 4])?;
        check("loc_targets", loc_targets.dims().to_vec(), vec![batch, anchors, 4])?;
        check(
            "cls_preds",
            cls_preds.dims().to_vec(),
            vec![batch, anchors, self.num_classes],
        )
    }

    /// Labels must lie in `-1..=num_classes`; anything else would be counted
    /// as positive yet encode to an all-background row.
    fn check_labels<B: Backend>(&self, cls_targets: &Tensor<B, 2, Int>) -> Result<(), LossError> {
        let min = cls_targets.clone().min().into_scalar().elem::<i64>();
        let max = cls_targets.clone().max().into_scalar().elem::<i64>();

        if min < -1 || max > self.num_classes as i64 {
            return Err(LossError::LabelOutOfRange {
                min,
                max,
                num_classes: self.num_classes,
            });
        }
        Ok(())
    }
}

/// Number of anchors with label > 0.
pub fn count_positive<B: Backend>(cls_targets: Tensor<B, 2, Int>) -> usize {
    let count = cls_targets
        .greater_elem(0)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>();
    count.max(0) as usize
}

/// Smooth L1 (beta = 1) summed over positive anchors only.
pub fn localization_loss<B: Backend>(
    loc_preds: Tensor<B, 3>,
    loc_targets: Tensor<B, 3>,
    cls_targets: Tensor<B, 2, Int>,
) -> Tensor<B, 1> {
    let [batch, anchors, dim] = loc_preds.dims();
    let not_positive = cls_targets
        .lower_equal_elem(0)
        .reshape([batch, anchors, 1])
        .repeat_dim(2, dim);

    // Targets at non-positive anchors are undefined; mask before the loss.
    let diff = (loc_preds - loc_targets).mask_fill(not_positive, 0.0);
    smooth_l1(diff).sum()
}

/// `0.5 d^2` where `|d| < 1`, otherwise `|d| - 0.5`.
pub fn smooth_l1<B: Backend, const D: usize>(diff: Tensor<B, D>) -> Tensor<B, D> {
    let abs = diff.abs();
    let quadratic = abs.clone().lower_elem(1.0);
    let linear = abs.clone() - 0.5;
    linear.mask_where(quadratic, abs.clone() * abs * 0.5)
}

/// `labels [M]` -> `[M, num_classes]` rows with a single 1 at the label.
///
/// Labels outside `0..num_classes` (the ignore label -1 in particular)
/// produce an all-zero row.
pub fn one_hot_embedding<B: Backend>(labels: Tensor<B, 1, Int>, num_classes: usize) -> Tensor<B, 2> {
    let [m] = labels.dims();
    let classes = Tensor::<B, 1, Int>::arange(0..num_classes as i64, &labels.device())
        .reshape([1, num_classes])
        .repeat_dim(0, m);

    labels
        .reshape([m, 1])
        .repeat_dim(1, num_classes)
        .equal(classes)
        .float()
}

/// `[N, A]` labels -> `[N, A, C]` one-hot targets with background dropped.
pub fn encode_labels<B: Backend>(labels: Tensor<B, 2, Int>, num_classes: usize) -> Tensor<B, 3> {
    let [batch, anchors] = labels.dims();
    let rows = batch * anchors;

    one_hot_embedding(labels.reshape([rows]), num_classes + 1)
        .narrow(1, 1, num_classes)
        .reshape([batch, anchors, num_classes])
}

/// Direct focal loss: alpha- and `(1 - p_t)^gamma`-weighted BCE with logits.
pub fn focal_loss_direct<B: Backend, const D: usize>(x: Tensor<B, D>, t: Tensor<B, D>) -> Tensor<B, D> {
    let not_t = t.clone().neg() + 1.0;

    let p = sigmoid(x.clone());
    let p_t = p.clone() * t.clone() + (p.neg() + 1.0) * not_t.clone();
    let w = t.clone() * ALPHA + not_t * (1.0 - ALPHA);
    let w = w * (p_t.neg() + 1.0).powf_scalar(GAMMA);

    // max(x, 0) - x t + log(1 + exp(-|x|))
    let bce = x.clone().clamp_min(0.0) - x.clone() * t + x.abs().neg().exp().log1p();
    w * bce
}

/// Focal loss through `x_t = x (2t - 1)` and a clamped log.
pub fn focal_loss_clamped<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    t: Tensor<B, D>,
    eps: f32,
) -> Tensor<B, D> {
    let x_t = x * (t.clone() * 2.0 - 1.0);
    let p_t = sigmoid(x_t * 2.0 + 1.0);
    let w = t.clone() * ALPHA + (t.neg() + 1.0) * (1.0 - ALPHA);

    (w * p_t.clamp(eps, 1.0 - eps).log()).neg() / 2.0
}

fn scalar<B: Backend>(x: Tensor<B, 1>) -> f32 {
    x.into_scalar().elem::<f32>()
}
