//! Sigmoid focal binary cross-entropy over adjusted scores.
//!
//! The loss is computed as:
//! ```text
//! p      = sigmoid(x)
//! pt'    = (1 - p) * t + p * (1 - t)
//! loss   = bce_with_logits(x, t) * pt'^gamma
//! ```
//! where `bce_with_logits` uses the stable form `max(x, 0) - x*t + ln(1 + e^-|x|)`.

use std::{fmt, str::FromStr};

use burn::{
    module::Module,
    nn::loss::Reduction,
    tensor::{activation::sigmoid, backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TreeLossError};

/// How the elementwise loss is reduced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossReduction {
    /// Keep the full `[n, num_classes]` matrix.
    None,
    /// Arithmetic mean over every element.
    #[default]
    Mean,
    /// Sum over every element.
    Sum,
}

impl FromStr for LossReduction {
    type Err = TreeLossError;

    fn from_str(mode: &str) -> Result<Self> {
        match mode {
            "none" => Ok(Self::None),
            "mean" => Ok(Self::Mean),
            "sum" => Ok(Self::Sum),
            other => Err(TreeLossError::UnsupportedReduction {
                mode: other.to_owned(),
            }),
        }
    }
}

impl fmt::Display for LossReduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Mean => "mean",
            Self::Sum => "sum",
        })
    }
}

impl From<Reduction> for LossReduction {
    fn from(reduction: Reduction) -> Self {
        match reduction {
            Reduction::Mean | Reduction::Auto => Self::Mean,
            Reduction::Sum => Self::Sum,
        }
    }
}

/// Loss after reduction.
#[derive(Debug, Clone)]
pub enum ReducedLoss<B: Backend> {
    /// Unreduced loss, `[n, num_classes]`.
    Elementwise(Tensor<B, 2>),
    /// Mean or sum, `[1]`.
    Scalar(Tensor<B, 1>),
}

impl<B: Backend> ReducedLoss<B> {
    /// The reduced value, if a reduction was applied.
    pub fn scalar(self) -> Option<Tensor<B, 1>> {
        match self {
            Self::Scalar(loss) => Some(loss),
            Self::Elementwise(_) => None,
        }
    }

    /// The elementwise matrix, if no reduction was applied.
    pub fn elementwise(self) -> Option<Tensor<B, 2>> {
        match self {
            Self::Elementwise(loss) => Some(loss),
            Self::Scalar(_) => None,
        }
    }

    /// Scales the loss by a constant factor.
    pub fn mul_scalar(self, factor: f64) -> Self {
        match self {
            Self::Elementwise(loss) => Self::Elementwise(loss.mul_scalar(factor)),
            Self::Scalar(loss) => Self::Scalar(loss.mul_scalar(factor)),
        }
    }
}

/// Reduces an elementwise loss.
///
/// # Errors
///
/// Returns [`TreeLossError::EmptyReduction`] when the mean of an empty loss is
/// requested.
pub fn reduce<B: Backend>(loss: Tensor<B, 2>, reduction: LossReduction) -> Result<ReducedLoss<B>> {
    let is_empty = loss.dims().iter().any(|&dim| dim == 0);
    match reduction {
        LossReduction::None => Ok(ReducedLoss::Elementwise(loss)),
        LossReduction::Mean if is_empty => Err(TreeLossError::EmptyReduction),
        LossReduction::Mean => Ok(ReducedLoss::Scalar(loss.mean())),
        LossReduction::Sum if is_empty => Ok(ReducedLoss::Scalar(Tensor::zeros([1], &loss.device()))),
        LossReduction::Sum => Ok(ReducedLoss::Scalar(loss.sum())),
    }
}

/// Focal-weighted binary cross-entropy with logits.
#[derive(Module, Debug)]
pub struct FocalBceReducer<B: Backend> {
    /// Focusing exponent.
    pub gamma: f64,
    /// Per-class weights, `[num_classes]`, multiplied column-wise when present.
    pub class_weight: Option<Tensor<B, 1>>,
}

impl<B: Backend> FocalBceReducer<B> {
    /// Creates a reducer with focusing exponent `gamma`.
    pub fn new(gamma: f64, class_weight: Option<Tensor<B, 1>>) -> Self {
        assert!(
            gamma >= 0.0,
            "Gamma for FocalBceReducer must be non-negative, got {gamma}"
        );
        Self {
            gamma,
            class_weight,
        }
    }

    /// Compute the criterion with reduction.
    ///
    /// # Errors
    ///
    /// Returns [`TreeLossError::EmptyReduction`] for the mean of zero rows.
    pub fn forward(
        &self,
        adjusted: Tensor<B, 2>,
        target: Tensor<B, 2>,
        reduction: LossReduction,
    ) -> Result<ReducedLoss<B>> {
        reduce(self.forward_no_reduction(adjusted, target), reduction)
    }

    /// Compute the criterion without reduction.
    ///
    /// # Shapes
    ///
    /// - adjusted: `[n, num_classes]` (logits)
    /// - target: `[n, num_classes]` (0/1)
    /// - output: `[n, num_classes]`
    pub fn forward_no_reduction(&self, adjusted: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 2> {
        self.assertions(&adjusted, &target);

        let probs = sigmoid(adjusted.clone());
        let pt_complement = (probs.ones_like() - probs.clone()) * target.clone()
            + probs * (target.ones_like() - target.clone());
        let focal_weight = pt_complement.powf_scalar(self.gamma);

        // Numerically stable BCE with logits: max(x, 0) - x*t + log(1 + exp(-abs(x)))
        let bce = adjusted.clone().clamp_min(0.0) - adjusted.clone() * target
            + (-adjusted.abs()).exp().add_scalar(1.0).log();
        let loss = bce * focal_weight;

        match &self.class_weight {
            Some(weight) => loss * weight.clone().unsqueeze::<2>(),
            None => loss,
        }
    }

    fn assertions(&self, adjusted: &Tensor<B, 2>, target: &Tensor<B, 2>) {
        let adjusted_dims = adjusted.dims();
        let target_dims = target.dims();
        assert_eq!(
            adjusted_dims, target_dims,
            "Shape of adjusted scores ({adjusted_dims:?}) must match target ({target_dims:?})"
        );
        if let Some(weight) = &self.class_weight {
            let [num_weights] = weight.dims();
            assert_eq!(
                num_weights, adjusted_dims[1],
                "Class weight length ({num_weights}) must match the number of classes ({})",
                adjusted_dims[1]
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::tensor::{cast::ToElement, TensorData, Tolerance, Transaction};

    use super::*;
    use crate::tests::TestBackend;

    fn inputs() -> (Tensor<TestBackend, 2>, Tensor<TestBackend, 2>) {
        let device = Default::default();
        (
            Tensor::from_data([[2.0, -1.0, 0.5], [-3.0, 0.0, 4.0]], &device),
            Tensor::from_data([[1.0, 0.0, 1.0], [0.0, 1.0, 0.0]], &device),
        )
    }

    #[test]
    fn focal_bce_matches_closed_form_at_zero_logit() {
        let device = Default::default();
        let reducer = FocalBceReducer::<TestBackend>::new(2.0, None);

        let adjusted = Tensor::<TestBackend, 2>::from_data([[0.0, 0.0]], &device);
        let target = Tensor::<TestBackend, 2>::from_data([[1.0, 0.0]], &device);

        // p = 0.5 on both sides: 0.5^2 * ln 2
        let expected = 0.25 * std::f32::consts::LN_2;
        reducer
            .forward_no_reduction(adjusted, target)
            .into_data()
            .assert_approx_eq::<f32>(
                &TensorData::from([[expected, expected]]),
                Tolerance::default(),
            );
    }

    #[test]
    fn focal_bce_with_zero_gamma_is_plain_bce_with_logits() {
        let reducer = FocalBceReducer::<TestBackend>::new(0.0, None);
        let (adjusted, target) = inputs();

        let logits = adjusted.to_data().to_vec::<f32>().unwrap();
        let targets = target.to_data().to_vec::<f32>().unwrap();
        let expected: Vec<f32> = logits
            .iter()
            .zip(&targets)
            .map(|(&x, &t)| {
                let p = 1.0 / (1.0 + (-x).exp());
                -(t * p.ln() + (1.0 - t) * (1.0 - p).ln())
            })
            .collect();

        reducer
            .forward_no_reduction(adjusted, target)
            .into_data()
            .assert_approx_eq::<f32>(&TensorData::new(expected, [2, 3]), Tolerance::rel_abs(1e-4, 1e-5));
    }

    #[test]
    fn focal_weight_down_weights_confident_predictions() {
        let device = Default::default();
        let reducer = FocalBceReducer::<TestBackend>::new(2.0, None);
        let plain = FocalBceReducer::<TestBackend>::new(0.0, None);

        let adjusted = Tensor::<TestBackend, 2>::from_data([[4.0]], &device);
        let target = Tensor::<TestBackend, 2>::from_data([[1.0]], &device);

        let focal = reducer
            .forward_no_reduction(adjusted.clone(), target.clone())
            .into_scalar()
            .to_f64();
        let bce = plain.forward_no_reduction(adjusted, target).into_scalar().to_f64();
        assert!(focal < bce * 0.01, "focal {focal} vs bce {bce}");
    }

    #[test]
    fn reduction_mean_and_sum_agree_with_unreduced_loss() {
        let reducer = FocalBceReducer::<TestBackend>::new(2.0, None);
        let (adjusted, target) = inputs();

        let none = reducer
            .forward(adjusted.clone(), target.clone(), LossReduction::None)
            .unwrap()
            .elementwise()
            .unwrap();
        let mean = reducer
            .forward(adjusted.clone(), target.clone(), LossReduction::Mean)
            .unwrap()
            .scalar()
            .unwrap();
        let sum = reducer
            .forward(adjusted, target, LossReduction::Sum)
            .unwrap()
            .scalar()
            .unwrap();

        let [mean_data, expected_mean, sum_data, expected_sum] = Transaction::default()
            .register(mean)
            .register(none.clone().mean())
            .register(sum)
            .register(none.sum())
            .execute()
            .try_into()
            .expect("Correct amount of tensor data");

        mean_data.assert_approx_eq::<f32>(&expected_mean, Tolerance::default());
        sum_data.assert_approx_eq::<f32>(&expected_sum, Tolerance::default());
    }

    #[test]
    fn class_weight_scales_each_column() {
        let device = Default::default();
        let (adjusted, target) = inputs();
        let plain = FocalBceReducer::<TestBackend>::new(2.0, None);
        let weighted = FocalBceReducer::<TestBackend>::new(
            2.0,
            Some(Tensor::from_data([1.0, 0.0, 2.0], &device)),
        );

        let expected = plain.forward_no_reduction(adjusted.clone(), target.clone())
            * Tensor::<TestBackend, 2>::from_data([[1.0, 0.0, 2.0]], &device);
        weighted
            .forward_no_reduction(adjusted, target)
            .into_data()
            .assert_approx_eq::<f32>(&expected.into_data(), Tolerance::default());
    }

    #[test]
    fn reduce_mean_of_empty_loss_fails() {
        let device = Default::default();
        let loss = Tensor::<TestBackend, 2>::zeros([0, 3], &device);

        let err = reduce(loss, LossReduction::Mean).unwrap_err();
        assert!(matches!(err, TreeLossError::EmptyReduction));
    }

    #[test]
    fn reduce_sum_of_empty_loss_is_zero() {
        let device = Default::default();
        let loss = Tensor::<TestBackend, 2>::zeros([0, 3], &device);

        let sum = reduce(loss, LossReduction::Sum).unwrap().scalar().unwrap();
        assert_eq!(sum.into_scalar().to_f64(), 0.0);
    }

    #[test]
    fn reduction_parses_supported_modes_only() {
        assert_eq!("none".parse::<LossReduction>().unwrap(), LossReduction::None);
        assert_eq!("mean".parse::<LossReduction>().unwrap(), LossReduction::Mean);
        assert_eq!("sum".parse::<LossReduction>().unwrap(), LossReduction::Sum);

        let err = "avg".parse::<LossReduction>().unwrap_err();
        assert!(matches!(err, TreeLossError::UnsupportedReduction { mode } if mode == "avg"));
    }

    #[test]
    fn reduction_deserialization_rejects_unknown_mode() {
        let parsed: LossReduction = serde_json::from_str("\"sum\"").unwrap();
        assert_eq!(parsed, LossReduction::Sum);
        assert!(serde_json::from_str::<LossReduction>("\"max\"").is_err());
    }

    #[test]
    fn burn_reduction_maps_auto_to_mean() {
        assert_eq!(LossReduction::from(Reduction::Auto), LossReduction::Mean);
        assert_eq!(LossReduction::from(Reduction::Sum), LossReduction::Sum);
    }

    #[test]
    #[should_panic = "Gamma for FocalBceReducer must be non-negative"]
    fn reducer_negative_gamma_panics() {
        let _ = FocalBceReducer::<TestBackend>::new(-1.0, None);
    }
}
