//! Focal tree-min loss for hierarchical semantic segmentation.
//!
//! Ties the pipeline together for `[batch, classes, height, width]` logits and
//! `[batch, height, width]` labels:
//!
//! ```text
//! labels  --LabelExpander-->  multi-hot target
//! logits  --flatten, keep-->  raw scores --TreeScoreAggregator--> adjusted scores
//! Loss = loss_weight * reduce(focal_bce(adjusted scores, target))
//! ```

use std::{collections::HashMap, path::Path, sync::Arc};

use burn::{
    config::Config,
    module::{Content, DisplaySettings, Ignored, Module, ModuleDisplay},
    nn::loss::Reduction,
    tensor::{backend::Backend, cast::ToElement, Int, Tensor},
};

use crate::{
    aggregate::TreeScoreAggregator,
    class_weight::ClassWeights,
    error::{Result, TreeLossError},
    focal::{reduce, FocalBceReducer, LossReduction, ReducedLoss},
    hierarchy::HierarchyTables,
    label::{ExpandedLabels, LabelExpander},
    resource::HierarchySource,
};

/// Configuration for creating a [focal tree-min loss](FocalTreeMinLoss).
#[derive(Config, Debug)]
pub struct FocalTreeMinLossConfig {
    /// Focusing exponent of the focal weight. Default: 2.0
    #[config(default = 2.0)]
    pub gamma: f64,

    /// Reduction applied when no override is given. Default: mean
    #[config(default = "LossReduction::Mean")]
    pub reduction: LossReduction,

    /// Factor applied to the final loss; 0 disables the loss item. Default: 1.0
    #[config(default = 1.0)]
    pub loss_weight: f64,

    /// Name of the loss item when several losses are combined.
    #[config(default = "String::from(\"loss_tree_min\")")]
    pub loss_name: String,

    /// Label value excluded from the loss. Default: -100
    #[config(default = "-100")]
    pub ignore_index: i64,

    /// Multiply the class weights into the elementwise loss before reduction.
    #[config(default = false)]
    pub apply_class_weight: bool,
}

impl FocalTreeMinLossConfig {
    /// Initialize a [focal tree-min loss](FocalTreeMinLoss) sharing `tables`.
    ///
    /// # Errors
    ///
    /// Returns [`TreeLossError::ClassWeightLength`] if the class weights do not
    /// hold one weight per class.
    pub fn init<B: Backend>(
        &self,
        tables: Arc<HierarchyTables>,
        class_weights: Option<&ClassWeights>,
        device: &B::Device,
    ) -> Result<FocalTreeMinLoss<B>> {
        self.assertions();

        let class_weight = match class_weights {
            Some(weights) => {
                weights.validate(tables.num_classes())?;
                if self.apply_class_weight {
                    Some(weights.to_tensor(device))
                } else {
                    tracing::warn!(
                        loss = %self.loss_name,
                        "class weights are loaded but not applied; set apply_class_weight to use them"
                    );
                    None
                }
            }
            None => {
                if self.apply_class_weight {
                    tracing::warn!(
                        loss = %self.loss_name,
                        "apply_class_weight is set but no class weights were provided"
                    );
                }
                None
            }
        };

        tracing::info!(
            loss = %self.loss_name,
            gamma = self.gamma,
            reduction = %self.reduction,
            num_classes = tables.num_classes(),
            weighted = class_weight.is_some(),
            "initialized focal tree-min loss"
        );

        Ok(FocalTreeMinLoss {
            aggregator: TreeScoreAggregator::new(&tables, device),
            reducer: FocalBceReducer::new(self.gamma, class_weight),
            tables: Ignored(tables),
            reduction: Ignored(self.reduction),
            loss_weight: self.loss_weight,
            loss_name: Ignored(self.loss_name.clone()),
            ignore_index: Ignored(self.ignore_index),
        })
    }

    /// Load the hierarchy resources and initialize the loss.
    ///
    /// # Errors
    ///
    /// Returns an error if a resource cannot be loaded or the hierarchy is
    /// malformed.
    pub fn init_from_source<B: Backend>(
        &self,
        source: &HierarchySource,
        device: &B::Device,
    ) -> Result<FocalTreeMinLoss<B>> {
        let tables = Arc::new(source.load_tables()?);
        let class_weights = source.load_class_weights()?;
        self.init(tables, class_weights.as_ref(), device)
    }

    /// Load the loss configuration and the hierarchy resources from JSON files.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read or parsed, or the hierarchy is
    /// malformed.
    pub fn init_from_files<B: Backend>(
        config_path: impl AsRef<Path>,
        source_path: impl AsRef<Path>,
        device: &B::Device,
    ) -> Result<FocalTreeMinLoss<B>> {
        let config: Self = crate::resource::read_json(config_path)?;
        let source: HierarchySource = crate::resource::read_json(source_path)?;
        config.init_from_source(&source, device)
    }

    fn assertions(&self) {
        assert!(
            self.gamma >= 0.0,
            "Gamma for FocalTreeMinLoss must be non-negative, got {}",
            self.gamma
        );
        assert!(
            self.loss_weight >= 0.0,
            "Loss weight for FocalTreeMinLoss must be non-negative, got {}",
            self.loss_weight
        );
    }
}

/// Focal tree-min loss.
///
/// Expands flat labels along the class tree, lowers every positive class to
/// the weakest score of its ancestor chain, raises every negative coarse class
/// to the strongest score among its descendants, and applies a sigmoid focal
/// binary cross-entropy to the result.
#[derive(Module, Debug)]
#[module(custom_display)]
pub struct FocalTreeMinLoss<B: Backend> {
    /// Hierarchy tables shared by every call.
    tables: Ignored<Arc<HierarchyTables>>,
    /// Tree-min and tree-max index tables on the device.
    aggregator: TreeScoreAggregator<B>,
    /// Focal binary cross-entropy criterion.
    reducer: FocalBceReducer<B>,
    /// Reduction applied when no override is given.
    reduction: Ignored<LossReduction>,
    /// Factor applied to the final loss.
    pub loss_weight: f64,
    loss_name: Ignored<String>,
    ignore_index: Ignored<i64>,
}

impl<B: Backend> ModuleDisplay for FocalTreeMinLoss<B> {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        content
            .add("gamma", &self.reducer.gamma)
            .add("reduction", &self.reduction)
            .add("loss_weight", &self.loss_weight)
            .add("loss_name", &self.loss_name)
            .add("ignore_index", &self.ignore_index)
            .optional()
    }
}

impl<B: Backend> FocalTreeMinLoss<B> {
    /// Create a new loss with default configuration.
    ///
    /// # Errors
    ///
    /// See [`FocalTreeMinLossConfig::init`].
    pub fn new(tables: Arc<HierarchyTables>, device: &B::Device) -> Result<Self> {
        FocalTreeMinLossConfig::new().init(tables, None, device)
    }

    /// Name of this loss item.
    pub fn loss_name(&self) -> &str {
        &self.loss_name.0
    }

    /// Hierarchy tables used by this loss.
    pub fn tables(&self) -> &HierarchyTables {
        &self.tables.0
    }

    /// Compute the criterion, reducing with `reduction_override` if given and
    /// the configured reduction otherwise.
    ///
    /// # Shapes
    ///
    /// - predictions: `[batch_size, num_classes, height, width]` (logits)
    /// - labels: `[batch_size, height, width]`
    /// - output: `[1]`, or `[num_kept, num_classes]` without reduction
    ///
    /// # Errors
    ///
    /// Returns an error on a shape mismatch, a label without ancestor entry, or
    /// a mean over zero kept labels.
    pub fn forward(
        &self,
        predictions: Tensor<B, 4>,
        labels: Tensor<B, 3, Int>,
        reduction_override: Option<LossReduction>,
    ) -> Result<ReducedLoss<B>> {
        let (scores, labels) = self.flatten(predictions, labels)?;
        self.forward_flat(scores, labels, reduction_override)
    }

    /// Compute the criterion without reduction.
    ///
    /// # Shapes
    ///
    /// - predictions: `[batch_size, num_classes, height, width]` (logits)
    /// - labels: `[batch_size, height, width]`
    /// - output: `[num_kept, num_classes]`
    ///
    /// # Errors
    ///
    /// See [`FocalTreeMinLoss::forward`].
    pub fn forward_no_reduction(
        &self,
        predictions: Tensor<B, 4>,
        labels: Tensor<B, 3, Int>,
    ) -> Result<Tensor<B, 2>> {
        let (scores, labels) = self.flatten(predictions, labels)?;
        Ok(self.elementwise(scores, labels)?.0.mul_scalar(self.loss_weight))
    }

    /// Compute the criterion on already flattened scores, one row per position.
    ///
    /// # Shapes
    ///
    /// - scores: `[num_labels, num_classes]` (logits)
    /// - labels: `[num_labels]`
    ///
    /// # Errors
    ///
    /// See [`FocalTreeMinLoss::forward`].
    pub fn forward_flat(
        &self,
        scores: Tensor<B, 2>,
        labels: Tensor<B, 1, Int>,
        reduction_override: Option<LossReduction>,
    ) -> Result<ReducedLoss<B>> {
        let reduction = reduction_override.unwrap_or(self.reduction.0);
        let (loss, _) = self.elementwise(scores, labels)?;
        Ok(reduce(loss, reduction)?.mul_scalar(self.loss_weight))
    }

    /// Compute the reduced criterion together with a breakdown for monitoring.
    ///
    /// The breakdown holds the loss value under `loss_name`, the number of
    /// kept positions (`num_kept`) and of positive target cells (`num_positive`).
    ///
    /// # Errors
    ///
    /// See [`FocalTreeMinLoss::forward`].
    pub fn forward_detailed(
        &self,
        predictions: Tensor<B, 4>,
        labels: Tensor<B, 3, Int>,
        reduction: Reduction,
    ) -> Result<(Tensor<B, 1>, HashMap<String, f64>)> {
        let (scores, labels) = self.flatten(predictions, labels)?;
        let (loss, expanded) = self.elementwise(scores, labels)?;
        let num_positive = if expanded.num_kept == 0 {
            0.0
        } else {
            expanded.target.sum().into_scalar().to_f64()
        };

        let loss = match reduce(loss, reduction.into())? {
            ReducedLoss::Scalar(loss) => loss.mul_scalar(self.loss_weight),
            ReducedLoss::Elementwise(_) => unreachable!("burn reductions always reduce"),
        };

        let mut loss_dict = HashMap::new();
        loss_dict.insert(
            self.loss_name.0.clone(),
            loss.clone().into_scalar().to_f64(),
        );
        loss_dict.insert("num_kept".to_owned(), expanded.num_kept as f64);
        loss_dict.insert("num_positive".to_owned(), num_positive);

        Ok((loss, loss_dict))
    }

    /// Expand labels and adjust scores for the kept positions.
    ///
    /// Returns the adjusted scores `[num_kept, num_classes]` and the expanded
    /// labels.
    ///
    /// # Errors
    ///
    /// Returns an error on a shape mismatch or a label without ancestor entry.
    pub fn prepare(
        &self,
        scores: Tensor<B, 2>,
        labels: Tensor<B, 1, Int>,
    ) -> Result<(Tensor<B, 2>, ExpandedLabels<B>)> {
        self.check_flat_shapes(&scores, &labels)?;
        let [num_labels, num_classes] = scores.dims();

        let expanded = LabelExpander::new(self.tables(), self.ignore_index.0).expand(labels)?;
        tracing::debug!(
            loss = %self.loss_name.0,
            num_labels,
            num_kept = expanded.num_kept,
            "prepared hierarchical targets"
        );

        if expanded.num_kept == 0 {
            return Ok((Tensor::zeros([0, num_classes], &scores.device()), expanded));
        }
        let kept = if expanded.num_kept == num_labels {
            scores
        } else {
            scores.select(0, expanded.kept_indices.clone())
        };
        let adjusted = self.aggregator.forward(kept, expanded.target.clone());

        Ok((adjusted, expanded))
    }

    fn elementwise(
        &self,
        scores: Tensor<B, 2>,
        labels: Tensor<B, 1, Int>,
    ) -> Result<(Tensor<B, 2>, ExpandedLabels<B>)> {
        let (adjusted, expanded) = self.prepare(scores, labels)?;
        let loss = if expanded.num_kept == 0 {
            adjusted
        } else {
            self.reducer
                .forward_no_reduction(adjusted, expanded.target.clone())
        };
        Ok((loss, expanded))
    }

    /// Moves the class axis last and flattens everything else.
    fn flatten(
        &self,
        predictions: Tensor<B, 4>,
        labels: Tensor<B, 3, Int>,
    ) -> Result<(Tensor<B, 2>, Tensor<B, 1, Int>)> {
        let [batch_size, num_classes, height, width] = predictions.dims();
        let label_dims = labels.dims();
        if label_dims != [batch_size, height, width] {
            return Err(TreeLossError::ShapeMismatch {
                reason: format!(
                    "labels {label_dims:?} do not match predictions {:?}",
                    [batch_size, num_classes, height, width]
                ),
            });
        }

        let num_labels = batch_size * height * width;
        let scores = predictions
            .permute([0, 2, 3, 1])
            .reshape([num_labels, num_classes]);
        Ok((scores, labels.reshape([num_labels])))
    }

    fn check_flat_shapes(&self, scores: &Tensor<B, 2>, labels: &Tensor<B, 1, Int>) -> Result<()> {
        let [num_labels, num_classes] = scores.dims();
        let [label_count] = labels.dims();
        if num_classes != self.tables().num_classes() {
            return Err(TreeLossError::ShapeMismatch {
                reason: format!(
                    "predictions have {num_classes} classes, the hierarchy has {}",
                    self.tables().num_classes()
                ),
            });
        }
        if num_labels != label_count {
            return Err(TreeLossError::ShapeMismatch {
                reason: format!("{num_labels} prediction rows but {label_count} labels"),
            });
        }
        Ok(())
    }
}
