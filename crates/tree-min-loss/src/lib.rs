//! Hierarchy-aware focal tree-min loss for semantic segmentation.
//!
//! Classes form a tree: fine leaf classes, mid-level groups and top-level
//! groups all share one flat index space. A pixel labelled with a leaf is also
//! a positive for every ancestor of that leaf. The loss turns flat labels and
//! per-class logits into a tree-consistent focal binary cross-entropy using
//! the Burn deep learning framework.
//!
//! ## Pipeline
//!
//! 1. **[`HierarchyTables`]**: validated ancestor and descendant maps plus the
//!    `[depth, num_classes]` ancestor chain index, built once and shared.
//! 2. **[`LabelExpander`]**: drops ignored positions and expands each label into
//!    a multi-hot target marking the label and its ancestors.
//! 3. **[`TreeScoreAggregator`]**: lowers positive classes to the weakest score
//!    on their ancestor chain (tree-min) and raises negative coarse classes to
//!    the strongest score among their descendants (tree-max).
//! 4. **[`FocalBceReducer`]**: focal-weighted binary cross-entropy with logits,
//!    reduced with [`LossReduction`].
//!
//! [`FocalTreeMinLoss`] chains the four steps for `[B, C, H, W]` logits.
//!
//! ## Usage Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use burn::{backend::NdArray, prelude::*};
//! use tree_min_loss::{FocalTreeMinLossConfig, HierarchySpec, HierarchyTables};
//!
//! let spec = HierarchySpec::from_maps(
//!     [(0, vec![0, 2]), (1, vec![1, 2])],
//!     [(2, vec![0, 1])],
//! );
//! let tables = Arc::new(HierarchyTables::new(&spec, 3).unwrap());
//!
//! let device = Default::default();
//! let loss = FocalTreeMinLossConfig::new()
//!     .init::<NdArray>(tables, None, &device)
//!     .unwrap();
//!
//! let logits = Tensor::<NdArray, 4>::zeros([1, 3, 2, 2], &device);
//! let labels = Tensor::<NdArray, 3, Int>::from_data([[[0, 1], [1, -100]]], &device);
//! let value = loss.forward(logits, labels, None).unwrap().scalar().unwrap();
//! assert_eq!(value.dims(), [1]);
//! ```

mod aggregate;
mod class_weight;
mod error;
mod focal;
mod focal_tree_min;
mod hierarchy;
mod label;
mod resource;

pub use aggregate::TreeScoreAggregator;
pub use class_weight::{ClassWeights, LevelWeights};
pub use error::{Result, TreeLossError};
pub use focal::{reduce, FocalBceReducer, LossReduction, ReducedLoss};
pub use focal_tree_min::{FocalTreeMinLoss, FocalTreeMinLossConfig};
pub use hierarchy::{HierarchyOptions, HierarchySpec, HierarchyTables};
pub use label::{ExpandedLabels, LabelExpander};
pub use resource::{load_chain_index, HierarchySource};
