//! Per-class weights stored as three hierarchy levels.

use std::path::Path;

use burn::tensor::{backend::Backend, Tensor, TensorData};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, TreeLossError},
    resource::read_json,
};

/// Weight file layout: one list per hierarchy level, finest level first in
/// class order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelWeights {
    pub third_level: Vec<f32>,
    pub second_level: Vec<f32>,
    pub first_level: Vec<f32>,
}

/// Per-class weights in class index order.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassWeights {
    values: Vec<f32>,
}

impl ClassWeights {
    /// Creates weights from values in class order.
    pub const fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Concatenates the third, second and first level weights.
    pub fn from_levels(levels: LevelWeights) -> Self {
        let LevelWeights {
            mut third_level,
            second_level,
            first_level,
        } = levels;
        third_level.extend(second_level);
        third_level.extend(first_level);
        Self::new(third_level)
    }

    /// Loads the level weights from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        read_json(path).map(Self::from_levels)
    }

    /// Weights in class index order.
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Number of weights.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no weight is stored.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Checks that there is exactly one weight per class.
    ///
    /// # Errors
    ///
    /// Returns [`TreeLossError::ClassWeightLength`] on a length mismatch.
    pub fn validate(&self, num_classes: usize) -> Result<()> {
        if self.len() == num_classes {
            Ok(())
        } else {
            Err(TreeLossError::ClassWeightLength {
                expected: num_classes,
                actual: self.len(),
            })
        }
    }

    /// Uploads the weights as a `[num_classes]` tensor.
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 1> {
        Tensor::from_data(TensorData::new(self.values.clone(), [self.len()]), device)
    }
}
