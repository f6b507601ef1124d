//! Expansion of flat class labels into tree-consistent multi-hot targets.
//!
//! Positions labelled with the ignore index are dropped. Every distinct
//! surviving label gets one multi-hot row (1 at each class of its ancestor
//! chain), which is then broadcast to all positions sharing that label with a
//! single row select.

use std::collections::BTreeMap;

use burn::tensor::{backend::Backend, Bool, Int, Tensor, TensorData};

use crate::{
    error::{Result, TreeLossError},
    hierarchy::HierarchyTables,
};

/// Multi-hot targets for the labels that survived ignore filtering.
#[derive(Debug, Clone)]
pub struct ExpandedLabels<B: Backend> {
    /// 0/1 targets, `[num_kept, num_classes]`.
    pub target: Tensor<B, 2>,
    /// Whether each input position was kept, `[num_labels]`.
    pub keep_mask: Tensor<B, 1, Bool>,
    /// Input positions that were kept, in order, `[num_kept]`.
    pub kept_indices: Tensor<B, 1, Int>,
    /// Number of kept positions.
    pub num_kept: usize,
}

/// Converts flat labels into multi-hot targets using the ancestor map.
#[derive(Debug, Clone, Copy)]
pub struct LabelExpander<'a> {
    tables: &'a HierarchyTables,
    ignore_index: i64,
}

impl<'a> LabelExpander<'a> {
    /// Creates an expander that drops positions labelled `ignore_index`.
    pub const fn new(tables: &'a HierarchyTables, ignore_index: i64) -> Self {
        Self {
            tables,
            ignore_index,
        }
    }

    /// Expands labels into multi-hot targets.
    ///
    /// # Shapes
    ///
    /// - labels: `[num_labels]`
    /// - target: `[num_kept, num_classes]`
    ///
    /// # Errors
    ///
    /// Returns [`TreeLossError::UnknownLabel`] if a kept label has no ancestor
    /// entry, and [`TreeLossError::TensorData`] if the labels cannot be read.
    pub fn expand<B: Backend>(&self, labels: Tensor<B, 1, Int>) -> Result<ExpandedLabels<B>> {
        let device = labels.device();
        let num_classes = self.tables.num_classes();
        let values = read_labels(labels)?;
        let num_labels = values.len();

        let keep: Vec<bool> = values.iter().map(|&v| v != self.ignore_index).collect();

        // Group kept positions by label value.
        let mut groups: BTreeMap<i64, usize> = BTreeMap::new();
        let mut kept_indices = Vec::new();
        let mut kept_labels = Vec::new();
        for (position, &label) in values.iter().enumerate() {
            if keep[position] {
                kept_indices.push(position as i64);
                kept_labels.push(label);
                groups.insert(label, 0);
            }
        }
        for (group, id) in groups.values_mut().enumerate() {
            *id = group;
        }

        let mut rows = vec![0.0f32; groups.len() * num_classes];
        for (&label, &group) in &groups {
            let row = &mut rows[group * num_classes..(group + 1) * num_classes];
            for &class in self.ancestors_of(label)? {
                row[class] = 1.0;
            }
        }
        let group_of_row: Vec<i64> = kept_labels.iter().map(|label| groups[label] as i64).collect();

        let num_kept = kept_indices.len();
        tracing::debug!(
            num_labels,
            num_kept,
            distinct = groups.len(),
            "expanded labels into multi-hot targets"
        );

        let target = if num_kept == 0 {
            Tensor::zeros([0, num_classes], &device)
        } else {
            let rows = Tensor::<B, 2>::from_data(
                TensorData::new(rows, [groups.len(), num_classes]),
                &device,
            );
            let group_of_row =
                Tensor::<B, 1, Int>::from_data(TensorData::new(group_of_row, [num_kept]), &device);
            rows.select(0, group_of_row)
        };

        Ok(ExpandedLabels {
            target,
            keep_mask: Tensor::from_data(TensorData::new(keep, [num_labels]), &device),
            kept_indices: Tensor::from_data(TensorData::new(kept_indices, [num_kept]), &device),
            num_kept,
        })
    }

    fn ancestors_of(&self, label: i64) -> Result<&'a [usize]> {
        usize::try_from(label)
            .ok()
            .and_then(|class| self.tables.ancestors(class))
            .ok_or(TreeLossError::UnknownLabel { label })
    }
}

fn read_labels<B: Backend>(labels: Tensor<B, 1, Int>) -> Result<Vec<i64>> {
    labels
        .into_data()
        .convert::<i64>()
        .into_vec::<i64>()
        .map_err(|err| TreeLossError::TensorData {
            reason: format!("{err:?}"),
        })
}
