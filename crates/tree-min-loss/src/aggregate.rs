//! Hierarchy-aware score adjustment.
//!
//! Two rules rewrite disjoint cells of a copy of the raw scores:
//!
//! ```text
//! target[i, c] = 1             : adjusted[i, c] = min_k raw[i, chain_index[k][c]]
//! target[i, c] = 0, c coarse   : adjusted[i, c] = max_{d in descendants[c]} raw[i, d]
//! otherwise                    : adjusted[i, c] = raw[i, c]
//! ```
//!
//! Both rules read the raw scores only, so the order in which they are applied
//! does not matter.

use burn::{
    module::Module,
    tensor::{backend::Backend, Int, Tensor, TensorData},
};

use crate::hierarchy::HierarchyTables;

/// Device-resident index tables for the tree-min and tree-max rules.
#[derive(Module, Debug)]
pub struct TreeScoreAggregator<B: Backend> {
    /// Chain index, `[depth, num_classes]`.
    chain_index: Tensor<B, 2, Int>,
    /// Descendant leaves of each coarse class, in class order.
    descendant_index: Vec<Tensor<B, 1, Int>>,
    first_coarse_class: usize,
    num_classes: usize,
}

impl<B: Backend> TreeScoreAggregator<B> {
    /// Uploads the hierarchy's index tables to `device`.
    pub fn new(tables: &HierarchyTables, device: &B::Device) -> Self {
        let num_classes = tables.num_classes();
        let chain: Vec<i64> = tables
            .chain_index()
            .iter()
            .flatten()
            .map(|&class| class as i64)
            .collect();
        let chain_index = Tensor::from_data(
            TensorData::new(chain, [tables.depth(), num_classes]),
            device,
        );

        let descendant_index = tables
            .coarse_classes()
            .map(|class| {
                let leaves: Vec<i64> = tables
                    .descendants(class)
                    .unwrap_or_default()
                    .iter()
                    .map(|&leaf| leaf as i64)
                    .collect();
                let len = leaves.len();
                Tensor::from_data(TensorData::new(leaves, [len]), device)
            })
            .collect();

        Self {
            chain_index,
            descendant_index,
            first_coarse_class: tables.first_coarse_class(),
            num_classes,
        }
    }

    /// Adjusts raw scores according to the multi-hot target.
    ///
    /// # Shapes
    ///
    /// - scores: `[n, num_classes]` (logits)
    /// - target: `[n, num_classes]` (0/1)
    /// - output: `[n, num_classes]`
    pub fn forward(&self, scores: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 2> {
        self.assertions(&scores, &target);

        let positive = target.clone().equal_elem(1.0);
        let adjusted = scores
            .clone()
            .mask_where(positive, self.chain_min(scores.clone()));

        match self.descendant_max(scores) {
            Some(candidate) => adjusted.mask_where(target.equal_elem(0.0), candidate),
            None => adjusted,
        }
    }

    /// Minimum raw score along each class's ancestor chain.
    ///
    /// Every depth level is gathered densely for all cells; the minimum is
    /// taken over the levels stacked on the last axis, where backends
    /// scatter the gradient.
    pub fn chain_min(&self, scores: Tensor<B, 2>) -> Tensor<B, 2> {
        let [n, num_classes] = scores.dims();
        let [depth, _] = self.chain_index.dims();

        let levels: Vec<Tensor<B, 2>> = (0..depth)
            .map(|level| {
                let index = self
                    .chain_index
                    .clone()
                    .slice([level..level + 1, 0..num_classes])
                    .repeat_dim(0, n);
                scores.clone().gather(1, index)
            })
            .collect();

        Tensor::stack::<3>(levels, 2)
            .min_dim(2)
            .reshape([n, num_classes])
    }

    /// Candidate scores for the tree-max rule: raw scores below the first
    /// coarse class, descendant maxima from it on. `None` without coarse classes.
    pub fn descendant_max(&self, scores: Tensor<B, 2>) -> Option<Tensor<B, 2>> {
        if self.descendant_index.is_empty() {
            return None;
        }
        let [n, _] = scores.dims();

        let mut columns = Vec::with_capacity(self.descendant_index.len() + 1);
        if self.first_coarse_class > 0 {
            columns.push(scores.clone().slice([0..n, 0..self.first_coarse_class]));
        }
        for leaves in &self.descendant_index {
            columns.push(scores.clone().select(1, leaves.clone()).max_dim(1));
        }

        Some(Tensor::cat(columns, 1))
    }

    fn assertions(&self, scores: &Tensor<B, 2>, target: &Tensor<B, 2>) {
        let score_dims = scores.dims();
        let target_dims = target.dims();
        assert_eq!(
            score_dims, target_dims,
            "Shape of scores ({score_dims:?}) must match target ({target_dims:?})"
        );
        assert_eq!(
            score_dims[1], self.num_classes,
            "Scores must have {} classes, got shape {score_dims:?}",
            self.num_classes
        );
    }
}
