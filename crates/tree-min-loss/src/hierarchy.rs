//! Precomputed lookup tables for a shallow class tree.
//!
//! The tree is described by two maps: `ancestors` (leaf → path up to the root,
//! starting with the leaf itself) and `descendants` (coarse class → leaves
//! beneath it). From them [`HierarchyTables`] derives a dense chain index of
//! shape `[depth, num_classes]` whose row `k` holds the `k`-th ancestor of every
//! class, so that gathering scores row by row and taking the minimum over the
//! rows yields the minimum score along each class's chain:
//!
//! ```text
//! ancestors  = { 0: [0, 3], 1: [1, 3], 2: [2] }
//! chain_index = [[0, 1, 2, 3],
//!                [3, 3, 2, 3]]   // short chains repeat their root
//! ```
//!
//! Every malformed input is rejected while building, never while computing the loss.

use std::{collections::BTreeMap, ops::Range, path::Path};

use burn::config::Config;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, TreeLossError},
    resource::read_json,
};

/// Raw hierarchy description, keyed by stringified class indices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchySpec {
    /// Leaf class → ordered ancestor chain, including the leaf itself.
    pub ancestors: BTreeMap<String, Vec<usize>>,
    /// Coarse class → leaf classes beneath it.
    pub descendants: BTreeMap<String, Vec<usize>>,
}

impl HierarchySpec {
    /// Creates a description from integer-keyed maps.
    pub fn from_maps(
        ancestors: impl IntoIterator<Item = (usize, Vec<usize>)>,
        descendants: impl IntoIterator<Item = (usize, Vec<usize>)>,
    ) -> Self {
        Self {
            ancestors: ancestors
                .into_iter()
                .map(|(class, chain)| (class.to_string(), chain))
                .collect(),
            descendants: descendants
                .into_iter()
                .map(|(class, leaves)| (class.to_string(), leaves))
                .collect(),
        }
    }

    /// Loads the two maps from separate JSON files.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be read or parsed.
    pub fn from_json_files(
        ancestors_path: impl AsRef<Path>,
        descendants_path: impl AsRef<Path>,
    ) -> Result<Self> {
        Ok(Self {
            ancestors: read_json(ancestors_path)?,
            descendants: read_json(descendants_path)?,
        })
    }
}

/// Options controlling how [`HierarchyTables`] are built.
#[derive(Config, Debug)]
pub struct HierarchyOptions {
    /// Maximum ancestor chain length. Defaults to the longest chain.
    pub max_depth: Option<usize>,
    /// First class index treated as coarse. Defaults to the smallest
    /// `descendants` key, or `num_classes` when there is none.
    pub first_coarse_class: Option<usize>,
    /// Precomputed chain index of shape `[depth, num_classes]`. Derived from
    /// `ancestors` when absent.
    pub chain_index: Option<Vec<Vec<usize>>>,
}

/// Immutable, validated lookup tables for the class tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchyTables {
    num_classes: usize,
    ancestors: BTreeMap<usize, Vec<usize>>,
    descendants: BTreeMap<usize, Vec<usize>>,
    chain_index: Vec<Vec<usize>>,
    first_coarse_class: usize,
}

impl HierarchyTables {
    /// Builds tables with default options.
    ///
    /// # Errors
    ///
    /// See [`HierarchyTables::build`].
    pub fn new(spec: &HierarchySpec, num_classes: usize) -> Result<Self> {
        Self::build(spec, num_classes, &HierarchyOptions::new())
    }

    /// Validates the hierarchy description and derives the chain index.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a key is not a class index, a class is
    /// out of range, a chain is empty, cyclic, ambiguous or deeper than the
    /// maximum depth, a coarse class has no descendants, or a precomputed chain
    /// index does not match the hierarchy.
    pub fn build(
        spec: &HierarchySpec,
        num_classes: usize,
        options: &HierarchyOptions,
    ) -> Result<Self> {
        if num_classes == 0 {
            return Err(TreeLossError::EmptyHierarchy);
        }

        let ancestors = parse_ancestors(&spec.ancestors, num_classes)?;
        let descendants = parse_descendants(&spec.descendants, num_classes)?;
        let chains = resolve_chains(&ancestors, num_classes)?;

        let longest = chains.iter().map(Vec::len).max().unwrap_or(1);
        let max_depth = options
            .max_depth
            .or_else(|| options.chain_index.as_ref().map(Vec::len))
            .unwrap_or(longest);
        if let Some((class, chain)) = ancestors.iter().find(|(_, chain)| chain.len() > max_depth) {
            return Err(TreeLossError::DepthExceeded {
                class: *class,
                depth: chain.len(),
                max_depth,
            });
        }

        let chain_index = match &options.chain_index {
            Some(index) => {
                validate_chain_index(index, &chains, max_depth)?;
                index.clone()
            }
            None => derive_chain_index(&chains, max_depth),
        };

        let first_coarse_class = options
            .first_coarse_class
            .or_else(|| descendants.keys().next().copied())
            .unwrap_or(num_classes);
        if first_coarse_class > num_classes {
            return Err(TreeLossError::ClassOutOfRange {
                class: first_coarse_class,
                num_classes,
                context: "the first coarse class".to_owned(),
            });
        }
        if let Some(class) = (first_coarse_class..num_classes)
            .find(|class| descendants.get(class).is_none_or(Vec::is_empty))
        {
            return Err(TreeLossError::EmptyDescendants { class });
        }

        tracing::info!(
            num_classes,
            depth = chain_index.len(),
            first_coarse_class,
            leaves = ancestors.len(),
            "built class hierarchy tables"
        );

        Ok(Self {
            num_classes,
            ancestors,
            descendants,
            chain_index,
            first_coarse_class,
        })
    }

    /// Number of classes, leaves and coarse nodes together.
    pub const fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Number of rows of the chain index.
    pub fn depth(&self) -> usize {
        self.chain_index.len()
    }

    /// First class index that receives the descendant-max adjustment.
    pub const fn first_coarse_class(&self) -> usize {
        self.first_coarse_class
    }

    /// Class indices that receive the descendant-max adjustment.
    pub const fn coarse_classes(&self) -> Range<usize> {
        self.first_coarse_class..self.num_classes
    }

    /// Ancestor chain of a labelled class, starting with the class itself.
    pub fn ancestors(&self, class: usize) -> Option<&[usize]> {
        self.ancestors.get(&class).map(Vec::as_slice)
    }

    /// Leaves beneath a coarse class.
    pub fn descendants(&self, class: usize) -> Option<&[usize]> {
        self.descendants.get(&class).map(Vec::as_slice)
    }

    /// Chain index of shape `[depth, num_classes]`.
    pub fn chain_index(&self) -> &[Vec<usize>] {
        &self.chain_index
    }
}

fn parse_key(map: &'static str, key: &str, num_classes: usize) -> Result<usize> {
    let class = key
        .trim()
        .parse::<usize>()
        .map_err(|_| TreeLossError::InvalidClassKey {
            map,
            key: key.to_owned(),
        })?;
    check_range(class, num_classes, || format!("the {map} map"))?;
    Ok(class)
}

fn check_range(class: usize, num_classes: usize, context: impl FnOnce() -> String) -> Result<()> {
    if class < num_classes {
        Ok(())
    } else {
        Err(TreeLossError::ClassOutOfRange {
            class,
            num_classes,
            context: context(),
        })
    }
}

fn parse_ancestors(
    raw: &BTreeMap<String, Vec<usize>>,
    num_classes: usize,
) -> Result<BTreeMap<usize, Vec<usize>>> {
    let mut ancestors = BTreeMap::new();
    for (key, chain) in raw {
        let class = parse_key("ancestors", key, num_classes)?;
        match chain.first() {
            None => {
                return Err(TreeLossError::MalformedAncestors {
                    class,
                    reason: "chain is empty".to_owned(),
                })
            }
            Some(&head) if head != class => {
                return Err(TreeLossError::MalformedAncestors {
                    class,
                    reason: format!("chain starts with class {head}"),
                })
            }
            Some(_) => {}
        }
        for (position, &node) in chain.iter().enumerate() {
            check_range(node, num_classes, || format!("the ancestors of class {class}"))?;
            if chain[..position].contains(&node) {
                return Err(TreeLossError::Cycle {
                    class,
                    repeated: node,
                });
            }
        }
        ancestors.insert(class, chain.clone());
    }
    Ok(ancestors)
}

fn parse_descendants(
    raw: &BTreeMap<String, Vec<usize>>,
    num_classes: usize,
) -> Result<BTreeMap<usize, Vec<usize>>> {
    let mut descendants = BTreeMap::new();
    for (key, leaves) in raw {
        let class = parse_key("descendants", key, num_classes)?;
        if leaves.is_empty() {
            return Err(TreeLossError::EmptyDescendants { class });
        }
        for &leaf in leaves {
            check_range(leaf, num_classes, || format!("the descendants of class {class}"))?;
        }
        descendants.insert(class, leaves.clone());
    }
    Ok(descendants)
}

/// Resolves the chain of every class. A node inside a leaf's chain takes the
/// suffix starting at that node; classes that never appear get `[class]`.
fn resolve_chains(
    ancestors: &BTreeMap<usize, Vec<usize>>,
    num_classes: usize,
) -> Result<Vec<Vec<usize>>> {
    let mut chains: Vec<Option<Vec<usize>>> = vec![None; num_classes];
    for chain in ancestors.values() {
        for (position, &node) in chain.iter().enumerate() {
            let suffix = &chain[position..];
            match &chains[node] {
                Some(existing) if existing.as_slice() != suffix => {
                    return Err(TreeLossError::AmbiguousPath {
                        class: node,
                        first: existing.clone(),
                        second: suffix.to_vec(),
                    });
                }
                Some(_) => {}
                None => chains[node] = Some(suffix.to_vec()),
            }
        }
    }
    Ok(chains
        .into_iter()
        .enumerate()
        .map(|(class, chain)| chain.unwrap_or_else(|| vec![class]))
        .collect())
}

fn derive_chain_index(chains: &[Vec<usize>], depth: usize) -> Vec<Vec<usize>> {
    (0..depth)
        .map(|level| {
            chains
                .iter()
                .map(|chain| chain.get(level).or(chain.last()).copied().unwrap_or_default())
                .collect()
        })
        .collect()
}

fn validate_chain_index(index: &[Vec<usize>], chains: &[Vec<usize>], depth: usize) -> Result<()> {
    let num_classes = chains.len();
    if index.len() != depth {
        return Err(TreeLossError::InvalidChainIndex {
            reason: format!("expected {depth} rows, got {}", index.len()),
        });
    }
    if let Some((row, values)) = index.iter().enumerate().find(|(_, r)| r.len() != num_classes) {
        return Err(TreeLossError::InvalidChainIndex {
            reason: format!(
                "row {row} has {} entries, expected {num_classes}",
                values.len()
            ),
        });
    }
    for (class, chain) in chains.iter().enumerate() {
        let mut column: Vec<usize> = index.iter().map(|row| row[class]).collect();
        column.sort_unstable();
        column.dedup();
        let mut expected = chain.clone();
        expected.sort_unstable();
        if column != expected {
            return Err(TreeLossError::InvalidChainIndex {
                reason: format!(
                    "column of class {class} covers {column:?}, expected ancestors {chain:?}"
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    /// Leaves 0..4, mid-level 4 and 5, top-level 6.
    ///
    /// ```text
    ///        6
    ///      /   \
    ///     4     5
    ///    / \   / \
    ///   0   1 2   3
    /// ```
    fn two_level_spec() -> HierarchySpec {
        HierarchySpec::from_maps(
            [
                (0, vec![0, 4, 6]),
                (1, vec![1, 4, 6]),
                (2, vec![2, 5, 6]),
                (3, vec![3, 5, 6]),
            ],
            [
                (4, vec![0, 1]),
                (5, vec![2, 3]),
                (6, vec![0, 1, 2, 3]),
            ],
        )
    }

    #[test]
    fn tables_derive_chain_index_per_depth_level() {
        let tables = HierarchyTables::new(&two_level_spec(), 7).unwrap();

        assert_eq!(tables.depth(), 3);
        assert_eq!(tables.first_coarse_class(), 4);
        assert_eq!(tables.coarse_classes(), 4..7);
        assert_eq!(
            tables.chain_index(),
            &[
                vec![0, 1, 2, 3, 4, 5, 6],
                vec![4, 4, 5, 5, 6, 6, 6],
                vec![6, 6, 6, 6, 6, 6, 6],
            ]
        );
    }

    #[test]
    fn tables_pad_short_chains_with_their_root() {
        let spec = HierarchySpec::from_maps(
            [(0, vec![0, 3, 4]), (1, vec![1, 3, 4]), (2, vec![2])],
            [(3, vec![0, 1]), (4, vec![0, 1])],
        );
        let tables = HierarchyTables::new(&spec, 5).unwrap();

        // Class 2 is its own root, so every level repeats it.
        let column: Vec<usize> = tables.chain_index().iter().map(|row| row[2]).collect();
        assert_eq!(column, vec![2, 2, 2]);
    }

    #[test]
    fn tables_flat_hierarchy_without_coarse_classes() {
        let spec = HierarchySpec::from_maps([(0, vec![0])], []);
        let tables = HierarchyTables::new(&spec, 3).unwrap();

        assert_eq!(tables.depth(), 1);
        assert_eq!(tables.first_coarse_class(), 3);
        assert!(tables.coarse_classes().is_empty());
        assert_eq!(tables.chain_index(), &[vec![0, 1, 2]]);
    }

    #[test]
    fn tables_built_twice_are_identical() {
        let first = HierarchyTables::new(&two_level_spec(), 7).unwrap();
        let second = HierarchyTables::new(&two_level_spec(), 7).unwrap();

        assert_eq!(first.chain_index(), second.chain_index());
        assert_eq!(first, second);
    }

    #[test]
    fn tables_reject_non_numeric_key() {
        let mut spec = two_level_spec();
        spec.ancestors.insert("leaf".to_owned(), vec![0]);

        let err = HierarchyTables::new(&spec, 7).unwrap_err();
        assert!(matches!(
            err,
            TreeLossError::InvalidClassKey { map: "ancestors", .. }
        ));
    }

    #[test]
    fn tables_reject_out_of_range_ancestor() {
        let spec = HierarchySpec::from_maps([(0, vec![0, 9])], []);

        let err = HierarchyTables::new(&spec, 3).unwrap_err();
        assert!(matches!(
            err,
            TreeLossError::ClassOutOfRange { class: 9, num_classes: 3, .. }
        ));
    }

    #[test]
    fn tables_reject_chain_not_starting_with_its_class() {
        let spec = HierarchySpec::from_maps([(0, vec![1, 2])], []);

        let err = HierarchyTables::new(&spec, 3).unwrap_err();
        assert!(matches!(err, TreeLossError::MalformedAncestors { class: 0, .. }));
    }

    #[test]
    fn tables_reject_empty_chain() {
        let spec = HierarchySpec::from_maps([(0, vec![])], []);

        let err = HierarchyTables::new(&spec, 3).unwrap_err();
        assert!(matches!(err, TreeLossError::MalformedAncestors { class: 0, .. }));
    }

    #[test]
    fn tables_reject_cycle() {
        let spec = HierarchySpec::from_maps([(0, vec![0, 2, 0])], []);

        let err = HierarchyTables::new(&spec, 3).unwrap_err();
        assert!(matches!(err, TreeLossError::Cycle { class: 0, repeated: 0 }));
    }

    #[test]
    fn tables_reject_node_with_two_parents() {
        let spec = HierarchySpec::from_maps(
            [(0, vec![0, 2, 3]), (1, vec![1, 2, 4])],
            [(2, vec![0, 1]), (3, vec![0]), (4, vec![1])],
        );

        let err = HierarchyTables::new(&spec, 5).unwrap_err();
        assert!(matches!(err, TreeLossError::AmbiguousPath { class: 2, .. }));
    }

    #[test]
    fn tables_reject_chain_deeper_than_max_depth() {
        let options = HierarchyOptions::new().with_max_depth(Some(2));

        let err = HierarchyTables::build(&two_level_spec(), 7, &options).unwrap_err();
        assert!(matches!(
            err,
            TreeLossError::DepthExceeded { class: 0, depth: 3, max_depth: 2 }
        ));
    }

    #[test]
    fn tables_larger_max_depth_adds_padding_rows() {
        let options = HierarchyOptions::new().with_max_depth(Some(4));
        let tables = HierarchyTables::build(&two_level_spec(), 7, &options).unwrap();

        assert_eq!(tables.depth(), 4);
        assert_eq!(tables.chain_index()[3], vec![6; 7]);
    }

    #[test]
    fn tables_reject_coarse_class_without_descendants() {
        let mut spec = two_level_spec();
        spec.descendants.remove("5");

        let err = HierarchyTables::new(&spec, 7).unwrap_err();
        assert!(matches!(err, TreeLossError::EmptyDescendants { class: 5 }));
    }

    #[test]
    fn tables_reject_empty_descendant_set() {
        let mut spec = two_level_spec();
        spec.descendants.insert("6".to_owned(), vec![]);

        let err = HierarchyTables::new(&spec, 7).unwrap_err();
        assert!(matches!(err, TreeLossError::EmptyDescendants { class: 6 }));
    }

    #[test]
    fn tables_explicit_first_coarse_class_overrides_derived_one() {
        let options = HierarchyOptions::new().with_first_coarse_class(Some(6));
        let tables = HierarchyTables::build(&two_level_spec(), 7, &options).unwrap();

        assert_eq!(tables.coarse_classes(), 6..7);
    }

    #[test]
    fn tables_accept_matching_precomputed_chain_index() {
        let derived = HierarchyTables::new(&two_level_spec(), 7).unwrap();
        // Same sets per column, different order.
        let mut index = derived.chain_index().to_vec();
        index.reverse();

        let options = HierarchyOptions::new().with_chain_index(Some(index.clone()));
        let tables = HierarchyTables::build(&two_level_spec(), 7, &options).unwrap();
        assert_eq!(tables.chain_index(), index.as_slice());
    }

    #[test]
    fn tables_reject_precomputed_chain_index_missing_an_ancestor() {
        let mut index = HierarchyTables::new(&two_level_spec(), 7)
            .unwrap()
            .chain_index()
            .to_vec();
        index[2][0] = 4;

        let options = HierarchyOptions::new().with_chain_index(Some(index));
        let err = HierarchyTables::build(&two_level_spec(), 7, &options).unwrap_err();
        assert!(matches!(err, TreeLossError::InvalidChainIndex { .. }));
    }

    #[test]
    fn tables_reject_precomputed_chain_index_with_wrong_width() {
        let options =
            HierarchyOptions::new().with_chain_index(Some(vec![vec![0; 6], vec![0; 6], vec![0; 6]]));

        let err = HierarchyTables::build(&two_level_spec(), 7, &options).unwrap_err();
        assert!(matches!(err, TreeLossError::InvalidChainIndex { .. }));
    }

    #[test]
    fn tables_reject_zero_classes() {
        let err = HierarchyTables::new(&HierarchySpec::default(), 0).unwrap_err();
        assert!(matches!(err, TreeLossError::EmptyHierarchy));
    }

    #[test]
    fn spec_loads_from_json_files() {
        let mut ancestors = tempfile::NamedTempFile::new().unwrap();
        let mut descendants = tempfile::NamedTempFile::new().unwrap();
        write!(ancestors, r#"{{"0": [0, 2], "1": [1, 2]}}"#).unwrap();
        write!(descendants, r#"{{"2": [0, 1]}}"#).unwrap();

        let spec = HierarchySpec::from_json_files(ancestors.path(), descendants.path()).unwrap();
        assert_eq!(
            spec,
            HierarchySpec::from_maps([(0, vec![0, 2]), (1, vec![1, 2])], [(2, vec![0, 1])])
        );

        let tables = HierarchyTables::new(&spec, 3).unwrap();
        assert_eq!(tables.ancestors(1), Some([1, 2].as_slice()));
        assert_eq!(tables.descendants(2), Some([0, 1].as_slice()));
        assert_eq!(tables.ancestors(2), None);
    }
}
