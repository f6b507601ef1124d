//! Resource loading for hierarchy descriptions, chain indexes and class weights.
//!
//! Hierarchy maps and class weights are JSON. A precomputed chain index is
//! either a nested JSON array or a 2-D NumPy `.npy` array of 64-bit integers.

use std::{
    fs::{self, File},
    io::BufReader,
    path::Path,
};

use burn::config::Config;
use serde::de::DeserializeOwned;

use crate::{
    class_weight::ClassWeights,
    error::{Result, TreeLossError},
    hierarchy::{HierarchyOptions, HierarchySpec, HierarchyTables},
};

/// Locations of the persisted hierarchy resources.
#[derive(Config, Debug)]
pub struct HierarchySource {
    /// Total number of classes, leaves and coarse nodes together.
    pub num_classes: usize,
    /// JSON map of leaf class → ancestor chain.
    pub ancestors_path: String,
    /// JSON map of coarse class → descendant leaves.
    pub descendants_path: String,
    /// JSON `[depth, num_classes]` chain index. Derived when absent.
    pub chain_index_path: Option<String>,
    /// JSON file with `third_level`, `second_level` and `first_level` weights.
    pub class_weight_path: Option<String>,
    /// Maximum ancestor chain length.
    pub max_depth: Option<usize>,
    /// First class index treated as coarse.
    pub first_coarse_class: Option<usize>,
}

impl HierarchySource {
    /// Loads and validates the hierarchy tables.
    ///
    /// # Errors
    ///
    /// Returns an error if a resource cannot be read or parsed, or if the
    /// hierarchy is malformed.
    pub fn load_tables(&self) -> Result<HierarchyTables> {
        let spec = HierarchySpec::from_json_files(&self.ancestors_path, &self.descendants_path)?;
        let chain_index = self
            .chain_index_path
            .as_ref()
            .map(load_chain_index)
            .transpose()?;
        let options = HierarchyOptions::new()
            .with_max_depth(self.max_depth)
            .with_first_coarse_class(self.first_coarse_class)
            .with_chain_index(chain_index);
        HierarchyTables::build(&spec, self.num_classes, &options)
    }

    /// Loads the class weights, if a path is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if it does not
    /// hold one weight per class.
    pub fn load_class_weights(&self) -> Result<Option<ClassWeights>> {
        let Some(path) = &self.class_weight_path else {
            return Ok(None);
        };
        let weights = ClassWeights::load(path)?;
        weights.validate(self.num_classes)?;
        Ok(Some(weights))
    }
}

/// Reads and deserializes a JSON file, attaching the path to any failure.
pub(crate) fn read_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| TreeLossError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value = serde_json::from_str(&content).map_err(|source| TreeLossError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(path = %path.display(), "loaded JSON resource");
    Ok(value)
}

/// Loads a precomputed ancestor chain index of shape `[depth, num_classes]`.
///
/// Files with an `.npy` extension are decoded as NumPy arrays in either
/// memory order; anything else is read as a nested JSON array.
///
/// # Errors
///
/// Returns [`TreeLossError::Io`], [`TreeLossError::Json`] or
/// [`TreeLossError::Npy`] if the file cannot be read or decoded, and
/// [`TreeLossError::InvalidChainIndex`] if a NumPy array is not 2-D or holds a
/// negative entry. Content against the hierarchy is checked later, when the
/// index is handed to [`HierarchyTables`](crate::HierarchyTables).
pub fn load_chain_index(path: impl AsRef<Path>) -> Result<Vec<Vec<usize>>> {
    let path = path.as_ref();
    if path
        .extension()
        .is_some_and(|extension| extension.eq_ignore_ascii_case("npy"))
    {
        read_npy_index(path)
    } else {
        read_json(path)
    }
}

fn read_npy_index(path: &Path) -> Result<Vec<Vec<usize>>> {
    let npy_error = |source: std::io::Error| TreeLossError::Npy {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(|source| TreeLossError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let array = npyz::NpyFile::new(BufReader::new(file)).map_err(npy_error)?;

    let shape = array.shape().to_vec();
    let &[depth, num_classes] = shape.as_slice() else {
        return Err(TreeLossError::InvalidChainIndex {
            reason: format!("{} holds an array of shape {shape:?}, expected 2 dimensions", path.display()),
        });
    };
    let (depth, num_classes) = (depth as usize, num_classes as usize);
    let order = array.order();
    let values = array.into_vec::<i64>().map_err(npy_error)?;

    let offset = |level: usize, class: usize| match order {
        npyz::Order::C => level * num_classes + class,
        npyz::Order::Fortran => class * depth + level,
    };
    let index = (0..depth)
        .map(|level| {
            (0..num_classes)
                .map(|class| {
                    let value = values[offset(level, class)];
                    usize::try_from(value).map_err(|_| TreeLossError::InvalidChainIndex {
                        reason: format!("negative class {value} at [{level}, {class}]"),
                    })
                })
                .collect::<Result<Vec<_>>>()
        })
        .collect::<Result<Vec<_>>>()?;

    tracing::debug!(path = %path.display(), depth, num_classes, "loaded NumPy chain index");
    Ok(index)
}
