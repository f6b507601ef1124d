//! Error type shared by table construction, resource loading and the loss pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while building hierarchy tables or computing the loss.
#[derive(Debug, Error)]
pub enum TreeLossError {
    /// Hierarchy without any class
    #[error("class hierarchy must contain at least one class")]
    EmptyHierarchy,

    /// A hierarchy map key is not a stringified class index
    #[error("invalid class key '{key}' in {map} map")]
    InvalidClassKey { map: &'static str, key: String },

    /// A class index lies outside `0..num_classes`
    #[error("class {class} referenced by {context} is out of range for {num_classes} classes")]
    ClassOutOfRange {
        class: usize,
        num_classes: usize,
        context: String,
    },

    /// Ancestor chain that is empty or does not start with its own class
    #[error("ancestor chain of class {class} is malformed: {reason}")]
    MalformedAncestors { class: usize, reason: String },

    /// Ancestor chain that visits the same class twice
    #[error("ancestor chain of class {class} contains a cycle through class {repeated}")]
    Cycle { class: usize, repeated: usize },

    /// Two chains disagree on the path above a shared node
    #[error("class {class} has more than one path to the root: {first:?} vs {second:?}")]
    AmbiguousPath {
        class: usize,
        first: Vec<usize>,
        second: Vec<usize>,
    },

    /// Ancestor chain longer than the configured maximum depth
    #[error("ancestor chain of class {class} has depth {depth}, exceeding the maximum depth {max_depth}")]
    DepthExceeded {
        class: usize,
        depth: usize,
        max_depth: usize,
    },

    /// Coarse class without descendant leaves
    #[error("coarse class {class} has no descendant leaves")]
    EmptyDescendants { class: usize },

    /// Precomputed chain index that does not match the hierarchy
    #[error("invalid ancestor chain index: {reason}")]
    InvalidChainIndex { reason: String },

    /// Label value with no entry in the ancestor map
    #[error("label {label} has no ancestor entry in the class hierarchy")]
    UnknownLabel { label: i64 },

    /// Tensor shape incompatibility
    #[error("incompatible tensor shapes: {reason}")]
    ShapeMismatch { reason: String },

    /// Reduction mode outside `none | mean | sum`
    #[error("unsupported reduction '{mode}', expected one of none, mean, sum")]
    UnsupportedReduction { mode: String },

    /// Mean requested over zero elements
    #[error("cannot compute the mean of an empty loss: every label equals the ignore index")]
    EmptyReduction,

    /// Class weight vector that does not cover every class
    #[error("class weight vector has {actual} entries, expected {expected}")]
    ClassWeightLength { expected: usize, actual: usize },

    /// File system errors
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON parse errors
    #[error("failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// NumPy `.npy` header or payload errors
    #[error("failed to decode NumPy array {path}: {source}")]
    Npy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Tensor data conversion errors
    #[error("failed to read tensor data: {reason}")]
    TensorData { reason: String },
}

pub type Result<T, E = TreeLossError> = std::result::Result<T, E>;
