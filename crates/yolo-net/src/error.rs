//! Build errors.

use std::path::PathBuf;

use yolo_backend_core::BackendError;
use yolo_ir::IrError;
use yolo_weights::LoadError;

/// Errors that abort a network build.
///
/// None of these leave a partial engine behind: the graph and every derived
/// buffer are dropped before the error reaches the caller.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The weight file could not be read.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// A required weight key is absent from the map.
    #[error("missing weight '{key}'")]
    MissingWeight { key: String },

    /// Normalization statistics are present but unusable.
    #[error("normalization statistics '{prefix}': {reason}")]
    MissingStatistics { prefix: String, reason: String },

    /// A weight's element count does not match the layer geometry.
    #[error("weight '{key}' has {found} values, expected {expected}")]
    WeightShape {
        key: String,
        expected: usize,
        found: usize,
    },

    /// A node could not be inserted into the graph.
    #[error("graph construction failed: {0}")]
    Graph(#[from] IrError),

    /// A blueprint entry refers to a tensor that is not defined before it.
    #[error("blueprint node '{node}' references undefined tensor '{reference}'")]
    UnknownReference { node: String, reference: String },

    /// A blueprint defines the same symbol twice.
    #[error("blueprint defines '{name}' more than once")]
    DuplicateName { name: String },

    /// A blueprint entry has the wrong number of inputs for its operation.
    #[error("blueprint node '{node}' takes {expected} input(s), got {found}")]
    BlueprintArity {
        node: String,
        expected: String,
        found: usize,
    },

    /// The build configuration violates a geometry or count invariant.
    #[error("invalid build configuration: {0}")]
    InvalidConfig(String),

    /// The configuration file could not be read or written.
    #[error("failed to access config {}: {source}", path.display())]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`BuildConfig`](crate::BuildConfig).
    #[error("failed to parse config {}: {source}", path.display())]
    ConfigFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The engine compiler rejected the graph.
    #[error("engine compilation failed: {0}")]
    Compile(#[from] BackendError),
}

impl BuildError {
    /// The weight key this error is about, if any.
    pub fn weight_key(&self) -> Option<&str> {
        match self {
            Self::MissingWeight { key } | Self::WeightShape { key, .. } => Some(key),
            _ => None,
        }
    }
}
