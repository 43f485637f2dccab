//! Pretrained weights for the detector build.
//!
//! A [`NamedWeightMap`] maps hierarchical dot-path names
//! (`model.<index>.conv.weight`, `model.<index>.bn.running_var`, ...) to
//! immutable flat f32 buffers. [`WeightRepository`] reads and writes the
//! `.wts` text format those maps are distributed in.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

mod wts;

pub use wts::{WeightRepository, parse_wts, write_wts};

/// Errors that can occur while reading a weight file.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The file could not be read or written.
    #[error("failed to access weight file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A line could not be parsed.
    #[error("malformed weight file at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    /// An entry declares a different element count than it carries.
    #[error("weight '{name}' declares {declared} values but carries {found}")]
    CountMismatch {
        name: String,
        declared: usize,
        found: usize,
    },

    /// The header entry count does not match the number of entries.
    #[error("weight file declares {declared} entries but contains {found}")]
    EntryCount { declared: usize, found: usize },

    /// The same name appears twice.
    #[error("duplicate weight '{name}' at line {line}")]
    DuplicateKey { name: String, line: usize },
}

/// An immutable, cheaply clonable flat f32 buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightTensor {
    data: Arc<[f32]>,
}

impl WeightTensor {
    /// Wrap a buffer.
    pub fn new(data: impl Into<Arc<[f32]>>) -> Self {
        Self { data: data.into() }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the tensor has no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow the values.
    pub fn values(&self) -> &[f32] {
        &self.data
    }

    /// A shared handle to the underlying buffer.
    pub fn shared(&self) -> Arc<[f32]> {
        Arc::clone(&self.data)
    }
}

/// Name → tensor mapping for one build.
#[derive(Clone, Debug, Default)]
pub struct NamedWeightMap {
    tensors: HashMap<String, WeightTensor>,
}

impl NamedWeightMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tensor, returning the one previously stored under `name`.
    pub fn insert(&mut self, name: impl Into<String>, tensor: WeightTensor) -> Option<WeightTensor> {
        self.tensors.insert(name.into(), tensor)
    }

    /// Remove a tensor.
    pub fn remove(&mut self, name: &str) -> Option<WeightTensor> {
        self.tensors.remove(name)
    }

    /// Borrow a tensor by name.
    pub fn get(&self, name: &str) -> Option<&WeightTensor> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// All names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Total number of f32 values across all tensors.
    pub fn total_values(&self) -> usize {
        self.tensors.values().map(WeightTensor::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut map = NamedWeightMap::new();
        assert!(map.is_empty());
        map.insert("model.0.bn.weight", WeightTensor::new(vec![1.0, 2.0]));
        map.insert("model.0.bn.bias", WeightTensor::new(vec![0.5]));

        assert_eq!(map.len(), 2);
        assert!(map.contains("model.0.bn.bias"));
        assert_eq!(map.get("model.0.bn.weight").unwrap().values(), &[1.0, 2.0]);
        assert_eq!(map.total_values(), 3);
        assert_eq!(map.names(), vec!["model.0.bn.bias", "model.0.bn.weight"]);

        let removed = map.remove("model.0.bn.bias").unwrap();
        assert_eq!(removed.len(), 1);
        assert!(map.get("model.0.bn.bias").is_none());
    }

    #[test]
    fn shared_buffers_are_not_copied() {
        let tensor = WeightTensor::new(vec![0.25f32; 16]);
        let a = tensor.shared();
        let b = tensor.clone().shared();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn error_messages_carry_context() {
        let err = LoadError::CountMismatch {
            name: "model.7.conv.weight".into(),
            declared: 4,
            found: 3,
        };
        assert_eq!(
            err.to_string(),
            "weight 'model.7.conv.weight' declares 4 values but carries 3"
        );
    }
}
