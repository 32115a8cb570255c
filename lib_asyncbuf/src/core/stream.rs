//! Stream identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// # Stream Descriptor
///
/// Immutable key of a logical stream: an optional namespace plus a name.
/// Used as the key of the buffer registry, the worker tracker and the state
/// manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Optional namespace (schema, database, ...).
    #[serde(default)]
    pub namespace: Option<String>,
    /// Stream name.
    pub name: String,
}

impl StreamDescriptor {
    /// Descriptor without a namespace.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Descriptor with a namespace.
    pub fn with_namespace(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}.{}", namespace, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}
