//! Error type shared by computed nodes, vars and the realm.

use crate::realm::NodeId;
use thiserror::Error;

/// Boxed error produced by a fallible compute function
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convenience alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by reactive nodes
///
/// Integration bugs (a dependency notifying a node while that node is in the
/// middle of its own compute) are not represented here: they panic.
#[derive(Debug, Error)]
pub enum Error {
    /// The compute function failed. Nothing was cached and the node is still
    /// dirty, so the next read runs the compute function again.
    #[error("compute function failed: {0}")]
    Compute(#[source] BoxError),

    /// The node was disposed; disposal is terminal.
    #[error("{node} used after dispose")]
    Disposed {
        /// Kind of node that was disposed (`"computed"` or `"var"`)
        node: &'static str,
    },

    /// The node's value was requested while its own compute function was
    /// still running.
    #[error("cyclic read of {node} during its own computation")]
    Cycle {
        /// The node that was re-entered
        node: NodeId,
    },

    /// Too many recomputations were nested inside each other.
    #[error("recomputation nested deeper than {limit} levels")]
    DepthExceeded {
        /// The realm's configured limit
        limit: usize,
    },
}

impl Error {
    /// Wrap an arbitrary compute failure
    pub fn compute(err: impl Into<BoxError>) -> Self {
        Error::Compute(err.into())
    }

    /// True for [`Error::Disposed`]
    pub fn is_disposed(&self) -> bool {
        matches!(self, Error::Disposed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_error_keeps_source() {
        let err = Error::compute("boom");
        assert_eq!(err.to_string(), "compute function failed: boom");
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("boom"));
    }

    #[test]
    fn disposed_message_names_node_kind() {
        let err = Error::Disposed { node: "var" };
        assert!(err.is_disposed());
        assert_eq!(err.to_string(), "var used after dispose");
    }
}
