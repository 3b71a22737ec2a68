// Copyright (c) 2024-present, teseo contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::key::VertexId;

/// Represents errors that can be returned by a transaction
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The referenced vertex is not present in the transaction's snapshot
    VertexDoesNotExist(VertexId),

    /// Insertion of a vertex that already exists
    VertexAlreadyExists(VertexId),

    /// The vertex is being written by another, still pending transaction
    VertexLocked(VertexId),

    /// Edge insertion on a source vertex currently held by a remover
    VertexPhantomWrite(VertexId),

    /// The referenced edge is not present in the transaction's snapshot
    EdgeDoesNotExist(VertexId, VertexId),

    /// Insertion of an edge that already exists
    EdgeAlreadyExists(VertexId, VertexId),

    /// The edge is being written by another, still pending transaction
    EdgeLocked(VertexId, VertexId),

    /// Attempt to insert a self edge (`source == destination`)
    EdgeSelf(VertexId),

    /// Write conflict with a concurrent transaction
    TransactionConflict,

    /// Argument or precondition violation
    LogicalError(&'static str),
}

impl Error {
    /// Converts internal vertex identifiers into user-facing identifiers.
    ///
    /// Internally vertex 0 is reserved, so every user identifier is shifted
    /// by one. Invoked once, at the public API boundary.
    pub(crate) fn externalize(self) -> Self {
        match self {
            Self::VertexDoesNotExist(v) => Self::VertexDoesNotExist(v - 1),
            Self::VertexAlreadyExists(v) => Self::VertexAlreadyExists(v - 1),
            Self::VertexLocked(v) => Self::VertexLocked(v - 1),
            Self::VertexPhantomWrite(v) => Self::VertexPhantomWrite(v - 1),
            Self::EdgeDoesNotExist(s, d) => Self::EdgeDoesNotExist(s - 1, d - 1),
            Self::EdgeAlreadyExists(s, d) => Self::EdgeAlreadyExists(s - 1, d - 1),
            Self::EdgeLocked(s, d) => Self::EdgeLocked(s - 1, d - 1),
            Self::EdgeSelf(v) => Self::EdgeSelf(v - 1),
            other => other,
        }
    }

    /// Write conflicts surface to the user as [`Error::TransactionConflict`].
    pub(crate) fn into_conflict(self) -> Self {
        match self {
            Self::VertexLocked(_) | Self::EdgeLocked(_, _) => Self::TransactionConflict,
            other => other,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TeseoError: {self:?}")
    }
}

impl std::error::Error for Error {}

/// Transaction result
pub type Result<T> = std::result::Result<T, Error>;

/// Internal signal that an optimistic read or write raced with a concurrent
/// structural change and the whole logical operation must be retried.
///
/// Never escapes to user code; the entry loops in the memstore own the retry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Abort;

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn externalize_shifts_vertex_ids() {
        assert_eq!(
            Error::VertexDoesNotExist(10),
            Error::VertexDoesNotExist(11).externalize()
        );
        assert_eq!(
            Error::EdgeAlreadyExists(10, 20),
            Error::EdgeAlreadyExists(11, 21).externalize()
        );
        assert_eq!(Error::TransactionConflict, Error::TransactionConflict.externalize());
    }

    #[test]
    fn locked_maps_to_conflict() {
        assert_eq!(
            Error::TransactionConflict,
            Error::VertexLocked(10).into_conflict()
        );
        assert_eq!(
            Error::TransactionConflict,
            Error::EdgeLocked(10, 20).into_conflict()
        );
        assert_eq!(
            Error::VertexDoesNotExist(10),
            Error::VertexDoesNotExist(10).into_conflict()
        );
    }
}
