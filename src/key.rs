// Copyright (c) 2024-present, teseo contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use byteorder::{BigEndian, ByteOrder};

/// Internal vertex identifier.
///
/// Vertex ID 0 is reserved and never appears in stored data; the public API
/// shifts user identifiers by one.
pub type VertexId = u64;

/// Composite key identifying a vertex or an edge in the memstore.
///
/// A vertex encodes as `(vertex, 0)`, an edge as `(source, destination)`.
/// The derived ordering is lexicographic on `(source, destination)`, which is
/// exactly the ordering of the big-endian encoding consumed by the tries.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    source: VertexId,
    destination: VertexId,
}

/// Smallest possible key.
pub const KEY_MIN: Key = Key {
    source: 0,
    destination: 0,
};

/// Largest possible key.
pub const KEY_MAX: Key = Key {
    source: u64::MAX,
    destination: u64::MAX,
};

impl Key {
    /// Creates an edge key.
    pub fn new(source: VertexId, destination: VertexId) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// Creates a vertex key, `(vertex, 0)`.
    pub fn vertex(vertex: VertexId) -> Self {
        Self {
            source: vertex,
            destination: 0,
        }
    }

    pub fn source(&self) -> VertexId {
        self.source
    }

    pub fn destination(&self) -> VertexId {
        self.destination
    }

    /// Returns `true` if this key refers to a vertex rather than an edge.
    pub fn is_vertex(&self) -> bool {
        self.destination == 0
    }

    /// The next key in the total order, used to resume scans past this record.
    pub fn successor(&self) -> Self {
        if self.destination == u64::MAX {
            Self {
                source: self.source + 1,
                destination: 0,
            }
        } else {
            Self {
                source: self.source,
                destination: self.destination + 1,
            }
        }
    }

    /// Encodes the key as 16 big-endian bytes, so that byte-wise ordering of
    /// the encoding equals the ordering of the key.
    pub fn encode(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        BigEndian::write_u64(&mut buf[0..8], self.source);
        BigEndian::write_u64(&mut buf[8..16], self.destination);
        buf
    }

    pub fn decode(buf: &[u8; 16]) -> Self {
        Self {
            source: BigEndian::read_u64(&buf[0..8]),
            destination: BigEndian::read_u64(&buf[8..16]),
        }
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn key_order() {
        assert!(Key::vertex(1) < Key::new(1, 1));
        assert!(Key::new(1, u64::MAX) < Key::vertex(2));
        assert!(KEY_MIN < Key::vertex(1));
        assert!(Key::new(u64::MAX, u64::MAX - 1) < KEY_MAX);
    }

    #[test]
    fn key_successor() {
        assert_eq!(Key::new(10, 21), Key::new(10, 20).successor());
        assert_eq!(Key::vertex(11), Key::new(10, u64::MAX).successor());
    }

    #[test]
    fn key_encoding_preserves_order() {
        let keys = [
            KEY_MIN,
            Key::vertex(1),
            Key::new(1, 2),
            Key::new(1, 300),
            Key::vertex(256),
            Key::new(256, 1),
            KEY_MAX,
        ];

        for window in keys.windows(2) {
            assert!(window[0].encode() < window[1].encode());
        }

        for key in keys {
            assert_eq!(key, Key::decode(&key.encode()));
        }
    }
}
