use serde::{Deserialize, Serialize};

use crate::CHUNK_SIZE;

/// Metadata record describing one stored LOB.
///
/// Persisted as a single JSON line in the `<sha>_meta` file. The field
/// order is fixed by this struct, so encoding is deterministic.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LobInfo {
    /// Content hash over the full uncompressed bytes.
    pub sha: String,
    /// Total size in bytes.
    pub size: u64,
    /// Number of chunk files; zero for an empty LOB.
    pub chunk_count: u32,
}

impl LobInfo {
    pub fn new(sha: String, size: u64) -> Self {
        LobInfo {
            sha,
            size,
            chunk_count: chunk_count_for_size(size),
        }
    }

    /// Expected byte count of chunk `index`.
    ///
    /// All chunks but the last are exactly [CHUNK_SIZE]; the last holds
    /// the remainder, which may itself equal [CHUNK_SIZE] when the total
    /// is an exact multiple.
    pub fn chunk_size(&self, index: u32) -> u64 {
        if index + 1 < self.chunk_count {
            CHUNK_SIZE
        } else {
            self.size - (self.chunk_count as u64 - 1) * CHUNK_SIZE
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

pub fn chunk_count_for_size(size: u64) -> u32 {
    ((size + CHUNK_SIZE - 1) / CHUNK_SIZE) as u32
}
