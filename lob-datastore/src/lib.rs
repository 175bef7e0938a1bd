//! This crate implements the content storage layer of git-lob.
//!
//! # Data formats
//!
//! Large binary objects (LOBs) are addressed by the SHA-1 of their full
//! uncompressed contents, 40 hex characters, the same fingerprint
//! algorithm git uses for object names. The bytes are stored split into
//! fixed 32 MiB chunks next to a one-line metadata record, all underneath
//! a two-level directory splay keyed by the first four hex characters of
//! the hash. The splay bounds per-directory fan-out; the layout is shared
//! between clones via the optional shared store, so it must never change.
//!
//! The chunk size is a compile-time constant on purpose. Identical content
//! has to produce identical chunk boundaries in every clone, otherwise
//! chunk files could not be exchanged between stores or skipped during
//! transfer by a simple size probe.
//!
//! # Placeholders
//!
//! Inside the git object graph a LOB is represented by a 49 byte text
//! placeholder, `git-lob: ` followed by the hash. The [placeholder]
//! module implements the two filter directions: `clean` (content in,
//! placeholder out, bytes land in the store) and `smudge` (placeholder
//! in, content out of the store).
//!
//! # Shared store
//!
//! With a shared store configured, the authoritative chunk files live in
//! a machine-wide directory and the per-repository store holds hard
//! links into it. The file system link count is the only coordination
//! mechanism: a shared file whose count drops to one is no longer
//! referenced by any repository and may be removed. Symbolic links have
//! no such count and must never be substituted.

pub const CHUNK_SIZE: u64 = 32 * 1024 * 1024;

/// Length of a content hash in hex characters.
pub const SHA_HEX_LEN: usize = 40;

pub mod error;
pub mod lob_info;
pub mod placeholder;

mod store;

pub use error::StoreError;
pub use lob_info::LobInfo;
pub use store::ChunkStore;
