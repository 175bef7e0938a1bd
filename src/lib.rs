//! git-lob keeps large binary files out of the git object graph.
//!
//! Tracked binaries are committed as 49 byte placeholders carrying a
//! content hash; the real bytes live in a chunked, content-addressed
//! store next to the repository (see the `lob-datastore` crate) and
//! move between clones through pluggable transports.
//!
//! This crate holds the engines on top of the storage and git layers:
//!
//! * [analyzer] maps the commit graph onto required LOB sets,
//! * [sync] implements fetch and push plus the per-remote push state
//!   cache,
//! * [prune] deletes content that is unreferenced, out of retention,
//!   or unlinked in the shared store,
//! * [checkout] splices content over placeholders in the working tree,
//! * [transport] defines the provider contract and ships the
//!   filesystem provider,
//! * [progress] carries transfer progress to the console.

pub mod analyzer;
pub mod checkout;
pub mod progress;
pub mod prune;
pub mod sync;
pub mod tools;
pub mod transport;
