//! Narrow query surface around the `git` binary.
//!
//! Everything git-lob needs from the host VCS goes through here:
//! resolving references, locating the repository directories, listing
//! placeholder blobs in trees and the index, streaming the diff history
//! for placeholder changes, and enumerating refs and remotes.
//!
//! Every invocation that exits non-zero surfaces as an error carrying
//! git's stderr.

mod history;
mod repo;
mod tree;

pub use history::{CommitLobs, DiffSide, RefInfo};
pub use repo::{CommitSummary, GitRepo};
pub use tree::TreeLob;
