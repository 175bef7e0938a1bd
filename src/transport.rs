//! Provider abstraction over remote LOB object stores.

use std::path::Path;

use anyhow::Error;

use lob_config::{Config, ConfigError};

use crate::progress::ProgressEvent;

pub mod filesystem;

/// Transfers are interruptible at this granularity: the progress
/// callback fires and its abort flag is checked at least once per this
/// many bytes.
pub const ABORT_CHECK_BYTES: u64 = 128 * 1024;

/// Cancellation requested through a progress callback. Completed files
/// stay; the file in flight never appears at its final name.
#[derive(Debug, thiserror::Error)]
#[error("operation aborted")]
pub struct Aborted;

#[derive(Clone, Copy, Debug, Default)]
pub struct TransferStats {
    /// files actually transferred
    pub files: u64,
    /// bytes actually transferred
    pub bytes: u64,
    /// files skipped because the destination already matched
    pub skipped: u64,
    /// files missing at the source (downloads only; not an error)
    pub not_found: u64,
}

/// Contract every concrete transport provider implements.
///
/// A provider instance is bound to one remote at construction time.
/// Paths are store-relative strings (`xx/yy/<sha>_meta` and friends);
/// `base_dir` is the local side of the transfer.
///
/// Per-file semantics, both directions: when `force` is off and the
/// destination already exists with identical size, the file is skipped
/// with a `Skip` event. Transfers go through a temporary name and are
/// renamed into place on success, so partial files never appear at the
/// final name. A file missing on the remote during download is not an
/// error (`NotFound` event, continue); a file missing locally during
/// upload is.
pub trait Transport {
    fn type_id(&self) -> &'static str;

    /// The remote this provider was bound to.
    fn remote_name(&self) -> &str;

    /// Cheap sanity check of the provider configuration, run before
    /// any I/O.
    fn validate(&self) -> Result<(), Error>;

    fn exists(&self, path: &str) -> Result<bool, Error>;

    fn exists_of_size(&self, path: &str, size: u64) -> Result<bool, Error>;

    fn upload(
        &self,
        paths: &[String],
        base_dir: &Path,
        force: bool,
        progress: &mut dyn FnMut(&ProgressEvent) -> bool,
    ) -> Result<TransferStats, Error>;

    fn download(
        &self,
        paths: &[String],
        base_dir: &Path,
        force: bool,
        progress: &mut dyn FnMut(&ProgressEvent) -> bool,
    ) -> Result<TransferStats, Error>;
}

/// Instantiate the provider configured for `remote`.
pub fn from_config(config: &Config, remote: &str) -> Result<Box<dyn Transport>, Error> {
    let provider = config.remote_provider(remote)?;
    match provider.as_str() {
        filesystem::TYPE_ID => Ok(Box::new(filesystem::FilesystemTransport::from_config(
            config, remote,
        )?)),
        _ => Err(ConfigError::UnknownProvider {
            remote: remote.to_string(),
            provider,
        }
        .into()),
    }
}
