//! Working tree checkout: replace placeholder files with the real
//! content from the store.

use anyhow::Error;

use lob_datastore::placeholder::{parse_placeholder, PLACEHOLDER_LEN};
use lob_datastore::{ChunkStore, StoreError};
use lob_git::GitRepo;
use lob_tools::fs::make_tmp_file;

use crate::progress::{ProgressEvent, ProgressKind};

#[derive(Clone, Copy, Debug, Default)]
pub struct CheckoutStats {
    /// placeholder files found in the working tree
    pub placeholders: u64,
    /// placeholders replaced with content
    pub replaced: u64,
    /// placeholders left in place because the content is not local
    pub missing: u64,
}

/// Walk the tracked files and splice stored content over placeholders.
///
/// The file size is the first filter: nothing that is not exactly
/// placeholder sized is even opened, so real working tree content is
/// never touched. Replacement goes through a temp file and rename,
/// preserving the original permissions.
pub fn checkout(
    store: &ChunkStore,
    repo: &GitRepo,
    pathspecs: &[String],
    dry_run: bool,
    progress: &mut dyn FnMut(&ProgressEvent) -> bool,
) -> Result<CheckoutStats, Error> {
    let mut stats = CheckoutStats::default();

    for rel in repo.list_tracked_files(pathspecs)? {
        let path = repo.work_root().join(&rel);

        let metadata = match std::fs::symlink_metadata(&path) {
            Ok(metadata) if metadata.is_file() => metadata,
            // deleted locally, or a symlink/directory: not ours
            _ => continue,
        };
        if metadata.len() != PLACEHOLDER_LEN as u64 {
            continue;
        }

        let data = std::fs::read(&path)?;
        let sha = match parse_placeholder(&data) {
            Some(sha) => sha,
            None => continue,
        };

        stats.placeholders += 1;
        let desc = rel.to_string_lossy().to_string();
        if progress(&ProgressEvent::note(ProgressKind::Working, desc.as_str())) {
            return Err(Error::new(crate::transport::Aborted));
        }

        if dry_run {
            if store.exists(&sha) {
                stats.replaced += 1;
            } else {
                stats.missing += 1;
            }
            continue;
        }

        let (mut file, tmp_path) = make_tmp_file(&path)?;
        match store.retrieve(&sha, &mut file) {
            Ok(_) => {
                drop(file);
                std::fs::set_permissions(&tmp_path, metadata.permissions())?;
                std::fs::rename(&tmp_path, &path)?;
                stats.replaced += 1;
            }
            Err(StoreError::NotFound { .. }) => {
                drop(file);
                let _ = std::fs::remove_file(&tmp_path);
                stats.missing += 1;
                if progress(&ProgressEvent::note(
                    ProgressKind::NotFound,
                    format!("{} ({})", desc, sha),
                )) {
                    return Err(Error::new(crate::transport::Aborted));
                }
            }
            Err(err) => {
                let _ = std::fs::remove_file(&tmp_path);
                return Err(err.into());
            }
        }
    }

    Ok(stats)
}
