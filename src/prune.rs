//! Deletion of local LOBs that are no longer needed.
//!
//! Two independent routines plus the shared store sweep:
//!
//! * prune-unreferenced removes content nothing in reachable history or
//!   the index points at anymore (after history rewrites).
//! * prune-by-retention removes content outside the retention windows,
//!   but only once it is known to be pushed; optionally re-verified
//!   against the remote (safe mode).
//! * prune-shared removes shared store files whose hard link count
//!   dropped to one, meaning no local store references them.

use std::collections::HashMap;

use anyhow::{bail, Error};
use walkdir::WalkDir;

use lob_config::Config;
use lob_datastore::ChunkStore;
use lob_git::GitRepo;
use lob_tools::epoch_i64;
use lob_tools::fs::link_count;

use crate::analyzer::ReferenceAnalyzer;
use crate::progress::{ProgressEvent, ProgressKind};
use crate::sync::PushStateCache;
use crate::transport::Transport;

#[derive(Clone, Copy, Debug, Default)]
pub struct PruneStats {
    pub retained_referenced: u64,
    pub retained_recent: u64,
    pub retained_not_pushed: u64,
    pub deleted: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SharedPruneStats {
    pub examined: u64,
    pub deleted: u64,
}

/// Remove every local LOB no reachable commit and no index entry
/// references. Both diff sides of all refs count as references; a hash
/// that ever was current somewhere in retained history is kept.
pub fn prune_unreferenced(
    store: &ChunkStore,
    repo: &GitRepo,
    config: &Config,
    dry_run: bool,
    progress: &mut dyn FnMut(&ProgressEvent) -> bool,
) -> Result<PruneStats, Error> {
    let analyzer = ReferenceAnalyzer::new(repo, config.pathspecs());

    progress(&ProgressEvent::note(
        ProgressKind::Calculate,
        "collecting referenced LOBs",
    ));
    let referenced = analyzer.reachable_set()?;

    let mut stats = PruneStats::default();
    for sha in store.list_lobs()? {
        if progress(&ProgressEvent::note(ProgressKind::Working, sha.as_str())) {
            return Err(Error::new(crate::transport::Aborted));
        }

        if referenced.contains(&sha) {
            stats.retained_referenced += 1;
            progress(&ProgressEvent::note(
                ProgressKind::RetainReferenced,
                sha.as_str(),
            ));
            continue;
        }

        if !dry_run {
            store.delete(&sha)?;
        }
        stats.deleted += 1;
        progress(&ProgressEvent::note(ProgressKind::Deleted, sha.as_str()));
    }

    Ok(stats)
}

/// Remove local LOBs that fell out of the retention windows, provided
/// they are marked pushed - and, in safe mode, provided the remote
/// still answers for them.
///
/// The push state cache is advisory: it may say a commit was pushed,
/// but it is never the sole justification for deleting data when safe
/// mode is on. Without any usable remote, safe mode refuses to delete
/// at all.
pub fn prune_retention(
    store: &ChunkStore,
    repo: &GitRepo,
    config: &Config,
    cache: &PushStateCache,
    transports: &[Box<dyn Transport>],
    dry_run: bool,
    progress: &mut dyn FnMut(&ProgressEvent) -> bool,
) -> Result<PruneStats, Error> {
    let analyzer = ReferenceAnalyzer::new(repo, config.pathspecs());

    progress(&ProgressEvent::note(
        ProgressKind::Calculate,
        "computing retention set",
    ));
    let recent = analyzer.recent_set(&config.retention, epoch_i64(), progress)?;
    let introduced = analyzer.introductions()?;

    let remotes: Vec<String> = if config.prune_remote == "*" {
        repo.list_remotes()?
    } else {
        vec![config.prune_remote.clone()]
    };

    if config.prune_safe && transports.is_empty() {
        // without a usable remote nothing can be verified; every
        // candidate below will be retained as not-pushed
        log::warn!("safe prune has no usable remote to verify against, retaining everything");
    }

    let mut stats = PruneStats::default();
    for sha in store.list_lobs()? {
        if progress(&ProgressEvent::note(ProgressKind::Working, sha.as_str())) {
            return Err(Error::new(crate::transport::Aborted));
        }

        if recent.contains(&sha) {
            stats.retained_recent += 1;
            progress(&ProgressEvent::note(ProgressKind::RetainByDate, sha.as_str()));
            continue;
        }

        let commits = introduced.get(&sha).map(|v| v.as_slice()).unwrap_or(&[]);
        let pushed_remote = remotes.iter().find(|remote| {
            commits
                .iter()
                .any(|commit| cache.contains(remote, commit).unwrap_or(false))
        });

        let deletable = match pushed_remote {
            None => false,
            Some(remote) => {
                if config.prune_safe {
                    verify_on_remote(store, transports, remote, &sha)?
                } else {
                    true
                }
            }
        };

        if !deletable {
            stats.retained_not_pushed += 1;
            progress(&ProgressEvent::note(
                ProgressKind::RetainNotPushed,
                sha.as_str(),
            ));
            continue;
        }

        if !dry_run {
            store.delete(&sha)?;
        }
        stats.deleted += 1;
        progress(&ProgressEvent::note(ProgressKind::Deleted, sha.as_str()));
    }

    Ok(stats)
}

/// Re-confirm that a remote actually holds a LOB before deleting the
/// local copy. Probes the first chunk (or the metadata record for an
/// empty LOB).
fn verify_on_remote(
    store: &ChunkStore,
    transports: &[Box<dyn Transport>],
    remote: &str,
    sha: &str,
) -> Result<bool, Error> {
    let transport = match transports.iter().find(|t| t.remote_name() == remote) {
        Some(transport) => transport,
        None => return Ok(false),
    };

    let probe = match store.get_info(sha) {
        Ok(info) if info.chunk_count > 0 => ChunkStore::rel_chunk_path(sha, 0),
        _ => ChunkStore::rel_meta_path(sha),
    };

    transport.exists(&probe)
}

/// Sweep the shared store: every chunk or metadata file whose link
/// count is exactly one belongs to no local store anymore and is
/// removed. Files still linked from any repository are left alone.
pub fn prune_shared(
    store: &ChunkStore,
    dry_run: bool,
    progress: &mut dyn FnMut(&ProgressEvent) -> bool,
) -> Result<SharedPruneStats, Error> {
    let shared = match store.shared_dir() {
        Some(shared) => shared,
        None => bail!("no shared store is configured"),
    };

    let mut stats = SharedPruneStats::default();

    for entry in WalkDir::new(shared).min_depth(3).max_depth(3) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        stats.examined += 1;

        let desc = entry.path().strip_prefix(shared).unwrap_or(entry.path());
        let desc = desc.to_string_lossy().to_string();
        if progress(&ProgressEvent::note(ProgressKind::Working, desc.as_str())) {
            return Err(Error::new(crate::transport::Aborted));
        }

        if link_count(entry.path())? != 1 {
            continue;
        }

        if !dry_run {
            std::fs::remove_file(entry.path())?;
        }
        stats.deleted += 1;
        progress(&ProgressEvent::note(ProgressKind::Deleted, desc));
    }

    Ok(stats)
}
