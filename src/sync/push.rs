use std::collections::HashSet;

use anyhow::{Context, Error};

use lob_config::Config;
use lob_datastore::ChunkStore;
use lob_git::GitRepo;

use crate::analyzer::ReferenceAnalyzer;
use crate::progress::{ProgressEvent, ProgressKind};
use crate::sync::PushStateCache;
use crate::transport::Transport;

#[derive(Clone, Debug, Default)]
pub struct PushOptions {
    /// ref expressions to push (each may be a range `a..b`); empty
    /// means the current HEAD
    pub refs: Vec<String>,
    /// compute and report, but transfer nothing and mark nothing
    pub dry_run: bool,
    /// re-upload even what the remote already has, and ignore the push
    /// state cache
    pub force: bool,
    /// ignore the push state cache for the commit walk, but still skip
    /// per file when the remote already holds identical content
    pub recheck_remote: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PushStats {
    /// commits whose LOBs are now fully accounted for on the remote
    pub commits_marked: u64,
    /// LOBs uploaded this run
    pub uploaded: u64,
    /// LOBs skipped because the remote already has them
    pub skipped: u64,
    /// LOBs present neither locally nor on the remote
    pub not_found: u64,
}

/// Upload the LOBs referenced by unpushed history.
///
/// Commits are walked newest first, stopping at the latest pushed
/// ancestor. Per LOB:
///
/// * locally present: upload, metadata before chunks; the transport
///   skips files the remote already holds at identical size.
/// * missing locally but present on the remote: someone else pushed the
///   content already; skip and count the commit as covered.
/// * missing on both sides: report `NotFound` and leave the commit
///   unmarked, so a later push reconsiders it once the content exists
///   somewhere.
///
/// Each commit is marked in the push state cache as soon as its own
/// hash set resolved without error; a transport failure aborts the push
/// and leaves every unfinished commit unmarked.
pub fn push(
    store: &ChunkStore,
    repo: &GitRepo,
    config: &Config,
    transport: &dyn Transport,
    cache: &PushStateCache,
    options: &PushOptions,
    progress: &mut dyn FnMut(&ProgressEvent) -> bool,
) -> Result<PushStats, Error> {
    transport.validate()?;

    let refs = if options.refs.is_empty() {
        vec!["HEAD".to_string()]
    } else {
        options.refs.clone()
    };

    progress(&ProgressEvent::note(
        ProgressKind::Calculate,
        "calculating commits to push",
    ));

    let analyzer = ReferenceAnalyzer::new(repo, config.pathspecs());
    let ignore_cache = options.force || options.recheck_remote;
    let remote = transport.remote_name();
    let commits = analyzer.push_set(cache, remote, &refs, ignore_cache)?;

    let mut stats = PushStats::default();
    // hashes confirmed on the remote during this run
    let mut confirmed: HashSet<String> = HashSet::new();

    for commit in commits {
        let mut complete = true;

        for sha in &commit.lobs {
            if confirmed.contains(sha) {
                continue;
            }

            if store.exists(sha) {
                if options.dry_run {
                    progress(&ProgressEvent::note(
                        ProgressKind::Calculate,
                        format!("would push {}", sha),
                    ));
                    confirmed.insert(sha.clone());
                    continue;
                }

                let info = store.get_info(sha)?;
                // metadata strictly before chunks
                let mut paths = Vec::with_capacity(info.chunk_count as usize + 1);
                paths.push(ChunkStore::rel_meta_path(sha));
                for index in 0..info.chunk_count {
                    paths.push(ChunkStore::rel_chunk_path(sha, index));
                }

                let transfer = transport
                    .upload(&paths, store.local_dir(), options.force, progress)
                    .with_context(|| format!("upload of LOB {} failed", sha))?;

                if transfer.files > 0 {
                    stats.uploaded += 1;
                } else {
                    stats.skipped += 1;
                }
                confirmed.insert(sha.clone());
            } else if transport.exists(&ChunkStore::rel_meta_path(sha))? {
                // mixed state: a collaborator pushed this content
                // already; advancing over the commit is safe
                stats.skipped += 1;
                confirmed.insert(sha.clone());
                if progress(&ProgressEvent::note(ProgressKind::Skip, sha.as_str())) {
                    return Err(Error::new(crate::transport::Aborted));
                }
            } else {
                stats.not_found += 1;
                complete = false;
                if progress(&ProgressEvent::note(ProgressKind::NotFound, sha.as_str())) {
                    return Err(Error::new(crate::transport::Aborted));
                }
            }
        }

        if complete && !options.dry_run {
            cache.mark(remote, &commit.commit)?;
            stats.commits_marked += 1;
        }
    }

    Ok(stats)
}
