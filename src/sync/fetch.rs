use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Error};

use lob_config::Config;
use lob_datastore::ChunkStore;
use lob_git::GitRepo;
use lob_tools::epoch_i64;

use crate::analyzer::ReferenceAnalyzer;
use crate::progress::{ProgressEvent, ProgressKind};
use crate::sync::PushStateCache;
use crate::tools::worker_pool::WorkerPool;
use crate::transport::Transport;

/// Worker threads verifying and splicing downloaded LOBs.
const VERIFY_THREADS: usize = 4;

#[derive(Clone, Debug, Default)]
pub struct FetchOptions {
    /// refs to fetch for; empty means "derive from the recent set"
    pub refs: Vec<String>,
    /// compute and report, but transfer nothing
    pub dry_run: bool,
    /// re-download content that is already present locally
    pub force: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FetchStats {
    /// LOBs the analysis deemed required
    pub required: u64,
    /// LOBs downloaded and verified this run
    pub fetched: u64,
    /// LOBs that were already present locally
    pub already_present: u64,
    /// LOBs whose metadata the remote does not have
    pub not_found: u64,
}

/// Download every LOB the retention analysis requires.
///
/// Metadata files are transferred first; the chunk list of each LOB is
/// only known once its metadata arrived. After the chunk pass each LOB
/// is spliced into the local store and shallow-checked on a small
/// worker pool. When the local store started out empty and everything
/// arrived intact, the head commit is recorded as pushed for this
/// remote - a clone that just received full parity clearly does not
/// need to upload history back.
pub fn fetch(
    store: &ChunkStore,
    repo: &GitRepo,
    config: &Config,
    transport: &dyn Transport,
    options: &FetchOptions,
    progress: &mut dyn FnMut(&ProgressEvent) -> bool,
) -> Result<FetchStats, Error> {
    transport.validate()?;

    let analyzer = ReferenceAnalyzer::new(repo, config.pathspecs());
    let mut stats = FetchStats::default();

    progress(&ProgressEvent::note(
        ProgressKind::Calculate,
        "calculating LOBs to fetch",
    ));

    let required: HashSet<String> = if options.refs.is_empty() {
        analyzer.recent_set(&config.fetch, epoch_i64(), progress)?
    } else {
        let mut required = HashSet::new();
        for refspec in &options.refs {
            let tip = repo.resolve(refspec)?;
            required.extend(analyzer.ref_window_set(&tip, None, config.fetch.head_days)?);
        }
        required
    };
    stats.required = required.len() as u64;

    let was_empty = store.is_empty()?;

    let mut needed: Vec<String> = Vec::new();
    for sha in &required {
        if !options.force && store.exists(sha) {
            stats.already_present += 1;
            if progress(&ProgressEvent::note(ProgressKind::Skip, sha.as_str())) {
                return Err(Error::new(crate::transport::Aborted));
            }
            continue;
        }
        needed.push(sha.clone());
    }
    needed.sort();

    if options.dry_run {
        for sha in &needed {
            progress(&ProgressEvent::note(
                ProgressKind::Calculate,
                format!("would fetch {}", sha),
            ));
        }
        return Ok(stats);
    }

    if needed.is_empty() {
        return Ok(stats);
    }

    // phase 1: metadata records
    let meta_paths: Vec<String> = needed
        .iter()
        .map(|sha| ChunkStore::rel_meta_path(sha))
        .collect();
    transport.download(&meta_paths, store.download_dir(), options.force, progress)?;

    // phase 2: chunks of every LOB whose metadata arrived
    let mut chunk_paths: Vec<String> = Vec::new();
    let mut have_meta: Vec<String> = Vec::new();
    for sha in &needed {
        match store.downloaded_info(sha)? {
            Some(info) => {
                for index in 0..info.chunk_count {
                    chunk_paths.push(ChunkStore::rel_chunk_path(sha, index));
                }
                have_meta.push(sha.clone());
            }
            // the transport already reported NotFound for the metadata
            None => stats.not_found += 1,
        }
    }
    transport.download(&chunk_paths, store.download_dir(), options.force, progress)?;

    // splice into the local store and shallow-verify in parallel
    let failures: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let pool = WorkerPool::new("fetch verify", VERIFY_THREADS, {
        let store = store.clone();
        let failures = Arc::clone(&failures);
        move |sha: String| {
            let outcome = store
                .ensure_local(&sha)
                .and_then(|_| store.check(&sha, false).map_err(Error::from));
            if let Err(err) = outcome {
                failures.lock().unwrap().push(format!("{} - {}", sha, err));
            }
            Ok(())
        }
    });
    for sha in &have_meta {
        pool.send(sha.clone())?;
    }
    pool.complete()?;

    let failures = Arc::try_unwrap(failures).unwrap().into_inner().unwrap();
    stats.fetched = (have_meta.len() - failures.len()) as u64;

    if !failures.is_empty() {
        for failure in &failures {
            progress(&ProgressEvent::note(ProgressKind::Error, failure.as_str()));
        }
        bail!(
            "{} of {} LOBs failed verification after download",
            failures.len(),
            have_meta.len()
        );
    }

    if was_empty && stats.not_found == 0 && !required.is_empty() {
        // full parity established from nothing: record the head commit
        // so the first push does not rewalk all of history
        let cache = PushStateCache::new(&repo.lob_dir());
        if let Ok(head) = repo.resolve("HEAD") {
            cache.mark(transport.remote_name(), &head)?;
        }
    }

    Ok(stats)
}
