use std::path::{Path, PathBuf};

use anyhow::{bail, Error};

use lob_git::GitRepo;
use lob_tools::fs::{create_path, file_get_contents, replace_file};

/// Ancestor batch size for [PushStateCache::latest_pushed_ancestor].
const ANCESTOR_BATCH: usize = 100;

/// Commit hash prefix length the cache files are splayed by.
const SPLAY_LEN: usize = 15;

/// Per-remote record of commits whose referenced LOBs are known to be
/// fully present on that remote.
///
/// Entries live under `state/push/<remote>/`, splayed by the first 15
/// hex characters of the commit hash; each file holds the full hashes
/// sharing that prefix as sorted, deduplicated, newline-terminated
/// lines. Rewrites go through temp-file-and-rename, so a crash leaves
/// either the old or the new file, never a torn one.
///
/// The cache is a hint. Resetting it must only ever cost extra
/// uploads; an entry is therefore written strictly after the uploads it
/// records have completed, and never speculatively.
pub struct PushStateCache {
    dir: PathBuf,
}

impl PushStateCache {
    /// Cache rooted under the repository's git-lob state directory.
    pub fn new(lob_dir: &Path) -> Self {
        PushStateCache {
            dir: lob_dir.join("state").join("push"),
        }
    }

    fn remote_dir(&self, remote: &str) -> PathBuf {
        self.dir.join(sanitize_remote_name(remote))
    }

    fn entry_file(&self, remote: &str, commit: &str) -> PathBuf {
        self.remote_dir(remote).join(&commit[..SPLAY_LEN])
    }

    /// Record `commit` as pushed to `remote`. A no-op if present.
    pub fn mark(&self, remote: &str, commit: &str) -> Result<(), Error> {
        validate_commit(commit)?;

        let path = self.entry_file(remote, commit);
        let mut entries = load_entries(&path)?;

        match entries.binary_search(&commit.to_string()) {
            Ok(_) => return Ok(()),
            Err(pos) => entries.insert(pos, commit.to_string()),
        }

        create_path(path.parent().unwrap())?;
        let mut data = entries.join("\n");
        data.push('\n');
        replace_file(&path, data.as_bytes())?;

        Ok(())
    }

    pub fn contains(&self, remote: &str, commit: &str) -> Result<bool, Error> {
        validate_commit(commit)?;
        let entries = load_entries(&self.entry_file(remote, commit))?;
        Ok(entries.binary_search(&commit.to_string()).is_ok())
    }

    /// Whether any remote's cache contains `commit`.
    pub fn contains_for_any(&self, commit: &str) -> Result<Option<String>, Error> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => bail!("unable to read push cache {:?} - {}", self.dir, err),
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let remote = entry.file_name().to_string_lossy().to_string();
            if self.contains(&remote, commit)? {
                return Ok(Some(remote));
            }
        }
        Ok(None)
    }

    /// Walk the ancestry of `commit` (starting at the commit itself) in
    /// batches and return the first ancestor marked pushed, or `None`
    /// when no ancestor anywhere in history is.
    pub fn latest_pushed_ancestor(
        &self,
        repo: &GitRepo,
        remote: &str,
        commit: &str,
    ) -> Result<Option<String>, Error> {
        // cheap out when the remote was never pushed to at all
        if !self.remote_dir(remote).is_dir() {
            return Ok(None);
        }

        let mut skip = 0;
        loop {
            let batch = repo.rev_list_batch(commit, skip, ANCESTOR_BATCH)?;
            for sha in &batch {
                if self.contains(remote, sha)? {
                    return Ok(Some(sha.clone()));
                }
            }
            if batch.len() < ANCESTOR_BATCH {
                return Ok(None);
            }
            skip += batch.len();
        }
    }

    /// Forget everything recorded for `remote`.
    pub fn reset(&self, remote: &str) -> Result<(), Error> {
        let dir = self.remote_dir(remote);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => bail!("unable to reset push cache {:?} - {}", dir, err),
        }
    }
}

fn validate_commit(commit: &str) -> Result<(), Error> {
    if commit.len() != 40 || !commit.bytes().all(|b| b.is_ascii_hexdigit()) {
        bail!("'{}' is not a full commit hash", commit);
    }
    Ok(())
}

fn load_entries(path: &Path) -> Result<Vec<String>, Error> {
    let data = match std::fs::metadata(path) {
        Ok(_) => file_get_contents(path)?,
        Err(_) => return Ok(Vec::new()),
    };

    let mut entries: Vec<String> = String::from_utf8_lossy(&data)
        .lines()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect();

    // the writer keeps files sorted and unique; enforce it on load so a
    // hand-edited file cannot break the binary search
    entries.sort();
    entries.dedup();
    Ok(entries)
}

/// Remote names may contain characters that are awkward in file names
/// (URLs can serve as remotes); map everything unusual to '_'.
fn sanitize_remote_name(remote: &str) -> String {
    remote
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
