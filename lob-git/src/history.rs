use std::io::{BufRead, BufReader};
use std::process::Stdio;

use anyhow::{bail, format_err, Error};

use lob_datastore::placeholder::{parse_placeholder, PLACEHOLDER_LEN, PLACEHOLDER_PREFIX};

use crate::repo::GitRepo;

/// Which side of a diff a history walk reports.
///
/// `Additions` yields hashes introduced by a commit (`+` lines),
/// `Removals` yields hashes the commit replaced or deleted (`-` lines).
/// The removals direction is what retention analysis needs: a hash
/// removed by a commit inside a window was by definition current right
/// before that commit, even if it was introduced long before.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffSide {
    Additions,
    Removals,
    Both,
}

/// Placeholder hashes referenced by one commit's diff.
#[derive(Clone, Debug)]
pub struct CommitLobs {
    pub commit: String,
    /// committer date, seconds since the epoch
    pub date: i64,
    pub lobs: Vec<String>,
}

/// A ref together with its tip commit and date.
#[derive(Clone, Debug)]
pub struct RefInfo {
    pub name: String,
    pub commit: String,
    /// creator date of the tip, seconds since the epoch
    pub date: i64,
}

impl GitRepo {
    /// Stream commits whose diffs touch placeholder lines, newest
    /// first, invoking `f` once per commit. `f` returns `false` to stop
    /// the walk early.
    ///
    /// `revisions` is any set of git revision arguments (a ref, a
    /// range `a..b`, `--all`). Commits that do not touch placeholders
    /// never reach `f`.
    pub fn walk_diff_lobs(
        &self,
        revisions: &[String],
        pathspecs: &[String],
        side: DiffSide,
        f: &mut dyn FnMut(CommitLobs) -> Result<bool, Error>,
    ) -> Result<(), Error> {
        let pickaxe = format!("-G{}", PLACEHOLDER_PREFIX);
        let mut args: Vec<&str> = vec![
            "log",
            "--no-color",
            "-p",
            "--format=commit %H %ct",
            &pickaxe,
        ];
        for revision in revisions {
            args.push(revision);
        }
        if !pathspecs.is_empty() {
            args.push("--");
            args.extend(pathspecs.iter().map(|s| s.as_str()));
        }

        // stderr stays on the terminal; buffering it here could stall
        // the child once the pipe fills
        let mut child = self
            .git_command(&args)
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|err| format_err!("failed to spawn git log - {}", err))?;

        let mut reader = BufReader::new(child.stdout.take().unwrap());
        let mut line: Vec<u8> = Vec::new();
        let mut current: Option<CommitLobs> = None;
        let mut stopped = false;

        loop {
            line.clear();
            // diff content may be arbitrary bytes, never read lines as utf-8
            let n = reader
                .read_until(b'\n', &mut line)
                .map_err(|err| format_err!("reading git log output failed - {}", err))?;
            if n == 0 {
                break;
            }
            while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
                line.pop();
            }

            if let Some(rest) = line.strip_prefix(b"commit ") {
                if let Some(commit) = parse_commit_header(rest) {
                    if let Some(done) = current.take() {
                        if !f(done)? {
                            stopped = true;
                            break;
                        }
                    }
                    current = Some(commit);
                    continue;
                }
            }

            let current = match current.as_mut() {
                Some(current) => current,
                None => continue,
            };

            // "+git-lob: <sha>" / "-git-lob: <sha>", one byte of diff
            // marker in front of the fixed length placeholder
            if line.len() != PLACEHOLDER_LEN + 1 {
                continue;
            }
            let wanted = match line[0] {
                b'+' => side != DiffSide::Removals,
                b'-' => side != DiffSide::Additions,
                _ => false,
            };
            if !wanted {
                continue;
            }
            if let Some(sha) = parse_placeholder(&line[1..]) {
                if !current.lobs.contains(&sha) {
                    current.lobs.push(sha);
                }
            }
        }

        if stopped {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(());
        }

        if let Some(done) = current.take() {
            let _ = f(done)?;
        }

        let status = child
            .wait()
            .map_err(|err| format_err!("waiting for git log failed - {}", err))?;
        if !status.success() {
            bail!("git log exited with {}", status);
        }

        Ok(())
    }

    /// Branches (and optionally tags and remote-tracking refs) whose
    /// tip *commit* is strictly younger than `days` days at `now`, in
    /// reverse date order.
    ///
    /// Windows and ordering use the committer date of the commit a ref
    /// ultimately points at. For annotated tags that is the peeled
    /// commit's date, never the tag object's own creation date - a
    /// re-created tag on an old commit stays old, a stale tag on a
    /// fresh commit stays fresh.
    pub fn list_recent_refs(
        &self,
        days: u32,
        include_remote: bool,
        include_tags: bool,
        now: i64,
    ) -> Result<Vec<RefInfo>, Error> {
        let mut args: Vec<&str> = vec![
            "for-each-ref",
            "--format=%(refname)%00%(objectname)%00%(*objectname)%00%(committerdate:unix)%00%(*committerdate:unix)",
            "refs/heads",
        ];
        if include_remote {
            args.push("refs/remotes");
        }
        if include_tags {
            args.push("refs/tags");
        }

        let output = self.run_git(&args)?;
        let window = days as i64 * 86400;

        let mut refs = Vec::new();
        for record in output.lines() {
            if record.is_empty() {
                continue;
            }
            let fields: Vec<&str> = record.split('\0').collect();
            if fields.len() != 5 {
                bail!("unexpected for-each-ref output: {:?}", record);
            }
            // annotated tags carry the peeled commit and its date in the
            // dereferenced fields; everything else in the plain ones
            let commit = if fields[2].is_empty() { fields[1] } else { fields[2] };
            let date_field = if fields[4].is_empty() { fields[3] } else { fields[4] };
            let date: i64 = match date_field.parse() {
                Ok(date) => date,
                // refs peeling to objects without a committer date
                Err(_) => continue,
            };
            if now - date >= window {
                continue;
            }
            refs.push(RefInfo {
                name: fields[0].to_string(),
                commit: commit.to_string(),
                date,
            });
        }

        // for-each-ref can only sort by ref-level fields, which would
        // order tags by tag creation again; sort by commit date here
        refs.sort_by(|a, b| b.date.cmp(&a.date));

        Ok(refs)
    }
}

fn parse_commit_header(rest: &[u8]) -> Option<CommitLobs> {
    let text = std::str::from_utf8(rest).ok()?;
    let (sha, date) = text.split_once(' ')?;
    if sha.len() != 40 || !sha.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let date: i64 = date.trim().parse().ok()?;
    Some(CommitLobs {
        commit: sha.to_string(),
        date,
        lobs: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_header_parsing() {
        let header = b"4a7a719da9e0e978df06b69386f51b28d839b072 1700000000";
        let commit = parse_commit_header(header).unwrap();
        assert_eq!(commit.commit, "4a7a719da9e0e978df06b69386f51b28d839b072");
        assert_eq!(commit.date, 1700000000);
        assert!(commit.lobs.is_empty());

        assert!(parse_commit_header(b"not a header").is_none());
        assert!(parse_commit_header(b"4a7a719d 1700000000").is_none());
    }
}
