//! Reference analysis: mapping the commit graph onto the sets of LOBs
//! an operation has to care about.

use std::collections::HashSet;

use anyhow::Error;

use lob_config::RetentionWindows;
use lob_git::{CommitLobs, DiffSide, GitRepo};

use crate::progress::{ProgressEvent, ProgressKind};
use crate::sync::PushStateCache;

/// Slack subtracted from window boundaries before a history walk stops
/// early, to ride out commit date skew. Inclusion in a window is always
/// decided strictly per commit; the slack only delays the walk cutoff.
const DATE_SKEW_SLACK: i64 = 86400;

pub struct ReferenceAnalyzer<'a> {
    repo: &'a GitRepo,
    pathspecs: Vec<String>,
}

impl<'a> ReferenceAnalyzer<'a> {
    pub fn new(repo: &'a GitRepo, pathspecs: Vec<String>) -> Self {
        ReferenceAnalyzer { repo, pathspecs }
    }

    /// The LOBs required to materialize the tree of one commit.
    pub fn checkout_set(&self, commit: &str) -> Result<HashSet<String>, Error> {
        let lobs = self.repo.list_tree_lobs(commit, &self.pathspecs)?;
        Ok(lobs.into_iter().map(|lob| lob.sha).collect())
    }

    /// The LOBs that were current at any point within `days` days
    /// before the tip of a ref: the tip's checkout set, plus everything
    /// on the removed side of diffs of commits inside the window. A
    /// hash removed by a commit in the window was current right before
    /// it, which covers content introduced long before the boundary but
    /// still live across it.
    ///
    /// A commit is inside the window iff its date is strictly within
    /// `days` days of the tip's date; `days == 0` keeps the tip tree
    /// only.
    pub fn ref_window_set(
        &self,
        tip: &str,
        tip_date: Option<i64>,
        days: u32,
    ) -> Result<HashSet<String>, Error> {
        let mut set = self.checkout_set(tip)?;
        if days == 0 {
            return Ok(set);
        }

        let tip_date = match tip_date {
            Some(date) => date,
            None => self.repo.commit_summary(tip)?.date,
        };
        let window = days as i64 * 86400;
        let cutoff = tip_date - window - DATE_SKEW_SLACK;

        self.repo.walk_diff_lobs(
            &[tip.to_string()],
            &self.pathspecs,
            DiffSide::Removals,
            &mut |commit: CommitLobs| {
                if commit.date < cutoff {
                    return Ok(false);
                }
                if tip_date - commit.date < window {
                    set.extend(commit.lobs);
                }
                Ok(true)
            },
        )?;

        Ok(set)
    }

    /// The recent set: the union of per-ref window sets over all refs
    /// whose tip is strictly within `windows.refs_days` of `now`. The
    /// current head is walked first with the head window; other refs
    /// follow in reverse date order with the other-refs window.
    /// Duplicate tips are collapsed.
    pub fn recent_set(
        &self,
        windows: &RetentionWindows,
        now: i64,
        progress: &mut dyn FnMut(&ProgressEvent) -> bool,
    ) -> Result<HashSet<String>, Error> {
        let mut required = HashSet::new();
        let mut seen_tips: HashSet<String> = HashSet::new();

        // an unborn HEAD means an empty repository, nothing to require
        let head = match self.repo.resolve("HEAD") {
            Ok(head) => head,
            Err(_) => return Ok(required),
        };

        progress(&ProgressEvent::note(ProgressKind::Calculate, "examining HEAD"));
        seen_tips.insert(head.clone());
        required.extend(self.ref_window_set(&head, None, windows.head_days)?);

        for reference in self
            .repo
            .list_recent_refs(windows.refs_days, true, true, now)?
        {
            if !seen_tips.insert(reference.commit.clone()) {
                continue;
            }
            progress(&ProgressEvent::note(
                ProgressKind::Calculate,
                format!("examining {}", reference.name),
            ));
            required.extend(self.ref_window_set(
                &reference.commit,
                Some(reference.date),
                windows.other_days,
            )?);
        }

        Ok(required)
    }

    /// Commits to consider for a push, newest first.
    ///
    /// Each ref expression (`tip` or `bound..tip`) walks from its tip
    /// down to its latest pushed ancestor; the walk also stops at the
    /// first commit already marked pushed, since everything below is
    /// marked too. With `ignore_cache` the full history is walked.
    pub fn push_set(
        &self,
        cache: &PushStateCache,
        remote: &str,
        ref_exprs: &[String],
        ignore_cache: bool,
    ) -> Result<Vec<CommitLobs>, Error> {
        let mut commits: Vec<CommitLobs> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for expr in ref_exprs {
            let (bound, tip) = match expr.split_once("..") {
                Some((from, to)) => {
                    let to = if to.is_empty() { "HEAD" } else { to };
                    (Some(self.repo.resolve(from)?), self.repo.resolve(to)?)
                }
                None => {
                    let tip = self.repo.resolve(expr)?;
                    let bound = if ignore_cache {
                        None
                    } else {
                        cache.latest_pushed_ancestor(self.repo, remote, &tip)?
                    };
                    (bound, tip)
                }
            };

            if bound.as_deref() == Some(tip.as_str()) {
                continue;
            }

            let revisions = match &bound {
                Some(bound) => vec![format!("{}..{}", bound, tip)],
                None => vec![tip.clone()],
            };

            self.repo.walk_diff_lobs(
                &revisions,
                &self.pathspecs,
                DiffSide::Additions,
                &mut |commit: CommitLobs| {
                    if !ignore_cache && cache.contains(remote, &commit.commit)? {
                        return Ok(false);
                    }
                    if seen.insert(commit.commit.clone()) {
                        commits.push(commit);
                    }
                    Ok(true)
                },
            )?;
        }

        Ok(commits)
    }

    /// Every LOB referenced anywhere in reachable history (both diff
    /// sides across all refs) or staged in the index. Anything outside
    /// this set is garbage.
    pub fn reachable_set(&self) -> Result<HashSet<String>, Error> {
        let mut set: HashSet<String> = self
            .repo
            .list_index_lobs(&self.pathspecs)?
            .into_iter()
            .map(|lob| lob.sha)
            .collect();

        if self.repo.resolve("HEAD").is_ok() {
            self.repo.walk_diff_lobs(
                &["--all".to_string(), "HEAD".to_string()],
                &self.pathspecs,
                DiffSide::Both,
                &mut |commit: CommitLobs| {
                    set.extend(commit.lobs);
                    Ok(true)
                },
            )?;
        }

        Ok(set)
    }

    /// Map every LOB to the commits that introduced it, across all
    /// reachable history.
    pub fn introductions(
        &self,
    ) -> Result<std::collections::HashMap<String, Vec<String>>, Error> {
        let mut map: std::collections::HashMap<String, Vec<String>> =
            std::collections::HashMap::new();

        if self.repo.resolve("HEAD").is_ok() {
            self.repo.walk_diff_lobs(
                &["--all".to_string(), "HEAD".to_string()],
                &self.pathspecs,
                DiffSide::Additions,
                &mut |commit: CommitLobs| {
                    for sha in commit.lobs {
                        map.entry(sha).or_default().push(commit.commit.clone());
                    }
                    Ok(true)
                },
            )?;
        }

        Ok(map)
    }
}
