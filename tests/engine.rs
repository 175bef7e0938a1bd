//! End-to-end tests of the analyzer, sync and prune engines against
//! real git repositories.
//!
//! Each test builds a scratch repository with controlled commit dates.
//! When no `git` binary is available the tests print a notice and
//! return early.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use lob_config::{Config, RetentionWindows};
use lob_datastore::placeholder::format_placeholder;
use lob_datastore::ChunkStore;
use lob_git::GitRepo;
use lob_tools::epoch_i64;

use git_lob::analyzer::ReferenceAnalyzer;
use git_lob::checkout::checkout;
use git_lob::progress::discard;
use git_lob::prune::prune_retention;
use git_lob::sync::{fetch, push, FetchOptions, PushOptions, PushStateCache};
use git_lob::transport::filesystem::FilesystemTransport;
use git_lob::transport::Transport;

const DAY: i64 = 86400;

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

struct TestRepo {
    dir: PathBuf,
    work: PathBuf,
}

impl TestRepo {
    fn init(name: &str) -> Self {
        let dir = std::env::temp_dir().join(format!("lob-engine-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let work = dir.join("work");
        std::fs::create_dir_all(&work).unwrap();

        run_git(&work, &["init", "-q"], None);
        run_git(&work, &["config", "user.name", "lob test"], None);
        run_git(&work, &["config", "user.email", "lob@example.invalid"], None);
        run_git(&work, &["config", "commit.gpgsign", "false"], None);

        TestRepo { dir, work }
    }

    fn repo(&self) -> GitRepo {
        GitRepo::discover(&self.work).unwrap()
    }

    fn store(&self) -> ChunkStore {
        ChunkStore::open(self.repo().store_dir(), None).unwrap()
    }

    fn config(&self) -> Config {
        Config::load(&self.repo()).unwrap()
    }

    fn write(&self, rel: &str, data: &[u8]) {
        let path = self.work.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, data).unwrap();
    }

    /// Store `data` as a LOB and write its placeholder to `rel`.
    fn write_lob(&self, rel: &str, data: &[u8]) -> String {
        let info = self.store().store(data, &mut std::io::empty()).unwrap();
        self.write(rel, format_placeholder(&info.sha).as_bytes());
        info.sha
    }

    fn commit(&self, message: &str, date: i64) -> String {
        run_git(&self.work, &["add", "-A"], None);
        run_git(
            &self.work,
            &["commit", "-q", "--allow-empty", "-m", message],
            Some(date),
        );
        let out = run_git(&self.work, &["rev-parse", "HEAD"], None);
        out.trim().to_string()
    }

    fn remote_store_dir(&self) -> PathBuf {
        self.dir.join("remote-store")
    }

    /// Configure `origin` as a filesystem transport remote.
    fn configure_origin(&self) {
        run_git(
            &self.work,
            &["remote", "add", "origin", "../nowhere.git"],
            None,
        );
        run_git(
            &self.work,
            &["config", "remote.origin.git-lob-provider", "filesystem"],
            None,
        );
        let path = self.remote_store_dir();
        run_git(
            &self.work,
            &[
                "config",
                "remote.origin.git-lob-path",
                path.to_str().unwrap(),
            ],
            None,
        );
    }

    fn transport(&self) -> FilesystemTransport {
        FilesystemTransport::new("origin", self.remote_store_dir())
    }

    fn cache(&self) -> PushStateCache {
        PushStateCache::new(&self.repo().lob_dir())
    }

    fn cleanup(self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn run_git(work: &Path, args: &[&str], date: Option<i64>) -> String {
    let mut command = Command::new("git");
    command.current_dir(work).args(args);
    if let Some(date) = date {
        let stamp = format!("{} +0000", date);
        command.env("GIT_AUTHOR_DATE", &stamp);
        command.env("GIT_COMMITTER_DATE", &stamp);
    }
    let output = command.output().unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
fn checkout_replaces_only_placeholders() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let t = TestRepo::init("checkout");

    let content = b"real binary content\x00\x01\x02".to_vec();
    let sha = t.write_lob("asset.bin", &content);

    // exactly placeholder sized, but not a placeholder
    let decoy: Vec<u8> = vec![b'x'; 49];
    t.write("decoy.bin", &decoy);

    t.commit("add files", epoch_i64() - DAY);

    let repo = t.repo();
    let store = t.store();
    let stats = checkout(&store, &repo, &[], false, &mut discard()).unwrap();
    assert_eq!(stats.placeholders, 1);
    assert_eq!(stats.replaced, 1);
    assert_eq!(stats.missing, 0);

    assert_eq!(std::fs::read(t.work.join("asset.bin")).unwrap(), content);
    assert_eq!(std::fs::read(t.work.join("decoy.bin")).unwrap(), decoy);

    // a second pass finds nothing placeholder sized anymore
    let stats = checkout(&store, &repo, &[], false, &mut discard()).unwrap();
    assert_eq!(stats.placeholders, 0);
    let _ = sha;

    t.cleanup();
}

#[test]
fn recent_set_honors_window_boundaries() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let t = TestRepo::init("windows");
    let now = epoch_i64();

    // one file rewritten over time on the main branch
    let lob1 = t.write_lob("data.bin", b"version one");
    let v1 = t.commit("v1", now - 40 * DAY);
    let lob2 = t.write_lob("data.bin", b"version two");
    t.commit("v2", now - 20 * DAY);

    // an annotated tag created just now on the old commit; windows go
    // by the tagged commit's date, so this must not revive lob1
    run_git(&t.work, &["tag", "-a", "-m", "late tag", "v1.0", &v1], None);

    // a side branch that went stale long ago
    run_git(&t.work, &["checkout", "-q", "-b", "stale"], None);
    let lob_old = t.write_lob("old.bin", b"stale content");
    t.commit("stale work", now - 100 * DAY);
    run_git(&t.work, &["checkout", "-q", "-"], None);

    let lob3 = t.write_lob("data.bin", b"version three");
    t.commit("v3", now - 5 * DAY);

    let repo = t.repo();
    let analyzer = ReferenceAnalyzer::new(&repo, Vec::new());
    let windows = RetentionWindows {
        refs_days: 30,
        head_days: 7,
        other_days: 0,
    };
    let recent = analyzer.recent_set(&windows, now, &mut discard()).unwrap();

    // the tip tree plus what the in-window tip commit replaced
    let expected: HashSet<String> = [lob3.clone(), lob2.clone()].into_iter().collect();
    assert_eq!(recent, expected);
    assert!(!recent.contains(&lob1));
    assert!(!recent.contains(&lob_old));

    t.cleanup();
}

#[test]
fn push_then_fetch_round_trip() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let t = TestRepo::init("roundtrip");
    t.configure_origin();
    let now = epoch_i64();

    let content_a = vec![0xaau8; 4096];
    let content_b = b"second file".to_vec();
    let lob_a = t.write_lob("a.bin", &content_a);
    let lob_b = t.write_lob("b.bin", &content_b);
    let head = t.commit("add binaries", now - DAY);

    let repo = t.repo();
    let store = t.store();
    let config = t.config();
    let transport = t.transport();
    let cache = t.cache();

    let stats = push(
        &store,
        &repo,
        &config,
        &transport,
        &cache,
        &PushOptions::default(),
        &mut discard(),
    )
    .unwrap();
    assert_eq!(stats.uploaded, 2);
    assert_eq!(stats.not_found, 0);
    assert_eq!(stats.commits_marked, 1);
    assert!(cache.contains("origin", &head).unwrap());

    // both LOBs fully on the remote
    for sha in [&lob_a, &lob_b] {
        assert!(transport
            .exists(&ChunkStore::rel_meta_path(sha))
            .unwrap());
        assert!(transport
            .exists(&ChunkStore::rel_chunk_path(sha, 0))
            .unwrap());
    }

    // a second push has nothing to do: the walk stops at the marker
    let stats = push(
        &store,
        &repo,
        &config,
        &transport,
        &cache,
        &PushOptions::default(),
        &mut discard(),
    )
    .unwrap();
    assert_eq!(stats.uploaded, 0);
    assert_eq!(stats.commits_marked, 0);

    // wipe the local store and push state, then restore via fetch
    std::fs::remove_dir_all(repo.store_dir()).unwrap();
    cache.reset("origin").unwrap();
    let store = ChunkStore::open(repo.store_dir(), None).unwrap();
    assert!(!store.exists(&lob_a));

    let stats = fetch(
        &store,
        &repo,
        &config,
        &transport,
        &FetchOptions::default(),
        &mut discard(),
    )
    .unwrap();
    assert_eq!(stats.fetched, 2);
    assert_eq!(stats.not_found, 0);

    store.check(&lob_a, true).unwrap();
    store.check(&lob_b, true).unwrap();
    let mut out = Vec::new();
    store.retrieve(&lob_a, &mut out).unwrap();
    assert_eq!(out, content_a);

    // the store started empty and reached parity: head is recorded as
    // pushed so the next push walks nothing
    assert!(cache.contains("origin", &head).unwrap());

    t.cleanup();
}

#[test]
fn push_skips_content_already_on_remote() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let t = TestRepo::init("mixed-state");
    t.configure_origin();
    let now = epoch_i64();

    let lob = t.write_lob("a.bin", b"pushed by a colleague");
    t.commit("add a.bin", now - DAY);

    let repo = t.repo();
    let store = t.store();
    let config = t.config();
    let transport = t.transport();
    let cache = t.cache();

    // content reaches the remote through someone else's push
    push(
        &store,
        &repo,
        &config,
        &transport,
        &cache,
        &PushOptions::default(),
        &mut discard(),
    )
    .unwrap();

    // this clone loses the content and its push state
    std::fs::remove_dir_all(repo.store_dir()).unwrap();
    cache.reset("origin").unwrap();
    let store = ChunkStore::open(repo.store_dir(), None).unwrap();

    // missing locally but present remotely: skip, and still advance
    let head2 = t.write_lob("b.bin", b"new local work");
    let head2_commit = t.commit("add b.bin", now);
    let _ = head2;

    let stats = push(
        &store,
        &repo,
        &config,
        &transport,
        &cache,
        &PushOptions::default(),
        &mut discard(),
    )
    .unwrap();
    assert_eq!(stats.skipped, 1, "LOB {} should have been skipped", lob);
    assert_eq!(stats.uploaded, 1);
    assert_eq!(stats.not_found, 0);
    assert!(cache.contains("origin", &head2_commit).unwrap());

    t.cleanup();
}

#[test]
fn push_does_not_mark_commits_with_lost_content() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let t = TestRepo::init("lost");
    t.configure_origin();
    let now = epoch_i64();

    let lost = t.write_lob("lost.bin", b"never pushed, then lost");
    let commit_lost = t.commit("add lost.bin", now - 2 * DAY);
    t.write_lob("kept.bin", b"still here");
    let commit_kept = t.commit("add kept.bin", now - DAY);

    let repo = t.repo();
    let store = t.store();
    store.delete(&lost).unwrap();

    let config = t.config();
    let transport = t.transport();
    let cache = t.cache();

    let stats = push(
        &store,
        &repo,
        &config,
        &transport,
        &cache,
        &PushOptions::default(),
        &mut discard(),
    )
    .unwrap();

    // the reachable commit with intact content is marked, the one with
    // vanished content is not
    assert_eq!(stats.not_found, 1);
    assert!(cache.contains("origin", &commit_kept).unwrap());
    assert!(!cache.contains("origin", &commit_lost).unwrap());

    t.cleanup();
}

#[test]
fn pushed_set_is_downward_closed_after_full_push() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let t = TestRepo::init("closure");
    t.configure_origin();
    let now = epoch_i64();

    let mut commits = Vec::new();
    for n in 0..3 {
        t.write_lob(&format!("f{}.bin", n), format!("content {}", n).as_bytes());
        commits.push(t.commit(&format!("commit {}", n), now - (3 - n as i64) * DAY));
    }

    let repo = t.repo();
    let store = t.store();
    let config = t.config();
    let transport = t.transport();
    let cache = t.cache();

    push(
        &store,
        &repo,
        &config,
        &transport,
        &cache,
        &PushOptions::default(),
        &mut discard(),
    )
    .unwrap();

    // every ancestor of the marked head resolves to a pushed ancestor
    for commit in &commits {
        let latest = cache
            .latest_pushed_ancestor(&repo, "origin", commit)
            .unwrap();
        assert_eq!(latest.as_deref(), Some(commit.as_str()));
    }

    t.cleanup();
}

#[test]
fn prune_retains_unpushed_until_pushed() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let t = TestRepo::init("prune");
    t.configure_origin();
    let now = epoch_i64();

    // an old LOB, deleted from the tree well outside every window
    let lob = t.write_lob("big.bin", &vec![7u8; 8192]);
    t.commit("add big.bin", now - 60 * DAY);
    std::fs::remove_file(t.work.join("big.bin")).unwrap();
    t.commit("drop big.bin", now - 20 * DAY);
    t.write("readme.txt", b"nothing binary here");
    t.commit("docs", now - DAY);

    let repo = t.repo();
    let store = t.store();
    let config = t.config();
    let cache = t.cache();
    let transports: Vec<Box<dyn Transport>> = vec![Box::new(t.transport())];

    // not pushed anywhere: prune must retain it
    let stats = prune_retention(
        &store,
        &repo,
        &config,
        &cache,
        &transports,
        false,
        &mut discard(),
    )
    .unwrap();
    assert_eq!(stats.deleted, 0);
    assert_eq!(stats.retained_not_pushed, 1);
    assert!(store.exists(&lob));

    // push the history, then prune again: now it may go
    push(
        &store,
        &repo,
        &config,
        &t.transport(),
        &cache,
        &PushOptions::default(),
        &mut discard(),
    )
    .unwrap();

    let stats = prune_retention(
        &store,
        &repo,
        &config,
        &cache,
        &transports,
        false,
        &mut discard(),
    )
    .unwrap();
    assert_eq!(stats.deleted, 1);
    assert!(!store.exists(&lob));

    // the content is still safe on the remote
    assert!(t
        .transport()
        .exists(&ChunkStore::rel_chunk_path(&lob, 0))
        .unwrap());

    t.cleanup();
}

#[test]
fn safe_prune_requires_remote_confirmation() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let t = TestRepo::init("safe-prune");
    t.configure_origin();
    run_git(&t.work, &["config", "git-lob.prune-safe", "true"], None);
    let now = epoch_i64();

    let lob = t.write_lob("big.bin", &vec![9u8; 4096]);
    let commit = t.commit("add big.bin", now - 60 * DAY);
    std::fs::remove_file(t.work.join("big.bin")).unwrap();
    t.commit("drop big.bin", now - 20 * DAY);
    t.write("readme.txt", b"text");
    t.commit("docs", now - DAY);

    let repo = t.repo();
    let store = t.store();
    let config = t.config();
    assert!(config.prune_safe);
    let cache = t.cache();

    // the cache claims the commit was pushed, but the remote has
    // nothing: safe mode refuses the deletion
    cache.mark("origin", &commit).unwrap();
    let transports: Vec<Box<dyn Transport>> = vec![Box::new(t.transport())];
    let stats = prune_retention(
        &store,
        &repo,
        &config,
        &cache,
        &transports,
        false,
        &mut discard(),
    )
    .unwrap();
    assert_eq!(stats.deleted, 0);
    assert_eq!(stats.retained_not_pushed, 1);
    assert!(store.exists(&lob));

    // after a real push the verification passes
    cache.reset("origin").unwrap();
    push(
        &store,
        &repo,
        &config,
        &t.transport(),
        &cache,
        &PushOptions::default(),
        &mut discard(),
    )
    .unwrap();
    let stats = prune_retention(
        &store,
        &repo,
        &config,
        &cache,
        &transports,
        false,
        &mut discard(),
    )
    .unwrap();
    assert_eq!(stats.deleted, 1);
    assert!(!store.exists(&lob));

    t.cleanup();
}
