use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, format_err, Error};

use lob_tools::command::run_command;

/// Handle to one git repository.
///
/// Holds the resolved working tree root and git directory; the git
/// directory may live outside the working tree (`git init
/// --separate-git-dir`, worktrees, submodules), in which case `.git`
/// in the working tree is a file pointing at it.
pub struct GitRepo {
    work_root: PathBuf,
    git_dir: PathBuf,
    separate_git_dir: bool,
}

/// Condensed information about one commit.
#[derive(Clone, Debug)]
pub struct CommitSummary {
    pub short_sha: String,
    pub author: String,
    pub email: String,
    /// committer date, seconds since the epoch
    pub date: i64,
    pub subject: String,
}

impl GitRepo {
    /// Locate the repository containing `start`.
    pub fn discover<P: AsRef<Path>>(start: P) -> Result<Self, Error> {
        let mut command = Command::new("git");
        command
            .current_dir(start.as_ref())
            .args(["rev-parse", "--show-toplevel", "--absolute-git-dir"]);

        let output = run_command(command)?;
        let mut lines = output.lines();
        let work_root = PathBuf::from(
            lines
                .next()
                .ok_or_else(|| format_err!("git rev-parse returned no working tree root"))?,
        );
        let git_dir = PathBuf::from(
            lines
                .next()
                .ok_or_else(|| format_err!("git rev-parse returned no git dir"))?,
        );

        let separate_git_dir = git_dir != work_root.join(".git");

        Ok(GitRepo {
            work_root,
            git_dir,
            separate_git_dir,
        })
    }

    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    pub fn has_separate_git_dir(&self) -> bool {
        self.separate_git_dir
    }

    /// Directory all git-lob state lives under.
    pub fn lob_dir(&self) -> PathBuf {
        self.git_dir.join("git-lob")
    }

    /// Default location of the local content store.
    pub fn store_dir(&self) -> PathBuf {
        self.lob_dir().join("content")
    }

    /// A `git` command primed with this repository's working tree.
    pub(crate) fn git_command(&self, args: &[&str]) -> Command {
        let mut command = Command::new("git");
        command.current_dir(&self.work_root);
        command.args(args);
        command
    }

    /// Run a git subcommand to completion, returning stdout.
    pub fn run_git(&self, args: &[&str]) -> Result<String, Error> {
        run_command(self.git_command(args))
    }

    /// Resolve any commit-ish reference to a full 40-hex commit hash.
    pub fn resolve(&self, refspec: &str) -> Result<String, Error> {
        let spec = format!("{}^{{commit}}", refspec);
        let output = self.run_git(&["rev-parse", "--verify", "--quiet", &spec])
            .map_err(|err| format_err!("unable to resolve '{}' - {}", refspec, err))?;
        let sha = output.trim();
        if sha.len() != 40 || !sha.bytes().all(|b| b.is_ascii_hexdigit()) {
            bail!("'{}' did not resolve to a commit hash (got '{}')", refspec, sha);
        }
        Ok(sha.to_string())
    }

    /// The symbolic ref HEAD points at, or `None` on a detached head.
    pub fn head_ref(&self) -> Result<Option<String>, Error> {
        let output = self
            .git_command(&["symbolic-ref", "-q", "HEAD"])
            .output()
            .map_err(|err| format_err!("failed to execute git symbolic-ref - {}", err))?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
    }

    /// Configured remote names.
    pub fn list_remotes(&self) -> Result<Vec<String>, Error> {
        let output = self.run_git(&["remote"])?;
        Ok(output
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    pub fn commit_summary(&self, commit: &str) -> Result<CommitSummary, Error> {
        let output = self.run_git(&[
            "show",
            "-s",
            "--format=%h%x1f%an%x1f%ae%x1f%ct%x1f%s",
            commit,
        ])?;
        let line = output.trim_end_matches('\n');
        let fields: Vec<&str> = line.split('\x1f').collect();
        if fields.len() != 5 {
            bail!("unexpected commit summary output for '{}': {:?}", commit, line);
        }
        Ok(CommitSummary {
            short_sha: fields[0].to_string(),
            author: fields[1].to_string(),
            email: fields[2].to_string(),
            date: fields[3]
                .parse()
                .map_err(|err| format_err!("bad commit date '{}' - {}", fields[3], err))?,
            subject: fields[4].to_string(),
        })
    }

    /// One batch of ancestors of `commit` in reverse chronological
    /// order, starting at `commit` itself.
    pub fn rev_list_batch(&self, commit: &str, skip: usize, count: usize) -> Result<Vec<String>, Error> {
        let skip = format!("--skip={}", skip);
        let count = format!("--max-count={}", count);
        let output = self.run_git(&["rev-list", &skip, &count, commit])?;
        Ok(output.lines().map(|line| line.to_string()).collect())
    }

    /// Paths of all tracked files, relative to the working tree root.
    pub fn list_tracked_files(&self, pathspecs: &[String]) -> Result<Vec<PathBuf>, Error> {
        let mut args: Vec<&str> = vec!["ls-files", "-z"];
        if !pathspecs.is_empty() {
            args.push("--");
            args.extend(pathspecs.iter().map(|s| s.as_str()));
        }
        let output = self.run_git(&args)?;
        Ok(output
            .split('\0')
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    /// Dump the effective git configuration as key/value pairs.
    ///
    /// Section and variable names arrive lowercased from git itself;
    /// subsection names (e.g. remote names) keep their case.
    pub fn config_list(&self) -> Result<Vec<(String, String)>, Error> {
        let output = self.run_git(&["config", "--null", "--list"])?;
        let mut entries = Vec::new();
        for record in output.split('\0') {
            if record.is_empty() {
                continue;
            }
            match record.split_once('\n') {
                Some((key, value)) => entries.push((key.to_string(), value.to_string())),
                // a key without '=' has no value separator
                None => entries.push((record.to_string(), String::new())),
            }
        }
        Ok(entries)
    }
}
