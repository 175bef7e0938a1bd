use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{bail, format_err, Error};

use lob_datastore::placeholder::{parse_placeholder, PLACEHOLDER_LEN};

use crate::repo::GitRepo;

/// A placeholder blob found in a tree or the index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeLob {
    /// Path of the tracked file, relative to the working tree root.
    pub path: PathBuf,
    /// Content hash embedded in the placeholder.
    pub sha: String,
}

impl GitRepo {
    /// All placeholder files in the tree of `commit`, optionally
    /// narrowed by pathspecs.
    ///
    /// `ls-tree -l` reports blob sizes, so everything that is not
    /// exactly placeholder sized is dismissed without reading it; the
    /// surviving candidates are read in one `cat-file --batch` pass.
    pub fn list_tree_lobs(&self, commit: &str, pathspecs: &[String]) -> Result<Vec<TreeLob>, Error> {
        let mut args: Vec<&str> = vec!["ls-tree", "-r", "-l", "-z", commit];
        if !pathspecs.is_empty() {
            args.push("--");
            args.extend(pathspecs.iter().map(|s| s.as_str()));
        }
        let output = self.run_git(&args)?;

        let mut candidates: Vec<(String, PathBuf)> = Vec::new();
        for entry in output.split('\0') {
            if entry.is_empty() {
                continue;
            }
            let (header, path) = entry
                .split_once('\t')
                .ok_or_else(|| format_err!("malformed ls-tree entry: {:?}", entry))?;
            let fields: Vec<&str> = header.split_whitespace().collect();
            if fields.len() != 4 || fields[1] != "blob" {
                continue;
            }
            if fields[3] != PLACEHOLDER_LEN.to_string() {
                continue;
            }
            candidates.push((fields[2].to_string(), PathBuf::from(path)));
        }

        self.filter_placeholder_blobs(candidates)
    }

    /// All placeholder files staged in the index.
    pub fn list_index_lobs(&self, pathspecs: &[String]) -> Result<Vec<TreeLob>, Error> {
        let mut args: Vec<&str> = vec!["ls-files", "--stage", "-z"];
        if !pathspecs.is_empty() {
            args.push("--");
            args.extend(pathspecs.iter().map(|s| s.as_str()));
        }
        let output = self.run_git(&args)?;

        let mut staged: Vec<(String, PathBuf)> = Vec::new();
        for entry in output.split('\0') {
            if entry.is_empty() {
                continue;
            }
            let (header, path) = entry
                .split_once('\t')
                .ok_or_else(|| format_err!("malformed ls-files entry: {:?}", entry))?;
            let fields: Vec<&str> = header.split_whitespace().collect();
            if fields.len() != 3 {
                continue;
            }
            staged.push((fields[1].to_string(), PathBuf::from(path)));
        }

        // ls-files has no size column; one batch-check pass prunes
        // everything that cannot be a placeholder before content is read
        let sizes = self.cat_file_batch_check(staged.iter().map(|(sha, _)| sha.clone()).collect())?;
        let candidates = staged
            .into_iter()
            .zip(sizes)
            .filter(|(_, size)| *size == Some(PLACEHOLDER_LEN as u64))
            .map(|((sha, path), _)| (sha, path))
            .collect();

        self.filter_placeholder_blobs(candidates)
    }

    /// Read candidate blobs and keep those whose content really is a
    /// placeholder, resolving them to the embedded LOB hash.
    fn filter_placeholder_blobs(
        &self,
        candidates: Vec<(String, PathBuf)>,
    ) -> Result<Vec<TreeLob>, Error> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let blobs = self.cat_file_batch(candidates.iter().map(|(sha, _)| sha.clone()).collect())?;

        let mut lobs = Vec::new();
        for ((_, path), content) in candidates.into_iter().zip(blobs) {
            let content = match content {
                Some(content) => content,
                None => continue,
            };
            if let Some(sha) = parse_placeholder(&content) {
                lobs.push(TreeLob { path, sha });
            }
        }
        Ok(lobs)
    }

    /// Object sizes for a list of blob ids, in input order; `None` for
    /// missing objects.
    fn cat_file_batch_check(&self, ids: Vec<String>) -> Result<Vec<Option<u64>>, Error> {
        self.cat_file(ids, false)?
            .into_iter()
            .map(|entry| Ok(entry.map(|(size, _)| size)))
            .collect()
    }

    /// Blob contents for a list of blob ids, in input order; `None` for
    /// missing objects.
    fn cat_file_batch(&self, ids: Vec<String>) -> Result<Vec<Option<Vec<u8>>>, Error> {
        self.cat_file(ids, true)?
            .into_iter()
            .map(|entry| Ok(entry.map(|(_, content)| content)))
            .collect()
    }

    /// Drive one `cat-file --batch`/`--batch-check` child process.
    ///
    /// The ids are fed from a separate thread; writing them all up
    /// front would deadlock once the output pipe fills up.
    fn cat_file(
        &self,
        ids: Vec<String>,
        with_content: bool,
    ) -> Result<Vec<Option<(u64, Vec<u8>)>>, Error> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mode = if with_content { "--batch" } else { "--batch-check" };
        let mut child = self
            .git_command(&["cat-file", mode])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|err| format_err!("failed to spawn git cat-file - {}", err))?;

        let mut stdin = child.stdin.take().unwrap();
        let count = ids.len();
        let feeder = std::thread::spawn(move || -> Result<(), std::io::Error> {
            for id in ids {
                stdin.write_all(id.as_bytes())?;
                stdin.write_all(b"\n")?;
            }
            Ok(())
        });

        let mut reader = BufReader::new(child.stdout.take().unwrap());
        let mut results = Vec::with_capacity(count);

        for _ in 0..count {
            let mut header = String::new();
            if reader.read_line(&mut header)? == 0 {
                bail!("git cat-file ended early");
            }
            let header = header.trim_end();
            let fields: Vec<&str> = header.split_whitespace().collect();

            if fields.len() == 2 && (fields[1] == "missing" || fields[1] == "ambiguous") {
                results.push(None);
                continue;
            }
            if fields.len() != 3 {
                bail!("unexpected git cat-file header: {:?}", header);
            }
            let size: u64 = fields[2]
                .parse()
                .map_err(|err| format_err!("bad object size in {:?} - {}", header, err))?;

            if with_content {
                let mut content = vec![0u8; size as usize];
                reader.read_exact(&mut content)?;
                let mut newline = [0u8; 1];
                reader.read_exact(&mut newline)?;
                results.push(Some((size, content)));
            } else {
                results.push(Some((size, Vec::new())));
            }
        }

        let _ = feeder.join();
        let status = child
            .wait()
            .map_err(|err| format_err!("waiting for git cat-file failed - {}", err))?;
        if !status.success() {
            bail!("git cat-file exited with {}", status);
        }

        Ok(results)
    }
}
