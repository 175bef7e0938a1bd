//! The file system transport: a remote that is just another directory,
//! typically a network mount shared between collaborators.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use lob_config::{Config, ConfigError};
use lob_tools::fs::{create_path, make_tmp_file};

use crate::progress::{ProgressEvent, ProgressKind};
use crate::transport::{Aborted, TransferStats, Transport, ABORT_CHECK_BYTES};

pub const TYPE_ID: &str = "filesystem";

pub struct FilesystemTransport {
    remote_name: String,
    root: PathBuf,
}

impl FilesystemTransport {
    pub fn new(remote_name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        FilesystemTransport {
            remote_name: remote_name.into(),
            root: root.into(),
        }
    }

    pub fn from_config(config: &Config, remote: &str) -> Result<Self, Error> {
        let path = config
            .remote_option(remote, "path")
            .ok_or_else(|| ConfigError::MissingOption {
                remote: remote.to_string(),
                key: "git-lob-path".to_string(),
            })?;
        Ok(Self::new(remote, path))
    }

    /// Copy one file through a temporary name, streaming progress and
    /// honoring the abort flag every [ABORT_CHECK_BYTES].
    fn copy_file(
        &self,
        src: &Path,
        dest: &Path,
        desc: &str,
        size: u64,
        overall_done: u64,
        overall_total: u64,
        progress: &mut dyn FnMut(&ProgressEvent) -> bool,
    ) -> Result<CopyOutcome, Error> {
        let mut input = File::open(src)
            .map_err(|err| format_err!("unable to open {:?} - {}", src, err))?;

        if let Some(parent) = dest.parent() {
            create_path(parent)?;
        }
        let (mut output, tmp_path) = make_tmp_file(dest)?;

        let mut buf = vec![0u8; ABORT_CHECK_BYTES as usize];
        let mut done: u64 = 0;

        loop {
            let n = match input.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    let _ = std::fs::remove_file(&tmp_path);
                    return Err(format_err!("reading {:?} failed - {}", src, err));
                }
            };
            if let Err(err) = output.write_all(&buf[..n]) {
                let _ = std::fs::remove_file(&tmp_path);
                return Err(format_err!("writing {:?} failed - {}", tmp_path, err));
            }
            done += n as u64;

            let event =
                ProgressEvent::transfer(desc, done, size, overall_done + done, overall_total);
            if progress(&event) {
                // no partial file may survive at the final name
                drop(output);
                let _ = std::fs::remove_file(&tmp_path);
                return Ok(CopyOutcome::Aborted);
            }
        }

        drop(output);
        if let Err(err) = std::fs::rename(&tmp_path, dest) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(format_err!("atomic rename to {:?} failed - {}", dest, err));
        }

        // final accounting event; the transfer is already complete, so
        // an abort request here only stops the files after this one
        let event = ProgressEvent::transfer(desc, size, size, overall_done + size, overall_total);
        let abort = progress(&event);

        Ok(CopyOutcome::Copied { aborted: abort })
    }

    fn transfer(
        &self,
        paths: &[String],
        base_dir: &Path,
        force: bool,
        direction: Direction,
        progress: &mut dyn FnMut(&ProgressEvent) -> bool,
    ) -> Result<TransferStats, Error> {
        let mut stats = TransferStats::default();
        let mut failures: Vec<String> = Vec::new();

        // plan source sizes up front so overall totals are meaningful
        let mut plan: Vec<(String, PathBuf, PathBuf, Option<u64>)> = Vec::new();
        let mut overall_total: u64 = 0;
        for path in paths {
            let (src, dest) = match direction {
                Direction::Upload => (base_dir.join(path), self.root.join(path)),
                Direction::Download => (self.root.join(path), base_dir.join(path)),
            };
            let size = std::fs::metadata(&src).ok().map(|meta| meta.len());
            overall_total += size.unwrap_or(0);
            plan.push((path.clone(), src, dest, size));
        }

        let mut overall_done: u64 = 0;
        for (path, src, dest, size) in plan {
            let size = match size {
                Some(size) => size,
                None => match direction {
                    Direction::Download => {
                        // missing on the remote: report and move on
                        stats.not_found += 1;
                        if progress(&ProgressEvent::note(ProgressKind::NotFound, &path)) {
                            return Err(Error::new(Aborted));
                        }
                        continue;
                    }
                    Direction::Upload => {
                        // missing local source during upload is an error
                        stats_error(&mut failures, &path, progress, "local file missing")?;
                        continue;
                    }
                },
            };

            if !force {
                let dest_size = std::fs::metadata(&dest).ok().map(|meta| meta.len());
                if dest_size == Some(size) {
                    stats.skipped += 1;
                    overall_done += size;
                    if progress(&ProgressEvent::note(ProgressKind::Skip, &path)) {
                        return Err(Error::new(Aborted));
                    }
                    continue;
                }
            }

            match self.copy_file(&src, &dest, &path, size, overall_done, overall_total, progress) {
                Ok(CopyOutcome::Copied { aborted }) => {
                    stats.files += 1;
                    stats.bytes += size;
                    overall_done += size;
                    if aborted {
                        return Err(Error::new(Aborted));
                    }
                }
                Ok(CopyOutcome::Aborted) => return Err(Error::new(Aborted)),
                Err(err) => {
                    stats_error(&mut failures, &path, progress, &err.to_string())?;
                }
            }
        }

        if !failures.is_empty() {
            bail!(
                "{} of {} transfers to remote '{}' failed: {}",
                failures.len(),
                paths.len(),
                self.remote_name,
                failures.join("; ")
            );
        }

        Ok(stats)
    }
}

fn stats_error(
    failures: &mut Vec<String>,
    path: &str,
    progress: &mut dyn FnMut(&ProgressEvent) -> bool,
    reason: &str,
) -> Result<(), Error> {
    failures.push(format!("{} ({})", path, reason));
    if progress(&ProgressEvent::note(
        ProgressKind::Error,
        format!("{}: {}", path, reason),
    )) {
        return Err(Error::new(Aborted));
    }
    Ok(())
}

enum CopyOutcome {
    Copied { aborted: bool },
    Aborted,
}

#[derive(Clone, Copy)]
enum Direction {
    Upload,
    Download,
}

impl Transport for FilesystemTransport {
    fn type_id(&self) -> &'static str {
        TYPE_ID
    }

    fn remote_name(&self) -> &str {
        &self.remote_name
    }

    fn validate(&self) -> Result<(), Error> {
        if self.root.as_os_str().is_empty() {
            bail!("remote '{}' has an empty git-lob-path", self.remote_name);
        }
        if self.root.exists() && !self.root.is_dir() {
            bail!(
                "git-lob-path {:?} of remote '{}' is not a directory",
                self.root,
                self.remote_name
            );
        }
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool, Error> {
        Ok(self.root.join(path).is_file())
    }

    fn exists_of_size(&self, path: &str, size: u64) -> Result<bool, Error> {
        match std::fs::metadata(self.root.join(path)) {
            Ok(meta) => Ok(meta.is_file() && meta.len() == size),
            Err(_) => Ok(false),
        }
    }

    fn upload(
        &self,
        paths: &[String],
        base_dir: &Path,
        force: bool,
        progress: &mut dyn FnMut(&ProgressEvent) -> bool,
    ) -> Result<TransferStats, Error> {
        self.transfer(paths, base_dir, force, Direction::Upload, progress)
    }

    fn download(
        &self,
        paths: &[String],
        base_dir: &Path,
        force: bool,
        progress: &mut dyn FnMut(&ProgressEvent) -> bool,
    ) -> Result<TransferStats, Error> {
        self.transfer(paths, base_dir, force, Direction::Download, progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressKind;

    fn testdir(name: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("lob-fs-transport-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_local(base: &Path, rel: &str, data: &[u8]) {
        let path = base.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    #[test]
    fn upload_then_download_round_trip() {
        let dir = testdir("roundtrip");
        let local = dir.join("local");
        let remote = dir.join("remote");
        let fetched = dir.join("fetched");

        write_local(&local, "ab/cd/abcd_meta", b"{\"meta\":1}");
        write_local(&local, "ab/cd/abcd_0", &vec![9u8; 300 * 1024]);

        let transport = FilesystemTransport::new("origin", &remote);
        transport.validate().unwrap();

        let paths = vec!["ab/cd/abcd_meta".to_string(), "ab/cd/abcd_0".to_string()];
        let mut events: Vec<ProgressEvent> = Vec::new();
        let stats = transport
            .upload(&paths, &local, false, &mut |event| {
                events.push(event.clone());
                false
            })
            .unwrap();

        assert_eq!(stats.files, 2);
        assert!(transport.exists("ab/cd/abcd_0").unwrap());
        assert!(transport
            .exists_of_size("ab/cd/abcd_0", 300 * 1024)
            .unwrap());
        assert!(!transport.exists_of_size("ab/cd/abcd_0", 1).unwrap());

        // last transfer event for each item reports done == total
        let last = events
            .iter()
            .filter(|e| e.kind == ProgressKind::TransferBytes && e.desc == "ab/cd/abcd_0")
            .last()
            .unwrap();
        assert_eq!(last.bytes_done, last.bytes_total);
        assert_eq!(last.bytes_total, 300 * 1024);

        let stats = transport
            .download(&paths, &fetched, false, &mut |_| false)
            .unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(
            std::fs::read(fetched.join("ab/cd/abcd_0")).unwrap(),
            vec![9u8; 300 * 1024]
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn existing_destination_is_skipped_unless_forced() {
        let dir = testdir("skip");
        let local = dir.join("local");
        let remote = dir.join("remote");

        write_local(&local, "ab/cd/abcd_0", b"same content");
        let transport = FilesystemTransport::new("origin", &remote);
        let paths = vec!["ab/cd/abcd_0".to_string()];

        transport.upload(&paths, &local, false, &mut |_| false).unwrap();
        let stats = transport.upload(&paths, &local, false, &mut |_| false).unwrap();
        assert_eq!(stats.files, 0);
        assert_eq!(stats.skipped, 1);

        let stats = transport.upload(&paths, &local, true, &mut |_| false).unwrap();
        assert_eq!(stats.files, 1);
        assert_eq!(stats.skipped, 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn download_of_missing_file_is_not_an_error() {
        let dir = testdir("missing");
        let remote = dir.join("remote");
        std::fs::create_dir_all(&remote).unwrap();

        let transport = FilesystemTransport::new("origin", &remote);
        let mut not_found = 0;
        let stats = transport
            .download(
                &["ab/cd/abcd_0".to_string()],
                &dir.join("fetched"),
                false,
                &mut |event| {
                    if event.kind == ProgressKind::NotFound {
                        not_found += 1;
                    }
                    false
                },
            )
            .unwrap();

        assert_eq!(stats.not_found, 1);
        assert_eq!(not_found, 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn upload_of_missing_local_file_is_an_error() {
        let dir = testdir("missing-local");
        let transport = FilesystemTransport::new("origin", dir.join("remote"));
        let err = transport
            .upload(
                &["ab/cd/abcd_0".to_string()],
                &dir.join("local"),
                false,
                &mut |_| false,
            )
            .unwrap_err();
        assert!(err.to_string().contains("failed"), "got: {}", err);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn abort_leaves_no_file_at_final_name() {
        let dir = testdir("abort");
        let local = dir.join("local");
        let remote = dir.join("remote");

        // large enough for several abort-check boundaries
        write_local(&local, "ab/cd/abcd_0", &vec![1u8; 512 * 1024]);

        let transport = FilesystemTransport::new("origin", &remote);
        let mut calls = 0;
        let result = transport.upload(
            &["ab/cd/abcd_0".to_string()],
            &local,
            false,
            &mut |event| {
                if event.kind == ProgressKind::TransferBytes {
                    calls += 1;
                    return calls >= 2;
                }
                false
            },
        );

        assert!(result.is_err());
        assert!(result.unwrap_err().downcast_ref::<Aborted>().is_some());
        assert!(!remote.join("ab/cd/abcd_0").exists());
        // no temporary leftovers either
        if let Ok(entries) = std::fs::read_dir(remote.join("ab/cd")) {
            assert_eq!(entries.count(), 0);
        }

        let _ = std::fs::remove_dir_all(&dir);
    }
}
