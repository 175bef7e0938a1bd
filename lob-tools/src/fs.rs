//! File system helpers.
//!
//! All mutating writes go through a temporary file created with `mkstemp`
//! next to the target, followed by an atomic rename. This works across
//! processes and threads, and a crash never leaves a partial file at the
//! final name.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use nix::sys::stat;
use nix::unistd;

/// Create a directory and all of its parents.
pub fn create_path<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    let path = path.as_ref();
    std::fs::create_dir_all(path)
        .map_err(|err| format_err!("unable to create directory {:?} - {}", path, err))
}

/// Create a temporary file via `mkstemp`, using `path` with a
/// `.tmp_XXXXXX` extension as the template.
///
/// The returned path lives in the same directory as `path`, so a later
/// rename onto `path` stays on one file system.
pub fn make_tmp_file<P: AsRef<Path>>(path: P) -> Result<(File, PathBuf), Error> {
    let path = path.as_ref();

    let mut template = path.to_owned();
    template.set_extension("tmp_XXXXXX");

    let (fd, tmp_path) = match unistd::mkstemp(&template) {
        Ok((fd, path)) => (fd, path),
        Err(err) => bail!("mkstemp {:?} failed - {}", template, err),
    };

    // mkstemp creates the file mode 0600, loosen to the usual 0644
    let mode = stat::Mode::from_bits_truncate(0o644);
    if let Err(err) = stat::fchmod(fd, mode) {
        let _ = unistd::unlink(&tmp_path);
        bail!("fchmod {:?} failed - {}", tmp_path, err);
    }

    use std::os::unix::io::FromRawFd;
    let file = unsafe { File::from_raw_fd(fd) };

    Ok((file, tmp_path))
}

/// Atomically replace the contents of `path` with `data`.
pub fn replace_file<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), Error> {
    let path = path.as_ref();

    let (mut file, tmp_path) = make_tmp_file(path)?;

    if let Err(err) = file.write_all(data) {
        let _ = unistd::unlink(&tmp_path);
        bail!("writing {:?} failed - {}", tmp_path, err);
    }

    drop(file);

    if let Err(err) = std::fs::rename(&tmp_path, path) {
        let _ = unistd::unlink(&tmp_path);
        bail!("atomic rename to {:?} failed - {}", path, err);
    }

    Ok(())
}

/// Read a whole file into memory.
pub fn file_get_contents<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, Error> {
    let path = path.as_ref();
    std::fs::read(path).map_err(|err| format_err!("unable to read {:?} - {}", path, err))
}

/// Number of hard links pointing at `path`.
pub fn link_count<P: AsRef<Path>>(path: P) -> Result<u64, Error> {
    let path = path.as_ref();
    let st = stat::stat(path).map_err(|err| format_err!("unable to stat {:?} - {}", path, err))?;
    Ok(st.st_nlink as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn testdir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lob-tools-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn replace_file_is_atomic_and_readable() {
        let dir = testdir("replace");
        let target = dir.join("data.txt");

        replace_file(&target, b"first").unwrap();
        assert_eq!(file_get_contents(&target).unwrap(), b"first");

        replace_file(&target, b"second").unwrap();
        assert_eq!(file_get_contents(&target).unwrap(), b"second");

        // no temp leftovers
        let entries: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert_eq!(entries.len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn link_count_tracks_hard_links() {
        let dir = testdir("links");
        let a = dir.join("a");
        let b = dir.join("b");

        replace_file(&a, b"payload").unwrap();
        assert_eq!(link_count(&a).unwrap(), 1);

        std::fs::hard_link(&a, &b).unwrap();
        assert_eq!(link_count(&a).unwrap(), 2);
        assert_eq!(link_count(&b).unwrap(), 2);

        std::fs::remove_file(&a).unwrap();
        assert_eq!(link_count(&b).unwrap(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
