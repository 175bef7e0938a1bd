use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use openssl::sha::Sha1;

use lob_tools::fs::{create_path, link_count, make_tmp_file, replace_file};

use crate::error::StoreError;
use crate::lob_info::LobInfo;
use crate::{CHUNK_SIZE, SHA_HEX_LEN};

/// Buffer size for streaming chunk contents.
const COPY_BUFFER_SIZE: usize = 256 * 1024;

/// File system based content-addressed LOB store.
///
/// Files are splayed over two directory levels keyed by the first four
/// hex characters of the hash; the leaf directory holds `<sha>_meta`
/// plus `<sha>_<index>` chunk files.
///
/// With a shared store configured, new chunks are written into the
/// shared directory and hard-linked into the local store. Both
/// directories must be on the same file system.
#[derive(Clone)]
pub struct ChunkStore {
    local_dir: PathBuf,
    shared_dir: Option<PathBuf>,
}

fn splay(sha: &str) -> (&str, &str) {
    (&sha[0..2], &sha[2..4])
}

fn validate_sha(sha: &str) -> Result<(), StoreError> {
    if sha.len() != SHA_HEX_LEN || !sha.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(StoreError::Integrity {
            sha: sha.to_string(),
            reason: "malformed content hash".to_string(),
        });
    }
    Ok(())
}

impl ChunkStore {
    /// Open (creating on first use) the store rooted at `local_dir`,
    /// optionally backed by a machine-wide shared store.
    pub fn open<P: Into<PathBuf>>(local_dir: P, shared_dir: Option<PathBuf>) -> Result<Self, Error> {
        let local_dir = local_dir.into();
        create_path(&local_dir)?;

        if let Some(ref shared) = shared_dir {
            create_path(shared)?;
        }

        Ok(ChunkStore {
            local_dir,
            shared_dir,
        })
    }

    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    pub fn shared_dir(&self) -> Option<&Path> {
        self.shared_dir.as_deref()
    }

    /// Directory remote downloads are written into: the shared store
    /// when one is configured, the local store otherwise. After a
    /// download lands here, [ensure_local](Self::ensure_local) splices
    /// it into the local store.
    pub fn download_dir(&self) -> &Path {
        self.shared_dir.as_deref().unwrap_or(&self.local_dir)
    }

    /// Store-relative path of a metadata file, usable as a transport key.
    pub fn rel_meta_path(sha: &str) -> String {
        let (a, b) = splay(sha);
        format!("{}/{}/{}_meta", a, b, sha)
    }

    /// Store-relative path of a chunk file, usable as a transport key.
    pub fn rel_chunk_path(sha: &str, index: u32) -> String {
        let (a, b) = splay(sha);
        format!("{}/{}/{}_{}", a, b, sha, index)
    }

    fn leaf_dir(root: &Path, sha: &str) -> PathBuf {
        let (a, b) = splay(sha);
        root.join(a).join(b)
    }

    fn meta_path(root: &Path, sha: &str) -> PathBuf {
        Self::leaf_dir(root, sha).join(format!("{}_meta", sha))
    }

    fn chunk_path(root: &Path, sha: &str, index: u32) -> PathBuf {
        Self::leaf_dir(root, sha).join(format!("{}_{}", sha, index))
    }

    fn write_root(&self) -> &Path {
        self.download_dir()
    }

    /// All file names belonging to one LOB, metadata first.
    fn lob_file_names(info: &LobInfo) -> Vec<String> {
        let mut names = Vec::with_capacity(info.chunk_count as usize + 1);
        names.push(format!("{}_meta", info.sha));
        for index in 0..info.chunk_count {
            names.push(format!("{}_{}", info.sha, index));
        }
        names
    }

    /// Whether the LOB is locally present: the metadata file and every
    /// chunk file resolve to a file in the local store. Sizes are only
    /// verified by [check](Self::check); link targets are not inspected.
    pub fn exists(&self, sha: &str) -> bool {
        let info = match self.get_info(sha) {
            Ok(info) => info,
            Err(_) => return false,
        };
        (0..info.chunk_count)
            .all(|index| Self::chunk_path(&self.local_dir, sha, index).is_file())
    }

    /// Read the metadata record of a locally present LOB.
    pub fn get_info(&self, sha: &str) -> Result<LobInfo, StoreError> {
        validate_sha(sha)?;
        let path = Self::meta_path(&self.local_dir, sha);
        Self::read_meta(&path, sha)
    }

    fn read_meta(path: &Path, sha: &str) -> Result<LobInfo, StoreError> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    sha: sha.to_string(),
                    path: path.to_owned(),
                });
            }
            Err(err) => return Err(StoreError::io(path, err)),
        };

        let info = LobInfo::decode(&data).map_err(|err| StoreError::Integrity {
            sha: sha.to_string(),
            reason: format!("malformed metadata record - {}", err),
        })?;

        if info.sha != sha || info.chunk_count != crate::lob_info::chunk_count_for_size(info.size) {
            return Err(StoreError::Integrity {
                sha: sha.to_string(),
                reason: "metadata record contradicts itself".to_string(),
            });
        }

        Ok(info)
    }

    /// Consume `prefix` plus the rest of `input`, split the bytes into
    /// chunks and store them, hashing the full stream on the way.
    ///
    /// `prefix` holds bytes the caller already read off the stream while
    /// peeking for a placeholder. Chunks are written to temporary names
    /// and only promoted to their final names once the full stream
    /// hashed successfully; when the LOB turns out to exist already the
    /// fresh copies are discarded and the existing files win.
    pub fn store(&self, prefix: &[u8], input: &mut dyn Read) -> Result<LobInfo, Error> {
        let tmp_dir = self.write_root().join("tmp");
        create_path(&tmp_dir)?;

        let mut ingest = ChunkIngest::new(tmp_dir);
        ingest.write(prefix)?;

        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            match input.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => ingest.write(&buf[..n])?,
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(format_err!("reading LOB content failed - {}", err)),
            }
        }

        let (info, tmp_chunks) = ingest.finish()?;

        if self.exists(&info.sha) {
            // idempotent: identical content is already stored
            return Ok(info);
        }

        self.promote(&info, tmp_chunks)?;
        self.ensure_local(&info.sha)?;

        Ok(info)
    }

    /// Move hashed temp chunks to their final names and write the
    /// metadata record. Metadata is written first, so a LOB whose
    /// record exists but whose chunks are still missing fails `check`
    /// rather than producing a truncated retrieve.
    fn promote(&self, info: &LobInfo, tmp_chunks: TempChunks) -> Result<(), Error> {
        let root = self.write_root();
        create_path(Self::leaf_dir(root, &info.sha))?;

        let encoded = info
            .encode()
            .map_err(|err| format_err!("encoding metadata for {} failed - {}", info.sha, err))?;
        replace_file(Self::meta_path(root, &info.sha), encoded.as_bytes())?;

        let mut tmp_chunks = tmp_chunks;
        for (index, tmp_path) in tmp_chunks.paths.iter().enumerate() {
            let final_path = Self::chunk_path(root, &info.sha, index as u32);
            if final_path.is_file() {
                // another writer got here first with identical content
                let _ = std::fs::remove_file(tmp_path);
                continue;
            }
            std::fs::rename(tmp_path, &final_path).map_err(|err| {
                format_err!("promoting chunk to {:?} failed - {}", final_path, err)
            })?;
        }
        tmp_chunks.paths.clear();

        Ok(())
    }

    /// Make sure the local store has (links to) all files of a LOB that
    /// exists underneath [download_dir](Self::download_dir). A no-op
    /// without a shared store.
    pub fn ensure_local(&self, sha: &str) -> Result<LobInfo, Error> {
        validate_sha(sha).map_err(Error::from)?;

        let shared = match self.shared_dir {
            Some(ref shared) => shared,
            None => return self.get_info(sha).map_err(Error::from),
        };

        let info = Self::read_meta(&Self::meta_path(shared, sha), sha)?;

        create_path(Self::leaf_dir(&self.local_dir, sha))?;
        for name in Self::lob_file_names(&info) {
            let local = Self::leaf_dir(&self.local_dir, sha).join(&name);
            if local.is_file() {
                continue;
            }
            let shared_file = Self::leaf_dir(shared, sha).join(&name);
            match std::fs::hard_link(&shared_file, &local) {
                Ok(()) => (),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => (),
                Err(err) => bail!(
                    "hard link {:?} -> {:?} failed - {}",
                    shared_file,
                    local,
                    err
                ),
            }
        }

        Ok(info)
    }

    /// Metadata of a LOB downloaded into [download_dir](Self::download_dir),
    /// or `None` when the metadata file has not arrived.
    pub fn downloaded_info(&self, sha: &str) -> Result<Option<LobInfo>, Error> {
        validate_sha(sha).map_err(Error::from)?;
        match Self::read_meta(&Self::meta_path(self.download_dir(), sha), sha) {
            Ok(info) => Ok(Some(info)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Stream the full contents of a LOB into `output`.
    ///
    /// Chunks are copied in order through a fixed buffer; the content is
    /// never held in memory as a whole. The byte count is verified
    /// against the metadata record.
    pub fn retrieve(&self, sha: &str, output: &mut dyn Write) -> Result<LobInfo, StoreError> {
        let info = self.get_info(sha)?;

        let mut total: u64 = 0;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];

        for index in 0..info.chunk_count {
            let path = Self::chunk_path(&self.local_dir, sha, index);
            let mut file = match File::open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StoreError::NotFound {
                        sha: sha.to_string(),
                        path,
                    });
                }
                Err(err) => return Err(StoreError::io(path, err)),
            };

            loop {
                let n = match file.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(StoreError::io(&path, err)),
                };
                output
                    .write_all(&buf[..n])
                    .map_err(|err| StoreError::io(&path, err))?;
                total += n as u64;
            }
        }

        if total != info.size {
            return Err(StoreError::Integrity {
                sha: sha.to_string(),
                reason: format!("retrieved {} bytes, expected {}", total, info.size),
            });
        }

        Ok(info)
    }

    /// Verify the on-disk state of a LOB.
    ///
    /// Shallow mode checks that every file exists with its exact
    /// expected size. Deep mode additionally re-hashes the concatenated
    /// chunks and compares against the declared hash.
    pub fn check(&self, sha: &str, deep: bool) -> Result<(), StoreError> {
        let info = self.get_info(sha)?;

        for index in 0..info.chunk_count {
            let path = Self::chunk_path(&self.local_dir, sha, index);
            let metadata = match std::fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StoreError::NotFound {
                        sha: sha.to_string(),
                        path,
                    });
                }
                Err(err) => return Err(StoreError::io(path, err)),
            };

            let expected = info.chunk_size(index);
            if metadata.len() != expected {
                return Err(StoreError::WrongSize {
                    path,
                    expected,
                    actual: metadata.len(),
                });
            }
        }

        if deep {
            let mut hasher = HashingSink::new();
            self.retrieve(sha, &mut hasher)?;
            let actual = hasher.finish();
            if actual != sha.to_lowercase() {
                return Err(StoreError::Integrity {
                    sha: sha.to_string(),
                    reason: format!("content hashes to {}", actual),
                });
            }
        }

        Ok(())
    }

    /// Delete a LOB: local chunk files first, the metadata record last.
    ///
    /// Works off the leaf directory listing rather than the metadata
    /// record, so a LOB with a broken record can still be removed. With
    /// a shared store, any shared file whose link count drops to one
    /// afterwards is removed as well.
    pub fn delete(&self, sha: &str) -> Result<(), StoreError> {
        validate_sha(sha)?;

        let leaf = Self::leaf_dir(&self.local_dir, sha);
        let prefix = format!("{}_", sha);
        let meta_name = format!("{}_meta", sha);

        let mut names: Vec<String> = Vec::new();
        match std::fs::read_dir(&leaf) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry.map_err(|err| StoreError::io(&leaf, err))?;
                    if let Some(name) = entry.file_name().to_str() {
                        if name.starts_with(&prefix) {
                            names.push(name.to_string());
                        }
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
            Err(err) => return Err(StoreError::io(&leaf, err)),
        }

        // chunks first, metadata last
        names.sort_by_key(|name| name == &meta_name);

        for name in &names {
            let path = leaf.join(name);
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    return Err(StoreError::io(path, err));
                }
            }

            if let Some(ref shared) = self.shared_dir {
                let shared_file = Self::leaf_dir(shared, sha).join(name);
                if shared_file.is_file() {
                    if let Ok(1) = link_count(&shared_file) {
                        if let Err(err) = std::fs::remove_file(&shared_file) {
                            if err.kind() != std::io::ErrorKind::NotFound {
                                return Err(StoreError::io(shared_file, err));
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// All hashes with a metadata record in the local store, sorted.
    pub fn list_lobs(&self) -> Result<Vec<String>, Error> {
        let mut shas = Vec::new();

        for entry in walkdir::WalkDir::new(&self.local_dir)
            .min_depth(3)
            .max_depth(3)
        {
            let entry = entry
                .map_err(|err| format_err!("walking store {:?} failed - {}", self.local_dir, err))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = match entry.file_name().to_str() {
                Some(name) => name,
                None => continue,
            };
            if let Some(sha) = name.strip_suffix("_meta") {
                if sha.len() == SHA_HEX_LEN && sha.bytes().all(|b| b.is_ascii_hexdigit()) {
                    shas.push(sha.to_string());
                }
            }
        }

        shas.sort();
        Ok(shas)
    }

    /// Whether the local store holds no LOB at all.
    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.list_lobs()?.is_empty())
    }
}

/// Incremental chunk writer used by [ChunkStore::store].
///
/// Bytes stream into temp files of at most [CHUNK_SIZE] each while the
/// overall hash accumulates. Dropping the ingest before the chunks were
/// promoted removes all temp files.
struct ChunkIngest {
    tmp_dir: PathBuf,
    hasher: Sha1,
    total: u64,
    /// open chunk file and bytes written to it so far; its path is
    /// already tracked in `chunks`
    current: Option<(File, u64)>,
    chunks: TempChunks,
}

struct TempChunks {
    paths: Vec<PathBuf>,
}

impl Drop for TempChunks {
    fn drop(&mut self) {
        for path in &self.paths {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl ChunkIngest {
    fn new(tmp_dir: PathBuf) -> Self {
        ChunkIngest {
            tmp_dir,
            hasher: Sha1::new(),
            total: 0,
            current: None,
            chunks: TempChunks { paths: Vec::new() },
        }
    }

    fn write(&mut self, mut data: &[u8]) -> Result<(), Error> {
        self.hasher.update(data);
        self.total += data.len() as u64;

        while !data.is_empty() {
            if self.current.is_none() {
                let template = self.tmp_dir.join("ingest");
                let (file, path) = make_tmp_file(template)?;
                self.chunks.paths.push(path);
                self.current = Some((file, 0));
            }

            let (file, written) = self.current.as_mut().unwrap();
            let space = (CHUNK_SIZE - *written) as usize;
            let take = space.min(data.len());

            file.write_all(&data[..take])
                .map_err(|err| format_err!("writing chunk temp file failed - {}", err))?;
            *written += take as u64;
            data = &data[take..];

            if *written == CHUNK_SIZE {
                self.current = None;
            }
        }

        Ok(())
    }

    fn finish(mut self) -> Result<(LobInfo, TempChunks), Error> {
        self.current = None;

        let digest = std::mem::replace(&mut self.hasher, Sha1::new()).finish();
        let sha = hex::encode(digest);

        let info = LobInfo::new(sha, self.total);
        let chunks = std::mem::replace(&mut self.chunks, TempChunks { paths: Vec::new() });

        if chunks.paths.len() as u32 != info.chunk_count {
            bail!(
                "chunk accounting broke for {}: wrote {} chunks, expected {}",
                info.sha,
                chunks.paths.len(),
                info.chunk_count
            );
        }

        Ok((info, chunks))
    }
}

/// Write adapter feeding retrieved bytes straight into a hasher.
struct HashingSink {
    hasher: Sha1,
}

impl HashingSink {
    fn new() -> Self {
        HashingSink { hasher: Sha1::new() }
    }

    fn finish(self) -> String {
        hex::encode(self.hasher.finish())
    }
}

impl Write for HashingSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.hasher.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn testdir(name: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("lob-store-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn open_store(dir: &Path) -> ChunkStore {
        ChunkStore::open(dir.join("content"), None).unwrap()
    }

    #[test]
    fn store_and_retrieve_small() {
        let dir = testdir("small");
        let store = open_store(&dir);

        let payload = b"some binary payload".to_vec();
        let info = store.store(&[], &mut &payload[..]).unwrap();
        assert_eq!(info.size, payload.len() as u64);
        assert_eq!(info.chunk_count, 1);

        let mut out = Vec::new();
        store.retrieve(&info.sha, &mut out).unwrap();
        assert_eq!(out, payload);

        assert!(store.exists(&info.sha));
        store.check(&info.sha, true).unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn store_empty_lob() {
        let dir = testdir("empty");
        let store = open_store(&dir);

        let info = store.store(&[], &mut std::io::empty()).unwrap();
        assert_eq!(info.size, 0);
        assert_eq!(info.chunk_count, 0);
        // sha1 of the empty string
        assert_eq!(info.sha, "da39a3ee5e6b4b0d3255bfef95601890afd80709");

        let mut out = Vec::new();
        store.retrieve(&info.sha, &mut out).unwrap();
        assert!(out.is_empty());
        store.check(&info.sha, true).unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn store_uses_prefix_bytes() {
        let dir = testdir("prefix");
        let store = open_store(&dir);

        let full = b"prefix-and-remainder".to_vec();
        let direct = store.store(&full, &mut std::io::empty()).unwrap();
        let split = store.store(&full[..6], &mut &full[6..]).unwrap();
        assert_eq!(direct.sha, split.sha);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn store_is_idempotent() {
        let dir = testdir("idempotent");
        let store = open_store(&dir);

        let payload = vec![0x5au8; 4096];
        let first = store.store(&[], &mut &payload[..]).unwrap();
        let second = store.store(&[], &mut &payload[..]).unwrap();
        assert_eq!(first, second);

        // no temp leftovers in the ingest directory
        let tmp = store.local_dir().join("tmp");
        let leftovers: Vec<_> = std::fs::read_dir(tmp).unwrap().collect();
        assert!(leftovers.is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn check_detects_wrong_size_and_corruption() {
        let dir = testdir("check");
        let store = open_store(&dir);

        let payload = vec![7u8; 1000];
        let info = store.store(&[], &mut &payload[..]).unwrap();

        let chunk0 = ChunkStore::chunk_path(store.local_dir(), &info.sha, 0);
        std::fs::write(&chunk0, vec![7u8; 999]).unwrap();
        match store.check(&info.sha, false) {
            Err(StoreError::WrongSize {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 1000);
                assert_eq!(actual, 999);
            }
            other => panic!("expected WrongSize, got {:?}", other.err()),
        }

        // right size, wrong bytes: only deep mode notices
        std::fs::write(&chunk0, vec![8u8; 1000]).unwrap();
        store.check(&info.sha, false).unwrap();
        match store.check(&info.sha, true) {
            Err(StoreError::Integrity { .. }) => (),
            other => panic!("expected Integrity, got {:?}", other.err()),
        }

        std::fs::remove_file(&chunk0).unwrap();
        match store.check(&info.sha, false) {
            Err(StoreError::NotFound { .. }) => (),
            other => panic!("expected NotFound, got {:?}", other.err()),
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn delete_removes_all_files() {
        let dir = testdir("delete");
        let store = open_store(&dir);

        let payload = vec![1u8; 100];
        let info = store.store(&[], &mut &payload[..]).unwrap();
        assert!(store.exists(&info.sha));

        store.delete(&info.sha).unwrap();
        assert!(!store.exists(&info.sha));
        assert!(matches!(
            store.get_info(&info.sha),
            Err(StoreError::NotFound { .. })
        ));

        // deleting a missing LOB is fine
        store.delete(&info.sha).unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn shared_store_links_and_refcounts() {
        let dir = testdir("shared");
        let shared = dir.join("shared");
        let store_a = ChunkStore::open(dir.join("a"), Some(shared.clone())).unwrap();
        let store_b = ChunkStore::open(dir.join("b"), Some(shared.clone())).unwrap();

        let payload = vec![0xabu8; 2048];
        let info = store_a.store(&[], &mut &payload[..]).unwrap();
        assert!(store_a.exists(&info.sha));

        let shared_chunk = ChunkStore::chunk_path(&shared, &info.sha, 0);
        assert_eq!(link_count(&shared_chunk).unwrap(), 2);

        // second repository picks the content up without copying
        store_b.ensure_local(&info.sha).unwrap();
        assert!(store_b.exists(&info.sha));
        assert_eq!(link_count(&shared_chunk).unwrap(), 3);

        // deleting from one store keeps the shared copy alive
        store_b.delete(&info.sha).unwrap();
        assert!(!store_b.exists(&info.sha));
        assert_eq!(link_count(&shared_chunk).unwrap(), 2);
        assert!(store_a.exists(&info.sha));
        store_a.check(&info.sha, true).unwrap();

        // deleting the last reference removes the shared copy too
        store_a.delete(&info.sha).unwrap();
        assert!(!shared_chunk.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn list_lobs_reports_stored_hashes() {
        let dir = testdir("list");
        let store = open_store(&dir);
        assert!(store.is_empty().unwrap());

        let one = store.store(&[], &mut &b"one"[..]).unwrap();
        let two = store.store(&[], &mut &b"two"[..]).unwrap();

        let mut expected = vec![one.sha, two.sha];
        expected.sort();
        assert_eq!(store.list_lobs().unwrap(), expected);
        assert!(!store.is_empty().unwrap());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
