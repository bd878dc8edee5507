//! Indexed asset archives.
//!
//! An archive is a single file holding many named blobs behind a path index
//! that is read once at open time. Extraction is safe to call concurrently
//! from worker threads: the index is read-only after open, and the file
//! handle and byte cache each sit behind their own narrow mutex, held only
//! for the seek/read or map operation.
//!
//! # Layout
//! ```text
//! "FARC"            - magic
//! u32               - format version
//! u32               - entry count
//! entries           - path_len: u16, path: utf8, offset: u64, len: u64
//! blobs             - concatenated payloads
//! ```

mod cache;

pub use cache::ByteCache;

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const MAGIC: &[u8; 4] = b"FARC";
const FORMAT_VERSION: u32 = 1;

/// Default byte budget for the in-memory cache (64 MiB).
pub const DEFAULT_CACHE_BUDGET: usize = 64 * 1024 * 1024;

/// Files at or above this size bypass the byte cache (4 MiB).
pub const LARGE_FILE_THRESHOLD: usize = 4 * 1024 * 1024;

/// Errors from archive operations.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("path not found in archive: {0}")]
    NotFound(String),
    #[error("malformed archive: {0}")]
    Malformed(String),
    #[error("unsupported archive version: {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    offset: u64,
    len: u64,
}

/// Accumulates named blobs and writes them out as one archive file.
#[derive(Default)]
pub struct ArchiveBuilder {
    entries: Vec<(String, Vec<u8>)>,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a blob under a path. A repeated path replaces the earlier blob.
    pub fn add(&mut self, path: impl Into<String>, data: Vec<u8>) {
        let path = path.into();
        if let Some(slot) = self.entries.iter_mut().find(|(p, _)| *p == path) {
            slot.1 = data;
        } else {
            self.entries.push((path, data));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the archive to disk.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), ArchiveError> {
        let mut header_len = MAGIC.len() + 4 + 4;
        for (p, _) in &self.entries {
            header_len += 2 + p.len() + 8 + 8;
        }

        let mut out = Vec::with_capacity(header_len);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());

        let mut offset = header_len as u64;
        for (p, data) in &self.entries {
            out.extend_from_slice(&(p.len() as u16).to_le_bytes());
            out.extend_from_slice(p.as_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&(data.len() as u64).to_le_bytes());
            offset += data.len() as u64;
        }
        for (_, data) in &self.entries {
            out.extend_from_slice(data);
        }

        let mut file = File::create(path)?;
        file.write_all(&out)?;
        Ok(())
    }
}

/// A read-only open archive with an in-memory path index.
#[derive(Debug)]
pub struct Archive {
    index: HashMap<String, IndexEntry>,
    file: Mutex<File>,
    cache: Mutex<ByteCache>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Archive {
    /// Open an archive and load its index.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        Self::open_with_budget(path, DEFAULT_CACHE_BUDGET)
    }

    /// Open with an explicit byte-cache budget.
    pub fn open_with_budget(
        path: impl AsRef<Path>,
        cache_budget: usize,
    ) -> Result<Self, ArchiveError> {
        let mut file = File::open(path.as_ref())?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(ArchiveError::Malformed("bad magic".into()));
        }
        let version = read_u32(&mut file)?;
        if version != FORMAT_VERSION {
            return Err(ArchiveError::UnsupportedVersion(version));
        }
        let count = read_u32(&mut file)? as usize;

        let mut index = HashMap::with_capacity(count);
        for _ in 0..count {
            let path_len = read_u16(&mut file)? as usize;
            let mut path_bytes = vec![0u8; path_len];
            file.read_exact(&mut path_bytes)?;
            let entry_path = String::from_utf8(path_bytes)
                .map_err(|_| ArchiveError::Malformed("non-utf8 entry path".into()))?;
            let offset = read_u64(&mut file)?;
            let len = read_u64(&mut file)?;
            index.insert(entry_path, IndexEntry { offset, len });
        }

        tracing::debug!(entries = index.len(), path = %path.as_ref().display(), "opened archive");

        Ok(Self {
            index,
            file: Mutex::new(file),
            cache: Mutex::new(ByteCache::new(cache_budget)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Whether a path exists in this archive.
    pub fn has(&self, path: &str) -> bool {
        self.index.contains_key(path)
    }

    /// Number of indexed entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Extract the bytes for a path.
    ///
    /// Small files come from the byte cache when warm; large files always
    /// read from disk so one big asset cannot flush the whole cache.
    pub fn extract(&self, path: &str) -> Result<Arc<Vec<u8>>, ArchiveError> {
        let entry = *self
            .index
            .get(path)
            .ok_or_else(|| ArchiveError::NotFound(path.to_owned()))?;

        let cacheable = (entry.len as usize) < LARGE_FILE_THRESHOLD;
        if cacheable {
            let mut cache = self.cache.lock().expect("byte cache poisoned");
            if let Some(data) = cache.get(path) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(data);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let mut buf = vec![0u8; entry.len as usize];
        {
            let mut file = self.file.lock().expect("archive file poisoned");
            file.seek(SeekFrom::Start(entry.offset))?;
            file.read_exact(&mut buf)?;
        }
        let data = Arc::new(buf);

        if cacheable {
            let mut cache = self.cache.lock().expect("byte cache poisoned");
            cache.put(path, Arc::clone(&data));
        }
        Ok(data)
    }

    /// (hits, misses) since open.
    pub fn cache_stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

/// An ordered set of archives; later archives shadow earlier ones.
#[derive(Default)]
pub struct ArchiveSet {
    archives: Vec<Archive>,
}

impl ArchiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open all given archive files, in load order.
    pub fn open_all<P: AsRef<Path>>(paths: &[P]) -> Result<Self, ArchiveError> {
        Self::open_all_with_budget(paths, DEFAULT_CACHE_BUDGET)
    }

    /// Open all archives with an explicit per-archive byte-cache budget.
    pub fn open_all_with_budget<P: AsRef<Path>>(
        paths: &[P],
        cache_budget: usize,
    ) -> Result<Self, ArchiveError> {
        let mut set = Self::new();
        for p in paths {
            set.push(Archive::open_with_budget(p, cache_budget)?);
        }
        Ok(set)
    }

    pub fn push(&mut self, archive: Archive) {
        self.archives.push(archive);
    }

    pub fn has(&self, path: &str) -> bool {
        self.archives.iter().any(|a| a.has(path))
    }

    pub fn extract(&self, path: &str) -> Result<Arc<Vec<u8>>, ArchiveError> {
        for archive in self.archives.iter().rev() {
            if archive.has(path) {
                return archive.extract(path);
            }
        }
        Err(ArchiveError::NotFound(path.to_owned()))
    }

    /// Aggregate (hits, misses) across all archives.
    pub fn cache_stats(&self) -> (u64, u64) {
        self.archives.iter().fold((0, 0), |(h, m), a| {
            let (ah, am) = a.cache_stats();
            (h + ah, m + am)
        })
    }
}

fn read_u16(r: &mut impl Read) -> Result<u16, ArchiveError> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_le_bytes(b))
}

fn read_u32(r: &mut impl Read) -> Result<u32, ArchiveError> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_u64(r: &mut impl Read) -> Result<u64, ArchiveError> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

pub fn crate_info() -> &'static str {
    "farfield-archive v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_archive(entries: &[(&str, &[u8])]) -> tempfile::NamedTempFile {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut builder = ArchiveBuilder::new();
        for (path, data) in entries {
            builder.add(*path, data.to_vec());
        }
        builder.write_to(tmp.path()).unwrap();
        tmp
    }

    #[test]
    fn roundtrip_extract() {
        let tmp = build_archive(&[
            ("meshes/rock.bin", b"rock-bytes"),
            ("meshes/tree.bin", b"tree-bytes"),
        ]);
        let archive = Archive::open(tmp.path()).unwrap();

        assert_eq!(archive.len(), 2);
        assert!(archive.has("meshes/rock.bin"));
        assert!(!archive.has("meshes/missing.bin"));
        assert_eq!(
            archive.extract("meshes/tree.bin").unwrap().as_slice(),
            b"tree-bytes"
        );
    }

    #[test]
    fn missing_path_is_not_found() {
        let tmp = build_archive(&[("a", b"x")]);
        let archive = Archive::open(tmp.path()).unwrap();
        match archive.extract("b") {
            Err(ArchiveError::NotFound(p)) => assert_eq!(p, "b"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn repeated_extract_hits_cache() {
        let tmp = build_archive(&[("a", b"payload")]);
        let archive = Archive::open(tmp.path()).unwrap();

        archive.extract("a").unwrap();
        archive.extract("a").unwrap();
        archive.extract("a").unwrap();

        let (hits, misses) = archive.cache_stats();
        assert_eq!(misses, 1);
        assert_eq!(hits, 2);
    }

    #[test]
    fn large_files_bypass_cache() {
        let big = vec![7u8; LARGE_FILE_THRESHOLD];
        let tmp = build_archive(&[("big", &big)]);
        let archive = Archive::open(tmp.path()).unwrap();

        archive.extract("big").unwrap();
        archive.extract("big").unwrap();
        let (hits, misses) = archive.cache_stats();
        assert_eq!(hits, 0);
        assert_eq!(misses, 2);
    }

    #[test]
    fn truncated_file_is_malformed() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"FA").unwrap();
        assert!(Archive::open(tmp.path()).is_err());

        std::fs::write(tmp.path(), b"NOPE").unwrap();
        match Archive::open(tmp.path()) {
            Err(ArchiveError::Malformed(_)) => {}
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn concurrent_extract_is_safe() {
        let payloads: Vec<(String, Vec<u8>)> = (0..32)
            .map(|i| (format!("blob/{i}"), vec![i as u8; 128]))
            .collect();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut builder = ArchiveBuilder::new();
        for (p, d) in &payloads {
            builder.add(p.clone(), d.clone());
        }
        builder.write_to(tmp.path()).unwrap();

        let archive = std::sync::Arc::new(Archive::open(tmp.path()).unwrap());
        let mut handles = Vec::new();
        for t in 0..4 {
            let archive = std::sync::Arc::clone(&archive);
            let payloads = payloads.clone();
            handles.push(std::thread::spawn(move || {
                for (i, (p, d)) in payloads.iter().enumerate() {
                    if i % 4 == t {
                        assert_eq!(archive.extract(p).unwrap().as_slice(), d.as_slice());
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn open_all_with_budget_applies_budget() {
        let tmp = build_archive(&[("a", b"payload")]);

        // A budget smaller than the payload means nothing is retained, so
        // every extract goes back to disk.
        let set = ArchiveSet::open_all_with_budget(&[tmp.path()], 4).unwrap();
        set.extract("a").unwrap();
        set.extract("a").unwrap();
        let (hits, misses) = set.cache_stats();
        assert_eq!(hits, 0);
        assert_eq!(misses, 2);

        let set = ArchiveSet::open_all(&[tmp.path()]).unwrap();
        set.extract("a").unwrap();
        set.extract("a").unwrap();
        let (hits, misses) = set.cache_stats();
        assert_eq!(hits, 1);
        assert_eq!(misses, 1);
    }

    #[test]
    fn later_archive_shadows_earlier() {
        let base = build_archive(&[("a", b"base"), ("b", b"base-b")]);
        let patch = build_archive(&[("a", b"patch")]);

        let set = ArchiveSet::open_all(&[base.path(), patch.path()]).unwrap();
        assert_eq!(set.extract("a").unwrap().as_slice(), b"patch");
        assert_eq!(set.extract("b").unwrap().as_slice(), b"base-b");
        assert!(set.extract("c").is_err());
    }
}
