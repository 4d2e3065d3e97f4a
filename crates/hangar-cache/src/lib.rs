//! Parse-or-load caching of configuration and manifest files.
//!
//! A [`ConfigCache`] owns an ordered list of source files plus a binary
//! on-disk cache keyed by each file's checksum. `parse()` either loads the
//! previously parsed objects from the cache or re-parses the changed subset
//! from source, and optionally folds all per-file objects into one merged
//! result.
//!
//! Cache read and write failures are never fatal: a broken or mismatching
//! cache is ignored with a warning and rebuilt on the next run.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod stream;

use hangar_core::{CancelToken, Error, Result};
use rayon::prelude::*;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Fixed magic number at the start of every cache file.
pub const CACHE_MAGIC: u32 = 0x23d3_9366;

/// Sources above this size are rejected: cache inputs are metadata, not
/// payload.
pub const MAX_SOURCE_SIZE: u64 = 1024 * 1024;

/// Caches with this many entries or more are considered corrupt.
const MAX_CACHE_ENTRIES: u32 = 1000;

/// Per-entry work is parallelized once the input count exceeds this.
const PARALLEL_THRESHOLD: usize = 2;

fn format_version() -> u32 {
    let major: u32 = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
    3 | (major << 24)
}

/// Behavior flags for [`ConfigCache::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Options(u32);

impl Options {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Neither read nor write the on-disk cache.
    pub const NO_CACHE: Self = Self(1 << 0);
    /// Delete the on-disk cache before parsing.
    pub const CLEAR_CACHE: Self = Self(1 << 1);
    /// Record unparseable sources as `None` instead of failing.
    pub const IGNORE_BROKEN: Self = Self(1 << 2);
    /// Fold all per-file objects into a single merged result.
    pub const MERGED_RESULT: Self = Self(1 << 3);

    /// Whether all flags in `other` are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Options {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Options {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// How a cached type is parsed, persisted and merged.
///
/// This is the adaptor between the generic cache machinery and one concrete
/// file type (package manifests, configuration fragments, ...). Cache blobs
/// use the [`stream`] framing primitives.
pub trait CacheFormat: Send + Sync {
    /// The parsed object type.
    type Item: Send;

    /// Parse an object from (pre-processed) source bytes.
    fn load_from_source(&self, content: &[u8], path: &Path) -> Result<Self::Item>;

    /// Reconstruct an object from its cache blob.
    fn load_from_cache(&self, blob: &[u8]) -> Result<Self::Item>;

    /// Serialize an object into a cache blob.
    fn save_to_cache(&self, item: &Self::Item) -> Result<Vec<u8>>;

    /// Hook run on the raw bytes before hashing and parsing (e.g. variable
    /// expansion). The default leaves the content untouched.
    fn pre_process_source(&self, _content: &mut Vec<u8>, _path: &Path) {}

    /// Clone an object to seed the merged result.
    fn clone_item(&self, item: &Self::Item) -> Self::Item;

    /// Fold `src` into the merged result `dst`. Later files may shadow
    /// earlier ones; folding is strictly sequential in input order.
    fn merge(&self, dst: &mut Self::Item, src: &Self::Item);
}

struct CacheEntry<T> {
    path: PathBuf,
    checksum: [u8; 20],
    content: Option<T>,
    raw: Vec<u8>,
}

impl<T> CacheEntry<T> {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            checksum: [0; 20],
            content: None,
            raw: Vec::new(),
        }
    }
}

/// Checksum-verified, on-disk cache of parsed source files.
///
/// Completeness is order-sensitive by design: the stored file list must equal
/// the input list *in order* for the fast path to apply, because the input
/// order is part of the cache key (it determines merge folding). A mere
/// re-ordering of unchanged inputs therefore re-parses nothing but rewrites
/// the cache file.
pub struct ConfigCache<F: CacheFormat> {
    format: F,
    raw_files: Vec<PathBuf>,
    base_name: String,
    type_id: [u8; 4],
    type_version: u32,
    options: Options,
    cache_dir: Option<PathBuf>,

    entries: Vec<CacheEntry<F::Item>>,
    index: HashMap<PathBuf, usize>,
    merged: Option<F::Item>,
    parsed: bool,
    cache_was_read: bool,
    cache_was_written: bool,
}

impl<F: CacheFormat> ConfigCache<F> {
    /// Create a cache over `files`, identified by `base_name` plus the 4-byte
    /// `type_id` and `type_version` of the persisted object format.
    pub fn new(
        format: F,
        files: Vec<PathBuf>,
        base_name: impl Into<String>,
        type_id: [u8; 4],
        type_version: u32,
        options: Options,
    ) -> Self {
        Self {
            format,
            raw_files: files,
            base_name: base_name.into(),
            type_id,
            type_version,
            options,
            cache_dir: None,
            entries: Vec::new(),
            index: HashMap::new(),
            merged: None,
            parsed: false,
            cache_was_read: false,
            cache_was_written: false,
        }
    }

    /// Override the cache directory (defaults to the user's cache location).
    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Absolute path of the on-disk cache file.
    #[must_use]
    pub fn cache_file_path(&self) -> PathBuf {
        let dir = self.cache_dir.clone().unwrap_or_else(default_cache_dir);
        dir.join(format!("appman-{}.cache", self.base_name))
    }

    /// Whether the previous `parse()` call loaded a usable cache file.
    #[must_use]
    pub fn parse_read_from_cache(&self) -> bool {
        self.cache_was_read
    }

    /// Whether the previous `parse()` call wrote a new cache file.
    #[must_use]
    pub fn parse_wrote_to_cache(&self) -> bool {
        self.cache_was_written
    }

    /// Number of inputs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.raw_files.len()
    }

    /// Whether the input list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw_files.is_empty()
    }

    /// Transfer ownership of the i-th parsed object out of the cache.
    ///
    /// Returns `None` if the index is out of range, the entry was marked
    /// broken, or the object was already taken.
    pub fn take_result(&mut self, index: usize) -> Option<F::Item> {
        debug_assert!(!self.options.contains(Options::MERGED_RESULT));
        self.entries.get_mut(index).and_then(|e| e.content.take())
    }

    /// Transfer ownership of the parsed object for `path` (canonicalized
    /// input path) out of the cache.
    pub fn take_result_by_path(&mut self, path: &Path) -> Option<F::Item> {
        let index = *self.index.get(path)?;
        self.take_result(index)
    }

    /// Transfer ownership of the merged object out of the cache.
    ///
    /// Only valid after a parse with [`Options::MERGED_RESULT`].
    pub fn take_merged_result(&mut self) -> Option<F::Item> {
        debug_assert!(self.options.contains(Options::MERGED_RESULT));
        self.merged.take()
    }

    /// Parse all inputs, consulting and refreshing the on-disk cache.
    ///
    /// # Errors
    /// Fails with [`Error::AlreadyParsed`] on reinvocation, with
    /// [`Error::DuplicateFile`] if two inputs canonicalize to the same
    /// location, with [`Error::FileTooBig`] for sources above 1 MiB, and
    /// with a parse error for broken sources unless
    /// [`Options::IGNORE_BROKEN`] is set. Cache read/write problems are
    /// logged and never fail the call.
    pub fn parse(&mut self) -> Result<()> {
        self.parse_with(&CancelToken::new())
    }

    /// Like [`parse`](Self::parse), checking `cancel` at entry boundaries.
    pub fn parse_with(&mut self, cancel: &CancelToken) -> Result<()> {
        if self.parsed {
            return Err(Error::AlreadyParsed);
        }
        self.parsed = true;

        if self.raw_files.is_empty() {
            return Ok(());
        }

        // normalize all input file names
        let mut paths: Vec<PathBuf> = Vec::with_capacity(self.raw_files.len());
        for raw in &self.raw_files {
            let path = fs::canonicalize(raw).map_err(|e| Error::io(raw, e))?;
            if paths.contains(&path) {
                return Err(Error::DuplicateFile { path });
            }
            paths.push(path);
        }

        let cache_path = self.cache_file_path();
        debug!(base = %self.base_name, cache = %cache_path.display(), "cache file");

        let mut cache_is_complete = false;
        let mut entries: Vec<CacheEntry<F::Item>> = Vec::new();
        let mut merged: Option<F::Item> = None;

        if !self.options.contains(Options::NO_CACHE) && !self.options.contains(Options::CLEAR_CACHE)
        {
            match self.read_cache_file(&cache_path) {
                Ok((cached, cached_merged)) => {
                    self.cache_was_read = true;
                    debug!(base = %self.base_name, entries = cached.len(), "loaded cache");

                    // check if we can use the cache as-is, or need to cherry-pick parts
                    if cached.len() == paths.len() {
                        cache_is_complete = cached
                            .iter()
                            .zip(&paths)
                            .all(|(ce, p)| ce.path == *p && ce.content.is_some());
                    }
                    entries = cached;
                    merged = cached_merged;
                }
                Err(e) => {
                    if cache_path.exists() {
                        warn!(base = %self.base_name, "failed to read cache: {e}");
                    }
                }
            }
        } else if self.options.contains(Options::CLEAR_CACHE) {
            let _ = fs::remove_file(&cache_path);
        }

        debug!(base = %self.base_name, read = self.cache_was_read, complete = cache_is_complete,
               "cache state");

        if !cache_is_complete {
            // pick the parts we can re-use; anything else starts out empty
            let mut new_entries: Vec<CacheEntry<F::Item>> =
                paths.iter().cloned().map(CacheEntry::new).collect();
            for ne in &mut new_entries {
                if let Some(old) = entries
                    .iter_mut()
                    .find(|ce| ce.path == ne.path && ce.content.is_some())
                {
                    ne.checksum = old.checksum;
                    ne.content = old.content.take();
                    debug!(base = %self.base_name, path = %ne.path.display(), "found cache entry");
                }
            }
            entries = new_entries;
        }

        // read every source file, pre-process and hash it; a checksum change
        // invalidates the cached object for that entry
        let still_complete = AtomicBool::new(cache_is_complete);
        let read_one = |entry: &mut CacheEntry<F::Item>| -> Result<()> {
            cancel.check()?;

            let meta = fs::metadata(&entry.path).map_err(|e| Error::io(&entry.path, e))?;
            if meta.len() > MAX_SOURCE_SIZE {
                return Err(Error::FileTooBig {
                    path: entry.path.clone(),
                    size: meta.len(),
                });
            }
            let mut raw = fs::read(&entry.path).map_err(|e| Error::io(&entry.path, e))?;
            self.format.pre_process_source(&mut raw, &entry.path);

            let checksum: [u8; 20] = Sha1::digest(&raw).into();
            if checksum != entry.checksum {
                if entry.content.is_some() {
                    warn!(path = %entry.path.display(),
                          "cached file checksum does not match, re-parsing");
                    entry.content = None;
                }
                still_complete.store(false, Ordering::Relaxed);
            }
            entry.checksum = checksum;
            entry.raw = raw;
            Ok(())
        };

        if entries.len() > PARALLEL_THRESHOLD {
            entries.par_iter_mut().try_for_each(read_one)?;
        } else {
            entries.iter_mut().try_for_each(read_one)?;
        }
        let cache_is_complete = still_complete.load(Ordering::Relaxed);

        debug!(base = %self.base_name, complete = cache_is_complete, "still complete after hashing");

        if !cache_is_complete {
            // a partial cache (or none at all): parse what is not cached yet
            if self.options.contains(Options::MERGED_RESULT) {
                merged = None;
            }

            let parsed_count = AtomicUsize::new(0);
            let ignore_broken = self.options.contains(Options::IGNORE_BROKEN);
            let parse_one = |entry: &mut CacheEntry<F::Item>| -> Result<()> {
                if entry.content.is_some() {
                    return Ok(());
                }
                cancel.check()?;
                parsed_count.fetch_add(1, Ordering::Relaxed);
                match self.format.load_from_source(&entry.raw, &entry.path) {
                    Ok(item) => entry.content = Some(item),
                    Err(e) => {
                        if ignore_broken {
                            entry.content = None;
                        } else {
                            return Err(Error::parse(&entry.path, e.to_string()));
                        }
                    }
                }
                Ok(())
            };

            if entries.len() > PARALLEL_THRESHOLD {
                entries.par_iter_mut().try_for_each(parse_one)?;
            } else {
                entries.iter_mut().try_for_each(parse_one)?;
            }

            // folding must stay sequential: later files overwrite or append
            if self.options.contains(Options::MERGED_RESULT) {
                for entry in &entries {
                    if let Some(item) = &entry.content {
                        match merged.as_mut() {
                            None => merged = Some(self.format.clone_item(item)),
                            Some(m) => self.format.merge(m, item),
                        }
                    }
                }
            }

            debug!(base = %self.base_name, parsed = parsed_count.load(Ordering::Relaxed),
                   "parsed from source");

            if !self.options.contains(Options::NO_CACHE) {
                match self.write_cache_file(&cache_path, &entries, merged.as_ref()) {
                    Ok(()) => self.cache_was_written = true,
                    Err(e) => warn!(base = %self.base_name, "failed to write cache: {e}"),
                }
            }
        }

        for entry in &mut entries {
            entry.raw = Vec::new();
        }
        self.index = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.path.clone(), i))
            .collect();
        self.entries = entries;
        if self.options.contains(Options::MERGED_RESULT) {
            self.merged = merged;
        }
        Ok(())
    }

    fn read_cache_file(&self, path: &Path) -> Result<(Vec<CacheEntry<F::Item>>, Option<F::Item>)> {
        let file = fs::File::open(path).map_err(|e| Error::io(path, e))?;
        let mut r = BufReader::new(file);

        let header = CacheHeader::read(&mut r).map_err(|e| Error::io(path, e))?;
        if !header.is_valid(&self.base_name, self.type_id, self.type_version) {
            return Err(Error::parse(path, "failed to parse cache header"));
        }

        let mut entries = Vec::with_capacity(header.entries as usize);
        for _ in 0..header.entries {
            let entry_path = stream::read_str(&mut r).map_err(|e| Error::io(path, e))?;
            let mut checksum = [0u8; 20];
            r.read_exact(&mut checksum).map_err(|e| Error::io(path, e))?;
            let has_content = stream::read_u8(&mut r).map_err(|e| Error::io(path, e))? != 0;

            let mut entry = CacheEntry::new(PathBuf::from(entry_path));
            entry.checksum = checksum;
            if has_content {
                let blob = stream::read_bytes(&mut r).map_err(|e| Error::io(path, e))?;
                entry.content = Some(self.format.load_from_cache(&blob)?);
            }
            entries.push(entry);
        }

        let merged = if self.options.contains(Options::MERGED_RESULT) {
            let has_merged = stream::read_u8(&mut r).map_err(|e| Error::io(path, e))? != 0;
            if !has_merged {
                return Err(Error::parse(path, "failed to read merged cache content"));
            }
            let blob = stream::read_bytes(&mut r).map_err(|e| Error::io(path, e))?;
            Some(self.format.load_from_cache(&blob)?)
        } else {
            None
        };

        Ok((entries, merged))
    }

    fn write_cache_file(
        &self,
        path: &Path,
        entries: &[CacheEntry<F::Item>],
        merged: Option<&F::Item>,
    ) -> Result<()> {
        let mut buf = Vec::new();
        let header = CacheHeader {
            magic: CACHE_MAGIC,
            version: format_version(),
            type_id: self.type_id,
            type_version: self.type_version,
            base_name: self.base_name.clone(),
            entries: u32::try_from(entries.len())
                .map_err(|_| Error::Package("too many cache entries".into()))?,
        };
        header.write(&mut buf).map_err(|e| Error::io(path, e))?;

        for entry in entries {
            let entry_path = entry.path.to_string_lossy();
            stream::write_str(&mut buf, &entry_path).map_err(|e| Error::io(path, e))?;
            buf.extend_from_slice(&entry.checksum);
            stream::write_u8(&mut buf, u8::from(entry.content.is_some()))
                .map_err(|e| Error::io(path, e))?;
            if let Some(item) = &entry.content {
                let blob = self.format.save_to_cache(item)?;
                stream::write_bytes(&mut buf, &blob).map_err(|e| Error::io(path, e))?;
            }
        }
        if self.options.contains(Options::MERGED_RESULT) {
            stream::write_u8(&mut buf, u8::from(merged.is_some()))
                .map_err(|e| Error::io(path, e))?;
            if let Some(item) = merged {
                let blob = self.format.save_to_cache(item)?;
                stream::write_bytes(&mut buf, &blob).map_err(|e| Error::io(path, e))?;
            }
        }

        // write-then-rename: readers see either the previous or the next
        // version, never a torn file
        let dir = path
            .parent()
            .ok_or_else(|| Error::Package("cache path has no parent directory".into()))?;
        fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::io(dir, e))?;
        tmp.write_all(&buf).map_err(|e| Error::io(path, e))?;
        tmp.persist(path)
            .map_err(|e| Error::io(path, e.error))?;
        Ok(())
    }
}

impl<F: CacheFormat> std::fmt::Debug for ConfigCache<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigCache")
            .field("base_name", &self.base_name)
            .field("files", &self.raw_files.len())
            .field("parsed", &self.parsed)
            .finish_non_exhaustive()
    }
}

/// Fixed-size header at the start of every cache file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheHeader {
    magic: u32,
    version: u32,
    type_id: [u8; 4],
    type_version: u32,
    base_name: String,
    entries: u32,
}

impl CacheHeader {
    fn is_valid(&self, base_name: &str, type_id: [u8; 4], type_version: u32) -> bool {
        self.magic == CACHE_MAGIC
            && self.version == format_version()
            && self.type_id == type_id
            && self.type_version == type_version
            && self.base_name == base_name
            && self.entries < MAX_CACHE_ENTRIES
    }

    fn read(r: &mut impl Read) -> std::io::Result<Self> {
        let magic = stream::read_u32(r)?;
        let version = stream::read_u32(r)?;
        let mut type_id = [0u8; 4];
        r.read_exact(&mut type_id)?;
        let type_version = stream::read_u32(r)?;
        let base_name = stream::read_str(r)?;
        let entries = stream::read_u32(r)?;
        Ok(Self {
            magic,
            version,
            type_id,
            type_version,
            base_name,
            entries,
        })
    }

    fn write(&self, w: &mut impl Write) -> std::io::Result<()> {
        stream::write_u32(w, self.magic)?;
        stream::write_u32(w, self.version)?;
        w.write_all(&self.type_id)?;
        stream::write_u32(w, self.type_version)?;
        stream::write_str(w, &self.base_name)?;
        stream::write_u32(w, self.entries)
    }
}

fn default_cache_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "hangar")
        .map_or_else(std::env::temp_dir, |dirs| dirs.cache_dir().to_path_buf())
}
