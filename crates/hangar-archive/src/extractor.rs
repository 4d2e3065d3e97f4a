//! Streaming package extraction with digest verification.

use crate::digest::PackageDigest;
use crate::{ArchiveFormat, FooterData, HeaderData, PackageMetadata, FOOTER_NAME, HEADER_NAME};
use flate2::read::GzDecoder;
use hangar_core::{CancelToken, Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Maximum size of a virtual metadata entry (header or footer).
const MAX_META_SIZE: u64 = 1024 * 1024;

/// Block size for payload streaming; cancellation is checked per block.
const BLOCK_SIZE: usize = 64 * 1024;

/// Result of a successful extraction.
#[derive(Debug)]
pub struct ExtractedPackage {
    /// Metadata recovered from header and footer.
    pub metadata: PackageMetadata,
    /// Extracted entries in archive order (relative paths).
    pub files: Vec<String>,
    /// Total payload bytes written.
    pub total_size: u64,
    /// The directory the payload was extracted into.
    pub destination: PathBuf,
}

enum Destination {
    Fixed(PathBuf),
    /// Resolved from the archive header; used by the installer to derive the
    /// `<id>+` staging directory from the package identifier.
    Deferred(Box<dyn FnOnce(&HeaderData) -> Result<PathBuf> + Send>),
}

/// Deserializes a package archive from a byte stream into a directory.
///
/// The input only needs to be a readable byte stream; it can come from a
/// file, a pipe, or a network connection. Archive entry paths must resolve
/// inside the extraction directory; any escape attempt fails the extraction
/// and leaves the destination empty.
pub struct PackageExtractor<R: Read> {
    input: R,
    destination: Destination,
    progress: Option<Box<dyn Fn(f64) + Send>>,
}

impl<R: Read> PackageExtractor<R> {
    /// Create an extractor reading from `input` into `destination`.
    pub fn new(input: R, destination: impl Into<PathBuf>) -> Self {
        Self {
            input,
            destination: Destination::Fixed(destination.into()),
            progress: None,
        }
    }

    /// Create an extractor whose destination is derived from the archive
    /// header once it has been read and validated.
    pub fn new_deferred(
        input: R,
        resolver: impl FnOnce(&HeaderData) -> Result<PathBuf> + Send + 'static,
    ) -> Self {
        Self {
            input,
            destination: Destination::Deferred(Box::new(resolver)),
            progress: None,
        }
    }

    /// Report progress as extracted-bytes / declared-package-size in `[0, 1]`.
    #[must_use]
    pub fn on_progress(mut self, callback: impl Fn(f64) + Send + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    /// Run the extraction.
    ///
    /// # Errors
    /// Fails with `InvalidPath` for escaping entries, `Archive` for format
    /// and digest violations, `Package` for header/footer inconsistencies,
    /// `Canceled` on cooperative cancellation and `Io` for filesystem
    /// problems. On any failure the destination directory is emptied again.
    pub fn extract(self, cancel: &CancelToken) -> Result<ExtractedPackage> {
        let mut resolved: Option<PathBuf> = None;
        let result = run(self.input, self.destination, &self.progress, cancel, &mut resolved);
        if result.is_err() {
            // never leave partial content behind
            if let Some(destination) = &resolved {
                let _ = fs::remove_dir_all(destination);
                let _ = fs::create_dir_all(destination);
            }
        }
        result
    }
}

impl<R: Read> std::fmt::Debug for PackageExtractor<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let destination = match &self.destination {
            Destination::Fixed(path) => path.display().to_string(),
            Destination::Deferred(_) => "<deferred>".to_owned(),
        };
        f.debug_struct("PackageExtractor")
            .field("destination", &destination)
            .finish_non_exhaustive()
    }
}

#[allow(clippy::ref_option)]
fn run<R: Read>(
    mut input: R,
    destination: Destination,
    progress: &Option<Box<dyn Fn(f64) + Send>>,
    cancel: &CancelToken,
    resolved: &mut Option<PathBuf>,
) -> Result<ExtractedPackage> {
    let mut destination = Some(destination);
    if let Some(Destination::Fixed(path)) = destination.as_ref() {
        fs::create_dir_all(path).map_err(|e| Error::io(path, e))?;
        *resolved = Some(path.clone());
    }

    let gz = GzDecoder::new(&mut input);
    let mut archive = tar::Archive::new(gz);
    let entries = archive
        .entries()
        .map_err(|e| Error::Archive(format!("could not read archive: {e}")))?;

    let mut header: Option<HeaderData> = None;
    let mut digest: Option<PackageDigest> = None;
    let mut footer_docs: Vec<serde_yaml::Value> = Vec::new();
    let mut files = Vec::new();
    let mut total_size = 0u64;
    let mut extracted = 0u64;

    for entry in entries {
        cancel.check()?;
        let mut entry =
            entry.map_err(|e| Error::Archive(format!("could not read archive entry: {e}")))?;

        let name = entry_name(&entry)?;

        if header.is_none() {
            if name != HEADER_NAME {
                return Err(Error::Archive(format!(
                    "archive does not start with {HEADER_NAME}"
                )));
            }
            let raw = read_meta(&mut entry)?;
            let (format, data) = parse_header(&raw)?;
            format.check("am-package-header")?;

            if let Some(Destination::Deferred(resolver)) = destination.take() {
                let path = resolver(&data)?;
                fs::create_dir_all(&path).map_err(|e| Error::io(&path, e))?;
                *resolved = Some(path);
            }

            digest = Some(PackageDigest::new(&data.extra_signed)?);
            header = Some(data);
            continue;
        }

        if name == FOOTER_NAME {
            let raw = read_meta(&mut entry)?;
            let text = std::str::from_utf8(&raw)
                .map_err(|_| Error::Archive("footer is not valid utf-8".into()))?;
            for doc in serde_yaml::Deserializer::from_str(text) {
                let value = serde_yaml::Value::deserialize(doc)
                    .map_err(|e| Error::Archive(format!("invalid footer document: {e}")))?;
                footer_docs.push(value);
            }
            continue;
        }

        if !footer_docs.is_empty() {
            return Err(Error::Archive(format!(
                "found a payload entry after {FOOTER_NAME}: {name}"
            )));
        }

        // payload
        let dest_dir = resolved
            .as_ref()
            .ok_or_else(|| Error::Archive("no destination directory resolved".into()))?;
        let out_path = safe_join(dest_dir, &name)?;
        let header_data = header.as_ref().expect("header parsed above");
        let digest = digest.as_mut().expect("digest initialized with header");

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                digest.add_directory(&name);
                fs::create_dir_all(&out_path).map_err(|e| Error::io(&out_path, e))?;
                set_permissions(&out_path, entry.header().mode().unwrap_or(0o555) | 0o700);
            }
            tar::EntryType::Regular => {
                let size = entry
                    .header()
                    .size()
                    .map_err(|e| Error::Archive(format!("invalid entry size: {e}")))?;
                digest.add_file(&name, size);

                if let Some(parent) = out_path.parent() {
                    fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
                }
                let mut out = fs::File::create(&out_path).map_err(|e| Error::io(&out_path, e))?;

                let mut buf = vec![0u8; BLOCK_SIZE];
                loop {
                    cancel.check()?;
                    let n = entry
                        .read(&mut buf)
                        .map_err(|e| Error::Archive(format!("could not read from archive: {e}")))?;
                    if n == 0 {
                        break;
                    }
                    digest.add_content(&buf[..n]);
                    out.write_all(&buf[..n]).map_err(|e| Error::io(&out_path, e))?;
                    extracted += n as u64;
                    if let Some(cb) = progress {
                        if header_data.disk_space_used > 0 {
                            cb((extracted as f64 / header_data.disk_space_used as f64).min(1.0));
                        }
                    }
                }
                total_size += size;
                set_permissions(&out_path, entry.header().mode().unwrap_or(0o444));
            }
            other => {
                // symlinks and special files cannot be contained safely
                debug!(?other, entry = %name, "rejecting special archive entry");
                return Err(Error::InvalidPath {
                    path: PathBuf::from(name),
                });
            }
        }
        files.push(name);
    }

    let header =
        header.ok_or_else(|| Error::Archive(format!("archive does not start with {HEADER_NAME}")))?;
    let digest = digest.expect("digest initialized with header");
    if footer_docs.is_empty() {
        return Err(Error::Archive(format!("no {FOOTER_NAME} found in archive")));
    }

    let (footer, developer_signature, store_signature) = parse_footer(&footer_docs)?;

    let computed = digest.finalize_hex();
    if computed != footer.digest {
        return Err(Error::Archive(format!(
            "package digest mismatch (is {computed}, but should be {})",
            footer.digest
        )));
    }

    if let Some(cb) = progress {
        cb(1.0);
    }
    debug!(package = %header.package_id, files = files.len(), "extraction finished");

    let destination = resolved
        .clone()
        .ok_or_else(|| Error::Archive("no destination directory resolved".into()))?;

    Ok(ExtractedPackage {
        metadata: PackageMetadata {
            package_id: header.package_id,
            disk_space_used: header.disk_space_used,
            extra: header.extra,
            extra_signed: header.extra_signed,
            digest: computed,
            developer_signature,
            store_signature,
        },
        files,
        total_size,
        destination,
    })
}

fn entry_name<R: Read>(entry: &tar::Entry<'_, R>) -> Result<String> {
    let bytes = entry.path_bytes();
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::Archive("entry path is not valid utf-8".into()))
}

/// Join `name` onto `dest`, rejecting anything that could resolve outside.
fn safe_join(dest: &Path, name: &str) -> Result<PathBuf> {
    let rel = Path::new(name);
    if rel.as_os_str().is_empty() {
        return Err(Error::InvalidPath { path: rel.into() });
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(Error::InvalidPath { path: rel.into() }),
        }
    }
    Ok(dest.join(rel))
}

fn read_meta<R: Read>(entry: &mut tar::Entry<'_, R>) -> Result<Vec<u8>> {
    let mut raw = Vec::new();
    entry
        .take(MAX_META_SIZE)
        .read_to_end(&mut raw)
        .map_err(|e| Error::Archive(format!("could not read metadata entry: {e}")))?;
    Ok(raw)
}

fn parse_header(raw: &[u8]) -> Result<(ArchiveFormat, HeaderData)> {
    let text =
        std::str::from_utf8(raw).map_err(|_| Error::Archive("header is not valid utf-8".into()))?;
    let mut docs = serde_yaml::Deserializer::from_str(text);

    let format_doc = docs
        .next()
        .ok_or_else(|| Error::Archive("header is empty".into()))?;
    let format = ArchiveFormat::deserialize(format_doc)
        .map_err(|e| Error::Archive(format!("invalid header format document: {e}")))?;

    let data_doc = docs
        .next()
        .ok_or_else(|| Error::Archive("header has no metadata document".into()))?;
    let data = HeaderData::deserialize(data_doc)
        .map_err(|e| Error::Archive(format!("invalid header metadata: {e}")))?;

    Ok((format, data))
}

fn parse_footer(
    docs: &[serde_yaml::Value],
) -> Result<(FooterData, Option<String>, Option<String>)> {
    let mut iter = docs.iter();

    let format_doc = iter
        .next()
        .ok_or_else(|| Error::Archive("footer is empty".into()))?;
    let format: ArchiveFormat = serde_yaml::from_value(format_doc.clone())
        .map_err(|e| Error::Archive(format!("invalid footer format document: {e}")))?;
    format.check("am-package-footer")?;

    let data_doc = iter
        .next()
        .ok_or_else(|| Error::Archive("footer has no digest document".into()))?;
    let footer: FooterData = serde_yaml::from_value(data_doc.clone())
        .map_err(|e| Error::Archive(format!("invalid footer digest document: {e}")))?;

    let mut developer_signature = None;
    let mut store_signature = None;
    for doc in iter {
        let map: BTreeMap<String, String> = serde_yaml::from_value(doc.clone())
            .map_err(|e| Error::Archive(format!("invalid footer signature document: {e}")))?;
        if let Some(sig) = map.get("developerSignature") {
            developer_signature = Some(sig.clone());
        }
        if let Some(sig) = map.get("storeSignature") {
            store_signature = Some(sig.clone());
        }
    }

    Ok((footer, developer_signature, store_signature))
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o777));
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_destination_uses_header_id() {
        use crate::{InstallationReport, PackageCreator};
        use hangar_core::PackageId;

        let src = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("info.yaml"), "x: 1\n").unwrap();

        let mut report = InstallationReport::new(PackageId::parse("com.example.def").unwrap());
        report.add_file("info.yaml");

        let mut archive = Vec::new();
        PackageCreator::new(src.path(), &report, &mut archive)
            .create(&CancelToken::new())
            .unwrap();

        let root = base.path().to_path_buf();
        let extracted = PackageExtractor::new_deferred(archive.as_slice(), move |header| {
            Ok(root.join(format!("{}+", header.package_id)))
        })
        .extract(&CancelToken::new())
        .unwrap();

        assert_eq!(
            extracted.destination,
            base.path().join("com.example.def+")
        );
        assert!(extracted.destination.join("info.yaml").is_file());
    }
}
