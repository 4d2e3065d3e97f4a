//! Streaming package creation.

use crate::digest::PackageDigest;
use crate::report::InstallationReport;
use crate::{ArchiveFormat, FooterData, HeaderData, PackageMetadata, FOOTER_NAME, HEADER_NAME};
use flate2::write::GzEncoder;
use flate2::Compression;
use hangar_core::{CancelToken, Error, Result};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Serializes a package directory into the archive wire format.
///
/// The output is a gzip-compressed USTAR stream: one `--PACKAGE-HEADER--`
/// virtual entry, the payload entries named in the installation report (in
/// report order), and one or more `--PACKAGE-FOOTER--` virtual entries
/// carrying the content digest and optional signatures.
pub struct PackageCreator<'a, W: Write> {
    source_dir: PathBuf,
    report: &'a InstallationReport,
    output: W,
    progress: Option<Box<dyn Fn(f64) + Send + 'a>>,
}

impl<'a, W: Write> PackageCreator<'a, W> {
    /// Create a packer for `source_dir`, including the files listed in
    /// `report`, writing the archive to `output`.
    pub fn new(source_dir: impl Into<PathBuf>, report: &'a InstallationReport, output: W) -> Self {
        Self {
            source_dir: source_dir.into(),
            report,
            output,
            progress: None,
        }
    }

    /// Report progress as bytes-written / total-bytes in `[0, 1]`.
    #[must_use]
    pub fn on_progress(mut self, callback: impl Fn(f64) + Send + 'a) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    /// Write the archive.
    ///
    /// Honors `cancel` at every entry boundary and at every block inside a
    /// file. Returns the package metadata including the created digest.
    ///
    /// # Errors
    /// Fails with `Canceled`, `Io`, `Package` (missing id, digest mismatch
    /// against the report, special files) or `Archive` (write failures).
    pub fn create(mut self, cancel: &CancelToken) -> Result<PackageMetadata> {
        let package_id = self
            .report
            .package_id
            .clone()
            .ok_or_else(|| Error::Package("package identifier is missing".into()))?;

        let mut digest = PackageDigest::new(&self.report.extra_signed)?;

        let header_data = HeaderData {
            package_id: package_id.clone(),
            disk_space_used: self.report.disk_space_used,
            extra: self.report.extra.clone(),
            extra_signed: self.report.extra_signed.clone(),
        };

        if let Some(cb) = &self.progress {
            cb(0.0);
        }

        let gz = GzEncoder::new(&mut self.output, Compression::default());
        let mut builder = tar::Builder::new(gz);

        append_virtual(
            &mut builder,
            HEADER_NAME,
            &two_documents(&ArchiveFormat::header(), &header_data)?,
        )?;

        // stat everything up front so progress can be reported as a ratio
        let mut total_size = 0u64;
        for file in &self.report.files {
            let path = self.source_dir.join(file);
            let meta = fs::symlink_metadata(&path)
                .map_err(|_| Error::Io {
                    path: path.clone(),
                    message: "file not found".into(),
                })?;
            if meta.is_file() {
                total_size += meta.len();
            }
        }

        let packaged = Cell::new(0u64);
        let last_percent = Cell::new(0u64);
        let emit = |added: u64| {
            packaged.set(packaged.get() + added);
            if let Some(cb) = &self.progress {
                let percent = if total_size == 0 {
                    0
                } else {
                    packaged.get() * 100 / total_size
                };
                if percent != last_percent.get() {
                    last_percent.set(percent);
                    cb(percent as f64 / 100.0);
                }
            }
        };

        for file in &self.report.files {
            cancel.check()?;

            let path = self.source_dir.join(file);
            let meta = fs::symlink_metadata(&path).map_err(|e| Error::io(&path, e))?;

            if meta.is_dir() {
                digest.add_directory(file);
                let mut header = tar::Header::new_ustar();
                header.set_size(0);
                header.set_mode(0o555);
                header.set_mtime(0);
                header.set_entry_type(tar::EntryType::Directory);
                builder
                    .append_data(&mut header, file, io::empty())
                    .map_err(|e| Error::Archive(format!("could not write directory entry: {e}")))?;
            } else if meta.is_file() {
                let size = meta.len();
                let mode = entry_mode(&path, &meta)?;
                digest.add_file(file, size);

                let mut header = tar::Header::new_ustar();
                header.set_size(size);
                header.set_mode(mode);
                header.set_mtime(0);
                header.set_entry_type(tar::EntryType::Regular);

                let source = fs::File::open(&path).map_err(|e| Error::io(&path, e))?;
                let counter = Cell::new(0u64);
                let reader = HashingReader {
                    inner: source,
                    digest: &mut digest,
                    cancel,
                    counter: &counter,
                    on_block: &emit,
                };
                builder.append_data(&mut header, file, reader).map_err(|e| {
                    if cancel.is_canceled() {
                        Error::Canceled
                    } else {
                        Error::Archive(format!("could not write to archive: {e}"))
                    }
                })?;

                if counter.get() != size {
                    return Err(Error::Archive(format!(
                        "size mismatch for '{file}' between stating ({size}) and reading ({})",
                        counter.get()
                    )));
                }
            } else {
                return Err(Error::Package(format!(
                    "inode '{file}' is neither a directory nor a file"
                )));
            }
        }

        let digest_hex = digest.finalize_hex();
        if !self.report.digest.is_empty() && self.report.digest != digest_hex {
            return Err(Error::Package(format!(
                "package digest mismatch (is {digest_hex}, but should be {})",
                self.report.digest
            )));
        }
        debug!(package = %package_id, digest = %digest_hex, "packed payload");

        append_virtual(
            &mut builder,
            FOOTER_NAME,
            &two_documents(
                &ArchiveFormat::footer(),
                &FooterData {
                    digest: digest_hex.clone(),
                },
            )?,
        )?;

        if let Some(sig) = &self.report.developer_signature {
            let mut doc = BTreeMap::new();
            doc.insert("developerSignature".to_owned(), sig.clone());
            append_virtual(&mut builder, FOOTER_NAME, &single_document(&doc)?)?;
        }
        if let Some(sig) = &self.report.store_signature {
            let mut doc = BTreeMap::new();
            doc.insert("storeSignature".to_owned(), sig.clone());
            append_virtual(&mut builder, FOOTER_NAME, &single_document(&doc)?)?;
        }

        let gz = builder
            .into_inner()
            .map_err(|e| Error::Archive(format!("could not close archive: {e}")))?;
        gz.finish()
            .map_err(|e| Error::Archive(format!("could not finish compression: {e}")))?;

        if let Some(cb) = &self.progress {
            cb(1.0);
        }

        Ok(PackageMetadata {
            package_id,
            disk_space_used: self.report.disk_space_used,
            extra: self.report.extra.clone(),
            extra_signed: self.report.extra_signed.clone(),
            digest: digest_hex,
            developer_signature: self.report.developer_signature.clone(),
            store_signature: self.report.store_signature.clone(),
        })
    }
}

impl<W: Write> std::fmt::Debug for PackageCreator<'_, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageCreator")
            .field("source_dir", &self.source_dir)
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
fn entry_mode(_path: &Path, meta: &fs::Metadata) -> Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    let executable = meta.permissions().mode() & 0o100 != 0;
    Ok(if executable { 0o544 } else { 0o444 })
}

#[cfg(not(unix))]
fn entry_mode(path: &Path, _meta: &fs::Metadata) -> Result<u32> {
    // no x-bits on this host: force the executable bit for ELF binaries
    let mut magic = [0u8; 4];
    let is_elf = fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map(|()| magic == [0x7f, b'E', b'L', b'F'])
        .unwrap_or(false);
    Ok(if is_elf { 0o544 } else { 0o444 })
}

struct HashingReader<'a, R: Read> {
    inner: R,
    digest: &'a mut PackageDigest,
    cancel: &'a CancelToken,
    counter: &'a Cell<u64>,
    on_block: &'a dyn Fn(u64),
}

impl<R: Read> Read for HashingReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_canceled() {
            return Err(io::Error::other("canceled"));
        }
        let n = self.inner.read(buf)?;
        self.digest.add_content(&buf[..n]);
        self.counter.set(self.counter.get() + n as u64);
        (self.on_block)(n as u64);
        Ok(n)
    }
}

fn append_virtual<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
) -> Result<()> {
    let mut header = tar::Header::new_ustar();
    header.set_size(data.len() as u64);
    header.set_mode(0o444);
    header.set_mtime(0);
    header.set_entry_type(tar::EntryType::Regular);
    builder
        .append_data(&mut header, name, data)
        .map_err(|e| Error::Archive(format!("could not write '{name}' to archive: {e}")))
}

fn two_documents<A: serde::Serialize, B: serde::Serialize>(first: &A, second: &B) -> Result<Vec<u8>> {
    let a = serde_yaml::to_string(first)
        .map_err(|e| Error::Package(format!("cannot serialize metadata: {e}")))?;
    let b = serde_yaml::to_string(second)
        .map_err(|e| Error::Package(format!("cannot serialize metadata: {e}")))?;
    Ok(format!("{a}---\n{b}").into_bytes())
}

fn single_document<A: serde::Serialize>(doc: &A) -> Result<Vec<u8>> {
    serde_yaml::to_string(doc)
        .map(String::into_bytes)
        .map_err(|e| Error::Package(format!("cannot serialize metadata: {e}")))
}
