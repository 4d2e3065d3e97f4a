//! The package digest contract.
//!
//! Both sides of the codec accumulate a SHA-256 digest over the same byte
//! sequence: first the canonical serialization of the signed header fields,
//! then for every payload entry in archive order the ASCII string
//! `D/<size>/<path>` (directories) or `F/<size>/<path>` (regular files)
//! followed by the raw file bytes for regular files. The footer stores the
//! hex digest; a mismatch between stored and computed digest is a hard
//! failure on extraction.

use hangar_core::{Error, Result};
use serde_yaml::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Streaming accumulator for the package digest.
pub struct PackageDigest {
    hasher: Sha256,
}

impl PackageDigest {
    /// Start a digest over the signed header fields.
    ///
    /// Only `extraSigned` is covered by the digest; the serialization is
    /// canonical because the map is ordered.
    ///
    /// # Errors
    /// Fails if the signed metadata cannot be serialized.
    pub fn new(extra_signed: &BTreeMap<String, Value>) -> Result<Self> {
        let mut hasher = Sha256::new();
        if !extra_signed.is_empty() {
            let canonical = serde_yaml::to_string(extra_signed).map_err(|e| {
                Error::Package(format!(
                    "metadata field extraSigned cannot be serialized for digest calculation: {e}"
                ))
            })?;
            hasher.update(canonical.as_bytes());
        }
        Ok(Self { hasher })
    }

    /// Add a directory entry.
    pub fn add_directory(&mut self, path: &str) {
        self.hasher.update(format!("D/0/{path}").as_bytes());
    }

    /// Announce a regular file entry of `size` bytes; the file content must
    /// follow via [`add_content`](Self::add_content).
    pub fn add_file(&mut self, path: &str, size: u64) {
        self.hasher.update(format!("F/{size}/{path}").as_bytes());
    }

    /// Add raw file content bytes.
    pub fn add_content(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Finish and return the digest bytes.
    #[must_use]
    pub fn finalize(self) -> Vec<u8> {
        self.hasher.finalize().to_vec()
    }

    /// Finish and return the digest as lowercase hex.
    #[must_use]
    pub fn finalize_hex(self) -> String {
        hex::encode(self.finalize())
    }
}

impl std::fmt::Debug for PackageDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageDigest").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_order_changes_digest() {
        let empty = BTreeMap::new();

        let mut a = PackageDigest::new(&empty).unwrap();
        a.add_file("info.yaml", 3);
        a.add_content(b"abc");
        a.add_directory("icons");

        let mut b = PackageDigest::new(&empty).unwrap();
        b.add_directory("icons");
        b.add_file("info.yaml", 3);
        b.add_content(b"abc");

        assert_ne!(a.finalize_hex(), b.finalize_hex());
    }

    #[test]
    fn signed_metadata_is_covered() {
        let empty = BTreeMap::new();
        let mut signed = BTreeMap::new();
        signed.insert("channel".to_owned(), Value::from("beta"));

        let without = PackageDigest::new(&empty).unwrap().finalize_hex();
        let with = PackageDigest::new(&signed).unwrap().finalize_hex();
        assert_ne!(without, with);
    }

    #[test]
    fn same_input_same_digest() {
        let empty = BTreeMap::new();
        let digest = |content: &[u8]| {
            let mut d = PackageDigest::new(&empty).unwrap();
            d.add_file("main.qml", content.len() as u64);
            d.add_content(content);
            d.finalize_hex()
        };
        assert_eq!(digest(b"hello"), digest(b"hello"));
        assert_ne!(digest(b"hello"), digest(b"hellp"));
    }
}
