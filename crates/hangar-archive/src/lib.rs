//! Package archive codec and installation reports.
//!
//! The wire format is a gzip-compressed USTAR stream with a strictly ordered
//! entry sequence: one `--PACKAGE-HEADER--` virtual entry, the payload
//! (regular files and directories), and one or more `--PACKAGE-FOOTER--`
//! virtual entries carrying the SHA-256 content digest plus optional
//! developer and store signatures. [`PackageCreator`] and
//! [`PackageExtractor`] are the two streaming sides of the codec;
//! [`InstallationReport`] is the HMAC-sealed record written next to every
//! installed package.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

mod creator;
mod digest;
mod extractor;
mod report;
mod signature;

pub use creator::PackageCreator;
pub use digest::PackageDigest;
pub use extractor::{ExtractedPackage, PackageExtractor};
pub use report::{InstallationReport, REPORT_FORMAT_TYPE, REPORT_FORMAT_VERSION};
pub use signature::{create_signature, verify_signature, SignatureRole};

use hangar_core::{Error, PackageId, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the leading virtual entry.
pub const HEADER_NAME: &str = "--PACKAGE-HEADER--";

/// Name of the trailing virtual entries.
pub const FOOTER_NAME: &str = "--PACKAGE-FOOTER--";

/// Current archive format version for header and footer documents.
pub const FORMAT_VERSION: u32 = 2;

/// The `formatType`/`formatVersion` document leading every virtual entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveFormat {
    /// Document type tag.
    #[serde(rename = "formatType")]
    pub format_type: String,
    /// Document format version.
    #[serde(rename = "formatVersion")]
    pub format_version: u32,
}

impl ArchiveFormat {
    fn header() -> Self {
        Self {
            format_type: "am-package-header".to_owned(),
            format_version: FORMAT_VERSION,
        }
    }

    fn footer() -> Self {
        Self {
            format_type: "am-package-footer".to_owned(),
            format_version: FORMAT_VERSION,
        }
    }

    fn check(&self, expected_type: &str) -> Result<()> {
        if self.format_type != expected_type {
            return Err(Error::Package(format!(
                "metadata has the wrong format type: expected {expected_type}, got {}",
                self.format_type
            )));
        }
        if self.format_version != FORMAT_VERSION {
            return Err(Error::Package(format!(
                "metadata has an unsupported format version {} (expected {FORMAT_VERSION})",
                self.format_version
            )));
        }
        Ok(())
    }
}

/// The signed-over metadata document inside `--PACKAGE-HEADER--`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderData {
    /// Package identifier; a header without one is rejected.
    pub package_id: PackageId,
    /// Declared installed size in bytes.
    #[serde(default)]
    pub disk_space_used: u64,
    /// Free-form metadata, not covered by the digest.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_yaml::Value>,
    /// Free-form metadata covered by the digest.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_signed: BTreeMap<String, serde_yaml::Value>,
}

/// The digest document inside the first `--PACKAGE-FOOTER--`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FooterData {
    /// Hex-encoded SHA-256 content digest.
    pub digest: String,
}

/// Metadata shared by both codec directions.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageMetadata {
    /// Package identifier from the header.
    pub package_id: PackageId,
    /// Declared installed size in bytes.
    pub disk_space_used: u64,
    /// Free-form header metadata.
    pub extra: BTreeMap<String, serde_yaml::Value>,
    /// Signed free-form header metadata.
    pub extra_signed: BTreeMap<String, serde_yaml::Value>,
    /// Hex-encoded content digest.
    pub digest: String,
    /// Base64 developer signature, if present.
    pub developer_signature: Option<String>,
    /// Base64 store signature, if present.
    pub store_signature: Option<String>,
}
