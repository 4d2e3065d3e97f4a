//! HMAC-sealed installation reports.
//!
//! A report is persisted as `.installation-report.yaml` next to every
//! installed package: two YAML documents (format header, then the payload)
//! terminated by an `hmac:` line. The HMAC-SHA256 is keyed by a
//! per-installation secret and computed over the exact serialized bytes of
//! the two documents, so any post-installation edit is detected on load.

use hangar_core::{Error, PackageId, Result};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// `formatType` value of the leading document.
pub const REPORT_FORMAT_TYPE: &str = "am-installation-report";

/// Current report format version.
pub const REPORT_FORMAT_VERSION: u32 = 3;

#[derive(Debug, Serialize, Deserialize)]
struct FormatHeader {
    #[serde(rename = "formatType")]
    format_type: String,
    #[serde(rename = "formatVersion")]
    format_version: u32,
}

/// Record of what an installation put on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallationReport {
    /// Identifier of the installed package.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_id: Option<PackageId>,
    /// Installation location the package went to.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub installation_location_id: String,
    /// Member files, relative to the package directory, in archive order.
    pub files: Vec<String>,
    /// Disk space used by the installation, in bytes.
    pub disk_space_used: u64,
    /// Package content digest (hex).
    #[serde(skip_serializing_if = "String::is_empty")]
    pub digest: String,
    /// Detached developer signature (base64), if the package was signed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub developer_signature: Option<String>,
    /// Detached store signature (base64), if the package came from a store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_signature: Option<String>,
    /// Free-form metadata, not covered by signatures.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_yaml::Value>,
    /// Free-form metadata covered by the package digest.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_signed: BTreeMap<String, serde_yaml::Value>,
}

impl InstallationReport {
    /// Create an empty report for `package_id`.
    #[must_use]
    pub fn new(package_id: PackageId) -> Self {
        Self {
            package_id: Some(package_id),
            ..Self::default()
        }
    }

    /// Add a member file path (relative).
    pub fn add_file(&mut self, file: impl Into<String>) {
        self.files.push(file.into());
    }

    /// Add several member file paths.
    pub fn add_files<I, S>(&mut self, files: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files.extend(files.into_iter().map(Into::into));
    }

    /// A report is valid once identifier, digest and at least one file are
    /// present.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.package_id.is_some() && !self.digest.is_empty() && !self.files.is_empty()
    }

    /// Serialize to the two-document YAML stream sealed with `key`.
    ///
    /// # Errors
    /// Fails if the payload cannot be serialized.
    pub fn serialize(&self, key: &[u8]) -> Result<Vec<u8>> {
        let header = FormatHeader {
            format_type: REPORT_FORMAT_TYPE.to_owned(),
            format_version: REPORT_FORMAT_VERSION,
        };
        let header_yaml = serde_yaml::to_string(&header)
            .map_err(|e| Error::Package(format!("cannot serialize report header: {e}")))?;
        let payload_yaml = serde_yaml::to_string(self)
            .map_err(|e| Error::Package(format!("cannot serialize report: {e}")))?;

        let mut body = String::new();
        body.push_str(&header_yaml);
        body.push_str("---\n");
        body.push_str(&payload_yaml);

        let mac = seal(body.as_bytes(), key);
        body.push_str("---\nhmac: '");
        body.push_str(&hex::encode(mac));
        body.push_str("'\n");
        Ok(body.into_bytes())
    }

    /// Deserialize and verify a report sealed with `key`.
    ///
    /// # Errors
    /// Fails with a `Cryptography` error when the HMAC does not verify, and
    /// with a `Package` error on malformed documents.
    pub fn deserialize(data: &[u8], key: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::Package("installation report is not valid utf-8".into()))?;

        const MARKER: &str = "---\nhmac: '";
        let pos = text
            .rfind(MARKER)
            .ok_or_else(|| Error::Package("installation report has no hmac seal".into()))?;
        let body = &text[..pos];
        let mac_hex = text[pos + MARKER.len()..]
            .split('\'')
            .next()
            .unwrap_or_default();
        let stored = hex::decode(mac_hex)
            .map_err(|_| Error::Package("installation report has a malformed hmac".into()))?;

        let computed = seal(body.as_bytes(), key);
        if computed.ct_eq(&stored).unwrap_u8() != 1 {
            return Err(Error::Cryptography(
                "installation report digest does not match - the report might have been tampered with"
                    .into(),
            ));
        }

        let mut documents = serde_yaml::Deserializer::from_str(body);
        let header_doc = documents
            .next()
            .ok_or_else(|| Error::Package("installation report is empty".into()))?;
        let header = FormatHeader::deserialize(header_doc)
            .map_err(|e| Error::Package(format!("invalid report format header: {e}")))?;
        if header.format_type != REPORT_FORMAT_TYPE {
            return Err(Error::Package(format!(
                "not an installation report: {}",
                header.format_type
            )));
        }
        if header.format_version != REPORT_FORMAT_VERSION {
            return Err(Error::Package(format!(
                "unsupported report format version {}",
                header.format_version
            )));
        }

        let payload_doc = documents
            .next()
            .ok_or_else(|| Error::Package("installation report has no payload".into()))?;
        <Self as Deserialize>::deserialize(payload_doc)
            .map_err(|e| Error::Package(format!("invalid report payload: {e}")))
    }
}

fn seal(body: &[u8], key: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(body);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> InstallationReport {
        let mut report = InstallationReport::new(PackageId::parse("com.example.test").unwrap());
        report.add_file("test");
        report.add_files(["more/test", "another/test/file"]);
        report.disk_space_used = 42;
        report.digest = hex::encode([0x11u8; 32]);
        report.installation_location_id = "internal-0".into();
        report.developer_signature = Some("ZGV2LXNpZw==".into());
        report.store_signature = Some("c3RvcmUtc2ln".into());
        report
    }

    #[test]
    fn validity_requires_id_digest_and_files() {
        let mut report = InstallationReport::new(PackageId::parse("com.example.test").unwrap());
        assert!(!report.is_valid());
        report.add_file("test");
        assert!(!report.is_valid());
        report.disk_space_used = 42;
        assert!(!report.is_valid());
        report.digest = "aa".into();
        assert!(report.is_valid());
    }

    #[test]
    fn round_trip_preserves_all_fields() {
        let report = sample();
        let sealed = report.serialize(b"key").unwrap();
        let restored = InstallationReport::deserialize(&sealed, b"key").unwrap();
        assert_eq!(report, restored);
        assert!(restored.is_valid());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let sealed = sample().serialize(b"key").unwrap();
        assert!(matches!(
            InstallationReport::deserialize(&sealed, b"other-key"),
            Err(Error::Cryptography(_))
        ));
    }

    #[test]
    fn tampered_hmac_is_rejected() {
        let sealed = sample().serialize(b"key").unwrap();
        let mut text = String::from_utf8(sealed).unwrap();
        // replace the stored mac with a same-length fake
        let pos = text.rfind("hmac: '").unwrap() + 7;
        text.replace_range(pos..pos + 64, &"0".repeat(64));
        assert!(matches!(
            InstallationReport::deserialize(text.as_bytes(), b"key"),
            Err(Error::Cryptography(_))
        ));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let sealed = sample().serialize(b"key").unwrap();
        let text = String::from_utf8(sealed)
            .unwrap()
            .replace("diskSpaceUsed: 42", "diskSpaceUsed: 43");
        assert!(matches!(
            InstallationReport::deserialize(text.as_bytes(), b"key"),
            Err(Error::Cryptography(_))
        ));
    }

    #[test]
    fn missing_seal_is_rejected() {
        let err = InstallationReport::deserialize(b"formatType: x\n", b"key");
        assert!(matches!(err, Err(Error::Package(_))));
    }
}
