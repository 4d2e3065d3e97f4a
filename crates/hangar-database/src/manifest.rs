//! The package manifest model.
//!
//! `info.yaml` is a two-document stream: a format header
//! (`formatType: am-package`) followed by the package description. A package
//! declares one or more applications either through the `applications` list
//! or, for the common single-application case, through the top-level `code`
//! and `runtime` fields.

use hangar_archive::InstallationReport;
use hangar_cache::stream;
use hangar_core::{Error, PackageId, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// `formatType` value of the manifest's leading document.
pub const MANIFEST_FORMAT_TYPE: &str = "am-package";

/// Supported manifest format version.
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Version tag of the binary stream [`PackageInfo`] uses inside the config
/// cache; bump on any layout change.
pub const DATA_STREAM_VERSION: u32 = 1;

/// Per-application OpenGL requirements; compared against the global
/// configuration when deciding quick-launch eligibility.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OpenGlConfiguration {
    /// Desktop GL profile name (e.g. `core`), if requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desktop_profile: Option<String>,
    /// Requested GLES major version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub es_major_version: Option<u32>,
    /// Requested GLES minor version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub es_minor_version: Option<u32>,
}

/// A named intent declared by a package.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IntentInfo {
    /// Intent identifier.
    pub id: String,
    /// Localized description.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub description: BTreeMap<String, String>,
    /// Capabilities a requesting application must hold.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required_capabilities: Vec<String>,
}

/// One application declared inside a package manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplicationInfo {
    /// Application identifier (unique within the database).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<PackageId>,
    /// Entry point, relative to the package directory.
    pub code: String,
    /// Runtime identifier (e.g. `process`, `qml`).
    pub runtime: String,
    /// Free-form parameters passed to the runtime.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub runtime_parameters: BTreeMap<String, serde_yaml::Value>,
    /// Localized display names keyed by locale.
    #[serde(rename = "displayName", skip_serializing_if = "BTreeMap::is_empty")]
    pub display_name: BTreeMap<String, String>,
    /// Icon reference, relative to the package directory.
    #[serde(rename = "displayIcon", skip_serializing_if = "String::is_empty")]
    pub icon: String,
    /// Granted capability names.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    /// Category tags.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    /// Handled mime types, including `x-scheme-handler/<scheme>` entries.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mime_types: Vec<String>,
    /// OpenGL requirements.
    #[serde(rename = "opengl", skip_serializing_if = "is_default_gl")]
    pub opengl_configuration: OpenGlConfiguration,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_default_gl(gl: &OpenGlConfiguration) -> bool {
    *gl == OpenGlConfiguration::default()
}

/// Immutable descriptor of one package, loaded from its manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PackageInfo {
    /// Package identifier; must equal the containing directory name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<PackageId>,
    /// Icon reference.
    #[serde(rename = "displayIcon", skip_serializing_if = "String::is_empty")]
    pub icon: String,
    /// Localized display names keyed by locale.
    #[serde(rename = "displayName", skip_serializing_if = "BTreeMap::is_empty")]
    pub display_name: BTreeMap<String, String>,
    /// Version string (opaque).
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Whether this package ships with the system image.
    #[serde(rename = "builtIn", skip_serializing_if = "std::ops::Not::not")]
    pub built_in: bool,
    /// Declared applications (see also the top-level single-app fields).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub applications: Vec<ApplicationInfo>,
    /// Declared intents.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub intents: Vec<IntentInfo>,

    // single-application shorthand
    /// Entry point for the single-application form.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub code: String,
    /// Runtime for the single-application form.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub runtime: String,
    /// Runtime parameters for the single-application form.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub runtime_parameters: BTreeMap<String, serde_yaml::Value>,
    /// Capabilities for the single-application form.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    /// Categories for the single-application form.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    /// Mime types for the single-application form.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mime_types: Vec<String>,

    /// Base directory of the package on disk; set by the scanner, not part
    /// of the manifest.
    #[serde(skip)]
    pub base_dir: PathBuf,
    /// Installation report for installed packages; absent for built-ins.
    #[serde(skip)]
    pub installation_report: Option<InstallationReport>,
}

impl PackageInfo {
    /// The validated package identifier.
    ///
    /// Scanned manifests always carry one; this is only `None` for
    /// default-constructed values.
    #[must_use]
    pub fn package_id(&self) -> Option<&PackageId> {
        self.id.as_ref()
    }

    /// Best display name for `locale`, with `en` and the first entry as
    /// fallbacks.
    #[must_use]
    pub fn name(&self, locale: &str) -> Option<&str> {
        self.display_name
            .get(locale)
            .or_else(|| self.display_name.get("en"))
            .or_else(|| self.display_name.values().next())
            .map(String::as_str)
    }

    /// The effective application list: either the explicit `applications`
    /// entries or the single application formed by the top-level shorthand
    /// fields.
    #[must_use]
    pub fn effective_applications(&self) -> Vec<ApplicationInfo> {
        if !self.applications.is_empty() {
            return self
                .applications
                .iter()
                .cloned()
                .map(|mut app| {
                    if app.id.is_none() {
                        app.id = self.id.clone();
                    }
                    if app.display_name.is_empty() {
                        app.display_name = self.display_name.clone();
                    }
                    if app.icon.is_empty() {
                        app.icon = self.icon.clone();
                    }
                    app
                })
                .collect();
        }
        vec![ApplicationInfo {
            id: self.id.clone(),
            code: self.code.clone(),
            runtime: self.runtime.clone(),
            runtime_parameters: self.runtime_parameters.clone(),
            display_name: self.display_name.clone(),
            icon: self.icon.clone(),
            capabilities: self.capabilities.clone(),
            categories: self.categories.clone(),
            mime_types: self.mime_types.clone(),
            opengl_configuration: OpenGlConfiguration::default(),
        }]
    }

    /// Parse a manifest file from disk.
    ///
    /// # Errors
    /// Fails with `Parse` for malformed documents and invalid identifiers.
    pub fn from_manifest(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).map_err(|e| Error::io(path, e))?;
        Self::from_manifest_bytes(&raw, path)
    }

    /// Parse a manifest from raw bytes.
    ///
    /// # Errors
    /// Fails with `Parse` for malformed documents and invalid identifiers.
    pub fn from_manifest_bytes(raw: &[u8], path: &Path) -> Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| Error::parse(path, "manifest is not valid utf-8"))?;

        #[derive(Deserialize)]
        struct FormatHeader {
            #[serde(rename = "formatType")]
            format_type: String,
            #[serde(rename = "formatVersion")]
            format_version: u32,
        }

        let mut docs = serde_yaml::Deserializer::from_str(text);
        let header_doc = docs
            .next()
            .ok_or_else(|| Error::parse(path, "manifest is empty"))?;
        let header = FormatHeader::deserialize(header_doc)
            .map_err(|e| Error::parse(path, format!("invalid format header: {e}")))?;
        if header.format_type != MANIFEST_FORMAT_TYPE {
            return Err(Error::parse(
                path,
                format!("unsupported format type '{}'", header.format_type),
            ));
        }
        if header.format_version != MANIFEST_FORMAT_VERSION {
            return Err(Error::parse(
                path,
                format!("unsupported format version {}", header.format_version),
            ));
        }

        let payload_doc = docs
            .next()
            .ok_or_else(|| Error::parse(path, "manifest has no package document"))?;
        let info = <Self as Deserialize>::deserialize(payload_doc)
            .map_err(|e| Error::parse(path, e.to_string()))?;
        info.validate(path)?;
        Ok(info)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        if self.id.is_none() {
            return Err(Error::parse(path, "manifest has no package id"));
        }
        if self.applications.is_empty() && self.code.is_empty() {
            return Err(Error::parse(
                path,
                "manifest declares neither applications nor a code entry point",
            ));
        }
        for app in &self.applications {
            if app.code.is_empty() {
                return Err(Error::parse(path, "application without a code entry point"));
            }
            if app.runtime.is_empty() {
                return Err(Error::parse(path, "application without a runtime"));
            }
        }
        if self.applications.is_empty() && self.runtime.is_empty() {
            return Err(Error::parse(path, "manifest has no runtime"));
        }
        Ok(())
    }

    /// Serialize into the binary cache stream.
    ///
    /// # Errors
    /// Fails if a free-form value cannot be serialized.
    pub fn write_to_stream(&self) -> Result<Vec<u8>> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| Error::Package(format!("cannot serialize package info: {e}")))?;
        let mut out = Vec::new();
        let write = |w: &mut Vec<u8>| -> std::io::Result<()> {
            stream::write_u32(w, DATA_STREAM_VERSION)?;
            stream::write_str(w, &yaml)?;
            stream::write_str(w, &self.base_dir.to_string_lossy())?;
            stream::write_u8(w, u8::from(self.built_in))
        };
        write(&mut out).map_err(|e| Error::Package(format!("cannot serialize package info: {e}")))?;
        Ok(out)
    }

    /// Reconstruct from the binary cache stream.
    ///
    /// # Errors
    /// Fails with `Parse` on version or layout mismatches.
    pub fn read_from_stream(blob: &[u8]) -> Result<Self> {
        let mut r = blob;
        let read = |r: &mut &[u8]| -> std::io::Result<(u32, String, String, u8)> {
            Ok((
                stream::read_u32(r)?,
                stream::read_str(r)?,
                stream::read_str(r)?,
                stream::read_u8(r)?,
            ))
        };
        let (version, yaml, base_dir, built_in) =
            read(&mut r).map_err(|e| Error::parse("<cache>", e.to_string()))?;
        if version != DATA_STREAM_VERSION {
            return Err(Error::parse(
                "<cache>",
                format!("unsupported data stream version {version}"),
            ));
        }
        let mut info: Self = serde_yaml::from_str(&yaml)
            .map_err(|e| Error::parse("<cache>", e.to_string()))?;
        info.base_dir = PathBuf::from(base_dir);
        info.built_in = built_in != 0;
        Ok(info)
    }
}

/// [`CacheFormat`](hangar_cache::CacheFormat) adaptor binding [`PackageInfo`]
/// into the config cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackageInfoFormat;

impl hangar_cache::CacheFormat for PackageInfoFormat {
    type Item = PackageInfo;

    fn load_from_source(&self, content: &[u8], path: &Path) -> Result<Self::Item> {
        let mut info = PackageInfo::from_manifest_bytes(content, path)?;
        if let Some(dir) = path.parent() {
            info.base_dir = dir.to_path_buf();
        }
        Ok(info)
    }

    fn load_from_cache(&self, blob: &[u8]) -> Result<Self::Item> {
        PackageInfo::read_from_stream(blob)
    }

    fn save_to_cache(&self, item: &Self::Item) -> Result<Vec<u8>> {
        item.write_to_stream()
    }

    fn clone_item(&self, item: &Self::Item) -> Self::Item {
        item.clone()
    }

    fn merge(&self, _dst: &mut Self::Item, _src: &Self::Item) {
        // package manifests are never merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = "\
formatType: am-package
formatVersion: 1
---
id: com.example.hello
displayIcon: icon.png
displayName:
  en: Hello World
  de: Hallo Welt
version: '1.2'
code: main.qml
runtime: qml
runtimeParameters:
  loadDummyData: true
capabilities:
- location
mimeTypes:
- text/plain
- x-scheme-handler/hello
";

    #[test]
    fn parses_single_application_manifest() {
        let info =
            PackageInfo::from_manifest_bytes(MANIFEST.as_bytes(), Path::new("info.yaml")).unwrap();
        assert_eq!(info.package_id().unwrap().as_str(), "com.example.hello");
        assert_eq!(info.name("de"), Some("Hallo Welt"));
        assert_eq!(info.name("fr"), Some("Hello World"));
        assert_eq!(info.version, "1.2");
        assert!(!info.built_in);

        let apps = info.effective_applications();
        assert_eq!(apps.len(), 1);
        let app = &apps[0];
        assert_eq!(app.id.as_ref().unwrap().as_str(), "com.example.hello");
        assert_eq!(app.code, "main.qml");
        assert_eq!(app.runtime, "qml");
        assert_eq!(app.mime_types, ["text/plain", "x-scheme-handler/hello"]);
    }

    #[test]
    fn parses_multi_application_manifest() {
        let manifest = "\
formatType: am-package
formatVersion: 1
---
id: com.example.suite
displayName:
  en: Suite
applications:
- id: com.example.suite.main
  code: main.qml
  runtime: qml
- id: com.example.suite.helper
  code: helper
  runtime: process
  capabilities: [background]
";
        let info =
            PackageInfo::from_manifest_bytes(manifest.as_bytes(), Path::new("info.yaml")).unwrap();
        let apps = info.effective_applications();
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].id.as_ref().unwrap().as_str(), "com.example.suite.main");
        // apps inherit the package display name when they have none
        assert_eq!(apps[0].display_name.get("en").unwrap(), "Suite");
        assert_eq!(apps[1].capabilities, ["background"]);
    }

    #[test]
    fn rejects_wrong_format_type_and_version() {
        let wrong_type = MANIFEST.replace("am-package", "am-configuration");
        assert!(
            PackageInfo::from_manifest_bytes(wrong_type.as_bytes(), Path::new("x")).is_err()
        );

        let wrong_version = MANIFEST.replace("formatVersion: 1", "formatVersion: 9");
        assert!(
            PackageInfo::from_manifest_bytes(wrong_version.as_bytes(), Path::new("x")).is_err()
        );
    }

    #[test]
    fn rejects_invalid_package_id() {
        let bad = MANIFEST.replace("com.example.hello", "Com.Example.Hello");
        assert!(PackageInfo::from_manifest_bytes(bad.as_bytes(), Path::new("x")).is_err());
    }

    #[test]
    fn rejects_manifest_without_entry_point() {
        let manifest = "\
formatType: am-package
formatVersion: 1
---
id: com.example.empty
";
        assert!(PackageInfo::from_manifest_bytes(manifest.as_bytes(), Path::new("x")).is_err());
    }

    #[test]
    fn binary_stream_round_trip() {
        let mut info =
            PackageInfo::from_manifest_bytes(MANIFEST.as_bytes(), Path::new("info.yaml")).unwrap();
        info.base_dir = PathBuf::from("/apps/com.example.hello");
        info.built_in = true;

        let blob = info.write_to_stream().unwrap();
        let restored = PackageInfo::read_from_stream(&blob).unwrap();
        assert_eq!(info, restored);
    }

    #[test]
    fn stream_version_mismatch_is_rejected() {
        let info =
            PackageInfo::from_manifest_bytes(MANIFEST.as_bytes(), Path::new("info.yaml")).unwrap();
        let mut blob = info.write_to_stream().unwrap();
        blob[0] = 99;
        assert!(PackageInfo::read_from_stream(&blob).is_err());
    }
}
