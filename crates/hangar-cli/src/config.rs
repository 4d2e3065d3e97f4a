//! Main configuration loading.
//!
//! Configuration is assembled from the YAML fragments in `<root>/config`,
//! in file-name order, through the binary config cache: later fragments
//! deep-merge over earlier ones (maps merge recursively, everything else is
//! overwritten). `${env:NAME}` references are expanded before parsing.

use anyhow::{Context as _, Result};
use hangar_cache::{stream, CacheFormat, ConfigCache, Options};
use hangar_core::Error;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

/// `formatType` of configuration fragments.
pub const CONFIG_FORMAT_TYPE: &str = "am-configuration";

/// Supported configuration format version.
pub const CONFIG_FORMAT_VERSION: u32 = 1;

/// Cache type version of the merged configuration blob.
const CONFIG_STREAM_VERSION: u32 = 1;

/// The settings the controller consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct MainConfig {
    /// Locale used to resolve display names.
    pub locale: String,
    /// Quick-launch pool size per (container, runtime) pair.
    pub quick_launch_runtimes_per_container: usize,
    /// CPU idle threshold gating pool rebuilds.
    pub quick_launch_idle_load: Option<f64>,
    /// Ordered container selection rules (pattern, container id).
    pub container_selection: Vec<(String, String)>,
}

impl Default for MainConfig {
    fn default() -> Self {
        Self {
            locale: "en".to_owned(),
            quick_launch_runtimes_per_container: 1,
            quick_launch_idle_load: None,
            container_selection: Vec::new(),
        }
    }
}

impl MainConfig {
    fn from_value(value: &Mapping) -> Self {
        let mut config = Self::default();

        if let Some(locale) = value.get("locale").and_then(Value::as_str) {
            config.locale = locale.to_owned();
        }
        if let Some(quick_launch) = value.get("quickLaunch").and_then(Value::as_mapping) {
            if let Some(n) = quick_launch
                .get("runtimesPerContainer")
                .and_then(Value::as_u64)
            {
                config.quick_launch_runtimes_per_container = n as usize;
            }
            if let Some(load) = quick_launch.get("idleLoad").and_then(Value::as_f64) {
                if load > 0.0 {
                    config.quick_launch_idle_load = Some(load);
                }
            }
        }
        if let Some(containers) = value.get("containers").and_then(Value::as_mapping) {
            if let Some(selection) = containers.get("selection").and_then(Value::as_sequence) {
                for rule in selection {
                    let Some(map) = rule.as_mapping() else {
                        continue;
                    };
                    for (pattern, container) in map {
                        if let (Some(pattern), Some(container)) =
                            (pattern.as_str(), container.as_str())
                        {
                            config
                                .container_selection
                                .push((pattern.to_owned(), container.to_owned()));
                        }
                    }
                }
            }
        }
        config
    }
}

/// Adaptor parsing configuration fragments into YAML mappings, with
/// recursive map merging.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlConfigFormat;

impl CacheFormat for YamlConfigFormat {
    type Item = Mapping;

    fn load_from_source(&self, content: &[u8], path: &Path) -> hangar_core::Result<Self::Item> {
        let text = std::str::from_utf8(content)
            .map_err(|_| Error::parse(path, "configuration is not valid utf-8"))?;

        let mut docs = serde_yaml::Deserializer::from_str(text);
        let header_doc = docs
            .next()
            .ok_or_else(|| Error::parse(path, "configuration is empty"))?;
        let header: Mapping = serde::Deserialize::deserialize(header_doc)
            .map_err(|e| Error::parse(path, format!("invalid format header: {e}")))?;
        let format_type = header.get("formatType").and_then(Value::as_str);
        if format_type != Some(CONFIG_FORMAT_TYPE) {
            return Err(Error::parse(
                path,
                format!("unsupported format type '{}'", format_type.unwrap_or_default()),
            ));
        }
        let format_version = header.get("formatVersion").and_then(Value::as_u64);
        if format_version != Some(u64::from(CONFIG_FORMAT_VERSION)) {
            return Err(Error::parse(path, "unsupported format version"));
        }

        let payload_doc = docs
            .next()
            .ok_or_else(|| Error::parse(path, "configuration has no payload document"))?;
        serde::Deserialize::deserialize(payload_doc)
            .map_err(|e| Error::parse(path, e.to_string()))
    }

    fn load_from_cache(&self, blob: &[u8]) -> hangar_core::Result<Self::Item> {
        let mut r = blob;
        let version =
            stream::read_u32(&mut r).map_err(|e| Error::parse("<cache>", e.to_string()))?;
        if version != CONFIG_STREAM_VERSION {
            return Err(Error::parse("<cache>", "unsupported stream version"));
        }
        let yaml = stream::read_str(&mut r).map_err(|e| Error::parse("<cache>", e.to_string()))?;
        serde_yaml::from_str(&yaml).map_err(|e| Error::parse("<cache>", e.to_string()))
    }

    fn save_to_cache(&self, item: &Self::Item) -> hangar_core::Result<Vec<u8>> {
        let yaml = serde_yaml::to_string(item)
            .map_err(|e| Error::Package(format!("cannot serialize configuration: {e}")))?;
        let mut out = Vec::new();
        let write = |w: &mut Vec<u8>| -> std::io::Result<()> {
            stream::write_u32(w, CONFIG_STREAM_VERSION)?;
            stream::write_str(w, &yaml)
        };
        write(&mut out).map_err(|e| Error::Package(format!("cannot serialize configuration: {e}")))?;
        Ok(out)
    }

    fn pre_process_source(&self, content: &mut Vec<u8>, _path: &Path) {
        if let Ok(text) = std::str::from_utf8(content) {
            let expanded = expand_env_references(text);
            *content = expanded.into_bytes();
        }
    }

    fn clone_item(&self, item: &Self::Item) -> Self::Item {
        item.clone()
    }

    fn merge(&self, dst: &mut Self::Item, src: &Self::Item) {
        merge_mappings(dst, src);
    }
}

/// Recursive map merge: maps merge key by key, anything else (scalars,
/// lists) is overwritten by the later fragment.
fn merge_mappings(dst: &mut Mapping, src: &Mapping) {
    for (key, value) in src {
        match (dst.get_mut(key), value.as_mapping()) {
            (Some(Value::Mapping(existing)), Some(incoming)) => {
                merge_mappings(existing, incoming);
            }
            _ => {
                dst.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Expand `${env:NAME}` references from the process environment; unset
/// variables expand to an empty string.
fn expand_env_references(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${env:") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 6..];
        match tail.find('}') {
            Some(end) => {
                let name = &tail[..end];
                if let Ok(value) = std::env::var(name) {
                    out.push_str(&value);
                }
                rest = &tail[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Load and merge the configuration fragments below `config_dir`.
///
/// A missing directory yields the defaults.
pub fn load(config_dir: &Path, cache_dir: &Path) -> Result<MainConfig> {
    let mut fragments: Vec<PathBuf> = match std::fs::read_dir(config_dir) {
        Ok(entries) => entries
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e == "yaml" || e == "yml")
            })
            .collect(),
        Err(_) => return Ok(MainConfig::default()),
    };
    fragments.sort();
    if fragments.is_empty() {
        return Ok(MainConfig::default());
    }
    debug!(fragments = fragments.len(), "loading configuration");

    let mut cache = ConfigCache::new(
        YamlConfigFormat,
        fragments,
        "config",
        *b"CFGM",
        CONFIG_STREAM_VERSION,
        Options::MERGED_RESULT,
    )
    .with_cache_dir(cache_dir);
    cache.parse().context("loading the configuration failed")?;

    let merged = cache
        .take_merged_result()
        .context("configuration is empty")?;
    Ok(MainConfig::from_value(&merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fragment(dir: &Path, name: &str, payload: &str) {
        fs::write(
            dir.join(name),
            format!("formatType: {CONFIG_FORMAT_TYPE}\nformatVersion: 1\n---\n{payload}"),
        )
        .unwrap();
    }

    #[test]
    fn later_fragments_shadow_earlier_ones() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("config");
        fs::create_dir_all(&config_dir).unwrap();
        fragment(
            &config_dir,
            "01-base.yaml",
            "locale: en\nquickLaunch:\n  runtimesPerContainer: 2\n  idleLoad: 0.5\n",
        );
        fragment(
            &config_dir,
            "02-site.yaml",
            "locale: de\ncontainers:\n  selection:\n  - 'com.example.*': process\n  - '*': process\n",
        );

        let config = load(&config_dir, &dir.path().join("cache")).unwrap();
        assert_eq!(config.locale, "de");
        assert_eq!(config.quick_launch_runtimes_per_container, 2);
        assert_eq!(config.quick_launch_idle_load, Some(0.5));
        assert_eq!(
            config.container_selection,
            vec![
                ("com.example.*".to_owned(), "process".to_owned()),
                ("*".to_owned(), "process".to_owned()),
            ]
        );
    }

    #[test]
    fn missing_directory_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&dir.path().join("nope"), &dir.path().join("cache")).unwrap();
        assert_eq!(config, MainConfig::default());
    }

    #[test]
    fn env_references_are_expanded() {
        let expanded = expand_env_references("locale: ${env:HANGAR_TEST_LOCALE_UNSET}\n");
        assert_eq!(expanded, "locale: \n");
        assert_eq!(expand_env_references("plain"), "plain");
        assert_eq!(expand_env_references("${env:broken"), "${env:broken");
    }

    #[test]
    fn broken_fragment_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("config");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(config_dir.join("bad.yaml"), "formatType: wrong\n---\nx: 1\n").unwrap();
        assert!(load(&config_dir, &dir.path().join("cache")).is_err());
    }

    #[test]
    fn second_load_reads_from_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("config");
        let cache_dir = dir.path().join("cache");
        fs::create_dir_all(&config_dir).unwrap();
        fragment(&config_dir, "01-base.yaml", "locale: sv\n");

        let first = load(&config_dir, &cache_dir).unwrap();
        let second = load(&config_dir, &cache_dir).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.locale, "sv");
    }
}
