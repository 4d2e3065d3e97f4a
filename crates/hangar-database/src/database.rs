//! Discovery and bookkeeping of built-in and installed packages.

use crate::manifest::{PackageInfo, PackageInfoFormat, DATA_STREAM_VERSION};
use crate::mounts::MountWatcher;
use hangar_archive::InstallationReport;
use hangar_cache::{ConfigCache, Options};
use hangar_core::{Error, PackageId, Result, Signal, Subscription};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Cache base name and type id for the built-in package set.
const BUILTIN_CACHE: (&str, [u8; 4]) = ("appdb-builtin", *b"PKGB");

/// Cache base name and type id for the installed package set.
const INSTALLED_CACHE: (&str, [u8; 4]) = ("appdb-installed", *b"PKGI");

/// Default key for sealing installation reports; deployments override it
/// with a per-installation secret.
pub const DEFAULT_REPORT_KEY: &[u8] = b"hangar-installation-report";

/// Which package locations to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Locations(u32);

impl Locations {
    /// Nothing.
    pub const NONE: Self = Self(0);
    /// Packages delivered with the system image.
    pub const BUILT_IN: Self = Self(1 << 0);
    /// Packages added through the installer.
    pub const INSTALLED: Self = Self(1 << 1);
    /// Both locations.
    pub const ALL: Self = Self(1 | 2);

    /// Whether all locations in `other` are included.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Locations {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

struct DbState {
    parsed: bool,
    parsed_locations: Locations,
    built_in: Vec<Arc<PackageInfo>>,
    installed: Vec<Arc<PackageInfo>>,
    load_from_cache: bool,
    save_to_cache: bool,
    hot_attach: Option<Subscription>,
}

struct DatabaseInner {
    built_in_dirs: Vec<PathBuf>,
    installed_dir: Option<PathBuf>,
    installed_mount_point: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    report_key: Vec<u8>,
    mount_watcher: MountWatcher,
    state: Mutex<DbState>,

    package_added: Signal<Arc<PackageInfo>>,
    package_about_to_be_removed: Signal<Arc<PackageInfo>>,
    installed_packages_parsed: Signal<()>,
}

/// The package database: discovers, validates and caches package manifests
/// and tracks additions and removals performed by the installer.
///
/// Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct PackageDatabase {
    inner: Arc<DatabaseInner>,
}

/// Configuration for constructing a [`PackageDatabase`].
#[derive(Debug, Default)]
pub struct PackageDatabaseBuilder {
    built_in_dirs: Vec<PathBuf>,
    installed_dir: Option<PathBuf>,
    installed_mount_point: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    report_key: Option<Vec<u8>>,
    mount_watcher: Option<MountWatcher>,
}

impl PackageDatabaseBuilder {
    /// Add a directory containing built-in packages.
    #[must_use]
    pub fn built_in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.built_in_dirs.push(dir.into());
        self
    }

    /// Set the directory the installer commits packages to.
    #[must_use]
    pub fn installed_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.installed_dir = Some(dir.into());
        self
    }

    /// Defer installed-package parsing until this mount point is mounted.
    #[must_use]
    pub fn installed_mount_point(mut self, mount_point: impl Into<PathBuf>) -> Self {
        self.installed_mount_point = Some(mount_point.into());
        self
    }

    /// Override the manifest cache directory.
    #[must_use]
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Key verifying `.installation-report.yaml` seals.
    #[must_use]
    pub fn report_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.report_key = Some(key.into());
        self
    }

    /// Use a specific mount watcher (test mode substitutes the mount table).
    #[must_use]
    pub fn mount_watcher(mut self, watcher: MountWatcher) -> Self {
        self.mount_watcher = Some(watcher);
        self
    }

    /// Build the database.
    #[must_use]
    pub fn build(self) -> PackageDatabase {
        PackageDatabase {
            inner: Arc::new(DatabaseInner {
                built_in_dirs: self.built_in_dirs,
                installed_dir: self.installed_dir,
                installed_mount_point: self.installed_mount_point,
                cache_dir: self.cache_dir,
                report_key: self.report_key.unwrap_or_else(|| DEFAULT_REPORT_KEY.to_vec()),
                mount_watcher: self.mount_watcher.unwrap_or_default(),
                state: Mutex::new(DbState {
                    parsed: false,
                    parsed_locations: Locations::NONE,
                    built_in: Vec::new(),
                    installed: Vec::new(),
                    load_from_cache: false,
                    save_to_cache: false,
                    hot_attach: None,
                }),
                package_added: Signal::new(),
                package_about_to_be_removed: Signal::new(),
                installed_packages_parsed: Signal::new(),
            }),
        }
    }
}

impl PackageDatabase {
    /// Start building a database.
    #[must_use]
    pub fn builder() -> PackageDatabaseBuilder {
        PackageDatabaseBuilder::default()
    }

    /// The directory the installer commits packages to.
    #[must_use]
    pub fn installed_dir(&self) -> Option<&Path> {
        self.inner.installed_dir.as_deref()
    }

    /// The key verifying installation report seals.
    #[must_use]
    pub fn report_key(&self) -> &[u8] {
        &self.inner.report_key
    }

    /// Allow reading previously written manifest caches.
    pub fn enable_load_from_cache(&self) {
        let mut state = self.inner.state.lock();
        if state.parsed {
            warn!("cannot change the caching mode after the initial load");
            return;
        }
        state.load_from_cache = true;
    }

    /// Allow writing manifest caches after parsing.
    pub fn enable_save_to_cache(&self) {
        let mut state = self.inner.state.lock();
        if state.parsed {
            warn!("cannot change the caching mode after the initial load");
            return;
        }
        state.save_to_cache = true;
    }

    /// Emitted for every package added after the initial parse.
    #[must_use]
    pub fn package_added(&self) -> &Signal<Arc<PackageInfo>> {
        &self.inner.package_added
    }

    /// Emitted before a package is removed from the database.
    #[must_use]
    pub fn package_about_to_be_removed(&self) -> &Signal<Arc<PackageInfo>> {
        &self.inner.package_about_to_be_removed
    }

    /// Emitted exactly once when a deferred installed-package parse finished
    /// after its mount point appeared.
    #[must_use]
    pub fn installed_packages_parsed(&self) -> &Signal<()> {
        &self.inner.installed_packages_parsed
    }

    /// The locations parsed so far.
    #[must_use]
    pub fn parsed_locations(&self) -> Locations {
        self.inner.state.lock().parsed_locations
    }

    /// All built-in packages.
    #[must_use]
    pub fn built_in_packages(&self) -> Vec<Arc<PackageInfo>> {
        self.inner.state.lock().built_in.clone()
    }

    /// All installed packages.
    #[must_use]
    pub fn installed_packages(&self) -> Vec<Arc<PackageInfo>> {
        self.inner.state.lock().installed.clone()
    }

    /// Look up any package (installed shadows built-in) by id.
    #[must_use]
    pub fn package(&self, id: &PackageId) -> Option<Arc<PackageInfo>> {
        let state = self.inner.state.lock();
        state
            .installed
            .iter()
            .chain(state.built_in.iter())
            .find(|p| p.package_id() == Some(id))
            .cloned()
    }

    /// Whether removing `package` (an installed package) would re-activate a
    /// built-in package with the same id.
    #[must_use]
    pub fn built_in_has_removable_update(&self, package: &PackageInfo) -> bool {
        let Some(id) = package.package_id() else {
            return false;
        };
        if package.built_in {
            return false;
        }
        let state = self.inner.state.lock();
        if !state
            .installed
            .iter()
            .any(|p| p.package_id() == Some(id))
        {
            return false;
        }
        state.built_in.iter().any(|p| p.package_id() == Some(id))
    }

    /// Parse the requested `locations`.
    ///
    /// Runs exactly once per location set. If an installed mount point was
    /// configured and is not yet mounted, installed parsing is deferred
    /// until the mount watcher reports that mount; a failure during that
    /// hot-attach aborts the process, because the system cannot continue
    /// with an inconsistent installed set.
    ///
    /// # Errors
    /// Fails with [`Error::AlreadyParsed`] on reinvocation and with parse
    /// errors for invalid built-in packages.
    pub fn parse(&self, locations: Locations) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.parsed {
                return Err(Error::AlreadyParsed);
            }
            state.parsed = true;
        }

        if locations.contains(Locations::BUILT_IN) {
            self.parse_built_in()?;
        }
        if locations.contains(Locations::INSTALLED) {
            self.parse_installed_or_defer()?;
        }
        Ok(())
    }

    fn cache_options(&self) -> Options {
        let state = self.inner.state.lock();
        let mut options = Options::IGNORE_BROKEN;
        if !state.load_from_cache {
            options |= Options::CLEAR_CACHE;
        }
        if !state.load_from_cache && !state.save_to_cache {
            options |= Options::NO_CACHE;
        }
        options
    }

    fn parse_built_in(&self) -> Result<()> {
        let mut manifests = Vec::new();
        for dir in &self.inner.built_in_dirs {
            manifests.extend(find_manifests_in_dir(dir, true));
        }

        let mut cache = ConfigCache::new(
            PackageInfoFormat,
            manifests.clone(),
            BUILTIN_CACHE.0,
            BUILTIN_CACHE.1,
            DATA_STREAM_VERSION,
            self.cache_options(),
        );
        if let Some(dir) = &self.inner.cache_dir {
            cache = cache.with_cache_dir(dir);
        }
        cache.parse()?;

        let mut packages = Vec::new();
        for (i, manifest) in manifests.iter().enumerate() {
            let dir_name = manifest_dir_name(manifest);
            let Some(mut info) = cache.take_result(i) else {
                warn!(manifest = %manifest.display(),
                      "not a valid manifest YAML file, ignoring");
                continue;
            };
            let id = info.package_id().map(PackageId::as_str).unwrap_or_default();
            if id != dir_name {
                return Err(Error::Package(format!(
                    "an info.yaml for packages must be in a directory that has the same name \
                     as the package's id: found '{id}'"
                )));
            }
            info.built_in = true;
            packages.push(Arc::new(info));
        }

        let mut state = self.inner.state.lock();
        state.built_in = packages;
        state.parsed_locations = state.parsed_locations | Locations::BUILT_IN;
        Ok(())
    }

    fn parse_installed_or_defer(&self) -> Result<()> {
        let Some(_installed_dir) = &self.inner.installed_dir else {
            let mut state = self.inner.state.lock();
            state.parsed_locations = state.parsed_locations | Locations::INSTALLED;
            return Ok(());
        };

        if let Some(mount_point) = self.inner.installed_mount_point.clone() {
            let watcher = &self.inner.mount_watcher;
            let db = self.clone();
            let mp = mount_point.clone();
            let subscription = watcher.mount_changed().connect(move |event| {
                if event.mount_point != mp || event.device.is_none() {
                    return;
                }
                db.on_installed_medium_mounted();
            });
            self.inner.state.lock().hot_attach = Some(subscription);
            watcher.add_mount_point(&mount_point);

            if watcher.current_mount_points().contains_key(&mount_point) {
                // already mounted: the subscription was only needed to close
                // the race between checking and subscribing
                if let Some(sub) = self.inner.state.lock().hot_attach.take() {
                    watcher.mount_changed().disconnect(sub);
                }
                return self.parse_installed();
            }
            debug!(mount_point = %mount_point.display(),
                   "deferring installed-package parsing until the medium is mounted");
            return Ok(());
        }

        self.parse_installed()
    }

    fn on_installed_medium_mounted(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.parsed_locations.contains(Locations::INSTALLED) {
                return;
            }
            if let Some(sub) = state.hot_attach.take() {
                self.inner.mount_watcher.mount_changed().disconnect(sub);
            }
        }
        // not in startup anymore: a failure here would leave the system
        // with an inconsistent installed set
        if let Err(e) = self.parse_installed() {
            error!("failed to parse the package meta-data after the installation medium was mounted: {e}");
            std::process::abort();
        }
        self.inner.installed_packages_parsed.emit(&());
    }

    fn parse_installed(&self) -> Result<()> {
        let Some(installed_dir) = self.inner.installed_dir.clone() else {
            return Ok(());
        };
        let manifests = find_manifests_in_dir(&installed_dir, false);

        let mut cache = ConfigCache::new(
            PackageInfoFormat,
            manifests.clone(),
            INSTALLED_CACHE.0,
            INSTALLED_CACHE.1,
            DATA_STREAM_VERSION,
            self.cache_options(),
        );
        if let Some(dir) = &self.inner.cache_dir {
            cache = cache.with_cache_dir(dir);
        }
        cache.parse()?;

        let mut packages = Vec::new();
        for (i, manifest) in manifests.iter().enumerate() {
            match self.load_installed_package(&mut cache, i, manifest) {
                Ok(info) => packages.push(Arc::new(info)),
                Err(e) => {
                    warn!(manifest = %manifest.display(), "ignoring broken package: {e}");
                }
            }
        }

        let mut state = self.inner.state.lock();
        state.installed = packages;
        state.parsed_locations = state.parsed_locations | Locations::INSTALLED;
        Ok(())
    }

    fn load_installed_package(
        &self,
        cache: &mut ConfigCache<PackageInfoFormat>,
        index: usize,
        manifest: &Path,
    ) -> Result<PackageInfo> {
        let dir = manifest
            .parent()
            .ok_or_else(|| Error::Package("manifest has no parent directory".into()))?;
        let dir_name = manifest_dir_name(manifest);

        let mut info = cache
            .take_result(index)
            .ok_or_else(|| Error::parse(manifest, "not a valid manifest YAML file"))?;

        let id = info.package_id().map(PackageId::as_str).unwrap_or_default();
        if id != dir_name {
            return Err(Error::Package(format!(
                "an info.yaml for packages must be in a directory that has the same name as \
                 the package's id: found '{id}'"
            )));
        }

        let report_path = dir.join(".installation-report.yaml");
        let raw = fs::read(&report_path).map_err(|e| Error::io(&report_path, e))?;
        let report = InstallationReport::deserialize(&raw, &self.inner.report_key)
            .map_err(|e| Error::Package(format!("failed to deserialize the installation report: {e}")))?;

        info.installation_report = Some(report);
        info.base_dir = dir.to_path_buf();
        Ok(info)
    }

    /// Register a freshly installed package (called by the installer after
    /// commit). Emits `package_added`.
    pub fn add_package_info(&self, info: PackageInfo) -> Arc<PackageInfo> {
        let info = Arc::new(info);
        self.inner.state.lock().installed.push(Arc::clone(&info));
        self.inner.package_added.emit(&info);
        info
    }

    /// Remove an installed package by id (called by the installer during
    /// deinstallation). Emits `package_about_to_be_removed` first.
    ///
    /// Returns the removed descriptor, or `None` if the id was not an
    /// installed package.
    pub fn remove_package_info(&self, id: &PackageId) -> Option<Arc<PackageInfo>> {
        let removed = {
            let state = self.inner.state.lock();
            state
                .installed
                .iter()
                .find(|p| p.package_id() == Some(id))
                .cloned()
        }?;
        self.inner.package_about_to_be_removed.emit(&removed);
        let mut state = self.inner.state.lock();
        state.installed.retain(|p| p.package_id() != Some(id));
        Some(removed)
    }
}

impl std::fmt::Debug for PackageDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("PackageDatabase")
            .field("built_in", &state.built_in.len())
            .field("installed", &state.installed.len())
            .field("parsed", &state.parsed)
            .finish_non_exhaustive()
    }
}

/// Find candidate manifest files below one base directory.
///
/// Skips installer leftovers (`+`/`-` suffixes), entries that are not
/// directories, invalid package ids and, for installed packages,
/// directories without an installation report.
fn find_manifests_in_dir(base_dir: &Path, scanning_built_in: bool) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(entries) = fs::read_dir(base_dir) else {
        return files;
    };

    let mut names: Vec<_> = entries
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .collect();
    names.sort();

    for pkg_dir in names {
        let Some(name) = pkg_dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        // ignore left-overs from the installer
        if name.ends_with('+') || name.ends_with('-') {
            continue;
        }
        if !pkg_dir.is_dir() {
            continue;
        }
        if !scanning_built_in && fs::symlink_metadata(&pkg_dir).map_or(true, |m| m.is_symlink()) {
            continue;
        }
        if let Err(reason) = PackageId::validate(name) {
            debug!(package = name, "ignoring package: not a valid package-id: {reason}");
            continue;
        }
        let manifest = pkg_dir.join("info.yaml");
        if !manifest.is_file() {
            debug!(package = name, "ignoring package: couldn't find an info.yaml manifest");
            continue;
        }
        if !scanning_built_in && !pkg_dir.join(".installation-report.yaml").is_file() {
            debug!(package = name,
                   "ignoring package: found a non-built-in package without an installation report");
            continue;
        }
        files.push(manifest);
    }
    files
}

fn manifest_dir_name(manifest: &Path) -> String {
    manifest
        .parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn write_manifest(dir: &Path, id: &str, name: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(
            dir.join("info.yaml"),
            format!(
                "formatType: am-package\nformatVersion: 1\n---\n\
                 id: {id}\ndisplayName:\n  en: {name}\ncode: main.qml\nruntime: qml\n"
            ),
        )
        .unwrap();
    }

    fn write_report(dir: &Path, id: &str, key: &[u8]) {
        let mut report = InstallationReport::new(PackageId::parse(id).unwrap());
        report.add_file("info.yaml");
        report.digest = "aa".repeat(32);
        report.disk_space_used = 1;
        fs::write(
            dir.join(".installation-report.yaml"),
            report.serialize(key).unwrap(),
        )
        .unwrap();
    }

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            fs::create_dir_all(dir.path().join("builtin")).unwrap();
            fs::create_dir_all(dir.path().join("installed")).unwrap();
            fs::create_dir_all(dir.path().join("cache")).unwrap();
            Self { dir }
        }

        fn builtin(&self) -> PathBuf {
            self.dir.path().join("builtin")
        }

        fn installed(&self) -> PathBuf {
            self.dir.path().join("installed")
        }

        fn builder(&self) -> PackageDatabaseBuilder {
            PackageDatabase::builder()
                .built_in_dir(self.builtin())
                .installed_dir(self.installed())
                .cache_dir(self.dir.path().join("cache"))
        }
    }

    #[test]
    fn discovers_built_in_packages() {
        let fx = Fixture::new();
        write_manifest(&fx.builtin().join("com.example.one"), "com.example.one", "One");
        write_manifest(&fx.builtin().join("com.example.two"), "com.example.two", "Two");

        let db = fx.builder().build();
        db.parse(Locations::ALL).unwrap();

        let built_in = db.built_in_packages();
        assert_eq!(built_in.len(), 2);
        assert!(built_in.iter().all(|p| p.built_in));
        assert!(db.parsed_locations().contains(Locations::ALL));
    }

    #[test]
    fn parse_twice_fails() {
        let fx = Fixture::new();
        let db = fx.builder().build();
        db.parse(Locations::BUILT_IN).unwrap();
        assert!(matches!(
            db.parse(Locations::INSTALLED),
            Err(Error::AlreadyParsed)
        ));
    }

    #[test]
    fn skips_installer_leftovers_and_invalid_ids() {
        let fx = Fixture::new();
        write_manifest(&fx.builtin().join("com.example.ok"), "com.example.ok", "Ok");
        write_manifest(&fx.builtin().join("com.example.stage+"), "com.example.stage", "S");
        write_manifest(&fx.builtin().join("com.example.backup-"), "com.example.backup", "B");
        write_manifest(&fx.builtin().join("Bad.Id"), "bad.id", "Bad");
        fs::create_dir_all(fx.builtin().join("com.example.nomanifest")).unwrap();

        let db = fx.builder().build();
        db.parse(Locations::BUILT_IN).unwrap();
        let built_in = db.built_in_packages();
        assert_eq!(built_in.len(), 1);
        assert_eq!(
            built_in[0].package_id().unwrap().as_str(),
            "com.example.ok"
        );
    }

    #[test]
    fn id_directory_mismatch_is_fatal_for_built_in() {
        let fx = Fixture::new();
        write_manifest(&fx.builtin().join("com.example.dir"), "com.example.other", "X");

        let db = fx.builder().build();
        assert!(db.parse(Locations::BUILT_IN).is_err());
    }

    #[test]
    fn installed_package_needs_a_valid_report() {
        let fx = Fixture::new();
        let good = fx.installed().join("com.example.good");
        write_manifest(&good, "com.example.good", "Good");
        write_report(&good, "com.example.good", DEFAULT_REPORT_KEY);

        // bad: report sealed with a different key
        let bad = fx.installed().join("com.example.bad");
        write_manifest(&bad, "com.example.bad", "Bad");
        write_report(&bad, "com.example.bad", b"wrong-key");

        let db = fx.builder().build();
        db.parse(Locations::ALL).unwrap();

        let installed = db.installed_packages();
        assert_eq!(installed.len(), 1);
        assert_eq!(
            installed[0].package_id().unwrap().as_str(),
            "com.example.good"
        );
        assert!(installed[0].installation_report.is_some());
    }

    #[test]
    fn installed_shadows_built_in() {
        let fx = Fixture::new();
        write_manifest(&fx.builtin().join("com.example.app"), "com.example.app", "Old");
        let update = fx.installed().join("com.example.app");
        write_manifest(&update, "com.example.app", "New");
        write_report(&update, "com.example.app", DEFAULT_REPORT_KEY);

        let db = fx.builder().build();
        db.parse(Locations::ALL).unwrap();

        let id = PackageId::parse("com.example.app").unwrap();
        let resolved = db.package(&id).unwrap();
        assert_eq!(resolved.name("en"), Some("New"));
        assert!(db.built_in_has_removable_update(&resolved));

        // built-in stays eligible for re-activation
        db.remove_package_info(&id);
        let resolved = db.package(&id).unwrap();
        assert_eq!(resolved.name("en"), Some("Old"));
        assert!(resolved.built_in);
    }

    #[test]
    fn mount_deferred_parse_loads_on_hot_attach() {
        let fx = Fixture::new();
        let good = fx.installed().join("com.example.media");
        write_manifest(&good, "com.example.media", "Media");
        write_report(&good, "com.example.media", DEFAULT_REPORT_KEY);

        let tab = fx.dir.path().join("mounts");
        fs::write(&tab, "/dev/root / ext4 rw 0 0\n").unwrap();
        let watcher = MountWatcher::with_mount_tab(&tab);

        let db = fx
            .builder()
            .installed_mount_point("/media/apps")
            .mount_watcher(watcher.clone())
            .build();

        let parsed_events = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&parsed_events);
        db.installed_packages_parsed().connect(move |()| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        db.parse(Locations::ALL).unwrap();
        assert!(db.installed_packages().is_empty());
        assert!(!db.parsed_locations().contains(Locations::INSTALLED));

        // the medium appears
        fs::write(
            &tab,
            "/dev/root / ext4 rw 0 0\n/dev/sdb1 /media/apps ext4 rw 0 0\n",
        )
        .unwrap();
        watcher.poll_now();

        assert_eq!(db.installed_packages().len(), 1);
        assert!(db.parsed_locations().contains(Locations::INSTALLED));
        assert_eq!(parsed_events.load(Ordering::Relaxed), 1);

        // a second mount cycle must not re-parse or re-emit
        fs::write(&tab, "/dev/root / ext4 rw 0 0\n").unwrap();
        watcher.poll_now();
        fs::write(
            &tab,
            "/dev/root / ext4 rw 0 0\n/dev/sdb1 /media/apps ext4 rw 0 0\n",
        )
        .unwrap();
        watcher.poll_now();
        assert_eq!(parsed_events.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn already_mounted_medium_parses_immediately() {
        let fx = Fixture::new();
        let good = fx.installed().join("com.example.media");
        write_manifest(&good, "com.example.media", "Media");
        write_report(&good, "com.example.media", DEFAULT_REPORT_KEY);

        let tab = fx.dir.path().join("mounts");
        fs::write(&tab, "/dev/sdb1 /media/apps ext4 rw 0 0\n").unwrap();
        let watcher = MountWatcher::with_mount_tab(&tab);

        let db = fx
            .builder()
            .installed_mount_point("/media/apps")
            .mount_watcher(watcher)
            .build();
        db.parse(Locations::ALL).unwrap();
        assert_eq!(db.installed_packages().len(), 1);
    }

    #[test]
    fn add_and_remove_emit_signals() {
        let fx = Fixture::new();
        let db = fx.builder().build();
        db.parse(Locations::ALL).unwrap();

        let added = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&added);
        let r = Arc::clone(&removed);
        db.package_added().connect(move |_| {
            a.fetch_add(1, Ordering::Relaxed);
        });
        db.package_about_to_be_removed().connect(move |_| {
            r.fetch_add(1, Ordering::Relaxed);
        });

        let id = PackageId::parse("com.example.dyn").unwrap();
        let mut info = PackageInfo {
            id: Some(id.clone()),
            code: "main.qml".into(),
            runtime: "qml".into(),
            ..PackageInfo::default()
        };
        info.base_dir = fx.installed().join("com.example.dyn");
        db.add_package_info(info);

        assert_eq!(added.load(Ordering::Relaxed), 1);
        assert!(db.package(&id).is_some());

        assert!(db.remove_package_info(&id).is_some());
        assert_eq!(removed.load(Ordering::Relaxed), 1);
        assert!(db.package(&id).is_none());
        assert!(db.remove_package_info(&id).is_none());
    }

    #[test]
    fn caching_round_trip_across_instances() {
        let fx = Fixture::new();
        write_manifest(&fx.builtin().join("com.example.one"), "com.example.one", "One");

        let db = fx.builder().build();
        db.enable_save_to_cache();
        db.parse(Locations::BUILT_IN).unwrap();
        assert_eq!(db.built_in_packages().len(), 1);

        let db2 = fx.builder().build();
        db2.enable_load_from_cache();
        db2.enable_save_to_cache();
        db2.parse(Locations::BUILT_IN).unwrap();
        assert_eq!(db2.built_in_packages().len(), 1);
        assert_eq!(
            db2.built_in_packages()[0].name("en"),
            Some("One")
        );
    }
}
