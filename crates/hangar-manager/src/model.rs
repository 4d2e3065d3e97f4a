//! The typed role surface of the application model.
//!
//! Views bind to a fixed enum of roles; every mutation is announced with
//! the precise set of changed roles plus a coarse per-application change
//! notification, so binding layers can translate to whatever change
//! protocol they use.

use crate::application::{Application, Package, RunState};
use std::collections::BTreeMap;

/// The roles exposed for every application in the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Application identifier.
    Id,
    /// Localized display name.
    Name,
    /// Icon reference.
    Icon,
    /// Run state: running.
    IsRunning,
    /// Run state: starting up.
    IsStartingUp,
    /// Run state: shutting down.
    IsShuttingDown,
    /// Blocked by an update or removal.
    IsBlocked,
    /// Owning package is being updated.
    IsUpdating,
    /// Owning package can be removed.
    IsRemovable,
    /// Progress of an in-flight update.
    UpdateProgress,
    /// Absolute path of the entry point.
    CodeFilePath,
    /// Requested runtime identifier.
    RuntimeName,
    /// Free-form runtime parameters.
    RuntimeParameters,
    /// Granted capabilities.
    Capabilities,
    /// Category tags.
    Categories,
    /// Package version string.
    Version,
    /// Exit code of the previous run.
    LastExitCode,
    /// Exit status of the previous run.
    LastExitStatus,
}

impl Role {
    /// Every role, in declaration order.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Id,
            Self::Name,
            Self::Icon,
            Self::IsRunning,
            Self::IsStartingUp,
            Self::IsShuttingDown,
            Self::IsBlocked,
            Self::IsUpdating,
            Self::IsRemovable,
            Self::UpdateProgress,
            Self::CodeFilePath,
            Self::RuntimeName,
            Self::RuntimeParameters,
            Self::Capabilities,
            Self::Categories,
            Self::Version,
            Self::LastExitCode,
            Self::LastExitStatus,
        ]
    }

    /// The roles affected by a run-state transition.
    #[must_use]
    pub const fn run_state_roles() -> &'static [Self] {
        &[Self::IsRunning, Self::IsStartingUp, Self::IsShuttingDown]
    }
}

/// A typed role value.
#[derive(Debug, Clone, PartialEq)]
pub enum RoleValue {
    /// Boolean role.
    Bool(bool),
    /// Integer role.
    Int(i64),
    /// Floating-point role.
    Float(f64),
    /// String role.
    String(String),
    /// String-list role.
    StringList(Vec<String>),
    /// Free-form map role.
    Map(BTreeMap<String, serde_yaml::Value>),
}

/// Compute the value of `role` for `app` within its owning `package`.
#[must_use]
pub fn role_value(package: &Package, app: &Application, role: Role, locale: &str) -> RoleValue {
    match role {
        Role::Id => RoleValue::String(app.id().to_string()),
        Role::Name => RoleValue::String(
            app.info()
                .display_name
                .get(locale)
                .or_else(|| app.info().display_name.get("en"))
                .or_else(|| app.info().display_name.values().next())
                .cloned()
                .unwrap_or_else(|| app.id().to_string()),
        ),
        Role::Icon => RoleValue::String(app.info().icon.clone()),
        Role::IsRunning => RoleValue::Bool(app.run_state() == RunState::Running),
        Role::IsStartingUp => RoleValue::Bool(app.run_state() == RunState::StartingUp),
        Role::IsShuttingDown => RoleValue::Bool(app.run_state() == RunState::ShuttingDown),
        Role::IsBlocked => RoleValue::Bool(app.is_blocked()),
        Role::IsUpdating => RoleValue::Bool(package.is_updating()),
        Role::IsRemovable => RoleValue::Bool(package.is_removable()),
        Role::UpdateProgress => RoleValue::Float(package.update_progress()),
        Role::CodeFilePath => {
            RoleValue::String(app.code_file_path().to_string_lossy().into_owned())
        }
        Role::RuntimeName => RoleValue::String(app.runtime_name().to_owned()),
        Role::RuntimeParameters => RoleValue::Map(app.info().runtime_parameters.clone()),
        Role::Capabilities => RoleValue::StringList(app.info().capabilities.clone()),
        Role::Categories => RoleValue::StringList(app.info().categories.clone()),
        Role::Version => RoleValue::String(package.info().version.clone()),
        Role::LastExitCode => RoleValue::Int(i64::from(app.last_exit().code)),
        Role::LastExitStatus => RoleValue::String(app.last_exit().status.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hangar_database::PackageInfo;
    use std::path::Path;
    use std::sync::Arc;

    fn package() -> Arc<Package> {
        let manifest = "\
formatType: am-package
formatVersion: 1
---
id: com.example.model
displayName:
  en: Model App
  de: Modell
displayIcon: icon.png
version: '2.0'
code: main.bin
runtime: process
capabilities: [location]
categories: [tools]
";
        let mut info =
            PackageInfo::from_manifest_bytes(manifest.as_bytes(), Path::new("info.yaml")).unwrap();
        info.base_dir = "/apps/com.example.model".into();
        Package::new(Arc::new(info))
    }

    #[test]
    fn role_values_reflect_the_manifest() {
        let package = package();
        let app = &package.applications()[0];

        assert_eq!(
            role_value(&package, app, Role::Id, "en"),
            RoleValue::String("com.example.model".into())
        );
        assert_eq!(
            role_value(&package, app, Role::Name, "de"),
            RoleValue::String("Modell".into())
        );
        assert_eq!(
            role_value(&package, app, Role::Name, "fr"),
            RoleValue::String("Model App".into())
        );
        assert_eq!(
            role_value(&package, app, Role::CodeFilePath, "en"),
            RoleValue::String("/apps/com.example.model/main.bin".into())
        );
        assert_eq!(
            role_value(&package, app, Role::RuntimeName, "en"),
            RoleValue::String("process".into())
        );
        assert_eq!(
            role_value(&package, app, Role::Capabilities, "en"),
            RoleValue::StringList(vec!["location".into()])
        );
        assert_eq!(
            role_value(&package, app, Role::Version, "en"),
            RoleValue::String("2.0".into())
        );
        assert_eq!(
            role_value(&package, app, Role::IsRunning, "en"),
            RoleValue::Bool(false)
        );
        assert_eq!(
            role_value(&package, app, Role::IsRemovable, "en"),
            RoleValue::Bool(true)
        );
        assert_eq!(
            role_value(&package, app, Role::LastExitStatus, "en"),
            RoleValue::String("NormalExit".into())
        );
    }

    #[test]
    fn all_roles_are_computable() {
        let package = package();
        let app = &package.applications()[0];
        for role in Role::all() {
            let _ = role_value(&package, app, *role, "en");
        }
    }
}
