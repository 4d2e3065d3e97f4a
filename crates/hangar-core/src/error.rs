//! Error types for Hangar operations.

use std::path::PathBuf;
use thiserror::Error;

/// Coarse error categories, published alongside task failures and exposed
/// over the management interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// No error.
    None,
    /// Operation was canceled.
    Canceled,
    /// A source file could not be parsed.
    Parse,
    /// I/O failure.
    Io,
    /// Insufficient permissions.
    Permissions,
    /// Network failure.
    Network,
    /// Not enough disk space.
    StorageSpace,
    /// Digest, HMAC or signature failure.
    Cryptography,
    /// Malformed or inconsistent archive.
    Archive,
    /// Package-level inconsistency.
    Package,
    /// Resource is locked by another operation.
    Locked,
    /// Package is not installed.
    NotInstalled,
    /// Package is already installed.
    AlreadyInstalled,
    /// The installation medium is not available.
    MediumNotAvailable,
    /// The installation medium is the wrong one.
    WrongMedium,
    /// Intent delivery failure.
    Intents,
}

/// Main error type for Hangar.
#[derive(Error, Debug)]
pub enum Error {
    /// Operation was canceled cooperatively.
    #[error("canceled")]
    Canceled,

    /// A source file could not be parsed.
    #[error("could not parse {path}: {message}")]
    Parse {
        /// Source file path.
        path: PathBuf,
        /// Parser diagnostic.
        message: String,
    },

    /// IO error.
    #[error("io error at {path}: {message}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// Insufficient permissions.
    #[error("permission denied: {0}")]
    Permissions(String),

    /// Network error.
    #[error("network error: {0}")]
    Network(String),

    /// Not enough disk space left.
    #[error("not enough disk space: {0}")]
    StorageSpace(String),

    /// Digest, HMAC or signature verification failure.
    #[error("cryptography error: {0}")]
    Cryptography(String),

    /// Archive error.
    #[error("archive error: {0}")]
    Archive(String),

    /// Package-level inconsistency.
    #[error("package error: {0}")]
    Package(String),

    /// Resource is locked by a concurrent operation.
    #[error("locked: {0}")]
    Locked(String),

    /// The package is not installed.
    #[error("package '{0}' is not installed")]
    NotInstalled(String),

    /// The package is already installed.
    #[error("package '{0}' is already installed")]
    AlreadyInstalled(String),

    /// The installation medium is not mounted.
    #[error("installation medium is not available: {0}")]
    MediumNotAvailable(String),

    /// The installation medium does not match the expected one.
    #[error("wrong installation medium: {0}")]
    WrongMedium(String),

    /// Intent delivery failure.
    #[error("intent error: {0}")]
    Intents(String),

    /// `parse()` was invoked a second time on the same instance.
    #[error("parse() has been called multiple times")]
    AlreadyParsed,

    /// Two input paths canonicalize to the same file.
    #[error("duplicate files are not allowed - found {path} at least two times")]
    DuplicateFile {
        /// The offending canonical path.
        path: PathBuf,
    },

    /// A metadata file exceeded the 1 MiB limit.
    #[error("file {path} is too big ({size} > 1MB)")]
    FileTooBig {
        /// Source file path.
        path: PathBuf,
        /// Actual size in bytes.
        size: u64,
    },

    /// An archive entry resolves outside the extraction directory.
    #[error("invalid path in archive: {path}")]
    InvalidPath {
        /// The offending entry path.
        path: PathBuf,
    },
}

impl Error {
    /// Create an IO error with context.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Create a parse error with context.
    #[must_use]
    pub fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Map to the coarse category used in task failure reports.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Canceled => ErrorKind::Canceled,
            Self::Parse { .. } | Self::AlreadyParsed | Self::DuplicateFile { .. } => {
                ErrorKind::Parse
            }
            Self::Io { .. } | Self::FileTooBig { .. } => ErrorKind::Io,
            Self::Permissions(_) => ErrorKind::Permissions,
            Self::Network(_) => ErrorKind::Network,
            Self::StorageSpace(_) => ErrorKind::StorageSpace,
            Self::Cryptography(_) => ErrorKind::Cryptography,
            Self::Archive(_) | Self::InvalidPath { .. } => ErrorKind::Archive,
            Self::Package(_) => ErrorKind::Package,
            Self::Locked(_) => ErrorKind::Locked,
            Self::NotInstalled(_) => ErrorKind::NotInstalled,
            Self::AlreadyInstalled(_) => ErrorKind::AlreadyInstalled,
            Self::MediumNotAvailable(_) => ErrorKind::MediumNotAvailable,
            Self::WrongMedium(_) => ErrorKind::WrongMedium,
            Self::Intents(_) => ErrorKind::Intents,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Canceled => "canceled",
            Self::Parse => "parse",
            Self::Io => "io",
            Self::Permissions => "permissions",
            Self::Network => "network",
            Self::StorageSpace => "storage-space",
            Self::Cryptography => "cryptography",
            Self::Archive => "archive",
            Self::Package => "package",
            Self::Locked => "locked",
            Self::NotInstalled => "not-installed",
            Self::AlreadyInstalled => "already-installed",
            Self::MediumNotAvailable => "medium-not-available",
            Self::WrongMedium => "wrong-medium",
            Self::Intents => "intents",
        };
        f.write_str(name)
    }
}

/// Result type for Hangar operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mapping() {
        assert_eq!(Error::Canceled.kind(), ErrorKind::Canceled);
        assert_eq!(
            Error::io("/tmp/x", std::io::Error::other("boom")).kind(),
            ErrorKind::Io
        );
        assert_eq!(
            Error::InvalidPath {
                path: "../evil".into()
            }
            .kind(),
            ErrorKind::Archive
        );
        assert_eq!(Error::AlreadyParsed.kind(), ErrorKind::Parse);
    }

    #[test]
    fn display_contains_context() {
        let err = Error::FileTooBig {
            path: "/some/info.yaml".into(),
            size: 2 * 1024 * 1024,
        };
        let msg = err.to_string();
        assert!(msg.contains("info.yaml"));
        assert!(msg.contains("too big"));
    }
}
