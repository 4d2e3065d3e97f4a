//! Package identifier validation.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Maximum length of a package identifier.
const MAX_ID_LENGTH: usize = 150;

/// A validated package identifier (reverse-DNS style, e.g. `com.example.hello`).
///
/// The identifier doubles as the on-disk directory name of the package, so the
/// grammar is restricted to characters that are safe on every supported
/// filesystem. Deserialization validates, so untrusted manifests cannot smuggle
/// in an invalid identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PackageId(String);

impl<'de> Deserialize<'de> for PackageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .map_err(|reason| serde::de::Error::custom(format!("not a valid package-id: {reason}")))
    }
}

impl PackageId {
    /// Validate and wrap an identifier.
    ///
    /// # Errors
    /// Returns a human-readable reason if the identifier violates the grammar.
    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    /// Check an identifier against the grammar without allocating.
    ///
    /// # Errors
    /// Returns a human-readable reason on violation.
    pub fn validate(s: &str) -> std::result::Result<(), String> {
        if s.is_empty() {
            return Err("must not be empty".into());
        }
        if s.len() > MAX_ID_LENGTH {
            return Err(format!("must not be longer than {MAX_ID_LENGTH} characters"));
        }
        if s.starts_with('.') || s.ends_with('.') || s.starts_with('-') || s.ends_with('-') {
            return Err("must not start or end with '.' or '-'".into());
        }
        if s.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            return Err("must not start with a digit".into());
        }
        if s.contains("..") {
            return Err("must not contain consecutive dots".into());
        }
        for (pos, ch) in s.char_indices() {
            let ok = ch.is_ascii_lowercase()
                || ch.is_ascii_digit()
                || ch == '.'
                || ch == '-'
                || ch == '_';
            if !ok {
                return Err(format!("invalid character '{ch}' at position {pos}"));
            }
        }
        Ok(())
    }

    /// Whether `s` is a valid identifier.
    #[must_use]
    pub fn is_valid(s: &str) -> bool {
        Self::validate(s).is_ok()
    }

    /// Get the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PackageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for PackageId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_reverse_dns_ids() {
        for id in ["com.example.hello", "org.kde.kate", "a", "x_1-2.y"] {
            assert!(PackageId::is_valid(id), "{id} should be valid");
        }
    }

    #[test]
    fn rejects_bad_ids() {
        for id in [
            "",
            ".leading",
            "trailing.",
            "-leading",
            "1leading",
            "123.foo",
            "two..dots",
            "Upper.Case",
            "spa ce",
            "umläut",
            "slash/inside",
        ] {
            assert!(!PackageId::is_valid(id), "{id} should be invalid");
        }
    }

    #[test]
    fn rejects_overlong_id() {
        let id = "a".repeat(151);
        assert!(!PackageId::is_valid(&id));
        let id = "a".repeat(150);
        assert!(PackageId::is_valid(&id));
    }

    #[test]
    fn round_trips_through_serde() {
        let id = PackageId::parse("com.example.hello").unwrap();
        let yaml = serde_yaml::to_string(&id).unwrap();
        let back: PackageId = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn deserialization_validates() {
        assert!(serde_yaml::from_str::<PackageId>("'has spaces'").is_err());
        assert!(serde_yaml::from_str::<PackageId>("'../escape'").is_err());
    }
}
