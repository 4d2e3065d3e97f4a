//! Detached signature verification for package digests.
//!
//! Packages can carry two signatures in their footer: the developer
//! signature, verified whenever present, and the store signature, verified
//! when the package is installed to a trusted or built-in destination. Both
//! are Ed25519 detached signatures over the package digest bytes.

use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hangar_core::{Error, Result};

/// Which signature slot is being verified; used in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureRole {
    /// The package author's signature.
    Developer,
    /// The distributing store's signature.
    Store,
}

impl std::fmt::Display for SignatureRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Developer => f.write_str("developer"),
            Self::Store => f.write_str("store"),
        }
    }
}

/// Verify a base64-encoded detached signature over `digest`.
///
/// # Errors
/// Fails with a `Cryptography` error when the signature is malformed or does
/// not verify against `public_key` (32 raw bytes).
pub fn verify_signature(
    role: SignatureRole,
    digest: &[u8],
    signature_b64: &str,
    public_key: &[u8],
) -> Result<()> {
    let key_bytes: [u8; 32] = public_key
        .try_into()
        .map_err(|_| Error::Cryptography(format!("invalid {role} verification key length")))?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| Error::Cryptography(format!("invalid {role} verification key: {e}")))?;

    let sig_bytes = base64::engine::general_purpose::STANDARD
        .decode(signature_b64.trim())
        .map_err(|e| Error::Cryptography(format!("malformed {role} signature encoding: {e}")))?;
    let sig_array: [u8; 64] = sig_bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::Cryptography(format!("invalid {role} signature length")))?;
    let signature = Signature::from_bytes(&sig_array);

    key.verify(digest, &signature)
        .map_err(|_| Error::Cryptography(format!("the {role} signature could not be verified")))
}

/// Create a base64-encoded detached signature over `digest` with a raw
/// 32-byte secret key. Used by the packaging side and the test-suite.
///
/// # Errors
/// Fails with a `Cryptography` error for an invalid key.
pub fn create_signature(digest: &[u8], secret_key: &[u8]) -> Result<String> {
    use ed25519_dalek::Signer;

    let key_bytes: [u8; 32] = secret_key
        .try_into()
        .map_err(|_| Error::Cryptography("invalid signing key length".into()))?;
    let key = ed25519_dalek::SigningKey::from_bytes(&key_bytes);
    let signature = key.sign(digest);
    Ok(base64::engine::general_purpose::STANDARD.encode(signature.to_bytes()))
}
