//! Fingerprint keys identifying a notebook's executable content.
//!
//! The key covers the ordered code-cell sources, the kernel name, and the
//! configuration that changes what the outputs look like (`allow_errors`).
//! Markdown, titles, and prior outputs are deliberately left out, so edits
//! to prose never invalidate cached outputs. The timeout is left out too:
//! it decides whether a run finishes, not what a finished run produces.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::notebook::Notebook;

/// Bumped whenever the hashed layout changes.
const FINGERPRINT_VERSION: u32 = 1;

const DOMAIN_TAG: &[u8] = b"cellar-fingerprint\0";

/// Configuration that participates in the fingerprint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FingerprintSettings {
    /// Whether cell errors are recorded instead of aborting.
    pub allow_errors: bool,
}

/// A SHA-256 digest over a canonical framing of the executable content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FingerprintKey([u8; 32]);

impl FingerprintKey {
    /// Compute the key for an ordered list of code-cell sources.
    ///
    /// Every variable-length field is length-prefixed, so `["ab", "c"]` and
    /// `["a", "bc"]` hash differently.
    pub fn compute<S: AsRef<str>>(
        code_sources: &[S],
        kernel: &str,
        settings: FingerprintSettings,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(DOMAIN_TAG);
        hasher.update(FINGERPRINT_VERSION.to_le_bytes());
        update_field(&mut hasher, kernel.as_bytes());
        hasher.update([u8::from(settings.allow_errors)]);
        hasher.update((code_sources.len() as u64).to_le_bytes());
        for source in code_sources {
            update_field(&mut hasher, source.as_ref().as_bytes());
        }
        Self(hasher.finalize().into())
    }

    /// Compute the key for a notebook run under `kernel`.
    pub fn for_notebook(notebook: &Notebook, kernel: &str, settings: FingerprintSettings) -> Self {
        Self::compute(&notebook.code_sources(), kernel, settings)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding, used as the on-disk entry name.
    pub fn to_hex(&self) -> String {
        self.to_string()
    }
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

impl fmt::Display for FingerprintKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Error parsing a hex fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid fingerprint key: {0}")]
pub struct ParseKeyError(String);

impl FromStr for FingerprintKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 || !s.is_ascii() {
            return Err(ParseKeyError(s.to_string()));
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| ParseKeyError(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}
