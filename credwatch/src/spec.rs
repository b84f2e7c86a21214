//! Parsed descriptor of one watched credential set.
//!
//! A [`CredentialFileSpec`] does not hold credential bytes; it names the file
//! that does, the format tag to parse it with, and optional password files.
//! The text form is line-oriented `key=value` in ISO-8859-1, for
//! interoperability with legacy keystore configuration ecosystems.

use crate::error::SpecError;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Descriptor key naming the credential data file.
pub const KEY_LOCATION: &str = "location";
/// Descriptor key naming the credential format tag.
pub const KEY_ALGORITHM: &str = "keystore.algorithm";
/// Descriptor key naming the store password file.
pub const KEY_PASSWORD_LOCATION: &str = "password.location";
/// Descriptor key naming the private-key password file.
pub const KEY_KEYPASS_LOCATION: &str = "keypass.location";

/// Format tag assumed when the descriptor does not carry one.
pub const DEFAULT_FORMAT_TAG: &str = "PKCS12";

static NEXT_MARKER: AtomicU64 = AtomicU64::new(1);

fn next_marker() -> u64 {
    NEXT_MARKER.fetch_add(1, Ordering::Relaxed)
}

/// Descriptor of one watched credential set.
///
/// Immutable once constructed. Two instances with identical fields still
/// serialize to distinct text: each instance embeds a unique marker in a
/// comment line, so the serialized form identifies the instance, not just the
/// configuration. Parsing ignores comments, so
/// `CredentialFileSpec::from_text(&s.to_text())` compares equal to `s`.
#[derive(Debug)]
pub struct CredentialFileSpec {
    format_tag: String,
    data_path: PathBuf,
    password_path: Option<PathBuf>,
    keypass_path: Option<PathBuf>,
    marker: u64,
}

impl PartialEq for CredentialFileSpec {
    fn eq(&self, other: &Self) -> bool {
        // The marker identifies an instance, not a configuration.
        self.format_tag == other.format_tag
            && self.data_path == other.data_path
            && self.password_path == other.password_path
            && self.keypass_path == other.keypass_path
    }
}

impl Eq for CredentialFileSpec {}

impl Clone for CredentialFileSpec {
    fn clone(&self) -> Self {
        Self {
            format_tag: self.format_tag.clone(),
            data_path: self.data_path.clone(),
            password_path: self.password_path.clone(),
            keypass_path: self.keypass_path.clone(),
            marker: next_marker(),
        }
    }
}

impl CredentialFileSpec {
    /// Creates a descriptor from its parts, validating the named files.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::UnreadableFile`] if `data_path` (or a password
    /// path, when given) is missing, unreadable, or not a regular file.
    pub fn new(
        format_tag: impl Into<String>,
        data_path: impl Into<PathBuf>,
        password_path: Option<PathBuf>,
        keypass_path: Option<PathBuf>,
    ) -> Result<Self, SpecError> {
        let data_path = data_path.into();
        require_regular("location", &data_path)?;
        if let Some(path) = &password_path {
            require_regular("password.location", path)?;
        }
        if let Some(path) = &keypass_path {
            require_regular("keypass.location", path)?;
        }

        Ok(Self {
            format_tag: format_tag.into(),
            data_path,
            password_path,
            keypass_path,
            marker: next_marker(),
        })
    }

    /// Parses the ISO-8859-1 text form.
    ///
    /// Lines are `key=value`; blank lines and `#` comments are ignored, as
    /// are unknown keys. `location` is required; `keystore.algorithm`
    /// defaults to [`DEFAULT_FORMAT_TAG`].
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::MissingLocation`] when the `location` key is
    /// absent, or [`SpecError::UnreadableFile`] when a named file cannot be
    /// used.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SpecError> {
        Self::from_text(&from_latin1(bytes))
    }

    /// Parses the text form from a string. See [`CredentialFileSpec::from_bytes`].
    ///
    /// # Errors
    ///
    /// Same as [`CredentialFileSpec::from_bytes`].
    pub fn from_text(text: &str) -> Result<Self, SpecError> {
        let mut location = None;
        let mut algorithm = None;
        let mut password_location = None;
        let mut keypass_location = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                KEY_LOCATION => location = Some(value.to_owned()),
                KEY_ALGORITHM => algorithm = Some(value.to_owned()),
                KEY_PASSWORD_LOCATION => password_location = Some(value.to_owned()),
                KEY_KEYPASS_LOCATION => keypass_location = Some(value.to_owned()),
                _ => {}
            }
        }

        let location = location.ok_or(SpecError::MissingLocation)?;
        let format_tag = algorithm
            .unwrap_or_else(|| DEFAULT_FORMAT_TAG.to_owned())
            .trim()
            .to_owned();

        Self::new(
            format_tag,
            PathBuf::from(location),
            password_location.map(PathBuf::from),
            keypass_location.map(PathBuf::from),
        )
    }

    /// Serializes to the text form.
    ///
    /// The first line is a comment carrying this instance's unique marker, so
    /// no two live descriptors serialize identically even when configured the
    /// same.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# credwatch-descriptor@{:016x}\n", self.marker));
        out.push_str(&format!("{KEY_LOCATION}={}\n", self.data_path.display()));
        out.push_str(&format!("{KEY_ALGORITHM}={}\n", self.format_tag));
        if let Some(path) = &self.password_path {
            out.push_str(&format!("{KEY_PASSWORD_LOCATION}={}\n", path.display()));
        }
        if let Some(path) = &self.keypass_path {
            out.push_str(&format!("{KEY_KEYPASS_LOCATION}={}\n", path.display()));
        }
        out
    }

    /// Serializes to ISO-8859-1 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Unencodable`] if a path or format tag contains a
    /// character outside ISO-8859-1.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SpecError> {
        to_latin1(&self.to_text())
    }

    /// Format tag passed to the credential parser (e.g. `PKCS12`, `PEM`).
    pub fn format_tag(&self) -> &str {
        &self.format_tag
    }

    /// Path of the credential data file.
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Path of the store password file, if configured.
    pub fn password_path(&self) -> Option<&Path> {
        self.password_path.as_deref()
    }

    /// Path of the private-key password file, if configured.
    pub fn keypass_path(&self) -> Option<&Path> {
        self.keypass_path.as_deref()
    }
}

fn require_regular(role: &'static str, path: &Path) -> Result<(), SpecError> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(()),
        _ => Err(SpecError::UnreadableFile {
            role,
            path: path.to_owned(),
        }),
    }
}

/// Decodes ISO-8859-1 bytes; every byte maps directly to the code point of
/// the same value, so this cannot fail.
fn from_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Encodes to ISO-8859-1, rejecting code points above U+00FF.
fn to_latin1(text: &str) -> Result<Vec<u8>, SpecError> {
    let mut out = Vec::with_capacity(text.len());
    for c in text.chars() {
        let cp = u32::from(c);
        if cp > 0xff {
            return Err(SpecError::Unencodable(c));
        }
        out.push(cp as u8);
    }
    Ok(out)
}
