//! Error types for credential specs, stores, and file observation.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Boxed error type used by reload listener callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced while parsing or serializing a [`CredentialFileSpec`].
///
/// These are configuration errors: the descriptor text itself is malformed or
/// names files that cannot be used.
///
/// [`CredentialFileSpec`]: crate::CredentialFileSpec
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SpecError {
    /// The descriptor is missing the required `location` key.
    #[error("missing file location")]
    MissingLocation,

    /// A file named by the descriptor is missing, unreadable, or not regular.
    #[error("cannot read {role} file {path}")]
    UnreadableFile {
        /// Which descriptor key named the file (`location`, `password.location`, ...).
        role: &'static str,
        /// The offending path.
        path: PathBuf,
    },

    /// The descriptor contains a character outside ISO-8859-1.
    #[error("character {0:?} is not representable in ISO-8859-1")]
    Unencodable(char),

    /// I/O failure reading or writing descriptor text.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors produced by a [`CredentialFormat`] parser.
///
/// [`CredentialFormat`]: crate::store::CredentialFormat
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FormatError {
    /// No parser is registered for the requested format tag.
    #[error("no credential format registered for tag {0:?}")]
    UnknownFormat(String),

    /// The credential data does not parse under the declared format.
    #[error("malformed credential data: {0}")]
    Malformed(String),

    /// The credential data did not decrypt/verify under the supplied password.
    #[error("credential data rejected the supplied password")]
    BadPassword,

    /// The credential data parsed but contained no usable entries.
    #[error("credential data contains no entries")]
    NoEntries,

    /// I/O failure while parsing.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors produced by a [`DynamicCredentialStore`].
///
/// The first load of a store surfaces these unchanged to the caller; reload
/// failures after that are logged at the coordinator boundary while the
/// previous credential generation stays in effect.
///
/// [`DynamicCredentialStore`]: crate::DynamicCredentialStore
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The descriptor is invalid.
    #[error(transparent)]
    Spec(#[from] SpecError),

    /// The credential data failed to parse.
    #[error(transparent)]
    Format(#[from] FormatError),

    /// A mutation method was called; the store is read-only and the file is
    /// the source of truth.
    #[error("credential store does not support in-memory changes")]
    ReadOnly,

    /// I/O failure reading the credential data or a password file.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors produced by the [`FileObserver`].
///
/// [`FileObserver`]: crate::FileObserver
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ObserverError {
    /// `start` was called more than once on the same observer.
    #[error("file observer is already started")]
    AlreadyStarted,

    /// The observer has been closed.
    #[error("file observer is closed")]
    Closed,

    /// The underlying OS watch facility failed.
    #[error("file watch error: {0}")]
    Watch(#[from] notify::Error),

    /// I/O failure resolving a watched path.
    #[error(transparent)]
    Io(#[from] io::Error),
}
