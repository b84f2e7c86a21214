//! Credential stores and the parser seam behind them.

mod dynamic;
mod format;
mod parsed;

pub use dynamic::DynamicCredentialStore;
pub use format::{CredentialFormat, FormatRegistry, PemFormat};
pub use parsed::{CredentialEntry, ParsedCredentials};
