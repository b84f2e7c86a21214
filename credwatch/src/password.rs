//! Password file loading.

use std::fs;
use std::io;
use std::path::Path;

/// Reads a password stored in a UTF-8 file.
///
/// The returned value is **trimmed** of surrounding whitespace. This is part
/// of the operator contract: a trailing newline left by `echo` or an editor
/// is not part of the password, and consequently a password consisting only
/// of whitespace cannot be stored in a file.
///
/// # Errors
///
/// Returns an I/O error if the file does not exist or cannot be opened, or an
/// [`io::ErrorKind::InvalidData`] error if its content is not valid UTF-8.
pub fn load_password(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    let text = String::from_utf8(bytes).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("password file {} is not valid UTF-8", path.display()),
        )
    })?;

    Ok(text.trim().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_password_file(content: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn trims_surrounding_whitespace() {
        let file = write_password_file(b"  changeit\n");
        assert_eq!(load_password(file.path()).unwrap(), "changeit");
    }

    #[test]
    fn preserves_interior_whitespace() {
        let file = write_password_file(b"pass phrase\n");
        assert_eq!(load_password(file.path()).unwrap(), "pass phrase");
    }

    #[test]
    fn whitespace_only_becomes_empty() {
        let file = write_password_file(b" \n\t\n");
        assert_eq!(load_password(file.path()).unwrap(), "");
    }

    #[test]
    fn rejects_invalid_utf8() {
        let file = write_password_file(&[0xff, 0xfe, 0x00]);
        let err = load_password(file.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_password(&dir.path().join("absent")).is_err());
    }
}
