//! Key-store file locations.
//!
//! Resolving paths never touches the filesystem; files are only opened by
//! the explicit `load_*` calls.

use crate::store::{FingerprintTable, PrivKeys};
use crate::KeyTrustError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Directory under `$HOME` where libpurple keeps its OTR files.
pub const PURPLE_DIR: &str = ".purple";
pub const PRIVATE_KEY_FILE: &str = "otr.private_key";
pub const FINGERPRINT_FILE: &str = "otr.fingerprints";

/// Where the private key store and the fingerprint table live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorePaths {
    #[serde(rename = "privateKeyFile")]
    pub private_key_file: PathBuf,
    #[serde(rename = "fingerprintFile")]
    pub fingerprint_file: PathBuf,
}

impl StorePaths {
    /// The conventional libpurple layout under `home`.
    pub fn purple_default(home: &Path) -> Self {
        let dir = home.join(PURPLE_DIR);
        StorePaths {
            private_key_file: dir.join(PRIVATE_KEY_FILE),
            fingerprint_file: dir.join(FINGERPRINT_FILE),
        }
    }

    /// The libpurple layout under `$HOME`.
    ///
    /// # Errors
    /// Returns `KeyTrustError::Config` if `HOME` is not set.
    pub fn from_env() -> Result<Self, KeyTrustError> {
        let home = std::env::var_os("HOME")
            .ok_or_else(|| KeyTrustError::Config("HOME is not set".to_string()))?;
        Ok(StorePaths::purple_default(Path::new(&home)))
    }

    /// Parse paths from JSON such as
    /// `{"privateKeyFile": "...", "fingerprintFile": "..."}`.
    ///
    /// # Errors
    /// Returns `KeyTrustError::Config` if a field is missing or the JSON is
    /// malformed.
    pub fn from_json(text: &str) -> Result<Self, KeyTrustError> {
        serde_json::from_str(text)
            .map_err(|e| KeyTrustError::Config(format!("invalid store configuration: {}", e)))
    }

    /// Read the JSON configuration at `path`.
    ///
    /// # Errors
    /// Returns `KeyTrustError::Io` if the file cannot be opened and
    /// `KeyTrustError::Config` if its contents are invalid.
    pub fn from_file(path: &Path) -> Result<Self, KeyTrustError> {
        let reader = BufReader::new(File::open(path)?);
        serde_json::from_reader(reader).map_err(|e| {
            KeyTrustError::Config(format!("invalid store configuration {}: {}", path.display(), e))
        })
    }

    /// Copy kept before the fingerprint table is rewritten.
    pub fn fingerprint_backup(&self) -> PathBuf {
        let mut name = self.fingerprint_file.clone().into_os_string();
        name.push(".bak");
        PathBuf::from(name)
    }

    /// Open and parse the private key store.
    ///
    /// # Errors
    /// Returns `KeyTrustError::Io` if the file cannot be opened, otherwise
    /// any error from `PrivKeys::load`.
    pub fn load_private_keys(&self) -> Result<PrivKeys, KeyTrustError> {
        PrivKeys::load(File::open(&self.private_key_file)?)
    }

    /// Open and parse the fingerprint table.
    ///
    /// # Errors
    /// Returns `KeyTrustError::Io` if the file cannot be opened, otherwise
    /// any error from `FingerprintTable::from_reader`.
    pub fn load_fingerprints(&self) -> Result<FingerprintTable, KeyTrustError> {
        FingerprintTable::from_reader(BufReader::new(File::open(&self.fingerprint_file)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purple_default() {
        let paths = StorePaths::purple_default(Path::new("/home/alice"));
        assert_eq!(
            paths.private_key_file,
            PathBuf::from("/home/alice/.purple/otr.private_key")
        );
        assert_eq!(
            paths.fingerprint_backup(),
            PathBuf::from("/home/alice/.purple/otr.fingerprints.bak")
        );
    }

    #[test]
    fn test_from_json() {
        let paths = StorePaths::from_json(
            r#"{"privateKeyFile": "/tmp/keys", "fingerprintFile": "/tmp/fprs"}"#,
        )
        .unwrap();
        assert_eq!(paths.private_key_file, PathBuf::from("/tmp/keys"));
        assert_eq!(paths.fingerprint_file, PathBuf::from("/tmp/fprs"));
    }

    #[test]
    fn test_from_json_missing_field() {
        let err = StorePaths::from_json(r#"{"privateKeyFile": "/tmp/keys"}"#).unwrap_err();
        assert!(matches!(err, KeyTrustError::Config(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let paths = StorePaths::purple_default(Path::new("/nonexistent-otr-keytrust-home"));
        assert!(matches!(
            paths.load_private_keys().unwrap_err(),
            KeyTrustError::Io(_)
        ));
    }
}
