//! Client and node credentials.
//!
//! Credentials outlive any connection: a client carries one name/key pair,
//! a node carries the name → key map of every client it will accept.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{NetError, Result};

/// Identity a client presents during the handshake.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    /// Authentication name, learned by the node during the handshake.
    pub name: String,
    /// Symmetric HMAC key shared with the nodes.
    pub key: Vec<u8>,
}

impl ClientCredentials {
    pub fn new(name: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        ClientCredentials {
            name: name.into(),
            key: key.into(),
        }
    }
}

/// Server-side store mapping client names to their keys.
#[derive(Debug, Default)]
pub struct NodeCredentials {
    keys: HashMap<String, Vec<u8>>,
}

impl NodeCredentials {
    pub fn new() -> Self {
        NodeCredentials::default()
    }

    /// Registers one client.
    pub fn add(&mut self, name: impl Into<String>, key: impl Into<Vec<u8>>) {
        self.keys.insert(name.into(), key.into());
    }

    /// Key for a client name, if registered.
    pub fn key_for(&self, name: &str) -> Option<&[u8]> {
        self.keys.get(name).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Loads a credentials file: whitespace-separated `name key-hex` per
    /// line, `#` starts a comment, empty lines ignored.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut store = NodeCredentials::new();
        for (idx, raw_line) in text.lines().enumerate() {
            let line = match raw_line.find('#') {
                Some(pos) => &raw_line[..pos],
                None => raw_line,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (name, key_hex) = match (fields.next(), fields.next(), fields.next()) {
                (Some(name), Some(key), None) => (name, key),
                _ => {
                    return Err(NetError::BadConfigLine {
                        path: path.display().to_string(),
                        line: idx + 1,
                        reason: "expected `name key-hex`".into(),
                    })
                }
            };
            let key = hex::decode(key_hex).map_err(|e| NetError::BadConfigLine {
                path: path.display().to_string(),
                line: idx + 1,
                reason: format!("bad key hex: {e}"),
            })?;
            store.add(name, key);
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_credentials_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# test credentials").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "alice 00010203").unwrap();
        writeln!(file, "bob    deadbeef  # trailing comment").unwrap();
        file.flush().unwrap();

        let store = NodeCredentials::load(file.path()).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.key_for("alice"), Some(&[0u8, 1, 2, 3][..]));
        assert_eq!(store.key_for("bob"), Some(&[0xDE, 0xAD, 0xBE, 0xEF][..]));
        assert_eq!(store.key_for("carol"), None);
    }

    #[test]
    fn test_load_rejects_bad_hex() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "alice nothex!").unwrap();
        file.flush().unwrap();

        let err = NodeCredentials::load(file.path()).unwrap_err();
        assert!(matches!(err, NetError::BadConfigLine { line: 1, .. }));
    }

    #[test]
    fn test_load_rejects_missing_key() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "alice").unwrap();
        file.flush().unwrap();

        let err = NodeCredentials::load(file.path()).unwrap_err();
        assert!(matches!(err, NetError::BadConfigLine { line: 1, .. }));
    }
}
