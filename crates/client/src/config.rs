// Connection profile
// Persisted as JSON by host applications (last-used server and sheet).

use std::fs;
use std::io;
use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};

use gridlink_protocol::DEFAULT_PORT;

/// Everything needed to open a session: server address, sheet name and
/// password, and whether to CREATE the sheet or JOIN an existing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectProfile {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub password: String,
    pub create_new: bool,
}

impl Default for ConnectProfile {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            name: String::new(),
            password: String::new(),
            create_new: false,
        }
    }
}

impl ConnectProfile {
    /// Load a profile, falling back to defaults when the file is missing or
    /// malformed.
    pub fn load(path: &Path) -> ConnectProfile {
        match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(profile) => profile,
                Err(e) => {
                    warn!("ignoring malformed profile {}: {}", path.display(), e);
                    ConnectProfile::default()
                }
            },
            Err(_) => ConnectProfile::default(),
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(path, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let profile = ConnectProfile::default();
        assert_eq!(profile.host, "localhost");
        assert_eq!(profile.port, 1984);
        assert!(!profile.create_new);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");

        let profile = ConnectProfile {
            host: "sheets.example.com".into(),
            port: 2001,
            name: "budget".into(),
            password: "hunter2".into(),
            create_new: true,
        };
        profile.save(&path).unwrap();
        assert_eq!(ConnectProfile::load(&path), profile);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let profile = ConnectProfile::load(&dir.path().join("nope.json"));
        assert_eq!(profile, ConnectProfile::default());
    }

    #[test]
    fn test_load_malformed_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        fs::write(&path, "{not json").unwrap();
        assert_eq!(ConnectProfile::load(&path), ConnectProfile::default());
    }

    #[test]
    fn test_partial_profile_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        fs::write(&path, r#"{"name": "ledger"}"#).unwrap();

        let profile = ConnectProfile::load(&path);
        assert_eq!(profile.name, "ledger");
        assert_eq!(profile.port, 1984);
    }
}
