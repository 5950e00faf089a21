//! The bcrypt password keystore: a JSON map of
//! `username -> {hashed_password, created_at}`, read at stage init and
//! tolerant of a missing file.

use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct KeystoreEntry {
    pub hashed_password: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: time::OffsetDateTime,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Keystore(pub HashMap<String, KeystoreEntry>);

impl Keystore {
    /// Loads a keystore file. A missing file is treated as an empty
    /// keystore; any other I/O or parse error is surfaced.
    pub fn load(path: &Path) -> Result<Self, crate::ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let deser = &mut serde_json::Deserializer::from_str(&contents);
                serde_path_to_error::deserialize(deser)
                    .map_err(|error| crate::ConfigError::Deserialize(path.to_path_buf(), error))
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "keystore file absent, treating as empty");
                Ok(Self::default())
            }
            Err(error) => Err(crate::ConfigError::FileOpen(path.to_path_buf(), error)),
        }
    }

    #[must_use]
    pub fn get(&self, username: &str) -> Option<&KeystoreEntry> {
        self.0.get(username)
    }

    pub fn insert(&mut self, username: impl Into<String>, hashed_password: impl Into<String>) {
        self.0.insert(
            username.into(),
            KeystoreEntry {
                hashed_password: hashed_password.into(),
                created_at: time::OffsetDateTime::now_utc(),
            },
        );
    }

    /// Writes the keystore back to disk as pretty JSON, creating the file
    /// if it did not exist.
    pub fn save(&self, path: &Path) -> Result<(), crate::ConfigError> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|error| crate::ConfigError::FileOpen(path.to_path_buf(), error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_empty() {
        let keystore = Keystore::load(Path::new("/nonexistent/feather-keystore.json")).unwrap();
        assert!(keystore.0.is_empty());
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystore.json");
        let mut keystore = Keystore::default();
        keystore.insert("alice", "$2b$12$abcdefghijklmnopqrstuv");
        keystore.save(&path).unwrap();

        let reloaded = Keystore::load(&path).unwrap();
        assert_eq!(reloaded.get("alice").unwrap().hashed_password, "$2b$12$abcdefghijklmnopqrstuv");
    }
}
