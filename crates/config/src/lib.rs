//! Config Loader (C3): resolves the config directory, loads the boot-time
//! server config, and owns the hot-reloadable pipeline spec.

pub mod alias;
pub mod dirs;
mod error;
pub mod keystore;
pub mod pipeline;
pub mod server;

pub use dirs::resolve_config_dir;
pub use error::ConfigError;
pub use keystore::{Keystore, KeystoreEntry};
pub use pipeline::PipelineLoader;
pub use server::{ServerConfig, SessionOptions};

/// Loads `server.json` from `dir`.
pub fn load_server_config(dir: &std::path::Path) -> Result<ServerConfig, ConfigError> {
    let path = dir.join("server.json");
    let contents =
        std::fs::read_to_string(&path).map_err(|error| ConfigError::FileOpen(path.clone(), error))?;
    let deser = &mut serde_json::Deserializer::from_str(&contents);
    serde_path_to_error::deserialize(deser).map_err(|error| ConfigError::Deserialize(path, error))
}
