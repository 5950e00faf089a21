#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file `{0}`: {1}")]
    FileOpen(std::path::PathBuf, #[source] std::io::Error),
    #[error("failed to parse configuration file `{0}`: {1}")]
    Deserialize(std::path::PathBuf, #[source] serde_path_to_error::Error<serde_json::Error>),
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("pipeline configuration rejected by registry: {0}")]
    InvalidPipeline(#[from] feathermail_pipeline::RegistryError),
    #[error("no usable config directory: set FEATHER_CONFIG_FOLDER or create /etc/feather")]
    NoConfigDirectory,
}
