use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildSettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("File watcher error: {0}")]
    Notify(#[from] notify::Error),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Build system manager is no longer running")]
    ManagerStopped,

    #[error("Delegate error: {0}")]
    Delegate(String),
}

pub type Result<T> = std::result::Result<T, BuildSettingsError>;
