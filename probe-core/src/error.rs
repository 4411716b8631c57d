pub type Result<T> = std::result::Result<T, Error>;

/// Configuration faults. All of them are raised before any network call is attempted.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Occurs when `probe.toml` fails to load.
    #[error("failed to load probe.toml: {0}")]
    LoadError(String),
    /// Occurs when the specified key is not found in `probe.toml` or the environment.
    #[error("the specified key \"{0}\" not found in probe.toml or PROBE_* environment variables")]
    ValueNotFound(String),
    /// Occurs when a value exists but can not be converted into the requested type.
    #[error("invalid value for \"{key}\": {reason}")]
    ValueError { key: String, reason: String },
}
