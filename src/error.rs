//! Error handling for marche.
use thiserror::Error;

/// Errors raised by the job engine and its backends.
#[derive(Debug, Error)]
pub enum JobError {
    /// A start/stop/restart request collided with a live operation.
    #[error("Service '{service}' is busy with another operation")]
    Busy {
        /// The service that already has an operation in flight.
        service: String,
    },

    /// A malformed request, e.g. a config payload for the wrong file.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No active backend manages a service by this name.
    #[error("Unknown service '{0}'")]
    UnknownService(String),

    /// The external command could not be launched.
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        /// The command line that failed to launch.
        command: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error reading or writing a log or config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoison(String),

    /// Error loading the daemon configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl<T> From<std::sync::PoisonError<T>> for JobError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        JobError::MutexPoison(err.to_string())
    }
}

/// Errors raised while loading or interpreting the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A `${VAR}` reference names a variable that is not set.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    /// A key holds a value that cannot be interpreted.
    #[error("Invalid value '{value}' for '{key}'")]
    InvalidValue {
        /// The offending key.
        key: String,
        /// The raw value found in the file.
        value: String,
    },
}
