use std::io;

/// Error type for coreswitch operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed configuration (JSON or values out of range)
    #[error("invalid config: {0}")]
    ConfigInvalid(String),
    /// A required configuration field is empty, zero or absent
    #[error("missing required field: {0}")]
    MissingField(String),
    /// Cipher or password material was rejected
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("core is already running")]
    AlreadyRunning,
    #[error("packet engine has already been started")]
    AlreadyStarted,
    #[error("core is not running")]
    NotRunning,
    #[error("core '{0}' not registered")]
    NotFound(String),
    #[error("operation cancelled")]
    Cancelled,
    /// Dialing, binding or transport I/O failed
    #[error("network failure: {0}")]
    NetworkFailure(String),
    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),
    /// The upstream answered, but not with something usable
    #[error("upstream failure: {0}")]
    UpstreamFailure(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Stable, machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConfigInvalid(_) => "ConfigInvalid",
            Error::MissingField(_) => "MissingField",
            Error::KeyDerivation(_) => "KeyDerivation",
            Error::AlreadyRunning => "AlreadyRunning",
            Error::AlreadyStarted => "AlreadyStarted",
            Error::NotRunning => "NotRunning",
            Error::NotFound(_) => "NotFound",
            Error::Cancelled => "Cancelled",
            Error::NetworkFailure(_) => "NetworkFailure",
            Error::UnsupportedNetwork(_) => "UnsupportedNetwork",
            Error::UpstreamFailure(_) => "UpstreamFailure",
            Error::Io(_) => "Io",
            Error::Serialization(_) => "Serialization",
        }
    }
}

/// Result type for coreswitch operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ConfigInvalid(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
