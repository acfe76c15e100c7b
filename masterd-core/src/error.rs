use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors surfaced by `masterd-core`.
///
/// Only startup-time failures (config load, log file open) ever reach a
/// caller as a `Result`. Per-datagram decode/dispatch failures are logged
/// and the datagram is dropped by the caller instead of being propagated
/// here — see `Codec::decode`'s `Option`-returning sibling in `codec.rs`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config: {0}")]
    Config(String),
    #[error("codec: {0}")]
    Codec(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
