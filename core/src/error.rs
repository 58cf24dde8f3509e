use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] crate::tls::Error),

    #[error(transparent)]
    Client(#[from] crate::client::Error),

    #[cfg(feature = "pcsc")]
    #[error("PC/SC error: {0}")]
    Pcsc(#[from] crate::pcsc::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
