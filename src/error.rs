use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid address: {0}")]
    Address(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("System error: {0}")]
    System(#[from] nix::Error),

    #[error("Poller closed")]
    PollerClosed,

    #[error("Server shutting down")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for the orderly-shutdown sentinel that unwinds an event loop
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::Shutdown)
    }
}
