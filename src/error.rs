use std::io;

use thiserror::Error;

/// Errors surfaced by construction and configuration paths.
///
/// Runtime conditions inside a running loop (a peer resetting, a frame
/// failing its checksum) are never returned through this type; they are
/// logged or handed to the relevant callback instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("unknown poller backend: {0}")]
    UnknownPoller(String),
    #[error("event loop thread {0} exited before publishing its loop")]
    LoopThreadExited(String),
}

pub type Result<T> = std::result::Result<T, Error>;
