// gatecrash/src/error.rs
//
// Error kinds for the pipeline. Config and store errors are fatal for the
// run; parse and decode problems are recovered close to where they occur
// (byte-comparison fallback) and never reach this type; network errors are
// per-request and count as validator failures.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config: {0}")]
    Config(String),

    #[error("store: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("capture log: {0}")]
    Capture(String),

    #[error("replay request: {0}")]
    Network(#[from] reqwest::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
