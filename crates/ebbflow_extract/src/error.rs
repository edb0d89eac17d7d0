//! Error taxonomy for extraction.
//!
//! - [`PageError`]: one request went wrong; the chunk yields no rows and the
//!   partition moves on.
//! - [`TransportError`]: the partition cannot continue; the coordinator marks
//!   it failed and its siblings carry on.
//! - [`ExtractError`]: the run itself cannot continue.

use ebbflow_sinks::{SinkReadError, SinkWriteError};
use thiserror::Error;

/// Chunk-contained request failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PageError {
    #[error("HTTP {status} from {url}: {body}")]
    Status { status: u16, url: String, body: String },

    #[error("Malformed page from {url}: {reason}")]
    Malformed { url: String, reason: String },

    #[error("Page from {url} has no data at '{pointer}'")]
    MissingData { url: String, pointer: String },

    #[error("Pagination exceeded {limit} pages")]
    PageLimit { limit: usize },
}

/// Partition-fatal failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Authentication rejected (HTTP {status}) by {url}")]
    Unauthorized { status: u16, url: String },

    #[error("Request to {url} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        url: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Outcome of a single upstream request that did not produce a page.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error(transparent)]
    Page(#[from] PageError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Run-fatal failure.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Reading watermarks failed: {0}")]
    SinkRead(#[from] SinkReadError),

    #[error("Merging records failed: {0}")]
    SinkWrite(#[from] SinkWriteError),

    #[error("Invalid source configuration: {0}")]
    Config(String),
}
