use std::io;
use std::time::Duration;

use thiserror::Error;

/// Protocol-level failures while parsing requests or encoding/decoding
/// responses. The connection layer turns these into Gemini status codes.
#[derive(Debug, Error)]
pub enum GeminiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Request too large")]
    RequestTooLarge,

    #[error("Invalid UTF-8")]
    InvalidUtf8,

    #[error("status code {0} outside 10..=69")]
    InvalidStatus(u8),

    #[error("invalid meta: {0}")]
    InvalidMeta(String),

    #[error("body present on non-success status {0}")]
    UnexpectedBody(u8),

    #[error("malformed response header: {0}")]
    MalformedResponse(String),

    #[error("response header exceeds 1029 bytes")]
    OversizeHeader,
}

#[derive(Debug, Error)]
pub enum TofuError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt trust store: {0}")]
    Corrupt(String),

    #[error("bad import document: {0}")]
    BadImport(String),
}

/// Failures surfaced by the client session.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("could not connect: {0}")]
    Connect(String),

    #[error("tls handshake failed: {0}")]
    Handshake(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error(
        "certificate for {host}:{port} changed\n  old: {old_fingerprint}\n  new: {new_fingerprint}"
    )]
    CertificateChanged {
        host: String,
        port: u16,
        old_fingerprint: String,
        new_fingerprint: String,
    },

    #[error("unknown host {host}:{port} and trust-on-first-use is disabled ({fingerprint})")]
    UntrustedHost {
        host: String,
        port: u16,
        fingerprint: String,
    },

    #[error("too many redirects (limit {0})")]
    TooManyRedirects(u32),

    #[error("redirect loop via {0}")]
    RedirectLoop(String),

    #[error("refusing redirect to non-gemini url {0}")]
    NonGeminiRedirect(String),

    #[error("response larger than {0} bytes")]
    ResponseTooLarge(u64),

    #[error(transparent)]
    Protocol(#[from] GeminiError),

    #[error(transparent)]
    Store(#[from] TofuError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
