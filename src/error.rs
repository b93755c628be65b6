//! Error types for the bundling core.

use std::path::PathBuf;

/// Result type alias for bundling operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while bundling or unbundling an image.
///
/// Every variant is fatal to the operation in progress; there is no
/// partial-success mode. Cleanup of staging files happens before any of
/// these propagate to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Pipeline Errors
    // =========================================================================
    /// The pipeline could not be started at all.
    #[error("pipeline '{pipeline}' could not be invoked: {source}")]
    PipelineInvocation {
        pipeline: String,
        #[source]
        source: std::io::Error,
    },

    /// A stage exited with a code other than the one it was expected to.
    #[error("pipeline '{pipeline}' failed at stage '{stage}' (exit code {code}, expected {expected})")]
    PipelineStageFailed {
        pipeline: String,
        stage: String,
        code: i32,
        expected: i32,
    },

    // =========================================================================
    // Chunk Errors
    // =========================================================================
    /// A part file could not be created, written or read.
    #[error("part file error on {path}: {reason}")]
    ChunkIo { path: PathBuf, reason: String },

    // =========================================================================
    // Manifest Errors
    // =========================================================================
    /// Unrecognized or malformed manifest schema, or a structurally
    /// mandatory element missing.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// A mandatory field was not supplied when building a manifest.
    #[error("missing mandatory manifest field '{field}'")]
    MissingField { field: &'static str },

    // =========================================================================
    // Crypto Errors
    // =========================================================================
    /// Wrong-sized key material or otherwise unusable cryptographic input.
    #[error("invalid crypto argument: {0}")]
    CryptoArgument(String),

    /// Envelope version byte is not a version this tool understands.
    #[error("unsupported envelope version: {0}")]
    UnsupportedEnvelopeVersion(u8),

    /// Asymmetric or symmetric decryption failed (wrong key, bad padding).
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// Key material could not be loaded from a PEM file.
    #[error("could not load key material from {path}: {reason}")]
    KeyMaterial { path: PathBuf, reason: String },

    /// A hex string did not decode.
    #[error("malformed hex string: {0}")]
    MalformedHex(String),

    // =========================================================================
    // Integrity Errors
    // =========================================================================
    /// The recomputed content digest does not match the manifest's record.
    #[error("digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
