//! # Bundling Constants
//!
//! Algorithm names, wire-format tags and size defaults for the bundling
//! core. These constants are the single source of truth for the on-disk
//! and in-manifest formats; changing any of them breaks compatibility
//! with previously produced bundles.

// =============================================================================
// Sizes
// =============================================================================

/// Default size of one bundle part (10 MiB).
///
/// The encrypted bundle blob is split into parts of exactly this many
/// bytes, except for the final part which holds the remainder.
pub const CHUNK_SIZE: usize = 10 * 1024 * 1024;

/// Buffer size for all streaming reads and writes (1 MiB).
pub const BUFFER_SIZE: usize = 1024 * 1024;

/// Conventional ceiling on the plaintext image size (10 GiB).
///
/// Not enforced by this crate; callers that publish bundles are expected
/// to reject larger images before bundling.
pub const MAX_IMAGE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

// =============================================================================
// Cryptography
// =============================================================================

/// Symmetric cipher name as recorded in the manifest.
pub const SYM_ALG: &str = "AES-128-CBC";

/// Digest algorithm name as recorded in the manifest.
pub const DIGEST_ALG: &str = "SHA1";

/// Symmetric key length in bytes.
pub const SYM_KEY_LEN: usize = 16;

/// Initialization vector length in bytes.
pub const SYM_IV_LEN: usize = 16;

/// Length of a binary SHA-1 digest in bytes.
pub const DIGEST_LEN: usize = 20;

/// Envelope format version with a 1-byte RSA block length (legacy, read-only).
pub const ENVELOPE_VERSION_1: u8 = 1;

/// Envelope format version with a 2-byte big-endian RSA block length.
/// The only version this tool writes.
pub const ENVELOPE_VERSION_2: u8 = 2;

// =============================================================================
// File naming
// =============================================================================

/// Infix between the bundle prefix and the part index.
pub const PART_SUFFIX: &str = ".part.";

/// Suffix of the manifest file written next to the parts.
pub const MANIFEST_SUFFIX: &str = ".manifest.xml";

/// Suffix of the intermediate encrypted blob, deleted after splitting.
pub const BUNDLE_SUFFIX: &str = ".tar.gz.enc";
