//! # imagebundle
//!
//! **Confidentiality- and integrity-protected machine image bundling**
//!
//! This crate converts a raw machine image into an encrypted, compressed,
//! chunked "bundle" suitable for storage on an object service, and
//! reverses that transform to recover the exact original bytes. It covers
//! the cryptographic envelope, the versioned signed manifest, the chunk
//! splitter/joiner, and the multi-stage streaming pipeline; the
//! object-store transfer client and physical image construction are
//! external collaborators that exchange file paths with this crate.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          imagebundle                             │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────────────────────────────────────────┐    │
//! │  │                  Bundle / Unbundle                       │    │
//! │  │  image → tar ─┬─ gzip -9 → aes-128-cbc → split → parts  │    │
//! │  │               └─ SHA-1         signed manifest ← digests │    │
//! │  └──────────────────────────┬───────────────────────────────┘    │
//! │                             │                                    │
//! │  ┌──────────────────────────┼───────────────────────────────┐    │
//! │  │              Process Pipeline Engine                     │    │
//! │  │  OS pipes │ per-stage exit status │ in-process digest tee│    │
//! │  └──────────────────────────┼───────────────────────────────┘    │
//! │                             │                                    │
//! │  ┌───────────┐  ┌───────────┴──┐  ┌──────────────────────┐       │
//! │  │  Crypto   │  │   Manifest   │  │  Chunk Split/Join    │       │
//! │  │ AES │ RSA │  │  3 schema    │  │  10 MiB parts        │       │
//! │  │ SHA-1     │  │  generations │  │  per-part digests    │       │
//! │  └───────────┘  └──────────────┘  └──────────────────────┘       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Properties
//!
//! - **Single-pass streaming**: a multi-gigabyte image is tarred,
//!   digested, compressed and encrypted without being read from disk
//!   twice or buffered in memory. The plaintext digest comes from an
//!   in-process fan-out writer that feeds both the hasher and the next
//!   stage ([`pipeline::Pipeline::add_digest_tee`]).
//! - **Exact failure detection**: the pipeline engine reads back every
//!   stage's real exit status, so a failure in an interior stage is
//!   detected and named even when the terminal stage exits cleanly.
//! - **Dual-recipient encryption**: the symmetric key and IV are
//!   RSA-encrypted twice, once per recipient public key, so either
//!   private key independently recovers the same material.
//! - **Verify before trust**: unbundle checks every part against its
//!   manifest digest before extraction starts, and the recomputed
//!   plaintext digest against the manifest's record before the extracted
//!   image is considered valid.
//! - **Unconditional cleanup**: staging symlinks and the intermediate
//!   encrypted blob are deleted on every exit path, success or failure.
//!
//! # Example
//!
//! ```rust,ignore
//! use imagebundle::{bundle_image, unbundle_image, BundleRequest, UnbundleRequest};
//!
//! fn main() -> imagebundle::Result<()> {
//!     let user_key = imagebundle::crypto::load_private_key("user.pem".as_ref())?;
//!     let user_cert = imagebundle::crypto::load_public_key("user-cert.pem".as_ref())?;
//!     let ec2_cert = imagebundle::crypto::load_public_key("ec2-cert.pem".as_ref())?;
//!
//!     let bundle = bundle_image(&BundleRequest::new(
//!         "disk.img", "bundle/", "123456789012", "x86_64",
//!         user_cert, ec2_cert, user_key.clone(),
//!     ))?;
//!     println!("manifest: {}", bundle.manifest_path.display());
//!
//!     unbundle_image(&UnbundleRequest {
//!         manifest_path: bundle.manifest_path,
//!         source: "bundle/".into(),
//!         destination: "restored/".into(),
//!         private_key: user_key,
//!     })?;
//!     Ok(())
//! }
//! ```

pub mod bundle;
pub mod chunk;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod format;
pub mod manifest;
pub mod pipeline;
pub mod xml;

// Re-exports
pub use bundle::{bundle_image, unbundle_image, Bundle, BundleRequest, TarCommand, UnbundleRequest};
pub use chunk::Part;
pub use constants::*;
pub use error::{Error, Result};
pub use manifest::{ImageKind, Manifest, ManifestConfig, ManifestVersion};
pub use pipeline::{DigestHandle, Pipeline, PipelineInput, PipelineOutput, StageResult};
