//! # Bundle/Unbundle Orchestrator
//!
//! Wires the crypto engine, process pipeline, chunk splitter and manifest
//! model into the two top-level operations:
//!
//! ```text
//! bundle:    image ──tar──┬──gzip -9──aes-128-cbc──> blob ──split──> parts
//!                         └──SHA-1                                    │
//!                                         signed manifest <───────────┘
//!
//! unbundle:  parts ──cat──aes-128-cbc──gunzip──┬──untar──> image
//!                                              └──SHA-1 == manifest digest
//! ```
//!
//! The image streams through the whole chain in one pass; it is never read
//! from disk twice and never buffered in memory. The encrypted whole-bundle
//! blob exists on disk only between the encrypt and split steps and is
//! deleted on every exit path, alongside any staging symlink.
//!
//! The symmetric key and IV travel between generation and the cipher stage
//! as 32-character hex strings, and it is the hex string (not the raw
//! bytes) that is RSA-encrypted into the manifest, so bundles interoperate
//! with the openssl-based tool chain.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunk;
use crate::constants::{BUNDLE_SUFFIX, CHUNK_SIZE, DIGEST_ALG, MANIFEST_SUFFIX, SYM_ALG, SYM_KEY_LEN};
use crate::crypto;
use crate::error::{Error, Result};
use crate::format;
use crate::manifest::{ImageKind, Manifest, ManifestConfig};
use crate::pipeline::{Pipeline, PipelineInput, PipelineOutput};

// =============================================================================
// Tar command builder
// =============================================================================

/// Builds the argument vector for a tar stage.
///
/// The archive always goes to stdin/stdout (`-f -`) since tar stages sit
/// inside a pipeline. Consuming builder; finish with
/// [`TarCommand::into_stage`].
#[derive(Debug, Clone, Default)]
pub struct TarCommand {
    options: Vec<String>,
    files: Vec<String>,
}

impl TarCommand {
    /// Starts an empty tar command.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an archive.
    pub fn create(mut self) -> Self {
        self.options.push("-c".to_string());
        self
    }

    /// Extract an archive.
    pub fn extract(mut self) -> Self {
        self.options.push("-x".to_string());
        self
    }

    /// Preserve sparseness.
    pub fn sparse(mut self) -> Self {
        self.options.push("-S".to_string());
        self
    }

    /// Follow symlinks, archiving what they point at.
    pub fn dereference(mut self) -> Self {
        self.options.push("-h".to_string());
        self
    }

    /// Record the given numeric owner instead of the real one.
    pub fn owner(mut self, user: u32) -> Self {
        self.options.push("--owner".to_string());
        self.options.push(user.to_string());
        self
    }

    /// Record the given numeric group instead of the real one.
    pub fn group(mut self, group: u32) -> Self {
        self.options.push("--group".to_string());
        self.options.push(group.to_string());
        self
    }

    /// Change into `dir` before reading or writing any file.
    pub fn chdir(mut self, dir: &Path) -> Self {
        self.options.push("-C".to_string());
        self.options.push(dir.to_string_lossy().into_owned());
        self
    }

    /// Adds a file to archive, optionally relative to `dir`.
    pub fn add(mut self, filename: &str, dir: Option<&Path>) -> Self {
        if let Some(dir) = dir {
            self.files.push("-C".to_string());
            self.files.push(dir.to_string_lossy().into_owned());
        }
        self.files.push(filename.to_string());
        self
    }

    /// Finishes the build, yielding the program and argument vector.
    pub fn into_stage(self) -> (String, Vec<String>) {
        let mut args = self.options;
        args.push("-f".to_string());
        args.push("-".to_string());
        args.extend(self.files);
        ("tar".to_string(), args)
    }
}

// =============================================================================
// Staging cleanup
// =============================================================================

/// Deletes tracked staging files when dropped, whatever path got us there.
#[derive(Default)]
struct Staging {
    paths: Vec<PathBuf>,
}

impl Staging {
    fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        for path in &self.paths {
            // symlink_metadata also sees dangling symlinks.
            if path.symlink_metadata().is_ok() {
                if let Err(e) = fs::remove_file(path) {
                    warn!("Could not remove staging file {}: {e}", path.display());
                } else {
                    debug!("Removed staging file {}", path.display());
                }
            }
        }
    }
}

// =============================================================================
// Bundle
// =============================================================================

/// Everything the bundle operation needs.
///
/// `prefix` defaults to the image file name; when it differs, the image is
/// staged under the prefix name via a symlink so the archive records the
/// prefix. The two public keys receive independent encryptions of the same
/// fresh key and IV, so either matching private key can unbundle.
pub struct BundleRequest {
    pub image_file: PathBuf,
    pub destination: PathBuf,
    pub prefix: Option<String>,
    pub user: String,
    pub arch: String,
    pub image_kind: ImageKind,
    pub user_public_key: RsaPublicKey,
    pub ec2_public_key: RsaPublicKey,
    pub signing_key: RsaPrivateKey,
    pub kernel_id: Option<String>,
    pub ramdisk_id: Option<String>,
    pub kernel_name: Option<String>,
    pub product_codes: Vec<String>,
    pub ancestor_ami_ids: Vec<String>,
    pub block_device_mapping: BTreeMap<String, String>,
    pub chunk_size: usize,
}

impl BundleRequest {
    /// A request with the default chunk size and no optional metadata.
    pub fn new(
        image_file: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        user: impl Into<String>,
        arch: impl Into<String>,
        user_public_key: RsaPublicKey,
        ec2_public_key: RsaPublicKey,
        signing_key: RsaPrivateKey,
    ) -> Self {
        BundleRequest {
            image_file: image_file.into(),
            destination: destination.into(),
            prefix: None,
            user: user.into(),
            arch: arch.into(),
            image_kind: ImageKind::Machine,
            user_public_key,
            ec2_public_key,
            signing_key,
            kernel_id: None,
            ramdisk_id: None,
            kernel_name: None,
            product_codes: Vec::new(),
            ancestor_ami_ids: Vec::new(),
            block_device_mapping: BTreeMap::new(),
            chunk_size: CHUNK_SIZE,
        }
    }
}

/// Output of a successful bundle operation: the signed manifest plus the
/// part files, in index order. Only these remain on disk; intermediates
/// are gone.
#[derive(Debug)]
pub struct Bundle {
    pub manifest: Manifest,
    pub manifest_path: PathBuf,
    pub part_paths: Vec<PathBuf>,
}

/// Bundles a machine image into encrypted parts and a signed manifest.
///
/// The image is tarred (sparse, dereferenced, owner and group zeroed),
/// digested and gzipped in one streaming pass, encrypted with a fresh
/// AES-128-CBC key, split into `chunk_size` parts, and described by a
/// manifest signed with `signing_key`. The intermediate encrypted blob is
/// deleted after splitting.
pub fn bundle_image(request: &BundleRequest) -> Result<Bundle> {
    let image_file = &request.image_file;
    let size = fs::metadata(image_file)?.len();
    let basename = image_file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("image path {} has no file name", image_file.display()),
            ))
        })?
        .to_string();
    let name = request.prefix.clone().unwrap_or_else(|| basename.clone());

    fs::create_dir_all(&request.destination)?;
    let mut staging = Staging::default();

    // If the prefix differs from the file name, stage a symlink so the
    // archive records the prefix name.
    let tar_entry_dir: PathBuf;
    if name != basename {
        let target = fs::canonicalize(image_file)?;
        let link = request.destination.join(&name);
        std::os::unix::fs::symlink(&target, &link)?;
        staging.track(link);
        tar_entry_dir = request.destination.clone();
    } else {
        tar_entry_dir = image_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
    }

    let bundled_path = request.destination.join(format!("{name}{BUNDLE_SUFFIX}"));
    staging.track(bundled_path.clone());

    let key_hex = format::bin2hex(&crypto::generate_key());
    let iv_hex = format::bin2hex(&crypto::generate_iv());

    // Tar, digest, compress and encrypt in a single streaming pass.
    let (tar_program, tar_args) = TarCommand::new()
        .create()
        .dereference()
        .sparse()
        .owner(0)
        .group(0)
        .add(&name, Some(&tar_entry_dir))
        .into_stage();

    info!("Bundling {}...", image_file.display());
    let mut pipeline = Pipeline::new("image-bundle-pipeline");
    pipeline.add("tar", &tar_program, tar_args);
    let digest_handle = pipeline.add_digest_tee("digest");
    pipeline.add("gzip", "gzip", vec!["-9".to_string()]);
    pipeline.add(
        "encrypt",
        "openssl",
        vec![
            "enc".to_string(),
            "-e".to_string(),
            "-aes-128-cbc".to_string(),
            "-K".to_string(),
            key_hex.clone(),
            "-iv".to_string(),
            iv_hex.clone(),
        ],
    );
    pipeline.execute(
        PipelineInput::Null,
        PipelineOutput::File(bundled_path.clone()),
    )?;
    let digest_hex = digest_handle
        .hex_digest()
        .ok_or_else(|| Error::Io(io::Error::other("digest tee yielded no digest")))?;

    info!("Splitting {}...", bundled_path.display());
    let part_names = chunk::split(&bundled_path, &name, request.chunk_size, &request.destination)?;

    let mut bundled_size = 0u64;
    for part_name in &part_names {
        bundled_size += fs::metadata(request.destination.join(part_name))?.len();
    }

    let parts = chunk::digest_parts(&part_names, &request.destination)?;

    // Two independent encryptions of the same hex key and IV, one per
    // recipient.
    let user_encrypted_key =
        format::bin2hex(&crypto::rsa_encrypt(key_hex.as_bytes(), &request.user_public_key)?);
    let ec2_encrypted_key =
        format::bin2hex(&crypto::rsa_encrypt(key_hex.as_bytes(), &request.ec2_public_key)?);
    let user_encrypted_iv =
        format::bin2hex(&crypto::rsa_encrypt(iv_hex.as_bytes(), &request.user_public_key)?);
    let ec2_encrypted_iv =
        format::bin2hex(&crypto::rsa_encrypt(iv_hex.as_bytes(), &request.ec2_public_key)?);

    info!("Creating bundle manifest...");
    let manifest = Manifest::build(
        ManifestConfig {
            name: name.clone(),
            user: request.user.clone(),
            arch: request.arch.clone(),
            image_kind: request.image_kind,
            parts,
            size,
            bundled_size,
            user_encrypted_key,
            ec2_encrypted_key,
            user_encrypted_iv,
            ec2_encrypted_iv,
            cipher_algorithm: SYM_ALG.to_string(),
            digest: digest_hex,
            digest_algorithm: DIGEST_ALG.to_string(),
            kernel_id: request.kernel_id.clone(),
            ramdisk_id: request.ramdisk_id.clone(),
            kernel_name: request.kernel_name.clone(),
            product_codes: request.product_codes.clone(),
            ancestor_ami_ids: request.ancestor_ami_ids.clone(),
            block_device_mapping: request.block_device_mapping.clone(),
            bundler_name: Some(env!("CARGO_PKG_NAME").to_string()),
            bundler_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            bundler_release: None,
        },
        &request.signing_key,
    )?;

    let manifest_path = request.destination.join(format!("{name}{MANIFEST_SUFFIX}"));
    write_manifest_atomically(&manifest, &manifest_path, &mut staging)?;
    info!("Bundle manifest is {}", manifest_path.display());

    let part_paths = part_names
        .iter()
        .map(|part_name| request.destination.join(part_name))
        .collect();
    Ok(Bundle {
        manifest,
        manifest_path,
        part_paths,
    })
}

/// Writes the manifest under a unique temporary name, then renames it into
/// place, so a partially written manifest is never observable.
fn write_manifest_atomically(
    manifest: &Manifest,
    manifest_path: &Path,
    staging: &mut Staging,
) -> Result<()> {
    let dir = manifest_path.parent().unwrap_or(Path::new("."));
    let temp_path = dir.join(format!(".manifest.{}.tmp", Uuid::now_v7()));
    staging.track(temp_path.clone());
    fs::write(&temp_path, manifest.to_xml())?;
    fs::rename(&temp_path, manifest_path)?;
    Ok(())
}

// =============================================================================
// Unbundle
// =============================================================================

/// Everything the unbundle operation needs: the manifest, the directory
/// holding the parts it names, the extraction directory, and the private
/// key matching the manifest's user-encrypted fields.
pub struct UnbundleRequest {
    pub manifest_path: PathBuf,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub private_key: RsaPrivateKey,
}

/// Recovers the original image from a bundle's parts and manifest.
///
/// Every part is verified against its manifest digest before anything is
/// fed to extraction; the parts are then concatenated, decrypted with the
/// RSA-recovered key and IV, gunzipped, digested and untarred in one
/// streaming pass. A mismatch between the recomputed plaintext digest and
/// the manifest's record is fatal.
pub fn unbundle_image(request: &UnbundleRequest) -> Result<()> {
    let xml = fs::read_to_string(&request.manifest_path)?;
    let manifest = Manifest::parse(&xml)?;

    let key_hex = recover_hex_secret(manifest.user_encrypted_key(), &request.private_key)?;
    let iv_hex = recover_hex_secret(manifest.user_encrypted_iv(), &request.private_key)?;

    // Check each part against its recorded digest up front; a corrupted
    // part must be caught before any file reaches the destination.
    let mut part_paths: Vec<PathBuf> = Vec::with_capacity(manifest.parts().len());
    for part in manifest.parts() {
        let path = request.source.join(&part.filename);
        let mut file = File::open(&path).map_err(|e| Error::ChunkIo {
            path: path.clone(),
            reason: format!("could not open part: {e}"),
        })?;
        let computed = crypto::digest_stream(&mut file)?;
        if computed[..] != part.digest[..] {
            return Err(Error::DigestMismatch {
                expected: format::bin2hex(&part.digest),
                computed: format::bin2hex(&computed),
            });
        }
        part_paths.push(path);
    }
    debug!("All {} parts passed digest verification", part_paths.len());

    fs::create_dir_all(&request.destination)?;

    // Concatenate, decrypt, decompress, digest and untar in one pass.
    let (untar_program, untar_args) = TarCommand::new()
        .extract()
        .chdir(&request.destination)
        .into_stage();

    info!("Unbundling {}...", request.manifest_path.display());
    let mut pipeline = Pipeline::new("image-unbundle-pipeline");
    pipeline.add(
        "cat",
        "cat",
        part_paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect(),
    );
    pipeline.add(
        "decrypt",
        "openssl",
        vec![
            "enc".to_string(),
            "-d".to_string(),
            "-aes-128-cbc".to_string(),
            "-K".to_string(),
            key_hex,
            "-iv".to_string(),
            iv_hex,
        ],
    );
    pipeline.add("gunzip", "gunzip", Vec::new());
    let digest_handle = pipeline.add_digest_tee("digest");
    pipeline.add("untar", &untar_program, untar_args);
    pipeline.execute(PipelineInput::Null, PipelineOutput::Capture)?;

    let computed = digest_handle
        .hex_digest()
        .ok_or_else(|| Error::Io(io::Error::other("digest tee yielded no digest")))?;
    if computed != manifest.digest() {
        return Err(Error::DigestMismatch {
            expected: manifest.digest().to_string(),
            computed,
        });
    }

    info!("Unbundle complete.");
    Ok(())
}

/// RSA-decrypts a manifest key material field and validates that it is a
/// 32-character hex string.
fn recover_hex_secret(encrypted_hex: &str, private_key: &RsaPrivateKey) -> Result<String> {
    let plaintext = crypto::rsa_decrypt(&format::hex2bin(encrypted_hex)?, private_key)?;
    let text = String::from_utf8(plaintext)
        .map_err(|_| Error::DecryptionFailed("recovered key material is not text".to_string()))?;
    if text.len() != 2 * SYM_KEY_LEN || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::DecryptionFailed(format!(
            "recovered key material has length {}, expected a {}-character hex string",
            text.len(),
            2 * SYM_KEY_LEN
        )));
    }
    Ok(text)
}
