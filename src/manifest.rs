//! # Manifest Model
//!
//! The signed XML document describing a bundle: metadata, dual-recipient
//! encrypted key material, per-part digests, and an RSA signature.
//!
//! ## Schema generations
//!
//! Three generations exist, each a pure superset of the previous:
//!
//! | version      | adds                                                      |
//! |--------------|-----------------------------------------------------------|
//! | `3`          | name, user, parts, sizes, key material, digest, bundler    |
//! | `2007-08-29` | architecture                                               |
//! | `2007-10-10` | image type, kernel/ramdisk ids, product codes, ancestry, block-device mapping, kernel name |
//!
//! [`Manifest::parse`] inspects the declared version, selects the
//! matching parser and populates one canonical view, defaulting the
//! newer fields when reading an older generation (`i386`, machine
//! image). [`Manifest::build`] always writes the newest generation.
//!
//! ## Signing
//!
//! The signature covers the exact serialized bytes of the
//! `<machine_configuration>` and `<image>` subtrees, concatenated in
//! that order (generation 3 documents signed `<image>` alone). The
//! byte range is located by literal text search over the stored
//! document, never by re-serializing a subtree, so signer and verifier
//! always see identical bytes. Once signed, a manifest is never mutated
//! in place; [`Manifest::migrate`] derives a fresh signed document from
//! an existing one's field values.

use std::collections::BTreeMap;
use std::fmt;

use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::debug;

use crate::chunk::Part;
use crate::crypto;
use crate::error::{Error, Result};
use crate::format;
use crate::xml::{self, Element};

// =============================================================================
// Versions
// =============================================================================

/// A recognized manifest schema generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ManifestVersion {
    /// Version `3`.
    V3,
    /// Version `2007-08-29`.
    V20070829,
    /// Version `2007-10-10`, the generation written by this tool.
    V20071010,
}

impl ManifestVersion {
    /// The version as it appears in the `<version>` element.
    pub fn version_text(self) -> &'static str {
        match self {
            ManifestVersion::V3 => "3",
            ManifestVersion::V20070829 => "2007-08-29",
            ManifestVersion::V20071010 => "2007-10-10",
        }
    }

    /// The version in numeric form (dashes stripped).
    pub fn as_number(self) -> u32 {
        match self {
            ManifestVersion::V3 => 3,
            ManifestVersion::V20070829 => 2007_08_29,
            ManifestVersion::V20071010 => 2007_10_10,
        }
    }

    fn from_version_text(text: &str) -> Result<Self> {
        let numeric: u32 = text
            .replace('-', "")
            .parse()
            .map_err(|_| Error::InvalidManifest(format!("unrecognized version '{text}'")))?;
        match numeric {
            3 => Ok(ManifestVersion::V3),
            20070829 => Ok(ManifestVersion::V20070829),
            20071010 => Ok(ManifestVersion::V20071010),
            n if n > 20071010 => Err(Error::InvalidManifest(
                "manifest is too new for this tool to handle".to_string(),
            )),
            n if n < 3 => Err(Error::InvalidManifest(
                "manifest is too old for this tool to handle".to_string(),
            )),
            _ => Err(Error::InvalidManifest(format!(
                "unrecognized version '{text}'"
            ))),
        }
    }
}

// =============================================================================
// Image kind
// =============================================================================

/// What kind of image a bundle holds.
///
/// The legacy `volume` spelling is accepted on input and maps to
/// [`ImageKind::Machine`]; it is never written back out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImageKind {
    /// A bootable machine image (also covers volumes).
    #[default]
    Machine,
    /// A kernel image.
    Kernel,
    /// A ramdisk image.
    Ramdisk,
}

impl ImageKind {
    /// The kind as recorded in the manifest's `image/type` element.
    pub fn as_str(self) -> &'static str {
        match self {
            ImageKind::Machine => "machine",
            ImageKind::Kernel => "kernel",
            ImageKind::Ramdisk => "ramdisk",
        }
    }

    /// Parses a manifest or caller-supplied kind string.
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "machine" | "volume" => Some(ImageKind::Machine),
            "kernel" => Some(ImageKind::Kernel),
            "ramdisk" => Some(ImageKind::Ramdisk),
            _ => None,
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Canonical field set
// =============================================================================

#[derive(Debug, Clone)]
struct Fields {
    name: String,
    user: String,
    arch: String,
    image_kind: ImageKind,
    parts: Vec<Part>,
    size: u64,
    bundled_size: u64,
    user_encrypted_key: String,
    ec2_encrypted_key: String,
    user_encrypted_iv: String,
    ec2_encrypted_iv: String,
    cipher_algorithm: String,
    digest: String,
    digest_algorithm: String,
    kernel_id: Option<String>,
    ramdisk_id: Option<String>,
    kernel_name: Option<String>,
    product_codes: Vec<String>,
    ancestor_ami_ids: Vec<String>,
    block_device_mapping: BTreeMap<String, String>,
    bundler_name: Option<String>,
    bundler_version: Option<String>,
    bundler_release: Option<String>,
    signature: String,
}

/// Everything needed to build and sign a fresh manifest.
///
/// String fields are mandatory unless wrapped in `Option`;
/// `kernel_name` becomes mandatory when `image_kind` is
/// [`ImageKind::Kernel`]. The encrypted key/iv fields and the digest are
/// hex encoded.
#[derive(Debug, Clone, Default)]
pub struct ManifestConfig {
    pub name: String,
    pub user: String,
    pub arch: String,
    pub image_kind: ImageKind,
    pub parts: Vec<Part>,
    pub size: u64,
    pub bundled_size: u64,
    pub user_encrypted_key: String,
    pub ec2_encrypted_key: String,
    pub user_encrypted_iv: String,
    pub ec2_encrypted_iv: String,
    pub cipher_algorithm: String,
    pub digest: String,
    pub digest_algorithm: String,
    pub kernel_id: Option<String>,
    pub ramdisk_id: Option<String>,
    pub kernel_name: Option<String>,
    pub product_codes: Vec<String>,
    pub ancestor_ami_ids: Vec<String>,
    pub block_device_mapping: BTreeMap<String, String>,
    pub bundler_name: Option<String>,
    pub bundler_version: Option<String>,
    pub bundler_release: Option<String>,
}

// =============================================================================
// Manifest
// =============================================================================

/// A parsed or freshly built bundle manifest.
///
/// Read-only once constructed; accessors project the canonical view and
/// [`Manifest::to_xml`] returns the exact signed document bytes.
#[derive(Debug, Clone)]
pub struct Manifest {
    raw: String,
    version: ManifestVersion,
    fields: Fields,
}

impl Manifest {
    /// Parses manifest XML of any recognized generation.
    pub fn parse(xml_text: &str) -> Result<Self> {
        let root = Element::parse(xml_text)?;
        if root.name() != "manifest" {
            return Err(Error::InvalidManifest(format!(
                "root element is '{}', expected 'manifest'",
                root.name()
            )));
        }
        let version_text = mandatory_text(&root, "version")?;
        let version = ManifestVersion::from_version_text(&version_text)?;
        let fields = match version {
            ManifestVersion::V3 => parse_v3(&root)?,
            ManifestVersion::V20070829 => parse_v20070829(&root)?,
            ManifestVersion::V20071010 => parse_v20071010(&root)?,
        };
        debug!(
            "Parsed manifest '{}' (version {})",
            fields.name,
            version.version_text()
        );
        Ok(Manifest {
            raw: xml_text.to_string(),
            version,
            fields,
        })
    }

    /// Builds and signs a fresh manifest in one atomic step.
    ///
    /// Always emits the newest generation. The signature is computed
    /// over the serialized `<machine_configuration>` and `<image>`
    /// fragments of the unsigned document, then the `<signature>`
    /// element is appended; the signed fragments are untouched by the
    /// append, so verification sees the same bytes.
    pub fn build(config: ManifestConfig, signing_key: &RsaPrivateKey) -> Result<Self> {
        validate_config(&config)?;

        let document = build_document(&config);
        let unsigned = document.to_document_string();
        let signed_range = signed_range(&unsigned, ManifestVersion::V20071010)?;
        let signature_hex = format::bin2hex(&crypto::sign(&signed_range, signing_key)?);

        let mut document = document;
        document.push(Element::with_text("signature", signature_hex.clone()));
        let raw = document.to_document_string();

        debug!("Built and signed manifest '{}'", config.name);
        let fields = Fields {
            name: config.name,
            user: config.user,
            arch: config.arch,
            image_kind: config.image_kind,
            parts: config.parts,
            size: config.size,
            bundled_size: config.bundled_size,
            user_encrypted_key: config.user_encrypted_key,
            ec2_encrypted_key: config.ec2_encrypted_key,
            user_encrypted_iv: config.user_encrypted_iv,
            ec2_encrypted_iv: config.ec2_encrypted_iv,
            cipher_algorithm: config.cipher_algorithm,
            digest: config.digest,
            digest_algorithm: config.digest_algorithm,
            kernel_id: config.kernel_id,
            ramdisk_id: config.ramdisk_id,
            kernel_name: config.kernel_name,
            product_codes: config.product_codes,
            ancestor_ami_ids: config.ancestor_ami_ids,
            block_device_mapping: config.block_device_mapping,
            bundler_name: config.bundler_name,
            bundler_version: config.bundler_version,
            bundler_release: config.bundler_release,
            signature: signature_hex,
        };
        Ok(Manifest {
            raw,
            version: ManifestVersion::V20071010,
            fields,
        })
    }

    /// Verifies the manifest signature against a recipient public key.
    ///
    /// Returns `Ok(false)` on a mismatching signature; fails only when
    /// the document is structurally missing the signed elements or the
    /// signature itself.
    pub fn authenticate(&self, pubkey: &RsaPublicKey) -> Result<bool> {
        let signed = signed_range(&self.raw, self.version)?;
        let signature = format::hex2bin(&self.fields.signature)?;
        Ok(crypto::verify(&signed, &signature, pubkey))
    }

    /// Derives a new signed manifest from this one's field values, with
    /// the kernel and ramdisk identifiers replaced.
    ///
    /// Used when moving a bundle to an environment where the original
    /// identifiers are not valid. The output is always the newest
    /// generation, whatever generation the input was.
    pub fn migrate(
        &self,
        kernel_id: Option<String>,
        ramdisk_id: Option<String>,
        signing_key: &RsaPrivateKey,
    ) -> Result<Manifest> {
        let fields = &self.fields;
        Manifest::build(
            ManifestConfig {
                name: fields.name.clone(),
                user: fields.user.clone(),
                arch: fields.arch.clone(),
                image_kind: fields.image_kind,
                parts: fields.parts.clone(),
                size: fields.size,
                bundled_size: fields.bundled_size,
                user_encrypted_key: fields.user_encrypted_key.clone(),
                ec2_encrypted_key: fields.ec2_encrypted_key.clone(),
                user_encrypted_iv: fields.user_encrypted_iv.clone(),
                ec2_encrypted_iv: fields.ec2_encrypted_iv.clone(),
                cipher_algorithm: fields.cipher_algorithm.clone(),
                digest: fields.digest.clone(),
                digest_algorithm: fields.digest_algorithm.clone(),
                kernel_id,
                ramdisk_id,
                kernel_name: fields.kernel_name.clone(),
                product_codes: fields.product_codes.clone(),
                ancestor_ami_ids: fields.ancestor_ami_ids.clone(),
                block_device_mapping: fields.block_device_mapping.clone(),
                bundler_name: fields.bundler_name.clone(),
                bundler_version: fields.bundler_version.clone(),
                bundler_release: fields.bundler_release.clone(),
            },
            signing_key,
        )
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The schema generation this document declares.
    pub fn version(&self) -> ManifestVersion {
        self.version
    }

    /// The exact document bytes, signature included.
    pub fn to_xml(&self) -> &str {
        &self.raw
    }

    /// Image display name.
    pub fn name(&self) -> &str {
        &self.fields.name
    }

    /// Owner account identifier.
    pub fn user(&self) -> &str {
        &self.fields.user
    }

    /// Target architecture (`i386` for generation-3 documents).
    pub fn arch(&self) -> &str {
        &self.fields.arch
    }

    /// Image kind (machine for pre-2007-10-10 documents).
    pub fn image_kind(&self) -> ImageKind {
        self.fields.image_kind
    }

    /// Ordered part records.
    pub fn parts(&self) -> &[Part] {
        &self.fields.parts
    }

    /// Plaintext image size in bytes.
    pub fn size(&self) -> u64 {
        self.fields.size
    }

    /// Bundled (compressed and encrypted) size in bytes.
    pub fn bundled_size(&self) -> u64 {
        self.fields.bundled_size
    }

    /// Plaintext digest, hex encoded.
    pub fn digest(&self) -> &str {
        &self.fields.digest
    }

    /// Digest algorithm tag.
    pub fn digest_algorithm(&self) -> &str {
        &self.fields.digest_algorithm
    }

    /// Symmetric cipher algorithm tag.
    pub fn cipher_algorithm(&self) -> &str {
        &self.fields.cipher_algorithm
    }

    /// Symmetric key encrypted under the user's public key, hex encoded.
    pub fn user_encrypted_key(&self) -> &str {
        &self.fields.user_encrypted_key
    }

    /// Symmetric key encrypted under the platform public key, hex encoded.
    pub fn ec2_encrypted_key(&self) -> &str {
        &self.fields.ec2_encrypted_key
    }

    /// IV encrypted under the user's public key, hex encoded.
    pub fn user_encrypted_iv(&self) -> &str {
        &self.fields.user_encrypted_iv
    }

    /// IV encrypted under the platform public key, hex encoded.
    pub fn ec2_encrypted_iv(&self) -> &str {
        &self.fields.ec2_encrypted_iv
    }

    /// Default kernel identifier, if any.
    pub fn kernel_id(&self) -> Option<&str> {
        self.fields.kernel_id.as_deref()
    }

    /// Default ramdisk identifier, if any.
    pub fn ramdisk_id(&self) -> Option<&str> {
        self.fields.ramdisk_id.as_deref()
    }

    /// Name of the kernel inside a kernel image.
    pub fn kernel_name(&self) -> Option<&str> {
        self.fields.kernel_name.as_deref()
    }

    /// Ordered product codes.
    pub fn product_codes(&self) -> &[String] {
        &self.fields.product_codes
    }

    /// Ordered ancestor image identifiers.
    pub fn ancestor_ami_ids(&self) -> &[String] {
        &self.fields.ancestor_ami_ids
    }

    /// Virtual-name to device-name mapping.
    pub fn block_device_mapping(&self) -> &BTreeMap<String, String> {
        &self.fields.block_device_mapping
    }

    /// Bundler tool name, if recorded.
    pub fn bundler_name(&self) -> Option<&str> {
        self.fields.bundler_name.as_deref()
    }

    /// Bundler tool version, if recorded.
    pub fn bundler_version(&self) -> Option<&str> {
        self.fields.bundler_version.as_deref()
    }

    /// Bundler tool release, if recorded.
    pub fn bundler_release(&self) -> Option<&str> {
        self.fields.bundler_release.as_deref()
    }

    /// The RSA signature, hex encoded.
    pub fn signature(&self) -> &str {
        &self.fields.signature
    }
}

// =============================================================================
// Signed byte range
// =============================================================================

/// Returns the bytes the signature covers for the given generation.
fn signed_range(raw: &str, version: ManifestVersion) -> Result<Vec<u8>> {
    let image = xml::extract_fragment(raw, "image")
        .ok_or_else(|| Error::InvalidManifest("image element not present".to_string()))?;
    let machine_configuration = match version {
        ManifestVersion::V3 => "",
        _ => xml::extract_fragment(raw, "machine_configuration").unwrap_or(""),
    };
    let mut range = Vec::with_capacity(machine_configuration.len() + image.len());
    range.extend_from_slice(machine_configuration.as_bytes());
    range.extend_from_slice(image.as_bytes());
    Ok(range)
}

// =============================================================================
// Parsers (one per generation, newer generations reuse older parsers)
// =============================================================================

fn mandatory_text(root: &Element, path: &str) -> Result<String> {
    let element = root
        .find(path)
        .ok_or_else(|| Error::InvalidManifest(format!("{path} element not present")))?;
    element
        .text()
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidManifest(format!("{path} element empty")))
}

fn optional_text(root: &Element, path: &str) -> Option<String> {
    root.find(path).and_then(|e| e.text()).map(str::to_string)
}

fn mandatory_number(root: &Element, path: &str) -> Result<u64> {
    mandatory_text(root, path)?
        .parse()
        .map_err(|_| Error::InvalidManifest(format!("{path} is not a number")))
}

fn parse_parts(root: &Element) -> Result<Vec<Part>> {
    let elements = root.find_all("image/parts/part");
    let mut slots: Vec<Option<Part>> = vec![None; elements.len()];
    for part in elements {
        let index: usize = part
            .attribute("index")
            .ok_or_else(|| Error::InvalidManifest("part missing index attribute".to_string()))?
            .parse()
            .map_err(|_| Error::InvalidManifest("part index is not a number".to_string()))?;
        let filename = part
            .find("filename")
            .and_then(|e| e.text())
            .ok_or_else(|| Error::InvalidManifest(format!("part {index} missing filename")))?
            .to_string();
        let digest_hex = part
            .find("digest")
            .and_then(|e| e.text())
            .ok_or_else(|| Error::InvalidManifest(format!("part {index} missing digest")))?;
        let digest = format::hex2bin(digest_hex)
            .map_err(|_| Error::InvalidManifest(format!("part {index} digest is not hex")))?;
        if index >= slots.len() || slots[index].is_some() {
            return Err(Error::InvalidManifest(
                "part indices are not dense and zero-based".to_string(),
            ));
        }
        slots[index] = Some(Part { filename, digest });
    }
    slots
        .into_iter()
        .map(|slot| {
            slot.ok_or_else(|| {
                Error::InvalidManifest("part indices are not dense and zero-based".to_string())
            })
        })
        .collect()
}

/// Fields shared by every generation; newer-generation fields take their
/// documented defaults.
fn parse_v3(root: &Element) -> Result<Fields> {
    let digest_element = root
        .find("image/digest")
        .ok_or_else(|| Error::InvalidManifest("image/digest element not present".to_string()))?;
    let digest = digest_element
        .text()
        .ok_or_else(|| Error::InvalidManifest("image/digest element empty".to_string()))?
        .to_string();
    let digest_algorithm = digest_element.attribute("algorithm").unwrap_or_default();
    let cipher_algorithm = root
        .find("image/ec2_encrypted_key")
        .and_then(|e| e.attribute("algorithm"))
        .unwrap_or_default();

    Ok(Fields {
        name: mandatory_text(root, "image/name")?,
        user: mandatory_text(root, "image/user")?,
        arch: "i386".to_string(),
        image_kind: ImageKind::Machine,
        parts: parse_parts(root)?,
        size: mandatory_number(root, "image/size")?,
        bundled_size: mandatory_number(root, "image/bundled_size")?,
        user_encrypted_key: mandatory_text(root, "image/user_encrypted_key")?,
        ec2_encrypted_key: mandatory_text(root, "image/ec2_encrypted_key")?,
        user_encrypted_iv: mandatory_text(root, "image/user_encrypted_iv")?,
        ec2_encrypted_iv: mandatory_text(root, "image/ec2_encrypted_iv")?,
        cipher_algorithm: cipher_algorithm.to_string(),
        digest,
        digest_algorithm: digest_algorithm.to_string(),
        kernel_id: None,
        ramdisk_id: None,
        kernel_name: None,
        product_codes: Vec::new(),
        ancestor_ami_ids: Vec::new(),
        block_device_mapping: BTreeMap::new(),
        bundler_name: optional_text(root, "bundler/name"),
        bundler_version: optional_text(root, "bundler/version"),
        bundler_release: optional_text(root, "bundler/release"),
        signature: mandatory_text(root, "signature")?,
    })
}

fn parse_v20070829(root: &Element) -> Result<Fields> {
    let mut fields = parse_v3(root)?;
    fields.arch = mandatory_text(root, "machine_configuration/architecture")?;
    Ok(fields)
}

fn parse_v20071010(root: &Element) -> Result<Fields> {
    let mut fields = parse_v20070829(root)?;

    let kind_text = mandatory_text(root, "image/type")?;
    fields.image_kind = ImageKind::parse(&kind_text)
        .ok_or_else(|| Error::InvalidManifest(format!("unknown image type '{kind_text}'")))?;

    fields.kernel_id = optional_text(root, "machine_configuration/kernel_id");
    fields.ramdisk_id = optional_text(root, "machine_configuration/ramdisk_id");
    fields.kernel_name = optional_text(root, "image/kernel_name");
    fields.product_codes = root
        .find_all("machine_configuration/product_codes/product_code")
        .iter()
        .filter_map(|e| e.text())
        .map(str::to_string)
        .collect();
    fields.ancestor_ami_ids = root
        .find_all("image/ancestry/ancestor_ami_id")
        .iter()
        .filter_map(|e| e.text())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();

    for mapping in root.find_all("machine_configuration/block_device_mapping/mapping") {
        let virtual_name = mapping
            .find("virtual")
            .and_then(|e| e.text())
            .ok_or_else(|| {
                Error::InvalidManifest("block device mapping missing virtual name".to_string())
            })?;
        let device = mapping.find("device").and_then(|e| e.text()).ok_or_else(|| {
            Error::InvalidManifest("block device mapping missing device name".to_string())
        })?;
        fields
            .block_device_mapping
            .insert(virtual_name.to_string(), device.to_string());
    }

    Ok(fields)
}

// =============================================================================
// Writer
// =============================================================================

fn validate_config(config: &ManifestConfig) -> Result<()> {
    fn required(value: &str, field: &'static str) -> Result<()> {
        if value.is_empty() {
            return Err(Error::MissingField { field });
        }
        Ok(())
    }

    required(&config.name, "name")?;
    required(&config.user, "user")?;
    required(&config.arch, "arch")?;
    required(&config.digest, "digest")?;
    required(&config.digest_algorithm, "digest_algorithm")?;
    required(&config.cipher_algorithm, "cipher_algorithm")?;
    required(&config.user_encrypted_key, "user_encrypted_key")?;
    required(&config.ec2_encrypted_key, "ec2_encrypted_key")?;
    required(&config.user_encrypted_iv, "user_encrypted_iv")?;
    required(&config.ec2_encrypted_iv, "ec2_encrypted_iv")?;
    if config.image_kind == ImageKind::Kernel && config.kernel_name.is_none() {
        return Err(Error::MissingField {
            field: "kernel_name",
        });
    }
    Ok(())
}

/// Lays out the newest-generation document, unsigned.
fn build_document(config: &ManifestConfig) -> Element {
    let mut manifest = Element::new("manifest");
    manifest.push(Element::with_text(
        "version",
        ManifestVersion::V20071010.version_text(),
    ));

    if config.bundler_name.is_some()
        || config.bundler_version.is_some()
        || config.bundler_release.is_some()
    {
        let mut bundler = Element::new("bundler");
        if let Some(name) = &config.bundler_name {
            bundler.push(Element::with_text("name", name));
        }
        if let Some(version) = &config.bundler_version {
            bundler.push(Element::with_text("version", version));
        }
        if let Some(release) = &config.bundler_release {
            bundler.push(Element::with_text("release", release));
        }
        manifest.push(bundler);
    }

    let mut machine_configuration = Element::new("machine_configuration");
    machine_configuration.push(Element::with_text("architecture", &config.arch));
    if !config.block_device_mapping.is_empty() {
        let mut block_device_mapping = Element::new("block_device_mapping");
        for (virtual_name, device) in &config.block_device_mapping {
            let mut mapping = Element::new("mapping");
            mapping.push(Element::with_text("virtual", virtual_name));
            mapping.push(Element::with_text("device", device));
            block_device_mapping.push(mapping);
        }
        machine_configuration.push(block_device_mapping);
    }
    if let Some(kernel_id) = &config.kernel_id {
        machine_configuration.push(Element::with_text("kernel_id", kernel_id));
    }
    if let Some(ramdisk_id) = &config.ramdisk_id {
        machine_configuration.push(Element::with_text("ramdisk_id", ramdisk_id));
    }
    if !config.product_codes.is_empty() {
        let mut product_codes = Element::new("product_codes");
        for product_code in &config.product_codes {
            product_codes.push(Element::with_text("product_code", product_code));
        }
        machine_configuration.push(product_codes);
    }
    manifest.push(machine_configuration);

    let mut image = Element::new("image");
    image.push(Element::with_text("name", &config.name));
    image.push(Element::with_text("user", &config.user));
    image.push(Element::with_text("type", config.image_kind.as_str()));
    if let Some(kernel_name) = &config.kernel_name {
        image.push(Element::with_text("kernel_name", kernel_name));
    }
    if !config.ancestor_ami_ids.is_empty() {
        let mut ancestry = Element::new("ancestry");
        for ancestor in &config.ancestor_ami_ids {
            ancestry.push(Element::with_text("ancestor_ami_id", ancestor));
        }
        image.push(ancestry);
    }
    let mut digest = Element::with_text("digest", &config.digest);
    digest.set_attribute("algorithm", &config.digest_algorithm);
    image.push(digest);
    image.push(Element::with_text("size", config.size.to_string()));
    image.push(Element::with_text(
        "bundled_size",
        config.bundled_size.to_string(),
    ));
    let mut ec2_encrypted_key = Element::with_text("ec2_encrypted_key", &config.ec2_encrypted_key);
    ec2_encrypted_key.set_attribute("algorithm", &config.cipher_algorithm);
    image.push(ec2_encrypted_key);
    let mut user_encrypted_key =
        Element::with_text("user_encrypted_key", &config.user_encrypted_key);
    user_encrypted_key.set_attribute("algorithm", &config.cipher_algorithm);
    image.push(user_encrypted_key);
    image.push(Element::with_text(
        "ec2_encrypted_iv",
        &config.ec2_encrypted_iv,
    ));
    image.push(Element::with_text(
        "user_encrypted_iv",
        &config.user_encrypted_iv,
    ));

    let mut parts = Element::new("parts");
    parts.set_attribute("count", config.parts.len().to_string());
    for (index, part) in config.parts.iter().enumerate() {
        let mut part_element = Element::new("part");
        part_element.set_attribute("index", index.to_string());
        part_element.push(Element::with_text("filename", &part.filename));
        let mut digest = Element::with_text("digest", format::bin2hex(&part.digest));
        digest.set_attribute("algorithm", &config.digest_algorithm);
        part_element.push(digest);
        parts.push(part_element);
    }
    image.push(parts);
    manifest.push(image);

    manifest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_text_mapping() {
        assert_eq!(
            ManifestVersion::from_version_text("3").unwrap(),
            ManifestVersion::V3
        );
        assert_eq!(
            ManifestVersion::from_version_text("2007-08-29").unwrap(),
            ManifestVersion::V20070829
        );
        assert_eq!(
            ManifestVersion::from_version_text("2007-10-10").unwrap(),
            ManifestVersion::V20071010
        );
    }

    #[test]
    fn test_version_rejects_out_of_range() {
        let too_new = ManifestVersion::from_version_text("2008-01-01").unwrap_err();
        assert!(too_new.to_string().contains("too new"));
        let too_old = ManifestVersion::from_version_text("2").unwrap_err();
        assert!(too_old.to_string().contains("too old"));
        assert!(ManifestVersion::from_version_text("2007-09-01").is_err());
        assert!(ManifestVersion::from_version_text("not-a-version").is_err());
    }

    #[test]
    fn test_image_kind_alias() {
        assert_eq!(ImageKind::parse("machine"), Some(ImageKind::Machine));
        assert_eq!(ImageKind::parse("volume"), Some(ImageKind::Machine));
        assert_eq!(ImageKind::parse("kernel"), Some(ImageKind::Kernel));
        assert_eq!(ImageKind::parse("ramdisk"), Some(ImageKind::Ramdisk));
        assert_eq!(ImageKind::parse("floppy"), None);
        assert_eq!(ImageKind::Machine.as_str(), "machine");
    }

    #[test]
    fn test_parse_rejects_wrong_root() {
        let err = Manifest::parse("<?xml version=\"1.0\"?><not_manifest/>").unwrap_err();
        assert!(matches!(err, Error::InvalidManifest(_)));
    }

    #[test]
    fn test_parse_rejects_missing_version() {
        let err = Manifest::parse("<?xml version=\"1.0\"?><manifest><image/></manifest>")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidManifest(_)));
    }
}
