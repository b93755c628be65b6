//! End-to-end bundle/unbundle tests.
//!
//! These drive the real pipelines (tar, gzip, openssl) and therefore
//! skip themselves on hosts missing those programs. Small chunk sizes
//! keep the part counts interesting without large fixtures.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::OnceLock;

use imagebundle::{
    bundle_image, unbundle_image, BundleRequest, Error, Manifest, UnbundleRequest,
};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tempfile::TempDir;

const TEST_CHUNK_SIZE: usize = 4096;

fn have_pipeline_tools() -> bool {
    for program in ["tar", "gzip", "gunzip", "openssl", "cat"] {
        let found = Command::new(program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok();
        if !found {
            eprintln!("skipping: '{program}' not available on this host");
            return false;
        }
    }
    true
}

fn user_keypair() -> &'static (RsaPrivateKey, RsaPublicKey) {
    static KEYS: OnceLock<(RsaPrivateKey, RsaPublicKey)> = OnceLock::new();
    KEYS.get_or_init(|| {
        let private_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024).unwrap();
        let public_key = RsaPublicKey::from(&private_key);
        (private_key, public_key)
    })
}

fn ec2_keypair() -> &'static (RsaPrivateKey, RsaPublicKey) {
    static KEYS: OnceLock<(RsaPrivateKey, RsaPublicKey)> = OnceLock::new();
    KEYS.get_or_init(|| {
        let private_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024).unwrap();
        let public_key = RsaPublicKey::from(&private_key);
        (private_key, public_key)
    })
}

fn request(image: &Path, destination: &Path) -> BundleRequest {
    let (user_private, user_public) = user_keypair();
    let (_, ec2_public) = ec2_keypair();
    let mut request = BundleRequest::new(
        image,
        destination,
        "123456789012",
        "x86_64",
        user_public.clone(),
        ec2_public.clone(),
        user_private.clone(),
    );
    request.chunk_size = TEST_CHUNK_SIZE;
    request
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Bundles `data`, unbundles the result, and returns the restored bytes.
fn roundtrip(data: &[u8]) -> Vec<u8> {
    let temp = TempDir::new().unwrap();
    let image = temp.path().join("disk.img");
    let bundle_dir = temp.path().join("bundle");
    let restore_dir = temp.path().join("restored");
    fs::write(&image, data).unwrap();

    let bundle = bundle_image(&request(&image, &bundle_dir)).unwrap();

    let (user_private, _) = user_keypair();
    unbundle_image(&UnbundleRequest {
        manifest_path: bundle.manifest_path,
        source: bundle_dir,
        destination: restore_dir.clone(),
        private_key: user_private.clone(),
    })
    .unwrap();

    fs::read(restore_dir.join("disk.img")).unwrap()
}

// =============================================================================
// Round-Trip Tests
// =============================================================================

#[test]
fn test_roundtrip_boundary_sizes() {
    if !have_pipeline_tools() {
        return;
    }
    for size in [
        0,
        1,
        TEST_CHUNK_SIZE - 1,
        TEST_CHUNK_SIZE,
        TEST_CHUNK_SIZE + 1,
        3 * TEST_CHUNK_SIZE + 7,
    ] {
        let data = pattern(size);
        assert_eq!(roundtrip(&data), data, "round trip of {size} bytes");
    }
}

#[test]
fn test_bundle_leaves_only_parts_and_manifest() {
    if !have_pipeline_tools() {
        return;
    }
    let temp = TempDir::new().unwrap();
    let image = temp.path().join("disk.img");
    let bundle_dir = temp.path().join("bundle");
    fs::write(&image, pattern(3 * TEST_CHUNK_SIZE)).unwrap();

    let bundle = bundle_image(&request(&image, &bundle_dir)).unwrap();

    // The intermediate encrypted blob is gone; only parts + manifest remain.
    let mut entries: Vec<String> = fs::read_dir(&bundle_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    entries.sort();
    let mut expected: Vec<String> = bundle
        .part_paths
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    expected.push("disk.img.manifest.xml".to_string());
    expected.sort();
    assert_eq!(entries, expected);
}

#[test]
fn test_manifest_records_sizes_and_authenticates() {
    if !have_pipeline_tools() {
        return;
    }
    let temp = TempDir::new().unwrap();
    let image = temp.path().join("disk.img");
    let bundle_dir = temp.path().join("bundle");
    let data = pattern(2 * TEST_CHUNK_SIZE + 100);
    fs::write(&image, &data).unwrap();

    let bundle = bundle_image(&request(&image, &bundle_dir)).unwrap();
    let manifest = Manifest::parse(&fs::read_to_string(&bundle.manifest_path).unwrap()).unwrap();

    assert_eq!(manifest.size(), data.len() as u64);
    let parts_total: u64 = bundle
        .part_paths
        .iter()
        .map(|p| fs::metadata(p).unwrap().len())
        .sum();
    assert_eq!(manifest.bundled_size(), parts_total);
    assert_eq!(manifest.cipher_algorithm(), "AES-128-CBC");
    assert_eq!(manifest.digest_algorithm(), "SHA1");
    assert_eq!(manifest.parts().len(), bundle.part_paths.len());

    let (_, user_public) = user_keypair();
    assert!(manifest.authenticate(user_public).unwrap());
}

#[test]
fn test_prefix_renames_archived_image() {
    if !have_pipeline_tools() {
        return;
    }
    let temp = TempDir::new().unwrap();
    let image = temp.path().join("disk.img");
    let bundle_dir = temp.path().join("bundle");
    let restore_dir = temp.path().join("restored");
    let data = pattern(TEST_CHUNK_SIZE + 17);
    fs::write(&image, &data).unwrap();

    let mut req = request(&image, &bundle_dir);
    req.prefix = Some("renamed-image".to_string());
    let bundle = bundle_image(&req).unwrap();

    assert!(bundle
        .manifest_path
        .ends_with("renamed-image.manifest.xml"));
    assert_eq!(bundle.manifest.name(), "renamed-image");
    // The staging symlink was cleaned up.
    assert!(bundle_dir.join("renamed-image").symlink_metadata().is_err());

    let (user_private, _) = user_keypair();
    unbundle_image(&UnbundleRequest {
        manifest_path: bundle.manifest_path,
        source: bundle_dir,
        destination: restore_dir.clone(),
        private_key: user_private.clone(),
    })
    .unwrap();

    // The archive recorded the prefix name, so extraction restores it.
    assert_eq!(fs::read(restore_dir.join("renamed-image")).unwrap(), data);
}

// =============================================================================
// Failure Mode Tests
// =============================================================================

#[test]
fn test_corrupted_part_fails_before_extraction() {
    if !have_pipeline_tools() {
        return;
    }
    let temp = TempDir::new().unwrap();
    let image = temp.path().join("disk.img");
    let bundle_dir = temp.path().join("bundle");
    let restore_dir = temp.path().join("restored");
    fs::write(&image, pattern(2 * TEST_CHUNK_SIZE)).unwrap();

    let bundle = bundle_image(&request(&image, &bundle_dir)).unwrap();

    // Flip one byte in the middle of the second part.
    let victim = &bundle.part_paths[1];
    let mut bytes = fs::read(victim).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    fs::write(victim, &bytes).unwrap();

    let (user_private, _) = user_keypair();
    let err = unbundle_image(&UnbundleRequest {
        manifest_path: bundle.manifest_path,
        source: bundle_dir,
        destination: restore_dir.clone(),
        private_key: user_private.clone(),
    })
    .unwrap_err();

    assert!(matches!(err, Error::DigestMismatch { .. }));
    // Nothing from the tar stream reached the destination.
    assert!(
        !restore_dir.exists() || fs::read_dir(&restore_dir).unwrap().next().is_none(),
        "destination must be untouched"
    );
}

#[test]
fn test_unbundle_with_wrong_key_fails() {
    if !have_pipeline_tools() {
        return;
    }
    let temp = TempDir::new().unwrap();
    let image = temp.path().join("disk.img");
    let bundle_dir = temp.path().join("bundle");
    fs::write(&image, pattern(512)).unwrap();

    let bundle = bundle_image(&request(&image, &bundle_dir)).unwrap();

    let stranger = RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024).unwrap();
    let err = unbundle_image(&UnbundleRequest {
        manifest_path: bundle.manifest_path,
        source: bundle_dir,
        destination: temp.path().join("restored"),
        private_key: stranger,
    })
    .unwrap_err();
    assert!(matches!(err, Error::DecryptionFailed(_)));
}

#[test]
fn test_missing_image_fails_without_leftovers() {
    let temp = TempDir::new().unwrap();
    let bundle_dir = temp.path().join("bundle");
    let err = bundle_image(&request(&temp.path().join("no-such.img"), &bundle_dir)).unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}

// =============================================================================
// Dual-Recipient Tests
// =============================================================================

#[test]
fn test_either_private_key_recovers_the_image() {
    if !have_pipeline_tools() {
        return;
    }
    let temp = TempDir::new().unwrap();
    let image = temp.path().join("disk.img");
    let bundle_dir = temp.path().join("bundle");
    let data = pattern(TEST_CHUNK_SIZE * 2 + 5);
    fs::write(&image, &data).unwrap();

    let bundle = bundle_image(&request(&image, &bundle_dir)).unwrap();
    let manifest = &bundle.manifest;

    // The two ciphertext pairs differ, but decrypt to identical secrets.
    assert_ne!(manifest.user_encrypted_key(), manifest.ec2_encrypted_key());
    assert_ne!(manifest.user_encrypted_iv(), manifest.ec2_encrypted_iv());

    let (user_private, _) = user_keypair();
    let (ec2_private, _) = ec2_keypair();
    let user_key = user_private
        .decrypt(
            rsa::Pkcs1v15Encrypt,
            &hex::decode(manifest.user_encrypted_key()).unwrap(),
        )
        .unwrap();
    let ec2_key = ec2_private
        .decrypt(
            rsa::Pkcs1v15Encrypt,
            &hex::decode(manifest.ec2_encrypted_key()).unwrap(),
        )
        .unwrap();
    assert_eq!(user_key, ec2_key, "both recipients recover the same key");
    assert_eq!(user_key.len(), 32, "32-character hex key");
}

// =============================================================================
// Interoperability Tests
// =============================================================================

/// The parts, rejoined and decrypted with the in-process cipher instead
/// of the openssl pipeline, must yield a well-formed gzipped tar of the
/// image. This pins the on-disk format independently of the external
/// tool chain.
#[test]
fn test_bundle_decrypts_with_in_process_cipher() {
    if !have_pipeline_tools() {
        return;
    }
    let temp = TempDir::new().unwrap();
    let image = temp.path().join("disk.img");
    let bundle_dir = temp.path().join("bundle");
    let data = pattern(TEST_CHUNK_SIZE + 321);
    fs::write(&image, &data).unwrap();

    let bundle = bundle_image(&request(&image, &bundle_dir)).unwrap();
    let manifest = &bundle.manifest;

    let joined = temp.path().join("joined.enc");
    imagebundle::chunk::join(&bundle.part_paths, &joined).unwrap();

    let (user_private, _) = user_keypair();
    let key_hex = String::from_utf8(
        user_private
            .decrypt(
                rsa::Pkcs1v15Encrypt,
                &hex::decode(manifest.user_encrypted_key()).unwrap(),
            )
            .unwrap(),
    )
    .unwrap();
    let iv_hex = String::from_utf8(
        user_private
            .decrypt(
                rsa::Pkcs1v15Encrypt,
                &hex::decode(manifest.user_encrypted_iv()).unwrap(),
            )
            .unwrap(),
    )
    .unwrap();

    let decrypted = temp.path().join("joined.tar.gz");
    imagebundle::crypto::decrypt_file(
        &joined,
        &decrypted,
        &hex::decode(&key_hex).unwrap(),
        &hex::decode(&iv_hex).unwrap(),
    )
    .unwrap();

    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(
        fs::File::open(&decrypted).unwrap(),
    ));
    let mut entries = archive.entries().unwrap();
    let mut entry = entries.next().unwrap().unwrap();
    assert_eq!(entry.path().unwrap().file_name().unwrap(), "disk.img");
    let mut content = Vec::new();
    std::io::Read::read_to_end(&mut entry, &mut content).unwrap();
    assert_eq!(content, data);
}
