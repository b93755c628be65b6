//! # Crypto Engine
//!
//! Cryptographic primitives for the bundling core:
//!
//! - CSPRNG key and IV generation, fresh per bundle
//! - AES-128-CBC symmetric encryption (in-memory and streaming file-to-file)
//! - SHA-1 streaming digests
//! - RSA PKCS#1 v1.5 encryption, decryption, signing and verification
//! - HMAC-SHA1 keyed digests
//! - The length-prefixed asymmetric envelope format
//!
//! ## Envelope format
//!
//! [`encrypt_asym`] protects an arbitrary payload for a single recipient:
//! the payload is encrypted with an ephemeral key/IV pair, and the pair is
//! RSA-encrypted under the recipient's public key and prepended:
//!
//! ```text
//! [version:1][rsa block length][rsa(key ‖ iv)][aes-128-cbc(payload)]
//! ```
//!
//! Version 2 (the only version written) uses a 2-byte big-endian length
//! field; version 1 blobs with a 1-byte length field decode for backwards
//! compatibility.
//!
//! ## Key material
//!
//! Private keys load from PKCS#1 or PKCS#8 PEM. Recipient public keys
//! load from an X.509 certificate or a bare public-key PEM; the PEM label
//! selects the parser.

use std::fs;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{Block, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use x509_cert::der::{DecodePem, Encode};
use x509_cert::Certificate;

use crate::constants::{
    BUFFER_SIZE, DIGEST_LEN, ENVELOPE_VERSION_1, ENVELOPE_VERSION_2, SYM_IV_LEN, SYM_KEY_LEN,
};
use crate::error::{Error, Result};
use crate::format;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

const AES_BLOCK: usize = 16;

// =============================================================================
// Key material generation
// =============================================================================

/// Generates a fresh 128-bit symmetric key from the OS CSPRNG.
pub fn generate_key() -> [u8; SYM_KEY_LEN] {
    let mut key = [0u8; SYM_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Generates a fresh 128-bit initialization vector from the OS CSPRNG.
pub fn generate_iv() -> [u8; SYM_IV_LEN] {
    let mut iv = [0u8; SYM_IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

fn check_key_iv(key: &[u8], iv: &[u8]) -> Result<()> {
    if key.len() != SYM_KEY_LEN {
        return Err(Error::CryptoArgument(format!(
            "key must be {SYM_KEY_LEN} bytes, got {}",
            key.len()
        )));
    }
    if iv.len() != SYM_IV_LEN {
        return Err(Error::CryptoArgument(format!(
            "iv must be {SYM_IV_LEN} bytes, got {}",
            iv.len()
        )));
    }
    Ok(())
}

// =============================================================================
// Symmetric cipher
// =============================================================================

/// Encrypts `plaintext` with AES-128-CBC and PKCS#7 padding.
pub fn encrypt_sym(plaintext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    check_key_iv(key, iv)?;
    let cipher = Aes128CbcEnc::new_from_slices(key, iv)
        .map_err(|e| Error::CryptoArgument(e.to_string()))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Decrypts AES-128-CBC ciphertext produced by [`encrypt_sym`].
pub fn decrypt_sym(ciphertext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    check_key_iv(key, iv)?;
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK != 0 {
        return Err(Error::DecryptionFailed(format!(
            "ciphertext length {} is not a positive multiple of the block size",
            ciphertext.len()
        )));
    }
    let cipher = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|e| Error::CryptoArgument(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::DecryptionFailed("bad padding in symmetric ciphertext".to_string()))
}

/// Encrypts the file at `src` to `dst` with AES-128-CBC, streaming in
/// 1 MiB reads. An existing `dst` is overwritten.
pub fn encrypt_file(src: &Path, dst: &Path, key: &[u8], iv: &[u8]) -> Result<()> {
    check_key_iv(key, iv)?;
    let mut cipher = Aes128CbcEnc::new_from_slices(key, iv)
        .map_err(|e| Error::CryptoArgument(e.to_string()))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, fs::File::open(src)?);
    let mut writer = BufWriter::new(fs::File::create(dst)?);

    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut pending: Vec<u8> = Vec::with_capacity(BUFFER_SIZE + AES_BLOCK);
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&buf[..n]);
        let whole = pending.len() - pending.len() % AES_BLOCK;
        for block in pending[..whole].chunks_exact_mut(AES_BLOCK) {
            cipher.encrypt_block_mut(Block::<Aes128>::from_mut_slice(block));
        }
        writer.write_all(&pending[..whole])?;
        pending.drain(..whole);
    }

    // The final, possibly empty block always carries PKCS#7 padding.
    let mut tail = format::pad_pkcs7(&pending, AES_BLOCK)?;
    for block in tail.chunks_exact_mut(AES_BLOCK) {
        cipher.encrypt_block_mut(Block::<Aes128>::from_mut_slice(block));
    }
    writer.write_all(&tail)?;
    writer.flush()?;
    Ok(())
}

/// Decrypts the file at `src` (produced by [`encrypt_file`]) to `dst`.
pub fn decrypt_file(src: &Path, dst: &Path, key: &[u8], iv: &[u8]) -> Result<()> {
    check_key_iv(key, iv)?;
    let mut cipher = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|e| Error::CryptoArgument(e.to_string()))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, fs::File::open(src)?);
    let mut writer = BufWriter::new(fs::File::create(dst)?);

    // The final block is held back until EOF so its padding can be
    // stripped; everything before it streams straight through.
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut pending: Vec<u8> = Vec::with_capacity(BUFFER_SIZE + AES_BLOCK);
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&buf[..n]);
        if pending.len() > AES_BLOCK {
            let whole = pending.len() - pending.len() % AES_BLOCK;
            let safe = if whole == pending.len() {
                whole - AES_BLOCK
            } else {
                whole
            };
            for block in pending[..safe].chunks_exact_mut(AES_BLOCK) {
                cipher.decrypt_block_mut(Block::<Aes128>::from_mut_slice(block));
            }
            writer.write_all(&pending[..safe])?;
            pending.drain(..safe);
        }
    }

    if pending.len() != AES_BLOCK {
        return Err(Error::DecryptionFailed(format!(
            "ciphertext length is not a positive multiple of the block size \
             (trailing {} bytes)",
            pending.len()
        )));
    }
    cipher.decrypt_block_mut(Block::<Aes128>::from_mut_slice(&mut pending));
    let unpadded = format::unpad_pkcs7(&pending, AES_BLOCK)
        .map_err(|_| Error::DecryptionFailed("bad padding in final block".to_string()))?;
    writer.write_all(&unpadded)?;
    writer.flush()?;
    Ok(())
}

// =============================================================================
// Digests
// =============================================================================

/// Consumes `reader` fully and returns its SHA-1 digest.
///
/// Reads in fixed-size buffers; the stream is never held in memory.
pub fn digest_stream<R: Read>(reader: &mut R) -> Result<[u8; DIGEST_LEN]> {
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Returns the HMAC-SHA1 of `data` under `key`.
pub fn hmac_sha1(key: &[u8], data: &[u8]) -> Result<[u8; DIGEST_LEN]> {
    let mut mac = Hmac::<Sha1>::new_from_slice(key)
        .map_err(|e| Error::CryptoArgument(format!("bad HMAC key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

// =============================================================================
// RSA
// =============================================================================

/// Encrypts a small payload under `pubkey` with PKCS#1 v1.5 padding.
pub fn rsa_encrypt(data: &[u8], pubkey: &RsaPublicKey) -> Result<Vec<u8>> {
    pubkey
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, data)
        .map_err(|e| Error::CryptoArgument(format!("RSA encryption failed: {e}")))
}

/// Decrypts a PKCS#1 v1.5 ciphertext produced by [`rsa_encrypt`].
pub fn rsa_decrypt(ciphertext: &[u8], privkey: &RsaPrivateKey) -> Result<Vec<u8>> {
    privkey
        .decrypt(Pkcs1v15Encrypt, ciphertext)
        .map_err(|e| Error::DecryptionFailed(format!("RSA: {e}")))
}

/// Signs the SHA-1 digest of `data` with `privkey`.
pub fn sign(data: &[u8], privkey: &RsaPrivateKey) -> Result<Vec<u8>> {
    let digest = Sha1::digest(data);
    privkey
        .sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
        .map_err(|e| Error::CryptoArgument(format!("RSA signing failed: {e}")))
}

/// Verifies an RSA signature over the SHA-1 digest of `data`.
///
/// Returns `true` iff the signature is valid; never fails on mismatch.
pub fn verify(data: &[u8], signature: &[u8], pubkey: &RsaPublicKey) -> bool {
    let digest = Sha1::digest(data);
    pubkey
        .verify(Pkcs1v15Sign::new::<Sha1>(), &digest, signature)
        .is_ok()
}

// =============================================================================
// Asymmetric envelope
// =============================================================================

/// Encrypts `data` for the holder of `pubkey` using the version-2
/// envelope format.
pub fn encrypt_asym(data: &[u8], pubkey: &RsaPublicKey) -> Result<Vec<u8>> {
    let key = generate_key();
    let iv = generate_iv();
    let mut key_iv = Vec::with_capacity(SYM_KEY_LEN + SYM_IV_LEN);
    key_iv.extend_from_slice(&key);
    key_iv.extend_from_slice(&iv);

    let key_cryptogram = rsa_encrypt(&key_iv, pubkey)?;
    let data_cryptogram = encrypt_sym(data, &key, &iv)?;
    let len = format::int2int16(key_cryptogram.len())?;

    let mut out = Vec::with_capacity(3 + key_cryptogram.len() + data_cryptogram.len());
    out.push(ENVELOPE_VERSION_2);
    out.extend_from_slice(&len);
    out.extend_from_slice(&key_cryptogram);
    out.extend_from_slice(&data_cryptogram);
    Ok(out)
}

/// Decrypts an envelope produced by [`encrypt_asym`] or by legacy
/// version-1 tooling.
pub fn decrypt_asym(ciphertext: &[u8], privkey: &RsaPrivateKey) -> Result<Vec<u8>> {
    let version = *ciphertext
        .first()
        .ok_or_else(|| Error::CryptoArgument("empty envelope".to_string()))?;
    let (block_len, header_len) = match version {
        ENVELOPE_VERSION_1 => {
            let len = *ciphertext
                .get(1)
                .ok_or_else(|| Error::CryptoArgument("truncated envelope header".to_string()))?;
            (len as usize, 2)
        }
        ENVELOPE_VERSION_2 => {
            let hi = ciphertext.get(1);
            let lo = ciphertext.get(2);
            match (hi, lo) {
                (Some(&hi), Some(&lo)) => (format::int16_to_int([hi, lo]), 3),
                _ => {
                    return Err(Error::CryptoArgument(
                        "truncated envelope header".to_string(),
                    ))
                }
            }
        }
        other => return Err(Error::UnsupportedEnvelopeVersion(other)),
    };

    let rsa_block = ciphertext
        .get(header_len..header_len + block_len)
        .ok_or_else(|| {
            Error::CryptoArgument(format!(
                "envelope shorter than its declared {block_len}-byte key block"
            ))
        })?;
    let key_iv = rsa_decrypt(rsa_block, privkey)?;
    if key_iv.len() != SYM_KEY_LEN + SYM_IV_LEN {
        return Err(Error::DecryptionFailed(format!(
            "recovered key material has length {}, expected {}",
            key_iv.len(),
            SYM_KEY_LEN + SYM_IV_LEN
        )));
    }
    let (key, iv) = key_iv.split_at(SYM_KEY_LEN);
    decrypt_sym(&ciphertext[header_len + block_len..], key, iv)
}

// =============================================================================
// Key material loading
// =============================================================================

/// Parses an RSA private key from PKCS#1 or PKCS#8 PEM text.
pub fn private_key_from_pem(pem: &str) -> Result<RsaPrivateKey> {
    if pem.contains("BEGIN RSA PRIVATE KEY") {
        RsaPrivateKey::from_pkcs1_pem(pem)
            .map_err(|e| Error::CryptoArgument(format!("bad PKCS#1 private key: {e}")))
    } else {
        RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| Error::CryptoArgument(format!("bad PKCS#8 private key: {e}")))
    }
}

/// Loads an RSA private key from a PEM file.
pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey> {
    let pem = fs::read_to_string(path).map_err(|e| Error::KeyMaterial {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    private_key_from_pem(&pem).map_err(|e| Error::KeyMaterial {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Parses an RSA public key from PEM text.
///
/// Accepts an X.509 certificate (the key is taken from the subject
/// public key info), an SPKI public key, or a PKCS#1 public key; the PEM
/// label selects the parser.
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey> {
    if pem.contains("BEGIN CERTIFICATE") {
        let cert = Certificate::from_pem(pem.as_bytes())
            .map_err(|e| Error::CryptoArgument(format!("bad certificate: {e}")))?;
        let spki = cert
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .map_err(|e| Error::CryptoArgument(format!("bad subject public key info: {e}")))?;
        RsaPublicKey::from_public_key_der(&spki)
            .map_err(|e| Error::CryptoArgument(format!("certificate key is not RSA: {e}")))
    } else if pem.contains("BEGIN RSA PUBLIC KEY") {
        RsaPublicKey::from_pkcs1_pem(pem)
            .map_err(|e| Error::CryptoArgument(format!("bad PKCS#1 public key: {e}")))
    } else {
        RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| Error::CryptoArgument(format!("bad public key: {e}")))
    }
}

/// Loads a recipient public key from a certificate or public-key PEM file.
pub fn load_public_key(path: &Path) -> Result<RsaPublicKey> {
    let pem = fs::read_to_string(path).map_err(|e| Error::KeyMaterial {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    public_key_from_pem(&pem).map_err(|e| Error::KeyMaterial {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Returns the SHA-1 fingerprint of a PEM-encoded certificate in
/// `aa:bb:…` form.
pub fn cert_fingerprint(pem: &str) -> Result<String> {
    let cert = Certificate::from_pem(pem.as_bytes())
        .map_err(|e| Error::CryptoArgument(format!("bad certificate: {e}")))?;
    let der = cert
        .to_der()
        .map_err(|e| Error::CryptoArgument(format!("certificate re-encoding failed: {e}")))?;
    let digest = Sha1::digest(&der);
    Ok(digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":"))
}
