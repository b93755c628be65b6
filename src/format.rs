//! Binary/hex conversion, 16-bit packing and the legacy PKCS#7 codec.
//!
//! Pure functions with no state. The PKCS#7 pad/unpad pair predates the
//! cipher layer's own padding and survives for the streaming file cipher
//! and for decoding blobs produced by older tooling.

use crate::error::{Error, Result};

/// Converts binary data to a lowercase hex string.
///
/// E.g. the bytes `0x01 0x1A 0xFF` become `"011aff"`.
pub fn bin2hex(data: &[u8]) -> String {
    hex::encode(data)
}

/// Converts a hex string back to the binary data it represents.
///
/// An odd-length string is left-padded with a leading `'0'` before
/// decoding, so `"11aff"` decodes the same as `"011aff"`.
pub fn hex2bin(hex: &str) -> Result<Vec<u8>> {
    let padded;
    let hex = if hex.len() % 2 == 0 {
        hex
    } else {
        padded = format!("0{hex}");
        &padded
    };
    hex::decode(hex).map_err(|e| Error::MalformedHex(format!("{hex:?}: {e}")))
}

/// Packs an integer into two bytes in big-endian order.
///
/// Fails when the value does not fit in 16 bits.
pub fn int2int16(value: usize) -> Result<[u8; 2]> {
    if value > u16::MAX as usize {
        return Err(Error::CryptoArgument(format!(
            "value {value} does not fit in 16 bits"
        )));
    }
    Ok((value as u16).to_be_bytes())
}

/// Unpacks two big-endian bytes into an integer.
pub fn int16_to_int(bytes: [u8; 2]) -> usize {
    u16::from_be_bytes(bytes) as usize
}

/// Pads `data` according to the PKCS#7 padding scheme.
///
/// Between 1 and `blocksize` bytes are always appended; input whose
/// length is already a multiple of `blocksize` gains a full block.
pub fn pad_pkcs7(data: &[u8], blocksize: usize) -> Result<Vec<u8>> {
    if blocksize == 0 || blocksize >= 0xFF {
        return Err(Error::CryptoArgument(format!(
            "illegal blocksize: {blocksize}"
        )));
    }
    let mut nr_padchars = blocksize - (data.len() % blocksize);
    if nr_padchars == 0 {
        nr_padchars = blocksize;
    }
    let mut padded = Vec::with_capacity(data.len() + nr_padchars);
    padded.extend_from_slice(data);
    padded.extend(std::iter::repeat(nr_padchars as u8).take(nr_padchars));
    Ok(padded)
}

/// Removes PKCS#7 padding applied by [`pad_pkcs7`].
pub fn unpad_pkcs7(data: &[u8], blocksize: usize) -> Result<Vec<u8>> {
    if blocksize == 0 || blocksize >= 0xFF {
        return Err(Error::CryptoArgument(format!(
            "illegal blocksize: {blocksize}"
        )));
    }
    if data.is_empty() || data.len() % blocksize != 0 {
        return Err(Error::CryptoArgument(format!(
            "invalid padded data size: {}",
            data.len()
        )));
    }
    let nr_padchars = data[data.len() - 1] as usize;
    if nr_padchars == 0 || nr_padchars > blocksize {
        return Err(Error::CryptoArgument(format!(
            "invalid padding character: {nr_padchars}"
        )));
    }
    Ok(data[..data.len() - nr_padchars].to_vec())
}
