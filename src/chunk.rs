//! # Chunk Splitter/Joiner
//!
//! Fixed-size, order-preserving splitting of the encrypted bundle blob
//! into named part files, and its exact inverse. Part names are
//! `"<prefix>.part.<index>"` with the index zero-padded to a uniform
//! width (the decimal digit count of the part count), so parts sort the
//! same way by filename and by manifest index.
//!
//! Splitting creates every part file before writing any data, so
//! creation or permission errors surface before disk fills with half a
//! bundle. A 0-byte input yields an empty part list, not an error;
//! rejecting empty inputs is the caller's policy.

use std::fmt::Display;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info};

use crate::constants::{BUFFER_SIZE, PART_SUFFIX};
use crate::crypto;
use crate::error::{Error, Result};

/// One part of a split bundle: file basename plus binary digest.
///
/// The part's index is implicit in its position within the manifest's
/// ordered part list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// Base name of the part file, without any directory component.
    pub filename: String,
    /// Binary SHA-1 digest of the part's content.
    pub digest: Vec<u8>,
}

fn chunk_err(path: &Path, reason: impl Display) -> Error {
    Error::ChunkIo {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Splits the file at `filename` into chunks of `chunk_size` bytes.
///
/// Parts are created in `dst_dir` and named after `prefix`. Every part
/// receives exactly `chunk_size` bytes except the last, which receives
/// the remainder. Returns the ordered list of part basenames.
pub fn split(
    filename: &Path,
    prefix: &str,
    chunk_size: usize,
    dst_dir: &Path,
) -> Result<Vec<String>> {
    if chunk_size == 0 {
        return Err(chunk_err(filename, "chunk size must be positive"));
    }
    let file =
        File::open(filename).map_err(|e| chunk_err(filename, format!("could not open file to split: {e}")))?;
    let size = file
        .metadata()
        .map_err(|e| chunk_err(filename, format!("could not stat file to split: {e}")))?
        .len();

    let nr_parts = size.div_ceil(chunk_size as u64) as usize;
    let width = nr_parts.to_string().len();

    // Create the part files up front to catch any creation error before
    // writing out data.
    let mut part_names = Vec::with_capacity(nr_parts);
    for index in 0..nr_parts {
        let part_name = format!("{prefix}{PART_SUFFIX}{index:0width$}");
        let path = dst_dir.join(&part_name);
        File::create(&path)
            .map_err(|e| chunk_err(&path, format!("could not create part file: {e}")))?;
        part_names.push(part_name);
    }

    let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);
    let mut buf = vec![0u8; BUFFER_SIZE];
    for part_name in &part_names {
        let path = dst_dir.join(part_name);
        let part_file =
            File::create(&path).map_err(|e| chunk_err(&path, format!("could not open part file: {e}")))?;
        let mut writer = BufWriter::new(part_file);
        write_chunk(&mut reader, &mut writer, chunk_size, &mut buf)
            .map_err(|e| chunk_err(&path, format!("could not write part file: {e}")))?;
        writer
            .flush()
            .map_err(|e| chunk_err(&path, format!("could not write part file: {e}")))?;
        debug!("Created part {}", part_name);
    }

    info!(
        "Split {} ({} bytes) into {} parts",
        filename.display(),
        size,
        nr_parts
    );
    Ok(part_names)
}

/// Copies up to `chunk_size` bytes from `reader` into `writer`.
fn write_chunk<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    chunk_size: usize,
    buf: &mut [u8],
) -> io::Result<()> {
    let mut left = chunk_size;
    while left > 0 {
        let want = buf.len().min(left);
        let n = reader.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        left -= n;
    }
    Ok(())
}

/// Concatenates `filenames` byte-for-byte, in the given order, into
/// `out_filename`. An existing output file is overwritten.
///
/// The caller supplies paths already in index order; ordering by
/// filename and by manifest index agree by construction.
pub fn join<P: AsRef<Path>>(filenames: &[P], out_filename: &Path) -> Result<()> {
    let out = File::create(out_filename)
        .map_err(|e| chunk_err(out_filename, format!("could not create output file: {e}")))?;
    let mut writer = BufWriter::new(out);
    for filename in filenames {
        let path = filename.as_ref();
        let mut reader =
            File::open(path).map_err(|e| chunk_err(path, format!("could not open part: {e}")))?;
        io::copy(&mut reader, &mut writer)
            .map_err(|e| chunk_err(path, format!("could not copy part: {e}")))?;
    }
    writer
        .flush()
        .map_err(|e| chunk_err(out_filename, format!("could not write output file: {e}")))?;
    Ok(())
}

/// Digests each part independently, producing the records the manifest
/// carries. `basenames` must be in index order.
pub fn digest_parts(basenames: &[String], dir: &Path) -> Result<Vec<Part>> {
    let mut parts = Vec::with_capacity(basenames.len());
    for basename in basenames {
        let path = dir.join(basename);
        let mut file =
            File::open(&path).map_err(|e| chunk_err(&path, format!("could not open part: {e}")))?;
        let digest = crypto::digest_stream(&mut file)?;
        parts.push(Part {
            filename: basename.clone(),
            digest: digest.to_vec(),
        });
    }
    debug!("Generated digests for {} parts", parts.len());
    Ok(parts)
}

/// Compresses `filename` with gzip, returning the path of the created
/// `<filename>.gz`.
pub fn compress_file(filename: &Path) -> Result<PathBuf> {
    let mut out_name = filename.as_os_str().to_os_string();
    out_name.push(".gz");
    let out_path = PathBuf::from(out_name);

    let mut reader = BufReader::with_capacity(BUFFER_SIZE, File::open(filename)?);
    let mut encoder = GzEncoder::new(File::create(&out_path)?, Compression::default());
    io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?;
    Ok(out_path)
}

/// Expands the gzip file at `src_filename` to `dst_filename`.
pub fn expand_file(src_filename: &Path, dst_filename: &Path) -> Result<()> {
    let mut decoder = GzDecoder::new(BufReader::with_capacity(
        BUFFER_SIZE,
        File::open(src_filename)?,
    ));
    let mut writer = BufWriter::new(File::create(dst_filename)?);
    io::copy(&mut decoder, &mut writer)?;
    writer.flush()?;
    Ok(())
}
