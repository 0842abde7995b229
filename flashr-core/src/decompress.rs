//! Streaming decompression of compressed images.
//!
//! The container format is detected from magic bytes, never from the file
//! name alone, since user-supplied files are often misnamed. Output goes to
//! the cache directory under the input's name with the compression
//! extension removed, prefixed by a fingerprint of the input so that
//! same-named inputs from different places never share an output.

use crate::cache::{self, CacheManager, PARTIAL_SUFFIX};
use crate::error::{Error, Result};
use crate::operation::CancelFlag;
use crate::progress::DownloadState;
use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use log::{debug, info};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

const IO_BUFFER_SIZE: usize = 8 * 1024 * 1024;
const CHUNK_SIZE: usize = 4 * 1024 * 1024;
/// Bytes hashed from each end of an input to fingerprint it. Every supported
/// container ends in an integrity trailer, so the tail pins the content.
const FINGERPRINT_SPAN: u64 = 1024 * 1024;

const XZ_MAGIC: &[u8] = &[0xFD, b'7', b'z', b'X', b'Z', 0x00];
const GZIP_MAGIC: &[u8] = &[0x1F, 0x8B];
const BZIP2_MAGIC: &[u8] = b"BZh";
const ZSTD_MAGIC: &[u8] = &[0x28, 0xB5, 0x2F, 0xFD];

const COMPRESSED_EXTENSIONS: &[&str] = &[".xz", ".gz", ".gzip", ".bz2", ".zst", ".zstd"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Raw,
    Xz,
    Gzip,
    Bzip2,
    Zstd,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Format::Raw => "raw",
            Format::Xz => "xz",
            Format::Gzip => "gzip",
            Format::Bzip2 => "bzip2",
            Format::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

/// Identifies a container from the first bytes of a file.
pub fn sniff(header: &[u8]) -> Format {
    if header.starts_with(XZ_MAGIC) {
        Format::Xz
    } else if header.starts_with(GZIP_MAGIC) {
        Format::Gzip
    } else if header.starts_with(BZIP2_MAGIC) {
        Format::Bzip2
    } else if header.starts_with(ZSTD_MAGIC) {
        Format::Zstd
    } else {
        Format::Raw
    }
}

pub fn detect_format(path: &Path) -> Result<Format> {
    let mut file = File::open(path)?;
    let mut header = [0u8; 6];
    let mut filled = 0;
    while filled < header.len() {
        match file.read(&mut header[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(sniff(&header[..filled]))
}

/// Whether `path` holds a recognized compressed container.
pub fn needs_decompression(path: &Path) -> Result<bool> {
    Ok(detect_format(path)? != Format::Raw)
}

/// The decompressed file name for `input_name`: a known compression
/// extension is stripped, otherwise `.img` is appended.
pub fn output_name(input_name: &str) -> String {
    let lower = input_name.to_ascii_lowercase();
    for ext in COMPRESSED_EXTENSIONS {
        if lower.ends_with(ext) && lower.len() > ext.len() {
            return input_name[..input_name.len() - ext.len()].to_string();
        }
    }
    format!("{}.img", input_name)
}

/// Fingerprints a compressed input by its length and its first and last
/// mebibyte. Inputs up to twice that size are hashed whole.
pub fn fingerprint(path: &Path) -> Result<[u8; 32]> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let mut hasher = Sha256::new();
    hasher.update(len.to_le_bytes());

    if len <= 2 * FINGERPRINT_SPAN {
        io::copy(&mut file, &mut hasher)?;
    } else {
        io::copy(&mut (&mut file).take(FINGERPRINT_SPAN), &mut hasher)?;
        file.seek(SeekFrom::Start(len - FINGERPRINT_SPAN))?;
        io::copy(&mut file.take(FINGERPRINT_SPAN), &mut hasher)?;
    }
    Ok(hasher.finalize().into())
}

/// The cache key of the decompressed output of `input`.
pub fn output_key(input: &Path) -> Result<String> {
    let input_name = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::DecompressionFailed("input has no file name".to_string()))?;
    Ok(cache::source_key(&fingerprint(input)?, &output_name(&input_name)))
}

/// Wraps `reader` in the decoder for `format`. Concatenated streams are
/// decoded in full for every format.
pub fn open_decoder<'a, R: Read + 'a>(format: Format, reader: R) -> io::Result<Box<dyn Read + 'a>> {
    Ok(match format {
        Format::Raw => Box::new(reader),
        Format::Xz => Box::new(XzDecoder::new_multi_decoder(reader)),
        Format::Gzip => Box::new(MultiGzDecoder::new(reader)),
        Format::Bzip2 => Box::new(MultiBzDecoder::new(reader)),
        Format::Zstd => Box::new(ZstdDecoder::new(reader)?),
    })
}

/// Counts compressed bytes as the decoder pulls them.
struct CountingReader<R> {
    inner: R,
    consumed: u64,
    state: Arc<DownloadState>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed += n as u64;
        self.state.advance_to(self.consumed);
        Ok(n)
    }
}

pub struct Decompressor {
    cache: Arc<CacheManager>,
    state: Arc<DownloadState>,
}

impl Decompressor {
    pub fn new(cache: Arc<CacheManager>, state: Arc<DownloadState>) -> Self {
        Self { cache, state }
    }

    /// Decompresses `input` into the cache directory and returns the output
    /// path. A raw input is returned unchanged, and an existing output
    /// decoded from identical input is reused.
    ///
    /// The `.partial` output is removed on failure or cancellation.
    pub fn decompress(&self, input: &Path, cancel: &CancelFlag) -> Result<PathBuf> {
        let format = detect_format(input)?;
        if format == Format::Raw {
            debug!("{} is not compressed", input.display());
            return Ok(input.to_path_buf());
        }

        let name = output_key(input)?;
        let output = self.cache.reserve(&name)?;

        if output.is_file() {
            info!("Decompressed image already exists: {}", output.display());
            self.cache.touch(&name)?;
            return Ok(output);
        }

        self.state.set_decompressing(true);
        let result = self.run(input, format, &name, &output, cancel);
        self.state.set_decompressing(false);
        result
    }

    fn run(
        &self,
        input: &Path,
        format: Format,
        name: &str,
        output: &Path,
        cancel: &CancelFlag,
    ) -> Result<PathBuf> {
        let file = File::open(input)?;
        self.state.set_total(file.metadata()?.len());
        info!(
            "Decompressing {} ({}) -> {}",
            input.display(),
            format,
            output.display()
        );

        let reader = CountingReader {
            inner: BufReader::with_capacity(IO_BUFFER_SIZE, file),
            consumed: 0,
            state: Arc::clone(&self.state),
        };
        let mut decoder = open_decoder(format, reader)
            .map_err(|e| Error::DecompressionFailed(format!("{} stream: {}", format, e)))?;

        let partial = tempfile::Builder::new()
            .prefix(&format!("{}.", name))
            .suffix(PARTIAL_SUFFIX)
            .tempfile_in(self.cache.dir())?;
        let mut writer = BufWriter::with_capacity(IO_BUFFER_SIZE, partial);
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut produced: u64 = 0;

        loop {
            cancel.check()?;

            let n = decoder
                .read(&mut buffer)
                .map_err(|e| Error::DecompressionFailed(format!("{} stream: {}", format, e)))?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n])?;
            produced += n as u64;
        }

        let partial = writer.into_inner().map_err(|e| Error::Io(e.into_error()))?;
        partial.as_file().sync_all()?;
        partial.persist(output).map_err(|e| Error::Io(e.error))?;

        info!("Decompressed {} bytes into {}", produced, output.display());
        self.cache.record_completed(name, produced)?;
        Ok(output.to_path_buf())
    }
}
