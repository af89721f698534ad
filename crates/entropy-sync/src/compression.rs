use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use bzip2::read::MultiBzDecoder;
use flate2::read::{GzDecoder, MultiGzDecoder};

use crate::payload::CompressionFormat;

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// The archive itself is damaged or not in the expected format.
    #[error("corrupt archive {}: {message}", path.display())]
    Corrupt { path: PathBuf, message: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CompressionError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }

    fn corrupt(path: &Path, message: impl ToString) -> Self {
        Self::Corrupt {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Open a compressed file as a decompressed byte stream.
pub fn open_for_read(
    format: CompressionFormat,
    path: &Path,
) -> Result<Box<dyn Read + Send>, CompressionError> {
    let file = File::open(path).map_err(|e| CompressionError::io(path, e))?;
    let len = file
        .metadata()
        .map_err(|e| CompressionError::io(path, e))?
        .len();
    if len == 0 {
        return Err(CompressionError::corrupt(path, "empty archive"));
    }
    let reader = BufReader::new(file);
    Ok(match format {
        CompressionFormat::Bzip2 => Box::new(MultiBzDecoder::new(reader)),
        CompressionFormat::Gzip => Box::new(MultiGzDecoder::new(reader)),
    })
}

/// Decompress `src` into `dest`, returning the number of bytes written.
///
/// Decoder failures surface as `Corrupt`; failures writing `dest` as `Io`.
/// `dest` is removed when decompression does not complete.
pub fn decompress(
    format: CompressionFormat,
    src: &Path,
    dest: &Path,
) -> Result<u64, CompressionError> {
    let mut reader = open_for_read(format, src)?;
    let result = copy_stream(&mut reader, src, dest);
    if result.is_err() {
        let _ = std::fs::remove_file(dest);
    }
    result
}

fn copy_stream(reader: &mut dyn Read, src: &Path, dest: &Path) -> Result<u64, CompressionError> {
    let mut out = File::create(dest).map_err(|e| CompressionError::io(dest, e))?;
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CompressionError::corrupt(src, e)),
        };
        out.write_all(&buf[..n])
            .map_err(|e| CompressionError::io(dest, e))?;
        total += n as u64;
    }
    out.sync_all().map_err(|e| CompressionError::io(dest, e))?;
    Ok(total)
}

/// Unpack a gzip-compressed tar bundle into `dest_dir`.
///
/// Only regular files are extracted and only their base names are kept, so
/// entries cannot escape `dest_dir`. Returns the extracted paths.
pub fn unpack_bundle(src: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>, CompressionError> {
    let file = File::open(src).map_err(|e| CompressionError::io(src, e))?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));

    let entries = archive
        .entries()
        .map_err(|e| CompressionError::corrupt(src, format!("failed to read tar entries: {e}")))?;

    let mut extracted = Vec::new();
    for entry in entries {
        let mut entry = entry
            .map_err(|e| CompressionError::corrupt(src, format!("failed to read tar entry: {e}")))?;

        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }

        let name = {
            let path = entry
                .path()
                .map_err(|e| CompressionError::corrupt(src, format!("invalid path in tar: {e}")))?;
            match path.file_name() {
                Some(name) => name.to_os_string(),
                None => continue,
            }
        };

        let target = dest_dir.join(&name);
        let mut out = File::create(&target).map_err(|e| CompressionError::io(&target, e))?;
        std::io::copy(&mut entry, &mut out)
            .map_err(|e| CompressionError::corrupt(src, format!("truncated entry: {e}")))?;
        extracted.push(target);
    }

    Ok(extracted)
}
