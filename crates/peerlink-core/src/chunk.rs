//! File hashing, chunking, and placement of received files

use crate::{error::Result, types::FileMetadata, Error, HASH_BLOCK_SIZE};
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Number of chunks needed to carry `size` bytes
pub fn total_chunks(size: u64, chunk_size: usize) -> u64 {
    let chunk_size = chunk_size.max(1) as u64;
    size.div_ceil(chunk_size)
}

/// Hash a file by streaming it in fixed-size blocks.
///
/// Memory use stays at one block regardless of file size.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; HASH_BLOCK_SIZE];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// Compute the metadata announced in a `file_info` offer
pub fn file_metadata(path: &Path, chunk_size: usize) -> Result<FileMetadata> {
    let meta = std::fs::metadata(path)?;
    if !meta.is_file() {
        return Err(Error::InvalidData(format!("{} is not a regular file", path.display())));
    }

    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(sanitize_filename)
        .unwrap_or_else(|| sanitize_filename(""));
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default();

    Ok(FileMetadata {
        filename,
        size: meta.len(),
        hash: hash_file(path)?,
        extension,
        total_chunks: total_chunks(meta.len(), chunk_size),
    })
}

/// Fill `buf` from `reader`, stopping early only at EOF.
///
/// Returns the number of bytes read; 0 means the source is exhausted. Chunk
/// boundaries therefore never depend on how the OS splits reads.
pub async fn read_chunk<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Reduce an offered filename to a bare name safe to create in the download
/// directory.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();

    match base {
        "" | "." | ".." => "received_file".to_string(),
        other => other.to_string(),
    }
}

/// Move a finished staging file into `dir` without overwriting anything.
///
/// `a.txt` becomes `a_1.txt`, then `a_2.txt`, and so on. The counter goes
/// before the last extension; names without one get a plain suffix. Each
/// candidate is claimed with `create_new` before the rename, so a file that
/// appears concurrently is skipped rather than replaced.
pub fn place_received(staging: &Path, dir: &Path, filename: &str) -> Result<PathBuf> {
    let (stem, ext) = split_extension(filename);
    let mut counter = 0u32;
    loop {
        let candidate = if counter == 0 {
            dir.join(filename)
        } else {
            dir.join(format!("{}_{}{}", stem, counter, ext))
        };
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(_) => {
                if let Err(e) = std::fs::rename(staging, &candidate) {
                    let _ = std::fs::remove_file(&candidate);
                    return Err(e.into());
                }
                return Ok(candidate);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => counter += 1,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Split `name` into stem and extension (with its dot).
///
/// Hidden files like `.bashrc` have no extension.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(idx) => name.split_at(idx),
    }
}
