//! # File Chunking
//!
//! Splits a file into a small number of logical parts and joins parts back
//! into one file.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         FILE CHUNKING                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  split_file(source, total, base, parts = 2)                            │
//! │                                                                         │
//! │  1. part size = ceil(total / parts), last part takes the remainder     │
//! │  2. each part is copied to <base>_<i> in windows of at most            │
//! │     `threshold` bytes, synced after every window                       │
//! │  3. one SplitDescriptor per part (full logical size, one path)         │
//! │                                                                         │
//! │  combine_files(paths, out)                                             │
//! │                                                                         │
//! │  1. append every path in caller order using the same windows           │
//! │  2. delete each source once consumed                                   │
//! │  3. an unopenable or short source aborts the combine                   │
//! │                                                                         │
//! │  split_by_layout(reader, sizes, base)                                  │
//! │                                                                         │
//! │  Re-cuts a combined blob along the sizes fixed at upload time.         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::context::Context;
use crate::error::{Error, Result};

/// Largest buffer used for a single read while copying a window
const COPY_BUFFER_SIZE: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One logical part of a split file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitDescriptor {
    /// Zero-based position within the file
    pub index: usize,
    /// Where the part was written
    pub path: PathBuf,
    /// Offset of the part within the original file
    pub plaintext_offset: u64,
    /// Size of the part in bytes
    pub size: u64,
}

// ---------------------------------------------------------------------------
// Split arithmetic
// ---------------------------------------------------------------------------

/// Sizes of the parts a `total` byte file splits into
///
/// Every part is `ceil(total / parts)` bytes except the last, which takes the
/// remainder. Parts that would be empty (a file smaller than `parts` bytes)
/// are not produced.
pub fn part_sizes(total: u64, parts: usize) -> Result<Vec<u64>> {
    if total == 0 {
        return Err(Error::InvalidInput("cannot split an empty file".into()));
    }
    if parts == 0 {
        return Err(Error::InvalidInput("part count must be at least 1".into()));
    }

    let chunk = total.div_ceil(parts as u64);
    let mut sizes = Vec::with_capacity(parts);
    let mut remaining = total;
    while remaining > 0 && sizes.len() < parts {
        let size = chunk.min(remaining);
        sizes.push(size);
        remaining -= size;
    }
    Ok(sizes)
}

/// Path of part `index` for `base`
pub fn part_path(base: &Path, index: usize) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!("_{}", index));
    PathBuf::from(name)
}

/// `path` with `suffix` appended to its file name
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// File ids end up in staging file names
pub(crate) fn check_file_id(file_id: &str) -> Result<()> {
    let bad = file_id.is_empty()
        || file_id == "."
        || file_id == ".."
        || file_id.contains(['/', '\\', '\0']);
    if bad {
        return Err(Error::InvalidInput(format!("invalid file id {:?}", file_id)));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Split
// ---------------------------------------------------------------------------

/// Split `source` into `part_count` parts written next to `base_path`
///
/// On failure every part written so far is removed.
pub async fn split_file<R>(
    ctx: &Context,
    source: &mut R,
    total_size: u64,
    base_path: &Path,
    part_count: usize,
    threshold: u64,
) -> Result<Vec<SplitDescriptor>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let sizes = part_sizes(total_size, part_count)?;
    tracing::info!(
        base = %base_path.display(),
        parts = sizes.len(),
        total_size,
        "Splitting file"
    );

    let mut parts: Vec<SplitDescriptor> = Vec::with_capacity(sizes.len());
    let mut offset = 0u64;
    for (index, size) in sizes.iter().copied().enumerate() {
        let path = part_path(base_path, index);
        if let Err(e) = write_part(ctx, source, size, &path, threshold).await {
            remove_quietly(&path).await;
            for part in &parts {
                remove_quietly(&part.path).await;
            }
            return Err(e);
        }
        tracing::debug!(path = %path.display(), offset, size, "Split part written");
        parts.push(SplitDescriptor {
            index,
            path,
            plaintext_offset: offset,
            size,
        });
        offset += size;
    }
    Ok(parts)
}

/// Re-cut a combined blob along previously recorded part sizes
///
/// Part `i` is written to `<base>_<i><suffix>`. The reader running out
/// before every size is satisfied is an error.
pub async fn split_by_layout<R>(
    ctx: &Context,
    source: &mut R,
    sizes: &[u64],
    base_path: &Path,
    suffix: &str,
    threshold: u64,
) -> Result<Vec<PathBuf>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut paths: Vec<PathBuf> = Vec::with_capacity(sizes.len());
    for (index, size) in sizes.iter().copied().enumerate() {
        let path = with_suffix(&part_path(base_path, index), suffix);
        if let Err(e) = write_part(ctx, source, size, &path, threshold).await {
            remove_quietly(&path).await;
            for written in &paths {
                remove_quietly(written).await;
            }
            return Err(e);
        }
        paths.push(path);
    }
    Ok(paths)
}

/// Copy exactly `size` bytes from `source` into a new file at `path`
async fn write_part<R>(
    ctx: &Context,
    source: &mut R,
    size: u64,
    path: &Path,
    threshold: u64,
) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut out = File::create(path).await?;
    let window = threshold.max(1);
    let mut remaining = size;
    while remaining > 0 {
        ctx.check()?;
        let this_window = remaining.min(window);
        copy_exact(ctx, source, &mut out, this_window).await?;
        out.flush().await?;
        out.sync_data().await?;
        remaining -= this_window;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Combine
// ---------------------------------------------------------------------------

/// Append every file in `paths` to `out`, in order, deleting each source
///
/// Returns the number of bytes written. On failure `out` is removed; sources
/// consumed before the failure are already gone.
pub async fn combine_files(
    ctx: &Context,
    paths: &[PathBuf],
    out: &Path,
    threshold: u64,
) -> Result<u64> {
    let result = combine_into(ctx, paths, out, threshold).await;
    if result.is_err() {
        remove_quietly(out).await;
    }
    result
}

async fn combine_into(
    ctx: &Context,
    paths: &[PathBuf],
    out: &Path,
    threshold: u64,
) -> Result<u64> {
    let mut output = File::create(out).await?;
    let window = threshold.max(1);
    let mut written = 0u64;

    for path in paths {
        ctx.check()?;
        let mut source = File::open(path).await.map_err(|e| {
            Error::Io(format!("cannot open chunk {}: {}", path.display(), e))
        })?;
        let mut remaining = source.metadata().await?.len();
        while remaining > 0 {
            let this_window = remaining.min(window);
            copy_exact(ctx, &mut source, &mut output, this_window)
                .await
                .map_err(|e| match e {
                    Error::Io(msg) => Error::Io(format!("{}: {}", path.display(), msg)),
                    other => other,
                })?;
            remaining -= this_window;
            written += this_window;
        }
        drop(source);

        if let Err(e) = fs::remove_file(path).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to delete consumed chunk");
        }
    }

    output.flush().await?;
    output.sync_all().await?;
    tracing::info!(out = %out.display(), parts = paths.len(), bytes = written, "Combined chunks");
    Ok(written)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn copy_exact<R, W>(ctx: &Context, source: &mut R, out: &mut W, len: u64) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: tokio::io::AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; (len as usize).min(COPY_BUFFER_SIZE)];
    let mut remaining = len;
    while remaining > 0 {
        ctx.check()?;
        let want = (remaining as usize).min(buf.len());
        let n = source.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(Error::Io(format!(
                "unexpected end of input, {} bytes short",
                remaining
            )));
        }
        out.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    Ok(())
}

pub(crate) async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
