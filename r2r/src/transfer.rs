//! Moving bytes from a source channel to a destination channel.
//!
//! Three strategies share the same error contract: the first read or write
//! failure aborts the copy, and bytes already written stay at the
//! destination.
//!
//! - [`transfer_stream`] copies one chunk at a time, read then write, so
//!   peak memory is a single chunk regardless of file size.
//! - [`transfer_pipelined`] overlaps reads and writes through a bounded
//!   channel. Memory stays at `(depth + 2) * chunk_size` and byte order is
//!   preserved.
//! - [`transfer_buffer`] reads the whole source before writing it. Meant for
//!   small files.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TransferError;

/// Chunk size used by the streaming strategies.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Largest accepted chunk size.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Largest accepted number of chunks in flight when pipelining.
pub const MAX_PIPELINE_DEPTH: usize = 64;

/// How file data is moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Fixed-size chunks with progress reporting.
    #[default]
    Stream,
    /// Whole file in one buffer.
    Buffer,
}

/// Cumulative progress of a streaming transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Bytes written to the destination so far.
    pub transferred: u64,
    /// Size of the source reported before the copy started.
    pub total: u64,
}

impl Progress {
    /// Completion percentage, if the total is known.
    pub fn percent(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some((self.transferred as f64 / self.total as f64 * 100.0).min(100.0))
    }
}

/// Copy `src` to `dst` one chunk at a time.
///
/// `on_progress` runs after every successful write. The copy ends at the
/// first zero-length read, after which the destination is flushed and shut
/// down.
pub async fn transfer_stream<R, W, F>(
    src: &mut R,
    dst: &mut W,
    total_size: u64,
    chunk_size: usize,
    cancel: &CancellationToken,
    mut on_progress: F,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(Progress),
{
    let mut buf = vec![0u8; chunk_size.clamp(1, MAX_CHUNK_SIZE)];
    let mut written = 0u64;

    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(written)),
            read = src.read(&mut buf) => read.map_err(|source| read_error(written, source))?,
        };
        if n == 0 {
            break;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(written)),
            result = dst.write_all(&buf[..n]) => result.map_err(|source| write_error(written, source))?,
        }

        written += n as u64;
        trace!("wrote chunk of {} bytes ({}/{})", n, written, total_size);
        on_progress(Progress {
            transferred: written,
            total: total_size,
        });
    }

    finish(dst, written).await?;

    if written != total_size {
        debug!(
            "source size changed during transfer: expected {} bytes, copied {}",
            total_size, written
        );
    }
    Ok(written)
}

/// Copy `src` to `dst` with reads and writes overlapped.
///
/// A reader and a writer run concurrently on the current task, connected by
/// a channel holding at most `depth` chunks. `chunk_size` and `depth` are
/// clamped to [`MAX_CHUNK_SIZE`] and [`MAX_PIPELINE_DEPTH`].
pub async fn transfer_pipelined<R, W, F>(
    src: &mut R,
    dst: &mut W,
    total_size: u64,
    chunk_size: usize,
    depth: usize,
    cancel: &CancellationToken,
    mut on_progress: F,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(Progress),
{
    let chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE);
    let (tx, rx) = mpsc::channel::<Bytes>(depth.clamp(1, MAX_PIPELINE_DEPTH));
    let written = AtomicU64::new(0);

    let reader = async {
        let tx = tx;
        let mut read_total = 0u64;
        loop {
            let mut buf = BytesMut::zeroed(chunk_size);
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(written.load(Ordering::Relaxed))),
                read = src.read(&mut buf[..]) => match read {
                    Ok(n) => n,
                    Err(source) => return Err(read_error(written.load(Ordering::Relaxed), source)),
                },
            };
            if n == 0 {
                return Ok::<u64, TransferError>(read_total);
            }
            buf.truncate(n);
            read_total += n as u64;
            if tx.send(buf.freeze()).await.is_err() {
                // Writer stopped; its error is reported instead.
                return Ok(read_total);
            }
        }
    };

    let writer = async {
        // Owned so a failed writer drops the receiver and unblocks the reader.
        let mut rx = rx;
        while let Some(chunk) = rx.recv().await {
            let before = written.load(Ordering::Relaxed);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(before)),
                result = dst.write_all(&chunk) => {
                    if let Err(source) = result {
                        return Err(write_error(before, source));
                    }
                }
            }
            let now = before + chunk.len() as u64;
            written.store(now, Ordering::Relaxed);
            on_progress(Progress {
                transferred: now,
                total: total_size,
            });
        }
        Ok::<(), TransferError>(())
    };

    let (read_result, write_result) = tokio::join!(reader, writer);
    let copied = written.load(Ordering::Relaxed);

    let cancelled_either = matches!(read_result, Err(TransferError::Cancelled { .. }))
        || matches!(write_result, Err(TransferError::Cancelled { .. }));
    if cancelled_either {
        return Err(cancelled(copied));
    }

    let read_total = read_result?;
    write_result?;
    finish(dst, copied).await?;
    debug!("pipelined copy finished: read {} wrote {}", read_total, copied);
    Ok(copied)
}

/// Read the whole source, then write it in one call.
pub async fn transfer_buffer<R, W>(
    src: &mut R,
    dst: &mut W,
    cancel: &CancellationToken,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut data = Vec::new();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(cancelled(0)),
        read = src.read_to_end(&mut data) => read.map_err(|source| read_error(0, source))?,
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(cancelled(0)),
        result = dst.write_all(&data) => result.map_err(|source| write_error(0, source))?,
    }

    let written = data.len() as u64;
    finish(dst, written).await?;
    Ok(written)
}

async fn finish<W: AsyncWrite + Unpin>(dst: &mut W, written: u64) -> Result<(), TransferError> {
    dst.flush()
        .await
        .map_err(|source| write_error(written, source))?;
    dst.shutdown()
        .await
        .map_err(|source| write_error(written, source))
}

fn cancelled(bytes_transferred: u64) -> TransferError {
    TransferError::Cancelled { bytes_transferred }
}

// Paths are filled in by the caller, which knows the remote file names.
fn read_error(bytes_transferred: u64, source: std::io::Error) -> TransferError {
    TransferError::Read {
        path: String::new(),
        bytes_transferred,
        source,
    }
}

fn write_error(bytes_transferred: u64, source: std::io::Error) -> TransferError {
    TransferError::Write {
        path: String::new(),
        bytes_transferred,
        source,
    }
}
