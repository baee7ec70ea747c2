//! Paced, chunked raw upload over the writable side of a transport.
//!
//! Boards without a bootloader protocol on the link (BW16) take firmware as a
//! plain byte stream. Their USB bridges drop data when flooded, so the
//! payload goes out in fixed-size slices with a pause between slices.
//!
//! ## Example
//!
//! ```rust,no_run
//! use boardflash::{ChunkedUploader, TransportHandle, UploadOptions};
//!
//! fn send(handle: &TransportHandle, image: &[u8]) -> boardflash::Result<()> {
//!     let report = ChunkedUploader::new(UploadOptions::default()).upload(
//!         handle,
//!         image,
//!         |p| println!("Sent {}/{} bytes ({}%)", p.transferred, p.total, p.percent()),
//!     )?;
//!     println!("{} chunks in {:?}", report.chunks, report.elapsed);
//!     Ok(())
//! }
//! ```

use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::cancel::CancelToken;
use crate::device::DeviceClass;
use crate::error::{Error, Result};
use crate::transport::TransportHandle;

/// Default slice size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Default pause between slices.
pub const DEFAULT_CHUNK_DELAY: Duration = Duration::from_millis(50);

/// Pacing for a raw upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    /// Maximum bytes per write.
    pub chunk_size: usize,
    /// Pause between consecutive writes (not after the last one).
    pub inter_chunk_delay: Duration,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            inter_chunk_delay: DEFAULT_CHUNK_DELAY,
        }
    }
}

impl UploadOptions {
    /// Create options with explicit pacing.
    pub fn new(chunk_size: usize, inter_chunk_delay: Duration) -> Self {
        Self {
            chunk_size,
            inter_chunk_delay,
        }
    }

    /// Default pacing for a device class.
    pub fn for_class(class: DeviceClass) -> Self {
        Self::new(class.default_chunk_size(), class.default_chunk_delay())
    }

    /// Reject options that could never make progress.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidChunkSize);
        }
        Ok(())
    }

    /// Number of slices needed for `len` bytes.
    pub fn chunk_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size.max(1))
    }
}

/// Progress of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Bytes written so far.
    pub transferred: usize,
    /// Payload length.
    pub total: usize,
}

impl Progress {
    /// Completion rounded to the nearest percent.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        let ratio = self.transferred as f64 / self.total as f64;
        (ratio * 100.0).round().clamp(0.0, 100.0) as u8
    }

    /// Whether every byte has been written.
    pub fn is_complete(&self) -> bool {
        self.transferred == self.total
    }
}

/// Summary of a finished upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadReport {
    /// Bytes written.
    pub bytes_sent: usize,
    /// Writes issued.
    pub chunks: usize,
    /// Wall time from first write to completion.
    pub elapsed: Duration,
}

/// Writes a payload in paced slices.
#[derive(Debug, Clone, Default)]
pub struct ChunkedUploader {
    options: UploadOptions,
    cancel: Option<CancelToken>,
}

impl ChunkedUploader {
    /// Create an uploader with the given pacing.
    pub fn new(options: UploadOptions) -> Self {
        Self {
            options,
            cancel: None,
        }
    }

    /// Stop between slices once `token` is cancelled.
    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Pacing in use.
    pub fn options(&self) -> &UploadOptions {
        &self.options
    }

    /// Upload `payload` through the writable side of `handle`.
    ///
    /// `on_progress` runs after every slice with a strictly increasing byte
    /// count that ends at the payload length. An empty payload completes
    /// without any progress events. A failed write aborts the transfer with
    /// [`Error::TransferFailed`]; nothing is retried. The writer lock is
    /// released on every exit path.
    pub fn upload<F>(
        &self,
        handle: &TransportHandle,
        payload: &[u8],
        mut on_progress: F,
    ) -> Result<UploadReport>
    where
        F: FnMut(Progress),
    {
        self.options.validate()?;
        let mut writer = handle.writer()?;

        let total = payload.len();
        let started = Instant::now();
        let mut sent = 0usize;
        let mut chunks = 0usize;
        debug!(
            "Uploading {total} bytes to {} in {} chunk(s)",
            handle.name(),
            self.options.chunk_count(total)
        );

        for chunk in payload.chunks(self.options.chunk_size) {
            if chunks > 0 && !self.options.inter_chunk_delay.is_zero() {
                thread::sleep(self.options.inter_chunk_delay);
            }
            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                debug!("Upload cancelled at {sent}/{total} bytes");
                return Err(Error::Cancelled { sent });
            }

            writer
                .write_all(chunk)
                .and_then(|()| writer.flush())
                .map_err(|source| Error::TransferFailed {
                    sent,
                    total,
                    source,
                })?;

            sent += chunk.len();
            chunks += 1;
            trace!("Chunk {chunks}: {sent}/{total} bytes");
            on_progress(Progress {
                transferred: sent,
                total,
            });
        }

        writer.release();
        Ok(UploadReport {
            bytes_sent: sent,
            chunks,
            elapsed: started.elapsed(),
        })
    }
}
