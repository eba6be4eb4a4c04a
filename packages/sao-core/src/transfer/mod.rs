//! # Transfer Module
//!
//! Moves a described byte range from wherever it lives to a local path.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          TRANSFER FLOW                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  descriptor ──► Transport::execute(ctx, params, dest) ──► TransferHandle│
//! │                                                              │          │
//! │                       ┌──────────────────────────────────────┘          │
//! │                       ▼                                                 │
//! │  transfer_file: drain sub() ──► progress every 10%                     │
//! │                  │  channel closed      → verify size → Ok             │
//! │                  │  event with error    → Err                          │
//! │                  │  ctx done            → Err (Cancelled/Timeout)      │
//! │                  └─ handle.close() on every exit                       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The transport is a strategy. [`HttpTransport`] pulls over HTTP;
//! [`LoopbackTransport`] resolves the same URLs against local directories
//! when producer and consumer share a filesystem.

mod http;
mod loopback;
pub mod types;

use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::context::Context;
use crate::crypto::partial_path;
use crate::error::{Error, Result};
use crate::storage::chunking::remove_quietly;

pub use http::HttpTransport;
pub use loopback::LoopbackTransport;
pub use types::{
    http_descriptor, HttpRequest, TransferDescriptor, TransferStatus, TransportEvent,
    TransportFileInfo, HTTP_KIND,
};

/// Capacity of the progress channel between a transfer task and its handle
pub(crate) const EVENT_CHANNEL_SIZE: usize = 64;

/// A strategy that can execute transfer descriptors of one kind
#[async_trait]
pub trait Transport: Send + Sync {
    /// Descriptor kind this transport understands
    fn kind(&self) -> &str {
        HTTP_KIND
    }

    /// Start pulling `dest.file_size` bytes described by `params` into
    /// `dest.output_file`. Returns as soon as the pull is running.
    async fn execute(
        &self,
        ctx: &Context,
        params: &[u8],
        dest: &TransportFileInfo,
    ) -> Result<TransferHandle>;
}

/// Running transfer
///
/// The event stream ends when the transfer succeeds. An event carrying an
/// error is always the last one.
pub struct TransferHandle {
    events: mpsc::Receiver<TransportEvent>,
    task: Option<JoinHandle<()>>,
    status: TransferStatus,
}

impl TransferHandle {
    /// Wrap the event channel and the task producing it
    pub fn new(events: mpsc::Receiver<TransportEvent>, task: JoinHandle<()>) -> Self {
        Self {
            events,
            task: Some(task),
            status: TransferStatus::Started,
        }
    }

    /// Event subscription
    pub fn sub(&mut self) -> &mut mpsc::Receiver<TransportEvent> {
        &mut self.events
    }

    /// Next event, `None` once the transfer completed
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        let event = self.events.recv().await;
        self.status = match &event {
            None => TransferStatus::Completed,
            Some(e) if e.error.is_some() => TransferStatus::Failed,
            Some(_) => TransferStatus::Ongoing,
        };
        event
    }

    /// Current status as observed through [`TransferHandle::next_event`]
    pub fn status(&self) -> TransferStatus {
        self.status
    }

    /// Stop the transfer. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.events.close();
        if !self.status.is_terminal() {
            self.status = TransferStatus::Failed;
        }
    }
}

impl Drop for TransferHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Run `descriptor` through `transport` into `out` and wait for it
///
/// Fails if the context finishes first, if the transport reports an error,
/// or if the bytes on disk do not match the descriptor size. A failed
/// transfer leaves nothing at `out`.
pub async fn transfer_file(
    ctx: &Context,
    transport: &dyn Transport,
    descriptor: &TransferDescriptor,
    file_id: &str,
    out: &Path,
) -> Result<()> {
    if descriptor.kind != transport.kind() {
        return Err(Error::Transfer(format!(
            "unsupported transfer type {:?}",
            descriptor.kind
        )));
    }
    ctx.check()?;

    tracing::debug!(file_id, out = %out.display(), size = descriptor.size, "Starting transfer");
    let started = Instant::now();

    let dest = TransportFileInfo {
        output_file: out.to_path_buf(),
        file_id: file_id.to_string(),
        file_size: descriptor.size,
    };

    let result = run_transfer(ctx, transport, descriptor, &dest).await;

    match &result {
        Ok(()) => tracing::info!(
            file_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Transfer completed"
        ),
        Err(e) => {
            tracing::warn!(file_id, error = %e, "Transfer failed");
            remove_quietly(out).await;
            remove_quietly(&partial_path(out)).await;
        }
    }
    result
}

async fn run_transfer(
    ctx: &Context,
    transport: &dyn Transport,
    descriptor: &TransferDescriptor,
    dest: &TransportFileInfo,
) -> Result<()> {
    let mut handle = transport.execute(ctx, &descriptor.params, dest).await?;
    let waited = wait_for_transfer_finish(ctx, &mut handle, descriptor.size, &dest.file_id).await;
    handle.close();
    waited?;

    let received = tokio::fs::metadata(&dest.output_file).await?.len();
    if received != descriptor.size {
        return Err(Error::Transfer(format!(
            "received {} bytes, expected {}",
            received, descriptor.size
        )));
    }
    Ok(())
}

async fn wait_for_transfer_finish(
    ctx: &Context,
    handle: &mut TransferHandle,
    size: u64,
    file_id: &str,
) -> Result<()> {
    let mut progress = ProgressLog::new(size);
    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                None => return Ok(()),
                Some(TransportEvent { error: Some(error), .. }) => return Err(error),
                Some(event) => {
                    progress.record(file_id, event.bytes_received);
                }
            },
            _ = ctx.done() => {
                return Err(ctx.err().unwrap_or(Error::Cancelled));
            }
        }
    }
}

/// Emits one log line each time progress crosses a 10% step
struct ProgressLog {
    size: u64,
    last_step: u64,
}

impl ProgressLog {
    fn new(size: u64) -> Self {
        Self { size, last_step: 0 }
    }

    /// Returns the step logged, if any
    fn record(&mut self, file_id: &str, received: u64) -> Option<u64> {
        if self.size == 0 {
            return None;
        }
        let percent = received.saturating_mul(100) / self.size;
        let step = percent / 10;
        if step == self.last_step {
            return None;
        }
        self.last_step = step;
        tracing::info!(
            file_id,
            bytes_received = received,
            file_size = self.size,
            percent_complete = percent,
            "Transfer progress"
        );
        Some(step)
    }
}
