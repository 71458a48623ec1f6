//! Streaming response decoding.
//!
//! Three daemon endpoints stream indefinitely: `/events` and
//! `/containers/{id}/stats` emit newline-delimited JSON, and
//! `/containers/{id}/logs` emits multiplexed frames with an 8-byte header
//! (stream id, 3 bytes padding, big-endian payload length). The decoders
//! here are incremental byte feeders, so frames split across chunk
//! boundaries reassemble correctly, and the pump driving them races every
//! read against a cancellation token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tracing::warn;

/// Cooperative cancellation handle shared between a caller and its
/// in-flight streams and tasklets.
///
/// Cancelling is idempotent; clones observe the same flag.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token. Safe to call any number of times.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve when the token fires. Resolves immediately when it already
    /// has.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Which daemon stream a log frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    fn from_byte(b: u8) -> Self {
        match b {
            0 => StreamKind::Stdin,
            2 => StreamKind::Stderr,
            _ => StreamKind::Stdout,
        }
    }
}

/// One decoded log frame.
#[derive(Debug, Clone)]
pub struct ProcessEvent {
    pub stream: StreamKind,
    pub data: Vec<u8>,
}

impl ProcessEvent {
    pub fn message(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Incremental decoder for newline-delimited JSON streams.
///
/// Lines that fail to parse are logged and skipped; a single garbage line
/// from the daemon must not end an event subscription.
pub struct JsonLineDecoder<T> {
    buffer: Vec<u8>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: DeserializeOwned> JsonLineDecoder<T> {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Feed a chunk; returns every complete object it finished.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<T> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice(line) {
                Ok(value) => out.push(value),
                Err(e) => warn!("Skipping undecodable stream line: {}", e),
            }
        }
        out
    }

    /// Flush a trailing object without a final newline.
    pub fn finish(&mut self) -> Option<T> {
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        let res = serde_json::from_slice(&self.buffer).ok();
        self.buffer.clear();
        res
    }
}

impl<T: DeserializeOwned> Default for JsonLineDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

const FRAME_HEADER_LEN: usize = 8;

/// Incremental decoder for the multiplexed log framing.
pub struct LogFrameDecoder {
    buffer: Vec<u8>,
}

impl LogFrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ProcessEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        loop {
            if self.buffer.len() < FRAME_HEADER_LEN {
                break;
            }
            let size = u32::from_be_bytes([
                self.buffer[4],
                self.buffer[5],
                self.buffer[6],
                self.buffer[7],
            ]) as usize;
            if self.buffer.len() < FRAME_HEADER_LEN + size {
                break;
            }
            let stream = StreamKind::from_byte(self.buffer[0]);
            let data = self.buffer[FRAME_HEADER_LEN..FRAME_HEADER_LEN + size].to_vec();
            self.buffer.drain(..FRAME_HEADER_LEN + size);
            out.push(ProcessEvent { stream, data });
        }
        out
    }
}

impl Default for LogFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
