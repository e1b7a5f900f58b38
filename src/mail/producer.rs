use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::CaptureMode;
use crate::error::{BackupError, Result};
use crate::mail::{RawMessage, SequenceRange, SessionClient};

#[derive(Clone, Copy, Debug)]
pub struct FetchOptions {
    pub capture: CaptureMode,
    pub channel_capacity: usize,
    pub batch_size: u32,
}

/// Messages published by the background fetch task, in server delivery order.
pub struct MessageStream<S> {
    rx: mpsc::Receiver<Result<RawMessage>>,
    handle: JoinHandle<S>,
    cancel: Arc<AtomicBool>,
}

/// Moves `session` onto a blocking task that fetches `range` batch by batch.
///
/// A failed fetch is delivered as the last item of the stream. Dropping the
/// receiver (or calling `cancel`) stops the task before its next batch.
pub fn spawn<S: SessionClient + 'static>(mut session: S, range: SequenceRange, opts: FetchOptions) -> MessageStream<S> {
    let (tx, rx) = mpsc::channel(opts.channel_capacity.max(1));
    let cancel = Arc::new(AtomicBool::new(false));
    let stop = cancel.clone();

    let handle = tokio::task::spawn_blocking(move || {
        'batches: for batch in range.batches(opts.batch_size) {
            if stop.load(Ordering::Relaxed) {
                tracing::debug!("fetch cancelled before {}", batch.to_sequence_set());
                break;
            }

            tracing::debug!(set = %batch.to_sequence_set(), "fetching");
            match session.fetch(batch, opts.capture) {
                Ok(messages) => {
                    for m in messages {
                        if tx.blocking_send(Ok(m)).is_err() {
                            break 'batches;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("fetch of {} failed: {e}", batch.to_sequence_set());
                    let _ = tx.blocking_send(Err(e));
                    break;
                }
            }
        }
        session
    });

    MessageStream { rx, handle, cancel }
}

impl<S: Send + 'static> MessageStream<S> {
    /// Next message, `None` once the fetch task is done.
    pub async fn next(&mut self, timeout: Option<Duration>) -> Option<Result<RawMessage>> {
        match timeout {
            None => self.rx.recv().await,
            Some(after) => match tokio::time::timeout(after, self.rx.recv()).await {
                Ok(item) => item,
                Err(_) => Some(Err(BackupError::Timeout {
                    what: "waiting for the next message",
                    after,
                })),
            },
        }
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Stops consuming and hands the session back once the fetch task exits.
    ///
    /// A fetch still blocked on the server after `grace` is abandoned along
    /// with its session, which is then `None`.
    pub async fn close(self, grace: Duration) -> Result<Option<S>> {
        self.cancel();
        let MessageStream { rx, handle, .. } = self;
        drop(rx);
        match tokio::time::timeout(grace, handle).await {
            Ok(joined) => joined
                .map(Some)
                .map_err(|e| BackupError::Fetch(format!("fetch task failed: {e}"))),
            Err(_) => {
                tracing::warn!("fetch still running after {grace:?}, abandoning the session without logout");
                Ok(None)
            }
        }
    }
}

/// Releases messages in ascending sequence order, holding early arrivals back.
///
/// At most `limit` messages are held. Past that the missing sequence numbers
/// are given up on and the held run is released; a straggler from a skipped
/// gap is passed through as soon as it shows up.
pub struct Reorder {
    next: u32,
    end: u32,
    limit: usize,
    held: BTreeMap<u32, RawMessage>,
}

impl Reorder {
    pub fn new(range: SequenceRange, limit: usize) -> Self {
        Self {
            next: range.start,
            end: range.end,
            limit: limit.max(1),
            held: BTreeMap::new(),
        }
    }

    /// Accepts one message and returns every message now ready, in order.
    pub fn push(&mut self, m: RawMessage) -> Vec<RawMessage> {
        if m.seq < self.next {
            tracing::warn!(seq = m.seq, "message arrived after its gap was skipped");
            return vec![m];
        }

        self.held.insert(m.seq, m);
        let mut ready = self.release();

        if self.held.len() > self.limit {
            if let Some(&first) = self.held.keys().next() {
                tracing::warn!(missing = %format!("{}:{}", self.next, first - 1), "sequence gap, moving on");
                self.next = first;
                ready.extend(self.release());
            }
        }
        ready
    }

    fn release(&mut self) -> Vec<RawMessage> {
        let mut ready = Vec::new();
        while let Some(m) = self.held.remove(&self.next) {
            ready.push(m);
            if self.next == self.end {
                break;
            }
            self.next += 1;
        }
        ready
    }

    /// Whatever is still held at end of stream (gaps left by expunged messages).
    pub fn drain(&mut self) -> Vec<RawMessage> {
        std::mem::take(&mut self.held).into_values().collect()
    }

    pub fn held(&self) -> usize {
        self.held.len()
    }
}
