use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, TrySendError};

use crate::chunk::SampleChunk;

/// In-band message on a consumer queue. The sentinel follows the last chunk
/// so consumers never have to infer shutdown from an empty queue.
#[derive(Debug, Clone)]
pub enum QueueMessage {
    Chunk(SampleChunk),
    EndOfStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// Queue at capacity; the incoming chunk was discarded for this consumer.
    DroppedFull,
    /// Receiver gone; the sender should be pruned.
    Disconnected,
}

/// Bounded single-producer chunk queue. Each consumer owns exactly one.
pub struct SampleQueue;

impl SampleQueue {
    pub fn bounded(label: &str, capacity: usize) -> (ChunkSender, ChunkReceiver) {
        let (tx, rx) = bounded(capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        (
            ChunkSender {
                label: Arc::from(label),
                tx,
                dropped: Arc::clone(&dropped),
            },
            ChunkReceiver { rx, dropped },
        )
    }
}

/// Producer side. `push` never blocks; a full queue loses the newest chunk.
#[derive(Clone)]
pub struct ChunkSender {
    label: Arc<str>,
    tx: crossbeam_channel::Sender<QueueMessage>,
    dropped: Arc<AtomicU64>,
}

impl ChunkSender {
    pub fn push(&self, chunk: SampleChunk) -> PushOutcome {
        match self.tx.try_send(QueueMessage::Chunk(chunk)) {
            Ok(()) => PushOutcome::Delivered,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 100 == 0 {
                    tracing::warn!(
                        queue = %self.label,
                        dropped,
                        "consumer queue full, dropping chunk"
                    );
                }
                PushOutcome::DroppedFull
            }
            Err(TrySendError::Disconnected(_)) => PushOutcome::Disconnected,
        }
    }

    /// Delivers the end-of-stream sentinel, waiting up to `timeout` for a
    /// free slot. The producer must already be halted when this is called.
    pub fn finish(&self, timeout: Duration) -> bool {
        match self.tx.send_timeout(QueueMessage::EndOfStream, timeout) {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) => {
                tracing::warn!(queue = %self.label, "end-of-stream marker not delivered in {:?}", timeout);
                false
            }
            Err(SendTimeoutError::Disconnected(_)) => false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Consumer side. Held by exactly one worker, which polls with a short
/// timeout and re-checks its cancel flag on every wake.
pub struct ChunkReceiver {
    rx: Receiver<QueueMessage>,
    dropped: Arc<AtomicU64>,
}

impl ChunkReceiver {
    pub fn recv_timeout(&self, timeout: Duration) -> Result<QueueMessage, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Option<QueueMessage> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Chunks the producer discarded because this queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
