use std::time::Duration;

use parking_lot::Mutex;

use crate::chunk::SampleChunk;
use crate::queue::{ChunkSender, PushOutcome};

/// Delivers each chunk to every registered consumer queue. `publish` runs on
/// the hardware callback, so the registration lock is held only for the
/// duration of the fan-out iteration and never across a blocking operation.
#[derive(Default)]
pub struct ChunkFanout {
    consumers: Mutex<Vec<ChunkSender>>,
}

impl ChunkFanout {
    pub fn new() -> Self {
        Self {
            consumers: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, sender: ChunkSender) {
        let mut consumers = self.consumers.lock();
        tracing::debug!(queue = sender.label(), "consumer registered");
        consumers.push(sender);
    }

    /// Pushes the chunk to every consumer. A full queue loses the chunk for
    /// that consumer only; a disconnected one is pruned. Returns how many
    /// consumers received the chunk.
    pub fn publish(&self, chunk: &SampleChunk) -> usize {
        let mut consumers = self.consumers.lock();
        let mut delivered = 0;
        consumers.retain(|sender| match sender.push(chunk.clone()) {
            PushOutcome::Delivered => {
                delivered += 1;
                true
            }
            PushOutcome::DroppedFull => true,
            PushOutcome::Disconnected => {
                tracing::debug!(queue = sender.label(), "consumer gone, pruning");
                false
            }
        });
        delivered
    }

    /// Sends the end-of-stream sentinel to every consumer. Returns the number
    /// of queues that accepted it within `timeout`. The capture must already
    /// be halted so the sentinel lands after the final chunk.
    pub fn finish(&self, timeout: Duration) -> usize {
        // Clone the set out so the registration lock is not held while the
        // sentinel send waits for queue space.
        let consumers: Vec<ChunkSender> = self.consumers.lock().clone();
        consumers
            .iter()
            .filter(|sender| sender.finish(timeout))
            .count()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    /// Total chunks lost to full queues across the registered consumers.
    pub fn dropped_total(&self) -> u64 {
        self.consumers.lock().iter().map(|s| s.dropped()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueueMessage, SampleQueue};
    use std::time::Instant;

    fn chunk() -> SampleChunk {
        SampleChunk::new(vec![0.2; 16], Instant::now(), 16_000)
    }

    #[test]
    fn every_consumer_sees_every_chunk() {
        let fanout = ChunkFanout::new();
        let (tx_a, rx_a) = SampleQueue::bounded("a", 8);
        let (tx_b, rx_b) = SampleQueue::bounded("b", 8);
        fanout.register(tx_a);
        fanout.register(tx_b);

        for _ in 0..3 {
            assert_eq!(fanout.publish(&chunk()), 2);
        }
        assert_eq!(rx_a.len(), 3);
        assert_eq!(rx_b.len(), 3);
    }

    #[test]
    fn full_consumer_drops_alone() {
        let fanout = ChunkFanout::new();
        let (tx_small, rx_small) = SampleQueue::bounded("small", 1);
        let (tx_big, rx_big) = SampleQueue::bounded("big", 8);
        fanout.register(tx_small);
        fanout.register(tx_big);

        fanout.publish(&chunk());
        // Second chunk overflows the small queue only
        assert_eq!(fanout.publish(&chunk()), 1);

        assert_eq!(rx_small.len(), 1);
        assert_eq!(rx_big.len(), 2);
        assert_eq!(rx_small.dropped(), 1);
        assert_eq!(rx_big.dropped(), 0);
        assert_eq!(fanout.dropped_total(), 1);
    }

    #[test]
    fn disconnected_consumer_is_pruned() {
        let fanout = ChunkFanout::new();
        let (tx, rx) = SampleQueue::bounded("gone", 2);
        fanout.register(tx);
        drop(rx);

        assert_eq!(fanout.publish(&chunk()), 0);
        assert_eq!(fanout.consumer_count(), 0);
    }

    #[test]
    fn finish_reaches_all_registered_queues() {
        let fanout = ChunkFanout::new();
        let (tx_a, rx_a) = SampleQueue::bounded("a", 4);
        let (tx_b, rx_b) = SampleQueue::bounded("b", 4);
        fanout.register(tx_a);
        fanout.register(tx_b);
        fanout.publish(&chunk());

        assert_eq!(fanout.finish(Duration::from_millis(10)), 2);

        for rx in [rx_a, rx_b] {
            assert!(matches!(
                rx.recv_timeout(Duration::from_millis(10)).unwrap(),
                QueueMessage::Chunk(_)
            ));
            assert!(matches!(
                rx.recv_timeout(Duration::from_millis(10)).unwrap(),
                QueueMessage::EndOfStream
            ));
        }
    }
}
