pub mod aggregator;
pub mod capture;
pub mod chunk;
pub mod device;
pub mod fanout;
pub mod level;
pub mod queue;

// Public API
pub use aggregator::{Window, WindowAggregator};
pub use capture::{CaptureHandle, CaptureStats, CaptureStatsSnapshot};
pub use chunk::{ChannelKey, SampleChunk};
pub use device::{validate_channel, CaptureBackend, CpalBackend, DeviceInfo, StreamRequest};
pub use fanout::ChunkFanout;
pub use level::{chunk_rms, LevelMonitor, LevelReading};
pub use queue::{ChunkReceiver, ChunkSender, PushOutcome, QueueMessage, SampleQueue};
