use crate::error::PipelineError;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use std::sync::Arc;

/// Per-channel lifecycle. `Starting` falls back to `Stopped` when the stream
/// cannot open or the channel index fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLifecycle {
    Stopped,
    Starting,
    Running,
    Stopping,
}

pub struct LifecycleCell {
    state: Arc<RwLock<ChannelLifecycle>>,
    state_tx: Sender<ChannelLifecycle>,
    state_rx: Receiver<ChannelLifecycle>,
}

impl Default for LifecycleCell {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleCell {
    pub fn new() -> Self {
        let (state_tx, state_rx) = crossbeam_channel::unbounded();
        Self {
            state: Arc::new(RwLock::new(ChannelLifecycle::Stopped)),
            state_tx,
            state_rx,
        }
    }

    pub fn transition(&self, new_state: ChannelLifecycle) -> Result<(), PipelineError> {
        let mut current = self.state.write();

        let valid = matches!(
            (&*current, &new_state),
            (ChannelLifecycle::Stopped, ChannelLifecycle::Starting)
                | (ChannelLifecycle::Starting, ChannelLifecycle::Running)
                | (ChannelLifecycle::Starting, ChannelLifecycle::Stopped)
                | (ChannelLifecycle::Running, ChannelLifecycle::Stopping)
                | (ChannelLifecycle::Stopping, ChannelLifecycle::Stopped)
        );

        if !valid {
            return Err(PipelineError::InvalidTransition {
                from: *current,
                to: new_state,
            });
        }

        tracing::debug!("Lifecycle transition: {:?} -> {:?}", *current, new_state);
        *current = new_state;
        let _ = self.state_tx.send(new_state);
        Ok(())
    }

    pub fn current(&self) -> ChannelLifecycle {
        *self.state.read()
    }

    pub fn subscribe(&self) -> Receiver<ChannelLifecycle> {
        self.state_rx.clone()
    }
}
