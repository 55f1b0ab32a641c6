use std::sync::Arc;

use ln_types::Block;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

const MUX_CAPACITY: usize = 64;

/// Node-wide events shared by the sync manager and the miner.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A locally sealed block was written to the chain.
    NewMinedBlock(Block),
    /// The downloader began synchronising with a peer.
    StartSync,
    /// Synchronisation finished successfully.
    DoneSync,
    /// Synchronisation was aborted.
    FailedSync(String),
}

/// Broadcast event bus.  Once stopped, posting is a no-op and every
/// subscriber observes a closed channel.
#[derive(Clone)]
pub struct EventMux {
    sender: Arc<Mutex<Option<broadcast::Sender<NodeEvent>>>>,
}

impl EventMux {
    pub fn new() -> Self {
        Self {
            sender: Arc::new(Mutex::new(Some(broadcast::channel(MUX_CAPACITY).0))),
        }
    }

    /// Deliver `event` to current subscribers.  Returns false once stopped.
    pub fn post(&self, event: NodeEvent) -> bool {
        match self.sender.lock().as_ref() {
            Some(sender) => {
                let _ = sender.send(event);
                true
            }
            None => false,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub fn stop(&self) {
        if self.sender.lock().take().is_some() {
            debug!("Event mux stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl Default for EventMux {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn stop_closes_subscribers() {
        let mux = EventMux::new();
        let mut sub = mux.subscribe();
        assert!(mux.post(NodeEvent::StartSync));
        assert!(matches!(sub.recv().await, Ok(NodeEvent::StartSync)));

        mux.stop();
        mux.stop();
        assert!(!mux.post(NodeEvent::DoneSync));
        assert!(matches!(sub.recv().await, Err(RecvError::Closed)));
        assert!(matches!(mux.subscribe().recv().await, Err(RecvError::Closed)));
    }
}
