use std::sync::Arc;
use storyteller_common::frame::Frame;
use tokio::sync::watch;

/// Single-slot holder of the latest AI frame.
///
/// Backed by a `watch` channel: a publish replaces the slot atomically and a
/// read clones the `Arc` under the channel's lock, so readers observe either
/// the sentinel or a complete frame. The slot is seeded at construction and
/// can never be emptied.
#[derive(Clone)]
pub struct AiFrameCache {
    tx: Arc<watch::Sender<Arc<Frame>>>,
}

impl AiFrameCache {
    pub fn new(sentinel: Frame) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(sentinel));
        Self { tx: Arc::new(tx) }
    }

    /// Replace the cached frame; never blocks on readers.
    pub fn publish(&self, frame: Arc<Frame>) {
        self.tx.send_replace(frame);
    }

    pub fn latest(&self) -> Arc<Frame> {
        Arc::clone(&self.tx.borrow())
    }

    /// Receiver notified on every publish.
    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<Arc<Frame>> {
        self.tx.subscribe()
    }
}
