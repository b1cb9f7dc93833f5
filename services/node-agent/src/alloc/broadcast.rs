//! Multi-subscriber fan-out of allocation snapshots.
//!
//! Every subscriber gets its own bounded queue; a slow subscriber loses the
//! oldest snapshots, never the newest. That keeps the terminal snapshot the
//! last value any subscriber observes.

use std::sync::Mutex;

use skiff_model::Allocation;
use tokio::sync::broadcast;

/// Queue depth per subscriber.
const LISTENER_BUFFER: usize = 8;

/// Fan-out of allocation snapshots to any number of listeners.
pub struct AllocBroadcaster {
    // Taken on close; a closed broadcaster rejects further sends.
    sender: Mutex<Option<broadcast::Sender<Allocation>>>,
}

impl AllocBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LISTENER_BUFFER);
        Self {
            sender: Mutex::new(Some(tx)),
        }
    }

    /// Broadcast a snapshot. Returns false once the broadcaster is closed.
    /// Each listener receives its own copy; a snapshot is dropped for a
    /// listener only when that listener's queue overflows.
    pub fn send(&self, alloc: Allocation) -> bool {
        let sender = self.sender.lock().unwrap();
        match sender.as_ref() {
            // Err means no active listeners, which is fine.
            Some(tx) => {
                let _ = tx.send(alloc);
                true
            }
            None => false,
        }
    }

    /// Subscribe to snapshots. A listener created after `close` observes an
    /// immediately-ended stream.
    pub fn listen(&self) -> AllocListener {
        let sender = self.sender.lock().unwrap();
        let rx = match sender.as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                // Dropping the sender ends the subscription right away.
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        };
        AllocListener { rx }
    }

    /// Close the broadcaster: unblock all listeners and reject further
    /// sends.
    pub fn close(&self) {
        self.sender.lock().unwrap().take();
    }
}

impl Default for AllocBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscription to allocation snapshots.
pub struct AllocListener {
    rx: broadcast::Receiver<Allocation>,
}

impl AllocListener {
    /// Receive the next snapshot, or `None` once the broadcaster closes.
    /// Snapshots lost to queue overflow are skipped silently.
    pub async fn recv(&mut self) -> Option<Allocation> {
        loop {
            match self.rx.recv().await {
                Ok(alloc) => return Some(alloc),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
