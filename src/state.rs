use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Active,
    Closed,
}

/// Shared view of the connection state. Moving to `Closed` is the quit signal:
/// it is terminal and wakes everything parked in [`Lifecycle::closed`].
#[derive(Clone, Debug)]
pub struct Lifecycle {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Connecting);
        Lifecycle { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Moves to `next` unless the connection is already closed.
    pub fn advance(&self, next: ConnectionState) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            log::debug!("Connection state is now {:?}", next);
        }
    }

    pub fn close(&self) {
        self.advance(ConnectionState::Closed);
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
