//! Call-id allocation and the table of in-flight calls.
//!
//! The table lives inside a single task. Registrations and resolutions reach
//! it as commands over one FIFO channel, so a registration that is sent before
//! its frame goes out is always seen before the matching resolution.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, trace};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, RocketError};
use crate::state::Lifecycle;

/// Hands out call ids "1", "2", "3", ... Never reuses one.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        (self.last.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }
}

enum Command<T> {
    Register {
        id: String,
        reply: oneshot::Sender<T>,
    },
    Resolve {
        id: String,
        payload: T,
    },
    Forget {
        id: String,
    },
    Pending {
        reply: oneshot::Sender<usize>,
    },
}

pub struct Registry<T> {
    tx: mpsc::UnboundedSender<Command<T>>,
}

impl<T> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Registry {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> Registry<T> {
    /// Spawns the owning task. It stops when `lifecycle` closes, dropping every
    /// pending delivery channel so their receivers wake with an error.
    pub fn spawn(lifecycle: Lifecycle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, lifecycle));
        Registry { tx }
    }

    pub fn register(&self, id: &str) -> Result<oneshot::Receiver<T>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Register {
                id: id.to_string(),
                reply,
            })
            .map_err(|_| RocketError::Closed)?;
        Ok(rx)
    }

    /// Delivers `payload` to whoever registered `id`. Unknown ids are ignored.
    pub fn resolve(&self, id: &str, payload: T) {
        let _ = self.tx.send(Command::Resolve {
            id: id.to_string(),
            payload,
        });
    }

    /// Drops a registration whose caller stopped waiting.
    pub fn forget(&self, id: &str) {
        let _ = self.tx.send(Command::Forget { id: id.to_string() });
    }

    pub async fn pending(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Pending { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

async fn run<T>(mut rx: mpsc::UnboundedReceiver<Command<T>>, lifecycle: Lifecycle) {
    let mut table: HashMap<String, oneshot::Sender<T>> = HashMap::new();
    let closed = lifecycle.closed();
    tokio::pin!(closed);

    loop {
        let command = tokio::select! {
            () = &mut closed => break,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        match command {
            Command::Register { id, reply } => {
                table.insert(id, reply);
            }
            Command::Resolve { id, payload } => match table.remove(&id) {
                Some(reply) => {
                    let _ = reply.send(payload);
                }
                None => trace!("No pending call for result id {}", id),
            },
            Command::Forget { id } => {
                table.remove(&id);
            }
            Command::Pending { reply } => {
                let _ = reply.send(table.len());
            }
        }
    }
    debug!("Call registry stopped with {} pending calls", table.len());
}
