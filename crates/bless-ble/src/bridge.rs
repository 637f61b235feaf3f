//! Native event bridge
//!
//! Native stacks call back on threads they own: a CoreBluetooth dispatch
//! queue, the WinRT thread pool, a D-Bus connection task. Those callbacks only
//! convert their arguments into an owned event and push it into an
//! [`EventSink`]. One pump task per backend drains the queue in order, so all
//! event-driven state is mutated from a single place.

use bless_core::{BackendError, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Thread-safe, non-blocking producer side of a backend's event queue
#[derive(Debug)]
pub struct EventSink<E> {
    tx: mpsc::UnboundedSender<E>,
    backend: &'static str,
}

impl<E> Clone for EventSink<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            backend: self.backend,
        }
    }
}

impl<E: Send + 'static> EventSink<E> {
    /// Create a sink and the receiver its pump will drain
    pub fn channel(backend: &'static str) -> (Self, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, backend }, rx)
    }

    /// Enqueue an event; returns false if the pump has shut down
    ///
    /// A rejected event is dropped here, which runs its destructor on the
    /// calling thread. Events owning a deferral complete it that way.
    pub fn push(&self, event: E) -> bool {
        if self.tx.send(event).is_err() {
            warn!(backend = self.backend, "Event pump has shut down; event dropped");
            false
        } else {
            true
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the single pump task for a backend on the current runtime
pub fn spawn_pump<E, H>(
    backend: &'static str,
    mut rx: mpsc::UnboundedReceiver<E>,
    mut handler: H,
) -> Result<JoinHandle<()>>
where
    E: Send + 'static,
    H: FnMut(E) + Send + 'static,
{
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|e| BackendError::native("spawn event pump", e))?;
    Ok(runtime.spawn(async move {
        while let Some(event) = rx.recv().await {
            handler(event);
        }
        debug!(backend, "Event pump finished");
    }))
}
