//! Live worker connections on the coordinator
//!
//! The registry runs an accept loop independent of any round. Rounds never see
//! the live list: they work on the snapshot returned by `current_handles()`,
//! so workers joining mid-round are only included in the next round.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// Registry-assigned worker identifier, unique per coordinator process
pub type HandleId = u64;

/// An accepted worker connection
///
/// Clones share the same stream. Within a round each handle is driven by
/// exactly one dispatch task, which holds the stream lock for the whole
/// exchange.
#[derive(Clone)]
pub struct WorkerHandle {
    id: HandleId,
    addr: SocketAddr,
    stream: Arc<tokio::sync::Mutex<TcpStream>>,
}

impl WorkerHandle {
    pub fn new(id: HandleId, addr: SocketAddr, stream: TcpStream) -> Self {
        Self {
            id,
            addr,
            stream: Arc::new(tokio::sync::Mutex::new(stream)),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Exclusive access to the stream
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, TcpStream> {
        self.stream.lock().await
    }

    /// Check an idle connection for a peer close
    ///
    /// Workers never send unsolicited bytes, so readable data between rounds
    /// also marks the connection as unusable. A stream locked by a dispatch
    /// task is reported as open.
    fn is_closed(&self) -> bool {
        let Ok(stream) = self.stream.try_lock() else {
            return false;
        };
        let mut probe = [0u8; 1];
        match stream.try_read(&mut probe) {
            Ok(0) => true,
            Ok(_) => {
                warn!("Worker {} sent data outside a task; dropping it", self.addr);
                true
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(_) => true,
        }
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish()
    }
}

/// Connection lifecycle notifications for display layers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Connected { id: HandleId, addr: SocketAddr },
    Removed { id: HandleId, addr: SocketAddr },
}

struct Inner {
    handles: Mutex<Vec<WorkerHandle>>,
    next_id: AtomicU64,
    observer: Option<UnboundedSender<RegistryEvent>>,
}

impl Inner {
    fn handles(&self) -> MutexGuard<'_, Vec<WorkerHandle>> {
        // A poisoned list is still a valid list of handles
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, event: RegistryEvent) {
        if let Some(ref observer) = self.observer {
            // Observer going away must not affect the protocol
            let _ = observer.send(event);
        }
    }

    fn register(&self, stream: TcpStream, addr: SocketAddr) -> WorkerHandle {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = WorkerHandle::new(id, addr, stream);
        self.handles().push(handle.clone());
        self.notify(RegistryEvent::Connected { id, addr });
        handle
    }
}

/// Coordinator-side registry of live worker connections
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a registry that reports connects and removals on `observer`
    pub fn with_observer(observer: UnboundedSender<RegistryEvent>) -> Self {
        Self::build(Some(observer))
    }

    fn build(observer: Option<UnboundedSender<RegistryEvent>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                handles: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                observer,
            }),
            accept_task: Mutex::new(None),
        }
    }

    /// Bind `bind` and start accepting workers in the background
    ///
    /// Returns the bound address (useful with port 0).
    pub async fn start<A: ToSocketAddrs + fmt::Debug>(&self, bind: A) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("Failed to bind task listener on {:?}", bind))?;
        let local = listener.local_addr()?;
        info!("Coordinator listening on {}", local);

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let handle = inner.register(stream, addr);
                        info!("Worker {} connected from {}", handle.id(), addr);
                    }
                    Err(e) => {
                        // Per-connection accept failures (e.g. EMFILE) are transient
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        });

        let mut slot = self.accept_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
        Ok(local)
    }

    /// Whether the accept loop is running
    pub fn is_running(&self) -> bool {
        self.accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Drop closed connections, then return a snapshot of the rest
    pub fn current_handles(&self) -> Vec<WorkerHandle> {
        self.prune_closed();
        self.inner.handles().clone()
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.prune_closed();
        self.inner.handles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove one handle; its connection closes once no round holds it
    pub fn remove(&self, id: HandleId) -> Option<WorkerHandle> {
        let removed = {
            let mut handles = self.inner.handles();
            let pos = handles.iter().position(|h| h.id() == id)?;
            handles.remove(pos)
        };
        info!("Worker {} ({}) removed", removed.id(), removed.addr());
        self.inner.notify(RegistryEvent::Removed {
            id: removed.id(),
            addr: removed.addr(),
        });
        Some(removed)
    }

    /// Stop accepting and drop every connection the registry holds
    ///
    /// A stream closes once the last clone of its handle is gone, so callers
    /// abort in-flight dispatch first.
    pub fn close_all(&self) {
        if let Some(task) = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }

        let drained: Vec<WorkerHandle> = self.inner.handles().drain(..).collect();
        for handle in drained {
            debug!("Closing worker {} ({})", handle.id(), handle.addr());
            self.inner.notify(RegistryEvent::Removed {
                id: handle.id(),
                addr: handle.addr(),
            });
        }
    }

    fn prune_closed(&self) {
        let closed: Vec<WorkerHandle> = {
            let mut handles = self.inner.handles();
            let (closed, open): (Vec<_>, Vec<_>) = handles.drain(..).partition(WorkerHandle::is_closed);
            *handles = open;
            closed
        };
        for handle in closed {
            info!("Worker {} ({}) disconnected", handle.id(), handle.addr());
            self.inner.notify(RegistryEvent::Removed {
                id: handle.id(),
                addr: handle.addr(),
            });
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        if let Some(task) = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}
