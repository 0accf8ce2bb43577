//! Shutdown coordination
//!
//! [`ShutdownSet`] tracks every live listener and bridge in the process.
//! Listeners watch the drain flag to know when to close their endpoint;
//! bridges are never cancelled, the coordinator just waits for them.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

/// Process-wide set of active listeners and bridges
#[derive(Clone)]
pub struct ShutdownSet {
    inner: Arc<Inner>,
}

struct Inner {
    listeners: AtomicUsize,
    bridges: AtomicUsize,
    next_circuit: AtomicU64,
    idle: Notify,
    draining: watch::Sender<bool>,
}

impl Default for ShutdownSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSet {
    pub fn new() -> Self {
        let (draining, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                listeners: AtomicUsize::new(0),
                bridges: AtomicUsize::new(0),
                next_circuit: AtomicU64::new(1),
                idle: Notify::new(),
                draining,
            }),
        }
    }

    /// Register a listener; it stays in the set until the guard is dropped
    pub fn register_listener(&self) -> ListenerGuard {
        self.inner.listeners.fetch_add(1, Ordering::AcqRel);
        ListenerGuard {
            inner: self.inner.clone(),
        }
    }

    /// Register a bridge; it stays in the set until the guard is dropped
    pub fn register_bridge(&self) -> BridgeGuard {
        self.inner.bridges.fetch_add(1, Ordering::AcqRel);
        BridgeGuard {
            inner: self.inner.clone(),
        }
    }

    /// Spawn one circuit task, registered as a bridge for its whole lifetime.
    ///
    /// The guard moves into the task, so a panicking circuit still leaves
    /// the set when the task unwinds.
    pub fn spawn<F>(&self, circuit: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.register_bridge();
        tokio::spawn(async move {
            let _guard = guard;
            circuit.await;
        });
    }

    /// Allocate an id for log correlation
    pub fn next_circuit_id(&self) -> u64 {
        self.inner.next_circuit.fetch_add(1, Ordering::Relaxed)
    }

    /// Enter draining: every accept loop closes its endpoint and exits
    pub fn begin_drain(&self) {
        let changed = self.inner.draining.send_if_modified(|draining| {
            if *draining {
                false
            } else {
                *draining = true;
                true
            }
        });
        if changed {
            info!(
                listeners = self.active_listeners(),
                bridges = self.active_bridges(),
                "Draining: no new connections will be accepted"
            );
        }
    }

    pub fn is_draining(&self) -> bool {
        *self.inner.draining.borrow()
    }

    /// Resolves once draining has begun
    pub async fn drain_started(&self) {
        let mut rx = self.inner.draining.subscribe();
        // The sender lives in `inner`, which we hold, so this cannot fail
        let _ = rx.wait_for(|draining| *draining).await;
    }

    pub fn active_listeners(&self) -> usize {
        self.inner.listeners.load(Ordering::Acquire)
    }

    pub fn active_bridges(&self) -> usize {
        self.inner.bridges.load(Ordering::Acquire)
    }

    fn is_idle(&self) -> bool {
        self.active_listeners() == 0 && self.active_bridges() == 0
    }

    /// Wait until every listener has closed and every bridge has finished
    pub async fn await_drain(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent guard drop cannot be missed
            notified.as_mut().enable();
            if self.is_idle() {
                debug!("Shutdown set drained");
                return;
            }
            notified.await;
        }
    }
}

/// Membership of one listener in a [`ShutdownSet`]
pub struct ListenerGuard {
    inner: Arc<Inner>,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.inner.listeners.fetch_sub(1, Ordering::AcqRel);
        self.inner.idle.notify_waiters();
    }
}

/// Membership of one bridge in a [`ShutdownSet`]
pub struct BridgeGuard {
    inner: Arc<Inner>,
}

impl Drop for BridgeGuard {
    fn drop(&mut self) {
        self.inner.bridges.fetch_sub(1, Ordering::AcqRel);
        self.inner.idle.notify_waiters();
    }
}

/// What ended the wait in [`wait_for_signal`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    Interrupt,
    Terminate,
    StdinClosed,
}

/// Resolves once stdin reaches end of file.
///
/// Tor closes our stdin when it wants the transport gone. The read runs on a
/// detached OS thread so a pending read never holds up runtime shutdown.
#[derive(Clone)]
pub struct StdinWatch {
    closed: watch::Receiver<bool>,
}

impl StdinWatch {
    pub fn spawn() -> Self {
        let (tx, closed) = watch::channel(false);
        std::thread::spawn(move || {
            let _ = std::io::copy(&mut std::io::stdin().lock(), &mut std::io::sink());
            let _ = tx.send(true);
        });
        Self { closed }
    }

    async fn wait(&self) {
        let mut closed = self.closed.clone();
        // A vanished sender means the watcher thread is gone, same as closed
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

/// Wait for SIGINT, SIGTERM or, when a watch is given, end of stdin
pub async fn wait_for_signal(stdin: Option<&StdinWatch>) -> anyhow::Result<ShutdownCause> {
    let stdin_closed = async {
        match stdin {
            Some(watch) => watch.wait().await,
            None => std::future::pending::<()>().await,
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                Ok(ShutdownCause::Interrupt)
            }
            _ = terminate.recv() => Ok(ShutdownCause::Terminate),
            _ = stdin_closed => Ok(ShutdownCause::StdinClosed),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                Ok(ShutdownCause::Interrupt)
            }
            _ = stdin_closed => Ok(ShutdownCause::StdinClosed),
        }
    }
}

/// Drain every endpoint and wait for in-flight bridges.
///
/// A second signal during the wait ends it early so the process can exit.
/// Pass no stdin watch if stdin closing was the first signal.
pub async fn drain(shutdown: &ShutdownSet, stdin: Option<&StdinWatch>) {
    shutdown.begin_drain();
    tokio::select! {
        _ = shutdown.await_drain() => {
            info!("All bridges finished");
        }
        cause = wait_for_signal(stdin) => {
            warn!(
                ?cause,
                bridges = shutdown.active_bridges(),
                "Second shutdown signal, exiting without waiting for remaining bridges"
            );
        }
    }
}
