//! Accept loop for one listen endpoint
//!
//! Each configured endpoint gets one loop moving through
//! `Listening -> Draining -> Closed`. While listening it hands every
//! accepted item to the circuit handler, spawned through the
//! [`ShutdownSet`]. When draining begins it closes its endpoint and stops;
//! circuits it already spawned run to completion on their own.

use crate::shutdown::{ListenerGuard, ShutdownSet};
use crate::transport::{AcceptError, Acceptor};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// One configured bind address and the transport method it serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenEndpoint {
    pub method: String,
    pub address: SocketAddr,
}

impl fmt::Display for ListenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.method, self.address)
    }
}

/// Lifecycle of one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Listening,
    Draining,
    Closed,
}

/// Run the accept loop for `acceptor` until it is closed.
///
/// Returns the number of circuits spawned. `listener` must come from
/// `shutdown` and be registered before the loop is spawned, so that a drain
/// starting in between still waits for this endpoint. It is released when
/// the loop ends.
pub async fn run_accept_loop<A, F, Fut>(
    mut acceptor: A,
    endpoint: ListenEndpoint,
    shutdown: ShutdownSet,
    listener: ListenerGuard,
    handler: F,
) -> u64
where
    A: Acceptor,
    F: Fn(A::Item) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let _listener = listener;
    let mut state = EndpointState::Listening;
    let mut spawned = 0u64;
    info!("Accepting {} connections", endpoint);

    loop {
        state = match state {
            EndpointState::Listening => {
                let accepted = tokio::select! {
                    biased;
                    _ = shutdown.drain_started() => None,
                    result = acceptor.accept_next() => Some(result),
                };
                match accepted {
                    None => {
                        acceptor.close();
                        EndpointState::Draining
                    }
                    Some(Ok(item)) => {
                        spawned += 1;
                        shutdown.spawn(handler(item));
                        EndpointState::Listening
                    }
                    Some(Err(AcceptError::Transient(e))) => {
                        warn!("Failed to accept connection on {}: {}", endpoint, e);
                        EndpointState::Listening
                    }
                    Some(Err(AcceptError::Closed)) => {
                        warn!("Endpoint {} closed unexpectedly", endpoint);
                        EndpointState::Draining
                    }
                }
            }
            EndpointState::Draining => match acceptor.accept_next().await {
                Err(AcceptError::Closed) => EndpointState::Closed,
                Err(AcceptError::Transient(e)) => {
                    debug!("Ignoring accept error on {} while draining: {}", endpoint, e);
                    acceptor.close();
                    EndpointState::Draining
                }
                Ok(_) => {
                    // A closed acceptor must not yield; drop it unserved
                    warn!("Endpoint {} yielded a connection after close", endpoint);
                    acceptor.close();
                    EndpointState::Draining
                }
            },
            EndpointState::Closed => break,
        };
    }

    info!("Stopped accepting {} connections after {} circuits", endpoint, spawned);
    spawned
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};

    /// Acceptor fed from a channel; `None` items simulate a bad attempt
    struct ChannelAcceptor {
        rx: mpsc::UnboundedReceiver<Option<u32>>,
        closed: Arc<AtomicUsize>,
        is_closed: bool,
    }

    impl Acceptor for ChannelAcceptor {
        type Item = u32;

        async fn accept_next(&mut self) -> Result<u32, AcceptError> {
            if self.is_closed {
                return Err(AcceptError::Closed);
            }
            match self.rx.recv().await {
                Some(Some(n)) => Ok(n),
                Some(None) => Err(AcceptError::Transient(io::Error::from(io::ErrorKind::ConnectionAborted))),
                None => Err(AcceptError::Closed),
            }
        }

        fn close(&mut self) {
            if !self.is_closed {
                self.is_closed = true;
                self.closed.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:0".parse().unwrap())
        }
    }

    fn endpoint() -> ListenEndpoint {
        ListenEndpoint {
            method: "example".to_string(),
            address: "127.0.0.1:0".parse().unwrap(),
        }
    }

    fn acceptor() -> (ChannelAcceptor, mpsc::UnboundedSender<Option<u32>>, Arc<AtomicUsize>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicUsize::new(0));
        (
            ChannelAcceptor {
                rx,
                closed: closed.clone(),
                is_closed: false,
            },
            tx,
            closed,
        )
    }

    #[tokio::test]
    async fn test_transient_errors_do_not_stop_loop() {
        let (acceptor, tx, _) = acceptor();
        let shutdown = ShutdownSet::new();
        let served = Arc::new(AtomicUsize::new(0));

        let handler = {
            let served = served.clone();
            move |_: u32| {
                let served = served.clone();
                async move {
                    served.fetch_add(1, Ordering::SeqCst);
                }
            }
        };
        let loop_task = tokio::spawn(run_accept_loop(
            acceptor,
            endpoint(),
            shutdown.clone(),
            shutdown.register_listener(),
            handler,
        ));

        tx.send(Some(1)).unwrap();
        tx.send(None).unwrap();
        tx.send(Some(2)).unwrap();
        tx.send(None).unwrap();
        tx.send(Some(3)).unwrap();
        drop(tx);

        let spawned = tokio::time::timeout(Duration::from_secs(1), loop_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(spawned, 3);
        shutdown.await_drain().await;
        assert_eq!(served.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_drain_closes_endpoint_and_keeps_inflight_circuit() {
        let (acceptor, tx, closed) = acceptor();
        let shutdown = ShutdownSet::new();
        let started = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

        let handler = {
            let started = started.clone();
            move |_: u32| {
                let started = started.clone();
                let release_rx = release_rx.clone();
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    // The first circuit stays mid-transfer until released
                    if let Some(rx) = release_rx.lock().await.take() {
                        let _ = rx.await;
                    }
                }
            }
        };
        let loop_task = tokio::spawn(run_accept_loop(
            acceptor,
            endpoint(),
            shutdown.clone(),
            shutdown.register_listener(),
            handler,
        ));

        tx.send(Some(1)).unwrap();
        while started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        shutdown.begin_drain();
        let spawned = tokio::time::timeout(Duration::from_secs(1), loop_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(spawned, 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(shutdown.active_listeners(), 0);

        // Nothing is accepted after the signal
        let _ = tx.send(Some(2));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);

        // The in-flight circuit is not cancelled; drain waits for it
        assert_eq!(shutdown.active_bridges(), 1);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), shutdown.await_drain())
                .await
                .is_err()
        );
        release_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), shutdown.await_drain())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_drain_before_first_accept() {
        let (acceptor, _tx, closed) = acceptor();
        let shutdown = ShutdownSet::new();
        shutdown.begin_drain();

        let listener = shutdown.register_listener();
        let spawned = run_accept_loop(acceptor, endpoint(), shutdown.clone(), listener, |_: u32| async {}).await;
        assert_eq!(spawned, 0);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(shutdown.active_listeners(), 0);
    }

    #[tokio::test]
    async fn test_drain_waits_for_loop_not_yet_polled() {
        let (acceptor, _tx, closed) = acceptor();
        let shutdown = ShutdownSet::new();
        let listener = shutdown.register_listener();

        // Drain starts before the loop task ever runs
        shutdown.begin_drain();
        assert_eq!(shutdown.active_listeners(), 1);
        assert!(
            tokio::time::timeout(Duration::from_millis(20), shutdown.await_drain())
                .await
                .is_err()
        );

        tokio::spawn(run_accept_loop(acceptor, endpoint(), shutdown.clone(), listener, |_: u32| async {}));
        tokio::time::timeout(Duration::from_secs(1), shutdown.await_drain())
            .await
            .unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(endpoint().to_string(), "example on 127.0.0.1:0");
    }
}
