//! Listener lifecycle
//!
//! Binds the listen address, serves each accepted connection on its own
//! task, and on shutdown stops accepting and gives open connections a
//! bounded time to finish before closing them.

use crate::dispatch::Dispatcher;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Default grace period for in-flight connections on shutdown
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("graceful shutdown timed out after {timeout:?} with {remaining} connection(s) still open")]
    ShutdownTimeout { timeout: Duration, remaining: usize },
}

/// Where the server is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Starting,
    Serving,
    Draining,
    Stopped,
}

/// The gateway's HTTP listener
///
/// Serves until `shutdown_rx` turns `true`, then stops accepting and gives
/// open connections the shutdown timeout to finish before closing them.
pub struct ProxyServer {
    bind_addr: String,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: watch::Receiver<bool>,
    shutdown_timeout: Duration,
    state_tx: watch::Sender<ServerState>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: impl Into<String>,
        dispatcher: Arc<Dispatcher>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ServerState::Starting);
        Self {
            bind_addr: bind_addr.into(),
            dispatcher,
            shutdown_rx,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            state_tx,
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Watch the lifecycle state
    pub fn state(&self) -> watch::Receiver<ServerState> {
        self.state_tx.subscribe()
    }

    pub async fn bind(self) -> Result<BoundProxyServer, ServerError> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.bind_addr.clone(),
                source,
            })?;
        Ok(BoundProxyServer {
            listener,
            server: self,
        })
    }

    pub async fn run(self) -> Result<(), ServerError> {
        self.bind().await?.serve().await
    }
}

/// A server whose listener is open but not yet accepting
pub struct BoundProxyServer {
    listener: TcpListener,
    server: ProxyServer,
}

impl BoundProxyServer {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> watch::Receiver<ServerState> {
        self.server.state()
    }

    pub async fn serve(self) -> Result<(), ServerError> {
        let BoundProxyServer { listener, server } = self;
        let ProxyServer {
            dispatcher,
            shutdown_rx,
            shutdown_timeout,
            state_tx,
            ..
        } = server;

        let addr = listener.local_addr().ok();
        state_tx.send_replace(ServerState::Serving);
        info!(addr = ?addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let (drain_tx, drain_rx) = watch::channel(false);
        let mut connections = JoinSet::new();

        let cancelled = wait_for_shutdown(shutdown_rx);
        tokio::pin!(cancelled);

        loop {
            tokio::select! {
                biased;
                () = &mut cancelled => {
                    info!("Proxy server shutting down");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote)) => {
                            connections.spawn(serve_connection(
                                stream,
                                remote,
                                Arc::clone(&dispatcher),
                                drain_rx.clone(),
                            ));
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                // Reap finished connections so the set tracks only live ones
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        state_tx.send_replace(ServerState::Draining);
        info!(
            open_connections = connections.len(),
            timeout_secs = shutdown_timeout.as_secs_f64(),
            "Draining connections"
        );
        drain_tx.send_replace(true);

        let drained = tokio::time::timeout(shutdown_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        let result = match drained {
            Ok(()) => {
                info!("All connections closed");
                Ok(())
            }
            Err(_) => {
                let remaining = connections.len();
                warn!(remaining, "Shutdown timeout reached, closing remaining connections");
                connections.shutdown().await;
                Err(ServerError::ShutdownTimeout {
                    timeout: shutdown_timeout,
                    remaining,
                })
            }
        };

        state_tx.send_replace(ServerState::Stopped);
        result
    }
}

async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    drain_rx: watch::Receiver<bool>,
) {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        async move { Ok::<_, Infallible>(dispatcher.handle(req, remote).await) }
    });

    // auto::Builder speaks both HTTP/1.1 and h2c
    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder.http1().preserve_header_case(true);
    builder.http2().max_concurrent_streams(250);

    // Upgraded connections leave this future once the switch is handed off
    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    let draining = wait_for_shutdown(drain_rx);
    tokio::pin!(draining);
    let mut closing = false;

    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(addr = %remote, error = %e, "Connection error");
                }
                break;
            }
            () = &mut draining, if !closing => {
                // Finish the in-flight request, then close
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

/// Resolves once the flag turns `true`. If the sender goes away without
/// setting it, nothing can cancel any more and this never resolves.
pub async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let signalled = rx.wait_for(|stop| *stop).await.map(|_| ());
    if signalled.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_shutdown_already_set() {
        let (_tx, rx) = watch::channel(true);
        tokio::time::timeout(Duration::from_secs(1), wait_for_shutdown(rx))
            .await
            .expect("should resolve immediately");
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_after_signal() {
        let (tx, rx) = watch::channel(false);
        let waiter = tokio::spawn(wait_for_shutdown(rx));
        tx.send_replace(true);
        // Signalling twice is harmless
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_ignores_dropped_sender() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let result = tokio::time::timeout(Duration::from_millis(50), wait_for_shutdown(rx)).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_server_state_serialization() {
        assert_eq!(serde_json::to_string(&ServerState::Draining).unwrap(), "\"draining\"");
    }
}
