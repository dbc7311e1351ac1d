//! Accept loop serving NBD connections.
//!
//! Each accepted connection runs a [`Server`] session in its own task.
//! Sessions are isolated: a protocol or backend failure closes only that
//! connection, and an accept failure is logged without stopping the loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{info, warn};

use nbd::NbdError;

use crate::listener::Listener;
use crate::server::Server;

/// A running NBD daemon.
#[derive(Clone)]
pub struct Daemon {
    server: Server,
    connections: Arc<AtomicUsize>,
}

impl Daemon {
    pub fn new(server: Server) -> Self {
        Self {
            server,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of currently connected clients. Observability only.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Accept connections from `listener` until it closes.
    ///
    /// Returns `Ok` once the listener is exhausted (a closed
    /// [`StreamListener`](crate::listener::StreamListener) channel); accept
    /// errors on socket listeners are logged and the loop continues.
    pub async fn listen<L>(&self, mut listener: L) -> Result<(), NbdError>
    where
        L: Listener,
    {
        loop {
            match listener.accept().await {
                Ok(stream) => {
                    let server = self.server.clone();
                    let connections = Arc::clone(&self.connections);
                    let connected = connections.fetch_add(1, Ordering::Relaxed) + 1;
                    info!(clients = connected, "client connected");

                    tokio::spawn(async move {
                        if let Err(e) = server.handle(stream).await {
                            warn!(error = %e, "client disconnected with error");
                        }
                        let remaining = connections.fetch_sub(1, Ordering::Relaxed) - 1;
                        info!(clients = remaining, "client disconnected");
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "could not accept connection, continuing");
                }
            }
        }
    }
}
