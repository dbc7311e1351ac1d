//! Listener abstraction for accepting NBD connections.
//!
//! Unifies the connection sources the daemon serves from:
//! - TCP sockets (production, default port 10809)
//! - Unix stream sockets
//! - Channel-fed streams (testing, via [`StreamListener`])

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Source of incoming connections.
#[async_trait]
pub trait Listener: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Accept the next incoming connection.
    async fn accept(&mut self) -> std::io::Result<Self::Stream>;
}

#[async_trait]
impl Listener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> std::io::Result<Self::Stream> {
        TcpListener::accept(self)
            .await
            .map(|(stream, _addr)| stream)
    }
}

#[cfg(unix)]
#[async_trait]
impl Listener for UnixListener {
    type Stream = UnixStream;

    async fn accept(&mut self) -> std::io::Result<Self::Stream> {
        UnixListener::accept(self)
            .await
            .map(|(stream, _addr)| stream)
    }
}

/// A listener that accepts streams from a channel.
///
/// Lets tests and benchmarks drive the daemon over in-memory duplex streams
/// instead of real sockets.
///
/// # Example
///
/// ```ignore
/// use tokio::io::duplex;
/// use blockd::StreamListener;
///
/// let (tx, listener) = StreamListener::new(4);
/// tokio::spawn(async move { daemon.listen(listener).await });
///
/// let (client, session) = duplex(1024 * 1024);
/// tx.send(session).await.unwrap();
/// let names = nbd::list(&mut client).await.unwrap();
/// ```
pub struct StreamListener<S> {
    rx: mpsc::Receiver<S>,
}

impl<S> StreamListener<S> {
    /// Create a stream listener with the given buffer capacity.
    ///
    /// Returns the sender half for pushing streams and the listener itself.
    pub fn new(buffer: usize) -> (mpsc::Sender<S>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }
}

#[async_trait]
impl<S> Listener for StreamListener<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = S;

    async fn accept(&mut self) -> std::io::Result<Self::Stream> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "channel closed"))
    }
}
