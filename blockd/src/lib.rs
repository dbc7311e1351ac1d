//! blockd: a user-space Network Block Device server.
//!
//! Exposes file- or memory-backed storage over newstyle-fixed NBD and pairs
//! with the `nbd` crate's kernel-attach client. A [`Server`] holds the
//! registered exports and drives one connection per call; a [`Daemon`]
//! accepts connections from any [`Listener`] and runs an isolated session
//! per client.
//!
//! # Library Usage
//!
//! ```ignore
//! use blockd::{Daemon, Export, MemoryBackend, Server, ServerOptions};
//!
//! let export = Export {
//!     name: "default".to_string(),
//!     description: "The default export".to_string(),
//!     backend: std::sync::Arc::new(MemoryBackend::zeroed(1 << 20)),
//! };
//! let server = Server::new(vec![export], ServerOptions::default())?;
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:10809").await?;
//! Daemon::new(server).listen(listener).await?;
//! ```

pub mod backend;
pub mod config;
pub mod daemon;
pub mod error;
pub mod listener;
pub mod server;

pub use backend::{Backend, FileBackend, MemoryBackend};
pub use config::{Config, ExportConfig, ListenConfig, Network};
pub use daemon::Daemon;
pub use error::{ConfigError, Error, NbdError, Result};
pub use listener::{Listener, StreamListener};
pub use server::{Export, Server, ServerOptions};
