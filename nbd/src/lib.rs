//! NBD (Network Block Device) protocol implementation.
//!
//! Wire codec and client-side negotiation for newstyle-fixed NBD (INFO/GO),
//! plus Linux kernel block-device attachment behind the `device` feature.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//!
//! # Features
//!
//! - `device` - Linux kernel NBD device attachment via ioctls (requires root)

mod client;
mod protocol;

#[cfg(feature = "device")]
mod device;

pub use client::{
    CLIENT_MAXIMUM_BLOCK_SIZE, CLIENT_MINIMUM_BLOCK_SIZE, ClientOptions, NegotiatedExport, list,
    negotiate,
};
pub use protocol::*;

#[cfg(feature = "device")]
pub use device::{NbdSocket, connect, disconnect};
