//! Linux kernel NBD device attachment.
//!
//! Runs client-side negotiation on a std socket, then hands the socket to the
//! kernel NBD driver via ioctls so the kernel drives the transmission phase.
//!
//! # Example
//!
//! ```ignore
//! use std::net::TcpStream;
//! use std::path::Path;
//!
//! let socket = TcpStream::connect("127.0.0.1:10809")?;
//! // Blocks until the kernel tears the association down.
//! nbd::connect(socket.into(), Path::new("/dev/nbd0"), Default::default())?;
//! ```

use std::fs::{self, OpenOptions};
use std::io;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use nix::libc;

use crate::client::{self, ClientOptions};
use crate::protocol::NbdError;

// NBD ioctl numbers from linux/nbd.h (architecture-independent)
#[allow(dead_code)]
mod ioctl {
    use nix::libc;
    pub const NBD_SET_SOCK: libc::c_ulong = 0xab00;
    pub const NBD_SET_BLKSIZE: libc::c_ulong = 0xab01;
    pub const NBD_SET_SIZE: libc::c_ulong = 0xab02;
    pub const NBD_DO_IT: libc::c_ulong = 0xab03;
    pub const NBD_CLEAR_SOCK: libc::c_ulong = 0xab04;
    pub const NBD_CLEAR_QUE: libc::c_ulong = 0xab05;
    pub const NBD_SET_SIZE_BLOCKS: libc::c_ulong = 0xab07;
    pub const NBD_DISCONNECT: libc::c_ulong = 0xab08;
    pub const NBD_SET_TIMEOUT: libc::c_ulong = 0xab09;
}

/// A connected stream socket whose file descriptor can be handed to the
/// kernel. Both transports work; the driver only needs a transferable fd.
pub enum NbdSocket {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl NbdSocket {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.set_nonblocking(nonblocking),
            Self::Unix(stream) => stream.set_nonblocking(nonblocking),
        }
    }
}

impl AsRawFd for NbdSocket {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(stream) => stream.as_raw_fd(),
            Self::Unix(stream) => stream.as_raw_fd(),
        }
    }
}

impl From<TcpStream> for NbdSocket {
    fn from(stream: TcpStream) -> Self {
        Self::Tcp(stream)
    }
}

impl From<UnixStream> for NbdSocket {
    fn from(stream: UnixStream) -> Self {
        Self::Unix(stream)
    }
}

/// Attach a remote export to a kernel NBD device.
///
/// Performs the handshake and GO negotiation on `socket`, programs the
/// device at `device_path` with the negotiated socket, block size, size in
/// blocks, and timeout, then enters transmission mode. The call blocks until
/// the kernel terminates the association (see [`disconnect`]) or a fatal
/// error is reported.
///
/// If `options.on_connected` is set, a readiness checker polls the device's
/// sysfs size attribute at `options.poll_interval` and fires the callback
/// once the kernel has fully brought the device online.
pub fn connect(
    socket: NbdSocket,
    device_path: &Path,
    mut options: ClientOptions,
) -> Result<(), NbdError> {
    let negotiated = negotiate_on_std(&socket, &options)?;

    // The kernel drives the socket with blocking semantics; undo the
    // nonblocking mode the async negotiation required.
    socket.set_nonblocking(false)?;

    let device = OpenOptions::new()
        .read(true)
        .write(true)
        .open(device_path)?;
    let device_fd = device.as_raw_fd();

    nbd_ioctl(
        device_fd,
        ioctl::NBD_SET_SOCK,
        socket.as_raw_fd() as libc::c_ulong,
    )?;
    nbd_ioctl(
        device_fd,
        ioctl::NBD_SET_BLKSIZE,
        negotiated.block_size as libc::c_ulong,
    )?;
    nbd_ioctl(
        device_fd,
        ioctl::NBD_SET_SIZE_BLOCKS,
        (negotiated.size / negotiated.block_size as u64) as libc::c_ulong,
    )?;
    nbd_ioctl(
        device_fd,
        ioctl::NBD_SET_TIMEOUT,
        options.timeout_secs as libc::c_ulong,
    )?;

    let (tx, rx) = mpsc::channel::<io::Result<()>>();

    if let Some(on_connected) = options.on_connected.take() {
        let size_attr = sysfs_size_path(device_path);
        let poll_interval = options.poll_interval;
        let ready_tx = tx.clone();
        thread::spawn(move || match wait_until_ready(&size_attr, poll_interval) {
            Ok(()) => on_connected(),
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        });
    }

    // DO_IT blocks for the lifetime of the attachment. The device handle and
    // socket move onto that thread so their fds outlive the ioctl even if a
    // readiness failure returns early below.
    thread::spawn(move || {
        let _socket = socket;
        let result = match nbd_ioctl(device.as_raw_fd(), ioctl::NBD_DO_IT, 0) {
            // The driver reports ENOTCONN once the association is torn down.
            Err(e) if e.raw_os_error() == Some(libc::ENOTCONN) => Ok(()),
            other => other,
        };
        let _ = tx.send(result);
    });

    match rx.recv() {
        Ok(result) => result.map_err(NbdError::Io),
        Err(_) => Ok(()),
    }
}

/// Detach a kernel NBD device.
///
/// Queued requests are failed before the socket association is torn down, so
/// the ioctl order matters: CLEAR_QUE, DISCONNECT, CLEAR_SOCK.
pub fn disconnect(device_path: &Path) -> Result<(), NbdError> {
    let device = OpenOptions::new()
        .read(true)
        .write(true)
        .open(device_path)?;
    let device_fd = device.as_raw_fd();

    nbd_ioctl(device_fd, ioctl::NBD_CLEAR_QUE, 0)?;
    nbd_ioctl(device_fd, ioctl::NBD_DISCONNECT, 0)?;
    nbd_ioctl(device_fd, ioctl::NBD_CLEAR_SOCK, 0)?;

    Ok(())
}

fn negotiate_on_std(
    socket: &NbdSocket,
    options: &ClientOptions,
) -> Result<client::NegotiatedExport, NbdError> {
    socket.set_nonblocking(true)?;

    // The negotiation codec is async; bridge the std socket into a
    // current-thread runtime for the handful of round trips it takes. The
    // clone shares the open file description, so the original socket keeps
    // the negotiated state.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .map_err(NbdError::Io)?;

    rt.block_on(async {
        match socket {
            NbdSocket::Tcp(stream) => {
                let mut stream = tokio::net::TcpStream::from_std(stream.try_clone()?)?;
                client::negotiate(&mut stream, &options.export_name, options.block_size).await
            }
            NbdSocket::Unix(stream) => {
                let mut stream = tokio::net::UnixStream::from_std(stream.try_clone()?)?;
                client::negotiate(&mut stream, &options.export_name, options.block_size).await
            }
        }
    })
}

fn nbd_ioctl(fd: libc::c_int, request: libc::c_ulong, arg: libc::c_ulong) -> io::Result<()> {
    let rc = unsafe { libc::ioctl(fd, request, arg) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn sysfs_size_path(device_path: &Path) -> PathBuf {
    let name = device_path.file_name().unwrap_or_default();
    Path::new("/sys/block").join(name).join("size")
}

fn wait_until_ready(size_attr: &Path, poll_interval: Duration) -> io::Result<()> {
    loop {
        let raw = fs::read_to_string(size_attr)?;
        let size: u64 = raw
            .trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if size > 0 {
            return Ok(());
        }
        thread::sleep(poll_interval);
    }
}
