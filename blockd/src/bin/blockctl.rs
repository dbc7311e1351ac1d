//! blockctl - attach, detach, and list NBD exports.

use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use nbd::{ClientOptions, NbdSocket};

#[derive(Parser)]
#[command(name = "blockctl", about = "NBD client for kernel block devices")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Attach a remote export to a kernel NBD device. Blocks until the
    /// device is detached.
    Attach {
        /// NBD device node.
        #[arg(long, default_value = "/dev/nbd0")]
        device: PathBuf,

        /// Remote address (host:port for tcp, a path for unix).
        #[arg(long, default_value = "127.0.0.1:10809")]
        addr: String,

        /// Remote network (tcp or unix).
        #[arg(long, default_value = "tcp")]
        network: String,

        /// Export name to request.
        #[arg(long, default_value = "default")]
        export: String,

        /// Block size to use; 0 uses the server's preferred block size.
        #[arg(long, default_value_t = 0)]
        block_size: u32,

        /// Per-request kernel timeout in seconds; 0 disables it.
        #[arg(long, default_value_t = 0)]
        timeout: u32,
    },

    /// Detach a kernel NBD device.
    Detach {
        /// NBD device node.
        #[arg(long, default_value = "/dev/nbd0")]
        device: PathBuf,
    },

    /// List the exports a server offers.
    List {
        /// Remote address (host:port for tcp, a path for unix).
        #[arg(long, default_value = "127.0.0.1:10809")]
        addr: String,

        /// Remote network (tcp or unix).
        #[arg(long, default_value = "tcp")]
        network: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Attach {
            device,
            addr,
            network,
            export,
            block_size,
            timeout,
        } => attach(&device, &addr, &network, export, block_size, timeout),
        Command::Detach { device } => {
            nbd::disconnect(&device)
                .with_context(|| format!("failed to detach {}", device.display()))?;
            Ok(())
        }
        Command::List { addr, network } => list(&addr, &network),
    }
}

fn attach(
    device: &Path,
    addr: &str,
    network: &str,
    export: String,
    block_size: u32,
    timeout: u32,
) -> Result<()> {
    let socket = connect_socket(addr, network)?;
    println!("connected to {addr}");

    // Detach on Ctrl-C so queued requests are failed before the socket
    // association is torn down.
    let signal_device = device.to_path_buf();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .expect("signal runtime");
        rt.block_on(tokio::signal::ctrl_c()).ok();
        let _ = nbd::disconnect(&signal_device);
        std::process::exit(0);
    });

    let ready_device = device.to_path_buf();
    let options = ClientOptions {
        export_name: export,
        block_size,
        timeout_secs: timeout,
        on_connected: Some(Box::new(move || {
            println!("{} ready", ready_device.display());
        })),
        ..Default::default()
    };

    nbd::connect(socket, device, options)
        .with_context(|| format!("failed to attach {}", device.display()))?;
    Ok(())
}

fn connect_socket(addr: &str, network: &str) -> Result<NbdSocket> {
    match network {
        "tcp" => Ok(TcpStream::connect(addr)
            .with_context(|| format!("failed to connect to {addr}"))?
            .into()),
        "unix" => Ok(UnixStream::connect(addr)
            .with_context(|| format!("failed to connect to {addr}"))?
            .into()),
        other => bail!("unsupported network: {other}"),
    }
}

fn list(addr: &str, network: &str) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;

    let names = rt.block_on(async {
        match network {
            "tcp" => {
                let mut stream = tokio::net::TcpStream::connect(addr)
                    .await
                    .with_context(|| format!("failed to connect to {addr}"))?;
                Ok(nbd::list(&mut stream).await?)
            }
            "unix" => {
                let mut stream = tokio::net::UnixStream::connect(addr)
                    .await
                    .with_context(|| format!("failed to connect to {addr}"))?;
                Ok(nbd::list(&mut stream).await?)
            }
            other => bail!("unsupported network: {other}"),
        }
    })?;

    println!("{}", serde_json::to_string(&names)?);
    Ok(())
}
