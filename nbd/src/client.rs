//! Client-side NBD negotiation.
//!
//! Implements the client half of the newstyle-fixed handshake and option
//! haggling over any async stream. Kernel device attachment, which consumes
//! the negotiated socket, lives in the `device` module.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::*;

/// Smallest block size the kernel NBD driver accepts in practice; smaller
/// values stop the device with "invalid argument".
pub const CLIENT_MINIMUM_BLOCK_SIZE: u32 = 512;

/// Largest block size the kernel NBD driver accepts in practice.
pub const CLIENT_MAXIMUM_BLOCK_SIZE: u32 = 4096;

/// Maximum length accepted for a single option reply payload.
/// Bounds allocation against misbehaving servers.
const OPTION_REPLY_MAX_BYTES: usize = 64 * 1024;

/// Options for attaching to a remote export.
pub struct ClientOptions {
    /// Export to request with GO.
    pub export_name: String,
    /// Requested block size; 0 uses the server's preferred size.
    pub block_size: u32,
    /// Per-request kernel timeout in seconds; 0 disables it.
    pub timeout_secs: u32,
    /// Invoked once the kernel has brought the device fully online.
    pub on_connected: Option<Box<dyn FnOnce() + Send>>,
    /// How often the readiness check polls the device size attribute.
    pub poll_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            export_name: "default".to_string(),
            block_size: 0,
            timeout_secs: 0,
            on_connected: None,
            poll_interval: Duration::from_millis(1),
        }
    }
}

/// Outcome of a successful GO negotiation.
#[derive(Debug, Clone, Copy)]
pub struct NegotiatedExport {
    /// Export size in bytes.
    pub size: u64,
    /// Block size selected by [`negotiate`]'s policy.
    pub block_size: u32,
}

/// Run the client side of the handshake and the GO option.
///
/// Validates the server greeting, requests `export_name`, and consumes the
/// info reply stream until the terminating ACK. The returned block size is
/// the server's preferred size when `block_size` is 0, otherwise the
/// requested size; either way it must land in
/// [`CLIENT_MINIMUM_BLOCK_SIZE`, `CLIENT_MAXIMUM_BLOCK_SIZE`] and be a power
/// of two.
pub async fn negotiate<S>(
    stream: &mut S,
    export_name: &str,
    block_size: u32,
) -> Result<NegotiatedExport, NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    handshake(stream).await?;

    // GO is sent with a zero-length header; the name and info request count
    // follow as a trailer. This matches what servers actually parse: the
    // option data is framed by its own length prefixes.
    stream
        .write_all(
            &OptionHeader {
                option: NBD_OPT_GO,
                length: 0,
            }
            .to_bytes(),
        )
        .await?;

    let name = export_name.as_bytes();
    stream.write_all(&(name.len() as u32).to_be_bytes()).await?;
    stream.write_all(name).await?;
    stream.write_all(&0u16.to_be_bytes()).await?; // no information requests

    let mut size = 0u64;
    let mut chosen_block_size = 1u32;

    loop {
        let mut header = [0u8; OptionReply::SIZE_BYTES];
        stream.read_exact(&mut header).await?;
        let reply = OptionReply::from_bytes(&header)?;

        match reply.reply_type {
            NBD_REP_INFO => {
                let payload = read_reply_payload(stream, reply.length).await?;
                if payload.len() < 2 {
                    return Err(truncated_payload());
                }

                let info_type = u16::from_be_bytes(payload[0..2].try_into().unwrap());
                match info_type {
                    NBD_INFO_EXPORT => {
                        if payload.len() < InfoExport::SIZE_BYTES {
                            return Err(truncated_payload());
                        }
                        let info = InfoExport::from_bytes(
                            payload[..InfoExport::SIZE_BYTES].try_into().unwrap(),
                        );
                        size = info.size;
                    }
                    // Advisory; the requested name and description are not
                    // needed for attachment.
                    NBD_INFO_NAME | NBD_INFO_DESCRIPTION => {}
                    NBD_INFO_BLOCK_SIZE => {
                        if payload.len() < InfoBlockSize::SIZE_BYTES {
                            return Err(truncated_payload());
                        }
                        let info = InfoBlockSize::from_bytes(
                            payload[..InfoBlockSize::SIZE_BYTES].try_into().unwrap(),
                        );
                        chosen_block_size = choose_block_size(block_size, &info)?;
                    }
                    info_type => return Err(NbdError::UnknownInfo { info_type }),
                }
            }
            NBD_REP_ACK => break,
            NBD_REP_ERR_UNKNOWN => {
                return Err(NbdError::UnknownExport {
                    name: export_name.to_string(),
                });
            }
            reply_type => return Err(NbdError::UnknownReply { reply_type }),
        }
    }

    Ok(NegotiatedExport {
        size,
        block_size: chosen_block_size,
    })
}

/// List the export names a server offers.
///
/// Runs the handshake, sends LIST, parses the SERVER reply, and closes the
/// session with ABORT. Touches no device.
pub async fn list<S>(stream: &mut S) -> Result<Vec<String>, NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    handshake(stream).await?;

    stream
        .write_all(
            &OptionHeader {
                option: NBD_OPT_LIST,
                length: 0,
            }
            .to_bytes(),
        )
        .await?;

    let mut header = [0u8; OptionReply::SIZE_BYTES];
    stream.read_exact(&mut header).await?;
    let reply = OptionReply::from_bytes(&header)?;
    if reply.reply_type != NBD_REP_SERVER {
        return Err(NbdError::UnknownReply {
            reply_type: reply.reply_type,
        });
    }

    let payload = read_reply_payload(stream, reply.length).await?;

    let mut names = Vec::new();
    let mut rest = &payload[..];
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(truncated_payload());
        }
        let name_len = u32::from_be_bytes(rest[0..4].try_into().unwrap()) as usize;
        rest = &rest[4..];
        if rest.len() < name_len {
            return Err(truncated_payload());
        }
        names.push(String::from_utf8_lossy(&rest[..name_len]).into_owned());
        rest = &rest[name_len..];
    }

    // Clean close; the server stays in haggling after LIST.
    stream
        .write_all(
            &OptionHeader {
                option: NBD_OPT_ABORT,
                length: 0,
            }
            .to_bytes(),
        )
        .await?;

    Ok(names)
}

async fn handshake<S>(stream: &mut S) -> Result<(), NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut greeting = [0u8; NewstyleHandshake::SIZE_BYTES];
    stream.read_exact(&mut greeting).await?;
    NewstyleHandshake::from_bytes(&greeting)?;

    // All-zero client flags; NO_ZEROES is not negotiated.
    stream.write_all(&[0u8; 4]).await?;
    Ok(())
}

async fn read_reply_payload<S>(stream: &mut S, length: u32) -> Result<Vec<u8>, NbdError>
where
    S: AsyncRead + Unpin,
{
    let length = length as usize;
    if length > OPTION_REPLY_MAX_BYTES {
        return Err(NbdError::RequestTooLarge {
            length: length as u64,
            max: OPTION_REPLY_MAX_BYTES as u64,
        });
    }

    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

fn truncated_payload() -> NbdError {
    NbdError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        "truncated option reply payload",
    ))
}

/// Select the transmission block size from the server's advertisement.
///
/// A requested size of 0 defers to the server's preferred size; any other
/// request must fall inside the server's advertised range. The result must
/// additionally satisfy the kernel driver's hard limits.
pub(crate) fn choose_block_size(
    requested: u32,
    server: &InfoBlockSize,
) -> Result<u32, NbdError> {
    let chosen = if requested == 0 {
        server.preferred
    } else if requested >= server.minimum && requested <= server.maximum {
        requested
    } else {
        return Err(NbdError::UnsupportedServerBlockSize {
            requested,
            minimum: server.minimum,
            maximum: server.maximum,
        });
    };

    if chosen > CLIENT_MAXIMUM_BLOCK_SIZE {
        return Err(NbdError::BlockSizeAboveMaximum {
            chosen,
            maximum: CLIENT_MAXIMUM_BLOCK_SIZE,
        });
    }
    if chosen < CLIENT_MINIMUM_BLOCK_SIZE {
        return Err(NbdError::BlockSizeBelowMinimum {
            chosen,
            minimum: CLIENT_MINIMUM_BLOCK_SIZE,
        });
    }
    if !chosen.is_power_of_two() {
        return Err(NbdError::BlockSizeNotPowerOfTwo { chosen });
    }

    Ok(chosen)
}
