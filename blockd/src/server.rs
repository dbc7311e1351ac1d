//! NBD server session.
//!
//! [`Server::handle`] drives a single connection through the handshake,
//! option haggling, and transmission phases. It is transport-agnostic and
//! works over any async stream; for accepting connections see
//! [`Daemon`](crate::daemon::Daemon).

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use nbd::*;

use crate::backend::Backend;
use crate::error::{ConfigError, Error};

/// Maximum length accepted for client-supplied option data (the export name
/// in INFO/GO). Bounds allocation against misbehaving clients.
const OPTION_DATA_MAX_BYTES: usize = 64 * 1024;

/// A named unit of exposed storage.
///
/// Created at server configuration time and never mutated after
/// registration. Each export exclusively owns its backend for the server's
/// lifetime.
#[derive(Clone)]
pub struct Export {
    pub name: String,
    pub description: String,
    pub backend: Arc<dyn Backend>,
}

/// Options applied to every session of a server.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Answer every WRITE with EPERM and skip the sync on disconnect.
    pub read_only: bool,
    /// Minimum block size advertised in the BLOCK_SIZE info reply.
    pub minimum_block_size: u32,
    /// Preferred block size advertised in the BLOCK_SIZE info reply.
    pub preferred_block_size: u32,
    /// Maximum block size advertised in the BLOCK_SIZE info reply.
    pub maximum_block_size: u32,
    /// Transmission requests declaring a larger payload are fatal to their
    /// session.
    pub maximum_request_size: usize,
    /// Advertise CAN_MULTI_CONN in the EXPORT info reply.
    pub supports_multi_conn: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            minimum_block_size: 1,
            preferred_block_size: 4096,
            maximum_block_size: NBD_MAX_PAYLOAD_SIZE,
            maximum_request_size: NBD_MAX_PAYLOAD_SIZE as usize,
            supports_multi_conn: true,
        }
    }
}

impl ServerOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.minimum_block_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "minimum_block_size",
                reason: "must be at least 1",
            });
        }
        if self.minimum_block_size > self.preferred_block_size
            || self.preferred_block_size > self.maximum_block_size
        {
            return Err(ConfigError::InvalidValue {
                field: "preferred_block_size",
                reason: "block sizes must satisfy minimum <= preferred <= maximum",
            });
        }
        Ok(())
    }

    fn transmission_flags(&self) -> u16 {
        if self.supports_multi_conn {
            NBD_FLAG_HAS_FLAGS | NBD_FLAG_CAN_MULTI_CONN
        } else {
            0
        }
    }
}

/// NBD server over a registered set of exports.
#[derive(Clone)]
pub struct Server {
    exports: Arc<Vec<Export>>,
    options: ServerOptions,
}

impl Server {
    /// Create a server, validating the options and export names.
    pub fn new(exports: Vec<Export>, options: ServerOptions) -> Result<Self, Error> {
        options.validate()?;
        for (i, export) in exports.iter().enumerate() {
            if export.name.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "exports.name",
                    reason: "must not be empty",
                }
                .into());
            }
            if exports[..i].iter().any(|e| e.name == export.name) {
                return Err(ConfigError::DuplicateExport {
                    name: export.name.clone(),
                }
                .into());
            }
        }

        Ok(Self {
            exports: Arc::new(exports),
            options,
        })
    }

    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Drive one client connection to completion.
    ///
    /// Returns cleanly on graceful disconnect (ABORT or DISC) and with an
    /// error on any fatal protocol or backend condition. The session is
    /// purely reactive: one record in, zero or more replies out, repeat.
    pub async fn handle<S>(&self, mut stream: S) -> Result<(), NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        handshake(&mut stream).await?;

        let Some(export) = negotiate_options(&mut stream, &self.exports, &self.options).await?
        else {
            return Ok(());
        };

        transmission(&mut stream, export, &self.options).await
    }
}

async fn handshake<S>(stream: &mut S) -> Result<(), NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(
            &NewstyleHandshake {
                handshake_flags: NBD_FLAG_FIXED_NEWSTYLE,
            }
            .to_bytes(),
        )
        .await?;

    // Client flags are read and discarded: FIXED_NEWSTYLE is assumed and
    // NO_ZEROES is not negotiated.
    let mut client_flags = [0u8; 4];
    stream.read_exact(&mut client_flags).await?;

    Ok(())
}

/// Run the option haggling loop.
///
/// Returns the export selected by GO, or `None` for a clean ABORT. Every
/// option produces at least one reply record.
async fn negotiate_options<'a, S>(
    stream: &mut S,
    exports: &'a [Export],
    options: &ServerOptions,
) -> Result<Option<&'a Export>, NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let mut header = [0u8; OptionHeader::SIZE_BYTES];
        stream.read_exact(&mut header).await?;
        let option = OptionHeader::from_bytes(&header)?;

        debug!(option = option.option, length = option.length, "option");

        match option.option {
            NBD_OPT_INFO | NBD_OPT_GO => {
                let mut name_len_buf = [0u8; 4];
                stream.read_exact(&mut name_len_buf).await?;
                let name_len = u32::from_be_bytes(name_len_buf);
                if name_len as usize > OPTION_DATA_MAX_BYTES {
                    return Err(NbdError::RequestTooLarge {
                        length: name_len as u64,
                        max: OPTION_DATA_MAX_BYTES as u64,
                    });
                }

                let mut name = vec![0u8; name_len as usize];
                stream.read_exact(&mut name).await?;
                let requested = String::from_utf8_lossy(&name).into_owned();

                let Some(export) = exports.iter().find(|e| e.name == requested) else {
                    // Drain whatever else the option declared before
                    // replying, so the stream stays aligned for the next
                    // option.
                    let consumed = 4 + name_len as u64;
                    if option.length as u64 > consumed {
                        discard(stream, option.length as u64 - consumed).await?;
                    }
                    warn!(export = %requested, "unknown export requested");
                    send_reply(stream, option.option, NBD_REP_ERR_UNKNOWN, &[]).await?;
                    continue;
                };

                // Requested info types are ignored; every known info is
                // volunteered below.
                let mut count_buf = [0u8; 2];
                stream.read_exact(&mut count_buf).await?;
                let info_requests = u16::from_be_bytes(count_buf);
                discard(stream, 2 * info_requests as u64).await?;

                let size = export.backend.size().await?;

                send_reply(
                    stream,
                    option.option,
                    NBD_REP_INFO,
                    &InfoExport {
                        size,
                        transmission_flags: options.transmission_flags(),
                    }
                    .to_bytes(),
                )
                .await?;

                let mut name_info = NBD_INFO_NAME.to_be_bytes().to_vec();
                name_info.extend_from_slice(export.name.as_bytes());
                send_reply(stream, option.option, NBD_REP_INFO, &name_info).await?;

                let mut description_info = NBD_INFO_DESCRIPTION.to_be_bytes().to_vec();
                description_info.extend_from_slice(export.description.as_bytes());
                send_reply(stream, option.option, NBD_REP_INFO, &description_info).await?;

                send_reply(
                    stream,
                    option.option,
                    NBD_REP_INFO,
                    &InfoBlockSize {
                        minimum: options.minimum_block_size,
                        preferred: options.preferred_block_size,
                        maximum: options.maximum_block_size,
                    }
                    .to_bytes(),
                )
                .await?;

                send_reply(stream, option.option, NBD_REP_ACK, &[]).await?;

                if option.option == NBD_OPT_GO {
                    debug!(export = %export.name, size, "export selected");
                    return Ok(Some(export));
                }
            }
            NBD_OPT_ABORT => {
                send_reply(stream, option.option, NBD_REP_ACK, &[]).await?;
                return Ok(None);
            }
            NBD_OPT_LIST => {
                let mut body = Vec::new();
                for export in exports {
                    body.extend_from_slice(&(export.name.len() as u32).to_be_bytes());
                    body.extend_from_slice(export.name.as_bytes());
                }
                send_reply(stream, option.option, NBD_REP_SERVER, &body).await?;
                send_reply(stream, option.option, NBD_REP_ACK, &[]).await?;
                // Clients may LIST and then GO on the same connection.
            }
            _ => {
                discard(stream, option.length as u64).await?;
                send_reply(stream, option.option, NBD_REP_ERR_UNSUP, &[]).await?;
            }
        }
    }
}

async fn send_reply<S>(
    stream: &mut S,
    option: u32,
    reply_type: u32,
    data: &[u8],
) -> Result<(), NbdError>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(
            &OptionReply {
                option,
                reply_type,
                length: data.len() as u32,
            }
            .to_bytes(),
        )
        .await?;
    if !data.is_empty() {
        stream.write_all(data).await?;
    }
    Ok(())
}

/// Run the transmission loop until DISC or a fatal condition.
async fn transmission<S>(
    stream: &mut S,
    export: &Export,
    options: &ServerOptions,
) -> Result<(), NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; NbdRequest::SIZE_BYTES];
    // One payload buffer per session, grown lazily to the largest length
    // seen and bounded by maximum_request_size.
    let mut payload = BytesMut::new();

    loop {
        stream.read_exact(&mut header).await?;
        let request = NbdRequest::from_bytes(&header, options.maximum_request_size)?;
        let length = request.length as usize;

        match request.command {
            NBD_CMD_READ => {
                if payload.len() < length {
                    payload.resize(length, 0);
                }
                export
                    .backend
                    .read_exact_at(&mut payload[..length], request.offset)
                    .await?;
                stream
                    .write_all(&NbdReply::ok(request.handle).to_bytes())
                    .await?;
                stream.write_all(&payload[..length]).await?;
            }
            NBD_CMD_WRITE => {
                if options.read_only {
                    discard(stream, request.length as u64).await?;
                    stream
                        .write_all(&NbdReply::error(request.handle, NBD_EPERM).to_bytes())
                        .await?;
                    continue;
                }

                if payload.len() < length {
                    payload.resize(length, 0);
                }
                stream.read_exact(&mut payload[..length]).await?;
                export
                    .backend
                    .write_all_at(&payload[..length], request.offset)
                    .await?;
                stream
                    .write_all(&NbdReply::ok(request.handle).to_bytes())
                    .await?;
            }
            NBD_CMD_DISCONNECT => {
                if !options.read_only {
                    export.backend.sync().await?;
                }
                return Ok(());
            }
            command => {
                debug!(command, handle = request.handle, "unknown command");
                discard(stream, request.length as u64).await?;
                stream
                    .write_all(&NbdReply::error(request.handle, NBD_EINVAL).to_bytes())
                    .await?;
            }
        }
    }
}

/// Read and discard exactly `count` bytes.
async fn discard<S>(stream: &mut S, mut count: u64) -> Result<(), NbdError>
where
    S: AsyncRead + Unpin,
{
    let mut scratch = [0u8; 4096];
    while count > 0 {
        let chunk = count.min(scratch.len() as u64) as usize;
        stream.read_exact(&mut scratch[..chunk]).await?;
        count -= chunk as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use tokio::io::{DuplexStream, duplex};
    use tokio::task::JoinHandle;

    fn export(name: &str, backend: Arc<MemoryBackend>) -> Export {
        Export {
            name: name.to_string(),
            description: format!("{name} export"),
            backend,
        }
    }

    fn single_export_server(options: ServerOptions) -> (Server, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::zeroed(8));
        let server = Server::new(vec![export("default", Arc::clone(&backend))], options).unwrap();
        (server, backend)
    }

    fn start_session(server: Server) -> (DuplexStream, JoinHandle<Result<(), NbdError>>) {
        let (client, session) = duplex(1024 * 1024);
        let task = tokio::spawn(async move { server.handle(session).await });
        (client, task)
    }

    async fn run_handshake(client: &mut DuplexStream) {
        let mut greeting = [0u8; NewstyleHandshake::SIZE_BYTES];
        client.read_exact(&mut greeting).await.unwrap();
        let handshake = NewstyleHandshake::from_bytes(&greeting).unwrap();
        assert_eq!(handshake.handshake_flags, NBD_FLAG_FIXED_NEWSTYLE);
        client.write_all(&[0u8; 4]).await.unwrap();
    }

    /// GO/INFO in the reference client's shape: zero-length header with the
    /// name and info-request count as a trailer.
    async fn send_go(client: &mut DuplexStream, option: u32, name: &str) {
        client
            .write_all(&OptionHeader { option, length: 0 }.to_bytes())
            .await
            .unwrap();
        client
            .write_all(&(name.len() as u32).to_be_bytes())
            .await
            .unwrap();
        client.write_all(name.as_bytes()).await.unwrap();
        client.write_all(&0u16.to_be_bytes()).await.unwrap();
    }

    /// GO with the option data covered by the declared header length, the
    /// way the kernel client frames it.
    async fn send_go_framed(client: &mut DuplexStream, name: &str) {
        let length = (4 + name.len() + 2) as u32;
        client
            .write_all(
                &OptionHeader {
                    option: NBD_OPT_GO,
                    length,
                }
                .to_bytes(),
            )
            .await
            .unwrap();
        client
            .write_all(&(name.len() as u32).to_be_bytes())
            .await
            .unwrap();
        client.write_all(name.as_bytes()).await.unwrap();
        client.write_all(&0u16.to_be_bytes()).await.unwrap();
    }

    async fn read_option_reply(client: &mut DuplexStream) -> (OptionReply, Vec<u8>) {
        let mut header = [0u8; OptionReply::SIZE_BYTES];
        client.read_exact(&mut header).await.unwrap();
        let reply = OptionReply::from_bytes(&header).unwrap();
        let mut payload = vec![0u8; reply.length as usize];
        client.read_exact(&mut payload).await.unwrap();
        (reply, payload)
    }

    /// Consume the four INFO replies and the ACK a successful GO/INFO emits.
    async fn drain_go_replies(client: &mut DuplexStream, option: u32) {
        for expected_info in [
            NBD_INFO_EXPORT,
            NBD_INFO_NAME,
            NBD_INFO_DESCRIPTION,
            NBD_INFO_BLOCK_SIZE,
        ] {
            let (reply, payload) = read_option_reply(client).await;
            assert_eq!(reply.option, option);
            assert_eq!(reply.reply_type, NBD_REP_INFO);
            let info_type = u16::from_be_bytes(payload[0..2].try_into().unwrap());
            assert_eq!(info_type, expected_info);
        }
        let (ack, _) = read_option_reply(client).await;
        assert_eq!(ack.reply_type, NBD_REP_ACK);
    }

    async fn send_request(
        client: &mut DuplexStream,
        command: u16,
        handle: u64,
        offset: u64,
        length: u32,
        payload: &[u8],
    ) {
        client
            .write_all(
                &NbdRequest {
                    flags: 0,
                    command,
                    handle,
                    offset,
                    length,
                }
                .to_bytes(),
            )
            .await
            .unwrap();
        if !payload.is_empty() {
            client.write_all(payload).await.unwrap();
        }
    }

    async fn read_simple_reply(client: &mut DuplexStream) -> NbdReply {
        let mut buf = [0u8; NbdReply::SIZE_BYTES];
        client.read_exact(&mut buf).await.unwrap();
        NbdReply::from_bytes(&buf).unwrap()
    }

    #[tokio::test]
    async fn go_streams_all_infos_then_ack() {
        let (server, _) = single_export_server(ServerOptions::default());
        let (mut client, task) = start_session(server);

        run_handshake(&mut client).await;
        send_go(&mut client, NBD_OPT_GO, "default").await;

        let (reply, payload) = read_option_reply(&mut client).await;
        assert_eq!(reply.option, NBD_OPT_GO);
        assert_eq!(reply.reply_type, NBD_REP_INFO);
        let info = InfoExport::from_bytes(payload.as_slice().try_into().unwrap());
        assert_eq!(info.size, 8);
        assert_eq!(
            info.transmission_flags,
            NBD_FLAG_HAS_FLAGS | NBD_FLAG_CAN_MULTI_CONN
        );

        let (reply, payload) = read_option_reply(&mut client).await;
        assert_eq!(reply.reply_type, NBD_REP_INFO);
        assert_eq!(&payload[0..2], &NBD_INFO_NAME.to_be_bytes());
        assert_eq!(&payload[2..], b"default");

        let (reply, payload) = read_option_reply(&mut client).await;
        assert_eq!(reply.reply_type, NBD_REP_INFO);
        assert_eq!(&payload[0..2], &NBD_INFO_DESCRIPTION.to_be_bytes());
        assert_eq!(&payload[2..], b"default export");

        let (reply, payload) = read_option_reply(&mut client).await;
        assert_eq!(reply.reply_type, NBD_REP_INFO);
        let block = InfoBlockSize::from_bytes(payload.as_slice().try_into().unwrap());
        assert_eq!(block.minimum, 1);
        assert_eq!(block.preferred, 4096);
        assert_eq!(block.maximum, NBD_MAX_PAYLOAD_SIZE);

        let (ack, payload) = read_option_reply(&mut client).await;
        assert_eq!(ack.option, NBD_OPT_GO);
        assert_eq!(ack.reply_type, NBD_REP_ACK);
        assert!(payload.is_empty());

        send_request(&mut client, NBD_CMD_DISCONNECT, 0, 0, 0, &[]).await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn multi_conn_flag_follows_options() {
        let (server, _) = single_export_server(ServerOptions {
            supports_multi_conn: false,
            ..Default::default()
        });
        let (mut client, task) = start_session(server);

        run_handshake(&mut client).await;
        send_go(&mut client, NBD_OPT_INFO, "default").await;

        let (_, payload) = read_option_reply(&mut client).await;
        let info = InfoExport::from_bytes(payload.as_slice().try_into().unwrap());
        assert_eq!(info.transmission_flags, 0);

        drop(client);
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn info_keeps_haggling() {
        let (server, _) = single_export_server(ServerOptions::default());
        let (mut client, task) = start_session(server);

        run_handshake(&mut client).await;
        send_go(&mut client, NBD_OPT_INFO, "default").await;
        drain_go_replies(&mut client, NBD_OPT_INFO).await;

        // Still in haggling: ABORT is acknowledged and the session ends
        // cleanly.
        client
            .write_all(
                &OptionHeader {
                    option: NBD_OPT_ABORT,
                    length: 0,
                }
                .to_bytes(),
            )
            .await
            .unwrap();
        let (ack, _) = read_option_reply(&mut client).await;
        assert_eq!(ack.reply_type, NBD_REP_ACK);

        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn list_returns_registered_exports() {
        let server = Server::new(
            vec![
                export("default", Arc::new(MemoryBackend::zeroed(8))),
                export("data", Arc::new(MemoryBackend::zeroed(8))),
            ],
            ServerOptions::default(),
        )
        .unwrap();
        let (mut client, task) = start_session(server);

        run_handshake(&mut client).await;
        client
            .write_all(
                &OptionHeader {
                    option: NBD_OPT_LIST,
                    length: 0,
                }
                .to_bytes(),
            )
            .await
            .unwrap();

        let (reply, payload) = read_option_reply(&mut client).await;
        assert_eq!(reply.option, NBD_OPT_LIST);
        assert_eq!(reply.reply_type, NBD_REP_SERVER);
        let mut expected = Vec::new();
        expected.extend_from_slice(&7u32.to_be_bytes());
        expected.extend_from_slice(b"default");
        expected.extend_from_slice(&4u32.to_be_bytes());
        expected.extend_from_slice(b"data");
        assert_eq!(payload, expected);

        let (ack, _) = read_option_reply(&mut client).await;
        assert_eq!(ack.reply_type, NBD_REP_ACK);

        // LIST leaves the session in haggling; GO still works.
        send_go(&mut client, NBD_OPT_GO, "data").await;
        drain_go_replies(&mut client, NBD_OPT_GO).await;

        send_request(&mut client, NBD_CMD_DISCONNECT, 0, 0, 0, &[]).await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let (server, _) = single_export_server(ServerOptions::default());
        let (mut client, task) = start_session(server);

        run_handshake(&mut client).await;
        send_go(&mut client, NBD_OPT_GO, "default").await;
        drain_go_replies(&mut client, NBD_OPT_GO).await;

        send_request(&mut client, NBD_CMD_WRITE, 42, 0, 4, &[0xDE, 0xAD, 0xBE, 0xEF]).await;
        assert_eq!(read_simple_reply(&mut client).await, NbdReply::ok(42));

        send_request(&mut client, NBD_CMD_READ, 43, 0, 8, &[]).await;
        assert_eq!(read_simple_reply(&mut client).await, NbdReply::ok(43));
        let mut data = [0u8; 8];
        client.read_exact(&mut data).await.unwrap();
        assert_eq!(data, [0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 0]);

        send_request(&mut client, NBD_CMD_DISCONNECT, 0, 0, 0, &[]).await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn read_only_write_gets_eperm_and_backend_is_untouched() {
        let (server, backend) = single_export_server(ServerOptions {
            read_only: true,
            ..Default::default()
        });
        let (mut client, task) = start_session(server);

        run_handshake(&mut client).await;
        send_go(&mut client, NBD_OPT_GO, "default").await;
        drain_go_replies(&mut client, NBD_OPT_GO).await;

        send_request(&mut client, NBD_CMD_WRITE, 7, 0, 4, &[0xAA, 0xBB, 0xCC, 0xDD]).await;
        assert_eq!(
            read_simple_reply(&mut client).await,
            NbdReply::error(7, NBD_EPERM)
        );

        let mut contents = [0u8; 8];
        backend.read_exact_at(&mut contents, 0).await.unwrap();
        assert_eq!(contents, [0u8; 8]);

        send_request(&mut client, NBD_CMD_DISCONNECT, 0, 0, 0, &[]).await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_command_gets_einval_on_same_handle() {
        let (server, _) = single_export_server(ServerOptions::default());
        let (mut client, task) = start_session(server);

        run_handshake(&mut client).await;
        send_go(&mut client, NBD_OPT_GO, "default").await;
        drain_go_replies(&mut client, NBD_OPT_GO).await;

        send_request(&mut client, 99, 9, 0, 3, &[1, 2, 3]).await;
        assert_eq!(
            read_simple_reply(&mut client).await,
            NbdReply::error(9, NBD_EINVAL)
        );

        // The session survives and still serves requests.
        send_request(&mut client, NBD_CMD_READ, 10, 0, 2, &[]).await;
        assert_eq!(read_simple_reply(&mut client).await, NbdReply::ok(10));
        let mut data = [0u8; 2];
        client.read_exact(&mut data).await.unwrap();

        send_request(&mut client, NBD_CMD_DISCONNECT, 0, 0, 0, &[]).await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn flush_is_not_advertised_and_gets_einval() {
        let (server, _) = single_export_server(ServerOptions::default());
        let (mut client, task) = start_session(server);

        run_handshake(&mut client).await;
        send_go(&mut client, NBD_OPT_GO, "default").await;
        drain_go_replies(&mut client, NBD_OPT_GO).await;

        send_request(&mut client, NBD_CMD_FLUSH, 5, 0, 0, &[]).await;
        assert_eq!(
            read_simple_reply(&mut client).await,
            NbdReply::error(5, NBD_EINVAL)
        );

        send_request(&mut client, NBD_CMD_DISCONNECT, 0, 0, 0, &[]).await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_export_replies_err_unknown_and_keeps_haggling() {
        let (server, _) = single_export_server(ServerOptions::default());
        let (mut client, task) = start_session(server);

        run_handshake(&mut client).await;
        send_go_framed(&mut client, "missing").await;

        let (reply, payload) = read_option_reply(&mut client).await;
        assert_eq!(reply.reply_type, NBD_REP_ERR_UNKNOWN);
        assert!(payload.is_empty());

        // A subsequent GO on a valid name still succeeds.
        send_go_framed(&mut client, "default").await;
        drain_go_replies(&mut client, NBD_OPT_GO).await;

        send_request(&mut client, NBD_CMD_DISCONNECT, 0, 0, 0, &[]).await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_option_replies_err_unsup_and_keeps_haggling() {
        let (server, _) = single_export_server(ServerOptions::default());
        let (mut client, task) = start_session(server);

        run_handshake(&mut client).await;
        client
            .write_all(
                &OptionHeader {
                    option: 0x5555,
                    length: 4,
                }
                .to_bytes(),
            )
            .await
            .unwrap();
        client.write_all(&[1, 2, 3, 4]).await.unwrap();

        let (reply, _) = read_option_reply(&mut client).await;
        assert_eq!(reply.option, 0x5555);
        assert_eq!(reply.reply_type, NBD_REP_ERR_UNSUP);

        client
            .write_all(
                &OptionHeader {
                    option: NBD_OPT_ABORT,
                    length: 0,
                }
                .to_bytes(),
            )
            .await
            .unwrap();
        let (ack, _) = read_option_reply(&mut client).await;
        assert_eq!(ack.reply_type, NBD_REP_ACK);

        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bad_option_magic_is_fatal() {
        let (server, _) = single_export_server(ServerOptions::default());
        let (mut client, task) = start_session(server);

        run_handshake(&mut client).await;
        let mut header = OptionHeader {
            option: NBD_OPT_GO,
            length: 0,
        }
        .to_bytes();
        header[0..8].copy_from_slice(&0xDEADBEEFu64.to_be_bytes());
        client.write_all(&header).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, NbdError::InvalidMagic { .. }));
    }

    #[tokio::test]
    async fn oversized_request_is_fatal() {
        let (server, _) = single_export_server(ServerOptions {
            maximum_request_size: 1024,
            ..Default::default()
        });
        let (mut client, task) = start_session(server);

        run_handshake(&mut client).await;
        send_go(&mut client, NBD_OPT_GO, "default").await;
        drain_go_replies(&mut client, NBD_OPT_GO).await;

        send_request(&mut client, NBD_CMD_WRITE, 1, 0, 2048, &[]).await;

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, NbdError::RequestTooLarge { .. }));
    }

    #[tokio::test]
    async fn bad_request_magic_is_fatal() {
        let (server, _) = single_export_server(ServerOptions::default());
        let (mut client, task) = start_session(server);

        run_handshake(&mut client).await;
        send_go(&mut client, NBD_OPT_GO, "default").await;
        drain_go_replies(&mut client, NBD_OPT_GO).await;

        let mut request = NbdRequest {
            flags: 0,
            command: NBD_CMD_READ,
            handle: 1,
            offset: 0,
            length: 4,
        }
        .to_bytes();
        request[0..4].copy_from_slice(&0xDEADBEEFu32.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, NbdError::InvalidMagic { .. }));
    }

    #[test]
    fn server_rejects_duplicate_export_names() {
        let result = Server::new(
            vec![
                export("default", Arc::new(MemoryBackend::zeroed(8))),
                export("default", Arc::new(MemoryBackend::zeroed(8))),
            ],
            ServerOptions::default(),
        );
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::DuplicateExport { .. }))
        ));
    }

    #[test]
    fn server_rejects_empty_export_name() {
        let result = Server::new(
            vec![export("", Arc::new(MemoryBackend::zeroed(8)))],
            ServerOptions::default(),
        );
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::InvalidValue { .. }))
        ));
    }

    #[test]
    fn options_reject_unordered_block_sizes() {
        let options = ServerOptions {
            minimum_block_size: 4096,
            preferred_block_size: 512,
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = ServerOptions {
            minimum_block_size: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }
}
