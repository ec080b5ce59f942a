//! NBD (Network Block Device) newstyle server
//!
//! Implements the fixed newstyle handshake and the simple-reply
//! transmission phase over any byte stream. Exports are bridged devices
//! selected by name during option negotiation.

#![allow(clippy::cast_possible_truncation)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use blockbridge_block::{BridgeError, IoBridge, IoBuffer, IoOutcome};

// ── NBD protocol constants ────────────────────────────────────────────────────

const NBD_MAGIC: u64 = 0x4e42_444d_4147_4943; // "NBDMAGIC"
const NBD_IHAVEOPT: u64 = 0x4948_4156_454f_5054; // "IHAVEOPT"
const NBD_OPTION_REPLY_MAGIC: u64 = 0x0003_e889_0455_65a9;
const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
const NBD_REPLY_MAGIC: u32 = 0x6744_6698;

// Handshake flags
const NBD_FLAG_FIXED_NEWSTYLE: u16 = 0x0001;
const NBD_FLAG_NO_ZEROES: u16 = 0x0002;

// Option IDs
const NBD_OPT_EXPORT_NAME: u32 = 1;
const NBD_OPT_ABORT: u32 = 2;
const NBD_OPT_LIST: u32 = 3;
const NBD_OPT_INFO: u32 = 6;
const NBD_OPT_GO: u32 = 7;

// Reply types
const NBD_REP_ACK: u32 = 1;
const NBD_REP_SERVER: u32 = 2;
const NBD_REP_INFO: u32 = 3;
const NBD_REP_ERR_UNSUP: u32 = 0x8000_0001;
const NBD_REP_ERR_INVALID: u32 = 0x8000_0003;
const NBD_REP_ERR_UNKNOWN: u32 = 0x8000_0006;
const NBD_REP_ERR_SHUTDOWN: u32 = 0x8000_0007;

// Transmission flags
const NBD_FLAG_HAS_FLAGS: u16 = 0x0001;
const NBD_FLAG_READ_ONLY: u16 = 0x0002;
const NBD_FLAG_SEND_FLUSH: u16 = 0x0004;

const NBD_INFO_EXPORT: u16 = 0;

// Commands
const NBD_CMD_READ: u16 = 0;
const NBD_CMD_WRITE: u16 = 1;
const NBD_CMD_DISC: u16 = 2;
const NBD_CMD_FLUSH: u16 = 3;

const EPERM: u32 = 1;
const EINVAL: u32 = 22;

/// Largest payload accepted in one command
const MAX_REQUEST_BYTES: u32 = 32 * 1024 * 1024;

// ── Wire types ────────────────────────────────────────────────────────────────

/// One transmission-phase request header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NbdRequest {
    flags: u16,
    command: u16,
    handle: u64,
    offset: u64,
    length: u32,
}

impl NbdRequest {
    /// Read a 28-byte request header
    async fn read_from<S: AsyncRead + Unpin>(stream: &mut S) -> anyhow::Result<Self> {
        let magic = stream.read_u32().await?;
        if magic != NBD_REQUEST_MAGIC {
            bail!("bad request magic: {magic:#x}");
        }
        Ok(Self {
            flags: stream.read_u16().await?,
            command: stream.read_u16().await?,
            handle: stream.read_u64().await?,
            offset: stream.read_u64().await?,
            length: stream.read_u32().await?,
        })
    }
}

#[derive(Clone)]
struct NbdExport {
    bridge: Arc<IoBridge>,
    read_only: bool,
}

/// A negotiated session: the export plus the access actually granted
struct Session {
    name: String,
    bridge: Arc<IoBridge>,
    read_only: bool,
}

// ── Server ────────────────────────────────────────────────────────────────────

/// NBD front end multiplexing bridged devices by export name
#[derive(Default)]
pub struct NbdServer {
    exports: RwLock<HashMap<String, NbdExport>>,
}

impl NbdServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device as an NBD export
    pub fn register(&self, name: &str, bridge: Arc<IoBridge>, read_only: bool) {
        self.exports
            .write()
            .insert(name.to_string(), NbdExport { bridge, read_only });
        info!("NBD: registered export '{name}'");
    }

    /// Unregister an export; returns its device
    pub fn unregister(&self, name: &str) -> Option<Arc<IoBridge>> {
        let export = self.exports.write().remove(name)?;
        info!("NBD: unregistered export '{name}'");
        Some(export.bridge)
    }

    /// Accept clients until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("NBD: listening on {addr}");
        }

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        let peer = peer.to_string();
                        if let Err(e) = server.handle_client(stream, &peer).await {
                            warn!("NBD: client {peer} error: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("NBD: accept error: {e}");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Run one client connection to completion
    pub async fn handle_client<S>(&self, mut stream: S, peer: &str) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        info!("NBD: client {peer} connected");

        stream.write_u64(NBD_MAGIC).await?;
        stream.write_u64(NBD_IHAVEOPT).await?;
        stream
            .write_u16(NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES)
            .await?;
        stream.flush().await?;

        let client_flags = stream.read_u32().await?;
        debug!("NBD: client {peer} flags {client_flags:#x}");

        let session = self.negotiate_options(&mut stream).await?;
        let result = Self::data_phase(&mut stream, &session, peer).await;
        let openers = session.bridge.close();
        info!(
            "NBD: client {peer} disconnected from '{}' ({openers} openers left)",
            session.name
        );
        result
    }

    async fn negotiate_options<S>(&self, stream: &mut S) -> anyhow::Result<Session>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let magic = stream.read_u64().await?;
            if magic != NBD_IHAVEOPT {
                bail!("bad option magic: {magic:#x}");
            }
            let option = stream.read_u32().await?;
            let data_len = stream.read_u32().await?;
            if data_len > 4096 {
                bail!("option {option} data too large ({data_len} bytes)");
            }
            let mut option_data = vec![0u8; data_len as usize];
            stream.read_exact(&mut option_data).await?;

            match option {
                NBD_OPT_ABORT => {
                    send_option_reply(stream, option, NBD_REP_ACK, &[]).await?;
                    bail!("client sent NBD_OPT_ABORT");
                }

                NBD_OPT_LIST => {
                    let names: Vec<String> = self.exports.read().keys().cloned().collect();
                    for name in &names {
                        let mut reply = Vec::with_capacity(4 + name.len());
                        reply.extend_from_slice(&(name.len() as u32).to_be_bytes());
                        reply.extend_from_slice(name.as_bytes());
                        send_option_reply(stream, option, NBD_REP_SERVER, &reply).await?;
                    }
                    send_option_reply(stream, option, NBD_REP_ACK, &[]).await?;
                }

                NBD_OPT_INFO | NBD_OPT_GO => {
                    let Some(name) = parse_export_name(&option_data) else {
                        send_option_reply(stream, option, NBD_REP_ERR_INVALID, b"malformed option")
                            .await?;
                        continue;
                    };
                    let export = self.exports.read().get(&name).cloned();
                    let Some(export) = export else {
                        send_option_reply(stream, option, NBD_REP_ERR_UNKNOWN, b"export not found")
                            .await?;
                        continue;
                    };

                    let session = if option == NBD_OPT_GO {
                        match open_session(name, &export).await {
                            Ok(session) => Some(session),
                            Err(e) => {
                                warn!("NBD: cannot open export: {e}");
                                let message = e.to_string();
                                send_option_reply(
                                    stream,
                                    option,
                                    NBD_REP_ERR_SHUTDOWN,
                                    message.as_bytes(),
                                )
                                .await?;
                                continue;
                            }
                        }
                    } else {
                        None
                    };

                    let read_only = session.as_ref().map_or(export.read_only, |s| s.read_only);
                    let size = match export.bridge.query_capacity().await {
                        Ok(size) => size,
                        Err(e) => {
                            if session.is_some() {
                                export.bridge.close();
                            }
                            let message = e.to_string();
                            send_option_reply(stream, option, NBD_REP_ERR_SHUTDOWN, message.as_bytes())
                                .await?;
                            continue;
                        }
                    };

                    let mut info = Vec::with_capacity(12);
                    info.extend_from_slice(&NBD_INFO_EXPORT.to_be_bytes());
                    info.extend_from_slice(&size.to_be_bytes());
                    info.extend_from_slice(&transmission_flags(read_only).to_be_bytes());
                    send_option_reply(stream, option, NBD_REP_INFO, &info).await?;
                    send_option_reply(stream, option, NBD_REP_ACK, &[]).await?;

                    if let Some(session) = session {
                        return Ok(session);
                    }
                }

                NBD_OPT_EXPORT_NAME => {
                    // Old-style selection: no option reply, straight to transmission.
                    let name = String::from_utf8_lossy(&option_data).to_string();
                    let export = self.exports.read().get(&name).cloned();
                    let Some(export) = export else {
                        bail!("export '{name}' not found");
                    };
                    let session = open_session(name, &export).await?;
                    let size = match session.bridge.query_capacity().await {
                        Ok(size) => size,
                        Err(e) => {
                            session.bridge.close();
                            return Err(e.into());
                        }
                    };
                    stream.write_u64(size).await?;
                    stream
                        .write_u16(transmission_flags(session.read_only))
                        .await?;
                    stream.flush().await?;
                    return Ok(session);
                }

                _ => {
                    send_option_reply(stream, option, NBD_REP_ERR_UNSUP, b"unsupported").await?;
                }
            }
        }
    }

    async fn data_phase<S>(stream: &mut S, session: &Session, peer: &str) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let bridge = &session.bridge;
        let block_size = bridge.block_size();
        let aligned = |request: &NbdRequest| {
            request.offset % block_size == 0 && u64::from(request.length) % block_size == 0
        };

        loop {
            let request = NbdRequest::read_from(stream).await?;
            if request.length > MAX_REQUEST_BYTES {
                bail!("request of {} bytes exceeds the limit", request.length);
            }
            let sector = request.offset / block_size;

            match request.command {
                NBD_CMD_READ => {
                    if !aligned(&request) {
                        send_reply(stream, request.handle, EINVAL).await?;
                        continue;
                    }
                    let buf = IoBuffer::zeroed(request.length as usize);
                    let outcome = bridge.read_async(sector, buf.clone()).await;
                    match reply_error(&outcome, u64::from(request.length), peer) {
                        0 => {
                            stream.write_u32(NBD_REPLY_MAGIC).await?;
                            stream.write_u32(0).await?;
                            stream.write_u64(request.handle).await?;
                            stream.write_all(&buf.to_vec()).await?;
                            stream.flush().await?;
                        }
                        error => send_reply(stream, request.handle, error).await?,
                    }
                }

                NBD_CMD_WRITE => {
                    let mut data = vec![0u8; request.length as usize];
                    stream.read_exact(&mut data).await?;
                    if session.read_only {
                        send_reply(stream, request.handle, EPERM).await?;
                        continue;
                    }
                    if !aligned(&request) {
                        send_reply(stream, request.handle, EINVAL).await?;
                        continue;
                    }
                    let outcome = bridge.write_async(sector, Bytes::from(data)).await;
                    let error = reply_error(&outcome, u64::from(request.length), peer);
                    send_reply(stream, request.handle, error).await?;
                }

                NBD_CMD_FLUSH => {
                    let outcome = bridge.flush_async().await;
                    send_reply(stream, request.handle, reply_error(&outcome, 0, peer)).await?;
                }

                NBD_CMD_DISC => {
                    info!("NBD: client {peer} sent disconnect for '{}'", session.name);
                    return Ok(());
                }

                command => {
                    warn!(
                        "NBD: unsupported command {command} (flags {:#x}) from {peer}",
                        request.flags
                    );
                    send_reply(stream, request.handle, EINVAL).await?;
                }
            }
        }
    }
}

/// Open the export, falling back to read-only when the device refuses writers
async fn open_session(name: String, export: &NbdExport) -> Result<Session, BridgeError> {
    let bridge = Arc::clone(&export.bridge);
    let read_only = match bridge.open(!export.read_only).await {
        Ok(_) => export.read_only,
        Err(BridgeError::Unauthoritative) => {
            info!("NBD: export '{name}' is not primary, serving it read-only");
            bridge.open(false).await?;
            true
        }
        Err(e) => return Err(e),
    };
    Ok(Session {
        name,
        bridge,
        read_only,
    })
}

fn transmission_flags(read_only: bool) -> u16 {
    let mut flags = NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH;
    if read_only {
        flags |= NBD_FLAG_READ_ONLY;
    }
    flags
}

/// Export name from NBD_OPT_INFO / NBD_OPT_GO data: u32 length + name + info requests
fn parse_export_name(data: &[u8]) -> Option<String> {
    let len = u32::from_be_bytes(data.get(..4)?.try_into().ok()?) as usize;
    let name = data.get(4..4 + len)?;
    Some(String::from_utf8_lossy(name).to_string())
}

/// NBD error for an outcome; a request cut short at the end of the
/// device is EINVAL
fn reply_error(outcome: &IoOutcome, expected: u64, peer: &str) -> u32 {
    match &outcome.status {
        Ok(()) if outcome.bytes < expected => {
            warn!(
                "NBD: request for {peer} runs past the end of the device ({} of {expected} bytes)",
                outcome.bytes
            );
            EINVAL
        }
        Ok(()) => 0,
        Err(e) if e.is_retryable() => {
            debug!("NBD: request for {peer} refused for now: {e}");
            e.nbd_errno()
        }
        Err(e) => {
            warn!("NBD: request for {peer} failed: {e}");
            e.nbd_errno()
        }
    }
}

async fn send_option_reply<S: AsyncWrite + Unpin>(
    stream: &mut S,
    option: u32,
    reply_type: u32,
    data: &[u8],
) -> anyhow::Result<()> {
    stream.write_u64(NBD_OPTION_REPLY_MAGIC).await?;
    stream.write_u32(option).await?;
    stream.write_u32(reply_type).await?;
    stream.write_u32(data.len() as u32).await?;
    if !data.is_empty() {
        stream.write_all(data).await?;
    }
    stream.flush().await?;
    Ok(())
}

async fn send_reply<S: AsyncWrite + Unpin>(
    stream: &mut S,
    handle: u64,
    error: u32,
) -> anyhow::Result<()> {
    stream.write_u32(NBD_REPLY_MAGIC).await?;
    stream.write_u32(error).await?;
    stream.write_u64(handle).await?;
    stream.flush().await?;
    Ok(())
}
