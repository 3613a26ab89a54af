//! TCP listeners: one accept loop per protocol, one task per connection.
//!
//! Connection discipline shared by all three protocols: `TCP_NODELAY` on
//! accept, a 45 s receive timeout (a quiescent timeout closes the session
//! normally), framing violations close the connection without
//! resynchronization, and a storage failure closes the connection without
//! acknowledging the frame so the device retries.

use crate::GatewayCtx;
use crate::registry::{DeviceHandle, RegistryError};
use crate::session::TcpSession;
use chrono::Utc;
use fleet_core::ProtocolKind;
use ft_protocol::framing::{BinaryFramer, SgAvlFramer, SgAvlItem, WialonFramer};
use ft_protocol::{DecodeError, concox, sgavl, wialon};
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Accept loops
// ---------------------------------------------------------------------------

macro_rules! accept_loop {
    ($name:ident, $conn:ident) => {
        pub async fn $name(
            listener: TcpListener,
            ctx: Arc<GatewayCtx>,
            mut shutdown: watch::Receiver<bool>,
        ) {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    accept = listener.accept() => {
                        match accept {
                            Ok((stream, addr)) => {
                                let ctx = Arc::clone(&ctx);
                                let shutdown = shutdown.clone();
                                tokio::spawn(async move {
                                    $conn(stream, addr, ctx, shutdown).await;
                                });
                            }
                            Err(e) => warn!(error = %e, "accept failed"),
                        }
                    }
                }
            }
        }
    };
}

accept_loop!(serve_wialon, wialon_connection);
accept_loop!(serve_concox, concox_connection);
accept_loop!(serve_sgavl, sgavl_connection);

// ---------------------------------------------------------------------------
// Wialon
// ---------------------------------------------------------------------------

async fn wialon_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<GatewayCtx>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(%addr, error = %e, "set_nodelay failed");
    }
    debug!(%addr, "wialon connection");
    let (read, mut write) = stream.into_split();
    let mut framed = FramedRead::new(read, WialonFramer::new(ctx.max_frame_ascii));
    let mut session = TcpSession::new(addr);
    let mut device: Option<DeviceHandle> = None;

    loop {
        let line = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
                continue;
            }
            frame = timeout(ctx.recv_timeout, framed.next()) => match frame {
                Err(_elapsed) => {
                    debug!(%addr, "receive timeout, closing quiescent session");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!(%addr, error = %e, "wialon framing error");
                    note_error(&ctx, &session).await;
                    break;
                }
                Ok(Some(Ok(line))) => line,
            },
        };

        match wialon::decode(&line) {
            Ok(wialon::WialonFrame::Login { imei, .. }) => {
                session.note_frame(line.len() + 2, 1);
                match login(&ctx, &mut session, imei, ProtocolKind::Wialon, addr).await {
                    Ok(handle) => {
                        device = Some(handle);
                        if write_all(&mut write, wialon::ACK_LOGIN_OK.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Err(RegistryError::InvalidImei(e)) => {
                        info!(%addr, error = %e, "login rejected");
                        let _ = write_all(&mut write, wialon::ACK_LOGIN_FAIL.as_bytes()).await;
                        break;
                    }
                    Err(RegistryError::Storage(e)) => {
                        warn!(%addr, error = %e, "login failed");
                        break;
                    }
                }
            }
            Ok(wialon::WialonFrame::Data(records)) => {
                session.note_frame(line.len() + 2, records.len());
                let Some(handle) = &device else {
                    let _ = write_all(&mut write, wialon::ACK_DATA_FAIL.as_bytes()).await;
                    break;
                };
                match ctx.pipeline.ingest(handle, &records, Utc::now()).await {
                    Ok(_) => {
                        if write_all(&mut write, wialon::ACK_DATA_OK.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    // No ack: the device retries the frame.
                    Err(e) => {
                        warn!(%addr, error = %e, "ingest failed");
                        break;
                    }
                }
            }
            Ok(wialon::WialonFrame::ShortData(records)) => {
                session.note_frame(line.len() + 2, records.len());
                let Some(handle) = &device else {
                    let _ = write_all(&mut write, wialon::ACK_DATA_FAIL.as_bytes()).await;
                    break;
                };
                match ctx.pipeline.ingest(handle, &records, Utc::now()).await {
                    Ok(_) => {
                        if write_all(&mut write, wialon::ACK_SHORT_DATA_OK.as_bytes())
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(%addr, error = %e, "ingest failed");
                        break;
                    }
                }
            }
            Ok(wialon::WialonFrame::Ping) => {
                session.note_frame(line.len() + 2, 1);
                if let Some(handle) = &device {
                    let _ = touch_device(&ctx, handle).await;
                }
                if write_all(&mut write, wialon::ACK_PING.as_bytes()).await.is_err() {
                    break;
                }
            }
            Err(DecodeError::Frame(e)) => {
                warn!(%addr, error = %e, "wialon protocol violation");
                note_error(&ctx, &session).await;
                break;
            }
            // Bad field in an otherwise well-framed line: negative-ack and
            // keep the connection.
            Err(e) => {
                warn!(%addr, error = %e, "undecodable wialon frame skipped");
                if write_all(&mut write, wialon::ACK_DATA_FAIL.as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    }
    end_session(&session, "wialon");
}

// ---------------------------------------------------------------------------
// Concox
// ---------------------------------------------------------------------------

async fn concox_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<GatewayCtx>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(%addr, error = %e, "set_nodelay failed");
    }
    debug!(%addr, "concox connection");
    let (read, mut write) = stream.into_split();
    let mut framed = FramedRead::new(read, BinaryFramer::new(ctx.max_frame_binary));
    let mut session = TcpSession::new(addr);
    let mut device: Option<DeviceHandle> = None;

    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
                continue;
            }
            frame = timeout(ctx.recv_timeout, framed.next()) => match frame {
                Err(_elapsed) => {
                    debug!(%addr, "receive timeout, closing quiescent session");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!(%addr, error = %e, "concox framing error");
                    note_error(&ctx, &session).await;
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            },
        };

        let decoded = match concox::decode(&frame) {
            Ok(decoded) => decoded,
            Err(DecodeError::Frame(e)) => {
                warn!(%addr, error = %e, "concox frame rejected");
                note_error(&ctx, &session).await;
                break;
            }
            Err(e) => {
                warn!(%addr, error = %e, "undecodable concox record skipped");
                continue;
            }
        };
        session.note_frame(frame.len(), 1);

        match &decoded.payload {
            concox::ConcoxPayload::Login { imei } => {
                match login(&ctx, &mut session, *imei, ProtocolKind::Concox, addr).await {
                    Ok(handle) => {
                        device = Some(handle);
                        let ack = concox::encode_ack(decoded.proto, decoded.serial);
                        if write_all(&mut write, &ack).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        info!(%addr, error = %e, "concox login rejected");
                        break;
                    }
                }
            }
            concox::ConcoxPayload::Position(_) | concox::ConcoxPayload::Status { .. } => {
                let Some(handle) = &device else {
                    warn!(%addr, "data before login");
                    break;
                };
                let records = decoded.records();
                match ctx.pipeline.ingest(handle, &records, Utc::now()).await {
                    Ok(_) => {
                        let ack = concox::encode_ack(decoded.proto, decoded.serial);
                        if write_all(&mut write, &ack).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(%addr, error = %e, "ingest failed");
                        break;
                    }
                }
            }
            // Command frames only flow server-to-device.
            concox::ConcoxPayload::Command(_) => {
                warn!(%addr, "device sent a server command frame, skipping");
            }
        }
    }
    end_session(&session, "concox");
}

// ---------------------------------------------------------------------------
// SGAvl
// ---------------------------------------------------------------------------

async fn sgavl_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<GatewayCtx>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(%addr, error = %e, "set_nodelay failed");
    }
    debug!(%addr, "sgavl connection");
    let (read, mut write) = stream.into_split();
    let mut framed = FramedRead::new(read, SgAvlFramer::new(ctx.max_frame_binary));
    let mut session = TcpSession::new(addr);
    let mut device: Option<DeviceHandle> = None;

    loop {
        let item = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
                continue;
            }
            item = timeout(ctx.recv_timeout, framed.next()) => match item {
                Err(_elapsed) => {
                    debug!(%addr, "receive timeout, closing quiescent session");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!(%addr, error = %e, "sgavl framing error");
                    note_error(&ctx, &session).await;
                    break;
                }
                Ok(Some(Ok(item))) => item,
            },
        };

        match item {
            SgAvlItem::Login { imei } => {
                session.note_frame(8, 0);
                match login(&ctx, &mut session, imei, ProtocolKind::Sgavl, addr).await {
                    Ok(handle) => device = Some(handle),
                    Err(e) => {
                        info!(%addr, error = %e, "sgavl login rejected");
                        break;
                    }
                }
            }
            SgAvlItem::Record { seq, id, body } => {
                let Some(handle) = &device else {
                    warn!(%addr, "record before login");
                    break;
                };
                session.note_frame(7 + body.len(), 1);

                match sgavl::decode_record(id, &body) {
                    Ok(records) => {
                        if let Err(e) = ctx.pipeline.ingest(handle, &records, Utc::now()).await {
                            // No ack: the device resends from this sequence.
                            warn!(%addr, seq, error = %e, "ingest failed");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(%addr, seq, id, error = %e, "undecodable sgavl record skipped");
                    }
                }

                // Every record ack is a delivery opportunity for queued
                // commands.
                let imei = session.imei.unwrap_or_default();
                let staged = match ctx.dispatcher.stage_sgavl(imei).await {
                    Ok(staged) => staged,
                    Err(e) => {
                        warn!(%addr, error = %e, "command staging failed");
                        break;
                    }
                };
                let reply = sgavl::encode_reply(1, &staged.blocks);
                if write_all(&mut write, &reply).await.is_err() {
                    // Commands stay pending for the next contact.
                    break;
                }
                if !staged.is_empty() {
                    if let Err(e) = ctx.dispatcher.commit_sgavl(staged, Utc::now()).await {
                        warn!(%addr, error = %e, "command commit failed");
                        break;
                    }
                }
            }
        }
    }
    end_session(&session, "sgavl");
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

async fn login(
    ctx: &GatewayCtx,
    session: &mut TcpSession,
    imei: u64,
    protocol: ProtocolKind,
    addr: SocketAddr,
) -> Result<DeviceHandle, RegistryError> {
    let now = Utc::now();
    let (handle, created) = ctx.registry.find_or_create(imei, protocol, now).await?;
    ctx.registry.record_connect(&handle, addr, now).await?;
    session.imei = Some(imei);
    info!(imei, %addr, protocol = %protocol, created, "device logged in");
    Ok(handle)
}

async fn touch_device(ctx: &GatewayCtx, handle: &DeviceHandle) -> Result<(), RegistryError> {
    let now = Utc::now();
    let mut device = handle.lock().await;
    if now > device.last_contact {
        device.last_contact = now;
    }
    device.status = fleet_core::ConnStatus::Online;
    ctx.registry.persist(&device).await?;
    Ok(())
}

async fn note_error(ctx: &GatewayCtx, session: &TcpSession) {
    if let Some(imei) = session.imei {
        if let Err(e) = ctx.registry.record_error(imei).await {
            warn!(imei, error = %e, "error count update failed");
        }
    }
}

async fn write_all(write: &mut OwnedWriteHalf, bytes: &[u8]) -> std::io::Result<()> {
    write.write_all(bytes).await
}

fn end_session(session: &TcpSession, protocol: &str) {
    info!(
        imei = session.imei,
        protocol,
        bytes = session.bytes,
        frames = session.frames,
        records = session.records,
        "session closed"
    );
}
