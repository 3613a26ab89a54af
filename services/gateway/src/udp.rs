//! UDP listeners: one receive loop per socket, one worker task per datagram.
//!
//! BLU devices get a server-assigned 32-bit pseudo-session at login; every
//! later datagram carries it, and an unknown or expired id is answered with
//! a re-login prompt rather than an error.  Meiligao units speak the Concox
//! frame format one frame per datagram; their identity is a per-remote-
//! address binding established by a login frame.
//!
//! A framing violation drops the datagram.  A storage failure drops the
//! acknowledgement, so the device retries.

use crate::GatewayCtx;
use crate::registry::RegistryError;
use chrono::{DateTime, Duration, Utc};
use fleet_core::ProtocolKind;
use ft_protocol::record::Record;
use ft_protocol::{blu, concox};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

const DATAGRAM_BUF: usize = 4096;

// ---------------------------------------------------------------------------
// BLU
// ---------------------------------------------------------------------------

pub async fn serve_blu(socket: UdpSocket, ctx: Arc<GatewayCtx>, mut shutdown: watch::Receiver<bool>) {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; DATAGRAM_BUF];
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            recv = socket.recv_from(&mut buf) => {
                match recv {
                    Err(e) => warn!(error = %e, "blu recv failed"),
                    Ok((n, addr)) => {
                        let datagram = buf[..n].to_vec();
                        let ctx = Arc::clone(&ctx);
                        let socket = Arc::clone(&socket);
                        tokio::spawn(async move {
                            handle_blu_datagram(&ctx, &socket, addr, &datagram).await;
                        });
                    }
                }
            }
        }
    }
}

async fn handle_blu_datagram(
    ctx: &GatewayCtx,
    socket: &UdpSocket,
    addr: SocketAddr,
    datagram: &[u8],
) {
    let now = Utc::now();
    let packet = match blu::decode(datagram) {
        Ok(packet) => packet,
        Err(e) => {
            debug!(%addr, error = %e, "dropping blu datagram");
            return;
        }
    };

    match packet {
        blu::BluPacket::Login { imei, mac } => {
            let handle = match ctx.registry.find_or_create(imei, ProtocolKind::Blu, now).await {
                Ok((handle, created)) => {
                    info!(imei, %addr, created, mac = ?mac, "blu login");
                    handle
                }
                // Out-of-range IMEI: no device, no session, no reply.
                Err(RegistryError::InvalidImei(e)) => {
                    info!(%addr, error = %e, "blu login rejected");
                    return;
                }
                Err(e) => {
                    warn!(%addr, error = %e, "blu login failed");
                    return;
                }
            };
            if let Err(e) = ctx.registry.record_connect(&handle, addr, now).await {
                warn!(imei, error = %e, "connect bookkeeping failed");
                return;
            }
            let session = match ctx.sessions.open(imei, addr, now).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(imei, error = %e, "session open failed");
                    return;
                }
            };
            // A device we have no firmware string for is asked to identify
            // itself before streaming data.
            let cmd = if handle.lock().await.firmware.is_empty() {
                blu::CMD_REQUEST_DEVINFO
            } else {
                blu::CMD_DATA_OK
            };
            send(socket, addr, &blu::encode_session_reply(session.id, cmd)).await;
        }

        blu::BluPacket::Ping { session } => {
            let Some(live) = touch_session(ctx, socket, addr, session, now).await else {
                return;
            };
            if let Some(handle) = load_device(ctx, live.imei).await {
                let mut device = handle.lock().await;
                if now > device.last_contact {
                    device.last_contact = now;
                }
                device.status = fleet_core::ConnStatus::Online;
                if let Err(e) = ctx.registry.persist(&device).await {
                    warn!(imei = live.imei, error = %e, "contact update failed");
                    return;
                }
            }
            reply_with_command(ctx, socket, addr, live.imei, session, now).await;
        }

        blu::BluPacket::DevinfoResponse {
            session,
            firmware,
        } => {
            let Some(live) = touch_session(ctx, socket, addr, session, now).await else {
                return;
            };
            let Some(handle) = load_device(ctx, live.imei).await else {
                return;
            };
            let records = [Record::Devinfo { firmware }];
            if let Err(e) = ctx.pipeline.ingest(&handle, &records, now).await {
                warn!(imei = live.imei, error = %e, "devinfo ingest failed");
                return;
            }
            reply_with_command(ctx, socket, addr, live.imei, session, now).await;
        }

        blu::BluPacket::Data { session, records } => {
            let Some(live) = touch_session(ctx, socket, addr, session, now).await else {
                return;
            };
            let Some(handle) = load_device(ctx, live.imei).await else {
                return;
            };
            let mut decoded = Vec::new();
            for raw in &records {
                match blu::decode_record(raw.id, &raw.body) {
                    Ok(records) => decoded.extend(records),
                    Err(e) => {
                        warn!(imei = live.imei, id = raw.id, error = %e, "blu record skipped");
                    }
                }
            }
            let report = match ctx.pipeline.ingest(&handle, &decoded, now).await {
                Ok(report) => report,
                // No ack: the device resends the datagram.
                Err(e) => {
                    warn!(imei = live.imei, error = %e, "ingest failed");
                    return;
                }
            };
            if let Err(e) = ctx
                .sessions
                .add_records(session, report.records as u64)
                .await
            {
                warn!(imei = live.imei, error = %e, "session counter update failed");
            }
            reply_with_command(ctx, socket, addr, live.imei, session, now).await;
        }
    }
}

/// Resolve and extend a session, answering unknown ids with the re-login
/// prompt.
async fn touch_session(
    ctx: &GatewayCtx,
    socket: &UdpSocket,
    addr: SocketAddr,
    session: u32,
    now: DateTime<Utc>,
) -> Option<crate::session::UdpSession> {
    match ctx.sessions.touch(session, addr, now).await {
        Ok(Some(live)) => Some(live),
        Ok(None) => {
            debug!(%addr, session, "unknown session, requesting re-login");
            send(socket, addr, &blu::encode_relogin()).await;
            None
        }
        Err(e) => {
            warn!(%addr, session, error = %e, "session lookup failed");
            None
        }
    }
}

async fn load_device(ctx: &GatewayCtx, imei: u64) -> Option<crate::registry::DeviceHandle> {
    match ctx.registry.get_or_load(imei).await {
        Ok(Some(handle)) => Some(handle),
        Ok(None) => {
            warn!(imei, "session references a missing device");
            None
        }
        Err(e) => {
            warn!(imei, error = %e, "device load failed");
            None
        }
    }
}

/// Answer a datagram, piggy-backing the oldest queued datagram command and
/// marking it sent only after a clean socket write.
async fn reply_with_command(
    ctx: &GatewayCtx,
    socket: &UdpSocket,
    addr: SocketAddr,
    imei: u64,
    session: u32,
    now: DateTime<Utc>,
) {
    let staged = match ctx.dispatcher.stage_blu(imei).await {
        Ok(staged) => staged,
        Err(e) => {
            warn!(imei, error = %e, "command staging failed");
            None
        }
    };
    let cmd = staged.as_ref().map_or(blu::CMD_DATA_OK, |s| s.cmd);
    let wire = blu::encode_session_reply(session, cmd);
    match socket.send_to(&wire, addr).await {
        Ok(_) => {
            if let Some(staged) = staged {
                if let Err(e) = ctx.dispatcher.commit_blu(staged, now).await {
                    warn!(imei, error = %e, "command commit failed");
                }
            }
        }
        // Command stays pending for the next contact.
        Err(e) => warn!(imei, %addr, error = %e, "reply send failed"),
    }
}

async fn send(socket: &UdpSocket, addr: SocketAddr, bytes: &[u8]) {
    if let Err(e) = socket.send_to(bytes, addr).await {
        warn!(%addr, error = %e, "send failed");
    }
}

// ---------------------------------------------------------------------------
// Meiligao
// ---------------------------------------------------------------------------

/// Identity binding for one remote address, established by a login frame.
#[derive(Debug, Clone, Copy)]
struct MeiligaoPeer {
    imei: u64,
    expires: DateTime<Utc>,
}

type PeerMap = Arc<RwLock<HashMap<SocketAddr, MeiligaoPeer>>>;

pub async fn serve_meiligao(
    socket: UdpSocket,
    ctx: Arc<GatewayCtx>,
    mut shutdown: watch::Receiver<bool>,
) {
    let socket = Arc::new(socket);
    let peers: PeerMap = Arc::new(RwLock::new(HashMap::new()));
    let mut buf = vec![0u8; DATAGRAM_BUF];
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            recv = socket.recv_from(&mut buf) => {
                match recv {
                    Err(e) => warn!(error = %e, "meiligao recv failed"),
                    Ok((n, addr)) => {
                        let datagram = buf[..n].to_vec();
                        let ctx = Arc::clone(&ctx);
                        let socket = Arc::clone(&socket);
                        let peers = Arc::clone(&peers);
                        tokio::spawn(async move {
                            handle_meiligao_datagram(&ctx, &peers, &socket, addr, &datagram).await;
                        });
                    }
                }
            }
        }
    }
}

async fn handle_meiligao_datagram(
    ctx: &GatewayCtx,
    peers: &PeerMap,
    socket: &UdpSocket,
    addr: SocketAddr,
    datagram: &[u8],
) {
    let now = Utc::now();
    let frame = match concox::decode(datagram) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(%addr, error = %e, "dropping meiligao datagram");
            if let Some(peer) = peers.read().await.get(&addr).copied() {
                if let Err(e) = ctx.registry.record_error(peer.imei).await {
                    warn!(imei = peer.imei, error = %e, "error count update failed");
                }
            }
            return;
        }
    };

    match &frame.payload {
        concox::ConcoxPayload::Login { imei } => {
            let handle = match ctx
                .registry
                .find_or_create(*imei, ProtocolKind::Meiligao, now)
                .await
            {
                Ok((handle, created)) => {
                    info!(imei, %addr, created, "meiligao login");
                    handle
                }
                Err(e) => {
                    info!(%addr, error = %e, "meiligao login rejected");
                    return;
                }
            };
            if let Err(e) = ctx.registry.record_connect(&handle, addr, now).await {
                warn!(imei, error = %e, "connect bookkeeping failed");
                return;
            }
            peers.write().await.insert(
                addr,
                MeiligaoPeer {
                    imei: *imei,
                    expires: now + session_ttl(ctx),
                },
            );
            send(socket, addr, &concox::encode_ack(frame.proto, frame.serial)).await;
        }

        concox::ConcoxPayload::Position(_) | concox::ConcoxPayload::Status { .. } => {
            let peer = peers.read().await.get(&addr).copied();
            let imei = match peer {
                Some(peer) if peer.expires > now => peer.imei,
                Some(_) => {
                    debug!(%addr, "stale meiligao binding dropped");
                    peers.write().await.remove(&addr);
                    return;
                }
                // Data from an address that never logged in.
                None => {
                    debug!(%addr, "datagram from unbound address dropped");
                    return;
                }
            };
            let Some(handle) = load_device(ctx, imei).await else {
                return;
            };
            let records = frame.records();
            match ctx.pipeline.ingest(&handle, &records, now).await {
                Ok(_) => {
                    if let Some(peer) = peers.write().await.get_mut(&addr) {
                        peer.expires = now + session_ttl(ctx);
                    }
                    send(socket, addr, &concox::encode_ack(frame.proto, frame.serial)).await;
                }
                // No ack: the device resends.
                Err(e) => warn!(imei, error = %e, "ingest failed"),
            }
        }

        concox::ConcoxPayload::Command(_) => {
            warn!(%addr, "device sent a server command frame, skipping");
        }
    }
}

fn session_ttl(ctx: &GatewayCtx) -> Duration {
    Duration::from_std(ctx.udp_session_ttl).unwrap_or_else(|_| Duration::hours(10))
}
