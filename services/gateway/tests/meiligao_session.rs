//! End-to-end Meiligao: Concox frames one per UDP datagram, identity bound
//! to the remote address by a login frame.

use chrono::{TimeZone, Utc};
use fleet_core::{EventKind, Position, ProtocolKind};
use ft_protocol::concox;
use ft_protocol::record::Fix;
use gateway::GatewayCtx;
use gateway::storage::{SqliteStore, shared};
use gateway::udp;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::timeout;

const IMEI: u64 = 354_330_148_862_581;

async fn start_server() -> (Arc<GatewayCtx>, SocketAddr, watch::Sender<bool>) {
    let config = gateway::config::load_config_from_str("schema_version = 1").unwrap();
    let storage = shared(SqliteStore::open_in_memory().unwrap());
    storage.lock().await.create_default_harness().unwrap();
    let ctx = GatewayCtx::build(&config, storage).await.unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(udp::serve_meiligao(socket, Arc::clone(&ctx), shutdown_rx));
    (ctx, addr, shutdown_tx)
}

fn recent_fix() -> Fix {
    Fix {
        time: Utc.timestamp_opt(Utc::now().timestamp() - 30, 0).unwrap(),
        position: Position::new(24.105_3, 56.946_1),
        speed: 50.0,
        course: 180,
        altitude: 12,
        satellites: Some(7),
        hdop: None,
        gps_valid: true,
    }
}

async fn recv(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = [0u8; 256];
    let (n, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("reply expected")
        .unwrap();
    buf[..n].to_vec()
}

#[tokio::test]
async fn login_binds_the_address_and_data_flows() {
    let (ctx, server, _shutdown) = start_server().await;
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    socket
        .send_to(&concox::encode_login(IMEI, 1), server)
        .await
        .unwrap();
    assert_eq!(recv(&socket).await, concox::encode_ack(concox::PROTO_LOGIN, 1));

    socket
        .send_to(&concox::encode_position(&recent_fix(), 2), server)
        .await
        .unwrap();
    assert_eq!(
        recv(&socket).await,
        concox::encode_ack(concox::PROTO_POSITION, 2)
    );

    let handle = ctx.registry.get_or_load(IMEI).await.unwrap().unwrap();
    let device = handle.lock().await;
    assert_eq!(device.protocol, ProtocolKind::Meiligao);
    let position = device.position.unwrap();
    assert!((position.lat - 56.946_1).abs() < 1e-6);
    drop(device);

    assert!(
        ctx.registry
            .storage()
            .lock()
            .await
            .get_latest_event(IMEI, EventKind::Track)
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn datagrams_from_unbound_addresses_are_dropped() {
    let (ctx, server, _shutdown) = start_server().await;
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    socket
        .send_to(&concox::encode_position(&recent_fix(), 1), server)
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    assert!(
        timeout(Duration::from_millis(300), socket.recv_from(&mut buf))
            .await
            .is_err(),
        "silent drop expected"
    );
    assert!(ctx.registry.get_or_load(IMEI).await.unwrap().is_none());
}

#[tokio::test]
async fn corrupt_datagram_is_dropped_and_counted() {
    let (ctx, server, _shutdown) = start_server().await;
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    socket
        .send_to(&concox::encode_login(IMEI, 1), server)
        .await
        .unwrap();
    let _ = recv(&socket).await;

    let mut frame = concox::encode_position(&recent_fix(), 2);
    let crc_at = frame.len() - 4;
    frame[crc_at] ^= 0xFF;
    socket.send_to(&frame, server).await.unwrap();

    let mut buf = [0u8; 64];
    assert!(
        timeout(Duration::from_millis(300), socket.recv_from(&mut buf))
            .await
            .is_err()
    );
    let handle = ctx.registry.get_or_load(IMEI).await.unwrap().unwrap();
    assert_eq!(handle.lock().await.error_count, 1);
}
