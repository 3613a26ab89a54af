//! End-to-end BLU: pseudo-sessions, datagram commands, re-login prompts.

use chrono::Utc;
use fleet_core::{CommandKind, EventKind};
use ft_protocol::blu;
use gateway::GatewayCtx;
use gateway::storage::{SqliteStore, shared};
use gateway::udp;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::timeout;

const IMEI: u64 = 123_456_789_012_345;
const MAC: [u8; 6] = [0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03];

async fn start_server() -> (Arc<GatewayCtx>, SocketAddr, watch::Sender<bool>) {
    let config = gateway::config::load_config_from_str("schema_version = 1").unwrap();
    let storage = shared(SqliteStore::open_in_memory().unwrap());
    storage.lock().await.create_default_harness().unwrap();
    let ctx = GatewayCtx::build(&config, storage).await.unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(udp::serve_blu(socket, Arc::clone(&ctx), shutdown_rx));
    (ctx, addr, shutdown_tx)
}

async fn client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn recv(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = [0u8; 256];
    let (n, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("reply expected")
        .unwrap();
    buf[..n].to_vec()
}

async fn login(socket: &UdpSocket, server: SocketAddr) -> u32 {
    socket
        .send_to(&blu::encode_login(IMEI, MAC), server)
        .await
        .unwrap();
    let reply = recv(socket).await;
    assert_eq!(reply[0], blu::PKT_SESSION);
    u32::from_le_bytes([reply[1], reply[2], reply[3], reply[4]])
}

#[tokio::test]
async fn unknown_imei_login_gets_no_reply_and_no_device() {
    let (ctx, server, _shutdown) = start_server().await;
    let socket = client().await;

    socket
        .send_to(&blu::encode_login(1, MAC), server)
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    assert!(
        timeout(Duration::from_millis(300), socket.recv_from(&mut buf))
            .await
            .is_err(),
        "silent drop expected"
    );
    assert!(ctx.registry.get_or_load(1).await.unwrap().is_none());
}

#[tokio::test]
async fn fresh_login_requests_devinfo_then_data_flows() {
    let (ctx, server, _shutdown) = start_server().await;
    let socket = client().await;

    socket
        .send_to(&blu::encode_login(IMEI, MAC), server)
        .await
        .unwrap();
    let reply = recv(&socket).await;
    assert_eq!(reply[0], blu::PKT_SESSION);
    // No firmware string on record yet: the server wants a devinfo first.
    assert_eq!(reply[5], blu::CMD_REQUEST_DEVINFO);
    let session = u32::from_le_bytes([reply[1], reply[2], reply[3], reply[4]]);

    socket
        .send_to(&blu::encode_devinfo_response(session, "fw-2.4"), server)
        .await
        .unwrap();
    let reply = recv(&socket).await;
    assert_eq!(reply, blu::encode_session_reply(session, blu::CMD_DATA_OK));

    let entry = blu::encode_track_entry(
        (Utc::now().timestamp() - 60) as u32,
        569_461_000,
        241_053_000,
        42,
        0x03,
    );
    let data = blu::encode_data(
        session,
        &[blu::RawRecord {
            id: blu::REC_TRACK,
            body: entry.to_vec(),
        }],
    );
    socket.send_to(&data, server).await.unwrap();
    let reply = recv(&socket).await;
    assert_eq!(reply, blu::encode_session_reply(session, blu::CMD_DATA_OK));

    let handle = ctx.registry.get_or_load(IMEI).await.unwrap().unwrap();
    let device = handle.lock().await;
    assert_eq!(device.firmware, "fw-2.4");
    let position = device.position.unwrap();
    assert!((position.lat - 56.946_1).abs() < 1e-6);
    assert!((device.speed - 42.0).abs() < f64::EPSILON);
    drop(device);

    let event = ctx
        .registry
        .storage()
        .lock()
        .await
        .get_latest_event(IMEI, EventKind::Track)
        .unwrap();
    assert!(event.is_some());
}

#[tokio::test]
async fn queued_motor_off_delivers_once_on_ping() {
    let (ctx, server, _shutdown) = start_server().await;
    let socket = client().await;
    let session = login(&socket, server).await;

    ctx.registry
        .storage()
        .lock()
        .await
        .enqueue_command(IMEI, &CommandKind::MotorOff)
        .unwrap();

    socket
        .send_to(&blu::encode_ping(session), server)
        .await
        .unwrap();
    let reply = recv(&socket).await;
    assert_eq!(reply, blu::encode_session_reply(session, blu::CMD_MOTOR_OFF));

    // The sent mark lands just after the reply; give the worker a beat.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Sent exactly once.
    {
        let store = ctx.registry.storage().lock().await;
        assert!(store.list_pending_commands(IMEI).unwrap().is_empty());
        assert!(!store.has_pending_command(IMEI, "motor_off").unwrap());
    }

    // A second ping must not redeliver.
    socket
        .send_to(&blu::encode_ping(session), server)
        .await
        .unwrap();
    let reply = recv(&socket).await;
    assert_eq!(reply, blu::encode_session_reply(session, blu::CMD_DATA_OK));
}

#[tokio::test]
async fn unknown_session_gets_relogin_prompt() {
    let (_ctx, server, _shutdown) = start_server().await;
    let socket = client().await;

    socket
        .send_to(&blu::encode_ping(0xDEAD_BEEF), server)
        .await
        .unwrap();
    assert_eq!(recv(&socket).await, blu::encode_relogin());
}

#[tokio::test]
async fn relogin_evicts_the_previous_session() {
    let (_ctx, server, _shutdown) = start_server().await;
    let socket = client().await;

    let first = login(&socket, server).await;
    let second = login(&socket, server).await;
    assert_ne!(first, second);

    // The old id is dead; the device is told to log in again.
    socket
        .send_to(&blu::encode_ping(first), server)
        .await
        .unwrap();
    assert_eq!(recv(&socket).await, blu::encode_relogin());

    socket
        .send_to(&blu::encode_ping(second), server)
        .await
        .unwrap();
    let reply = recv(&socket).await;
    assert_eq!(reply[0], blu::PKT_SESSION);
}

#[tokio::test]
async fn corrupt_datagram_is_dropped_silently() {
    let (_ctx, server, _shutdown) = start_server().await;
    let socket = client().await;
    let session = login(&socket, server).await;

    let entry = blu::encode_track_entry(Utc::now().timestamp() as u32, 0, 0, 0, 0);
    let mut data = blu::encode_data(
        session,
        &[blu::RawRecord {
            id: blu::REC_TRACK,
            body: entry.to_vec(),
        }],
    );
    // Flip a CRC byte.
    data[5] ^= 0xFF;
    socket.send_to(&data, server).await.unwrap();

    let mut buf = [0u8; 64];
    assert!(
        timeout(Duration::from_millis(300), socket.recv_from(&mut buf))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn second_login_reuses_the_known_firmware() {
    let (ctx, server, _shutdown) = start_server().await;
    let socket = client().await;
    let session = login(&socket, server).await;

    socket
        .send_to(&blu::encode_devinfo_response(session, "fw-2.4"), server)
        .await
        .unwrap();
    let _ = recv(&socket).await;

    // Re-login: the server already knows the firmware, so it goes straight
    // to data.
    socket
        .send_to(&blu::encode_login(IMEI, MAC), server)
        .await
        .unwrap();
    let reply = recv(&socket).await;
    assert_eq!(reply[0], blu::PKT_SESSION);
    assert_eq!(reply[5], blu::CMD_DATA_OK);

    let handle = ctx.registry.get_or_load(IMEI).await.unwrap().unwrap();
    assert_eq!(handle.lock().await.total_connections, 2);
}
