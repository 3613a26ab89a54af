//! Fleet-tracking gateway: multi-protocol GPS ingestion and sessions.
//!
//! The daemon accepts tracker connections over TCP (Wialon, Concox, SGAvl)
//! and UDP (Meiligao, BLU), identifies devices by IMEI, decodes frames into
//! typed records, persists an append-only event log, keeps per-device latest
//! state, and delivers queued outbound commands on the same channel.
//!
//! Wiring: listeners ([`tcp`], [`udp`]) feed the [`pipeline`], which resolves
//! devices through the [`registry`] and appends to [`storage`]; the
//! [`dispatch`]er piggy-backs queued commands onto replies; [`heartbeat`]
//! sweeps liveness on a timer.  Everything shares one [`GatewayCtx`].

pub mod config;
pub mod dispatch;
pub mod heartbeat;
pub mod pipeline;
pub mod registry;
pub mod session;
pub mod storage;
pub mod tcp;
pub mod udp;

use crate::config::GatewayConfig;
use crate::dispatch::Dispatcher;
use crate::pipeline::Pipeline;
use crate::registry::Registry;
use crate::session::UdpSessionMap;
use crate::storage::{SharedStorage, StorageResult};
use std::sync::Arc;

/// Shared state handed to every listener and worker task.
pub struct GatewayCtx {
    pub registry: Arc<Registry>,
    pub sessions: Arc<UdpSessionMap>,
    pub pipeline: Pipeline,
    pub dispatcher: Dispatcher,
    pub recv_timeout: std::time::Duration,
    pub udp_session_ttl: std::time::Duration,
    pub max_frame_ascii: usize,
    pub max_frame_binary: usize,
}

impl GatewayCtx {
    /// Assemble the runtime from config and an opened storage handle.
    pub async fn build(config: &GatewayConfig, storage: SharedStorage) -> StorageResult<Arc<GatewayCtx>> {
        let registry = Arc::new(Registry::new(
            Arc::clone(&storage),
            config.devices.alarm_mask_default,
        ));
        let ttl = chrono::Duration::from_std(config.timeouts.udp_session_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(10));
        let sessions = Arc::new(UdpSessionMap::load(storage, ttl).await?);
        let pipeline = Pipeline::new(
            Arc::clone(&registry),
            config.timeouts.time_skew_tolerance_days,
            config.firmware.autopush.clone(),
        );
        let dispatcher = Dispatcher::new(Arc::clone(&registry), config.firmware.dir.clone());
        Ok(Arc::new(GatewayCtx {
            registry,
            sessions,
            pipeline,
            dispatcher,
            recv_timeout: config.timeouts.recv_timeout,
            udp_session_ttl: config.timeouts.udp_session_ttl,
            max_frame_ascii: config.limits.max_frame_bytes_ascii,
            max_frame_binary: config.limits.max_frame_bytes_binary,
        }))
    }
}
