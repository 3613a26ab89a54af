//! Liveness monitor (C7).
//!
//! A periodic sweep walks every ONLINE device, transitions the silent ones
//! to OFFLINE, recomputes connection quality, and purges expired UDP
//! pseudo-sessions.  BLU devices ping on a short cadence and get a tighter
//! silence window than the TCP protocols.

use crate::registry::Registry;
use crate::session::UdpSessionMap;
use crate::storage::StorageResult;
use chrono::{DateTime, Duration, Utc};
use fleet_core::{ConnStatus, ProtocolKind, quality::connection_quality};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

pub struct Heartbeat {
    registry: Arc<Registry>,
    sessions: Arc<UdpSessionMap>,
    timeout: Duration,
    timeout_blu: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub swept: usize,
    pub taken_offline: usize,
    pub sessions_purged: usize,
}

impl Heartbeat {
    pub fn new(
        registry: Arc<Registry>,
        sessions: Arc<UdpSessionMap>,
        timeout: std::time::Duration,
        timeout_blu: std::time::Duration,
    ) -> Heartbeat {
        Heartbeat {
            registry,
            sessions,
            timeout: Duration::from_std(timeout).unwrap_or_else(|_| Duration::minutes(5)),
            timeout_blu: Duration::from_std(timeout_blu).unwrap_or_else(|_| Duration::minutes(2)),
        }
    }

    /// One pass over the fleet.
    pub async fn sweep(&self, now: DateTime<Utc>) -> StorageResult<SweepReport> {
        let online = self.registry.storage().lock().await.list_online_devices()?;

        let mut report = SweepReport {
            swept: online.len(),
            ..SweepReport::default()
        };
        for row in online {
            let Some(handle) = self.registry.get_or_load(row.imei).await? else {
                continue;
            };
            let mut device = handle.lock().await;
            if device.status != ConnStatus::Online {
                continue;
            }
            let silence = now - device.last_contact;
            let timeout = match device.protocol {
                ProtocolKind::Blu => self.timeout_blu,
                _ => self.timeout,
            };
            if silence > timeout {
                device.status = ConnStatus::Offline;
                report.taken_offline += 1;
                info!(
                    imei = device.imei,
                    silent_secs = silence.num_seconds(),
                    "device went offline"
                );
            }
            device.quality =
                connection_quality(silence, device.error_count, device.total_connections);
            self.registry.persist(&device).await?;
        }

        report.sessions_purged = self.sessions.purge_expired(now).await?;
        Ok(report)
    }

    /// Run sweeps until shutdown.  A pause (suspend, storage stall) is
    /// caught up with a single sweep, not a burst.
    pub async fn run(self: Arc<Self>, period: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        error!(error = %e, "liveness sweep failed");
                    }
                }
            }
        }
    }
}
