//! Session tracking (TCP connections and UDP pseudo-sessions).
//!
//! TCP sessions are plain per-connection state owned by the connection
//! task.  UDP sessions are server-assigned 32-bit ids handed out at BLU
//! login; the map is write-through to storage so sessions survive a
//! gateway restart, and the id allocator seeds from `max(id)+1`.

use crate::storage::{SharedStorage, StorageResult};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;

// ---------------------------------------------------------------------------
// TCP session context
// ---------------------------------------------------------------------------

/// Per-connection state; owned by the connection task, never shared.
#[derive(Debug)]
pub struct TcpSession {
    pub addr: SocketAddr,
    pub imei: Option<u64>,
    pub started: DateTime<Utc>,
    pub bytes: u64,
    pub frames: u64,
    pub records: u64,
}

impl TcpSession {
    pub fn new(addr: SocketAddr) -> TcpSession {
        TcpSession {
            addr,
            imei: None,
            started: Utc::now(),
            bytes: 0,
            frames: 0,
            records: 0,
        }
    }

    pub fn note_frame(&mut self, bytes: usize, records: usize) {
        self.bytes += bytes as u64;
        self.frames += 1;
        self.records += records as u64;
    }
}

// ---------------------------------------------------------------------------
// UDP sessions
// ---------------------------------------------------------------------------

/// A UDP pseudo-session.  At most one live session per IMEI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpSession {
    pub id: u32,
    pub imei: u64,
    pub addr: SocketAddr,
    pub expires: DateTime<Utc>,
    pub last_seq: u64,
}

pub struct UdpSessionMap {
    storage: SharedStorage,
    ttl: Duration,
    next_id: AtomicU32,
    by_id: RwLock<HashMap<u32, UdpSession>>,
}

impl UdpSessionMap {
    /// Seed the id allocator from storage so restarts never reissue a live id.
    pub async fn load(storage: SharedStorage, ttl: Duration) -> StorageResult<UdpSessionMap> {
        let max = storage.lock().await.max_udp_session_id()?;
        Ok(UdpSessionMap {
            storage,
            ttl,
            next_id: AtomicU32::new(max.wrapping_add(1).max(1)),
            by_id: RwLock::new(HashMap::new()),
        })
    }

    /// Allocate a session at login.  Any existing session for the IMEI is
    /// evicted first.
    pub async fn open(
        &self,
        imei: u64,
        addr: SocketAddr,
        now: DateTime<Utc>,
    ) -> StorageResult<UdpSession> {
        self.by_id.write().await.retain(|_, s| s.imei != imei);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = UdpSession {
            id,
            imei,
            addr,
            expires: now + self.ttl,
            last_seq: 0,
        };
        {
            let mut store = self.storage.lock().await;
            store.delete_udp_sessions_for(imei)?;
            store.upsert_udp_session(&session)?;
        }
        self.by_id.write().await.insert(id, session.clone());
        Ok(session)
    }

    /// Look up a session by id and extend its expiry.  Returns `None` for
    /// unknown or expired ids — the caller replies with a re-login prompt.
    pub async fn touch(
        &self,
        id: u32,
        addr: SocketAddr,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<UdpSession>> {
        let cached = self.by_id.read().await.get(&id).cloned();
        let mut session = match cached {
            Some(s) => s,
            // Fall back to storage: the session may predate this process.
            None => match self.storage.lock().await.udp_session_by_id(id)? {
                Some(s) => s,
                None => return Ok(None),
            },
        };
        if session.expires <= now {
            self.by_id.write().await.remove(&id);
            return Ok(None);
        }
        session.addr = addr;
        session.expires = now + self.ttl;
        self.storage.lock().await.upsert_udp_session(&session)?;
        self.by_id.write().await.insert(id, session.clone());
        Ok(Some(session))
    }

    /// Bump the session's record counter after a data packet.
    pub async fn add_records(&self, id: u32, n: u64) -> StorageResult<()> {
        let updated = {
            let mut map = self.by_id.write().await;
            match map.get_mut(&id) {
                None => return Ok(()),
                Some(session) => {
                    session.last_seq += n;
                    session.clone()
                }
            }
        };
        self.storage.lock().await.upsert_udp_session(&updated)
    }

    /// Drop expired sessions from the map and from storage.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        self.by_id.write().await.retain(|_, s| s.expires > now);
        self.storage.lock().await.purge_expired_udp_sessions(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SqliteStore, shared};
    use std::sync::Arc;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 9], port))
    }

    async fn map() -> UdpSessionMap {
        let storage = shared(SqliteStore::open_in_memory().unwrap());
        UdpSessionMap::load(storage, Duration::hours(10))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn login_evicts_previous_session_for_same_imei() {
        let map = map().await;
        let now = Utc::now();
        let first = map.open(123_456_789_012_345, addr(1000), now).await.unwrap();
        let second = map.open(123_456_789_012_345, addr(1001), now).await.unwrap();
        assert_ne!(first.id, second.id);

        assert!(map.touch(first.id, addr(1000), now).await.unwrap().is_none());
        assert!(map.touch(second.id, addr(1001), now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn touch_extends_expiry_and_updates_addr() {
        let map = map().await;
        let now = Utc::now();
        let session = map.open(123_456_789_012_345, addr(1000), now).await.unwrap();

        let later = now + Duration::hours(9);
        let touched = map
            .touch(session.id, addr(2000), later)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(touched.addr, addr(2000));
        assert_eq!(touched.expires, later + Duration::hours(10));
    }

    #[tokio::test]
    async fn expired_session_is_not_returned() {
        let map = map().await;
        let now = Utc::now();
        let session = map.open(123_456_789_012_345, addr(1000), now).await.unwrap();

        let after = now + Duration::hours(10) + Duration::seconds(1);
        assert!(map.touch(session.id, addr(1000), after).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_removes_expired_from_storage() {
        let map = map().await;
        let now = Utc::now();
        map.open(123_456_789_012_345, addr(1000), now).await.unwrap();
        map.open(123_456_789_012_346, addr(1001), now + Duration::hours(5))
            .await
            .unwrap();

        let purged = map
            .purge_expired(now + Duration::hours(11))
            .await
            .unwrap();
        assert_eq!(purged, 1);
    }

    #[tokio::test]
    async fn unknown_id_falls_back_to_storage() {
        let storage = shared(SqliteStore::open_in_memory().unwrap());
        let now = Utc::now();
        let persisted = UdpSession {
            id: 77,
            imei: 123_456_789_012_345,
            addr: addr(1000),
            expires: now + Duration::hours(1),
            last_seq: 5,
        };
        storage.lock().await.upsert_udp_session(&persisted).unwrap();

        // A fresh map (fresh process) still resolves the persisted session.
        let map = UdpSessionMap::load(Arc::clone(&storage), Duration::hours(10))
            .await
            .unwrap();
        let touched = map.touch(77, addr(1000), now).await.unwrap().unwrap();
        assert_eq!(touched.imei, persisted.imei);
    }
}
