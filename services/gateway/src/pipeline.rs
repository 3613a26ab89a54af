//! Ingestion pipeline (decoded records -> persisted events + device state).
//!
//! All records parsed from one wire frame go through [`Pipeline::ingest`] as
//! a single batch: events append in one storage transaction, and the device
//! state merge applies only after that transaction commits.  On a storage
//! error the caller withholds the wire acknowledgement and closes the
//! connection — the device retries, and the Track dedup index makes the
//! replay idempotent.
//!
//! State merge rules:
//! - `last_contact` always advances to `now`.
//! - `position`/`speed`/`course`/`altitude`/`last_log` advance only from
//!   records whose timestamp is >= the current `last_log`.
//! - `odometer_m` accumulates great-circle distance between consecutive
//!   in-order valid fixes and never decreases.

use crate::registry::{DeviceHandle, Registry};
use crate::storage::StorageError;
use chrono::{DateTime, Utc};
use fleet_core::harness::BAT_DOK_BIT;
use fleet_core::time::sanitize_timestamp;
use fleet_core::{
    CommandKind, ConnStatus, Device, Event, EventPayload, Harness, geo,
};
use ft_protocol::record::{Fix, Record};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What one ingest call did; the TCP handlers ack from this.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub records: usize,
    pub events_stored: usize,
}

pub struct Pipeline {
    registry: Arc<Registry>,
    time_skew_tolerance_days: i64,
    /// bad firmware version -> target version; empty disables auto-push.
    firmware_autopush: HashMap<String, String>,
}

impl Pipeline {
    pub fn new(
        registry: Arc<Registry>,
        time_skew_tolerance_days: i64,
        firmware_autopush: HashMap<String, String>,
    ) -> Pipeline {
        Pipeline {
            registry,
            time_skew_tolerance_days,
            firmware_autopush,
        }
    }

    /// Ingest one frame's worth of records for a device.
    ///
    /// The device mutex is held for the whole call, so updates for one IMEI
    /// are serialized no matter which connection they arrive on.
    pub async fn ingest(
        &self,
        handle: &DeviceHandle,
        records: &[Record],
        now: DateTime<Utc>,
    ) -> Result<IngestReport, PipelineError> {
        let mut device = handle.lock().await;

        // Work on a copy; the live state only changes once the event batch
        // has committed.
        let mut staged = device.clone();
        staged.last_contact = staged.last_contact.max(now);
        staged.status = ConnStatus::Online;

        let mut events = Vec::new();
        for record in records {
            self.apply_record(&mut staged, record, now, &mut events)
                .await?;
        }

        let events_stored = if events.is_empty() {
            0
        } else {
            self.registry
                .storage()
                .lock()
                .await
                .append_events(&events)?
        };

        self.maybe_autopush_firmware(&staged).await?;

        *device = staged;
        self.registry.persist(&device).await?;
        debug!(
            imei = device.imei,
            records = records.len(),
            stored = events_stored,
            "frame ingested"
        );
        Ok(IngestReport {
            records: records.len(),
            events_stored,
        })
    }

    async fn apply_record(
        &self,
        staged: &mut Device,
        record: &Record,
        now: DateTime<Utc>,
        events: &mut Vec<Event>,
    ) -> Result<(), PipelineError> {
        match record {
            Record::Track(fix) => {
                events.push(self.apply_fix(staged, fix, now));
            }
            Record::IoSnapshot {
                inputs,
                outputs,
                fix,
            } => {
                let track = fix.as_ref().map(|f| self.apply_fix(staged, f, now));
                if let Some(event) = self.apply_io(staged, *inputs, *outputs, &track, now).await? {
                    events.push(event);
                }
                // The embedded fix is persisted as its own Track.
                events.extend(track);
            }
            Record::Gsm {
                direction,
                peer,
                text,
            } => events.push(plain_event(
                staged,
                now,
                EventPayload::Gsm {
                    direction: *direction,
                    peer: peer.clone(),
                    text: text.clone(),
                },
            )),
            Record::Reset { reason, detail } => {
                info!(imei = staged.imei, reason, "device reported reset");
                events.push(plain_event(
                    staged,
                    now,
                    EventPayload::Reset {
                        reason: *reason,
                        detail: detail.clone(),
                    },
                ));
            }
            Record::Pressure { sensor_id, value } => events.push(plain_event(
                staged,
                now,
                EventPayload::Pressure {
                    sensor_id: *sensor_id,
                    value: *value,
                },
            )),
            Record::PeopleCount {
                sensor_id,
                entered,
                exited,
                time,
            } => {
                let ts = time
                    .map(|t| sanitize_timestamp(t, now, self.time_skew_tolerance_days))
                    .unwrap_or(now);
                let mut event = plain_event(
                    staged,
                    now,
                    EventPayload::PeopleCount {
                        sensor_id: *sensor_id,
                        entered: *entered,
                        exited: *exited,
                    },
                );
                event.timestamp = ts;
                events.push(event);
            }
            Record::Alarm { sensor_id, active } => events.push(plain_event(
                staged,
                now,
                EventPayload::Alarm {
                    sensor_id: *sensor_id,
                    active: *active,
                },
            )),
            Record::Devinfo { firmware } => {
                info!(imei = staged.imei, firmware = %firmware, "devinfo");
                staged.firmware = firmware.clone();
            }
            // Liveness only; last_contact already advanced above.
            Record::TimeMark { .. } | Record::Login { .. } | Record::Ping => {}
        }
        Ok(())
    }

    /// Merge a fix into the staged state and build its Track event.
    fn apply_fix(&self, staged: &mut Device, fix: &Fix, now: DateTime<Utc>) -> Event {
        let ts = sanitize_timestamp(fix.time, now, self.time_skew_tolerance_days);
        let in_order = ts >= staged.last_log;

        if in_order {
            if fix.gps_valid {
                if let Some(prev) = staged.position {
                    staged.odometer_m += geo::distance_m(prev, fix.position) as u64;
                }
                staged.position = Some(fix.position);
            }
            staged.speed = fix.speed;
            staged.course = fix.course;
            staged.altitude = fix.altitude;
            staged.last_log = ts;
        }

        Event {
            imei: staged.imei,
            timestamp: ts,
            position: Some(fix.position),
            speed: Some(fix.speed),
            course: Some(fix.course),
            altitude: Some(fix.altitude),
            odometer_m: Some(staged.odometer_m),
            payload: EventPayload::Track {
                satellites: fix.satellites,
                hdop: fix.hdop,
            },
        }
    }

    /// Diff an IO snapshot against the staged masks.  Returns the IoChange
    /// event, or `None` when nothing changed or the change is BAT_DOK noise.
    async fn apply_io(
        &self,
        staged: &mut Device,
        inputs: u16,
        outputs: Option<u16>,
        track: &Option<Event>,
        now: DateTime<Utc>,
    ) -> Result<Option<Event>, PipelineError> {
        let old_inputs = staged.inputs;
        let old_outputs = staged.outputs;
        let new_outputs = outputs.unwrap_or(old_outputs);

        staged.inputs = inputs;
        staged.outputs = new_outputs;
        // Active-low alarm senses: a cleared input bit under the mask raises
        // its alarm.  Alarms latch until an external consumer clears them.
        staged.alarms |= staged.alarm_mask & !inputs;

        let changed_inputs = old_inputs ^ inputs;
        let changed_outputs = old_outputs ^ new_outputs;
        if changed_inputs == 0 && changed_outputs == 0 {
            return Ok(None);
        }

        let harness = self.harness_for(staged).await?;
        let mut changes = Vec::new();
        for bit in 0..16 {
            if changed_inputs & (1 << bit) != 0 {
                let state = if inputs & (1 << bit) != 0 { "ON" } else { "OFF" };
                changes.push(format!("{}={state}", harness.input_name(bit)));
            }
        }
        let input_changes = changes.len();
        for bit in 0..16 {
            if changed_outputs & (1 << bit) != 0 {
                let state = if new_outputs & (1 << bit) != 0 {
                    "ON"
                } else {
                    "OFF"
                };
                changes.push(format!("{}={state}", harness.output_name(bit)));
            }
        }

        // De-noise: the battery-OK sense line flaps on every engine start.
        if changed_inputs == 1 << BAT_DOK_BIT && input_changes == changes.len() {
            debug!(imei = staged.imei, "dropping BAT_DOK-only IO change");
            return Ok(None);
        }

        let mut event = plain_event(
            staged,
            now,
            EventPayload::IoChange {
                inputs,
                outputs: new_outputs,
                changes: changes.join(", "),
            },
        );
        // An IO change that rode in with a fix inherits its position.
        if let Some(track) = track {
            event.position = track.position;
            event.timestamp = track.timestamp;
        }
        Ok(Some(event))
    }

    async fn harness_for(&self, device: &Device) -> Result<Harness, PipelineError> {
        let mut store = self.registry.storage().lock().await;
        match store.get_harness(&device.harness)? {
            Some(harness) => Ok(harness),
            None => {
                warn!(
                    imei = device.imei,
                    harness = %device.harness,
                    "harness missing, falling back to default"
                );
                Ok(store.get_default_harness()?)
            }
        }
    }

    /// Queue a firmware push when a known-bad version reports an asserted
    /// alarm input and no push is already pending.
    async fn maybe_autopush_firmware(&self, staged: &Device) -> Result<(), PipelineError> {
        let Some(target) = self.firmware_autopush.get(&staged.firmware) else {
            return Ok(());
        };
        if staged.alarms & staged.alarm_mask == 0 {
            return Ok(());
        }
        let mut store = self.registry.storage().lock().await;
        if store.has_pending_command(staged.imei, "firmware_push")? {
            return Ok(());
        }
        info!(
            imei = staged.imei,
            from = %staged.firmware,
            to = %target,
            "queueing firmware auto-push"
        );
        store.enqueue_command(
            staged.imei,
            &CommandKind::FirmwarePush {
                version: target.clone(),
            },
        )?;
        Ok(())
    }
}

fn plain_event(device: &Device, now: DateTime<Utc>, payload: EventPayload) -> Event {
    Event {
        imei: device.imei,
        timestamp: now,
        position: None,
        speed: None,
        course: None,
        altitude: None,
        odometer_m: None,
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::storage::{SqliteStore, shared};
    use chrono::{Duration, TimeZone};
    use fleet_core::{EventKind, Position, ProtocolKind};

    const IMEI: u64 = 123_456_789_012_345;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 28, 11, 48, 39).unwrap()
    }

    fn fix(ts: DateTime<Utc>, lon: f64, lat: f64) -> Fix {
        Fix {
            time: ts,
            position: Position::new(lon, lat),
            speed: 40.0,
            course: 90,
            altitude: 10,
            satellites: Some(8),
            hdop: None,
            gps_valid: true,
        }
    }

    async fn pipeline_with(autopush: HashMap<String, String>) -> (Pipeline, DeviceHandle) {
        let storage = shared(SqliteStore::open_in_memory().unwrap());
        storage.lock().await.create_default_harness().unwrap();
        let registry = Arc::new(Registry::new(storage, 0x0141));
        let (handle, _) = registry
            .find_or_create(IMEI, ProtocolKind::Sgavl, now() - Duration::days(1))
            .await
            .unwrap();
        (Pipeline::new(registry, 20, autopush), handle)
    }

    async fn pipeline() -> (Pipeline, DeviceHandle) {
        pipeline_with(HashMap::new()).await
    }

    #[tokio::test]
    async fn track_advances_state_and_appends_event() {
        let (pipeline, handle) = pipeline().await;
        let report = pipeline
            .ingest(&handle, &[Record::Track(fix(now(), 24.105, 56.946))], now())
            .await
            .unwrap();
        assert_eq!(report.events_stored, 1);

        let device = handle.lock().await;
        assert_eq!(device.position, Some(Position::new(24.105, 56.946)));
        assert_eq!(device.last_log, now());
        assert_eq!(device.status, ConnStatus::Online);
        assert!((device.speed - 40.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn stale_track_is_stored_but_does_not_regress_state() {
        let (pipeline, handle) = pipeline().await;
        pipeline
            .ingest(&handle, &[Record::Track(fix(now(), 24.105, 56.946))], now())
            .await
            .unwrap();

        let old = now() - Duration::hours(2);
        let report = pipeline
            .ingest(&handle, &[Record::Track(fix(old, 1.0, 1.0))], now())
            .await
            .unwrap();
        assert_eq!(report.events_stored, 1);

        let device = handle.lock().await;
        assert_eq!(device.position, Some(Position::new(24.105, 56.946)));
        assert_eq!(device.last_log, now());
    }

    #[tokio::test]
    async fn replayed_track_stores_exactly_once() {
        let (pipeline, handle) = pipeline().await;
        let records = [Record::Track(fix(now(), 24.105, 56.946))];
        let first = pipeline.ingest(&handle, &records, now()).await.unwrap();
        let second = pipeline.ingest(&handle, &records, now()).await.unwrap();
        assert_eq!(first.events_stored, 1);
        assert_eq!(second.events_stored, 0);
    }

    #[tokio::test]
    async fn odometer_accumulates_and_never_decreases() {
        let (pipeline, handle) = pipeline().await;
        pipeline
            .ingest(&handle, &[Record::Track(fix(now(), 24.0, 56.0))], now())
            .await
            .unwrap();
        pipeline
            .ingest(
                &handle,
                &[Record::Track(fix(now() + Duration::minutes(1), 24.01, 56.0))],
                now(),
            )
            .await
            .unwrap();
        let after_move = handle.lock().await.odometer_m;
        // ~0.01 deg of longitude at 56N is ~600 m.
        assert!(after_move > 500 && after_move < 700, "got {after_move}");

        // An out-of-order fix far away must not touch the odometer.
        pipeline
            .ingest(
                &handle,
                &[Record::Track(fix(now() - Duration::hours(1), 30.0, 50.0))],
                now(),
            )
            .await
            .unwrap();
        assert_eq!(handle.lock().await.odometer_m, after_move);
    }

    #[tokio::test]
    async fn absurd_timestamp_is_replaced_with_now() {
        let (pipeline, handle) = pipeline().await;
        let absurd = Utc.timestamp_opt(5_000, 0).unwrap();
        pipeline
            .ingest(&handle, &[Record::Track(fix(absurd, 24.0, 56.0))], now())
            .await
            .unwrap();
        assert_eq!(handle.lock().await.last_log, now());
    }

    #[tokio::test]
    async fn io_change_names_bits_from_harness() {
        let (pipeline, handle) = pipeline().await;
        pipeline
            .ingest(
                &handle,
                &[Record::IoSnapshot {
                    inputs: 0b0101,
                    outputs: Some(0b0001),
                    fix: None,
                }],
                now(),
            )
            .await
            .unwrap();

        let event = pipeline
            .registry
            .storage()
            .lock()
            .await
            .get_latest_event(IMEI, EventKind::IoChange)
            .unwrap()
            .unwrap();
        let EventPayload::IoChange { changes, .. } = &event.payload else {
            panic!("expected io change");
        };
        assert_eq!(changes, "IN1=ON, IN3=ON, OUT1=ON");
    }

    #[tokio::test]
    async fn bat_dok_only_change_is_dropped_but_state_updates() {
        let (pipeline, handle) = pipeline().await;
        let report = pipeline
            .ingest(
                &handle,
                &[Record::IoSnapshot {
                    inputs: 1 << BAT_DOK_BIT,
                    outputs: Some(0),
                    fix: None,
                }],
                now(),
            )
            .await
            .unwrap();
        assert_eq!(report.events_stored, 0);

        let device = handle.lock().await;
        assert_eq!(device.inputs, 1 << BAT_DOK_BIT);
        assert_eq!(device.last_contact, now());
    }

    #[tokio::test]
    async fn unchanged_io_snapshot_emits_nothing() {
        let (pipeline, handle) = pipeline().await;
        let snapshot = [Record::IoSnapshot {
            inputs: 0b0011,
            outputs: Some(0),
            fix: None,
        }];
        pipeline.ingest(&handle, &snapshot, now()).await.unwrap();
        let report = pipeline
            .ingest(&handle, &snapshot, now() + Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(report.events_stored, 0);
    }

    #[tokio::test]
    async fn cleared_masked_input_raises_alarm() {
        let (pipeline, handle) = pipeline().await;
        // Mask 0x0141: bits 0, 6, 8 are active-low alarm senses.  Start with
        // everything high, then drop bit 0.
        pipeline
            .ingest(
                &handle,
                &[Record::IoSnapshot {
                    inputs: 0xFFFF,
                    outputs: Some(0),
                    fix: None,
                }],
                now(),
            )
            .await
            .unwrap();
        assert_eq!(handle.lock().await.alarms, 0);

        pipeline
            .ingest(
                &handle,
                &[Record::IoSnapshot {
                    inputs: 0xFFFE,
                    outputs: Some(0),
                    fix: None,
                }],
                now(),
            )
            .await
            .unwrap();
        assert_eq!(handle.lock().await.alarms, 0x0001);
    }

    #[tokio::test]
    async fn gsm_reset_and_sensor_records_become_events() {
        let (pipeline, handle) = pipeline().await;
        let records = [
            Record::Gsm {
                direction: fleet_core::GsmKind::Sms,
                peer: "371200000".to_owned(),
                text: Some("balance low".to_owned()),
            },
            Record::Reset {
                reason: 3,
                detail: Some("watchdog".to_owned()),
            },
            Record::Pressure {
                sensor_id: 7,
                value: 512,
            },
            Record::Alarm {
                sensor_id: 7,
                active: true,
            },
        ];
        let report = pipeline.ingest(&handle, &records, now()).await.unwrap();
        assert_eq!(report.events_stored, 4);
    }

    #[tokio::test]
    async fn devinfo_updates_firmware_without_event() {
        let (pipeline, handle) = pipeline().await;
        let report = pipeline
            .ingest(
                &handle,
                &[Record::Devinfo {
                    firmware: "3.1.7".to_owned(),
                }],
                now(),
            )
            .await
            .unwrap();
        assert_eq!(report.events_stored, 0);
        assert_eq!(handle.lock().await.firmware, "3.1.7");
    }

    #[tokio::test]
    async fn bad_firmware_with_alarm_queues_one_push() {
        let autopush: HashMap<_, _> = [("3.1.7".to_owned(), "3.2.0".to_owned())].into();
        let (pipeline, handle) = pipeline_with(autopush).await;
        pipeline
            .ingest(
                &handle,
                &[Record::Devinfo {
                    firmware: "3.1.7".to_owned(),
                }],
                now(),
            )
            .await
            .unwrap();

        // Drop an alarm-masked input twice; only one push may queue.
        for inputs in [0xFFFE_u16, 0xFFFF, 0xFFFE] {
            pipeline
                .ingest(
                    &handle,
                    &[Record::IoSnapshot {
                        inputs,
                        outputs: Some(0),
                        fix: None,
                    }],
                    now(),
                )
                .await
                .unwrap();
        }

        let pending = pipeline
            .registry
            .storage()
            .lock()
            .await
            .list_pending_commands(IMEI)
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending[0].kind,
            CommandKind::FirmwarePush {
                version: "3.2.0".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn healthy_firmware_never_queues_push() {
        let autopush: HashMap<_, _> = [("3.1.7".to_owned(), "3.2.0".to_owned())].into();
        let (pipeline, handle) = pipeline_with(autopush).await;
        pipeline
            .ingest(
                &handle,
                &[
                    Record::Devinfo {
                        firmware: "3.2.0".to_owned(),
                    },
                    Record::IoSnapshot {
                        inputs: 0xFFFE,
                        outputs: Some(0),
                        fix: None,
                    },
                ],
                now(),
            )
            .await
            .unwrap();
        assert!(
            pipeline
                .registry
                .storage()
                .lock()
                .await
                .list_pending_commands(IMEI)
                .unwrap()
                .is_empty()
        );
    }
}
