//! Command dispatcher (queued commands -> wire reply blocks).
//!
//! Delivery is two-phase: `stage_*` reads the pending queue and builds the
//! wire form, the connection handler writes it, and only a successful write
//! leads to `commit`, which marks the rows sent and applies side effects
//! (device output mask, SMS side channel for firmware pushes).  A failed
//! write skips `commit`, so the rows stay pending for the next contact.

use crate::registry::Registry;
use crate::storage::StorageResult;
use chrono::{DateTime, Utc};
use fleet_core::{CommandKind, OutboundCommand};
use ft_protocol::blu;
use ft_protocol::sgavl::CommandBlock;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub struct Dispatcher {
    registry: Arc<Registry>,
    firmware_dir: PathBuf,
}

/// Commands staged for one SGAvl reply.
#[derive(Debug, Default)]
pub struct StagedBlocks {
    pub blocks: Vec<CommandBlock>,
    commands: Vec<OutboundCommand>,
}

impl StagedBlocks {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// One command staged for a BLU session reply datagram.
#[derive(Debug)]
pub struct StagedDatagram {
    pub cmd: u8,
    command: OutboundCommand,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, firmware_dir: PathBuf) -> Dispatcher {
        Dispatcher {
            registry,
            firmware_dir,
        }
    }

    /// Read-only `<version> -> path` lookup for the firmware side channel.
    pub fn firmware_path(&self, version: &str) -> PathBuf {
        self.firmware_dir.join(format!("{version}.bin"))
    }

    /// Stage every pending command that has an SGAvl block encoding.
    pub async fn stage_sgavl(&self, imei: u64) -> StorageResult<StagedBlocks> {
        let pending = self
            .registry
            .storage()
            .lock()
            .await
            .list_pending_commands(imei)?;
        let mut staged = StagedBlocks::default();
        for command in pending {
            let block = match &command.kind {
                CommandKind::SetOutputs { outputs } => CommandBlock::SetOutputs(*outputs),
                CommandKind::SetInputFlags { flags } => CommandBlock::SetInputFlags(*flags),
                CommandKind::FirmwarePush { .. } => CommandBlock::FirmwarePush,
                CommandKind::SmsToDevice { text } => CommandBlock::Message(text.clone()),
                // Datagram-only commands wait for a UDP contact.
                CommandKind::MotorOn
                | CommandKind::MotorOff
                | CommandKind::Reset
                | CommandKind::Devinfo => continue,
            };
            staged.blocks.push(block);
            staged.commands.push(command);
        }
        Ok(staged)
    }

    /// Stage the oldest pending command that maps to a BLU command byte.
    pub async fn stage_blu(&self, imei: u64) -> StorageResult<Option<StagedDatagram>> {
        let pending = self
            .registry
            .storage()
            .lock()
            .await
            .list_pending_commands(imei)?;
        for command in pending {
            let cmd = match &command.kind {
                CommandKind::MotorOn => blu::CMD_MOTOR_ON,
                CommandKind::MotorOff => blu::CMD_MOTOR_OFF,
                CommandKind::Reset => blu::CMD_RESET,
                CommandKind::Devinfo => blu::CMD_REQUEST_DEVINFO,
                _ => continue,
            };
            return Ok(Some(StagedDatagram { cmd, command }));
        }
        Ok(None)
    }

    /// The wire write succeeded: mark the staged rows sent and apply their
    /// side effects.
    pub async fn commit_sgavl(
        &self,
        staged: StagedBlocks,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        for command in staged.commands {
            self.commit_one(&command, now).await?;
        }
        Ok(())
    }

    pub async fn commit_blu(
        &self,
        staged: StagedDatagram,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.commit_one(&staged.command, now).await
    }

    async fn commit_one(&self, command: &OutboundCommand, now: DateTime<Utc>) -> StorageResult<()> {
        self.registry
            .storage()
            .lock()
            .await
            .mark_command_sent(command.id, now)?;
        info!(
            imei = command.imei,
            command = command.kind.name(),
            "command delivered"
        );

        match &command.kind {
            CommandKind::SetOutputs { outputs } => {
                // The device applies the mask immediately; mirror it.
                let mut mask = 0u16;
                for (bit, byte) in outputs.iter().enumerate() {
                    if *byte != 0 {
                        mask |= 1 << bit;
                    }
                }
                if let Some(handle) = self.registry.get_or_load(command.imei).await? {
                    let mut device = handle.lock().await;
                    device.outputs = mask;
                    self.registry.persist(&device).await?;
                }
            }
            CommandKind::FirmwarePush { version } => {
                // The binary itself goes out of band; notify the deliverer.
                let path = self.firmware_path(version);
                self.registry.storage().lock().await.enqueue_sms(
                    command.imei,
                    &format!("firmware {version} staged at {}", path.display()),
                )?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::storage::{SqliteStore, shared};
    use fleet_core::ProtocolKind;

    const IMEI: u64 = 123_456_789_012_345;

    async fn dispatcher() -> Dispatcher {
        let storage = shared(SqliteStore::open_in_memory().unwrap());
        let registry = Arc::new(Registry::new(storage, 0x0141));
        registry
            .find_or_create(IMEI, ProtocolKind::Sgavl, Utc::now())
            .await
            .unwrap();
        Dispatcher::new(registry, PathBuf::from("/srv/fw"))
    }

    async fn enqueue(dispatcher: &Dispatcher, kind: CommandKind) {
        dispatcher
            .registry
            .storage()
            .lock()
            .await
            .enqueue_command(IMEI, &kind)
            .unwrap();
    }

    #[tokio::test]
    async fn sgavl_staging_builds_blocks_in_queue_order() {
        let dispatcher = dispatcher().await;
        enqueue(&dispatcher, CommandKind::SetOutputs { outputs: [1; 16] }).await;
        enqueue(
            &dispatcher,
            CommandKind::SmsToDevice {
                text: "cfg v2".to_owned(),
            },
        )
        .await;
        enqueue(&dispatcher, CommandKind::MotorOff).await;

        let staged = dispatcher.stage_sgavl(IMEI).await.unwrap();
        assert_eq!(
            staged.blocks,
            vec![
                CommandBlock::SetOutputs([1; 16]),
                CommandBlock::Message("cfg v2".to_owned()),
            ]
        );

        // motor_off has no block form and must stay pending.
        dispatcher.commit_sgavl(staged, Utc::now()).await.unwrap();
        let pending = dispatcher
            .registry
            .storage()
            .lock()
            .await
            .list_pending_commands(IMEI)
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, CommandKind::MotorOff);
    }

    #[tokio::test]
    async fn commit_sets_device_outputs_from_mask() {
        let dispatcher = dispatcher().await;
        let mut outputs = [0u8; 16];
        outputs[0] = 1;
        outputs[3] = 1;
        enqueue(&dispatcher, CommandKind::SetOutputs { outputs }).await;

        let staged = dispatcher.stage_sgavl(IMEI).await.unwrap();
        dispatcher.commit_sgavl(staged, Utc::now()).await.unwrap();

        let handle = dispatcher.registry.get_or_load(IMEI).await.unwrap().unwrap();
        assert_eq!(handle.lock().await.outputs, 0b1001);
    }

    #[tokio::test]
    async fn blu_staging_picks_first_datagram_command() {
        let dispatcher = dispatcher().await;
        enqueue(
            &dispatcher,
            CommandKind::SmsToDevice {
                text: "ignored on udp".to_owned(),
            },
        )
        .await;
        enqueue(&dispatcher, CommandKind::MotorOff).await;

        let staged = dispatcher.stage_blu(IMEI).await.unwrap().unwrap();
        assert_eq!(staged.cmd, blu::CMD_MOTOR_OFF);

        let at = Utc::now();
        dispatcher.commit_blu(staged, at).await.unwrap();
        // Redelivery check: nothing datagram-shaped remains.
        assert!(dispatcher.stage_blu(IMEI).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn uncommitted_stage_leaves_commands_pending() {
        let dispatcher = dispatcher().await;
        enqueue(&dispatcher, CommandKind::Reset).await;

        // Stage but never commit (simulated write failure).
        let _ = dispatcher.stage_blu(IMEI).await.unwrap().unwrap();
        assert!(dispatcher.stage_blu(IMEI).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn firmware_push_notifies_sms_side_channel() {
        let dispatcher = dispatcher().await;
        enqueue(
            &dispatcher,
            CommandKind::FirmwarePush {
                version: "3.2.0".to_owned(),
            },
        )
        .await;

        let staged = dispatcher.stage_sgavl(IMEI).await.unwrap();
        assert_eq!(staged.blocks, vec![CommandBlock::FirmwarePush]);
        dispatcher.commit_sgavl(staged, Utc::now()).await.unwrap();

        assert_eq!(
            dispatcher.firmware_path("3.2.0"),
            PathBuf::from("/srv/fw/3.2.0.bin")
        );
    }
}
