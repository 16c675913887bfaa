use std::collections::HashMap;

use crate::bitstream::OutputBitStream;
use crate::delivery::{InFlightPacket, TransmissionRecord};
use crate::protocol::{MAX_REPLICATIONS_PER_PACKET, REPLICATION_ACTION_BITS, REPLICATION_COUNT_BITS};
use crate::world::{ObjectId, StateMask, World};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplicationAction {
    Create = 0,
    Update = 1,
    Destroy = 2,
}

impl ReplicationAction {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(ReplicationAction::Create),
            1 => Some(ReplicationAction::Update),
            2 => Some(ReplicationAction::Destroy),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy)]
struct ReplicationCommand {
    action: ReplicationAction,
    dirty_mask: StateMask,
}

impl ReplicationCommand {
    fn is_pending(&self) -> bool {
        self.action != ReplicationAction::Update || self.dirty_mask != 0
    }
}

/// Tracks, for one client, which objects and fields have changed since the
/// last send that was not subsequently reported lost. Serialization clears
/// the tracked bits optimistically; a delivery failure re-marks exactly what
/// the lost packet carried (retry by re-send of current state, never
/// retransmission of stale bytes).
#[derive(Debug, Default)]
pub struct ReplicationManager {
    commands: HashMap<ObjectId, ReplicationCommand>,
}

impl ReplicationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a one-shot create carrying the object's full field set.
    pub fn replicate_create(&mut self, object: ObjectId, initial_mask: StateMask) {
        let command = self.commands.entry(object).or_insert(ReplicationCommand {
            action: ReplicationAction::Create,
            dirty_mask: 0,
        });
        command.action = ReplicationAction::Create;
        command.dirty_mask |= initial_mask;
    }

    /// Queues a one-shot destroy. A destroy landing on a create the client
    /// was never told about cancels the pair outright.
    pub fn replicate_destroy(&mut self, object: ObjectId) {
        match self.commands.get_mut(&object) {
            Some(command) if command.action == ReplicationAction::Create => {
                self.commands.remove(&object);
            }
            Some(command) => command.action = ReplicationAction::Destroy,
            None => {
                self.commands.insert(
                    object,
                    ReplicationCommand {
                        action: ReplicationAction::Destroy,
                        dirty_mask: 0,
                    },
                );
            }
        }
    }

    pub fn set_state_dirty(&mut self, object: ObjectId, mask: StateMask) {
        let command = self.commands.entry(object).or_insert(ReplicationCommand {
            action: ReplicationAction::Update,
            dirty_mask: 0,
        });
        command.dirty_mask |= mask;
    }

    /// Drops all bookkeeping for an object, pending or not.
    pub fn forget(&mut self, object: ObjectId) {
        self.commands.remove(&object);
    }

    pub fn has_pending(&self) -> bool {
        self.commands.values().any(ReplicationCommand::is_pending)
    }

    pub fn dirty_mask(&self, object: ObjectId) -> Option<StateMask> {
        self.commands.get(&object).map(|c| c.dirty_mask)
    }

    /// Serializes every pending record into the stream, attaching one
    /// transmission record per entry to the in-flight handle. Updates write
    /// the changed-field mask plus those fields; creates imply the full
    /// field set and carry no mask; destroys carry the id and tag only.
    pub fn write<W: World>(
        &mut self,
        out: &mut OutputBitStream,
        in_flight: &mut InFlightPacket,
        world: &W,
    ) {
        let batch: Vec<(ObjectId, ReplicationCommand)> = self
            .commands
            .iter()
            .filter(|(_, command)| command.is_pending())
            .map(|(object, command)| (*object, *command))
            .take(MAX_REPLICATIONS_PER_PACKET)
            .collect();

        out.write_bits(batch.len() as u64, REPLICATION_COUNT_BITS);

        for (object, command) in batch {
            out.write_u32(object);
            out.write_bits(command.action.to_wire() as u64, REPLICATION_ACTION_BITS);
            match command.action {
                ReplicationAction::Create => {
                    world.write_state(object, command.dirty_mask, out);
                }
                ReplicationAction::Update => {
                    out.write_u32(command.dirty_mask);
                    world.write_state(object, command.dirty_mask, out);
                }
                ReplicationAction::Destroy => {}
            }

            in_flight.add_record(TransmissionRecord::Replication {
                object,
                action: command.action,
                mask: command.dirty_mask,
            });

            match command.action {
                ReplicationAction::Create => {
                    if let Some(entry) = self.commands.get_mut(&object) {
                        entry.action = ReplicationAction::Update;
                        entry.dirty_mask = 0;
                    }
                }
                ReplicationAction::Update => {
                    if let Some(entry) = self.commands.get_mut(&object) {
                        entry.dirty_mask = 0;
                    }
                }
                ReplicationAction::Destroy => {
                    self.commands.remove(&object);
                }
            }
        }
    }
}
