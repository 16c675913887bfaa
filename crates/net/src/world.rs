use crate::actions::Action;
use crate::bitstream::OutputBitStream;

pub type ObjectId = u32;

/// Bitmask of replicated fields. The transport treats it as opaque; which
/// bit means which field is the world implementation's business.
pub type StateMask = u32;

/// Input batch drained from one client's action list.
#[derive(Debug, Clone)]
pub struct PlayerInput {
    pub player_id: u32,
    pub actions: Vec<Action>,
}

/// Gameplay-side mutations reported back to the network layer, which fans
/// them out to every connected client's replication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldDelta {
    StateDirty { object: ObjectId, mask: StateMask },
    Spawned { object: ObjectId, full_mask: StateMask },
    Despawned { object: ObjectId },
}

/// The seam to the authoritative game world. Implementations own the object
/// model and its gameplay rules; the network layer only asks them to spawn
/// and despawn player objects, consume input batches, and serialize fields.
///
/// All calls happen on the packet-handler thread, never concurrently.
pub trait World {
    /// A new client was admitted. Returns the object representing the
    /// player and the full field mask used for its initial replication.
    fn spawn_player(&mut self, player_id: u32) -> (ObjectId, StateMask);

    fn despawn_player(&mut self, player_id: u32, object: ObjectId);

    /// Runs once per processed packet, before replies are built. `deltas`
    /// receives whatever changed as a result.
    fn update(&mut self, inputs: &[PlayerInput], deltas: &mut Vec<WorldDelta>);

    /// Appends every live object and its full field mask, used to bring a
    /// newly admitted client up to date.
    fn objects(&self, out: &mut Vec<(ObjectId, StateMask)>);

    /// Serializes the field values selected by `mask` for one object.
    fn write_state(&self, object: ObjectId, mask: StateMask, out: &mut OutputBitStream);
}
