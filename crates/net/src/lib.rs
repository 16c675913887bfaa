mod actions;
mod bitstream;
mod config;
mod delivery;
mod dispatcher;
mod handler;
mod manager;
mod protocol;
mod proxy;
mod replication;
mod world;

pub use actions::{Action, ActionList};
pub use bitstream::{InputBitStream, OutputBitStream, StreamError};
pub use config::NetConfig;
pub use delivery::{
    DeliveryOutcome, DeliveryTracker, InFlightPacket, Resolution, TransmissionRecord,
};
pub use dispatcher::{
    DispatchEvent, PacketDispatcher, PendingSendPacket, ReceivedPacket, SendQueues,
};
pub use handler::{PacketHandler, PacketHandlerHandle, PendingFn};
pub use manager::NetworkManager;
pub use protocol::{
    ACTION_COUNT_BITS, DEFAULT_PORT, MAX_ACTION_PAYLOAD, MAX_ACTIONS_PER_PACKET, MAX_PACKET_SIZE,
    MAX_REPLICATIONS_PER_PACKET, PACKET_KIND_BITS, PacketError, PacketKind,
    REPLICATION_ACTION_BITS, REPLICATION_COUNT_BITS, sequence_greater_than,
};
pub use proxy::ClientProxy;
pub use replication::{ReplicationAction, ReplicationManager};
pub use world::{ObjectId, PlayerInput, StateMask, World, WorldDelta};
