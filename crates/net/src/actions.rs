use crate::bitstream::{InputBitStream, OutputBitStream, StreamError};
use crate::protocol::{ACTION_PAYLOAD_LEN_BITS, MAX_ACTION_PAYLOAD};

/// One client input. The timestamp is client-local and only compared against
/// other timestamps from the same client; the payload is opaque to the
/// transport and decoded by the gameplay layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub timestamp: u32,
    pub payload: Vec<u8>,
}

impl Action {
    pub fn new(timestamp: u32, mut payload: Vec<u8>) -> Self {
        payload.truncate(MAX_ACTION_PAYLOAD);
        Self { timestamp, payload }
    }

    pub fn read(input: &mut InputBitStream) -> Result<Self, StreamError> {
        let timestamp = input.read_u32()?;
        let len = input.read_bits(ACTION_PAYLOAD_LEN_BITS)? as usize;
        let payload = input.read_bytes(len)?;
        Ok(Self { timestamp, payload })
    }

    pub fn write(&self, out: &mut OutputBitStream) {
        out.write_u32(self.timestamp);
        out.write_bits(self.payload.len() as u64, ACTION_PAYLOAD_LEN_BITS);
        out.write_bytes(&self.payload);
    }
}

/// Latest unprocessed input batch for one client. UDP gives no ordering, so
/// an action is only accepted when its timestamp is strictly newer than
/// everything seen so far; replays and reordered duplicates are dropped.
#[derive(Debug, Default)]
pub struct ActionList {
    actions: Vec<Action>,
    last_move_timestamp: Option<u32>,
}

impl ActionList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_move_if_new(&mut self, action: Action) -> bool {
        if let Some(last) = self.last_move_timestamp {
            if action.timestamp <= last {
                return false;
            }
        }
        self.last_move_timestamp = Some(action.timestamp);
        self.actions.push(action);
        true
    }

    pub fn last_move_timestamp(&self) -> Option<u32> {
        self.last_move_timestamp
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Hands the pending batch to the gameplay layer. The timestamp maximum
    /// survives so stale inputs keep getting rejected after a drain.
    pub fn drain(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }
}
