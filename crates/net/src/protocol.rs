use thiserror::Error;

use crate::bitstream::StreamError;

pub const MAX_PACKET_SIZE: usize = 1200;
pub const DEFAULT_PORT: u16 = 27960;

pub const PACKET_KIND_BITS: usize = 3;
pub const ACTION_COUNT_BITS: usize = 2;
pub const MAX_ACTIONS_PER_PACKET: usize = (1 << ACTION_COUNT_BITS) - 1;
pub const ACTION_PAYLOAD_LEN_BITS: usize = 6;
pub const MAX_ACTION_PAYLOAD: usize = (1 << ACTION_PAYLOAD_LEN_BITS) - 1;
pub const REPLICATION_COUNT_BITS: usize = 8;
pub const MAX_REPLICATIONS_PER_PACKET: usize = (1 << REPLICATION_COUNT_BITS) - 1;
pub const REPLICATION_ACTION_BITS: usize = 2;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Null = 0,
    Hello = 1,
    Welcome = 2,
    Reset = 3,
    ResetAck = 4,
    Input = 5,
    State = 6,
}

impl PacketKind {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(PacketKind::Null),
            1 => Some(PacketKind::Hello),
            2 => Some(PacketKind::Welcome),
            3 => Some(PacketKind::Reset),
            4 => Some(PacketKind::ResetAck),
            5 => Some(PacketKind::Input),
            6 => Some(PacketKind::State),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }

    /// Packet kinds a previously unknown peer is allowed to open with.
    /// Hello is a fresh connection; Input and ResetAck arrive when a client
    /// outlived a server restart.
    pub fn is_first_contact(self) -> bool {
        matches!(
            self,
            PacketKind::Hello | PacketKind::Input | PacketKind::ResetAck
        )
    }
}

#[derive(Debug, Error)]
pub enum PacketError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("unrecognized packet kind {0}")]
    UnknownKind(u8),
}

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_comparison() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(sequence_greater_than(0, u32::MAX));
        assert!(!sequence_greater_than(u32::MAX, 0));
    }

    #[test]
    fn kind_wire_round_trip() {
        for kind in [
            PacketKind::Null,
            PacketKind::Hello,
            PacketKind::Welcome,
            PacketKind::Reset,
            PacketKind::ResetAck,
            PacketKind::Input,
            PacketKind::State,
        ] {
            assert_eq!(PacketKind::from_wire(kind.to_wire()), Some(kind));
        }
        assert_eq!(PacketKind::from_wire(7), None);
    }

    #[test]
    fn first_contact_kinds() {
        assert!(PacketKind::Hello.is_first_contact());
        assert!(PacketKind::Input.is_first_contact());
        assert!(PacketKind::ResetAck.is_first_contact());
        assert!(!PacketKind::State.is_first_contact());
        assert!(!PacketKind::Welcome.is_first_contact());
    }
}
