use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::trace;

use crate::bitstream::{InputBitStream, OutputBitStream, StreamError};
use crate::config::NetConfig;
use crate::protocol::sequence_greater_than;
use crate::replication::{ReplicationAction, ReplicationManager};
use crate::world::{ObjectId, StateMask};

/// Payload riding on an in-flight packet. Closed set: every variant knows
/// how to react to exactly one delivery-success or delivery-failure
/// notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionRecord {
    Replication {
        object: ObjectId,
        action: ReplicationAction,
        mask: StateMask,
    },
}

impl TransmissionRecord {
    pub fn handle_delivery_success(&self, replication: &mut ReplicationManager) {
        match self {
            TransmissionRecord::Replication { object, action, .. } => {
                // dirty bits were cleared optimistically at write time;
                // a confirmed destroy just retires the object for good
                if *action == ReplicationAction::Destroy {
                    replication.forget(*object);
                }
            }
        }
    }

    pub fn handle_delivery_failure(&self, replication: &mut ReplicationManager) {
        match self {
            TransmissionRecord::Replication {
                object,
                action,
                mask,
            } => match action {
                ReplicationAction::Create => replication.replicate_create(*object, *mask),
                ReplicationAction::Update => replication.set_state_dirty(*object, *mask),
                ReplicationAction::Destroy => replication.replicate_destroy(*object),
            },
        }
    }
}

#[derive(Debug)]
pub struct InFlightPacket {
    sequence: u32,
    sent_at: Instant,
    records: Vec<TransmissionRecord>,
}

impl InFlightPacket {
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn add_record(&mut self, record: TransmissionRecord) {
        self.records.push(record);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Lost,
}

#[derive(Debug)]
pub struct Resolution {
    pub sequence: u32,
    pub outcome: DeliveryOutcome,
    pub records: Vec<TransmissionRecord>,
}

/// Per-connection delivery bookkeeping: stamps outgoing packets with a
/// sequence number and the acknowledgment window for the peer, and
/// reconciles the peer's window against the local in-flight set so every
/// sent packet eventually resolves as delivered or lost, exactly once.
#[derive(Debug)]
pub struct DeliveryTracker {
    next_sequence: u32,
    in_flight: VecDeque<InFlightPacket>,
    pending_resolutions: Vec<Resolution>,
    last_received: u32,
    received_mask: u32,
    max_in_flight: usize,
    delivery_timeout: Duration,
    ack_window_bits: usize,
    dispatched_count: u32,
    delivered_count: u32,
    lost_count: u32,
    srtt_ms: f32,
    rtt_var_ms: f32,
}

impl DeliveryTracker {
    pub fn new(config: &NetConfig) -> Self {
        Self {
            next_sequence: 1,
            in_flight: VecDeque::with_capacity(config.max_in_flight.min(64)),
            pending_resolutions: Vec::new(),
            last_received: 0,
            received_mask: 0,
            max_in_flight: config.max_in_flight.max(1),
            delivery_timeout: config.delivery_timeout,
            ack_window_bits: config.ack_window_bits.clamp(1, 32),
            dispatched_count: 0,
            delivered_count: 0,
            lost_count: 0,
            srtt_ms: 100.0,
            rtt_var_ms: 50.0,
        }
    }

    /// Stamps `[sequence][ack base][ack bitfield]` into the stream and
    /// registers the packet as in flight. The returned handle is where the
    /// caller attaches the records describing what travelled in the packet.
    pub fn write_state(&mut self, out: &mut OutputBitStream) -> &mut InFlightPacket {
        let now = Instant::now();
        while self.in_flight.len() >= self.max_in_flight {
            match self.in_flight.pop_front() {
                Some(packet) => self.resolve(packet, DeliveryOutcome::Lost, now),
                None => break,
            }
        }

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        out.write_u32(sequence);
        out.write_u32(self.last_received);
        out.write_bits(self.received_mask as u64, self.ack_window_bits);

        self.dispatched_count += 1;
        self.in_flight.push_back(InFlightPacket {
            sequence,
            sent_at: now,
            records: Vec::new(),
        });
        self.in_flight.back_mut().unwrap()
    }

    /// Reads the peer's `[sequence][ack base][ack bitfield]` header. Returns
    /// `Ok(false)` for duplicate or stale packets, signaling the caller to
    /// stop parsing; acknowledgments are only processed for fresh packets.
    pub fn read_and_process_state(
        &mut self,
        input: &mut InputBitStream,
    ) -> Result<bool, StreamError> {
        let remote_sequence = input.read_u32()?;
        let ack_base = input.read_u32()?;
        let ack_mask = input.read_bits(self.ack_window_bits)? as u32;

        if !self.record_received(remote_sequence) {
            trace!("dropping duplicate/stale sequence {}", remote_sequence);
            return Ok(false);
        }
        self.process_acks(ack_base, ack_mask);
        Ok(true)
    }

    /// Declares every in-flight packet older than the delivery timeout lost.
    /// Together with window passage this guarantees no packet waits forever.
    pub fn process_timed_out_packets(&mut self) {
        let now = Instant::now();
        while let Some(front) = self.in_flight.front() {
            if now.duration_since(front.sent_at) < self.delivery_timeout {
                break;
            }
            if let Some(packet) = self.in_flight.pop_front() {
                self.resolve(packet, DeliveryOutcome::Lost, now);
            }
        }
    }

    pub fn take_resolutions(&mut self) -> Vec<Resolution> {
        std::mem::take(&mut self.pending_resolutions)
    }

    pub fn ack_window(&self) -> (u32, u32) {
        (self.last_received, self.received_mask)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn dispatched_count(&self) -> u32 {
        self.dispatched_count
    }

    pub fn delivered_count(&self) -> u32 {
        self.delivered_count
    }

    pub fn lost_count(&self) -> u32 {
        self.lost_count
    }

    pub fn srtt_ms(&self) -> f32 {
        self.srtt_ms
    }

    fn window_mask(&self) -> u32 {
        if self.ack_window_bits >= 32 {
            u32::MAX
        } else {
            (1u32 << self.ack_window_bits) - 1
        }
    }

    fn record_received(&mut self, sequence: u32) -> bool {
        let window = self.ack_window_bits as u32;

        if sequence_greater_than(sequence, self.last_received) {
            let diff = sequence.wrapping_sub(self.last_received);
            let shifted = if diff >= 32 { 0 } else { self.received_mask << diff };
            // the bit for the previous base, unless it fell off the window
            let previous = if self.last_received != 0 && diff <= window {
                1u32 << (diff - 1)
            } else {
                0
            };
            self.received_mask = (shifted | previous) & self.window_mask();
            self.last_received = sequence;
            return true;
        }

        let diff = self.last_received.wrapping_sub(sequence);
        if diff == 0 || diff > window {
            return false;
        }
        let bit = 1u32 << (diff - 1);
        if self.received_mask & bit != 0 {
            return false;
        }
        self.received_mask |= bit;
        true
    }

    fn process_acks(&mut self, ack_base: u32, ack_mask: u32) {
        let now = Instant::now();
        let window = self.ack_window_bits as u32;

        let mut index = 0;
        while index < self.in_flight.len() {
            let sequence = self.in_flight[index].sequence;
            let outcome = if sequence == ack_base {
                Some(DeliveryOutcome::Delivered)
            } else if sequence_greater_than(ack_base, sequence) {
                let diff = ack_base.wrapping_sub(sequence);
                if diff <= window {
                    if ack_mask & (1u32 << (diff - 1)) != 0 {
                        Some(DeliveryOutcome::Delivered)
                    } else {
                        // still inside the window: a later ack may cover it
                        None
                    }
                } else {
                    // the window advanced past it unacknowledged
                    Some(DeliveryOutcome::Lost)
                }
            } else {
                None
            };

            match outcome {
                Some(outcome) => {
                    if let Some(packet) = self.in_flight.remove(index) {
                        self.resolve(packet, outcome, now);
                    }
                }
                None => index += 1,
            }
        }
    }

    fn resolve(&mut self, packet: InFlightPacket, outcome: DeliveryOutcome, now: Instant) {
        match outcome {
            DeliveryOutcome::Delivered => {
                self.delivered_count += 1;
                let rtt = now.duration_since(packet.sent_at).as_secs_f32() * 1000.0;
                self.update_rtt(rtt);
            }
            DeliveryOutcome::Lost => self.lost_count += 1,
        }
        trace!("sequence {} resolved as {:?}", packet.sequence, outcome);
        self.pending_resolutions.push(Resolution {
            sequence: packet.sequence,
            outcome,
            records: packet.records,
        });
    }

    fn update_rtt(&mut self, rtt: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let diff = (rtt - self.srtt_ms).abs();
        self.rtt_var_ms = (1.0 - BETA) * self.rtt_var_ms + BETA * diff;
        self.srtt_ms = (1.0 - ALPHA) * self.srtt_ms + ALPHA * rtt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tracker() -> DeliveryTracker {
        DeliveryTracker::new(&NetConfig::default())
    }

    fn write_packet(tracker: &mut DeliveryTracker) -> u32 {
        let mut out = OutputBitStream::new();
        tracker.write_state(&mut out).sequence()
    }

    fn ack_packet(tracker: &mut DeliveryTracker, remote_seq: u32, ack_base: u32, ack_mask: u32) {
        let mut out = OutputBitStream::new();
        out.write_u32(remote_seq);
        out.write_u32(ack_base);
        out.write_bits(ack_mask as u64, 32);
        let mut input = InputBitStream::new(out.into_bytes());
        assert!(tracker.read_and_process_state(&mut input).unwrap());
    }

    #[test]
    fn sequences_start_at_one_and_increase() {
        let mut tracker = tracker();
        assert_eq!(write_packet(&mut tracker), 1);
        assert_eq!(write_packet(&mut tracker), 2);
        assert_eq!(write_packet(&mut tracker), 3);
        assert_eq!(tracker.in_flight_count(), 3);
        assert_eq!(tracker.dispatched_count(), 3);
    }

    #[test]
    fn write_state_stamps_header() {
        let mut tracker = tracker();
        let mut out = OutputBitStream::new();
        tracker.write_state(&mut out);

        let mut input = InputBitStream::new(out.into_bytes());
        assert_eq!(input.read_u32().unwrap(), 1); // sequence
        assert_eq!(input.read_u32().unwrap(), 0); // ack base: nothing received
        assert_eq!(input.read_bits(32).unwrap(), 0); // ack bitfield
    }

    #[test]
    fn ack_resolves_as_delivered() {
        let mut tracker = tracker();
        write_packet(&mut tracker);
        write_packet(&mut tracker);

        // peer acks sequence 2 with sequence 1 in the bitfield
        ack_packet(&mut tracker, 1, 2, 0b1);

        assert_eq!(tracker.in_flight_count(), 0);
        let resolutions = tracker.take_resolutions();
        assert_eq!(resolutions.len(), 2);
        assert!(
            resolutions
                .iter()
                .all(|r| r.outcome == DeliveryOutcome::Delivered)
        );
        assert_eq!(tracker.delivered_count(), 2);
    }

    #[test]
    fn window_passage_resolves_as_lost() {
        let mut tracker = tracker();
        write_packet(&mut tracker); // sequence 1

        // the peer's window advanced far past sequence 1 without acking it
        ack_packet(&mut tracker, 1, 100, 0);

        let resolutions = tracker.take_resolutions();
        assert_eq!(resolutions.len(), 1);
        assert_eq!(resolutions[0].sequence, 1);
        assert_eq!(resolutions[0].outcome, DeliveryOutcome::Lost);
        assert_eq!(tracker.lost_count(), 1);
    }

    #[test]
    fn unacked_inside_window_stays_in_flight() {
        let mut tracker = tracker();
        write_packet(&mut tracker); // 1
        write_packet(&mut tracker); // 2

        // base 2 acked, bit for 1 clear: 1 may still be acked later
        ack_packet(&mut tracker, 1, 2, 0);

        assert_eq!(tracker.in_flight_count(), 1);
        let resolutions = tracker.take_resolutions();
        assert_eq!(resolutions.len(), 1);
        assert_eq!(resolutions[0].sequence, 2);

        // the late ack lands
        ack_packet(&mut tracker, 2, 2, 0b1);
        let resolutions = tracker.take_resolutions();
        assert_eq!(resolutions.len(), 1);
        assert_eq!(resolutions[0].sequence, 1);
        assert_eq!(resolutions[0].outcome, DeliveryOutcome::Delivered);
    }

    #[test]
    fn each_packet_resolves_exactly_once() {
        let mut tracker = tracker();
        write_packet(&mut tracker);

        ack_packet(&mut tracker, 1, 1, 0);
        // duplicate ack of the same sequence is ignored entirely
        let mut out = OutputBitStream::new();
        out.write_u32(1);
        out.write_u32(1);
        out.write_bits(0, 32);
        let mut input = InputBitStream::new(out.into_bytes());
        assert!(!tracker.read_and_process_state(&mut input).unwrap());

        assert_eq!(tracker.take_resolutions().len(), 1);
        assert_eq!(tracker.delivered_count(), 1);
        assert_eq!(tracker.lost_count(), 0);
    }

    #[test]
    fn rtt_updates_on_delivery() {
        let mut tracker = tracker();
        write_packet(&mut tracker);

        // an immediate ack pulls the estimate below its initial value
        ack_packet(&mut tracker, 1, 1, 0);
        assert!(tracker.srtt_ms() < 100.0);
    }

    #[test]
    fn timeout_resolves_as_lost() {
        let mut config = NetConfig::default();
        config.delivery_timeout = Duration::ZERO;
        let mut tracker = DeliveryTracker::new(&config);

        let mut out = OutputBitStream::new();
        tracker.write_state(&mut out);
        tracker.process_timed_out_packets();

        let resolutions = tracker.take_resolutions();
        assert_eq!(resolutions.len(), 1);
        assert_eq!(resolutions[0].outcome, DeliveryOutcome::Lost);
        assert_eq!(tracker.in_flight_count(), 0);
    }

    #[test]
    fn overflow_evicts_oldest_as_lost() {
        let mut config = NetConfig::default();
        config.max_in_flight = 2;
        let mut tracker = DeliveryTracker::new(&config);

        write_packet(&mut tracker); // 1
        write_packet(&mut tracker); // 2
        write_packet(&mut tracker); // 3 evicts 1

        assert_eq!(tracker.in_flight_count(), 2);
        let resolutions = tracker.take_resolutions();
        assert_eq!(resolutions.len(), 1);
        assert_eq!(resolutions[0].sequence, 1);
        assert_eq!(resolutions[0].outcome, DeliveryOutcome::Lost);
    }

    #[test]
    fn incoming_window_tracks_out_of_order() {
        let mut tracker = tracker();
        ack_packet(&mut tracker, 3, 0, 0);
        ack_packet(&mut tracker, 1, 0, 0);
        ack_packet(&mut tracker, 2, 0, 0);

        let (base, mask) = tracker.ack_window();
        assert_eq!(base, 3);
        assert_eq!(mask & 0b11, 0b11);
    }

    #[test]
    fn incoming_window_never_claims_unseen() {
        let mut tracker = tracker();
        // 3 arrives first: 1 and 2 must not be marked received
        ack_packet(&mut tracker, 3, 0, 0);
        let (base, mask) = tracker.ack_window();
        assert_eq!(base, 3);
        assert_eq!(mask, 0);
    }

    #[test]
    fn duplicate_incoming_sequence_detected() {
        let mut tracker = tracker();
        ack_packet(&mut tracker, 1, 0, 0);
        ack_packet(&mut tracker, 2, 0, 0);

        for dup in [1, 2] {
            let mut out = OutputBitStream::new();
            out.write_u32(dup);
            out.write_u32(0);
            out.write_bits(0, 32);
            let mut input = InputBitStream::new(out.into_bytes());
            assert!(!tracker.read_and_process_state(&mut input).unwrap());
        }
    }

    #[test]
    fn truncated_header_is_underrun() {
        let mut tracker = tracker();
        let mut input = InputBitStream::new(vec![0xFF; 4]);
        assert!(tracker.read_and_process_state(&mut input).is_err());
    }

    #[test]
    fn failure_records_reach_replication() {
        let mut config = NetConfig::default();
        config.delivery_timeout = Duration::ZERO;
        let mut tracker = DeliveryTracker::new(&config);
        let mut replication = ReplicationManager::new();

        let mut out = OutputBitStream::new();
        let in_flight = tracker.write_state(&mut out);
        in_flight.add_record(TransmissionRecord::Replication {
            object: 7,
            action: ReplicationAction::Update,
            mask: 0b101,
        });

        tracker.process_timed_out_packets();
        for resolution in tracker.take_resolutions() {
            for record in &resolution.records {
                match resolution.outcome {
                    DeliveryOutcome::Delivered => record.handle_delivery_success(&mut replication),
                    DeliveryOutcome::Lost => record.handle_delivery_failure(&mut replication),
                }
            }
        }

        assert_eq!(replication.dirty_mask(7), Some(0b101));
    }
}
