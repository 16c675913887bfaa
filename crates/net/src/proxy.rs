use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::actions::ActionList;
use crate::config::NetConfig;
use crate::delivery::{DeliveryOutcome, DeliveryTracker};
use crate::replication::ReplicationManager;
use crate::world::ObjectId;

/// Everything the server tracks for one connected client.
#[derive(Debug)]
pub struct ClientProxy {
    pub peer: SocketAddr,
    pub player_id: u32,
    pub object_id: ObjectId,
    /// Worker thread that owns sends to this peer. Fixed at admission so
    /// packets for one connection always leave in submission order.
    pub owning_worker: usize,
    pub last_packet_time: Instant,
    pub awaiting_reset_ack: bool,
    pub last_move_timestamp_dirty: bool,
    pub delivery: DeliveryTracker,
    pub actions: ActionList,
    pub replication: ReplicationManager,
}

impl ClientProxy {
    pub fn new(
        peer: SocketAddr,
        player_id: u32,
        object_id: ObjectId,
        owning_worker: usize,
        config: &NetConfig,
    ) -> Self {
        Self {
            peer,
            player_id,
            object_id,
            owning_worker,
            last_packet_time: Instant::now(),
            awaiting_reset_ack: false,
            last_move_timestamp_dirty: false,
            delivery: DeliveryTracker::new(config),
            actions: ActionList::new(),
            replication: ReplicationManager::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_packet_time = Instant::now();
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_packet_time.elapsed() > timeout
    }

    /// Feeds every delivery resolution the tracker has accumulated into the
    /// replication manager. The tracker is the only resolution trigger; the
    /// replication manager just reacts.
    pub fn resolve_deliveries(&mut self) {
        for resolution in self.delivery.take_resolutions() {
            for record in &resolution.records {
                match resolution.outcome {
                    DeliveryOutcome::Delivered => {
                        record.handle_delivery_success(&mut self.replication)
                    }
                    DeliveryOutcome::Lost => record.handle_delivery_failure(&mut self.replication),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::OutputBitStream;
    use crate::delivery::TransmissionRecord;
    use crate::replication::ReplicationAction;

    fn proxy() -> ClientProxy {
        let mut config = NetConfig::default();
        config.delivery_timeout = Duration::ZERO;
        ClientProxy::new("127.0.0.1:9".parse().unwrap(), 1, 10, 0, &config)
    }

    #[test]
    fn lost_packet_redirties_replication() {
        let mut proxy = proxy();
        proxy.replication.set_state_dirty(10, 0b11);

        let mut out = OutputBitStream::new();
        let in_flight = proxy.delivery.write_state(&mut out);
        in_flight.add_record(TransmissionRecord::Replication {
            object: 10,
            action: ReplicationAction::Update,
            mask: 0b11,
        });
        proxy.replication.forget(10); // pretend the write cleared it

        proxy.delivery.process_timed_out_packets();
        proxy.resolve_deliveries();

        assert_eq!(proxy.replication.dirty_mask(10), Some(0b11));
    }

    #[test]
    fn timeout_detection() {
        let mut proxy = proxy();
        assert!(!proxy.is_timed_out(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(1));
        assert!(proxy.is_timed_out(Duration::ZERO));
        proxy.touch();
        assert!(!proxy.is_timed_out(Duration::from_secs(60)));
    }
}
