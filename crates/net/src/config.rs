use std::time::Duration;

/// Policy knobs for the transport stack. The acknowledgment window width is
/// a protocol parameter both ends must agree on; everything else is local
/// tuning.
#[derive(Debug, Clone)]
pub struct NetConfig {
    pub worker_threads: usize,
    pub receive_queue_depth: usize,
    pub max_clients: usize,
    pub send_interval: Duration,
    pub disconnect_timeout: Duration,
    pub delivery_timeout: Duration,
    pub max_in_flight: usize,
    pub ack_window_bits: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            receive_queue_depth: 1024,
            max_clients: 32,
            send_interval: Duration::from_millis(33),
            disconnect_timeout: Duration::from_secs(6),
            delivery_timeout: Duration::from_millis(500),
            max_in_flight: 512,
            ack_window_bits: 32,
        }
    }
}

