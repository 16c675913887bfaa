use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, warn};

use crate::config::NetConfig;
use crate::protocol::MAX_PACKET_SIZE;

/// Raw datagram plus the identity needed to route it: the sending peer and
/// the worker thread it arrived on (which becomes the owning worker for
/// replies to a new client).
#[derive(Debug)]
pub struct ReceivedPacket {
    pub data: Vec<u8>,
    pub peer: SocketAddr,
    pub worker: usize,
}

#[derive(Debug)]
pub struct PendingSendPacket {
    pub data: Vec<u8>,
    pub peer: SocketAddr,
}

/// What the packet-handler thread consumes. `Wake` exists so a pending
/// callback enqueued from another thread can rouse a handler blocked on an
/// empty queue.
#[derive(Debug)]
pub enum DispatchEvent {
    Packet(ReceivedPacket),
    Wake,
}

/// Handles to the per-worker outgoing queues. Sends for one connection must
/// always go through the same worker so they hit the socket in submission
/// order.
#[derive(Debug, Clone)]
pub struct SendQueues {
    queues: Vec<Sender<PendingSendPacket>>,
}

impl SendQueues {
    pub fn new(queues: Vec<Sender<PendingSendPacket>>) -> Self {
        Self { queues }
    }

    pub fn worker_count(&self) -> usize {
        self.queues.len()
    }

    pub fn enqueue(&self, worker: usize, packet: PendingSendPacket) {
        let Some(queue) = self.queues.get(worker % self.queues.len().max(1)) else {
            warn!("no send queue for worker {}, dropping packet", worker);
            return;
        };
        if queue.send(packet).is_err() {
            warn!("send queue for worker {} is closed", worker);
        }
    }
}

/// Owns the datagram socket and the I/O worker pool. Workers move opaque
/// buffers between the socket and the dispatch queues; they never touch
/// client or replication state.
pub struct PacketDispatcher {
    local_addr: SocketAddr,
    event_tx: SyncSender<DispatchEvent>,
    send_queues: SendQueues,
    workers: Vec<JoinHandle<()>>,
    timers: Vec<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl PacketDispatcher {
    /// Binds the socket and spawns the worker pool. Returns the dispatcher
    /// plus the receiving end of the bounded event queue the packet handler
    /// drains.
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
        config: &NetConfig,
    ) -> io::Result<(Self, Receiver<DispatchEvent>)> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        let (event_tx, event_rx) = mpsc::sync_channel(config.receive_queue_depth.max(1));
        let running = Arc::new(AtomicBool::new(true));

        let worker_count = config.worker_threads.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        let mut send_txs = Vec::with_capacity(worker_count);

        for worker in 0..worker_count {
            let socket = socket.try_clone()?;
            let (send_tx, send_rx) = mpsc::channel();
            send_txs.push(send_tx);

            let event_tx = event_tx.clone();
            let running = running.clone();
            let handle = thread::Builder::new()
                .name(format!("net-worker-{worker}"))
                .spawn(move || worker_loop(socket, worker, event_tx, send_rx, running))?;
            workers.push(handle);
        }

        Ok((
            Self {
                local_addr,
                event_tx,
                send_queues: SendQueues::new(send_txs),
                workers,
                timers: Vec::new(),
                running,
            },
            event_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn send_queues(&self) -> SendQueues {
        self.send_queues.clone()
    }

    pub fn event_sender(&self) -> SyncSender<DispatchEvent> {
        self.event_tx.clone()
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Spawns a repeating timer that fires `callback` every `period` until
    /// shutdown. Callbacks run on the timer thread; anything touching
    /// client state must be marshaled through the packet handler.
    pub fn set_interval(
        &mut self,
        period: Duration,
        callback: impl Fn() + Send + 'static,
    ) -> io::Result<()> {
        let running = self.running.clone();
        let handle = thread::Builder::new()
            .name("net-timer".into())
            .spawn(move || {
                while sliced_sleep(period, &running) {
                    callback();
                }
            })?;
        self.timers.push(handle);
        Ok(())
    }

    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        for timer in self.timers.drain(..) {
            let _ = timer.join();
        }
    }
}

impl Drop for PacketDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sleeps for `period` in short slices so shutdown is not held hostage by a
/// long timer interval. Returns false once the running flag clears.
fn sliced_sleep(period: Duration, running: &AtomicBool) -> bool {
    const SLICE: Duration = Duration::from_millis(50);

    let mut remaining = period;
    while remaining > Duration::ZERO {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let step = remaining.min(SLICE);
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    running.load(Ordering::SeqCst)
}

fn worker_loop(
    socket: UdpSocket,
    worker: usize,
    event_tx: SyncSender<DispatchEvent>,
    send_rx: Receiver<PendingSendPacket>,
    running: Arc<AtomicBool>,
) {
    let mut buffer = [0u8; MAX_PACKET_SIZE];

    while running.load(Ordering::SeqCst) {
        let mut idle = true;

        match socket.recv_from(&mut buffer) {
            Ok((len, peer)) => {
                if len > 0 {
                    idle = false;
                    let packet = ReceivedPacket {
                        data: buffer[..len].to_vec(),
                        peer,
                        worker,
                    };
                    // bounded queue: a full pipeline stalls this worker, not
                    // the handler
                    if event_tx.send(DispatchEvent::Packet(packet)).is_err() {
                        break;
                    }
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => error!("worker {} recv error: {}", worker, e),
        }

        while let Ok(packet) = send_rx.try_recv() {
            idle = false;
            if let Err(e) = socket.send_to(&packet.data, packet.peer) {
                warn!("worker {} failed to send to {}: {}", worker, packet.peer, e);
            }
        }

        if idle {
            thread::sleep(Duration::from_millis(1));
        }
    }
}
