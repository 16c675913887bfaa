use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};

use crate::dispatcher::DispatchEvent;
use crate::manager::NetworkManager;
use crate::world::World;

/// Deferred work executed inside the handler's serialized context. This is
/// how timer fires and other cross-thread events become safe state
/// mutations.
pub type PendingFn<W> = Box<dyn FnOnce(&mut NetworkManager, &mut W) + Send>;

/// The single serialized execution context of the server. Exactly one unit
/// of work runs at a time, and this loop is the only writer of client and
/// replication state, which is why none of it needs locking.
pub struct PacketHandler<W: World> {
    events: Receiver<DispatchEvent>,
    pending_rx: Receiver<PendingFn<W>>,
    pending_tx: Sender<PendingFn<W>>,
    wake_tx: SyncSender<DispatchEvent>,
    running: Arc<AtomicBool>,
}

pub struct PacketHandlerHandle<W: World> {
    pending_tx: Sender<PendingFn<W>>,
    wake_tx: SyncSender<DispatchEvent>,
    running: Arc<AtomicBool>,
}

impl<W: World> Clone for PacketHandlerHandle<W> {
    fn clone(&self) -> Self {
        Self {
            pending_tx: self.pending_tx.clone(),
            wake_tx: self.wake_tx.clone(),
            running: self.running.clone(),
        }
    }
}

impl<W: World> PacketHandler<W> {
    pub fn new(
        events: Receiver<DispatchEvent>,
        wake_tx: SyncSender<DispatchEvent>,
        running: Arc<AtomicBool>,
    ) -> Self {
        let (pending_tx, pending_rx) = mpsc::channel();
        Self {
            events,
            pending_rx,
            pending_tx,
            wake_tx,
            running,
        }
    }

    pub fn handle(&self) -> PacketHandlerHandle<W> {
        PacketHandlerHandle {
            pending_tx: self.pending_tx.clone(),
            wake_tx: self.wake_tx.clone(),
            running: self.running.clone(),
        }
    }

    /// Blocks the calling thread, draining one received packet at a time
    /// and, after each (or on a wake-up), every currently queued pending
    /// callback. Returns when the running flag clears or every producer is
    /// gone.
    pub fn run(&self, manager: &mut NetworkManager, world: &mut W) {
        while self.running.load(Ordering::SeqCst) {
            match self.events.recv() {
                Ok(DispatchEvent::Packet(packet)) => {
                    manager.process_received_packet(packet, world);
                    self.drain_pending(manager, world);
                }
                Ok(DispatchEvent::Wake) => self.drain_pending(manager, world),
                Err(_) => break,
            }
        }
    }

    fn drain_pending(&self, manager: &mut NetworkManager, world: &mut W) {
        while let Ok(func) = self.pending_rx.try_recv() {
            func(manager, world);
        }
    }
}

impl<W: World> PacketHandlerHandle<W> {
    /// Enqueues deferred work for the handler context. Safe to call from
    /// any thread.
    pub fn append_pending_fn(&self, func: impl FnOnce(&mut NetworkManager, &mut W) + Send + 'static) {
        if self.pending_tx.send(Box::new(func)).is_err() {
            return;
        }
        match self.wake_tx.try_send(DispatchEvent::Wake) {
            Ok(()) => {}
            // a full queue means packets are already waiting; the handler
            // will drain pending work right after them
            Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Asks the handler loop to exit after the unit of work in progress.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.wake_tx.try_send(DispatchEvent::Wake);
    }
}
