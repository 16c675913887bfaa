use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, info, warn};

use crate::actions::Action;
use crate::bitstream::{InputBitStream, OutputBitStream};
use crate::config::NetConfig;
use crate::dispatcher::{PendingSendPacket, ReceivedPacket, SendQueues};
use crate::protocol::{ACTION_COUNT_BITS, MAX_PACKET_SIZE, PACKET_KIND_BITS, PacketError, PacketKind};
use crate::proxy::ClientProxy;
use crate::replication::ReplicationAction;
use crate::world::{ObjectId, PlayerInput, StateMask, World, WorldDelta};

/// Routes datagrams to client proxies, admits new peers, builds outgoing
/// packets and runs the periodic maintenance sweeps. Only ever driven from
/// the packet handler's serialized context.
pub struct NetworkManager {
    config: NetConfig,
    sends: SendQueues,
    clients: HashMap<SocketAddr, ClientProxy>,
    next_player_id: AtomicU32,
    input_batch: Vec<PlayerInput>,
    delta_batch: Vec<WorldDelta>,
}

impl NetworkManager {
    pub fn new(config: NetConfig, sends: SendQueues) -> Self {
        Self {
            config,
            sends,
            clients: HashMap::new(),
            next_player_id: AtomicU32::new(1),
            input_batch: Vec::new(),
            delta_batch: Vec::new(),
        }
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn client(&self, peer: &SocketAddr) -> Option<&ClientProxy> {
        self.clients.get(peer)
    }

    /// One full turn of the pipeline for a received datagram: route it,
    /// give the world its update, then flush replies and broadcasts.
    pub fn process_received_packet<W: World>(&mut self, packet: ReceivedPacket, world: &mut W) {
        let mut stream = InputBitStream::new(packet.data);

        if self.clients.contains_key(&packet.peer) {
            if let Err(e) = self.check_packet_type(packet.peer, &mut stream, world) {
                debug!("dropping malformed packet from {}: {}", packet.peer, e);
            }
        } else {
            self.welcome_new_client(&mut stream, packet.peer, packet.worker, world);
        }

        self.run_world_update(world);
        self.flush_state_packets(world);
    }

    /// First-contact handling. Only Hello, Input and ResetAck are accepted
    /// from a peer we do not know; anything else is logged and dropped.
    fn welcome_new_client<W: World>(
        &mut self,
        stream: &mut InputBitStream,
        peer: SocketAddr,
        worker: usize,
        world: &mut W,
    ) {
        let kind = stream
            .read_bits(PACKET_KIND_BITS)
            .ok()
            .and_then(|raw| PacketKind::from_wire(raw as u8))
            .filter(|kind| kind.is_first_contact());
        let Some(kind) = kind else {
            warn!(
                "bad incoming packet from unknown peer {}; dropping (junk or scan traffic)",
                peer
            );
            return;
        };

        if self.clients.len() >= self.config.max_clients {
            warn!(
                "rejecting {}: client limit {} reached",
                peer, self.config.max_clients
            );
            return;
        }

        // objects that predate this client, replicated to it as creates
        let mut existing = Vec::new();
        world.objects(&mut existing);

        let player_id = self.next_player_id.fetch_add(1, Ordering::SeqCst);
        let (object_id, full_mask) = world.spawn_player(player_id);

        let mut proxy = ClientProxy::new(peer, player_id, object_id, worker, &self.config);
        for (object, mask) in existing {
            proxy.replication.replicate_create(object, mask);
        }
        self.clients.insert(peer, proxy);
        self.notify_all_clients(object_id, ReplicationAction::Create, full_mask);

        let Some(proxy) = self.clients.get_mut(&peer) else {
            return;
        };
        if kind == PacketKind::Hello {
            Self::do_prepare_packet_to_send(
                &self.config,
                &self.sends,
                proxy,
                PacketKind::Welcome,
                world,
            );
            info!("admitted {} as player {}", peer, player_id);
        } else {
            // the peer was talking to a previous incarnation of this server
            proxy.awaiting_reset_ack = true;
            Self::do_prepare_packet_to_send(
                &self.config,
                &self.sends,
                proxy,
                PacketKind::Reset,
                world,
            );
            info!("resetting returning peer {} as player {}", peer, player_id);
        }
    }

    fn check_packet_type<W: World>(
        &mut self,
        peer: SocketAddr,
        stream: &mut InputBitStream,
        world: &mut W,
    ) -> Result<(), PacketError> {
        let Some(proxy) = self.clients.get_mut(&peer) else {
            return Ok(());
        };
        proxy.touch();

        let kind = Self::handle_server_reset(&self.config, &self.sends, proxy, stream, world)?;
        match kind {
            PacketKind::Hello => Self::do_prepare_packet_to_send(
                &self.config,
                &self.sends,
                proxy,
                PacketKind::Welcome,
                world,
            ),
            PacketKind::Input => {
                if proxy.delivery.read_and_process_state(stream)? {
                    proxy.resolve_deliveries();
                    Self::handle_input_packet(proxy, stream)?;
                }
            }
            PacketKind::Null => {}
            other => debug!("unexpected {:?} packet from {}", other, peer),
        }
        Ok(())
    }

    /// The reset interlock: a leading ResetAck clears the flag and yields
    /// the real packet kind behind it; while the flag is still set, the
    /// packet is answered with a Welcome resend and otherwise ignored.
    fn handle_server_reset<W: World>(
        config: &NetConfig,
        sends: &SendQueues,
        proxy: &mut ClientProxy,
        stream: &mut InputBitStream,
        world: &W,
    ) -> Result<PacketKind, PacketError> {
        let mut kind = Self::read_kind(stream)?;
        if kind == PacketKind::ResetAck {
            proxy.awaiting_reset_ack = false;
            if stream.remaining_bits() < PACKET_KIND_BITS {
                return Ok(PacketKind::Null);
            }
            kind = Self::read_kind(stream)?;
        }
        if proxy.awaiting_reset_ack {
            Self::do_prepare_packet_to_send(config, sends, proxy, PacketKind::Welcome, world);
            return Ok(PacketKind::Null);
        }
        Ok(kind)
    }

    fn read_kind(stream: &mut InputBitStream) -> Result<PacketKind, PacketError> {
        let raw = stream.read_bits(PACKET_KIND_BITS)? as u8;
        PacketKind::from_wire(raw).ok_or(PacketError::UnknownKind(raw))
    }

    fn handle_input_packet(
        proxy: &mut ClientProxy,
        stream: &mut InputBitStream,
    ) -> Result<(), PacketError> {
        let count = stream.read_bits(ACTION_COUNT_BITS)?;
        for _ in 0..count {
            let action = Action::read(stream)?;
            if proxy.actions.add_move_if_new(action) {
                proxy.last_move_timestamp_dirty = true;
            }
        }
        Ok(())
    }

    /// Assembles one outgoing packet: kind, sequence/ack stamp, the
    /// kind-specific trailer, then pending replication, and hands the bytes
    /// to the worker owning this connection.
    fn do_prepare_packet_to_send<W: World>(
        config: &NetConfig,
        sends: &SendQueues,
        proxy: &mut ClientProxy,
        kind: PacketKind,
        world: &W,
    ) {
        let mut out = OutputBitStream::new();
        out.write_bits(kind.to_wire() as u64, PACKET_KIND_BITS);

        let in_flight = proxy.delivery.write_state(&mut out);

        match kind {
            PacketKind::Welcome | PacketKind::Reset => {
                out.write_u32(proxy.player_id);
                out.write_f32(config.send_interval.as_secs_f32());
            }
            PacketKind::State => {
                let timestamp = proxy.actions.last_move_timestamp();
                let dirty = proxy.last_move_timestamp_dirty && timestamp.is_some();
                out.write_bool(dirty);
                if dirty {
                    out.write_u32(timestamp.unwrap_or_default());
                }
                proxy.last_move_timestamp_dirty = false;
            }
            _ => {}
        }

        proxy.replication.write(&mut out, in_flight, world);

        if out.byte_length() > MAX_PACKET_SIZE {
            warn!(
                "{:?} packet for player {} is {} bytes, over the {} byte MTU",
                kind,
                proxy.player_id,
                out.byte_length(),
                MAX_PACKET_SIZE
            );
        }

        // write_state may have evicted overcrowded in-flight packets
        proxy.resolve_deliveries();

        sends.enqueue(
            proxy.owning_worker,
            PendingSendPacket {
                data: out.into_bytes(),
                peer: proxy.peer,
            },
        );
    }

    /// Drains pending input into the world and fans the resulting deltas
    /// out to every client's replication state.
    fn run_world_update<W: World>(&mut self, world: &mut W) {
        self.input_batch.clear();
        for proxy in self.clients.values_mut() {
            if !proxy.actions.is_empty() {
                self.input_batch.push(PlayerInput {
                    player_id: proxy.player_id,
                    actions: proxy.actions.drain(),
                });
            }
        }

        let mut deltas = std::mem::take(&mut self.delta_batch);
        deltas.clear();
        world.update(&self.input_batch, &mut deltas);
        for delta in &deltas {
            match *delta {
                WorldDelta::StateDirty { object, mask } => self.set_rep_state_dirty(object, mask),
                WorldDelta::Spawned { object, full_mask } => {
                    self.notify_all_clients(object, ReplicationAction::Create, full_mask)
                }
                WorldDelta::Despawned { object } => {
                    self.notify_all_clients(object, ReplicationAction::Destroy, 0)
                }
            }
        }
        self.delta_batch = deltas;
    }

    /// The per-turn maintenance pass: resolve timed-out deliveries for
    /// every client, then send a state packet to each one with a dirty
    /// input timestamp or pending replication. Also registered as the
    /// periodic send-interval callback.
    pub fn flush_state_packets<W: World>(&mut self, world: &mut W) {
        for proxy in self.clients.values_mut() {
            proxy.delivery.process_timed_out_packets();
            proxy.resolve_deliveries();

            if proxy.last_move_timestamp_dirty || proxy.replication.has_pending() {
                Self::do_prepare_packet_to_send(
                    &self.config,
                    &self.sends,
                    proxy,
                    PacketKind::State,
                    world,
                );
            }
        }
    }

    /// Evicts every client that has been silent past the disconnect
    /// timeout. Runs as a periodic callback inside the handler context.
    pub fn check_for_disconnects<W: World>(&mut self, world: &mut W) {
        let timeout = self.config.disconnect_timeout;
        let expired: Vec<SocketAddr> = self
            .clients
            .iter()
            .filter(|(_, proxy)| proxy.is_timed_out(timeout))
            .map(|(peer, _)| *peer)
            .collect();
        for peer in expired {
            self.remove_client(peer, world);
        }
    }

    /// Removing the map entry first guarantees eviction happens once and
    /// stops any future enqueues for the connection.
    pub fn remove_client<W: World>(&mut self, peer: SocketAddr, world: &mut W) {
        let Some(proxy) = self.clients.remove(&peer) else {
            return;
        };
        info!("player {} at {} disconnected", proxy.player_id, peer);
        world.despawn_player(proxy.player_id, proxy.object_id);
        self.notify_all_clients(proxy.object_id, ReplicationAction::Destroy, 0);
    }

    /// Broadcast surface for the gameplay layer: fan one object event to
    /// every connected client's replication manager.
    pub fn notify_all_clients(&mut self, object: ObjectId, action: ReplicationAction, mask: StateMask) {
        for proxy in self.clients.values_mut() {
            match action {
                ReplicationAction::Create => proxy.replication.replicate_create(object, mask),
                ReplicationAction::Update => proxy.replication.set_state_dirty(object, mask),
                ReplicationAction::Destroy => proxy.replication.replicate_destroy(object),
            }
        }
    }

    pub fn set_rep_state_dirty(&mut self, object: ObjectId, mask: StateMask) {
        for proxy in self.clients.values_mut() {
            proxy.replication.set_state_dirty(object, mask);
        }
    }
}
