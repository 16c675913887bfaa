use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::thread;
use std::time::Duration;

use outpost::{
    ACTION_COUNT_BITS, Action, InputBitStream, NetConfig, NetworkManager, ObjectId,
    OutputBitStream, PACKET_KIND_BITS, PacketDispatcher, PacketHandler, PacketHandlerHandle,
    PacketKind, PlayerInput, StateMask, World, WorldDelta,
};

#[derive(Default)]
struct TestWorld {
    next_object: ObjectId,
    objects: HashMap<ObjectId, u32>,
}

impl TestWorld {
    fn new() -> Self {
        Self {
            next_object: 100,
            ..Self::default()
        }
    }
}

impl World for TestWorld {
    fn spawn_player(&mut self, player_id: u32) -> (ObjectId, StateMask) {
        let object = self.next_object;
        self.next_object += 1;
        self.objects.insert(object, player_id);
        (object, 0b1)
    }

    fn despawn_player(&mut self, _player_id: u32, object: ObjectId) {
        self.objects.remove(&object);
    }

    fn update(&mut self, _inputs: &[PlayerInput], _deltas: &mut Vec<WorldDelta>) {}

    fn objects(&self, out: &mut Vec<(ObjectId, StateMask)>) {
        for object in self.objects.keys() {
            out.push((*object, 0b1));
        }
    }

    fn write_state(&self, object: ObjectId, mask: StateMask, out: &mut OutputBitStream) {
        if mask & 0b1 != 0 {
            if let Some(value) = self.objects.get(&object) {
                out.write_u32(*value);
            }
        }
    }
}

struct Server {
    addr: SocketAddr,
    handle: PacketHandlerHandle<TestWorld>,
    dispatcher: PacketDispatcher,
    thread: Option<thread::JoinHandle<()>>,
}

impl Server {
    fn start(config: NetConfig) -> Server {
        let _ = env_logger::builder().is_test(true).try_init();

        let (dispatcher, events) = PacketDispatcher::bind("127.0.0.1:0", &config).unwrap();
        let addr = dispatcher.local_addr();

        let handler: PacketHandler<TestWorld> =
            PacketHandler::new(events, dispatcher.event_sender(), dispatcher.running());
        let handle = handler.handle();

        let mut manager = NetworkManager::new(config, dispatcher.send_queues());
        let thread = thread::spawn(move || {
            let mut world = TestWorld::new();
            handler.run(&mut manager, &mut world);
        });

        Server {
            addr,
            handle,
            dispatcher,
            thread: Some(thread),
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.stop();
        self.dispatcher.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn client_socket() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    socket
}

fn hello_packet() -> Vec<u8> {
    let mut out = OutputBitStream::new();
    out.write_bits(PacketKind::Hello.to_wire() as u64, PACKET_KIND_BITS);
    out.into_bytes()
}

fn input_packet(sequence: u32, ack_base: u32, actions: &[Action]) -> Vec<u8> {
    let mut out = OutputBitStream::new();
    out.write_bits(PacketKind::Input.to_wire() as u64, PACKET_KIND_BITS);
    out.write_u32(sequence);
    out.write_u32(ack_base);
    out.write_bits(0, 32);
    out.write_bits(actions.len() as u64, ACTION_COUNT_BITS);
    for action in actions {
        action.write(&mut out);
    }
    out.into_bytes()
}

struct Header {
    kind: PacketKind,
    sequence: u32,
    ack_base: u32,
    body: InputBitStream,
}

fn recv_packet(socket: &UdpSocket) -> Header {
    let mut buffer = [0u8; 1500];
    let (len, _) = socket.recv_from(&mut buffer).unwrap();
    let mut input = InputBitStream::new(buffer[..len].to_vec());
    let kind = PacketKind::from_wire(input.read_bits(PACKET_KIND_BITS).unwrap() as u8).unwrap();
    let sequence = input.read_u32().unwrap();
    let ack_base = input.read_u32().unwrap();
    input.read_bits(32).unwrap();
    Header {
        kind,
        sequence,
        ack_base,
        body: input,
    }
}

#[test]
fn hello_is_answered_with_welcome() {
    let server = Server::start(NetConfig::default());
    let client = client_socket();

    client.send_to(&hello_packet(), server.addr).unwrap();

    let mut welcome = recv_packet(&client);
    assert_eq!(welcome.kind, PacketKind::Welcome);
    assert_eq!(welcome.sequence, 1);
    assert_eq!(welcome.body.read_u32().unwrap(), 1); // player id
    let interval = welcome.body.read_f32().unwrap();
    assert!(interval > 0.0);
}

#[test]
fn input_round_trips_into_a_state_packet() {
    let server = Server::start(NetConfig::default());
    let client = client_socket();

    client.send_to(&hello_packet(), server.addr).unwrap();
    let welcome = recv_packet(&client);
    assert_eq!(welcome.kind, PacketKind::Welcome);

    let input = input_packet(1, welcome.sequence, &[Action::new(100, vec![1, 2])]);
    client.send_to(&input, server.addr).unwrap();

    let mut state = recv_packet(&client);
    assert_eq!(state.kind, PacketKind::State);
    assert_eq!(state.ack_base, 1); // our input was acknowledged
    assert!(state.body.read_bool().unwrap()); // timestamp dirty
    assert_eq!(state.body.read_u32().unwrap(), 100);
}

#[test]
fn junk_from_unknown_peer_gets_no_reply() {
    let server = Server::start(NetConfig::default());
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();

    // State is not a first-contact kind; the server must stay silent
    let mut out = OutputBitStream::new();
    out.write_bits(PacketKind::State.to_wire() as u64, PACKET_KIND_BITS);
    out.write_u32(1);
    client.send_to(&out.into_bytes(), server.addr).unwrap();

    let mut buffer = [0u8; 64];
    assert!(client.recv_from(&mut buffer).is_err());
}
