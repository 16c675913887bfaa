mod world;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use outpost::{DEFAULT_PORT, NetConfig, NetworkManager, PacketDispatcher, PacketHandler};

use world::ArenaWorld;

#[derive(Parser)]
#[command(name = "outpost-server")]
#[command(about = "Realtime state replication server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = 2)]
    workers: usize,

    #[arg(short, long, default_value_t = 32)]
    max_clients: usize,

    #[arg(long, default_value_t = 33, help = "State flush interval in ms")]
    send_interval_ms: u64,

    #[arg(long, default_value_t = 6, help = "Evict silent clients after this many seconds")]
    disconnect_timeout_secs: u64,

    #[arg(long, default_value_t = 500, help = "Declare unacked packets lost after this many ms")]
    delivery_timeout_ms: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = NetConfig {
        worker_threads: args.workers,
        max_clients: args.max_clients,
        send_interval: Duration::from_millis(args.send_interval_ms),
        disconnect_timeout: Duration::from_secs(args.disconnect_timeout_secs),
        delivery_timeout: Duration::from_millis(args.delivery_timeout_ms),
        ..NetConfig::default()
    };

    let bind_addr = format!("{}:{}", args.bind, args.port);
    let (mut dispatcher, events) = PacketDispatcher::bind(&bind_addr, &config)?;
    log::info!("server listening on {}", dispatcher.local_addr());

    let handler: PacketHandler<ArenaWorld> =
        PacketHandler::new(events, dispatcher.event_sender(), dispatcher.running());

    // periodic duties run on timer threads but execute in the handler context
    let flush = handler.handle();
    dispatcher.set_interval(config.send_interval, move || {
        flush.append_pending_fn(|manager, world| manager.flush_state_packets(world));
    })?;
    let sweep = handler.handle();
    dispatcher.set_interval(config.disconnect_timeout, move || {
        sweep.append_pending_fn(|manager, world| manager.check_for_disconnects(world));
    })?;

    let mut manager = NetworkManager::new(config, dispatcher.send_queues());
    let mut world = ArenaWorld::new();

    // the main thread becomes the packet handler
    handler.run(&mut manager, &mut world);

    log::info!("server shutting down");
    Ok(())
}
