mod transport;

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use glam::{Quat, Vec3};

use netsync_core::{discovery, persist, ClientTransform, LocalMode, NetSyncEvent, Pose3, PoseFlags, SessionConfig, SessionController};

use transport::UdpTransport;

/// Orbits a synthetic head pose around the origin; stands in for real
/// tracking input so `--stealth`-off demos still exercise the pose codec.
fn synthetic_transform(device_id: &str, t: f64) -> ClientTransform {
    let angle = t as f32;
    ClientTransform {
        device_id: device_id.to_string(),
        client_no: 0,
        pose_time: t,
        pose_seq: (t * 60.0) as u16,
        flags: PoseFlags::HEAD_VALID,
        encoding_flags: netsync_core::EncodingFlags::default(),
        physical: None,
        head: Some(Pose3 {
            position: Vec3::new(angle.cos(), 1.6, angle.sin()),
            rotation: Quat::from_rotation_y(angle),
        }),
        right_hand: None,
        left_hand: None,
        virtuals: Vec::new(),
    }
}

#[derive(Parser)]
#[command(name = "netsync-cli")]
#[command(about = "NetSync session demo client")]
struct Args {
    #[arg(short, long)]
    server: Option<String>,

    #[arg(long, default_value_t = 5555)]
    dealer_port: u16,

    #[arg(long, default_value_t = 5556)]
    sub_port: u16,

    #[arg(short, long, default_value = "default_room")]
    room: String,

    #[arg(long, default_value_t = 10.0)]
    send_rate: f64,

    #[arg(long)]
    no_discovery: bool,

    #[arg(long)]
    stealth: bool,

    #[arg(long, default_value = "device-cli")]
    device_id: String,
}

fn last_known_path() -> PathBuf {
    std::env::temp_dir().join("netsync-cli-last-known.txt")
}

fn resolve_server(args: &Args, config: &SessionConfig) -> Option<Ipv4Addr> {
    if let Some(addr) = &args.server {
        if let Ok(parsed) = addr.parse() {
            return Some(parsed);
        }
        log::warn!("cli: could not parse --server {addr} as an IPv4 address");
    }

    if !config.enable_discovery {
        return None;
    }

    let socket = std::net::UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    let timeout = Duration::from_secs_f64(config.discovery_timeout_secs);
    match discovery::broadcast_probe(&socket, config.beacon_port, timeout) {
        Ok(Some(found)) => {
            let _ = persist::save_last_known_server(&last_known_path(), found.address);
            Some(found.address)
        }
        Ok(None) => {
            log::warn!("cli: discovery broadcast got no reply, falling back to last known server");
            persist::load_last_known_servers(&last_known_path()).into_iter().next()
        }
        Err(e) => {
            log::warn!("cli: discovery probe failed: {e}");
            None
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    let config = SessionConfig {
        server_address: args.server.clone().unwrap_or_default(),
        dealer_port: args.dealer_port,
        sub_port: args.sub_port,
        room_id: args.room.clone(),
        send_rate_hz: args.send_rate,
        enable_discovery: !args.no_discovery,
        ..SessionConfig::default()
    };

    let Some(server_addr) = resolve_server(&args, &config) else {
        anyhow::bail!("no server address supplied and discovery found nothing");
    };
    log::info!("cli: connecting to {server_addr} (dealer {}, sub {})", config.dealer_port, config.sub_port);

    let transport = UdpTransport::connect(server_addr, config.dealer_port, config.sub_port)?;

    let epoch_for_mode = Instant::now();
    let device_id_for_mode = args.device_id.clone();
    let mode = if args.stealth {
        LocalMode::Stealth
    } else {
        LocalMode::Visible(Box::new(move || synthetic_transform(&device_id_for_mode, epoch_for_mode.elapsed().as_secs_f64())))
    };

    let mut session = SessionController::new(config.clone(), args.device_id.clone(), mode);

    let epoch = Instant::now();
    let now_seconds = move || epoch.elapsed().as_secs_f64();
    session.attach_transport(transport, now_seconds.clone());
    session.send_handshake();

    let tick_interval = Duration::from_secs_f64(1.0 / config.send_rate_hz.max(0.1));
    loop {
        let now = now_seconds();
        session.tick_receive(now);
        let poses = session.tick_channels(now, tick_interval.as_secs_f64());
        for (client_no, pose) in &poses {
            log::trace!("cli: peer {client_no} head={:?}", pose.head);
        }

        if session.tick_send() {
            log::warn!("cli: connection error, reconnect loop not implemented in this demo binary");
            break;
        }

        session.tick_readiness(now);

        while let Some(event) = session.drain_event() {
            match event {
                NetSyncEvent::AvatarConnected(client_no) => log::info!("cli: avatar {client_no} connected"),
                NetSyncEvent::AvatarDisconnected(client_no) => log::info!("cli: avatar {client_no} disconnected"),
                NetSyncEvent::RpcReceived { sender_client_no, name, args } => {
                    log::info!("cli: rpc {name} from {sender_client_no} args={args:?}");
                }
                NetSyncEvent::GlobalVariableChanged { name, old, new } => {
                    log::info!("cli: global var {name} changed {old:?} -> {new}");
                }
                NetSyncEvent::ClientVariableChanged { client_no, name, old, new } => {
                    log::info!("cli: client {client_no} var {name} changed {old:?} -> {new}");
                }
                NetSyncEvent::Ready => log::info!("cli: session ready as client_no={}", session.client_no()),
                NetSyncEvent::ConnectionError(reason) => log::warn!("cli: connection error: {reason}"),
            }
        }

        std::thread::sleep(tick_interval);
    }

    Ok(())
}
