//! Minimal echo client/server over cordnet.
//!
//! ```text
//! cordnet_echo server 0.0.0.0:7777
//! cordnet_echo client 127.0.0.1:7777 --count 100
//! ```

use std::net::SocketAddr;

use clap::Parser;
use tracing::{info, warn};

use cordnet::{crc32, Event, Host, HostConfig, Packet, UdpIo};

#[derive(Debug, Parser)]
enum Args {
    /// Accept connections and echo every packet back on its channel.
    Server {
        /// Address to bind.
        bind: SocketAddr,
    },
    /// Connect to a server and measure echo round-trips.
    Client {
        /// Server address.
        server: SocketAddr,
        /// Number of packets to echo.
        #[arg(long, default_value_t = 10)]
        count: u32,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match Args::parse() {
        Args::Server { bind } => server(bind),
        Args::Client { server, count } => client(server, count),
    }
}

fn server(bind: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let socket = UdpIo::bind(bind)?;
    let mut host = Host::new(socket, HostConfig::default())?;
    host.set_checksum(Some(crc32::checksum_slices));
    info!("Listening on {bind}");

    loop {
        match host.service(100)? {
            Some(Event::Connect { peer, .. }) => {
                info!("{peer:?} connected from {:?}", host.peer(peer).address());
            }
            Some(Event::Disconnect { peer, .. }) => {
                info!("{peer:?} disconnected");
            }
            Some(Event::Receive {
                peer,
                channel_id,
                packet,
            }) => {
                if let Err(err) = host.send(peer, channel_id, packet) {
                    warn!("Failed to echo to {peer:?}: {err}");
                }
            }
            None => {}
        }
    }
}

fn client(server: SocketAddr, count: u32) -> Result<(), Box<dyn std::error::Error>> {
    let socket = UdpIo::bind("0.0.0.0:0")?;
    let mut host = Host::new(socket, HostConfig::default())?;
    host.set_checksum(Some(crc32::checksum_slices));

    let peer = host.connect(server, 1, 0)?;
    let mut sent = 0u32;
    let mut echoed = 0u32;

    loop {
        match host.service(100)? {
            Some(Event::Connect { .. }) => {
                info!("Connected to {server}");
                host.send(peer, 0, Packet::reliable(payload(sent)))?;
                sent += 1;
            }
            Some(Event::Disconnect { .. }) => {
                warn!("Disconnected");
                return Ok(());
            }
            Some(Event::Receive { packet, .. }) => {
                echoed += 1;
                info!(
                    "Echo {echoed}/{count} ({} bytes, rtt ~{}ms)",
                    packet.len(),
                    host.peer(peer).round_trip_time()
                );
                if echoed >= count {
                    host.disconnect(peer, 0);
                } else {
                    host.send(peer, 0, Packet::reliable(payload(sent)))?;
                    sent += 1;
                }
            }
            None => {}
        }
    }
}

fn payload(index: u32) -> Vec<u8> {
    format!("echo-{index}").into_bytes()
}
