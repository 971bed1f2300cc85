#![doc = include_str!("../README.md")]

mod channel;

pub mod compress;
pub mod crc32;
pub mod host;
pub mod io;
pub mod loopback;
pub mod packet;
pub mod peer;
pub mod protocol;
pub mod seq;
pub mod time;

pub use {
    compress::{Compressor, RangeCoder},
    host::{Event, Host, HostConfig},
    io::{DatagramIo, UdpIo},
    packet::{Packet, PacketFlags},
    peer::{Peer, PeerId, PeerState},
};
