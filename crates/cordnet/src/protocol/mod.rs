//! Defines the structure of datagrams on the wire.
//!
//! This module only contains the type definitions themselves, to make it easy
//! to understand the whole protocol at a glance. The actual logic is
//! implemented in different modules.
//!
//! The layout of a single datagram is:
//!
//! ```rust,ignore
//! struct Datagram {
//!     header: DatagramHeader,      // 2 or 4 bytes
//!     checksum: Option<u32>,       // present iff the host has a checksum fn
//!     commands: [(Command, [u8])], // commands with optional inline payloads
//! }
//! ```
//!
//! This is not defined as a struct since commands are processed as they are
//! read:
//!
//! ```rust,ignore
//! fn process_datagram(datagram: &[u8]) {
//!     process_header(&mut datagram);
//!     while !datagram.is_empty() {
//!         process_command(&mut datagram);
//!     }
//! }
//! ```
//!
//! All multi-byte fields are big-endian. Command sizes are fixed per command
//! kind; `SEND_*` commands are followed by their inline payload of
//! `data_length` bytes.

mod wire;

pub use wire::{InvalidCommand, COMMAND_HEADER_LEN};

use crate::seq::Seq;

/// Smallest MTU a peer may negotiate.
pub const MINIMUM_MTU: u32 = 576;
/// Largest MTU a peer may negotiate.
pub const MAXIMUM_MTU: u32 = 4096;
/// Most commands that fit in one datagram.
pub const MAXIMUM_PACKET_COMMANDS: usize = 32;
/// Smallest negotiable reliable window, in bytes.
pub const MINIMUM_WINDOW_SIZE: u32 = 4096;
/// Largest negotiable reliable window, in bytes.
pub const MAXIMUM_WINDOW_SIZE: u32 = 65536;
/// Fewest channels a connection may carry.
pub const MINIMUM_CHANNEL_COUNT: usize = 1;
/// Most channels a connection may carry.
pub const MAXIMUM_CHANNEL_COUNT: usize = 255;
/// Peer ID representing "no peer assigned yet" on the wire.
pub const MAXIMUM_PEER_ID: u16 = 0xFFF;
/// Most fragments one message may split into.
pub const MAXIMUM_FRAGMENT_COUNT: u32 = 1024 * 1024;

/// Number of reliable windows the 16-bit sequence space divides into.
pub const RELIABLE_WINDOWS: u16 = 16;
/// Sequence numbers per reliable window.
pub const RELIABLE_WINDOW_SIZE: u16 = 4096;
/// Windows that must stay free ahead of the current window; commands landing
/// in the guard region are not admitted.
pub const FREE_RELIABLE_WINDOWS: u16 = 8;

/// Number of unsequenced-group windows.
pub const UNSEQUENCED_WINDOWS: u16 = 64;
/// Group numbers per unsequenced window; also the size in bits of the
/// receive-side dedup bitmap.
pub const UNSEQUENCED_WINDOW_SIZE: u16 = 1024;
/// Unsequenced windows that may run ahead of the current group.
pub const FREE_UNSEQUENCED_WINDOWS: u16 = 32;

/// Datagram header flag: the command region is compressed.
pub const HEADER_FLAG_COMPRESSED: u16 = 1 << 14;
/// Datagram header flag: the header carries a 16-bit send timestamp.
pub const HEADER_FLAG_SENT_TIME: u16 = 1 << 15;
/// All datagram header flags.
pub const HEADER_FLAG_MASK: u16 = HEADER_FLAG_COMPRESSED | HEADER_FLAG_SENT_TIME;
/// Bits of the header's first word holding the session ID.
pub const HEADER_SESSION_MASK: u16 = 3 << HEADER_SESSION_SHIFT;
/// Shift of the session ID within the header's first word.
pub const HEADER_SESSION_SHIFT: u16 = 12;

/// Session ID value meaning "not yet assigned".
pub const SESSION_UNASSIGNED: u8 = 0xFF;
/// Channel ID used by peer-global control commands (connect, ping,
/// disconnect, bandwidth, throttle).
pub const CONTROL_CHANNEL_ID: u8 = 0xFF;

bitflags::bitflags! {
    /// Flag bits carried in the high nibble-and-a-half of a command's first
    /// byte (the low 4 bits hold the [`CommandKind`]).
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct CommandFlags: u8 {
        /// The receiver must queue an acknowledgement for this command.
        const ACKNOWLEDGE = 1 << 7;
        /// The command is outside all sequencing.
        const UNSEQUENCED = 1 << 6;
    }
}

/// Low-nibble mask extracting the [`CommandKind`] from a command's first
/// byte.
pub const COMMAND_MASK: u8 = 0x0F;

/// Discriminant of a protocol command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
#[repr(u8)]
pub enum CommandKind {
    /// Acknowledges one reliable command, echoing its send time.
    Acknowledge = 1,
    /// Opens a connection; the only command accepted from an unknown
    /// address.
    Connect = 2,
    /// Accepts a connection, carrying the negotiated parameters.
    VerifyConnect = 3,
    /// Closes a connection.
    Disconnect = 4,
    /// Keep-alive; elicits an acknowledgement for RTT sampling.
    Ping = 5,
    /// One whole reliable message.
    SendReliable = 6,
    /// One whole unreliable-sequenced message.
    SendUnreliable = 7,
    /// One fragment of a reliable message.
    SendFragment = 8,
    /// One whole unsequenced message.
    SendUnsequenced = 9,
    /// Informs the peer of our bandwidth limits.
    BandwidthLimit = 10,
    /// Reconfigures the peer's throttle parameters.
    ThrottleConfigure = 11,
    /// One fragment of an unreliable message.
    SendUnreliableFragment = 12,
}

impl CommandKind {
    /// Parses a kind from the low nibble of a command byte.
    #[must_use]
    pub const fn from_low_bits(value: u8) -> Option<Self> {
        Some(match value & COMMAND_MASK {
            1 => Self::Acknowledge,
            2 => Self::Connect,
            3 => Self::VerifyConnect,
            4 => Self::Disconnect,
            5 => Self::Ping,
            6 => Self::SendReliable,
            7 => Self::SendUnreliable,
            8 => Self::SendFragment,
            9 => Self::SendUnsequenced,
            10 => Self::BandwidthLimit,
            11 => Self::ThrottleConfigure,
            12 => Self::SendUnreliableFragment,
            _ => return None,
        })
    }

    /// Gets the on-wire size of a command of this kind, including the 4-byte
    /// command header but excluding any inline payload.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::Acknowledge | Self::Disconnect => 8,
            Self::Connect => 48,
            Self::VerifyConnect => 44,
            Self::Ping => 4,
            Self::SendReliable => 6,
            Self::SendUnreliable | Self::SendUnsequenced => 8,
            Self::SendFragment | Self::SendUnreliableFragment => 24,
            Self::BandwidthLimit => 12,
            Self::ThrottleConfigure => 16,
        }
    }
}

/// Leading fields of every datagram.
///
/// On the wire this is a `u16` packing the destination peer ID (low 12
/// bits), session ID (2 bits) and flags (2 bits), optionally followed by a
/// `u16` send timestamp when [`HEADER_FLAG_SENT_TIME`] is set. The optional
/// checksum field that follows is written and verified by the host, not
/// here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct DatagramHeader {
    /// Destination peer's ID in the receiving host's table, or
    /// [`MAXIMUM_PEER_ID`] if the sender has no assigned ID yet.
    pub peer_id: u16,
    /// Sender's outgoing session ID.
    pub session_id: u8,
    /// Whether the command region is compressed.
    pub compressed: bool,
    /// Low 16 bits of the sender's service time, present iff any command in
    /// the datagram wants acknowledgement.
    pub sent_time: Option<u16>,
}

/// Fixed-size body of the CONNECT command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct ConnectBody {
    /// Initiator's peer ID in its own table.
    pub outgoing_peer_id: u16,
    /// Initiator's incoming session ID, [`SESSION_UNASSIGNED`] on a fresh
    /// slot.
    pub incoming_session_id: u8,
    /// Initiator's outgoing session ID.
    pub outgoing_session_id: u8,
    /// Initiator's MTU.
    pub mtu: u32,
    /// Initiator's reliable window size in bytes.
    pub window_size: u32,
    /// Channels requested.
    pub channel_count: u32,
    /// Initiator's incoming bandwidth, bytes/s, 0 = unlimited.
    pub incoming_bandwidth: u32,
    /// Initiator's outgoing bandwidth, bytes/s, 0 = unlimited.
    pub outgoing_bandwidth: u32,
    /// Throttle measurement interval, ms.
    pub packet_throttle_interval: u32,
    /// Throttle acceleration.
    pub packet_throttle_acceleration: u32,
    /// Throttle deceleration.
    pub packet_throttle_deceleration: u32,
    /// Random nonce identifying this connection attempt; echoed back in
    /// VERIFY_CONNECT and used as the checksum seed.
    pub connect_id: u32,
    /// User data surfaced in the remote's connect event.
    pub data: u32,
}

/// Fixed-size body of the VERIFY_CONNECT command: [`ConnectBody`] without
/// the trailing user data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct VerifyConnectBody {
    /// Responder's peer ID in its own table.
    pub outgoing_peer_id: u16,
    /// Negotiated session ID for the initiator's incoming direction.
    pub incoming_session_id: u8,
    /// Negotiated session ID for the initiator's outgoing direction.
    pub outgoing_session_id: u8,
    /// Negotiated MTU.
    pub mtu: u32,
    /// Negotiated window size in bytes.
    pub window_size: u32,
    /// Negotiated channel count.
    pub channel_count: u32,
    /// Responder's incoming bandwidth.
    pub incoming_bandwidth: u32,
    /// Responder's outgoing bandwidth.
    pub outgoing_bandwidth: u32,
    /// Echoed throttle interval.
    pub packet_throttle_interval: u32,
    /// Echoed throttle acceleration.
    pub packet_throttle_acceleration: u32,
    /// Echoed throttle deceleration.
    pub packet_throttle_deceleration: u32,
    /// Echoed connect nonce.
    pub connect_id: u32,
}

/// Fixed-size body shared by SEND_FRAGMENT and SEND_UNRELIABLE_FRAGMENT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct FragmentBody {
    /// Sequence number of the fragment group's first command.
    pub start_seq: Seq,
    /// Length of this fragment's inline payload.
    pub data_length: u16,
    /// Total fragments in the group.
    pub fragment_count: u32,
    /// Index of this fragment within the group.
    pub fragment_number: u32,
    /// Reassembled message length.
    pub total_length: u32,
    /// Byte offset of this fragment within the reassembled message.
    pub fragment_offset: u32,
}

/// Kind-specific fields of a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub enum CommandBody {
    /// See [`CommandKind::Acknowledge`].
    Acknowledge {
        /// Sequence number of the reliable command being acknowledged.
        received_reliable_seq: Seq,
        /// The datagram send time echoed back for RTT measurement.
        received_sent_time: u16,
    },
    /// See [`CommandKind::Connect`].
    Connect(ConnectBody),
    /// See [`CommandKind::VerifyConnect`].
    VerifyConnect(VerifyConnectBody),
    /// See [`CommandKind::Disconnect`].
    Disconnect {
        /// User data surfaced in the remote's disconnect event.
        data: u32,
    },
    /// See [`CommandKind::Ping`].
    Ping,
    /// See [`CommandKind::SendReliable`].
    SendReliable {
        /// Inline payload length.
        data_length: u16,
    },
    /// See [`CommandKind::SendUnreliable`].
    SendUnreliable {
        /// Sequence number within the current reliable window.
        unreliable_seq: Seq,
        /// Inline payload length.
        data_length: u16,
    },
    /// See [`CommandKind::SendFragment`].
    SendFragment(FragmentBody),
    /// See [`CommandKind::SendUnsequenced`].
    SendUnsequenced {
        /// Group number for at-most-once delivery.
        unsequenced_group: u16,
        /// Inline payload length.
        data_length: u16,
    },
    /// See [`CommandKind::BandwidthLimit`].
    BandwidthLimit {
        /// Sender's incoming bandwidth, bytes/s.
        incoming_bandwidth: u32,
        /// Sender's outgoing bandwidth, bytes/s.
        outgoing_bandwidth: u32,
    },
    /// See [`CommandKind::ThrottleConfigure`].
    ThrottleConfigure {
        /// Throttle measurement interval, ms.
        packet_throttle_interval: u32,
        /// Throttle acceleration.
        packet_throttle_acceleration: u32,
        /// Throttle deceleration.
        packet_throttle_deceleration: u32,
    },
    /// See [`CommandKind::SendUnreliableFragment`].
    SendUnreliableFragment(FragmentBody),
}

/// One protocol command: the 4-byte command header plus its fixed-size body.
///
/// Inline payloads of `SEND_*` commands follow the command on the wire and
/// are handled by the engine, not by this type's codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    /// Command flags from the first byte's high bits.
    pub flags: CommandFlags,
    /// Channel this command applies to, or [`CONTROL_CHANNEL_ID`].
    pub channel_id: u8,
    /// Reliable sequence number assigned to this command.
    pub reliable_seq: Seq,
    /// Kind-specific fields.
    pub body: CommandBody,
}

impl Command {
    /// Gets this command's kind.
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        match &self.body {
            CommandBody::Acknowledge { .. } => CommandKind::Acknowledge,
            CommandBody::Connect(_) => CommandKind::Connect,
            CommandBody::VerifyConnect(_) => CommandKind::VerifyConnect,
            CommandBody::Disconnect { .. } => CommandKind::Disconnect,
            CommandBody::Ping => CommandKind::Ping,
            CommandBody::SendReliable { .. } => CommandKind::SendReliable,
            CommandBody::SendUnreliable { .. } => CommandKind::SendUnreliable,
            CommandBody::SendFragment(_) => CommandKind::SendFragment,
            CommandBody::SendUnsequenced { .. } => CommandKind::SendUnsequenced,
            CommandBody::BandwidthLimit { .. } => CommandKind::BandwidthLimit,
            CommandBody::ThrottleConfigure { .. } => CommandKind::ThrottleConfigure,
            CommandBody::SendUnreliableFragment(_) => CommandKind::SendUnreliableFragment,
        }
    }

    /// Gets this command's on-wire size, excluding any inline payload.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.kind().size()
    }

    /// Gets whether the receiver must acknowledge this command.
    #[must_use]
    pub const fn wants_ack(&self) -> bool {
        self.flags.contains(CommandFlags::ACKNOWLEDGE)
    }
}
