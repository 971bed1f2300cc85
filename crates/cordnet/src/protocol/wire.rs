//! [`Encode`]/[`Decode`] implementations for the wire types.

use std::convert::Infallible;

use octs::{BufTooShortOr, Decode, Encode, EncodeLen, FixedEncodeLen, Read, Write};
use static_assertions::const_assert_eq;

use crate::seq::Seq;

use super::{
    Command, CommandBody, CommandFlags, CommandKind, ConnectBody, DatagramHeader, FragmentBody,
    VerifyConnectBody, COMMAND_MASK, HEADER_FLAG_MASK, HEADER_FLAG_SENT_TIME,
    HEADER_SESSION_MASK, HEADER_SESSION_SHIFT,
};

/// Size of the command header: command byte, channel ID, reliable sequence
/// number.
pub const COMMAND_HEADER_LEN: usize = 4;

// on-wire command sizes: header + body, checked against the canonical
// table in `CommandKind::size`
const_assert_eq!(COMMAND_HEADER_LEN + 4, CommandKind::Acknowledge.size());
const_assert_eq!(COMMAND_HEADER_LEN + ConnectBody::ENCODE_LEN, CommandKind::Connect.size());
const_assert_eq!(
    COMMAND_HEADER_LEN + VerifyConnectBody::ENCODE_LEN,
    CommandKind::VerifyConnect.size()
);
const_assert_eq!(COMMAND_HEADER_LEN + 4, CommandKind::Disconnect.size());
const_assert_eq!(COMMAND_HEADER_LEN, CommandKind::Ping.size());
const_assert_eq!(COMMAND_HEADER_LEN + 2, CommandKind::SendReliable.size());
const_assert_eq!(COMMAND_HEADER_LEN + 4, CommandKind::SendUnreliable.size());
const_assert_eq!(COMMAND_HEADER_LEN + FragmentBody::ENCODE_LEN, CommandKind::SendFragment.size());
const_assert_eq!(COMMAND_HEADER_LEN + 4, CommandKind::SendUnsequenced.size());
const_assert_eq!(COMMAND_HEADER_LEN + 8, CommandKind::BandwidthLimit.size());
const_assert_eq!(COMMAND_HEADER_LEN + 12, CommandKind::ThrottleConfigure.size());
const_assert_eq!(
    COMMAND_HEADER_LEN + FragmentBody::ENCODE_LEN,
    CommandKind::SendUnreliableFragment.size()
);

/// Read a command byte whose low nibble is not a valid [`CommandKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid command")]
pub struct InvalidCommand;

impl octs::BufError for InvalidCommand {}

impl DatagramHeader {
    /// Gets this header's encoded size: 2 bytes, plus 2 for the send
    /// timestamp when present.
    #[must_use]
    pub const fn encode_len(&self) -> usize {
        if self.sent_time.is_some() {
            4
        } else {
            2
        }
    }
}

impl Encode for DatagramHeader {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        let mut word = self.peer_id;
        word |= (u16::from(self.session_id) << HEADER_SESSION_SHIFT) & HEADER_SESSION_MASK;
        if self.compressed {
            word |= super::HEADER_FLAG_COMPRESSED;
        }
        if self.sent_time.is_some() {
            word |= HEADER_FLAG_SENT_TIME;
        }
        dst.write(&word)?;
        if let Some(sent_time) = self.sent_time {
            dst.write(&sent_time)?;
        }
        Ok(())
    }
}

impl Decode for DatagramHeader {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let word = src.read::<u16>()?;
        let flags = word & HEADER_FLAG_MASK;
        let session_id = ((word & HEADER_SESSION_MASK) >> HEADER_SESSION_SHIFT) as u8;
        let peer_id = word & !(HEADER_FLAG_MASK | HEADER_SESSION_MASK);
        let sent_time = if flags & HEADER_FLAG_SENT_TIME != 0 {
            Some(src.read::<u16>()?)
        } else {
            None
        };
        Ok(Self {
            peer_id,
            session_id,
            compressed: flags & super::HEADER_FLAG_COMPRESSED != 0,
            sent_time,
        })
    }
}

impl FixedEncodeLen for ConnectBody {
    const ENCODE_LEN: usize =
        u16::ENCODE_LEN + 2 * u8::ENCODE_LEN + 10 * u32::ENCODE_LEN;
}

impl Encode for ConnectBody {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.outgoing_peer_id)?;
        dst.write(&self.incoming_session_id)?;
        dst.write(&self.outgoing_session_id)?;
        dst.write(&self.mtu)?;
        dst.write(&self.window_size)?;
        dst.write(&self.channel_count)?;
        dst.write(&self.incoming_bandwidth)?;
        dst.write(&self.outgoing_bandwidth)?;
        dst.write(&self.packet_throttle_interval)?;
        dst.write(&self.packet_throttle_acceleration)?;
        dst.write(&self.packet_throttle_deceleration)?;
        dst.write(&self.connect_id)?;
        dst.write(&self.data)?;
        Ok(())
    }
}

impl Decode for ConnectBody {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            outgoing_peer_id: src.read()?,
            incoming_session_id: src.read()?,
            outgoing_session_id: src.read()?,
            mtu: src.read()?,
            window_size: src.read()?,
            channel_count: src.read()?,
            incoming_bandwidth: src.read()?,
            outgoing_bandwidth: src.read()?,
            packet_throttle_interval: src.read()?,
            packet_throttle_acceleration: src.read()?,
            packet_throttle_deceleration: src.read()?,
            connect_id: src.read()?,
            data: src.read()?,
        })
    }
}

impl FixedEncodeLen for VerifyConnectBody {
    const ENCODE_LEN: usize = ConnectBody::ENCODE_LEN - u32::ENCODE_LEN;
}

impl Encode for VerifyConnectBody {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.outgoing_peer_id)?;
        dst.write(&self.incoming_session_id)?;
        dst.write(&self.outgoing_session_id)?;
        dst.write(&self.mtu)?;
        dst.write(&self.window_size)?;
        dst.write(&self.channel_count)?;
        dst.write(&self.incoming_bandwidth)?;
        dst.write(&self.outgoing_bandwidth)?;
        dst.write(&self.packet_throttle_interval)?;
        dst.write(&self.packet_throttle_acceleration)?;
        dst.write(&self.packet_throttle_deceleration)?;
        dst.write(&self.connect_id)?;
        Ok(())
    }
}

impl Decode for VerifyConnectBody {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            outgoing_peer_id: src.read()?,
            incoming_session_id: src.read()?,
            outgoing_session_id: src.read()?,
            mtu: src.read()?,
            window_size: src.read()?,
            channel_count: src.read()?,
            incoming_bandwidth: src.read()?,
            outgoing_bandwidth: src.read()?,
            packet_throttle_interval: src.read()?,
            packet_throttle_acceleration: src.read()?,
            packet_throttle_deceleration: src.read()?,
            connect_id: src.read()?,
        })
    }
}

impl FixedEncodeLen for FragmentBody {
    const ENCODE_LEN: usize = 2 * u16::ENCODE_LEN + 4 * u32::ENCODE_LEN;
}

impl Encode for FragmentBody {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.start_seq)?;
        dst.write(&self.data_length)?;
        dst.write(&self.fragment_count)?;
        dst.write(&self.fragment_number)?;
        dst.write(&self.total_length)?;
        dst.write(&self.fragment_offset)?;
        Ok(())
    }
}

impl Decode for FragmentBody {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            start_seq: src.read()?,
            data_length: src.read()?,
            fragment_count: src.read()?,
            fragment_number: src.read()?,
            total_length: src.read()?,
            fragment_offset: src.read()?,
        })
    }
}

impl EncodeLen for Command {
    fn encode_len(&self) -> usize {
        self.size()
    }
}

impl Encode for Command {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&(self.kind() as u8 | self.flags.bits()))?;
        dst.write(&self.channel_id)?;
        dst.write(&self.reliable_seq)?;
        match &self.body {
            CommandBody::Acknowledge {
                received_reliable_seq,
                received_sent_time,
            } => {
                dst.write(received_reliable_seq)?;
                dst.write(received_sent_time)?;
            }
            CommandBody::Connect(body) => dst.write(body)?,
            CommandBody::VerifyConnect(body) => dst.write(body)?,
            CommandBody::Disconnect { data } => dst.write(data)?,
            CommandBody::Ping => {}
            CommandBody::SendReliable { data_length } => dst.write(data_length)?,
            CommandBody::SendUnreliable {
                unreliable_seq,
                data_length,
            } => {
                dst.write(unreliable_seq)?;
                dst.write(data_length)?;
            }
            CommandBody::SendFragment(body) | CommandBody::SendUnreliableFragment(body) => {
                dst.write(body)?;
            }
            CommandBody::SendUnsequenced {
                unsequenced_group,
                data_length,
            } => {
                dst.write(unsequenced_group)?;
                dst.write(data_length)?;
            }
            CommandBody::BandwidthLimit {
                incoming_bandwidth,
                outgoing_bandwidth,
            } => {
                dst.write(incoming_bandwidth)?;
                dst.write(outgoing_bandwidth)?;
            }
            CommandBody::ThrottleConfigure {
                packet_throttle_interval,
                packet_throttle_acceleration,
                packet_throttle_deceleration,
            } => {
                dst.write(packet_throttle_interval)?;
                dst.write(packet_throttle_acceleration)?;
                dst.write(packet_throttle_deceleration)?;
            }
        }
        Ok(())
    }
}

impl Decode for Command {
    type Error = InvalidCommand;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let command_byte = src.read::<u8>()?;
        let kind = CommandKind::from_low_bits(command_byte & COMMAND_MASK)
            .ok_or(InvalidCommand)?;
        let flags = CommandFlags::from_bits_truncate(command_byte);
        let channel_id = src.read::<u8>()?;
        let reliable_seq = src.read::<Seq>()?;
        let body = match kind {
            CommandKind::Acknowledge => CommandBody::Acknowledge {
                received_reliable_seq: src.read()?,
                received_sent_time: src.read()?,
            },
            CommandKind::Connect => CommandBody::Connect(src.read()?),
            CommandKind::VerifyConnect => CommandBody::VerifyConnect(src.read()?),
            CommandKind::Disconnect => CommandBody::Disconnect { data: src.read()? },
            CommandKind::Ping => CommandBody::Ping,
            CommandKind::SendReliable => CommandBody::SendReliable {
                data_length: src.read()?,
            },
            CommandKind::SendUnreliable => CommandBody::SendUnreliable {
                unreliable_seq: src.read()?,
                data_length: src.read()?,
            },
            CommandKind::SendFragment => CommandBody::SendFragment(src.read()?),
            CommandKind::SendUnsequenced => CommandBody::SendUnsequenced {
                unsequenced_group: src.read()?,
                data_length: src.read()?,
            },
            CommandKind::BandwidthLimit => CommandBody::BandwidthLimit {
                incoming_bandwidth: src.read()?,
                outgoing_bandwidth: src.read()?,
            },
            CommandKind::ThrottleConfigure => CommandBody::ThrottleConfigure {
                packet_throttle_interval: src.read()?,
                packet_throttle_acceleration: src.read()?,
                packet_throttle_deceleration: src.read()?,
            },
            CommandKind::SendUnreliableFragment => {
                CommandBody::SendUnreliableFragment(src.read()?)
            }
        };
        Ok(Self {
            flags,
            channel_id,
            reliable_seq,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    fn round_trip(command: &Command) {
        let mut buf = BytesMut::new();
        buf.write(command).unwrap();
        assert_eq!(command.size(), buf.len(), "{:?}", command.kind());
        assert_eq!(*command, buf.freeze().read::<Command>().unwrap());
    }

    #[test]
    fn encode_decode_all_kinds() {
        let connect = ConnectBody {
            outgoing_peer_id: 7,
            incoming_session_id: 0xFF,
            outgoing_session_id: 0xFF,
            mtu: 1400,
            window_size: 32 * 1024,
            channel_count: 4,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            packet_throttle_interval: 5000,
            packet_throttle_acceleration: 2,
            packet_throttle_deceleration: 2,
            connect_id: 0xDEAD_BEEF,
            data: 42,
        };
        let fragment = FragmentBody {
            start_seq: Seq(9),
            data_length: 1000,
            fragment_count: 12,
            fragment_number: 3,
            total_length: 12_000,
            fragment_offset: 3000,
        };

        let bodies = [
            CommandBody::Acknowledge {
                received_reliable_seq: Seq(55),
                received_sent_time: 1234,
            },
            CommandBody::Connect(connect),
            CommandBody::VerifyConnect(VerifyConnectBody {
                outgoing_peer_id: 3,
                incoming_session_id: 1,
                outgoing_session_id: 2,
                mtu: 1400,
                window_size: 65536,
                channel_count: 4,
                incoming_bandwidth: 0,
                outgoing_bandwidth: 0,
                packet_throttle_interval: 5000,
                packet_throttle_acceleration: 2,
                packet_throttle_deceleration: 2,
                connect_id: 0xDEAD_BEEF,
            }),
            CommandBody::Disconnect { data: 99 },
            CommandBody::Ping,
            CommandBody::SendReliable { data_length: 512 },
            CommandBody::SendUnreliable {
                unreliable_seq: Seq(8),
                data_length: 256,
            },
            CommandBody::SendFragment(fragment),
            CommandBody::SendUnsequenced {
                unsequenced_group: 17,
                data_length: 64,
            },
            CommandBody::BandwidthLimit {
                incoming_bandwidth: 64_000,
                outgoing_bandwidth: 32_000,
            },
            CommandBody::ThrottleConfigure {
                packet_throttle_interval: 5000,
                packet_throttle_acceleration: 2,
                packet_throttle_deceleration: 2,
            },
            CommandBody::SendUnreliableFragment(fragment),
        ];

        for body in bodies {
            round_trip(&Command {
                flags: CommandFlags::ACKNOWLEDGE,
                channel_id: 2,
                reliable_seq: Seq(100),
                body,
            });
        }
    }

    #[test]
    fn flags_round_trip_through_command_byte() {
        let command = Command {
            flags: CommandFlags::UNSEQUENCED,
            channel_id: 0xFF,
            reliable_seq: Seq(0),
            body: CommandBody::SendUnsequenced {
                unsequenced_group: 1,
                data_length: 0,
            },
        };
        let mut buf = BytesMut::new();
        buf.write(&command).unwrap();
        let mut bytes = buf.freeze();
        assert_eq!(0x40 | 9, bytes[0]);
        assert_eq!(command, bytes.read::<Command>().unwrap());
    }

    #[test]
    fn invalid_command_byte_rejected() {
        let mut buf = BytesMut::new();
        buf.write(&0x8Fu8).unwrap(); // kind 15 does not exist
        buf.write(&0u8).unwrap();
        buf.write(&0u16).unwrap();
        assert!(buf.freeze().read::<Command>().is_err());
    }

    #[test]
    fn header_with_and_without_sent_time() {
        for header in [
            DatagramHeader {
                peer_id: 0x123,
                session_id: 2,
                compressed: false,
                sent_time: Some(0xABCD),
            },
            DatagramHeader {
                peer_id: crate::protocol::MAXIMUM_PEER_ID,
                session_id: 0,
                compressed: true,
                sent_time: None,
            },
        ] {
            let mut buf = BytesMut::new();
            buf.write(&header).unwrap();
            assert_eq!(header.encode_len(), buf.len());
            assert_eq!(header, buf.freeze().read::<DatagramHeader>().unwrap());
        }
    }
}
