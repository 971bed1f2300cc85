//! Send-side queueing: sequence number assignment, fragmentation, and
//! removal of commands that have been acknowledged or abandoned.

use bytes::Bytes;

use crate::{
    packet::{Packet, PacketFlags},
    protocol::{
        Command, CommandBody, CommandFlags, CommandKind, FragmentBody, CONTROL_CHANNEL_ID,
        MAXIMUM_FRAGMENT_COUNT,
    },
    seq::Seq,
    time::Timestamp,
};

use super::{OutgoingCommand, Peer, PeerState};

/// Error when queueing a packet for sending with
/// [`Host::send`](crate::host::Host::send).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The peer is not in a state that accepts outgoing packets.
    #[error("peer not connected")]
    NotConnected,
    /// The channel ID is outside the negotiated channel count.
    #[error("invalid channel {0}")]
    InvalidChannel(u8),
    /// The payload exceeds the host's maximum packet size.
    #[error("packet too large ({0} bytes)")]
    PacketTooLarge(usize),
    /// The payload would split into more than [`MAXIMUM_FRAGMENT_COUNT`]
    /// fragments.
    #[error("too many fragments")]
    TooManyFragments,
}

impl Peer {
    /// Assigns sequence numbers to a freshly queued command and places it on
    /// the appropriate outgoing queue.
    pub(crate) fn setup_outgoing_command(&mut self, mut outgoing: OutgoingCommand) {
        self.outgoing_data_total +=
            outgoing.command.size() as u32 + u32::from(outgoing.fragment_length);

        if outgoing.command.channel_id == CONTROL_CHANNEL_ID {
            outgoing.reliable_seq = self.outgoing_reliable_seq.inc_get();
            outgoing.unreliable_seq = Seq(0);
        } else {
            let channel = &mut self.channels[usize::from(outgoing.command.channel_id)];
            if outgoing.command.flags.contains(CommandFlags::ACKNOWLEDGE) {
                outgoing.reliable_seq = channel.outgoing_reliable_seq.inc_get();
                channel.outgoing_unreliable_seq = Seq(0);
                outgoing.unreliable_seq = Seq(0);
            } else if outgoing.command.flags.contains(CommandFlags::UNSEQUENCED) {
                self.outgoing_unsequenced_group = self.outgoing_unsequenced_group.wrapping_add(1);
                outgoing.reliable_seq = Seq(0);
                outgoing.unreliable_seq = Seq(0);
            } else {
                if outgoing.fragment_offset == 0 {
                    let _ = channel.outgoing_unreliable_seq.inc_get();
                }
                outgoing.reliable_seq = channel.outgoing_reliable_seq;
                outgoing.unreliable_seq = channel.outgoing_unreliable_seq;
            }
        }

        outgoing.send_attempts = 0;
        outgoing.sent_time = Timestamp(0);
        outgoing.rto = 0;
        outgoing.rto_limit = 0;
        outgoing.command.reliable_seq = outgoing.reliable_seq;

        match &mut outgoing.command.body {
            CommandBody::SendUnreliable { unreliable_seq, .. } => {
                *unreliable_seq = outgoing.unreliable_seq;
            }
            CommandBody::SendUnsequenced {
                unsequenced_group, ..
            } => {
                *unsequenced_group = self.outgoing_unsequenced_group;
            }
            _ => {}
        }

        if outgoing.command.flags.contains(CommandFlags::ACKNOWLEDGE) {
            self.outgoing_reliable.push_back(outgoing);
        } else {
            self.outgoing_unreliable.push_back(outgoing);
        }
    }

    /// Queues a control or data command for sending, with an optional
    /// payload slice.
    pub(crate) fn queue_outgoing_command(
        &mut self,
        command: Command,
        payload: Option<Bytes>,
        fragment_offset: u32,
        fragment_length: u16,
    ) {
        self.setup_outgoing_command(OutgoingCommand {
            command,
            payload,
            fragment_offset,
            fragment_length,
            reliable_seq: Seq(0),
            unreliable_seq: Seq(0),
            sent_time: Timestamp(0),
            send_attempts: 0,
            rto: 0,
            rto_limit: 0,
        });
    }

    /// Queues a keep-alive ping, which doubles as an RTT probe.
    pub(crate) fn queue_ping(&mut self) {
        if self.state != PeerState::Connected {
            return;
        }
        self.queue_outgoing_command(
            Command {
                flags: CommandFlags::ACKNOWLEDGE,
                channel_id: CONTROL_CHANNEL_ID,
                reliable_seq: Seq(0),
                body: CommandBody::Ping,
            },
            None,
            0,
            0,
        );
    }

    /// Queues `packet` for delivery on `channel_id`, splitting it into
    /// fragments if it exceeds the single-command payload budget.
    pub(crate) fn enqueue_packet(
        &mut self,
        channel_id: u8,
        packet: Packet,
        checksum_enabled: bool,
        maximum_packet_size: usize,
    ) -> Result<(), SendError> {
        if self.state != PeerState::Connected {
            return Err(SendError::NotConnected);
        }
        if usize::from(channel_id) >= self.channels.len() {
            return Err(SendError::InvalidChannel(channel_id));
        }
        if packet.len() > maximum_packet_size {
            return Err(SendError::PacketTooLarge(packet.len()));
        }

        // headroom: datagram header + fragment command, and the checksum
        // field when enabled
        let mut fragment_length = self.mtu as usize - 4 - CommandKind::SendFragment.size();
        if checksum_enabled {
            fragment_length -= 4;
        }

        if packet.len() > fragment_length {
            return self.enqueue_fragments(channel_id, packet, fragment_length);
        }

        let data_length = packet.len() as u16;
        let channel = &self.channels[usize::from(channel_id)];
        let body = if packet.flags & (PacketFlags::RELIABLE | PacketFlags::UNSEQUENCED)
            == PacketFlags::UNSEQUENCED
        {
            CommandBody::SendUnsequenced {
                unsequenced_group: 0,
                data_length,
            }
        } else if packet.flags.contains(PacketFlags::RELIABLE)
            || channel.outgoing_unreliable_seq.0 >= 0xFFFF
        {
            CommandBody::SendReliable { data_length }
        } else {
            CommandBody::SendUnreliable {
                unreliable_seq: Seq(0),
                data_length,
            }
        };
        let flags = match body {
            CommandBody::SendUnsequenced { .. } => CommandFlags::UNSEQUENCED,
            CommandBody::SendReliable { .. } => CommandFlags::ACKNOWLEDGE,
            _ => CommandFlags::empty(),
        };

        let length = packet.len() as u16;
        self.queue_outgoing_command(
            Command {
                flags,
                channel_id,
                reliable_seq: Seq(0),
                body,
            },
            Some(packet.data),
            0,
            length,
        );
        Ok(())
    }

    fn enqueue_fragments(
        &mut self,
        channel_id: u8,
        packet: Packet,
        fragment_length: usize,
    ) -> Result<(), SendError> {
        let total_length = packet.len();
        let fragment_count = (total_length + fragment_length - 1) / fragment_length;
        if fragment_count as u32 > MAXIMUM_FRAGMENT_COUNT {
            return Err(SendError::TooManyFragments);
        }

        let channel = &self.channels[usize::from(channel_id)];
        let (flags, start_seq, unreliable) = if packet.flags
            & (PacketFlags::RELIABLE | PacketFlags::UNRELIABLE_FRAGMENT)
            == PacketFlags::UNRELIABLE_FRAGMENT
            && channel.outgoing_unreliable_seq.0 < 0xFFFF
        {
            (
                CommandFlags::empty(),
                Seq(channel.outgoing_unreliable_seq.0.wrapping_add(1)),
                true,
            )
        } else {
            (
                CommandFlags::ACKNOWLEDGE,
                Seq(channel.outgoing_reliable_seq.0.wrapping_add(1)),
                false,
            )
        };

        let mut fragment_offset = 0usize;
        let mut fragment_number = 0u32;
        while fragment_offset < total_length {
            let length = fragment_length.min(total_length - fragment_offset);
            let body = FragmentBody {
                start_seq,
                data_length: length as u16,
                fragment_count: fragment_count as u32,
                fragment_number,
                total_length: total_length as u32,
                fragment_offset: fragment_offset as u32,
            };
            let command = Command {
                flags,
                channel_id,
                reliable_seq: Seq(0),
                body: if unreliable {
                    CommandBody::SendUnreliableFragment(body)
                } else {
                    CommandBody::SendFragment(body)
                },
            };
            // fragments share the packet's allocation
            let payload = packet.data.slice(fragment_offset..fragment_offset + length);
            self.queue_outgoing_command(command, Some(payload), fragment_offset as u32, length as u16);

            fragment_number += 1;
            fragment_offset += length;
        }

        Ok(())
    }

    /// Removes the sent (or resend-queued) reliable command matching an
    /// acknowledgement, releasing its reliable window slot and returning its
    /// kind.
    pub(crate) fn remove_sent_reliable_command(
        &mut self,
        reliable_seq: Seq,
        channel_id: u8,
    ) -> Option<CommandKind> {
        let mut was_sent = true;
        let mut found = self.sent_reliable.iter().position(|command| {
            command.reliable_seq == reliable_seq && command.command.channel_id == channel_id
        });

        if found.is_none() {
            // the command may have been respliced for resend by the timeout
            // pass; never-sent commands end the search
            for (index, command) in self.outgoing_reliable.iter().enumerate() {
                if command.send_attempts < 1 {
                    return None;
                }
                if command.reliable_seq == reliable_seq
                    && command.command.channel_id == channel_id
                {
                    found = Some(index);
                    break;
                }
            }
            found?;
            was_sent = false;
        }

        let index = found?;
        let outgoing = if was_sent {
            self.sent_reliable.remove(index)
        } else {
            self.outgoing_reliable.remove(index)
        }?;

        if let Some(channel) = self.channels.get_mut(usize::from(channel_id)) {
            channel.release_window(reliable_seq);
        }

        let kind = outgoing.command.kind();
        if outgoing.payload.is_some() && was_sent {
            self.reliable_data_in_transit = self
                .reliable_data_in_transit
                .saturating_sub(u32::from(outgoing.fragment_length));
        }

        if let Some(front) = self.sent_reliable.front() {
            self.next_timeout = front.sent_time.plus(front.rto);
        }

        Some(kind)
    }

    /// Drops every entry of the sent-unreliable queue, marking packets that
    /// made it onto the wire as sent.
    pub(crate) fn remove_sent_unreliable_commands(&mut self) {
        self.sent_unreliable.clear();
    }
}

#[cfg(test)]
mod tests {
    use crate::{channel::Channel, peer::PeerId};

    use super::*;

    fn connected_peer() -> Peer {
        let mut peer = Peer::new(PeerId(0), 1400);
        peer.state = PeerState::Connected;
        peer.channels = vec![Channel::new()];
        peer
    }

    #[test]
    fn single_command_when_payload_fits() {
        let mut peer = connected_peer();
        // exactly the per-command budget: mtu - header - fragment command
        let fits = 1400 - 4 - 24;
        peer.enqueue_packet(0, Packet::reliable(vec![7u8; fits]), false, 32 << 20)
            .unwrap();
        assert_eq!(1, peer.outgoing_reliable.len());
        let command = &peer.outgoing_reliable[0];
        assert_eq!(CommandKind::SendReliable, command.command.kind());
        assert_eq!(Seq(1), command.reliable_seq);
    }

    #[test]
    fn one_byte_over_budget_makes_two_fragments() {
        let mut peer = connected_peer();
        let fits = 1400 - 4 - 24;
        peer.enqueue_packet(0, Packet::reliable(vec![7u8; fits + 1]), false, 32 << 20)
            .unwrap();
        assert_eq!(2, peer.outgoing_reliable.len());
        for (i, command) in peer.outgoing_reliable.iter().enumerate() {
            let CommandBody::SendFragment(body) = command.command.body else {
                panic!("expected fragment");
            };
            assert_eq!(Seq(1), body.start_seq);
            assert_eq!(i as u32, body.fragment_number);
            assert_eq!(2, body.fragment_count);
            assert_eq!((fits + 1) as u32, body.total_length);
        }
        // each fragment consumes its own reliable sequence number, starting
        // at the group's start_seq
        assert_eq!(Seq(1), peer.outgoing_reliable[0].reliable_seq);
        assert_eq!(Seq(2), peer.outgoing_reliable[1].reliable_seq);
    }

    #[test]
    fn fragment_payloads_share_the_allocation() {
        let mut peer = connected_peer();
        let data = Bytes::from(vec![9u8; 5000]);
        let data_ptr = data.as_ptr();
        peer.enqueue_packet(0, Packet::reliable(data), false, 32 << 20)
            .unwrap();
        let first = peer.outgoing_reliable[0].payload.as_ref().unwrap();
        assert_eq!(data_ptr, first.as_ptr());
    }

    #[test]
    fn oversized_packet_rejected_before_queueing() {
        let mut peer = connected_peer();
        let result = peer.enqueue_packet(0, Packet::reliable(vec![0u8; 100]), false, 50);
        assert_eq!(Err(SendError::PacketTooLarge(100)), result);
        assert!(peer.outgoing_reliable.is_empty());
    }

    #[test]
    fn too_many_fragments_rejected() {
        let mut peer = connected_peer();
        // with a 1-byte fragment budget, one byte over the fragment-count
        // ceiling must be refused before anything is queued
        let result = peer.enqueue_fragments(
            0,
            Packet::reliable(vec![0u8; MAXIMUM_FRAGMENT_COUNT as usize + 1]),
            1,
        );
        assert_eq!(Err(SendError::TooManyFragments), result);
        assert!(peer.outgoing_reliable.is_empty());
        assert!(peer.outgoing_unreliable.is_empty());
    }

    #[test]
    fn unsequenced_assigns_group() {
        let mut peer = connected_peer();
        peer.enqueue_packet(0, Packet::unsequenced(&b"hi"[..]), false, 32 << 20)
            .unwrap();
        peer.enqueue_packet(0, Packet::unsequenced(&b"ho"[..]), false, 32 << 20)
            .unwrap();
        let groups = peer
            .outgoing_unreliable
            .iter()
            .map(|command| match command.command.body {
                CommandBody::SendUnsequenced {
                    unsequenced_group, ..
                } => unsequenced_group,
                _ => panic!("expected unsequenced"),
            })
            .collect::<Vec<_>>();
        assert_eq!(vec![1, 2], groups);
    }

    #[test]
    fn unreliable_sequence_advances_per_packet() {
        let mut peer = connected_peer();
        peer.enqueue_packet(0, Packet::unreliable(&b"a"[..]), false, 32 << 20)
            .unwrap();
        peer.enqueue_packet(0, Packet::unreliable(&b"b"[..]), false, 32 << 20)
            .unwrap();
        let seqs = peer
            .outgoing_unreliable
            .iter()
            .map(|command| command.unreliable_seq.0)
            .collect::<Vec<_>>();
        assert_eq!(vec![1, 2], seqs);
        // unreliable commands ride the current reliable sequence number
        assert!(peer
            .outgoing_unreliable
            .iter()
            .all(|command| command.reliable_seq == Seq(0)));
    }

    #[test]
    fn ack_removes_sent_reliable_and_releases_window() {
        let mut peer = connected_peer();
        peer.enqueue_packet(0, Packet::reliable(&b"x"[..]), false, 32 << 20)
            .unwrap();
        let mut command = peer.outgoing_reliable.pop_front().unwrap();
        command.send_attempts = 1;
        peer.channels[0].mark_window_used(command.reliable_seq);
        peer.reliable_data_in_transit += u32::from(command.fragment_length);
        peer.sent_reliable.push_back(command);

        let kind = peer.remove_sent_reliable_command(Seq(1), 0);
        assert_eq!(Some(CommandKind::SendReliable), kind);
        assert_eq!(0, peer.reliable_data_in_transit);
        assert_eq!(0, peer.channels[0].used_reliable_windows);
        assert!(peer.sent_reliable.is_empty());

        // unknown acks find nothing
        assert_eq!(None, peer.remove_sent_reliable_command(Seq(9), 0));
    }
}
