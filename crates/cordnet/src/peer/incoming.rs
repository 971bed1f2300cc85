//! Receive-side queueing: acknowledgements, incoming-command insertion, and
//! dispatch of deliverable commands.

use std::collections::VecDeque;

use bitvec::{bitvec, order::Lsb0};
use bytes::{Bytes, BytesMut};

use crate::{
    channel::{IncomingCommand, IncomingPayload},
    packet::{Packet, PacketFlags},
    protocol::{Command, CommandBody, CommandKind, MAXIMUM_FRAGMENT_COUNT},
    seq::Seq,
};

use super::{Acknowledgement, Peer, PeerId, PeerState};

/// Payload handed to [`Peer::queue_incoming_command`].
pub(crate) enum IncomingData {
    /// The whole message, as sliced out of the received datagram.
    Whole(Bytes),
    /// No payload yet: allocate a zero-filled reassembly buffer of this many
    /// bytes.
    Blank(usize),
}

/// Result of [`Peer::queue_incoming_command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnqueueOutcome {
    /// The command was inserted into a channel queue.
    Queued,
    /// The command is stale or duplicated; drop it silently.
    Discarded,
    /// Resource exhaustion; the caller treats the whole datagram as
    /// malformed.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Keep,
    Dispatch,
    Destroy,
}

impl Peer {
    /// Puts this peer on the host dispatch queue, once.
    pub(crate) fn flag_dispatch(&mut self, dispatch_queue: &mut VecDeque<PeerId>) {
        if !self.needs_dispatch {
            dispatch_queue.push_back(self.incoming_peer_id);
            self.needs_dispatch = true;
        }
    }

    /// Queues an acknowledgement for `command`, echoing the sender's
    /// timestamp.
    ///
    /// Commands whose sequence number lies in the guard windows get no
    /// acknowledgement: the sender could not tell it apart from an ack for a
    /// sequence number one full cycle earlier.
    pub(crate) fn queue_acknowledgement(&mut self, command: &Command, sent_time: u16) {
        if let Some(channel) = self.channels.get(usize::from(command.channel_id)) {
            if channel.in_ack_guard(command.reliable_seq) {
                return;
            }
        }

        self.outgoing_data_total += CommandKind::Acknowledge.size() as u32;
        self.acknowledgements.push_back(Acknowledgement {
            kind: command.kind(),
            channel_id: command.channel_id,
            reliable_seq: command.reliable_seq,
            sent_time,
        });
    }

    /// Inserts a received `SEND_*` command into its channel queue, keeping
    /// the queue sorted by sequence number relative to the channel's
    /// delivery cursor, then dispatches whatever became deliverable.
    pub(crate) fn queue_incoming_command(
        &mut self,
        dispatch_queue: &mut VecDeque<PeerId>,
        maximum_waiting_data: usize,
        command: &Command,
        data: IncomingData,
        packet_flags: PacketFlags,
        fragment_count: u32,
    ) -> EnqueueOutcome {
        let kind = command.kind();
        let channel_index = usize::from(command.channel_id);
        let reliable_seq = command.reliable_seq;

        // a discarded fragment would leave its group permanently incomplete
        let discarded = if fragment_count > 0 {
            EnqueueOutcome::Error
        } else {
            EnqueueOutcome::Discarded
        };

        if self.state == PeerState::DisconnectLater {
            return discarded;
        }

        if kind != CommandKind::SendUnsequenced
            && !self.channels[channel_index].accepts_reliable(reliable_seq)
        {
            return discarded;
        }

        let mut unreliable_seq = Seq(0);
        enum Insert {
            Reliable(usize),
            Unreliable(usize),
        }

        let insert = match kind {
            CommandKind::SendFragment | CommandKind::SendReliable => {
                let channel = &self.channels[channel_index];
                if reliable_seq.0 == channel.incoming_reliable_seq.0 {
                    return discarded;
                }

                let queue = &channel.incoming_reliable;
                let mut position = 0;
                for i in (0..queue.len()).rev() {
                    let queued = &queue[i];
                    // unwrap relative to the delivery cursor before
                    // comparing raw sequence values
                    if reliable_seq.0 >= channel.incoming_reliable_seq.0 {
                        if queued.reliable_seq.0 < channel.incoming_reliable_seq.0 {
                            continue;
                        }
                    } else if queued.reliable_seq.0 >= channel.incoming_reliable_seq.0 {
                        position = i + 1;
                        break;
                    }

                    if queued.reliable_seq.0 <= reliable_seq.0 {
                        if queued.reliable_seq.0 < reliable_seq.0 {
                            position = i + 1;
                            break;
                        }
                        return discarded;
                    }
                }
                Insert::Reliable(position)
            }

            CommandKind::SendUnreliable | CommandKind::SendUnreliableFragment => {
                unreliable_seq = match &command.body {
                    CommandBody::SendUnreliable { unreliable_seq, .. } => *unreliable_seq,
                    CommandBody::SendUnreliableFragment(body) => body.start_seq,
                    _ => unreachable!("kind/body mismatch"),
                };

                let channel = &self.channels[channel_index];
                if reliable_seq.0 == channel.incoming_reliable_seq.0
                    && unreliable_seq.0 <= channel.incoming_unreliable_seq.0
                {
                    return discarded;
                }

                let queue = &channel.incoming_unreliable;
                let mut position = 0;
                let mut duplicate = false;
                for i in (0..queue.len()).rev() {
                    let queued = &queue[i];
                    if reliable_seq.0 >= channel.incoming_reliable_seq.0 {
                        if queued.reliable_seq.0 < channel.incoming_reliable_seq.0 {
                            continue;
                        }
                    } else if queued.reliable_seq.0 >= channel.incoming_reliable_seq.0 {
                        position = i + 1;
                        break;
                    }

                    if queued.reliable_seq.0 < reliable_seq.0 {
                        position = i + 1;
                        break;
                    }
                    if queued.reliable_seq.0 > reliable_seq.0 {
                        continue;
                    }

                    if queued.unreliable_seq.0 <= unreliable_seq.0 {
                        if queued.unreliable_seq.0 < unreliable_seq.0 {
                            position = i + 1;
                            break;
                        }
                        duplicate = true;
                        break;
                    }
                }
                if duplicate {
                    return discarded;
                }
                Insert::Unreliable(position)
            }

            CommandKind::SendUnsequenced => Insert::Unreliable(0),

            _ => return discarded,
        };

        if self.total_waiting_data >= maximum_waiting_data {
            return EnqueueOutcome::Error;
        }

        let payload = match data {
            IncomingData::Whole(bytes) => IncomingPayload::Ready(Packet::new(bytes, packet_flags)),
            IncomingData::Blank(total_length) => IncomingPayload::Assembling {
                data: BytesMut::zeroed(total_length),
                flags: packet_flags,
            },
        };

        let fragments = if fragment_count > 0 {
            if fragment_count > MAXIMUM_FRAGMENT_COUNT {
                return EnqueueOutcome::Error;
            }
            Some(bitvec![u32, Lsb0; 0; fragment_count as usize])
        } else {
            None
        };

        self.total_waiting_data += payload.len();

        let incoming = IncomingCommand {
            kind,
            flags: command.flags,
            channel_id: command.channel_id,
            reliable_seq,
            unreliable_seq,
            fragment_count,
            fragments_remaining: fragment_count,
            fragments,
            payload,
        };

        match insert {
            Insert::Reliable(position) => {
                self.channels[channel_index]
                    .incoming_reliable
                    .insert(position, incoming);
                self.dispatch_incoming_reliable(dispatch_queue, command.channel_id);
            }
            Insert::Unreliable(position) => {
                self.channels[channel_index]
                    .incoming_unreliable
                    .insert(position, incoming);
                self.dispatch_incoming_unreliable(dispatch_queue, command.channel_id);
            }
        }

        EnqueueOutcome::Queued
    }

    /// Moves the in-order, fully reassembled prefix of the channel's
    /// reliable queue onto the dispatched queue and advances the delivery
    /// cursor, then gives newly unblocked unreliable commands a chance.
    pub(crate) fn dispatch_incoming_reliable(
        &mut self,
        dispatch_queue: &mut VecDeque<PeerId>,
        channel_id: u8,
    ) {
        let channel = &mut self.channels[usize::from(channel_id)];
        let mut count = 0;
        while count < channel.incoming_reliable.len() {
            let command = &channel.incoming_reliable[count];
            if command.fragments_remaining > 0
                || command.reliable_seq.0 != channel.incoming_reliable_seq.0.wrapping_add(1)
            {
                break;
            }

            channel.incoming_reliable_seq = command.reliable_seq;
            if command.fragment_count > 0 {
                // the group's fragments each consumed a sequence number
                channel.incoming_reliable_seq.0 = channel
                    .incoming_reliable_seq
                    .0
                    .wrapping_add(command.fragment_count as u16 - 1);
            }
            count += 1;
        }

        if count == 0 {
            return;
        }

        channel.incoming_unreliable_seq = Seq(0);
        self.dispatched.extend(
            self.channels[usize::from(channel_id)]
                .incoming_reliable
                .drain(..count),
        );
        self.flag_dispatch(dispatch_queue);

        if !self.channels[usize::from(channel_id)]
            .incoming_unreliable
            .is_empty()
        {
            self.dispatch_incoming_unreliable(dispatch_queue, channel_id);
        }
    }

    /// Scans the channel's unreliable queue: commands belonging to the
    /// current reliable window are dispatched (committing the channel's
    /// unreliable cursor), commands from windows the channel has moved past
    /// are destroyed, and commands for windows still to come are left in
    /// place.
    pub(crate) fn dispatch_incoming_unreliable(
        &mut self,
        dispatch_queue: &mut VecDeque<PeerId>,
        channel_id: u8,
    ) {
        let channel_index = usize::from(channel_id);

        let (marks, any) = {
            let channel = &mut self.channels[channel_index];
            let len = channel.incoming_unreliable.len();
            let mut marks = vec![Disposition::Keep; len];
            let mut any = false;
            let mut start = 0;
            let mut dropped = 0;
            let mut current = 0;

            while current < len {
                let command = &channel.incoming_unreliable[current];
                if command.kind == CommandKind::SendUnsequenced {
                    current += 1;
                    continue;
                }

                if command.reliable_seq.0 == channel.incoming_reliable_seq.0 {
                    if command.fragments_remaining == 0 {
                        channel.incoming_unreliable_seq = command.unreliable_seq;
                        current += 1;
                        continue;
                    }

                    // an incomplete unreliable fragment group blocks here;
                    // dispatch the run before it and scan on
                    if start != current {
                        marks[start..current].fill(Disposition::Dispatch);
                        any = true;
                        dropped = current;
                    } else if dropped != current {
                        dropped = current - 1;
                    }
                } else {
                    if channel.accepts_reliable(command.reliable_seq) {
                        // belongs to a reliable window still in flight;
                        // everything from here on must wait
                        break;
                    }

                    // the channel has moved past this command's window
                    dropped = current + 1;
                    if start != current {
                        marks[start..current].fill(Disposition::Dispatch);
                        any = true;
                    }
                }

                start = current + 1;
                current += 1;
            }

            if start != current {
                marks[start..current].fill(Disposition::Dispatch);
                any = true;
                dropped = current;
            }

            for mark in &mut marks[..dropped] {
                if *mark == Disposition::Keep {
                    *mark = Disposition::Destroy;
                }
            }

            (marks, any)
        };

        let channel = &mut self.channels[channel_index];
        let mut kept = VecDeque::with_capacity(channel.incoming_unreliable.len());
        for (command, mark) in channel.incoming_unreliable.drain(..).zip(marks) {
            match mark {
                Disposition::Dispatch => self.dispatched.push_back(command),
                Disposition::Destroy => {
                    self.total_waiting_data =
                        self.total_waiting_data.saturating_sub(command.payload.len());
                }
                Disposition::Keep => kept.push_back(command),
            }
        }
        channel.incoming_unreliable = kept;

        if any {
            self.flag_dispatch(dispatch_queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::{
        channel::Channel,
        protocol::CommandFlags,
    };

    use super::*;

    fn connected_peer(channels: usize) -> Peer {
        let mut peer = Peer::new(PeerId(0), 1400);
        peer.state = PeerState::Connected;
        peer.channels = (0..channels).map(|_| Channel::new()).collect();
        peer
    }

    fn reliable_command(channel_id: u8, seq: u16, len: u16) -> Command {
        Command {
            flags: CommandFlags::ACKNOWLEDGE,
            channel_id,
            reliable_seq: Seq(seq),
            body: CommandBody::SendReliable { data_length: len },
        }
    }

    fn queue_reliable(peer: &mut Peer, dispatch: &mut VecDeque<PeerId>, seq: u16) -> EnqueueOutcome {
        let command = reliable_command(0, seq, 3);
        peer.queue_incoming_command(
            dispatch,
            usize::MAX,
            &command,
            IncomingData::Whole(Bytes::from_static(b"abc")),
            PacketFlags::RELIABLE,
            0,
        )
    }

    #[test]
    fn in_order_reliable_dispatches_immediately() {
        let mut peer = connected_peer(1);
        let mut dispatch = VecDeque::new();

        assert_matches!(queue_reliable(&mut peer, &mut dispatch, 1), EnqueueOutcome::Queued);
        assert_eq!(1, peer.dispatched.len());
        assert_eq!(Some(&PeerId(0)), dispatch.front());
        assert_eq!(1, dispatch.len());
        assert_eq!(Seq(1), peer.channels[0].incoming_reliable_seq);
        assert_eq!(3, peer.total_waiting_data);

        let (channel, packet) = peer.receive().expect("packet");
        assert_eq!(0, channel);
        assert_eq!(&b"abc"[..], &packet.data[..]);
        assert_eq!(0, peer.total_waiting_data);
    }

    #[test]
    fn out_of_order_reliable_holds_until_gap_fills() {
        let mut peer = connected_peer(1);
        let mut dispatch = VecDeque::new();

        assert_matches!(queue_reliable(&mut peer, &mut dispatch, 2), EnqueueOutcome::Queued);
        assert_matches!(queue_reliable(&mut peer, &mut dispatch, 3), EnqueueOutcome::Queued);
        assert!(peer.dispatched.is_empty());
        assert!(dispatch.is_empty());

        assert_matches!(queue_reliable(&mut peer, &mut dispatch, 1), EnqueueOutcome::Queued);
        assert_eq!(3, peer.dispatched.len());
        assert_eq!(Seq(3), peer.channels[0].incoming_reliable_seq);
        let seqs = peer
            .dispatched
            .iter()
            .map(|command| command.reliable_seq.0)
            .collect::<Vec<_>>();
        assert_eq!(vec![1, 2, 3], seqs);
    }

    #[test]
    fn duplicate_reliable_discarded() {
        let mut peer = connected_peer(1);
        let mut dispatch = VecDeque::new();

        assert_matches!(queue_reliable(&mut peer, &mut dispatch, 2), EnqueueOutcome::Queued);
        assert_matches!(
            queue_reliable(&mut peer, &mut dispatch, 2),
            EnqueueOutcome::Discarded
        );
        // already delivered: seq 1 then 1 again
        assert_matches!(queue_reliable(&mut peer, &mut dispatch, 1), EnqueueOutcome::Queued);
        assert_matches!(
            queue_reliable(&mut peer, &mut dispatch, 1),
            EnqueueOutcome::Discarded
        );
    }

    #[test]
    fn guard_window_rejected() {
        let mut peer = connected_peer(1);
        let mut dispatch = VecDeque::new();
        // window 7 is the first guard window
        assert_matches!(
            queue_reliable(&mut peer, &mut dispatch, 7 * 4096),
            EnqueueOutcome::Discarded
        );
    }

    #[test]
    fn waiting_data_limit_is_fatal() {
        let mut peer = connected_peer(1);
        let mut dispatch = VecDeque::new();
        let command = reliable_command(0, 1, 3);
        let outcome = peer.queue_incoming_command(
            &mut dispatch,
            0,
            &command,
            IncomingData::Whole(Bytes::from_static(b"abc")),
            PacketFlags::RELIABLE,
            0,
        );
        assert_matches!(outcome, EnqueueOutcome::Error);
    }

    #[test]
    fn unreliable_dispatch_commits_cursor() {
        let mut peer = connected_peer(1);
        let mut dispatch = VecDeque::new();

        let command = Command {
            flags: CommandFlags::empty(),
            channel_id: 0,
            reliable_seq: Seq(0),
            body: CommandBody::SendUnreliable {
                unreliable_seq: Seq(1),
                data_length: 2,
            },
        };
        assert_matches!(
            peer.queue_incoming_command(
                &mut dispatch,
                usize::MAX,
                &command,
                IncomingData::Whole(Bytes::from_static(b"hi")),
                PacketFlags::empty(),
                0,
            ),
            EnqueueOutcome::Queued
        );
        // dispatched immediately: same reliable window, next unreliable seq
        assert_eq!(1, peer.dispatched.len());
        assert_eq!(Seq(1), peer.channels[0].incoming_unreliable_seq);

        // an older unreliable seq in the same window is now a duplicate
        assert_matches!(
            peer.queue_incoming_command(
                &mut dispatch,
                usize::MAX,
                &command,
                IncomingData::Whole(Bytes::from_static(b"hi")),
                PacketFlags::empty(),
                0,
            ),
            EnqueueOutcome::Discarded
        );
    }
}
