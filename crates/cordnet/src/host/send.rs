//! The send half of the protocol engine: drains per-peer queues into
//! MTU-sized datagrams once per service pass.

use octs::Write;
use tracing::trace;

use crate::{
    io::DatagramIo,
    peer::{PACKET_LOSS_INTERVAL, PACKET_LOSS_SCALE, PACKET_THROTTLE_COUNTER, PACKET_THROTTLE_SCALE},
    protocol::{
        Command, CommandBody, CommandKind, DatagramHeader, FREE_RELIABLE_WINDOWS,
        MAXIMUM_PACKET_COMMANDS, MAXIMUM_PEER_ID, RELIABLE_WINDOWS, RELIABLE_WINDOW_SIZE,
    },
};

use super::{Host, PeerState, ServiceError};

/// Accumulates the command region of one outgoing datagram.
#[derive(Debug, Default)]
pub(crate) struct DatagramBuilder {
    pub buffer: Vec<u8>,
    pub command_count: usize,
    /// Set when a reliable command was serialized; the datagram header then
    /// carries the send timestamp for RTT measurement.
    pub needs_sent_time: bool,
}

impl DatagramBuilder {
    /// Bytes this datagram would occupy on the wire, counting the full
    /// protocol header.
    pub fn packet_size(&self) -> usize {
        4 + self.buffer.len()
    }

    fn push(&mut self, command: &Command, payload: Option<&[u8]>) {
        self.buffer
            .write(command)
            .expect("writing to a Vec never fails");
        if let Some(payload) = payload {
            self.buffer.extend_from_slice(payload);
        }
        self.command_count += 1;
    }
}

/// Bitmask of the [`FREE_RELIABLE_WINDOWS`] windows starting at `window`,
/// wrapped to the 16-window ring.
fn free_window_mask(window: u16) -> u16 {
    let free = (1u32 << FREE_RELIABLE_WINDOWS) - 1;
    ((free << window) | (free >> (RELIABLE_WINDOWS - window))) as u16
}

impl<S: DatagramIo> Host<S> {
    /// Runs one full send pass over every peer, re-running while any peer
    /// had more queued than fit in one datagram.
    ///
    /// Returns whether an event was produced (timeout disconnects).
    pub(crate) fn send_outgoing_commands(
        &mut self,
        check_for_timeouts: bool,
        with_events: bool,
    ) -> Result<bool, ServiceError> {
        let mut continue_sending = true;
        while continue_sending {
            continue_sending = false;
            for index in 0..self.peers.len() {
                if matches!(
                    self.peers[index].state,
                    PeerState::Disconnected | PeerState::Zombie
                ) {
                    continue;
                }

                let mut dgram = DatagramBuilder::default();

                if !self.peers[index].acknowledgements.is_empty() {
                    self.send_acknowledgements(index, &mut dgram, &mut continue_sending);
                }

                if check_for_timeouts
                    && !self.peers[index].sent_reliable.is_empty()
                    && self.service_time.at_or_after(self.peers[index].next_timeout)
                    && self.check_timeouts(index, with_events)
                {
                    if with_events && self.pending_event.is_some() {
                        return Ok(true);
                    }
                    continue;
                }

                let can_ping = if self.peers[index].outgoing_reliable.is_empty() {
                    true
                } else {
                    self.send_reliable_outgoing(index, &mut dgram, &mut continue_sending)
                };

                if can_ping
                    && self.peers[index].sent_reliable.is_empty()
                    && self
                        .service_time
                        .difference(self.peers[index].last_receive_time)
                        >= self.peers[index].ping_interval
                    && self.peers[index].mtu as usize - dgram.packet_size()
                        >= CommandKind::Ping.size()
                {
                    self.peers[index].queue_ping();
                    self.send_reliable_outgoing(index, &mut dgram, &mut continue_sending);
                }

                if !self.peers[index].outgoing_unreliable.is_empty() {
                    self.send_unreliable_outgoing(index, &mut dgram, &mut continue_sending);
                }

                if dgram.command_count == 0 {
                    continue;
                }

                self.update_packet_loss(index);
                self.transmit(index, &dgram)?;
            }
        }
        Ok(false)
    }

    /// Turns queued acknowledgements into ACKNOWLEDGE commands while the
    /// datagram has room.
    fn send_acknowledgements(
        &mut self,
        index: usize,
        dgram: &mut DatagramBuilder,
        continue_sending: &mut bool,
    ) {
        let mut zombie = false;
        {
            let peer = &mut self.peers[index];
            while let Some(ack) = peer.acknowledgements.front() {
                if dgram.command_count >= MAXIMUM_PACKET_COMMANDS
                    || (peer.mtu as usize).saturating_sub(dgram.packet_size())
                        < CommandKind::Acknowledge.size()
                {
                    *continue_sending = true;
                    break;
                }

                let ack = *ack;
                peer.acknowledgements.pop_front();

                dgram.push(
                    &Command {
                        flags: crate::protocol::CommandFlags::empty(),
                        channel_id: ack.channel_id,
                        reliable_seq: ack.reliable_seq,
                        body: CommandBody::Acknowledge {
                            received_reliable_seq: ack.reliable_seq,
                            received_sent_time: ack.sent_time,
                        },
                    },
                    None,
                );

                if ack.kind == CommandKind::Disconnect {
                    zombie = true;
                }
            }
        }
        if zombie {
            self.dispatch_state(index, PeerState::Zombie);
        }
    }

    /// Checks sent reliable commands against their retransmission timeouts,
    /// resplicing expired ones for resend with doubled backoff.
    ///
    /// Returns whether the peer timed out entirely and was disconnected.
    fn check_timeouts(&mut self, index: usize, with_events: bool) -> bool {
        let service_time = self.service_time;
        let disconnect;
        {
            let peer = &mut self.peers[index];
            let mut resend = Vec::new();
            let mut timed_out_peer = false;
            let mut i = 0;
            while i < peer.sent_reliable.len() {
                let command = &peer.sent_reliable[i];
                if service_time.difference(command.sent_time) < command.rto {
                    i += 1;
                    continue;
                }

                if peer.earliest_timeout.0 == 0
                    || command.sent_time.earlier_than(peer.earliest_timeout)
                {
                    peer.earliest_timeout = command.sent_time;
                }

                if peer.earliest_timeout.0 != 0 {
                    let age = service_time.difference(peer.earliest_timeout);
                    if age >= peer.timeout_maximum
                        || (command.rto >= command.rto_limit && age >= peer.timeout_minimum)
                    {
                        timed_out_peer = true;
                        break;
                    }
                }

                let mut command = peer
                    .sent_reliable
                    .remove(i)
                    .expect("index was checked against len");
                if command.payload.is_some() {
                    peer.reliable_data_in_transit = peer
                        .reliable_data_in_transit
                        .saturating_sub(u32::from(command.fragment_length));
                }
                peer.packets_lost += 1;
                command.rto *= 2;
                resend.push(command);
            }

            // resends go back to the head of the outgoing queue, oldest
            // first, ahead of never-sent commands
            for command in resend.into_iter().rev() {
                peer.outgoing_reliable.push_front(command);
            }

            if let Some(front) = peer.sent_reliable.front() {
                peer.next_timeout = front.sent_time.plus(front.rto);
            }

            disconnect = timed_out_peer;
        }

        if disconnect {
            trace!(peer = index, "Timed out");
            self.notify_disconnect(index, with_events);
        }
        disconnect
    }

    /// Serializes admissible outgoing reliable commands into the datagram,
    /// moving them to the sent queue.
    ///
    /// Returns whether the peer is idle enough that a keep-alive ping makes
    /// sense (nothing was serialized and nothing is pending).
    fn send_reliable_outgoing(
        &mut self,
        index: usize,
        dgram: &mut DatagramBuilder,
        continue_sending: &mut bool,
    ) -> bool {
        let service_time = self.service_time;
        let peer = &mut self.peers[index];
        let mut can_ping = true;
        let mut window_exceeded = false;
        let mut window_wrap = false;

        let mut i = 0;
        while i < peer.outgoing_reliable.len() {
            let command = &peer.outgoing_reliable[i];
            let channel_id = command.command.channel_id;
            let has_channel = usize::from(channel_id) < peer.channels.len();
            let window = command.reliable_seq.window();

            if has_channel {
                let channel = &peer.channels[usize::from(channel_id)];
                // a command opening a new window must not be admitted while
                // the previous window is saturated or the free-window ring
                // ahead is occupied
                if !window_wrap
                    && command.send_attempts < 1
                    && command.reliable_seq.0 % RELIABLE_WINDOW_SIZE == 0
                    && (channel.reliable_windows
                        [usize::from((window + RELIABLE_WINDOWS - 1) % RELIABLE_WINDOWS)]
                        >= RELIABLE_WINDOW_SIZE
                        || channel.used_reliable_windows & free_window_mask(window) != 0)
                {
                    window_wrap = true;
                }
                if window_wrap {
                    i += 1;
                    continue;
                }
            }

            if command.payload.is_some() {
                if !window_exceeded {
                    // the throttle shrinks the effective congestion window
                    let window_size =
                        (peer.packet_throttle * peer.window_size) / PACKET_THROTTLE_SCALE;
                    if peer.reliable_data_in_transit + u32::from(command.fragment_length)
                        > window_size.max(peer.mtu)
                    {
                        window_exceeded = true;
                    }
                }
                if window_exceeded {
                    i += 1;
                    continue;
                }
            }

            can_ping = false;

            let command_size = command.command.size();
            let room = (peer.mtu as usize).saturating_sub(dgram.packet_size());
            if dgram.command_count >= MAXIMUM_PACKET_COMMANDS
                || room < command_size
                || (command.payload.is_some()
                    && room < command_size + usize::from(command.fragment_length))
            {
                *continue_sending = true;
                break;
            }

            let mut command = peer
                .outgoing_reliable
                .remove(i)
                .expect("index was checked against len");

            if has_channel && command.send_attempts < 1 {
                peer.channels[usize::from(channel_id)].mark_window_used(command.reliable_seq);
            }

            command.send_attempts += 1;
            if command.rto == 0 {
                command.rto = peer.round_trip_time + 4 * peer.round_trip_time_variance;
                command.rto_limit = peer.timeout_limit * command.rto;
            }

            if peer.sent_reliable.is_empty() {
                peer.next_timeout = service_time.plus(command.rto);
            }

            command.sent_time = service_time;
            dgram.needs_sent_time = true;

            dgram.push(&command.command, command.payload.as_deref());

            if command.payload.is_some() {
                peer.reliable_data_in_transit += u32::from(command.fragment_length);
            }

            peer.packets_sent += 1;
            peer.sent_reliable.push_back(command);
        }

        can_ping
    }

    /// Serializes outgoing unreliable commands, dropping whole packets that
    /// lose the throttle roll.
    fn send_unreliable_outgoing(
        &mut self,
        index: usize,
        dgram: &mut DatagramBuilder,
        continue_sending: &mut bool,
    ) {
        let mut disconnect_later = false;
        {
            let peer = &mut self.peers[index];
            let mut i = 0;
            while i < peer.outgoing_unreliable.len() {
                let command = &peer.outgoing_unreliable[i];
                let command_size = command.command.size();
                let room = (peer.mtu as usize).saturating_sub(dgram.packet_size());
                if dgram.command_count >= MAXIMUM_PACKET_COMMANDS
                    || room < command_size
                    || (command.payload.is_some()
                        && room < command_size + usize::from(command.fragment_length))
                {
                    *continue_sending = true;
                    break;
                }

                if command.payload.is_some() && command.fragment_offset == 0 {
                    peer.packet_throttle_counter += PACKET_THROTTLE_COUNTER;
                    peer.packet_throttle_counter %= PACKET_THROTTLE_SCALE;
                    if peer.packet_throttle_counter > peer.packet_throttle {
                        // drop the packet, and with it every queued command
                        // sharing its sequence numbers (its fragments)
                        let reliable_seq = command.reliable_seq;
                        let unreliable_seq = command.unreliable_seq;
                        loop {
                            peer.outgoing_unreliable.remove(i);
                            match peer.outgoing_unreliable.get(i) {
                                Some(next)
                                    if next.reliable_seq == reliable_seq
                                        && next.unreliable_seq == unreliable_seq => {}
                                _ => break,
                            }
                        }
                        continue;
                    }
                }

                let command = peer
                    .outgoing_unreliable
                    .remove(i)
                    .expect("index was checked against len");
                dgram.push(&command.command, command.payload.as_deref());

                if command.payload.is_some() {
                    // keep the payload alive until the datagram is actually
                    // handed to the transport
                    peer.sent_unreliable.push_back(command);
                }
            }

            if peer.state == PeerState::DisconnectLater
                && peer.outgoing_reliable.is_empty()
                && peer.outgoing_unreliable.is_empty()
                && peer.sent_reliable.is_empty()
            {
                disconnect_later = true;
            }
        }

        if disconnect_later {
            let event_data = self.peers[index].event_data;
            self.disconnect(crate::peer::PeerId(index as u16), event_data);
        }
    }

    /// Folds the last sampling interval's losses into the smoothed
    /// packet-loss statistics.
    fn update_packet_loss(&mut self, index: usize) {
        let service_time = self.service_time;
        let peer = &mut self.peers[index];

        if peer.packet_loss_epoch.0 == 0 {
            peer.packet_loss_epoch = service_time;
        } else if service_time.difference(peer.packet_loss_epoch) >= PACKET_LOSS_INTERVAL
            && peer.packets_sent > 0
        {
            let packet_loss = peer.packets_lost * PACKET_LOSS_SCALE / peer.packets_sent;

            peer.packet_loss_variance -= peer.packet_loss_variance / 4;
            if packet_loss >= peer.packet_loss {
                peer.packet_loss += (packet_loss - peer.packet_loss) / 8;
                peer.packet_loss_variance += (packet_loss - peer.packet_loss) / 4;
            } else {
                peer.packet_loss -= (peer.packet_loss - packet_loss) / 8;
                peer.packet_loss_variance += (peer.packet_loss - packet_loss) / 4;
            }

            peer.packet_loss_epoch = service_time;
            peer.packets_sent = 0;
            peer.packets_lost = 0;
        }
    }

    /// Finalizes one datagram (header, optional compression, optional
    /// checksum) and hands it to the transport.
    fn transmit(&mut self, index: usize, dgram: &DatagramBuilder) -> Result<(), ServiceError> {
        let (outgoing_peer_id, session_id, connect_id, address) = {
            let peer = &self.peers[index];
            (
                peer.outgoing_peer_id,
                peer.outgoing_session_id,
                peer.connect_id,
                peer.address,
            )
        };
        let Some(address) = address else {
            return Ok(());
        };
        let assigned = outgoing_peer_id < MAXIMUM_PEER_ID;

        // compression covers only the command region; the checksum is
        // computed over the logical (uncompressed) datagram
        let mut compressed: Option<Vec<u8>> = None;
        if let Some(compressor) = &mut self.compressor {
            let mut out = vec![0u8; dgram.buffer.len()];
            let len = compressor.compress(&dgram.buffer, &mut out);
            if len > 0 && len < dgram.buffer.len() {
                out.truncate(len);
                compressed = Some(out);
            }
        }

        let header = DatagramHeader {
            peer_id: outgoing_peer_id,
            session_id: if assigned { session_id } else { 0 },
            compressed: compressed.is_some(),
            sent_time: dgram
                .needs_sent_time
                .then(|| (self.service_time.0 & 0xFFFF) as u16),
        };

        let mut datagram = Vec::with_capacity(header.encode_len() + 4 + dgram.buffer.len());
        datagram
            .write(&header)
            .expect("writing to a Vec never fails");

        if let Some(checksum) = self.checksum {
            let seed = if assigned { connect_id } else { 0 };
            let seed_bytes = seed.to_be_bytes();
            let value = checksum(&[&datagram, &seed_bytes, &dgram.buffer]);
            datagram.extend_from_slice(&value.to_be_bytes());
        }

        match &compressed {
            Some(region) => datagram.extend_from_slice(region),
            None => datagram.extend_from_slice(&dgram.buffer),
        }

        self.peers[index].last_send_time = self.service_time;

        trace!(
            peer = index,
            commands = dgram.command_count,
            len = datagram.len(),
            "Sending datagram"
        );
        let sent = self.socket.send(address, &datagram);
        self.peers[index].remove_sent_unreliable_commands();
        let sent = sent?;

        self.total_sent_data += sent as u64;
        self.total_sent_packets += 1;
        Ok(())
    }
}
