//! The receive half of the protocol engine: datagram validation,
//! decompression, checksum verification, and the per-command handlers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::Bytes;
use octs::Read;
use tracing::{debug, trace};

use crate::{
    channel::IncomingPayload,
    io::DatagramIo,
    packet::PacketFlags,
    peer::{EnqueueOutcome, IncomingData, PeerId, WINDOW_SIZE_SCALE},
    protocol::{
        Command, CommandBody, CommandKind, ConnectBody, DatagramHeader, FragmentBody,
        VerifyConnectBody, CONTROL_CHANNEL_ID, FREE_UNSEQUENCED_WINDOWS, MAXIMUM_CHANNEL_COUNT,
        MAXIMUM_FRAGMENT_COUNT, MAXIMUM_MTU, MAXIMUM_PEER_ID, MAXIMUM_WINDOW_SIZE,
        MINIMUM_CHANNEL_COUNT, MINIMUM_MTU, MINIMUM_WINDOW_SIZE, SESSION_UNASSIGNED,
        UNSEQUENCED_WINDOW_SIZE,
    },
    seq::Seq,
    time::Timestamp,
};

use super::{Host, Intercept, PeerState, ServiceError};

/// Datagrams accepted per receive pass; the pass ends when the budget is
/// exhausted and the service loop simply comes back around.
const RECEIVE_BUDGET: usize = 256;

/// A command the engine refuses to process further; the rest of the
/// datagram is dropped. Protocol-violating peers are dispatched to
/// [`PeerState::Zombie`] by the individual handlers before this surfaces.
struct CommandError;

type CommandResult = Result<(), CommandError>;

impl<S: DatagramIo> Host<S> {
    /// Receives and processes up to [`RECEIVE_BUDGET`] datagrams.
    ///
    /// Returns whether an event is waiting in `pending_event`.
    pub(crate) fn receive_incoming_commands(&mut self) -> Result<bool, ServiceError> {
        let mut buf = [0u8; MAXIMUM_MTU as usize];
        for _ in 0..RECEIVE_BUDGET {
            let Some((length, addr)) = self.socket.recv(&mut buf)? else {
                return Ok(false);
            };

            self.total_received_data += length as u64;
            self.total_received_packets += 1;

            if let Some(intercept) = &mut self.intercept {
                match intercept(addr, &buf[..length]) {
                    Intercept::Consume => continue,
                    Intercept::Error => return Err(ServiceError::Intercept),
                    Intercept::Pass => {}
                }
            }

            self.handle_datagram(addr, &buf[..length]);
            if self.pending_event.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Validates and processes one datagram. Malformed input is silently
    /// dropped at whatever stage it fails.
    fn handle_datagram(&mut self, addr: SocketAddr, data: &[u8]) {
        let mut prefix = data;
        let Ok(header) = prefix.read::<DatagramHeader>() else {
            return;
        };
        let header_len = header.encode_len();
        let header_size = header_len + if self.checksum.is_some() { 4 } else { 0 };
        if data.len() < header_size {
            return;
        }

        let mut peer_index = if header.peer_id == MAXIMUM_PEER_ID {
            None
        } else {
            let index = usize::from(header.peer_id);
            let Some(peer) = self.peers.get(index) else {
                return;
            };
            if matches!(peer.state, PeerState::Disconnected | PeerState::Zombie) {
                return;
            }
            let from_expected = peer.address == Some(addr)
                || peer.address.map(|addr| addr.ip())
                    == Some(IpAddr::V4(Ipv4Addr::BROADCAST));
            if !from_expected {
                return;
            }
            if peer.outgoing_peer_id < MAXIMUM_PEER_ID
                && header.session_id != peer.incoming_session_id
            {
                return;
            }
            Some(index)
        };

        let decompressed: Option<Vec<u8>> = if header.compressed {
            let Some(compressor) = &mut self.compressor else {
                return;
            };
            let mut out = vec![0u8; MAXIMUM_MTU as usize - header_size];
            let length = compressor.decompress(&data[header_size..], &mut out);
            if length == 0 || length > out.len() {
                trace!("Dropping datagram with undecompressable payload");
                return;
            }
            out.truncate(length);
            Some(out)
        } else {
            None
        };
        let command_bytes: &[u8] = decompressed.as_deref().unwrap_or(&data[header_size..]);

        if let Some(checksum) = self.checksum {
            let Ok(stored) = data[header_len..header_len + 4].try_into().map(u32::from_be_bytes)
            else {
                return;
            };
            let seed = peer_index.map_or(0, |index| self.peers[index].connect_id);
            let computed = checksum(&[&data[..header_len], &seed.to_be_bytes(), command_bytes]);
            if computed != stored {
                trace!("Dropping datagram with bad checksum");
                return;
            }
        }

        if let Some(index) = peer_index {
            let peer = &mut self.peers[index];
            peer.address = Some(addr);
            peer.incoming_data_total += data.len() as u32;
            peer.last_receive_time = self.service_time;
            peer.earliest_timeout = Timestamp(0);
        }

        let mut commands: &[u8] = command_bytes;
        while !commands.is_empty() {
            let Ok(command) = commands.read::<Command>() else {
                break;
            };

            // inline payload, where the command carries one
            let payload_len = match &command.body {
                CommandBody::SendReliable { data_length }
                | CommandBody::SendUnreliable { data_length, .. }
                | CommandBody::SendUnsequenced { data_length, .. } => Some(*data_length),
                CommandBody::SendFragment(body) | CommandBody::SendUnreliableFragment(body) => {
                    Some(body.data_length)
                }
                _ => None,
            };
            let payload = match payload_len {
                Some(length) => {
                    if usize::from(length) > self.maximum_packet_size {
                        break;
                    }
                    let Ok(payload) = commands.read_next(usize::from(length)) else {
                        break;
                    };
                    Some(payload)
                }
                None => None,
            };

            if peer_index.is_none() && command.kind() != CommandKind::Connect {
                break;
            }

            let handled: CommandResult = match &command.body {
                CommandBody::Acknowledge { .. } => {
                    self.handle_acknowledge(peer_index.expect("gated above"), &command)
                }
                CommandBody::Connect(body) => {
                    if peer_index.is_some() {
                        break;
                    }
                    match self.handle_connect(addr, body) {
                        Some(index) => {
                            peer_index = Some(index);
                            Ok(())
                        }
                        None => Err(CommandError),
                    }
                }
                CommandBody::VerifyConnect(body) => {
                    self.handle_verify_connect(peer_index.expect("gated above"), body)
                }
                CommandBody::Disconnect { data } => {
                    self.handle_disconnect(peer_index.expect("gated above"), &command, *data)
                }
                CommandBody::Ping => self.handle_ping(peer_index.expect("gated above")),
                CommandBody::SendReliable { .. } => self.handle_send(
                    peer_index.expect("gated above"),
                    &command,
                    payload.expect("send commands carry a payload"),
                    PacketFlags::RELIABLE,
                ),
                CommandBody::SendUnreliable { .. } => self.handle_send(
                    peer_index.expect("gated above"),
                    &command,
                    payload.expect("send commands carry a payload"),
                    PacketFlags::empty(),
                ),
                CommandBody::SendUnsequenced { .. } => self.handle_send_unsequenced(
                    peer_index.expect("gated above"),
                    &command,
                    payload.expect("send commands carry a payload"),
                ),
                CommandBody::SendFragment(body) => self.handle_send_fragment(
                    peer_index.expect("gated above"),
                    &command,
                    *body,
                    payload.expect("send commands carry a payload"),
                ),
                CommandBody::SendUnreliableFragment(body) => self.handle_send_unreliable_fragment(
                    peer_index.expect("gated above"),
                    &command,
                    *body,
                    payload.expect("send commands carry a payload"),
                ),
                CommandBody::BandwidthLimit {
                    incoming_bandwidth,
                    outgoing_bandwidth,
                } => self.handle_bandwidth_limit(
                    peer_index.expect("gated above"),
                    *incoming_bandwidth,
                    *outgoing_bandwidth,
                ),
                CommandBody::ThrottleConfigure {
                    packet_throttle_interval,
                    packet_throttle_acceleration,
                    packet_throttle_deceleration,
                } => self.handle_throttle_configure(
                    peer_index.expect("gated above"),
                    *packet_throttle_interval,
                    *packet_throttle_acceleration,
                    *packet_throttle_deceleration,
                ),
            };

            if handled.is_err() {
                break;
            }

            if let Some(index) = peer_index {
                if command.wants_ack() {
                    let Some(sent_time) = header.sent_time else {
                        break;
                    };
                    match self.peers[index].state {
                        PeerState::Disconnecting
                        | PeerState::AcknowledgingConnect
                        | PeerState::Disconnected
                        | PeerState::Zombie => {}
                        PeerState::AcknowledgingDisconnect => {
                            if command.kind() == CommandKind::Disconnect {
                                self.peers[index].queue_acknowledgement(&command, sent_time);
                            }
                        }
                        _ => {
                            self.peers[index].queue_acknowledgement(&command, sent_time);
                        }
                    }
                }
            }
        }
    }

    /// Folds an acknowledgement into RTT and throttle state, retires the
    /// acknowledged command, and advances handshake/teardown state machines.
    fn handle_acknowledge(&mut self, index: usize, command: &Command) -> CommandResult {
        let CommandBody::Acknowledge {
            received_reliable_seq,
            received_sent_time,
        } = command.body
        else {
            return Err(CommandError);
        };

        if matches!(
            self.peers[index].state,
            PeerState::Disconnected | PeerState::Zombie
        ) {
            return Ok(());
        }

        let service_time = self.service_time;

        // reassemble the echoed 16-bit timestamp onto our 32-bit timeline,
        // accounting for the low half wrapping since the send
        let mut received_sent_time = u32::from(received_sent_time);
        received_sent_time |= service_time.0 & 0xFFFF_0000;
        if (received_sent_time & 0x8000) > (service_time.0 & 0x8000) {
            received_sent_time = received_sent_time.wrapping_sub(0x10000);
        }
        if service_time.earlier_than(Timestamp(received_sent_time)) {
            return Ok(());
        }

        let kind = {
            let peer = &mut self.peers[index];
            peer.last_receive_time = service_time;
            peer.earliest_timeout = Timestamp(0);

            let round_trip_time = service_time.difference(Timestamp(received_sent_time));
            peer.throttle(round_trip_time);

            peer.round_trip_time_variance -= peer.round_trip_time_variance / 4;
            if round_trip_time >= peer.round_trip_time {
                peer.round_trip_time += (round_trip_time - peer.round_trip_time) / 8;
                peer.round_trip_time_variance += (round_trip_time - peer.round_trip_time) / 4;
            } else {
                peer.round_trip_time -= (peer.round_trip_time - round_trip_time) / 8;
                peer.round_trip_time_variance += (peer.round_trip_time - round_trip_time) / 4;
            }

            if peer.round_trip_time < peer.lowest_round_trip_time {
                peer.lowest_round_trip_time = peer.round_trip_time;
            }
            if peer.round_trip_time_variance > peer.highest_round_trip_time_variance {
                peer.highest_round_trip_time_variance = peer.round_trip_time_variance;
            }

            if peer.packet_throttle_epoch.0 == 0
                || service_time.difference(peer.packet_throttle_epoch)
                    >= peer.packet_throttle_interval
            {
                peer.last_round_trip_time = peer.lowest_round_trip_time;
                peer.last_round_trip_time_variance = peer.highest_round_trip_time_variance;
                peer.lowest_round_trip_time = peer.round_trip_time;
                peer.highest_round_trip_time_variance = peer.round_trip_time_variance;
                peer.packet_throttle_epoch = service_time;
            }

            peer.remove_sent_reliable_command(received_reliable_seq, command.channel_id)
        };

        match self.peers[index].state {
            PeerState::AcknowledgingConnect => {
                if kind != Some(CommandKind::VerifyConnect) {
                    return Err(CommandError);
                }
                self.notify_connect(index, true);
            }
            PeerState::Disconnecting => {
                if kind != Some(CommandKind::Disconnect) {
                    return Err(CommandError);
                }
                self.notify_disconnect(index, true);
            }
            PeerState::DisconnectLater => {
                let peer = &self.peers[index];
                if peer.outgoing_reliable.is_empty()
                    && peer.outgoing_unreliable.is_empty()
                    && peer.sent_reliable.is_empty()
                {
                    let data = peer.event_data;
                    self.disconnect(PeerId(index as u16), data);
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Accepts (or refuses) an incoming connection request, allocating a
    /// peer slot and replying with VERIFY_CONNECT.
    fn handle_connect(&mut self, addr: SocketAddr, body: &ConnectBody) -> Option<usize> {
        let channel_count = body.channel_count as usize;
        if !(MINIMUM_CHANNEL_COUNT..=MAXIMUM_CHANNEL_COUNT).contains(&channel_count) {
            return None;
        }

        let mut slot = None;
        let mut duplicate_peers = 0;
        for (index, peer) in self.peers.iter().enumerate() {
            if peer.state == PeerState::Disconnected {
                if slot.is_none() {
                    slot = Some(index);
                }
            } else if peer.state != PeerState::Connecting
                && peer.address.map(|a| a.ip()) == Some(addr.ip())
            {
                if peer.address.map(|a| a.port()) == Some(addr.port())
                    && peer.connect_id == body.connect_id
                {
                    // a retransmitted CONNECT for a connection we already
                    // accepted
                    return None;
                }
                duplicate_peers += 1;
            }
        }
        let slot = slot?;
        if duplicate_peers >= self.duplicate_peers {
            return None;
        }

        let channel_count = channel_count.min(self.channel_limit);
        let host_incoming_bandwidth = self.incoming_bandwidth;
        let host_outgoing_bandwidth = self.outgoing_bandwidth;

        let peer = &mut self.peers[slot];
        peer.channels = (0..channel_count)
            .map(|_| crate::channel::Channel::new())
            .collect();
        peer.state = PeerState::AcknowledgingConnect;
        peer.connect_id = body.connect_id;
        peer.address = Some(addr);
        peer.outgoing_peer_id = body.outgoing_peer_id;
        peer.incoming_bandwidth = body.incoming_bandwidth;
        peer.outgoing_bandwidth = body.outgoing_bandwidth;
        peer.packet_throttle_interval = body.packet_throttle_interval;
        peer.packet_throttle_acceleration = body.packet_throttle_acceleration;
        peer.packet_throttle_deceleration = body.packet_throttle_deceleration;
        peer.event_data = body.data;

        // session IDs increment mod 4, skipping a collision with the other
        // direction; the skip may legitimately happen twice in a row
        let mut incoming_session = if body.incoming_session_id == SESSION_UNASSIGNED {
            peer.outgoing_session_id
        } else {
            body.incoming_session_id
        };
        incoming_session = incoming_session.wrapping_add(1) & 3;
        if incoming_session == peer.outgoing_session_id {
            incoming_session = incoming_session.wrapping_add(1) & 3;
        }
        peer.outgoing_session_id = incoming_session;

        let mut outgoing_session = if body.outgoing_session_id == SESSION_UNASSIGNED {
            peer.incoming_session_id
        } else {
            body.outgoing_session_id
        };
        outgoing_session = outgoing_session.wrapping_add(1) & 3;
        if outgoing_session == peer.incoming_session_id {
            outgoing_session = outgoing_session.wrapping_add(1) & 3;
        }
        peer.incoming_session_id = outgoing_session;

        peer.mtu = body.mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU);

        peer.window_size = if host_outgoing_bandwidth == 0 && peer.incoming_bandwidth == 0 {
            MAXIMUM_WINDOW_SIZE
        } else if host_outgoing_bandwidth == 0 || peer.incoming_bandwidth == 0 {
            (host_outgoing_bandwidth.max(peer.incoming_bandwidth) / WINDOW_SIZE_SCALE)
                * MINIMUM_WINDOW_SIZE
        } else {
            (host_outgoing_bandwidth.min(peer.incoming_bandwidth) / WINDOW_SIZE_SCALE)
                * MINIMUM_WINDOW_SIZE
        };
        peer.window_size = peer
            .window_size
            .clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE);

        let mut window_size = if host_incoming_bandwidth == 0 {
            MAXIMUM_WINDOW_SIZE
        } else {
            (host_incoming_bandwidth / WINDOW_SIZE_SCALE) * MINIMUM_WINDOW_SIZE
        };
        if window_size > body.window_size {
            window_size = body.window_size;
        }
        let window_size = window_size.clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE);

        let verify = Command {
            flags: crate::protocol::CommandFlags::ACKNOWLEDGE,
            channel_id: CONTROL_CHANNEL_ID,
            reliable_seq: Seq(0),
            body: CommandBody::VerifyConnect(VerifyConnectBody {
                outgoing_peer_id: peer.incoming_peer_id.0,
                incoming_session_id: incoming_session,
                outgoing_session_id: outgoing_session,
                mtu: peer.mtu,
                window_size,
                channel_count: channel_count as u32,
                incoming_bandwidth: host_incoming_bandwidth,
                outgoing_bandwidth: host_outgoing_bandwidth,
                packet_throttle_interval: peer.packet_throttle_interval,
                packet_throttle_acceleration: peer.packet_throttle_acceleration,
                packet_throttle_deceleration: peer.packet_throttle_deceleration,
                connect_id: peer.connect_id,
            }),
        };
        peer.queue_outgoing_command(verify, None, 0, 0);

        debug!(peer = slot, %addr, "Incoming connection");
        Some(slot)
    }

    /// Completes a handshake we initiated, adopting the negotiated
    /// parameters.
    fn handle_verify_connect(&mut self, index: usize, body: &VerifyConnectBody) -> CommandResult {
        if self.peers[index].state != PeerState::Connecting {
            return Ok(());
        }

        let channel_count = body.channel_count as usize;
        let mismatch = {
            let peer = &self.peers[index];
            !(MINIMUM_CHANNEL_COUNT..=MAXIMUM_CHANNEL_COUNT).contains(&channel_count)
                || body.packet_throttle_interval != peer.packet_throttle_interval
                || body.packet_throttle_acceleration != peer.packet_throttle_acceleration
                || body.packet_throttle_deceleration != peer.packet_throttle_deceleration
                || body.connect_id != peer.connect_id
        };
        if mismatch {
            // the reply does not match what we asked for: poisoned handshake
            self.peers[index].event_data = 0;
            self.dispatch_state(index, PeerState::Zombie);
            return Err(CommandError);
        }

        let peer = &mut self.peers[index];
        peer.remove_sent_reliable_command(Seq(1), CONTROL_CHANNEL_ID);

        if channel_count < peer.channels.len() {
            peer.channels.truncate(channel_count);
        }
        peer.outgoing_peer_id = body.outgoing_peer_id;
        peer.incoming_session_id = body.incoming_session_id;
        peer.outgoing_session_id = body.outgoing_session_id;

        let mtu = body.mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU);
        if mtu < peer.mtu {
            peer.mtu = mtu;
        }

        let window_size = body.window_size.clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE);
        if window_size < peer.window_size {
            peer.window_size = window_size;
        }

        peer.incoming_bandwidth = body.incoming_bandwidth;
        peer.outgoing_bandwidth = body.outgoing_bandwidth;

        self.notify_connect(index, true);
        Ok(())
    }

    /// Processes a remote disconnect request.
    fn handle_disconnect(&mut self, index: usize, command: &Command, data: u32) -> CommandResult {
        let state = self.peers[index].state;
        if matches!(
            state,
            PeerState::Disconnected | PeerState::Zombie | PeerState::AcknowledgingDisconnect
        ) {
            return Ok(());
        }

        self.reset_peer_queues(PeerId(index as u16));

        if matches!(
            state,
            PeerState::ConnectionSucceeded | PeerState::Disconnecting | PeerState::Connecting
        ) {
            self.dispatch_state(index, PeerState::Zombie);
        } else if !state.is_connected() {
            if state == PeerState::ConnectionPending {
                self.recalculate_bandwidth_limits = true;
            }
            self.reset_peer(PeerId(index as u16));
        } else if command.wants_ack() {
            self.change_state(index, PeerState::AcknowledgingDisconnect);
        } else {
            self.dispatch_state(index, PeerState::Zombie);
        }

        if self.peers[index].state != PeerState::Disconnected {
            self.peers[index].event_data = data;
        }

        Ok(())
    }

    fn handle_ping(&mut self, index: usize) -> CommandResult {
        if self.peers[index].state.is_connected() {
            Ok(())
        } else {
            Err(CommandError)
        }
    }

    /// Queues a whole (unfragmented) reliable or unreliable message.
    fn handle_send(
        &mut self,
        index: usize,
        command: &Command,
        payload: Bytes,
        flags: PacketFlags,
    ) -> CommandResult {
        let peer = &self.peers[index];
        if usize::from(command.channel_id) >= peer.channels.len() || !peer.state.is_connected() {
            return Err(CommandError);
        }

        let maximum_waiting_data = self.maximum_waiting_data;
        match self.peers[index].queue_incoming_command(
            &mut self.dispatch_queue,
            maximum_waiting_data,
            command,
            IncomingData::Whole(payload),
            flags,
            0,
        ) {
            EnqueueOutcome::Error => Err(CommandError),
            _ => Ok(()),
        }
    }

    /// Queues an unsequenced message, deduplicating by group number against
    /// the sliding unsequenced window.
    fn handle_send_unsequenced(
        &mut self,
        index: usize,
        command: &Command,
        payload: Bytes,
    ) -> CommandResult {
        let CommandBody::SendUnsequenced {
            unsequenced_group, ..
        } = command.body
        else {
            return Err(CommandError);
        };

        {
            let peer = &self.peers[index];
            if usize::from(command.channel_id) >= peer.channels.len()
                || !peer.state.is_connected()
            {
                return Err(CommandError);
            }
        }

        let window_index = usize::from(unsequenced_group % UNSEQUENCED_WINDOW_SIZE);
        let current_group = u32::from(self.peers[index].incoming_unsequenced_group);
        let mut group = u32::from(unsequenced_group);
        if group < current_group {
            group += 0x10000;
        }
        if group
            >= current_group
                + u32::from(FREE_UNSEQUENCED_WINDOWS) * u32::from(UNSEQUENCED_WINDOW_SIZE)
        {
            return Ok(());
        }
        let group = (group & 0xFFFF) as u16;

        let window_start = group.wrapping_sub(group % UNSEQUENCED_WINDOW_SIZE);
        {
            let peer = &mut self.peers[index];
            if window_start != peer.incoming_unsequenced_group {
                peer.incoming_unsequenced_group = window_start;
                peer.unsequenced_window.fill(false);
            } else if peer.unsequenced_window[window_index] {
                return Ok(());
            }
        }

        let maximum_waiting_data = self.maximum_waiting_data;
        match self.peers[index].queue_incoming_command(
            &mut self.dispatch_queue,
            maximum_waiting_data,
            command,
            IncomingData::Whole(payload),
            PacketFlags::UNSEQUENCED,
            0,
        ) {
            EnqueueOutcome::Error => Err(CommandError),
            _ => {
                self.peers[index]
                    .unsequenced_window
                    .set(window_index, true);
                Ok(())
            }
        }
    }

    /// Validates the shared fields of a fragment command.
    fn validate_fragment(&self, body: &FragmentBody, payload_len: usize) -> CommandResult {
        if body.fragment_count > MAXIMUM_FRAGMENT_COUNT
            || body.fragment_number >= body.fragment_count
            || body.total_length as usize > self.maximum_packet_size
            || body.fragment_offset >= body.total_length
            || payload_len as u32 > body.total_length - body.fragment_offset
        {
            return Err(CommandError);
        }
        Ok(())
    }

    /// Locates or creates a reliable fragment group and merges one fragment
    /// into it, dispatching the message when it completes.
    fn handle_send_fragment(
        &mut self,
        index: usize,
        command: &Command,
        body: FragmentBody,
        payload: Bytes,
    ) -> CommandResult {
        {
            let peer = &self.peers[index];
            if usize::from(command.channel_id) >= peer.channels.len()
                || !peer.state.is_connected()
            {
                return Err(CommandError);
            }
        }

        let channel_index = usize::from(command.channel_id);
        let start_seq = body.start_seq;
        if !self.peers[index].channels[channel_index].accepts_reliable(start_seq) {
            return Ok(());
        }

        self.validate_fragment(&body, payload.len())?;

        let find_group = |host: &Self| -> Result<Option<usize>, CommandError> {
            let channel = &host.peers[index].channels[channel_index];
            let queue = &channel.incoming_reliable;
            for i in (0..queue.len()).rev() {
                let queued = &queue[i];
                if start_seq.0 >= channel.incoming_reliable_seq.0 {
                    if queued.reliable_seq.0 < channel.incoming_reliable_seq.0 {
                        continue;
                    }
                } else if queued.reliable_seq.0 >= channel.incoming_reliable_seq.0 {
                    break;
                }

                if queued.reliable_seq.0 <= start_seq.0 {
                    if queued.reliable_seq.0 < start_seq.0 {
                        break;
                    }
                    if queued.kind != CommandKind::SendFragment
                        || body.total_length as usize != queued.payload.len()
                        || body.fragment_count != queued.fragment_count
                    {
                        return Err(CommandError);
                    }
                    return Ok(Some(i));
                }
            }
            Ok(None)
        };

        let mut group = find_group(self)?;
        if group.is_none() {
            let mut start_command = *command;
            start_command.reliable_seq = start_seq;
            let maximum_waiting_data = self.maximum_waiting_data;
            let outcome = self.peers[index].queue_incoming_command(
                &mut self.dispatch_queue,
                maximum_waiting_data,
                &start_command,
                IncomingData::Blank(body.total_length as usize),
                PacketFlags::RELIABLE,
                body.fragment_count,
            );
            if outcome != EnqueueOutcome::Queued {
                return Err(CommandError);
            }
            group = find_group(self)?;
        }
        let Some(group_index) = group else {
            return Err(CommandError);
        };

        let complete = {
            let channel = &mut self.peers[index].channels[channel_index];
            let start_command = &mut channel.incoming_reliable[group_index];
            merge_fragment(start_command, &body, &payload);
            start_command.fragments_remaining == 0
        };
        if complete {
            self.peers[index]
                .dispatch_incoming_reliable(&mut self.dispatch_queue, command.channel_id);
        }
        Ok(())
    }

    /// Locates or creates an unreliable fragment group and merges one
    /// fragment into it.
    fn handle_send_unreliable_fragment(
        &mut self,
        index: usize,
        command: &Command,
        body: FragmentBody,
        payload: Bytes,
    ) -> CommandResult {
        {
            let peer = &self.peers[index];
            if usize::from(command.channel_id) >= peer.channels.len()
                || !peer.state.is_connected()
            {
                return Err(CommandError);
            }
        }

        let channel_index = usize::from(command.channel_id);
        let reliable_seq = command.reliable_seq;
        let start_seq = body.start_seq;

        {
            let channel = &self.peers[index].channels[channel_index];
            if !channel.accepts_reliable(reliable_seq) {
                return Ok(());
            }
            if reliable_seq.0 == channel.incoming_reliable_seq.0
                && start_seq.0 <= channel.incoming_unreliable_seq.0
            {
                return Ok(());
            }
        }

        self.validate_fragment(&body, payload.len())?;

        let find_group = |host: &Self| -> Result<Option<usize>, CommandError> {
            let channel = &host.peers[index].channels[channel_index];
            let queue = &channel.incoming_unreliable;
            for i in (0..queue.len()).rev() {
                let queued = &queue[i];
                if reliable_seq.0 >= channel.incoming_reliable_seq.0 {
                    if queued.reliable_seq.0 < channel.incoming_reliable_seq.0 {
                        continue;
                    }
                } else if queued.reliable_seq.0 >= channel.incoming_reliable_seq.0 {
                    break;
                }

                if queued.reliable_seq.0 < reliable_seq.0 {
                    break;
                }
                if queued.reliable_seq.0 > reliable_seq.0 {
                    continue;
                }

                if queued.unreliable_seq.0 <= start_seq.0 {
                    if queued.unreliable_seq.0 < start_seq.0 {
                        break;
                    }
                    if queued.kind != CommandKind::SendUnreliableFragment
                        || body.total_length as usize != queued.payload.len()
                        || body.fragment_count != queued.fragment_count
                    {
                        return Err(CommandError);
                    }
                    return Ok(Some(i));
                }
            }
            Ok(None)
        };

        let mut group = find_group(self)?;
        if group.is_none() {
            let maximum_waiting_data = self.maximum_waiting_data;
            let outcome = self.peers[index].queue_incoming_command(
                &mut self.dispatch_queue,
                maximum_waiting_data,
                command,
                IncomingData::Blank(body.total_length as usize),
                PacketFlags::UNRELIABLE_FRAGMENT,
                body.fragment_count,
            );
            if outcome != EnqueueOutcome::Queued {
                return Err(CommandError);
            }
            group = find_group(self)?;
        }
        let Some(group_index) = group else {
            return Err(CommandError);
        };

        let complete = {
            let channel = &mut self.peers[index].channels[channel_index];
            let start_command = &mut channel.incoming_unreliable[group_index];
            merge_fragment(start_command, &body, &payload);
            start_command.fragments_remaining == 0
        };
        if complete {
            self.peers[index]
                .dispatch_incoming_unreliable(&mut self.dispatch_queue, command.channel_id);
        }
        Ok(())
    }

    /// Adopts the peer's advertised bandwidth limits and renegotiates the
    /// window size.
    fn handle_bandwidth_limit(
        &mut self,
        index: usize,
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    ) -> CommandResult {
        if !self.peers[index].state.is_connected() {
            return Err(CommandError);
        }

        let host_outgoing_bandwidth = self.outgoing_bandwidth;
        if self.peers[index].incoming_bandwidth != 0 {
            self.bandwidth_limited_peers -= 1;
        }
        let peer = &mut self.peers[index];
        peer.incoming_bandwidth = incoming_bandwidth;
        peer.outgoing_bandwidth = outgoing_bandwidth;
        if peer.incoming_bandwidth != 0 {
            self.bandwidth_limited_peers += 1;
        }

        let peer = &mut self.peers[index];
        peer.window_size = if peer.incoming_bandwidth == 0 && host_outgoing_bandwidth == 0 {
            MAXIMUM_WINDOW_SIZE
        } else if peer.incoming_bandwidth == 0 || host_outgoing_bandwidth == 0 {
            (peer.incoming_bandwidth.max(host_outgoing_bandwidth) / WINDOW_SIZE_SCALE)
                * MINIMUM_WINDOW_SIZE
        } else {
            (peer.incoming_bandwidth.min(host_outgoing_bandwidth) / WINDOW_SIZE_SCALE)
                * MINIMUM_WINDOW_SIZE
        };
        peer.window_size = peer
            .window_size
            .clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE);

        Ok(())
    }

    fn handle_throttle_configure(
        &mut self,
        index: usize,
        interval: u32,
        acceleration: u32,
        deceleration: u32,
    ) -> CommandResult {
        if !self.peers[index].state.is_connected() {
            return Err(CommandError);
        }
        let peer = &mut self.peers[index];
        peer.packet_throttle_interval = interval;
        peer.packet_throttle_acceleration = acceleration;
        peer.packet_throttle_deceleration = deceleration;
        Ok(())
    }
}

/// Copies one fragment into its group's reassembly buffer, if it has not
/// arrived before.
///
/// The group's total length is authoritative: a fragment claiming to extend
/// past it is trimmed.
fn merge_fragment(
    start_command: &mut crate::channel::IncomingCommand,
    body: &FragmentBody,
    payload: &Bytes,
) {
    let fragment_number = body.fragment_number as usize;
    let Some(fragments) = &mut start_command.fragments else {
        return;
    };
    if fragments[fragment_number] {
        return;
    }
    fragments.set(fragment_number, true);
    start_command.fragments_remaining -= 1;

    let IncomingPayload::Assembling { data, .. } = &mut start_command.payload else {
        return;
    };
    let offset = body.fragment_offset as usize;
    let mut length = payload.len();
    if offset + length > data.len() {
        length = data.len() - offset;
    }
    data[offset..offset + length].copy_from_slice(&payload[..length]);
}
