//! See [`Host`].

mod recv;
mod send;

use std::{collections::VecDeque, io, net::SocketAddr, time::Duration};

use tracing::{debug, trace};

use crate::{
    channel::Channel,
    compress::Compressor,
    packet::Packet,
    peer::{Peer, PeerId, PeerState, SendError, WINDOW_SIZE_SCALE},
    protocol::{
        Command, CommandBody, CommandFlags, ConnectBody, CONTROL_CHANNEL_ID,
        MAXIMUM_CHANNEL_COUNT, MAXIMUM_PEER_ID, MAXIMUM_WINDOW_SIZE, MINIMUM_CHANNEL_COUNT,
        MINIMUM_WINDOW_SIZE,
    },
    seq::Seq,
    time::{Clock, Timestamp},
};

use crate::io::DatagramIo;

/// How often the host redistributes bandwidth between its peers, in ms.
pub const BANDWIDTH_THROTTLE_INTERVAL: u32 = 1000;
/// Default per-peer MTU.
pub const DEFAULT_MTU: u32 = 1400;
/// Default cap on a single application packet.
pub const DEFAULT_MAXIMUM_PACKET_SIZE: usize = 32 * 1024 * 1024;
/// Default cap on payload bytes buffered per peer awaiting the application.
pub const DEFAULT_MAXIMUM_WAITING_DATA: usize = 32 * 1024 * 1024;

/// Checksum function slot: computes a 32-bit checksum over the given buffers
/// as if they were one contiguous byte string.
pub type ChecksumFn = fn(&[&[u8]]) -> u32;

/// What an intercept callback decided about a raw datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intercept {
    /// Hand the datagram to the protocol engine as usual.
    Pass,
    /// The callback consumed the datagram; the engine never sees it.
    Consume,
    /// Abort servicing with an error.
    Error,
}

/// Callback run on every received datagram before protocol parsing.
pub type InterceptFn = Box<dyn FnMut(SocketAddr, &[u8]) -> Intercept + Send>;

/// Something that happened on a connection, returned by
/// [`Host::service`] and [`Host::check_events`].
#[derive(Debug)]
pub enum Event {
    /// A connection completed its handshake.
    Connect {
        /// The connected peer.
        peer: PeerId,
        /// User data from the remote's connect request.
        data: u32,
    },
    /// A connection ended, by request, by force, or by timeout.
    Disconnect {
        /// The disconnected peer. Its slot is free again.
        peer: PeerId,
        /// User data from the remote's disconnect, or 0 on timeout.
        data: u32,
    },
    /// A message arrived.
    Receive {
        /// The sending peer.
        peer: PeerId,
        /// Channel the message was sent on.
        channel_id: u8,
        /// The reassembled message.
        packet: Packet,
    },
}

/// Configuration for a new [`Host`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Number of peer slots to allocate, at most
    /// [`MAXIMUM_PEER_ID`](crate::protocol::MAXIMUM_PEER_ID).
    pub peer_count: usize,
    /// Most channels allowed per incoming connection; 0 means the protocol
    /// maximum.
    pub channel_limit: usize,
    /// Downstream bandwidth in bytes/s; 0 means unlimited.
    pub incoming_bandwidth: u32,
    /// Upstream bandwidth in bytes/s; 0 means unlimited.
    pub outgoing_bandwidth: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            peer_count: 32,
            channel_limit: 0,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
        }
    }
}

/// Error when creating a [`Host`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NewHostError {
    /// More peer slots requested than peer IDs exist.
    #[error("too many peers ({0})")]
    TooManyPeers(usize),
}

/// Error when initiating a connection with [`Host::connect`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// Every peer slot is in use.
    #[error("no free peer slot")]
    NoFreePeers,
}

/// Fatal error while servicing a host.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The datagram transport failed.
    #[error("datagram transport")]
    Transport(#[from] io::Error),
    /// The intercept callback requested an abort.
    #[error("intercept callback failed")]
    Intercept,
}

/// The local endpoint of a set of connections: owns the socket, the peer
/// table, and all protocol state.
///
/// Drive it by calling [`Host::service`] regularly from one thread; all
/// other methods must be called from that same thread.
pub struct Host<S> {
    pub(crate) socket: S,
    pub(crate) peers: Vec<Peer>,
    pub(crate) channel_limit: usize,
    pub(crate) incoming_bandwidth: u32,
    pub(crate) outgoing_bandwidth: u32,
    pub(crate) bandwidth_throttle_epoch: Timestamp,
    pub(crate) recalculate_bandwidth_limits: bool,
    pub(crate) mtu: u32,
    /// Source of connect nonces; incremented per outgoing connection.
    pub(crate) random_seed: u32,
    pub(crate) clock: Clock,
    pub(crate) service_time: Timestamp,
    pub(crate) dispatch_queue: VecDeque<PeerId>,
    pub(crate) connected_peers: usize,
    pub(crate) bandwidth_limited_peers: usize,
    /// Most connections allowed from the same IP address.
    pub(crate) duplicate_peers: usize,
    pub(crate) maximum_packet_size: usize,
    pub(crate) maximum_waiting_data: usize,
    pub(crate) compressor: Option<Box<dyn Compressor + Send>>,
    pub(crate) checksum: Option<ChecksumFn>,
    pub(crate) intercept: Option<InterceptFn>,
    pub(crate) pending_event: Option<Event>,
    pub(crate) total_sent_data: u64,
    pub(crate) total_sent_packets: u64,
    pub(crate) total_received_data: u64,
    pub(crate) total_received_packets: u64,
}

impl<S: DatagramIo> Host<S> {
    /// Creates a host over an already bound datagram endpoint.
    pub fn new(socket: S, config: HostConfig) -> Result<Self, NewHostError> {
        if config.peer_count > usize::from(MAXIMUM_PEER_ID) {
            return Err(NewHostError::TooManyPeers(config.peer_count));
        }

        let channel_limit = clamp_channel_limit(config.channel_limit);
        let random_seed = rand::random::<u32>();

        let peers = (0..config.peer_count)
            .map(|index| Peer::new(PeerId(index as u16), DEFAULT_MTU))
            .collect();

        Ok(Self {
            socket,
            peers,
            channel_limit,
            incoming_bandwidth: config.incoming_bandwidth,
            outgoing_bandwidth: config.outgoing_bandwidth,
            bandwidth_throttle_epoch: Timestamp(0),
            recalculate_bandwidth_limits: false,
            mtu: DEFAULT_MTU,
            random_seed,
            clock: Clock::new(),
            service_time: Timestamp(0),
            dispatch_queue: VecDeque::new(),
            connected_peers: 0,
            bandwidth_limited_peers: 0,
            duplicate_peers: usize::from(MAXIMUM_PEER_ID),
            maximum_packet_size: DEFAULT_MAXIMUM_PACKET_SIZE,
            maximum_waiting_data: DEFAULT_MAXIMUM_WAITING_DATA,
            compressor: None,
            checksum: None,
            intercept: None,
            pending_event: None,
            total_sent_data: 0,
            total_sent_packets: 0,
            total_received_data: 0,
            total_received_packets: 0,
        })
    }

    /// Initiates a connection to `addr` with `channel_count` channels,
    /// carrying `data` to the remote's connect event.
    ///
    /// The connection is complete only once [`Host::service`] returns
    /// [`Event::Connect`] for the returned peer.
    pub fn connect(
        &mut self,
        addr: SocketAddr,
        channel_count: usize,
        data: u32,
    ) -> Result<PeerId, ConnectError> {
        let channel_count = channel_count.clamp(MINIMUM_CHANNEL_COUNT, MAXIMUM_CHANNEL_COUNT);

        let index = self
            .peers
            .iter()
            .position(|peer| peer.state == PeerState::Disconnected)
            .ok_or(ConnectError::NoFreePeers)?;

        let window_size = if self.outgoing_bandwidth == 0 {
            MAXIMUM_WINDOW_SIZE
        } else {
            (self.outgoing_bandwidth / WINDOW_SIZE_SCALE) * MINIMUM_WINDOW_SIZE
        };
        let window_size = window_size.clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE);

        self.random_seed = self.random_seed.wrapping_add(1);
        let connect_id = self.random_seed;

        let peer = &mut self.peers[index];
        peer.channels = (0..channel_count).map(|_| Channel::new()).collect();
        peer.state = PeerState::Connecting;
        peer.address = Some(addr);
        peer.connect_id = connect_id;
        peer.window_size = window_size;

        let command = Command {
            flags: CommandFlags::ACKNOWLEDGE,
            channel_id: CONTROL_CHANNEL_ID,
            reliable_seq: Seq(0),
            body: CommandBody::Connect(ConnectBody {
                outgoing_peer_id: peer.incoming_peer_id.0,
                incoming_session_id: peer.incoming_session_id,
                outgoing_session_id: peer.outgoing_session_id,
                mtu: peer.mtu,
                window_size: peer.window_size,
                channel_count: channel_count as u32,
                incoming_bandwidth: self.incoming_bandwidth,
                outgoing_bandwidth: self.outgoing_bandwidth,
                packet_throttle_interval: peer.packet_throttle_interval,
                packet_throttle_acceleration: peer.packet_throttle_acceleration,
                packet_throttle_deceleration: peer.packet_throttle_deceleration,
                connect_id,
                data,
            }),
        };
        peer.queue_outgoing_command(command, None, 0, 0);

        debug!(peer = index, %addr, "Connecting");
        Ok(PeerId(index as u16))
    }

    /// Queues `packet` for delivery to `peer` on `channel_id`.
    pub fn send(&mut self, peer: PeerId, channel_id: u8, packet: Packet) -> Result<(), SendError> {
        let checksum_enabled = self.checksum.is_some();
        let maximum_packet_size = self.maximum_packet_size;
        self.peers[usize::from(peer.0)].enqueue_packet(
            channel_id,
            packet,
            checksum_enabled,
            maximum_packet_size,
        )
    }

    /// Queues `packet` for delivery to every connected peer on `channel_id`.
    pub fn broadcast(&mut self, channel_id: u8, packet: &Packet) {
        let checksum_enabled = self.checksum.is_some();
        let maximum_packet_size = self.maximum_packet_size;
        for peer in &mut self.peers {
            if peer.state != PeerState::Connected {
                continue;
            }
            let _ = peer.enqueue_packet(
                channel_id,
                packet.clone(),
                checksum_enabled,
                maximum_packet_size,
            );
        }
    }

    /// Sends a ping to `peer` immediately, ahead of the keep-alive schedule.
    pub fn ping(&mut self, peer: PeerId) {
        self.peers[usize::from(peer.0)].queue_ping();
    }

    /// Reconfigures `peer`'s throttle parameters, locally and on the remote
    /// side.
    pub fn throttle_configure(
        &mut self,
        peer: PeerId,
        interval: u32,
        acceleration: u32,
        deceleration: u32,
    ) {
        let peer = &mut self.peers[usize::from(peer.0)];
        peer.packet_throttle_interval = interval;
        peer.packet_throttle_acceleration = acceleration;
        peer.packet_throttle_deceleration = deceleration;

        let command = Command {
            flags: CommandFlags::ACKNOWLEDGE,
            channel_id: CONTROL_CHANNEL_ID,
            reliable_seq: Seq(0),
            body: CommandBody::ThrottleConfigure {
                packet_throttle_interval: interval,
                packet_throttle_acceleration: acceleration,
                packet_throttle_deceleration: deceleration,
            },
        };
        peer.queue_outgoing_command(command, None, 0, 0);
    }

    /// Requests a graceful disconnect from `peer`; an [`Event::Disconnect`]
    /// follows once the remote acknowledges (or the connection times out).
    pub fn disconnect(&mut self, peer: PeerId, data: u32) {
        let index = usize::from(peer.0);
        if matches!(
            self.peers[index].state,
            PeerState::Disconnecting
                | PeerState::Disconnected
                | PeerState::AcknowledgingDisconnect
                | PeerState::Zombie
        ) {
            return;
        }

        self.reset_peer_queues(peer);

        let was_connected = self.peers[index].state.is_connected();
        let flags = if was_connected {
            CommandFlags::ACKNOWLEDGE
        } else {
            CommandFlags::UNSEQUENCED
        };
        let command = Command {
            flags,
            channel_id: CONTROL_CHANNEL_ID,
            reliable_seq: Seq(0),
            body: CommandBody::Disconnect { data },
        };
        self.peers[index].queue_outgoing_command(command, None, 0, 0);

        if was_connected {
            self.change_state(index, PeerState::Disconnecting);
        } else {
            self.flush();
            self.reset_peer(peer);
        }
    }

    /// Disconnects `peer` immediately. A best-effort notification is flushed
    /// to the remote, and no [`Event::Disconnect`] is generated locally.
    pub fn disconnect_now(&mut self, peer: PeerId, data: u32) {
        let index = usize::from(peer.0);
        if self.peers[index].state == PeerState::Disconnected {
            return;
        }

        if !matches!(
            self.peers[index].state,
            PeerState::Zombie | PeerState::Disconnecting
        ) {
            self.reset_peer_queues(peer);
            let command = Command {
                flags: CommandFlags::UNSEQUENCED,
                channel_id: CONTROL_CHANNEL_ID,
                reliable_seq: Seq(0),
                body: CommandBody::Disconnect { data },
            };
            self.peers[index].queue_outgoing_command(command, None, 0, 0);
            self.flush();
        }

        self.reset_peer(peer);
    }

    /// Requests a disconnect from `peer` once all queued outgoing packets
    /// have been delivered.
    pub fn disconnect_later(&mut self, peer: PeerId, data: u32) {
        let index = usize::from(peer.0);
        let draining = {
            let peer = &self.peers[index];
            peer.state.is_connected()
                && !(peer.outgoing_reliable.is_empty()
                    && peer.outgoing_unreliable.is_empty()
                    && peer.sent_reliable.is_empty())
        };
        if draining {
            self.peers[index].state = PeerState::DisconnectLater;
            self.peers[index].event_data = data;
        } else {
            self.disconnect(peer, data);
        }
    }

    /// Tears down `peer` without notifying the remote side, which will time
    /// out on its end. All queued packets are dropped.
    pub fn reset_peer(&mut self, peer: PeerId) {
        let index = usize::from(peer.0);
        if self.peers[index].state.is_connected() {
            self.connected_peers -= 1;
            if self.peers[index].incoming_bandwidth != 0 {
                self.bandwidth_limited_peers -= 1;
            }
        }
        if self.peers[index].needs_dispatch {
            self.dispatch_queue.retain(|id| *id != peer);
            self.peers[index].needs_dispatch = false;
        }
        let mtu = self.mtu;
        self.peers[index].reset(mtu);
    }

    /// Drops `peer`'s queues and removes it from the dispatch queue, without
    /// touching connection state.
    pub(crate) fn reset_peer_queues(&mut self, peer: PeerId) {
        let index = usize::from(peer.0);
        if self.peers[index].needs_dispatch {
            self.dispatch_queue.retain(|id| *id != peer);
            self.peers[index].needs_dispatch = false;
        }
        self.peers[index].reset_queues();
    }

    /// Gets a peer by ID.
    #[must_use]
    pub fn peer(&self, peer: PeerId) -> &Peer {
        &self.peers[usize::from(peer.0)]
    }

    /// Gets a peer by ID, mutably (for [`Peer::receive`] and the per-peer
    /// setters).
    pub fn peer_mut(&mut self, peer: PeerId) -> &mut Peer {
        &mut self.peers[usize::from(peer.0)]
    }

    /// Iterates over all peer slots.
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    /// Installs or removes the compressor applied to outgoing datagrams.
    pub fn compress(&mut self, compressor: Option<Box<dyn Compressor + Send>>) {
        self.compressor = compressor;
    }

    /// Installs or removes the datagram checksum function.
    ///
    /// [`crate::crc32::checksum_slices`] is the standard choice. Both sides
    /// of a connection must agree.
    pub fn set_checksum(&mut self, checksum: Option<ChecksumFn>) {
        self.checksum = checksum;
    }

    /// Installs or removes a raw-datagram intercept callback.
    pub fn set_intercept(&mut self, intercept: Option<InterceptFn>) {
        self.intercept = intercept;
    }

    /// Limits the channel count granted to future incoming connections;
    /// 0 restores the protocol maximum.
    pub fn channel_limit(&mut self, channel_limit: usize) {
        self.channel_limit = clamp_channel_limit(channel_limit);
    }

    /// Adjusts the host bandwidth limits, in bytes/s; 0 means unlimited.
    pub fn bandwidth_limit(&mut self, incoming: u32, outgoing: u32) {
        self.incoming_bandwidth = incoming;
        self.outgoing_bandwidth = outgoing;
        self.recalculate_bandwidth_limits = true;
    }

    /// Re-bases the host clock so that "now" reads as `time`.
    pub fn set_time(&mut self, time: Timestamp) {
        self.clock.set(time);
    }

    /// Gets the underlying datagram endpoint.
    pub const fn socket(&self) -> &S {
        &self.socket
    }

    /// Gets the underlying datagram endpoint, mutably.
    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    /// Gets the number of peers with fully established connections.
    #[must_use]
    pub const fn connected_peers(&self) -> usize {
        self.connected_peers
    }

    /// Gets total bytes ever sent by this host.
    #[must_use]
    pub const fn total_sent_data(&self) -> u64 {
        self.total_sent_data
    }

    /// Gets total datagrams ever sent by this host.
    #[must_use]
    pub const fn total_sent_packets(&self) -> u64 {
        self.total_sent_packets
    }

    /// Gets total bytes ever received by this host.
    #[must_use]
    pub const fn total_received_data(&self) -> u64 {
        self.total_received_data
    }

    /// Gets total datagrams ever received by this host.
    #[must_use]
    pub const fn total_received_packets(&self) -> u64 {
        self.total_received_packets
    }

    /// Checks for a queued event without doing any network work.
    pub fn check_events(&mut self) -> Option<Event> {
        self.dispatch_incoming_commands()
    }

    /// Sends any queued commands immediately, without receiving or
    /// dispatching events.
    ///
    /// Only needed to push traffic out earlier than the next
    /// [`Host::service`] call; transport errors are deferred to the next
    /// service.
    pub fn flush(&mut self) {
        self.service_time = self.clock.now();
        if let Err(err) = self.send_outgoing_commands(false, false) {
            trace!("Flush failed: {err}");
        }
    }

    /// Shuttles traffic between this host and its peers, waiting up to
    /// `timeout` ms for something to happen.
    ///
    /// Returns the next event, or `None` if the timeout expired quietly.
    /// Call this regularly; all protocol timers run off it.
    pub fn service(&mut self, timeout: u32) -> Result<Option<Event>, ServiceError> {
        self.pending_event = None;
        if let Some(event) = self.dispatch_incoming_commands() {
            return Ok(Some(event));
        }

        self.service_time = self.clock.now();
        let deadline = self.service_time.plus(timeout);

        loop {
            if self
                .service_time
                .difference(self.bandwidth_throttle_epoch)
                >= BANDWIDTH_THROTTLE_INTERVAL
            {
                self.bandwidth_throttle();
            }

            if self.send_outgoing_commands(true, true)? {
                return Ok(self.pending_event.take());
            }
            if self.receive_incoming_commands()? {
                return Ok(self.pending_event.take());
            }
            if self.send_outgoing_commands(true, true)? {
                return Ok(self.pending_event.take());
            }
            if let Some(event) = self.dispatch_incoming_commands() {
                return Ok(Some(event));
            }

            if self.service_time.at_or_after(deadline) {
                return Ok(None);
            }

            self.service_time = self.clock.now();
            if self.service_time.at_or_after(deadline) {
                return Ok(None);
            }

            let wait = Duration::from_millis(u64::from(deadline.difference(self.service_time)));
            if !self.socket.wait(wait)? {
                return Ok(None);
            }

            self.service_time = self.clock.now();
        }
    }

    /// Drains the dispatch queue into at most one application event.
    pub(crate) fn dispatch_incoming_commands(&mut self) -> Option<Event> {
        while let Some(peer_id) = self.dispatch_queue.pop_front() {
            let index = usize::from(peer_id.0);
            self.peers[index].needs_dispatch = false;

            match self.peers[index].state {
                PeerState::ConnectionPending | PeerState::ConnectionSucceeded => {
                    self.change_state(index, PeerState::Connected);
                    let data = self.peers[index].event_data;
                    debug!(peer = index, "Connected");
                    return Some(Event::Connect {
                        peer: peer_id,
                        data,
                    });
                }
                PeerState::Zombie => {
                    self.recalculate_bandwidth_limits = true;
                    let data = self.peers[index].event_data;
                    self.reset_peer(peer_id);
                    debug!(peer = index, "Disconnected");
                    return Some(Event::Disconnect {
                        peer: peer_id,
                        data,
                    });
                }
                PeerState::Connected => {
                    let peer = &mut self.peers[index];
                    let Some((channel_id, packet)) = peer.receive() else {
                        continue;
                    };
                    if !peer.dispatched.is_empty() {
                        peer.needs_dispatch = true;
                        self.dispatch_queue.push_back(peer_id);
                    }
                    return Some(Event::Receive {
                        peer: peer_id,
                        channel_id,
                        packet,
                    });
                }
                _ => {}
            }
        }
        None
    }

    /// Adjusts peer connectedness counters and sets the new state.
    pub(crate) fn change_state(&mut self, index: usize, state: PeerState) {
        let was_connected = self.peers[index].state.is_connected();
        let now_connected = state.is_connected();
        if now_connected && !was_connected {
            if self.peers[index].incoming_bandwidth != 0 {
                self.bandwidth_limited_peers += 1;
            }
            self.connected_peers += 1;
        } else if !now_connected && was_connected {
            if self.peers[index].incoming_bandwidth != 0 {
                self.bandwidth_limited_peers -= 1;
            }
            self.connected_peers -= 1;
        }
        self.peers[index].state = state;
    }

    /// Changes state and queues the peer for event dispatch.
    pub(crate) fn dispatch_state(&mut self, index: usize, state: PeerState) {
        self.change_state(index, state);
        if !self.peers[index].needs_dispatch {
            self.dispatch_queue.push_back(PeerId(index as u16));
            self.peers[index].needs_dispatch = true;
        }
    }

    /// Completes a handshake: either hands the connect event to the caller
    /// directly, or queues the peer for dispatch.
    pub(crate) fn notify_connect(&mut self, index: usize, with_events: bool) {
        self.recalculate_bandwidth_limits = true;
        if with_events {
            self.change_state(index, PeerState::Connected);
            self.pending_event = Some(Event::Connect {
                peer: PeerId(index as u16),
                data: self.peers[index].event_data,
            });
        } else {
            let state = if self.peers[index].state == PeerState::Connecting {
                PeerState::ConnectionSucceeded
            } else {
                PeerState::ConnectionPending
            };
            self.dispatch_state(index, state);
        }
    }

    /// Ends a connection: silently for half-open handshakes, as a direct
    /// event when the caller can take one, or via the dispatch queue.
    pub(crate) fn notify_disconnect(&mut self, index: usize, with_events: bool) {
        let state = self.peers[index].state;
        if state >= PeerState::ConnectionPending {
            self.recalculate_bandwidth_limits = true;
        }

        if state != PeerState::Connecting && state < PeerState::ConnectionSucceeded {
            self.reset_peer(PeerId(index as u16));
        } else if with_events {
            self.pending_event = Some(Event::Disconnect {
                peer: PeerId(index as u16),
                data: 0,
            });
            self.reset_peer(PeerId(index as u16));
        } else {
            self.peers[index].event_data = 0;
            self.dispatch_state(index, PeerState::Zombie);
        }
    }

    /// Redistributes outgoing bandwidth between peers and recalculates
    /// per-peer throttle limits.
    ///
    /// When `outgoing_bandwidth` is 0 (unlimited), the budget saturates at
    /// `u32::MAX`, so every peer's throttle limit resets to full scale each
    /// interval; this is the unlimited path behaving as designed, not a
    /// bypass.
    pub(crate) fn bandwidth_throttle(&mut self) {
        let time_current = self.clock.now();
        let elapsed = time_current.0.wrapping_sub(self.bandwidth_throttle_epoch.0);

        if elapsed < BANDWIDTH_THROTTLE_INTERVAL {
            return;
        }
        self.bandwidth_throttle_epoch = time_current;

        let mut peers_remaining = self.connected_peers as u32;
        if peers_remaining == 0 {
            return;
        }

        let mut data_total = u32::MAX;
        let mut bandwidth = u32::MAX;
        let mut throttle;
        let mut bandwidth_limit = 0;
        let mut needs_adjustment = self.bandwidth_limited_peers > 0;

        if self.outgoing_bandwidth != 0 {
            data_total = 0;
            bandwidth = (self.outgoing_bandwidth.wrapping_mul(elapsed)) / 1000;
            for peer in &self.peers {
                if !peer.state.is_connected() {
                    continue;
                }
                data_total = data_total.wrapping_add(peer.outgoing_data_total);
            }
        }

        while peers_remaining > 0 && needs_adjustment {
            needs_adjustment = false;
            throttle = if data_total <= bandwidth {
                crate::peer::PACKET_THROTTLE_SCALE
            } else {
                (bandwidth.wrapping_mul(crate::peer::PACKET_THROTTLE_SCALE)) / data_total
            };

            for peer in &mut self.peers {
                if !peer.state.is_connected()
                    || peer.incoming_bandwidth == 0
                    || peer.outgoing_bandwidth_throttle_epoch == time_current
                {
                    continue;
                }

                let peer_bandwidth = (peer.incoming_bandwidth.wrapping_mul(elapsed)) / 1000;
                if (throttle.wrapping_mul(peer.outgoing_data_total))
                    / crate::peer::PACKET_THROTTLE_SCALE
                    <= peer_bandwidth
                {
                    continue;
                }

                peer.packet_throttle_limit = ((peer_bandwidth
                    .wrapping_mul(crate::peer::PACKET_THROTTLE_SCALE))
                    / peer.outgoing_data_total)
                    .max(1);
                if peer.packet_throttle > peer.packet_throttle_limit {
                    peer.packet_throttle = peer.packet_throttle_limit;
                }

                peer.outgoing_bandwidth_throttle_epoch = time_current;
                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;

                needs_adjustment = true;
                peers_remaining -= 1;
                bandwidth = bandwidth.wrapping_sub(peer_bandwidth);
                data_total = data_total.wrapping_sub(peer_bandwidth);
            }
        }

        if peers_remaining > 0 {
            throttle = if data_total <= bandwidth {
                crate::peer::PACKET_THROTTLE_SCALE
            } else {
                (bandwidth.wrapping_mul(crate::peer::PACKET_THROTTLE_SCALE)) / data_total
            };
            for peer in &mut self.peers {
                if !peer.state.is_connected()
                    || peer.outgoing_bandwidth_throttle_epoch == time_current
                {
                    continue;
                }
                peer.packet_throttle_limit = throttle;
                if peer.packet_throttle > peer.packet_throttle_limit {
                    peer.packet_throttle = peer.packet_throttle_limit;
                }
                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;
            }
        }

        if self.recalculate_bandwidth_limits {
            self.recalculate_bandwidth_limits = false;

            let mut peers_remaining = self.connected_peers as u32;
            let mut bandwidth = self.incoming_bandwidth;
            let mut needs_adjustment = true;

            if bandwidth == 0 {
                bandwidth_limit = 0;
            } else {
                while peers_remaining > 0 && needs_adjustment {
                    needs_adjustment = false;
                    bandwidth_limit = bandwidth / peers_remaining;
                    for peer in &mut self.peers {
                        if !peer.state.is_connected()
                            || peer.incoming_bandwidth_throttle_epoch == time_current
                        {
                            continue;
                        }
                        if peer.outgoing_bandwidth > 0
                            && peer.outgoing_bandwidth >= bandwidth_limit
                        {
                            continue;
                        }
                        peer.incoming_bandwidth_throttle_epoch = time_current;
                        needs_adjustment = true;
                        peers_remaining -= 1;
                        bandwidth = bandwidth.wrapping_sub(peer.outgoing_bandwidth);
                    }
                }
            }

            for index in 0..self.peers.len() {
                let peer = &mut self.peers[index];
                if !peer.state.is_connected() {
                    continue;
                }
                let incoming = if peer.incoming_bandwidth_throttle_epoch == time_current {
                    peer.outgoing_bandwidth
                } else {
                    bandwidth_limit
                };
                let command = Command {
                    flags: CommandFlags::ACKNOWLEDGE,
                    channel_id: CONTROL_CHANNEL_ID,
                    reliable_seq: Seq(0),
                    body: CommandBody::BandwidthLimit {
                        incoming_bandwidth: incoming,
                        outgoing_bandwidth: self.outgoing_bandwidth,
                    },
                };
                peer.queue_outgoing_command(command, None, 0, 0);
            }
        }
    }
}

fn clamp_channel_limit(channel_limit: usize) -> usize {
    if channel_limit == 0 || channel_limit > MAXIMUM_CHANNEL_COUNT {
        MAXIMUM_CHANNEL_COUNT
    } else {
        channel_limit.max(MINIMUM_CHANNEL_COUNT)
    }
}

#[cfg(test)]
mod tests {
    use crate::loopback::LoopbackIo;

    use super::*;

    type TestHost = Host<LoopbackIo>;

    fn pair(config: HostConfig) -> (TestHost, TestHost, SocketAddr) {
        let (io_a, io_b) = LoopbackIo::pair();
        let b_addr = io_b.local_addr().expect("loopback addr");
        let a = Host::new(io_a, config.clone()).expect("host a");
        let b = Host::new(io_b, config).expect("host b");
        (a, b, b_addr)
    }

    fn warp(a: &mut TestHost, b: &mut TestHost, now: Timestamp) {
        a.set_time(now);
        b.set_time(now);
    }

    /// Services both hosts until traffic stops flowing and neither produces
    /// an event, collecting everything produced.
    fn pump(a: &mut TestHost, b: &mut TestHost) -> (Vec<Event>, Vec<Event>) {
        let mut events_a = Vec::new();
        let mut events_b = Vec::new();
        loop {
            let before = a.total_sent_packets() + b.total_sent_packets();
            let mut progressed = false;
            while let Some(event) = a.service(0).expect("service a") {
                events_a.push(event);
                progressed = true;
            }
            while let Some(event) = b.service(0).expect("service b") {
                events_b.push(event);
                progressed = true;
            }
            if !progressed && a.total_sent_packets() + b.total_sent_packets() == before {
                return (events_a, events_b);
            }
        }
    }

    fn establish(a: &mut TestHost, b: &mut TestHost, b_addr: SocketAddr) -> (PeerId, PeerId) {
        let peer_at_a = a.connect(b_addr, 2, 7).expect("connect");
        let (events_a, events_b) = pump(a, b);
        let connected_a = events_a
            .iter()
            .any(|event| matches!(event, Event::Connect { peer, .. } if *peer == peer_at_a));
        assert!(connected_a, "connector saw no connect event: {events_a:?}");
        let peer_at_b = events_b
            .iter()
            .find_map(|event| match event {
                Event::Connect { peer, data } => {
                    assert_eq!(7, *data);
                    Some(*peer)
                }
                _ => None,
            })
            .expect("acceptor saw no connect event");
        (peer_at_a, peer_at_b)
    }

    #[test]
    fn handshake_agrees_on_identity() {
        let (mut a, mut b, b_addr) = pair(HostConfig::default());
        let (peer_at_a, peer_at_b) = establish(&mut a, &mut b, b_addr);

        let pa = a.peer(peer_at_a);
        let pb = b.peer(peer_at_b);
        assert_eq!(pa.connect_id(), pb.connect_id());
        assert_eq!(pa.outgoing_peer_id(), peer_at_b.0);
        assert_eq!(pb.outgoing_peer_id(), peer_at_a.0);
        assert_eq!(pa.incoming_session_id, pb.outgoing_session_id);
        assert_eq!(pa.outgoing_session_id, pb.incoming_session_id);
        assert_eq!(2, pa.channel_count());
        assert_eq!(2, pb.channel_count());
        assert_eq!(1, a.connected_peers());
        assert_eq!(1, b.connected_peers());
    }

    #[test]
    fn reliable_sequence_numbers_wrap() {
        let (mut a, mut b, b_addr) = pair(HostConfig::default());
        let (peer_at_a, peer_at_b) = establish(&mut a, &mut b, b_addr);

        // park both sides just below the 16-bit wrap
        a.peers[usize::from(peer_at_a.0)].channels[0].outgoing_reliable_seq = Seq(65500);
        b.peers[usize::from(peer_at_b.0)].channels[0].incoming_reliable_seq = Seq(65500);

        for i in 0..100u32 {
            a.send(peer_at_a, 0, crate::packet::Packet::reliable(i.to_be_bytes().to_vec()))
                .expect("send");
        }
        let (_, events_b) = pump(&mut a, &mut b);
        let received = events_b
            .iter()
            .filter_map(|event| match event {
                Event::Receive { packet, .. } => {
                    Some(u32::from_be_bytes(packet.data[..4].try_into().expect("4 bytes")))
                }
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!((0..100).collect::<Vec<_>>(), received);
    }

    #[test]
    fn throttle_at_half_scale_drops_about_half() {
        let (mut a, mut b, b_addr) = pair(HostConfig::default());
        let (peer_at_a, peer_at_b) = establish(&mut a, &mut b, b_addr);

        // pin the throttle halfway open; the cleared statistics keep the
        // adaptation snapping back to the limit
        a.peer_mut(peer_at_a).set_packet_throttle(16, 16);

        let total = 400u32;
        for i in 0..total {
            let mut data = vec![0u8; 100];
            data[..4].copy_from_slice(&i.to_be_bytes());
            a.send(peer_at_a, 0, crate::packet::Packet::unreliable(data))
                .expect("send");
        }
        let (_, events_b) = pump(&mut a, &mut b);
        let received = events_b
            .iter()
            .filter_map(|event| match event {
                Event::Receive { packet, .. } => {
                    Some(u32::from_be_bytes(packet.data[..4].try_into().expect("4 bytes")))
                }
                _ => None,
            })
            .collect::<Vec<_>>();

        let delivered = received.len() as u32;
        assert!(
            delivered > total / 4 && delivered < total * 3 / 4,
            "{delivered} of {total} delivered"
        );
        // survivors arrive in submission order
        assert!(received.windows(2).all(|pair| pair[0] < pair[1]));
        let _ = peer_at_b;
    }

    #[test]
    fn throttle_configure_propagates_to_remote() {
        let (mut a, mut b, b_addr) = pair(HostConfig::default());
        let (peer_at_a, peer_at_b) = establish(&mut a, &mut b, b_addr);

        a.throttle_configure(peer_at_a, 3000, 4, 4);
        pump(&mut a, &mut b);

        let remote = b.peer(peer_at_b);
        assert_eq!(3000, remote.packet_throttle_interval);
        assert_eq!(4, remote.packet_throttle_acceleration);
        assert_eq!(4, remote.packet_throttle_deceleration);
    }

    #[test]
    fn bandwidth_limit_exchanged_after_throttle_interval() {
        let (mut a, mut b, b_addr) = pair(HostConfig::default());
        let (peer_at_a, peer_at_b) = establish(&mut a, &mut b, b_addr);

        a.bandwidth_limit(100_000, 50_000);
        warp(&mut a, &mut b, Timestamp(2000));
        pump(&mut a, &mut b);
        warp(&mut a, &mut b, Timestamp(4000));
        pump(&mut a, &mut b);

        // the remote's view of us carries our advertised limits
        assert_eq!(50_000, b.peer(peer_at_b).outgoing_bandwidth);
        let _ = peer_at_a;
    }

    #[test]
    fn intercept_can_swallow_datagrams() {
        let (mut a, mut b, b_addr) = pair(HostConfig::default());
        b.set_intercept(Some(Box::new(|_, _| Intercept::Consume)));

        a.connect(b_addr, 1, 0).expect("connect");
        let (events_a, events_b) = pump(&mut a, &mut b);
        // the engine never saw the CONNECT, so no handshake happened
        assert!(events_a.is_empty());
        assert!(events_b.is_empty());
        assert_eq!(0, b.connected_peers());
        assert!(b.total_received_packets() > 0);
    }

    #[test]
    fn disconnect_now_emits_no_local_event() {
        let (mut a, mut b, b_addr) = pair(HostConfig::default());
        let (peer_at_a, peer_at_b) = establish(&mut a, &mut b, b_addr);

        a.disconnect_now(peer_at_a, 99);
        assert_eq!(PeerState::Disconnected, a.peer(peer_at_a).state());

        let (events_a, events_b) = pump(&mut a, &mut b);
        assert!(events_a.is_empty());
        let remote = events_b
            .iter()
            .find_map(|event| match event {
                Event::Disconnect { peer, data } => Some((*peer, *data)),
                _ => None,
            })
            .expect("remote saw no disconnect");
        assert_eq!((peer_at_b, 99), remote);
    }

    #[test]
    fn disconnect_later_drains_queued_packets_first() {
        let (mut a, mut b, b_addr) = pair(HostConfig::default());
        let (peer_at_a, peer_at_b) = establish(&mut a, &mut b, b_addr);

        for i in 0..10u32 {
            a.send(peer_at_a, 1, crate::packet::Packet::reliable(i.to_be_bytes().to_vec()))
                .expect("send");
        }
        a.disconnect_later(peer_at_a, 5);

        let (events_a, events_b) = pump(&mut a, &mut b);
        let received = events_b
            .iter()
            .filter(|event| matches!(event, Event::Receive { .. }))
            .count();
        assert_eq!(10, received);
        assert!(events_b
            .iter()
            .any(|event| matches!(event, Event::Disconnect { data: 5, .. })));
        assert!(events_a
            .iter()
            .any(|event| matches!(event, Event::Disconnect { .. })));
        let _ = peer_at_b;
    }
}
