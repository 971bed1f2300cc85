//! See [`Peer`].

mod incoming;
mod outgoing;

pub use outgoing::SendError;

pub(crate) use incoming::{EnqueueOutcome, IncomingData};

use std::{collections::VecDeque, net::SocketAddr};

use bitvec::{array::BitArray, order::Lsb0};
use bytes::Bytes;

use crate::{
    channel::{Channel, IncomingCommand},
    packet::Packet,
    protocol::{Command, CommandKind, MAXIMUM_PEER_ID, MAXIMUM_WINDOW_SIZE},
    seq::Seq,
    time::Timestamp,
};

/// Index of a peer in its [`Host`](crate::host::Host)'s peer table.
///
/// Stable for the lifetime of the host; a slot is reused for new connections
/// after its peer fully disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub u16);

/// Default smoothed RTT before any sample has arrived, in ms.
pub const DEFAULT_ROUND_TRIP_TIME: u32 = 500;
/// Default throttle value (fully open).
pub const DEFAULT_PACKET_THROTTLE: u32 = 32;
/// Throttle probability scale: a throttle of this value sends 100% of
/// unreliable packets.
pub const PACKET_THROTTLE_SCALE: u32 = 32;
/// Step added to the throttle counter per unreliable packet considered.
pub const PACKET_THROTTLE_COUNTER: u32 = 7;
/// Default throttle acceleration.
pub const PACKET_THROTTLE_ACCELERATION: u32 = 2;
/// Default throttle deceleration.
pub const PACKET_THROTTLE_DECELERATION: u32 = 2;
/// Default throttle measurement interval, ms.
pub const PACKET_THROTTLE_INTERVAL: u32 = 5000;
/// Fixed-point scale of packet-loss statistics.
pub const PACKET_LOSS_SCALE: u32 = 1 << 16;
/// Packet-loss sampling interval, ms.
pub const PACKET_LOSS_INTERVAL: u32 = 10_000;
/// Bandwidth (bytes/s) granted per [`MINIMUM_WINDOW_SIZE`] bytes of window
/// during window-size negotiation.
///
/// [`MINIMUM_WINDOW_SIZE`]: crate::protocol::MINIMUM_WINDOW_SIZE
pub const WINDOW_SIZE_SCALE: u32 = 64 * 1024;
/// Default number of initial RTOs a reliable command may back off through
/// before the peer is considered timed out.
pub const TIMEOUT_LIMIT: u32 = 32;
/// Default minimum time with unacknowledged traffic before a backed-off
/// command disconnects the peer, ms.
pub const TIMEOUT_MINIMUM: u32 = 5000;
/// Default time with unacknowledged traffic after which the peer is
/// disconnected regardless of backoff, ms.
pub const TIMEOUT_MAXIMUM: u32 = 30_000;
/// Default keep-alive interval, ms.
pub const PING_INTERVAL: u32 = 500;

/// Words of the unsequenced-group receive bitmap.
const UNSEQUENCED_WINDOW_WORDS: usize = 32;

/// Connection state of a [`Peer`].
///
/// The variant order mirrors a connection's lifecycle; state-machine code
/// relies on the derived ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeerState {
    /// Slot is free.
    #[default]
    Disconnected,
    /// We sent CONNECT and are waiting for VERIFY_CONNECT.
    Connecting,
    /// We received CONNECT and queued VERIFY_CONNECT.
    AcknowledgingConnect,
    /// Our VERIFY_CONNECT was acknowledged; the connect event is waiting to
    /// be dispatched.
    ConnectionPending,
    /// We received VERIFY_CONNECT; the connect event is waiting to be
    /// dispatched.
    ConnectionSucceeded,
    /// Fully connected.
    Connected,
    /// Disconnect requested, draining queued traffic first.
    DisconnectLater,
    /// We sent DISCONNECT and are waiting for its acknowledgement.
    Disconnecting,
    /// We received DISCONNECT and are acknowledging it.
    AcknowledgingDisconnect,
    /// Dead; the disconnect event is waiting to be dispatched.
    Zombie,
}

impl PeerState {
    /// Gets whether the peer counts as connected for host bookkeeping.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::DisconnectLater)
    }
}

/// A command queued for (re)transmission.
#[derive(Debug, Clone)]
pub(crate) struct OutgoingCommand {
    pub command: Command,
    /// Payload slice carried by this command; fragments of one packet share
    /// the packet's underlying allocation.
    pub payload: Option<Bytes>,
    pub fragment_offset: u32,
    pub fragment_length: u16,
    pub reliable_seq: Seq,
    pub unreliable_seq: Seq,
    pub sent_time: Timestamp,
    pub send_attempts: u16,
    /// Per-command retransmission timeout, doubled on every loss; 0 until
    /// first sent.
    pub rto: u32,
    /// Ceiling on `rto` after which the timeout logic may give up.
    pub rto_limit: u32,
}

/// A queued acknowledgement waiting to be put on the wire.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Acknowledgement {
    pub kind: CommandKind,
    pub channel_id: u8,
    pub reliable_seq: Seq,
    /// The sender's 16-bit timestamp, echoed back.
    pub sent_time: u16,
}

/// State for one remote endpoint of a [`Host`](crate::host::Host).
///
/// All mutation happens through `Host` methods; a `Peer` is addressed by its
/// [`PeerId`] and exposes read-only statistics plus [`Peer::receive`].
#[derive(Debug)]
pub struct Peer {
    // identity
    pub(crate) incoming_peer_id: PeerId,
    /// Our ID in the remote host's peer table; `MAXIMUM_PEER_ID` until the
    /// handshake teaches us otherwise.
    pub(crate) outgoing_peer_id: u16,
    pub(crate) incoming_session_id: u8,
    pub(crate) outgoing_session_id: u8,
    pub(crate) connect_id: u32,
    pub(crate) address: Option<SocketAddr>,
    pub(crate) state: PeerState,
    pub(crate) channels: Vec<Channel>,
    /// User data carried on the next connect/disconnect event.
    pub(crate) event_data: u32,

    // bandwidth
    pub(crate) incoming_bandwidth: u32,
    pub(crate) outgoing_bandwidth: u32,
    pub(crate) incoming_bandwidth_throttle_epoch: Timestamp,
    pub(crate) outgoing_bandwidth_throttle_epoch: Timestamp,
    pub(crate) incoming_data_total: u32,
    pub(crate) outgoing_data_total: u32,

    // liveness
    pub(crate) last_send_time: Timestamp,
    pub(crate) last_receive_time: Timestamp,
    /// Deadline of the earliest-expiring sent reliable command; `0` when
    /// nothing is in flight.
    pub(crate) next_timeout: Timestamp,
    /// Send time of the oldest unacknowledged command; `0` when clear.
    pub(crate) earliest_timeout: Timestamp,

    // packet loss
    pub(crate) packet_loss_epoch: Timestamp,
    pub(crate) packets_sent: u32,
    pub(crate) packets_lost: u32,
    pub(crate) packet_loss: u32,
    pub(crate) packet_loss_variance: u32,

    // throttle
    pub(crate) packet_throttle: u32,
    pub(crate) packet_throttle_limit: u32,
    pub(crate) packet_throttle_counter: u32,
    pub(crate) packet_throttle_epoch: Timestamp,
    pub(crate) packet_throttle_acceleration: u32,
    pub(crate) packet_throttle_deceleration: u32,
    pub(crate) packet_throttle_interval: u32,

    // timeouts & pings
    pub(crate) ping_interval: u32,
    pub(crate) timeout_limit: u32,
    pub(crate) timeout_minimum: u32,
    pub(crate) timeout_maximum: u32,

    // round-trip time
    pub(crate) last_round_trip_time: u32,
    pub(crate) lowest_round_trip_time: u32,
    pub(crate) last_round_trip_time_variance: u32,
    pub(crate) highest_round_trip_time_variance: u32,
    pub(crate) round_trip_time: u32,
    pub(crate) round_trip_time_variance: u32,

    // windows
    pub(crate) mtu: u32,
    pub(crate) window_size: u32,
    pub(crate) reliable_data_in_transit: u32,
    /// Reliable sequence numbering for the peer-global control channel.
    pub(crate) outgoing_reliable_seq: Seq,
    pub(crate) incoming_unsequenced_group: u16,
    pub(crate) outgoing_unsequenced_group: u16,
    pub(crate) unsequenced_window: BitArray<[u32; UNSEQUENCED_WINDOW_WORDS], Lsb0>,

    // queues
    pub(crate) acknowledgements: VecDeque<Acknowledgement>,
    pub(crate) sent_reliable: VecDeque<OutgoingCommand>,
    pub(crate) sent_unreliable: VecDeque<OutgoingCommand>,
    pub(crate) outgoing_reliable: VecDeque<OutgoingCommand>,
    pub(crate) outgoing_unreliable: VecDeque<OutgoingCommand>,
    pub(crate) dispatched: VecDeque<IncomingCommand>,
    pub(crate) needs_dispatch: bool,

    /// Bytes of packet payload sitting in this peer's dispatch and channel
    /// queues, waiting for the application.
    pub(crate) total_waiting_data: usize,
}

impl Peer {
    pub(crate) fn new(incoming_peer_id: PeerId, host_mtu: u32) -> Self {
        let mut peer = Self {
            incoming_peer_id,
            outgoing_peer_id: MAXIMUM_PEER_ID,
            incoming_session_id: crate::protocol::SESSION_UNASSIGNED,
            outgoing_session_id: crate::protocol::SESSION_UNASSIGNED,
            connect_id: 0,
            address: None,
            state: PeerState::Disconnected,
            channels: Vec::new(),
            event_data: 0,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            incoming_bandwidth_throttle_epoch: Timestamp(0),
            outgoing_bandwidth_throttle_epoch: Timestamp(0),
            incoming_data_total: 0,
            outgoing_data_total: 0,
            last_send_time: Timestamp(0),
            last_receive_time: Timestamp(0),
            next_timeout: Timestamp(0),
            earliest_timeout: Timestamp(0),
            packet_loss_epoch: Timestamp(0),
            packets_sent: 0,
            packets_lost: 0,
            packet_loss: 0,
            packet_loss_variance: 0,
            packet_throttle: DEFAULT_PACKET_THROTTLE,
            packet_throttle_limit: PACKET_THROTTLE_SCALE,
            packet_throttle_counter: 0,
            packet_throttle_epoch: Timestamp(0),
            packet_throttle_acceleration: PACKET_THROTTLE_ACCELERATION,
            packet_throttle_deceleration: PACKET_THROTTLE_DECELERATION,
            packet_throttle_interval: PACKET_THROTTLE_INTERVAL,
            ping_interval: PING_INTERVAL,
            timeout_limit: TIMEOUT_LIMIT,
            timeout_minimum: TIMEOUT_MINIMUM,
            timeout_maximum: TIMEOUT_MAXIMUM,
            last_round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            lowest_round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            last_round_trip_time_variance: 0,
            highest_round_trip_time_variance: 0,
            round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            round_trip_time_variance: 0,
            mtu: host_mtu,
            window_size: MAXIMUM_WINDOW_SIZE,
            reliable_data_in_transit: 0,
            outgoing_reliable_seq: Seq(0),
            incoming_unsequenced_group: 0,
            outgoing_unsequenced_group: 0,
            unsequenced_window: BitArray::ZERO,
            acknowledgements: VecDeque::new(),
            sent_reliable: VecDeque::new(),
            sent_unreliable: VecDeque::new(),
            outgoing_reliable: VecDeque::new(),
            outgoing_unreliable: VecDeque::new(),
            dispatched: VecDeque::new(),
            needs_dispatch: false,
            total_waiting_data: 0,
        };
        peer.reset(host_mtu);
        peer
    }

    /// Returns every field to its disconnected defaults and drops all queued
    /// commands and their payload references.
    pub(crate) fn reset(&mut self, host_mtu: u32) {
        self.outgoing_peer_id = MAXIMUM_PEER_ID;
        self.connect_id = 0;
        self.state = PeerState::Disconnected;
        self.incoming_bandwidth = 0;
        self.outgoing_bandwidth = 0;
        self.incoming_bandwidth_throttle_epoch = Timestamp(0);
        self.outgoing_bandwidth_throttle_epoch = Timestamp(0);
        self.incoming_data_total = 0;
        self.outgoing_data_total = 0;
        self.last_send_time = Timestamp(0);
        self.last_receive_time = Timestamp(0);
        self.next_timeout = Timestamp(0);
        self.earliest_timeout = Timestamp(0);
        self.packet_loss_epoch = Timestamp(0);
        self.packets_sent = 0;
        self.packets_lost = 0;
        self.packet_loss = 0;
        self.packet_loss_variance = 0;
        self.packet_throttle = DEFAULT_PACKET_THROTTLE;
        self.packet_throttle_limit = PACKET_THROTTLE_SCALE;
        self.packet_throttle_counter = 0;
        self.packet_throttle_epoch = Timestamp(0);
        self.packet_throttle_acceleration = PACKET_THROTTLE_ACCELERATION;
        self.packet_throttle_deceleration = PACKET_THROTTLE_DECELERATION;
        self.packet_throttle_interval = PACKET_THROTTLE_INTERVAL;
        self.ping_interval = PING_INTERVAL;
        self.timeout_limit = TIMEOUT_LIMIT;
        self.timeout_minimum = TIMEOUT_MINIMUM;
        self.timeout_maximum = TIMEOUT_MAXIMUM;
        self.last_round_trip_time = DEFAULT_ROUND_TRIP_TIME;
        self.lowest_round_trip_time = DEFAULT_ROUND_TRIP_TIME;
        self.last_round_trip_time_variance = 0;
        self.highest_round_trip_time_variance = 0;
        self.round_trip_time = DEFAULT_ROUND_TRIP_TIME;
        self.round_trip_time_variance = 0;
        self.mtu = host_mtu;
        self.reliable_data_in_transit = 0;
        self.outgoing_reliable_seq = Seq(0);
        self.window_size = MAXIMUM_WINDOW_SIZE;
        self.incoming_unsequenced_group = 0;
        self.outgoing_unsequenced_group = 0;
        self.event_data = 0;
        self.total_waiting_data = 0;
        self.unsequenced_window.fill(false);
        self.reset_queues();
    }

    /// Drops every queued command. The caller is responsible for removing
    /// this peer from the host dispatch queue if `needs_dispatch` was set.
    pub(crate) fn reset_queues(&mut self) {
        self.acknowledgements.clear();
        self.sent_reliable.clear();
        self.sent_unreliable.clear();
        self.outgoing_reliable.clear();
        self.outgoing_unreliable.clear();
        self.dispatched.clear();
        self.channels.clear();
    }

    /// Dequeues the next packet delivered by this peer, with the channel it
    /// arrived on.
    pub fn receive(&mut self) -> Option<(u8, Packet)> {
        let command = self.dispatched.pop_front()?;
        let channel_id = command.channel_id;
        let packet = command.payload.into_packet();
        self.total_waiting_data = self.total_waiting_data.saturating_sub(packet.len());
        Some((channel_id, packet))
    }

    /// Adapts the unreliable-packet throttle to a fresh RTT sample, against
    /// the RTT statistics committed at the last throttle interval.
    ///
    /// Returns `1` if the throttle opened, `-1` if it closed, `0` otherwise.
    pub(crate) fn throttle(&mut self, rtt: u32) -> i32 {
        if self.last_round_trip_time <= self.last_round_trip_time_variance {
            self.packet_throttle = self.packet_throttle_limit;
        } else if rtt < self.last_round_trip_time {
            self.packet_throttle = (self.packet_throttle + self.packet_throttle_acceleration)
                .min(self.packet_throttle_limit);
            return 1;
        } else if rtt > self.last_round_trip_time + 2 * self.last_round_trip_time_variance {
            self.packet_throttle = self
                .packet_throttle
                .saturating_sub(self.packet_throttle_deceleration);
            return -1;
        }
        0
    }

    /// Gets this peer's ID in its host's table.
    #[must_use]
    pub const fn id(&self) -> PeerId {
        self.incoming_peer_id
    }

    /// Gets the connection state.
    #[must_use]
    pub const fn state(&self) -> PeerState {
        self.state
    }

    /// Gets the remote address, once known.
    #[must_use]
    pub const fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// Gets the connect nonce agreed during the handshake.
    #[must_use]
    pub const fn connect_id(&self) -> u32 {
        self.connect_id
    }

    /// Gets our peer ID in the remote host's table.
    #[must_use]
    pub const fn outgoing_peer_id(&self) -> u16 {
        self.outgoing_peer_id
    }

    /// Gets the number of channels negotiated for this connection.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Gets the smoothed round-trip time estimate, in ms.
    #[must_use]
    pub const fn round_trip_time(&self) -> u32 {
        self.round_trip_time
    }

    /// Gets the round-trip time variance, in ms.
    #[must_use]
    pub const fn round_trip_time_variance(&self) -> u32 {
        self.round_trip_time_variance
    }

    /// Gets the mean packet loss, scaled so that [`PACKET_LOSS_SCALE`] is
    /// 100% loss.
    #[must_use]
    pub const fn packet_loss(&self) -> u32 {
        self.packet_loss
    }

    /// Gets the number of packets lost since the current loss-sampling
    /// epoch began.
    #[must_use]
    pub const fn packets_lost(&self) -> u32 {
        self.packets_lost
    }

    /// Gets the negotiated MTU.
    #[must_use]
    pub const fn mtu(&self) -> u32 {
        self.mtu
    }

    /// Gets the current throttle value, out of [`PACKET_THROTTLE_SCALE`].
    #[must_use]
    pub const fn packet_throttle(&self) -> u32 {
        self.packet_throttle
    }

    /// Gets the total payload bytes queued for the application.
    #[must_use]
    pub const fn total_waiting_data(&self) -> usize {
        self.total_waiting_data
    }

    /// Pins the unreliable-packet throttle to `throttle` out of
    /// [`PACKET_THROTTLE_SCALE`], with `limit` as its ceiling.
    ///
    /// The committed round-trip statistics are cleared, so adaptation snaps
    /// the throttle back to `limit` on the next sample instead of drifting
    /// away from the pinned value.
    pub fn set_packet_throttle(&mut self, throttle: u32, limit: u32) {
        self.packet_throttle = throttle.min(PACKET_THROTTLE_SCALE);
        self.packet_throttle_limit = limit.min(PACKET_THROTTLE_SCALE);
        self.last_round_trip_time = 0;
        self.last_round_trip_time_variance = 0;
    }

    /// Sets the keep-alive interval, in ms; `0` restores the default.
    pub fn set_ping_interval(&mut self, interval: u32) {
        self.ping_interval = if interval == 0 { PING_INTERVAL } else { interval };
    }

    /// Sets the timeout parameters; each `0` restores that default.
    ///
    /// `limit` is the number of initial RTOs a command may back off through,
    /// `minimum`/`maximum` bound the wall-clock time with unacknowledged
    /// traffic before disconnection.
    pub fn set_timeout(&mut self, limit: u32, minimum: u32, maximum: u32) {
        self.timeout_limit = if limit == 0 { TIMEOUT_LIMIT } else { limit };
        self.timeout_minimum = if minimum == 0 { TIMEOUT_MINIMUM } else { minimum };
        self.timeout_maximum = if maximum == 0 { TIMEOUT_MAXIMUM } else { maximum };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Peer {
        Peer::new(PeerId(0), 1400)
    }

    #[test]
    fn throttle_fully_opens_on_stable_link() {
        let mut peer = peer();
        // committed variance at or above committed mean: measurement is
        // noise, open fully
        peer.packet_throttle = 3;
        peer.last_round_trip_time = 10;
        peer.last_round_trip_time_variance = 10;
        assert_eq!(0, peer.throttle(50));
        assert_eq!(peer.packet_throttle_limit, peer.packet_throttle);
    }

    #[test]
    fn throttle_accelerates_and_decelerates() {
        let mut peer = peer();
        peer.last_round_trip_time = 100;
        peer.last_round_trip_time_variance = 10;

        peer.packet_throttle = 10;
        assert_eq!(1, peer.throttle(50));
        assert_eq!(10 + PACKET_THROTTLE_ACCELERATION, peer.packet_throttle);

        assert_eq!(-1, peer.throttle(200));
        assert_eq!(10, peer.packet_throttle);

        // inside the tolerance band: unchanged
        assert_eq!(0, peer.throttle(110));
        assert_eq!(10, peer.packet_throttle);
    }

    #[test]
    fn throttle_saturates_at_zero() {
        let mut peer = peer();
        peer.last_round_trip_time = 100;
        peer.last_round_trip_time_variance = 10;
        peer.packet_throttle = 1;
        assert_eq!(-1, peer.throttle(1000));
        assert_eq!(0, peer.packet_throttle);
    }

    #[test]
    fn reset_restores_defaults() {
        let mut peer = peer();
        peer.round_trip_time = 9999;
        peer.packet_throttle = 1;
        peer.total_waiting_data = 123;
        peer.state = PeerState::Connected;
        peer.reset(1400);
        assert_eq!(PeerState::Disconnected, peer.state);
        assert_eq!(DEFAULT_ROUND_TRIP_TIME, peer.round_trip_time);
        assert_eq!(DEFAULT_PACKET_THROTTLE, peer.packet_throttle);
        assert_eq!(0, peer.total_waiting_data);
        assert_eq!(MAXIMUM_PEER_ID, peer.outgoing_peer_id);
    }
}
