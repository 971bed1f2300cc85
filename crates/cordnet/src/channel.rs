//! Per-(peer, channel) sequencing state.

use std::collections::VecDeque;

use bitvec::{order::Lsb0, vec::BitVec};
use bytes::BytesMut;

use crate::{
    packet::{Packet, PacketFlags},
    protocol::{CommandFlags, CommandKind, FREE_RELIABLE_WINDOWS, RELIABLE_WINDOWS},
    seq::Seq,
};

/// Payload of an [`IncomingCommand`]: either complete on arrival, or being
/// assembled from fragments.
#[derive(Debug)]
pub(crate) enum IncomingPayload {
    /// Whole message, ready to hand to the application.
    Ready(Packet),
    /// Fragment reassembly buffer, zero-filled to the message's total
    /// length; fragments are copied in as they arrive.
    Assembling {
        data: BytesMut,
        flags: PacketFlags,
    },
}

impl IncomingPayload {
    /// Gets the payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Ready(packet) => packet.len(),
            Self::Assembling { data, .. } => data.len(),
        }
    }

    /// Converts into the packet handed to the application.
    pub fn into_packet(self) -> Packet {
        match self {
            Self::Ready(packet) => packet,
            Self::Assembling { data, flags } => Packet {
                data: data.freeze(),
                flags,
            },
        }
    }
}

/// A received command buffered for reassembly, reordering, or dispatch.
#[derive(Debug)]
pub(crate) struct IncomingCommand {
    pub kind: CommandKind,
    pub flags: CommandFlags,
    pub channel_id: u8,
    pub reliable_seq: Seq,
    pub unreliable_seq: Seq,
    /// Fragments in this command's group; 0 for unfragmented commands.
    pub fragment_count: u32,
    /// Fragments not yet received; the command is dispatchable at 0.
    pub fragments_remaining: u32,
    /// Which fragments have arrived; `None` for unfragmented commands.
    pub fragments: Option<BitVec<u32, Lsb0>>,
    pub payload: IncomingPayload,
}

/// Sequencing state for one channel of one peer.
#[derive(Debug, Default)]
pub(crate) struct Channel {
    pub outgoing_reliable_seq: Seq,
    pub outgoing_unreliable_seq: Seq,
    pub incoming_reliable_seq: Seq,
    pub incoming_unreliable_seq: Seq,
    /// Received reliable commands not yet deliverable, sorted by sequence
    /// number relative to `incoming_reliable_seq`.
    pub incoming_reliable: VecDeque<IncomingCommand>,
    /// Received unreliable commands not yet deliverable, sorted by
    /// (reliable, unreliable) sequence numbers.
    pub incoming_unreliable: VecDeque<IncomingCommand>,
    /// Bit `w` set iff `reliable_windows[w] > 0`.
    pub used_reliable_windows: u16,
    /// In-flight outgoing reliable commands per window.
    pub reliable_windows: [u16; RELIABLE_WINDOWS as usize],
}

impl Channel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an outgoing reliable command entering flight in `seq`'s
    /// window.
    pub fn mark_window_used(&mut self, seq: Seq) {
        let window = seq.window();
        self.used_reliable_windows |= 1 << window;
        self.reliable_windows[window as usize] += 1;
    }

    /// Records an outgoing reliable command in `seq`'s window leaving flight
    /// (acknowledged or abandoned).
    pub fn release_window(&mut self, seq: Seq) {
        let window = seq.window();
        if self.reliable_windows[window as usize] > 0 {
            self.reliable_windows[window as usize] -= 1;
            if self.reliable_windows[window as usize] == 0 {
                self.used_reliable_windows &= !(1 << window);
            }
        }
    }

    /// Gets whether an incoming command with this reliable sequence number
    /// is inside the acceptance region: at or ahead of the current window,
    /// but clear of the guard windows reserved against wrap ambiguity.
    pub fn accepts_reliable(&self, seq: Seq) -> bool {
        let window = seq.window_from(self.incoming_reliable_seq);
        let current = self.incoming_reliable_seq.window();
        window >= current && window < current + FREE_RELIABLE_WINDOWS - 1
    }

    /// Gets whether a command with this sequence number is in the region
    /// where acknowledgements must not be sent (the sender could confuse the
    /// ack with one for a sequence number a full cycle earlier).
    pub fn in_ack_guard(&self, seq: Seq) -> bool {
        let window = seq.window_from(self.incoming_reliable_seq);
        let current = self.incoming_reliable_seq.window();
        window >= current + FREE_RELIABLE_WINDOWS - 1 && window <= current + FREE_RELIABLE_WINDOWS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_bookkeeping() {
        let mut channel = Channel::new();
        channel.mark_window_used(Seq(1));
        channel.mark_window_used(Seq(2));
        channel.mark_window_used(Seq(5000));
        assert_eq!(0b11, channel.used_reliable_windows);
        assert_eq!(2, channel.reliable_windows[0]);
        assert_eq!(1, channel.reliable_windows[1]);

        channel.release_window(Seq(1));
        assert_eq!(0b11, channel.used_reliable_windows);
        channel.release_window(Seq(2));
        assert_eq!(0b10, channel.used_reliable_windows);
        channel.release_window(Seq(5000));
        assert_eq!(0, channel.used_reliable_windows);

        // releasing an empty window is a no-op
        channel.release_window(Seq(5000));
        assert_eq!(0, channel.reliable_windows[1]);
    }

    #[test]
    fn acceptance_region() {
        let channel = Channel::new();
        // current window plus the next 6 are acceptable
        assert!(channel.accepts_reliable(Seq(1)));
        assert!(channel.accepts_reliable(Seq(7 * 4096 - 1)));
        // window 7 starts the guard region
        assert!(!channel.accepts_reliable(Seq(7 * 4096)));
        assert!(!channel.accepts_reliable(Seq(u16::MAX)));
    }

    #[test]
    fn acceptance_region_across_wrap() {
        let channel = Channel {
            incoming_reliable_seq: Seq(u16::MAX - 10),
            ..Channel::default()
        };
        // just ahead, across the numeric wrap: window 16 vs current 15
        assert!(channel.accepts_reliable(Seq(5)));
        // far ahead lands in the guard region
        assert!(!channel.accepts_reliable(Seq(7 * 4096)));
        // at the current window
        assert!(channel.accepts_reliable(Seq(u16::MAX - 5)));
    }

    #[test]
    fn ack_guard_region() {
        let channel = Channel::new();
        assert!(!channel.in_ack_guard(Seq(0)));
        assert!(!channel.in_ack_guard(Seq(6 * 4096)));
        assert!(channel.in_ack_guard(Seq(7 * 4096)));
        assert!(channel.in_ack_guard(Seq(8 * 4096)));
        assert!(!channel.in_ack_guard(Seq(9 * 4096)));
    }
}
