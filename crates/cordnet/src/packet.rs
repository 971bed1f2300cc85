//! See [`Packet`].

use bytes::Bytes;

bitflags::bitflags! {
    /// Delivery guarantees and bookkeeping flags for a [`Packet`].
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct PacketFlags: u32 {
        /// The packet must be received by the remote peer, and resends are
        /// attempted until an acknowledgement arrives.
        const RELIABLE = 1 << 0;
        /// The packet is not sequenced with other packets on its channel.
        ///
        /// Not supported for packets that need fragmentation.
        const UNSEQUENCED = 1 << 1;
        /// If the packet needs fragmentation, send it unreliably (dropping
        /// the whole message if any fragment is lost) instead of upgrading
        /// it to reliable delivery.
        const UNRELIABLE_FRAGMENT = 1 << 3;
        /// Set by the engine once the packet has been put on the wire at
        /// least once.
        const SENT = 1 << 8;
    }
}

/// A discrete application message, sent and received whole.
///
/// The payload is a [`Bytes`], so cloning a packet - and sharing one payload
/// across the many fragments of a large message - is cheap and does not copy
/// the data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    /// Message payload.
    pub data: Bytes,
    /// Delivery flags.
    pub flags: PacketFlags,
}

impl Packet {
    /// Creates a packet from a payload and explicit flags.
    #[must_use]
    pub fn new(data: impl Into<Bytes>, flags: PacketFlags) -> Self {
        Self {
            data: data.into(),
            flags,
        }
    }

    /// Creates a packet delivered reliably and in order on its channel.
    #[must_use]
    pub fn reliable(data: impl Into<Bytes>) -> Self {
        Self::new(data, PacketFlags::RELIABLE)
    }

    /// Creates a packet delivered unreliably, sequenced on its channel.
    #[must_use]
    pub fn unreliable(data: impl Into<Bytes>) -> Self {
        Self::new(data, PacketFlags::empty())
    }

    /// Creates a packet delivered unreliably with no sequencing at all.
    #[must_use]
    pub fn unsequenced(data: impl Into<Bytes>) -> Self {
        Self::new(data, PacketFlags::UNSEQUENCED)
    }

    /// Gets the payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Gets if the payload is empty.
    ///
    /// Zero-length packets are legal and are delivered as such.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Shrinks or grows the payload to `len` bytes.
    ///
    /// Shrinking truncates in place; growing copies into a fresh buffer and
    /// zero-fills the tail.
    pub fn resize(&mut self, len: usize) {
        if len <= self.data.len() {
            self.data.truncate(len);
        } else {
            let mut buf = Vec::with_capacity(len);
            buf.extend_from_slice(&self.data);
            buf.resize(len, 0);
            self.data = Bytes::from(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize() {
        let mut packet = Packet::reliable(&b"hello"[..]);
        packet.resize(2);
        assert_eq!(&b"he"[..], &packet.data[..]);
        packet.resize(4);
        assert_eq!(&[b'h', b'e', 0, 0][..], &packet.data[..]);
    }

    #[test]
    fn zero_length() {
        let packet = Packet::reliable(Bytes::new());
        assert!(packet.is_empty());
        assert_eq!(0, packet.len());
    }
}
