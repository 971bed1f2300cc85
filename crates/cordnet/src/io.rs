//! The datagram transport consumed by the engine.
//!
//! The engine never touches sockets directly: a [`Host`](crate::host::Host)
//! drives any [`DatagramIo`] implementation. [`UdpIo`] is the standard
//! UDP-socket implementation; [`loopback`](crate::loopback) provides an
//! in-memory pair for tests and offline simulation.

use std::{
    io,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    time::Duration,
};

/// An unreliable datagram endpoint.
///
/// Implementations must be non-blocking on [`DatagramIo::recv`] and bounded
/// by the given timeout on [`DatagramIo::wait`]. Any [`io::Error`] is
/// treated as fatal by the engine and surfaced through
/// [`service`](crate::host::Host::service).
pub trait DatagramIo {
    /// Sends one datagram to `addr`, returning the bytes sent.
    fn send(&mut self, addr: SocketAddr, data: &[u8]) -> io::Result<usize>;

    /// Receives one datagram if available, without blocking.
    ///
    /// Returns `Ok(None)` when no datagram is waiting.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    /// Blocks until a datagram is ready to receive or `timeout` elapses.
    ///
    /// Returns whether a datagram is ready.
    fn wait(&mut self, timeout: Duration) -> io::Result<bool>;

    /// Gets the local address of this endpoint.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// [`DatagramIo`] over a UDP socket.
#[derive(Debug)]
pub struct UdpIo {
    socket: UdpSocket,
}

impl UdpIo {
    /// Binds a UDP socket to `addr` and prepares it for use by a host.
    pub fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        socket.set_broadcast(true)?;
        Ok(Self { socket })
    }

    /// Wraps an already configured socket. The socket must be non-blocking.
    #[must_use]
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self { socket }
    }
}

impl DatagramIo for UdpIo {
    fn send(&mut self, addr: SocketAddr, data: &[u8]) -> io::Result<usize> {
        match self.socket.send_to(data, addr) {
            Ok(sent) => Ok(sent),
            // a full send buffer drops the datagram, like the wire would
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(data.len()),
            Err(err) => Err(err),
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((len, addr)) => Ok(Some((len, addr))),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // a remote ICMP port-unreachable surfaces as ConnectionReset on
            // some platforms; not fatal for a connectionless socket
            Err(err) if err.kind() == io::ErrorKind::ConnectionReset => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<bool> {
        if timeout.is_zero() {
            let mut probe = [0u8; 1];
            return match self.socket.peek_from(&mut probe) {
                Ok(_) => Ok(true),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
                Err(err) if err.kind() == io::ErrorKind::ConnectionReset => Ok(false),
                Err(err) => Err(err),
            };
        }

        self.socket.set_nonblocking(false)?;
        self.socket.set_read_timeout(Some(timeout))?;
        let mut probe = [0u8; 1];
        let result = match self.socket.peek_from(&mut probe) {
            Ok(_) => Ok(true),
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(false)
            }
            Err(err) if err.kind() == io::ErrorKind::ConnectionReset => Ok(false),
            Err(err) => Err(err),
        };
        self.socket.set_nonblocking(true)?;
        result
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_round_trip() {
        let mut a = UdpIo::bind("127.0.0.1:0").expect("bind a");
        let mut b = UdpIo::bind("127.0.0.1:0").expect("bind b");
        let b_addr = b.local_addr().expect("addr");

        assert_eq!(5, a.send(b_addr, b"hello").expect("send"));
        assert!(b.wait(Duration::from_secs(1)).expect("wait"));

        let mut buf = [0u8; 64];
        let (len, from) = b.recv(&mut buf).expect("recv").expect("datagram");
        assert_eq!(b"hello", &buf[..len]);
        assert_eq!(a.local_addr().expect("addr"), from);
    }

    #[test]
    fn recv_without_data_is_none() {
        let mut socket = UdpIo::bind("127.0.0.1:0").expect("bind");
        let mut buf = [0u8; 64];
        assert!(socket.recv(&mut buf).expect("recv").is_none());
        assert!(!socket.wait(Duration::ZERO).expect("wait"));
    }
}
