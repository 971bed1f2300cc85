//! In-memory datagram transport for tests and offline simulation.
//!
//! A [`LoopbackIo`] pair behaves like two UDP sockets joined by a
//! configurable link: each direction can drop a deterministic fraction of
//! datagrams (seeded, so test runs are reproducible) and delay delivery by a
//! fixed one-way latency.

use std::{
    collections::VecDeque,
    io,
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use ahash::AHashMap;
use bytes::Bytes;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use web_time::Instant;

use crate::io::DatagramIo;

/// Behavior of one direction of a loopback link.
#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    /// Fraction of datagrams dropped, in `0.0..=1.0`.
    pub loss: f64,
    /// Fixed one-way delivery latency.
    pub latency: Duration,
    /// Seed for the loss die.
    pub seed: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            loss: 0.0,
            latency: Duration::ZERO,
            seed: 1,
        }
    }
}

struct Link {
    tx: flume::Sender<(SocketAddr, Instant, Bytes)>,
    config: LinkConfig,
    rng: SmallRng,
}

/// One endpoint of an in-memory datagram pair.
pub struct LoopbackIo {
    addr: SocketAddr,
    rx: flume::Receiver<(SocketAddr, Instant, Bytes)>,
    links: AHashMap<SocketAddr, Link>,
    /// Received datagrams not yet due for delivery.
    staged: VecDeque<(SocketAddr, Instant, Bytes)>,
}

impl LoopbackIo {
    /// Creates a connected pair with lossless, zero-latency links.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        Self::pair_with(LinkConfig::default(), LinkConfig::default())
    }

    /// Creates a connected pair with per-direction link behavior:
    /// `a_to_b` shapes datagrams sent by the first endpoint, `b_to_a` those
    /// sent by the second.
    #[must_use]
    pub fn pair_with(a_to_b: LinkConfig, b_to_a: LinkConfig) -> (Self, Self) {
        let addr_a = SocketAddr::from((Ipv4Addr::LOCALHOST, 1));
        let addr_b = SocketAddr::from((Ipv4Addr::LOCALHOST, 2));
        let (tx_to_a, rx_a) = flume::unbounded();
        let (tx_to_b, rx_b) = flume::unbounded();

        let a = Self {
            addr: addr_a,
            rx: rx_a,
            links: [(
                addr_b,
                Link {
                    tx: tx_to_b,
                    config: a_to_b,
                    rng: SmallRng::seed_from_u64(a_to_b.seed),
                },
            )]
            .into_iter()
            .collect(),
            staged: VecDeque::new(),
        };
        let b = Self {
            addr: addr_b,
            rx: rx_b,
            links: [(
                addr_a,
                Link {
                    tx: tx_to_a,
                    config: b_to_a,
                    rng: SmallRng::seed_from_u64(b_to_a.seed),
                },
            )]
            .into_iter()
            .collect(),
            staged: VecDeque::new(),
        };
        (a, b)
    }

    /// Changes the loss rate of every outgoing link; `1.0` severs the
    /// connection without telling the other side.
    pub fn set_loss(&mut self, loss: f64) {
        for link in self.links.values_mut() {
            link.config.loss = loss;
        }
    }

    fn pump(&mut self) {
        while let Ok(item) = self.rx.try_recv() {
            self.staged.push_back(item);
        }
    }
}

impl DatagramIo for LoopbackIo {
    fn send(&mut self, addr: SocketAddr, data: &[u8]) -> io::Result<usize> {
        let Some(link) = self.links.get_mut(&addr) else {
            // nobody listening: the datagram silently disappears, like UDP
            return Ok(data.len());
        };
        if link.config.loss > 0.0 && link.rng.gen::<f64>() < link.config.loss {
            return Ok(data.len());
        }
        let deliver_at = Instant::now() + link.config.latency;
        // a closed far end swallows datagrams, it does not error
        let _ = link
            .tx
            .send((self.addr, deliver_at, Bytes::copy_from_slice(data)));
        Ok(data.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        self.pump();
        let due = self
            .staged
            .front()
            .is_some_and(|(_, deliver_at, _)| *deliver_at <= Instant::now());
        if !due {
            return Ok(None);
        }
        let (from, _, data) = self.staged.pop_front().expect("front was checked");
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(Some((len, from)))
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump();
            let now = Instant::now();
            if let Some((_, deliver_at, _)) = self.staged.front() {
                if *deliver_at <= now {
                    return Ok(true);
                }
                let wake = (*deliver_at).min(deadline);
                if wake <= now {
                    return Ok(false);
                }
                match self.rx.recv_timeout(wake - now) {
                    Ok(item) => self.staged.push_back(item),
                    Err(_) => {
                        if deadline <= Instant::now() {
                            return Ok(false);
                        }
                    }
                }
            } else {
                if now >= deadline {
                    return Ok(false);
                }
                match self.rx.recv_timeout(deadline - now) {
                    Ok(item) => self.staged.push_back(item),
                    Err(_) => return Ok(false),
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_order() {
        let (mut a, mut b) = LoopbackIo::pair();
        let b_addr = b.local_addr().expect("addr");
        a.send(b_addr, b"one").expect("send");
        a.send(b_addr, b"two").expect("send");

        let mut buf = [0u8; 16];
        let (len, from) = b.recv(&mut buf).expect("recv").expect("first");
        assert_eq!(b"one", &buf[..len]);
        assert_eq!(a.local_addr().expect("addr"), from);
        let (len, _) = b.recv(&mut buf).expect("recv").expect("second");
        assert_eq!(b"two", &buf[..len]);
        assert!(b.recv(&mut buf).expect("recv").is_none());
    }

    #[test]
    fn full_loss_drops_everything() {
        let (mut a, mut b) = LoopbackIo::pair_with(
            LinkConfig {
                loss: 1.0,
                ..LinkConfig::default()
            },
            LinkConfig::default(),
        );
        let b_addr = b.local_addr().expect("addr");
        for _ in 0..64 {
            a.send(b_addr, b"gone").expect("send");
        }
        let mut buf = [0u8; 16];
        assert!(b.recv(&mut buf).expect("recv").is_none());
    }

    #[test]
    fn loss_rate_is_deterministic() {
        let deliveries = |seed| {
            let (mut a, mut b) = LoopbackIo::pair_with(
                LinkConfig {
                    loss: 0.5,
                    seed,
                    ..LinkConfig::default()
                },
                LinkConfig::default(),
            );
            let b_addr = b.local_addr().expect("addr");
            for _ in 0..100 {
                a.send(b_addr, b"x").expect("send");
            }
            let mut buf = [0u8; 4];
            let mut received = 0;
            while b.recv(&mut buf).expect("recv").is_some() {
                received += 1;
            }
            received
        };
        assert_eq!(deliveries(7), deliveries(7));
        let got = deliveries(7);
        assert!((25..=75).contains(&got), "{got} of 100 delivered");
    }

    #[test]
    fn latency_defers_delivery() {
        let (mut a, mut b) = LoopbackIo::pair_with(
            LinkConfig {
                latency: Duration::from_millis(30),
                ..LinkConfig::default()
            },
            LinkConfig::default(),
        );
        let b_addr = b.local_addr().expect("addr");
        a.send(b_addr, b"later").expect("send");

        let mut buf = [0u8; 16];
        assert!(b.recv(&mut buf).expect("recv").is_none());
        assert!(b.wait(Duration::from_millis(200)).expect("wait"));
        assert!(b.recv(&mut buf).expect("recv").is_some());
    }
}
