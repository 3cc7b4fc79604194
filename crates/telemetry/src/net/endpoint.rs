use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use super::protocol::{MAX_DATAGRAM_SIZE, Reply};
use super::stats::EndpointStats;
use crate::error::TransportError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// One datagram as it came off the wire, with its arrival stamp.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub from: SocketAddr,
    pub arrival: SystemTime,
}

/// Blocking collector socket. Receives wait at most the poll interval, so the owning loop can
/// observe its stop flag between datagrams.
pub struct CollectorEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    stats: EndpointStats,
    recv_buffer: [u8; MAX_DATAGRAM_SIZE],
    running: Arc<AtomicBool>,
}

impl CollectorEndpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A, poll_interval: Duration) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(&addr).map_err(|source| TransportError::BindFailed {
            addr: first_addr(&addr),
            source,
        })?;
        socket.set_read_timeout(Some(poll_interval))?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            stats: EndpointStats::default(),
            recv_buffer: [0u8; MAX_DATAGRAM_SIZE],
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &EndpointStats {
        &self.stats
    }

    /// Returns `Ok(None)` when the poll interval passes without traffic.
    pub fn receive(&mut self) -> Result<Option<Datagram>, TransportError> {
        match self.socket.recv_from(&mut self.recv_buffer) {
            Ok((size, from)) => {
                self.stats.datagrams_received += 1;
                self.stats.bytes_received += size as u64;
                Ok(Some(Datagram {
                    bytes: self.recv_buffer[..size].to_vec(),
                    from,
                    arrival: SystemTime::now(),
                }))
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            // Windows reports an ICMP port-unreachable from a previous send this way.
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(TransportError::ReceiveFailed(e)),
        }
    }

    pub fn record_malformed(&mut self) {
        self.stats.malformed += 1;
    }

    /// Reply sends are fire-and-forget: a failure is counted and logged, never fatal.
    pub fn send_reply(&mut self, reply: Reply, addr: SocketAddr) -> bool {
        let bytes = reply.encode();
        match self.socket.send_to(&bytes, addr) {
            Ok(sent) => {
                self.stats.replies_sent += 1;
                self.stats.bytes_sent += sent as u64;
                true
            }
            Err(e) => {
                self.stats.send_failures += 1;
                log::warn!("failed to send {:?} to {}: {}", reply, addr, e);
                false
            }
        }
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn first_addr<A: ToSocketAddrs>(addr: &A) -> SocketAddr {
    addr.to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)))
}
