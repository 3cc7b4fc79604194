use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::net::{Impairment, ImpairmentScheduler, MAX_DATAGRAM_SIZE, Reply};

const ALIVE_CHANNEL: usize = 8;
const ACK_CHANNEL: usize = 64;

/// How datagrams leave a session: straight onto the socket, or through the shared impairment
/// stage.
#[derive(Debug, Clone, Default)]
pub enum Outbound {
    #[default]
    Direct,
    Impaired(Arc<ImpairmentScheduler>),
}

/// Replies from the collector, split by kind so each duty only sees its own.
#[derive(Debug)]
pub struct Replies {
    pub alive: mpsc::Receiver<()>,
    pub acks: mpsc::Receiver<u32>,
}

/// A session's socket plus the collector it talks to.
#[derive(Debug, Clone)]
pub struct Link {
    device_id: u16,
    socket: Arc<UdpSocket>,
    collector: SocketAddr,
    outbound: Outbound,
}

impl Link {
    /// Binds an ephemeral port on the wildcard address of the collector's family.
    pub async fn bind(
        device_id: u16,
        collector: SocketAddr,
        outbound: Outbound,
    ) -> Result<Self, TransportError> {
        let local = match collector.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| TransportError::BindFailed {
                addr: local,
                source,
            })?;

        Ok(Self {
            device_id,
            socket: Arc::new(socket),
            collector,
            outbound,
        })
    }

    pub fn device_id(&self) -> u16 {
        self.device_id
    }

    pub fn collector(&self) -> SocketAddr {
        self.collector
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Returns `false` when the impairment stage dropped the datagram.
    pub async fn send(&self, bytes: Vec<u8>, seq: Option<u32>) -> Result<bool, TransportError> {
        match &self.outbound {
            Outbound::Direct => {
                self.socket
                    .send_to(&bytes, self.collector)
                    .await
                    .map_err(|source| TransportError::SendFailed {
                        addr: self.collector,
                        source,
                    })?;
                Ok(true)
            }
            Outbound::Impaired(scheduler) => {
                let decision = scheduler
                    .submit(&self.socket, self.collector, bytes, seq)
                    .await?;
                Ok(decision != Impairment::Drop)
            }
        }
    }

    /// Starts the task that owns the receive half of the socket. Abort the handle when the
    /// session ends.
    pub fn spawn_router(&self) -> (JoinHandle<()>, Replies) {
        let (alive_tx, alive) = mpsc::channel(ALIVE_CHANNEL);
        let (ack_tx, acks) = mpsc::channel(ACK_CHANNEL);

        let handle = tokio::spawn(route_replies(
            Arc::clone(&self.socket),
            self.collector,
            self.device_id,
            alive_tx,
            ack_tx,
        ));

        (handle, Replies { alive, acks })
    }
}

async fn route_replies(
    socket: Arc<UdpSocket>,
    collector: SocketAddr,
    device_id: u16,
    alive_tx: mpsc::Sender<()>,
    ack_tx: mpsc::Sender<u32>,
) {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => {
                log::error!("device {} receive failed: {}", device_id, e);
                return;
            }
        };

        if from != collector {
            log::debug!("device {} ignoring {} bytes from {}", device_id, len, from);
            continue;
        }

        match Reply::decode(&buf[..len]) {
            Ok(Reply::Alive) => {
                let _ = alive_tx.try_send(());
            }
            Ok(Reply::Ack { seq }) => {
                log::info!("device {} received ACK for seq {}", device_id, seq);
                if ack_tx.try_send(seq).is_err() {
                    log::trace!("device {} dropped ACK {}: nobody waiting", device_id, seq);
                }
            }
            Err(e) => {
                log::debug!("device {} ignoring reply from collector: {}", device_id, e);
            }
        }
    }
}
