use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::protocol::MessageType;

#[derive(Debug, Clone)]
pub struct DevicePeer {
    pub device_id: u16,
    pub addr: SocketAddr,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub inits: u64,
    pub heartbeats: u64,
    pub data_packets: u64,
}

impl DevicePeer {
    pub fn new(device_id: u16, addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            device_id,
            addr,
            first_seen: now,
            last_seen: now,
            inits: 0,
            heartbeats: 0,
            data_packets: 0,
        }
    }

    pub fn is_silent(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}

/// Devices the collector has heard from, keyed by device id. Observability only: nothing in the
/// ingest path depends on a device being registered.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<u16, DevicePeer>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, device_id: u16, addr: SocketAddr, msg_type: MessageType) -> &DevicePeer {
        let peer = self
            .devices
            .entry(device_id)
            .or_insert_with(|| DevicePeer::new(device_id, addr));

        if peer.addr != addr {
            log::debug!("device {} moved from {} to {}", device_id, peer.addr, addr);
            peer.addr = addr;
        }
        peer.touch();

        match msg_type {
            MessageType::Init => peer.inits += 1,
            MessageType::Heartbeat => peer.heartbeats += 1,
            MessageType::Data => peer.data_packets += 1,
            MessageType::Alive => {}
        }

        peer
    }

    pub fn get(&self, device_id: u16) -> Option<&DevicePeer> {
        self.devices.get(&device_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DevicePeer> {
        self.devices.values()
    }

    pub fn silent(&self, timeout: Duration) -> Vec<u16> {
        self.devices
            .values()
            .filter(|p| p.is_silent(timeout))
            .map(|p| p.device_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
