mod endpoint;
mod peers;
mod protocol;
mod simulator;
mod stats;

pub use endpoint::{CollectorEndpoint, DEFAULT_POLL_INTERVAL, Datagram};
pub use peers::{DevicePeer, DeviceRegistry};
pub use protocol::{
    DEFAULT_PORT, DataPacket, FormatError, HEADER_SIZE, Header, HeaderFlags, MAX_DATAGRAM_SIZE,
    MessageType, READING_SIZE, Reply, decode_readings, heartbeat_packet, init_packet, unix_now,
};
pub use simulator::{
    DEFAULT_DISPATCH_INTERVAL, DelayQueue, ImpairmentScheduler, ImpairmentStats, Outgoing,
    Scheduled,
};
pub use stats::{DEFAULT_REORDER_PROBABILITY, EndpointStats, Impairment, ImpairmentConfig};
