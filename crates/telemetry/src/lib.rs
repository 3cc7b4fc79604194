pub mod error;
pub mod ingest;
pub mod net;
pub mod session;

pub use error::{ConfigError, FormatError, TransportError};
pub use ingest::{
    CSV_HEADER, CheckpointSchedule, CommittedRow, CsvSink, DEFAULT_FLUSH_THRESHOLD, DeviceMetrics,
    DeviceStream, Disposition, IngestConfig, IngestEvent, IngestPipeline, MemorySink,
    MetricsSnapshot, ReadingSink, SnapshotKind,
};
pub use net::{
    CollectorEndpoint, DEFAULT_PORT, DataPacket, Datagram, DeviceRegistry, EndpointStats, Header,
    HeaderFlags, ImpairmentConfig, ImpairmentScheduler, MessageType, Reply,
};
pub use session::{
    ClientSession, EndReason, HeartbeatPolicy, Liveness, Outbound, ReadingProfile, RetryPolicy,
    SessionConfig, SessionReport, SessionState,
};
