//! Collector-side ingest: per-device sequence tracking, ordered commits and delivery metrics.

mod metrics;
mod pipeline;
mod sink;
mod stream;

pub use metrics::{CheckpointSchedule, DeviceMetrics, IngestMetrics, MetricsSnapshot, SnapshotKind};
pub use pipeline::{DEFAULT_FLUSH_THRESHOLD, Disposition, IngestConfig, IngestEvent, IngestPipeline};
pub use sink::{CSV_HEADER, CommittedRow, CsvSink, MemorySink, ReadingSink};
pub use stream::{Admission, BufferedReading, CommitSummary, DeviceStream, VALVE_FACTOR};
