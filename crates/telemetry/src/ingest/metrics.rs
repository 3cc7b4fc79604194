use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use serde::Serialize;

use super::stream::CommitSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Checkpoint,
    Final,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceMetrics {
    pub device_id: u16,
    pub packets_received: u64,
    pub readings_written: u64,
    pub dup_total: u64,
    pub dup_seq_count: u64,
    pub loss_count: u64,
    pub gaps: u64,
    pub last_written: Option<u32>,
    pub max_seq_seen: Option<u32>,
    pub pending: usize,
}

/// Point-in-time view of the ingest counters. Never mutated after it is produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub kind: SnapshotKind,
    pub elapsed_secs: f64,
    pub packets_received: u64,
    pub readings_accepted: u64,
    pub readings_written: u64,
    pub dup_total: u64,
    pub dup_seq_count: u64,
    pub loss_count: u64,
    pub bytes_accepted: u64,
    pub bytes_per_report: f64,
    pub cpu_ms_total: f64,
    pub cpu_ms_per_reading: f64,
    pub malformed: u64,
    pub heartbeats: u64,
    pub inits: u64,
    pub acks_sent: u64,
    pub sink_errors: u64,
    pub devices: Vec<DeviceMetrics>,
}

impl MetricsSnapshot {
    pub fn report_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("packets_received = {}", self.packets_received),
            format!("readings_written = {}", self.readings_written),
            format!("bytes_per_report = {:.2} bytes", self.bytes_per_report),
            format!("duplicates = {} ({} distinct)", self.dup_total, self.dup_seq_count),
            format!("lost = {}", self.loss_count),
            format!("cpu_ms_per_report = {:.4}", self.cpu_ms_per_reading),
        ];
        if self.malformed > 0 {
            lines.push(format!("malformed = {}", self.malformed));
        }
        if self.sink_errors > 0 {
            lines.push(format!("sink_errors = {}", self.sink_errors));
        }
        for device in &self.devices {
            lines.push(format!(
                "device {}: written={} dup={} lost={} last_written={}",
                device.device_id,
                device.readings_written,
                device.dup_total,
                device.loss_count,
                device
                    .last_written
                    .map_or_else(|| "-".to_string(), |s| s.to_string())
            ));
        }
        lines
    }
}

#[derive(Debug, Clone, Default)]
struct DeviceCounters {
    packets_received: u64,
    readings_written: u64,
    dup_total: u64,
    dup_seq_count: u64,
    loss_count: u64,
    gaps: u64,
}

/// Running counters owned by the ingest pipeline.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    packets_received: u64,
    readings_accepted: u64,
    bytes_accepted: u64,
    cpu_time: Duration,
    malformed: u64,
    heartbeats: u64,
    inits: u64,
    acks_sent: u64,
    sink_errors: u64,
    devices: BTreeMap<u16, DeviceCounters>,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn device(&mut self, device_id: u16) -> &mut DeviceCounters {
        self.devices.entry(device_id).or_default()
    }

    pub fn record_malformed(&mut self) {
        self.malformed += 1;
    }

    pub fn record_heartbeat(&mut self) {
        self.heartbeats += 1;
    }

    pub fn record_init(&mut self) {
        self.inits += 1;
    }

    pub fn record_ack(&mut self) {
        self.acks_sent += 1;
    }

    pub fn record_duplicate(&mut self, device_id: u16, first_time: bool) {
        let device = self.device(device_id);
        device.dup_total += 1;
        if first_time {
            device.dup_seq_count += 1;
        }
    }

    pub fn record_accepted_packet(&mut self, device_id: u16, bytes: usize, readings: usize) {
        self.packets_received += 1;
        self.bytes_accepted += bytes as u64;
        self.readings_accepted += readings as u64;
        self.device(device_id).packets_received += 1;
    }

    pub fn record_cpu(&mut self, spent: Duration) {
        self.cpu_time += spent;
    }

    pub fn record_commit(&mut self, device_id: u16, summary: &CommitSummary) {
        self.sink_errors += summary.sink_errors;
        let device = self.device(device_id);
        device.readings_written += summary.written;
        device.dup_total += summary.duplicates;
        device.dup_seq_count += summary.new_duplicate_seqs;
        device.loss_count += summary.lost;
        device.gaps += summary.gaps;
    }

    pub fn record_loss(&mut self, device_id: u16, lost: u64) {
        self.device(device_id).loss_count += lost;
    }

    pub fn record_sink_error(&mut self) {
        self.sink_errors += 1;
    }

    pub fn device_metrics(&self, device_id: u16) -> DeviceMetrics {
        let counters = self.devices.get(&device_id).cloned().unwrap_or_default();
        DeviceMetrics {
            device_id,
            packets_received: counters.packets_received,
            readings_written: counters.readings_written,
            dup_total: counters.dup_total,
            dup_seq_count: counters.dup_seq_count,
            loss_count: counters.loss_count,
            gaps: counters.gaps,
            ..Default::default()
        }
    }

    /// Totals are summed from `devices`, so callers pass every device they track.
    pub fn snapshot(
        &self,
        kind: SnapshotKind,
        elapsed: Duration,
        devices: Vec<DeviceMetrics>,
    ) -> MetricsSnapshot {
        let readings_written = devices.iter().map(|d| d.readings_written).sum();
        let dup_total = devices.iter().map(|d| d.dup_total).sum();
        let dup_seq_count = devices.iter().map(|d| d.dup_seq_count).sum();
        let loss_count = devices.iter().map(|d| d.loss_count).sum();

        let cpu_ms_total = self.cpu_time.as_secs_f64() * 1000.0;

        MetricsSnapshot {
            kind,
            elapsed_secs: elapsed.as_secs_f64(),
            packets_received: self.packets_received,
            readings_accepted: self.readings_accepted,
            readings_written,
            dup_total,
            dup_seq_count,
            loss_count,
            bytes_accepted: self.bytes_accepted,
            bytes_per_report: ratio(self.bytes_accepted as f64, self.packets_received),
            cpu_ms_total,
            cpu_ms_per_reading: ratio(cpu_ms_total, self.readings_accepted),
            malformed: self.malformed,
            heartbeats: self.heartbeats,
            inits: self.inits,
            acks_sent: self.acks_sent,
            sink_errors: self.sink_errors,
            devices,
        }
    }
}

fn ratio(numerator: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        numerator / count as f64
    }
}

/// Elapsed-time marks at which a checkpoint snapshot is due.
#[derive(Debug, Clone, Default)]
pub struct CheckpointSchedule {
    remaining: VecDeque<Duration>,
}

impl CheckpointSchedule {
    pub fn new(mut marks: Vec<Duration>) -> Self {
        marks.sort();
        marks.dedup();
        Self {
            remaining: marks.into(),
        }
    }

    pub fn from_secs(secs: &[u64]) -> Self {
        Self::new(secs.iter().copied().map(Duration::from_secs).collect())
    }

    /// Pops every mark already passed; several may fall due after a slow poll.
    pub fn due(&mut self, elapsed: Duration) -> Vec<Duration> {
        let mut due = Vec::new();
        while self.remaining.front().is_some_and(|&mark| mark <= elapsed) {
            if let Some(mark) = self.remaining.pop_front() {
                due.push(mark);
            }
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.remaining.is_empty()
    }
}
