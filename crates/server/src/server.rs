use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufWriter};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use serde::Serialize;

use tinytel::{
    CheckpointSchedule, CollectorEndpoint, Datagram, EndpointStats, IngestPipeline,
    MetricsSnapshot, ReadingSink, SnapshotKind, TransportError,
};

use crate::config::CollectorConfig;
use crate::events::ServerEvent;

pub type BoxedSink = Box<dyn ReadingSink>;

#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub device_id: u16,
    pub addr: String,
    pub first_seen_secs: u64,
    pub last_seen_secs: u64,
    pub silent: bool,
    pub inits: u64,
    pub heartbeats: u64,
    pub data_packets: u64,
}

#[derive(Debug, Clone)]
pub struct CollectorStats {
    pub uptime_secs: u64,
    pub run_duration: Option<Duration>,
    pub endpoint: EndpointStats,
    pub metrics: MetricsSnapshot,
    pub peers: Vec<PeerInfo>,
    pub silent: Vec<u16>,
}

#[derive(Debug, Serialize)]
pub struct CollectorReport<'a> {
    pub local_addr: String,
    pub checkpoints: &'a [MetricsSnapshot],
    pub final_metrics: &'a MetricsSnapshot,
    pub endpoint: &'a EndpointStats,
    pub peers: Vec<PeerInfo>,
}

/// The collector's receive loop: one socket, one ingest pipeline, all on the calling thread.
pub struct CollectorServer {
    endpoint: CollectorEndpoint,
    pipeline: IngestPipeline<BoxedSink>,
    checkpoints: CheckpointSchedule,
    run_duration: Option<Duration>,
    silent_after: Duration,
    snapshots: Vec<MetricsSnapshot>,
    pending_events: VecDeque<ServerEvent>,
}

impl CollectorServer {
    pub fn new(config: &CollectorConfig, sink: BoxedSink) -> Result<Self, TransportError> {
        let endpoint = CollectorEndpoint::bind(config.bind_addr(), config.poll_interval())?;

        let mut pending_events = VecDeque::new();
        pending_events.push_back(ServerEvent::Listening {
            addr: endpoint.local_addr(),
        });

        Ok(Self {
            endpoint,
            pipeline: IngestPipeline::new(config.ingest(), sink),
            checkpoints: CheckpointSchedule::from_secs(&config.checkpoints_secs),
            run_duration: config.run_duration(),
            silent_after: config.silent_after(),
            snapshots: Vec::new(),
            pending_events,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        self.endpoint.running()
    }

    pub fn is_running(&self) -> bool {
        self.endpoint.is_running()
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn run(&mut self) {
        while self.is_running() {
            self.poll_once();
            self.pending_events.clear();
        }
    }

    /// Waits at most one poll interval for a datagram, then fires any checkpoint that came due.
    pub fn poll_once(&mut self) {
        match self.endpoint.receive() {
            Ok(Some(datagram)) => self.handle_datagram(datagram),
            Ok(None) => {}
            Err(e) => {
                log::error!("collector socket failed: {}", e);
                self.pending_events.push_back(ServerEvent::Error {
                    message: format!("Socket failed: {}", e),
                });
                self.endpoint.shutdown();
            }
        }

        self.check_schedule();
    }

    fn handle_datagram(&mut self, datagram: Datagram) {
        match self.pipeline.handle_datagram(&datagram) {
            Ok(disposition) => {
                if let Some(reply) = disposition.reply {
                    self.endpoint.send_reply(reply, datagram.from);
                }
                self.pending_events
                    .push_back(ServerEvent::Ingest(disposition.event));
            }
            Err(e) => {
                self.endpoint.record_malformed();
                log::warn!(
                    "discarded {}-byte datagram from {}: {}",
                    datagram.bytes.len(),
                    datagram.from,
                    e
                );
                self.pending_events.push_back(ServerEvent::Malformed {
                    from: datagram.from,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn check_schedule(&mut self) {
        let elapsed = self.pipeline.elapsed();

        for mark in self.checkpoints.due(elapsed) {
            let snapshot = self.pipeline.snapshot(SnapshotKind::Checkpoint);
            log::info!("checkpoint at {}s", mark.as_secs());
            for line in snapshot.report_lines() {
                log::info!("[METRIC] {}", line);
            }
            self.snapshots.push(snapshot.clone());
            self.pending_events
                .push_back(ServerEvent::Checkpoint(Box::new(snapshot)));
        }

        if let Some(limit) = self.run_duration {
            if elapsed >= limit && self.is_running() {
                log::info!("run duration of {}s elapsed", limit.as_secs());
                self.pending_events.push_back(ServerEvent::RunElapsed);
                self.endpoint.shutdown();
            }
        }
    }

    /// Stops receiving, commits everything still buffered and returns the final metrics.
    pub fn finish(&mut self) -> MetricsSnapshot {
        self.endpoint.shutdown();
        let snapshot = self.pipeline.finish();

        log::info!("final metrics after {:.1}s", snapshot.elapsed_secs);
        for line in snapshot.report_lines() {
            log::info!("[METRIC] {}", line);
        }
        snapshot
    }

    pub fn checkpoints(&self) -> &[MetricsSnapshot] {
        &self.snapshots
    }

    fn peers(&self) -> Vec<PeerInfo> {
        self.pipeline
            .registry()
            .iter()
            .map(|peer| PeerInfo {
                device_id: peer.device_id,
                addr: peer.addr.to_string(),
                first_seen_secs: peer.first_seen.elapsed().as_secs(),
                last_seen_secs: peer.last_seen.elapsed().as_secs(),
                silent: peer.is_silent(self.silent_after),
                inits: peer.inits,
                heartbeats: peer.heartbeats,
                data_packets: peer.data_packets,
            })
            .collect()
    }

    pub fn stats(&self) -> CollectorStats {
        CollectorStats {
            uptime_secs: self.pipeline.elapsed().as_secs(),
            run_duration: self.run_duration,
            endpoint: self.endpoint.stats().clone(),
            metrics: self.pipeline.snapshot(SnapshotKind::Checkpoint),
            peers: self.peers(),
            silent: self.pipeline.registry().silent(self.silent_after),
        }
    }

    pub fn write_report(&self, path: &Path, final_metrics: &MetricsSnapshot) -> io::Result<()> {
        let report = CollectorReport {
            local_addr: self.local_addr().to_string(),
            checkpoints: &self.snapshots,
            final_metrics,
            endpoint: self.endpoint.stats(),
            peers: self.peers(),
        };
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &report).map_err(io::Error::other)
    }
}
