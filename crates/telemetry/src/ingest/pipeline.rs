use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use cpu_time::ProcessTime;

use super::metrics::{DeviceMetrics, IngestMetrics, MetricsSnapshot, SnapshotKind};
use super::sink::ReadingSink;
use super::stream::{Admission, DeviceStream};
use crate::error::ConfigError;
use crate::net::{DataPacket, Datagram, DeviceRegistry, FormatError, Header, MessageType, Reply};

pub const DEFAULT_FLUSH_THRESHOLD: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestConfig {
    /// Buffered readings per device that trigger an ordered commit.
    pub flush_threshold: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }
}

impl IngestConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_threshold == 0 {
            return Err(ConfigError::Zero("flush_threshold"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    Heartbeat {
        device_id: u16,
        from: SocketAddr,
    },
    Init {
        device_id: u16,
        from: SocketAddr,
    },
    Data {
        device_id: u16,
        seq_num: u32,
        readings: usize,
        accepted: usize,
        duplicates: usize,
        danger: bool,
        committed: u64,
    },
    /// A well-formed header the collector has no use for, such as an ALIVE sent to it.
    Ignored {
        device_id: u16,
        msg_type: MessageType,
    },
}

/// What the receive loop should do with one datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct Disposition {
    pub reply: Option<Reply>,
    pub event: IngestEvent,
}

impl Disposition {
    fn silent(event: IngestEvent) -> Self {
        Self { reply: None, event }
    }
}

/// Collector-side processing of decoded traffic. Owns every per-device stream, the metrics
/// aggregator and the sink; the receive loop only moves bytes in and replies out.
pub struct IngestPipeline<S: ReadingSink> {
    config: IngestConfig,
    sink: S,
    streams: BTreeMap<u16, DeviceStream>,
    registry: DeviceRegistry,
    metrics: IngestMetrics,
    started: Instant,
    finished: bool,
}

impl<S: ReadingSink> IngestPipeline<S> {
    pub fn new(config: IngestConfig, sink: S) -> Self {
        Self {
            config,
            sink,
            streams: BTreeMap::new(),
            registry: DeviceRegistry::new(),
            metrics: IngestMetrics::new(),
            started: Instant::now(),
            finished: false,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn stream(&self, device_id: u16) -> Option<&DeviceStream> {
        self.streams.get(&device_id)
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Malformed input is counted here and returned as an error; the caller logs it and moves on.
    pub fn handle_datagram(&mut self, datagram: &Datagram) -> Result<Disposition, FormatError> {
        let header = Header::decode(&datagram.bytes).inspect_err(|_| self.metrics.record_malformed())?;

        match header.msg_type {
            MessageType::Heartbeat => {
                self.registry
                    .record(header.device_id, datagram.from, MessageType::Heartbeat);
                self.metrics.record_heartbeat();
                log::info!(
                    "HEARTBEAT from device {} at {}",
                    header.device_id,
                    datagram.from
                );
                Ok(Disposition {
                    reply: Some(Reply::Alive),
                    event: IngestEvent::Heartbeat {
                        device_id: header.device_id,
                        from: datagram.from,
                    },
                })
            }
            MessageType::Init => {
                self.registry
                    .record(header.device_id, datagram.from, MessageType::Init);
                self.metrics.record_init();
                log::info!("INIT from device {} at {}", header.device_id, datagram.from);
                Ok(Disposition::silent(IngestEvent::Init {
                    device_id: header.device_id,
                    from: datagram.from,
                }))
            }
            MessageType::Data => self.handle_data(datagram),
            MessageType::Alive => {
                log::trace!(
                    "ignoring {} from device {}",
                    header.msg_type.as_str(),
                    header.device_id
                );
                Ok(Disposition::silent(IngestEvent::Ignored {
                    device_id: header.device_id,
                    msg_type: header.msg_type,
                }))
            }
        }
    }

    fn handle_data(&mut self, datagram: &Datagram) -> Result<Disposition, FormatError> {
        let cpu_start = ProcessTime::try_now().ok();

        let packet =
            DataPacket::decode(&datagram.bytes).inspect_err(|_| self.metrics.record_malformed())?;
        let header = packet.header;
        let device_id = header.device_id;

        self.registry.record(device_id, datagram.from, MessageType::Data);

        let stream = self
            .streams
            .entry(device_id)
            .or_insert_with(|| DeviceStream::new(device_id));

        let mut accepted = 0;
        let mut duplicates = 0;
        for (seq, &value) in packet.sequences().zip(&packet.readings) {
            match stream.admit(seq, header.timestamp, value, datagram.arrival) {
                Admission::Accepted => accepted += 1,
                Admission::Duplicate { first_time } => {
                    duplicates += 1;
                    self.metrics.record_duplicate(device_id, first_time);
                }
            }
        }

        if accepted > 0 {
            self.metrics
                .record_accepted_packet(device_id, datagram.bytes.len(), accepted);
        }

        let mut committed = 0;
        for batch in stream.take_due(self.config.flush_threshold) {
            let summary = stream.commit(batch, &mut self.sink);
            self.metrics.record_commit(device_id, &summary);
            committed += summary.written;
        }

        if accepted > 0 {
            if let Some(spent) = cpu_start.and_then(|start| start.try_elapsed().ok()) {
                self.metrics.record_cpu(spent);
            }
        }

        let reply = if header.is_danger() {
            self.metrics.record_ack();
            Some(Reply::Ack {
                seq: header.seq_num,
            })
        } else {
            None
        };

        if duplicates > 0 {
            log::debug!(
                "DATA from device {} seq {}: {} duplicate reading(s)",
                device_id,
                header.seq_num,
                duplicates
            );
        }
        log::info!(
            "DATA from device {} seq {} value {:?}{}",
            device_id,
            header.seq_num,
            packet.readings,
            if header.is_danger() { " [danger]" } else { "" }
        );

        Ok(Disposition {
            reply,
            event: IngestEvent::Data {
                device_id,
                seq_num: header.seq_num,
                readings: packet.readings.len(),
                accepted,
                duplicates,
                danger: header.is_danger(),
                committed,
            },
        })
    }

    pub fn device_metrics(&self) -> Vec<DeviceMetrics> {
        self.streams
            .values()
            .map(|stream| DeviceMetrics {
                last_written: stream.last_written(),
                max_seq_seen: stream.max_seq_seen(),
                pending: stream.pending_len(),
                ..self.metrics.device_metrics(stream.device_id())
            })
            .collect()
    }

    pub fn snapshot(&self, kind: SnapshotKind) -> MetricsSnapshot {
        self.metrics
            .snapshot(kind, self.elapsed(), self.device_metrics())
    }

    /// Commits every buffered reading, reconciles losses and flushes the sink. Calling it again
    /// only re-reads the final counters.
    pub fn finish(&mut self) -> MetricsSnapshot {
        if !self.finished {
            self.finished = true;

            for stream in self.streams.values_mut() {
                let device_id = stream.device_id();
                let batch = stream.drain();
                if !batch.is_empty() {
                    let summary = stream.commit(batch, &mut self.sink);
                    self.metrics.record_commit(device_id, &summary);
                }

                let missing = stream.unaccounted();
                if missing > 0 {
                    log::debug!("device {}: {} sequence(s) never arrived", device_id, missing);
                    self.metrics.record_loss(device_id, missing);
                }
            }

            if let Err(e) = self.sink.flush() {
                log::error!("failed to flush sink: {}", e);
                self.metrics.record_sink_error();
            }
        }

        self.snapshot(SnapshotKind::Final)
    }
}
