use std::net::SocketAddr;

use tinytel::{IngestEvent, MetricsSnapshot};

#[derive(Debug, Clone)]
pub enum ServerEvent {
    Listening {
        addr: SocketAddr,
    },
    Ingest(IngestEvent),
    Malformed {
        from: SocketAddr,
        reason: String,
    },
    Checkpoint(Box<MetricsSnapshot>),
    RunElapsed,
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl ServerEvent {
    pub fn severity(&self) -> Severity {
        match self {
            ServerEvent::Malformed { .. } => Severity::Warn,
            ServerEvent::Error { .. } => Severity::Error,
            _ => Severity::Info,
        }
    }

    /// One line for the dashboard log. `None` for events too chatty to show there.
    pub fn describe(&self) -> Option<String> {
        let line = match self {
            ServerEvent::Listening { addr } => format!("Listening on {}", addr),
            ServerEvent::Ingest(IngestEvent::Heartbeat { device_id, from }) => {
                format!("HEARTBEAT from device {} ({})", device_id, from)
            }
            ServerEvent::Ingest(IngestEvent::Init { device_id, from }) => {
                format!("INIT from device {} ({})", device_id, from)
            }
            ServerEvent::Ingest(IngestEvent::Data {
                device_id,
                seq_num,
                accepted,
                duplicates,
                danger,
                committed,
                ..
            }) => {
                let mut line = format!("DATA device {} seq {}", device_id, seq_num);
                if *danger {
                    line.push_str(" [danger, ACK sent]");
                }
                if *accepted == 0 && *duplicates > 0 {
                    line.push_str(" (duplicate)");
                }
                if *committed > 0 {
                    line.push_str(&format!(", committed {}", committed));
                }
                line
            }
            ServerEvent::Ingest(IngestEvent::Ignored { .. }) => return None,
            ServerEvent::Malformed { from, reason } => {
                format!("Discarded datagram from {}: {}", from, reason)
            }
            ServerEvent::Checkpoint(snapshot) => format!(
                "Checkpoint t={:.0}s: {} packets, {} written, {} dup, {} lost",
                snapshot.elapsed_secs,
                snapshot.packets_received,
                snapshot.readings_written,
                snapshot.dup_total,
                snapshot.loss_count
            ),
            ServerEvent::RunElapsed => "Run duration elapsed".to_string(),
            ServerEvent::Error { message } => message.clone(),
        };
        Some(line)
    }
}
