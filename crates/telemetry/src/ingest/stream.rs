use std::collections::{BTreeMap, HashSet};
use std::time::SystemTime;

use super::sink::{CommittedRow, ReadingSink};

/// Buffer growth beyond `threshold * VALVE_FACTOR` forces out the oldest arrivals.
pub const VALVE_FACTOR: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct BufferedReading {
    pub seq: u32,
    pub timestamp: u32,
    pub value: u16,
    pub arrival: SystemTime,
    arrival_order: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Duplicate { first_time: bool },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub written: u64,
    pub duplicates: u64,
    pub new_duplicate_seqs: u64,
    pub lost: u64,
    pub gaps: u64,
    pub sink_errors: u64,
}

/// Per-device sequence state on the collector.
///
/// `last_written` only moves forward. Anything at or below it, or already waiting in the reorder
/// buffer, is a duplicate and is never buffered or written again.
#[derive(Debug)]
pub struct DeviceStream {
    device_id: u16,
    last_written: Option<u32>,
    max_seq_seen: Option<u32>,
    pending: BTreeMap<u32, BufferedReading>,
    duplicated: HashSet<u32>,
    next_arrival: u64,
}

impl DeviceStream {
    pub fn new(device_id: u16) -> Self {
        Self {
            device_id,
            last_written: None,
            max_seq_seen: None,
            pending: BTreeMap::new(),
            duplicated: HashSet::new(),
            next_arrival: 0,
        }
    }

    pub fn device_id(&self) -> u16 {
        self.device_id
    }

    pub fn last_written(&self) -> Option<u32> {
        self.last_written
    }

    pub fn max_seq_seen(&self) -> Option<u32> {
        self.max_seq_seen
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_duplicate(&self, seq: u32) -> bool {
        self.last_written.is_some_and(|lw| seq <= lw) || self.pending.contains_key(&seq)
    }

    pub fn observe(&mut self, seq: u32) {
        self.max_seq_seen = Some(self.max_seq_seen.map_or(seq, |max| max.max(seq)));
    }

    pub fn admit(&mut self, seq: u32, timestamp: u32, value: u16, arrival: SystemTime) -> Admission {
        self.observe(seq);

        if self.is_duplicate(seq) {
            return Admission::Duplicate {
                first_time: self.duplicated.insert(seq),
            };
        }

        let arrival_order = self.next_arrival;
        self.next_arrival += 1;
        self.pending.insert(
            seq,
            BufferedReading {
                seq,
                timestamp,
                value,
                arrival,
                arrival_order,
            },
        );
        Admission::Accepted
    }

    /// Batches ready to commit, in commit order. Once the buffer reaches `threshold` it is
    /// released whole; if it has grown past the safety valve, the oldest arrivals are first forced
    /// out `threshold` at a time so they commit ahead of later traffic.
    pub fn take_due(&mut self, threshold: usize) -> Vec<Vec<BufferedReading>> {
        let threshold = threshold.max(1);
        let mut batches = Vec::new();

        if self.pending.len() > threshold * VALVE_FACTOR {
            log::warn!(
                "device {} reorder buffer overran ({} entries), forcing out oldest arrivals",
                self.device_id,
                self.pending.len()
            );

            let mut by_arrival: Vec<(u64, u32)> = self
                .pending
                .values()
                .map(|r| (r.arrival_order, r.seq))
                .collect();
            by_arrival.sort_unstable();

            let mut oldest = by_arrival.into_iter().map(|(_, seq)| seq);
            while self.pending.len() > threshold * VALVE_FACTOR {
                let batch: Vec<_> = oldest
                    .by_ref()
                    .take(threshold)
                    .filter_map(|seq| self.pending.remove(&seq))
                    .collect();
                batches.push(batch);
            }
        }

        if self.pending.len() >= threshold {
            batches.push(self.drain());
        }

        batches
    }

    pub fn drain(&mut self) -> Vec<BufferedReading> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    /// Writes a batch in sender-timestamp order, filling `expected` forward from `last_written`.
    pub fn commit<S: ReadingSink + ?Sized>(
        &mut self,
        mut batch: Vec<BufferedReading>,
        sink: &mut S,
    ) -> CommitSummary {
        let mut summary = CommitSummary::default();
        batch.sort_by_key(|r| (r.timestamp, r.seq));

        let mut expected: u64 = self.last_written.map_or(0, |lw| lw as u64 + 1);
        let mut highest = None;

        for reading in batch {
            let seq = reading.seq as u64;

            if seq < expected {
                summary.duplicates += 1;
                if self.duplicated.insert(reading.seq) {
                    summary.new_duplicate_seqs += 1;
                }
                continue;
            }

            let gap = seq > expected;
            if gap {
                summary.lost += seq - expected;
                summary.gaps += 1;
            }

            let row = CommittedRow {
                device_id: self.device_id,
                seq_num: reading.seq,
                timestamp: reading.timestamp,
                value: reading.value,
                duplicate: false,
                gap,
                arrival: reading.arrival,
            };
            match sink.append(&row) {
                Ok(()) => summary.written += 1,
                Err(e) => {
                    log::error!(
                        "sink rejected device {} seq {}: {}",
                        self.device_id,
                        reading.seq,
                        e
                    );
                    summary.sink_errors += 1;
                }
            }

            expected = seq + 1;
            highest = Some(reading.seq);
        }

        if let Some(highest) = highest {
            self.last_written = Some(self.last_written.map_or(highest, |lw| lw.max(highest)));
        }

        summary
    }

    /// Sequences up to `max_seq_seen` that were neither committed nor are still buffered.
    pub fn unaccounted(&self) -> u64 {
        let Some(max) = self.max_seq_seen else {
            return 0;
        };
        let start = self.last_written.map_or(0, |lw| lw as u64 + 1);
        if start > max as u64 {
            return 0;
        }

        let span = max as u64 - start + 1;
        let buffered = self.pending.range(start as u32..=max).count() as u64;
        span - buffered
    }
}
