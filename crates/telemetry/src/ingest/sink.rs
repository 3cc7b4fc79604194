use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub const CSV_HEADER: &str =
    "device_id,seq_num,timestamp,value,duplicate_flag,gap_flag,arrival_time";

/// One reading committed to the persisted log.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedRow {
    pub device_id: u16,
    pub seq_num: u32,
    pub timestamp: u32,
    pub value: u16,
    pub duplicate: bool,
    pub gap: bool,
    pub arrival: SystemTime,
}

impl CommittedRow {
    pub fn arrival_secs(&self) -> f64 {
        self.arrival
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Append-only destination for committed readings.
pub trait ReadingSink {
    fn append(&mut self, row: &CommittedRow) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;
}

impl<S: ReadingSink + ?Sized> ReadingSink for Box<S> {
    fn append(&mut self, row: &CommittedRow) -> io::Result<()> {
        (**self).append(row)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    pub rows: Vec<CommittedRow>,
    pub flushes: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sequences(&self, device_id: u16) -> Vec<u32> {
        self.rows
            .iter()
            .filter(|r| r.device_id == device_id)
            .map(|r| r.seq_num)
            .collect()
    }
}

impl ReadingSink for MemorySink {
    fn append(&mut self, row: &CommittedRow) -> io::Result<()> {
        self.rows.push(row.clone());
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

pub struct CsvSink<W: Write> {
    writer: W,
    header_written: bool,
}

impl CsvSink<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> CsvSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            header_written: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn ensure_header(&mut self) -> io::Result<()> {
        if !self.header_written {
            writeln!(self.writer, "{}", CSV_HEADER)?;
            self.header_written = true;
        }
        Ok(())
    }
}

impl<W: Write> ReadingSink for CsvSink<W> {
    fn append(&mut self, row: &CommittedRow) -> io::Result<()> {
        self.ensure_header()?;
        writeln!(
            self.writer,
            "{},{},{},{},{},{},{:.6}",
            row.device_id,
            row.seq_num,
            row.timestamp,
            row.value,
            row.duplicate as u8,
            row.gap as u8,
            row.arrival_secs()
        )
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ensure_header()?;
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_csv_rows() {
        let mut sink = CsvSink::new(Vec::new());
        sink.append(&CommittedRow {
            device_id: 7,
            seq_num: 3,
            timestamp: 1_700_000_000,
            value: 42,
            duplicate: false,
            gap: true,
            arrival: UNIX_EPOCH + Duration::from_millis(1_700_000_000_500),
        })
        .unwrap();
        sink.flush().unwrap();

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1], "7,3,1700000000,42,0,1,1700000000.500000");
    }

    #[test]
    fn test_empty_log_still_has_header() {
        let mut sink = CsvSink::new(Vec::new());
        sink.flush().unwrap();
        assert_eq!(String::from_utf8(sink.into_inner()).unwrap(), format!("{CSV_HEADER}\n"));
    }
}
