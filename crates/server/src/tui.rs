use std::collections::VecDeque;

use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Row, Table};

use crate::events::Severity;
use crate::server::CollectorStats;

const MAX_LOG_LINES: usize = 500;

#[derive(Debug, Clone)]
struct LogLine {
    severity: Severity,
    text: String,
}

#[derive(Debug, Default)]
pub struct TuiState {
    log: VecDeque<LogLine>,
    /// Lines scrolled back from the newest entry.
    scroll: usize,
}

impl TuiState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&mut self, severity: Severity, text: impl Into<String>) {
        if self.log.len() == MAX_LOG_LINES {
            self.log.pop_front();
        }
        self.log.push_back(LogLine {
            severity,
            text: text.into(),
        });
    }

    pub fn log_info(&mut self, text: impl Into<String>) {
        self.log(Severity::Info, text);
    }

    pub fn scroll_up(&mut self) {
        self.scroll = (self.scroll + 5).min(self.log.len().saturating_sub(1));
    }

    pub fn scroll_down(&mut self) {
        self.scroll = self.scroll.saturating_sub(5);
    }

    pub fn scroll_to_bottom(&mut self) {
        self.scroll = 0;
    }
}

pub fn render(frame: &mut Frame, state: &TuiState, stats: &CollectorStats) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(8),
            Constraint::Length(8),
            Constraint::Min(5),
            Constraint::Length(3),
        ])
        .split(frame.area());

    render_header(frame, chunks[0], stats);
    render_metrics(frame, chunks[1], stats);
    render_devices(frame, chunks[2], stats);
    render_log(frame, chunks[3], state);
    render_help(frame, chunks[4]);
}

fn render_header(frame: &mut Frame, area: Rect, stats: &CollectorStats) {
    let remaining = match stats.run_duration {
        Some(limit) => format_duration(limit.as_secs().saturating_sub(stats.uptime_secs)),
        None => "--:--:--".to_string(),
    };
    let title = format!(" TinyTelemetry Collector - Uptime: {} ", format_duration(stats.uptime_secs));

    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let text = format!(
        "Devices: {} ({} silent)  |  Datagrams: {}  |  Remaining: {}",
        stats.peers.len(),
        stats.silent.len(),
        stats.endpoint.datagrams_received,
        remaining
    );

    frame.render_widget(
        Paragraph::new(text)
            .block(block)
            .style(Style::default().fg(Color::White)),
        area,
    );
}

fn metric(label: &str, value: String, alert: bool) -> Line<'static> {
    Line::from(vec![
        Span::styled(format!("{}: ", label), Style::default().fg(Color::Gray)),
        Span::styled(
            value,
            Style::default().fg(if alert { Color::Red } else { Color::White }),
        ),
    ])
}

fn render_metrics(frame: &mut Frame, area: Rect, stats: &CollectorStats) {
    let block = Block::default()
        .title(" Delivery ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow));

    let m = &stats.metrics;
    let lines = vec![
        metric(
            "Packets",
            format!(
                "{} accepted / {} readings written",
                m.packets_received, m.readings_written
            ),
            false,
        ),
        metric(
            "Duplicates",
            format!("{} total, {} distinct", m.dup_total, m.dup_seq_count),
            false,
        ),
        metric("Lost", m.loss_count.to_string(), m.loss_count > 0),
        metric(
            "Bytes/report",
            format!("{:.2} ({} accepted)", m.bytes_per_report, format_bytes(m.bytes_accepted)),
            false,
        ),
        metric(
            "CPU/reading",
            format!("{:.4} ms", m.cpu_ms_per_reading),
            false,
        ),
        metric(
            "Replies",
            format!(
                "{} sent, {} ACK, {} malformed in",
                stats.endpoint.replies_sent, m.acks_sent, stats.endpoint.malformed
            ),
            stats.endpoint.malformed > 0,
        ),
    ];

    frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_devices(frame: &mut Frame, area: Rect, stats: &CollectorStats) {
    let block = Block::default()
        .title(" Devices ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Green));

    let header = Row::new(vec![
        "Device", "Address", "Written", "Dup", "Lost", "Last", "Max", "Buffered", "Since", "Seen",
    ])
    .style(Style::default().fg(Color::Gray).add_modifier(Modifier::BOLD));

    let rows: Vec<Row> = stats
        .peers
        .iter()
        .map(|peer| {
            let device = stats
                .metrics
                .devices
                .iter()
                .find(|d| d.device_id == peer.device_id);
            let seq = |s: Option<u32>| s.map_or_else(|| "-".to_string(), |s| s.to_string());

            Row::new(vec![
                peer.device_id.to_string(),
                peer.addr.clone(),
                device.map_or(0, |d| d.readings_written).to_string(),
                device.map_or(0, |d| d.dup_total).to_string(),
                device.map_or(0, |d| d.loss_count).to_string(),
                seq(device.and_then(|d| d.last_written)),
                seq(device.and_then(|d| d.max_seq_seen)),
                device.map_or(0, |d| d.pending).to_string(),
                format_duration(peer.first_seen_secs),
                format!("{}s ago", peer.last_seen_secs),
            ])
            .style(Style::default().fg(if peer.silent { Color::Red } else { Color::White }))
        })
        .collect();

    let widths = [
        Constraint::Length(7),
        Constraint::Length(22),
        Constraint::Length(8),
        Constraint::Length(5),
        Constraint::Length(5),
        Constraint::Length(6),
        Constraint::Length(6),
        Constraint::Length(9),
        Constraint::Length(9),
        Constraint::Min(8),
    ];

    frame.render_widget(Table::new(rows, widths).header(header).block(block), area);
}

fn render_log(frame: &mut Frame, area: Rect, state: &TuiState) {
    let block = Block::default()
        .title(" Events ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Blue));

    let visible = area.height.saturating_sub(2) as usize;
    let end = state.log.len().saturating_sub(state.scroll);
    let start = end.saturating_sub(visible);

    let lines: Vec<Line> = state
        .log
        .range(start..end)
        .map(|line| {
            let color = match line.severity {
                Severity::Info => Color::White,
                Severity::Warn => Color::Yellow,
                Severity::Error => Color::Red,
            };
            Line::from(Span::styled(line.text.clone(), Style::default().fg(color)))
        })
        .collect();

    frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_help(frame: &mut Frame, area: Rect) {
    let block = Block::default()
        .title(" Controls ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));

    let text = Paragraph::new("'q'/ESC stop and flush  |  PgUp/PgDn scroll  |  End follow")
        .block(block)
        .style(
            Style::default()
                .fg(Color::DarkGray)
                .add_modifier(Modifier::ITALIC),
        );

    frame.render_widget(text, area);
}

fn format_duration(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
