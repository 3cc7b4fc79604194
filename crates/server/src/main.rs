mod config;
mod events;
mod server;
mod tui;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{cursor, execute};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;

use config::CollectorConfig;
use server::CollectorServer;
use tinytel::{CsvSink, MetricsSnapshot};
use tui::TuiState;

#[derive(Parser)]
#[command(name = "tinytel-server")]
#[command(about = "TinyTelemetry collector")]
struct Args {
    #[arg(short, long, help = "TOML config file; flags below override it")]
    config: Option<PathBuf>,

    #[arg(short, long)]
    bind: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short = 'd', long, help = "Seconds to run before flushing and exiting (0 = until 'q')")]
    run_duration: Option<u64>,

    #[arg(long, help = "Receive poll interval in ms")]
    poll_interval: Option<u64>,

    #[arg(short, long, help = "Buffered readings per device that trigger a commit")]
    flush_threshold: Option<usize>,

    #[arg(long, value_delimiter = ',', help = "Metrics checkpoints, seconds since start")]
    checkpoints: Option<Vec<u64>>,

    #[arg(short, long, help = "CSV file for committed readings")]
    sink: Option<PathBuf>,

    #[arg(short, long, help = "Write checkpoints and final metrics as JSON")]
    report: Option<PathBuf>,

    #[arg(long)]
    headless: bool,
}

impl Args {
    fn into_config(self) -> Result<CollectorConfig> {
        let mut config = match &self.config {
            Some(path) => CollectorConfig::load(path)?,
            None => CollectorConfig::default(),
        };

        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(secs) = self.run_duration {
            config.run_duration_secs = secs;
        }
        if let Some(ms) = self.poll_interval {
            config.poll_interval_ms = ms;
        }
        if let Some(threshold) = self.flush_threshold {
            config.flush_threshold = threshold;
        }
        if let Some(checkpoints) = self.checkpoints {
            config.checkpoints_secs = checkpoints;
        }
        if let Some(sink) = self.sink {
            config.sink_path = sink;
        }
        if self.report.is_some() {
            config.report_path = self.report;
        }
        config.headless |= self.headless;

        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let config = Args::parse().into_config()?;

    let sink = CsvSink::create(&config.sink_path)
        .with_context(|| format!("creating {}", config.sink_path.display()))?;
    let mut server = CollectorServer::new(&config, Box::new(sink))
        .with_context(|| format!("starting collector on {}", config.bind_addr()))?;

    let final_metrics = if config.headless {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
        stop_on_interrupt(server.running())?;
        log::info!("Collector listening on {}", server.local_addr());
        server.run();
        server.finish()
    } else {
        run_with_tui(&mut server)?
    };

    if let Some(path) = &config.report_path {
        server
            .write_report(path, &final_metrics)
            .with_context(|| format!("writing report {}", path.display()))?;
    }

    if !config.headless {
        print_summary(&final_metrics);
    }

    Ok(())
}

/// Ctrl-C ends the receive loop instead of the process, so buffered readings still get committed.
fn stop_on_interrupt(running: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        log::info!("interrupted, flushing and shutting down");
        running.store(false, Ordering::SeqCst);
    })
    .context("installing Ctrl-C handler")
}

fn print_summary(metrics: &MetricsSnapshot) {
    println!("[SERVER] Shutdown complete after {:.1}s", metrics.elapsed_secs);
    if metrics.packets_received == 0 {
        println!("[METRIC] No packets received.");
    }
    for line in metrics.report_lines() {
        println!("[METRIC] {}", line);
    }
}

fn run_with_tui(server: &mut CollectorServer) -> io::Result<MetricsSnapshot> {
    terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, cursor::Hide)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let running = server.running();
    let mut tui_state = TuiState::new();

    while running.load(Ordering::SeqCst) {
        server.poll_once();

        for event in server.drain_events() {
            if let Some(line) = event.describe() {
                tui_state.log(event.severity(), line);
            }
        }

        while event::poll(Duration::ZERO)? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                match key.code {
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        running.store(false, Ordering::SeqCst);
                    }
                    KeyCode::Char('q') | KeyCode::Esc => {
                        running.store(false, Ordering::SeqCst);
                    }
                    KeyCode::PageUp => tui_state.scroll_up(),
                    KeyCode::PageDown => tui_state.scroll_down(),
                    KeyCode::End => tui_state.scroll_to_bottom(),
                    _ => {}
                }
            }
        }

        let stats = server.stats();
        terminal.draw(|frame| {
            tui::render(frame, &tui_state, &stats);
        })?;
    }

    tui_state.log_info("Flushing buffered readings...");
    let final_metrics = server.finish();

    terminal::disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, cursor::Show)?;

    Ok(final_metrics)
}
