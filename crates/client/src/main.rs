mod config;

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinSet;

use config::FleetConfig;
use tinytel::{ClientSession, ImpairmentScheduler, Liveness, Outbound, SessionReport};

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "Simulated TinyTelemetry devices")]
struct Args {
    #[arg(short, long, help = "TOML config file; flags below override it")]
    config: Option<PathBuf>,

    #[arg(short = 's', long, help = "Collector address (e.g., 127.0.0.1:12000)")]
    collector: Option<String>,

    #[arg(long, value_delimiter = ',', help = "Device ids to simulate")]
    devices: Option<Vec<u16>>,

    #[arg(short = 'd', long, help = "Run duration in seconds")]
    run_duration: Option<u64>,

    #[arg(long, help = "Milliseconds between readings")]
    data_interval: Option<u64>,

    #[arg(long, help = "Enable network impairment")]
    impair: bool,

    #[arg(long, help = "Drop probability (0-1)")]
    loss: Option<f64>,

    #[arg(long, help = "Base delay in ms")]
    delay: Option<u64>,

    #[arg(long, help = "Jitter in ms")]
    jitter: Option<u64>,

    #[arg(short, long, help = "Write per-device session reports as JSON")]
    report: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<FleetConfig> {
        let mut config = match &self.config {
            Some(path) => FleetConfig::load(path)?,
            None => FleetConfig::default(),
        };

        if let Some(collector) = self.collector {
            config.collector = collector;
        }
        if let Some(devices) = self.devices {
            config.device_ids = devices;
        }
        if let Some(secs) = self.run_duration {
            config.run_duration_secs = secs;
        }
        if let Some(ms) = self.data_interval {
            config.data_interval_ms = ms;
        }
        config.impairment.enabled |= self.impair;
        if let Some(loss) = self.loss {
            config.impairment.loss_probability = loss;
        }
        if let Some(delay) = self.delay {
            config.impairment.base_delay_ms = delay;
        }
        if let Some(jitter) = self.jitter {
            config.impairment.jitter_ms = jitter;
        }
        if self.report.is_some() {
            config.report_path = self.report;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config()?;
    let collector = config.collector_addr()?;

    let outbound = if config.impairment.enabled {
        let impairment = config.impairment();
        log::info!(
            "impairment on: loss={} delay={}ms jitter={}ms",
            impairment.loss_probability,
            impairment.base_delay_ms,
            impairment.jitter_ms
        );
        Outbound::Impaired(Arc::new(ImpairmentScheduler::new(impairment)?))
    } else {
        Outbound::Direct
    };

    let liveness = Liveness::new();
    let mut sessions = JoinSet::new();
    for &device_id in &config.device_ids {
        let session = ClientSession::bind(
            config.session(device_id, collector),
            outbound.clone(),
            liveness.clone(),
        )
        .await
        .with_context(|| format!("binding socket for device {}", device_id))?;
        log::info!(
            "device {} bound to {:?}, collector {}",
            device_id,
            session.local_addr().ok(),
            collector
        );
        sessions.spawn(session.run());
    }

    let mut reports = Vec::new();
    loop {
        tokio::select! {
            joined = sessions.join_next() => match joined {
                Some(Ok(Ok(report))) => reports.push(report),
                Some(Ok(Err(e))) => log::error!("session failed to start: {}", e),
                Some(Err(e)) => log::error!("session task aborted: {}", e),
                None => break,
            },
            Ok(()) = tokio::signal::ctrl_c(), if liveness.is_alive() => {
                log::info!("interrupted, stopping all sessions");
                liveness.trip();
            }
        }
    }

    if let Outbound::Impaired(scheduler) = &outbound {
        let stranded = scheduler.drain(config.drain_timeout()).await;
        if stranded > 0 {
            log::warn!("{} delayed packets were still queued at exit", stranded);
        }
        let stats = scheduler.stats();
        log::info!(
            "impairment: {} submitted, {} dropped, {} delayed, {} dispatched",
            stats.submitted,
            stats.dropped,
            stats.delayed,
            stats.dispatched
        );
    }

    reports.sort_by_key(|r| r.device_id);
    for report in &reports {
        print_report(report);
    }

    if let Some(path) = &config.report_path {
        let writer = BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        );
        serde_json::to_writer_pretty(writer, &reports)
            .with_context(|| format!("writing report {}", path.display()))?;
    }

    if !liveness.is_alive() {
        log::warn!("sessions ended early: collector unreachable or interrupted");
    }
    log::info!("run complete");

    Ok(())
}

fn print_report(report: &SessionReport) {
    log::info!(
        "[CLIENT {}] {:?}: {} readings ({} sends), {} danger: {} acked / {} abandoned, heartbeats {}/{} answered{}",
        report.device_id,
        report.end_reason,
        report.readings_sent,
        report.data_sends,
        report.danger_readings,
        report.acknowledged,
        report.abandoned,
        report.heartbeats_answered,
        report.heartbeats_sent,
        report
            .srtt_ms
            .map(|srtt| format!(", srtt {:.1}ms", srtt))
            .unwrap_or_default()
    );
}
