//! camerad - camera processing worker daemon
//!
//! This daemon:
//! 1. Loads configuration (WORKER_CONFIG file + environment overrides)
//! 2. Fetches the camera catalog from the backend
//! 3. Starts one pipeline per selected camera, or per enabled camera by default
//! 4. Logs pipeline and dispatch status periodically
//! 5. Stops every pipeline and drains pending alerts on Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use camera_worker::{
    BackendRegistry, CatalogClient, HttpCollector, RtspOpener, Supervisor, WorkerConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Supervise per-camera detection pipelines")]
struct Args {
    /// Camera id to start (repeatable). Without it every enabled camera is started.
    #[arg(long = "camera", value_name = "ID")]
    cameras: Vec<String>,

    /// Seconds between status log lines.
    #[arg(long, env = "STATUS_INTERVAL", default_value_t = 30)]
    status_interval: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = WorkerConfig::load()?;

    log::info!(
        "camerad {} starting: backend={} port={} detector={}",
        env!("CARGO_PKG_VERSION"),
        cfg.backend_url,
        cfg.port,
        cfg.detector_model
    );

    let sources = Arc::new(RtspOpener {
        target_fps: cfg.pipeline.target_fps,
        width: cfg.source.width,
        height: cfg.source.height,
    });
    let detectors = Arc::new(BackendRegistry::with_builtin());
    log::info!("detector backends: {}", detectors.list().join(", "));
    if !detectors.resolves(&cfg.detector_model) {
        anyhow::bail!("detector model '{}' is not registered", cfg.detector_model);
    }
    let collector = Arc::new(HttpCollector::new(&cfg.backend_url, cfg.dispatch.timeout));
    let catalog = CatalogClient::new(&cfg.backend_url, cfg.dispatch.timeout);
    let supervisor = Supervisor::new(sources, detectors, collector, cfg.supervisor_config())?;

    if args.cameras.is_empty() {
        let cameras = catalog.list()?;
        let started = supervisor.start_enabled(&cameras);
        log::info!("started {} of {} catalog cameras", started.len(), cameras.len());
    } else {
        for camera_id in &args.cameras {
            if let Err(err) = supervisor.start_from_catalog(camera_id, &catalog) {
                log::warn!("failed to start camera {}: {:#}", camera_id, err);
            }
        }
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("camerad running, waiting for shutdown signal (Ctrl-C)...");
    let interval = Duration::from_secs(args.status_interval.max(1));
    loop {
        match rx.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => log_status(&supervisor),
        }
    }

    log::info!("shutdown signal received, stopping pipelines...");
    let report = supervisor.shutdown();
    log::info!(
        "stopped {} cameras ({} with release failures)",
        report.stopped.len() + report.failed.len(),
        report.failed.len()
    );
    Ok(())
}

fn log_status(supervisor: &Supervisor) {
    let snapshot = supervisor.status_snapshot();
    for status in snapshot.values() {
        log::info!(
            "camera {} running={} frames={} processed={} read_failures={} alerts={}",
            status.camera_id,
            status.running,
            status.frame_count,
            status.frames_processed,
            status.read_failures,
            status.alerts_queued
        );
    }
    let dispatch = supervisor.dispatch_stats();
    log::info!(
        "active cameras={} alerts delivered={} failed={} dropped={}",
        snapshot.len(),
        dispatch.delivered,
        dispatch.failed,
        dispatch.dropped
    );
}
