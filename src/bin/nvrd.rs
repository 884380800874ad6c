//! nvrd - network video recorder daemon
//!
//! This daemon:
//! 1. Loads camera and storage configuration (file + environment overrides)
//! 2. Opens the recording database
//! 3. Starts one recorder per configured camera
//! 4. Hands closed segments and motion events to the worker pool
//! 5. Enforces retention on a fixed interval

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use nvr_kernel::{
    cleanup_older_than, storage_stats, CameraStorage, LogNotifier, MqttNotifier,
    NotificationDispatcher, NvrdConfig, PersistenceGateway, Pipeline, ProcessLauncher,
    RecorderDeps, RecorderRegistry, SqlitePersistence, SystemLauncher, TranscodePipeline,
    WorkerPool,
};

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(5 * 60);
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(author, version, about = "Per-camera motion recorder")]
struct Args {
    /// Config file (TOML if the extension is .toml, JSON otherwise).
    #[arg(long, env = "NVR_CONFIG")]
    config: Option<PathBuf>,

    /// Print storage usage per camera and exit.
    #[arg(long)]
    stats: bool,

    /// Run one retention sweep and exit.
    #[arg(long)]
    cleanup: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = match args.config.as_deref() {
        Some(path) => NvrdConfig::load_path(path)?,
        None => NvrdConfig::load()?,
    };
    let storage_root = config.recorder.storage_root.clone();
    let camera_storage = config.camera_storage();

    if args.stats {
        let stats = storage_stats(&camera_storage)?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let persistence = Arc::new(
        SqlitePersistence::open(&config.db_path)
            .with_context(|| format!("open recording database {}", config.db_path))?,
    );

    if args.cleanup {
        let report = cleanup_older_than(
            &camera_storage,
            config.retention(),
            persistence.as_ref(),
        )?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let mqtt = match config.mqtt.as_ref() {
        Some(settings) => Some(Arc::new(MqttNotifier::connect(settings)?)),
        None => None,
    };
    let notifier: Arc<dyn NotificationDispatcher> = match mqtt.as_ref() {
        Some(mqtt) => mqtt.clone() as Arc<dyn NotificationDispatcher>,
        None => Arc::new(LogNotifier),
    };

    let launcher: Arc<dyn ProcessLauncher> = Arc::new(SystemLauncher);
    let pipeline = Pipeline {
        persistence: persistence.clone(),
        notifier,
        transcoder: TranscodePipeline::new(
            config.recorder.transcode.clone(),
            config.recorder.clip.clone(),
            launcher.clone(),
        ),
    };
    let pool = Arc::new(WorkerPool::new(
        pipeline,
        config.worker_threads,
        config.queue_capacity,
    )?);

    let registry = RecorderRegistry::new(RecorderDeps {
        settings: config.recorder.clone(),
        pool: pool.clone(),
        launcher,
    });
    for camera in &config.cameras {
        if let Err(e) = registry.start(camera.clone()) {
            log::error!("{}: failed to start recorder: {:#}", camera.id, e);
        }
    }
    log::info!(
        "nvrd running: {} recorder(s), storage {}, db {}",
        registry.len(),
        storage_root.display(),
        config.db_path
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let mut last_sweep: Option<Instant> = None;
    let mut last_status = Instant::now();
    loop {
        if last_sweep.map_or(true, |at| at.elapsed() >= RETENTION_SWEEP_INTERVAL) {
            sweep(&camera_storage, &config, persistence.as_ref());
            last_sweep = Some(Instant::now());
        }
        if last_status.elapsed() >= STATUS_LOG_INTERVAL {
            log_status(&registry, &pool);
            last_status = Instant::now();
        }
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
    }

    log::info!("shutdown signal received, stopping recorders...");
    registry.stop_all();
    if !pool.wait_idle(SHUTDOWN_DRAIN_TIMEOUT) {
        log::warn!("worker pool still busy after {:?}", SHUTDOWN_DRAIN_TIMEOUT);
    }
    pool.shutdown();
    if let Some(mqtt) = mqtt {
        if let Err(e) = mqtt.disconnect() {
            log::warn!("mqtt disconnect: {}", e);
        }
    }
    Ok(())
}

fn sweep(
    cameras: &[CameraStorage],
    config: &NvrdConfig,
    persistence: &dyn PersistenceGateway,
) {
    match cleanup_older_than(cameras, config.retention(), persistence) {
        Ok(report) if report.removed_files > 0 || report.pruned_records > 0 => log::info!(
            "retention: removed {} file(s), freed {} bytes, pruned {} record(s)",
            report.removed_files,
            report.freed_bytes,
            report.pruned_records
        ),
        Ok(_) => {}
        Err(e) => log::warn!("retention sweep failed: {:#}", e),
    }
}

fn log_status(registry: &RecorderRegistry, pool: &WorkerPool) {
    for status in registry.statuses() {
        log::info!(
            "{}: active={} recording={} state={:?} tier={:?} errors={}",
            status.camera_id,
            status.is_active,
            status.is_recording,
            status.motion_state,
            status.quality_tier,
            status.consecutive_errors
        );
    }
    let stats = pool.stats();
    log::info!(
        "worker pool: submitted={} completed={} dropped={}",
        stats.submitted,
        stats.completed,
        stats.dropped
    );
}
