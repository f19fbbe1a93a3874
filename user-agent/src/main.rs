// src/main.rs

//! Agent entry-point.
//!
//! 1. Parse configuration & set up diagnostic logging
//! 2. Start the log writer and, if configured, the metrics endpoint
//! 3. Start the pipeline and attach it to the kernel ring
//! 4. Report stats on an interval until Ctrl-C
//! 5. Stop the router, drain the pipeline, flush the log

// ───── std / 3rd-party imports ──────────────────────────────────────────────
use agent::comms::{memory_ring::MemoryRing, router::RingRouter};
use agent::config::{self, Config};
use agent::output::{self, names::{NameResolver, SystemNames}, LogQueue};
use agent::pipeline::{Monitor, MonitorStats};
use agent::scanner::codesign::SystemImageVerifier;
use anyhow::Context;
use chrono::Local;
use fern::Dispatch;
use log::LevelFilter;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{
    path::{Path, PathBuf},
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};
use tokio::runtime::Runtime;

// ───── helpers ──────────────────────────────────────────────────────────────

/// Print an error with context and terminate the process.
macro_rules! fatal {
    ($ctx:expr, $($arg:tt)+) => {{
        eprintln!(
            "[{}][ERROR][{}] {}",
            chrono::Local::now().to_rfc3339(),
            $ctx,
            format!($($arg)+)
        );
        std::process::exit(1);
    }};
}

/// Directory that contains the running executable.
fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| fatal!("main", "cannot determine executable directory"))
}

/// The path given as first argument, else `hostmon.toml` next to the
/// executable. Only the implicit file may be missing.
fn load_cfg(exe_dir: &Path) -> Config {
    match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => config::load(&path).unwrap_or_else(|e| fatal!("config", "{}: {}", path.display(), e)),
        None => {
            let path = exe_dir.join("hostmon.toml");
            if path.exists() {
                config::load(&path).unwrap_or_else(|e| fatal!("config", "{}: {}", path.display(), e))
            } else {
                Config::default()
            }
        }
    }
}

/// Configure diagnostic logging as requested in `cfg.logging`. Goes to
/// stderr so stdout stays free for audit records.
fn setup_logging(exe_dir: &Path, cfg: &Config) -> Result<(), fern::InitError> {
    let level = match cfg.logging.level.to_uppercase().as_str() {
        "ERROR" => LevelFilter::Error,
        "WARN" => LevelFilter::Warn,
        "DEBUG" => LevelFilter::Debug,
        "TRACE" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    let log_path = cfg
        .logging
        .enable
        .then(|| exe_dir.join(cfg.logging.file.as_deref().unwrap_or("agent.log")));

    let mut dispatch = Dispatch::new()
        .format(|out, msg, record| {
            out.finish(format_args!(
                "[{}][{:5}][{}][pid={}][tid={:?}] {}",
                Local::now().to_rfc3339(),
                record.level(),
                record.target(),
                process::id(),
                thread::current().id(),
                msg
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if let Some(path) = log_path {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}

// ───── agent logic ──────────────────────────────────────────────────────────

async fn run(cfg: Config) -> anyhow::Result<()> {
    // 1 ─ Output
    let stats = Arc::new(MonitorStats::default());
    let (log, rx) = LogQueue::new(cfg.pipeline.log_queue_capacity, Arc::clone(&stats.log));
    let names = cfg
        .output
        .resolve_users_groups
        .then(|| Arc::new(SystemNames::new()) as Arc<dyn NameResolver>);
    let writer = output::spawn_writer(rx, &cfg.output, names, Arc::clone(&stats.writer))
        .await
        .with_context(|| format!("opening log destination {}", cfg.output.destination))?;

    if let Some(addr) = cfg.metrics.listen {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .with_context(|| format!("starting metrics endpoint on {addr}"))?;
        log::info!("Metrics endpoint listening on {}", addr);
    }

    // 2 ─ Pipeline and kernel ring
    let ring = MemoryRing::open(&cfg.kernel.ring_path)
        .with_context(|| format!("opening kernel ring {}", cfg.kernel.ring_path.display()))?;
    let monitor = Arc::new(Monitor::start(&cfg, Arc::new(SystemImageVerifier), log, stats)?);

    let stop = Arc::new(AtomicBool::new(false));
    let router = RingRouter::new(ring, cfg.kernel.poll_interval.get());
    let router_thread = {
        let monitor = Arc::clone(&monitor);
        let stop = Arc::clone(&stop);
        thread::Builder::new()
            .name("ring-router".into())
            .spawn(move || router.run(monitor.as_ref(), &stop))?
    };
    log::info!("Agent running, ring {}", cfg.kernel.ring_path.display());

    // 3 ─ Stats until Ctrl-C
    let mut tick = tokio::time::interval(cfg.metrics.stats_interval.get());
    tick.tick().await;
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("waiting for Ctrl-C")?;
                break;
            }
            _ = tick.tick() => monitor.report_stats(),
        }
    }
    log::warn!("Shutdown initiated");

    // 4 ─ Drain
    stop.store(true, Ordering::Release);
    match router_thread.join() {
        Ok(totals) => log::info!("Ring router stopped: {:?}", totals),
        Err(_) => log::error!("Ring router panicked"),
    }
    let drained = tokio::task::spawn_blocking(move || {
        let res = monitor.shutdown();
        drop(monitor);
        res
    })
    .await?;
    writer.await?;
    drained?;
    log::info!("Agent stopped cleanly");
    Ok(())
}

fn main() {
    let exe_dir = exe_dir();
    let cfg = load_cfg(&exe_dir);
    setup_logging(&exe_dir, &cfg).unwrap_or_else(|e| fatal!("logging", "{}", e));
    log::info!("Agent bootstrap initiated");

    let rt = Runtime::new().unwrap_or_else(|e| fatal!("runtime", "{}", e));
    if let Err(e) = rt.block_on(run(cfg)) {
        fatal!("main", "{:#}", e);
    }
}
