use anyhow::Result;
use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use finetimesync::config::{Role, SystemConfig};
use finetimesync::crm::Crm;
use finetimesync::dtc::Dtc;
use finetimesync::dtr::Dtr;
use finetimesync::ftm::run_ftm_loop;
use finetimesync::hw::{InstantMacCounter, ThreadPulseTimer};
use finetimesync::mac_clock::MacClock;
use finetimesync::net;
use finetimesync::sim::{LinkModel, SimFtmResponder};
use finetimesync::status::SyncStatus;
use finetimesync::trace::CsvTrace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CliRole {
    Master,
    Slave,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node role
    #[arg(long, value_enum)]
    role: CliRole,

    /// UDP port for the broadcast sync channel
    #[arg(long, default_value_t = 7677)]
    port: u16,

    /// Optional JSON config file (defaults apply when absent)
    #[arg(long)]
    config: Option<String>,

    /// Emit CSV trace lines on stdout
    #[arg(long, default_value_t = false)]
    csv: bool,

    /// Simulated remote clock drift for the slave demo link (ppm)
    #[arg(long, default_value_t = 2.0)]
    sim_drift_ppm: f64,

    /// Simulated timestamp jitter for the slave demo link (ps, one sigma)
    #[arg(long, default_value_t = 100_000.0)]
    sim_jitter_ps: f64,

    /// Stop after this many seconds (runs until ctrl-c when absent)
    #[arg(long)]
    duration_secs: Option<u64>,
}

fn load_config(path: Option<&str>) -> SystemConfig {
    if let Some(path) = path {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<SystemConfig>(&content) {
                Ok(cfg) => {
                    info!("loaded config from {}", path);
                    return cfg;
                }
                Err(e) => warn!("bad config {}: {}, using defaults", path, e),
            },
            Err(e) => warn!("cannot read config {}: {}, using defaults", path, e),
        }
    }
    SystemConfig::default()
}

/// Application tick callback: runs in TEZ context, so it only publishes the
/// cycle number for the task-side status loop to pick up.
fn make_tick_callback() -> (Arc<dyn Fn(i64) + Send + Sync>, Arc<AtomicI64>) {
    let last_cycle = Arc::new(AtomicI64::new(-1));
    let shared = last_cycle.clone();
    let cb: Arc<dyn Fn(i64) + Send + Sync> = Arc::new(move |cycle| {
        shared.store(cycle, Ordering::Relaxed);
    });
    (cb, last_cycle)
}

fn status_loop(
    running: &AtomicBool,
    duration: Option<u64>,
    status: Arc<RwLock<SyncStatus>>,
    last_cycle: Arc<AtomicI64>,
) {
    let started = Instant::now();
    let mut last_log = Instant::now();

    while running.load(Ordering::SeqCst) {
        if let Some(secs) = duration {
            if started.elapsed() >= Duration::from_secs(secs) {
                break;
            }
        }
        if last_log.elapsed() >= Duration::from_secs(5) {
            if let Ok(s) = status.read() {
                info!(
                    "state={} cycle={} slope={:+.3}ppm r_sq={:.6} aligns={} reboots={}",
                    s.timer_state,
                    last_cycle.load(Ordering::Relaxed),
                    s.slope_ppm,
                    s.r_squared,
                    s.alignments_applied,
                    s.master_reboots
                );
            }
            last_log = Instant::now();
        }
        thread::sleep(Duration::from_millis(100));
    }
}

fn run_master(args: Args, cfg: SystemConfig, running: Arc<AtomicBool>) -> Result<()> {
    let status = Arc::new(RwLock::new(SyncStatus::default()));
    let trace = args.csv.then(|| Arc::new(CsvTrace::stdout()));

    let mac = MacClock::new(InstantMacCounter::new())?;

    let (callback, last_cycle) = make_tick_callback();
    let hw = ThreadPulseTimer::new(
        cfg.timer.resolution_hz,
        cfg.timer.period_ticks() as u16,
    );
    let dtr = Dtr::new(Role::Master, hw, Some(callback), &cfg.timer, trace);

    dtr.start_timer(&mac)?;
    dtr.align_master_timer()?;
    if let Ok(mut s) = status.write() {
        s.timer_state = "aligned".to_string();
    }

    // Announce ourselves so slaves can spot our reboots
    let run_id = rand::random::<u32>();
    let sender = net::create_broadcast_sender()?;
    {
        let mac = mac.clone();
        let running = running.clone();
        let port = args.port;
        thread::Builder::new()
            .name("sync-broadcast".to_string())
            .spawn(move || net::run_master_broadcast(sender, mac, port, run_id, running))?;
    }

    info!("master aligned and broadcasting");
    status_loop(&running, args.duration_secs, status, last_cycle);
    Ok(())
}

fn run_slave(args: Args, cfg: SystemConfig, running: Arc<AtomicBool>) -> Result<()> {
    let status = Arc::new(RwLock::new(SyncStatus::default()));
    let trace = args.csv.then(|| Arc::new(CsvTrace::stdout()));

    let mac = MacClock::new(InstantMacCounter::new())?;

    let (callback, last_cycle) = make_tick_callback();
    let hw = ThreadPulseTimer::new(
        cfg.timer.resolution_hz,
        cfg.timer.period_ticks() as u16,
    );
    let dtr = Dtr::new(Role::Slave, hw, Some(callback), &cfg.timer, trace.clone());

    dtr.start_timer(&mac)?;
    if let Ok(mut s) = status.write() {
        s.timer_state = "running".to_string();
    }

    let mut crm = Crm::new(&cfg.crm, &cfg.ftm);
    if let Some(trace) = trace.clone() {
        crm.set_trace(trace);
    }
    crm.set_status(status.clone());

    let dtc = Arc::new(Dtc::new(
        dtr.clone(),
        &cfg.timer,
        &cfg.crm,
        trace,
        Some(status.clone()),
    ));
    let dtc_cb = dtc.clone();
    crm.register_callback(Box::new(move |model| dtc_cb.on_crm_update(model)));
    let crm = Arc::new(Mutex::new(crm));

    // Watch the master's broadcast for reboots
    let receiver = net::create_broadcast_receiver(args.port)?;
    {
        let status = status.clone();
        let running = running.clone();
        thread::Builder::new()
            .name("sync-receiver".to_string())
            .spawn(move || {
                if let Err(e) = net::run_slave_receiver(receiver, Some(status), running) {
                    warn!("sync receiver stopped: {}", e);
                }
            })?;
    }

    // No radio on a host build: the FTM link is simulated
    let link = LinkModel {
        drift_ppm: args.sim_drift_ppm,
        jitter_sigma_ps: args.sim_jitter_ps,
        ..LinkModel::default()
    };
    info!(
        "slave demo link: drift {:+.1} ppm, jitter {:.0} ps",
        link.drift_ppm, link.jitter_sigma_ps
    );
    let mac_ftm = mac.clone();
    let responder = SimFtmResponder::new(link, Box::new(move || mac_ftm.read() * 1_000_000));
    {
        let crm = crm.clone();
        let running = running.clone();
        let ftm_cfg = cfg.ftm.clone();
        thread::Builder::new()
            .name("ftm".to_string())
            .spawn(move || run_ftm_loop(responder, crm, &ftm_cfg, &running))?;
    }

    status_loop(&running, args.duration_secs, status, last_cycle);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::builder()
        .format_timestamp(None)
        .format_target(false)
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();
    let cfg = load_config(args.config.as_deref());

    info!("finetimesync v{} ({:?})", env!("CARGO_PKG_VERSION"), args.role);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("ctrl-c received, shutting down");
        r.store(false, Ordering::SeqCst);
    })?;

    let result = match args.role {
        CliRole::Master => run_master(args.clone(), cfg, running.clone()),
        CliRole::Slave => run_slave(args.clone(), cfg, running.clone()),
    };
    running.store(false, Ordering::SeqCst);

    if let Err(e) = &result {
        error!("startup failed: {}", e);
    }
    result
}
