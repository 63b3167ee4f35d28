mod console;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use skylink_core::{
    spawn_worker, Bridge, BridgeConfig, CommandTranslator, LatencyTracker, LinkSlot, SettleDelays, Shutdown, Side,
    TelemetryPublisher, TimingLog, TrackerConfig,
};
use skylink_fc::{doctor as fc_doctor, FcConnector, LinkConfig};
use skylink_uplink::{doctor as uplink_doctor, BusConfig, BusHandle};

use console::ConsoleCfg;

#[derive(Debug, Parser)]
#[command(name = "skylink", version, about = "skylink - MAVLink vehicle to MQTT bridge with latency accounting")]
struct Cli {
    #[arg(long)]
    config: String,

    /// Plain MQTT; the broker port defaults to 1883.
    #[arg(long, global = true)]
    no_tls: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check config and TLS material.
    Doctor,
    /// Run the vehicle bridge.
    Run {
        /// Stop after the first command that reaches the vehicle.
        #[arg(long)]
        one_shot: bool,
    },
    /// Ground console: send commands, watch telemetry.
    Console {
        #[arg(long)]
        automated: bool,
    },
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    vehicle: LinkConfig,
    #[serde(default)]
    bridge: BridgeCfg,
    bus: BusConfig,
    #[serde(default)]
    timing: TimingCfg,
    #[serde(default)]
    console: ConsoleCfg,
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct BridgeCfg {
    reconnect_cooldown_s: f64,
    receive_timeout_s: f64,
    telemetry_min_interval_s: f64,
    mode_settle_s: f64,
    arm_settle_s: f64,
    goto_settle_s: f64,
    command_queue_depth: usize,
}

impl Default for BridgeCfg {
    fn default() -> Self {
        Self {
            reconnect_cooldown_s: 5.0,
            receive_timeout_s: 1.0,
            telemetry_min_interval_s: 0.5,
            mode_settle_s: 1.0,
            arm_settle_s: 1.0,
            goto_settle_s: 0.5,
            command_queue_depth: 32,
        }
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct TimingCfg {
    log_dir: PathBuf,
    capacity: usize,
    max_age_s: u64,
}

impl Default for TimingCfg {
    fn default() -> Self {
        Self { log_dir: PathBuf::from("logs"), capacity: 4096, max_age_s: 60 }
    }
}

fn secs(key: &str, v: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(v).with_context(|| format!("bridge.{key} must be a non-negative number of seconds, got {v}"))
}

impl Config {
    fn bridge_config(&self) -> Result<BridgeConfig> {
        Ok(BridgeConfig {
            reconnect_cooldown: secs("reconnect_cooldown_s", self.bridge.reconnect_cooldown_s)?,
            receive_timeout: secs("receive_timeout_s", self.bridge.receive_timeout_s)?,
            streams: self.vehicle.streams,
            heartbeat_interval: self.vehicle.heartbeat_interval(),
        })
    }

    fn settle_delays(&self) -> Result<SettleDelays> {
        Ok(SettleDelays {
            mode: secs("mode_settle_s", self.bridge.mode_settle_s)?,
            arm: secs("arm_settle_s", self.bridge.arm_settle_s)?,
            goto: secs("goto_settle_s", self.bridge.goto_settle_s)?,
        })
    }

    fn min_interval(&self) -> Result<Duration> {
        secs("telemetry_min_interval_s", self.bridge.telemetry_min_interval_s)
    }

    fn tracker(&self, side: Side) -> Result<Arc<LatencyTracker>> {
        let log = TimingLog::open(&self.timing.log_dir, side, self.bus.tls)
            .with_context(|| format!("open timing log in {}", self.timing.log_dir.display()))?;
        if let Some(path) = log.path() {
            info!(path = %path.display(), "timing log");
        }
        let cfg = TrackerConfig {
            capacity: self.timing.capacity.max(1),
            max_age: Duration::from_secs(self.timing.max_age_s),
        };
        Ok(Arc::new(LatencyTracker::new(log, cfg)))
    }
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {path}"))?;
    toml::from_str(&s).context("parse config toml")
}

fn main() -> Result<()> {
    // must run while the process is still single-threaded
    skylink_core::timing::local_offset();
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start tokio runtime")?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = load_config(&cli.config)?;
    if cli.no_tls {
        cfg.bus.tls = false;
    }
    info!(tls = cfg.bus.tls, broker = %cfg.bus.broker(), "config loaded");

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Run { one_shot } => run(cfg, one_shot).await?,
        Command::Console { automated } => {
            let tracker = cfg.tracker(Side::Ground)?;
            console::run(&cfg.bus, tracker, &cfg.console, automated).await?
        }
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    fc_doctor::check_link(&cfg.vehicle).map_err(anyhow::Error::msg)?;
    let bridge = cfg.bridge_config()?;
    anyhow::ensure!(!bridge.receive_timeout.is_zero(), "bridge.receive_timeout_s must be > 0");
    anyhow::ensure!(!bridge.reconnect_cooldown.is_zero(), "bridge.reconnect_cooldown_s must be > 0");
    cfg.settle_delays()?;
    cfg.min_interval()?;
    anyhow::ensure!(cfg.bridge.command_queue_depth >= 1, "bridge.command_queue_depth must be >= 1");
    anyhow::ensure!(cfg.timing.capacity >= 16, "timing.capacity too small; set >= 16");

    uplink_doctor::check_bus(&cfg.bus)?;
    if cfg.bus.tls {
        let roots = uplink_doctor::check_tls(&cfg.bus)?;
        info!("doctor: tls material OK ({roots} CA certificates)");
    } else {
        warn!("doctor: TLS disabled, bus traffic is plaintext");
    }

    info!("doctor: OK");
    Ok(())
}

async fn run(cfg: Config, one_shot: bool) -> Result<()> {
    info!(endpoint = %cfg.vehicle.endpoint, one_shot, "run: starting");

    let tracker = cfg.tracker(Side::Drone)?;
    tracker
        .log()
        .note("START", &format!("bridge started, tls={}, one_shot={one_shot}", cfg.bus.tls));

    let shutdown = Shutdown::new();
    let slot = Arc::new(LinkSlot::new());

    // Commands: bus dispatch -> queue -> worker thread -> vehicle
    let translator = CommandTranslator::new(slot.clone(), tracker.clone(), cfg.settle_delays()?);
    let stop = shutdown.clone();
    let (queue, worker) = spawn_worker(translator, cfg.bridge.command_queue_depth, move |exec| {
        if one_shot && exec.actions_sent > 0 {
            info!(kind = %exec.kind, "one-shot: first command executed, shutting down");
            stop.trigger();
        }
    })
    .context("spawn command worker")?;

    let command_topic = cfg.bus.command_topic.clone();
    let bus = BusHandle::connect(&cfg.bus, "bridge", vec![command_topic.clone()], move |topic, payload| {
        if topic == command_topic {
            queue.submit(payload);
        }
    })
    .await
    .context("bus setup")?;

    // Telemetry: vehicle -> bridge loop -> bus
    let publisher =
        TelemetryPublisher::new(bus.sender(), cfg.bus.telemetry_topic.clone(), cfg.min_interval()?, tracker.clone());
    let mut bridge = Bridge::new(
        FcConnector::new(cfg.vehicle.clone()),
        slot,
        publisher,
        cfg.bridge_config()?,
        shutdown.clone(),
    );
    let status = bridge.status();
    let mut bridge_task = tokio::task::spawn_blocking(move || bridge.run());

    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            r.context("install ctrl-c handler")?;
            info!("interrupt received");
        }
        _ = wait_for(shutdown.clone()) => {}
        r = &mut bridge_task => {
            r.context("bridge loop panicked")?;
        }
    }
    shutdown.trigger();

    if !bridge_task.is_finished() {
        match tokio::time::timeout(Duration::from_secs(15), &mut bridge_task).await {
            Ok(r) => r.context("bridge loop panicked")?,
            Err(_) => warn!("bridge loop still connecting, not waiting further"),
        }
    }

    // dropping the dispatch callback closes the command queue
    bus.disconnect().await;
    tokio::task::spawn_blocking(move || worker.join())
        .await
        .context("join command worker")?
        .map_err(|_| anyhow::anyhow!("command worker panicked"))?;

    if one_shot {
        tracker.log().note("TERMINATE", "test completed");
    }
    tracker.log().note("EXIT", "bridge stopped");

    let st = status.lock().map(|s| s.clone()).unwrap_or_else(|p| p.into_inner().clone());
    info!(connects = st.connects, last_error = ?st.last_error, pending = tracker.pending_len(), "run: done");
    Ok(())
}

async fn wait_for(shutdown: Shutdown) {
    while !shutdown.is_triggered() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
