//! Ground console: keyboard-driven command sender and telemetry consumer.
//!
//! Input is line based; type a key and press enter.

use std::io::Write as _;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use skylink_core::{BusPublisher, LatencyTracker};
use skylink_proto::{CommandPayload, FlightMode, TelemetryBody, TelemetryMessage};
use skylink_uplink::{BusConfig, BusHandle, BusSender};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

const METERS_PER_DEG_LAT: f64 = 111_320.0;
const TAKEOFF_ALT_M: f64 = 10.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsoleCfg {
    pub speed_mps: f32,
    pub random_max_distance_m: f64,
    pub random_min_alt_m: f64,
    pub random_max_alt_m: f64,
    pub automated_start_delay_s: u64,
}

impl Default for ConsoleCfg {
    fn default() -> Self {
        Self {
            speed_mps: 5.0,
            random_max_distance_m: 50.0,
            random_min_alt_m: 10.0,
            random_max_alt_m: 30.0,
            automated_start_delay_s: 60,
        }
    }
}

/// Last vehicle state seen on the telemetry topic.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VehicleView {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: f64,
    pub relative_alt: f64,
    /// Set while a climb/descent command is in effect.
    pub vertical: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum KeyAction {
    Send { payload: CommandPayload, vertical: Option<bool> },
    Speed(f32),
    RandomPosition,
    Quit,
    Invalid(String),
    Ignore,
}

pub fn map_key(line: &str, speed: f32) -> KeyAction {
    let raw = line.trim_end_matches(['\r', '\n']);
    if raw == " " || raw.trim().eq_ignore_ascii_case("stop") {
        return KeyAction::Send { payload: CommandPayload::velocity(0.0, 0.0, 0.0), vertical: Some(false) };
    }
    let line = raw.trim().to_ascii_lowercase();
    let mut words = line.split_whitespace();
    let Some(key) = words.next() else {
        return KeyAction::Ignore;
    };

    let send = |payload| KeyAction::Send { payload, vertical: None };
    match key {
        "+" => KeyAction::Speed(speed + 1.0),
        "-" => KeyAction::Speed((speed - 1.0).max(0.0)),
        "w" => send(CommandPayload::velocity(speed, 0.0, 0.0)),
        "s" => send(CommandPayload::velocity(-speed, 0.0, 0.0)),
        "a" => send(CommandPayload::velocity(0.0, -speed, 0.0)),
        "d" => send(CommandPayload::velocity(0.0, speed, 0.0)),
        "q" => KeyAction::Send { payload: CommandPayload::velocity(0.0, 0.0, -speed / 2.0), vertical: Some(true) },
        "e" => KeyAction::Send { payload: CommandPayload::velocity(0.0, 0.0, speed / 2.0), vertical: Some(true) },
        "c" => send(CommandPayload::takeoff(TAKEOFF_ALT_M)),
        "m" => send(CommandPayload::mode(FlightMode::Stabilize)),
        "l" => send(CommandPayload::mode(FlightMode::Loiter)),
        "x" => send(CommandPayload::mode(FlightMode::Land)),
        "h" => send(CommandPayload::mode(FlightMode::Rtl)),
        "p" => {
            let nums: Result<Vec<f64>, _> = words.map(str::parse::<f64>).collect();
            match nums.as_deref() {
                Ok(&[lat, lon, alt]) => send(CommandPayload::goto(lat, lon, alt)),
                _ => KeyAction::Invalid("usage: p <lat> <lon> <alt>".into()),
            }
        }
        "r" => KeyAction::RandomPosition,
        "." => KeyAction::Quit,
        _ => KeyAction::Ignore,
    }
}

/// Timing label for a console command.
pub fn label(payload: &CommandPayload) -> String {
    if payload.velocity.is_some() {
        "velocity".into()
    } else if let Some(mode) = payload.mode.as_ref().and_then(|m| m.as_str()) {
        format!("mode_{mode}")
    } else if payload.position.is_some() {
        "position".into()
    } else if payload.takeoff_alt.is_some() {
        "takeoff".into()
    } else {
        "unknown".into()
    }
}

/// A target within `random_max_distance_m` of the last known position.
pub fn random_target(rng: &mut impl Rng, view: &VehicleView, cfg: &ConsoleCfg) -> Option<CommandPayload> {
    let (lat, lon) = (view.lat?, view.lon?);
    let d = cfg.random_max_distance_m.abs();
    let north = rng.gen_range(-d..=d);
    let east = rng.gen_range(-d..=d);
    let (lo, hi) = (cfg.random_min_alt_m.min(cfg.random_max_alt_m), cfg.random_min_alt_m.max(cfg.random_max_alt_m));
    let alt = rng.gen_range(lo..=hi);

    let dlat = north / METERS_PER_DEG_LAT;
    let dlon = east / (METERS_PER_DEG_LAT * lat.to_radians().cos().max(1e-6));
    Some(CommandPayload::goto(lat + dlat, lon + dlon, alt))
}

pub fn on_telemetry(tracker: &LatencyTracker, view: &Mutex<VehicleView>, payload: &[u8]) {
    let msg: TelemetryMessage = match serde_json::from_slice(payload) {
        Ok(m) => m,
        Err(e) => {
            error!("bad telemetry payload: {e}");
            return;
        }
    };
    tracker.mark_delivered(&msg.message_id, msg.body.kind().as_str());
    if let TelemetryBody::Position { lat, lon, alt, relative_alt, .. } = msg.body {
        let mut v = view.lock().unwrap_or_else(PoisonError::into_inner);
        v.lat = Some(lat);
        v.lon = Some(lon);
        v.alt = alt;
        v.relative_alt = relative_alt;
    }
}

pub struct CommandSender {
    bus: BusSender,
    topic: String,
    tracker: Arc<LatencyTracker>,
}

impl CommandSender {
    /// Tags `payload` with a fresh message id, records GS-SEND and publishes.
    pub fn send(&self, payload: CommandPayload, label: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let bytes = serde_json::to_vec(&payload.with_message_id(id.clone())).context("encode command")?;
        self.tracker.begin(&id, label);
        if let Err(e) = self.bus.publish(&self.topic, bytes) {
            self.tracker.abandon(&id);
            return Err(e.into());
        }
        Ok(id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    Wait(Duration),
    Send { payload: CommandPayload, label: &'static str, vertical: Option<bool> },
}

/// Scripted flight used for repeatable latency runs.
pub fn automated_script(speed: f32, start_delay: Duration) -> Vec<ScriptStep> {
    use ScriptStep::{Send, Wait};
    let secs = Duration::from_secs;
    let mut s = vec![
        Wait(start_delay),
        Send { payload: CommandPayload::takeoff(TAKEOFF_ALT_M), label: "mode_GUIDED", vertical: Some(true) },
        Wait(secs(30)),
    ];
    let repeat = |s: &mut Vec<ScriptStep>, n: usize, payload: CommandPayload, label: &'static str, vertical: Option<bool>| {
        for _ in 0..n {
            s.push(Send { payload: payload.clone(), label, vertical });
            s.push(Wait(secs(1)));
        }
    };

    repeat(&mut s, 2, CommandPayload::velocity(0.0, 0.0, -speed / 2.0), "velocity_down", Some(true));
    s.push(Wait(secs(10)));
    repeat(&mut s, 10, CommandPayload::velocity(speed, 0.0, 0.0), "velocity_forward", None);
    s.push(Wait(secs(10)));
    repeat(&mut s, 10, CommandPayload::velocity(0.0, speed, 0.0), "velocity_right", None);
    s.push(Wait(secs(10)));
    s.push(Send { payload: CommandPayload::velocity(-speed, 0.0, 0.0), label: "velocity_backward", vertical: None });
    s.push(Wait(secs(10)));
    repeat(&mut s, 25, CommandPayload::velocity(speed, 0.0, 0.0), "velocity_forward", None);
    s.push(Send { payload: CommandPayload::velocity(0.0, 0.0, 0.0), label: "velocity_stop", vertical: Some(false) });
    s
}

pub async fn run(bus_cfg: &BusConfig, tracker: Arc<LatencyTracker>, cfg: &ConsoleCfg, automated: bool) -> Result<()> {
    tracker
        .log()
        .note("START", &format!("ground console started, tls={}, automated={automated}", bus_cfg.tls));

    let view = Arc::new(Mutex::new(VehicleView::default()));
    let telemetry_topic = bus_cfg.telemetry_topic.clone();
    let (t, v) = (tracker.clone(), view.clone());
    let bus = BusHandle::connect(bus_cfg, "console", vec![telemetry_topic.clone()], move |topic, payload| {
        if topic == telemetry_topic {
            on_telemetry(&t, &v, &payload);
        }
    })
    .await
    .context("bus setup")?;
    info!(broker = bus.broker(), topic = %bus_cfg.telemetry_topic, "ground console connected");

    let sender = CommandSender { bus: bus.sender(), topic: bus_cfg.command_topic.clone(), tracker: tracker.clone() };
    let monitor = tokio::spawn(monitor_altitude(view.clone()));

    let result = tokio::select! {
        r = drive(&sender, &view, cfg, automated) => r,
        r = tokio::signal::ctrl_c() => {
            r.context("install ctrl-c handler")?;
            info!("interrupt received");
            Ok(())
        }
    };

    monitor.abort();
    bus.disconnect().await;
    if automated && result.is_ok() {
        tracker.log().note("TERMINATE", "automated sequence completed");
    }
    tracker.log().note("EXIT", "ground console stopped");
    result
}

async fn drive(sender: &CommandSender, view: &Mutex<VehicleView>, cfg: &ConsoleCfg, automated: bool) -> Result<()> {
    if automated {
        run_script(sender, view, cfg).await
    } else {
        interactive(sender, view, cfg).await
    }
}

fn dispatch(sender: &CommandSender, view: &Mutex<VehicleView>, payload: CommandPayload, label: &str, vertical: Option<bool>) {
    let snapshot = {
        let mut v = view.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(flag) = vertical {
            v.vertical = flag;
        }
        *v
    };
    match vertical {
        Some(true) => info!(
            "vertical move, starting from altitude - absolute: {:.1}m, relative: {:.1}m",
            snapshot.alt, snapshot.relative_alt
        ),
        Some(false) => info!(
            "stopped at altitude - absolute: {:.1}m, relative: {:.1}m",
            snapshot.alt, snapshot.relative_alt
        ),
        None => {}
    }
    match sender.send(payload, label) {
        Ok(id) => info!(%label, message_id = %id, "command sent"),
        Err(e) => warn!(%label, "command not sent: {e:#}"),
    }
}

async fn run_script(sender: &CommandSender, view: &Mutex<VehicleView>, cfg: &ConsoleCfg) -> Result<()> {
    let steps = automated_script(cfg.speed_mps, Duration::from_secs(cfg.automated_start_delay_s));
    info!(steps = steps.len(), "starting automated sequence");
    for step in steps {
        match step {
            ScriptStep::Wait(d) => tokio::time::sleep(d).await,
            ScriptStep::Send { payload, label, vertical } => dispatch(sender, view, payload, label, vertical),
        }
    }
    info!("automated sequence completed");
    Ok(())
}

async fn interactive(sender: &CommandSender, view: &Mutex<VehicleView>, cfg: &ConsoleCfg) -> Result<()> {
    info!("controls: w/a/s/d move, q/e down/up, space or 'stop' halts, +/- speed, c takeoff");
    info!("controls: m/l/x/h STABILIZE/LOITER/LAND/RTL, p <lat> <lon> <alt>, r random target, . quit");

    let mut lines = spawn_stdin().context("start stdin reader")?;
    let mut speed = cfg.speed_mps;
    let mut rng = StdRng::from_entropy();

    while let Some(line) = lines.recv().await {
        match map_key(&line, speed) {
            KeyAction::Send { payload, vertical } => {
                let label = label(&payload);
                dispatch(sender, view, payload, &label, vertical);
            }
            KeyAction::Speed(s) => {
                speed = s;
                info!("speed set to {speed} m/s");
            }
            KeyAction::RandomPosition => {
                let snapshot = *view.lock().unwrap_or_else(PoisonError::into_inner);
                match random_target(&mut rng, &snapshot, cfg) {
                    Some(payload) => {
                        info!(position = ?payload.position, "random target");
                        dispatch(sender, view, payload, "position", None);
                    }
                    None => warn!("no position telemetry yet, cannot pick a random target"),
                }
            }
            KeyAction::Quit => break,
            KeyAction::Invalid(msg) => error!("{msg}"),
            KeyAction::Ignore => {}
        }
    }
    Ok(())
}

/// Stdin is read on its own thread so a pending read never blocks shutdown.
fn spawn_stdin() -> std::io::Result<mpsc::Receiver<String>> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::Builder::new().name("stdin".into()).spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    })?;
    Ok(rx)
}

async fn monitor_altitude(view: Arc<Mutex<VehicleView>>) {
    let mut tick = tokio::time::interval(Duration::from_millis(500));
    let mut prev = (0.0_f64, 0.0_f64);
    loop {
        tick.tick().await;
        let v = *view.lock().unwrap_or_else(PoisonError::into_inner);
        if v.vertical && ((v.alt - prev.0).abs() > 0.1 || (v.relative_alt - prev.1).abs() > 0.1) {
            print!("\x1b[2K\rAltitude update - absolute: {:.1}m, relative: {:.1}m", v.alt, v.relative_alt);
            let _ = std::io::stdout().flush();
            prev = (v.alt, v.relative_alt);
        }
    }
}
