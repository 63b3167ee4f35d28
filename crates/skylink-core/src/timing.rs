//! Timing log and correlation table.
//!
//! Every message that crosses the bus carries an opaque id. The side that
//! originates it calls [`LatencyTracker::begin`]; the side that receives it
//! calls [`LatencyTracker::mark_received`] or [`LatencyTracker::mark_delivered`],
//! and commands end with [`LatencyTracker::complete`] once executed. Each call
//! appends one line to the timing log:
//!
//! ```text
//! 2025-06-01 10:12:03,114 - DRONE-SEND: Message ID 6f1c... type position sent at 1748772723.114210
//! ```

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, warn};

use crate::epoch_secs;

/// Which end of the bus wrote a timing line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Drone,
    Ground,
}

impl Side {
    pub fn tag(self) -> &'static str {
        match self {
            Side::Drone => "DRONE",
            Side::Ground => "GS",
        }
    }
}

/// Local UTC offset, read once and cached. The platform lookup refuses to run
/// once other threads exist, so call this before starting any; it falls back
/// to UTC when the offset cannot be determined.
pub fn local_offset() -> UtcOffset {
    static OFFSET: OnceLock<UtcOffset> = OnceLock::new();
    *OFFSET.get_or_init(|| {
        UtcOffset::current_local_offset().unwrap_or_else(|e| {
            warn!("local UTC offset unavailable, timing log uses UTC: {e}");
            UtcOffset::UTC
        })
    })
}

/// Append-only timing log, separate from the application log. Timestamps are
/// local wall-clock time.
pub struct TimingLog {
    side: Side,
    path: Option<PathBuf>,
    offset: UtcOffset,
    out: Mutex<Box<dyn Write + Send>>,
}

impl TimingLog {
    /// Opens `<dir>/mqtt_timing_<date>_<with_tls|no_tls>.log` for appending.
    pub fn open(dir: &Path, side: Side, tls: bool) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let offset = local_offset();
        let date = OffsetDateTime::now_utc()
            .to_offset(offset)
            .format(format_description!("[year]-[month]-[day]"))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let suffix = if tls { "with_tls" } else { "no_tls" };
        let path = dir.join(format!("mqtt_timing_{date}_{suffix}.log"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { side, path: Some(path), offset, out: Mutex::new(Box::new(file)) })
    }

    pub fn with_writer(side: Side, w: impl Write + Send + 'static) -> Self {
        Self { side, path: None, offset: local_offset(), out: Mutex::new(Box::new(w)) }
    }

    pub fn with_offset(mut self, offset: UtcOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Lifecycle line, e.g. `note("TERMINATE", "test completed")`.
    pub fn note(&self, event: &str, text: &str) {
        self.line(&format!("{}-{event}: {text}", self.side.tag()));
    }

    fn line(&self, text: &str) {
        let ts = OffsetDateTime::now_utc()
            .to_offset(self.offset)
            .format(format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second],[subsecond digits:3]"
            ))
            .unwrap_or_default();
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(out, "{ts} - {text}").and_then(|_| out.flush()) {
            warn!("timing log write failed: {e}");
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    /// Pending ids kept before eviction kicks in.
    pub capacity: usize,
    /// Pending ids older than this are dropped when the table is full.
    pub max_age: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self { capacity: 4096, max_age: Duration::from_secs(60) }
    }
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    sent_at: Option<f64>,
    received_at: Option<f64>,
    inserted: Instant,
}

/// Correlation table plus the timing log it writes to. Shared by reference
/// between the telemetry path and the command path.
pub struct LatencyTracker {
    log: TimingLog,
    cfg: TrackerConfig,
    pending: Mutex<HashMap<String, Pending>>,
}

impl LatencyTracker {
    pub fn new(log: TimingLog, cfg: TrackerConfig) -> Self {
        Self { log, cfg, pending: Mutex::new(HashMap::new()) }
    }

    pub fn log(&self) -> &TimingLog {
        &self.log
    }

    /// Records origination of `id` and returns the epoch timestamp used.
    pub fn begin(&self, id: &str, kind: &str) -> f64 {
        let ts = epoch_secs();
        self.insert(id, Pending { sent_at: Some(ts), received_at: None, inserted: Instant::now() });
        self.log.line(&format!(
            "{}-SEND: Message ID {id} type {kind} sent at {ts:.6}",
            self.log.side.tag()
        ));
        ts
    }

    /// Records receipt of `id` ahead of a later [`complete`](Self::complete).
    /// Unknown ids are inserted as first observed.
    pub fn mark_received(&self, id: &str, kind: &str) -> f64 {
        let ts = epoch_secs();
        let transit = {
            let mut pending = self.lock();
            match pending.get_mut(id) {
                Some(p) => {
                    p.received_at = Some(ts);
                    p.sent_at.map(|sent| (ts - sent) * 1000.0)
                }
                None => {
                    let entry = Pending { sent_at: None, received_at: Some(ts), inserted: Instant::now() };
                    self.insert_locked(&mut pending, id, entry);
                    None
                }
            }
        };
        self.log.line(&format!(
            "{}-RECV: Message ID {id} type {kind} received at {ts:.6}{}",
            self.log.side.tag(),
            transit.map(|ms| format!(" - Transit: {ms:.2}ms")).unwrap_or_default()
        ));
        ts
    }

    /// Records final receipt of `id` with no execution step to follow. Returns
    /// the transit time if `id` was begun by this tracker.
    pub fn mark_delivered(&self, id: &str, kind: &str) -> Option<f64> {
        let ts = epoch_secs();
        let transit = self.lock().remove(id).and_then(|p| p.sent_at).map(|sent| (ts - sent) * 1000.0);
        self.log.line(&format!(
            "{}-RECV: Message ID {id} type {kind} received at {ts:.6}{}",
            self.log.side.tag(),
            transit.map(|ms| format!(" - Transit: {ms:.2}ms")).unwrap_or_default()
        ));
        transit
    }

    /// Removes `id` and returns milliseconds since its origination (or first
    /// receipt). `None` when there is no record, e.g. on a second call.
    pub fn complete(&self, id: &str, kind: &str) -> Option<f64> {
        let ts = epoch_secs();
        let entry = self.lock().remove(id);
        let tag = self.log.side.tag();

        let Some(p) = entry else {
            self.log.line(&format!(
                "{tag}-EXEC: Message ID {id} type {kind} executed at {ts:.6} - no origin record"
            ));
            return None;
        };

        let origin = p.sent_at.or(p.received_at).unwrap_or(ts);
        let total = ((ts - origin) * 1000.0).max(0.0);
        let mut extra = String::new();
        if let (Some(sent), Some(recv)) = (p.sent_at, p.received_at) {
            extra.push_str(&format!("Transit: {:.2}ms, ", (recv - sent) * 1000.0));
        }
        if let Some(recv) = p.received_at {
            extra.push_str(&format!("Processing: {:.2}ms, ", ((ts - recv) * 1000.0).max(0.0)));
        }
        self.log.line(&format!(
            "{tag}-EXEC: Message ID {id} type {kind} executed at {ts:.6} - {extra}Total: {total:.2}ms"
        ));
        Some(total)
    }

    /// Forgets `id` without writing a line. Used when a message is dropped.
    pub fn abandon(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, id: &str, entry: Pending) {
        let mut pending = self.lock();
        self.insert_locked(&mut pending, id, entry);
    }

    fn insert_locked(&self, pending: &mut HashMap<String, Pending>, id: &str, entry: Pending) {
        if !pending.contains_key(id) && pending.len() >= self.cfg.capacity {
            let before = pending.len();
            let max_age = self.cfg.max_age;
            pending.retain(|_, p| p.inserted.elapsed() < max_age);
            if pending.len() >= self.cfg.capacity {
                let oldest = pending.iter().min_by_key(|(_, p)| p.inserted).map(|(k, _)| k.clone());
                if let Some(k) = oldest {
                    pending.remove(&k);
                }
            }
            debug!(evicted = before - pending.len(), "correlation table full");
        }
        pending.insert(id.to_owned(), entry);
    }
}
