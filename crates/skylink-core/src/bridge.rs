use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use skylink_fc::{
    Connector, Inbound, LinkError, LinkState, LinkStatus, StreamRates, VehicleAction, VehicleLink,
};
use tracing::{debug, error, info, warn};

use crate::{BusPublisher, LinkSlot, TelemetryPublisher};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Pause after a failed connect or a lost link before the next attempt.
    pub reconnect_cooldown: Duration,
    pub receive_timeout: Duration,
    pub streams: StreamRates,
    /// Companion HEARTBEAT period while connected.
    pub heartbeat_interval: Option<Duration>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            reconnect_cooldown: Duration::from_secs(5),
            receive_timeout: Duration::from_secs(1),
            streams: StreamRates::default(),
            heartbeat_interval: None,
        }
    }
}

/// Process-wide stop flag shared by the bridge loop, the command worker's
/// callback and the signal handler.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleeps for `d` in short slices. Returns false if shutdown cut it short.
    pub fn sleep(&self, d: Duration) -> bool {
        let deadline = Instant::now() + d;
        loop {
            if self.is_triggered() {
                return false;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return true;
            }
            thread::sleep(left.min(SLEEP_SLICE));
        }
    }
}

/// Vehicle side of the bridge: keeps one link alive and forwards its
/// telemetry to the bus.
///
/// ```text
/// Disconnected --(cooldown elapsed)--> Connecting --connect+streams--> Connected
///       ^                                  |                               |
///       +----------- connect failed -------+------- transport error -------+
/// ```
pub struct Bridge<C: Connector, P> {
    connector: C,
    slot: Arc<LinkSlot<C::Link>>,
    publisher: TelemetryPublisher<P>,
    cfg: BridgeConfig,
    shutdown: Shutdown,
    status: Arc<Mutex<LinkStatus>>,
    state: LinkState,
    next_attempt: Instant,
    last_heartbeat_sent: Option<Instant>,
}

impl<C: Connector, P: BusPublisher> Bridge<C, P> {
    pub fn new(
        connector: C,
        slot: Arc<LinkSlot<C::Link>>,
        publisher: TelemetryPublisher<P>,
        cfg: BridgeConfig,
        shutdown: Shutdown,
    ) -> Self {
        let status = Arc::new(Mutex::new(LinkStatus::new(connector.endpoint())));
        Self {
            connector,
            slot,
            publisher,
            cfg,
            shutdown,
            status,
            state: LinkState::Disconnected,
            next_attempt: Instant::now(),
            last_heartbeat_sent: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn status(&self) -> Arc<Mutex<LinkStatus>> {
        self.status.clone()
    }

    pub fn publisher(&self) -> &TelemetryPublisher<P> {
        &self.publisher
    }

    /// Runs until shutdown is triggered, then drops the link.
    pub fn run(&mut self) {
        info!(endpoint = self.connector.endpoint(), "bridge loop started");
        while !self.shutdown.is_triggered() {
            self.step();
        }
        self.slot.clear();
        self.set_state(LinkState::Disconnected);
        info!(
            published = self.publisher.published(),
            rate_limited = self.publisher.dropped(),
            "bridge loop stopped"
        );
    }

    /// Advances the state machine by one transition or one receive.
    pub fn step(&mut self) -> LinkState {
        match self.state {
            LinkState::Disconnected => {
                let wait = self.next_attempt.saturating_duration_since(Instant::now());
                if wait.is_zero() || self.shutdown.sleep(wait) {
                    self.set_state(LinkState::Connecting);
                }
            }
            LinkState::Connecting => self.connect(),
            LinkState::Connected => self.pump(),
        }
        self.state
    }

    fn connect(&mut self) {
        let link = match self.connector.connect() {
            Ok(link) => link,
            Err(e) => {
                error!("vehicle connect failed, retrying in {:?}: {e}", self.cfg.reconnect_cooldown);
                self.lose_link(e);
                return;
            }
        };

        if let Err(e) = link.request_streams(&self.cfg.streams) {
            warn!("stream request failed: {e}");
            self.lose_link(e);
            return;
        }

        let peer = link.peer();
        self.slot.install(Arc::new(link));
        self.last_heartbeat_sent = None;
        {
            let mut st = self.lock_status();
            st.peer = Some(peer);
            st.last_heartbeat = Some(Instant::now());
            st.connects += 1;
            st.last_error = None;
        }
        info!(%peer, endpoint = self.connector.endpoint(), "vehicle connected");
        self.set_state(LinkState::Connected);
    }

    fn pump(&mut self) {
        let Some(link) = self.slot.current() else {
            warn!("vehicle link missing while connected");
            self.lose_link(LinkError::Closed);
            return;
        };

        // receive never outlasts the next companion heartbeat
        let mut wait = self.cfg.receive_timeout;
        if let Some(every) = self.cfg.heartbeat_interval {
            if self.last_heartbeat_sent.map_or(true, |t| t.elapsed() >= every) {
                if let Err(e) = link.send_action(&VehicleAction::Heartbeat) {
                    debug!("companion heartbeat not sent: {e}");
                }
                self.last_heartbeat_sent = Some(Instant::now());
            }
            let next_due = self.last_heartbeat_sent.map_or(every, |t| every.saturating_sub(t.elapsed()));
            wait = wait.min(next_due);
        }

        match link.receive(wait) {
            Ok(None) => {}
            Ok(Some(Inbound::Heartbeat { from_gcs: false, .. })) => {
                self.lock_status().last_heartbeat = Some(Instant::now());
            }
            Ok(Some(Inbound::Heartbeat { .. })) | Ok(Some(Inbound::Other(_))) => {}
            Ok(Some(Inbound::Telemetry(sample))) => {
                if let Err(e) = self.publisher.handle(&sample) {
                    warn!(kind = %sample.kind(), "telemetry publish failed: {e}");
                }
            }
            Err(e) => {
                error!("vehicle link lost: {e}");
                self.lose_link(e);
            }
        }
    }

    fn lose_link(&mut self, e: LinkError) {
        self.slot.clear();
        self.next_attempt = Instant::now() + self.cfg.reconnect_cooldown;
        {
            let mut st = self.lock_status();
            st.peer = None;
            st.last_error = Some(e.to_string());
        }
        self.set_state(LinkState::Disconnected);
    }

    fn set_state(&mut self, next: LinkState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "link state");
        }
        self.state = next;
        self.lock_status().state = next;
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, LinkStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
