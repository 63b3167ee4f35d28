#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use skylink_core::{BusPublisher, LatencyTracker, PublishError, Side, TimingLog, TrackerConfig};
use skylink_fc::{Connector, Inbound, LinkError, PeerId, StreamRates, TelemetrySample, VehicleAction, VehicleLink};

/// Records everything sent to it; replays a scripted receive sequence, then idles.
pub struct FakeLink {
    pub sent: Arc<Mutex<Vec<VehicleAction>>>,
    pub stream_requests: Arc<AtomicUsize>,
    /// Timeout of every `receive` call, in order.
    pub waits: Arc<Mutex<Vec<Duration>>>,
    script: Mutex<VecDeque<Result<Option<Inbound>, LinkError>>>,
    fail_sends: bool,
}

impl FakeLink {
    pub fn new(script: Vec<Result<Option<Inbound>, LinkError>>) -> Self {
        Self {
            sent: Arc::default(),
            stream_requests: Arc::default(),
            waits: Arc::default(),
            script: Mutex::new(script.into()),
            fail_sends: false,
        }
    }

    pub fn idle() -> Self {
        Self::new(Vec::new())
    }

    pub fn broken() -> Self {
        Self { fail_sends: true, ..Self::idle() }
    }

    /// Shares counters with another link so a test can observe across reconnects.
    pub fn sharing(mut self, sent: &Arc<Mutex<Vec<VehicleAction>>>, streams: &Arc<AtomicUsize>) -> Self {
        self.sent = sent.clone();
        self.stream_requests = streams.clone();
        self
    }

    pub fn sent(&self) -> Vec<VehicleAction> {
        self.sent.lock().unwrap().clone()
    }
}

impl VehicleLink for FakeLink {
    fn peer(&self) -> PeerId {
        PeerId { system_id: 1, component_id: 1 }
    }

    fn send_action(&self, action: &VehicleAction) -> Result<(), LinkError> {
        if self.fail_sends {
            return Err(LinkError::Transport("broken pipe".into()));
        }
        self.sent.lock().unwrap().push(action.clone());
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Option<Inbound>, LinkError> {
        self.waits.lock().unwrap().push(timeout);
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(None))
    }

    fn request_streams(&self, _rates: &StreamRates) -> Result<(), LinkError> {
        self.stream_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out pre-built connect outcomes in order.
pub struct FakeConnector {
    outcomes: Mutex<VecDeque<Result<FakeLink, LinkError>>>,
    pub attempts: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub fn new(outcomes: Vec<Result<FakeLink, LinkError>>) -> Self {
        Self { outcomes: Mutex::new(outcomes.into()), attempts: Arc::default() }
    }
}

impl Connector for FakeConnector {
    type Link = FakeLink;

    fn endpoint(&self) -> &str {
        "fake:0"
    }

    fn connect(&self) -> Result<FakeLink, LinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.outcomes.lock().unwrap().pop_front().unwrap_or_else(|| {
            Err(LinkError::ConnectionFailed { endpoint: "fake:0".into(), attempts: 1, last: "exhausted".into() })
        })
    }
}

#[derive(Default)]
pub struct RecordingBus {
    pub messages: Mutex<Vec<(String, serde_json::Value)>>,
}

impl BusPublisher for RecordingBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let value = serde_json::from_slice(&payload)
            .map_err(|e| PublishError { topic: topic.into(), reason: e.to_string() })?;
        self.messages.lock().unwrap().push((topic.into(), value));
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

impl io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    pub fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

/// Runs `f` with a plain-text subscriber and returns what it logged.
pub fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, String) {
    let buf = SharedBuf::default();
    let sink = buf.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || sink.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let out = tracing::subscriber::with_default(subscriber, f);
    (out, buf.text())
}

pub fn tracker() -> (Arc<LatencyTracker>, SharedBuf) {
    let buf = SharedBuf::default();
    let t = LatencyTracker::new(TimingLog::with_writer(Side::Drone, buf.clone()), TrackerConfig::default());
    (Arc::new(t), buf)
}

pub fn position_sample() -> Inbound {
    Inbound::Telemetry(TelemetrySample::Position {
        lat: 407_128_000,
        lon: -740_060_000,
        alt: 123_456,
        relative_alt: 5_000,
        heading: 9_000,
        vx: 0,
        vy: 0,
        vz: 0,
        recv_time: Instant::now(),
    })
}
