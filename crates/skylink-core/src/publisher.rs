use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use skylink_fc::TelemetrySample;
use skylink_proto::{TelemetryBody, TelemetryKind, TelemetryMessage};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::{epoch_ms, LatencyTracker};

pub const RAD_TO_DEG: f64 = 57.2958;

#[derive(Debug, Error)]
#[error("publish to {topic}: {reason}")]
pub struct PublishError {
    pub topic: String,
    pub reason: String,
}

/// Outbound half of the bus as seen by the bridge.
pub trait BusPublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

impl<T: BusPublisher + ?Sized> BusPublisher for Arc<T> {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        (**self).publish(topic, payload)
    }
}

/// Minimum spacing between publishes of the same telemetry kind.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last: HashMap<TelemetryKind, Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval, last: HashMap::new() }
    }

    pub fn ready(&self, kind: TelemetryKind, now: Instant) -> bool {
        match self.last.get(&kind) {
            Some(t) => now.saturating_duration_since(*t) >= self.min_interval,
            None => true,
        }
    }

    pub fn mark(&mut self, kind: TelemetryKind, now: Instant) {
        self.last.insert(kind, now);
    }
}

/// Raw autopilot units to the wire units: degrees, meters, m/s.
pub fn convert(sample: &TelemetrySample) -> TelemetryBody {
    match *sample {
        TelemetrySample::Position { lat, lon, alt, relative_alt, heading, vx, vy, vz, .. } => {
            TelemetryBody::Position {
                lat: lat as f64 / 1e7,
                lon: lon as f64 / 1e7,
                alt: alt as f64 / 1000.0,
                relative_alt: relative_alt as f64 / 1000.0,
                heading: heading as f64 / 100.0,
                vx: vx as f64 / 100.0,
                vy: vy as f64 / 100.0,
                vz: vz as f64 / 100.0,
            }
        }
        // rates stay in rad/s
        TelemetrySample::Attitude { roll, pitch, yaw, roll_rate, pitch_rate, yaw_rate, .. } => {
            TelemetryBody::Attitude {
                roll: roll as f64 * RAD_TO_DEG,
                pitch: pitch as f64 * RAD_TO_DEG,
                yaw: yaw as f64 * RAD_TO_DEG,
                rollspeed: roll_rate as f64,
                pitchspeed: pitch_rate as f64,
                yawspeed: yaw_rate as f64,
            }
        }
    }
}

pub struct TelemetryPublisher<P> {
    sink: P,
    topic: String,
    limiter: RateLimiter,
    tracker: Arc<LatencyTracker>,
    published: u64,
    dropped: u64,
}

impl<P: BusPublisher> TelemetryPublisher<P> {
    pub fn new(sink: P, topic: impl Into<String>, min_interval: Duration, tracker: Arc<LatencyTracker>) -> Self {
        Self {
            sink,
            topic: topic.into(),
            limiter: RateLimiter::new(min_interval),
            tracker,
            published: 0,
            dropped: 0,
        }
    }

    /// Publishes `sample` unless one of its kind went out less than the
    /// minimum interval ago. `Ok(None)` means rate limited.
    pub fn handle(&mut self, sample: &TelemetrySample) -> Result<Option<TelemetryMessage>, PublishError> {
        let kind = sample.kind();
        let now = sample.recv_time();
        if !self.limiter.ready(kind, now) {
            self.dropped += 1;
            return Ok(None);
        }

        let msg = TelemetryMessage {
            timestamp: epoch_ms(),
            message_id: Uuid::new_v4().to_string(),
            body: convert(sample),
        };
        let payload = serde_json::to_vec(&msg)
            .map_err(|e| PublishError { topic: self.topic.clone(), reason: e.to_string() })?;

        self.tracker.begin(&msg.message_id, kind.as_str());
        if let Err(e) = self.sink.publish(&self.topic, payload) {
            self.tracker.abandon(&msg.message_id);
            return Err(e);
        }
        self.limiter.mark(kind, now);
        self.published += 1;
        debug!(%kind, message_id = %msg.message_id, "telemetry published");
        Ok(Some(msg))
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Side, TimingLog, TrackerConfig};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Sink {
        sent: Mutex<Vec<(String, Vec<u8>)>>,
        fail: bool,
    }

    impl BusPublisher for Sink {
        fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
            if self.fail {
                return Err(PublishError { topic: topic.into(), reason: "offline".into() });
            }
            self.sent.lock().unwrap().push((topic.into(), payload));
            Ok(())
        }
    }

    fn tracker() -> Arc<LatencyTracker> {
        Arc::new(LatencyTracker::new(TimingLog::with_writer(Side::Drone, std::io::sink()), TrackerConfig::default()))
    }

    fn position(at: Instant) -> TelemetrySample {
        TelemetrySample::Position {
            lat: 407_128_000,
            lon: -740_060_000,
            alt: 123_456,
            relative_alt: 10_500,
            heading: 27_000,
            vx: 150,
            vy: -20,
            vz: 0,
            recv_time: at,
        }
    }

    fn attitude(at: Instant) -> TelemetrySample {
        TelemetrySample::Attitude {
            roll: 0.1,
            pitch: -0.2,
            yaw: 3.14159,
            roll_rate: 0.01,
            pitch_rate: 0.0,
            yaw_rate: -0.5,
            recv_time: at,
        }
    }

    #[test]
    fn position_units() {
        let TelemetryBody::Position { lat, lon, alt, relative_alt, heading, vx, vy, .. } =
            convert(&position(Instant::now()))
        else {
            panic!("expected position");
        };
        assert!((lat - 40.7128).abs() < 1e-9);
        assert!((lon + 74.006).abs() < 1e-9);
        assert!((alt - 123.456).abs() < 1e-9);
        assert!((relative_alt - 10.5).abs() < 1e-9);
        assert_eq!(heading, 270.0);
        assert_eq!((vx, vy), (1.5, -0.2));
    }

    #[test]
    fn attitude_angles_in_degrees_rates_untouched() {
        let TelemetryBody::Attitude { roll, yaw, yawspeed, .. } = convert(&attitude(Instant::now())) else {
            panic!("expected attitude");
        };
        assert!((roll - 5.72958).abs() < 1e-4);
        assert!((yaw - 179.999).abs() < 0.01);
        assert!((yawspeed + 0.5).abs() < 1e-9);
    }

    #[test]
    fn rate_limit_per_kind() {
        let sink = Arc::new(Sink::default());
        let mut p = TelemetryPublisher::new(sink.clone(), "drone/telemetry", Duration::from_millis(500), tracker());
        let t0 = Instant::now();

        assert!(p.handle(&position(t0)).unwrap().is_some());
        assert!(p.handle(&position(t0 + Duration::from_millis(200))).unwrap().is_none());
        assert!(p.handle(&attitude(t0 + Duration::from_millis(200))).unwrap().is_some());
        assert!(p.handle(&position(t0 + Duration::from_millis(600))).unwrap().is_some());

        assert_eq!((p.published(), p.dropped()), (3, 1));
        let sent = sink.sent.lock().unwrap();
        assert!(sent.iter().all(|(topic, _)| topic == "drone/telemetry"));
        let first: serde_json::Value = serde_json::from_slice(&sent[0].1).unwrap();
        assert_eq!(first["type"], "position");
        assert!(first["message_id"].as_str().is_some_and(|id| id.len() == 36));
    }

    #[test]
    fn failed_publish_does_not_consume_the_slot() {
        let t = tracker();
        let mut p = TelemetryPublisher::new(
            Sink { fail: true, ..Default::default() },
            "drone/telemetry",
            Duration::from_millis(500),
            t.clone(),
        );
        let now = Instant::now();
        assert!(p.handle(&position(now)).is_err());
        assert_eq!(t.pending_len(), 0);

        p.sink.fail = false;
        assert!(p.handle(&position(now)).unwrap().is_some());
    }
}
