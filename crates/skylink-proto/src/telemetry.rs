use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryKind {
    Position,
    Attitude,
}

impl TelemetryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TelemetryKind::Position => "position",
            TelemetryKind::Attitude => "attitude",
        }
    }
}

impl std::fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message on the telemetry topic.
///
/// `timestamp` is the publish time in milliseconds since the Unix epoch and
/// `message_id` the correlation id the receiver echoes into its timing log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    pub timestamp: i64,
    pub message_id: String,
    #[serde(flatten)]
    pub body: TelemetryBody,
}

/// Converted sample, already in display units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TelemetryBody {
    Position {
        /// Degrees
        lat: f64,
        lon: f64,
        /// Meters above mean sea level
        alt: f64,
        /// Meters above home
        relative_alt: f64,
        /// Degrees, 0..360
        heading: f64,
        /// m/s, NED
        vx: f64,
        vy: f64,
        vz: f64,
    },
    Attitude {
        /// Degrees
        roll: f64,
        pitch: f64,
        yaw: f64,
        /// rad/s, passed through unconverted
        rollspeed: f64,
        pitchspeed: f64,
        yawspeed: f64,
    },
}

impl TelemetryBody {
    pub fn kind(&self) -> TelemetryKind {
        match self {
            TelemetryBody::Position { .. } => TelemetryKind::Position,
            TelemetryBody::Attitude { .. } => TelemetryKind::Attitude,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_serializes_with_type_tag() {
        let msg = TelemetryMessage {
            timestamp: 1_717_000_000_123,
            message_id: "abc".into(),
            body: TelemetryBody::Position {
                lat: 40.7128,
                lon: -74.006,
                alt: 123.456,
                relative_alt: 10.0,
                heading: 90.5,
                vx: 1.0,
                vy: 0.0,
                vz: -0.5,
            },
        };
        let v: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "position");
        assert_eq!(v["timestamp"], 1_717_000_000_123i64);
        assert_eq!(v["message_id"], "abc");
        assert_eq!(v["relative_alt"], 10.0);
    }

    #[test]
    fn attitude_parses_from_bus_json() {
        let raw = r#"{"type":"attitude","timestamp":5,"message_id":"m1",
            "roll":1.0,"pitch":2.0,"yaw":3.0,"rollspeed":0.1,"pitchspeed":0.2,"yawspeed":0.3}"#;
        let msg: TelemetryMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.body.kind(), TelemetryKind::Attitude);
        assert_eq!(msg.message_id, "m1");
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = r#"{"type":"battery","timestamp":5,"message_id":"m1","voltage":12.1}"#;
        assert!(serde_json::from_str::<TelemetryMessage>(raw).is_err());
    }
}
