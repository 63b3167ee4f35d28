use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const RC_CHANNELS: usize = 8;

/// ArduCopter flight modes addressable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlightMode {
    Stabilize,
    Auto,
    Guided,
    Loiter,
    Rtl,
    Land,
}

impl FlightMode {
    pub const ALL: [FlightMode; 6] = [
        FlightMode::Stabilize,
        FlightMode::Auto,
        FlightMode::Guided,
        FlightMode::Loiter,
        FlightMode::Rtl,
        FlightMode::Land,
    ];

    /// Custom mode number sent to the autopilot.
    pub fn custom_mode(self) -> u32 {
        match self {
            FlightMode::Stabilize => 0,
            FlightMode::Auto => 3,
            FlightMode::Guided => 4,
            FlightMode::Loiter => 5,
            FlightMode::Rtl => 6,
            FlightMode::Land => 9,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FlightMode::Stabilize => "STABILIZE",
            FlightMode::Auto => "AUTO",
            FlightMode::Guided => "GUIDED",
            FlightMode::Loiter => "LOITER",
            FlightMode::Rtl => "RTL",
            FlightMode::Land => "LAND",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }
}

/// A mode change target: a known name or a raw custom mode id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeRequest {
    Named(FlightMode),
    Raw(u32),
}

impl ModeRequest {
    pub fn custom_mode(self) -> u32 {
        match self {
            ModeRequest::Named(m) => m.custom_mode(),
            ModeRequest::Raw(id) => id,
        }
    }
}

impl std::fmt::Display for ModeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModeRequest::Named(m) => f.write_str(m.name()),
            ModeRequest::Raw(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid command payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

/// A key that was present but could not be turned into an action. The rest
/// of the command is still executed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("unknown flight mode: {0}")]
    UnknownMode(String),
    #[error("arm value is not a boolean or number: {0}")]
    InvalidArm(String),
    #[error("rc_override channel {0:?} is not in 1..=8")]
    InvalidChannel(String),
    #[error("incomplete position data in `{0}`")]
    IncompletePosition(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VelocityPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vx: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vy: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vz: Option<f32>,
}

/// Wire shape of a command topic message. Any subset of keys may be present;
/// unrecognized keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rc_override: Option<BTreeMap<String, u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arm: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub takeoff_alt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<PositionPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<VelocityPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl CommandPayload {
    pub fn mode(mode: FlightMode) -> Self {
        Self { mode: Some(Value::from(mode.name())), ..Self::default() }
    }

    /// GUIDED plus takeoff, the way the console's takeoff key sends it.
    pub fn takeoff(alt_m: f64) -> Self {
        Self { takeoff_alt: Some(alt_m), ..Self::mode(FlightMode::Guided) }
    }

    pub fn velocity(vx: f32, vy: f32, vz: f32) -> Self {
        Self {
            velocity: Some(VelocityPayload { vx: Some(vx), vy: Some(vy), vz: Some(vz) }),
            ..Self::default()
        }
    }

    pub fn goto(lat: f64, lon: f64, alt: f64) -> Self {
        Self {
            position: Some(PositionPayload { lat: Some(lat), lon: Some(lon), alt: Some(alt) }),
            ..Self::default()
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Waypoint {
    pub lat: f64,
    pub lon: f64,
    pub alt: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Velocity {
    pub vx: f32,
    pub vy: f32,
    pub vz: f32,
}

/// A decoded, validated command. Built once from a payload and consumed by
/// the translator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Command {
    /// Pulse widths for channels 1..=8, 0 meaning "release".
    pub rc_override: Option<[u16; RC_CHANNELS]>,
    pub mode: Option<ModeRequest>,
    pub arm: Option<bool>,
    pub takeoff_alt: Option<f32>,
    pub goto: Option<Waypoint>,
    pub velocity: Option<Velocity>,
    pub correlation_id: Option<String>,
    pub rejections: Vec<Rejection>,
}

impl Command {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, PayloadError> {
        let payload: CommandPayload = serde_json::from_slice(bytes)?;
        Ok(Self::from(payload))
    }

    /// True when no key produced an action.
    pub fn is_empty(&self) -> bool {
        self.rc_override.is_none()
            && self.mode.is_none()
            && self.arm.is_none()
            && self.takeoff_alt.is_none()
            && self.goto.is_none()
            && self.velocity.is_none()
    }

    /// Label used for this command in timing records.
    pub fn kind(&self) -> String {
        if let Some(mode) = self.mode {
            format!("mode_{mode}")
        } else if self.velocity.is_some() {
            "velocity".into()
        } else if self.goto.is_some() {
            "position".into()
        } else if self.rc_override.is_some() {
            "rc_override".into()
        } else if self.takeoff_alt.is_some() {
            "takeoff".into()
        } else if self.arm.is_some() {
            "arm".into()
        } else {
            "unknown".into()
        }
    }
}

impl From<CommandPayload> for Command {
    fn from(p: CommandPayload) -> Self {
        let mut rejections = Vec::new();

        let rc_override = p.rc_override.map(|map| {
            let mut channels = [0u16; RC_CHANNELS];
            for (key, pwm) in map {
                match key.trim().parse::<usize>() {
                    Ok(ch @ 1..=RC_CHANNELS) => channels[ch - 1] = pwm,
                    _ => rejections.push(Rejection::InvalidChannel(key)),
                }
            }
            channels
        });

        let mode = p.mode.and_then(|v| match parse_mode(&v) {
            Some(m) => Some(m),
            None => {
                let text = v.as_str().map(str::to_owned).unwrap_or_else(|| v.to_string());
                rejections.push(Rejection::UnknownMode(text));
                None
            }
        });

        let arm = p.arm.and_then(|v| match &v {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => Some(n.as_f64().map(|x| x != 0.0).unwrap_or(false)),
            other => {
                rejections.push(Rejection::InvalidArm(other.to_string()));
                None
            }
        });

        let goto = match p.position {
            Some(pos) => match (pos.lat, pos.lon, pos.alt) {
                (Some(lat), Some(lon), Some(alt)) => Some(Waypoint { lat, lon, alt: alt as f32 }),
                _ => {
                    rejections.push(Rejection::IncompletePosition("position"));
                    None
                }
            },
            None => match (p.lat, p.lon, p.alt) {
                (Some(lat), Some(lon), Some(alt)) => Some(Waypoint { lat, lon, alt: alt as f32 }),
                (None, None, None) => None,
                _ => {
                    rejections.push(Rejection::IncompletePosition("lat/lon/alt"));
                    None
                }
            },
        };

        let velocity = p.velocity.map(|v| Velocity {
            vx: v.vx.unwrap_or(0.0),
            vy: v.vy.unwrap_or(0.0),
            vz: v.vz.unwrap_or(0.0),
        });

        Command {
            rc_override,
            mode,
            arm,
            takeoff_alt: p.takeoff_alt.map(|a| a as f32),
            goto,
            velocity,
            correlation_id: p.message_id.filter(|id| !id.is_empty()),
            rejections,
        }
    }
}

fn parse_mode(v: &Value) -> Option<ModeRequest> {
    match v {
        Value::String(s) => FlightMode::from_name(s)
            .map(ModeRequest::Named)
            .or_else(|| s.trim().parse::<u32>().ok().map(ModeRequest::Raw)),
        Value::Number(n) => {
            if let Some(id) = n.as_u64() {
                u32::try_from(id).ok().map(ModeRequest::Raw)
            } else {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= u32::MAX as f64)
                    .map(|f| ModeRequest::Raw(f as u32))
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Command {
        Command::from_slice(raw.as_bytes()).unwrap()
    }

    #[test]
    fn known_and_raw_modes() {
        assert_eq!(parse(r#"{"mode":"LOITER"}"#).mode, Some(ModeRequest::Named(FlightMode::Loiter)));
        assert_eq!(parse(r#"{"mode":"7"}"#).mode, Some(ModeRequest::Raw(7)));
        assert_eq!(parse(r#"{"mode":16}"#).mode, Some(ModeRequest::Raw(16)));
        assert_eq!(FlightMode::Land.custom_mode(), 9);
        assert_eq!(FlightMode::Auto.custom_mode(), 3);
    }

    #[test]
    fn unknown_mode_is_rejected_but_arm_survives() {
        let cmd = parse(r#"{"mode":"FOO","arm":true}"#);
        assert_eq!(cmd.mode, None);
        assert_eq!(cmd.arm, Some(true));
        assert_eq!(cmd.rejections, vec![Rejection::UnknownMode("FOO".into())]);
    }

    #[test]
    fn rc_override_fills_missing_channels_with_zero() {
        let cmd = parse(r#"{"rc_override":{"1":1500,"3":1200,"8":1900}}"#);
        assert_eq!(cmd.rc_override, Some([1500, 0, 1200, 0, 0, 0, 0, 1900]));
        assert!(cmd.rejections.is_empty());
    }

    #[test]
    fn rc_override_out_of_range_channel() {
        let cmd = parse(r#"{"rc_override":{"9":1500,"2":1100}}"#);
        assert_eq!(cmd.rc_override, Some([0, 1100, 0, 0, 0, 0, 0, 0]));
        assert_eq!(cmd.rejections, vec![Rejection::InvalidChannel("9".into())]);
    }

    #[test]
    fn position_object_wins_over_legacy_keys() {
        let cmd = parse(r#"{"position":{"lat":1.5,"lon":2.5,"alt":30},"lat":9.0,"lon":9.0,"alt":9.0}"#);
        assert_eq!(cmd.goto, Some(Waypoint { lat: 1.5, lon: 2.5, alt: 30.0 }));
    }

    #[test]
    fn legacy_top_level_target() {
        let cmd = parse(r#"{"lat":45.0,"lon":7.0,"alt":20.0}"#);
        assert_eq!(cmd.goto, Some(Waypoint { lat: 45.0, lon: 7.0, alt: 20.0 }));
    }

    #[test]
    fn incomplete_position_is_rejected() {
        let cmd = parse(r#"{"position":{"lat":1.0,"alt":3.0}}"#);
        assert_eq!(cmd.goto, None);
        assert_eq!(cmd.rejections, vec![Rejection::IncompletePosition("position")]);
    }

    #[test]
    fn velocity_defaults_missing_axes() {
        let cmd = parse(r#"{"velocity":{"vz":-2.5}}"#);
        assert_eq!(cmd.velocity, Some(Velocity { vx: 0.0, vy: 0.0, vz: -2.5 }));
    }

    #[test]
    fn arm_accepts_numbers() {
        assert_eq!(parse(r#"{"arm":0}"#).arm, Some(false));
        assert_eq!(parse(r#"{"arm":1}"#).arm, Some(true));
        assert_eq!(parse(r#"{"arm":"yes"}"#).arm, None);
    }

    #[test]
    fn malformed_json_is_invalid() {
        assert!(Command::from_slice(b"{not json").is_err());
        assert!(Command::from_slice(b"[1,2]").is_err());
        assert!(Command::from_slice(br#"{"takeoff_alt":"high"}"#).is_err());
    }

    #[test]
    fn unrecognized_keys_are_ignored() {
        let cmd = parse(r#"{"launch":true,"velocity":{"vx":1.0,"yaw":3}}"#);
        assert_eq!(cmd.velocity.map(|v| v.vx), Some(1.0));
        assert!(parse(r#"{"launch":true}"#).is_empty());
    }

    #[test]
    fn empty_command_is_noop() {
        let cmd = parse(r#"{"message_id":"abc"}"#);
        assert!(cmd.is_empty());
        assert_eq!(cmd.correlation_id.as_deref(), Some("abc"));
        assert_eq!(cmd.kind(), "unknown");
    }

    #[test]
    fn kind_prefers_mode() {
        assert_eq!(parse(r#"{"mode":"GUIDED","takeoff_alt":10}"#).kind(), "mode_GUIDED");
        assert_eq!(parse(r#"{"takeoff_alt":10}"#).kind(), "takeoff");
    }

    #[test]
    fn console_payloads_decode() {
        let bytes = serde_json::to_vec(&CommandPayload::takeoff(10.0).with_message_id("m")).unwrap();
        let cmd = Command::from_slice(&bytes).unwrap();
        assert_eq!(cmd.mode, Some(ModeRequest::Named(FlightMode::Guided)));
        assert_eq!(cmd.takeoff_alt, Some(10.0));
        assert_eq!(cmd.correlation_id.as_deref(), Some("m"));
    }
}
