pub mod action;
pub mod decode;
pub mod doctor;
pub mod error;
pub mod mav;
pub mod state;

use std::time::Duration;

use serde::Deserialize;
use tracing::info;

pub use action::VehicleAction;
pub use decode::{Inbound, TelemetrySample};
pub use error::LinkError;
pub use mav::{FcConnector, FcLink};
pub use state::{LinkState, LinkStatus, PeerId};

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    /// MAVLink endpoint. Examples:
    /// "tcpout:127.0.0.1:5762", "udpin:0.0.0.0:14550", "serial:/dev/ttyACM0:57600"
    pub endpoint: String,

    /// MAVLink ids we send with (bridge side)
    #[serde(default = "default_sys_id")]
    pub sys_id: u8,
    #[serde(default)]
    pub comp_id: u8,

    /// Attempts per connect() before giving up with ConnectionFailed.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Fixed pause between connect attempts.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// How long one attempt waits for the vehicle's HEARTBEAT.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Optional: companion heartbeat rate while connected. Off when unset.
    pub send_heartbeat_hz: Option<f32>,

    #[serde(default)]
    pub streams: StreamRates,
}

fn default_sys_id() -> u8 { 255 }
fn default_connect_retries() -> u32 { 10 }
fn default_retry_backoff_ms() -> u64 { 1000 }
fn default_heartbeat_timeout_ms() -> u64 { 10_000 }

impl LinkConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            sys_id: default_sys_id(),
            comp_id: 0,
            connect_retries: default_connect_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            send_heartbeat_hz: None,
            streams: StreamRates::default(),
        }
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.send_heartbeat_hz
            .filter(|hz| *hz > 0.0)
            .map(|hz| Duration::from_secs_f32(1.0 / hz.max(0.2)))
    }
}

/// Rates asked of the vehicle once per successful connect.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct StreamRates {
    #[serde(default = "default_stream_hz")]
    pub position_hz: f32,
    #[serde(default = "default_stream_hz")]
    pub attitude_hz: f32,
    /// REQUEST_DATA_STREAM fallback for autopilots that ignore SET_MESSAGE_INTERVAL.
    #[serde(default = "default_fallback_hz")]
    pub fallback_all_hz: u16,
}

fn default_stream_hz() -> f32 { 5.0 }
fn default_fallback_hz() -> u16 { 4 }

impl Default for StreamRates {
    fn default() -> Self {
        Self {
            position_hz: default_stream_hz(),
            attitude_hz: default_stream_hz(),
            fallback_all_hz: default_fallback_hz(),
        }
    }
}

/// A live connection to the vehicle.
///
/// Sends are fire-and-forget; `receive` returns `Ok(None)` on timeout, which
/// is the normal idle case. Transport errors are returned, never retried here.
pub trait VehicleLink: Send + Sync + 'static {
    fn peer(&self) -> PeerId;

    fn send_action(&self, action: &VehicleAction) -> Result<(), LinkError>;

    fn receive(&self, timeout: Duration) -> Result<Option<Inbound>, LinkError>;

    /// Ask for position and attitude streams two ways, since some autopilots
    /// only honor one of them.
    fn request_streams(&self, rates: &StreamRates) -> Result<(), LinkError> {
        for action in VehicleAction::stream_requests(rates) {
            self.send_action(&action)?;
        }
        info!(
            position_hz = rates.position_hz,
            attitude_hz = rates.attitude_hz,
            fallback_hz = rates.fallback_all_hz,
            "requested telemetry streams"
        );
        Ok(())
    }
}

/// Establishes vehicle connections. The only place peer identity is learned.
pub trait Connector: Send + Sync {
    type Link: VehicleLink;

    fn endpoint(&self) -> &str;

    fn connect(&self) -> Result<Self::Link, LinkError>;
}
