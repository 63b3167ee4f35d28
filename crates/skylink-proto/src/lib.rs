//! JSON payloads exchanged over the bus: vehicle telemetry published by the
//! bridge and commands published by the ground side.

pub mod command;
pub mod telemetry;

pub use command::{Command, CommandPayload, FlightMode, ModeRequest, PayloadError, Rejection};
pub use telemetry::{TelemetryBody, TelemetryKind, TelemetryMessage};

pub const TOPIC_TELEMETRY: &str = "drone/telemetry";
pub const TOPIC_COMMAND: &str = "drone/command";
