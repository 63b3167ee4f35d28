//! Command payload -> ordered vehicle actions.
//!
//! Evaluation order is fixed: rc_override, mode, arm, takeoff_alt, position,
//! velocity. Takeoff and goto are composite and carry settle delays between
//! steps; the vehicle rejects the next step if its mode/arm transition has not
//! finished.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use skylink_fc::action::to_e7;
use skylink_fc::{LinkError, VehicleAction, VehicleLink};
use skylink_proto::{Command, FlightMode, PayloadError, Rejection};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{LatencyTracker, LinkSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleDelays {
    /// After the GUIDED switch that opens a takeoff.
    pub mode: Duration,
    /// After arming, before the takeoff command.
    pub arm: Duration,
    /// After the GUIDED switch that opens a goto.
    pub goto: Duration,
}

impl Default for SettleDelays {
    fn default() -> Self {
        Self {
            mode: Duration::from_secs(1),
            arm: Duration::from_secs(1),
            goto: Duration::from_millis(500),
        }
    }
}

impl SettleDelays {
    pub const NONE: SettleDelays =
        SettleDelays { mode: Duration::ZERO, arm: Duration::ZERO, goto: Duration::ZERO };
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Send(VehicleAction),
    Settle(Duration),
}

/// Expands a decoded command into the exact step sequence it produces.
pub fn plan(cmd: &Command, delays: &SettleDelays) -> Vec<Step> {
    let mut steps = Vec::new();
    let guided = FlightMode::Guided.custom_mode();

    if let Some(channels) = cmd.rc_override {
        steps.push(Step::Send(VehicleAction::RcOverride { channels }));
    }
    if let Some(mode) = cmd.mode {
        steps.push(Step::Send(VehicleAction::SetMode { custom_mode: mode.custom_mode() }));
    }
    if let Some(arm) = cmd.arm {
        steps.push(Step::Send(VehicleAction::ArmDisarm { arm }));
    }
    if let Some(alt) = cmd.takeoff_alt {
        steps.extend([
            Step::Send(VehicleAction::SetMode { custom_mode: guided }),
            Step::Settle(delays.mode),
            Step::Send(VehicleAction::ArmDisarm { arm: true }),
            Step::Settle(delays.arm),
            Step::Send(VehicleAction::Takeoff { alt }),
        ]);
    }
    if let Some(wp) = cmd.goto {
        steps.extend([
            Step::Send(VehicleAction::SetMode { custom_mode: guided }),
            Step::Settle(delays.goto),
            Step::Send(VehicleAction::Waypoint { lat: wp.lat, lon: wp.lon, alt: wp.alt }),
            Step::Send(VehicleAction::WaypointInt {
                lat_e7: to_e7(wp.lat),
                lon_e7: to_e7(wp.lon),
                alt: wp.alt,
            }),
        ]);
    }
    if let Some(v) = cmd.velocity {
        steps.push(Step::Send(VehicleAction::VelocityBody { vx: v.vx, vy: v.vy, vz: v.vz }));
    }
    steps
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    InvalidPayload(#[from] PayloadError),

    #[error("no vehicle connection")]
    NoConnection,

    #[error("send {action}: {source}")]
    Send {
        action: &'static str,
        #[source]
        source: LinkError,
    },
}

/// Outcome of one executed command.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub kind: String,
    pub correlation_id: Option<String>,
    pub actions_sent: usize,
    pub elapsed_ms: Option<f64>,
}

pub struct CommandTranslator<L> {
    slot: Arc<LinkSlot<L>>,
    tracker: Arc<LatencyTracker>,
    delays: SettleDelays,
}

impl<L: VehicleLink> CommandTranslator<L> {
    pub fn new(slot: Arc<LinkSlot<L>>, tracker: Arc<LatencyTracker>, delays: SettleDelays) -> Self {
        Self { slot, tracker, delays }
    }

    pub fn handle_payload(&self, payload: &[u8]) -> Result<Execution, CommandError> {
        let cmd = Command::from_slice(payload).map_err(|e| {
            error!(message_id = ?raw_message_id(payload), "dropping command: {e}");
            e
        })?;
        self.execute(&cmd)
    }

    /// Runs every step of `cmd` on the current link. Blocks for the settle
    /// delays of composite commands.
    pub fn execute(&self, cmd: &Command) -> Result<Execution, CommandError> {
        let kind = cmd.kind();
        let id = cmd.correlation_id.as_deref();
        let started = Instant::now();

        if let Some(id) = id {
            self.tracker.mark_received(id, &kind);
        }
        for r in &cmd.rejections {
            match r {
                Rejection::UnknownMode(_) => error!(%kind, message_id = ?id, "{r}"),
                _ => warn!(%kind, message_id = ?id, "{r}"),
            }
        }

        let Some(link) = self.slot.current() else {
            error!(%kind, message_id = ?id, "dropping command, no vehicle connection");
            if let Some(id) = id {
                self.tracker.abandon(id);
            }
            return Err(CommandError::NoConnection);
        };

        if cmd.is_empty() {
            info!(message_id = ?id, "command carries no actionable keys");
        }

        let mut sent = 0;
        for step in plan(cmd, &self.delays) {
            match step {
                Step::Send(action) => {
                    if let Err(source) = link.send_action(&action) {
                        error!(
                            %kind,
                            message_id = ?id,
                            action = action.name(),
                            actions_sent = sent,
                            "dropping rest of command: {source}"
                        );
                        if let Some(id) = id {
                            self.tracker.abandon(id);
                        }
                        return Err(CommandError::Send { action: action.name(), source });
                    }
                    info!(action = action.name(), ?action, "vehicle action sent");
                    sent += 1;
                }
                Step::Settle(d) if !d.is_zero() => thread::sleep(d),
                Step::Settle(_) => {}
            }
        }

        let elapsed_ms = id.and_then(|id| self.tracker.complete(id, &kind));
        info!(
            %kind,
            message_id = ?id,
            actions = sent,
            processing_ms = started.elapsed().as_secs_f64() * 1000.0,
            "command executed"
        );

        Ok(Execution { kind, correlation_id: cmd.correlation_id.clone(), actions_sent: sent, elapsed_ms })
    }
}

/// Best-effort `message_id` from a payload that failed to decode.
fn raw_message_id(payload: &[u8]) -> Option<String> {
    let v: serde_json::Value = serde_json::from_slice(payload).ok()?;
    v.get("message_id")?.as_str().map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use skylink_proto::{CommandPayload, ModeRequest};

    fn cmd(json: &str) -> Command {
        Command::from_slice(json.as_bytes()).unwrap()
    }

    fn actions(steps: &[Step]) -> Vec<&VehicleAction> {
        steps
            .iter()
            .filter_map(|s| match s {
                Step::Send(a) => Some(a),
                Step::Settle(_) => None,
            })
            .collect()
    }

    #[test]
    fn takeoff_is_guided_arm_takeoff_with_settles() {
        let steps = plan(&cmd(r#"{"takeoff_alt": 10}"#), &SettleDelays::default());
        assert_eq!(
            steps,
            vec![
                Step::Send(VehicleAction::SetMode { custom_mode: 4 }),
                Step::Settle(Duration::from_secs(1)),
                Step::Send(VehicleAction::ArmDisarm { arm: true }),
                Step::Settle(Duration::from_secs(1)),
                Step::Send(VehicleAction::Takeoff { alt: 10.0 }),
            ]
        );
    }

    #[test]
    fn goto_sends_both_coordinate_forms() {
        let c: Command = CommandPayload::goto(47.397742, 8.545594, 15.0).into();
        let steps = plan(&c, &SettleDelays::default());
        assert_eq!(steps[1], Step::Settle(Duration::from_millis(500)));
        assert_eq!(
            actions(&steps),
            vec![
                &VehicleAction::SetMode { custom_mode: 4 },
                &VehicleAction::Waypoint { lat: 47.397742, lon: 8.545594, alt: 15.0 },
                &VehicleAction::WaypointInt { lat_e7: 473_977_420, lon_e7: 85_455_940, alt: 15.0 },
            ]
        );
    }

    #[test]
    fn fixed_evaluation_order() {
        let c = cmd(
            r#"{"velocity":{"vx":1},"arm":true,"mode":"LOITER","rc_override":{"3":1500},"takeoff_alt":5}"#,
        );
        let names: Vec<_> = actions(&plan(&c, &SettleDelays::NONE)).iter().map(|a| a.name()).collect();
        assert_eq!(
            names,
            ["rc_override", "set_mode", "arm_disarm", "set_mode", "arm_disarm", "takeoff", "velocity"]
        );
    }

    #[test]
    fn raw_mode_passes_through() {
        let mut c = cmd("{}");
        c.mode = Some(ModeRequest::Raw(17));
        assert_eq!(
            plan(&c, &SettleDelays::NONE),
            vec![Step::Send(VehicleAction::SetMode { custom_mode: 17 })]
        );
    }

    #[test]
    fn empty_command_plans_nothing() {
        assert!(plan(&cmd("{}"), &SettleDelays::default()).is_empty());
    }
}
