use mavlink::common::{
    MavAutopilot, MavCmd, MavDataStream, MavFrame, MavMessage, MavModeFlag, MavState, MavType,
    PositionTargetTypemask, COMMAND_LONG_DATA, HEARTBEAT_DATA, MISSION_ITEM_DATA,
    MISSION_ITEM_INT_DATA, RC_CHANNELS_OVERRIDE_DATA, REQUEST_DATA_STREAM_DATA,
    SET_POSITION_TARGET_LOCAL_NED_DATA,
};

use crate::{PeerId, StreamRates};

pub const MSG_ID_ATTITUDE: u32 = 30;
pub const MSG_ID_GLOBAL_POSITION_INT: u32 = 33;

/// Only vx/vy/vz active: position, acceleration, yaw and yaw rate ignored.
pub const VELOCITY_ONLY_MASK: u16 = 0b0000_1111_1100_0111;

/// MISSION_ITEM `current` value meaning "fly here now" in guided mode.
pub const GUIDED_CURRENT: u8 = 2;

/// One protocol-level action addressed to the vehicle.
#[derive(Debug, Clone, PartialEq)]
pub enum VehicleAction {
    SetMode { custom_mode: u32 },
    ArmDisarm { arm: bool },
    Takeoff { alt: f32 },
    /// Guided waypoint with float degrees.
    Waypoint { lat: f64, lon: f64, alt: f32 },
    /// Same waypoint with 1e7-scaled integer degrees.
    WaypointInt { lat_e7: i32, lon_e7: i32, alt: f32 },
    VelocityBody { vx: f32, vy: f32, vz: f32 },
    RcOverride { channels: [u16; 8] },
    SetMessageInterval { message_id: u32, interval_us: f32 },
    RequestDataStream { stream_id: u8, rate_hz: u16, start: bool },
    Heartbeat,
}

pub fn to_e7(deg: f64) -> i32 {
    (deg * 1e7).round() as i32
}

fn interval_us(hz: f32) -> f32 {
    if hz > 0.0 { 1_000_000.0 / hz } else { -1.0 }
}

impl VehicleAction {
    pub fn name(&self) -> &'static str {
        match self {
            VehicleAction::SetMode { .. } => "set_mode",
            VehicleAction::ArmDisarm { .. } => "arm_disarm",
            VehicleAction::Takeoff { .. } => "takeoff",
            VehicleAction::Waypoint { .. } => "waypoint",
            VehicleAction::WaypointInt { .. } => "waypoint_int",
            VehicleAction::VelocityBody { .. } => "velocity",
            VehicleAction::RcOverride { .. } => "rc_override",
            VehicleAction::SetMessageInterval { .. } => "set_message_interval",
            VehicleAction::RequestDataStream { .. } => "request_data_stream",
            VehicleAction::Heartbeat => "heartbeat",
        }
    }

    /// SET_MESSAGE_INTERVAL for position and attitude, then the broader
    /// REQUEST_DATA_STREAM as a fallback.
    pub fn stream_requests(rates: &StreamRates) -> Vec<Self> {
        vec![
            VehicleAction::SetMessageInterval {
                message_id: MSG_ID_GLOBAL_POSITION_INT,
                interval_us: interval_us(rates.position_hz),
            },
            VehicleAction::SetMessageInterval {
                message_id: MSG_ID_ATTITUDE,
                interval_us: interval_us(rates.attitude_hz),
            },
            VehicleAction::RequestDataStream {
                stream_id: MavDataStream::MAV_DATA_STREAM_ALL as u8,
                rate_hz: rates.fallback_all_hz,
                start: true,
            },
        ]
    }

    pub fn to_mav(&self, target: PeerId) -> MavMessage {
        let sys = target.system_id;
        let comp = target.component_id;
        match *self {
            VehicleAction::SetMode { custom_mode } => command_long(
                target,
                MavCmd::MAV_CMD_DO_SET_MODE,
                [
                    MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits() as f32,
                    custom_mode as f32,
                    0.0, 0.0, 0.0, 0.0, 0.0,
                ],
            ),
            VehicleAction::ArmDisarm { arm } => command_long(
                target,
                MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
                [if arm { 1.0 } else { 0.0 }, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            ),
            VehicleAction::Takeoff { alt } => command_long(
                target,
                MavCmd::MAV_CMD_NAV_TAKEOFF,
                [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, alt],
            ),
            VehicleAction::SetMessageInterval { message_id, interval_us } => command_long(
                target,
                MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL,
                [message_id as f32, interval_us, 0.0, 0.0, 0.0, 0.0, 0.0],
            ),
            VehicleAction::Waypoint { lat, lon, alt } => MavMessage::MISSION_ITEM(MISSION_ITEM_DATA {
                param1: 0.0, // hold time
                param2: 0.0, // acceptance radius
                param3: 0.0, // pass radius
                param4: 0.0, // yaw
                x: lat as f32,
                y: lon as f32,
                z: alt,
                seq: 0,
                command: MavCmd::MAV_CMD_NAV_WAYPOINT,
                target_system: sys,
                target_component: comp,
                frame: MavFrame::MAV_FRAME_GLOBAL,
                current: GUIDED_CURRENT,
                autocontinue: 0,
                ..Default::default()
            }),
            VehicleAction::WaypointInt { lat_e7, lon_e7, alt } => {
                MavMessage::MISSION_ITEM_INT(MISSION_ITEM_INT_DATA {
                    param1: 0.0,
                    param2: 0.0,
                    param3: 0.0,
                    param4: 0.0,
                    x: lat_e7,
                    y: lon_e7,
                    z: alt,
                    seq: 0,
                    command: MavCmd::MAV_CMD_NAV_WAYPOINT,
                    target_system: sys,
                    target_component: comp,
                    frame: MavFrame::MAV_FRAME_GLOBAL,
                    current: GUIDED_CURRENT,
                    autocontinue: 0,
                    ..Default::default()
                })
            }
            VehicleAction::VelocityBody { vx, vy, vz } => {
                MavMessage::SET_POSITION_TARGET_LOCAL_NED(SET_POSITION_TARGET_LOCAL_NED_DATA {
                    time_boot_ms: 0,
                    x: 0.0,
                    y: 0.0,
                    z: 0.0,
                    vx,
                    vy,
                    vz,
                    afx: 0.0,
                    afy: 0.0,
                    afz: 0.0,
                    yaw: 0.0,
                    yaw_rate: 0.0,
                    type_mask: PositionTargetTypemask::from_bits_truncate(VELOCITY_ONLY_MASK),
                    target_system: sys,
                    target_component: comp,
                    coordinate_frame: MavFrame::MAV_FRAME_BODY_OFFSET_NED,
                })
            }
            VehicleAction::RcOverride { channels } => {
                MavMessage::RC_CHANNELS_OVERRIDE(RC_CHANNELS_OVERRIDE_DATA {
                    chan1_raw: channels[0],
                    chan2_raw: channels[1],
                    chan3_raw: channels[2],
                    chan4_raw: channels[3],
                    chan5_raw: channels[4],
                    chan6_raw: channels[5],
                    chan7_raw: channels[6],
                    chan8_raw: channels[7],
                    target_system: sys,
                    target_component: comp,
                    ..Default::default()
                })
            }
            VehicleAction::RequestDataStream { stream_id, rate_hz, start } => {
                MavMessage::REQUEST_DATA_STREAM(REQUEST_DATA_STREAM_DATA {
                    req_message_rate: rate_hz,
                    target_system: sys,
                    target_component: comp,
                    req_stream_id: stream_id,
                    start_stop: u8::from(start),
                })
            }
            VehicleAction::Heartbeat => MavMessage::HEARTBEAT(HEARTBEAT_DATA {
                custom_mode: 0,
                mavtype: MavType::MAV_TYPE_ONBOARD_CONTROLLER,
                autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
                base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
                system_status: MavState::MAV_STATE_ACTIVE,
                mavlink_version: 3,
            }),
        }
    }
}

fn command_long(target: PeerId, command: MavCmd, p: [f32; 7]) -> MavMessage {
    MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
        target_system: target.system_id,
        target_component: target.component_id,
        command,
        confirmation: 0,
        param1: p[0],
        param2: p[1],
        param3: p[2],
        param4: p[3],
        param5: p[4],
        param6: p[5],
        param7: p[6],
    })
}
