use std::time::Instant;

use mavlink::common::{MavMessage, MavType};
use mavlink::{MavHeader, Message};
use skylink_proto::TelemetryKind;

use crate::PeerId;

/// Vehicle telemetry in the autopilot's own units.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetrySample {
    Position {
        /// degE7
        lat: i32,
        lon: i32,
        /// mm, MSL
        alt: i32,
        /// mm above home
        relative_alt: i32,
        /// cdeg, u16::MAX when unknown
        heading: u16,
        /// cm/s
        vx: i16,
        vy: i16,
        vz: i16,
        recv_time: Instant,
    },
    Attitude {
        /// rad
        roll: f32,
        pitch: f32,
        yaw: f32,
        /// rad/s
        roll_rate: f32,
        pitch_rate: f32,
        yaw_rate: f32,
        recv_time: Instant,
    },
}

impl TelemetrySample {
    pub fn kind(&self) -> TelemetryKind {
        match self {
            TelemetrySample::Position { .. } => TelemetryKind::Position,
            TelemetrySample::Attitude { .. } => TelemetryKind::Attitude,
        }
    }

    pub fn recv_time(&self) -> Instant {
        match self {
            TelemetrySample::Position { recv_time, .. } | TelemetrySample::Attitude { recv_time, .. } => {
                *recv_time
            }
        }
    }
}

/// What the receive path hands to the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Heartbeat { peer: PeerId, from_gcs: bool },
    Telemetry(TelemetrySample),
    /// Anything else, by MAVLink message id.
    Other(u32),
}

pub fn decode(header: &MavHeader, msg: &MavMessage, now: Instant) -> Inbound {
    match msg {
        MavMessage::HEARTBEAT(hb) => Inbound::Heartbeat {
            peer: PeerId { system_id: header.system_id, component_id: header.component_id },
            from_gcs: hb.mavtype == MavType::MAV_TYPE_GCS,
        },
        MavMessage::GLOBAL_POSITION_INT(p) => Inbound::Telemetry(TelemetrySample::Position {
            lat: p.lat,
            lon: p.lon,
            alt: p.alt,
            relative_alt: p.relative_alt,
            heading: p.hdg,
            vx: p.vx,
            vy: p.vy,
            vz: p.vz,
            recv_time: now,
        }),
        MavMessage::ATTITUDE(a) => Inbound::Telemetry(TelemetrySample::Attitude {
            roll: a.roll,
            pitch: a.pitch,
            yaw: a.yaw,
            roll_rate: a.rollspeed,
            pitch_rate: a.pitchspeed,
            yaw_rate: a.yawspeed,
            recv_time: now,
        }),
        other => Inbound::Other(other.message_id()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::common::{ATTITUDE_DATA, GLOBAL_POSITION_INT_DATA, HEARTBEAT_DATA, SYS_STATUS_DATA};

    fn hdr() -> MavHeader {
        MavHeader { system_id: 1, component_id: 1, sequence: 0 }
    }

    #[test]
    fn position_keeps_raw_units() {
        let now = Instant::now();
        let msg = MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
            lat: 407_128_000,
            alt: 123_456,
            hdg: 9050,
            vx: -150,
            ..Default::default()
        });
        match decode(&hdr(), &msg, now) {
            Inbound::Telemetry(TelemetrySample::Position { lat, alt, heading, vx, recv_time, .. }) => {
                assert_eq!((lat, alt, heading, vx), (407_128_000, 123_456, 9050, -150));
                assert_eq!(recv_time, now);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn attitude_sample_kind() {
        let msg = MavMessage::ATTITUDE(ATTITUDE_DATA { roll: 0.5, ..Default::default() });
        let Inbound::Telemetry(sample) = decode(&hdr(), &msg, Instant::now()) else {
            panic!("expected telemetry");
        };
        assert_eq!(sample.kind(), TelemetryKind::Attitude);
    }

    #[test]
    fn heartbeat_carries_sender_ids() {
        let header = MavHeader { system_id: 7, component_id: 190, sequence: 3 };
        let msg = MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            mavtype: MavType::MAV_TYPE_GCS,
            ..Default::default()
        });
        assert_eq!(
            decode(&header, &msg, Instant::now()),
            Inbound::Heartbeat { peer: PeerId { system_id: 7, component_id: 190 }, from_gcs: true }
        );
    }

    #[test]
    fn other_messages_by_id() {
        let msg = MavMessage::SYS_STATUS(SYS_STATUS_DATA::default());
        assert_eq!(decode(&hdr(), &msg, Instant::now()), Inbound::Other(1));
    }
}
