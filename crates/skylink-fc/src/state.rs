use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
        })
    }
}

/// System/component ids of a MAVLink node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerId {
    pub system_id: u8,
    pub component_id: u8,
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.system_id, self.component_id)
    }
}

#[derive(Debug, Clone)]
pub struct LinkStatus {
    pub state: LinkState,
    pub endpoint: String,
    pub peer: Option<PeerId>,
    pub last_heartbeat: Option<Instant>,
    /// Successful connects since start, including the first.
    pub connects: u32,
    pub last_error: Option<String>,
}

impl LinkStatus {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            state: LinkState::Disconnected,
            endpoint: endpoint.into(),
            peer: None,
            last_heartbeat: None,
            connects: 0,
            last_error: None,
        }
    }

    pub fn hb_age(&self) -> Option<Duration> {
        self.last_heartbeat.map(|t| t.elapsed())
    }
}
