use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use mavlink::common::MavMessage;
use mavlink::error::MessageReadError;
use mavlink::{MavConnection, MavHeader};
use tracing::{debug, info, warn};

use crate::decode::{decode, Inbound};
use crate::{Connector, LinkConfig, LinkError, PeerId, VehicleAction, VehicleLink};

type Conn = Arc<Box<dyn MavConnection<MavMessage> + Send + Sync>>;

const INBOX_DEPTH: usize = 512;

enum ReaderEvent {
    Frame(MavHeader, MavMessage),
    Fault(String),
}

/// An open MAVLink transport and its `mav-rx` reader. Dropping it tells the
/// reader to exit at its next wake-up, which releases the socket.
struct Transport {
    conn: Conn,
    inbox: Receiver<ReaderEvent>,
    stop: Arc<AtomicBool>,
}

impl Transport {
    fn open(endpoint: &str) -> Result<Self, LinkError> {
        let open_err = |source: io::Error| LinkError::Open { endpoint: endpoint.to_string(), source };

        if let Some((dev, baud)) = parse_serial(endpoint) {
            // quick validate device before the codec takes it
            let _ = tokio_serial::new(dev, baud).open().map_err(|e| open_err(io::Error::from(e)))?;
        }

        let conn: Conn = Arc::new(mavlink::connect::<MavMessage>(endpoint).map_err(open_err)?);
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, inbox) = bounded(INBOX_DEPTH);
        spawn_reader(conn.clone(), tx, stop.clone()).map_err(open_err)?;

        info!(%endpoint, "mavlink transport open");
        Ok(Self { conn, inbox, stop })
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// One established MAVLink session. Dropped and rebuilt on every reconnect.
pub struct FcLink {
    transport: Transport,
    endpoint: String,
    own: PeerId,
    peer: PeerId,
    sequence: AtomicU8,
}

impl FcLink {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn send(&self, msg: &MavMessage) -> Result<(), LinkError> {
        let hdr = MavHeader {
            system_id: self.own.system_id,
            component_id: self.own.component_id,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };
        self.transport
            .conn
            .send(&hdr, msg)
            .map_err(|e| LinkError::Transport(format!("mavlink send: {e}")))?;
        Ok(())
    }
}

impl VehicleLink for FcLink {
    fn peer(&self) -> PeerId {
        self.peer
    }

    fn send_action(&self, action: &VehicleAction) -> Result<(), LinkError> {
        debug!(action = action.name(), peer = %self.peer, "mavlink send");
        self.send(&action.to_mav(self.peer))
    }

    fn receive(&self, timeout: Duration) -> Result<Option<Inbound>, LinkError> {
        match self.transport.inbox.recv_timeout(timeout) {
            Ok(ReaderEvent::Frame(hdr, msg)) => Ok(Some(decode(&hdr, &msg, Instant::now()))),
            Ok(ReaderEvent::Fault(e)) => Err(LinkError::Transport(e)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(LinkError::Closed),
        }
    }
}

/// Connects with a bounded number of attempts and a fixed backoff.
///
/// A transport that opened but heard no vehicle heartbeat is parked and
/// reused by the next attempt instead of being reopened, so a `udpin` port
/// stays bound to a single socket while the vehicle is still booting.
pub struct FcConnector {
    cfg: LinkConfig,
    parked: Mutex<Option<Transport>>,
}

impl FcConnector {
    pub fn new(cfg: LinkConfig) -> Self {
        Self { cfg, parked: Mutex::new(None) }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.cfg
    }

    fn parked(&self) -> MutexGuard<'_, Option<Transport>> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens (or reuses) the transport and blocks until a non-GCS heartbeat
    /// names the peer.
    fn attempt(&self) -> Result<FcLink, LinkError> {
        let endpoint = &self.cfg.endpoint;
        let parked = self.parked().take();
        let transport = match parked {
            Some(t) => t,
            None => Transport::open(endpoint)?,
        };

        let timeout = Duration::from_millis(self.cfg.heartbeat_timeout_ms);
        debug!(%endpoint, ?timeout, "waiting for vehicle heartbeat");
        let peer = match wait_heartbeat(&transport.inbox, timeout) {
            Ok(peer) => peer,
            Err(LinkError::NoHeartbeat { .. }) => {
                *self.parked() = Some(transport);
                return Err(LinkError::NoHeartbeat { endpoint: endpoint.clone(), timeout });
            }
            Err(e) => return Err(e),
        };
        info!(%endpoint, %peer, "vehicle heartbeat received");

        Ok(FcLink {
            transport,
            endpoint: endpoint.clone(),
            own: PeerId { system_id: self.cfg.sys_id, component_id: self.cfg.comp_id },
            peer,
            sequence: AtomicU8::new(0),
        })
    }
}

impl Connector for FcConnector {
    type Link = FcLink;

    fn endpoint(&self) -> &str {
        &self.cfg.endpoint
    }

    fn connect(&self) -> Result<FcLink, LinkError> {
        let attempts = self.cfg.connect_retries.max(1);
        let backoff = Duration::from_millis(self.cfg.retry_backoff_ms);
        let mut last = String::new();

        for attempt in 1..=attempts {
            match self.attempt() {
                Ok(link) => return Ok(link),
                Err(e) => {
                    warn!(attempt, attempts, endpoint = %self.cfg.endpoint, "vehicle connect attempt failed: {e}");
                    last = e.to_string();
                }
            }
            if attempt < attempts {
                thread::sleep(backoff);
            }
        }

        Err(LinkError::ConnectionFailed { endpoint: self.cfg.endpoint.clone(), attempts, last })
    }
}

fn spawn_reader(conn: Conn, tx: Sender<ReaderEvent>, stop: Arc<AtomicBool>) -> io::Result<()> {
    thread::Builder::new().name("mav-rx".into()).spawn(move || loop {
        let next = conn.recv();
        if stop.load(Ordering::Relaxed) {
            break;
        }
        match next {
            Ok((hdr, msg)) => {
                if tx.send(ReaderEvent::Frame(hdr, msg)).is_err() {
                    break;
                }
            }
            Err(MessageReadError::Parse(e)) => {
                debug!("skipping undecodable mavlink frame: {e:?}");
            }
            Err(MessageReadError::Io(e)) => match e.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {}
                _ => {
                    let _ = tx.send(ReaderEvent::Fault(e.to_string()));
                    break;
                }
            },
        }
    })?;
    Ok(())
}

fn wait_heartbeat(inbox: &Receiver<ReaderEvent>, timeout: Duration) -> Result<PeerId, LinkError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match inbox.recv_timeout(remaining) {
            Ok(ReaderEvent::Frame(hdr, msg)) => {
                if let Inbound::Heartbeat { peer, from_gcs: false } = decode(&hdr, &msg, Instant::now()) {
                    return Ok(peer);
                }
            }
            Ok(ReaderEvent::Fault(e)) => return Err(LinkError::Transport(e)),
            Err(RecvTimeoutError::Timeout) => {
                return Err(LinkError::NoHeartbeat { endpoint: String::new(), timeout })
            }
            Err(RecvTimeoutError::Disconnected) => return Err(LinkError::Closed),
        }
    }
}

/// "serial:/dev/ttyACM0:57600" -> ("/dev/ttyACM0", 57600)
pub(crate) fn parse_serial(endpoint: &str) -> Option<(&str, u32)> {
    let rest = endpoint.strip_prefix("serial:")?;
    let (dev, baud) = rest.rsplit_once(':')?;
    Some((dev, baud.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::common::{HEARTBEAT_DATA, MavType, SYS_STATUS_DATA};
    use mavlink::MavlinkVersion;
    use std::net::UdpSocket;

    #[test]
    fn serial_endpoint_parsing() {
        assert_eq!(parse_serial("serial:/dev/ttyACM0:57600"), Some(("/dev/ttyACM0", 57600)));
        assert_eq!(parse_serial("serial:COM3:115200"), Some(("COM3", 115200)));
        assert_eq!(parse_serial("tcpout:127.0.0.1:5762"), None);
        assert_eq!(parse_serial("serial:/dev/ttyS0"), None);
    }

    fn frame(sys: u8, comp: u8, msg: MavMessage) -> ReaderEvent {
        ReaderEvent::Frame(MavHeader { system_id: sys, component_id: comp, sequence: 0 }, msg)
    }

    #[test]
    fn heartbeat_wait_skips_gcs_and_other_traffic() {
        let (tx, rx) = bounded(8);
        tx.send(frame(1, 1, MavMessage::SYS_STATUS(SYS_STATUS_DATA::default()))).unwrap();
        tx.send(frame(255, 190, MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            mavtype: MavType::MAV_TYPE_GCS,
            ..Default::default()
        })))
        .unwrap();
        tx.send(frame(1, 1, MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            ..Default::default()
        })))
        .unwrap();

        let peer = wait_heartbeat(&rx, Duration::from_millis(100)).unwrap();
        assert_eq!(peer, PeerId { system_id: 1, component_id: 1 });
    }

    #[test]
    fn heartbeat_wait_times_out() {
        let (_tx, rx) = bounded::<ReaderEvent>(1);
        let err = wait_heartbeat(&rx, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, LinkError::NoHeartbeat { .. }));
    }

    #[test]
    fn heartbeat_wait_reports_transport_fault() {
        let (tx, rx) = bounded(1);
        tx.send(ReaderEvent::Fault("connection reset".into())).unwrap();
        let err = wait_heartbeat(&rx, Duration::from_millis(100)).unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn connect_gives_up_after_retries() {
        let mut cfg = LinkConfig::new("bogus:nowhere");
        cfg.connect_retries = 2;
        cfg.retry_backoff_ms = 1;
        let err = FcConnector::new(cfg).connect().err().unwrap();
        assert!(matches!(err, LinkError::ConnectionFailed { attempts: 2, .. }));
    }

    #[test]
    fn silent_udp_endpoint_keeps_one_socket_across_attempts() {
        let port = UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let mut cfg = LinkConfig::new(format!("udpin:127.0.0.1:{port}"));
        cfg.connect_retries = 3;
        cfg.retry_backoff_ms = 1;
        cfg.heartbeat_timeout_ms = 50;
        let connector = FcConnector::new(cfg);

        // nothing is sending yet: every attempt must time out, none may fail to bind
        match connector.connect() {
            Err(LinkError::ConnectionFailed { attempts: 3, last, .. }) => {
                assert!(last.contains("no vehicle heartbeat"), "{last}")
            }
            other => panic!("unexpected: {:?}", other.map(|l| l.peer())),
        }

        let mut beat = Vec::new();
        mavlink::write_versioned_msg(
            &mut beat,
            MavlinkVersion::V2,
            MavHeader { system_id: 1, component_id: 1, sequence: 0 },
            &MavMessage::HEARTBEAT(HEARTBEAT_DATA { mavtype: MavType::MAV_TYPE_QUADROTOR, ..Default::default() }),
        )
        .unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let vehicle = {
            let done = done.clone();
            let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
            thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    sock.send_to(&beat, ("127.0.0.1", port)).unwrap();
                    thread::sleep(Duration::from_millis(10));
                }
            })
        };

        let link = connector.connect();
        done.store(true, Ordering::Relaxed);
        vehicle.join().unwrap();
        assert_eq!(link.map(|l| l.peer()).unwrap(), PeerId { system_id: 1, component_id: 1 });
    }
}
