pub mod doctor;

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration, Transport,
};
use serde::Deserialize;
use skylink_core::{BusPublisher, PublishError};
use skylink_proto::{TOPIC_COMMAND, TOPIC_TELEMETRY};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const REQUEST_CAPACITY: usize = 64;
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    pub host: String,
    /// Defaults to 8883 with TLS, 1883 without.
    pub port: Option<u16>,
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive_s")]
    pub keep_alive_s: u64,
    #[serde(default = "default_connect_timeout_s")]
    pub connect_timeout_s: u64,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "default_true")]
    pub tls: bool,
    #[serde(default = "default_ca_cert")]
    pub ca_cert: PathBuf,
    #[serde(default = "default_client_cert")]
    pub client_cert: PathBuf,
    #[serde(default = "default_client_key")]
    pub client_key: PathBuf,

    #[serde(default = "default_command_topic")]
    pub command_topic: String,
    #[serde(default = "default_telemetry_topic")]
    pub telemetry_topic: String,
}

fn default_true() -> bool { true }
fn default_keep_alive_s() -> u64 { 60 }
fn default_connect_timeout_s() -> u64 { 10 }
fn default_ca_cert() -> PathBuf { PathBuf::from("certs/ca.crt") }
fn default_client_cert() -> PathBuf { PathBuf::from("certs/client.crt") }
fn default_client_key() -> PathBuf { PathBuf::from("certs/client.key") }
fn default_command_topic() -> String { TOPIC_COMMAND.into() }
fn default_telemetry_topic() -> String { TOPIC_TELEMETRY.into() }

impl BusConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            client_id: None,
            keep_alive_s: default_keep_alive_s(),
            connect_timeout_s: default_connect_timeout_s(),
            username: None,
            password: None,
            tls: true,
            ca_cert: default_ca_cert(),
            client_cert: default_client_cert(),
            client_key: default_client_key(),
            command_topic: default_command_topic(),
            telemetry_topic: default_telemetry_topic(),
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(if self.tls { 8883 } else { 1883 })
    }

    pub fn broker(&self) -> String {
        format!("{}:{}", self.host, self.port())
    }

    /// Configured client id, or `skylink-<role>-<pid>`.
    pub fn client_id(&self, role: &str) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("skylink-{role}-{}", std::process::id()))
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus setup failed for {broker}: {reason}")]
    BusSetupFailed { broker: String, reason: String },

    #[error("tls material {}: {source}", .path.display())]
    Tls {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bus client: {0}")]
    Client(#[from] rumqttc::ClientError),
}

fn read_pem(path: &Path) -> Result<Vec<u8>, BusError> {
    std::fs::read(path).map_err(|source| BusError::Tls { path: path.to_path_buf(), source })
}

/// Broker options for `role`, with mutual TLS when enabled.
pub fn mqtt_options(cfg: &BusConfig, role: &str) -> Result<MqttOptions, BusError> {
    let mut opts = MqttOptions::new(cfg.client_id(role), cfg.host.clone(), cfg.port());
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_s.max(1)));
    opts.set_clean_session(true);
    if let Some(user) = &cfg.username {
        opts.set_credentials(user.clone(), cfg.password.clone().unwrap_or_default());
    }
    if cfg.tls {
        let ca = read_pem(&cfg.ca_cert)?;
        let cert = read_pem(&cfg.client_cert)?;
        let key = read_pem(&cfg.client_key)?;
        opts.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: Some((cert, key)),
        }));
    }
    Ok(opts)
}

/// Connected bus client. Inbound publishes go to the callback given to
/// [`BusHandle::connect`] from a dedicated dispatch task.
pub struct BusHandle {
    client: AsyncClient,
    broker: String,
    dispatch: JoinHandle<()>,
}

impl BusHandle {
    /// Connects, waits for the broker's CONNACK, subscribes to `topics` and
    /// starts dispatching. Any failure before CONNACK is `BusSetupFailed`.
    pub async fn connect<F>(
        cfg: &BusConfig,
        role: &str,
        topics: Vec<String>,
        on_message: F,
    ) -> Result<Self, BusError>
    where
        F: FnMut(&str, Bytes) + Send + 'static,
    {
        let broker = cfg.broker();
        let opts = mqtt_options(cfg, role)?;
        let (client, mut events) = AsyncClient::new(opts, REQUEST_CAPACITY);

        let setup_failed = |reason: String| BusError::BusSetupFailed { broker: broker.clone(), reason };
        match tokio::time::timeout(Duration::from_secs(cfg.connect_timeout_s), wait_connack(&mut events)).await {
            Err(_) => return Err(setup_failed(format!("no CONNACK within {}s", cfg.connect_timeout_s))),
            Ok(Err(reason)) => return Err(setup_failed(reason)),
            Ok(Ok(())) => {}
        }

        for topic in &topics {
            client.subscribe(topic.as_str(), QoS::AtMostOnce).await?;
        }
        info!(%broker, tls = cfg.tls, ?topics, "bus connected");

        let dispatch = tokio::spawn(dispatch(client.clone(), events, topics, on_message));
        Ok(Self { client, broker, dispatch })
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn sender(&self) -> BusSender {
        BusSender { client: self.client.clone() }
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.client.publish(topic, QoS::AtMostOnce, false, payload).await?;
        Ok(())
    }

    /// Sends DISCONNECT and waits briefly for the dispatch task to wind down.
    /// The dispatch task is aborted if it overruns, which drops the callback.
    pub async fn disconnect(mut self) {
        if let Err(e) = self.client.disconnect().await {
            warn!("bus disconnect: {e}");
        }
        match tokio::time::timeout(Duration::from_secs(2), &mut self.dispatch).await {
            Ok(_) => info!(broker = %self.broker, "bus disconnected"),
            Err(_) => {
                warn!(broker = %self.broker, "bus dispatch did not stop in time");
                self.dispatch.abort();
            }
        }
    }
}

async fn wait_connack(events: &mut EventLoop) -> Result<(), String> {
    loop {
        match events.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(format!("broker refused connection: {code:?}")),
                };
            }
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }
    }
}

async fn dispatch<F>(client: AsyncClient, mut events: EventLoop, topics: Vec<String>, mut on_message: F)
where
    F: FnMut(&str, Bytes) + Send + 'static,
{
    loop {
        match events.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => on_message(&p.topic, p.payload),
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("bus reconnected, resubscribing");
                for topic in &topics {
                    if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                        warn!(%topic, "resubscribe failed: {e}");
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("bus connection error: {e}");
                tokio::time::sleep(RECONNECT_PAUSE).await;
            }
        }
    }
    debug!("bus dispatch stopped");
}

/// Non-blocking publish handle, usable from the bridge's blocking thread.
#[derive(Clone)]
pub struct BusSender {
    client: AsyncClient,
}

impl BusPublisher for BusSender {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| PublishError { topic: topic.into(), reason: e.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_config_defaults() {
        let mut cfg = BusConfig::new("broker.local");
        assert_eq!(cfg.port(), 8883);
        cfg.tls = false;
        assert_eq!(cfg.port(), 1883);
        assert_eq!(cfg.broker(), "broker.local:1883");
        assert!(cfg.client_id("bridge").starts_with("skylink-bridge-"));

        let opts = mqtt_options(&cfg, "bridge").unwrap();
        assert_eq!(opts.broker_address(), ("broker.local".to_string(), 1883));
        assert_eq!(opts.keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn missing_tls_material_is_reported_with_path() {
        let mut cfg = BusConfig::new("broker.local");
        cfg.ca_cert = PathBuf::from("/nonexistent/ca.crt");
        let err = mqtt_options(&cfg, "bridge").unwrap_err();
        assert!(matches!(err, BusError::Tls { ref path, .. } if path.ends_with("ca.crt")));
        assert!(err.to_string().contains("/nonexistent/ca.crt"));
    }

    #[test]
    fn sender_queues_without_a_broker() {
        let cfg = BusConfig { tls: false, ..BusConfig::new("127.0.0.1") };
        let (client, _events) = AsyncClient::new(mqtt_options(&cfg, "t").unwrap(), 2);
        let sender = BusSender { client };
        assert!(sender.publish("drone/telemetry", b"{}".to_vec()).is_ok());
        assert!(sender.publish("drone/telemetry", b"{}".to_vec()).is_ok());
        let err = sender.publish("drone/telemetry", b"{}".to_vec()).unwrap_err();
        assert_eq!(err.topic, "drone/telemetry");
    }

    #[tokio::test]
    async fn unreachable_broker_fails_setup() {
        let cfg = BusConfig {
            tls: false,
            port: Some(1),
            connect_timeout_s: 2,
            ..BusConfig::new("127.0.0.1")
        };
        let err = BusHandle::connect(&cfg, "t", vec![], |_, _| {}).await.err().unwrap();
        assert!(matches!(err, BusError::BusSetupFailed { ref broker, .. } if broker == "127.0.0.1:1"));
    }
}
