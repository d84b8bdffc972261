//! Broker session: one MQTT connection over mutual TLS, one command topic.
//!
//! The session is driven as an explicit state machine:
//!
//! ```text
//!            begin_connect            ConnAck(Success)
//! Disconnected ──────────► Connecting ────────────────► Connected
//!      ▲                       │                            │
//!      └──── backoff delay ◄───┴──────── error ◄────────────┘
//! ```
//!
//! Every transition into `Connected` re-issues the topic subscription. A
//! subscription that cannot be queued or is refused by the broker drops
//! the connection so the next attempt subscribes again.
//! Failed attempts are retried forever with bounded exponential backoff;
//! only certificate/trust failures and credential rejections before the
//! first successful connection are fatal.

use anyhow::Result;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, SubscribeReasonCode, TlsConfiguration, Transport,
};
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::{BackoffConfig, BrokerConfig};
use crate::fs_abstraction::FileSystem;
use crate::signal::{cancelled, ShutdownToken};

/// ALPN protocol AWS IoT expects for MQTT on port 443.
const AWS_IOT_ALPN: &[u8] = b"x-amzn-mqtt-ca";

/// Capacity of the client request queue.
const REQUEST_QUEUE: usize = 16;

/// How long to keep polling for a clean DISCONNECT at shutdown.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Where inbound payloads are delivered, in arrival order.
pub type MessageSink = mpsc::Sender<Bytes>;

#[derive(Error, Debug)]
pub enum ConnectError {
    /// Certificate or key material missing or unparsable (fatal)
    #[error("certificate error: {0}")]
    Certificate(String),

    /// TLS trust failure during the handshake (fatal)
    #[error("TLS error: {0}")]
    Tls(String),

    /// Broker refused our credentials (fatal)
    #[error("broker rejected connection: {0}")]
    Rejected(String),

    /// Network-level failure (retried)
    #[error("network error: {0}")]
    Network(String),
}

impl ConnectError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ConnectError::Network(_))
    }
}

/// Private key bytes, zeroed when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// PEM material for a mutually authenticated session.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub ca: Vec<u8>,
    pub cert: Vec<u8>,
    pub key: SecretBytes,
}

/// Read and sanity-check the CA, client certificate and private key.
pub fn load_credentials(
    config: &BrokerConfig,
    fs: &dyn FileSystem,
) -> Result<Credentials, ConnectError> {
    let ca = read_pem(fs, "CA certificate", &config.ca_file)?;
    check_certs("CA certificate", &config.ca_file, &ca)?;

    let cert = read_pem(fs, "client certificate", &config.cert)?;
    check_certs("client certificate", &config.cert, &cert)?;

    let key = SecretBytes::new(read_pem(fs, "private key", &config.key)?);
    match rustls_pemfile::private_key(&mut key.as_bytes()) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return Err(ConnectError::Certificate(format!(
                "no private key found in {:?}",
                config.key
            )))
        }
        Err(e) => {
            return Err(ConnectError::Certificate(format!(
                "unreadable private key {:?}: {}",
                config.key, e
            )))
        }
    }

    Ok(Credentials { ca, cert, key })
}

fn read_pem(fs: &dyn FileSystem, what: &str, path: &Path) -> Result<Vec<u8>, ConnectError> {
    fs.read_bytes(path)
        .map_err(|e| ConnectError::Certificate(format!("cannot read {} {:?}: {}", what, path, e)))
}

fn check_certs(what: &str, path: &Path, pem: &[u8]) -> Result<(), ConnectError> {
    let mut count = 0;
    for cert in rustls_pemfile::certs(&mut &pem[..]) {
        cert.map_err(|e| {
            ConnectError::Certificate(format!("invalid {} {:?}: {}", what, path, e))
        })?;
        count += 1;
    }
    if count == 0 {
        return Err(ConnectError::Certificate(format!(
            "no certificate found in {} {:?}",
            what, path
        )));
    }
    Ok(())
}

/// Build MQTT options for the configured session.
pub fn mqtt_options(config: &BrokerConfig, creds: &Credentials) -> MqttOptions {
    let mut options = MqttOptions::new(
        config.client_id.clone(),
        config.endpoint.trim().to_string(),
        config.port,
    );
    options.set_keep_alive(config.keep_alive());
    options.set_clean_session(config.clean_session);

    let alpn = (config.port == 443).then(|| vec![AWS_IOT_ALPN.to_vec()]);
    options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
        ca: creds.ca.clone(),
        alpn,
        client_auth: Some((creds.cert.clone(), creds.key.as_bytes().to_vec())),
    }));
    options
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: None,
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial(), config.max())
    }

    /// Delay before the next attempt: `initial`, then doubling up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.initial,
            Some(d) => d.saturating_mul(2).min(self.max),
        };
        self.current = Some(delay);
        delay
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// What the event loop should do after an input to the state machine.
#[derive(Debug)]
pub enum Step {
    Nothing,
    /// (Re-)issue the topic subscription
    Subscribe,
    /// Hand a payload to the sink
    Deliver(Bytes),
    /// Wait, then try again
    Retry(Duration),
    /// Give up
    Fatal(ConnectError),
}

/// Connection state machine, free of I/O.
#[derive(Debug)]
pub struct SessionMachine {
    state: SessionState,
    backoff: Backoff,
    ever_connected: bool,
}

impl SessionMachine {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: SessionState::Disconnected,
            backoff,
            ever_connected: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn ever_connected(&self) -> bool {
        self.ever_connected
    }

    fn transition(&mut self, to: SessionState) {
        if self.state != to {
            debug!("Session {:?} -> {:?}", self.state, to);
            self.state = to;
        }
    }

    pub fn begin_connect(&mut self) {
        self.transition(SessionState::Connecting);
    }

    pub fn on_connack(&mut self, code: ConnectReturnCode, session_present: bool) -> Step {
        if code != ConnectReturnCode::Success {
            return self.on_error(classify_refusal(code, self.ever_connected));
        }

        if self.ever_connected {
            info!("Connection resumed (session present: {})", session_present);
        } else {
            info!("Connected (session present: {})", session_present);
        }
        self.transition(SessionState::Connected);
        self.ever_connected = true;
        self.backoff.reset();
        Step::Subscribe
    }

    pub fn on_publish(&mut self, payload: Bytes) -> Step {
        Step::Deliver(payload)
    }

    pub fn on_error(&mut self, err: ConnectError) -> Step {
        if err.is_fatal() {
            self.transition(SessionState::Disconnected);
            return Step::Fatal(err);
        }

        match self.state {
            SessionState::Connected => warn!("Connection interrupted: {}. Reconnecting...", err),
            _ => warn!("Connection attempt failed: {}", err),
        }
        self.transition(SessionState::Disconnected);
        Step::Retry(self.backoff.next_delay())
    }
}

fn classify_refusal(code: ConnectReturnCode, ever_connected: bool) -> ConnectError {
    match code {
        ConnectReturnCode::ServiceUnavailable => {
            ConnectError::Network("broker unavailable".to_string())
        }
        other if ever_connected => ConnectError::Network(format!("connection refused: {:?}", other)),
        other => ConnectError::Rejected(format!("{:?}", other)),
    }
}

/// Map a transport error onto our taxonomy.
///
/// Trust failures surface from the TLS layer as `InvalidData` I/O errors;
/// other I/O errors inside the handshake (reset, timeout) are network
/// trouble. Once a session has been established, everything is retried.
pub fn classify(err: &ConnectionError, ever_connected: bool) -> ConnectError {
    match err {
        ConnectionError::ConnectionRefused(code) => classify_refusal(*code, ever_connected),
        ConnectionError::Tls(e) if !ever_connected && is_trust_failure(e) => {
            ConnectError::Tls(e.to_string())
        }
        other => ConnectError::Network(other.to_string()),
    }
}

fn is_trust_failure(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return io_err.kind() == io::ErrorKind::InvalidData;
        }
        current = e.source();
    }
    // Non-I/O TLS errors come from rejected client configuration.
    true
}

#[derive(Debug, PartialEq, Eq)]
enum Forwarded {
    Queued,
    Dropped,
    Closed,
}

/// Hand a payload to the dispatcher without waiting.
fn forward(sink: &MessageSink, payload: Bytes) -> Forwarded {
    match sink.try_send(payload) {
        Ok(()) => Forwarded::Queued,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Dispatcher is busy, dropping message");
            Forwarded::Dropped
        }
        Err(mpsc::error::TrySendError::Closed(_)) => Forwarded::Closed,
    }
}

/// The daemon's single broker session.
pub struct BrokerConnection {
    client: AsyncClient,
    eventloop: EventLoop,
    machine: SessionMachine,
    endpoint: String,
    client_id: String,
    topic: Option<String>,
    sink: Option<MessageSink>,
}

impl BrokerConnection {
    /// Load credentials and prepare the session.
    ///
    /// Certificate problems fail here, before any network traffic; the TCP
    /// and TLS handshake happen when [`run`](Self::run) starts polling.
    pub fn connect(config: &BrokerConfig, fs: &dyn FileSystem) -> Result<Self, ConnectError> {
        let creds = load_credentials(config, fs)?;
        let options = mqtt_options(config, &creds);
        Ok(Self::from_options(options, Backoff::from_config(&config.backoff)))
    }

    fn from_options(options: MqttOptions, backoff: Backoff) -> Self {
        let (host, port) = options.broker_address();
        let client_id = options.client_id();
        let (client, eventloop) = AsyncClient::new(options, REQUEST_QUEUE);

        Self {
            client,
            eventloop,
            machine: SessionMachine::new(backoff),
            endpoint: format!("{}:{}", host, port),
            client_id,
            topic: None,
            sink: None,
        }
    }

    /// Register the one inbound message sink for `topic`.
    pub fn subscribe(&mut self, topic: &str, sink: MessageSink) -> Result<()> {
        if self.sink.is_some() {
            anyhow::bail!("a message handler is already registered for this session");
        }
        self.topic = Some(topic.to_string());
        self.sink = Some(sink);
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    /// Drive the session until shutdown or a fatal error.
    pub async fn run(mut self, mut shutdown: ShutdownToken) -> Result<(), ConnectError> {
        let (Some(topic), Some(sink)) = (self.topic.clone(), self.sink.clone()) else {
            return Err(ConnectError::Network(
                "no subscription registered before run".to_string(),
            ));
        };

        info!("Connecting to {} with client ID '{}'...", self.endpoint, self.client_id);
        self.machine.begin_connect();

        loop {
            let event = tokio::select! {
                ev = self.eventloop.poll() => ev,
                _ = cancelled(&mut shutdown) => {
                    self.disconnect().await;
                    return Ok(());
                }
            };

            let step = match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    self.machine.on_connack(ack.code, ack.session_present)
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if rumqttc::matches(&publish.topic, &topic) {
                        debug!("Message on '{}' ({} bytes)", publish.topic, publish.payload.len());
                        self.machine.on_publish(publish.payload)
                    } else {
                        debug!("Ignoring message on unrelated topic '{}'", publish.topic);
                        Step::Nothing
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|c| matches!(c, SubscribeReasonCode::Failure))
                    {
                        error!("Broker refused subscription to '{}'", topic);
                        self.drop_session("subscription refused")
                    } else {
                        info!("Subscribed to '{}'", topic);
                        Step::Nothing
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("Broker closed the session");
                    Step::Nothing
                }
                Ok(_) => Step::Nothing,
                Err(e) => {
                    let err = classify(&e, self.machine.ever_connected());
                    self.machine.on_error(err)
                }
            };

            let step = match step {
                Step::Subscribe => self.request_subscription(&topic),
                other => other,
            };

            match step {
                Step::Nothing | Step::Subscribe => {}
                Step::Deliver(payload) => {
                    if forward(&sink, payload) == Forwarded::Closed {
                        info!("Dispatcher stopped, closing broker session");
                        self.disconnect().await;
                        return Ok(());
                    }
                }
                Step::Retry(delay) => {
                    info!("Reconnecting in {:?}", delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancelled(&mut shutdown) => return Ok(()),
                    }
                    self.machine.begin_connect();
                }
                Step::Fatal(e) => {
                    error!("Fatal broker error: {}", e);
                    return Err(e);
                }
            }
        }
    }

    fn request_subscription(&mut self, topic: &str) -> Step {
        info!("Subscribing to topic '{}'...", topic);
        match self.client.try_subscribe(topic, QoS::AtMostOnce) {
            Ok(()) => Step::Nothing,
            Err(e) => {
                error!("Could not queue subscription: {}", e);
                self.drop_session("subscription not sent")
            }
        }
    }

    /// Close the network connection and schedule a reconnect.
    fn drop_session(&mut self, reason: &str) -> Step {
        self.eventloop.clean();
        self.machine.on_error(ConnectError::Network(reason.to_string()))
    }

    async fn disconnect(&mut self) {
        if self.machine.state() != SessionState::Connected {
            return;
        }

        info!("Disconnecting MQTT...");
        if self.client.try_disconnect().is_err() {
            return;
        }
        let eventloop = &mut self.eventloop;
        let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            warn!("Timed out waiting for DISCONNECT to flush");
        }
        self.machine.transition(SessionState::Disconnected);
        info!("Disconnected");
    }
}
