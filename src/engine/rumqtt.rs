//! Protocol engine backed by `rumqttc`
//!
//! `rumqttc` connects lazily on the first poll of its event loop and assigns MQTT packet
//! ids inside that loop, after the request has left the caller. Request ids are therefore
//! allocated here, queued per request kind, and bound to the packet id when the matching
//! `Outgoing` event is observed. Requests of one kind leave the request channel in the
//! order they were queued, which keeps the queue and the packet ids aligned.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rumqttc::tokio_rustls::rustls;
use rumqttc::tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rumqttc::tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rumqttc::{
    Client, Connection, ConnectionError, Event, MqttOptions, Outgoing, Packet, RecvTimeoutError,
    SubscribeReasonCode, TlsConfiguration, Transport,
};
use tracing::{debug, info, warn};

use super::{
    ConnectOptions, Dispatcher, Engine, EngineError, EngineFactory, LogLevel, QoS, RequestId,
    TlsOptions,
};

/// Capacity of the request channel between callers and the event loop
const REQUEST_CAPACITY: usize = 100;

#[derive(Debug, Default, Clone, Copy)]
pub struct RumqttFactory;

impl EngineFactory for RumqttFactory {
    fn create(
        &self,
        options: &ConnectOptions,
        dispatcher: Dispatcher,
    ) -> Result<Box<dyn Engine>, EngineError> {
        if let Some(tls) = &options.tls {
            if tls.cert_file.is_some() != tls.key_file.is_some() {
                return Err(EngineError::Tls(
                    "client certificate and key must be given together".into(),
                ));
            }
        }
        debug!(
            "Creating rumqttc engine {} for client {:?}",
            dispatcher.handle(),
            options.client_id
        );
        Ok(Box::new(RumqttEngine {
            options: options.clone(),
            dispatcher,
            link: Mutex::new(Link::default()),
            connection: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }))
    }

    fn version(&self) -> String {
        String::from("rumqttc 0.24")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Kind {
    Subscribe,
    Unsubscribe,
    Publish,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Phase {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Closed,
}

/// Caller-side state: the client plus request id correlation
#[derive(Default)]
struct Link {
    client: Option<Client>,
    phase: Phase,
    next_id: u32,
    queued: HashMap<Kind, VecDeque<(RequestId, QoS)>>,
    bound: HashMap<(Kind, u16), RequestId>,
}

impl Link {
    fn allocate(&mut self) -> RequestId {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        RequestId(self.next_id)
    }

    fn client(&self) -> Result<&Client, EngineError> {
        match (self.phase, &self.client) {
            (Phase::Connected, Some(client)) => Ok(client),
            (Phase::Closed, _) => Err(EngineError::Destroyed),
            _ => Err(EngineError::NotConnected),
        }
    }

    fn enqueue(&mut self, kind: Kind, id: RequestId, qos: QoS) {
        self.queued.entry(kind).or_default().push_back((id, qos));
    }

    fn dequeue(&mut self, kind: Kind) -> Option<(RequestId, QoS)> {
        self.queued.get_mut(&kind).and_then(VecDeque::pop_front)
    }
}

/// Callback to fire once the link lock is released
enum Notify {
    Connected(Option<EngineError>),
    Disconnected(Option<EngineError>),
    Subscribed(RequestId, Vec<Option<QoS>>),
    Unsubscribed(RequestId),
    Published(RequestId),
    Message(RequestId, String, Vec<u8>),
    Log(LogLevel, String),
}

pub struct RumqttEngine {
    options: ConnectOptions,
    dispatcher: Dispatcher,
    link: Mutex<Link>,
    connection: Mutex<Option<Connection>>,
    destroyed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn to_rumqttc(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn from_rumqttc(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn map_connection_error(error: &ConnectionError) -> EngineError {
    match error {
        ConnectionError::ConnectionRefused(code) => EngineError::Refused(format!("{:?}", code)),
        other => EngineError::ConnectionLost(other.to_string()),
    }
}

impl RumqttEngine {
    fn mqtt_options(
        &self,
        host: &str,
        port: u16,
        keepalive: Duration,
    ) -> Result<MqttOptions, EngineError> {
        let mut mqtt_options = MqttOptions::new(self.options.client_id.clone(), host, port);
        mqtt_options
            .set_keep_alive(keepalive)
            .set_clean_session(true)
            .set_max_packet_size(self.options.max_packet_size, self.options.max_packet_size);
        if let Some((user, password)) = &self.options.credentials {
            mqtt_options.set_credentials(user.clone(), password.clone());
        }
        if let Some(tls) = &self.options.tls {
            mqtt_options.set_transport(tls_transport(tls)?);
        }
        Ok(mqtt_options)
    }

    /// Translates one event loop event into callbacks
    fn translate(&self, event: Event) -> Vec<Notify> {
        let mut link = lock(&self.link);
        let mut notes = Vec::new();
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                debug!("CONNACK {:?} on {}", ack.code, self.dispatcher.handle());
                link.phase = Phase::Connected;
                notes.push(Notify::Connected(None));
            }
            Event::Incoming(Packet::Publish(publish)) => {
                notes.push(Notify::Message(
                    RequestId(u32::from(publish.pkid)),
                    publish.topic,
                    publish.payload.to_vec(),
                ));
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                match link.bound.remove(&(Kind::Subscribe, ack.pkid)) {
                    Some(id) => {
                        let granted = ack
                            .return_codes
                            .iter()
                            .map(|code| match code {
                                SubscribeReasonCode::Success(qos) => Some(from_rumqttc(*qos)),
                                SubscribeReasonCode::Failure => None,
                            })
                            .collect();
                        notes.push(Notify::Subscribed(id, granted));
                    }
                    None => notes.push(unbound("SUBACK", ack.pkid)),
                }
            }
            Event::Incoming(Packet::UnsubAck(ack)) => {
                match link.bound.remove(&(Kind::Unsubscribe, ack.pkid)) {
                    Some(id) => notes.push(Notify::Unsubscribed(id)),
                    None => notes.push(unbound("UNSUBACK", ack.pkid)),
                }
            }
            Event::Incoming(Packet::PubAck(ack)) => {
                match link.bound.remove(&(Kind::Publish, ack.pkid)) {
                    Some(id) => notes.push(Notify::Published(id)),
                    None => notes.push(unbound("PUBACK", ack.pkid)),
                }
            }
            Event::Incoming(Packet::PubComp(comp)) => {
                match link.bound.remove(&(Kind::Publish, comp.pkid)) {
                    Some(id) => notes.push(Notify::Published(id)),
                    None => notes.push(unbound("PUBCOMP", comp.pkid)),
                }
            }
            Event::Incoming(Packet::Disconnect) => {
                link.phase = Phase::Idle;
                notes.push(Notify::Disconnected(None));
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                if let Some((id, _)) = link.dequeue(Kind::Subscribe) {
                    link.bound.insert((Kind::Subscribe, pkid), id);
                }
            }
            Event::Outgoing(Outgoing::Unsubscribe(pkid)) => {
                if let Some((id, _)) = link.dequeue(Kind::Unsubscribe) {
                    link.bound.insert((Kind::Unsubscribe, pkid), id);
                }
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                if let Some((id, qos)) = link.dequeue(Kind::Publish) {
                    if qos == QoS::AtMostOnce {
                        notes.push(Notify::Published(id));
                    } else {
                        link.bound.insert((Kind::Publish, pkid), id);
                    }
                }
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                link.phase = Phase::Idle;
                notes.push(Notify::Disconnected(None));
            }
            other => notes.push(Notify::Log(LogLevel::Debug, format!("{:?}", other))),
        }
        notes
    }

    /// Reports a failed poll; the first failure before CONNACK is a connect failure
    fn fail(&self, error: EngineError) -> Vec<Notify> {
        let mut link = lock(&self.link);
        let previous = link.phase;
        link.phase = Phase::Idle;
        match previous {
            Phase::Connecting => vec![Notify::Connected(Some(error))],
            Phase::Connected => vec![Notify::Disconnected(Some(error))],
            _ => Vec::new(),
        }
    }

    fn notify(&self, note: Notify) {
        match note {
            Notify::Connected(error) => self.dispatcher.connected(error),
            Notify::Disconnected(error) => self.dispatcher.disconnected(error),
            Notify::Subscribed(id, granted) => self.dispatcher.subscribed(id, &granted),
            Notify::Unsubscribed(id) => self.dispatcher.unsubscribed(id),
            Notify::Published(id) => self.dispatcher.published(id),
            Notify::Message(id, topic, payload) => self.dispatcher.message(id, &topic, &payload),
            Notify::Log(level, text) => self.dispatcher.log(level, &text),
        }
    }
}

fn unbound(packet: &str, pkid: u16) -> Notify {
    Notify::Log(
        LogLevel::Warning,
        format!("{} for packet {} without a pending request", packet, pkid),
    )
}

impl Engine for RumqttEngine {
    fn connect(&self, host: &str, port: u16, keepalive: Duration) -> Result<(), EngineError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(EngineError::Destroyed);
        }
        let mqtt_options = self.mqtt_options(host, port, keepalive)?;
        let mut link = lock(&self.link);
        if link.client.is_some() {
            return Err(EngineError::Request("connect already issued".into()));
        }
        let (client, connection) = Client::new(mqtt_options, REQUEST_CAPACITY);
        link.client = Some(client);
        link.phase = Phase::Connecting;
        *lock(&self.connection) = Some(connection);
        info!(
            "Connecting {} to {}:{} (keepalive {:?})",
            self.dispatcher.handle(),
            host,
            port,
            keepalive
        );
        Ok(())
    }

    fn subscribe(&self, filter: &str, qos: QoS) -> Result<RequestId, EngineError> {
        let mut link = lock(&self.link);
        link.client()?
            .try_subscribe(filter, to_rumqttc(qos))
            .map_err(|e| EngineError::Request(e.to_string()))?;
        let id = link.allocate();
        link.enqueue(Kind::Subscribe, id, qos);
        Ok(id)
    }

    fn unsubscribe(&self, filter: &str) -> Result<RequestId, EngineError> {
        let mut link = lock(&self.link);
        link.client()?
            .try_unsubscribe(filter)
            .map_err(|e| EngineError::Request(e.to_string()))?;
        let id = link.allocate();
        link.enqueue(Kind::Unsubscribe, id, QoS::AtMostOnce);
        Ok(id)
    }

    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<RequestId, EngineError> {
        let mut link = lock(&self.link);
        link.client()?
            .try_publish(topic, to_rumqttc(qos), retain, payload.to_vec())
            .map_err(|e| EngineError::Request(e.to_string()))?;
        let id = link.allocate();
        link.enqueue(Kind::Publish, id, qos);
        Ok(id)
    }

    fn disconnect(&self) -> Result<(), EngineError> {
        let mut link = lock(&self.link);
        link.client()?
            .try_disconnect()
            .map_err(|e| EngineError::Request(e.to_string()))?;
        link.phase = Phase::Disconnecting;
        Ok(())
    }

    fn process(&self, timeout: Duration) -> Result<(), EngineError> {
        let mut connection = lock(&self.connection);
        let connection = connection.as_mut().ok_or(EngineError::NotConnected)?;

        match connection.recv_timeout(timeout) {
            Ok(Ok(event)) => {
                for note in self.translate(event) {
                    self.notify(note);
                }
                Ok(())
            }
            Ok(Err(error)) => {
                let error = map_connection_error(&error);
                for note in self.fail(error.clone()) {
                    self.notify(note);
                }
                Err(error)
            }
            Err(RecvTimeoutError::Timeout) => Ok(()),
            Err(RecvTimeoutError::Disconnected) => {
                let error = EngineError::ConnectionLost("request channel closed".into());
                for note in self.fail(error.clone()) {
                    self.notify(note);
                }
                Err(error)
            }
        }
    }

    fn destroy(&self) -> Result<(), EngineError> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Err(EngineError::Destroyed);
        }
        let mut link = lock(&self.link);
        link.phase = Phase::Closed;
        link.client = None;
        link.queued.clear();
        link.bound.clear();
        drop(link);
        lock(&self.connection).take();
        debug!("Destroyed rumqttc engine {}", self.dispatcher.handle());
        Ok(())
    }
}

fn tls_transport(tls: &TlsOptions) -> Result<Transport, EngineError> {
    if tls.insecure {
        if tls.cert_file.is_some() {
            warn!("Insecure TLS mode ignores the configured client certificate");
        }
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth();
        return Ok(Transport::tls_with_config(TlsConfiguration::Rustls(
            Arc::new(config),
        )));
    }

    let read = |path: &std::path::Path| {
        std::fs::read(path).map_err(|e| EngineError::Tls(format!("{}: {}", path.display(), e)))
    };
    let ca = read(&tls.ca_file)?;
    let client_auth = match (&tls.cert_file, &tls.key_file) {
        (Some(cert), Some(key)) => Some((read(cert)?, read(key)?)),
        _ => None,
    };
    Ok(Transport::tls(ca, client_auth, None))
}

/// Accepts any broker certificate
#[derive(Debug)]
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme::*;
        vec![
            RSA_PKCS1_SHA256,
            RSA_PKCS1_SHA384,
            RSA_PKCS1_SHA512,
            ECDSA_NISTP256_SHA256,
            ECDSA_NISTP384_SHA384,
            ECDSA_NISTP521_SHA512,
            RSA_PSS_SHA256,
            RSA_PSS_SHA384,
            RSA_PSS_SHA512,
            ED25519,
        ]
    }
}
