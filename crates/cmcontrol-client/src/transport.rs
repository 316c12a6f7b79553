use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS,
};

use serde::Serialize;

use tokio::task::JoinHandle;

use tokio_util::sync::CancellationToken;

use tracing::{debug, error, warn};

use crate::config::{BrokerTls, Credentials};
use crate::error::{Error, ErrorKind, Result};

/// The return code of an accepted connection.
pub const CONNECTION_ACCEPTED: u8 = 0;

// The capacity of the bounded asynchronous channel.
const ASYNC_CHANNEL_CAPACITY: usize = 64;

// Brokers reject keep alive intervals that are too short.
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

// Evidences travel inline, so packets may be large.
const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

// Time given to the delivery loop to flush the disconnection.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Receiver of the asynchronous notifications of a [`Transport`].
///
/// The callbacks run on the delivery context of the transport. They must
/// neither block nor fail.
pub trait TransportHandler: Send + Sync + 'static {
    /// The broker acknowledged the connection with the given return code.
    ///
    /// A non-zero code means the connection has been refused.
    fn on_connect(&self, code: u8);

    /// The connection dropped.
    fn on_disconnect(&self, reason: &str);

    /// A message arrived on a subscribed topic.
    fn on_message(&self, topic: &str, payload: &[u8]);
}

/// Settings of a transport connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Unique client identifier.
    pub client_id: String,
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Keep alive interval.
    pub keep_alive: Duration,
    /// Broker credentials.
    pub credentials: Option<Credentials>,
    /// Encryption settings.
    pub tls: Option<BrokerTls>,
}

/// A publish/subscribe transport with at-most-once delivery.
pub trait Transport: Send + Sync + 'static {
    /// Connects to the broker and starts the delivery loop.
    ///
    /// Once the session is up, the broker acknowledgement is reported through
    /// [`TransportHandler::on_connect`], followed by messages and a possible
    /// disconnection.
    ///
    /// # Errors
    ///
    /// Low-level failures are classified as [`ErrorKind::Dns`],
    /// [`ErrorKind::ConnectionTimeout`], [`ErrorKind::Tls`],
    /// [`ErrorKind::Connection`] or [`ErrorKind::Protocol`] errors.
    fn connect(
        &self,
        options: ConnectOptions,
        handler: Arc<dyn TransportHandler>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Subscribes to a topic filter.
    ///
    /// # Errors
    ///
    /// Fails when no session is open or the request cannot be queued.
    fn subscribe(&self, filter: &str) -> Result<()>;

    /// Publishes a payload without retention and without acknowledgement.
    ///
    /// The call never waits, so it can be used from the delivery context.
    ///
    /// # Errors
    ///
    /// Fails when no session is open or the request cannot be queued.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Stops the delivery loop and closes the session.
    ///
    /// Closing a transport without session does nothing.
    fn disconnect(&self) -> impl Future<Output = ()> + Send;
}

pub(crate) fn publish_json<T, P>(transport: &T, topic: &str, payload: &P) -> Result<()>
where
    T: Transport,
    P: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(payload).map_err(|e| {
        Error::new(
            ErrorKind::InvalidArgument,
            format!("Payload for `{topic}` is not representable as JSON: {e}"),
        )
    })?;
    transport.publish(topic, payload)
}

struct Session {
    client: AsyncClient,
    cancellation_token: CancellationToken,
    // Attached once the delivery loop has been spawned.
    handle: Option<JoinHandle<()>>,
}

/// A [`Transport`] speaking `MQTT` 3.1.1 through `rumqttc`.
///
/// The event loop is polled by a dedicated asynchronous task.
#[derive(Default)]
pub struct MqttTransport {
    session: Mutex<Option<Session>>,
}

impl MqttTransport {
    /// Creates a [`MqttTransport`] without session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_client<F>(&self, action: &str, f: F) -> Result<()>
    where
        F: FnOnce(&AsyncClient) -> std::result::Result<(), rumqttc::ClientError>,
    {
        let session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(session) = session.as_ref() else {
            return Err(Error::new(
                ErrorKind::NotConnected,
                format!("Unable to {action}: no broker session"),
            ));
        };

        f(&session.client).map_err(|e| {
            Error::new(ErrorKind::Protocol, format!("Unable to {action}: {e}"))
        })
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        let session = self
            .session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.cancellation_token.cancel();
        }
    }
}

impl Transport for MqttTransport {
    async fn connect(
        &self,
        options: ConnectOptions,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<()> {
        let mqtt_options = mqtt_options(&options)?;
        let (client, mut eventloop) = AsyncClient::new(mqtt_options, ASYNC_CHANNEL_CAPACITY);

        // The first poll opens the network connection and waits for `CONNACK`.
        let code = loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(connack))) => break return_code(connack.code),
                Ok(event) => debug!("Event before the acknowledgement, discard it: {event:?}"),
                Err(ConnectionError::ConnectionRefused(code)) => break return_code(code),
                Err(e) => return Err(classify(&options, e)),
            }
        };

        // `on_connect` publishes through the session, so it must be stored
        // before the delivery loop starts.
        let cancellation_token = CancellationToken::new();
        let previous = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Session {
                client,
                cancellation_token: cancellation_token.clone(),
                handle: None,
            });
        if let Some(previous) = previous {
            warn!("Replacing a broker session which was still open");
            previous.cancellation_token.cancel();
        }

        let handle = tokio::spawn(run_delivery_loop(
            eventloop,
            code,
            handler,
            cancellation_token.clone(),
        ));

        match self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            Some(session) => session.handle = Some(handle),
            // Closed while the loop was being spawned.
            None => cancellation_token.cancel(),
        }

        Ok(())
    }

    fn subscribe(&self, filter: &str) -> Result<()> {
        self.with_client("subscribe", |client| {
            client.try_subscribe(filter, QoS::AtMostOnce)
        })
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.with_client("publish", |client| {
            client.try_publish(topic, QoS::AtMostOnce, false, payload)
        })
    }

    async fn disconnect(&self) {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Session {
            client,
            cancellation_token,
            handle,
        }) = session
        else {
            return;
        };

        if let Err(e) = client.try_disconnect() {
            warn!("Unable to request the disconnection: {e}");
        }

        let Some(mut handle) = handle else {
            cancellation_token.cancel();
            return;
        };

        if tokio::time::timeout(DISCONNECT_GRACE, &mut handle)
            .await
            .is_err()
        {
            warn!("The delivery loop did not stop in time, cancel it");
            cancellation_token.cancel();
            if let Err(e) = handle.await {
                error!("Failed to await the delivery loop: {e}");
            }
        }
    }
}

async fn run_delivery_loop(
    mut eventloop: EventLoop,
    code: u8,
    handler: Arc<dyn TransportHandler>,
    cancellation_token: CancellationToken,
) {
    handler.on_connect(code);
    if code != CONNECTION_ACCEPTED {
        return;
    }

    loop {
        tokio::select! {
            // Use the cancellation token to stop the loop
            () = cancellation_token.cancelled() => { break; }
            // Poll the `MQTT` event coming from the network
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        handler.on_message(&publish.topic, &publish.payload);
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        handler.on_disconnect("The broker closed the session");
                        break;
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("Disconnection sent, stop the delivery loop");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        handler.on_disconnect(&e.to_string());
                        break;
                    }
                }
            }
        }
    }
}

fn mqtt_options(options: &ConnectOptions) -> Result<MqttOptions> {
    let mut mqtt_options = MqttOptions::new(&options.client_id, &options.host, options.port);
    let _ = mqtt_options
        .set_keep_alive(options.keep_alive.max(MIN_KEEP_ALIVE))
        .set_clean_session(true)
        .set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    if let Some(credentials) = &options.credentials {
        let _ = mqtt_options.set_credentials(&credentials.user, &credentials.password);
    }

    if let Some(tls) = &options.tls {
        let _ = mqtt_options.set_transport(tls_transport(tls)?);
    }

    Ok(mqtt_options)
}

#[cfg(feature = "tls")]
fn tls_transport(tls: &BrokerTls) -> Result<rumqttc::Transport> {
    use rumqttc::TlsConfiguration;

    let read_pem = |path: &std::path::Path| {
        std::fs::read(path).map_err(|e| {
            Error::new(
                ErrorKind::Tls,
                format!("Unable to read `{}`: {e}", path.display()),
            )
        })
    };

    let configuration = match (&tls.ca_certs, &tls.client_auth) {
        (None, None) => TlsConfiguration::default(),
        (None, Some(_)) => {
            return Err(Error::new(
                ErrorKind::Tls,
                "A client certificate requires a certificate authority",
            ));
        }
        (Some(ca), client_auth) => TlsConfiguration::Simple {
            ca: read_pem(ca.as_path())?,
            alpn: None,
            client_auth: client_auth
                .as_ref()
                .map(|(certfile, keyfile)| {
                    Ok::<_, Error>((read_pem(certfile.as_path())?, read_pem(keyfile.as_path())?))
                })
                .transpose()?,
        },
    };

    Ok(rumqttc::Transport::tls_with_config(configuration))
}

#[cfg(not(feature = "tls"))]
fn tls_transport(_tls: &BrokerTls) -> Result<rumqttc::Transport> {
    Err(Error::new(
        ErrorKind::Tls,
        "Encrypted connections require the `tls` feature",
    ))
}

pub(crate) const fn return_code(code: ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

pub(crate) fn classify(options: &ConnectOptions, e: ConnectionError) -> Error {
    let broker = format!("{}:{}", options.host, options.port);
    match e {
        ConnectionError::Io(e) => classify_io(&options.host, &broker, &e),
        ConnectionError::NetworkTimeout => Error::new(
            ErrorKind::ConnectionTimeout,
            format!(
                "Timeout connecting to the broker at {broker}. Check the address, the port, the firewall or the network."
            ),
        ),
        #[cfg(feature = "tls")]
        ConnectionError::Tls(e) => Error::new(
            ErrorKind::Tls,
            format!("TLS error connecting to the broker at {broker}: {e}"),
        ),
        e => Error::new(
            ErrorKind::Protocol,
            format!("Unexpected error connecting to the broker at {broker}: {e}"),
        ),
    }
}

fn classify_io(host: &str, broker: &str, e: &io::Error) -> Error {
    if e.kind() == io::ErrorKind::TimedOut {
        return Error::new(
            ErrorKind::ConnectionTimeout,
            format!("Timeout connecting to the broker at {broker}: {e}"),
        );
    }

    if is_unresolved_host(e) {
        return Error::new(
            ErrorKind::Dns,
            format!("Invalid or unresolved host name: {host}"),
        );
    }

    Error::new(
        ErrorKind::Connection,
        format!("Network error connecting to the broker at {broker}: {e}"),
    )
}

// Name resolution failures carry no dedicated `io::ErrorKind`, only the
// resolver message.
fn is_unresolved_host(e: &io::Error) -> bool {
    const RESOLVER_MESSAGES: &[&str] = &[
        "failed to lookup address",
        "name or service not known",
        "nodename nor servname",
        "no such host is known",
        "temporary failure in name resolution",
    ];

    let message = e.to_string().to_lowercase();
    RESOLVER_MESSAGES
        .iter()
        .any(|resolver_message| message.contains(resolver_message))
}
