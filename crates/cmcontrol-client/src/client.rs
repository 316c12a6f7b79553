use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use cmcontrol::envelope::{self, RestRequest, basic_authorization};
use cmcontrol::heartbeat::DeviceState;
use cmcontrol::rules::Rejection;
use cmcontrol::topics::{LOGIN, LOGOUT, STATE, Topics};

use serde::Serialize;
use serde_json::{Value, json};

use tokio::time::Instant;

use tracing::{debug, error, info, warn};

use uuid::Uuid;

use crate::config::Config;
use crate::correlator::Correlator;
use crate::error::{Error, ErrorKind, ResponseFailure, Result};
use crate::heartbeat;
use crate::session::Session;
use crate::transport::{
    CONNECTION_ACCEPTED, ConnectOptions, MqttTransport, Transport, TransportHandler, publish_json,
};

// Time given to the offline declaration to leave before closing.
const OFFLINE_SETTLE: Duration = Duration::from_millis(200);

// Length of the random suffix of a client identifier.
const CLIENT_ID_SUFFIX_LEN: usize = 8;

// Deadline used when a timeout does not fit an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// The connection lifecycle of a [`Client`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection, or the connection has been closed.
    #[default]
    Disconnected,
    /// A connection is being established.
    Connecting,
    /// The broker accepted the connection.
    Connected,
    /// The last connection attempt failed.
    Errored,
}

impl ConnectionState {
    const fn description(self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Errored => "Errored",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.description().fmt(f)
    }
}

/// A request and the response it obtained, kept for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    /// Endpoint of the request.
    pub endpoint: String,
    /// Request payload.
    pub request: Value,
    /// Response payload, if one arrived.
    pub response: Option<Value>,
}

struct Shared<T> {
    topics: Topics,
    transport: T,
    correlator: Correlator,
}

impl<T: Transport> Shared<T> {
    fn publish<P: Serialize + ?Sized>(&self, endpoint: &str, payload: &P) -> Result<()> {
        publish_json(&self.transport, &self.topics.request(endpoint), payload)
    }
}

// The transport only sees a weak reference, so dropping the client stops
// the delivery loop.
struct Delivery<T>(Weak<Shared<T>>);

impl<T: Transport> TransportHandler for Delivery<T> {
    fn on_connect(&self, code: u8) {
        let Some(shared) = self.0.upgrade() else {
            return;
        };

        if code == CONNECTION_ACCEPTED {
            let filter = shared.topics.responses_filter();
            match shared.transport.subscribe(&filter) {
                Ok(()) => debug!("Subscribed to `{filter}`"),
                Err(e) => error!("Unable to subscribe to `{filter}`: {e}"),
            }
            heartbeat::attempt(
                "online state declaration",
                shared.publish(STATE, &DeviceState::online()),
            );
        }

        shared.correlator.acknowledge(code);
    }

    fn on_disconnect(&self, reason: &str) {
        if let Some(shared) = self.0.upgrade() {
            warn!("Connection lost: {reason}");
            shared.correlator.drop_connection(reason);
        }
    }

    fn on_message(&self, topic: &str, payload: &[u8]) {
        let Some(shared) = self.0.upgrade() else {
            return;
        };

        match serde_json::from_slice::<Value>(payload) {
            Ok(value) => shared.correlator.store(topic, value),
            Err(e) => debug!("Message on `{topic}` is not JSON, not cached: {e}"),
        }

        // Probes are answered whatever their payload.
        heartbeat::respond(&shared.topics, topic, &shared.transport);
    }
}

/// A `CmControl` device client.
///
/// The client turns the publish/subscribe exchanges of the broker into
/// request/response calls. Requests are strictly serialized: a request
/// waits for the previous one to complete before publishing, because
/// responses are correlated by topic only.
///
/// While connected, the client answers the `ping` and `state` probes of the
/// system on its own.
pub struct Client<T: Transport = MqttTransport> {
    config: Config,
    shared: Arc<Shared<T>>,
    serializer: tokio::sync::Mutex<()>,
    session: Session,
    last_exchange: Mutex<Option<Exchange>>,
}

impl Client<MqttTransport> {
    /// Creates a [`Client`] connecting through `MQTT`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_transport(config, MqttTransport::new())
    }
}

impl<T: Transport> Client<T> {
    /// Creates a [`Client`] over the given [`Transport`].
    #[must_use]
    pub fn with_transport(config: Config, transport: T) -> Self {
        let session = Session::new(config.token_renewal_margin);
        Self {
            shared: Arc::new(Shared {
                topics: Topics::new(&config.device_address),
                transport,
                correlator: Correlator::new(),
            }),
            config,
            serializer: tokio::sync::Mutex::new(()),
            session,
            last_exchange: Mutex::new(None),
        }
    }

    /// Returns the [`Config`].
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the [`Topics`] of the device.
    #[must_use]
    pub fn topics(&self) -> &Topics {
        &self.shared.topics
    }

    /// Returns the [`ConnectionState`].
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.correlator.state()
    }

    /// Checks whether requests can be sent.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.correlator.ensure_connected().is_ok()
    }

    /// Returns the last request sent and its response.
    #[must_use]
    pub fn last_exchange(&self) -> Option<Exchange> {
        self.last_exchange
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Connects to the broker.
    ///
    /// Once the broker accepts the connection, the client subscribes to the
    /// responses of the device and declares itself online. Connecting an
    /// already connected client does nothing.
    ///
    /// # Errors
    ///
    /// Fails with an error of the connection family. A refusal of the
    /// broker is an [`ErrorKind::Auth`] error carrying the return code.
    pub async fn connect(&self) -> Result<()> {
        if self.state() == ConnectionState::Connected {
            warn!("Already connected to the broker");
            return Ok(());
        }

        let correlator = &self.shared.correlator;
        correlator.begin_connect();

        let (host, port) = self.config.broker();
        let options = ConnectOptions {
            client_id: client_id(&self.config.device_address),
            host: host.into(),
            port,
            keep_alive: self.config.keep_alive,
            credentials: self.config.mqtt_credentials.clone(),
            tls: self.config.tls.clone(),
        };
        info!(
            "Connecting to {host}:{port} as `{}` (tls: {})",
            options.client_id,
            options.tls.is_some()
        );

        let deadline = deadline_after(self.config.connect_timeout);
        let handler: Arc<dyn TransportHandler> = Arc::new(Delivery(Arc::downgrade(&self.shared)));

        let connected = tokio::time::timeout_at(deadline, self.shared.transport.connect(options, handler))
            .await
            .unwrap_or_else(|_| Err(connect_timeout(host, port)));
        if let Err(e) = connected {
            error!("Connection failed: {e}");
            correlator.fail();
            return Err(e);
        }
        correlator.open();

        let acknowledged = match correlator.wait_for_acknowledgement(deadline).await {
            Some(Ok(CONNECTION_ACCEPTED)) => correlator.mark_connected(),
            Some(Ok(code)) => Err(Error::auth(code)),
            Some(Err(e)) => Err(e),
            None => Err(connect_timeout(host, port)),
        };

        match acknowledged {
            Ok(()) => {
                info!("Connected to {host}:{port}");
                Ok(())
            }
            Err(e) => {
                error!("Connection failed: {e}");
                self.shared.transport.disconnect().await;
                correlator.fail();
                Err(e)
            }
        }
    }

    /// Disconnects from the broker.
    ///
    /// The client declares itself offline first. Pending requests fail with
    /// [`ErrorKind::Disconnected`]. Disconnecting a client which is not
    /// connected does nothing.
    pub async fn disconnect(&self) {
        let correlator = &self.shared.correlator;
        if !correlator.is_open() {
            debug!("No connection to close");
            return;
        }

        if !correlator.is_dropped() {
            heartbeat::attempt(
                "offline state declaration",
                self.shared.publish(STATE, &DeviceState::offline()),
            );
            tokio::time::sleep(OFFLINE_SETTLE).await;
        }

        self.shared.transport.disconnect().await;
        correlator.close();
        info!("Disconnected from the broker");
    }

    /// Publishes a payload on the request topic of an endpoint, without
    /// waiting for any response.
    ///
    /// # Errors
    ///
    /// Fails when the client is not connected or the payload cannot be
    /// published.
    pub fn publish<P: Serialize + ?Sized>(&self, endpoint: &str, payload: &P) -> Result<()> {
        self.shared.correlator.ensure_connected()?;
        self.shared.publish(endpoint, payload)
    }

    /// Sends a request on an endpoint and waits for its response.
    ///
    /// Without `timeout`, the default request timeout applies. The timeout
    /// starts once the request is published, after the previous requests
    /// completed.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::NotConnected`] before connecting,
    /// [`ErrorKind::Disconnected`] when the connection drops while waiting
    /// and [`ErrorKind::RequestTimeout`] when no response arrives in time.
    pub async fn request<P: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        payload: &P,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let request = serde_json::to_value(payload).map_err(|e| {
            Error::new(
                ErrorKind::InvalidArgument,
                format!("Payload for `{endpoint}` is not representable as JSON: {e}"),
            )
        })?;
        self.shared.correlator.ensure_connected()?;

        let response_topic = self.shared.topics.response(endpoint);
        let timeout = timeout.unwrap_or(self.config.request_timeout);

        let _turn = self.serializer.lock().await;
        // The connection may have dropped while waiting for the turn.
        self.shared.correlator.ensure_connected()?;
        self.shared.correlator.forget(&response_topic);

        debug!("Request on `{endpoint}`");
        self.shared.publish(endpoint, &request)?;

        let response = self
            .shared
            .correlator
            .wait_for(&response_topic, deadline_after(timeout))
            .await;
        match &response {
            Ok(_) => debug!("Response on `{endpoint}`"),
            Err(e) => warn!("Request on `{endpoint}` failed: {e}"),
        }

        *self
            .last_exchange
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Exchange {
            endpoint: endpoint.into(),
            request,
            response: response.as_ref().ok().cloned(),
        });

        response
    }

    /// Logs into the `REST` interface and returns the access token.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::Configuration`] without `REST` credentials
    /// and [`ErrorKind::Login`] when the login is rejected or answers
    /// without an access token.
    pub async fn login(&self, timeout: Option<Duration>) -> Result<String> {
        let credentials = self.config.login_credentials()?;
        let request = RestRequest::login(basic_authorization(
            &credentials.user,
            &credentials.password,
        ));

        let response = self.request(LOGIN, &request, timeout).await?;
        self.check(ErrorKind::Login, LOGIN, &response)?;

        let Some(token) = envelope::access_token(&response) else {
            return Err(Error::rejected(
                ErrorKind::Login,
                ResponseFailure {
                    status: envelope::status(&response),
                    log: "Login answered without an access token".into(),
                    endpoint: LOGIN.into(),
                    raw: Some(response.clone()),
                },
            ));
        };
        let token = token.to_string();

        let expires_in = envelope::expires_in(&response);
        self.session.store(token.clone(), expires_in);
        info!("Logged in, the token expires in {expires_in} s");

        Ok(token)
    }

    /// Checks whether the access token is held and not about to expire.
    #[must_use]
    pub fn is_token_valid(&self) -> bool {
        self.session.is_valid()
    }

    /// Returns the access token, if any.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.session.access_token()
    }

    /// Logs in unless the access token is still valid.
    ///
    /// # Errors
    ///
    /// Fails as [`Client::login`].
    pub async fn ensure_login(&self, timeout: Option<Duration>) -> Result<()> {
        if self.session.is_valid() {
            return Ok(());
        }
        self.login(timeout).await.map(|_| ())
    }

    /// Logs out of the `REST` interface.
    ///
    /// Without access token, a synthetic success is returned. Otherwise the
    /// token is discarded whatever the outcome of the logout request.
    ///
    /// # Errors
    ///
    /// Fails as [`Client::request`]. The response itself is not judged.
    pub async fn logout(&self, timeout: Option<Duration>) -> Result<Value> {
        let Some(token) = self.session.access_token() else {
            return Ok(json!({ "status": "200", "log": "No token" }));
        };

        let response = self
            .request(LOGOUT, &RestRequest::logout(&token), timeout)
            .await;
        let _ = self.session.clear();

        match &response {
            Ok(_) => info!("Logged out"),
            Err(e) => warn!("Logout request failed, token discarded anyway: {e}"),
        }
        response
    }

    /// Calls an authenticated `REST` endpoint.
    ///
    /// With `data`, a `POST` request carries it, otherwise a `GET` request
    /// is sent. A valid token is obtained first.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::Api`] when the response is judged a failure
    /// by the business rules.
    pub async fn call_api(
        &self,
        endpoint: &str,
        data: Option<&Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let token = self.authorized_token(timeout).await?;
        let request = match data {
            Some(data) => RestRequest::post(&token, data)?,
            None => RestRequest::authorized_get(&token),
        };

        let response = self.request(endpoint, &request, timeout).await?;
        self.check(ErrorKind::Api, endpoint, &response)?;
        Ok(response)
    }

    pub(crate) async fn authorized_token(&self, timeout: Option<Duration>) -> Result<String> {
        self.ensure_login(timeout).await?;
        self.session.access_token().ok_or_else(|| {
            Error::rejected(
                ErrorKind::Login,
                ResponseFailure {
                    status: Some("401".into()),
                    log: "No token after the login".into(),
                    endpoint: LOGIN.into(),
                    raw: None,
                },
            )
        })
    }

    pub(crate) fn check(&self, kind: ErrorKind, endpoint: &str, response: &Value) -> Result<()> {
        self.config
            .business_rules
            .check(response)
            .map_err(|Rejection { status, log }| {
                Error::rejected(
                    kind,
                    ResponseFailure {
                        status: Some(status),
                        log,
                        endpoint: endpoint.into(),
                        raw: Some(response.clone()),
                    },
                )
            })
    }
}

fn client_id(device: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{device}-{}", &suffix[..CLIENT_ID_SUFFIX_LEN])
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}

fn connect_timeout(host: &str, port: u16) -> Error {
    Error::new(
        ErrorKind::ConnectionTimeout,
        format!("The broker at {host}:{port} did not acknowledge the connection in time"),
    )
}
