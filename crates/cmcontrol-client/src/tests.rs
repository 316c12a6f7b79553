use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cmcontrol::document::{Apontamento, Evidence, Serial, TransportOrder};
use cmcontrol::envelope::basic_authorization;
use cmcontrol::topics::{LOGIN, LOGOUT, PING, PONG, SETUP_APONTAMENTO, STATE, Topics};

use serde_json::{Value, json};

use tokio::time::Instant;

use crate::apontamento::BatchOptions;
use crate::client::{Client, ConnectionState};
use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::transport::{ConnectOptions, Transport, TransportHandler};

const DEVICE: &str = "device001";
const ECHO: &str = "rest/api/v1/echo";
const NO_EVIDENCE: [Evidence; 0] = [];

// Time the scripted broker takes to answer a request.
const BROKER_LATENCY: Duration = Duration::from_millis(10);

type Responder = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

struct Broker {
    handler: Option<Arc<dyn TransportHandler>>,
    connect_error: Option<Error>,
    // `None` never acknowledges the connection.
    connack: Option<u8>,
    fail_publish: bool,
    responders: HashMap<String, Responder>,
    published: Vec<(String, Value)>,
    subscriptions: Vec<String>,
    in_flight: usize,
    max_in_flight: usize,
    disconnects: usize,
}

impl Default for Broker {
    fn default() -> Self {
        Self {
            handler: None,
            connect_error: None,
            connack: Some(0),
            fail_publish: false,
            responders: HashMap::new(),
            published: Vec::new(),
            subscriptions: Vec::new(),
            in_flight: 0,
            max_in_flight: 0,
            disconnects: 0,
        }
    }
}

// An in-memory broker answering requests through scripted responders.
#[derive(Clone)]
struct MockTransport {
    topics: Topics,
    broker: Arc<Mutex<Broker>>,
}

fn lock(broker: &Mutex<Broker>) -> MutexGuard<'_, Broker> {
    broker.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockTransport {
    fn new() -> Self {
        Self {
            topics: Topics::new(DEVICE),
            broker: Arc::new(Mutex::new(Broker::default())),
        }
    }

    fn broker(&self) -> MutexGuard<'_, Broker> {
        lock(&self.broker)
    }

    fn handler(&self) -> Arc<dyn TransportHandler> {
        self.broker()
            .handler
            .clone()
            .expect("The client is not connected")
    }

    fn refuse(self, code: u8) -> Self {
        self.broker().connack = Some(code);
        self
    }

    fn silent(self) -> Self {
        self.broker().connack = None;
        self
    }

    fn unreachable(self, error: Error) -> Self {
        self.broker().connect_error = Some(error);
        self
    }

    fn fail_publish(&self, fail: bool) {
        self.broker().fail_publish = fail;
    }

    fn respond(&self, endpoint: &str, response: Value) {
        self.respond_with(endpoint, move |_| Some(response.clone()));
    }

    fn respond_with<F>(&self, endpoint: &str, responder: F)
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        let _ = self
            .broker()
            .responders
            .insert(endpoint.into(), Arc::new(responder));
    }

    fn deliver(&self, endpoint: &str, message: &Value) {
        self.deliver_raw(endpoint, &serde_json::to_vec(message).unwrap());
    }

    fn deliver_raw(&self, endpoint: &str, payload: &[u8]) {
        self.handler()
            .on_message(&self.topics.response(endpoint), payload);
    }

    fn drop_connection(&self, reason: &str) {
        self.handler().on_disconnect(reason);
    }

    fn published_on(&self, endpoint: &str) -> Vec<Value> {
        let topic = self.topics.request(endpoint);
        self.broker()
            .published
            .iter()
            .filter(|(published, _)| *published == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    fn max_in_flight(&self) -> usize {
        self.broker().max_in_flight
    }

    fn subscriptions(&self) -> Vec<String> {
        self.broker().subscriptions.clone()
    }

    fn disconnects(&self) -> usize {
        self.broker().disconnects
    }
}

impl Transport for MockTransport {
    async fn connect(
        &self,
        options: ConnectOptions,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<()> {
        assert!(options.client_id.starts_with(DEVICE));

        let connack = {
            let mut broker = self.broker();
            if let Some(e) = broker.connect_error.clone() {
                return Err(e);
            }
            broker.handler = Some(Arc::clone(&handler));
            broker.connack
        };

        // Acknowledge from another task, as a delivery loop does.
        if let Some(code) = connack {
            drop(tokio::spawn(async move { handler.on_connect(code) }));
        }

        Ok(())
    }

    fn subscribe(&self, filter: &str) -> Result<()> {
        self.broker().subscriptions.push(filter.into());
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let request: Value = serde_json::from_slice(&payload)?;

        let mut broker = self.broker();
        if broker.fail_publish {
            return Err(Error::new(ErrorKind::Protocol, "Publish rejected"));
        }
        broker.published.push((topic.into(), request.clone()));

        let Some(endpoint) = topic.strip_prefix(&self.topics.request("")) else {
            return Ok(());
        };
        let Some(responder) = broker.responders.get(endpoint).cloned() else {
            return Ok(());
        };
        let (Some(response), Some(handler)) = (responder(&request), broker.handler.clone()) else {
            return Ok(());
        };

        broker.in_flight += 1;
        broker.max_in_flight = broker.max_in_flight.max(broker.in_flight);
        drop(broker);

        let state = Arc::clone(&self.broker);
        let response_topic = self.topics.response(endpoint);
        drop(tokio::spawn(async move {
            tokio::time::sleep(BROKER_LATENCY).await;
            lock(&state).in_flight -= 1;
            handler.on_message(&response_topic, &serde_json::to_vec(&response).unwrap());
        }));

        Ok(())
    }

    async fn disconnect(&self) {
        let mut broker = self.broker();
        broker.handler = None;
        broker.disconnects += 1;
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn config() -> Config {
    Config::new(DEVICE, "localhost")
        .api_credentials("user", "pass")
        .request_timeout(Duration::from_secs(2))
        .token_renewal_margin(Duration::from_secs(10))
}

async fn connected_client() -> (Client<MockTransport>, MockTransport) {
    init_logging();

    let transport = MockTransport::new();
    let client = Client::with_transport(config(), transport.clone());
    client.connect().await.unwrap();

    (client, transport)
}

fn login_response(expires_in: u64) -> Value {
    json!({
        "status": "200",
        "log": "OK",
        "access_token": "abc123",
        "token_type": "Bearer",
        "expires_in": expires_in,
    })
}

fn apontamento_codes(request: &Value) -> Option<&str> {
    request["data"]["apontamentos"][0]["seriais"][0]["codigo"].as_str()
}

#[tokio::test]
async fn connect_declares_online() {
    let (client, transport) = connected_client().await;

    assert_eq!(client.state(), ConnectionState::Connected);
    assert!(client.is_connected());
    assert_eq!(
        transport.subscriptions(),
        vec![format!("br/com/cmcontrol/dispositivo/{DEVICE}/get/+")]
    );
    assert_eq!(transport.published_on(STATE), vec![json!({ "state": "1" })]);

    // A second connection does nothing.
    client.connect().await.unwrap();
    assert_eq!(transport.subscriptions().len(), 1);
}

#[tokio::test]
async fn request_before_connect() {
    init_logging();
    let client = Client::with_transport(config(), MockTransport::new());

    let error = client.request(ECHO, &json!({}), None).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotConnected);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn connect_refused() {
    init_logging();
    let transport = MockTransport::new().refuse(5);
    let client = Client::with_transport(config(), transport.clone());

    let error = client.connect().await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Auth);
    assert_eq!(error.return_code(), Some(5));

    // The half-open connection is torn down.
    assert_eq!(client.state(), ConnectionState::Errored);
    assert_eq!(transport.disconnects(), 1);
    assert!(transport.subscriptions().is_empty());
    assert_eq!(
        client.request(ECHO, &json!({}), None).await.unwrap_err().kind(),
        ErrorKind::NotConnected
    );
}

#[tokio::test]
async fn connect_unreachable() {
    init_logging();
    let transport = MockTransport::new().unreachable(Error::new(
        ErrorKind::Dns,
        "Invalid or unresolved host name: localhost",
    ));
    let client = Client::with_transport(config(), transport.clone());

    assert_eq!(client.connect().await.unwrap_err().kind(), ErrorKind::Dns);
    assert_eq!(client.state(), ConnectionState::Errored);
}

#[tokio::test(start_paused = true)]
async fn connect_without_acknowledgement() {
    init_logging();
    let transport = MockTransport::new().silent();
    let client = Client::with_transport(config(), transport.clone());

    let start = Instant::now();
    let error = client.connect().await.unwrap_err();

    assert_eq!(error.kind(), ErrorKind::ConnectionTimeout);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(10));
    assert!(elapsed < Duration::from_secs(10) + Duration::from_millis(100));
    assert_eq!(client.state(), ConnectionState::Errored);
    assert_eq!(transport.disconnects(), 1);
}

#[tokio::test(start_paused = true)]
async fn requests_are_serialized() {
    let (client, transport) = connected_client().await;
    transport.respond_with(ECHO, |request| Some(request.clone()));

    let payloads = [1, 2, 3, 4].map(|n| json!({ "n": n }));
    let (first, second, third, fourth) = tokio::join!(
        client.request(ECHO, &payloads[0], None),
        client.request(ECHO, &payloads[1], None),
        client.request(ECHO, &payloads[2], None),
        client.request(ECHO, &payloads[3], None),
    );

    // Each caller gets the answer to its own request.
    assert_eq!(first, Ok(json!({ "n": 1 })));
    assert_eq!(second, Ok(json!({ "n": 2 })));
    assert_eq!(third, Ok(json!({ "n": 3 })));
    assert_eq!(fourth, Ok(json!({ "n": 4 })));

    assert_eq!(transport.published_on(ECHO).len(), 4);
    assert_eq!(transport.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn request_timeout() {
    let (client, _transport) = connected_client().await;

    let start = Instant::now();
    let error = client
        .request(ECHO, &json!({ "n": 1 }), Some(Duration::from_secs(3)))
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::RequestTimeout);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(3));
    assert!(elapsed < Duration::from_secs(3) + Duration::from_millis(100));

    let exchange = client.last_exchange().unwrap();
    assert_eq!(exchange.endpoint, ECHO);
    assert_eq!(exchange.request, json!({ "n": 1 }));
    assert_eq!(exchange.response, None);

    // The default timeout applies without an explicit one.
    let start = Instant::now();
    assert!(client.request(ECHO, &json!({}), None).await.is_err());
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(2) + Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn unbounded_timeouts() {
    init_logging();
    let transport = MockTransport::new();
    let client = Client::with_transport(
        config().connect_timeout(Duration::from_secs(u64::MAX)),
        transport.clone(),
    );
    client.connect().await.unwrap();

    transport.respond(ECHO, json!({ "status": "200" }));
    assert_eq!(
        client.request(ECHO, &json!({}), Some(Duration::MAX)).await,
        Ok(json!({ "status": "200" }))
    );
}

#[tokio::test(start_paused = true)]
async fn disconnection_while_pending() {
    let (client, transport) = connected_client().await;

    let payload = json!({});
    let start = Instant::now();
    let (response, ()) = tokio::join!(
        client.request(ECHO, &payload, Some(Duration::from_secs(30))),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            transport.drop_connection("keep alive expired");
        }
    );

    let error = response.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Disconnected);
    assert!(start.elapsed() < Duration::from_secs(1));

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(
        client.request(ECHO, &json!({}), None).await.unwrap_err().kind(),
        ErrorKind::Disconnected
    );

    // The client can connect again.
    client.connect().await.unwrap();
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn stale_response_is_discarded() {
    let (client, transport) = connected_client().await;

    transport.deliver(ECHO, &json!({ "stale": true }));
    transport.respond(ECHO, json!({ "fresh": true }));

    assert_eq!(
        client.request(ECHO, &json!({}), None).await,
        Ok(json!({ "fresh": true }))
    );
}

#[tokio::test(start_paused = true)]
async fn non_json_response_is_ignored() {
    let (client, transport) = connected_client().await;

    let payload = json!({});
    let (response, ()) = tokio::join!(client.request(ECHO, &payload, None), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        transport.deliver_raw(ECHO, b"not json");
    });

    assert_eq!(response.unwrap_err().kind(), ErrorKind::RequestTimeout);
}

#[tokio::test(start_paused = true)]
async fn login_token_lifecycle() {
    let (client, transport) = connected_client().await;
    transport.respond(LOGIN, login_response(60));

    assert_eq!(client.login(None).await, Ok("abc123".to_string()));
    assert_eq!(client.token().as_deref(), Some("abc123"));
    assert_eq!(
        transport.published_on(LOGIN),
        vec![json!({
            "request": {
                "headers": { "Authorization": basic_authorization("user", "pass") },
                "type": "GET",
            }
        })]
    );

    assert!(client.is_token_valid());
    tokio::time::advance(Duration::from_secs(51)).await;
    assert!(!client.is_token_valid());
}

#[tokio::test(start_paused = true)]
async fn ensure_login_once() {
    let (client, transport) = connected_client().await;
    transport.respond(LOGIN, login_response(3600));

    client.ensure_login(None).await.unwrap();
    client.ensure_login(None).await.unwrap();

    assert_eq!(transport.published_on(LOGIN).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn login_failures() {
    let (client, transport) = connected_client().await;

    transport.respond(LOGIN, json!({ "status": "401", "log": "Unauthorized" }));
    let error = client.login(None).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Login);
    let failure = error.response().unwrap();
    assert_eq!(failure.status.as_deref(), Some("401"));
    assert_eq!(failure.endpoint, LOGIN);

    transport.respond(LOGIN, json!({ "status": "200", "log": "OK" }));
    assert_eq!(
        client.login(None).await.unwrap_err().kind(),
        ErrorKind::Login
    );
    assert!(!client.is_token_valid());

    let client = Client::with_transport(Config::new(DEVICE, "localhost"), MockTransport::new());
    client.connect().await.unwrap();
    assert_eq!(
        client.login(None).await.unwrap_err().kind(),
        ErrorKind::Configuration
    );
}

#[tokio::test(start_paused = true)]
async fn logout() {
    let (client, transport) = connected_client().await;

    assert_eq!(
        client.logout(None).await,
        Ok(json!({ "status": "200", "log": "No token" }))
    );
    assert!(transport.published_on(LOGOUT).is_empty());

    transport.respond(LOGIN, login_response(3600));
    transport.respond(LOGOUT, json!({ "status": "200", "log": "Logout OK" }));
    let _ = client.login(None).await.unwrap();

    assert!(client.logout(None).await.is_ok());
    assert_eq!(client.token(), None);
    assert_eq!(
        transport.published_on(LOGOUT),
        vec![json!({
            "request": {
                "headers": { "Authorization": "Bearer abc123" },
                "type": "GET",
            }
        })]
    );
}

#[tokio::test(start_paused = true)]
async fn logout_discards_token_on_failure() {
    let (client, transport) = connected_client().await;
    transport.respond(LOGIN, login_response(3600));
    let _ = client.login(None).await.unwrap();

    // Nobody answers the logout.
    let error = client.logout(None).await.unwrap_err();

    assert_eq!(error.kind(), ErrorKind::RequestTimeout);
    assert_eq!(client.token(), None);
}

#[tokio::test]
async fn heartbeat_replies() {
    let (_client, transport) = connected_client().await;

    transport.deliver(PING, &json!({}));
    let pongs = transport.published_on(PONG);
    assert_eq!(pongs.len(), 1);
    assert!(pongs[0]["timestamp"].as_u64().is_some_and(|timestamp| timestamp > 0));

    // Probes without a JSON payload are answered too.
    transport.deliver_raw(PING, b"");
    assert_eq!(transport.published_on(PONG).len(), 2);

    transport.deliver(STATE, &json!({}));
    assert_eq!(
        transport.published_on(STATE),
        vec![json!({ "state": "1" }), json!({ "state": "1" })]
    );

    // A failed reply is swallowed.
    transport.fail_publish(true);
    transport.deliver(PING, &json!({}));
    transport.fail_publish(false);
    assert_eq!(transport.published_on(PONG).len(), 2);
}

#[tokio::test]
async fn connect_without_online_declaration() {
    init_logging();
    let transport = MockTransport::new();
    transport.fail_publish(true);
    let client = Client::with_transport(config(), transport.clone());

    client.connect().await.unwrap();

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(transport.subscriptions().len(), 1);
    assert!(transport.published_on(STATE).is_empty());
}

#[tokio::test(start_paused = true)]
async fn disconnect_without_offline_declaration() {
    let (client, transport) = connected_client().await;
    transport.fail_publish(true);

    client.disconnect().await;

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(transport.disconnects(), 1);
    assert_eq!(transport.published_on(STATE), vec![json!({ "state": "1" })]);
}

#[tokio::test(start_paused = true)]
async fn ping_while_request_pending() {
    let (client, transport) = connected_client().await;

    let payload = json!({});
    let (response, ()) = tokio::join!(
        client.request(ECHO, &payload, Some(Duration::from_secs(1))),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            transport.deliver(PING, &json!({}));
            // The reply leaves before the request completes.
            assert_eq!(transport.published_on(PONG).len(), 1);
        }
    );

    assert_eq!(response.unwrap_err().kind(), ErrorKind::RequestTimeout);
    assert_eq!(transport.published_on(PONG).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect() {
    let (client, transport) = connected_client().await;

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(transport.disconnects(), 1);
    assert_eq!(
        transport.published_on(STATE),
        vec![json!({ "state": "1" }), json!({ "state": "0" })]
    );

    client.disconnect().await;
    assert_eq!(transport.disconnects(), 1);

    assert_eq!(
        client.request(ECHO, &json!({}), None).await.unwrap_err().kind(),
        ErrorKind::NotConnected
    );
}

#[tokio::test(start_paused = true)]
async fn submission_outcomes() {
    let (client, transport) = connected_client().await;
    transport.respond(LOGIN, login_response(3600));

    transport.respond(
        SETUP_APONTAMENTO,
        json!({ "status": "200", "log": "ERRO4 já apontado" }),
    );
    assert!(client.apontar_serial(" SN123 ", NO_EVIDENCE, None).await.is_ok());

    let request = transport.published_on(SETUP_APONTAMENTO).remove(0);
    assert_eq!(
        request,
        json!({
            "request": {
                "headers": {
                    "Authorization": "Bearer abc123",
                    "Content-Type": "application/x-www-form-urlencoded",
                },
                "type": "POST",
            },
            "data": {
                "enderecoDispositivo": DEVICE,
                "apontamentos": [{ "ok": true, "seriais": [{ "codigo": "SN123" }] }],
            },
        })
    );

    transport.respond(
        SETUP_APONTAMENTO,
        json!({ "status": "500", "log": "falha interna" }),
    );
    let error = client.apontar_serial("SN124", NO_EVIDENCE, None).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Apontamento);
    let failure = error.response().unwrap();
    assert_eq!(failure.status.as_deref(), Some("500"));
    assert_eq!(failure.log, "falha interna");
    assert_eq!(failure.endpoint, SETUP_APONTAMENTO);

    assert_eq!(
        client.apontar_serial("  ", NO_EVIDENCE, None).await.unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    // A single login served every submission.
    assert_eq!(transport.published_on(LOGIN).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn route_validation_and_transport_order() {
    let (client, transport) = connected_client().await;
    transport.respond(LOGIN, login_response(3600));
    transport.respond(SETUP_APONTAMENTO, json!({ "status": "200", "log": "OK" }));

    let _ = client.validar_rota("SN123", None).await.unwrap();
    let _ = client
        .ordem_transporte(
            TransportOrder::new("OT-1"),
            [Apontamento::serial(Serial::new("SN123"))],
            None,
        )
        .await
        .unwrap();

    let requests = transport.published_on(SETUP_APONTAMENTO);
    assert_eq!(requests[0]["data"]["ciclo"], "VALIDAR_ROTA");
    assert_eq!(
        requests[1]["data"]["ordemTransporte"],
        json!({ "codigo": "OT-1", "acao": "APONTAR_TRANSPORTE" })
    );

    assert_eq!(
        client
            .ordem_transporte(TransportOrder::new(" "), Vec::<Apontamento>::new(), None)
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::InvalidArgument
    );
}

#[tokio::test(start_paused = true)]
async fn batch_of_serials() {
    let (client, transport) = connected_client().await;
    transport.respond(LOGIN, login_response(3600));
    transport.respond_with(SETUP_APONTAMENTO, |request| {
        Some(match apontamento_codes(request) {
            Some("BAD") => json!({ "status": "500", "log": "falha interna" }),
            _ => json!({ "status": "200", "log": "OK" }),
        })
    });

    let start = Instant::now();
    let items = client
        .apontar_lote(["SN1", "BAD", "SN2"], BatchOptions::new())
        .await;

    assert_eq!(items.len(), 3);
    assert_eq!(items[1].serial, "BAD");
    assert!(items[0].result.is_ok());
    assert_eq!(
        items[1].result.as_ref().unwrap_err().kind(),
        ErrorKind::Apontamento
    );
    assert!(items[2].result.is_ok());
    // Two pauses separate the three submissions.
    assert!(start.elapsed() >= Duration::from_millis(400));

    let items = client
        .apontar_lote(
            ["SN1", "BAD", "SN2"],
            BatchOptions::new()
                .delay(Duration::ZERO)
                .stop_on_error(true),
        )
        .await;
    assert_eq!(items.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn api_call() {
    let (client, transport) = connected_client().await;
    transport.respond(LOGIN, login_response(3600));
    transport.respond(ECHO, json!({ "status": "404", "log": "Not found" }));

    let error = client.call_api(ECHO, None, None).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Api);
    assert_eq!(
        transport.published_on(ECHO),
        vec![json!({
            "request": {
                "headers": { "Authorization": "Bearer abc123" },
                "type": "GET",
            }
        })]
    );
}
