use std::time::{SystemTime, UNIX_EPOCH};

use cmcontrol::heartbeat::{DeviceState, Pong};
use cmcontrol::topics::{PING, PONG, STATE, Topics};

use tracing::{debug, warn};

use crate::error::Result;
use crate::transport::{Transport, publish_json};

/// Answers the liveness probes sent by the system.
///
/// A `ping` is answered with a `pong` carrying the current Unix time, a
/// `state` query with the online state. Each probe gets exactly one reply
/// attempt, and a failed reply is only logged.
pub(crate) fn respond<T: Transport>(topics: &Topics, topic: &str, transport: &T) {
    match topics.endpoint_of(topic) {
        Some(PING) => attempt(
            "pong reply",
            publish_json(transport, &topics.request(PONG), &Pong::new(unix_timestamp())),
        ),
        Some(STATE) => attempt(
            "state reply",
            publish_json(transport, &topics.request(STATE), &DeviceState::online()),
        ),
        _ => {}
    }
}

/// Logs the outcome of a best-effort action.
pub(crate) fn attempt(what: &str, result: Result<()>) {
    match result {
        Ok(()) => debug!("Sent {what}"),
        Err(e) => warn!("Unable to send {what}: {e}"),
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}
