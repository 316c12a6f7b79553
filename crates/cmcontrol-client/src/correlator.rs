use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::client::ConnectionState;
use crate::error::{Error, ErrorKind, Result};

#[derive(Default)]
struct Inbox {
    state: ConnectionState,
    // A transport session is open.
    open: bool,
    // Return code of the last acknowledgement.
    connack: Option<u8>,
    // Reason of an unexpected connection loss.
    dropped: Option<String>,
    // Last message received on each topic.
    responses: HashMap<String, Value>,
}

impl Inbox {
    fn lost(&self) -> Option<Error> {
        if let Some(reason) = &self.dropped {
            return Some(Error::new(
                ErrorKind::Disconnected,
                format!("Connection lost: {reason}"),
            ));
        }

        (!self.open).then(|| Error::new(ErrorKind::Disconnected, "Connection closed"))
    }
}

/// Connection state and last-value cache of inbound messages.
///
/// Each write wakes all waiters, which then look for their own topic.
pub(crate) struct Correlator {
    inbox: Mutex<Inbox>,
    arrivals: Notify,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self {
            inbox: Mutex::new(Inbox::default()),
            arrivals: Notify::new(),
        }
    }

    fn inbox(&self) -> MutexGuard<'_, Inbox> {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut Inbox)) {
        f(&mut self.inbox());
        self.arrivals.notify_waiters();
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.inbox().state
    }

    pub(crate) fn is_open(&self) -> bool {
        self.inbox().open
    }

    pub(crate) fn is_dropped(&self) -> bool {
        self.inbox().dropped.is_some()
    }

    pub(crate) fn begin_connect(&self) {
        self.update(|inbox| {
            *inbox = Inbox {
                state: ConnectionState::Connecting,
                ..Inbox::default()
            };
        });
    }

    pub(crate) fn open(&self) {
        self.update(|inbox| inbox.open = true);
    }

    pub(crate) fn acknowledge(&self, code: u8) {
        self.update(|inbox| inbox.connack = Some(code));
    }

    pub(crate) fn mark_connected(&self) -> Result<()> {
        let mut inbox = self.inbox();
        if let Some(error) = inbox.lost() {
            return Err(error);
        }
        inbox.state = ConnectionState::Connected;
        Ok(())
    }

    pub(crate) fn fail(&self) {
        self.update(|inbox| {
            inbox.open = false;
            inbox.state = ConnectionState::Errored;
        });
    }

    pub(crate) fn drop_connection(&self, reason: &str) {
        self.update(|inbox| {
            inbox.dropped = Some(reason.into());
            if inbox.state == ConnectionState::Connected {
                inbox.state = ConnectionState::Disconnected;
            }
        });
    }

    pub(crate) fn close(&self) {
        self.update(|inbox| {
            inbox.open = false;
            inbox.state = ConnectionState::Disconnected;
            inbox.responses.clear();
        });
    }

    pub(crate) fn ensure_connected(&self) -> Result<()> {
        let inbox = self.inbox();
        if !inbox.open {
            return Err(Error::new(
                ErrorKind::NotConnected,
                "Not connected to the broker, call `connect` first",
            ));
        }
        if let Some(error) = inbox.lost() {
            return Err(error);
        }
        if inbox.state != ConnectionState::Connected {
            return Err(Error::new(
                ErrorKind::NotConnected,
                format!("The connection is {}", inbox.state),
            ));
        }
        Ok(())
    }

    pub(crate) fn store(&self, topic: &str, value: Value) {
        self.update(|inbox| {
            let _ = inbox.responses.insert(topic.into(), value);
        });
    }

    pub(crate) fn forget(&self, topic: &str) {
        let _ = self.inbox().responses.remove(topic);
    }

    /// Waits for the acknowledgement of the broker.
    ///
    /// Returns `None` when the deadline expires first.
    pub(crate) async fn wait_for_acknowledgement(&self, deadline: Instant) -> Option<Result<u8>> {
        self.wait_until(deadline, |inbox| {
            if let Some(code) = inbox.connack {
                return Some(Ok(code));
            }
            inbox.dropped.as_ref().and_then(|_| inbox.lost()).map(Err)
        })
        .await
    }

    /// Waits for a message on the given topic.
    ///
    /// The message is returned without being removed from the cache.
    pub(crate) async fn wait_for(&self, topic: &str, deadline: Instant) -> Result<Value> {
        self.wait_until(deadline, |inbox| {
            if let Some(error) = inbox.lost() {
                return Some(Err(error));
            }
            inbox.responses.get(topic).cloned().map(Ok)
        })
        .await
        .unwrap_or_else(|| {
            Err(Error::new(
                ErrorKind::RequestTimeout,
                format!("No response on `{topic}` before the deadline"),
            ))
        })
    }

    async fn wait_until<R>(
        &self,
        deadline: Instant,
        mut check: impl FnMut(&Inbox) -> Option<R>,
    ) -> Option<R> {
        loop {
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            // Registered before checking, so no write can slip in between.
            let _ = notified.as_mut().enable();

            let ready = check(&self.inbox());
            if ready.is_some() {
                return ready;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return check(&self.inbox());
            }
        }
    }
}
