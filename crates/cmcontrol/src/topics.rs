use alloc::format;
use alloc::string::String;

/// The fixed vendor namespace every device topic lives under.
pub const NAMESPACE: &str = "br/com/cmcontrol/dispositivo";

/// Heartbeat request sent by the system.
pub const PING: &str = "ping";
/// Heartbeat reply sent by the device.
pub const PONG: &str = "pong";
/// Device state query and declaration.
pub const STATE: &str = "state";
/// `OAuth2` login through `MQTT+REST`.
pub const LOGIN: &str = "rest/oauth2/login";
/// `OAuth2` logout through `MQTT+REST`.
pub const LOGOUT: &str = "rest/oauth2/logout";
/// Submission of a [`crate::document::Setup`] through `MQTT+REST`.
pub const SETUP_APONTAMENTO: &str = "rest/api/v1/setup.apontamento";

const REQUEST_SEGMENT: &str = "set";
const RESPONSE_SEGMENT: &str = "get";

/// Topic builder for a single device.
///
/// A request for an endpoint is published on
/// `<namespace>/<device>/set/<endpoint>` and its response arrives on
/// `<namespace>/<device>/get/<endpoint>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    base: String,
}

impl Topics {
    /// Creates the [`Topics`] of the device with the given address.
    #[must_use]
    #[inline]
    pub fn new(device: &str) -> Self {
        Self {
            base: format!("{NAMESPACE}/{device}"),
        }
    }

    /// Returns the topic prefix shared by every topic of the device.
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Returns the topic on which a request for `endpoint` is published.
    #[must_use]
    #[inline]
    pub fn request(&self, endpoint: &str) -> String {
        format!("{}/{REQUEST_SEGMENT}/{endpoint}", self.base)
    }

    /// Returns the topic on which the response for `endpoint` arrives.
    #[must_use]
    #[inline]
    pub fn response(&self, endpoint: &str) -> String {
        format!("{}/{RESPONSE_SEGMENT}/{endpoint}", self.base)
    }

    /// Returns the wildcard filter matching every response topic of the
    /// device.
    #[must_use]
    #[inline]
    pub fn responses_filter(&self) -> String {
        format!("{}/{RESPONSE_SEGMENT}/+", self.base)
    }

    /// Returns the endpoint of a response topic belonging to this device.
    ///
    /// Topics of other devices and request topics return `None`.
    #[must_use]
    pub fn endpoint_of<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.base.as_str())?
            .strip_prefix('/')?
            .strip_prefix(RESPONSE_SEGMENT)?
            .strip_prefix('/')
            .filter(|endpoint| !endpoint.is_empty())
    }
}
