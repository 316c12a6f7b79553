use serde::Serialize;

/// The reply to a `ping` sent by the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct Pong {
    /// Unix time in seconds at which the reply has been built.
    pub timestamp: u64,
}

impl Pong {
    /// Creates a [`Pong`] carrying the given Unix timestamp.
    #[must_use]
    pub const fn new(timestamp: u64) -> Self {
        Self { timestamp }
    }
}

/// The state a device declares on the `state` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceState {
    state: &'static str,
}

impl DeviceState {
    /// The device is online.
    #[must_use]
    pub const fn online() -> Self {
        Self { state: "1" }
    }

    /// The device is going offline.
    #[must_use]
    pub const fn offline() -> Self {
        Self { state: "0" }
    }

    /// Checks whether the state is online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.state == "1"
    }
}
