use std::borrow::Cow;
use std::fmt;

use serde_json::Value;

/// All kinds of errors the client can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A required setting is missing or malformed.
    Configuration,
    /// An operation has been attempted before connecting to the broker.
    NotConnected,
    /// The caller provided a malformed input, such as an empty serial.
    InvalidArgument,
    /// A generic network failure while connecting to the broker.
    Connection,
    /// The broker host name could not be resolved.
    Dns,
    /// The broker did not complete the connection in time.
    ConnectionTimeout,
    /// The encrypted channel could not be negotiated.
    Tls,
    /// An unexpected failure of the messaging protocol.
    Protocol,
    /// The broker refused the connection, usually because of bad
    /// credentials.
    Auth,
    /// The connection dropped while an operation was waiting.
    Disconnected,
    /// No response arrived within the deadline.
    RequestTimeout,
    /// A payload is not valid `JSON`.
    Decode,
    /// The `OAuth2` login has been rejected.
    Login,
    /// A generic `MQTT+REST` call has been rejected.
    Api,
    /// A `setup.apontamento` submission has been rejected.
    Apontamento,
}

impl ErrorKind {
    /// Checks whether the kind belongs to the failures raised while
    /// connecting to the broker.
    #[must_use]
    pub const fn is_connection(self) -> bool {
        matches!(
            self,
            Self::Connection
                | Self::Dns
                | Self::ConnectionTimeout
                | Self::Tls
                | Self::Protocol
                | Self::Auth
        )
    }

    /// Checks whether the kind belongs to the failures reported by a
    /// response envelope.
    #[must_use]
    pub const fn is_response(self) -> bool {
        matches!(self, Self::Login | Self::Api | Self::Apontamento)
    }

    const fn description(self) -> &'static str {
        match self {
            Self::Configuration => "Configuration",
            Self::NotConnected => "Not Connected",
            Self::InvalidArgument => "Invalid Argument",
            Self::Connection => "Connection",
            Self::Dns => "Dns",
            Self::ConnectionTimeout => "Connection Timeout",
            Self::Tls => "Tls",
            Self::Protocol => "Protocol",
            Self::Auth => "Authentication",
            Self::Disconnected => "Disconnected",
            Self::RequestTimeout => "Request Timeout",
            Self::Decode => "Decode",
            Self::Login => "Login",
            Self::Api => "Api",
            Self::Apontamento => "Apontamento",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.description().fmt(f)
    }
}

/// Diagnostics of a response envelope judged a failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFailure {
    /// Response status.
    pub status: Option<String>,
    /// Response log text.
    pub log: String,
    /// Endpoint which produced the response.
    pub endpoint: String,
    /// The whole response, when one has been received.
    pub raw: Option<Value>,
}

/// A client error.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    kind: ErrorKind,
    description: Cow<'static, str>,
    return_code: Option<u8>,
    response: Option<Box<ResponseFailure>>,
}

impl Error {
    /// Creates an [`Error`] from its kind and a description.
    #[must_use]
    pub fn new(kind: ErrorKind, description: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            description: description.into(),
            return_code: None,
            response: None,
        }
    }

    pub(crate) fn auth(return_code: u8) -> Self {
        Self {
            return_code: Some(return_code),
            ..Self::new(
                ErrorKind::Auth,
                format!("The broker refused the connection (return code {return_code})"),
            )
        }
    }

    pub(crate) fn rejected(kind: ErrorKind, failure: ResponseFailure) -> Self {
        let mut description = format!("CmControl answered with an error on `{}`", failure.endpoint);
        if let Some(status) = &failure.status {
            description.push_str(&format!(" (status {status})"));
        }
        if !failure.log.is_empty() {
            description.push_str(&format!(": {}", failure.log));
        }

        Self {
            response: Some(Box::new(failure)),
            ..Self::new(kind, description)
        }
    }

    /// Returns the [`ErrorKind`].
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the broker return code of an [`ErrorKind::Auth`] error.
    #[must_use]
    pub const fn return_code(&self) -> Option<u8> {
        self.return_code
    }

    /// Returns the diagnostics of a rejected response.
    #[must_use]
    pub fn response(&self) -> Option<&ResponseFailure> {
        self.response.as_deref()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.description)
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::Decode, format!("Invalid JSON payload: {e}"))
    }
}

/// A specialized [`Result`] type for [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Error, ErrorKind, ResponseFailure};

    #[test]
    fn error_families() {
        for kind in [
            ErrorKind::Connection,
            ErrorKind::Dns,
            ErrorKind::ConnectionTimeout,
            ErrorKind::Tls,
            ErrorKind::Protocol,
            ErrorKind::Auth,
        ] {
            assert!(kind.is_connection());
            assert!(!kind.is_response());
        }

        for kind in [ErrorKind::Login, ErrorKind::Api, ErrorKind::Apontamento] {
            assert!(kind.is_response());
            assert!(!kind.is_connection());
        }

        assert!(!ErrorKind::Disconnected.is_connection());
        assert!(!ErrorKind::RequestTimeout.is_response());
    }

    #[test]
    fn auth_error() {
        let error = Error::auth(5);

        assert_eq!(error.kind(), ErrorKind::Auth);
        assert_eq!(error.return_code(), Some(5));
        assert_eq!(
            error.to_string(),
            "Authentication: The broker refused the connection (return code 5)"
        );
    }

    #[test]
    fn rejected_response() {
        let raw = json!({ "status": "500", "log": "falha interna" });
        let error = Error::rejected(
            ErrorKind::Apontamento,
            ResponseFailure {
                status: Some("500".into()),
                log: "falha interna".into(),
                endpoint: "rest/api/v1/setup.apontamento".into(),
                raw: Some(raw.clone()),
            },
        );

        assert_eq!(
            error.description(),
            "CmControl answered with an error on `rest/api/v1/setup.apontamento` (status 500): falha interna"
        );

        let failure = error.response().unwrap();
        assert_eq!(failure.status.as_deref(), Some("500"));
        assert_eq!(failure.raw, Some(raw));
    }

    #[test]
    fn decode_error() {
        let error: Error = serde_json::from_slice::<serde_json::Value>(b"{")
            .unwrap_err()
            .into();

        assert_eq!(error.kind(), ErrorKind::Decode);
    }
}
