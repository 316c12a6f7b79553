use alloc::format;
use alloc::string::{String, ToString};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use serde::Serialize;
use serde_json::Value;

/// Token lifetime assumed when a login response carries no usable
/// `expires_in` value.
pub const DEFAULT_EXPIRES_IN: u64 = 3600;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Builds a `Basic` authorization header value from a user and a password.
#[must_use]
pub fn basic_authorization(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
}

/// Builds a `Bearer` authorization header value from an access token.
#[must_use]
pub fn bearer_authorization(token: &str) -> String {
    format!("Bearer {token}")
}

/// `HTTP` methods accepted by the `MQTT+REST` tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// `GET` method.
    Get,
    /// `POST` method.
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
struct Headers {
    #[serde(rename = "Authorization")]
    authorization: String,
    #[serde(
        rename = "Content-Type",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
struct RequestLine {
    headers: Headers,
    #[serde(rename = "type")]
    method: Method,
}

/// A `REST` request tunneled through the broker.
///
/// Its wire shape is
/// `{"request": {"headers": {...}, "type": "GET" | "POST"}, "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct RestRequest {
    request: RequestLine,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl RestRequest {
    /// Creates the login request from a `Basic` authorization value.
    #[must_use]
    pub fn login(basic: String) -> Self {
        Self::get(basic)
    }

    /// Creates the logout request for the given access token.
    #[must_use]
    pub fn logout(token: &str) -> Self {
        Self::authorized_get(token)
    }

    /// Creates a `GET` request authorized by the given access token.
    #[must_use]
    pub fn authorized_get(token: &str) -> Self {
        Self::get(bearer_authorization(token))
    }

    /// Creates a `POST` request carrying `data`, authorized by the given
    /// access token.
    ///
    /// # Errors
    ///
    /// Fails when `data` cannot be represented as `JSON`.
    pub fn post<T: Serialize>(token: &str, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            request: RequestLine {
                headers: Headers {
                    authorization: bearer_authorization(token),
                    content_type: Some(FORM_URLENCODED.into()),
                },
                method: Method::Post,
            },
            data: Some(serde_json::to_value(data)?),
        })
    }

    /// Returns the request method.
    #[must_use]
    pub const fn method(&self) -> Method {
        self.request.method
    }

    fn get(authorization: String) -> Self {
        Self {
            request: RequestLine {
                headers: Headers {
                    authorization,
                    content_type: None,
                },
                method: Method::Get,
            },
            data: None,
        }
    }
}

/// Returns the trimmed `status` of a response envelope.
///
/// Both strings and numbers are accepted. A missing or `null` status
/// returns `None`.
#[must_use]
pub fn status(response: &Value) -> Option<String> {
    match response.get("status")? {
        Value::Null => None,
        Value::String(status) => Some(status.trim().into()),
        other => Some(other.to_string()),
    }
}

/// Returns the trimmed `log` of a response envelope, falling back to its
/// `message`.
#[must_use]
pub fn log(response: &Value) -> String {
    ["log", "message"]
        .into_iter()
        .filter_map(|key| response.get(key))
        .find_map(|value| match value {
            Value::Null => None,
            Value::String(text) if text.trim().is_empty() => None,
            Value::String(text) => Some(text.trim().into()),
            other => Some(other.to_string()),
        })
        .unwrap_or_default()
}

/// Returns the non-empty `access_token` of a login response.
#[must_use]
pub fn access_token(response: &Value) -> Option<&str> {
    response
        .get("access_token")?
        .as_str()
        .filter(|token| !token.is_empty())
}

/// Returns the token lifetime in whole seconds announced by a login
/// response.
///
/// Integers, floats and numeric strings are accepted, negative values clamp
/// to zero. Any other value falls back to [`DEFAULT_EXPIRES_IN`].
#[must_use]
pub fn expires_in(response: &Value) -> u64 {
    let seconds = match response.get("expires_in") {
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|seconds| seconds as i64)),
        Some(Value::String(text)) => text.trim().parse::<i64>().ok(),
        _ => None,
    };

    seconds.map_or(DEFAULT_EXPIRES_IN, |seconds| seconds.max(0) as u64)
}
