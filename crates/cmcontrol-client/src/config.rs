use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use cmcontrol::rules::BusinessRules;

use crate::error::{Error, ErrorKind, Result};

// Default broker port for plain connections.
const DEFAULT_BROKER_PORT: u16 = 1883;
// Time allowed to the broker to acknowledge a connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
// Keep alive time to send `pingreq` to broker when the connection is idle.
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);
// Time a request waits for its response when no timeout is given.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
// A token is renewed this long before it expires.
const DEFAULT_TOKEN_RENEWAL_MARGIN: Duration = Duration::from_secs(600);

/// A user and password pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub(crate) user: String,
    pub(crate) password: String,
}

impl Credentials {
    /// Creates [`Credentials`].
    #[must_use]
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Returns the user.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    pub(crate) fn is_complete(&self) -> bool {
        !self.user.is_empty() && !self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Encryption settings of the broker connection.
///
/// Certificates and keys are read from `PEM` files when connecting.
/// Without a certificate authority, the platform roots are trusted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerTls {
    pub(crate) ca_certs: Option<PathBuf>,
    pub(crate) client_auth: Option<(PathBuf, PathBuf)>,
}

impl BrokerTls {
    /// Creates [`BrokerTls`] trusting the platform roots.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trusts the certificate authority stored in the given `PEM` file.
    #[must_use]
    pub fn ca_certs(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_certs = Some(path.into());
        self
    }

    /// Authenticates the client with the given certificate and key `PEM`
    /// files.
    #[must_use]
    pub fn client_auth(mut self, certfile: impl Into<PathBuf>, keyfile: impl Into<PathBuf>) -> Self {
        self.client_auth = Some((certfile.into(), keyfile.into()));
        self
    }
}

/// The client configuration.
///
/// Only the device address and the broker host are mandatory. Settings
/// needed by a single operation, like the `REST` credentials required by the
/// login, are validated when that operation runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub(crate) device_address: String,
    pub(crate) broker_host: String,
    pub(crate) broker_port: u16,
    pub(crate) mqtt_credentials: Option<Credentials>,
    pub(crate) api_credentials: Option<Credentials>,
    pub(crate) tls: Option<BrokerTls>,
    pub(crate) connect_timeout: Duration,
    pub(crate) keep_alive: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) token_renewal_margin: Duration,
    pub(crate) business_rules: BusinessRules,
}

impl Config {
    /// Creates a [`Config`] for the given device address and broker host.
    #[must_use]
    pub fn new(device_address: impl Into<String>, broker_host: impl Into<String>) -> Self {
        Self {
            device_address: device_address.into(),
            broker_host: broker_host.into(),
            broker_port: DEFAULT_BROKER_PORT,
            mqtt_credentials: None,
            api_credentials: None,
            tls: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keep_alive: DEFAULT_KEEP_ALIVE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            token_renewal_margin: DEFAULT_TOKEN_RENEWAL_MARGIN,
            business_rules: BusinessRules::default(),
        }
    }

    /// Reads a [`Config`] from the environment.
    ///
    /// Each setting is read from a variable named after `prefix`:
    ///
    /// | Variable                         | Setting              |
    /// |----------------------------------|----------------------|
    /// | `<prefix>DEVICE_ADDR`            | device address       |
    /// | `<prefix>BROKER_HOST`            | broker host          |
    /// | `<prefix>BROKER_PORT`            | broker port          |
    /// | `<prefix>MQTT_USER`/`MQTT_PASS`  | broker credentials   |
    /// | `<prefix>API_USER`/`API_PASS`    | `REST` credentials   |
    /// | `<prefix>CONNECT_TIMEOUT_S`      | connect timeout      |
    /// | `<prefix>TOKEN_RENEW_MARGIN_S`   | token renewal margin |
    ///
    /// # Errors
    ///
    /// Fails when the device address or the broker host are missing, or when
    /// a numeric setting is malformed.
    pub fn from_env(prefix: &str) -> Result<Self> {
        Self::from_lookup(prefix, |name| std::env::var(name).ok())
    }

    /// Reads a [`Config`] from a `.env` file and the environment.
    ///
    /// Variables are named as in [`Config::from_env`]. A variable already set
    /// in the environment takes precedence over the file. The environment of
    /// the process is left untouched.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or parsed, or as
    /// [`Config::from_env`].
    pub fn from_env_file(path: impl AsRef<Path>, prefix: &str) -> Result<Self> {
        let file = read_env_file(path.as_ref())?;
        Self::from_lookup(prefix, |name| {
            std::env::var(name).ok().or_else(|| file.get(name).cloned())
        })
    }

    pub(crate) fn from_lookup<F>(prefix: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |name: &str| {
            lookup(&format!("{prefix}{name}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let required = |name: &str| {
            optional(name).ok_or_else(|| {
                Error::new(
                    ErrorKind::Configuration,
                    format!("Missing environment variable `{prefix}{name}`"),
                )
            })
        };

        let number = |name: &str| -> Result<Option<u64>> {
            optional(name).map(|value| parse(prefix, name, &value)).transpose()
        };

        let mut config = Self::new(required("DEVICE_ADDR")?, required("BROKER_HOST")?);

        if let Some(value) = optional("BROKER_PORT") {
            config.broker_port = parse(prefix, "BROKER_PORT", &value)?;
        }

        if let Some(user) = optional("MQTT_USER") {
            config.mqtt_credentials = Some(Credentials::new(
                user,
                optional("MQTT_PASS").unwrap_or_default(),
            ));
        }

        if let Some(user) = optional("API_USER") {
            config.api_credentials = Some(Credentials::new(
                user,
                optional("API_PASS").unwrap_or_default(),
            ));
        }

        if let Some(seconds) = number("CONNECT_TIMEOUT_S")? {
            config.connect_timeout = Duration::from_secs(seconds);
        }

        if let Some(seconds) = number("TOKEN_RENEW_MARGIN_S")? {
            config.token_renewal_margin = Duration::from_secs(seconds);
        }

        Ok(config)
    }

    /// Sets the broker port.
    #[must_use]
    pub fn broker_port(mut self, port: u16) -> Self {
        self.broker_port = port;
        self
    }

    /// Sets the broker credentials.
    #[must_use]
    pub fn mqtt_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.mqtt_credentials = Some(Credentials::new(user, password));
        self
    }

    /// Sets the `REST` credentials used by the `OAuth2` login.
    #[must_use]
    pub fn api_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.api_credentials = Some(Credentials::new(user, password));
        self
    }

    /// Encrypts the broker connection.
    #[must_use]
    pub fn tls(mut self, tls: BrokerTls) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Sets the time allowed to the broker to acknowledge a connection.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the keep alive interval of the broker connection.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Sets the time a request waits for its response when no timeout is
    /// given.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets how long before its expiry a token is renewed.
    ///
    /// The margin is truncated to whole seconds.
    #[must_use]
    pub fn token_renewal_margin(mut self, margin: Duration) -> Self {
        self.token_renewal_margin = Duration::from_secs(margin.as_secs());
        self
    }

    /// Sets the [`BusinessRules`] applied to submission responses.
    #[must_use]
    pub fn business_rules(mut self, rules: BusinessRules) -> Self {
        self.business_rules = rules;
        self
    }

    /// Returns the device address.
    #[must_use]
    pub fn device_address(&self) -> &str {
        &self.device_address
    }

    /// Returns the broker host and port.
    #[must_use]
    pub fn broker(&self) -> (&str, u16) {
        (&self.broker_host, self.broker_port)
    }

    pub(crate) fn login_credentials(&self) -> Result<&Credentials> {
        self.api_credentials
            .as_ref()
            .filter(|credentials| credentials.is_complete())
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::Configuration,
                    "The REST user and password are required by the OAuth2 login",
                )
            })
    }
}

fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let invalid = |e: dotenvy::Error| {
        Error::new(
            ErrorKind::Configuration,
            format!("Unable to load `{}`: {e}", path.display()),
        )
    };

    dotenvy::from_path_iter(path)
        .map_err(invalid)?
        .map(|item| item.map_err(invalid))
        .collect()
}

fn parse<T: FromStr>(prefix: &str, name: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        Error::new(
            ErrorKind::Configuration,
            format!("Malformed value `{value}` for `{prefix}{name}`"),
        )
    })
}
