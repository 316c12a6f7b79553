use std::path::Path;
use std::time::Duration;

use cmcontrol::document::{Apontamento, Evidence, Serial, Setup, TransportOrder, VALIDAR_ROTA};
use cmcontrol::envelope::RestRequest;
use cmcontrol::topics::SETUP_APONTAMENTO;

use serde_json::Value;

use tracing::{info, warn};

use crate::client::Client;
use crate::error::{Error, ErrorKind, Result};
use crate::transport::Transport;

// Pause between two submissions of a batch.
const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(200);

/// Options of [`Client::apontar_lote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    timeout: Option<Duration>,
    delay: Duration,
    stop_on_error: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            delay: DEFAULT_BATCH_DELAY,
            stop_on_error: false,
        }
    }
}

impl BatchOptions {
    /// Creates [`BatchOptions`] with a 200 ms pause between submissions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the timeout of each submission.
    #[must_use]
    #[inline]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the pause between two submissions.
    #[must_use]
    #[inline]
    pub const fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Stops the batch at the first failed submission.
    #[must_use]
    #[inline]
    pub const fn stop_on_error(mut self, stop_on_error: bool) -> Self {
        self.stop_on_error = stop_on_error;
        self
    }
}

/// The outcome of a single serial of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    /// The submitted serial.
    pub serial: String,
    /// The response, or the reason of the failure.
    pub result: Result<Value>,
}

/// Reads a file into an [`Evidence`].
///
/// The evidence name and extension are taken from the file name.
///
/// # Errors
///
/// Fails with [`ErrorKind::InvalidArgument`] when the file cannot be read.
pub fn evidence_from_file(path: impl AsRef<Path>) -> Result<Evidence> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|e| {
        Error::new(
            ErrorKind::InvalidArgument,
            format!("Unable to read the evidence `{}`: {e}", path.display()),
        )
    })?;

    let nome = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extensao = path
        .extension()
        .map(|extension| extension.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(Evidence::from_bytes(nome, extensao, &bytes))
}

/// Builds a [`Serial`] from a trimmed code.
///
/// # Errors
///
/// Fails with [`ErrorKind::InvalidArgument`] for an empty or blank code.
pub fn serial_code(serial: &str) -> Result<Serial> {
    let serial = serial.trim();
    if serial.is_empty() {
        return Err(Error::new(ErrorKind::InvalidArgument, "Empty serial"));
    }
    Ok(Serial::new(serial))
}

impl<T: Transport> Client<T> {
    /// Submits a [`Setup`] to the `setup.apontamento` endpoint.
    ///
    /// A valid token is obtained first.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::InvalidArgument`] for a setup without
    /// apontamentos and [`ErrorKind::Apontamento`] when the response is
    /// judged a failure by the business rules.
    pub async fn setup_apontamento(&self, setup: &Setup, timeout: Option<Duration>) -> Result<Value> {
        if setup.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "A setup needs at least one apontamento",
            ));
        }

        let token = self.authorized_token(timeout).await?;
        let request = RestRequest::post(&token, setup)?;

        let response = self.request(SETUP_APONTAMENTO, &request, timeout).await?;
        self.check(ErrorKind::Apontamento, SETUP_APONTAMENTO, &response)?;
        Ok(response)
    }

    /// Points a single serial, with optional evidences.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::InvalidArgument`] for an empty serial, or as
    /// [`Client::setup_apontamento`].
    pub async fn apontar_serial(
        &self,
        serial: &str,
        evidences: impl IntoIterator<Item = Evidence>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let apontamento = Apontamento::serial(serial_code(serial)?).evidences(evidences);
        let setup = Setup::new(self.config().device_address()).apontamento(apontamento);
        self.setup_apontamento(&setup, timeout).await
    }

    /// Validates the route of a serial without pointing it.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::InvalidArgument`] for an empty serial, or as
    /// [`Client::setup_apontamento`].
    pub async fn validar_rota(&self, serial: &str, timeout: Option<Duration>) -> Result<Value> {
        let setup = Setup::new(self.config().device_address())
            .ciclo(VALIDAR_ROTA)
            .apontamento(Apontamento::serial(serial_code(serial)?));
        self.setup_apontamento(&setup, timeout).await
    }

    /// Submits apontamentos bound to a transport order.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::InvalidArgument`] for an empty order code, or
    /// as [`Client::setup_apontamento`].
    pub async fn ordem_transporte(
        &self,
        order: TransportOrder,
        apontamentos: impl IntoIterator<Item = Apontamento>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if order.codigo().trim().is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "Empty transport order code",
            ));
        }

        let setup = Setup::new(self.config().device_address())
            .ordem_transporte(order)
            .apontamentos(apontamentos);
        self.setup_apontamento(&setup, timeout).await
    }

    /// Points each serial with its own request.
    ///
    /// A failed serial does not stop the batch, unless
    /// [`BatchOptions::stop_on_error`] is set. The batch always stops when
    /// the connection is gone, since no further submission could succeed.
    pub async fn apontar_lote<I, S>(&self, serials: I, options: BatchOptions) -> Vec<BatchItem>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut items = Vec::new();
        let mut serials = serials.into_iter().peekable();

        while let Some(serial) = serials.next() {
            let serial = serial.as_ref().to_string();
            let result = self.apontar_serial(&serial, std::iter::empty::<Evidence>(), options.timeout).await;

            let stop = match &result {
                Ok(_) => false,
                Err(e) => {
                    warn!("Apontamento of `{serial}` failed: {e}");
                    options.stop_on_error
                        || matches!(e.kind(), ErrorKind::NotConnected | ErrorKind::Disconnected)
                }
            };
            items.push(BatchItem { serial, result });

            if stop {
                break;
            }
            if serials.peek().is_some() && !options.delay.is_zero() {
                tokio::time::sleep(options.delay).await;
            }
        }

        info!(
            "Batch completed: {} of {} serials pointed",
            items.iter().filter(|item| item.result.is_ok()).count(),
            items.len()
        );
        items
    }
}
