use alloc::string::String;
use alloc::vec::Vec;

use serde_json::Value;

use crate::envelope;

const SUCCESS: &str = "200";
const SUCCESS_WITH_REASON: &str = "200 OK";

/// The reasons a response envelope has been judged a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Response status, or `200` for a business failure without status.
    pub status: String,
    /// Response log text.
    pub log: String,
}

/// Rules deciding whether a response envelope reports a failure.
///
/// A status not starting with `200` is always a failure. Some environments
/// answer `200` while the log text reports a business failure, such as
/// `ERRO1: serial not found`. When the rules are strict, these logs are
/// failures too, unless they start with one of the ok prefixes.
///
/// Markers are compared case-insensitively against the trimmed log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessRules {
    strict: bool,
    error_prefixes: Vec<String>,
    error_contains: Vec<String>,
    ok_prefixes: Vec<String>,
}

impl Default for BusinessRules {
    fn default() -> Self {
        Self {
            strict: true,
            error_prefixes: uppercase(["ERRO"]),
            error_contains: uppercase(["FALHA", "NOK"]),
            ok_prefixes: uppercase(["ERRO4"]),
        }
    }
}

impl BusinessRules {
    /// Creates [`BusinessRules`] that only look at the status code.
    #[must_use]
    pub fn status_only() -> Self {
        Self::default().strict(false)
    }

    /// Enables or disables the log inspection of successful responses.
    #[must_use]
    #[inline]
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Replaces the log prefixes marking a business failure.
    #[must_use]
    #[inline]
    pub fn error_prefixes<S: AsRef<str>>(mut self, prefixes: impl IntoIterator<Item = S>) -> Self {
        self.error_prefixes = uppercase(prefixes);
        self
    }

    /// Replaces the log substrings marking a business failure.
    #[must_use]
    #[inline]
    pub fn error_contains<S: AsRef<str>>(mut self, markers: impl IntoIterator<Item = S>) -> Self {
        self.error_contains = uppercase(markers);
        self
    }

    /// Replaces the log prefixes treated as a success even though they
    /// match an error prefix.
    #[must_use]
    #[inline]
    pub fn ok_prefixes<S: AsRef<str>>(mut self, prefixes: impl IntoIterator<Item = S>) -> Self {
        self.ok_prefixes = uppercase(prefixes);
        self
    }

    /// Checks a response envelope.
    ///
    /// # Errors
    ///
    /// Returns a [`Rejection`] when the status is not a success or, for
    /// strict rules, when the log reports a business failure.
    pub fn check(&self, response: &Value) -> Result<(), Rejection> {
        let status = envelope::status(response);
        let log = envelope::log(response);

        if let Some(status) = &status
            && !status.starts_with(SUCCESS)
        {
            return Err(Rejection {
                status: status.clone(),
                log,
            });
        }

        if self.is_business_error(status.as_deref(), &log) {
            return Err(Rejection {
                status: status.unwrap_or_else(|| SUCCESS.into()),
                log,
            });
        }

        Ok(())
    }

    fn is_business_error(&self, status: Option<&str>, log: &str) -> bool {
        if !self.strict {
            return false;
        }

        // Only a response looking successful can hide a business failure.
        if status.is_some_and(|status| status != SUCCESS && status != SUCCESS_WITH_REASON) {
            return false;
        }

        let log = log.trim().to_uppercase();
        if log.is_empty() {
            return false;
        }

        if self.ok_prefixes.iter().any(|prefix| log.starts_with(prefix.as_str())) {
            return false;
        }

        self.error_prefixes
            .iter()
            .any(|prefix| log.starts_with(prefix.as_str()))
            || self
                .error_contains
                .iter()
                .any(|marker| log.contains(marker.as_str()))
    }
}

fn uppercase<S: AsRef<str>>(values: impl IntoIterator<Item = S>) -> Vec<String> {
    values
        .into_iter()
        .map(|value| value.as_ref().trim().to_uppercase())
        .filter(|value| !value.is_empty())
        .collect()
}

impl core::fmt::Display for Rejection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "status {}", self.status)?;
        if !self.log.is_empty() {
            write!(f, ": {}", self.log)?;
        }
        Ok(())
    }
}
