//! Connection configuration.
//!
//! DESIGN
//! ======
//! `Configuration` is a plain value assembled with builder methods or from
//! environment variables. It is validated once, when a `Connection` is
//! constructed; after that only the endpoint can change (discovery results
//! overwrite it), and that copy lives on the connection, not here.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use frames::{CodecError, Credentials, DEFAULT_MAX_FRAME_LENGTH};

use crate::discovery::EndpointDiscoverer;
use crate::socket::{Dialer, TcpDialer};

pub const DEFAULT_RECONNECTION_DELAY_MS: u64 = 10_000;
pub const DEFAULT_MAX_RECONNECTS: u32 = 10;
pub const DEFAULT_MAX_OPERATION_RETRIES: u32 = 10;
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 7_000;

// =============================================================================
// ENDPOINT
// =============================================================================

/// Address and port of a serving node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    #[must_use]
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self { address: address.into(), port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("the address cannot be an empty string")]
    EmptyAddress,
    #[error("the port cannot be 0")]
    InvalidPort,
    #[error("invalid credentials: {0}")]
    Credentials(#[from] CodecError),
    /// An environment variable was set but could not be parsed.
    #[error("invalid value {value:?} for {key}")]
    InvalidSetting { key: &'static str, value: String },
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Settings for a single logical connection.
#[derive(Clone)]
pub struct Configuration {
    /// Target node address. Ignored when a discoverer is configured.
    pub address: String,
    /// Target node port. Ignored when a discoverer is configured.
    pub port: u16,
    /// Login sent with authenticated frames; empty means anonymous.
    pub login: String,
    pub password: String,
    /// Wait between failed dial attempts.
    pub reconnection_delay: Duration,
    /// Total dial attempts per connect cycle, including the first.
    pub max_reconnects: u32,
    /// Retry budget for operation builders. This layer does not retry operations.
    pub max_operation_retries: u32,
    /// Deadline applied by `Connection::request`.
    pub operation_timeout: Duration,
    /// Largest frame body accepted or sent.
    pub max_frame_length: usize,
    pub discoverer: Option<Arc<dyn EndpointDiscoverer>>,
    pub dialer: Arc<dyn Dialer>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 0,
            login: String::new(),
            password: String::new(),
            reconnection_delay: Duration::from_millis(DEFAULT_RECONNECTION_DELAY_MS),
            max_reconnects: DEFAULT_MAX_RECONNECTS,
            max_operation_retries: DEFAULT_MAX_OPERATION_RETRIES,
            operation_timeout: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            discoverer: None,
            dialer: Arc::new(TcpDialer),
        }
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("login", &self.login)
            .field("reconnection_delay", &self.reconnection_delay)
            .field("max_reconnects", &self.max_reconnects)
            .field("max_operation_retries", &self.max_operation_retries)
            .field("operation_timeout", &self.operation_timeout)
            .field("max_frame_length", &self.max_frame_length)
            .field("discoverer", &self.discoverer.is_some())
            .finish_non_exhaustive()
    }
}

impl Configuration {
    /// Configuration for a single node at a fixed endpoint.
    #[must_use]
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self { address: address.into(), port, ..Self::default() }
    }

    /// Configuration that resolves its endpoint through `discoverer`.
    #[must_use]
    pub fn discovered(discoverer: Arc<dyn EndpointDiscoverer>) -> Self {
        Self { discoverer: Some(discoverer), ..Self::default() }
    }

    /// Build configuration from environment variables.
    ///
    /// - `EVENTSTORE_ADDRESS`, `EVENTSTORE_PORT`
    /// - `EVENTSTORE_LOGIN`, `EVENTSTORE_PASSWORD`
    /// - `EVENTSTORE_RECONNECTION_DELAY_MS`: default 10000
    /// - `EVENTSTORE_MAX_RECONNECTS`: default 10
    /// - `EVENTSTORE_MAX_OPERATION_RETRIES`: default 10
    /// - `EVENTSTORE_OPERATION_TIMEOUT_MS`: default 7000
    ///
    /// Unset or blank variables take their defaults; the remaining checks
    /// happen when the connection is constructed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSetting` for a numeric variable that does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let delay_ms = setting(&lookup, "EVENTSTORE_RECONNECTION_DELAY_MS", DEFAULT_RECONNECTION_DELAY_MS)?;
        let timeout_ms = setting(&lookup, "EVENTSTORE_OPERATION_TIMEOUT_MS", DEFAULT_OPERATION_TIMEOUT_MS)?;

        Ok(Self {
            address: lookup("EVENTSTORE_ADDRESS").unwrap_or_default(),
            port: setting(&lookup, "EVENTSTORE_PORT", 0)?,
            login: lookup("EVENTSTORE_LOGIN").unwrap_or_default(),
            password: lookup("EVENTSTORE_PASSWORD").unwrap_or_default(),
            reconnection_delay: Duration::from_millis(delay_ms),
            max_reconnects: setting(&lookup, "EVENTSTORE_MAX_RECONNECTS", DEFAULT_MAX_RECONNECTS)?,
            max_operation_retries: setting(&lookup, "EVENTSTORE_MAX_OPERATION_RETRIES", DEFAULT_MAX_OPERATION_RETRIES)?,
            operation_timeout: Duration::from_millis(timeout_ms),
            ..Self::default()
        })
    }

    /// The statically configured endpoint.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.address.clone(), self.port)
    }

    /// Check the settings and build the wire credentials.
    ///
    /// # Errors
    ///
    /// Without a discoverer the address must be non-empty and the port
    /// non-zero. Login and password must each fit in 255 bytes.
    pub fn validate(&self) -> Result<Option<Credentials>, ConfigError> {
        if self.discoverer.is_none() {
            if self.address.is_empty() {
                return Err(ConfigError::EmptyAddress);
            }
            if self.port == 0 {
                return Err(ConfigError::InvalidPort);
            }
        }

        if self.login.is_empty() {
            return Ok(None);
        }
        Ok(Some(Credentials::new(self.login.clone(), self.password.clone())?))
    }
}

fn setting<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|_| ConfigError::InvalidSetting { key, value: raw })
        }
        _ => Ok(default),
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

impl Configuration {
    #[must_use]
    pub fn with_credentials(mut self, login: impl Into<String>, password: impl Into<String>) -> Self {
        self.login = login.into();
        self.password = password.into();
        self
    }

    #[must_use]
    pub fn with_reconnection_delay(mut self, delay: Duration) -> Self {
        self.reconnection_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_reconnects(mut self, max_reconnects: u32) -> Self {
        self.max_reconnects = max_reconnects;
        self
    }

    #[must_use]
    pub fn with_max_operation_retries(mut self, retries: u32) -> Self {
        self.max_operation_retries = retries;
        self
    }

    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    #[must_use]
    pub fn with_discoverer(mut self, discoverer: Arc<dyn EndpointDiscoverer>) -> Self {
        self.discoverer = Some(discoverer);
        self
    }

    #[must_use]
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
