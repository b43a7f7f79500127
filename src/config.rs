// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration types for the device session, auto-off timer and discovery.
//!
//! Values are validated when they are built so that a misconfigured daemon
//! fails at startup instead of on the first request.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use plugd::config::{DeviceConfig, SessionConfig};
//! use plugd::types::ProtocolVersion;
//!
//! let device = DeviceConfig::new("bf1234567890abcdef", "0123456789abcdef")?
//!     .with_ip("192.168.1.40".parse().unwrap())
//!     .with_version(ProtocolVersion::V33);
//!
//! let session = SessionConfig::new()
//!     .with_operation_timeout(Duration::from_secs(3))
//!     .with_auto_off_delay(Duration::from_secs(600));
//! # Ok::<(), plugd::error::ConfigError>(())
//! ```

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::types::{Dps, ProtocolVersion};

/// Length of a device local key.
pub const LOCAL_KEY_LEN: usize = 16;

/// Identity and credentials of the controlled device.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    id: String,
    local_key: String,
    ip: Option<IpAddr>,
    version: ProtocolVersion,
    power_dps: Dps,
}

impl DeviceConfig {
    /// Creates a device configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingField` if the id or key is empty, and
    /// `ConfigError::InvalidKey` if the key is not 16 characters long.
    pub fn new(id: impl Into<String>, local_key: impl Into<String>) -> Result<Self, ConfigError> {
        let id = id.into().trim().to_string();
        let local_key = local_key.into();

        if id.is_empty() {
            return Err(ConfigError::MissingField("device id"));
        }
        if local_key.is_empty() {
            return Err(ConfigError::MissingField("local key"));
        }
        let key_len = local_key.chars().count();
        if key_len != LOCAL_KEY_LEN {
            return Err(ConfigError::InvalidKey {
                expected: LOCAL_KEY_LEN,
                actual: key_len,
            });
        }

        Ok(Self {
            id,
            local_key,
            ip: None,
            version: ProtocolVersion::default(),
            power_dps: Dps::default(),
        })
    }

    /// Pins the device to a static IP address, skipping LAN lookup.
    #[must_use]
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    /// Sets the protocol version.
    #[must_use]
    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }

    /// Sets the data point that carries the power switch.
    #[must_use]
    pub fn with_power_dps(mut self, dps: Dps) -> Self {
        self.power_dps = dps;
        self
    }

    /// Returns the device id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the local key.
    #[must_use]
    pub fn local_key(&self) -> &str {
        &self.local_key
    }

    /// Returns the static IP, if configured.
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    /// Returns the protocol version.
    #[must_use]
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Returns the power data point.
    #[must_use]
    pub fn power_dps(&self) -> Dps {
        self.power_dps
    }
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("id", &self.id)
            .field("local_key", &"<redacted>")
            .field("ip", &self.ip)
            .field("version", &self.version)
            .field("power_dps", &self.power_dps)
            .finish()
    }
}

/// Timing configuration for the device session and the auto-off timer.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Deadline applied to every device operation.
    pub operation_timeout: Duration,
    /// How long the plug may stay on before it is switched off.
    pub auto_off_delay: Duration,
    /// Reconnection behaviour after an unsolicited disconnect.
    pub reconnection: ReconnectionPolicy,
}

impl SessionConfig {
    /// Default deadline for a single device operation.
    pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);
    /// Default auto-off delay.
    pub const DEFAULT_AUTO_OFF_DELAY: Duration = Duration::from_secs(30 * 60);

    /// Creates a session configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the operation timeout.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Sets the auto-off delay.
    #[must_use]
    pub fn with_auto_off_delay(mut self, delay: Duration) -> Self {
        self.auto_off_delay = delay;
        self
    }

    /// Sets the reconnection policy.
    #[must_use]
    pub fn with_reconnection(mut self, policy: ReconnectionPolicy) -> Self {
        self.reconnection = policy;
        self
    }

    /// Checks that all durations are usable.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for a zero timeout or auto-off delay.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.operation_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "operation timeout",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.auto_off_delay.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "auto-off delay",
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Self::DEFAULT_OPERATION_TIMEOUT,
            auto_off_delay: Self::DEFAULT_AUTO_OFF_DELAY,
            reconnection: ReconnectionPolicy::default(),
        }
    }
}

/// Configuration for automatic reconnection.
///
/// The default schedules a single attempt five seconds after the device drops
/// the connection. Later attempts happen lazily on the next request.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use plugd::config::ReconnectionPolicy;
///
/// // Default policy (one attempt after 5 seconds)
/// let policy = ReconnectionPolicy::default();
/// assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(5));
///
/// // Keep trying with exponential backoff
/// let policy = ReconnectionPolicy::new()
///     .with_infinite_retries()
///     .with_backoff_multiplier(2.0)
///     .with_max_delay(Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectionPolicy {
    /// Whether automatic reconnection is enabled.
    pub enabled: bool,
    /// Maximum number of attempts before giving up (None = infinite).
    pub max_retries: Option<u32>,
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_multiplier: f32,
}

impl ReconnectionPolicy {
    /// Creates a new reconnection policy with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a disabled reconnection policy.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Sets the maximum number of attempts.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Keeps retrying until the device comes back.
    #[must_use]
    pub fn with_infinite_retries(mut self) -> Self {
        self.max_retries = None;
        self
    }

    /// Sets the delay before the first attempt.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay between attempts.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f32) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay before a given attempt (0-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self
            .backoff_multiplier
            .powi(i32::try_from(attempt).unwrap_or(i32::MAX));

        // Delays are seconds to minutes, far from f32 precision limits
        #[allow(clippy::cast_precision_loss)]
        let delay_ms = self.initial_delay.as_millis() as f32 * multiplier;

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay = Duration::from_millis(delay_ms as u64);

        delay.min(self.max_delay)
    }

    /// Returns true if another attempt should be made.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.enabled && self.max_retries.is_none_or(|max| attempt < max)
    }
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: Some(1),
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 1.0,
        }
    }
}

/// Configuration for the UDP discovery responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// UDP port the responder listens on.
    pub port: u16,
    /// Token a probe must contain to be answered.
    pub marker: String,
}

impl DiscoveryConfig {
    /// Default UDP port.
    pub const DEFAULT_PORT: u16 = 41234;
    /// Default probe marker.
    pub const DEFAULT_MARKER: &'static str = "PLUGD_DISCOVER";

    /// Creates a discovery configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if the marker is empty, since an
    /// empty marker would match every datagram.
    pub fn new(port: u16, marker: impl Into<String>) -> Result<Self, ConfigError> {
        let marker = marker.into();
        if marker.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "discovery marker",
                message: "must not be empty".to_string(),
            });
        }
        Ok(Self { port, marker })
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: Self::DEFAULT_PORT,
            marker: Self::DEFAULT_MARKER.to_string(),
        }
    }
}
