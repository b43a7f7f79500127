// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the `plugd` daemon.
//!
//! The hierarchy follows the lifecycle of a request: configuration problems are
//! fatal at startup, transport problems surface at the RPC boundary, and the
//! session turns them into connection, command or timeout failures.

use std::time::Duration;

use thiserror::Error;

/// The main error type for this crate.
///
/// `Error` is `Clone` so that every caller waiting on a shared connection
/// attempt receives the same outcome.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Locating or connecting to the device failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A bounded operation exceeded its deadline.
    #[error("{operation} timed out after {} ms", after.as_millis())]
    Timeout {
        /// The operation that overran (`find`, `connect`, `get`, ...).
        operation: &'static str,
        /// The deadline that was exceeded.
        after: Duration,
    },

    /// A `get` or `set` failed after the connection was established.
    #[error("command failed: {0}")]
    Command(String),

    /// The configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The daemon is shutting down and no longer accepts device operations.
    #[error("daemon is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Returns `true` if this error came from an exceeded deadline.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors raised at the device RPC boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Spawning or talking to the bridge process failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The bridge answered a request with an error.
    #[error("device rejected {method}: {message}")]
    Rpc {
        /// The RPC method that was rejected.
        method: String,
        /// The message reported by the bridge.
        message: String,
    },

    /// The channel to the device closed before a reply arrived.
    #[error("transport closed")]
    Closed,

    /// The bridge sent something that is not valid protocol traffic.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The device is not reachable (used by the simulated transport).
    #[error("device unreachable")]
    Unreachable,
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Errors related to configuration values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required value was not provided.
    #[error("missing required value: {0}")]
    MissingField(&'static str),

    /// The local key does not have the length the device protocol expects.
    #[error("local key must be {expected} characters, got {actual}")]
    InvalidKey {
        /// The expected key length.
        expected: usize,
        /// The length that was provided.
        actual: usize,
    },

    /// An unknown protocol version was requested.
    #[error("unsupported protocol version: {0}")]
    InvalidVersion(String),

    /// A numeric or textual setting is out of its allowed range.
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        /// The setting that failed validation.
        field: &'static str,
        /// Why the value was rejected.
        message: String,
    },
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
