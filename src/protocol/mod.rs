// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The device RPC boundary.
//!
//! The daemon never speaks the device's wire protocol itself. Everything it
//! needs from the device goes through the [`DeviceTransport`] trait: five
//! request/response operations plus a stream of [`TransportEvent`]s.
//!
//! # Implementations
//!
//! - [`BridgeTransport`]: newline-delimited JSON RPC to a sidecar process that
//!   owns the vendor protocol and encryption
//! - [`SimulatedTransport`]: an in-memory plug for `--simulate` runs and tests

mod bridge;
mod event_bus;
mod simulated;

pub use bridge::{BridgeCommand, BridgeTransport};
pub use event_bus::EventBus;
pub use simulated::SimulatedTransport;

use std::collections::BTreeMap;
use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::TransportError;
use crate::types::Dps;

/// A set of data-point values pushed by the device.
///
/// Keys are DPS indices in their string form, exactly as they appear in the
/// device's JSON payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DpsUpdate(BTreeMap<String, Value>);

impl DpsUpdate {
    /// Creates an empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value for a data point.
    #[must_use]
    pub fn with(mut self, dps: Dps, value: Value) -> Self {
        self.0.insert(dps.key(), value);
        self
    }

    /// Returns the value reported for a data point.
    #[must_use]
    pub fn get(&self, dps: Dps) -> Option<&Value> {
        self.0.get(&dps.key())
    }

    /// Returns `true` if the update carries no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Lifecycle and data events emitted by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The device session was opened.
    Connected,
    /// The device session was closed, by either side.
    Disconnected,
    /// The transport reported an error outside of any request.
    Error(String),
    /// The device pushed new data-point values.
    Data(DpsUpdate),
}

/// The RPC capability a device transport provides.
///
/// Every operation may suspend for a full network round-trip; callers are
/// expected to bound them with their own deadline.
pub trait DeviceTransport: Send + Sync + 'static {
    /// Locates the device on the local network.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the device cannot be found.
    fn find(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Opens a session with the device.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the session cannot be established.
    fn connect(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Reads a data point.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the request fails.
    fn get(&self, dps: Dps) -> impl Future<Output = Result<Value, TransportError>> + Send;

    /// Writes a data point.
    ///
    /// Returns the value the device acknowledged when it echoes one.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the request fails.
    fn set(
        &self,
        dps: Dps,
        value: Value,
    ) -> impl Future<Output = Result<Option<Value>, TransportError>> + Send;

    /// Closes the session. Closing an already closed session succeeds.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the transport fails while closing.
    fn disconnect(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Subscribes to transport events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
