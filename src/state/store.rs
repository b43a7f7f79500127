// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory power state store.

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::types::PowerState;

/// Holds the last-known power state.
///
/// `None` means the state is unknown, either because the device was never
/// queried or because nothing has been observed since startup. Every
/// assignment is also published on a [`watch`] channel.
#[derive(Debug)]
pub struct StateStore {
    value: RwLock<Option<PowerState>>,
    changes: watch::Sender<Option<PowerState>>,
}

impl StateStore {
    /// Creates a store with an unknown state.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = watch::channel(None);
        Self {
            value: RwLock::new(None),
            changes,
        }
    }

    /// Returns the last-known state.
    #[must_use]
    pub fn get(&self) -> Option<PowerState> {
        *self.value.read()
    }

    /// Overwrites the state and returns the new value.
    pub fn set(&self, state: Option<PowerState>) -> Option<PowerState> {
        let mut value = self.value.write();
        *value = state;
        self.changes.send_replace(state);
        state
    }

    /// Subscribes to state assignments.
    ///
    /// The receiver sees the current value immediately and is notified on
    /// every later `set`, even when the value did not change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Option<PowerState>> {
        self.changes.subscribe()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}
