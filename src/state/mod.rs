// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Last-known device state.
//!
//! The [`StateStore`] holds the power state the daemon last observed. It starts
//! out unknown and is only ever overwritten as a whole.
//!
//! # Examples
//!
//! ```
//! use plugd::state::StateStore;
//! use plugd::types::PowerState;
//!
//! let store = StateStore::new();
//! assert_eq!(store.get(), None);
//!
//! store.set(Some(PowerState::On));
//! assert_eq!(store.get(), Some(PowerState::On));
//! ```

mod store;

pub use store::StateStore;
