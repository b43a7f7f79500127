// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Value types for device control.
//!
//! # Types
//!
//! - [`PowerState`] - On/Off state of the plug
//! - [`Dps`] - Data-point index addressing a device property
//! - [`ProtocolVersion`] - Local protocol version of the device firmware

mod power;
mod version;

pub use power::{Dps, PowerState};
pub use version::ProtocolVersion;
