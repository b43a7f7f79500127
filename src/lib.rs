// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `plugd` - a local-network control daemon for a single smart plug.
//!
//! The daemon keeps a session open to one plug, exposes its power state over
//! HTTP, answers LAN discovery probes over UDP broadcast and switches the
//! plug off again after a configurable time.
//!
//! # Features
//!
//! - **Connection lifecycle**: find/connect with per-operation timeouts,
//!   single-flight connects and automatic reconnection after a drop
//! - **Auto-off**: every `On` observation (re)starts a safety timer
//! - **HTTP API**: `GET /status` and `POST /switch`
//! - **Discovery**: replies to UDP probes with the host's IPv4 address
//!
//! The device protocol itself lives behind the [`DeviceTransport`] trait. The
//! daemon ships a [`BridgeTransport`] that talks to a sidecar process and a
//! [`SimulatedTransport`] for running without hardware.
//!
//! # Quick Start
//!
//! ```no_run
//! use plugd::config::{DeviceConfig, SessionConfig};
//! use plugd::protocol::{BridgeCommand, BridgeTransport};
//! use plugd::{Plug, PowerState};
//!
//! #[tokio::main]
//! async fn main() -> plugd::Result<()> {
//!     let device = DeviceConfig::new("bf0123456789abcdef", "0123456789abcdef")?;
//!     let bridge = BridgeTransport::new(
//!         BridgeCommand::new("node").with_arg("bridge.js").for_device(&device),
//!     );
//!
//!     let plug = Plug::new(bridge, device, SessionConfig::default())?;
//!     plug.switch(PowerState::On).await?;
//!     println!("plug is {}", plug.status().await?);
//!
//!     plug.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod discovery;
pub mod error;
mod plug;
pub mod protocol;
pub mod session;
pub mod state;
pub mod timer;
pub mod types;

pub use error::{ConfigError, Error, Result, TransportError};
pub use plug::Plug;
pub use protocol::{BridgeTransport, DeviceTransport, SimulatedTransport};
pub use session::{DeviceSession, SessionSnapshot, SessionStatus};
pub use types::{Dps, PowerState, ProtocolVersion};
