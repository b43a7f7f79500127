// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The plug controller.
//!
//! [`Plug`] ties the device session, the state store and the auto-off timer
//! together. Every power observation, whatever its source, goes through one
//! place that updates the store and re-evaluates the timer:
//!
//! | source                     | path                                  |
//! |----------------------------|---------------------------------------|
//! | initial query after connect| session sink -> `record_power`        |
//! | device push event          | session sink -> `record_power`        |
//! | `GET /status` query        | [`Plug::status`] -> `record_power`    |
//! | `POST /switch`             | [`Plug::switch`] -> `record_power`    |
//! | auto-off timer             | [`Plug::switch`] -> `record_power`    |
//!
//! # Examples
//!
//! ```
//! use plugd::config::{DeviceConfig, SessionConfig};
//! use plugd::protocol::SimulatedTransport;
//! use plugd::types::PowerState;
//! use plugd::Plug;
//!
//! # async fn example() -> plugd::Result<()> {
//! let device = DeviceConfig::new("bf01", "0123456789abcdef")?;
//! let plug = Plug::new(SimulatedTransport::new(), device, SessionConfig::default())?;
//!
//! plug.switch(PowerState::On).await?;
//! assert!(plug.timer().is_armed());
//!
//! plug.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::{DeviceConfig, SessionConfig};
use crate::error::{Error, Result};
use crate::protocol::DeviceTransport;
use crate::session::{DeviceSession, PowerSink, SessionSnapshot};
use crate::state::StateStore;
use crate::timer::AutoOffTimer;
use crate::types::PowerState;

struct PlugInner<T: DeviceTransport> {
    session: Arc<DeviceSession<T>>,
    store: StateStore,
    timer: AutoOffTimer,
    auto_off_delay: Duration,
    record: Mutex<()>,
    shut_down: AtomicBool,
    this: Weak<Self>,
}

/// Controller for a single smart plug.
///
/// Cloning is cheap; clones share the same session, store and timer.
pub struct Plug<T: DeviceTransport> {
    inner: Arc<PlugInner<T>>,
}

impl<T: DeviceTransport> Clone for Plug<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: DeviceTransport> std::fmt::Debug for Plug<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plug")
            .field("device", self.inner.session.device())
            .field("power", &self.inner.store.get())
            .field("auto_off_armed", &self.inner.timer.is_armed())
            .finish_non_exhaustive()
    }
}

impl<T: DeviceTransport> Plug<T> {
    /// Creates a controller for the device behind `transport`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the session configuration is invalid.
    pub fn new(transport: T, device: DeviceConfig, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let auto_off_delay = config.auto_off_delay;

        let inner = Arc::new_cyclic(|this: &Weak<PlugInner<T>>| {
            let observer = this.clone();
            let sink: PowerSink = Arc::new(move |power| {
                if let Some(inner) = observer.upgrade() {
                    inner.record_power(power);
                }
            });

            PlugInner {
                session: DeviceSession::new(transport, device, config, sink),
                store: StateStore::new(),
                timer: AutoOffTimer::new(),
                auto_off_delay,
                record: Mutex::new(()),
                shut_down: AtomicBool::new(false),
                this: this.clone(),
            }
        });

        Ok(Self { inner })
    }

    /// Connects to the device if needed.
    ///
    /// # Errors
    ///
    /// Returns the connection failure.
    pub async fn connect(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.session.ensure_connected().await
    }

    /// Returns the power state, querying the device when it is unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if connecting or querying fails.
    pub async fn status(&self) -> Result<PowerState> {
        self.inner.ensure_open()?;
        self.inner.session.ensure_connected().await?;

        if let Some(power) = self.inner.store.get() {
            return Ok(power);
        }

        let power = self.inner.session.query_power().await?;
        self.inner.record_power(power);
        Ok(power)
    }

    /// Switches the plug and returns the acknowledged state.
    ///
    /// The store is only updated once the device accepted the command.
    ///
    /// # Errors
    ///
    /// Returns an error if connecting or switching fails.
    pub async fn switch(&self, desired: PowerState) -> Result<PowerState> {
        self.inner.switch(desired).await
    }

    /// Cancels the auto-off timer and disconnects. Runs at most once.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already performed");
            return;
        }

        if self.inner.timer.disarm() {
            info!("Cancelled pending auto-off timer");
        }
        self.inner.session.close().await;
    }

    /// Returns the last-known power state without contacting the device.
    #[must_use]
    pub fn current(&self) -> Option<PowerState> {
        self.inner.store.get()
    }

    /// Subscribes to power state assignments.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Option<PowerState>> {
        self.inner.store.watch()
    }

    /// Returns the auto-off timer.
    #[must_use]
    pub fn timer(&self) -> &AutoOffTimer {
        &self.inner.timer
    }

    /// Returns the device session.
    #[must_use]
    pub fn session(&self) -> &DeviceSession<T> {
        &self.inner.session
    }

    /// Returns the session status and last error.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.session.snapshot()
    }

    /// Records an observed power state.
    pub fn record_power(&self, power: PowerState) {
        self.inner.record_power(power);
    }
}

impl<T: DeviceTransport> PlugInner<T> {
    fn ensure_open(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    async fn switch(&self, desired: PowerState) -> Result<PowerState> {
        self.ensure_open()?;
        self.session.ensure_connected().await?;

        let acknowledged = self.session.set_power(desired).await?;
        info!(requested = %desired, acknowledged = %acknowledged, "Switched plug");
        self.record_power(acknowledged);
        Ok(acknowledged)
    }

    fn record_power(&self, power: PowerState) {
        let _record = self.record.lock();

        let previous = self.store.get();
        self.store.set(Some(power));
        if previous != Some(power) {
            debug!(?previous, current = %power, "Power state changed");
        }

        match power {
            PowerState::On if !self.shut_down.load(Ordering::SeqCst) => {
                let plug = self.this.clone();
                self.timer
                    .arm(self.auto_off_delay, move || auto_off(plug.clone()));
            }
            PowerState::On => {}
            PowerState::Off => {
                self.timer.disarm();
            }
        }
    }
}

fn auto_off<T: DeviceTransport>(plug: Weak<PlugInner<T>>) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let Some(plug) = plug.upgrade() else {
            return Ok(());
        };
        plug.switch(PowerState::Off).await.map(drop)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SimulatedTransport;

    fn plug(transport: SimulatedTransport, auto_off: Duration) -> Plug<SimulatedTransport> {
        let device = DeviceConfig::new("bf01", "Q~]w6H7u=H=aVXQV").unwrap();
        let config = SessionConfig::default().with_auto_off_delay(auto_off);
        Plug::new(transport, device, config).unwrap()
    }

    #[test]
    fn rejects_invalid_config() {
        let device = DeviceConfig::new("bf01", "Q~]w6H7u=H=aVXQV").unwrap();
        let config = SessionConfig::default().with_operation_timeout(Duration::ZERO);
        assert!(matches!(
            Plug::new(SimulatedTransport::new(), device, config),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn record_power_drives_timer() {
        let plug = plug(SimulatedTransport::new(), Duration::from_secs(60));

        plug.record_power(PowerState::On);
        assert!(plug.timer().is_armed());
        assert_eq!(plug.current(), Some(PowerState::On));

        plug.record_power(PowerState::Off);
        assert!(!plug.timer().is_armed());
        assert_eq!(plug.timer().cancellations(), 1);
    }

    #[tokio::test]
    async fn status_uses_store_after_connect() {
        let transport = SimulatedTransport::new().with_power(PowerState::On);
        let plug = plug(transport.clone(), Duration::from_secs(60));

        assert_eq!(plug.status().await.unwrap(), PowerState::On);
        assert_eq!(plug.status().await.unwrap(), PowerState::On);
        // Only the initial query after connecting reached the device
        assert_eq!(transport.get_calls(), 1);
    }

    #[tokio::test]
    async fn failed_switch_leaves_store_untouched() {
        let transport = SimulatedTransport::new();
        let plug = plug(transport.clone(), Duration::from_secs(60));
        plug.connect().await.unwrap();

        transport.fail_next_sets(1);
        assert!(plug.switch(PowerState::On).await.is_err());
        assert_eq!(plug.current(), Some(PowerState::Off));
        assert!(!plug.timer().is_armed());
    }

    #[tokio::test]
    async fn shutdown_runs_once() {
        let transport = SimulatedTransport::new();
        let plug = plug(transport.clone(), Duration::from_secs(60));
        plug.switch(PowerState::On).await.unwrap();

        plug.shutdown().await;
        plug.shutdown().await;

        assert!(!plug.timer().is_armed());
        assert_eq!(transport.disconnect_calls(), 1);
        assert!(matches!(
            plug.switch(PowerState::Off).await,
            Err(Error::ShuttingDown)
        ));
    }
}
