// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Connection lifecycle for the controlled device.
//!
//! A [`DeviceSession`] owns the transport and decides when to find, connect,
//! reconnect and disconnect. Every transport call is raced against the
//! configured operation timeout, so a device that stops answering turns into
//! an [`Error::Timeout`] instead of a request that never completes.
//!
//! # Connection states
//!
//! ```text
//! Disconnected --ensure_connected--> Connecting --ok--> Connected
//!      ^                                 |                  |
//!      +-------------- failure ----------+                  |
//!      +---- disconnect / unsolicited drop / cmd timeout ---+
//! ```
//!
//! Concurrent callers of [`DeviceSession::ensure_connected`] share the
//! in-flight attempt: exactly one `find`/`connect` pair is issued and every
//! caller receives its outcome.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{DeviceConfig, SessionConfig};
use crate::error::{Error, Result, TransportError};
use crate::protocol::{DeviceTransport, TransportEvent};
use crate::types::PowerState;

/// Receives every power state the session observes on its own.
///
/// Called with the initial query result after each successful connect and with
/// every power value the device pushes.
pub type PowerSink = Arc<dyn Fn(PowerState) + Send + Sync>;

/// Connection status of a [`DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    /// No session is open.
    #[default]
    Disconnected,
    /// A find/connect attempt is in flight.
    Connecting,
    /// The session is open.
    Connected,
}

impl SessionStatus {
    /// Returns the lowercase name of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Current connection status.
    pub status: SessionStatus,
    /// Most recent failure, cleared by a successful connect.
    pub last_error: Option<Error>,
}

#[derive(Debug, Default)]
struct SessionState {
    status: SessionStatus,
    last_error: Option<Error>,
    /// The transport may still hold a half-open session.
    stale: bool,
    /// The transport session opened by the last connect is still up.
    transport_open: bool,
    /// A `Disconnected` event seen before this instant may be the echo of our
    /// own release rather than a drop by the device.
    release_echo_until: Option<Instant>,
    attempts: u64,
    last_attempt: Option<Result<()>>,
    reconnecting: bool,
    closed: bool,
}

/// Owns the transport and its connection lifecycle.
pub struct DeviceSession<T: DeviceTransport> {
    transport: T,
    device: DeviceConfig,
    config: SessionConfig,
    sink: PowerSink,
    state: Mutex<SessionState>,
    gate: tokio::sync::Mutex<()>,
    pump_started: AtomicBool,
    this: Weak<Self>,
}

impl<T: DeviceTransport> DeviceSession<T> {
    /// Creates a disconnected session.
    ///
    /// Nothing is sent to the device until the first call to
    /// [`ensure_connected`](Self::ensure_connected).
    pub fn new(
        transport: T,
        device: DeviceConfig,
        config: SessionConfig,
        sink: PowerSink,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            transport,
            device,
            config,
            sink,
            state: Mutex::new(SessionState::default()),
            gate: tokio::sync::Mutex::new(()),
            pump_started: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// Returns the device configuration.
    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }

    /// Returns the current connection status.
    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    /// Returns the status together with the last recorded error.
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        SessionSnapshot {
            status: state.status,
            last_error: state.last_error.clone(),
        }
    }

    /// Makes sure the session is open.
    ///
    /// Does nothing when already connected. Otherwise runs `find` then
    /// `connect`, each bounded by the operation timeout, and on success
    /// queries the power state and reports it to the sink.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` or `Error::Timeout` when the attempt fails,
    /// and `Error::ShuttingDown` after [`close`](Self::close).
    pub async fn ensure_connected(&self) -> Result<()> {
        let seen = {
            let state = self.state.lock();
            if state.closed {
                return Err(Error::ShuttingDown);
            }
            if state.status == SessionStatus::Connected {
                return Ok(());
            }
            state.attempts
        };

        let _gate = self.gate.lock().await;

        {
            let state = self.state.lock();
            if state.closed {
                return Err(Error::ShuttingDown);
            }
            if state.status == SessionStatus::Connected {
                return Ok(());
            }
            if state.attempts != seen {
                // Another caller ran the attempt while we waited for the gate
                return state.last_attempt.clone().unwrap_or(Ok(()));
            }
        }

        self.start_event_pump();

        let outcome = self.open().await;
        {
            let mut state = self.state.lock();
            state.attempts += 1;
            state.last_attempt = Some(outcome.clone());
            match &outcome {
                Ok(()) => {
                    state.status = SessionStatus::Connected;
                    state.stale = false;
                    state.transport_open = true;
                    state.last_error = None;
                }
                Err(e) => {
                    state.status = SessionStatus::Disconnected;
                    state.stale = true;
                    state.last_error = Some(e.clone());
                }
            }
        }

        match &outcome {
            Ok(()) => {
                info!(device_id = %self.device.id(), "Connected to device");
                match self.query_power().await {
                    Ok(power) => (self.sink)(power),
                    Err(e) => warn!(error = %e, "Initial power query failed"),
                }
            }
            Err(e) => warn!(device_id = %self.device.id(), error = %e, "Connecting to device failed"),
        }

        outcome
    }

    async fn open(&self) -> Result<()> {
        let stale = {
            let mut state = self.state.lock();
            state.status = SessionStatus::Connecting;
            std::mem::replace(&mut state.stale, false)
        };

        if stale {
            debug!("Releasing previous transport session");
            self.release().await;
        }

        self.bounded("find", self.transport.find(), Error::Connection)
            .await?;
        self.bounded("connect", self.transport.connect(), Error::Connection)
            .await
    }

    /// Closes the session. Transport errors are logged, never returned.
    pub async fn disconnect(&self) {
        {
            let mut state = self.state.lock();
            state.status = SessionStatus::Disconnected;
            state.stale = false;
        }
        self.release().await;
    }

    /// Closes the session for good. Later connects fail with
    /// `Error::ShuttingDown`.
    pub async fn close(&self) {
        self.state.lock().closed = true;
        self.disconnect().await;
        info!(device_id = %self.device.id(), "Disconnected from device");
    }

    async fn release(&self) {
        {
            let mut state = self.state.lock();
            if std::mem::replace(&mut state.transport_open, false) {
                state.release_echo_until =
                    Some(Instant::now() + self.config.operation_timeout);
            }
        }

        match tokio::time::timeout(self.config.operation_timeout, self.transport.disconnect())
            .await
        {
            Ok(Ok(())) => debug!("Transport disconnected"),
            Ok(Err(e)) => warn!(error = %e, "Disconnect failed"),
            Err(_) => warn!(
                after_ms = self.config.operation_timeout.as_millis(),
                "Disconnect timed out"
            ),
        }
    }

    /// Reads the power state from the device.
    ///
    /// # Errors
    ///
    /// Returns `Error::Command` if the read fails or the device reports a
    /// non-boolean value, and `Error::Timeout` if it overruns.
    pub async fn query_power(&self) -> Result<PowerState> {
        let value = self
            .command("get", self.transport.get(self.device.power_dps()))
            .await?;

        PowerState::from_value(&value).ok_or_else(|| {
            Error::Command(format!("device reported non-boolean power value {value}"))
        })
    }

    /// Switches the relay.
    ///
    /// Returns the state the device acknowledged, or `desired` when the device
    /// does not echo a value.
    ///
    /// # Errors
    ///
    /// Returns `Error::Command` if the write fails and `Error::Timeout` if it
    /// overruns.
    pub async fn set_power(&self, desired: PowerState) -> Result<PowerState> {
        let ack = self
            .command(
                "set",
                self.transport
                    .set(self.device.power_dps(), Value::Bool(desired.is_on())),
            )
            .await?;

        Ok(ack
            .as_ref()
            .and_then(PowerState::from_value)
            .unwrap_or(desired))
    }

    async fn command<V>(
        &self,
        operation: &'static str,
        request: impl Future<Output = std::result::Result<V, TransportError>>,
    ) -> Result<V> {
        if self.state.lock().closed {
            return Err(Error::ShuttingDown);
        }

        let after = self.config.operation_timeout;
        let (err, lost) = match tokio::time::timeout(after, request).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                let closed = matches!(e, TransportError::Closed);
                (Error::Command(e.to_string()), closed)
            }
            Err(_) => (Error::Timeout { operation, after }, true),
        };

        let mut state = self.state.lock();
        state.last_error = Some(err.clone());
        if lost {
            // The next ensure_connected releases whatever is left and reconnects
            state.status = SessionStatus::Disconnected;
            state.stale = true;
            if !err.is_timeout() {
                state.transport_open = false;
            }
        }
        Err(err)
    }

    async fn bounded<V>(
        &self,
        operation: &'static str,
        request: impl Future<Output = std::result::Result<V, TransportError>>,
        wrap: fn(String) -> Error,
    ) -> Result<V> {
        let after = self.config.operation_timeout;
        match tokio::time::timeout(after, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(wrap(e.to_string())),
            Err(_) => Err(Error::Timeout { operation, after }),
        }
    }

    fn start_event_pump(&self) {
        if self.pump_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut events = self.transport.subscribe();
        let session = self.this.clone();

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Device event pump lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(session) = session.upgrade() else {
                    break;
                };
                session.handle_event(event);
            }
            debug!("Device event pump stopped");
        });
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Data(update) => {
                match update
                    .get(self.device.power_dps())
                    .and_then(PowerState::from_value)
                {
                    Some(power) => {
                        debug!(power = %power, "Device reported power state");
                        (self.sink)(power);
                    }
                    None => debug!(?update, "Ignoring data without power state"),
                }
            }
            TransportEvent::Error(message) => {
                warn!(error = %message, "Device reported an error");
                self.state.lock().last_error = Some(Error::Connection(message));
            }
            TransportEvent::Disconnected => {
                {
                    let mut state = self.state.lock();
                    let echo = state
                        .release_echo_until
                        .take()
                        .is_some_and(|until| Instant::now() <= until);
                    if state.closed || state.status != SessionStatus::Connected {
                        state.transport_open = false;
                        debug!("Device disconnected");
                        return;
                    }
                    if echo {
                        debug!("Device session released");
                        return;
                    }
                    state.status = SessionStatus::Disconnected;
                    state.transport_open = false;
                }
                warn!(device_id = %self.device.id(), "Device dropped the connection");
                self.schedule_reconnect();
            }
            TransportEvent::Connected => debug!("Device session opened"),
        }
    }

    fn schedule_reconnect(&self) {
        let policy = self.config.reconnection.clone();
        if !policy.enabled {
            info!("Automatic reconnection disabled, reconnecting on next request");
            return;
        }

        {
            let mut state = self.state.lock();
            if state.reconnecting {
                debug!("Reconnect already scheduled");
                return;
            }
            state.reconnecting = true;
        }

        let session = self.this.clone();
        tokio::spawn(async move {
            let mut attempt = 0;
            while policy.should_retry(attempt) {
                let delay = policy.delay_for_attempt(attempt);
                info!(attempt = attempt + 1, delay_ms = delay.as_millis(), "Scheduling reconnect");
                tokio::time::sleep(delay).await;

                let Some(session) = session.upgrade() else {
                    return;
                };
                match session.ensure_connected().await {
                    Ok(()) => {
                        info!("Reconnected to device");
                        break;
                    }
                    Err(Error::ShuttingDown) => break,
                    Err(e) => warn!(error = %e, attempt = attempt + 1, "Reconnect failed"),
                }
                attempt += 1;
            }

            if let Some(session) = session.upgrade() {
                session.state.lock().reconnecting = false;
            }
        });
    }
}

impl<T: DeviceTransport + fmt::Debug> fmt::Debug for DeviceSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("transport", &self.transport)
            .field("device", &self.device)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DpsUpdate, SimulatedTransport};
    use crate::types::Dps;
    use std::time::Duration;

    fn session(
        transport: SimulatedTransport,
    ) -> (Arc<DeviceSession<SimulatedTransport>>, Arc<Mutex<Vec<PowerState>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let device = DeviceConfig::new("bf01", "Q~]w6H7u=H=aVXQV").unwrap();
        let session = DeviceSession::new(
            transport,
            device,
            SessionConfig::default(),
            Arc::new(move |power| sink_seen.lock().push(power)),
        );
        (session, seen)
    }

    #[tokio::test]
    async fn connect_reports_initial_state() {
        let plug = SimulatedTransport::new().with_power(PowerState::On);
        let (session, seen) = session(plug.clone());

        session.ensure_connected().await.unwrap();

        assert_eq!(session.status(), SessionStatus::Connected);
        assert_eq!(*seen.lock(), vec![PowerState::On]);
        assert_eq!(plug.find_calls(), 1);
        assert_eq!(plug.connect_calls(), 1);
    }

    #[tokio::test]
    async fn connected_session_is_reused() {
        let plug = SimulatedTransport::new();
        let (session, _) = session(plug.clone());

        session.ensure_connected().await.unwrap();
        session.ensure_connected().await.unwrap();

        assert_eq!(plug.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_device_times_out() {
        let plug = SimulatedTransport::new();
        plug.set_unreachable(true);
        let (session, _) = session(plug);

        let err = session.ensure_connected().await.unwrap_err();

        assert!(matches!(err, Error::Timeout { operation: "find", .. }));
        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Disconnected);
        assert!(snapshot.last_error.is_some_and(|e| e.is_timeout()));
    }

    #[tokio::test]
    async fn refused_connect_is_connection_error() {
        let plug = SimulatedTransport::new();
        plug.set_refuse_connect(true);
        let (session, _) = session(plug.clone());

        let err = session.ensure_connected().await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));

        plug.set_refuse_connect(false);
        session.ensure_connected().await.unwrap();
        // The failed attempt is released before retrying
        assert_eq!(plug.disconnect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn command_timeout_marks_session_disconnected() {
        let plug = SimulatedTransport::new();
        let (session, _) = session(plug.clone());
        session.ensure_connected().await.unwrap();

        plug.set_hang_commands(true);
        let err = session.set_power(PowerState::On).await.unwrap_err();

        assert!(matches!(err, Error::Timeout { operation: "set", .. }));
        assert_eq!(session.status(), SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn non_boolean_power_is_command_error() {
        let plug = SimulatedTransport::new();
        let (session, _) = session(plug.clone());
        session.ensure_connected().await.unwrap();

        plug.push(DpsUpdate::new().with(Dps::POWER, serde_json::json!("on")));
        let err = session.query_power().await.unwrap_err();
        assert!(matches!(err, Error::Command(_)));
    }

    #[tokio::test]
    async fn closed_session_rejects_work() {
        let plug = SimulatedTransport::new();
        let (session, _) = session(plug.clone());
        session.ensure_connected().await.unwrap();

        session.close().await;

        assert!(!plug.is_connected());
        assert!(matches!(
            session.ensure_connected().await,
            Err(Error::ShuttingDown)
        ));
        assert!(matches!(
            session.set_power(PowerState::On).await,
            Err(Error::ShuttingDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn push_events_reach_sink() {
        let plug = SimulatedTransport::new();
        let (session, seen) = session(plug.clone());
        session.ensure_connected().await.unwrap();

        plug.push(DpsUpdate::new().with(Dps::POWER, Value::Bool(true)));
        plug.push(DpsUpdate::new().with(Dps::new(9).unwrap(), Value::from(0)));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*seen.lock(), vec![PowerState::Off, PowerState::On]);
    }

    #[test]
    fn status_names() {
        assert_eq!(SessionStatus::default(), SessionStatus::Disconnected);
        assert_eq!(SessionStatus::Connecting.to_string(), "connecting");
    }
}
