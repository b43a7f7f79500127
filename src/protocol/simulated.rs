// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory simulated plug.
//!
//! Used by `plugd --simulate` to run the daemon without hardware, and by the
//! test suite to drive the session through failures that are hard to provoke
//! on a real device: unreachable hosts, hung commands and dropped sessions.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use super::{DeviceTransport, DpsUpdate, EventBus, TransportEvent};
use crate::error::TransportError;
use crate::types::{Dps, PowerState};

#[derive(Debug)]
struct SimState {
    connected: bool,
    dps: BTreeMap<String, Value>,
    unreachable: bool,
    refuse_connect: bool,
    hang_commands: bool,
    fail_sets: u32,
    echo_ack: bool,
    push_on_set: bool,
    latency: Duration,
    set_log: Vec<(Dps, Value)>,
}

#[derive(Debug, Default)]
struct Counters {
    find: AtomicU64,
    connect: AtomicU64,
    get: AtomicU64,
    set: AtomicU64,
    disconnect: AtomicU64,
}

/// A simulated single-relay plug.
///
/// Clones share the same simulated device, so a test can keep one clone to
/// steer the plug while the daemon owns another.
///
/// # Examples
///
/// ```
/// use plugd::protocol::{DeviceTransport, SimulatedTransport};
/// use plugd::types::Dps;
///
/// # async fn example() {
/// let plug = SimulatedTransport::new();
/// plug.connect().await.unwrap();
/// plug.set(Dps::POWER, serde_json::json!(true)).await.unwrap();
/// assert_eq!(plug.set_calls(), 1);
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    state: Arc<Mutex<SimState>>,
    counters: Arc<Counters>,
    events: EventBus,
}

impl SimulatedTransport {
    /// Creates a reachable plug that is switched off.
    #[must_use]
    pub fn new() -> Self {
        let mut dps = BTreeMap::new();
        dps.insert(Dps::POWER.key(), Value::Bool(false));

        Self {
            state: Arc::new(Mutex::new(SimState {
                connected: false,
                dps,
                unreachable: false,
                refuse_connect: false,
                hang_commands: false,
                fail_sets: 0,
                echo_ack: true,
                push_on_set: false,
                latency: Duration::ZERO,
                set_log: Vec::new(),
            })),
            counters: Arc::new(Counters::default()),
            events: EventBus::new(),
        }
    }

    /// Sets the initial power state of the plug.
    #[must_use]
    pub fn with_power(self, state: PowerState) -> Self {
        self.state
            .lock()
            .dps
            .insert(Dps::POWER.key(), Value::Bool(state.is_on()));
        self
    }

    /// Adds a round-trip delay to every operation.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    /// Makes the plug push a data event after every accepted `set`.
    #[must_use]
    pub fn with_push_on_set(self, enabled: bool) -> Self {
        self.state.lock().push_on_set = enabled;
        self
    }

    /// Controls whether `set` returns the acknowledged value.
    #[must_use]
    pub fn with_echo_ack(self, enabled: bool) -> Self {
        self.state.lock().echo_ack = enabled;
        self
    }

    /// Makes `find` and `connect` never complete.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Makes `connect` fail immediately.
    pub fn set_refuse_connect(&self, refuse: bool) {
        self.state.lock().refuse_connect = refuse;
    }

    /// Makes `get` and `set` never complete.
    pub fn set_hang_commands(&self, hang: bool) {
        self.state.lock().hang_commands = hang;
    }

    /// Makes the next `count` calls to `set` fail.
    pub fn fail_next_sets(&self, count: u32) {
        self.state.lock().fail_sets = count;
    }

    /// Simulates the device pushing new values, e.g. a press of the physical
    /// button.
    pub fn push(&self, update: DpsUpdate) {
        {
            let mut state = self.state.lock();
            for (key, value) in &update.0 {
                state.dps.insert(key.clone(), value.clone());
            }
        }
        self.events.publish(TransportEvent::Data(update));
    }

    /// Simulates the device dropping the session.
    pub fn drop_connection(&self) {
        self.state.lock().connected = false;
        self.events.publish(TransportEvent::Disconnected);
    }

    /// Returns the power state the simulated relay is in.
    #[must_use]
    pub fn power(&self) -> Option<PowerState> {
        self.state
            .lock()
            .dps
            .get(&Dps::POWER.key())
            .and_then(PowerState::from_value)
    }

    /// Returns `true` while a session is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Returns every value written with `set`, in order.
    #[must_use]
    pub fn set_log(&self) -> Vec<(Dps, Value)> {
        self.state.lock().set_log.clone()
    }

    /// Number of `find` calls.
    #[must_use]
    pub fn find_calls(&self) -> u64 {
        self.counters.find.load(Ordering::SeqCst)
    }

    /// Number of `connect` calls.
    #[must_use]
    pub fn connect_calls(&self) -> u64 {
        self.counters.connect.load(Ordering::SeqCst)
    }

    /// Number of `get` calls.
    #[must_use]
    pub fn get_calls(&self) -> u64 {
        self.counters.get.load(Ordering::SeqCst)
    }

    /// Number of `set` calls.
    #[must_use]
    pub fn set_calls(&self) -> u64 {
        self.counters.set.load(Ordering::SeqCst)
    }

    /// Number of `disconnect` calls.
    #[must_use]
    pub fn disconnect_calls(&self) -> u64 {
        self.counters.disconnect.load(Ordering::SeqCst)
    }

    async fn round_trip(&self) {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    async fn stall_if(&self, stalled: impl Fn(&SimState) -> bool) {
        if stalled(&self.state.lock()) {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTransport for SimulatedTransport {
    async fn find(&self) -> Result<(), TransportError> {
        self.counters.find.fetch_add(1, Ordering::SeqCst);
        self.stall_if(|s| s.unreachable).await;
        self.round_trip().await;
        Ok(())
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.counters.connect.fetch_add(1, Ordering::SeqCst);
        self.stall_if(|s| s.unreachable).await;
        self.round_trip().await;

        {
            let mut state = self.state.lock();
            if state.refuse_connect {
                return Err(TransportError::Unreachable);
            }
            state.connected = true;
        }

        self.events.publish(TransportEvent::Connected);
        Ok(())
    }

    async fn get(&self, dps: Dps) -> Result<Value, TransportError> {
        self.counters.get.fetch_add(1, Ordering::SeqCst);
        self.stall_if(|s| s.hang_commands).await;
        self.round_trip().await;

        let state = self.state.lock();
        if !state.connected {
            return Err(TransportError::Closed);
        }
        Ok(state.dps.get(&dps.key()).cloned().unwrap_or(Value::Null))
    }

    async fn set(&self, dps: Dps, value: Value) -> Result<Option<Value>, TransportError> {
        self.counters.set.fetch_add(1, Ordering::SeqCst);
        self.stall_if(|s| s.hang_commands).await;
        self.round_trip().await;

        let (ack, push) = {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(TransportError::Closed);
            }
            if state.fail_sets > 0 {
                state.fail_sets -= 1;
                return Err(TransportError::Rpc {
                    method: "set".to_string(),
                    message: "device did not acknowledge".to_string(),
                });
            }
            state.set_log.push((dps, value.clone()));
            state.dps.insert(dps.key(), value.clone());
            (state.echo_ack.then(|| value.clone()), state.push_on_set)
        };

        if push {
            self.events
                .publish(TransportEvent::Data(DpsUpdate::new().with(dps, value)));
        }
        Ok(ack)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.counters.disconnect.fetch_add(1, Ordering::SeqCst);

        let was_connected = std::mem::replace(&mut self.state.lock().connected, false);
        if was_connected {
            self.events.publish(TransportEvent::Disconnected);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commands_require_connection() {
        let plug = SimulatedTransport::new();
        assert!(matches!(
            plug.get(Dps::POWER).await,
            Err(TransportError::Closed)
        ));

        plug.connect().await.unwrap();
        assert_eq!(plug.get(Dps::POWER).await.unwrap(), Value::Bool(false));
    }

    #[tokio::test]
    async fn set_records_and_acknowledges() {
        let plug = SimulatedTransport::new();
        plug.connect().await.unwrap();

        let ack = plug.set(Dps::POWER, Value::Bool(true)).await.unwrap();
        assert_eq!(ack, Some(Value::Bool(true)));
        assert_eq!(plug.power(), Some(PowerState::On));
        assert_eq!(plug.set_log(), vec![(Dps::POWER, Value::Bool(true))]);
    }

    #[tokio::test]
    async fn failed_sets_leave_relay_untouched() {
        let plug = SimulatedTransport::new();
        plug.connect().await.unwrap();
        plug.fail_next_sets(1);

        assert!(plug.set(Dps::POWER, Value::Bool(true)).await.is_err());
        assert_eq!(plug.power(), Some(PowerState::Off));
        assert!(plug.set(Dps::POWER, Value::Bool(true)).await.is_ok());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_emits_once() {
        let plug = SimulatedTransport::new();
        let mut events = plug.subscribe();

        plug.connect().await.unwrap();
        plug.disconnect().await.unwrap();
        plug.disconnect().await.unwrap();

        assert_eq!(events.recv().await.unwrap(), TransportEvent::Connected);
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Disconnected);
        assert!(events.try_recv().is_err());
        assert_eq!(plug.disconnect_calls(), 2);
    }

    #[tokio::test]
    async fn push_updates_relay_and_emits_data() {
        let plug = SimulatedTransport::new();
        let mut events = plug.subscribe();

        plug.push(DpsUpdate::new().with(Dps::POWER, Value::Bool(true)));

        assert_eq!(plug.power(), Some(PowerState::On));
        assert!(matches!(events.recv().await.unwrap(), TransportEvent::Data(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_plug_never_connects() {
        let plug = SimulatedTransport::new();
        plug.set_unreachable(true);

        let result = tokio::time::timeout(Duration::from_secs(60), plug.connect()).await;
        assert!(result.is_err());
        assert_eq!(plug.connect_calls(), 1);
    }
}
