// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event bus for broadcasting transport events.

use tokio::sync::broadcast;

use super::TransportEvent;

/// Default channel capacity for the event bus.
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Broadcasts [`TransportEvent`]s to every subscriber.
///
/// A slow subscriber that falls more than the capacity behind loses the
/// oldest events and observes `RecvError::Lagged`.
///
/// # Examples
///
/// ```
/// use plugd::protocol::{EventBus, TransportEvent};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(TransportEvent::Connected);
/// assert_eq!(rx.try_recv().unwrap(), TransportEvent::Connected);
/// ```
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TransportEvent>,
}

impl EventBus {
    /// Creates a new event bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a new event bus with the specified capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribes to events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publishes an event. Without subscribers the event is dropped.
    pub fn publish(&self, event: TransportEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn subscribers_are_counted_across_clones() {
        let bus = EventBus::new();
        let other = bus.clone();

        let rx = bus.subscribe();
        assert_eq!(other.subscriber_count(), 1);

        drop(rx);
        assert_eq!(other.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn every_subscriber_sees_each_event() {
        let bus = EventBus::new();
        let mut pump = bus.subscribe();
        let mut observer = bus.subscribe();

        bus.publish(TransportEvent::Error("socket hang up".to_string()));

        let expected = TransportEvent::Error("socket hang up".to_string());
        assert_eq!(pump.recv().await.unwrap(), expected);
        assert_eq!(observer.recv().await.unwrap(), expected);
    }

    #[test]
    fn slow_subscriber_lags() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();

        bus.publish(TransportEvent::Connected);
        bus.publish(TransportEvent::Disconnected);
        bus.publish(TransportEvent::Connected);

        assert_eq!(rx.try_recv(), Err(TryRecvError::Lagged(1)));
        assert_eq!(rx.try_recv(), Ok(TransportEvent::Disconnected));
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        EventBus::with_capacity(4).publish(TransportEvent::Disconnected);
    }
}
