// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Single-shot auto-off timer.
//!
//! The timer is either idle or armed with exactly one pending task. Arming an
//! armed timer cancels the pending task and starts a new one, so the delay is
//! always measured from the most recent `On` observation.
//!
//! When the delay elapses the timer runs its off action. The action is
//! expected to end in an `Off` observation, which calls [`AutoOffTimer::disarm`]
//! while the timer is still firing; that call returns the timer to idle
//! without counting a cancellation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Attempts made to run the off action before giving up.
const OFF_ATTEMPTS: u32 = 2;

#[derive(Debug)]
struct Pending {
    generation: u64,
    deadline: Instant,
    /// `None` once the timer has fired and the off action is running.
    task: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct TimerState {
    pending: Option<Pending>,
    generation: u64,
    cancellations: u64,
}

impl TimerState {
    fn owns(&self, generation: u64) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|pending| pending.generation == generation)
    }
}

/// Delayed power-off tied to power state transitions.
#[derive(Debug, Default)]
pub struct AutoOffTimer {
    state: Arc<Mutex<TimerState>>,
}

impl AutoOffTimer {
    /// Creates an idle timer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the timer to run `action` after `delay`.
    ///
    /// A pending timer is cancelled and replaced; replacing is a restart, not
    /// a cancellation. A failing action is retried once.
    pub fn arm<F, Fut>(&self, delay: Duration, action: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut state = self.state.lock();

        state.generation += 1;
        let generation = state.generation;
        if let Some(task) = state.pending.take().and_then(|pending| pending.task) {
            task.abort();
            debug!("Auto-off timer restarted");
        }

        let deadline = Instant::now() + delay;
        let shared = Arc::clone(&self.state);

        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;

            {
                let mut state = shared.lock();
                match state.pending.as_mut() {
                    Some(pending) if pending.generation == generation => pending.task = None,
                    _ => return,
                }
            }

            info!(after_secs = delay.as_secs(), "Auto-off timer fired, switching off");

            for attempt in 1..=OFF_ATTEMPTS {
                let Err(e) = action().await else {
                    break;
                };
                if attempt < OFF_ATTEMPTS && shared.lock().owns(generation) {
                    warn!(error = %e, attempt, "Auto-off action failed, retrying");
                    continue;
                }
                error!(error = %e, "Auto-off action failed, giving up");
                break;
            }

            let mut state = shared.lock();
            if state.owns(generation) {
                state.pending = None;
            }
        });

        state.pending = Some(Pending {
            generation,
            deadline,
            task: Some(task),
        });
        debug!(delay_secs = delay.as_secs(), "Auto-off timer armed");
    }

    /// Cancels the pending timer.
    ///
    /// Returns `true` if a pending task was cancelled. Disarming an idle timer,
    /// or a timer whose off action is already running, returns `false`.
    pub fn disarm(&self) -> bool {
        let mut state = self.state.lock();
        match state.pending.take() {
            Some(Pending {
                task: Some(task), ..
            }) => {
                task.abort();
                state.cancellations += 1;
                debug!("Auto-off timer cancelled");
                true
            }
            Some(_) => {
                debug!("Auto-off timer completed");
                false
            }
            None => false,
        }
    }

    /// Returns `true` while a timer is pending or firing.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    /// Returns when the pending timer fires.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.state.lock().pending.as_ref().map(|pending| pending.deadline)
    }

    /// Returns how many pending timers were cancelled by [`disarm`](Self::disarm).
    #[must_use]
    pub fn cancellations(&self) -> u64 {
        self.state.lock().cancellations
    }
}

impl Drop for AutoOffTimer {
    fn drop(&mut self) {
        if let Some(task) = self.state.lock().pending.take().and_then(|p| p.task) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counter() -> Arc<AtomicU32> {
        Arc::new(AtomicU32::new(0))
    }

    fn counting(calls: &Arc<AtomicU32>) -> impl Fn() -> std::future::Ready<Result<()>> + Send + 'static {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let timer = AutoOffTimer::new();
        let calls = counter();

        timer.arm(Duration::from_secs(10), counting(&calls));
        assert!(timer.is_armed());

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!timer.is_armed());
        assert_eq!(timer.cancellations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_restarts_the_delay() {
        let timer = AutoOffTimer::new();
        let calls = counter();

        timer.arm(Duration::from_secs(10), counting(&calls));
        tokio::time::sleep(Duration::from_secs(6)).await;
        timer.arm(Duration::from_secs(10), counting(&calls));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(timer.is_armed());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(timer.cancellations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_cancels_once() {
        let timer = AutoOffTimer::new();
        let calls = counter();

        timer.arm(Duration::from_secs(10), counting(&calls));
        assert!(timer.disarm());
        assert!(!timer.disarm());
        assert_eq!(timer.cancellations(), 1);
        assert_eq!(timer.deadline(), None);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_tracks_latest_arm() {
        let timer = AutoOffTimer::new();
        let start = Instant::now();

        timer.arm(Duration::from_secs(30), || async { Ok(()) });
        assert_eq!(timer.deadline(), Some(start + Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_action_is_retried_once() {
        let timer = AutoOffTimer::new();
        let calls = counter();
        let attempts = Arc::clone(&calls);

        timer.arm(Duration::from_secs(1), move || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Command("device busy".to_string())) }
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!timer.is_armed());
        assert_eq!(timer.cancellations(), 0);
    }
}
