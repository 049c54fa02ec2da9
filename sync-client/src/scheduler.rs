//! Adaptive poll scheduler.
//!
//! Holds the next execution time and the failure count. `fail()` and
//! `reset()` recompute the next execution immediately from the failure
//! count and the current time; the wait loop re-checks in short ticks, so
//! a change made mid-wait takes effect within one tick.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use sync_core::BackoffPolicy;
use tokio::time::{sleep, Instant};

#[derive(Debug)]
struct SchedulerState {
    next_execution: Instant,
    fail_count: u32,
}

/// Backoff timer shared by a device handler's reactive loop and poll loop.
#[derive(Debug)]
pub struct PollingScheduler {
    policy: BackoffPolicy,
    tick: Duration,
    state: Mutex<SchedulerState>,
}

impl PollingScheduler {
    /// New scheduler; the first poll is one base interval away.
    pub fn new(policy: BackoffPolicy, tick: Duration) -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                next_execution: Instant::now() + policy.success_delay(),
                fail_count: 0,
            }),
            policy,
            tick: tick.max(Duration::from_millis(1)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clear the failure count; next poll one base interval from now.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.fail_count = 0;
        state.next_execution = Instant::now() + self.policy.success_delay();
    }

    /// Count a failure; next poll after the backoff delay for the new count.
    pub fn fail(&self) {
        let mut state = self.lock();
        state.fail_count = state.fail_count.saturating_add(1);
        state.next_execution = Instant::now() + self.policy.failure_delay(state.fail_count);
    }

    /// Current failure count.
    pub fn fail_count(&self) -> u32 {
        self.lock().fail_count
    }

    /// When the next poll is due.
    pub fn next_execution(&self) -> Instant {
        self.lock().next_execution
    }

    /// The policy delays are computed with.
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Wait until a poll is due, then push the next one a base interval out.
    ///
    /// Dropping the future (e.g. aborting the task) cancels the wait.
    pub async fn wait_due(&self) {
        loop {
            let now = Instant::now();
            let next = self.next_execution();
            if now >= next {
                self.lock().next_execution = now + self.policy.success_delay();
                return;
            }
            sleep(self.tick.min(next - now)).await;
        }
    }

    /// Run `action` every time a poll is due, forever.
    pub async fn run<F, Fut>(&self, mut action: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            self.wait_due().await;
            action().await;
        }
    }
}
