//! Rendezvous between the agent's step loop and the emulator's input driver.
//!
//! The agent publishes one [`ActionFrame`] per step with [`ControlChannel::push`];
//! the input driver asks for the controller state once per emulator tick with
//! [`ControlChannel::poll`]. Each pushed frame is handed out exactly
//! `frame_skip` times in a row (once while frame skip is disabled), after which
//! polls block until the next push.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::action::ActionFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("control channel is shut down")]
    Shutdown,
}

/// How a push finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The poller consumed the full response cycle.
    Complete,
    /// The poller did not finish the cycle within the control timeout.
    /// The frame stays published; synchronization is degraded for this step.
    TimedOut,
}

/// Channel counters (atomic, lock-free reads).
#[derive(Default)]
pub struct ChannelStats {
    pushes: AtomicU64,
    deliveries: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelStatsSnapshot {
    pub pushes: u64,
    pub deliveries: u64,
    pub timeouts: u64,
}

impl ChannelStats {
    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            pushes: self.pushes.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

struct ChannelState {
    frame: ActionFrame,
    delivered: u32,
    pending: bool,
    frame_skip: u32,
    frame_skip_enabled: bool,
    running: bool,
    consecutive_timeouts: u64,
}

impl ChannelState {
    fn cycle_len(&self) -> u32 {
        if self.frame_skip_enabled {
            self.frame_skip
        } else {
            1
        }
    }
}

struct Shared {
    state: Mutex<ChannelState>,
    changed: Condvar,
    stats: ChannelStats,
    control_timeout: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, state: &mut ChannelState) -> Result<ActionFrame, ChannelError> {
        if !state.running {
            return Err(ChannelError::Shutdown);
        }
        state.delivered += 1;
        self.stats.deliveries.fetch_add(1, Ordering::Relaxed);
        if state.delivered >= state.cycle_len() {
            state.pending = false;
            self.changed.notify_all();
        }
        Ok(state.frame)
    }
}

/// Cloneable handle; all clones share one channel.
///
/// Intended for a single producer. Any number of pollers may wait, but the
/// response cycle is counted across all of them.
#[derive(Clone)]
pub struct ControlChannel {
    shared: Arc<Shared>,
}

impl ControlChannel {
    pub fn new(frame_skip: u32, control_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ChannelState {
                    frame: ActionFrame::NOOP,
                    delivered: 0,
                    pending: false,
                    frame_skip: frame_skip.max(1),
                    frame_skip_enabled: true,
                    running: true,
                    consecutive_timeouts: 0,
                }),
                changed: Condvar::new(),
                stats: ChannelStats::default(),
                control_timeout,
            }),
        }
    }

    /// Publishes `frame` and blocks until the poller has consumed the whole
    /// response cycle, or the control timeout elapses.
    pub fn push(&self, frame: ActionFrame) -> Result<Delivery, ChannelError> {
        let shared = &*self.shared;
        let mut state = shared.lock();
        if !state.running {
            return Err(ChannelError::Shutdown);
        }

        state.frame = frame;
        state.delivered = 0;
        state.pending = true;
        shared.stats.pushes.fetch_add(1, Ordering::Relaxed);
        shared.changed.notify_all();

        let deadline = Instant::now() + shared.control_timeout;
        while state.running && state.pending {
            let now = Instant::now();
            if now >= deadline {
                state.consecutive_timeouts += 1;
                shared.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    consecutive = state.consecutive_timeouts,
                    delivered = state.delivered,
                    required = state.cycle_len(),
                    "input driver did not consume the control frame in {:?}; continuing with degraded sync",
                    shared.control_timeout
                );
                return Ok(Delivery::TimedOut);
            }
            let (guard, _) = shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }

        if !state.running {
            return Err(ChannelError::Shutdown);
        }
        if state.consecutive_timeouts > 0 {
            tracing::info!(
                after = state.consecutive_timeouts,
                "input driver back in sync"
            );
            state.consecutive_timeouts = 0;
        }
        Ok(Delivery::Complete)
    }

    /// Blocks until a frame is pending, then hands it out once.
    pub fn poll(&self) -> Result<ActionFrame, ChannelError> {
        let shared = &*self.shared;
        let mut state = shared.lock();
        while state.running && !state.pending {
            state = shared
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        shared.deliver(&mut state)
    }

    /// Like [`ControlChannel::poll`] but gives up after `timeout`, returning `Ok(None)`.
    pub fn poll_timeout(&self, timeout: Duration) -> Result<Option<ActionFrame>, ChannelError> {
        let shared = &*self.shared;
        let deadline = Instant::now() + timeout;
        let mut state = shared.lock();
        while state.running && !state.pending {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        shared.deliver(&mut state).map(Some)
    }

    /// Stops the channel: blocked polls and pushes return [`ChannelError::Shutdown`].
    pub fn shutdown(&self) {
        let mut state = self.shared.lock();
        if state.running {
            tracing::info!("control channel shutting down");
        }
        state.running = false;
        self.shared.changed.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    pub fn frame_skip(&self) -> u32 {
        self.shared.lock().frame_skip
    }

    pub fn set_frame_skip(&self, frame_skip: u32) {
        self.shared.lock().frame_skip = frame_skip.max(1);
    }

    pub fn frame_skip_enabled(&self) -> bool {
        self.shared.lock().frame_skip_enabled
    }

    pub fn set_frame_skip_enabled(&self, enabled: bool) {
        self.shared.lock().frame_skip_enabled = enabled;
    }

    /// Disables frame skip until the returned guard is dropped, e.g. while a
    /// menu script needs one poll per pushed frame.
    pub fn frame_skip_disabled(&self) -> FrameSkipGuard<'_> {
        let mut state = self.shared.lock();
        let previous = state.frame_skip_enabled;
        state.frame_skip_enabled = false;
        FrameSkipGuard {
            channel: self,
            previous,
        }
    }

    pub fn control_timeout(&self) -> Duration {
        self.shared.control_timeout
    }

    pub fn stats(&self) -> ChannelStatsSnapshot {
        self.shared.stats.snapshot()
    }
}

pub struct FrameSkipGuard<'a> {
    channel: &'a ControlChannel,
    previous: bool,
}

impl Drop for FrameSkipGuard<'_> {
    fn drop(&mut self) {
        self.channel.set_frame_skip_enabled(self.previous);
    }
}
