// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use rustix::{
    io::Errno,
    thread::clock_nanosleep_absolute,
    time::{clock_gettime, ClockId, Timespec},
};
use tracing::{debug, error, trace};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Called with the display id, the vsync timestamp and the current period,
/// both in nanoseconds.
pub type VsyncCallback = Arc<dyn Fn(u64, i64, i32) + Send + Sync>;

pub fn now_nanos() -> i64 {
    let ts = clock_gettime(ClockId::Monotonic);
    ts.tv_sec * NANOS_PER_SEC + ts.tv_nsec
}

pub fn period_from_hz(hz: u32) -> i32 {
    (NANOS_PER_SEC / hz.max(1) as i64) as i32
}

/// When a period change takes effect, as reported to the window system.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct VsyncTimeline {
    pub new_vsync_applied_time_nanos: i64,
    pub refresh_required: bool,
    pub refresh_time_nanos: i64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct PendingUpdate {
    period: i64,
    apply_after: i64,
}

struct State {
    period: i64,
    previous: i64,
    enabled: bool,
    pending: Option<PendingUpdate>,
    callback: Option<VsyncCallback>,
}

impl State {
    fn new(period: i64, now: i64) -> Self {
        Self {
            period,
            previous: now,
            enabled: false,
            pending: None,
            callback: None,
        }
    }

    /// The next vsync strictly after `now`, in phase with the previous one.
    fn next_vsync(&self, now: i64) -> i64 {
        let elapsed = (now - self.previous).max(0);
        self.previous + (elapsed / self.period + 1) * self.period
    }

    /// The first in-phase vsync at or after `t`.
    fn vsync_at_or_after(&self, t: i64) -> i64 {
        let elapsed = (t - self.previous).max(0);
        let periods = (elapsed + self.period - 1) / self.period;
        self.previous + periods * self.period
    }

    /// Records a fired vsync, adopting a pending period if it's due.
    fn advance(&mut self, vsync: i64) {
        self.previous = vsync;
        if let Some(pending) = self.pending {
            if pending.apply_after <= self.previous {
                trace!(
                    old_period = self.period,
                    new_period = pending.period,
                    "applying vsync period"
                );

                self.period = pending.period;
                self.pending = None;
            }
        }
    }

    fn schedule(&mut self, period: i64, desired_time: i64, now: i64) -> VsyncTimeline {
        let apply_after = self.vsync_at_or_after(desired_time.max(now));
        self.pending = Some(PendingUpdate {
            period,
            apply_after,
        });

        VsyncTimeline {
            new_vsync_applied_time_nanos: apply_after,
            refresh_required: false,
            refresh_time_nanos: 0,
        }
    }
}

/// Generates vsync events for one display on a dedicated thread.
pub struct VsyncThread {
    display_id: u64,
    state: Arc<Mutex<State>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl VsyncThread {
    pub fn start(display_id: u64, period_nanos: i32) -> std::io::Result<Self> {
        let state = Arc::new(Mutex::new(State::new(
            period_nanos.max(1) as i64,
            now_nanos(),
        )));
        let shutdown = Arc::new(AtomicBool::new(false));

        let state_clone = state.clone();
        let shutdown_clone = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name(format!("vsync {display_id}"))
            .spawn(move || run(display_id, state_clone, shutdown_clone))?;

        debug!(display_id, period_nanos, "started vsync thread");
        Ok(Self {
            display_id,
            state,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn set_callback(&self, cb: Option<VsyncCallback>) {
        self.state.lock().callback = cb;
    }

    pub fn set_enabled(&self, enabled: bool) {
        trace!(display_id = self.display_id, enabled, "set vsync enabled");
        self.state.lock().enabled = enabled;
    }

    pub fn period(&self) -> i32 {
        self.state.lock().period as i32
    }

    /// Schedules a period change at the first vsync at or after
    /// `desired_time_nanos`.
    pub fn schedule_update(&self, period_nanos: i32, desired_time_nanos: i64) -> VsyncTimeline {
        let timeline = self.state.lock().schedule(
            period_nanos.max(1) as i64,
            desired_time_nanos,
            now_nanos(),
        );

        debug!(
            display_id = self.display_id,
            period_nanos,
            applied_at = timeline.new_vsync_applied_time_nanos,
            "scheduled vsync period update"
        );

        timeline
    }
}

impl Drop for VsyncThread {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(display_id = self.display_id, "vsync thread panicked");
            }
        }
    }
}

fn run(display_id: u64, state: Arc<Mutex<State>>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Acquire) {
        let next = state.lock().next_vsync(now_nanos());
        sleep_until(next);

        if shutdown.load(Ordering::Acquire) {
            break;
        }

        let (callback, period) = {
            let mut guard = state.lock();
            guard.advance(next);

            let cb = if guard.enabled {
                guard.callback.clone()
            } else {
                None
            };

            (cb, guard.period)
        };

        if let Some(cb) = callback {
            cb(display_id, next, period as i32);
        }
    }

    trace!(display_id, "vsync thread exiting");
}

fn sleep_until(nanos: i64) {
    let ts = Timespec {
        tv_sec: nanos / NANOS_PER_SEC,
        tv_nsec: nanos % NANOS_PER_SEC,
    };

    loop {
        match clock_nanosleep_absolute(ClockId::Monotonic, &ts) {
            Ok(()) => return,
            Err(Errno::INTR) => continue,
            Err(err) => {
                error!(%err, "clock_nanosleep failed");
                return;
            }
        }
    }
}
