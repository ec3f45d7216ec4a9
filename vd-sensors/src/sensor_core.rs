// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rustix::time::{clock_gettime, ClockId};
use tracing::{debug, error, instrument, trace};

use crate::{
    error::{Result, SensorError},
    listener::{ControlMessage, ControlSender},
    sensor::{self, SensorInfo, SENSORS},
    wire::{SensorEvent, SensorStatePacket},
};

/// After an injected event, a sensor stays quiet for at least this many
/// sampling periods.
const INJECTED_EVENT_WAIT_PERIODS: i64 = 3;
/// ...or for at least this long, whichever is longer.
const INJECTED_EVENT_WAIT_NANOS: i64 = 20_000_000;

const DEFAULT_SAMPLING_PERIOD_NANOS: i64 = 200_000_000;
const NEVER: i64 = i64::MAX;

pub(crate) fn now_nanos() -> i64 {
    let ts = clock_gettime(ClockId::Monotonic);
    ts.tv_sec * 1_000_000_000 + ts.tv_nsec
}

struct SensorState {
    enabled: bool,
    deadline: i64,
    sampling_period: i64,
    /// The reading repeated at every deadline.
    event: SensorEvent,
}

impl SensorState {
    fn new(info: &SensorInfo) -> Self {
        Self {
            enabled: false,
            deadline: NEVER,
            sampling_period: DEFAULT_SAMPLING_PERIOD_NANOS.max(info.min_delay_nanos()),
            event: SensorEvent::new(
                info.handle,
                info.sensor_type as i32,
                0,
                &info.default_reading,
            ),
        }
    }
}

struct State {
    sensors: Vec<SensorState>,
    /// Events ready for delivery, ordered by timestamp.
    fifo: Vec<SensorEvent>,
    /// The deadline a blocked poll is currently waiting for.
    current_deadline: i64,
    closed: bool,
}

/// The sensor device. Callers block in [`SensorCore::poll`] while enabled
/// sensors report on their own schedule, and injected events arrive from
/// the listener thread.
pub struct SensorCore {
    state: Mutex<State>,
    deadline_change: Condvar,
    control: Mutex<Option<ControlSender>>,
}

impl Default for SensorCore {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorCore {
    pub fn new() -> Self {
        for info in &SENSORS {
            debug!(name = info.name, handle = info.handle, "registered sensor");
        }

        Self {
            state: Mutex::new(State {
                sensors: SENSORS.iter().map(SensorState::new).collect(),
                fifo: Vec::new(),
                current_deadline: NEVER,
                closed: false,
            }),
            deadline_change: Condvar::new(),
            control: Mutex::new(None),
        }
    }

    pub fn sensors(&self) -> &'static [SensorInfo] {
        &SENSORS
    }

    pub fn activate(&self, handle: i32, enabled: bool) -> Result<()> {
        let idx = check_handle(handle)?;

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let sensor = &mut state.sensors[idx];
            if enabled && !sensor.enabled {
                sensor.deadline = now_nanos() + sensor.sampling_period;
            } else if !enabled && sensor.enabled {
                sensor.deadline = NEVER;
            }

            sensor.enabled = enabled;
            self.update_deadlines(state);
        }

        debug!(handle, enabled, "sensor activate");
        if !self.send_control(ControlMessage::SensorStateUpdate(handle)) {
            debug!(handle, "remotes not notified of sensor state");
        }

        Ok(())
    }

    /// Sets the sampling period, clamped to the sensor's minimum. The
    /// pending deadline moves by the difference, but never into the past.
    pub fn set_delay(&self, handle: i32, sampling_period_nanos: i64) -> Result<()> {
        let idx = check_handle(handle)?;
        let period = sampling_period_nanos.max(SENSORS[idx].min_delay_nanos()).max(1);

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let sensor = &mut state.sensors[idx];
            if sensor.enabled {
                sensor.deadline = sensor.deadline - sensor.sampling_period + period;
                sensor.deadline = sensor.deadline.max(now_nanos());
            }

            sensor.sampling_period = period;
            self.update_deadlines(state);
        }

        debug!(handle, delay_ms = period / 1_000_000, "sensor set delay");
        if !self.send_control(ControlMessage::SensorStateUpdate(handle)) {
            debug!(handle, "remotes not notified of sensor delay");
        }

        Ok(())
    }

    /// Blocks until at least one event is ready, then returns up to `max` of
    /// them, oldest first.
    #[instrument(level = "trace", skip(self))]
    pub fn poll(&self, max: usize) -> Result<Vec<SensorEvent>> {
        if max == 0 {
            error!("polled with bad count ({max})");
            return Err(SensorError::BadCount(max));
        }

        let mut guard = self.state.lock();
        guard.current_deadline = self.update_deadlines(&mut guard);
        while guard.fifo.is_empty() {
            if guard.closed {
                return Err(SensorError::Closed);
            }

            match guard.current_deadline {
                NEVER => self.deadline_change.wait(&mut guard),
                deadline => {
                    let timeout = (deadline - now_nanos()).max(0) as u64;
                    let _ = self
                        .deadline_change
                        .wait_for(&mut guard, Duration::from_nanos(timeout));
                }
            }

            guard.current_deadline = self.update_deadlines(&mut guard);
        }

        let n = max.min(guard.fifo.len());
        let events: Vec<_> = guard.fifo.drain(..n).collect();
        trace!(
            count = n,
            first_sensor = events[0].sensor,
            first_value = ?&events[0].data[..3],
            "reported sensor events"
        );

        Ok(events)
    }

    /// Delivers a real reading. The sensor's mock schedule is pushed back so
    /// the injected value isn't immediately followed by a synthetic one.
    pub fn inject(&self, mut event: SensorEvent) -> Result<()> {
        let idx = check_handle(event.sensor)?;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let now = now_nanos();
        let sensor = &mut state.sensors[idx];
        if sensor.enabled {
            let wait_periods =
                INJECTED_EVENT_WAIT_PERIODS.max(INJECTED_EVENT_WAIT_NANOS / sensor.sampling_period);
            sensor.deadline = now + sensor.sampling_period * wait_periods;
        }

        sensor.event.data[..3].copy_from_slice(&event.data[..3]);

        event.timestamp = now;
        state.fifo.push(event);
        self.deadline_change.notify_one();

        trace!(sensor = event.sensor, value = ?&event.data[..3], "injected sensor event");
        Ok(())
    }

    /// The next mock deadline of a sensor, or `None` if it's disabled.
    pub fn deadline(&self, handle: i32) -> Result<Option<i64>> {
        let idx = check_handle(handle)?;
        let state = self.state.lock();
        let sensor = &state.sensors[idx];
        Ok(sensor.enabled.then_some(sensor.deadline))
    }

    pub fn sampling_period(&self, handle: i32) -> Result<i64> {
        let idx = check_handle(handle)?;
        Ok(self.state.lock().sensors[idx].sampling_period)
    }

    pub fn state_packet(&self, handle: i32) -> Result<SensorStatePacket> {
        let idx = check_handle(handle)?;
        let state = self.state.lock();
        let sensor = &state.sensors[idx];
        Ok(SensorStatePacket {
            handle,
            sensor_type: SENSORS[idx].sensor_type as i32,
            enabled: sensor.enabled,
            delay_nanos: sensor.sampling_period,
        })
    }

    /// Wakes any blocked poll. Polls with nothing to report fail with
    /// [`SensorError::Closed`] from now on.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.deadline_change.notify_all();
    }

    pub(crate) fn set_control(&self, sender: Option<ControlSender>) {
        *self.control.lock() = sender;
    }

    pub(crate) fn send_control(&self, msg: ControlMessage) -> bool {
        let control = self.control.lock();
        let Some(sender) = control.as_ref() else {
            return false;
        };

        match sender.send(msg) {
            Ok(()) => true,
            Err(e) => {
                error!(?msg, "could not send control message: {e}");
                false
            }
        }
    }

    /// Queues a reading for every enabled sensor whose deadline has passed,
    /// and returns the earliest remaining deadline.
    fn update_deadlines(&self, state: &mut State) -> i64 {
        let now = now_nanos();
        let mut min = NEVER;
        let mut sort_fifo = false;

        for sensor in state.sensors.iter_mut().filter(|s| s.enabled) {
            while sensor.deadline <= now {
                let mut event = sensor.event;
                event.timestamp = sensor.deadline;
                state.fifo.push(event);

                sensor.deadline += sensor.sampling_period;
                sort_fifo = true;
            }

            min = min.min(sensor.deadline);
        }

        if sort_fifo {
            state.fifo.sort_by_key(|e| e.timestamp);
        }

        if !state.fifo.is_empty() || min < state.current_deadline {
            self.deadline_change.notify_one();
        }

        min
    }
}

fn check_handle(handle: i32) -> Result<usize> {
    match sensor::info(handle) {
        Some(info) => Ok(info.handle as usize),
        None => {
            error!(handle, "bad sensor handle");
            Err(SensorError::BadHandle(handle))
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::sensor::{ACCELEROMETER, LIGHT};
    use pretty_assertions::assert_eq;

    const PERIOD_5MS: i64 = 5_000_000;

    #[test_log::test]
    fn bad_arguments() {
        let core = SensorCore::new();
        assert!(matches!(core.poll(0), Err(SensorError::BadCount(0))));
        assert!(matches!(core.activate(9, true), Err(SensorError::BadHandle(9))));
        assert!(matches!(core.set_delay(-1, 0), Err(SensorError::BadHandle(-1))));
        assert!(matches!(
            core.inject(SensorEvent::new(42, 1, 0, &[])),
            Err(SensorError::BadHandle(42))
        ));
    }

    #[test_log::test]
    fn delay_is_clamped() {
        let core = SensorCore::new();
        core.set_delay(ACCELEROMETER, 1_000).unwrap();
        assert_eq!(core.sampling_period(ACCELEROMETER).unwrap(), PERIOD_5MS);

        core.set_delay(LIGHT, 500_000_000).unwrap();
        assert_eq!(core.sampling_period(LIGHT).unwrap(), 500_000_000);
        assert_eq!(core.deadline(LIGHT).unwrap(), None);
    }

    #[test_log::test]
    fn mock_events_are_periodic() {
        let core = SensorCore::new();
        core.activate(ACCELEROMETER, true).unwrap();
        core.set_delay(ACCELEROMETER, PERIOD_5MS).unwrap();

        let mut events = Vec::new();
        while events.len() < 6 {
            events.extend(core.poll(8).unwrap());
        }

        for pair in events.windows(2) {
            assert_eq!(pair[1].timestamp - pair[0].timestamp, PERIOD_5MS);
        }

        let reading = &SENSORS[ACCELEROMETER as usize].default_reading;
        assert!(events
            .iter()
            .all(|e| e.sensor == ACCELEROMETER && &e.data[..3] == reading));
    }

    #[test_log::test]
    fn injection_overrides_mock() {
        let core = SensorCore::new();
        core.activate(ACCELEROMETER, true).unwrap();
        core.set_delay(ACCELEROMETER, PERIOD_5MS).unwrap();

        let t0 = now_nanos();
        core.inject(SensorEvent::new(ACCELEROMETER, 1, 0, &[0.1, 9.8, 0.0]))
            .unwrap();

        let events = core.poll(1).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(&events[0].data[..3], &[0.1, 9.8, 0.0]);
        assert!(events[0].timestamp >= t0);

        // Four periods, since the wait window is longer than three.
        let deadline = core.deadline(ACCELEROMETER).unwrap().unwrap();
        assert!(deadline >= t0 + 4 * PERIOD_5MS);

        // The next mock event repeats the injected value.
        let next = core.poll(1).unwrap();
        assert_eq!(&next[0].data[..3], &[0.1, 9.8, 0.0]);
        assert!(next[0].timestamp >= t0 + 4 * PERIOD_5MS);
    }

    #[test_log::test]
    fn disabling_stops_events() {
        let core = SensorCore::new();
        core.activate(ACCELEROMETER, true).unwrap();
        assert!(core.deadline(ACCELEROMETER).unwrap().is_some());

        core.activate(ACCELEROMETER, false).unwrap();
        assert_eq!(core.deadline(ACCELEROMETER).unwrap(), None);

        let packet = core.state_packet(ACCELEROMETER).unwrap();
        assert!(!packet.enabled);
        assert_eq!(packet.sensor_type, 1);
    }

    #[test_log::test]
    fn activate_wakes_blocked_poll() {
        let core = Arc::new(SensorCore::new());

        let poller = {
            let core = core.clone();
            std::thread::spawn(move || core.poll(1))
        };

        std::thread::sleep(Duration::from_millis(20));
        core.set_delay(ACCELEROMETER, PERIOD_5MS).unwrap();
        core.activate(ACCELEROMETER, true).unwrap();

        let events = poller.join().unwrap().unwrap();
        assert_eq!(events[0].sensor, ACCELEROMETER);
    }

    #[test_log::test]
    fn close_wakes_blocked_poll() {
        let core = Arc::new(SensorCore::new());

        let poller = {
            let core = core.clone();
            std::thread::spawn(move || core.poll(1))
        };

        std::thread::sleep(Duration::from_millis(20));
        core.close();

        assert!(matches!(poller.join().unwrap(), Err(SensorError::Closed)));
    }
}
