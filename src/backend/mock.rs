use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::config::{BinaryValue, Edge, LineConfig};
use crate::error::Error;
use crate::line::{GpioBackend, WaitStatus};

const MOCK_CHIP_LABEL: &str = "pinctrl-mock";
const MOCK_LINE_COUNT: u32 = 64;

/// In-memory backend. `drive` plays the external world changing the physical
/// level; qualifying logical transitions queue edge events that
/// `wait_for_event` consumes one per call.
#[derive(Default)]
pub struct MockGpioBackend {
    lines: Mutex<FxHashMap<u32, MockLineState>>, // keyed by line offset
    edges: Condvar,
}

struct MockLineState {
    config: LineConfig,
    requested: bool,
    physical: BinaryValue,
    pending_events: u32,
    fail_next_wait: Option<String>,
    request_count: usize,
    release_count: usize,
    configure_calls: usize,
    direction_applications: usize,
    wait_calls: usize,
}

impl Default for MockLineState {
    fn default() -> Self {
        Self {
            config: LineConfig::default(),
            requested: false,
            physical: BinaryValue::Low,
            pending_events: 0,
            fail_next_wait: None,
            request_count: 0,
            release_count: 0,
            configure_calls: 0,
            direction_applications: 0,
            wait_calls: 0,
        }
    }
}

fn apply_polarity(value: BinaryValue, active_low: bool) -> BinaryValue {
    if active_low { value.inverted() } else { value }
}

fn edge_matches(configured: Edge, observed: Edge) -> bool {
    match configured {
        Edge::None => false,
        Edge::Rising => observed == Edge::Rising,
        Edge::Falling => observed == Edge::Falling,
        Edge::Both => matches!(observed, Edge::Rising | Edge::Falling),
    }
}

impl MockGpioBackend {
    /// Sets the physical level of a line, queueing an edge event when the
    /// logical transition matches the requested line's edge configuration.
    pub fn drive(&self, offset: u32, physical: BinaryValue) {
        let mut lines = self.lines.lock();
        let state = lines.entry(offset).or_default();

        let active_low = state.config.active_low;
        let old_logical = apply_polarity(state.physical, active_low);
        state.physical = physical;
        let new_logical = apply_polarity(physical, active_low);

        let observed = match (old_logical, new_logical) {
            (BinaryValue::Low, BinaryValue::High) => Some(Edge::Rising),
            (BinaryValue::High, BinaryValue::Low) => Some(Edge::Falling),
            _ => None,
        };
        if let Some(observed) = observed
            && state.requested
            && edge_matches(state.config.edge, observed)
        {
            state.pending_events += 1;
            self.edges.notify_all();
        }
    }

    /// Makes the next `wait_for_event` on the line fail, waking a blocked
    /// waiter immediately.
    pub fn fail_next_wait(&self, offset: u32, reason: &str) {
        let mut lines = self.lines.lock();
        let state = lines.entry(offset).or_default();
        state.fail_next_wait = Some(reason.to_string());
        self.edges.notify_all();
    }

    pub fn physical_value(&self, offset: u32) -> BinaryValue {
        self.lines
            .lock()
            .get(&offset)
            .map_or(BinaryValue::Low, |s| s.physical)
    }

    pub fn is_requested(&self, offset: u32) -> bool {
        self.lines
            .lock()
            .get(&offset)
            .is_some_and(|s| s.requested)
    }

    pub fn request_count(&self, offset: u32) -> usize {
        self.lines.lock().get(&offset).map_or(0, |s| s.request_count)
    }

    pub fn release_count(&self, offset: u32) -> usize {
        self.lines.lock().get(&offset).map_or(0, |s| s.release_count)
    }

    pub fn configure_calls(&self, offset: u32) -> usize {
        self.lines
            .lock()
            .get(&offset)
            .map_or(0, |s| s.configure_calls)
    }

    pub fn direction_applications(&self, offset: u32) -> usize {
        self.lines
            .lock()
            .get(&offset)
            .map_or(0, |s| s.direction_applications)
    }

    pub fn wait_calls(&self, offset: u32) -> usize {
        self.lines.lock().get(&offset).map_or(0, |s| s.wait_calls)
    }
}

impl GpioBackend for MockGpioBackend {
    fn chip_label(&self) -> Result<String, Error> {
        Ok(MOCK_CHIP_LABEL.to_string())
    }

    fn line_count(&self) -> Result<u32, Error> {
        Ok(MOCK_LINE_COUNT)
    }

    fn request_line(&self, offset: u32) -> Result<(), Error> {
        if offset >= MOCK_LINE_COUNT {
            return Err(Error::Gpio(format!("line {offset} out of range")));
        }
        let mut lines = self.lines.lock();
        let state = lines.entry(offset).or_default();
        if state.requested {
            return Err(Error::Gpio(format!("line {offset} already requested")));
        }
        state.requested = true;
        state.request_count += 1;
        Ok(())
    }

    fn release_line(&self, offset: u32) -> Result<(), Error> {
        let mut lines = self.lines.lock();
        let state = lines
            .get_mut(&offset)
            .filter(|s| s.requested)
            .ok_or(Error::NotRequested(offset))?;
        state.requested = false;
        state.release_count += 1;
        state.pending_events = 0;
        state.fail_next_wait = None;
        Ok(())
    }

    fn configure_line(&self, offset: u32, config: &LineConfig) -> Result<(), Error> {
        let mut lines = self.lines.lock();
        let state = lines
            .get_mut(&offset)
            .filter(|s| s.requested)
            .ok_or(Error::NotRequested(offset))?;

        state.configure_calls += 1;
        let apply_direction = config.reconfigure_direction
            || state.direction_applications == 0
            || config.direction != state.config.direction;
        if apply_direction {
            state.direction_applications += 1;
            if let Some(level) = config.direction.initial_level() {
                state.physical = apply_polarity(level, config.active_low);
            }
        }
        // reconfiguring resets the kernel event queue
        state.pending_events = 0;
        state.config = config.clone();
        Ok(())
    }

    fn read_value(&self, offset: u32) -> Result<BinaryValue, Error> {
        let lines = self.lines.lock();
        let state = lines
            .get(&offset)
            .filter(|s| s.requested)
            .ok_or(Error::NotRequested(offset))?;
        Ok(apply_polarity(state.physical, state.config.active_low))
    }

    fn write_value(&self, offset: u32, value: BinaryValue) -> Result<(), Error> {
        let mut lines = self.lines.lock();
        let state = lines
            .get_mut(&offset)
            .filter(|s| s.requested)
            .ok_or(Error::NotRequested(offset))?;
        if !state.config.direction.is_output() {
            return Err(Error::Write(offset));
        }
        state.physical = apply_polarity(value, state.config.active_low);
        Ok(())
    }

    fn wait_for_event(&self, offset: u32, timeout: Duration) -> Result<WaitStatus, Error> {
        let deadline = Instant::now() + timeout;
        let mut lines = self.lines.lock();
        {
            let state = lines
                .get_mut(&offset)
                .filter(|s| s.requested)
                .ok_or(Error::NotRequested(offset))?;
            state.wait_calls += 1;
        }
        loop {
            let state = lines
                .get_mut(&offset)
                .filter(|s| s.requested)
                .ok_or(Error::NotRequested(offset))?;
            if let Some(reason) = state.fail_next_wait.take() {
                return Err(Error::Wait(offset, reason));
            }
            if state.pending_events > 0 {
                state.pending_events -= 1;
                return Ok(WaitStatus::Event);
            }
            if self.edges.wait_until(&mut lines, deadline).timed_out() {
                return Ok(WaitStatus::TimedOut);
            }
        }
    }
}
