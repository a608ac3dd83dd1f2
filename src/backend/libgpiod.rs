use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use libgpiod::{chip::Chip, line, line::EventClock, request};
use log::warn;
use parking_lot::{FairMutex, RwLock as PLRwLock, RwLockUpgradableReadGuard};
use rustc_hash::FxHashMap;

use crate::config::{BinaryValue, Edge, LineConfig};
use crate::error::Error;
use crate::line::{GpioBackend, WaitStatus};

/// Label fragment of the SoC pin controller on the boards this was written
/// for; `detect` callers usually pass this.
pub const DEFAULT_CHIP_LABEL_PATTERN: &str = "pinctrl";

// One event per wait keeps the watch channel at one message per occurrence;
// the kernel queue holds the rest until the next wait call.
const EDGE_EVENT_BUFFER_CAPACITY: usize = 1;

pub struct LibgpiodBackend {
    chip_path: PathBuf,
    lines: PLRwLock<FxHashMap<u32, RwLock<LineState>>>, // keyed by line offset
}

struct LineState {
    config: LineConfig,
    configured: bool,
    handle: Arc<FairMutex<RequestHandle>>,
}

struct RequestHandle {
    request: request::Request,
    events: request::Buffer,
}

impl LibgpiodBackend {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            chip_path: path.into(),
            lines: PLRwLock::new(FxHashMap::default()),
        }
    }

    /// Scans `/dev/gpiochip*` for the first chip whose label contains
    /// `pattern`.
    pub fn detect(pattern: &str) -> Result<Self, Error> {
        let mut candidates: Vec<PathBuf> = fs::read_dir("/dev")
            .map_err(|e| Error::Gpio(format!("scan /dev: {e}")))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("gpiochip"))
            })
            .collect();
        candidates.sort();

        for path in candidates {
            let Ok(chip) = Chip::open(&path) else {
                continue;
            };
            let Ok(info) = chip.info() else {
                continue;
            };
            if info.label().is_ok_and(|label| label.contains(pattern)) {
                return Ok(Self::open(path));
            }
        }
        Err(Error::Gpio(format!(
            "no gpio chip with label matching {pattern}"
        )))
    }

    fn open_chip(path: &PathBuf) -> Result<Chip, Error> {
        Chip::open(path).map_err(|e| Error::Gpio(format!("open chip {}: {e}", path.display())))
    }

    // The line is taken with direction as-is; the first configure call
    // applies the real settings.
    fn request_as_is(chip: &Chip, offset: u32) -> Result<request::Request, Error> {
        let mut settings =
            line::Settings::new().map_err(|e| Error::Gpio(format!("line settings: {e}")))?;
        settings
            .set_direction(line::Direction::AsIs)
            .map_err(|e| Error::Gpio(format!("set direction: {e}")))?;
        let line_cfg = Self::make_line_config(offset, settings)?;

        let mut req_cfg =
            request::Config::new().map_err(|e| Error::Gpio(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| Error::Gpio(format!("request consumer: {e}")))?;
        chip.request_lines(Some(&req_cfg), &line_cfg)
            .map_err(|e| Error::Gpio(format!("request lines: {e}")))
    }

    // Debouncing stays in the watch pipeline, so no hardware debounce period
    // is set here.
    fn make_line_settings(config: &LineConfig, apply_direction: bool) -> Result<line::Settings, Error> {
        let mut ls =
            line::Settings::new().map_err(|e| Error::Gpio(format!("line settings: {e}")))?;

        if !apply_direction {
            ls.set_direction(line::Direction::AsIs)
                .map_err(|e| Error::Gpio(format!("set direction: {e}")))?;
        } else if config.direction.is_input() {
            ls.set_direction(line::Direction::Input)
                .map_err(|e| Error::Gpio(format!("set direction: {e}")))?;
        } else {
            ls.set_direction(line::Direction::Output)
                .map_err(|e| Error::Gpio(format!("set direction: {e}")))?;
            if let Some(level) = config.direction.initial_level() {
                ls.set_output_value(to_gpiod_value(level))
                    .map_err(|e| Error::Gpio(format!("set output value: {e}")))?;
            }
        }

        ls.set_active_low(config.active_low);

        let edge = match config.edge {
            Edge::None => None,
            Edge::Rising => Some(line::Edge::Rising),
            Edge::Falling => Some(line::Edge::Falling),
            Edge::Both => Some(line::Edge::Both),
        };
        ls.set_edge_detection(edge)
            .map_err(|e| Error::Gpio(format!("set edge detection: {e}")))?;
        if config.edge != Edge::None {
            ls.set_event_clock(EventClock::Realtime)
                .map_err(|e| Error::Gpio(format!("set event clock: {e}")))?;
        }

        Ok(ls)
    }

    fn make_line_config(offset: u32, settings: line::Settings) -> Result<line::Config, Error> {
        let mut cfg = line::Config::new().map_err(|e| Error::Gpio(format!("line config: {e}")))?;
        cfg.add_line_settings(&[offset], settings)
            .map_err(|e| Error::Gpio(format!("line config add settings: {e}")))?;
        Ok(cfg)
    }

    fn request_handle(&self, offset: u32) -> Result<Arc<FairMutex<RequestHandle>>, Error> {
        let lines = self.lines.read();
        let state_lock = lines.get(&offset).ok_or(Error::NotRequested(offset))?;
        let state = state_lock
            .read()
            .map_err(|e| Error::Gpio(format!("lock poisoned: {e}")))?;
        Ok(state.handle.clone())
    }
}

fn to_gpiod_value(value: BinaryValue) -> line::Value {
    match value {
        BinaryValue::Low => line::Value::InActive,
        BinaryValue::High => line::Value::Active,
    }
}

impl GpioBackend for LibgpiodBackend {
    fn chip_label(&self) -> Result<String, Error> {
        let chip = Self::open_chip(&self.chip_path)?;
        let info = chip.info().map_err(|e| Error::Gpio(format!("chip info: {e}")))?;
        let label = info
            .label()
            .map_err(|e| Error::Gpio(format!("chip label: {e}")))?;
        Ok(label.to_string())
    }

    fn line_count(&self) -> Result<u32, Error> {
        let chip = Self::open_chip(&self.chip_path)?;
        let info = chip.info().map_err(|e| Error::Gpio(format!("chip info: {e}")))?;
        Ok(info.num_lines() as u32)
    }

    fn request_line(&self, offset: u32) -> Result<(), Error> {
        let lines = self.lines.upgradable_read();
        if lines.contains_key(&offset) {
            return Err(Error::Gpio(format!("line {offset} already requested")));
        }

        // since the upgradable read lock is exclusively held by this thread,
        // the handle can be built before upgrading without double locking
        let chip = Self::open_chip(&self.chip_path)?;
        let request = Self::request_as_is(&chip, offset)?;
        let events = request::Buffer::new(EDGE_EVENT_BUFFER_CAPACITY)
            .map_err(|e| Error::Gpio(format!("event buffer: {e}")))?;
        let state = RwLock::new(LineState {
            config: LineConfig::default(),
            configured: false,
            handle: Arc::new(FairMutex::new(RequestHandle { request, events })),
        });

        let mut lines = RwLockUpgradableReadGuard::upgrade(lines);
        lines.insert(offset, state);
        Ok(())
    }

    fn release_line(&self, offset: u32) -> Result<(), Error> {
        let mut lines = self.lines.write();
        match lines.remove(&offset) {
            Some(_) => Ok(()), // dropping the request releases the line
            None => Err(Error::NotRequested(offset)),
        }
    }

    fn configure_line(&self, offset: u32, config: &LineConfig) -> Result<(), Error> {
        let lines = self.lines.read();
        let state_lock = lines.get(&offset).ok_or(Error::NotRequested(offset))?;
        let mut state = state_lock
            .write()
            .map_err(|e| Error::Gpio(format!("lock poisoned: {e}")))?;

        let apply_direction = config.reconfigure_direction
            || !state.configured
            || config.direction != state.config.direction;
        let settings = Self::make_line_settings(config, apply_direction)?;
        let line_cfg = Self::make_line_config(offset, settings)?;

        state
            .handle
            .lock()
            .request
            .reconfigure_lines(&line_cfg)
            .map_err(|e| Error::Gpio(format!("reconfigure lines: {e}")))?;

        state.config = config.clone();
        state.configured = true;
        Ok(())
    }

    fn read_value(&self, offset: u32) -> Result<BinaryValue, Error> {
        let handle = self.request_handle(offset)?;
        let value = handle
            .lock()
            .request
            .value(offset)
            .map_err(|e| Error::Gpio(format!("get value: {e}")))?;
        Ok(match value {
            line::Value::InActive => BinaryValue::Low,
            line::Value::Active => BinaryValue::High,
        })
    }

    fn write_value(&self, offset: u32, value: BinaryValue) -> Result<(), Error> {
        let handle = self.request_handle(offset)?;
        let result = handle.lock().request.set_value(offset, to_gpiod_value(value));
        if let Err(e) = result {
            warn!("set value failed on line {offset}: {e}");
            return Err(Error::Write(offset));
        }
        Ok(())
    }

    fn wait_for_event(&self, offset: u32, timeout: Duration) -> Result<WaitStatus, Error> {
        let handle = self.request_handle(offset)?;
        // The fair mutex keeps reads and writes from starving behind the
        // repeated bounded waits of a watch loop.
        let mut hdl = handle.lock();
        let RequestHandle { request, events } = &mut *hdl;

        let has_event = request
            .wait_edge_events(Some(timeout))
            .map_err(|e| Error::Wait(offset, format!("wait edge events: {e}")))?;
        if !has_event {
            return Ok(WaitStatus::TimedOut);
        }

        let drained = request
            .read_edge_events(events)
            .map_err(|e| Error::Wait(offset, format!("read edge events: {e}")))?;
        Ok(if drained.into_iter().count() > 0 {
            WaitStatus::Event
        } else {
            WaitStatus::TimedOut
        })
    }
}
