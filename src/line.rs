use std::sync::Arc;
use std::time::Duration;

use log::warn;
use parking_lot::Mutex;

use crate::config::{BinaryValue, Direction, Edge, LineConfig};
use crate::error::Error;
use crate::watch::{InterruptWatcher, WatchCallback, WatcherList};

/// Capability set the line core consumes. Implementations own the chip and
/// line plumbing and apply polarity themselves, so values crossing this
/// boundary are always logical levels.
pub trait GpioBackend: Send + Sync {
    fn chip_label(&self) -> Result<String, Error>;
    fn line_count(&self) -> Result<u32, Error>;
    fn request_line(&self, offset: u32) -> Result<(), Error>;
    fn release_line(&self, offset: u32) -> Result<(), Error>;
    fn configure_line(&self, offset: u32, config: &LineConfig) -> Result<(), Error>;
    fn read_value(&self, offset: u32) -> Result<BinaryValue, Error>;
    fn write_value(&self, offset: u32, value: BinaryValue) -> Result<(), Error>;
    /// Bounded blocking wait for a qualifying edge. `Err` is fatal to the
    /// caller's wait loop.
    fn wait_for_event(&self, offset: u32, timeout: Duration) -> Result<WaitStatus, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Event,
    TimedOut,
}

/// A single requested GPIO line: synchronous value access, live
/// reconfiguration and debounced edge watching. Dropping the handle stops
/// any watcher and releases the line.
pub struct Line<B: GpioBackend> {
    backend: Arc<B>,
    offset: u32,
    config: LineConfig,
    watchers: WatcherList,
    watcher: Option<InterruptWatcher>,
}

impl<B: GpioBackend + 'static> Line<B> {
    /// Requests the line and applies the full configuration once. The line
    /// stays exclusively owned until the handle is dropped.
    pub fn new(backend: Arc<B>, offset: u32, config: LineConfig) -> Result<Self, Error> {
        config.validate()?;
        backend.request_line(offset)?;
        if let Err(e) = backend.configure_line(offset, &config) {
            let _ = backend.release_line(offset);
            return Err(e);
        }

        Ok(Self {
            backend,
            offset,
            config,
            watchers: Arc::new(Mutex::new(Vec::new())),
            watcher: None,
        })
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn config(&self) -> &LineConfig {
        &self.config
    }

    pub fn direction(&self) -> Direction {
        self.config.direction
    }

    pub fn edge(&self) -> Edge {
        self.config.edge
    }

    pub fn active_low(&self) -> bool {
        self.config.active_low
    }

    /// True while a watch handle is installed. The handle survives a fatal
    /// wait failure; only unwatching or reconfiguring clears it.
    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    pub fn read_value(&self) -> Result<BinaryValue, Error> {
        self.backend.read_value(self.offset)
    }

    pub fn write_value(&self, value: BinaryValue) -> Result<(), Error> {
        self.backend.write_value(self.offset, value)
    }

    /// Async adapter over [`Line::read_value`]; the underlying I/O stays
    /// synchronous on the blocking pool.
    pub async fn read(&self) -> Result<BinaryValue, Error> {
        let backend = self.backend.clone();
        let offset = self.offset;
        tokio::task::spawn_blocking(move || backend.read_value(offset))
            .await
            .map_err(|e| Error::Gpio(format!("read task: {e}")))?
    }

    /// Async adapter over [`Line::write_value`].
    pub async fn write(&self, value: BinaryValue) -> Result<(), Error> {
        let backend = self.backend.clone();
        let offset = self.offset;
        tokio::task::spawn_blocking(move || backend.write_value(offset, value))
            .await
            .map_err(|e| Error::Gpio(format!("write task: {e}")))?
    }

    pub fn set_direction(&mut self, direction: Direction) -> Result<(), Error> {
        let mut config = self.config.clone();
        config.direction = direction;
        self.apply_config(config)
    }

    pub fn set_edge(&mut self, edge: Edge) -> Result<(), Error> {
        let mut config = self.config.clone();
        config.edge = edge;
        self.apply_config(config)
    }

    pub fn set_active_low(&mut self, active_low: bool) -> Result<(), Error> {
        let mut config = self.config.clone();
        config.active_low = active_low;
        self.apply_config(config)
    }

    // The backend always receives the complete configuration, so reapplying
    // after a single field change is idempotent. On failure the stored
    // configuration is left untouched. Sequencing a reconfiguration against
    // live watch deliveries is the caller's job.
    fn apply_config(&mut self, config: LineConfig) -> Result<(), Error> {
        config.validate()?;
        self.backend.configure_line(self.offset, &config)?;
        self.config = config;
        self.sync_watcher();
        Ok(())
    }

    /// Registers a callback for edge deliveries, in registration order.
    /// Registering the same `Arc` twice creates two entries that are invoked
    /// independently. The background watcher starts once the registry is
    /// non-empty, edge detection is enabled and the direction is input.
    pub fn watch(&mut self, callback: WatchCallback) {
        self.watchers.lock().push(callback);
        self.sync_watcher();
    }

    /// Removes the first registered entry that is the same `Arc` as
    /// `callback`; a duplicate registration keeps its remaining entries. The
    /// watcher stops when the registry empties.
    pub fn unwatch(&mut self, callback: &WatchCallback) {
        {
            let mut watchers = self.watchers.lock();
            if let Some(index) = watchers.iter().position(|w| Arc::ptr_eq(w, callback)) {
                watchers.remove(index);
            }
        }
        self.sync_watcher();
    }

    pub fn unwatch_all(&mut self) {
        self.watchers.lock().clear();
        self.sync_watcher();
    }

    // Teardown order: the registry is mutated first and the watcher stopped
    // second, so a late in-flight event fans out to the updated list, never
    // a stale one.
    fn sync_watcher(&mut self) {
        let should_run = !self.watchers.lock().is_empty()
            && self.config.edge != Edge::None
            && self.config.direction.is_input();

        if should_run {
            if self.watcher.is_none() {
                self.watcher = Some(InterruptWatcher::spawn(
                    self.backend.clone(),
                    self.offset,
                    self.config.debounce_ms,
                    self.watchers.clone(),
                ));
            }
        } else if let Some(watcher) = self.watcher.take() {
            drop(watcher);
        }
    }
}

impl<B: GpioBackend> Drop for Line<B> {
    fn drop(&mut self) {
        self.watchers.lock().clear();
        self.watcher = None;
        if let Err(e) = self.backend.release_line(self.offset) {
            warn!("release of line {} failed: {e}", self.offset);
        }
    }
}
