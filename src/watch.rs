use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError, sync_channel};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::config::BinaryValue;
use crate::error::Error;
use crate::line::{GpioBackend, WaitStatus};

/// Subscriber invoked once per delivered edge event, or once with `Err` when
/// the background wait fails. Registration identity is the `Arc` pointer:
/// registering the same `Arc` twice creates two independent entries.
pub type WatchCallback = Arc<dyn Fn(Result<BinaryValue, Error>) + Send + Sync>;

pub(crate) type WatcherList = Arc<Mutex<Vec<WatchCallback>>>;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const EVENT_WAIT_TICK: Duration = Duration::from_millis(10);

enum WatchMessage {
    Edge(BinaryValue),
    Failed(Error),
}

/// Pair of background threads behind a watched line: a wait thread blocking
/// on the backend in short ticks and a dispatch thread debouncing and
/// fanning events out to the registered callbacks.
pub(crate) struct InterruptWatcher {
    offset: u32,
    cancel: Arc<AtomicBool>,
    wait_thread: Option<JoinHandle<()>>,
    dispatch_thread: Option<JoinHandle<()>>,
}

impl InterruptWatcher {
    pub(crate) fn spawn(
        backend: Arc<dyn GpioBackend>,
        offset: u32,
        debounce_ms: u64,
        watchers: WatcherList,
    ) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let (event_tx, event_rx) = sync_channel(EVENT_CHANNEL_CAPACITY);

        let wait_thread = {
            let cancel = cancel.clone();
            std::thread::spawn(move || wait_loop(backend, offset, cancel, event_tx))
        };
        let dispatch_thread = {
            let cancel = cancel.clone();
            std::thread::spawn(move || dispatch_loop(event_rx, cancel, debounce_ms, watchers))
        };

        debug!("started edge watcher for line {offset}");
        Self {
            offset,
            cancel,
            wait_thread: Some(wait_thread),
            dispatch_thread: Some(dispatch_thread),
        }
    }
}

impl Drop for InterruptWatcher {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.wait_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.dispatch_thread.take() {
            // A callback may drop the watcher from inside the dispatch
            // thread; the thread exits on channel disconnect, so it is
            // detached instead of self-joined.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
        debug!("stopped edge watcher for line {}", self.offset);
    }
}

// Blocks in short ticks so a stop request takes effect within one tick. A
// failed wait or sample is fatal: the error goes out on the event channel
// exactly once and the loop exits.
fn wait_loop(
    backend: Arc<dyn GpioBackend>,
    offset: u32,
    cancel: Arc<AtomicBool>,
    event_tx: SyncSender<WatchMessage>,
) {
    while !cancel.load(Ordering::Relaxed) {
        match backend.wait_for_event(offset, EVENT_WAIT_TICK) {
            Ok(WaitStatus::TimedOut) => {}
            Ok(WaitStatus::Event) => match backend.read_value(offset) {
                Ok(value) => {
                    if !send_unless_stopped(&event_tx, &cancel, WatchMessage::Edge(value)) {
                        return;
                    }
                }
                Err(e) => {
                    warn!("value sample after edge failed on line {offset}: {e}");
                    send_unless_stopped(&event_tx, &cancel, WatchMessage::Failed(e));
                    return;
                }
            },
            Err(e) => {
                warn!("edge wait failed on line {offset}: {e}");
                send_unless_stopped(&event_tx, &cancel, WatchMessage::Failed(e));
                return;
            }
        }
    }
}

// Backpressure for a full channel: retry once per tick, giving up as soon as
// a stop is requested or the receiver is gone. A blocking send could not
// observe a stop issued from the dispatch thread, which is the one draining
// the channel. Returns whether the message was delivered.
fn send_unless_stopped(
    event_tx: &SyncSender<WatchMessage>,
    cancel: &AtomicBool,
    mut message: WatchMessage,
) -> bool {
    loop {
        match event_tx.try_send(message) {
            Ok(()) => return true,
            Err(TrySendError::Full(rejected)) => {
                if cancel.load(Ordering::Relaxed) {
                    return false;
                }
                message = rejected;
                std::thread::sleep(EVENT_WAIT_TICK);
            }
            Err(TrySendError::Disconnected(_)) => return false,
        }
    }
}

// Trailing-edge debounce: an event opens a quiet window of `debounce_ms`,
// any further event replaces the pending value and restarts the window, and
// the pending value is delivered once the window elapses undisturbed. A
// debounce of zero passes every event through in arrival order. Once a stop
// is requested nothing more is delivered: the pending value and any messages
// still buffered in the channel are discarded.
fn dispatch_loop(
    event_rx: Receiver<WatchMessage>,
    cancel: Arc<AtomicBool>,
    debounce_ms: u64,
    watchers: WatcherList,
) {
    let quiet_window = Duration::from_millis(debounce_ms);

    loop {
        match event_rx.recv() {
            // Wait thread gone without a failure: the watcher was stopped.
            Err(_) => return,
            // Buffered messages do not outlive a stop request.
            Ok(_) if cancel.load(Ordering::Relaxed) => return,
            Ok(WatchMessage::Failed(e)) => {
                fan_out(&watchers, &Err(e));
                return;
            }
            Ok(WatchMessage::Edge(value)) => {
                if debounce_ms == 0 {
                    fan_out(&watchers, &Ok(value));
                    continue;
                }
                let mut pending = value;
                loop {
                    match event_rx.recv_timeout(quiet_window) {
                        Ok(_) if cancel.load(Ordering::Relaxed) => return,
                        Ok(WatchMessage::Edge(next)) => pending = next,
                        Ok(WatchMessage::Failed(e)) => {
                            // The value debounce was holding goes out first,
                            // then the failure, preserving arrival order.
                            fan_out(&watchers, &Ok(pending));
                            fan_out(&watchers, &Err(e));
                            return;
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if cancel.load(Ordering::Relaxed) {
                                return;
                            }
                            fan_out(&watchers, &Ok(pending));
                            break;
                        }
                        // Stop request mid-window: the pending value is
                        // discarded, nothing is delivered after a stop.
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
            }
        }
    }
}

// Snapshot under the lock, invoke outside it: entries added or removed
// during a pass do not affect that pass, and callbacks run unlocked.
fn fan_out(watchers: &WatcherList, event: &Result<BinaryValue, Error>) {
    let snapshot: Vec<WatchCallback> = watchers.lock().clone();
    for watcher in snapshot {
        watcher(event.clone());
    }
}
