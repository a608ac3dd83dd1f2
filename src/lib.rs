//! A single GPIO line as a stateful object: synchronous read/write,
//! direction/edge/polarity reconfiguration, and debounced edge watching
//! backed by a blocking wait loop off the caller's thread.

mod backend;
mod config;
mod error;
mod line;
mod watch;

pub use config::{BinaryValue, Direction, Edge, LineConfig};
pub use error::Error;
pub use line::{GpioBackend, Line, WaitStatus};
pub use watch::WatchCallback;

#[cfg(feature = "hardware-gpio")]
pub use backend::{DEFAULT_CHIP_LABEL_PATTERN, LibgpiodBackend};
pub use backend::MockGpioBackend;
