#[cfg(feature = "hardware-gpio")]
pub mod libgpiod;
pub mod mock;

#[cfg(feature = "hardware-gpio")]
pub use libgpiod::{DEFAULT_CHIP_LABEL_PATTERN, LibgpiodBackend};
pub use mock::MockGpioBackend;
