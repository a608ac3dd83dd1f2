use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to write to gpio {0}")]
    Write(u32),

    #[error("Edge wait failed on gpio {0}: {1}")]
    Wait(u32, String),

    #[error("Line {0} not requested")]
    NotRequested(u32),

    #[error("GPIO error: {0}")]
    Gpio(String),
}
