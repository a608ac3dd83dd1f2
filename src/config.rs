use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Input,
    Output,
    OutputHigh,
    OutputLow,
}

impl Direction {
    pub fn is_input(&self) -> bool {
        matches!(self, Direction::Input)
    }

    pub fn is_output(&self) -> bool {
        matches!(
            self,
            Direction::Output | Direction::OutputHigh | Direction::OutputLow
        )
    }

    /// Logical level driven as soon as the direction is applied, if any.
    pub fn initial_level(&self) -> Option<BinaryValue> {
        match self {
            Direction::OutputHigh => Some(BinaryValue::High),
            Direction::OutputLow => Some(BinaryValue::Low),
            _ => None,
        }
    }
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Input
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Edge {
    None,
    Rising,
    Falling,
    Both,
}

impl Default for Edge {
    fn default() -> Self {
        Edge::None
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BinaryValue {
    Low,
    High,
}

impl BinaryValue {
    pub fn inverted(&self) -> BinaryValue {
        match self {
            BinaryValue::Low => BinaryValue::High,
            BinaryValue::High => BinaryValue::Low,
        }
    }
}

fn default_reconfigure_direction() -> bool {
    true
}

/// Complete per-line configuration. Every reconfiguration sends the whole
/// struct to the backend, never a diff.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LineConfig {
    pub direction: Direction,
    #[serde(default)]
    pub edge: Edge,
    #[serde(default)]
    pub active_low: bool,
    #[serde(default)]
    pub debounce_ms: u64,
    #[serde(default = "default_reconfigure_direction")]
    pub reconfigure_direction: bool,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self::new(Direction::Input)
    }
}

impl LineConfig {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            edge: Edge::None,
            active_low: false,
            debounce_ms: 0,
            reconfigure_direction: true,
        }
    }

    pub fn input() -> Self {
        Self::new(Direction::Input)
    }

    pub fn output() -> Self {
        Self::new(Direction::Output)
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edge = edge;
        self
    }

    pub fn with_active_low(mut self, active_low: bool) -> Self {
        self.active_low = active_low;
        self
    }

    pub fn with_debounce_ms(mut self, debounce_ms: u64) -> Self {
        self.debounce_ms = debounce_ms;
        self
    }

    pub fn with_reconfigure_direction(mut self, reconfigure: bool) -> Self {
        self.reconfigure_direction = reconfigure;
        self
    }

    /// Edge detection only makes sense on an input line; everything else is
    /// accepted as-is.
    pub fn validate(&self) -> Result<(), Error> {
        if self.edge != Edge::None && !self.direction.is_input() {
            return Err(Error::Config(format!(
                "edge detection requires direction input, not {:?}",
                self.direction
            )));
        }
        Ok(())
    }
}
