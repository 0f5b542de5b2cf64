//! Per-node state values.
//!
//! A [`NodeState`] is the unit every other module trades in: nodes report
//! one, operators set a wanted one, and the generator derives a current one
//! for the published cluster state.
//!
//! The [`State`] enum is declared in rank order, so the derived `Ord` is the
//! availability order used by [`NodeState::above`]:
//!
//! ```text
//! Maintenance < Down < Stopping < Initializing < Retired < Up
//! ```

use super::node::NodeType;
use crate::error::{ControllerError, Result};
use std::fmt;

/// Default number of bucket bits a node reports using.
pub const DEFAULT_MIN_USED_BITS: u32 = 16;

/// Init progress below this value means the node is still listing buckets
/// and cannot serve anything yet.
pub const LISTING_BUCKETS_INIT_PROGRESS_LIMIT: f64 = 0.01;

const FLOAT_TOLERANCE: f64 = 0.000_000_000_1;

/// Node availability, ordered from least to most available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum State {
    Maintenance,
    Down,
    Stopping,
    Initializing,
    Retired,
    Up,
}

impl State {
    /// Every state, lowest rank first.
    pub const ALL: [State; 6] = [
        State::Maintenance,
        State::Down,
        State::Stopping,
        State::Initializing,
        State::Retired,
        State::Up,
    ];

    /// Single character code used by the compact cluster state format.
    pub fn code(&self) -> char {
        match self {
            State::Maintenance => 'm',
            State::Down => 'd',
            State::Stopping => 's',
            State::Initializing => 'i',
            State::Retired => 'r',
            State::Up => 'u',
        }
    }

    pub fn from_code(code: &str) -> Result<Self> {
        match code {
            "m" => Ok(State::Maintenance),
            "d" => Ok(State::Down),
            "s" => Ok(State::Stopping),
            "i" => Ok(State::Initializing),
            "r" => Ok(State::Retired),
            "u" => Ok(State::Up),
            other => Err(ControllerError::InvalidState(format!(
                "unknown state code '{}'",
                other
            ))),
        }
    }

    /// Whether a node may report this state about itself.
    pub fn valid_reported(&self) -> bool {
        matches!(
            self,
            State::Down | State::Stopping | State::Initializing | State::Up
        )
    }

    /// Whether an operator may set this state as wanted for this node type.
    pub fn valid_wanted_for(&self, node_type: NodeType) -> bool {
        match self {
            State::Up | State::Down => true,
            State::Maintenance | State::Retired => node_type == NodeType::Storage,
            State::Stopping | State::Initializing => false,
        }
    }

    /// Whether this state may appear in a published cluster state.
    pub fn valid_current_for(&self, node_type: NodeType) -> bool {
        match self {
            State::Maintenance | State::Retired => node_type == NodeType::Storage,
            _ => true,
        }
    }

    /// Up, Initializing or Retired: the node takes part in the cluster.
    pub fn is_available(&self) -> bool {
        matches!(self, State::Up | State::Initializing | State::Retired)
    }

    /// Down, Stopping or Maintenance: the node should not be contacted for
    /// cluster state pushes.
    pub fn is_down_like(&self) -> bool {
        matches!(self, State::Down | State::Stopping | State::Maintenance)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Maintenance => "Maintenance",
            State::Down => "Down",
            State::Stopping => "Stopping",
            State::Initializing => "Initializing",
            State::Retired => "Retired",
            State::Up => "Up",
        };
        f.write_str(name)
    }
}

/// The state of one node, as reported, wanted or derived.
///
/// Equality compares every field except the description.
#[derive(Debug, Clone)]
pub struct NodeState {
    node_type: NodeType,
    state: State,
    description: String,
    capacity: f64,
    init_progress: f64,
    min_used_bits: u32,
    start_timestamp: u64,
}

impl NodeState {
    /// A state with default capacity, bits and no start timestamp.
    pub fn new(node_type: NodeType, state: State) -> Self {
        Self {
            node_type,
            state,
            description: String::new(),
            capacity: 1.0,
            init_progress: 0.0,
            min_used_bits: DEFAULT_MIN_USED_BITS,
            start_timestamp: 0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_init_progress(mut self, progress: f64) -> Self {
        self.init_progress = progress.clamp(0.0, 1.0);
        self
    }

    pub fn with_start_timestamp(mut self, timestamp: u64) -> Self {
        self.start_timestamp = timestamp;
        self
    }

    pub fn with_min_used_bits(mut self, bits: u32) -> Self {
        self.min_used_bits = bits;
        self
    }

    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn init_progress(&self) -> f64 {
        self.init_progress
    }

    pub fn min_used_bits(&self) -> u32 {
        self.min_used_bits
    }

    pub fn start_timestamp(&self) -> u64 {
        self.start_timestamp
    }

    pub fn set_state(&mut self, state: State) {
        self.state = state;
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    pub fn set_start_timestamp(&mut self, timestamp: u64) {
        self.start_timestamp = timestamp;
    }

    pub fn set_init_progress(&mut self, progress: f64) {
        self.init_progress = progress.clamp(0.0, 1.0);
    }

    /// Whether this state ranks strictly above `other`.
    pub fn above(&self, other: &NodeState) -> bool {
        self.state > other.state
    }

    /// Similar enough that publishing a change is not worth it. Storage
    /// init progress on opposite sides of the listing-buckets limit counts
    /// as a difference.
    pub fn similar_to(&self, other: &NodeState) -> bool {
        if !self.similar_to_ignoring_init_progress(other) {
            return false;
        }
        if self.node_type == NodeType::Storage {
            let below = self.init_progress < LISTING_BUCKETS_INIT_PROGRESS_LIMIT;
            let other_below = other.init_progress < LISTING_BUCKETS_INIT_PROGRESS_LIMIT;
            if below != other_below {
                return false;
            }
        }
        true
    }

    /// Compares state, capacity and start timestamp only.
    pub fn similar_to_ignoring_init_progress(&self, other: &NodeState) -> bool {
        self.state == other.state
            && (self.capacity - other.capacity).abs() <= FLOAT_TOLERANCE
            && self.start_timestamp == other.start_timestamp
    }

    /// Whether every field holds the value a missing node would have.
    pub(crate) fn is_default_down(&self) -> bool {
        self.state == State::Down
            && self.start_timestamp == 0
            && self.min_used_bits == DEFAULT_MIN_USED_BITS
            && (self.capacity - 1.0).abs() <= FLOAT_TOLERANCE
    }

    /// Append the non-default fields in compact form, each key prefixed.
    pub(crate) fn write_compact(&self, prefix: &str, out: &mut String) {
        use std::fmt::Write;
        if self.state != State::Up {
            let _ = write!(out, " {}s:{}", prefix, self.state.code());
        }
        if self.state == State::Initializing {
            let _ = write!(out, " {}i:{}", prefix, self.init_progress);
        }
        if self.start_timestamp != 0 {
            let _ = write!(out, " {}t:{}", prefix, self.start_timestamp);
        }
        if self.min_used_bits != DEFAULT_MIN_USED_BITS {
            let _ = write!(out, " {}b:{}", prefix, self.min_used_bits);
        }
        if (self.capacity - 1.0).abs() > FLOAT_TOLERANCE {
            let _ = write!(out, " {}c:{}", prefix, self.capacity);
        }
    }

    /// Apply one compact `key:value` field.
    pub(crate) fn apply_compact_field(&mut self, key: &str, value: &str) -> Result<()> {
        let invalid = |what: &str| {
            ControllerError::InvalidState(format!("invalid {} value '{}'", what, value))
        };
        match key {
            "s" => self.state = State::from_code(value)?,
            "i" => self.init_progress = value.parse().map_err(|_| invalid("init progress"))?,
            "t" => self.start_timestamp = value.parse().map_err(|_| invalid("start timestamp"))?,
            "b" => self.min_used_bits = value.parse().map_err(|_| invalid("min used bits"))?,
            "c" => self.capacity = value.parse().map_err(|_| invalid("capacity"))?,
            "m" => self.description = value.to_string(),
            other => {
                return Err(ControllerError::InvalidState(format!(
                    "unknown node state key '{}'",
                    other
                )))
            }
        }
        Ok(())
    }
}

impl PartialEq for NodeState {
    fn eq(&self, other: &Self) -> bool {
        self.node_type == other.node_type
            && self.state == other.state
            && (self.capacity - other.capacity).abs() <= FLOAT_TOLERANCE
            && (self.init_progress - other.init_progress).abs() <= FLOAT_TOLERANCE
            && self.min_used_bits == other.min_used_bits
            && self.start_timestamp == other.start_timestamp
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state)?;
        if self.state == State::Initializing {
            write!(f, " ({:.1} %)", self.init_progress * 100.0)?;
        }
        if self.start_timestamp != 0 {
            write!(f, ", start timestamp {}", self.start_timestamp)?;
        }
        if !self.description.is_empty() {
            write!(f, ": {}", self.description)?;
        }
        Ok(())
    }
}
