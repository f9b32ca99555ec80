//! Supported idle states and their MWAIT hints.
//!
//! The numeric id of a state is what travels over the wire (`3` for C3, `6`
//! for C6, ...). The hint is the value placed in EAX for MWAIT. The table
//! below is the only place either mapping lives.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Highest number of logical cores a core mask can address.
///
/// Must stay a multiple of 32 so masks split evenly into words.
pub const MAX_CORES: usize = 512;

/// Number of 32-bit words in a [`CoreMask`](crate::command::CoreMask).
pub const MASK_WORDS: usize = MAX_CORES / 32;

/// Hard ceiling on a requested idle duration, in microseconds.
pub const MAX_DURATION_US: u32 = 15_000_000;

/// Size of a worker's watched region in bytes.
pub const TRIGGER_REGION_BYTES: usize = 64;

/// Idle state a core can be parked in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleState {
    /// C0: the core stays active inside MWAIT with the "no C-state" hint.
    Active,
    /// C1 halt.
    C1,
    /// C3 (caches flushed on most parts).
    C3,
    /// C6 (core power-gated).
    C6,
    /// C7.
    C7,
}

impl IdleState {
    /// Every supported state, shallowest first.
    pub const ALL: [IdleState; 5] = [
        IdleState::Active,
        IdleState::C1,
        IdleState::C3,
        IdleState::C6,
        IdleState::C7,
    ];

    /// Numeric id used on the wire.
    pub fn id(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::C1 => 1,
            Self::C3 => 3,
            Self::C6 => 6,
            Self::C7 => 7,
        }
    }

    /// Look a state up by its wire id.
    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.id() == id)
    }

    /// MWAIT hint for this state.
    ///
    /// These are the values that actually reach C3/C6 on Intel server parts;
    /// deriving the hint as `(state - 1) << 4` does not.
    pub fn mwait_hint(self) -> u32 {
        match self {
            Self::Active => 0xF0,
            Self::C1 => 0x00,
            Self::C3 => 0x10,
            Self::C6 => 0x20,
            Self::C7 => 0x30,
        }
    }
}

impl fmt::Display for IdleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::C1 => write!(f, "c1"),
            Self::C3 => write!(f, "c3"),
            Self::C6 => write!(f, "c6"),
            Self::C7 => write!(f, "c7"),
        }
    }
}

impl FromStr for IdleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" | "c0" | "0" => Ok(Self::Active),
            "c1" | "1" => Ok(Self::C1),
            "c3" | "3" => Ok(Self::C3),
            "c6" | "6" => Ok(Self::C6),
            "c7" | "7" => Ok(Self::C7),
            other => Err(format!(
                "unsupported idle state '{other}' (expected active, c1, c3, c6 or c7)"
            )),
        }
    }
}
