//! Idle commands: the core mask, validation, and rejection reasons.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::state::{IdleState, MASK_WORDS, MAX_CORES};

/// Bitset of logical cores, bit `i` selecting core `i`.
///
/// Stored as 32-bit words so it matches the wire record word for word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CoreMask {
    words: [u32; MASK_WORDS],
}

impl CoreMask {
    /// Empty mask.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mask from raw words (word 0 holds cores 0..32).
    pub fn from_words(words: [u32; MASK_WORDS]) -> Self {
        Self { words }
    }

    /// Mask whose low 64 bits are `bits`.
    pub fn from_u64(bits: u64) -> Self {
        let mut mask = Self::new();
        mask.words[0] = bits as u32;
        mask.words[1] = (bits >> 32) as u32;
        mask
    }

    /// Mask selecting the given cores. Cores at or past [`MAX_CORES`] are ignored.
    pub fn from_cores(cores: impl IntoIterator<Item = u32>) -> Self {
        let mut mask = Self::new();
        for core in cores {
            mask.set(core);
        }
        mask
    }

    /// Select `core`. Returns `false` if it is past [`MAX_CORES`].
    pub fn set(&mut self, core: u32) -> bool {
        let core = core as usize;
        if core >= MAX_CORES {
            return false;
        }
        self.words[core / 32] |= 1u32 << (core % 32);
        true
    }

    /// Whether `core` is selected.
    pub fn contains(&self, core: u32) -> bool {
        let core = core as usize;
        core < MAX_CORES && self.words[core / 32] & (1u32 << (core % 32)) != 0
    }

    pub fn words(&self) -> &[u32; MASK_WORDS] {
        &self.words
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Number of selected cores.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Selected cores in ascending order.
    pub fn cores(&self) -> impl Iterator<Item = u32> + '_ {
        (0..MAX_CORES as u32).filter(move |&c| self.contains(c))
    }

    /// Whether any core at or past `limit` is selected.
    pub fn exceeds(&self, limit: usize) -> bool {
        if limit >= MAX_CORES {
            return false;
        }
        let word = limit / 32;
        let keep = ((1u64 << (limit % 32)) - 1) as u32;
        if self.words[word] & !keep != 0 {
            return true;
        }
        self.words[word + 1..].iter().any(|&w| w != 0)
    }
}

impl fmt::Display for CoreMask {
    /// Renders as a compact list, e.g. `0,2,4-7`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cores: Vec<u32> = self.cores().collect();
        if cores.is_empty() {
            return write!(f, "(none)");
        }
        let mut parts = Vec::new();
        let mut start = cores[0];
        let mut prev = cores[0];
        for &c in &cores[1..] {
            if c == prev + 1 {
                prev = c;
                continue;
            }
            parts.push(range_label(start, prev));
            start = c;
            prev = c;
        }
        parts.push(range_label(start, prev));
        write!(f, "{}", parts.join(","))
    }
}

impl std::str::FromStr for CoreMask {
    type Err = String;

    /// Accepts a core list (`0,2,4-7`) or a hex mask (`0x5`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            return parse_hex_mask(hex);
        }
        let mut mask = CoreMask::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (lo, hi) = match part.split_once('-') {
                Some((lo, hi)) => (parse_core(lo)?, parse_core(hi)?),
                None => {
                    let c = parse_core(part)?;
                    (c, c)
                }
            };
            if lo > hi {
                return Err(format!("empty core range '{part}'"));
            }
            for core in lo..=hi {
                mask.set(core);
            }
        }
        if mask.is_empty() {
            return Err("no cores selected".to_string());
        }
        Ok(mask)
    }
}

fn parse_core(s: &str) -> Result<u32, String> {
    let core: u32 = s
        .trim()
        .parse()
        .map_err(|_| format!("'{s}' is not a core number"))?;
    if core as usize >= MAX_CORES {
        return Err(format!("core {core} is past the {MAX_CORES}-core limit"));
    }
    Ok(core)
}

fn parse_hex_mask(hex: &str) -> Result<CoreMask, String> {
    if hex.is_empty() {
        return Err("empty hex mask".to_string());
    }
    let mut mask = CoreMask::new();
    for (i, ch) in hex.chars().rev().filter(|&c| c != '_').enumerate() {
        let nibble = ch
            .to_digit(16)
            .ok_or_else(|| format!("'{ch}' is not a hex digit"))?;
        for bit in 0..4 {
            if nibble & (1 << bit) != 0 {
                let core = (i * 4 + bit) as u32;
                if !mask.set(core) {
                    return Err(format!("core {core} is past the {MAX_CORES}-core limit"));
                }
            }
        }
    }
    Ok(mask)
}

fn range_label(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}-{end}")
    }
}

/// Why an idle command (or one core of it) was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    /// Record type tag was not the C-state step type.
    InvalidType,
    /// State id is not one of active/C1/C3/C6/C7.
    InvalidState,
    /// Mask selects a core the machine does not have.
    CoreOutOfRange,
    /// Duration above the configured ceiling.
    DurationTooLarge,
    /// A worker for one core could not be started.
    AllocationFailure,
    /// Record had the wrong size.
    MalformedRequest,
}

impl RejectReason {
    /// Numeric reason code carried on the idle-state channel.
    pub fn code(self) -> u8 {
        match self {
            Self::InvalidType => 1,
            Self::InvalidState => 2,
            Self::CoreOutOfRange => 3,
            Self::DurationTooLarge => 4,
            Self::AllocationFailure => 5,
            Self::MalformedRequest => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::InvalidType),
            2 => Some(Self::InvalidState),
            3 => Some(Self::CoreOutOfRange),
            4 => Some(Self::DurationTooLarge),
            5 => Some(Self::AllocationFailure),
            6 => Some(Self::MalformedRequest),
            _ => None,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidType => write!(f, "record type is not a c-state step"),
            Self::InvalidState => write!(f, "state out of range"),
            Self::CoreOutOfRange => write!(f, "cpu cores specified out of range"),
            Self::DurationTooLarge => write!(f, "duration exceeds the allowed maximum"),
            Self::AllocationFailure => write!(f, "could not start a worker"),
            Self::MalformedRequest => write!(f, "request record has the wrong size"),
        }
    }
}

impl std::error::Error for RejectReason {}

/// An idle request exactly as a client sent it, before validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleRequest {
    pub core_mask: CoreMask,
    /// Raw state id (`6` for C6).
    pub state: u8,
    pub duration_us: u32,
}

/// A validated idle command. Only [`IdleCommand::validate`] builds one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleCommand {
    core_mask: CoreMask,
    state: IdleState,
    duration_us: u32,
}

impl IdleCommand {
    /// Check a request against the machine and the duration ceiling.
    ///
    /// Checks run in the order state, cores, duration; the first failure wins.
    pub fn validate(
        request: &IdleRequest,
        online_cores: usize,
        max_duration_us: u32,
    ) -> Result<Self, RejectReason> {
        let state = IdleState::from_id(request.state).ok_or(RejectReason::InvalidState)?;

        if online_cores >= MAX_CORES || request.core_mask.exceeds(online_cores) {
            return Err(RejectReason::CoreOutOfRange);
        }

        if request.duration_us > max_duration_us {
            return Err(RejectReason::DurationTooLarge);
        }

        Ok(Self {
            core_mask: request.core_mask,
            state,
            duration_us: request.duration_us,
        })
    }

    pub fn core_mask(&self) -> &CoreMask {
        &self.core_mask
    }

    pub fn state(&self) -> IdleState {
        self.state
    }

    pub fn duration_us(&self) -> u32 {
        self.duration_us
    }
}
