//! Fixed-size binary records and the two request channels built on them.
//!
//! All fields are little-endian in C natural layout.
//!
//! Idle-state record, 76 bytes:
//!
//! | offset | size | field                      |
//! |-------:|-----:|----------------------------|
//! | 0      | 1    | type, `b'c'`               |
//! | 1      | 3    | padding                    |
//! | 4      | 64   | core mask, 16 x `u32`      |
//! | 68     | 1    | state id                   |
//! | 69     | 3    | padding                    |
//! | 72     | 4    | duration in µs             |
//!
//! Register record, 24 bytes:
//!
//! | offset | size | field     |
//! |-------:|-----:|-----------|
//! | 0      | 4    | core      |
//! | 4      | 4    | register  |
//! | 8      | 8    | value     |
//! | 16     | 1    | ready     |
//! | 17     | 7    | padding   |

use std::fmt;
use std::sync::Mutex;

use crate::broker::{RegisterRequest, RegisterResponse};
use crate::command::{CoreMask, IdleRequest, RejectReason};
use crate::endpoint::{Accepted, CommandEndpoint};
use crate::state::MASK_WORDS;

pub const IDLE_RECORD_LEN: usize = 76;
pub const REGISTER_RECORD_LEN: usize = 24;

/// Type tag of a C-state step record.
pub const STEP_CSTATE: u8 = b'c';

const MASK_OFFSET: usize = 4;
const STATE_OFFSET: usize = 68;
const DURATION_OFFSET: usize = 72;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    BadLength { expected: usize, actual: usize },
    BadType(u8),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadLength { expected, actual } => {
                write!(f, "record is {actual} bytes, expected {expected}")
            }
            Self::BadType(t) => write!(f, "unknown record type {t:#04x}"),
        }
    }
}

impl std::error::Error for WireError {}

impl From<WireError> for RejectReason {
    fn from(e: WireError) -> Self {
        match e {
            WireError::BadLength { .. } => RejectReason::MalformedRequest,
            WireError::BadType(_) => RejectReason::InvalidType,
        }
    }
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), WireError> {
    if buf.len() == expected {
        Ok(())
    } else {
        Err(WireError::BadLength {
            expected,
            actual: buf.len(),
        })
    }
}

fn u32_at(buf: &[u8], offset: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(b)
}

// ---------------------------------------------------------------------------
// Idle-state record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleRecord {
    pub kind: u8,
    pub core_mask: CoreMask,
    pub state: u8,
    pub duration_us: u32,
}

impl IdleRecord {
    pub fn from_request(request: &IdleRequest) -> Self {
        Self {
            kind: STEP_CSTATE,
            core_mask: request.core_mask,
            state: request.state,
            duration_us: request.duration_us,
        }
    }

    pub fn encode(&self) -> [u8; IDLE_RECORD_LEN] {
        let mut buf = [0u8; IDLE_RECORD_LEN];
        buf[0] = self.kind;
        for (i, word) in self.core_mask.words().iter().enumerate() {
            let at = MASK_OFFSET + i * 4;
            buf[at..at + 4].copy_from_slice(&word.to_le_bytes());
        }
        buf[STATE_OFFSET] = self.state;
        buf[DURATION_OFFSET..].copy_from_slice(&self.duration_us.to_le_bytes());
        buf
    }

    /// Parse a record. Only the length is checked here.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        check_len(buf, IDLE_RECORD_LEN)?;
        let mut words = [0u32; MASK_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = u32_at(buf, MASK_OFFSET + i * 4);
        }
        Ok(Self {
            kind: buf[0],
            core_mask: CoreMask::from_words(words),
            state: buf[STATE_OFFSET],
            duration_us: u32_at(buf, DURATION_OFFSET),
        })
    }

    /// The request this record carries, if it is a C-state step.
    pub fn into_request(self) -> Result<IdleRequest, WireError> {
        if self.kind != STEP_CSTATE {
            return Err(WireError::BadType(self.kind));
        }
        Ok(IdleRequest {
            core_mask: self.core_mask,
            state: self.state,
            duration_us: self.duration_us,
        })
    }
}

// ---------------------------------------------------------------------------
// Register record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterRecord {
    pub core: u32,
    pub register: u32,
    pub value: u64,
    pub ready: bool,
}

impl RegisterRecord {
    pub fn request(core: u32, register: u32) -> Self {
        Self {
            core,
            register,
            ..Self::default()
        }
    }

    pub fn encode(&self) -> [u8; REGISTER_RECORD_LEN] {
        let mut buf = [0u8; REGISTER_RECORD_LEN];
        buf[0..4].copy_from_slice(&self.core.to_le_bytes());
        buf[4..8].copy_from_slice(&self.register.to_le_bytes());
        buf[8..16].copy_from_slice(&self.value.to_le_bytes());
        buf[16] = u8::from(self.ready);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        check_len(buf, REGISTER_RECORD_LEN)?;
        let mut value = [0u8; 8];
        value.copy_from_slice(&buf[8..16]);
        Ok(Self {
            core: u32_at(buf, 0),
            register: u32_at(buf, 4),
            value: u64::from_le_bytes(value),
            ready: buf[16] != 0,
        })
    }
}

impl From<RegisterResponse> for RegisterRecord {
    fn from(r: RegisterResponse) -> Self {
        Self {
            core: r.core,
            register: r.register,
            value: r.value,
            ready: r.ready,
        }
    }
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// Write-only channel taking idle-state records.
pub struct IdleChannel<'a> {
    endpoint: &'a CommandEndpoint,
}

impl<'a> IdleChannel<'a> {
    pub fn new(endpoint: &'a CommandEndpoint) -> Self {
        Self { endpoint }
    }

    /// Decode and submit one record, keeping the launch handle.
    pub fn submit(&self, buf: &[u8]) -> Result<Accepted, RejectReason> {
        let request = IdleRecord::decode(buf)
            .and_then(IdleRecord::into_request)
            .inspect_err(|e| log::info!("idle record refused: {e}"))?;
        self.endpoint.submit_idle_command(&request)
    }

    /// Submit one record; the launch runs detached. Returns the bytes consumed.
    pub fn write(&self, buf: &[u8]) -> Result<usize, RejectReason> {
        self.submit(buf).map(|_| buf.len())
    }

    /// Nothing to read on this channel.
    pub fn read(&self, _buf: &mut [u8]) -> usize {
        0
    }
}

/// Request/response channel for register reads, one request in flight.
///
/// A write performs the read; the next read returns its response record.
/// A second write before that read replaces the pending response.
pub struct RegisterChannel<'a> {
    endpoint: &'a CommandEndpoint,
    pending: Mutex<Option<RegisterRecord>>,
}

impl<'a> RegisterChannel<'a> {
    pub fn new(endpoint: &'a CommandEndpoint) -> Self {
        Self {
            endpoint,
            pending: Mutex::new(None),
        }
    }

    /// Perform the request in `buf`. Only `core` and `register` are used.
    pub fn write(&self, buf: &[u8]) -> Result<usize, WireError> {
        let record = RegisterRecord::decode(buf)?;
        let mut pending = self.pending.lock().unwrap();
        let response = self.endpoint.submit_register_read(&RegisterRequest {
            core: record.core,
            register: record.register,
        });
        *pending = Some(response.into());
        Ok(buf.len())
    }

    /// Copy the pending response into `buf`. Returns 0 if there is none.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        if buf.len() < REGISTER_RECORD_LEN {
            return Err(WireError::BadLength {
                expected: REGISTER_RECORD_LEN,
                actual: buf.len(),
            });
        }
        match self.pending.lock().unwrap().take() {
            Some(record) => {
                buf[..REGISTER_RECORD_LEN].copy_from_slice(&record.encode());
                Ok(REGISTER_RECORD_LEN)
            }
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::msr::MSR_IA32_MPERF;
    use crate::testing::{orchestrator, test_config};

    fn idle_bytes(mask: u64, state: u8, duration_us: u32) -> [u8; IDLE_RECORD_LEN] {
        IdleRecord::from_request(&IdleRequest {
            core_mask: CoreMask::from_u64(mask),
            state,
            duration_us,
        })
        .encode()
    }

    // -----------------------------------------------------------------------
    // Layout
    // -----------------------------------------------------------------------

    #[test]
    fn idle_record_layout() {
        let buf = idle_bytes(0x1_0000_0005, 6, 2000);
        assert_eq!(buf[0], b'c');
        assert_eq!(&buf[1..4], &[0, 0, 0]);
        assert_eq!(&buf[4..8], &5u32.to_le_bytes());
        assert_eq!(&buf[8..12], &1u32.to_le_bytes());
        assert_eq!(buf[68], 6);
        assert_eq!(&buf[72..76], &2000u32.to_le_bytes());
    }

    #[test]
    fn register_record_layout() {
        let rec = RegisterRecord {
            core: 3,
            register: 0xE7,
            value: 0x0102_0304_0506_0708,
            ready: true,
        };
        let buf = rec.encode();
        assert_eq!(&buf[0..4], &3u32.to_le_bytes());
        assert_eq!(&buf[4..8], &0xE7u32.to_le_bytes());
        assert_eq!(&buf[8..16], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(buf[16], 1);
        assert_eq!(&buf[17..], &[0; 7]);
        assert_eq!(RegisterRecord::decode(&buf), Ok(rec));
    }

    #[test]
    fn wrong_type_tag() {
        let mut buf = idle_bytes(1, 1, 10);
        buf[0] = b'p';
        assert_eq!(
            IdleRecord::decode(&buf).and_then(IdleRecord::into_request),
            Err(WireError::BadType(b'p'))
        );
    }

    // -----------------------------------------------------------------------
    // Idle channel
    // -----------------------------------------------------------------------

    #[test]
    fn idle_channel_accepts_full_record() {
        let ep = CommandEndpoint::new(orchestrator(4, &[], test_config()).0);
        let channel = IdleChannel::new(&ep);
        let accepted = channel.submit(&idle_bytes(0b0101, 6, 500)).unwrap();
        assert_eq!(accepted.handle.join().unwrap().launched_cores(), vec![0, 2]);
        assert_eq!(channel.write(&idle_bytes(0b1, 1, 10)), Ok(IDLE_RECORD_LEN));
        assert_eq!(channel.read(&mut [0u8; 8]), 0);
        assert!(ep.orchestrator().shutdown(std::time::Duration::from_secs(2)));
    }

    #[test]
    fn idle_channel_reason_order() {
        let ep = CommandEndpoint::new(orchestrator(4, &[], test_config()).0);
        let channel = IdleChannel::new(&ep);

        assert_eq!(
            channel.write(&[0u8; 75]),
            Err(RejectReason::MalformedRequest)
        );
        // Bad type wins over a bad state.
        let mut buf = idle_bytes(1, 99, 10);
        buf[0] = 0;
        assert_eq!(channel.write(&buf), Err(RejectReason::InvalidType));
        // Bad state wins over bad cores and duration.
        assert_eq!(
            channel.write(&idle_bytes(1 << 40, 99, u32::MAX)),
            Err(RejectReason::InvalidState)
        );
        assert_eq!(
            channel.write(&idle_bytes(1 << 40, 6, u32::MAX)),
            Err(RejectReason::CoreOutOfRange)
        );
        assert_eq!(
            channel.write(&idle_bytes(1, 6, 15_000_001)),
            Err(RejectReason::DurationTooLarge)
        );
        assert_eq!(RejectReason::MalformedRequest.code(), 6);
    }

    // -----------------------------------------------------------------------
    // Register channel
    // -----------------------------------------------------------------------

    #[test]
    fn register_channel_round_trip() {
        let (orch, regs) = orchestrator(2, &[], test_config());
        regs.set(1, MSR_IA32_MPERF, 0xFEED);
        let ep = CommandEndpoint::new(orch);
        let channel = RegisterChannel::new(&ep);

        let mut out = [0u8; REGISTER_RECORD_LEN];
        assert_eq!(channel.read(&mut out), Ok(0));

        let req = RegisterRecord::request(1, MSR_IA32_MPERF).encode();
        assert_eq!(channel.write(&req), Ok(REGISTER_RECORD_LEN));
        assert_eq!(channel.read(&mut out), Ok(REGISTER_RECORD_LEN));
        let resp = RegisterRecord::decode(&out).unwrap();
        assert_eq!(resp.value, 0xFEED);
        assert!(resp.ready);

        // Consumed.
        assert_eq!(channel.read(&mut out), Ok(0));
    }

    #[test]
    fn register_channel_rejects_short_buffers() {
        let ep = CommandEndpoint::new(orchestrator(1, &[], test_config()).0);
        let channel = RegisterChannel::new(&ep);
        assert!(matches!(
            channel.write(&[0u8; 16]),
            Err(WireError::BadLength { actual: 16, .. })
        ));
        assert!(channel.read(&mut [0u8; 8]).is_err());
    }
}
