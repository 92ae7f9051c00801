//! Globally unique 64-bit identifiers.

use std::sync::Mutex;

use time::OffsetDateTime;

use crate::domain::error::DomainError;
use crate::util::lock::mutex_lock;

const SOURCE: &str = "application::ids";

const MACHINE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_MACHINE_ID: u16 = (1 << MACHINE_BITS) - 1;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;
const TIMESTAMP_SHIFT: u32 = MACHINE_BITS + SEQUENCE_BITS;

pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> i64;
}

#[derive(Debug, Default)]
struct Clock {
    last_ms: i64,
    sequence: i64,
}

/// Snowflake layout: 41-bit milliseconds since `epoch`, 10-bit machine id, 12-bit sequence.
///
/// Ids from one generator strictly increase. When the wall clock stalls, runs backwards or the
/// sequence is exhausted within a millisecond, the generator borrows the next millisecond instead
/// of blocking.
#[derive(Debug)]
pub struct SnowflakeIds {
    epoch_ms: i64,
    machine_id: i64,
    clock: Mutex<Clock>,
}

impl SnowflakeIds {
    pub fn new(machine_id: u16, epoch: OffsetDateTime) -> Result<Self, DomainError> {
        if machine_id > MAX_MACHINE_ID {
            return Err(DomainError::validation(format!(
                "machine id must be at most {MAX_MACHINE_ID}, got {machine_id}"
            )));
        }
        if epoch > OffsetDateTime::now_utc() {
            return Err(DomainError::validation("id epoch lies in the future"));
        }
        Ok(Self {
            epoch_ms: unix_millis(epoch),
            machine_id: i64::from(machine_id),
            clock: Mutex::new(Clock::default()),
        })
    }

    fn compose(&self, elapsed_ms: i64, sequence: i64) -> i64 {
        (elapsed_ms << TIMESTAMP_SHIFT) | (self.machine_id << SEQUENCE_BITS) | sequence
    }
}

impl IdGenerator for SnowflakeIds {
    fn next_id(&self) -> i64 {
        let now_ms = unix_millis(OffsetDateTime::now_utc()) - self.epoch_ms;
        let mut clock = mutex_lock(&self.clock, SOURCE, "next_id");
        if now_ms > clock.last_ms {
            clock.last_ms = now_ms;
            clock.sequence = 0;
        } else {
            clock.sequence = (clock.sequence + 1) & SEQUENCE_MASK;
            if clock.sequence == 0 {
                clock.last_ms += 1;
            }
        }
        self.compose(clock.last_ms, clock.sequence)
    }
}

fn unix_millis(at: OffsetDateTime) -> i64 {
    i64::try_from(at.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}
