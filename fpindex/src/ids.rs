//! Generated ids.
//!
//! Layout, most significant bit first:
//!
//! ```text
//! [63..32] milliseconds since the Unix epoch (low 32 bits)
//! [31..16] random
//! [15..0]  per-index counter, wrapping
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Source of ids for points inserted without one.
#[derive(Debug, Default)]
pub struct IdGenerator {
    counter: AtomicU64,
}

impl IdGenerator {
    /// The first id generated carries `start + 1` in its counter bits.
    pub fn new(start: u64) -> Self {
        Self {
            counter: AtomicU64::new(start),
        }
    }

    /// Compose a fresh id from the clock, random bits and the counter.
    pub fn next_id(&self) -> i64 {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        let random = u64::from(rand::thread_rng().gen::<u32>() & 0xffff_0000);
        let count = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        compose(millis, random, count)
    }

    /// Counter value of the last id handed out.
    pub fn counter(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

#[inline]
fn compose(millis: u64, random: u64, count: u64) -> i64 {
    ((millis << 32) | (random & 0xffff_0000) | (count & 0xffff)) as i64
}
