//! The coverage map: an ordered list of ticks partitioning the digest
//! domain. Each tick owns the interval to its right and counts how many
//! partitions cover it; new partitions are assigned the least-covered
//! interval.

use skerry_types::{KeyDigest, Range, RangeKey, SkerryError, DOMAIN_MAX};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Tick {
    pub value: KeyDigest,
    pub covers: u64,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Coverage {
    ticks: Vec<Tick>,
}

impl Coverage {
    pub fn new() -> Self {
        Coverage { ticks: Vec::new() }
    }

    /// Seed ticks at `i * MAX / goal` for `i ∈ [0, goal]`; a zero goal seeds
    /// only the domain bounds.
    pub fn setup(goal: u64) -> Self {
        let mut coverage = Coverage::new();
        if goal == 0 {
            coverage.add_tick(Tick { value: [0u8; 32], covers: 0 });
            coverage.add_tick(Tick { value: DOMAIN_MAX, covers: 0 });
            return coverage;
        }
        for i in 0..=goal {
            coverage.add_tick(Tick { value: tick_value(i, goal), covers: 0 });
        }
        coverage
    }

    /// Insert at the ordered position; a tick with an already-present value
    /// is dropped, keeping values strictly increasing.
    pub fn add_tick(&mut self, tick: Tick) {
        match self.ticks.binary_search_by(|t| t.value.cmp(&tick.value)) {
            Ok(_) => {}
            Err(at) => self.ticks.insert(at, tick),
        }
    }

    /// The interval a newly registered partition should take: the one whose
    /// left tick has the minimum cover count. Returns the range key and the
    /// left tick's position for [`bump_ticks`](Self::bump_ticks).
    pub fn next_partition_range(&self) -> Result<(RangeKey, usize), SkerryError> {
        if self.ticks.len() < 2 {
            return Err(SkerryError::Internal("coverage is not properly set up".into()));
        }
        let mut min_at = 0;
        for (at, tick) in self.ticks[..self.ticks.len() - 1].iter().enumerate() {
            if tick.covers < self.ticks[min_at].covers {
                min_at = at;
            }
        }
        let range = Range::new(self.ticks[min_at].value, self.ticks[min_at + 1].value);
        Ok((range.as_key(), min_at))
    }

    /// Record one more partition covering the interval right of this tick.
    pub fn bump_ticks(&mut self, lower_at: usize) {
        if let Some(tick) = self.ticks.get_mut(lower_at) {
            tick.covers += 1;
        }
    }

    pub fn ticks(&self) -> &[Tick] {
        &self.ticks
    }
}

/// `floor(i * (2^256 - 1) / goal)` as a 32-byte big-endian digest, without a
/// bignum dependency: byte-wise multiply then base-256 long division.
fn tick_value(i: u64, goal: u64) -> KeyDigest {
    assert!(goal > 0, "tick seeding requires a positive goal");
    assert!(i <= goal, "tick position beyond the goal");

    // numerator = (2^256 - 1) * i, little-endian u8 limbs, up to 40 bytes.
    let mut numerator = [0u8; 40];
    let mut carry: u128 = 0;
    for limb in numerator.iter_mut().take(32) {
        let product = 0xFFu128 * i as u128 + carry;
        *limb = (product & 0xFF) as u8;
        carry = product >> 8;
    }
    for limb in numerator.iter_mut().skip(32) {
        *limb = (carry & 0xFF) as u8;
        carry >>= 8;
    }

    // quotient = numerator / goal, big-endian long division.
    let mut quotient = [0u8; 40];
    let mut rem: u128 = 0;
    for at in (0..40).rev() {
        let acc = (rem << 8) | numerator[at] as u128;
        quotient[at] = (acc / goal as u128) as u8;
        rem = acc % goal as u128;
    }

    // i <= goal keeps the quotient within 256 bits.
    let mut out = [0u8; 32];
    for (at, b) in quotient.iter().take(32).enumerate() {
        out[31 - at] = *b;
    }
    out
}
