/// Approximate frequency counter: a count-min sketch of 4-bit counters.
///
/// Each `u64` cell packs sixteen saturating nibbles. For a fingerprint,
/// four (cell, nibble) slots are derived with different multiplicative
/// seeds; `estimate` returns the minimum of the four counters and
/// `increment` bumps all four. Counters saturate at 15.
///
/// When total increments reach `8 * cells`, every counter is halved. This
/// ages out stale history so the sketch tracks the current hot set rather
/// than all traffic ever seen.
pub struct FrequencySketch {
    table: Vec<u64>,
    additions: u64,
}

const DEPTH: usize = 4;

const SEEDS: [u64; DEPTH] = [
    0x9E37_79B9_7F4A_7C15,
    0xC2B2_AE3D_27D4_EB4F,
    0x1656_67B1_9E37_79F9,
    0xD6E8_FEB8_6659_FD93,
];

/// Clears the top bit of every nibble before a halving shift so no bit
/// bleeds into the neighbouring counter.
const HALVE_MASK: u64 = 0x7777_7777_7777_7777;

impl FrequencySketch {
    /// Size the sketch for roughly `capacity` distinct keys.
    pub fn new(capacity: usize) -> Self {
        let cells = capacity.next_power_of_two().max(8);
        FrequencySketch {
            table: vec![0; cells],
            additions: 0,
        }
    }

    /// Estimated frequency of `fingerprint`, in `[0, 15]`.
    #[inline]
    pub fn estimate(&self, fingerprint: u64) -> u8 {
        let mut freq = 0x0F;
        for depth in 0..DEPTH {
            let (cell, shift) = self.slot(fingerprint, depth);
            freq = freq.min(((self.table[cell] >> shift) & 0xF) as u8);
        }
        freq
    }

    /// Bump the four counters for `fingerprint`, halving the table when
    /// the aging threshold is crossed.
    pub fn increment(&mut self, fingerprint: u64) {
        let mut bumped = false;
        for depth in 0..DEPTH {
            let (cell, shift) = self.slot(fingerprint, depth);
            if (self.table[cell] >> shift) & 0xF < 15 {
                self.table[cell] += 1 << shift;
                bumped = true;
            }
        }
        if bumped {
            self.additions += 1;
            if self.additions >= self.age_threshold() {
                self.halve();
            }
        }
    }

    fn halve(&mut self) {
        for cell in &mut self.table {
            *cell = (*cell >> 1) & HALVE_MASK;
        }
        self.additions /= 2;
    }

    #[inline]
    fn age_threshold(&self) -> u64 {
        self.table.len() as u64 * 8
    }

    /// `(cell index, nibble bit shift)` for one of the four depths.
    #[inline]
    fn slot(&self, fingerprint: u64, depth: usize) -> (usize, usize) {
        let mixed = fingerprint.wrapping_mul(SEEDS[depth]);
        let cell = (mixed >> 32) as usize & (self.table.len() - 1);
        let shift = ((mixed >> 28) as usize & 0xF) << 2;
        (cell, shift)
    }
}
