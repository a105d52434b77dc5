//! The Keccak-f permutations, their inverses and their step mappings.

use std::fmt;
use std::ops::{BitAnd, BitXor, BitXorAssign};

use crate::parts::LaneValue;
use crate::CoreError;

/// The capability set a lane representation needs for the step mappings:
/// XOR, AND, complement and rotation within the lane. `u64` is the numeric
/// implementation; a symbolic representation can plug in the same way.
pub trait Lane:
    Copy + Eq + BitXor<Output = Self> + BitAnd<Output = Self> + BitXorAssign
{
    /// The all-zero lane.
    fn zero() -> Self;

    /// A lane holding the given constant, masked to the lane size by the
    /// caller.
    fn from_constant(value: LaneValue) -> Self;

    /// The bitwise complement. Bits above the lane size may take any value;
    /// every use below masks them away again.
    fn complement(self) -> Self;

    /// Rotation towards higher z by `offset` (any sign), within a lane of
    /// `lane_size` bits.
    fn rotate(self, offset: i32, lane_size: usize) -> Self;
}

impl Lane for u64 {
    #[inline(always)]
    fn zero() -> Self {
        0
    }

    #[inline(always)]
    fn from_constant(value: LaneValue) -> Self {
        value
    }

    #[inline(always)]
    fn complement(self) -> Self {
        !self
    }

    #[inline(always)]
    fn rotate(self, offset: i32, lane_size: usize) -> Self {
        let mask = !0u64 >> (64 - lane_size);
        let offset = offset.rem_euclid(lane_size as i32) as u32;
        let value = self & mask;
        if offset == 0 {
            value
        } else {
            ((value << offset) ^ (value >> (lane_size as u32 - offset))) & mask
        }
    }
}

/// Which member of the family an instance is; this only affects naming and,
/// for the π-conjugated variant, the byte-level application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flavor {
    F,
    P,
    PStar,
}

/// One of the seven Keccak-f permutations, with a configurable number of
/// rounds and start round index.
///
/// The round function is ι∘χ∘π∘ρ∘θ; round `r` uses the round constant of
/// index `start_round_index + r`. The all-widths byte encoding packs lanes
/// LSB-first within bytes for lane sizes below 8 and little-endian
/// otherwise.
#[derive(Clone, Debug)]
pub struct KeccakF {
    width: usize,
    lane_size: usize,
    nominal_nr_rounds: usize,
    nr_rounds: usize,
    start_round_index: i32,
    rho_offsets: [i32; 25],
    round_constants: Vec<LaneValue>,
    mask: LaneValue,
    flavor: Flavor,
}

fn nominal_nr_rounds(width: usize) -> Result<usize, CoreError> {
    match width {
        25 => Ok(12),
        50 => Ok(14),
        100 => Ok(16),
        200 => Ok(18),
        400 => Ok(20),
        800 => Ok(22),
        1600 => Ok(24),
        _ => Err(CoreError::InvalidWidth(width)),
    }
}

/// Maps (x, y) onto the lane index `(x mod 5) + 5·(y mod 5)`.
pub(crate) fn index(x: i32, y: i32) -> usize {
    (x.rem_euclid(5) + 5 * y.rem_euclid(5)) as usize
}

/// Reduces an x coordinate modulo 5.
pub(crate) fn index_x(x: i32) -> usize {
    x.rem_euclid(5) as usize
}

impl KeccakF {
    /// A Keccak-f instance with the nominal number of rounds for its width.
    pub fn new(width: usize) -> Result<Self, CoreError> {
        Self::any_rounds(width, 0, nominal_nr_rounds(width)?)
    }

    /// A round-reduced instance using the first `nr_rounds` rounds.
    pub fn first_rounds(width: usize, nr_rounds: usize) -> Result<Self, CoreError> {
        Self::any_rounds(width, 0, nr_rounds)
    }

    /// A Keccak-p instance: the last `nr_rounds` rounds of Keccak-f, i.e.
    /// a start round index of nominal − nr_rounds.
    pub fn p(width: usize, nr_rounds: usize) -> Result<Self, CoreError> {
        let nominal = nominal_nr_rounds(width)?;
        let mut f = Self::any_rounds(width, nominal as i32 - nr_rounds as i32, nr_rounds)?;
        f.flavor = Flavor::P;
        Ok(f)
    }

    /// The π-conjugated variant of Keccak-p: π⁻¹ is applied before and π
    /// after the byte-level permutation.
    pub fn p_star(width: usize, nr_rounds: usize) -> Result<Self, CoreError> {
        let mut f = Self::p(width, nr_rounds)?;
        f.flavor = Flavor::PStar;
        Ok(f)
    }

    /// An instance with an arbitrary start round index and round count.
    pub fn any_rounds(
        width: usize,
        start_round_index: i32,
        nr_rounds: usize,
    ) -> Result<Self, CoreError> {
        let nominal = nominal_nr_rounds(width)?;
        let lane_size = width / 25;
        let mask = !0u64 >> (64 - lane_size);
        let mut f = KeccakF {
            width,
            lane_size,
            nominal_nr_rounds: nominal,
            nr_rounds,
            start_round_index,
            rho_offsets: [0; 25],
            round_constants: Vec::new(),
            mask,
            flavor: Flavor::F,
        };
        f.initialize_rho_offsets();
        f.initialize_round_constants();
        Ok(f)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn lane_size(&self) -> usize {
        self.lane_size
    }

    pub fn nr_rounds(&self) -> usize {
        self.nr_rounds
    }

    pub fn nominal_nr_rounds(&self) -> usize {
        self.nominal_nr_rounds
    }

    pub fn index_of_first_round(&self) -> i32 {
        self.start_round_index
    }

    pub fn lane_mask(&self) -> LaneValue {
        self.mask
    }

    /// The ρ offset of lane (x, y).
    pub fn rho_offset(&self, x: i32, y: i32) -> i32 {
        self.rho_offsets[index(x, y)]
    }

    fn initialize_rho_offsets(&mut self) {
        self.rho_offsets[index(0, 0)] = 0;
        let (mut x, mut y) = (1i32, 0i32);
        for t in 0..24i32 {
            self.rho_offsets[index(x, y)] = ((t + 1) * (t + 2) / 2) % self.lane_size as i32;
            let (nx, ny) = (y, (2 * x + 3 * y).rem_euclid(5));
            x = nx;
            y = ny;
        }
    }

    fn initialize_round_constants(&mut self) {
        let mut lfsr = 0x01u8;
        let mut step = |state: &mut u8| -> bool {
            let result = *state & 0x01 != 0;
            if *state & 0x80 != 0 {
                *state = (*state << 1) ^ 0x71;
            } else {
                *state <<= 1;
            }
            result
        };
        self.round_constants.clear();
        for _ in 0..255 {
            let mut c: LaneValue = 0;
            for j in 0..7 {
                let bit_position = (1u32 << j) - 1;
                if step(&mut lfsr) {
                    c ^= 1 << bit_position;
                }
            }
            self.round_constants.push(c & self.mask);
        }
    }

    /// The round constant of the given round index, reduced modulo 255.
    pub fn round_constant(&self, round_index: i32) -> LaneValue {
        self.round_constants[round_index.rem_euclid(255) as usize]
    }

    /// Applies the permutation to a state in the byte encoding.
    pub fn apply(&self, state: &mut [u8]) {
        let mut lanes = self.lanes_from_bytes(state);
        if self.flavor == Flavor::PStar {
            self.inverse_pi(&mut lanes);
            self.forward(&mut lanes);
            self.pi(&mut lanes);
        } else {
            self.forward(&mut lanes);
        }
        self.lanes_to_bytes(&lanes, state);
    }

    /// Applies the inverse permutation to a state in the byte encoding.
    pub fn apply_inverse(&self, state: &mut [u8]) {
        let mut lanes = self.lanes_from_bytes(state);
        if self.flavor == Flavor::PStar {
            self.inverse_pi(&mut lanes);
            self.inverse(&mut lanes);
            self.pi(&mut lanes);
        } else {
            self.inverse(&mut lanes);
        }
        self.lanes_to_bytes(&lanes, state);
    }

    /// All configured rounds, in order.
    pub fn forward<L: Lane>(&self, state: &mut [L; 25]) {
        for i in 0..self.nr_rounds {
            self.round(state, i);
        }
    }

    /// All configured rounds, inverted and in reverse order.
    pub fn inverse<L: Lane>(&self, state: &mut [L; 25]) {
        for i in (0..self.nr_rounds).rev() {
            self.inverse_round(state, i);
        }
    }

    /// One round: ι(χ(π(ρ(θ(state))))).
    pub fn round<L: Lane>(&self, state: &mut [L; 25], round_number: usize) {
        self.theta(state);
        self.rho(state);
        self.pi(state);
        self.chi(state);
        self.iota(state, round_number);
    }

    /// The inverse of one round.
    pub fn inverse_round<L: Lane>(&self, state: &mut [L; 25], round_number: usize) {
        self.iota(state, round_number);
        self.inverse_chi(state);
        self.inverse_pi(state);
        self.inverse_rho(state);
        self.inverse_theta(state);
    }

    /// θ: adds to each bit the parities of two neighbouring columns.
    pub fn theta<L: Lane>(&self, a: &mut [L; 25]) {
        let mut c = [L::zero(); 5];
        for (x, cx) in c.iter_mut().enumerate() {
            for y in 0..5 {
                *cx ^= a[x + 5 * y];
            }
        }
        let mut d = c;
        for dx in d.iter_mut() {
            *dx = dx.rotate(1, self.lane_size);
        }
        for x in 0..5i32 {
            let effect = d[index_x(x + 1)] ^ c[index_x(x - 1)];
            for y in 0..5 {
                a[index(x, y as i32)] ^= effect;
            }
        }
    }

    /// θ⁻¹, from the fixed 64-bit coefficient table reduced modulo 1+z^w.
    pub fn inverse_theta<L: Lane>(&self, a: &mut [L; 25]) {
        let mut c = [L::zero(); 5];
        for (x, cx) in c.iter_mut().enumerate() {
            for y in 0..5 {
                *cx ^= a[x + 5 * y];
            }
        }
        const INVERSE_POSITIONS_64: [u64; 5] = [
            0xDE26BC4D789AF134,
            0x09AF135E26BC4D78,
            0xEBC4D789AF135E26,
            0x7135E26BC4D789AF,
            0xCD789AF135E26BC4,
        ];
        let mut inverse_positions = [0u64; 5];
        let mut z = 0;
        while z < 64 {
            for x in 0..5 {
                inverse_positions[x] ^= INVERSE_POSITIONS_64[x] >> z;
            }
            z += self.lane_size;
        }
        for _ in 0..self.lane_size {
            for x_off in 0..5i32 {
                if inverse_positions[x_off as usize] & 1 != 0 {
                    for x in 0..5i32 {
                        let parity = c[index_x(x - x_off)];
                        for y in 0..5 {
                            a[index(x, y as i32)] ^= parity;
                        }
                    }
                }
            }
            for x_off in 0..5 {
                c[x_off] = c[x_off].rotate(1, self.lane_size);
                inverse_positions[x_off] >>= 1;
            }
        }
    }

    /// θᵀ: like θ but with the effect rotated the other way.
    pub fn theta_transposed<L: Lane>(&self, a: &mut [L; 25]) {
        let mut c = [L::zero(); 5];
        for (x, cx) in c.iter_mut().enumerate() {
            for y in 0..5 {
                *cx ^= a[x + 5 * y];
            }
        }
        for x in 0..5i32 {
            let effect = c[index_x(x - 1)].rotate(-1, self.lane_size) ^ c[index_x(x + 1)];
            for y in 0..5 {
                a[index(x, y as i32)] ^= effect;
            }
        }
    }

    /// Inverts the order of bits within lanes and of sheets within the
    /// state; conjugating θ⁻¹ by this map yields θ⁻ᵀ.
    pub fn theta_trans_envelope(&self, state: &mut [LaneValue; 25]) {
        for y in 0..5 {
            state.swap(index(1, y), index(4, y));
            state.swap(index(2, y), index(3, y));
        }
        for lane in state.iter_mut() {
            let mut forward = *lane;
            let mut reversed: LaneValue = 0;
            for _ in 0..self.lane_size {
                reversed ^= forward & 1;
                forward = forward.rotate(1, self.lane_size);
                reversed = reversed.rotate(-1, self.lane_size);
            }
            *lane = reversed;
        }
    }

    /// ρ: rotates each lane by its offset.
    pub fn rho<L: Lane>(&self, a: &mut [L; 25]) {
        for i in 0..25 {
            a[i] = a[i].rotate(self.rho_offsets[i], self.lane_size);
        }
    }

    /// ρ⁻¹.
    pub fn inverse_rho<L: Lane>(&self, a: &mut [L; 25]) {
        for i in 0..25 {
            a[i] = a[i].rotate(-self.rho_offsets[i], self.lane_size);
        }
    }

    /// The z coordinate of a bit of lane (x, y) after ρ.
    pub fn rho_coordinate(&self, x: usize, y: usize, z: usize) -> usize {
        (z as i32 + self.rho_offsets[index(x as i32, y as i32)])
            .rem_euclid(self.lane_size as i32) as usize
    }

    /// The z coordinate of a bit of lane (x, y) after ρ⁻¹.
    pub fn inverse_rho_coordinate(&self, x: usize, y: usize, z: usize) -> usize {
        (z as i32 - self.rho_offsets[index(x as i32, y as i32)])
            .rem_euclid(self.lane_size as i32) as usize
    }

    /// π as a coordinate map: (x, y) ↦ (y, 2x+3y).
    pub fn pi_coordinates(x: usize, y: usize) -> (usize, usize) {
        (y % 5, (2 * x + 3 * y) % 5)
    }

    /// π⁻¹ as a coordinate map: (X, Y) ↦ (X+3Y, X).
    pub fn inverse_pi_coordinates(x: usize, y: usize) -> (usize, usize) {
        ((x + 3 * y) % 5, x % 5)
    }

    /// π: moves lane (x, y) to (y, 2x+3y).
    pub fn pi<L: Lane>(&self, a: &mut [L; 25]) {
        let old = *a;
        for x in 0..5 {
            for y in 0..5 {
                let (nx, ny) = Self::pi_coordinates(x, y);
                a[nx + 5 * ny] = old[x + 5 * y];
            }
        }
    }

    /// π⁻¹.
    pub fn inverse_pi<L: Lane>(&self, a: &mut [L; 25]) {
        let old = *a;
        for x in 0..5 {
            for y in 0..5 {
                let (ox, oy) = Self::inverse_pi_coordinates(x, y);
                a[ox + 5 * oy] = old[x + 5 * y];
            }
        }
    }

    /// χ: the only non-linear step, row-wise.
    pub fn chi<L: Lane>(&self, a: &mut [L; 25]) {
        for y in 0..5 {
            let mut c = [L::zero(); 5];
            for (x, cx) in c.iter_mut().enumerate() {
                *cx = a[x + 5 * y] ^ (a[(x + 1) % 5 + 5 * y].complement() & a[(x + 2) % 5 + 5 * y]);
            }
            for (x, cx) in c.into_iter().enumerate() {
                a[x + 5 * y] = cx;
            }
        }
    }

    /// χ⁻¹, by the leap-frog recurrence over x ↦ 3x.
    pub fn inverse_chi<L: Lane>(&self, a: &mut [L; 25]) {
        for y in 0..5 {
            let mut c = [L::zero(); 5];
            for (x, cx) in c.iter_mut().enumerate() {
                *cx = a[x + 5 * y];
            }
            for i in 0..6i32 {
                let x = index_x(3 * i);
                a[x + 5 * y] =
                    c[x] ^ (a[index_x(3 * i + 2) + 5 * y] & c[index_x(3 * i + 1)].complement());
            }
        }
    }

    /// ι: adds the round constant of `start_round_index + round_number` into
    /// lane (0, 0). It is its own inverse.
    pub fn iota<L: Lane>(&self, a: &mut [L; 25], round_number: usize) {
        let rc = self.round_constant(self.start_round_index + round_number as i32);
        a[0] ^= L::from_constant(rc);
    }

    /// Decodes a state from its byte encoding.
    pub fn lanes_from_bytes(&self, bytes: &[u8]) -> [LaneValue; 25] {
        let mut lanes = [0; 25];
        if self.lane_size < 8 {
            for (i, lane) in lanes.iter_mut().enumerate() {
                *lane = ((bytes[i * self.lane_size / 8] >> ((i * self.lane_size) % 8))
                    as LaneValue)
                    & self.mask;
            }
        } else {
            let n = self.lane_size / 8;
            for (i, lane) in lanes.iter_mut().enumerate() {
                for j in 0..n {
                    *lane |= (bytes[i * n + j] as LaneValue) << (8 * j);
                }
            }
        }
        lanes
    }

    /// Encodes a state into bytes; the buffer must hold ⌈width/8⌉ bytes.
    pub fn lanes_to_bytes(&self, lanes: &[LaneValue; 25], bytes: &mut [u8]) {
        let nr_bytes = (self.width + 7) / 8;
        for b in bytes.iter_mut().take(nr_bytes) {
            *b = 0;
        }
        if self.lane_size < 8 {
            for (i, &lane) in lanes.iter().enumerate() {
                bytes[i * self.lane_size / 8] |= (lane as u8) << ((i * self.lane_size) % 8);
            }
        } else {
            let n = self.lane_size / 8;
            for (i, &lane) in lanes.iter().enumerate() {
                for j in 0..n {
                    bytes[i * n + j] = (lane >> (8 * j)) as u8;
                }
            }
        }
    }

    /// The θ-gap of a state: half the Hamming weight of the θ-effect.
    pub fn theta_gap(&self, state: &[LaneValue; 25]) -> u32 {
        let parity = crate::parity::parity_of_lanes(state);
        self.theta_gap_from_parity(&parity)
    }

    /// The θ-gap computed from a 5-sheet parity.
    pub fn theta_gap_from_parity(&self, parity: &[LaneValue; 5]) -> u32 {
        let effect = self.theta_effect_from_parity(parity);
        effect.iter().map(|d| d.count_ones()).sum::<u32>() / 2
    }

    /// The θ-effect D from a 5-sheet parity C: D_x = rot(C_{x+1}, 1) ⊕ C_{x−1}.
    pub fn theta_effect_from_parity(&self, c: &[LaneValue; 5]) -> [LaneValue; 5] {
        let mut d = [0; 5];
        for (x, dx) in d.iter_mut().enumerate() {
            *dx = c[(x + 1) % 5].rotate(1, self.lane_size) ^ c[(x + 4) % 5];
        }
        d
    }

    /// The θᵀ-effect from a 5-sheet parity: D_x = rot(C_{x−1}, −1) ⊕ C_{x+1}.
    pub fn theta_transposed_effect_from_parity(&self, c: &[LaneValue; 5]) -> [LaneValue; 5] {
        let mut d = [0; 5];
        for (x, dx) in d.iter_mut().enumerate() {
            *dx = c[(x + 4) % 5].rotate(-1, self.lane_size) ^ c[(x + 1) % 5];
        }
        d
    }

    /// A short identifier suitable as a file-name stem.
    pub fn name(&self) -> String {
        match self.flavor {
            Flavor::F => {
                if self.start_round_index != 0 {
                    format!(
                        "KeccakF-{}-{}-{}",
                        self.width, self.nr_rounds, self.start_round_index
                    )
                } else {
                    format!("KeccakF-{}-{}", self.width, self.nr_rounds)
                }
            }
            Flavor::P => format!("KeccakP-{}-{}", self.width, self.nr_rounds),
            Flavor::PStar => format!("KeccakPStar-{}-{}", self.width, self.nr_rounds),
        }
    }

    /// `prefix + name() + suffix`, the convention for cache and result files.
    pub fn build_file_name(&self, prefix: &str, suffix: &str) -> String {
        format!("{}{}{}", prefix, self.name(), suffix)
    }

    /// The name of lane (x, y): a consonant for y, a vowel for x.
    pub fn lane_name(prefix: &str, x: usize, y: usize) -> String {
        let consonants = ['b', 'g', 'k', 'm', 's'];
        let vowels = ['a', 'e', 'i', 'o', 'u'];
        format!("{}{}{}", prefix, consonants[y % 5], vowels[x % 5])
    }

    /// The name of sheet x.
    pub fn sheet_name(prefix: &str, x: usize) -> String {
        let vowels = ['a', 'e', 'i', 'o', 'u'];
        format!("{}{}", prefix, vowels[x % 5])
    }

    /// The name of bit (x, y, z), with the z coordinate zero-padded as
    /// needed; the alphabetic order matches the sponge bit ordering.
    pub fn bit_name(&self, prefix: &str, x: usize, y: usize, z: usize) -> String {
        let lane = Self::lane_name(prefix, x, y);
        if self.lane_size == 1 {
            lane
        } else if self.lane_size <= 10 {
            format!("{lane}{z}")
        } else {
            format!("{lane}{z:02}")
        }
    }
}

impl fmt::Display for KeccakF {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nr_rounds == self.nominal_nr_rounds && self.start_round_index == 0 {
            write!(f, "Keccak-f[{}]", self.width)
        } else if self.start_round_index + self.nr_rounds as i32 == self.nominal_nr_rounds as i32 {
            write!(f, "Keccak-p[{}, {}]", self.width, self.nr_rounds)
        } else {
            write!(
                f,
                "Keccak-f[{}, {} rounds {}-{}]",
                self.width,
                self.nr_rounds,
                self.start_round_index,
                self.start_round_index + self.nr_rounds as i32 - 1
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn rejects_bad_widths() {
        assert!(KeccakF::new(1600).is_ok());
        assert!(matches!(KeccakF::new(0), Err(CoreError::InvalidWidth(0))));
        assert!(matches!(
            KeccakF::new(512),
            Err(CoreError::InvalidWidth(512))
        ));
    }

    #[test]
    fn keccak_f_1600_kat() {
        // test vector produced by XKCP rev 2a8d2311a830ab3037f8c7ef2511e5c7cc032127
        let f = KeccakF::new(1600).unwrap();
        let mut state = [0u8; 200];
        f.apply(&mut state);
        assert_eq!(
            &state[..],
            &[
                0xe7, 0xdd, 0xe1, 0x40, 0x79, 0x8f, 0x25, 0xf1, 0x8a, 0x47, 0xc0, 0x33, 0xf9, 0xcc,
                0xd5, 0x84, 0xee, 0xa9, 0x5a, 0xa6, 0x1e, 0x26, 0x98, 0xd5, 0x4d, 0x49, 0x80, 0x6f,
                0x30, 0x47, 0x15, 0xbd, 0x57, 0xd0, 0x53, 0x62, 0x05, 0x4e, 0x28, 0x8b, 0xd4, 0x6f,
                0x8e, 0x7f, 0x2d, 0xa4, 0x97, 0xff, 0xc4, 0x47, 0x46, 0xa4, 0xa0, 0xe5, 0xfe, 0x90,
                0x76, 0x2e, 0x19, 0xd6, 0x0c, 0xda, 0x5b, 0x8c, 0x9c, 0x05, 0x19, 0x1b, 0xf7, 0xa6,
                0x30, 0xad, 0x64, 0xfc, 0x8f, 0xd0, 0xb7, 0x5a, 0x93, 0x30, 0x35, 0xd6, 0x17, 0x23,
                0x3f, 0xa9, 0x5a, 0xeb, 0x03, 0x21, 0x71, 0x0d, 0x26, 0xe6, 0xa6, 0xa9, 0x5f, 0x55,
                0xcf, 0xdb, 0x16, 0x7c, 0xa5, 0x81, 0x26, 0xc8, 0x47, 0x03, 0xcd, 0x31, 0xb8, 0x43,
                0x9f, 0x56, 0xa5, 0x11, 0x1a, 0x2f, 0xf2, 0x01, 0x61, 0xae, 0xd9, 0x21, 0x5a, 0x63,
                0xe5, 0x05, 0xf2, 0x70, 0xc9, 0x8c, 0xf2, 0xfe, 0xbe, 0x64, 0x11, 0x66, 0xc4, 0x7b,
                0x95, 0x70, 0x36, 0x61, 0xcb, 0x0e, 0xd0, 0x4f, 0x55, 0x5a, 0x7c, 0xb8, 0xc8, 0x32,
                0xcf, 0x1c, 0x8a, 0xe8, 0x3e, 0x8c, 0x14, 0x26, 0x3a, 0xae, 0x22, 0x79, 0x0c, 0x94,
                0xe4, 0x09, 0xc5, 0xa2, 0x24, 0xf9, 0x41, 0x18, 0xc2, 0x65, 0x04, 0xe7, 0x26, 0x35,
                0xf5, 0x16, 0x3b, 0xa1, 0x30, 0x7f, 0xe9, 0x44, 0xf6, 0x75, 0x49, 0xa2, 0xec, 0x5c,
                0x7b, 0xff, 0xf1, 0xea,
            ]
        );
        let lanes = f.lanes_from_bytes(&state);
        assert_eq!(lanes[0], 0xF1258F7940E1DDE7);
        assert_eq!(lanes[1], 0x84D5CCF933C0478A);
    }

    #[test]
    fn round_constants_match_reference() {
        let f = KeccakF::new(1600).unwrap();
        let reference: [u64; 24] = [
            0x0000000000000001,
            0x0000000000008082,
            0x800000000000808a,
            0x8000000080008000,
            0x000000000000808b,
            0x0000000080000001,
            0x8000000080008081,
            0x8000000000008009,
            0x000000000000008a,
            0x0000000000000088,
            0x0000000080008009,
            0x000000008000000a,
            0x000000008000808b,
            0x800000000000008b,
            0x8000000000008089,
            0x8000000000008003,
            0x8000000000008002,
            0x8000000000000080,
            0x000000000000800a,
            0x800000008000000a,
            0x8000000080008081,
            0x8000000000008080,
            0x0000000080000001,
            0x8000000080008008,
        ];
        for (i, &rc) in reference.iter().enumerate() {
            assert_eq!(f.round_constant(i as i32), rc, "round {i}");
        }
        assert_eq!(f.round_constant(-255), f.round_constant(0));
    }

    #[test]
    fn rho_offsets_match_reference() {
        let f = KeccakF::new(1600).unwrap();
        // FIPS 202, table 2, row-major from (x=0, y=0).
        let reference: [i32; 25] = [
            0, 1, 62, 28, 27, 36, 44, 6, 55, 20, 3, 10, 43, 25, 39, 41, 45, 15, 21, 8, 18, 2, 61,
            56, 14,
        ];
        for y in 0..5 {
            for x in 0..5 {
                assert_eq!(f.rho_offset(x, y), reference[(x + 5 * y) as usize]);
            }
        }
    }

    #[test]
    fn rho_offsets_cover_triangular_numbers() {
        for width in [25, 50, 100, 200, 400, 800, 1600] {
            let f = KeccakF::new(width).unwrap();
            let mut offsets: Vec<i32> = (0..25)
                .filter(|&i| i != 0)
                .map(|i| f.rho_offset(i % 5, i / 5))
                .collect();
            let mut expected: Vec<i32> = (0..24)
                .map(|t| ((t + 1) * (t + 2) / 2) % f.lane_size() as i32)
                .collect();
            offsets.sort_unstable();
            expected.sort_unstable();
            assert_eq!(offsets, expected);
        }
    }

    #[test]
    fn step_mappings_invert() {
        let f = KeccakF::new(200).unwrap();
        let mut state = [0u64; 25];
        for (i, lane) in state.iter_mut().enumerate() {
            *lane = (0x9E3779B97F4A7C15u64.wrapping_mul(i as u64 + 1)) & f.lane_mask();
        }
        let original = state;
        f.theta(&mut state);
        f.inverse_theta(&mut state);
        assert_eq!(state, original);
        f.rho(&mut state);
        f.inverse_rho(&mut state);
        assert_eq!(state, original);
        f.pi(&mut state);
        f.inverse_pi(&mut state);
        assert_eq!(state, original);
        f.chi(&mut state);
        f.inverse_chi(&mut state);
        assert_eq!(state, original);
        f.iota(&mut state, 3);
        f.iota(&mut state, 3);
        assert_eq!(state, original);
    }

    #[test]
    fn theta_trans_envelope_conjugates_transpose() {
        // θᵀ must equal E ∘ θ ∘ E with E the bit/sheet reversal envelope.
        let f = KeccakF::new(400).unwrap();
        let mut state = [0u64; 25];
        for (i, lane) in state.iter_mut().enumerate() {
            *lane = (0xA076_1D64_78BD_642Fu64.wrapping_mul(i as u64 + 7)) & f.lane_mask();
        }
        let mut direct = state;
        f.theta_transposed(&mut direct);
        let mut conjugated = state;
        f.theta_trans_envelope(&mut conjugated);
        f.theta(&mut conjugated);
        f.theta_trans_envelope(&mut conjugated);
        assert_eq!(direct, conjugated);
    }

    #[test]
    fn p_star_is_pi_conjugated() {
        let star = KeccakF::p_star(200, 12).unwrap();
        let plain = KeccakF::p(200, 12).unwrap();
        let mut bytes = [0u8; 25];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(37).wrapping_add(11);
        }
        let mut expected_lanes = plain.lanes_from_bytes(&bytes);
        plain.inverse_pi(&mut expected_lanes);
        plain.forward(&mut expected_lanes);
        plain.pi(&mut expected_lanes);
        let mut actual = bytes;
        star.apply(&mut actual);
        let mut expected = [0u8; 25];
        plain.lanes_to_bytes(&expected_lanes, &mut expected);
        assert_eq!(actual, expected);
        star.apply_inverse(&mut actual);
        assert_eq!(actual, bytes);
    }

    #[test]
    fn names_and_descriptions() {
        assert_eq!(KeccakF::new(1600).unwrap().name(), "KeccakF-1600-24");
        assert_eq!(KeccakF::p(1600, 12).unwrap().name(), "KeccakP-1600-12");
        assert_eq!(
            KeccakF::new(1600).unwrap().to_string(),
            "Keccak-f[1600]"
        );
        assert_eq!(
            KeccakF::p(1600, 12).unwrap().to_string(),
            "Keccak-p[1600, 12]"
        );
        assert_eq!(KeccakF::lane_name("a", 0, 0), "aba");
        assert_eq!(KeccakF::sheet_name("d", 4), "du");
    }

    proptest! {
        #[test]
        fn permutation_round_trip(seed in any::<u64>(), width_index in 0usize..7) {
            let widths = [25, 50, 100, 200, 400, 800, 1600];
            let f = KeccakF::new(widths[width_index]).unwrap();
            let mut state = [0u64; 25];
            let mut v = seed | 1;
            for lane in state.iter_mut() {
                v = v.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                *lane = v & f.lane_mask();
            }
            let original = state;
            f.forward(&mut state);
            f.inverse(&mut state);
            prop_assert_eq!(state, original);
            f.inverse(&mut state);
            f.forward(&mut state);
            prop_assert_eq!(state, original);
        }

        #[test]
        fn byte_codec_round_trip(seed in any::<u64>(), width_index in 0usize..7) {
            let widths = [25, 50, 100, 200, 400, 800, 1600];
            let f = KeccakF::new(widths[width_index]).unwrap();
            let mut state = [0u64; 25];
            let mut v = seed;
            for lane in state.iter_mut() {
                v = v.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                *lane = v & f.lane_mask();
            }
            let mut bytes = vec![0u8; (f.width() + 7) / 8];
            f.lanes_to_bytes(&state, &mut bytes);
            prop_assert_eq!(f.lanes_from_bytes(&bytes), state);
        }
    }
}
