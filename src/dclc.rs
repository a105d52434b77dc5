//! Differential and linear propagation tables of χ, and the linear layer λ
//! between two χ applications.

use std::fs::{self, File};
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;

use crate::parts::{
    from_lanes_to_slices, from_slices_to_lanes, get_row_from_slice, get_slice_of_lanes,
    set_row_of_lanes, LaneValue, RowValue, SliceValue,
};
use crate::permutation::KeccakF;
use crate::CoreError;

/// The linear steps between two χ layers, in one of four modes:
///
/// - `Straight`: π∘ρ∘θ;
/// - `Inverse`: θ⁻¹∘ρ⁻¹∘π⁻¹;
/// - `Transpose`: θᵀ∘ρ⁻¹∘π⁻¹;
/// - `Dual`: π∘ρ∘θ⁻ᵀ.
///
/// The part before θ is the identity for `Straight` and `Dual`; the part
/// after θ is the identity for `Inverse` and `Transpose`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LambdaMode {
    Straight = 0,
    Inverse = 1,
    Transpose = 2,
    Dual = 3,
}

impl LambdaMode {
    pub const ALL: [LambdaMode; 4] = [
        LambdaMode::Straight,
        LambdaMode::Inverse,
        LambdaMode::Transpose,
        LambdaMode::Dual,
    ];

    /// True iff θ comes right after χ in this mode, i.e. the before-θ part
    /// is the identity.
    pub fn theta_just_after_chi(self) -> bool {
        matches!(self, LambdaMode::Straight | LambdaMode::Dual)
    }

    /// True iff θ comes right before χ in this mode, i.e. the after-θ part
    /// is the identity.
    pub fn theta_just_before_chi(self) -> bool {
        matches!(self, LambdaMode::Inverse | LambdaMode::Transpose)
    }
}

/// The output row patterns (differences or masks) compatible with one input
/// row pattern, sorted by non-decreasing propagation weight.
#[derive(Clone, Debug, Default)]
pub struct ListOfRowPatterns {
    /// The compatible output patterns, lightest first.
    pub values: Vec<RowValue>,
    /// `weights[i]` is the propagation weight of `values[i]`.
    pub weights: Vec<u32>,
    /// The smallest weight in the list, 0 if the list is empty.
    pub min_weight: u32,
    /// The largest weight in the list, 0 if the list is empty.
    pub max_weight: u32,
}

impl ListOfRowPatterns {
    /// Inserts a pattern, keeping the list sorted by weight. Patterns of
    /// equal weight keep their insertion order.
    pub fn add(&mut self, value: RowValue, weight: u32) {
        let i = self.weights.partition_point(|&w| w <= weight);
        self.values.insert(i, value);
        self.weights.insert(i, weight);
        if self.values.len() == 1 {
            self.min_weight = weight;
            self.max_weight = weight;
        } else {
            self.min_weight = self.min_weight.min(weight);
            self.max_weight = self.max_weight.max(weight);
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True iff `value` appears in the list.
    pub fn contains(&self, value: RowValue) -> bool {
        self.values.contains(&value)
    }
}

/// A Keccak-f instance extended with the row-level differential and linear
/// tables of χ and the slice-granular lookup tables of λ.
///
/// The λ tables give, per mode, the contribution of an input row (at height
/// y of input slice iz) to each output slice; λ of a whole state is the XOR
/// of the table entries of its rows. The full table is persisted to
/// `"<name>-lambda.cache"` next to being computed, since it is by far the
/// most expensive part of construction for the larger widths.
pub struct KeccakFDcLc {
    /// The underlying permutation, with its nominal number of rounds.
    pub keccak_f: KeccakF,
    /// Output differences of χ per input difference.
    pub diff_chi: Vec<ListOfRowPatterns>,
    /// Output differences of χ⁻¹ per input difference.
    pub diff_inv_chi: Vec<ListOfRowPatterns>,
    /// Output masks of χ per input mask.
    pub corr_chi: Vec<ListOfRowPatterns>,
    /// Output masks of χ⁻¹ per input mask.
    pub corr_inv_chi: Vec<ListOfRowPatterns>,
    inverse_chi_row: [RowValue; 32],
    lambda_row_to_slice: [Vec<SliceValue>; 4],
    lambda_before_theta_row_to_slice: [Vec<SliceValue>; 4],
    lambda_after_theta_row_to_slice: [Vec<SliceValue>; 4],
}

fn differential_weight(count: u32) -> u32 {
    // Counts of the 5-bit chi are powers of two dividing 32.
    (32 / count).trailing_zeros()
}

fn linear_weight(correlation: i32) -> u32 {
    2 * (32 / correlation.unsigned_abs()).trailing_zeros()
}

fn dot_product(a: RowValue, b: RowValue) -> u32 {
    (a & b & 0x1F).count_ones() & 1
}

impl KeccakFDcLc {
    /// Builds the tables for the given width, using the process working
    /// directory for the λ cache file.
    pub fn new(width: usize) -> Result<Self, CoreError> {
        Self::with_cache_dir(width, Path::new("."))
    }

    /// Builds the tables for the given width, looking for (and writing) the
    /// λ cache file in `cache_dir`.
    pub fn with_cache_dir(width: usize, cache_dir: &Path) -> Result<Self, CoreError> {
        let keccak_f = KeccakF::new(width)?;
        let mut dclc = KeccakFDcLc {
            keccak_f,
            diff_chi: Vec::new(),
            diff_inv_chi: Vec::new(),
            corr_chi: Vec::new(),
            corr_inv_chi: Vec::new(),
            inverse_chi_row: [0; 32],
            lambda_row_to_slice: Default::default(),
            lambda_before_theta_row_to_slice: Default::default(),
            lambda_after_theta_row_to_slice: Default::default(),
        };
        for a in 0..32 {
            dclc.inverse_chi_row[dclc.chi_on_row(a as RowValue) as usize] = a as RowValue;
        }
        dclc.initialize_chi_tables();
        dclc.initialize_lambda_tables(cache_dir);
        Ok(dclc)
    }

    /// A short width-only identifier, used as the cache-file stem.
    pub fn name(&self) -> String {
        format!("KeccakF-{}", self.keccak_f.width())
    }

    /// `prefix + name() + suffix`.
    pub fn build_file_name(&self, prefix: &str, suffix: &str) -> String {
        format!("{}{}{}", prefix, self.name(), suffix)
    }

    pub fn lane_size(&self) -> usize {
        self.keccak_f.lane_size()
    }

    /// χ restricted to a single row.
    pub fn chi_on_row(&self, a: RowValue) -> RowValue {
        let mut b = 0;
        for x in 0..5 {
            let ax = (a >> x) & 1;
            let ax1 = (a >> ((x + 1) % 5)) & 1;
            let ax2 = (a >> ((x + 2) % 5)) & 1;
            b |= (ax ^ ((ax1 ^ 1) & ax2)) << x;
        }
        b
    }

    /// χ⁻¹ restricted to a single row.
    pub fn inverse_chi_on_row(&self, a: RowValue) -> RowValue {
        self.inverse_chi_row[(a & 0x1F) as usize]
    }

    fn initialize_chi_tables(&mut self) {
        for da in 0..32u8 {
            let mut count = [0u32; 32];
            for a in 0..32u8 {
                count[(self.chi_on_row(a) ^ self.chi_on_row(a ^ da)) as usize] += 1;
            }
            let mut list = ListOfRowPatterns::default();
            for (db, &c) in count.iter().enumerate() {
                if c != 0 {
                    list.add(db as RowValue, differential_weight(c));
                }
            }
            self.diff_chi.push(list);
        }
        for da in 0..32u8 {
            let mut count = [0u32; 32];
            for a in 0..32u8 {
                count[(self.inverse_chi_on_row(a) ^ self.inverse_chi_on_row(a ^ da)) as usize] += 1;
            }
            let mut list = ListOfRowPatterns::default();
            for (db, &c) in count.iter().enumerate() {
                if c != 0 {
                    list.add(db as RowValue, differential_weight(c));
                }
            }
            self.diff_inv_chi.push(list);
        }
        for ua in 0..32u8 {
            let mut list = ListOfRowPatterns::default();
            for ub in 0..32u8 {
                let mut count = [0i32; 2];
                for a in 0..32u8 {
                    let b = self.chi_on_row(a);
                    count[(dot_product(a, ua) ^ dot_product(b, ub)) as usize] += 1;
                }
                let correlation = count[0] - count[1];
                if correlation != 0 {
                    list.add(ub, linear_weight(correlation));
                }
            }
            self.corr_chi.push(list);
        }
        for ua in 0..32u8 {
            let mut list = ListOfRowPatterns::default();
            for ub in 0..32u8 {
                let mut count = [0i32; 2];
                for a in 0..32u8 {
                    let b = self.inverse_chi_on_row(a);
                    count[(dot_product(a, ua) ^ dot_product(b, ub)) as usize] += 1;
                }
                let correlation = count[0] - count[1];
                if correlation != 0 {
                    list.add(ub, linear_weight(correlation));
                }
            }
            self.corr_inv_chi.push(list);
        }
    }

    /// Applies λ to a state of lanes in the given mode.
    pub fn lambda_on_lanes(&self, state: &mut [LaneValue; 25], mode: LambdaMode) {
        let f = &self.keccak_f;
        match mode {
            LambdaMode::Straight => {
                f.theta(state);
                f.rho(state);
                f.pi(state);
            }
            LambdaMode::Inverse => {
                f.inverse_pi(state);
                f.inverse_rho(state);
                f.inverse_theta(state);
            }
            LambdaMode::Transpose => {
                f.inverse_pi(state);
                f.inverse_rho(state);
                f.theta_transposed(state);
            }
            LambdaMode::Dual => {
                f.theta_trans_envelope(state);
                f.inverse_theta(state);
                f.theta_trans_envelope(state);
                f.rho(state);
                f.pi(state);
            }
        }
    }

    /// Applies only the part of λ that precedes θ.
    pub fn lambda_before_theta_on_lanes(&self, state: &mut [LaneValue; 25], mode: LambdaMode) {
        if !mode.theta_just_after_chi() {
            self.keccak_f.inverse_pi(state);
            self.keccak_f.inverse_rho(state);
        }
    }

    /// Applies only the part of λ that follows θ.
    pub fn lambda_after_theta_on_lanes(&self, state: &mut [LaneValue; 25], mode: LambdaMode) {
        if !mode.theta_just_before_chi() {
            self.keccak_f.rho(state);
            self.keccak_f.pi(state);
        }
    }

    /// Applies the θ variant sitting in the middle of λ for the given mode.
    pub fn theta_of_mode(&self, state: &mut [LaneValue; 25], mode: LambdaMode) {
        let f = &self.keccak_f;
        match mode {
            LambdaMode::Straight => f.theta(state),
            LambdaMode::Inverse => f.inverse_theta(state),
            LambdaMode::Transpose => f.theta_transposed(state),
            LambdaMode::Dual => {
                f.theta_trans_envelope(state);
                f.inverse_theta(state);
                f.theta_trans_envelope(state);
            }
        }
    }

    fn table_entries(&self) -> usize {
        let w = self.lane_size();
        w * w * 5 * 32
    }

    #[inline(always)]
    fn table_index(&self, oz: usize, iz: usize, y: usize, row: RowValue) -> usize {
        ((oz * self.lane_size() + iz) * 5 + y) * 32 + row as usize
    }

    fn build_table(
        &self,
        apply: impl Fn(&mut [LaneValue; 25], LambdaMode),
    ) -> [Vec<SliceValue>; 4] {
        let w = self.lane_size();
        let mut tables: [Vec<SliceValue>; 4] = Default::default();
        for (m, mode) in LambdaMode::ALL.into_iter().enumerate() {
            let mut table = vec![0; self.table_entries()];
            for iz in 0..w {
                for y in 0..5 {
                    for row in 0..32u8 {
                        let mut state = [0; 25];
                        set_row_of_lanes(&mut state, row, y, iz);
                        apply(&mut state, mode);
                        for oz in 0..w {
                            table[self.table_index(oz, iz, y, row)] =
                                get_slice_of_lanes(&state, oz);
                        }
                    }
                }
            }
            tables[m] = table;
        }
        tables
    }

    fn cache_path(&self, cache_dir: &Path) -> PathBuf {
        cache_dir.join(self.build_file_name("", "-lambda.cache"))
    }

    fn load_lambda_cache(&self, path: &Path) -> Option<[Vec<SliceValue>; 4]> {
        let expected = 4 * self.table_entries() * 4;
        let data = fs::read(path).ok()?;
        if data.len() != expected {
            debug!(
                "lambda cache {} has {} bytes, expected {}; recomputing",
                path.display(),
                data.len(),
                expected
            );
            return None;
        }
        let mut cursor = Cursor::new(data);
        let mut tables: [Vec<SliceValue>; 4] = Default::default();
        for table in tables.iter_mut() {
            let mut entries = vec![0; self.table_entries()];
            for entry in entries.iter_mut() {
                *entry = cursor.read_u32::<LittleEndian>().ok()?;
            }
            *table = entries;
        }
        Some(tables)
    }

    fn store_lambda_cache(&self, path: &Path, tables: &[Vec<SliceValue>; 4]) {
        let write = || -> std::io::Result<()> {
            let mut out = BufWriter::new(File::create(path)?);
            for table in tables {
                for &entry in table {
                    out.write_u32::<LittleEndian>(entry)?;
                }
            }
            out.flush()
        };
        if let Err(e) = write() {
            log::warn!("could not write lambda cache {}: {}", path.display(), e);
        }
    }

    fn initialize_lambda_tables(&mut self, cache_dir: &Path) {
        let path = self.cache_path(cache_dir);
        if let Some(tables) = self.load_lambda_cache(&path) {
            debug!("loaded lambda tables from {}", path.display());
            self.lambda_row_to_slice = tables;
        } else {
            debug!("building lambda tables for {}", self.name());
            self.lambda_row_to_slice = self.build_table(|state, mode| {
                self.lambda_on_lanes(state, mode);
            });
            self.store_lambda_cache(&path, &self.lambda_row_to_slice);
        }
        self.lambda_before_theta_row_to_slice = self.build_table(|state, mode| {
            self.lambda_before_theta_on_lanes(state, mode);
        });
        self.lambda_after_theta_row_to_slice = self.build_table(|state, mode| {
            self.lambda_after_theta_on_lanes(state, mode);
        });
    }

    fn apply_table(&self, table: &[SliceValue], input: &[SliceValue]) -> Vec<SliceValue> {
        let w = self.lane_size();
        let mut out = vec![0; w];
        for (iz, &slice) in input.iter().enumerate() {
            if slice == 0 {
                continue;
            }
            for y in 0..5 {
                let row = get_row_from_slice(slice, y);
                if row == 0 {
                    continue;
                }
                for (oz, out_slice) in out.iter_mut().enumerate() {
                    *out_slice ^= table[self.table_index(oz, iz, y, row)];
                }
            }
        }
        out
    }

    /// λ on a state of slices, by table lookup. The input must hold one
    /// slice per z coordinate.
    pub fn lambda(&self, input: &[SliceValue], mode: LambdaMode) -> Vec<SliceValue> {
        self.apply_table(&self.lambda_row_to_slice[mode as usize], input)
    }

    /// The part of λ before θ, on a state of slices.
    pub fn lambda_before_theta(&self, input: &[SliceValue], mode: LambdaMode) -> Vec<SliceValue> {
        if mode.theta_just_after_chi() {
            input.to_vec()
        } else {
            self.apply_table(&self.lambda_before_theta_row_to_slice[mode as usize], input)
        }
    }

    /// The part of λ after θ, on a state of slices.
    pub fn lambda_after_theta(&self, input: &[SliceValue], mode: LambdaMode) -> Vec<SliceValue> {
        if mode.theta_just_before_chi() {
            input.to_vec()
        } else {
            self.apply_table(&self.lambda_after_theta_row_to_slice[mode as usize], input)
        }
    }

    /// θ of the given λ mode on a state of slices.
    pub fn theta_on_slices(&self, input: &[SliceValue], mode: LambdaMode) -> Vec<SliceValue> {
        let mut lanes = from_slices_to_lanes(input);
        self.theta_of_mode(&mut lanes, mode);
        from_lanes_to_slices(&lanes, input.len())
    }

    /// The θ-gap of a state of slices.
    pub fn theta_gap_of_slices(&self, state: &[SliceValue]) -> u32 {
        self.keccak_f.theta_gap(&from_slices_to_lanes(state))
    }

    #[cfg(test)]
    pub(crate) fn row_of_lanes(lanes: &[LaneValue; 25], y: usize, z: usize) -> RowValue {
        crate::parts::get_row_of_lanes(lanes, y, z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parts::get_slice_from_row;

    fn dclc(width: usize) -> KeccakFDcLc {
        KeccakFDcLc::with_cache_dir(width, &std::env::temp_dir()).unwrap()
    }

    #[test]
    fn chi_on_row_round_trip() {
        let d = dclc(50);
        for a in 0..32u8 {
            assert_eq!(d.inverse_chi_on_row(d.chi_on_row(a)), a);
        }
        assert_eq!(d.chi_on_row(0), 0);
        // chi on a full state with a single active row must agree.
        let mut lanes = [0u64; 25];
        set_row_of_lanes(&mut lanes, 0x0B, 2, 1);
        d.keccak_f.chi(&mut lanes);
        assert_eq!(KeccakFDcLc::row_of_lanes(&lanes, 2, 1), d.chi_on_row(0x0B));
    }

    #[test]
    fn differential_tables_are_symmetric() {
        let d = dclc(50);
        for a in 0..32usize {
            for (i, &p) in d.diff_chi[a].values.iter().enumerate() {
                let back = &d.diff_inv_chi[p as usize];
                let j = back.values.iter().position(|&v| v == a as u8).unwrap();
                assert_eq!(back.weights[j], d.diff_chi[a].weights[i]);
            }
        }
    }

    #[test]
    fn differential_weights_are_sorted_and_bounded() {
        let d = dclc(50);
        for a in 1..32usize {
            let list = &d.diff_chi[a];
            assert!(!list.is_empty());
            assert!(list.weights.windows(2).all(|w| w[0] <= w[1]));
            assert_eq!(list.min_weight, list.weights[0]);
            assert_eq!(list.max_weight, *list.weights.last().unwrap());
            assert!(list.min_weight >= 2);
            assert!(list.max_weight <= 4);
        }
        // The zero difference propagates to itself for free.
        assert_eq!(d.diff_chi[0].values, vec![0]);
        assert_eq!(d.diff_chi[0].weights, vec![0]);
    }

    #[test]
    fn linear_correlations_satisfy_parseval() {
        let d = dclc(50);
        for a in 0..32usize {
            let total: f64 = d.corr_chi[a]
                .weights
                .iter()
                .map(|&w| 1.0 / f64::powi(2.0, w as i32))
                .sum();
            assert!(total <= 1.0 + 1e-9, "mask {a:#x} sums to {total}");
        }
    }

    #[test]
    fn lambda_tables_match_lane_evaluation() {
        let d = dclc(200);
        let w = d.lane_size();
        let mut state = vec![0; w];
        state[0] = get_slice_from_row(0x13, 1) ^ get_slice_from_row(0x01, 4);
        state[3] = get_slice_from_row(0x1F, 0);
        state[w - 1] = get_slice_from_row(0x0A, 2);
        for mode in LambdaMode::ALL {
            let by_table = d.lambda(&state, mode);
            let mut lanes = from_slices_to_lanes(&state);
            d.lambda_on_lanes(&mut lanes, mode);
            assert_eq!(by_table, from_lanes_to_slices(&lanes, w), "{mode:?}");
        }
    }

    #[test]
    fn lambda_decomposes_around_theta() {
        let d = dclc(100);
        let w = d.lane_size();
        let mut state = vec![0; w];
        state[1] = get_slice_from_row(0x07, 3);
        state[2] = get_slice_from_row(0x15, 0) ^ get_slice_from_row(0x02, 2);
        for mode in LambdaMode::ALL {
            let direct = d.lambda(&state, mode);
            let composed = d.lambda_after_theta(
                &d.theta_on_slices(&d.lambda_before_theta(&state, mode), mode),
                mode,
            );
            assert_eq!(direct, composed, "{mode:?}");
        }
    }

    #[test]
    fn straight_and_inverse_modes_cancel() {
        let d = dclc(200);
        let w = d.lane_size();
        let mut state = vec![0; w];
        state[4] = 0x155_AA55;
        state[5] = get_slice_from_row(0x11, 1);
        let there = d.lambda(&state, LambdaMode::Straight);
        let back = d.lambda(&there, LambdaMode::Inverse);
        assert_eq!(back, state);
    }

    #[test]
    fn lambda_cache_round_trip() {
        let dir = std::env::temp_dir().join("keccak-trails-lambda-cache-test");
        std::fs::create_dir_all(&dir).unwrap();
        let first = KeccakFDcLc::with_cache_dir(50, &dir).unwrap();
        let path = dir.join("KeccakF-50-lambda.cache");
        assert!(path.exists());
        let expected = 4 * 4 * first.table_entries() as u64;
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected);
        let second = KeccakFDcLc::with_cache_dir(50, &dir).unwrap();
        assert_eq!(first.lambda_row_to_slice, second.lambda_row_to_slice);
        // A truncated cache is ignored and rebuilt.
        std::fs::write(&path, [0u8; 10]).unwrap();
        let third = KeccakFDcLc::with_cache_dir(50, &dir).unwrap();
        assert_eq!(first.lambda_row_to_slice, third.lambda_row_to_slice);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected);
    }
}
