//! The propagation context: binds the DC/LC tables of χ and the λ layer to
//! one propagation type, and provides the weights, bounds and affine bases
//! the trail searches are built on.
//!
//! Direction convention: "direct" is the direction in which the output
//! patterns of χ form an affine space (the round direction for DC, the
//! inverse round direction for LC); "reverse" is the opposite.

use crate::affine::{
    state_parity, state_parity_packed, AffineSpaceOfRows, AffineSpaceOfSlices,
    AffineSpaceOfStates,
};
use crate::dclc::{KeccakFDcLc, LambdaMode, ListOfRowPatterns};
use crate::parity::PackedParity;
use crate::parts::{
    get_row, get_row_from_slice, get_slice_from_row, set_row, translate_row, translate_row_safely,
    LaneValue, RowValue, SliceValue,
};
use crate::permutation::KeccakF;
use crate::position::BitPosition;
use crate::trails::Trail;

/// Differential or linear cryptanalysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DcOrLc {
    Dc,
    Lc,
}

/// A DC or LC specialisation of a Keccak-f instance.
pub struct Propagation<'a> {
    /// The DC/LC-extended permutation this context borrows its tables from.
    pub parent: &'a KeccakFDcLc,
    /// The output row patterns in the direct direction (differences through
    /// χ for DC, masks through χ⁻¹ for LC).
    pub direct_row_output_list: &'a [ListOfRowPatterns],
    /// The output row patterns in the reverse direction.
    pub reverse_row_output_list: &'a [ListOfRowPatterns],
    /// Per input row, the direct output patterns as an affine space.
    pub affine_per_input: Vec<AffineSpaceOfRows>,
    /// "DC" or "LC", used in file names.
    pub name: &'static str,
    lane_size: usize,
    kind: DcOrLc,
    lambda_mode: LambdaMode,
    reverse_lambda_mode: LambdaMode,
    chi_compatibility: Vec<bool>,
}

impl<'a> Propagation<'a> {
    /// Specialises the given tables to differential or linear propagation.
    pub fn new(parent: &'a KeccakFDcLc, kind: DcOrLc) -> Self {
        let (direct, reverse, name, lambda_mode, reverse_lambda_mode) = match kind {
            DcOrLc::Dc => (
                &parent.diff_chi[..],
                &parent.diff_inv_chi[..],
                "DC",
                LambdaMode::Straight,
                LambdaMode::Inverse,
            ),
            DcOrLc::Lc => (
                &parent.corr_inv_chi[..],
                &parent.corr_chi[..],
                "LC",
                LambdaMode::Transpose,
                LambdaMode::Dual,
            ),
        };
        let mut propagation = Propagation {
            parent,
            direct_row_output_list: direct,
            reverse_row_output_list: reverse,
            affine_per_input: Vec::new(),
            name,
            lane_size: parent.lane_size(),
            kind,
            lambda_mode,
            reverse_lambda_mode,
            chi_compatibility: vec![false; 32 * 32],
        };
        propagation.initialize_affine();
        propagation.initialize_chi_compatibility();
        propagation
    }

    pub fn kind(&self) -> DcOrLc {
        self.kind
    }

    pub fn lane_size(&self) -> usize {
        self.lane_size
    }

    pub fn lambda_mode(&self) -> LambdaMode {
        self.lambda_mode
    }

    pub fn reverse_lambda_mode(&self) -> LambdaMode {
        self.reverse_lambda_mode
    }

    fn initialize_affine(&mut self) {
        match self.kind {
            DcOrLc::Dc => {
                for row in 0..32u8 {
                    let mut a = AffineSpaceOfRows::default();
                    if row == 0x1F {
                        for i in 0..4 {
                            a.add_generator(translate_row_safely(0x03, i));
                        }
                    } else {
                        for i in 0..5 {
                            let t = translate_row_safely(row, i);
                            // A difference bit makes the two neighbouring
                            // output bits free; overlapping windows share
                            // generators.
                            if t & 0x0E == 0x02 {
                                a.add_generator(translate_row_safely(0x01, -i));
                            }
                            if t & 0x0E == 0x0A {
                                a.add_generator(translate_row_safely(0x03, -i));
                            }
                            if t & 0x06 == 0x06 {
                                a.add_generator(translate_row_safely(0x01, -i));
                            }
                            if t & 0x07 == 0x04 {
                                a.add_generator(translate_row_safely(0x01, -i));
                            }
                        }
                    }
                    a.set_offset(self.parent.chi_on_row(0) ^ self.parent.chi_on_row(row));
                    self.affine_per_input.push(a);
                }
            }
            DcOrLc::Lc => {
                for row in 0..32u8 {
                    let mut a = AffineSpaceOfRows::default();
                    let mut offset: RowValue = 0;
                    if row == 0x1F {
                        for i in 0..4 {
                            a.add_generator(translate_row_safely(0x05, i));
                        }
                        offset = 1;
                    } else if row != 0 {
                        // Walk the mask run by run, starting just after the
                        // lowest run of ones.
                        let mut start: i32 = 0;
                        let mut t = row;
                        while t & 1 != 0 {
                            start += 1;
                            t = translate_row_safely(row, -start);
                        }
                        let mut i: i32 = 0;
                        while i < 5 {
                            if t & 0x3 == 0x0 {
                                t = translate_row_safely(t, -1);
                                i += 1;
                            } else if t & 0x3 == 0x2 {
                                offset ^= translate_row_safely(0x02, i + start);
                                t = translate_row_safely(t, -1);
                                i += 1;
                            } else if t & 0x3 == 0x1 {
                                a.add_generator(translate_row_safely(0x02, i + start));
                                a.add_generator(translate_row_safely(0x04, i + start));
                                t = translate_row_safely(t, -1);
                                i += 1;
                            } else {
                                a.add_generator(translate_row_safely(0x0A, i + start));
                                a.add_generator(translate_row_safely(0x04, i + start));
                                t = translate_row_safely(t, -2);
                                i += 2;
                            }
                        }
                    }
                    a.set_offset(offset);
                    self.affine_per_input.push(a);
                }
            }
        }
    }

    fn initialize_chi_compatibility(&mut self) {
        for before in 0..32usize {
            for after in 0..32usize {
                self.chi_compatibility[before + 32 * after] =
                    self.direct_row_output_list[before].contains(after as RowValue);
            }
        }
    }

    /// The propagation weight of a slice.
    pub fn weight_of_slice(&self, slice: SliceValue) -> u32 {
        (0..5)
            .map(|y| self.affine_per_input[get_row_from_slice(slice, y) as usize].weight())
            .sum()
    }

    /// The propagation weight of a state.
    pub fn weight(&self, state: &[SliceValue]) -> u32 {
        state.iter().map(|&s| self.weight_of_slice(s)).sum()
    }

    /// The minimum reverse weight of a slice.
    pub fn min_reverse_weight_of_slice(&self, slice: SliceValue) -> u32 {
        (0..5)
            .map(|y| self.reverse_row_output_list[get_row_from_slice(slice, y) as usize].min_weight)
            .sum()
    }

    /// The minimum reverse weight of a state.
    pub fn min_reverse_weight(&self, state: &[SliceValue]) -> u32 {
        state.iter().map(|&s| self.min_reverse_weight_of_slice(s)).sum()
    }

    /// The minimum reverse weight of λ⁻¹ of a state given before χ.
    pub fn min_reverse_weight_after_lambda(&self, state: &[SliceValue]) -> u32 {
        self.min_reverse_weight(&self.reverse_lambda(state))
    }

    /// A lower bound on the weight given the Hamming weight and the number
    /// of active rows.
    pub fn lower_bound_on_weight(&self, hamming_weight: u32, nr_active_rows: u32) -> u32 {
        let mut rows = nr_active_rows;
        if hamming_weight > 5 * rows {
            rows = (hamming_weight + 4) / 5;
        }
        match self.kind {
            DcOrLc::Dc => {
                if hamming_weight <= rows {
                    2 * rows
                } else {
                    (hamming_weight + 3 * rows + 1) / 2
                }
            }
            DcOrLc::Lc => {
                if 2 * hamming_weight <= rows {
                    2 * rows
                } else {
                    2 * ((hamming_weight + rows + 2) / 3)
                }
            }
        }
    }

    /// A lower bound on the weight given only the Hamming weight.
    pub fn lower_bound_on_weight_given_hamming_weight(&self, hamming_weight: u32) -> u32 {
        self.lower_bound_on_weight(hamming_weight, (hamming_weight + 4) / 5)
    }

    /// A lower bound on the reverse weight given the Hamming weight and the
    /// number of active rows.
    pub fn lower_bound_on_reverse_weight(&self, hamming_weight: u32, nr_active_rows: u32) -> u32 {
        let mut rows = nr_active_rows;
        if hamming_weight > 5 * rows {
            rows = (hamming_weight + 4) / 5;
        }
        match self.kind {
            DcOrLc::Dc => {
                if 3 * hamming_weight <= rows {
                    2 * rows
                } else {
                    (hamming_weight + rows + 1) / 2
                }
            }
            DcOrLc::Lc => {
                if 4 * hamming_weight <= rows {
                    2 * rows
                } else {
                    2 * ((hamming_weight + 3) / 4)
                }
            }
        }
    }

    /// A lower bound on the reverse weight given only the Hamming weight.
    pub fn lower_bound_on_reverse_weight_given_hamming_weight(&self, hamming_weight: u32) -> u32 {
        self.lower_bound_on_reverse_weight(hamming_weight, (hamming_weight + 4) / 5)
    }

    /// True iff θ (or θᵀ) is the first linear step after χ in the direct
    /// direction.
    pub fn is_theta_just_after_chi(&self) -> bool {
        self.lambda_mode.theta_just_after_chi()
    }

    /// λ in the direct direction.
    pub fn direct_lambda(&self, state: &[SliceValue]) -> Vec<SliceValue> {
        self.parent.lambda(state, self.lambda_mode)
    }

    /// λ in the reverse direction.
    pub fn reverse_lambda(&self, state: &[SliceValue]) -> Vec<SliceValue> {
        self.parent.lambda(state, self.reverse_lambda_mode)
    }

    /// The part of direct λ before θ.
    pub fn direct_lambda_before_theta(&self, state: &[SliceValue]) -> Vec<SliceValue> {
        self.parent.lambda_before_theta(state, self.lambda_mode)
    }

    /// The part of reverse λ before θ.
    pub fn reverse_lambda_before_theta(&self, state: &[SliceValue]) -> Vec<SliceValue> {
        self.parent.lambda_after_theta(state, self.reverse_lambda_mode)
    }

    /// The part of direct λ after θ.
    pub fn direct_lambda_after_theta(&self, state: &[SliceValue]) -> Vec<SliceValue> {
        self.parent.lambda_after_theta(state, self.lambda_mode)
    }

    /// The part of reverse λ after θ.
    pub fn reverse_lambda_after_theta(&self, state: &[SliceValue]) -> Vec<SliceValue> {
        self.parent.lambda_before_theta(state, self.reverse_lambda_mode)
    }

    /// The θ variant of the direct λ.
    pub fn direct_theta(&self, state: &[SliceValue]) -> Vec<SliceValue> {
        self.parent.theta_on_slices(state, self.lambda_mode)
    }

    /// The θ variant of the reverse λ.
    pub fn reverse_theta(&self, state: &[SliceValue]) -> Vec<SliceValue> {
        self.parent.theta_on_slices(state, self.reverse_lambda_mode)
    }

    /// π (DC) or π⁻¹ (LC) on lane coordinates.
    pub fn direct_pi(&self, x: usize, y: usize) -> (usize, usize) {
        if self.lambda_mode.theta_just_after_chi() {
            KeccakF::pi_coordinates(x, y)
        } else {
            KeccakF::inverse_pi_coordinates(x, y)
        }
    }

    /// π⁻¹ (DC) or π (LC) on lane coordinates.
    pub fn reverse_pi(&self, x: usize, y: usize) -> (usize, usize) {
        if self.lambda_mode.theta_just_after_chi() {
            KeccakF::inverse_pi_coordinates(x, y)
        } else {
            KeccakF::pi_coordinates(x, y)
        }
    }

    /// Moves a bit position through ρ and π in the direct direction.
    pub fn direct_rho_pi(&self, point: &mut BitPosition) {
        let f = &self.parent.keccak_f;
        if self.lambda_mode.theta_just_after_chi() {
            point.z = f.rho_coordinate(point.x, point.y, point.z);
            let (x, y) = KeccakF::pi_coordinates(point.x, point.y);
            point.x = x;
            point.y = y;
        } else {
            let (x, y) = KeccakF::inverse_pi_coordinates(point.x, point.y);
            point.x = x;
            point.y = y;
            point.z = f.inverse_rho_coordinate(point.x, point.y, point.z);
        }
    }

    /// Moves a bit position through ρ and π in the reverse direction.
    pub fn reverse_rho_pi(&self, point: &mut BitPosition) {
        let f = &self.parent.keccak_f;
        if self.lambda_mode.theta_just_after_chi() {
            let (x, y) = KeccakF::inverse_pi_coordinates(point.x, point.y);
            point.x = x;
            point.y = y;
            point.z = f.inverse_rho_coordinate(point.x, point.y, point.z);
        } else {
            point.z = f.rho_coordinate(point.x, point.y, point.z);
            let (x, y) = KeccakF::pi_coordinates(point.x, point.y);
            point.x = x;
            point.y = y;
        }
    }

    /// The before-θ half of [Self::reverse_rho_pi]: a no-op when θ comes
    /// right after χ.
    pub fn reverse_rho_pi_before_theta(&self, point: &mut BitPosition) {
        if !self.lambda_mode.theta_just_after_chi() {
            self.reverse_rho_pi(point);
        }
    }

    /// The after-θ half of [Self::direct_rho_pi]: a no-op when θ comes
    /// right before χ.
    pub fn direct_rho_pi_after_theta(&self, point: &mut BitPosition) {
        if self.lambda_mode.theta_just_after_chi() {
            self.direct_rho_pi(point);
        }
    }

    /// The θ-effect from sheet parities, in the direct direction.
    pub fn direct_theta_effect_from_parities(&self, c: &[LaneValue; 5]) -> [LaneValue; 5] {
        match self.kind {
            DcOrLc::Dc => self.parent.keccak_f.theta_effect_from_parity(c),
            DcOrLc::Lc => self.parent.keccak_f.theta_transposed_effect_from_parity(c),
        }
    }

    /// The θ-effect from slice parities, in the direct direction.
    pub fn direct_theta_effect_from_slice_parities(&self, c: &[RowValue]) -> Vec<RowValue> {
        let w = self.lane_size;
        match self.kind {
            DcOrLc::Dc => (0..w)
                .map(|z| translate_row(c[z], 1) ^ translate_row(c[(z + w - 1) % w], 4))
                .collect(),
            DcOrLc::Lc => (0..w)
                .map(|z| translate_row(c[z], 4) ^ translate_row(c[(z + 1) % w], 1))
                .collect(),
        }
    }

    /// Converts a t coordinate on the (x + 5z) line into column coordinates,
    /// following the direction of the θ-effect. Coordinates beyond one turn
    /// of the line are reduced.
    pub fn x_z_from_t(&self, t: usize) -> (usize, usize) {
        match self.kind {
            DcOrLc::Dc => ((3 * t) % 5, t % self.lane_size),
            DcOrLc::Lc => (
                (2 * t) % 5,
                (-(t as i64)).rem_euclid(self.lane_size as i64) as usize,
            ),
        }
    }

    /// Translates a t coordinate by one position along x.
    pub fn translate_along_x_in_t(&self, t: usize) -> usize {
        let n = self.lane_size * 5;
        let step = match self.lane_size {
            1 | 2 => 2,
            4 => 12,
            8 | 16 | 32 => 32,
            _ => 192,
        };
        (t + step) % n
    }

    /// True iff the row pattern before χ is compatible with the pattern
    /// after χ.
    #[inline(always)]
    pub fn is_chi_compatible(&self, before: RowValue, after: RowValue) -> bool {
        self.chi_compatibility[before as usize + 32 * after as usize]
    }

    /// True iff the state before χ is compatible with the state after χ,
    /// row by row.
    pub fn is_chi_compatible_states(&self, before: &[SliceValue], after: &[SliceValue]) -> bool {
        for z in 0..self.lane_size {
            for y in 0..5 {
                if !self.is_chi_compatible(
                    get_row_from_slice(before[z], y),
                    get_row_from_slice(after[z], y),
                ) {
                    return false;
                }
            }
        }
        true
    }

    /// True iff the last state of `first` can precede the first state of
    /// `second` through χ and λ.
    pub fn is_round_compatible(&self, first: &Trail, second: &Trail) -> bool {
        let (Some(last), Some(next)) = (first.states.last(), second.states.first()) else {
            return false;
        };
        let state_after_chi = self.reverse_lambda(next);
        self.is_chi_compatible_states(last, &state_after_chi)
    }

    /// The affine space of direct χ outputs of a single slice, with the
    /// row-level parities of the output patterns.
    pub fn build_slice_base(&self, slice: SliceValue) -> AffineSpaceOfSlices {
        let mut generators = Vec::new();
        let mut parities = Vec::new();
        let mut offset: SliceValue = 0;
        let mut offset_parity: RowValue = 0;
        for y in 0..5 {
            let row = get_row_from_slice(slice, y) as usize;
            offset_parity ^= self.affine_per_input[row].offset;
            offset ^= get_slice_from_row(self.affine_per_input[row].offset, y);
            for &b in &self.affine_per_input[row].generators {
                generators.push(get_slice_from_row(b, y));
                parities.push(b);
            }
        }
        AffineSpaceOfSlices::new(generators, parities, offset, offset_parity)
    }

    /// The affine space of all λ(v) for v a direct χ output of `state`; the
    /// parities recorded in the space are those before θ. With
    /// `packed_if_possible`, the packed parity representation is used when
    /// the parity fits one word.
    pub fn build_state_base(
        &self,
        state: &[SliceValue],
        packed_if_possible: bool,
    ) -> AffineSpaceOfStates {
        let packed = packed_if_possible && self.lane_size * 5 <= 64;
        let mut generators = Vec::new();
        let mut parities_packed: Vec<PackedParity> = Vec::new();
        let mut parities: Vec<Vec<RowValue>> = Vec::new();
        let mut offset = vec![0; self.lane_size];
        for (z, &slice) in state.iter().enumerate() {
            for y in 0..5 {
                let row = get_row_from_slice(slice, y) as usize;
                offset[z] ^= get_slice_from_row(self.affine_per_input[row].offset, y);
                for &b in &self.affine_per_input[row].generators {
                    let mut v = vec![0; self.lane_size];
                    v[z] = get_slice_from_row(b, y);
                    let after_lambda = self.parent.lambda(&v, self.lambda_mode);
                    let before_theta = self.parent.lambda_before_theta(&v, self.lambda_mode);
                    generators.push(after_lambda);
                    if packed {
                        parities_packed.push(state_parity_packed(&before_theta));
                    } else {
                        parities.push(state_parity(&before_theta));
                    }
                }
            }
        }
        let offset_after_lambda = self.parent.lambda(&offset, self.lambda_mode);
        let offset_before_theta = self.parent.lambda_before_theta(&offset, self.lambda_mode);
        if packed {
            AffineSpaceOfStates::new_packed(
                self.lane_size,
                generators,
                parities_packed,
                offset_after_lambda,
                state_parity_packed(&offset_before_theta),
            )
        } else {
            AffineSpaceOfStates::new_unpacked(
                self.lane_size,
                generators,
                parities,
                offset_after_lambda,
                state_parity(&offset_before_theta),
            )
        }
    }

    /// An iterator over the states before χ compatible with the given state
    /// after χ, by non-decreasing weight up to `max_weight` (0 = no limit).
    pub fn reverse_state_iterator(
        &self,
        state_after_chi: &[SliceValue],
        max_weight: u32,
    ) -> ReverseStateIterator<'_> {
        ReverseStateIterator::new(self, state_after_chi, max_weight)
    }

    /// Replaces the unspecified first state of a trail core by the lightest
    /// compatible representative.
    pub fn specify_first_state_arbitrarily(&self, trail: &mut Trail) {
        if trail.first_state_specified || trail.states.len() < 2 {
            return;
        }
        let state_after_chi = self.reverse_lambda(&trail.states[1]);
        let mut first = vec![0; self.lane_size];
        for (z, &slice) in state_after_chi.iter().enumerate() {
            for y in 0..5 {
                let row_after = get_row_from_slice(slice, y) as usize;
                let row_before = self.reverse_row_output_list[row_after].values[0];
                first[z] ^= get_slice_from_row(row_before, y);
            }
        }
        trail.states[0] = first;
        trail.first_state_specified = true;
    }

    /// Appends an arbitrarily chosen lightest state after the last χ.
    pub fn specify_state_after_last_chi_arbitrarily(&self, trail: &mut Trail) {
        if trail.state_after_last_chi.is_some() {
            return;
        }
        let Some(last) = trail.states.last() else {
            return;
        };
        let mut state = vec![0; self.lane_size];
        for (z, &slice) in last.iter().enumerate() {
            for y in 0..5 {
                let row_before = get_row_from_slice(slice, y) as usize;
                let row_after = self.direct_row_output_list[row_before].values[0];
                state[z] ^= get_slice_from_row(row_after, y);
            }
        }
        trail.state_after_last_chi = Some(state);
    }

    /// For each row of the slice before χ, picks the lightest output row
    /// that keeps the column parity correctable towards the kernel.
    pub fn minimum_in_kernel_slice_after_chi(&self, slice_before_chi: SliceValue) -> SliceValue {
        const MIN_ROW_IN_KERNEL_DC: [RowValue; 32] = [
            0x00, 0x01, 0x02, 0x02, 0x04, 0x04, 0x04, 0x04, 0x08, 0x01, 0x08, 0x00, 0x08, 0x00,
            0x08, 0x00, 0x10, 0x01, 0x02, 0x02, 0x10, 0x00, 0x00, 0x00, 0x10, 0x01, 0x00, 0x00,
            0x10, 0x00, 0x00, 0x00,
        ];
        const MIN_ROW_IN_KERNEL_LC: [RowValue; 32] = [
            0x00, 0x01, 0x02, 0x01, 0x04, 0x01, 0x02, 0x01, 0x08, 0x08, 0x02, 0x00, 0x04, 0x00,
            0x02, 0x00, 0x10, 0x10, 0x10, 0x10, 0x04, 0x00, 0x00, 0x00, 0x08, 0x08, 0x00, 0x00,
            0x04, 0x00, 0x00, 0x00,
        ];
        let table = match self.kind {
            DcOrLc::Dc => &MIN_ROW_IN_KERNEL_DC,
            DcOrLc::Lc => &MIN_ROW_IN_KERNEL_LC,
        };
        let mut slice_after_chi = 0;
        for y in 0..5 {
            let row_before = get_row_from_slice(slice_before_chi, y);
            slice_after_chi ^= get_slice_from_row(table[row_before as usize], y);
        }
        slice_after_chi
    }

    /// `"DC"/"LC" + instance name + suffix`.
    pub fn file_name(&self, suffix: &str) -> String {
        self.parent.build_file_name(self.name, suffix)
    }

    /// `"DC"/"LC" + prefix + instance name + suffix`.
    pub fn file_name_with_prefix(&self, prefix: &str, suffix: &str) -> String {
        self.parent
            .build_file_name(&format!("{}{}", self.name, prefix), suffix)
    }
}

/// Enumerates the states before χ compatible with a state after χ, in
/// non-decreasing propagation weight order and within a weight budget.
///
/// Per non-zero row of the target, the candidates of the reverse row output
/// list are indexed lightest first; advancing works like an odometer that
/// skips combinations exceeding the budget.
pub struct ReverseStateIterator<'a> {
    patterns: Vec<&'a ListOfRowPatterns>,
    ys: Vec<usize>,
    zs: Vec<usize>,
    indexes: Vec<usize>,
    min_weight: u32,
    max_weight: u32,
    current: Vec<SliceValue>,
    current_weight: u32,
    index: u64,
    end: bool,
}

impl<'a> ReverseStateIterator<'a> {
    fn new(propagation: &'a Propagation<'a>, state_after_chi: &[SliceValue], max_weight: u32) -> Self {
        let max_weight = if max_weight == 0 {
            20 * state_after_chi.len() as u32
        } else {
            max_weight
        };
        let mut iterator = ReverseStateIterator {
            patterns: Vec::new(),
            ys: Vec::new(),
            zs: Vec::new(),
            indexes: Vec::new(),
            min_weight: 0,
            max_weight,
            current: vec![0; state_after_chi.len()],
            current_weight: 0,
            index: 0,
            end: false,
        };
        for z in 0..state_after_chi.len() {
            for y in 0..5 {
                let row = get_row(state_after_chi, y, z);
                if row != 0 {
                    let list = &propagation.reverse_row_output_list[row as usize];
                    iterator.patterns.push(list);
                    iterator.ys.push(y);
                    iterator.zs.push(z);
                    iterator.indexes.push(0);
                    set_row(&mut iterator.current, list.values[0], y, z);
                    iterator.min_weight += list.weights[0];
                }
            }
        }
        iterator.current_weight = iterator.min_weight;
        iterator.end = iterator.is_empty();
        iterator
    }

    /// True iff there are no more states to visit.
    pub fn is_end(&self) -> bool {
        self.end
    }

    /// True iff even the lightest combination exceeds the budget, or the
    /// target has no active row.
    pub fn is_empty(&self) -> bool {
        self.min_weight > self.max_weight || self.patterns.is_empty()
    }

    /// The current state before χ.
    pub fn current(&self) -> &[SliceValue] {
        &self.current
    }

    /// The propagation weight of the current state.
    pub fn current_weight(&self) -> u32 {
        self.current_weight
    }

    /// The number of states visited so far.
    pub fn visited(&self) -> u64 {
        self.index
    }

    /// Moves to the next state within the budget.
    pub fn advance(&mut self) {
        self.next();
        self.index += 1;
    }

    fn next(&mut self) {
        let mut affordable = self.max_weight as i64 - self.current_weight as i64;
        let mut i = 0;
        while i < self.patterns.len() {
            let ii = self.indexes[i];
            affordable += self.patterns[i].weights[ii] as i64;
            self.current_weight -= self.patterns[i].weights[ii];
            if ii + 1 < self.patterns[i].len()
                && self.patterns[i].weights[ii + 1] as i64 <= affordable
            {
                break;
            }
            affordable -= self.patterns[i].min_weight as i64;
            i += 1;
        }
        if i >= self.patterns.len() {
            self.end = true;
            return;
        }
        self.indexes[i] += 1;
        self.current_weight += self.patterns[i].weights[self.indexes[i]];
        set_row(
            &mut self.current,
            self.patterns[i].values[self.indexes[i]],
            self.ys[i],
            self.zs[i],
        );
        for j in 0..i {
            self.indexes[j] = 0;
            self.current_weight += self.patterns[j].weights[0];
            set_row(&mut self.current, self.patterns[j].values[0], self.ys[j], self.zs[j]);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::parity::get_parity_of_slice;
    use crate::parts::get_slice_point;

    fn dclc(width: usize) -> KeccakFDcLc {
        KeccakFDcLc::with_cache_dir(width, &std::env::temp_dir()).unwrap()
    }

    fn affine_space_elements(space: &AffineSpaceOfRows) -> HashSet<RowValue> {
        let mut elements = HashSet::new();
        for combo in 0..(1u32 << space.generators.len()) {
            let mut value = space.offset;
            for (i, &g) in space.generators.iter().enumerate() {
                if combo >> i & 1 != 0 {
                    value ^= g;
                }
            }
            elements.insert(value);
        }
        elements
    }

    #[test]
    fn dc_affine_rows_describe_diff_chi() {
        let parent = dclc(50);
        let dc = Propagation::new(&parent, DcOrLc::Dc);
        for a in 0..32usize {
            let elements = affine_space_elements(&dc.affine_per_input[a]);
            let listed: HashSet<RowValue> = parent.diff_chi[a].values.iter().copied().collect();
            assert_eq!(elements, listed, "row {a:#x}");
            assert_eq!(elements.len(), 1 << dc.affine_per_input[a].generators.len());
        }
    }

    #[test]
    fn lc_affine_rows_describe_corr_inv_chi() {
        let parent = dclc(50);
        let lc = Propagation::new(&parent, DcOrLc::Lc);
        for a in 0..32usize {
            let elements = affine_space_elements(&lc.affine_per_input[a]);
            let listed: HashSet<RowValue> =
                parent.corr_inv_chi[a].values.iter().copied().collect();
            assert_eq!(elements, listed, "mask {a:#x}");
        }
    }

    #[test]
    fn weights_agree_with_lists() {
        let parent = dclc(50);
        for kind in [DcOrLc::Dc, DcOrLc::Lc] {
            let p = Propagation::new(&parent, kind);
            for a in 0..32u32 {
                let slice = get_slice_from_row(a as RowValue, 2);
                // The affine dimension equals the direct weight of the row.
                assert_eq!(
                    p.weight_of_slice(slice),
                    p.affine_per_input[a as usize].generators.len() as u32
                );
                assert_eq!(
                    p.min_reverse_weight_of_slice(slice),
                    p.reverse_row_output_list[a as usize].min_weight
                );
            }
        }
    }

    #[test]
    fn lower_bounds_hold_on_single_rows() {
        let parent = dclc(50);
        for kind in [DcOrLc::Dc, DcOrLc::Lc] {
            let p = Propagation::new(&parent, kind);
            for a in 1..32u8 {
                let slice = get_slice_from_row(a, 0);
                let hw = crate::parts::hamming_weight_of_slice(slice);
                assert!(p.lower_bound_on_weight(hw, 1) <= p.weight_of_slice(slice));
                assert!(
                    p.lower_bound_on_reverse_weight(hw, 1) <= p.min_reverse_weight_of_slice(slice)
                );
            }
        }
    }

    #[test]
    fn chi_compatibility_follows_direct_list() {
        let parent = dclc(50);
        let dc = Propagation::new(&parent, DcOrLc::Dc);
        for a in 0..32u8 {
            for b in 0..32u8 {
                assert_eq!(
                    dc.is_chi_compatible(a, b),
                    parent.diff_chi[a as usize].contains(b)
                );
            }
        }
    }

    #[test]
    fn direct_and_reverse_lambda_cancel() {
        let parent = dclc(100);
        for kind in [DcOrLc::Dc, DcOrLc::Lc] {
            let p = Propagation::new(&parent, kind);
            let mut state = vec![0; p.lane_size()];
            state[0] = get_slice_point(1, 0);
            state[2] = get_slice_from_row(0x17, 3);
            let round_trip = p.reverse_lambda(&p.direct_lambda(&state));
            assert_eq!(round_trip, state);
        }
    }

    #[test]
    fn rho_pi_bit_moves_match_lambda_after_theta() {
        // Moving a single bit through the after-theta part of lambda must
        // agree with the coordinate map.
        let parent = dclc(200);
        for kind in [DcOrLc::Dc, DcOrLc::Lc] {
            let p = Propagation::new(&parent, kind);
            let mut state = vec![0; p.lane_size()];
            let mut point = BitPosition::new(3, 1, 5);
            state[point.z] = get_slice_point(point.x, point.y);
            let moved = p.direct_lambda_after_theta(&state);
            p.direct_rho_pi_after_theta(&mut point);
            assert_eq!(
                crate::parts::get_bit(&moved, point.x, point.y, point.z),
                1,
                "{kind:?}"
            );
            assert_eq!(crate::parts::hamming_weight_of_state(&moved), 1);
        }
    }

    #[test]
    fn slice_base_parity_round_trip() {
        let parent = dclc(50);
        let dc = Propagation::new(&parent, DcOrLc::Dc);
        for slice in [
            get_slice_from_row(0x01, 0),
            get_slice_from_row(0x0B, 2) ^ get_slice_from_row(0x10, 4),
            get_slice_from_row(0x1F, 1),
        ] {
            let base = dc.build_slice_base(slice);
            // Walk a few elements and ask the base for their parity back.
            for combo in 0..(1usize << base.original_generators.len().min(6)) {
                let mut element = base.offset;
                for (i, &g) in base.original_generators.iter().enumerate().take(6) {
                    if combo >> i & 1 != 0 {
                        element ^= g;
                    }
                }
                let parity = get_parity_of_slice(element);
                let found = base.offset_with_given_parity(parity).unwrap();
                assert_eq!(get_parity_of_slice(found), parity);
            }
        }
    }

    #[test]
    fn state_base_covers_chi_outputs() {
        let parent = dclc(200);
        let dc = Propagation::new(&parent, DcOrLc::Dc);
        let mut seed = vec![0; dc.lane_size()];
        seed[0] = get_slice_from_row(0x01, 0);
        assert_eq!(dc.weight(&seed), 2);
        let base = dc.build_state_base(&seed, false);
        assert_eq!(base.original_generators.len() as u32, dc.weight(&seed));
        let mut it = base.iterator();
        assert_eq!(it.count(), 1 << dc.weight(&seed));
        let mut seen = HashSet::new();
        while !it.is_end() {
            let element = it.current().to_vec();
            let after_chi = dc.reverse_lambda(&element);
            assert!(dc.is_chi_compatible_states(&seed, &after_chi));
            seen.insert(element);
            it.advance();
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn packed_and_unpacked_state_bases_agree() {
        let parent = dclc(200);
        let dc = Propagation::new(&parent, DcOrLc::Dc);
        let mut seed = vec![0; dc.lane_size()];
        seed[1] = get_slice_from_row(0x02, 3);
        seed[4] = get_slice_from_row(0x18, 0);
        let packed = dc.build_state_base(&seed, true);
        let unpacked = dc.build_state_base(&seed, false);
        assert!(packed.packed);
        assert!(!unpacked.packed);
        let mut a = packed.iterator_in_kernel();
        let mut b = unpacked.iterator_in_kernel();
        assert_eq!(a.count(), b.count());
        while !a.is_end() {
            assert_eq!(a.current(), b.current());
            a.advance();
            b.advance();
        }
    }

    #[test]
    fn reverse_iterator_reproduces_row_list() {
        // Scenario: a single active bit at (1, 0, 0) after chi; the
        // preimages are exactly the reverse list of row 0b00010 placed on
        // row y=0, lightest first.
        let parent = dclc(200);
        let dc = Propagation::new(&parent, DcOrLc::Dc);
        let mut state = vec![0; dc.lane_size()];
        state[0] = get_slice_point(1, 0);
        let list = &parent.diff_inv_chi[0b00010];
        let mut it = dc.reverse_state_iterator(&state, 10);
        let mut yielded = Vec::new();
        let mut weights = Vec::new();
        while !it.is_end() {
            yielded.push(get_row(it.current(), 0, 0));
            weights.push(it.current_weight());
            it.advance();
        }
        let expected: Vec<(RowValue, u32)> = list
            .values
            .iter()
            .copied()
            .zip(list.weights.iter().copied())
            .filter(|&(_, w)| w <= 10)
            .collect();
        assert_eq!(yielded.len(), expected.len());
        for (i, &(v, w)) in expected.iter().enumerate() {
            assert_eq!(yielded[i], v);
            assert_eq!(weights[i], w);
        }
        assert!(weights.windows(2).all(|p| p[0] <= p[1]));
    }

    #[test]
    fn reverse_iterator_respects_budget_across_rows() {
        let parent = dclc(200);
        let dc = Propagation::new(&parent, DcOrLc::Dc);
        let mut state = vec![0; dc.lane_size()];
        state[0] = get_slice_point(0, 0) ^ get_slice_point(2, 2);
        state[3] = get_slice_point(4, 4);
        let budget = 9;
        let mut it = dc.reverse_state_iterator(&state, budget);
        let mut count = 0u64;
        let mut last_weight = 0;
        while !it.is_end() {
            let w = it.current_weight();
            assert!(w <= budget);
            assert!(w >= last_weight);
            assert_eq!(dc.weight(it.current()), w);
            last_weight = w;
            count += 1;
            it.advance();
        }
        assert!(count > 0);
        // An exhaustive cross-check against the row lists.
        let rows = [0b00001u8, 0b00100, 0b10000];
        let mut expected = 0u64;
        for &w0 in &parent.diff_inv_chi[rows[0] as usize].weights {
            for &w1 in &parent.diff_inv_chi[rows[1] as usize].weights {
                for &w2 in &parent.diff_inv_chi[rows[2] as usize].weights {
                    if w0 + w1 + w2 <= budget {
                        expected += 1;
                    }
                }
            }
        }
        assert_eq!(count, expected);
    }

    #[test]
    fn specify_first_state_materialises_a_core() {
        let parent = dclc(200);
        let dc = Propagation::new(&parent, DcOrLc::Dc);
        let mut second = vec![0; dc.lane_size()];
        second[0] = get_slice_from_row(0x09, 0);
        let mut trail = Trail::new();
        trail.set_first_state_reverse_minimum_weight(
            dc.min_reverse_weight_after_lambda(&second),
            dc.lane_size(),
        );
        trail.append(second.clone(), dc.weight(&second));
        assert!(!trail.first_state_specified);
        dc.specify_first_state_arbitrarily(&mut trail);
        assert!(trail.first_state_specified);
        let after_chi = dc.reverse_lambda(&second);
        assert!(dc.is_chi_compatible_states(&trail.states[0], &after_chi));
    }
}
