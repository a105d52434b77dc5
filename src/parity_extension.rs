//! Two-round trail cores with a given parity, and trail extension
//! specialised to states inside or outside the kernel.
//!
//! The enumerator with a given parity works in three layers, each a stack
//! with budget pruning: values of the affected columns (the 16 even or 16
//! odd 5-bit patterns), one active bit per unaffected odd column, and
//! optional orbitals in the remaining columns.

use log::trace;

use crate::affine::{state_parity, AffineSpaceOfStates};
use crate::parity::{get_parity_of_state, parity_bit};
use crate::parts::{
    get_column, get_row_from_slice, hamming_weight_of_column, set_row, ColumnValue, LaneValue,
    RowValue, SliceValue,
};
use crate::position::{BitPosition, ColumnPosition};
use crate::propagation::Propagation;
use crate::trails::{Trail, TrailFileIterator, TrailSink};
use crate::extension::TrailExtension;
use crate::CoreError;

/// The column position and the y coordinates of the two bits of an orbital.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OrbitalPosition {
    pub x: usize,
    pub z: usize,
    pub y0: usize,
    pub y1: usize,
}

impl OrbitalPosition {
    /// Places the orbital at the first admissible position; `y_min[x+5z]`
    /// gives the lowest allowed y per column. Returns false if no column
    /// admits an orbital.
    pub fn first(&mut self, y_min: &[usize], lane_size: usize) -> bool {
        self.x = 0;
        self.z = 0;
        self.y0 = y_min[self.x + 5 * self.z];
        while self.y0 >= 4 {
            if !self.step_column(lane_size) {
                return false;
            }
            self.y0 = y_min[self.x + 5 * self.z];
        }
        self.y1 = self.y0 + 1;
        true
    }

    /// Moves to the next admissible position.
    pub fn next(&mut self, y_min: &[usize], lane_size: usize) -> bool {
        if self.y1 < 4 {
            self.y1 += 1;
        } else if self.y0 < 3 {
            self.y0 += 1;
            self.y1 = self.y0 + 1;
        } else {
            loop {
                if !self.step_column(lane_size) {
                    return false;
                }
                self.y0 = y_min[self.x + 5 * self.z];
                if self.y0 < 4 {
                    break;
                }
            }
            self.y1 = self.y0 + 1;
        }
        true
    }

    /// Places the orbital at the first admissible position after `other`,
    /// higher in the same column or in a later column.
    pub fn successor_of(&mut self, other: &OrbitalPosition, y_min: &[usize], lane_size: usize) -> bool {
        self.x = other.x;
        self.z = other.z;
        self.y0 = other.y1 + 1;
        while self.y0 >= 4 {
            if !self.step_column(lane_size) {
                return false;
            }
            self.y0 = y_min[self.x + 5 * self.z];
        }
        self.y1 = self.y0 + 1;
        true
    }

    fn step_column(&mut self, lane_size: usize) -> bool {
        if self.x < 4 {
            self.x += 1;
        } else if self.z < lane_size - 1 {
            self.z += 1;
            self.x = 0;
        } else {
            return false;
        }
        true
    }
}

const EVEN_COLUMN_VALUES: [ColumnValue; 16] = [
    0x00, 0x03, 0x05, 0x06, 0x09, 0x0A, 0x0C, 0x0F, 0x11, 0x12, 0x14, 0x17, 0x18, 0x1B, 0x1D,
    0x1E,
];
const ODD_COLUMN_VALUES: [ColumnValue; 16] = [
    0x01, 0x02, 0x04, 0x07, 0x08, 0x0B, 0x0D, 0x0E, 0x10, 0x13, 0x15, 0x16, 0x19, 0x1A, 0x1C,
    0x1F,
];

/// Enumerates all 2-round trail cores whose state at A has the given
/// parity, with core weight w^rev(A) + w(B) at most `max_weight`.
pub struct TwoRoundTrailCoreWithGivenParityIterator<'a> {
    propagation: &'a Propagation<'a>,
    lane_size: usize,
    orbitals: bool,
    c: Vec<RowValue>,
    affected_columns: Vec<ColumnPosition>,
    unaffected_odd_columns: Vec<ColumnPosition>,
    max_weight: i64,
    s1_value_index: Vec<usize>,
    s2_y: Vec<usize>,
    s3_y_min: Vec<usize>,
    s3_position: Vec<OrbitalPosition>,
    stack_state_at_a: Vec<Vec<SliceValue>>,
    stack_state_at_b: Vec<Vec<SliceValue>>,
    stack_weight: Vec<i64>,
    initialized: bool,
    end: bool,
    empty: bool,
    index: u64,
    trail: Trail,
}

impl<'a> TwoRoundTrailCoreWithGivenParityIterator<'a> {
    /// Prepares the enumeration for the given parity. With `orbitals`
    /// false, only the states of minimum total Hamming weight are
    /// generated.
    pub fn new(
        propagation: &'a Propagation<'a>,
        parity: &[RowValue],
        max_weight: u32,
        orbitals: bool,
    ) -> Self {
        let lane_size = propagation.lane_size();
        let d = propagation.direct_theta_effect_from_slice_parities(parity);
        let mut affected_columns = Vec::new();
        let mut unaffected_odd_columns = Vec::new();
        let mut s3_y_min = vec![0; 5 * lane_size];
        for x in 0..5 {
            for z in 0..lane_size {
                let odd = parity_bit(parity, x, z);
                let affected = parity_bit(&d, x, z);
                if affected {
                    let column = ColumnPosition::new(x, z);
                    s3_y_min[column.x_plus_5z()] = 5;
                    affected_columns.push(column);
                } else if odd {
                    unaffected_odd_columns.push(ColumnPosition::new(x, z));
                }
            }
        }
        TwoRoundTrailCoreWithGivenParityIterator {
            propagation,
            lane_size,
            orbitals,
            c: parity.to_vec(),
            affected_columns,
            unaffected_odd_columns,
            max_weight: max_weight as i64,
            s1_value_index: Vec::new(),
            s2_y: Vec::new(),
            s3_y_min,
            s3_position: Vec::new(),
            stack_state_at_a: vec![vec![0; lane_size]],
            stack_state_at_b: vec![vec![0; lane_size]],
            stack_weight: vec![0],
            initialized: false,
            end: false,
            empty: false,
            index: 0,
            trail: Trail::new(),
        }
    }

    fn set_bit_and_delta_weight(&self, state: &mut [SliceValue], p: &BitPosition) -> i64 {
        let before = self.propagation.weight_of_slice(state[p.z]) as i64;
        state[p.z] |= crate::parts::get_slice_point(p.x, p.y);
        self.propagation.weight_of_slice(state[p.z]) as i64 - before
    }

    fn set_bit_and_delta_min_reverse_weight(
        &self,
        state: &mut [SliceValue],
        p: &BitPosition,
    ) -> i64 {
        let before = self.propagation.min_reverse_weight_of_slice(state[p.z]) as i64;
        state[p.z] |= crate::parts::get_slice_point(p.x, p.y);
        self.propagation.min_reverse_weight_of_slice(state[p.z]) as i64 - before
    }

    fn set_value_in_affected_column(
        &self,
        state_at_a: &mut [SliceValue],
        state_at_b: &mut [SliceValue],
        column: &ColumnPosition,
        value: ColumnValue,
    ) -> i64 {
        let mut delta = 0;
        for y in 0..5 {
            let mut p = BitPosition::new(column.x, y, column.z);
            if (value >> y) & 1 != 0 {
                self.propagation.reverse_rho_pi_before_theta(&mut p);
                delta += self.set_bit_and_delta_min_reverse_weight(state_at_a, &p);
            } else {
                self.propagation.direct_rho_pi_after_theta(&mut p);
                delta += self.set_bit_and_delta_weight(state_at_b, &p);
            }
        }
        delta
    }

    fn set_bit_in_unaffected_column(
        &self,
        state_at_a: &mut [SliceValue],
        state_at_b: &mut [SliceValue],
        x: usize,
        y: usize,
        z: usize,
    ) -> i64 {
        let mut delta = 0;
        let mut p = BitPosition::new(x, y, z);
        self.propagation.reverse_rho_pi_before_theta(&mut p);
        delta += self.set_bit_and_delta_min_reverse_weight(state_at_a, &p);
        let mut p = BitPosition::new(x, y, z);
        self.propagation.direct_rho_pi_after_theta(&mut p);
        delta += self.set_bit_and_delta_weight(state_at_b, &p);
        delta
    }

    fn push_states<F: FnOnce(&Self, &mut [SliceValue], &mut [SliceValue]) -> i64>(
        &mut self,
        apply: F,
    ) -> bool {
        let mut state_at_a = self.stack_state_at_a.last().expect("stack not empty").clone();
        let mut state_at_b = self.stack_state_at_b.last().expect("stack not empty").clone();
        let delta = apply(self, &mut state_at_a, &mut state_at_b);
        let new_weight = delta + self.stack_weight.last().expect("stack not empty");
        if new_weight <= self.max_weight {
            self.stack_state_at_a.push(state_at_a);
            self.stack_state_at_b.push(state_at_b);
            self.stack_weight.push(new_weight);
            true
        } else {
            false
        }
    }

    fn pop_states(&mut self) {
        self.stack_state_at_a.pop();
        self.stack_state_at_b.pop();
        self.stack_weight.pop();
    }

    // Stack 1: values of the affected columns.

    fn s1_push(&mut self, value_index: usize) -> bool {
        let height = self.s1_value_index.len();
        let column = self.affected_columns[height];
        let odd = parity_bit(&self.c, column.x, column.z);
        let value = if odd {
            ODD_COLUMN_VALUES[value_index]
        } else {
            EVEN_COLUMN_VALUES[value_index]
        };
        let pushed =
            self.push_states(|it, a, b| it.set_value_in_affected_column(a, b, &column, value));
        if pushed {
            self.s1_value_index.push(value_index);
        }
        pushed
    }

    fn s1_pop(&mut self) -> usize {
        self.pop_states();
        self.s1_value_index.pop().expect("stack 1 not empty")
    }

    fn s1_first_top(&mut self) -> bool {
        for value_index in 0..16 {
            if self.s1_push(value_index) {
                return true;
            }
        }
        false
    }

    fn s1_next_top(&mut self) -> bool {
        let mut value_index = self.s1_pop() + 1;
        while value_index < 16 {
            if self.s1_push(value_index) {
                return true;
            }
            value_index += 1;
        }
        false
    }

    fn s1_first(&mut self) -> bool {
        while self.s1_value_index.len() < self.affected_columns.len() {
            let mut success = true;
            while self.s1_value_index.len() < self.affected_columns.len() && success {
                success = self.s1_first_top();
            }
            while !self.s1_value_index.is_empty() && !success {
                success = self.s1_next_top();
            }
            if self.s1_value_index.is_empty() {
                return false;
            }
        }
        true
    }

    fn s1_next(&mut self) -> bool {
        let mut success;
        loop {
            success = self.s1_next_top();
            if success || self.s1_value_index.is_empty() {
                break;
            }
        }
        if self.s1_value_index.is_empty() {
            false
        } else {
            self.s1_first()
        }
    }

    // Stack 2: single bits in the unaffected odd columns.

    fn s2_push(&mut self, y: usize) -> bool {
        let height = self.s2_y.len();
        let column = self.unaffected_odd_columns[height];
        let pushed =
            self.push_states(|it, a, b| it.set_bit_in_unaffected_column(a, b, column.x, y, column.z));
        if pushed {
            // Orbitals in this column must sit above the parity bit.
            self.s3_y_min[column.x_plus_5z()] = y + 1;
            self.s2_y.push(y);
        }
        pushed
    }

    fn s2_pop(&mut self) -> usize {
        self.pop_states();
        self.s2_y.pop().expect("stack 2 not empty")
    }

    fn s2_first_top(&mut self) -> bool {
        for y in 0..5 {
            if self.s2_push(y) {
                return true;
            }
        }
        false
    }

    fn s2_next_top(&mut self) -> bool {
        let mut y = self.s2_pop() + 1;
        while y < 5 {
            if self.s2_push(y) {
                return true;
            }
            y += 1;
        }
        false
    }

    fn s2_first(&mut self) -> bool {
        while self.s2_y.len() < self.unaffected_odd_columns.len() {
            let mut success = true;
            while self.s2_y.len() < self.unaffected_odd_columns.len() && success {
                success = self.s2_first_top();
            }
            while !self.s2_y.is_empty() && !success {
                success = self.s2_next_top();
            }
            if self.s2_y.is_empty() {
                return false;
            }
        }
        true
    }

    fn s2_next(&mut self) -> bool {
        let mut success;
        loop {
            success = self.s2_next_top();
            if success || self.s2_y.is_empty() {
                break;
            }
        }
        if self.s2_y.is_empty() {
            false
        } else {
            self.s2_first()
        }
    }

    // Stack 3: orbitals in the remaining columns.

    fn s3_push(&mut self, orbital: OrbitalPosition) -> bool {
        let pushed = self.push_states(|it, a, b| {
            it.set_bit_in_unaffected_column(a, b, orbital.x, orbital.y0, orbital.z)
                + it.set_bit_in_unaffected_column(a, b, orbital.x, orbital.y1, orbital.z)
        });
        if pushed {
            self.s3_position.push(orbital);
        }
        pushed
    }

    fn s3_add_new_orbital(&mut self) -> bool {
        let mut orbital = OrbitalPosition::default();
        let found = match self.s3_position.last() {
            None => orbital.first(&self.s3_y_min, self.lane_size),
            Some(last) => {
                let last = *last;
                orbital.successor_of(&last, &self.s3_y_min, self.lane_size)
            }
        };
        if !found {
            return false;
        }
        loop {
            if self.s3_push(orbital) {
                return true;
            }
            if !orbital.next(&self.s3_y_min, self.lane_size) {
                return false;
            }
        }
    }

    fn s3_next_top(&mut self) -> bool {
        let mut orbital = *self.s3_position.last().expect("stack 3 not empty");
        self.pop_states();
        self.s3_position.pop();
        while orbital.next(&self.s3_y_min, self.lane_size) {
            if self.s3_push(orbital) {
                return true;
            }
        }
        false
    }

    fn s3_next(&mut self) -> bool {
        if self.s3_add_new_orbital() {
            return true;
        }
        let mut success = false;
        while !success && !self.s3_position.is_empty() {
            success = self.s3_next_top();
        }
        success
    }

    fn first(&mut self) -> bool {
        if !self.affected_columns.is_empty() {
            if !self.s1_first() {
                return false;
            }
            if !self.unaffected_odd_columns.is_empty() {
                while !self.s2_first() {
                    if !self.s1_next() {
                        return false;
                    }
                }
            }
        } else if !self.unaffected_odd_columns.is_empty() && !self.s2_first() {
            return false;
        }
        true
    }

    fn next(&mut self) -> bool {
        if self.orbitals && self.s3_next() {
            return true;
        }
        if !self.unaffected_odd_columns.is_empty() {
            if self.s2_next() {
                return true;
            }
            if self.affected_columns.is_empty() {
                return false;
            }
            loop {
                if !self.s1_next() {
                    return false;
                }
                if self.s2_first() {
                    return true;
                }
            }
        } else if !self.affected_columns.is_empty() {
            self.s1_next()
        } else {
            false
        }
    }

    fn build_trail(&mut self) {
        let state_at_a = self.stack_state_at_a.last().expect("stack not empty");
        let state_at_b = self.stack_state_at_b.last().expect("stack not empty");
        let mut trail = Trail::new();
        trail.set_first_state_reverse_minimum_weight(
            self.propagation.min_reverse_weight(state_at_a),
            self.lane_size,
        );
        trail.append(state_at_b.clone(), self.propagation.weight(state_at_b));
        self.trail = trail;
    }

    fn ensure_initialized(&mut self) {
        if self.initialized {
            return;
        }
        self.index = 0;
        if self.first() {
            self.build_trail();
            self.end = false;
            self.empty = false;
        } else {
            self.end = true;
            self.empty = true;
        }
        self.initialized = true;
    }

    /// True iff there are no more trail cores.
    pub fn is_end(&mut self) -> bool {
        self.ensure_initialized();
        self.end
    }

    /// True iff the set is empty.
    pub fn is_empty(&mut self) -> bool {
        self.ensure_initialized();
        self.empty
    }

    /// The index of the current trail core.
    pub fn current_index(&mut self) -> u64 {
        self.ensure_initialized();
        self.index
    }

    /// The current trail core.
    pub fn current(&mut self) -> &Trail {
        self.ensure_initialized();
        &self.trail
    }

    /// Moves to the next trail core within the budget.
    pub fn advance(&mut self) {
        self.ensure_initialized();
        if !self.end {
            self.index += 1;
            if self.next() {
                self.build_trail();
            } else {
                self.end = true;
            }
        }
    }
}

/// The affine envelope of the states before χ compatible with the given
/// state after χ: per active row, the unique-bit offset (for single-bit
/// rows) plus one single-bit generator per position not equal to the row.
pub fn build_basis_before_chi_given_pattern_after_chi(
    state_after_chi: &[SliceValue],
) -> AffineSpaceOfStates {
    let lane_size = state_after_chi.len();
    let mut offset = vec![0; lane_size];
    let mut generators = Vec::new();
    let mut parities = Vec::new();
    for (z, &slice) in state_after_chi.iter().enumerate() {
        if slice == 0 {
            continue;
        }
        for y in 0..5 {
            let row = get_row_from_slice(slice, y);
            if row == 0 {
                continue;
            }
            if row.count_ones() == 1 {
                set_row(&mut offset, row, y, z);
            }
            for x in 0..5 {
                let value = 1 << x;
                if value != row {
                    let mut generator = vec![0; lane_size];
                    set_row(&mut generator, value, y, z);
                    parities.push(state_parity(&generator));
                    generators.push(generator);
                }
            }
        }
    }
    let offset_parity = state_parity(&offset);
    AffineSpaceOfStates::new_unpacked(lane_size, generators, parities, offset, offset_parity)
}

/// The image of a before-χ basis through the reverse after-θ map, i.e. a
/// basis for the state just after θ.
pub fn basis_after_theta_given_pattern_before_chi(
    propagation: &Propagation,
    basis_before_chi: &AffineSpaceOfStates,
) -> AffineSpaceOfStates {
    let lane_size = propagation.lane_size();
    let offset = propagation.reverse_lambda_after_theta(&basis_before_chi.offset);
    let offset_parity = state_parity(&offset);
    let mut generators = Vec::new();
    let mut parities = Vec::new();
    for generator in &basis_before_chi.original_generators {
        let moved = propagation.reverse_lambda_after_theta(generator);
        parities.push(state_parity(&moved));
        generators.push(moved);
    }
    AffineSpaceOfStates::new_unpacked(lane_size, generators, parities, offset, offset_parity)
}

/// True iff the affine space meets the kernel: every odd column of the
/// offset must be correctable by a basis bit in the same column.
pub fn intersection_with_kernel(basis: &AffineSpaceOfStates) -> bool {
    let lane_size = basis.offset.len();
    for z in 0..lane_size {
        if basis.offset[z] == 0 {
            continue;
        }
        for x in 0..5 {
            if hamming_weight_of_column(get_column(&basis.offset, x, z)) % 2 != 0 {
                let has_basis_bit = basis
                    .original_generators
                    .iter()
                    .any(|g| get_column(g, x, z) != 0);
                if !has_basis_bit {
                    return false;
                }
            }
        }
    }
    true
}

/// A basis for the intersection of the given space (whose generators carry
/// a single active bit each) with the kernel: odd offset columns are evened
/// out with a basis bit, and equal-column generator pairs become orbital
/// generators with zero parity.
pub fn build_basis_intersection_with_kernel(basis: &AffineSpaceOfStates) -> AffineSpaceOfStates {
    let lane_size = basis.offset.len();
    let mut offset = basis.offset.clone();
    let mut offset_parity = basis.offset_parity.clone();
    let mut generators = Vec::new();
    let mut parities = Vec::new();
    let mut seen_columns: Vec<ColumnPosition> = Vec::new();

    for (i, generator) in basis.original_generators.iter().enumerate() {
        for z in 0..lane_size {
            if generator[z] == 0 {
                continue;
            }
            let Some(x) = (0..5).find(|&x| get_column(generator, x, z) != 0) else {
                break;
            };
            let column = ColumnPosition::new(x, z);
            if seen_columns.contains(&column) {
                break;
            }
            seen_columns.push(column);
            if hamming_weight_of_column(get_column(&offset, x, z)) % 2 != 0 {
                offset[z] ^= generator[z];
                offset_parity[z] ^= basis.original_parities[i][z];
            }
            for j in i + 1..basis.original_generators.len() {
                if basis.original_parities[i][z] == basis.original_parities[j][z] {
                    let mut with_orbital = generator.clone();
                    with_orbital[z] ^= basis.original_generators[j][z];
                    generators.push(with_orbital);
                    parities.push(vec![0; lane_size]);
                }
            }
            break;
        }
    }
    AffineSpaceOfStates::new_unpacked(lane_size, generators, parities, offset, offset_parity)
}

/// θ⁻¹ applied to a parity plane given as five sheets.
pub fn inverse_theta_on_parity_sheets(parity: &mut [LaneValue; 5], lane_size: usize) {
    let mut c = *parity;
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
        z += lane_size;
    }
    let mut effect = [0u64; 5];
    for _ in 0..lane_size {
        for x_off in 0..5i32 {
            if inverse_positions[x_off as usize] & 1 != 0 {
                for x in 0..5i32 {
                    effect[x.rem_euclid(5) as usize] ^=
                        c[(x - x_off).rem_euclid(5) as usize];
                }
            }
        }
        for x_off in 0..5 {
            c[x_off] = crate::permutation::Lane::rotate(c[x_off], 1, lane_size);
            inverse_positions[x_off] >>= 1;
        }
    }
    for x in 0..5 {
        parity[x] ^= effect[x];
    }
}

/// θ⁻¹ applied to a parity plane given as slice parities.
pub fn inverse_theta_on_parity(parity: &mut [RowValue], lane_size: usize) {
    let mut sheets = crate::parity::slices_to_sheets_parity(parity);
    inverse_theta_on_parity_sheets(&mut sheets, lane_size);
    let slices = crate::parity::sheets_to_slices_parity(&sheets, lane_size);
    parity.copy_from_slice(&slices);
}

/// The slice with the most empty slices before it in the parity support of
/// the basis; backward extension outside the kernel starts there.
pub fn starting_slice(basis: &AffineSpaceOfStates) -> usize {
    let lane_size = basis.offset.len();
    let mut active = vec![false; lane_size];
    for parities in &basis.offset_parities {
        for (z, &p) in parities.iter().enumerate() {
            if p != 0 {
                active[z] = true;
            }
        }
    }
    for (z, &p) in basis.offset_parity.iter().enumerate() {
        if p != 0 {
            active[z] = true;
        }
    }
    let mut start = 0;
    let mut max_empty = 0;
    for z in 0..lane_size {
        if !active[z] {
            continue;
        }
        let mut empty = 0;
        for j in 1..lane_size {
            let previous = (z as i64 - j as i64).rem_euclid(lane_size as i64) as usize;
            if active[previous] {
                break;
            }
            empty += 1;
        }
        if empty > max_empty {
            max_empty = empty;
            start = z;
        }
    }
    start
}

fn before_theta_parity_is_zero(propagation: &Propagation, state_before_chi: &[SliceValue]) -> bool {
    let after_chi = propagation.reverse_lambda(state_before_chi);
    let before_theta = propagation.direct_lambda_before_theta(&after_chi);
    get_parity_of_state(&before_theta).iter().all(|&p| p == 0)
}

impl<'a> TrailExtension<'a> {
    /// Like [Self::forward_extend_trail], but the immediately appended
    /// state is restricted to the kernel.
    pub fn forward_extend_trail_in_kernel(
        &mut self,
        trail: &Trail,
        sink: &mut impl TrailSink,
        nr_rounds: usize,
        max_total_weight: u32,
    ) {
        debug_assert!(trail.state_after_last_chi.is_none());
        self.extend_forward_with_parity_filter(trail, sink, nr_rounds, max_total_weight, true);
    }

    /// Like [Self::forward_extend_trail], but the immediately appended
    /// state is restricted to non-zero parity.
    pub fn forward_extend_trail_outside_kernel(
        &mut self,
        trail: &Trail,
        sink: &mut impl TrailSink,
        nr_rounds: usize,
        max_total_weight: u32,
    ) {
        debug_assert!(trail.state_after_last_chi.is_none());
        self.extend_forward_with_parity_filter(trail, sink, nr_rounds, max_total_weight, false);
    }

    /// Drives [Self::forward_extend_trail_in_kernel] over a trail file.
    pub fn forward_extend_trails_in_kernel(
        &mut self,
        trails: &mut TrailFileIterator,
        sink: &mut impl TrailSink,
        nr_rounds: usize,
        max_total_weight: u32,
    ) -> Result<(), CoreError> {
        while let Some(trail) = trails.next_trail()? {
            self.forward_extend_trail_in_kernel(&trail, sink, nr_rounds, max_total_weight);
        }
        Ok(())
    }

    /// Drives [Self::forward_extend_trail_outside_kernel] over a trail
    /// file.
    pub fn forward_extend_trails_outside_kernel(
        &mut self,
        trails: &mut TrailFileIterator,
        sink: &mut impl TrailSink,
        nr_rounds: usize,
        max_total_weight: u32,
    ) -> Result<(), CoreError> {
        while let Some(trail) = trails.next_trail()? {
            self.forward_extend_trail_outside_kernel(&trail, sink, nr_rounds, max_total_weight);
        }
        Ok(())
    }

    fn extend_forward_with_parity_filter(
        &mut self,
        trail: &Trail,
        sink: &mut impl TrailSink,
        nr_rounds: usize,
        max_total_weight: u32,
        in_kernel: bool,
    ) {
        let base_nr_rounds = trail.number_of_rounds();
        if base_nr_rounds >= nr_rounds {
            return;
        }
        let max_weight_out = max_total_weight as i64
            - trail.total_weight as i64
            - self.known_bounds.min_weight(nr_rounds - base_nr_rounds - 1) as i64;
        if max_weight_out < self.known_bounds.min_weight(1) as i64 {
            return;
        }
        let Some(last) = trail.states.last() else {
            return;
        };
        trace!(
            "forward ({}): towards round {}, limiting to {max_weight_out}",
            if in_kernel { "kernel" } else { "non-kernel" },
            base_nr_rounds + 1
        );
        let base = self.propagation.build_state_base(last, false);
        if in_kernel {
            let mut iterator = base.iterator_in_kernel();
            while !iterator.is_end() {
                let candidate = iterator.current().to_vec();
                self.forward_candidate_with_filter(
                    trail,
                    candidate,
                    sink,
                    nr_rounds,
                    max_total_weight,
                    max_weight_out,
                );
                iterator.advance();
            }
        } else {
            let mut iterator = base.iterator();
            while !iterator.is_end() {
                let candidate = iterator.current().to_vec();
                if !before_theta_parity_is_zero(self.propagation, &candidate) {
                    self.forward_candidate_with_filter(
                        trail,
                        candidate,
                        sink,
                        nr_rounds,
                        max_total_weight,
                        max_weight_out,
                    );
                }
                iterator.advance();
            }
        }
    }

    fn forward_candidate_with_filter(
        &mut self,
        trail: &Trail,
        next_state: Vec<SliceValue>,
        sink: &mut impl TrailSink,
        nr_rounds: usize,
        max_total_weight: u32,
        max_weight_out: i64,
    ) {
        let weight_out = self.propagation.weight(&next_state) as i64;
        let cur_weight = trail.total_weight as i64 + weight_out;
        let cur_nr_rounds = trail.number_of_rounds() + 1;
        if cur_nr_rounds == nr_rounds {
            if cur_weight <= max_total_weight as i64 {
                let mut new_trail = trail.clone();
                new_trail.append(next_state, weight_out as u32);
                sink.fetch_trail(&new_trail);
            }
        } else if weight_out <= max_weight_out {
            let mut new_trail = trail.clone();
            new_trail.append(next_state, weight_out as u32);
            self.forward_extend_trail(&new_trail, sink, nr_rounds, max_total_weight);
        }
    }

    /// Turns a trail prefix into a trail core by accounting for the
    /// lightest possible previous round.
    fn complete_trail_core(
        &mut self,
        trail: &Trail,
        sink: &mut impl TrailSink,
        max_total_weight: u32,
    ) {
        let Some(first) = trail.states.first() else {
            return;
        };
        let state_after_chi = self.propagation.reverse_lambda(first);
        let min_reverse_weight = self.propagation.min_reverse_weight(&state_after_chi);
        if trail.total_weight as i64 + min_reverse_weight as i64 <= max_total_weight as i64 {
            let mut new_trail = Trail::new();
            new_trail.set_first_state_reverse_minimum_weight(
                min_reverse_weight,
                self.propagation.lane_size(),
            );
            new_trail.append_trail(trail);
            sink.fetch_trail(&new_trail);
        }
    }

    /// Prepends one round to the given trail so that the prepended state
    /// after χ lies in the kernel, producing trail cores. With
    /// `nr_rounds` equal to the current round count plus one, only the
    /// minimum reverse weight completes the core, as in
    /// [Self::backward_extend_trail].
    pub fn backward_extend_trail_in_kernel(
        &mut self,
        trail: &Trail,
        sink: &mut impl TrailSink,
        nr_rounds: usize,
        max_total_weight: u32,
    ) {
        let working;
        let trail = if trail.first_state_specified {
            trail
        } else {
            let mut trimmed = Trail::new();
            for i in 1..trail.states.len() {
                trimmed.append(trail.states[i].clone(), trail.weights[i]);
            }
            working = trimmed;
            &working
        };
        let Some(first) = trail.states.first() else {
            return;
        };
        if !self.all_prefixes && nr_rounds == trail.number_of_rounds() + 1 {
            self.complete_trail_core(trail, sink, max_total_weight);
            return;
        }
        let base_weight = trail.total_weight as i64;
        let max_weight_out =
            max_total_weight as i64 - base_weight - self.known_bounds.min_weight(1) as i64;
        if max_weight_out < self.known_bounds.min_weight(1) as i64 {
            return;
        }
        let state_after_chi = self.propagation.reverse_lambda(first);
        let basis_before_chi = build_basis_before_chi_given_pattern_after_chi(&state_after_chi);
        let basis_after_theta =
            basis_after_theta_given_pattern_before_chi(self.propagation, &basis_before_chi);
        let floor = base_weight
            + self.propagation.weight(&basis_before_chi.offset) as i64
            + self.propagation.min_reverse_weight(&basis_after_theta.offset) as i64;
        if floor > max_total_weight as i64 {
            return;
        }
        if !intersection_with_kernel(&basis_after_theta) {
            return;
        }
        let intersection = build_basis_intersection_with_kernel(&basis_after_theta);
        let mut iterator = intersection.iterator_in_kernel();
        while !iterator.is_end() {
            let state = iterator.current().to_vec();
            let state_before_chi = self.propagation.direct_lambda_after_theta(&state);
            if self
                .propagation
                .is_chi_compatible_states(&state_before_chi, &state_after_chi)
            {
                let mut new_trail = Trail::new();
                new_trail.set_first_state_reverse_minimum_weight(
                    self.propagation.min_reverse_weight(&state),
                    self.propagation.lane_size(),
                );
                new_trail.append(
                    state_before_chi.clone(),
                    self.propagation.weight(&state_before_chi),
                );
                new_trail.append_trail(trail);
                if new_trail.total_weight <= max_total_weight {
                    sink.fetch_trail(&new_trail);
                }
            }
            iterator.advance();
        }
    }

    /// Drives [Self::backward_extend_trail_in_kernel] over a trail file.
    pub fn backward_extend_trails_in_kernel(
        &mut self,
        trails: &mut TrailFileIterator,
        sink: &mut impl TrailSink,
        nr_rounds: usize,
        max_total_weight: u32,
    ) -> Result<(), CoreError> {
        while let Some(trail) = trails.next_trail()? {
            self.backward_extend_trail_in_kernel(&trail, sink, nr_rounds, max_total_weight);
        }
        Ok(())
    }

    /// Prepends one round to the given trail so that the prepended state
    /// after χ has non-zero parity, producing trail cores.
    pub fn backward_extend_trail_outside_kernel(
        &mut self,
        trail: &Trail,
        sink: &mut impl TrailSink,
        nr_rounds: usize,
        max_total_weight: u32,
    ) {
        let working;
        let trail = if trail.first_state_specified {
            trail
        } else {
            let mut trimmed = Trail::new();
            for i in 1..trail.states.len() {
                trimmed.append(trail.states[i].clone(), trail.weights[i]);
            }
            working = trimmed;
            &working
        };
        let Some(first) = trail.states.first() else {
            return;
        };
        if !self.all_prefixes && nr_rounds == trail.number_of_rounds() + 1 {
            self.complete_trail_core(trail, sink, max_total_weight);
            return;
        }
        let base_weight = trail.total_weight as i64;
        let base_nr_rounds = trail.number_of_rounds();
        let max_weight_out = max_total_weight as i64
            - base_weight
            - self.known_bounds.min_weight(nr_rounds - base_nr_rounds - 1) as i64;
        if max_weight_out < self.known_bounds.min_weight(1) as i64 {
            return;
        }
        let state_after_chi = self.propagation.reverse_lambda(first);
        let mut iterator = self
            .propagation
            .reverse_state_iterator(&state_after_chi, max_weight_out as u32);
        while !iterator.is_end() {
            let candidate = iterator.current().to_vec();
            let weight_out = iterator.current_weight();
            if !before_theta_parity_is_zero(self.propagation, &candidate) {
                let previous_after_chi = self.propagation.reverse_lambda(&candidate);
                let mut new_trail = Trail::new();
                new_trail.set_first_state_reverse_minimum_weight(
                    self.propagation.min_reverse_weight(&previous_after_chi),
                    self.propagation.lane_size(),
                );
                new_trail.append(candidate, weight_out);
                new_trail.append_trail(trail);
                if new_trail.total_weight <= max_total_weight {
                    sink.fetch_trail(&new_trail);
                }
            }
            iterator.advance();
        }
    }

    /// Drives [Self::backward_extend_trail_outside_kernel] over a trail
    /// file.
    pub fn backward_extend_trails_outside_kernel(
        &mut self,
        trails: &mut TrailFileIterator,
        sink: &mut impl TrailSink,
        nr_rounds: usize,
        max_total_weight: u32,
    ) -> Result<(), CoreError> {
        while let Some(trail) = trails.next_trail()? {
            self.backward_extend_trail_outside_kernel(&trail, sink, nr_rounds, max_total_weight);
        }
        Ok(())
    }
}
