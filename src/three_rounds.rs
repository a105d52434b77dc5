//! Enumeration of three-round trail cores whose middle state after χ lies
//! in the kernel.
//!
//! The search places *chains* of active bits at B: pairs of points sharing a
//! column at B (orbital points) alternating with pairs sharing a column at
//! A, where chains start and end in *knots* (slices active both before and
//! after χ). A per-slice-value lookup table classifies every possible knot
//! by its deficits, and closed chains (*vortices*) are precomputed in a
//! base and overlaid on the knot structures.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::parity::get_parity_of_slice;
use crate::parts::{
    get_bit, get_nr_active_rows, get_nr_active_rows_of_state, get_row, get_slice_point,
    hamming_weight_of_slice, hamming_weight_of_state, is_minimal_symmetrically, set_bit_to_one,
    set_bit_to_zero, SliceValue, MAX_SLICE_VALUE,
};
use crate::position::{BitPosition, RowPosition};
use crate::propagation::Propagation;
use crate::CoreError;

/// The classification of a slice value when it serves as a knot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KnotInformation {
    /// Whether the slice is an orbital (two bits in one column).
    pub is_orbital: bool,
    /// The number of active rows in the slice.
    pub nr_active_rows: u32,
    /// The minimum number of knot points still to add before the knot is
    /// tame.
    pub knot_point_deficit: u32,
    /// The minimum weight increase at B before the knot is tame.
    pub knot_weight_at_b_deficit: u32,
}

/// Packs knot information into the cache byte layout: bit 0 is the orbital
/// flag, bits 1–3 the active rows, bits 4–5 the knot point deficit and bits
/// 6–7 the weight deficit.
pub(crate) fn pack_knot_info(
    knot_point_deficit: u32,
    knot_weight_at_b_deficit: u32,
    nr_active_rows: u32,
    is_orbital: bool,
) -> u8 {
    debug_assert!(knot_point_deficit <= 3 && knot_weight_at_b_deficit <= 3);
    (nr_active_rows * 2 + knot_point_deficit * 16 + knot_weight_at_b_deficit * 64) as u8
        | u8::from(is_orbital)
}

/// A slice is tame when its χ output space contains a non-trivial element
/// of zero parity; the single orbital is excluded because its only
/// zero-parity companion is the empty slice.
fn slice_is_tame(propagation: &Propagation, slice: SliceValue) -> bool {
    if hamming_weight_of_slice(slice) == 2 && get_parity_of_slice(slice) == 0 {
        return false;
    }
    propagation
        .build_slice_base(slice)
        .offset_with_given_parity(0)
        .is_some()
}

pub(crate) fn knot_info_byte(
    propagation: &Propagation,
    slice: SliceValue,
    is_tame: &dyn Fn(SliceValue) -> bool,
) -> u8 {
    let nr_active_rows = get_nr_active_rows(slice);
    let (knot_point_deficit, knot_weight_deficit, is_orbital) = if is_tame(slice) {
        (0, 0, false)
    } else {
        let hamming_weight = hamming_weight_of_slice(slice);
        if hamming_weight == 0 {
            (0, 0, false)
        } else if hamming_weight == 1 {
            (2, 3, false)
        } else if hamming_weight == 2 && get_parity_of_slice(slice) == 0 {
            (1, 1, true)
        } else {
            let mut weight_deficit = 4i64;
            for x in 0..5 {
                for y in 0..5 {
                    let with_stray = slice | get_slice_point(x, y);
                    if with_stray != slice && is_tame(with_stray) {
                        let delta = propagation.weight_of_slice(with_stray) as i64
                            - propagation.weight_of_slice(slice) as i64;
                        weight_deficit = weight_deficit.min(delta.max(0));
                    }
                }
            }
            (1, weight_deficit.min(3) as u32, false)
        }
    };
    pack_knot_info(knot_point_deficit, knot_weight_deficit, nr_active_rows, is_orbital)
}

fn unpack_knot_info(byte: u8, knot_has_single_point: bool, has_background: bool) -> KnotInformation {
    let is_orbital = byte & 1 != 0;
    if has_background && knot_has_single_point {
        KnotInformation {
            is_orbital,
            nr_active_rows: 1,
            knot_point_deficit: 1,
            knot_weight_at_b_deficit: 2,
        }
    } else if has_background && is_orbital {
        KnotInformation {
            is_orbital,
            nr_active_rows: 2,
            knot_point_deficit: 0,
            knot_weight_at_b_deficit: 0,
        }
    } else {
        let rest = byte >> 1;
        KnotInformation {
            is_orbital,
            nr_active_rows: (rest & 0x7) as u32,
            knot_point_deficit: ((rest >> 3) & 0x3) as u32,
            knot_weight_at_b_deficit: ((rest >> 5) & 0x3) as u32,
        }
    }
}

/// A closed chain at B, stored as a sparse state with the active-row counts
/// it induces at A and D.
#[derive(Clone, Debug)]
struct VortexInfo {
    state_at_b: BTreeMap<usize, SliceValue>,
    nr_active_rows_at_a: u32,
    nr_active_rows_at_d: u32,
}

/// One entry of the vortex overlay stack of the enumerator.
#[derive(Clone, Debug)]
pub struct CoreInfo {
    pub hamming_weight_at_a: u32,
    pub nr_active_rows_at_a: u32,
    /// The state at B.
    pub state_at_b: Vec<SliceValue>,
    pub weight_at_b: u32,
    /// The bits certainly present at C given the state at B and the kernel
    /// constraint.
    pub partial_state_at_c: Vec<SliceValue>,
    pub hamming_weight_at_d: u32,
    pub nr_active_rows_at_d: u32,
    /// The weight of the core based on the state at B and the partial state
    /// at C.
    pub partial_weight: u32,
    pub vortex_length: usize,
    pub vortex_index: usize,
    pub vortex_z_offset: usize,
}

struct VortexSearch<'a, 'b> {
    propagation: &'a Propagation<'b>,
    chain: Vec<BitPosition>,
    y_offset: Vec<usize>,
    rows_at_a: BTreeMap<RowPosition, u32>,
    rows_at_d: BTreeMap<RowPosition, u32>,
    slices_at_b: BTreeMap<usize, u32>,
}

impl<'a, 'b> VortexSearch<'a, 'b> {
    fn add_point(&mut self, p: BitPosition) {
        self.chain.push(p);
        self.y_offset.push(0);
        *self.slices_at_b.entry(p.z).or_insert(0) += 1;
        let mut at_a = p;
        self.propagation.reverse_rho_pi(&mut at_a);
        *self.rows_at_a.entry(RowPosition::from(at_a)).or_insert(0) += 1;
        let mut at_d = p;
        self.propagation.direct_rho_pi(&mut at_d);
        *self.rows_at_d.entry(RowPosition::from(at_d)).or_insert(0) += 1;
    }

    fn remove_point(&mut self) -> BitPosition {
        let p = self.chain.pop().expect("chain not empty");
        self.y_offset.pop();
        Self::decrement(&mut self.slices_at_b, p.z);
        let mut at_a = p;
        self.propagation.reverse_rho_pi(&mut at_a);
        Self::decrement(&mut self.rows_at_a, RowPosition::from(at_a));
        let mut at_d = p;
        self.propagation.direct_rho_pi(&mut at_d);
        Self::decrement(&mut self.rows_at_d, RowPosition::from(at_d));
        p
    }

    fn decrement<K: Ord>(map: &mut BTreeMap<K, u32>, key: K) {
        if let Some(count) = map.get_mut(&key) {
            if *count == 1 {
                map.remove(&key);
            } else {
                *count -= 1;
            }
        }
    }

    fn cost(&self, extra: u32) -> u32 {
        2 * self.chain.len() as u32
            + 2 * self.rows_at_a.len() as u32
            + 2 * self.rows_at_d.len() as u32
            + extra
    }
}

fn build_vortex_base(propagation: &Propagation, max_weight: u32) -> Vec<Vec<VortexInfo>> {
    let lane_size = propagation.lane_size();
    let mut base: Vec<Vec<VortexInfo>> = Vec::new();
    let mut search = VortexSearch {
        propagation,
        chain: Vec::new(),
        y_offset: Vec::new(),
        rows_at_a: BTreeMap::new(),
        rows_at_d: BTreeMap::new(),
        slices_at_b: BTreeMap::new(),
    };
    search.add_point(BitPosition::new(0, 0, 0));

    loop {
        if search.chain.len() == 1 && search.y_offset.last() == Some(&4) {
            let mut p = search.remove_point();
            if !p.next_xy() {
                return base;
            }
            search.add_point(p);
        }

        if search.chain.len() % 2 == 0 {
            // Chain the next point in the same column at B.
            *search.y_offset.last_mut().expect("chain not empty") += 1;
            let mut p = *search.chain.last().expect("chain not empty");
            p.y_translate(*search.y_offset.last().expect("chain not empty") as i32);
            search.add_point(p);
            if search.cost(2) > max_weight {
                search.remove_point();
            }
        } else {
            // Peer the next point in the same column at A.
            *search.y_offset.last_mut().expect("chain not empty") += 1;
            let mut p = *search.chain.last().expect("chain not empty");
            propagation.reverse_rho_pi(&mut p);
            p.y_translate(*search.y_offset.last().expect("chain not empty") as i32);
            propagation.direct_rho_pi(&mut p);
            if !search.slices_at_b.contains_key(&p.z) {
                search.add_point(p);
                if search.cost(4) > max_weight {
                    search.remove_point();
                }
            } else if p.z == search.chain[0].z && p.x == search.chain[0].x && p.y != search.chain[0].y
            {
                // The chain closes onto its start column: a vortex.
                search.add_point(p);
                if search.cost(0) <= max_weight {
                    let mut work_state = vec![0; lane_size];
                    for point in &search.chain {
                        set_bit_to_one(&mut work_state, point.x, point.y, point.z);
                    }
                    if search.chain[0] < *search.chain.last().expect("chain not empty")
                        && is_minimal_symmetrically(&work_state)
                    {
                        while 2 * base.len() <= search.chain.len() {
                            base.push(Vec::new());
                        }
                        let mut state_at_b = BTreeMap::new();
                        for point in &search.chain {
                            *state_at_b.entry(point.z).or_insert(0) |=
                                get_slice_point(point.x, point.y);
                        }
                        base[search.chain.len() / 2].push(VortexInfo {
                            state_at_b,
                            nr_active_rows_at_a: search.rows_at_a.len() as u32,
                            nr_active_rows_at_d: search.rows_at_d.len() as u32,
                        });
                    }
                }
                search.remove_point();
            }
        }
        while search.chain.len() > 1 && search.y_offset.last() == Some(&4) {
            search.remove_point();
        }
    }
}

/// Enumerates the states at B of 3-round trail cores with the state at C in
/// the kernel, around an optional background, up to a maximum weight.
///
/// Call [Self::next] repeatedly; each success leaves the current core in
/// [Self::top_core].
pub struct InKernelTrailCores<'a> {
    propagation: &'a Propagation<'a>,
    lane_size: usize,
    knot_info_lut: Vec<u8>,
    max_weight: u32,
    knots: BTreeMap<usize, KnotInformation>,
    knots_with_background: BTreeSet<usize>,
    chains: Vec<Vec<BitPosition>>,
    y_offsets: Vec<Vec<usize>>,
    knot_point_added_knot: Vec<bool>,
    state_at_a: Vec<SliceValue>,
    state_at_b: Vec<SliceValue>,
    taboo_at_b: Vec<SliceValue>,
    minimum_working_chain_length: usize,
    start_point_working_chain_is_free: bool,
    nr_active_rows_at_a: u32,
    hamming_weight_at_a: u32,
    partial_state_at_d: Vec<SliceValue>,
    weight_at_b: u32,
    knot_point_deficit: i64,
    knot_weight_at_b_deficit: i64,
    partial_hamming_weight_at_d: i64,
    partial_nr_active_rows_at_d: u32,
    background_core_pending: bool,
    vortex_base: Vec<Vec<VortexInfo>>,
    out_core: Vec<CoreInfo>,
}

impl<'a> InKernelTrailCores<'a> {
    /// Builds the enumerator. The knot-info table over all 2^25 slice
    /// values is loaded from (or written to) its cache file in `cache_dir`.
    pub fn new(
        propagation: &'a Propagation<'a>,
        background_at_a: &[SliceValue],
        taboo_at_b: &[SliceValue],
        max_weight: u32,
        cache_dir: &Path,
    ) -> Result<Self, CoreError> {
        let lane_size = propagation.lane_size();
        let mut cores = InKernelTrailCores {
            propagation,
            lane_size,
            knot_info_lut: Vec::new(),
            max_weight,
            knots: BTreeMap::new(),
            knots_with_background: BTreeSet::new(),
            chains: Vec::new(),
            y_offsets: Vec::new(),
            knot_point_added_knot: Vec::new(),
            state_at_a: vec![0; lane_size],
            state_at_b: vec![0; lane_size],
            taboo_at_b: taboo_at_b.to_vec(),
            minimum_working_chain_length: 2,
            start_point_working_chain_is_free: false,
            nr_active_rows_at_a: 0,
            hamming_weight_at_a: 0,
            partial_state_at_d: vec![0; lane_size],
            weight_at_b: 0,
            knot_point_deficit: 0,
            knot_weight_at_b_deficit: 0,
            partial_hamming_weight_at_d: 0,
            partial_nr_active_rows_at_d: 0,
            background_core_pending: true,
            vortex_base: Vec::new(),
            out_core: Vec::new(),
        };
        cores.initialize_knot_info_lut(cache_dir)?;
        cores.vortex_base = build_vortex_base(propagation, max_weight);
        cores.populate_states_with_background(background_at_a);
        cores.nr_active_rows_at_a = get_nr_active_rows_of_state(&cores.state_at_a);
        cores.hamming_weight_at_a = hamming_weight_of_state(&cores.state_at_a);
        if cores.weight_at_b == 0 {
            cores.out_core.push(CoreInfo {
                hamming_weight_at_a: 0,
                nr_active_rows_at_a: 0,
                state_at_b: vec![0; lane_size],
                weight_at_b: 0,
                partial_state_at_c: vec![0; lane_size],
                hamming_weight_at_d: 0,
                nr_active_rows_at_d: 0,
                partial_weight: 0,
                vortex_length: 0,
                vortex_index: 0,
                vortex_z_offset: 0,
            });
        }
        Ok(cores)
    }

    fn knot_info_cache_path(&self, cache_dir: &Path) -> PathBuf {
        cache_dir.join(format!(
            "KnotInfo{}{}.cache",
            self.propagation.name,
            self.propagation.parent.name()
        ))
    }

    fn initialize_knot_info_lut(&mut self, cache_dir: &Path) -> Result<(), CoreError> {
        let path = self.knot_info_cache_path(cache_dir);
        let entries = MAX_SLICE_VALUE as usize + 1;
        if let Ok(data) = fs::read(&path) {
            if data.len() == entries {
                debug!("loaded knot info from {}", path.display());
                self.knot_info_lut = data;
                return Ok(());
            }
        }
        debug!("building knot info table for {}", self.propagation.name);
        let mut tame = vec![false; entries];
        for (slice, t) in tame.iter_mut().enumerate() {
            *t = slice_is_tame(self.propagation, slice as SliceValue);
        }
        let mut lut = Vec::with_capacity(entries);
        for slice in 0..entries {
            lut.push(knot_info_byte(self.propagation, slice as SliceValue, &|s| {
                tame[s as usize]
            }));
        }
        if let Err(e) = fs::write(&path, &lut) {
            log::warn!("could not write knot info cache {}: {}", path.display(), e);
        }
        self.knot_info_lut = lut;
        Ok(())
    }

    fn populate_knot_info(
        &self,
        slice: SliceValue,
        knot_has_single_point: bool,
        has_background: bool,
    ) -> KnotInformation {
        unpack_knot_info(
            self.knot_info_lut[slice as usize],
            knot_has_single_point,
            has_background,
        )
    }

    fn populate_states_with_background(&mut self, background_at_a: &[SliceValue]) {
        let background_at_b = self.propagation.direct_lambda(background_at_a);
        for z in 0..self.lane_size {
            for y in 0..5 {
                for x in 0..5 {
                    if get_bit(&background_at_b, x, y, z) != 0 {
                        self.add_point(BitPosition::new(x, y, z), true, true);
                    }
                }
            }
        }
        self.state_at_a = background_at_a.to_vec();
    }

    fn is_state_at_b_well_formed(&self) -> bool {
        self.knot_point_deficit == 0
    }

    /// The projected lower bound with the given additions still to come;
    /// the search may continue only while it stays within the budget.
    fn can_afford_generic(
        &self,
        delta_nr_knot_points_working_chain: u32,
        additional_knot_or_run: u32,
        nr_orbital_points_per_delta_chain: u32,
        delta_nr_orbital_points_working_chain: u32,
    ) -> bool {
        let mut chain_deficit = self.knot_point_deficit + 2 * additional_knot_or_run as i64;
        chain_deficit = (chain_deficit - delta_nr_knot_points_working_chain as i64).max(0);
        let chain_deficit = ((chain_deficit + 1) / 2) as u32;

        let orbital_point_deficit = nr_orbital_points_per_delta_chain * chain_deficit
            + delta_nr_orbital_points_working_chain;

        let projected_hamming_weight_at_a =
            self.hamming_weight_at_a as i64 + orbital_point_deficit as i64 + self.knot_point_deficit;
        let projected_weight_at_b = self.weight_at_b as i64
            + 2 * orbital_point_deficit as i64
            + self.knot_weight_at_b_deficit;
        let projected_partial_hamming_weight_at_d =
            self.partial_hamming_weight_at_d + orbital_point_deficit as i64;

        let lower_weight = self.propagation.lower_bound_on_reverse_weight(
            projected_hamming_weight_at_a.max(0) as u32,
            self.nr_active_rows_at_a,
        ) as i64
            + projected_weight_at_b
            + self.propagation.lower_bound_on_weight(
                projected_partial_hamming_weight_at_d.max(0) as u32,
                self.partial_nr_active_rows_at_d,
            ) as i64;

        lower_weight <= self.max_weight as i64
    }

    fn can_afford_extending_chain(&self) -> bool {
        let working_len = self.working_chain_len();
        let (nr_orbital_points_per_delta_chain, delta_nr_orbital_points_working_chain) =
            if working_len >= self.minimum_working_chain_length {
                let chain_odd = working_len % 2;
                (working_len - chain_odd, 1 - chain_odd)
            } else {
                (
                    self.minimum_working_chain_length - 2,
                    self.minimum_working_chain_length - working_len - 1,
                )
            };
        self.can_afford_generic(
            1,
            0,
            nr_orbital_points_per_delta_chain as u32,
            delta_nr_orbital_points_working_chain as u32,
        )
    }

    fn can_afford_adding_chain(&self) -> bool {
        self.can_afford_generic(
            2,
            0,
            (self.minimum_working_chain_length - 2) as u32,
            (self.minimum_working_chain_length - 2) as u32,
        )
    }

    fn may_be_end_point(&self) -> bool {
        // A chain ending in a fresh slice adds one knot point and one knot.
        let working_len = self.working_chain_len();
        self.can_afford_generic(1, 1, working_len as u32 - 1, 0)
    }

    fn next_knot_slice(&self, after: Option<usize>) -> Option<usize> {
        match after {
            None => self.knots.keys().next().copied(),
            Some(z) => self.knots.range(z + 1..).next().map(|(&k, _)| k),
        }
    }

    fn add_point(&mut self, p: BitPosition, to_knot_slice: bool, is_background_point: bool) {
        if !is_background_point {
            self.y_offsets
                .last_mut()
                .expect("working chain exists")
                .push(0);
            self.chains.last_mut().expect("working chain exists").push(p);

            let mut at_a = p;
            self.propagation.reverse_rho_pi(&mut at_a);
            self.hamming_weight_at_a += 1;
            if get_row(&self.state_at_a, at_a.y, at_a.z) == 0 {
                self.nr_active_rows_at_a += 1;
            }
            set_bit_to_one(&mut self.state_at_a, at_a.x, at_a.y, at_a.z);
        } else {
            self.knots_with_background.insert(p.z);
        }

        if to_knot_slice {
            self.weight_at_b -= self.propagation.weight_of_slice(self.state_at_b[p.z]);
            set_bit_to_one(&mut self.state_at_b, p.x, p.y, p.z);
            self.weight_at_b += self.propagation.weight_of_slice(self.state_at_b[p.z]);

            let has_background = self.knots_with_background.contains(&p.z);
            let new_info;
            if let Some(old_info) = self.knots.get(&p.z).copied() {
                self.knot_point_added_knot.push(false);
                new_info = self.populate_knot_info(self.state_at_b[p.z], false, has_background);
                self.knot_point_deficit +=
                    new_info.knot_point_deficit as i64 - old_info.knot_point_deficit as i64;
                self.knot_weight_at_b_deficit += new_info.knot_weight_at_b_deficit as i64
                    - old_info.knot_weight_at_b_deficit as i64;
                self.partial_hamming_weight_at_d +=
                    new_info.nr_active_rows as i64 - old_info.nr_active_rows as i64;
            } else {
                self.knot_point_added_knot.push(true);
                new_info = self.populate_knot_info(self.state_at_b[p.z], true, has_background);
                if has_background {
                    self.knot_point_deficit += 1;
                    self.knot_weight_at_b_deficit += 2;
                } else {
                    self.knot_point_deficit += 2;
                    self.knot_weight_at_b_deficit += 3;
                }
                self.partial_hamming_weight_at_d += 1;
            }
            self.knots.insert(p.z, new_info);
        } else {
            // An orbital point is alone in its row at B.
            self.weight_at_b += 2;
            set_bit_to_one(&mut self.state_at_b, p.x, p.y, p.z);

            let mut at_d = p;
            self.propagation.direct_rho_pi(&mut at_d);
            self.partial_hamming_weight_at_d += 1;
            if get_row(&self.partial_state_at_d, at_d.y, at_d.z) == 0 {
                self.partial_nr_active_rows_at_d += 1;
            }
            set_bit_to_one(&mut self.partial_state_at_d, at_d.x, at_d.y, at_d.z);
        }
    }

    fn remove_point(&mut self, from_knot_slice: bool) {
        let p = self
            .chains
            .last_mut()
            .expect("working chain exists")
            .pop()
            .expect("chain has a point");
        self.y_offsets.last_mut().expect("working chain exists").pop();

        let mut at_a = p;
        self.propagation.reverse_rho_pi(&mut at_a);
        set_bit_to_zero(&mut self.state_at_a, at_a.x, at_a.y, at_a.z);
        self.hamming_weight_at_a -= 1;
        if get_row(&self.state_at_a, at_a.y, at_a.z) == 0 {
            self.nr_active_rows_at_a -= 1;
        }

        if from_knot_slice {
            let added_knot = self.knot_point_added_knot.pop().expect("bookkeeping");
            if added_knot {
                set_bit_to_zero(&mut self.state_at_b, p.x, p.y, p.z);
                self.weight_at_b -= 2;
                self.knot_point_deficit -= 2;
                self.knot_weight_at_b_deficit -= 3;
                self.partial_hamming_weight_at_d -= 1;
                self.knots.remove(&p.z);
            } else {
                self.weight_at_b -= self.propagation.weight_of_slice(self.state_at_b[p.z]);
                set_bit_to_zero(&mut self.state_at_b, p.x, p.y, p.z);
                self.weight_at_b += self.propagation.weight_of_slice(self.state_at_b[p.z]);

                let old_info = self.knots[&p.z];
                let has_background = self.knots_with_background.contains(&p.z);
                let knot_has_single_point = hamming_weight_of_slice(self.state_at_b[p.z]) == 1;
                let updated = self.populate_knot_info(
                    self.state_at_b[p.z],
                    knot_has_single_point,
                    has_background,
                );
                self.knot_point_deficit +=
                    updated.knot_point_deficit as i64 - old_info.knot_point_deficit as i64;
                self.knot_weight_at_b_deficit += updated.knot_weight_at_b_deficit as i64
                    - old_info.knot_weight_at_b_deficit as i64;
                self.partial_hamming_weight_at_d +=
                    updated.nr_active_rows as i64 - old_info.nr_active_rows as i64;
                self.knots.insert(p.z, updated);
            }
        } else {
            set_bit_to_zero(&mut self.state_at_b, p.x, p.y, p.z);
            self.weight_at_b -= 2;
            let mut at_d = p;
            self.propagation.direct_rho_pi(&mut at_d);
            set_bit_to_zero(&mut self.partial_state_at_d, at_d.x, at_d.y, at_d.z);
            self.partial_hamming_weight_at_d -= 1;
            if get_row(&self.partial_state_at_d, at_d.y, at_d.z) == 0 {
                self.partial_nr_active_rows_at_d -= 1;
            }
        }
    }

    fn convert_knot_point_to_orbital_point(&mut self) {
        // The point is assumed to be alone in its knot.
        let p = *self
            .chains
            .last()
            .expect("working chain exists")
            .last()
            .expect("chain has a point");
        self.knot_point_added_knot.pop();
        self.knots.remove(&p.z);
        self.knot_point_deficit -= 2;
        self.knot_weight_at_b_deficit -= 3;

        let mut at_d = p;
        self.propagation.direct_rho_pi(&mut at_d);
        if get_row(&self.partial_state_at_d, at_d.y, at_d.z) == 0 {
            self.partial_nr_active_rows_at_d += 1;
        }
        set_bit_to_one(&mut self.partial_state_at_d, at_d.x, at_d.y, at_d.z);
    }

    fn working_chain_len(&self) -> usize {
        self.chains.last().map_or(0, Vec::len)
    }

    fn working_y_offset(&self) -> usize {
        *self
            .y_offsets
            .last()
            .and_then(|offsets| offsets.last())
            .expect("working chain has a point")
    }

    fn bump_working_y_offset(&mut self) {
        *self
            .y_offsets
            .last_mut()
            .expect("working chain exists")
            .last_mut()
            .expect("chain has a point") += 1;
    }

    fn complete_chain(&mut self) -> bool {
        let mut can_be_extended = self.can_afford_extending_chain();
        loop {
            if !can_be_extended {
                if self.working_chain_len() == 1 {
                    return false;
                }
                self.remove_point(false);
            }
            while self.working_chain_len() > 1 && self.working_y_offset() == 4 {
                self.remove_point(false);
            }
            if self.working_y_offset() == 4 {
                return false;
            }

            if self.working_chain_len() % 2 == 0 {
                // Add the second point of an orbital slice.
                let mut success;
                let mut p;
                loop {
                    self.bump_working_y_offset();
                    p = *self
                        .chains
                        .last()
                        .expect("working chain exists")
                        .last()
                        .expect("chain has a point");
                    p.y_translate(self.working_y_offset() as i32);
                    success = get_bit(&self.taboo_at_b, p.x, p.y, p.z) == 0;
                    if success || self.working_y_offset() >= 4 {
                        break;
                    }
                }
                if success {
                    self.add_point(p, false, false);
                    can_be_extended = self.can_afford_extending_chain();
                }
            } else {
                // Add the first point of a new orbital slice, or the end
                // point of the chain inside a knot.
                let mut success;
                let mut is_potential_end_point;
                let mut p;
                loop {
                    self.bump_working_y_offset();
                    p = *self
                        .chains
                        .last()
                        .expect("working chain exists")
                        .last()
                        .expect("chain has a point");
                    self.propagation.reverse_rho_pi(&mut p);
                    p.y_translate(self.working_y_offset() as i32);
                    self.propagation.direct_rho_pi(&mut p);
                    is_potential_end_point = self.working_chain_len() + 1
                        >= self.minimum_working_chain_length
                        && self.chains.last().expect("working chain exists")[0] < p;
                    success = get_bit(&self.taboo_at_b, p.x, p.y, p.z) == 0;
                    if success {
                        if self.knots.contains_key(&p.z) {
                            success = get_bit(&self.state_at_b, p.x, p.y, p.z) == 0
                                && is_potential_end_point;
                        } else {
                            success = self.state_at_b[p.z] == 0;
                            is_potential_end_point =
                                is_potential_end_point && success && self.may_be_end_point();
                        }
                    }
                    if success || self.working_y_offset() >= 4 {
                        break;
                    }
                }
                if success {
                    self.add_point(p, is_potential_end_point, false);
                    if is_potential_end_point {
                        return true;
                    }
                    can_be_extended = self.can_afford_extending_chain();
                }
            }
        }
    }

    fn update_minimum_working_chain_length(&mut self) {
        if self.chains.len() <= 1 {
            self.minimum_working_chain_length = 2;
        } else {
            let previous = &self.chains[self.chains.len() - 2];
            self.minimum_working_chain_length = previous.len();
            let working = self.chains.last().expect("working chain exists");
            if !working.is_empty() && working[0] < previous[0] {
                self.minimum_working_chain_length += 2;
            }
        }
    }

    fn next_chain(&mut self) -> bool {
        if self.working_chain_len() > 1 {
            if *self.knot_point_added_knot.last().expect("bookkeeping") {
                self.convert_knot_point_to_orbital_point();
            } else {
                self.remove_point(true);
            }
        }
        loop {
            if self.working_chain_len() > 0 && self.complete_chain() {
                return true;
            }
            let mut p = BitPosition::default();
            let mut p_initialized = self.working_chain_len() > 0;
            if p_initialized {
                p = self.chains.last().expect("working chain exists")[0];
                self.remove_point(true);
            }
            loop {
                if !p_initialized || !p.next_xy() {
                    if p_initialized && self.knots.is_empty() {
                        return false;
                    }
                    p.x = 0;
                    p.y = 0;
                    if self.start_point_working_chain_is_free {
                        if !p_initialized {
                            p.z = 0;
                            p_initialized = true;
                        } else {
                            p.z += 1;
                        }
                        if p.z == self.lane_size {
                            return false;
                        }
                    } else {
                        match self.next_knot_slice(p_initialized.then_some(p.z)) {
                            Some(z) => {
                                p.z = z;
                                p_initialized = true;
                            }
                            None => return false,
                        }
                    }
                }
                let collides = get_bit(&self.state_at_b, p.x, p.y, p.z) != 0
                    || get_bit(&self.taboo_at_b, p.x, p.y, p.z) != 0
                    || (self.state_at_b[p.z] != 0 && !self.knots.contains_key(&p.z));
                if !collides {
                    break;
                }
            }
            self.add_point(p, true, false);
            self.update_minimum_working_chain_length();
        }
    }

    fn next_with_knots(&mut self) -> bool {
        if self.background_core_pending {
            self.background_core_pending = false;
            if !self.knots.is_empty() && self.chains.is_empty() && self.is_state_at_b_well_formed()
            {
                return true;
            }
        }
        loop {
            if self.knots.is_empty() || self.can_afford_adding_chain() {
                self.chains.push(Vec::new());
                self.y_offsets.push(Vec::new());
                self.start_point_working_chain_is_free = self.can_afford_generic(
                    2,
                    1,
                    (self.minimum_working_chain_length - 2) as u32,
                    (self.minimum_working_chain_length - 2) as u32,
                );
            }
            while !self.chains.is_empty() && !self.next_chain() {
                self.chains.pop();
                self.y_offsets.pop();
                self.update_minimum_working_chain_length();
            }
            if self.chains.is_empty() {
                return false;
            }
            if self.is_state_at_b_well_formed() {
                return true;
            }
        }
    }

    fn vortex_bucket_len(&self, vortex_length: usize) -> usize {
        self.vortex_base
            .get(vortex_length / 2)
            .map_or(0, Vec::len)
    }

    fn compute_lower_weight_assuming_vortex_is_added(&self) -> u32 {
        let top = self.out_core.last().expect("core stack not empty");
        let vortex = &self.vortex_base[top.vortex_length / 2][top.vortex_index];
        let rows_at_a = top.nr_active_rows_at_a.max(vortex.nr_active_rows_at_a);
        let mut lower = self.propagation.lower_bound_on_reverse_weight(
            top.hamming_weight_at_a + top.vortex_length as u32,
            rows_at_a,
        );
        lower += top.weight_at_b + 2 * top.vortex_length as u32;
        let rows_at_d = top.nr_active_rows_at_d.max(vortex.nr_active_rows_at_d);
        lower += self
            .propagation
            .lower_bound_on_weight(top.hamming_weight_at_d + top.vortex_length as u32, rows_at_d);
        lower
    }

    /// The current core.
    pub fn top_core(&self) -> &CoreInfo {
        self.out_core.last().expect("core stack not empty")
    }

    /// Moves to the next trail core state within the weight budget. Returns
    /// false when the enumeration is exhausted.
    pub fn next(&mut self) -> bool {
        loop {
            if self.out_core.is_empty() {
                if !self.next_with_knots() {
                    return false;
                }
                let mut info = CoreInfo {
                    hamming_weight_at_a: self.hamming_weight_at_a,
                    nr_active_rows_at_a: self.nr_active_rows_at_a,
                    state_at_b: self.state_at_b.clone(),
                    weight_at_b: self.weight_at_b,
                    partial_state_at_c: self.state_at_b.clone(),
                    hamming_weight_at_d: 0,
                    nr_active_rows_at_d: 0,
                    partial_weight: 0,
                    vortex_length: 0,
                    vortex_index: 0,
                    vortex_z_offset: 0,
                };
                for &z in self.knots.keys() {
                    info.partial_state_at_c[z] = self
                        .propagation
                        .minimum_in_kernel_slice_after_chi(info.partial_state_at_c[z]);
                }
                let state_at_d = self
                    .propagation
                    .direct_lambda_after_theta(&info.partial_state_at_c);
                info.hamming_weight_at_d = hamming_weight_of_state(&state_at_d);
                info.nr_active_rows_at_d = get_nr_active_rows_of_state(&state_at_d);
                info.partial_weight = self.propagation.min_reverse_weight(&self.state_at_a)
                    + info.weight_at_b
                    + self.propagation.weight(&state_at_d);
                let within = info.partial_weight <= self.max_weight;
                self.out_core.push(info);
                if within {
                    return true;
                }
                self.out_core.pop();
            } else {
                let mut found_vortex_to_add = true;
                let top_index = self.out_core.len() - 1;
                let (vortex_length, vortex_index, vortex_z_offset) = {
                    let top = &self.out_core[top_index];
                    (top.vortex_length, top.vortex_index, top.vortex_z_offset)
                };
                let bucket_len = self.vortex_bucket_len(vortex_length);
                if (!self.knots.is_empty() || self.out_core.len() > 1)
                    && vortex_index < bucket_len
                    && vortex_z_offset < self.lane_size - 1
                {
                    self.out_core[top_index].vortex_z_offset += 1;
                    let top = &self.out_core[top_index];
                    if self.out_core.len() > 1
                        && self.out_core[0].vortex_length == top.vortex_length
                        && self.out_core[0].vortex_index == top.vortex_index
                    {
                        // Quotient equal-vortex stacks by z translation.
                        let mut z_pattern = vec![0u32; self.lane_size];
                        for info in &self.out_core {
                            z_pattern[info.vortex_z_offset] = 1;
                        }
                        found_vortex_to_add = is_minimal_symmetrically(&z_pattern);
                    }
                } else if vortex_index + 1 < bucket_len {
                    self.out_core[top_index].vortex_z_offset = 0;
                    self.out_core[top_index].vortex_index += 1;
                } else {
                    self.out_core[top_index].vortex_z_offset = 0;
                    self.out_core[top_index].vortex_index = 0;
                    self.out_core[top_index].vortex_length += 2;
                    let new_length = self.out_core[top_index].vortex_length;
                    if new_length / 2 >= self.vortex_base.len() {
                        self.out_core.pop();
                        found_vortex_to_add = false;
                    } else if self.vortex_base[new_length / 2].is_empty() {
                        found_vortex_to_add = false;
                    } else if self.out_core[top_index].partial_weight + 2 * new_length as u32
                        > self.max_weight
                    {
                        self.out_core.pop();
                        found_vortex_to_add = false;
                    }
                }

                if found_vortex_to_add
                    && self.compute_lower_weight_assuming_vortex_is_added() <= self.max_weight
                {
                    let top = self.out_core.last().expect("core stack not empty");
                    let vortex = &self.vortex_base[top.vortex_length / 2][top.vortex_index];
                    let mut overlaps = false;
                    for (&z, &slice) in &vortex.state_at_b {
                        let local_z = (z + top.vortex_z_offset) % self.lane_size;
                        if top.state_at_b[local_z] != 0 || self.taboo_at_b[local_z] & slice != 0 {
                            overlaps = true;
                            break;
                        }
                    }
                    if !overlaps {
                        let mut new_top = top.clone();
                        let vortex_state = vortex.state_at_b.clone();
                        for (&z, &slice) in &vortex_state {
                            let local_z = (z + new_top.vortex_z_offset) % self.lane_size;
                            new_top.state_at_b[local_z] = slice;
                            new_top.partial_state_at_c[local_z] = slice;
                        }
                        new_top.weight_at_b += 2 * new_top.vortex_length as u32;

                        let state_at_a = self.propagation.reverse_lambda(&new_top.state_at_b);
                        new_top.hamming_weight_at_a = hamming_weight_of_state(&state_at_a);
                        new_top.nr_active_rows_at_a = get_nr_active_rows_of_state(&state_at_a);

                        let state_at_d = self
                            .propagation
                            .direct_lambda_after_theta(&new_top.partial_state_at_c);
                        new_top.hamming_weight_at_d = hamming_weight_of_state(&state_at_d);
                        new_top.nr_active_rows_at_d = get_nr_active_rows_of_state(&state_at_d);
                        new_top.partial_weight = self.propagation.min_reverse_weight(&state_at_a)
                            + new_top.weight_at_b
                            + self.propagation.weight(&state_at_d);
                        let within = new_top.partial_weight <= self.max_weight;
                        self.out_core.push(new_top);
                        if within {
                            return true;
                        }
                        self.out_core.pop();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dclc::KeccakFDcLc;
    use crate::parts::get_slice_value;
    use crate::propagation::DcOrLc;

    fn fixture(width: usize) -> KeccakFDcLc {
        KeccakFDcLc::with_cache_dir(width, &std::env::temp_dir()).unwrap()
    }

    #[test]
    fn knot_info_packing_round_trip() {
        for kpd in 0..4 {
            for kwd in 0..4 {
                for rows in 0..6 {
                    for orb in [false, true] {
                        let byte = pack_knot_info(kpd, kwd, rows, orb);
                        let info = unpack_knot_info(byte, false, false);
                        assert_eq!(info.knot_point_deficit, kpd);
                        assert_eq!(info.knot_weight_at_b_deficit, kwd);
                        assert_eq!(info.nr_active_rows, rows);
                        assert_eq!(info.is_orbital, orb);
                    }
                }
            }
        }
        // Background overrides.
        let byte = pack_knot_info(2, 3, 1, false);
        let info = unpack_knot_info(byte, true, true);
        assert_eq!(
            info,
            KnotInformation {
                is_orbital: false,
                nr_active_rows: 1,
                knot_point_deficit: 1,
                knot_weight_at_b_deficit: 2
            }
        );
    }

    #[test]
    fn knot_classification_of_characteristic_slices() {
        let parent = fixture(50);
        let dc = Propagation::new(&parent, DcOrLc::Dc);
        let tame = |s: SliceValue| slice_is_tame(&dc, s);

        // The empty slice is trivially tame.
        let info = unpack_knot_info(knot_info_byte(&dc, 0, &tame), false, false);
        assert_eq!(info.knot_point_deficit, 0);
        assert_eq!(info.nr_active_rows, 0);

        // A single bit cannot reach parity zero through chi.
        let single = get_slice_point(2, 1);
        assert!(!tame(single));
        let info = unpack_knot_info(knot_info_byte(&dc, single, &tame), false, false);
        assert_eq!(info.knot_point_deficit, 2);
        assert_eq!(info.knot_weight_at_b_deficit, 3);
        assert_eq!(info.nr_active_rows, 1);
        assert!(!info.is_orbital);

        // Two bits in one column: an orbital.
        let orbital = get_slice_point(2, 1) ^ get_slice_point(2, 4);
        let info = unpack_knot_info(knot_info_byte(&dc, orbital, &tame), false, false);
        assert!(info.is_orbital);
        assert_eq!(info.knot_point_deficit, 1);
        assert_eq!(info.knot_weight_at_b_deficit, 1);
        assert_eq!(info.nr_active_rows, 2);

        // Two equal rows can cancel each other's output parity: tame.
        let twin_rows = get_slice_value(0x03, 0x03, 0, 0, 0);
        assert!(tame(twin_rows));
        let info = unpack_knot_info(knot_info_byte(&dc, twin_rows, &tame), false, false);
        assert_eq!(info.knot_point_deficit, 0);
        assert_eq!(info.knot_weight_at_b_deficit, 0);

        // A full row alone cannot, but a single stray bit repairs it.
        let full_row = get_slice_value(0x1F, 0, 0, 0, 0);
        assert!(!tame(full_row));
        let info = unpack_knot_info(knot_info_byte(&dc, full_row, &tame), false, false);
        assert_eq!(info.knot_point_deficit, 1);
        assert!(!info.is_orbital);
        assert!(info.knot_weight_at_b_deficit <= 3);
        assert_eq!(info.nr_active_rows, 1);
    }

    #[test]
    fn vortex_base_contains_closed_chains() {
        let parent = fixture(200);
        let dc = Propagation::new(&parent, DcOrLc::Dc);
        let base = build_vortex_base(&dc, 24);
        let total: usize = base.iter().map(Vec::len).sum();
        assert!(total > 0, "some vortex fits in weight 24");
        // There is no vortex of length 2: its two points would need to
        // share a column at A, which pi forbids for equal x.
        if base.len() > 1 {
            assert!(base[1].is_empty());
        }
        for (half_length, vortices) in base.iter().enumerate() {
            for vortex in vortices {
                let mut state = vec![0; dc.lane_size()];
                for (&z, &slice) in &vortex.state_at_b {
                    state[z] = slice;
                }
                assert_eq!(hamming_weight_of_state(&state), 2 * half_length as u32);
                // Every active column at B holds exactly two bits.
                for &z in vortex.state_at_b.keys() {
                    for x in 0..5 {
                        let column = crate::parts::get_column(&state, x, z);
                        assert!(column == 0 || column.count_ones() == 2);
                    }
                }
                assert!(is_minimal_symmetrically(&state));
                assert!(vortex.nr_active_rows_at_a <= 2 * half_length as u32);
                assert!(vortex.nr_active_rows_at_d <= 2 * half_length as u32);
            }
        }
    }

    // Building the full knot-info table walks all 2^25 slice values, so
    // this end-to-end enumeration only runs on request:
    //     cargo test --release -- --ignored three_round
    #[test]
    #[ignore]
    fn three_round_cores_stay_within_budget() {
        let parent = fixture(25);
        let dc = Propagation::new(&parent, DcOrLc::Dc);
        let dir = std::env::temp_dir().join("keccak-trails-knot-info-test");
        std::fs::create_dir_all(&dir).unwrap();
        let background = vec![0; dc.lane_size()];
        let taboo = vec![0; dc.lane_size()];
        let max_weight = 14;
        let mut cores =
            InKernelTrailCores::new(&dc, &background, &taboo, max_weight, &dir).unwrap();
        let mut count = 0u64;
        while cores.next() && count < 10_000 {
            let core = cores.top_core();
            assert!(core.partial_weight <= max_weight);
            assert_eq!(core.weight_at_b, dc.weight(&core.state_at_b));
            assert!(hamming_weight_of_state(&core.state_at_b) > 0);
            count += 1;
        }
        assert!(count > 0);
    }
}
