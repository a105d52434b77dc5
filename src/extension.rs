//! Forward and backward trail extension, with the known lower bounds per
//! round count and the optional cache of known small-weight states.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::Path;

use log::{debug, trace};

use crate::parts::{get_nr_active_rows_of_state, symmetric_minimum, SliceValue};
use crate::propagation::{DcOrLc, Propagation};
use crate::trails::{Trail, TrailFileIterator, TrailSink};
use crate::CoreError;

/// Minimum weights below which trails need not be searched, per number of
/// rounds. Reads interpolate the explicitly set bounds:
/// bound(r) = max over r = r₁ + r₂ of bound(r₁) + bound(r₂).
#[derive(Clone, Debug, Default)]
pub struct LowWeightExclusion {
    excluded: BTreeMap<usize, u32>,
    interpolated: Vec<u32>,
}

impl LowWeightExclusion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares that no trail over `nr_rounds` rounds has weight below
    /// `weight`.
    pub fn exclude_below_weight(&mut self, nr_rounds: usize, weight: u32) {
        self.excluded.insert(nr_rounds, weight);
        self.interpolated.clear();
    }

    /// The minimum weight to consider for the given number of rounds.
    pub fn min_weight(&mut self, nr_rounds: usize) -> u32 {
        if nr_rounds == 0 {
            return 0;
        }
        if nr_rounds > self.interpolated.len() {
            self.compute(nr_rounds);
        }
        self.interpolated[nr_rounds - 1]
    }

    fn compute(&mut self, up_to: usize) {
        self.interpolated.clear();
        for nr_rounds in 1..=up_to {
            let bound = match self.excluded.get(&nr_rounds) {
                Some(&weight) => weight,
                None => (1..nr_rounds)
                    .map(|n1| self.interpolated[n1 - 1] + self.interpolated[nr_rounds - n1 - 1])
                    .max()
                    .unwrap_or(0),
            };
            self.interpolated.push(bound);
        }
    }
}

impl fmt::Display for LowWeightExclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (nr_rounds, &bound) in self.interpolated.iter().enumerate() {
            let marker = if self.excluded.contains_key(&(nr_rounds + 1)) {
                ""
            } else {
                "+"
            };
            writeln!(f, "{:2} rounds: {:3} {}", nr_rounds + 1, bound, marker)?;
        }
        Ok(())
    }
}

/// All known states C after χ such that λ(C) has low weight, grouped by that
/// weight and stored up to z-translation. Forward extension can walk this
/// set instead of a large affine base when the budget is covered.
pub struct KnownSmallWeightStates {
    states_after_chi_per_weight: Vec<Vec<Vec<SliceValue>>>,
    max_complete_weight: u32,
}

impl KnownSmallWeightStates {
    /// An empty set, intended to be complete up to the given weight.
    pub fn new(max_complete_weight: u32) -> Self {
        KnownSmallWeightStates {
            states_after_chi_per_weight: vec![Vec::new(); max_complete_weight as usize + 1],
            max_complete_weight,
        }
    }

    /// Loads the states of all sufficiently light trail states in a file.
    pub fn from_file(
        propagation: &Propagation,
        path: &Path,
        max_complete_weight: u32,
    ) -> Result<Self, CoreError> {
        let mut states = Self::new(max_complete_weight);
        states.load_from_file(propagation, path)?;
        Ok(states)
    }

    /// The weight up to which the set is meant to be complete.
    pub fn max_complete_weight(&self) -> u32 {
        self.max_complete_weight
    }

    /// Fetches every state of weight at most the completeness bound from
    /// the trails of a file. The states are read before χ (after λ).
    pub fn load_from_file(
        &mut self,
        propagation: &Propagation,
        path: &Path,
    ) -> Result<(), CoreError> {
        let mut trails = TrailFileIterator::open(path)?;
        while let Some(trail) = trails.next_trail()? {
            let first = usize::from(!trail.first_state_specified);
            for i in first..trail.weights.len() {
                if trail.weights[i] <= self.max_complete_weight {
                    self.add_state(propagation, &trail.states[i]);
                }
            }
        }
        Ok(())
    }

    /// Adds one state given before χ; it is stored after χ, keyed by its
    /// weight.
    pub fn add_state(&mut self, propagation: &Propagation, state: &[SliceValue]) {
        let weight = propagation.weight(state);
        if weight > self.max_complete_weight {
            return;
        }
        let after_chi = propagation.reverse_lambda(state);
        self.states_after_chi_per_weight[weight as usize].push(after_chi);
    }

    /// Collects the states before the next χ that are compatible with
    /// `input_state` through χ and λ, up to `max_weight_out`, trying all
    /// z-translates of the stored candidates.
    pub fn connect(
        &self,
        propagation: &Propagation,
        input_state: &[SliceValue],
        max_weight_out: u32,
        compatible_states: &mut Vec<Vec<SliceValue>>,
    ) {
        let input_rows = get_nr_active_rows_of_state(input_state);
        let lane_size = propagation.lane_size();
        for weight in 2..=max_weight_out.min(self.max_complete_weight) {
            for candidate in &self.states_after_chi_per_weight[weight as usize] {
                if get_nr_active_rows_of_state(candidate) != input_rows {
                    continue;
                }
                for dz in 0..lane_size {
                    let translated: Vec<SliceValue> = (0..lane_size)
                        .map(|z| candidate[(z + dz) % lane_size])
                        .collect();
                    if propagation.is_chi_compatible_states(input_state, &translated) {
                        compatible_states.push(propagation.direct_lambda(&translated));
                    }
                }
            }
        }
    }

    /// Writes the set as 1-round trail prefixes, z-minimised, states before
    /// χ.
    pub fn save_to_file(
        &self,
        propagation: &Propagation,
        out: &mut impl Write,
    ) -> Result<(), CoreError> {
        for (weight, states) in self.states_after_chi_per_weight.iter().enumerate() {
            for state_after_chi in states {
                let before_chi = propagation.direct_lambda(state_after_chi);
                let minimal = symmetric_minimum(&before_chi);
                let mut trail = Trail::new();
                trail.append(minimal, weight as u32);
                trail.save(out)?;
            }
        }
        Ok(())
    }
}

/// The trail extension engine: grows trail prefixes and cores forward and
/// backward round by round, pruning on the known lower bounds.
pub struct TrailExtension<'a> {
    pub propagation: &'a Propagation<'a>,
    /// When true, the lightest trail found so far for each round count is
    /// reported even above the requested maximum weight.
    pub show_minimal_trails: bool,
    /// When true, backward extension of trail cores produces all prefixes
    /// instead of trail cores.
    pub all_prefixes: bool,
    /// The known lower bounds per round count.
    pub known_bounds: LowWeightExclusion,
    /// Optional cache of known small-weight states for forward extension.
    pub known_small_weight_states: Option<KnownSmallWeightStates>,
    min_weight_so_far: Vec<Option<i64>>,
}

const MIN_WEIGHT_FOR_SMALL_WEIGHT_STATES: u32 = 16;

impl<'a> TrailExtension<'a> {
    /// Creates an extension engine seeded with the published bounds for the
    /// width and propagation type at hand.
    pub fn new(propagation: &'a Propagation<'a>) -> Self {
        let mut known_bounds = LowWeightExclusion::new();
        known_bounds.exclude_below_weight(1, 2);
        known_bounds.exclude_below_weight(2, 8);
        match (propagation.parent.keccak_f.width(), propagation.kind()) {
            (100, DcOrLc::Dc) => {
                known_bounds.exclude_below_weight(3, 19);
                known_bounds.exclude_below_weight(4, 30);
            }
            (100, DcOrLc::Lc) => {
                known_bounds.exclude_below_weight(3, 20);
                known_bounds.exclude_below_weight(4, 38);
            }
            (200, _) => {
                known_bounds.exclude_below_weight(3, 20);
                known_bounds.exclude_below_weight(4, 46);
            }
            (1600, DcOrLc::Dc) => {
                known_bounds.exclude_below_weight(3, 32);
            }
            _ => {}
        }
        TrailExtension {
            propagation,
            show_minimal_trails: false,
            all_prefixes: false,
            known_bounds,
            known_small_weight_states: None,
            min_weight_so_far: Vec::new(),
        }
    }

    fn is_less_than_min_weight_so_far(&mut self, nr_rounds: usize, weight: i64) -> bool {
        if nr_rounds >= self.min_weight_so_far.len() {
            self.min_weight_so_far.resize(nr_rounds + 1, None);
        }
        match self.min_weight_so_far[nr_rounds] {
            Some(best) if weight >= best => false,
            _ => {
                self.min_weight_so_far[nr_rounds] = Some(weight);
                true
            }
        }
    }

    /// Extends every trail of a file forward; see
    /// [Self::forward_extend_trail].
    pub fn forward_extend_trails(
        &mut self,
        trails: &mut TrailFileIterator,
        sink: &mut impl TrailSink,
        nr_rounds: usize,
        max_total_weight: u32,
    ) -> Result<(), CoreError> {
        while let Some(trail) = trails.next_trail()? {
            self.forward_extend_trail(&trail, sink, nr_rounds, max_total_weight);
        }
        Ok(())
    }

    /// Appends states to the given trail prefix or core, emitting every
    /// extension reaching `nr_rounds` rounds with total weight at most
    /// `max_total_weight`. The input must not carry a state after the last
    /// χ.
    pub fn forward_extend_trail(
        &mut self,
        trail: &Trail,
        sink: &mut impl TrailSink,
        nr_rounds: usize,
        max_total_weight: u32,
    ) {
        debug_assert!(trail.state_after_last_chi.is_none());
        self.recurse_forward(trail, sink, nr_rounds, max_total_weight);
    }

    fn recurse_forward(
        &mut self,
        trail: &Trail,
        sink: &mut impl TrailSink,
        nr_rounds: usize,
        max_total_weight: u32,
    ) {
        let base_weight = trail.total_weight as i64;
        let base_nr_rounds = trail.number_of_rounds();
        if base_nr_rounds >= nr_rounds {
            return;
        }
        let cur_nr_rounds = base_nr_rounds + 1;
        let max_weight_out = max_total_weight as i64
            - base_weight
            - self.known_bounds.min_weight(nr_rounds - base_nr_rounds - 1) as i64;
        if max_weight_out < self.known_bounds.min_weight(1) as i64 {
            return;
        }
        let last_weight = trail.weights.last().copied().unwrap_or(0);
        trace!(
            "forward: weight {last_weight} towards round {cur_nr_rounds}, limiting to {max_weight_out}"
        );

        let use_cache = self.known_small_weight_states.as_ref().is_some_and(|cache| {
            last_weight >= MIN_WEIGHT_FOR_SMALL_WEIGHT_STATES
                && max_weight_out <= cache.max_complete_weight() as i64
        });
        if use_cache {
            let mut compatible = Vec::new();
            if let (Some(cache), Some(last)) =
                (&self.known_small_weight_states, trail.states.last())
            {
                cache.connect(self.propagation, last, max_weight_out as u32, &mut compatible);
            }
            for next_state in compatible {
                self.consider_forward_candidate(
                    trail,
                    next_state,
                    sink,
                    nr_rounds,
                    max_total_weight,
                    max_weight_out,
                );
            }
        } else {
            let Some(last) = trail.states.last() else {
                return;
            };
            let base = self.propagation.build_state_base(last, false);
            let mut iterator = base.iterator();
            while !iterator.is_end() {
                let next_state = iterator.current().to_vec();
                self.consider_forward_candidate(
                    trail,
                    next_state,
                    sink,
                    nr_rounds,
                    max_total_weight,
                    max_weight_out,
                );
                iterator.advance();
            }
        }
    }

    fn consider_forward_candidate(
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
            let min_trail = self.show_minimal_trails
                && self.is_less_than_min_weight_so_far(cur_nr_rounds, cur_weight);
            if min_trail {
                debug!("{cur_nr_rounds}-round trail of weight {cur_weight} found");
            }
            if cur_weight <= max_total_weight as i64 || min_trail {
                let mut new_trail = trail.clone();
                new_trail.append(next_state, weight_out as u32);
                sink.fetch_trail(&new_trail);
            }
        } else if weight_out <= max_weight_out {
            let mut new_trail = trail.clone();
            new_trail.append(next_state, weight_out as u32);
            self.recurse_forward(&new_trail, sink, nr_rounds, max_total_weight);
        }
    }

    /// Extends every trail of a file backward; see
    /// [Self::backward_extend_trail].
    pub fn backward_extend_trails(
        &mut self,
        trails: &mut TrailFileIterator,
        sink: &mut impl TrailSink,
        nr_rounds: usize,
        max_total_weight: u32,
    ) -> Result<(), CoreError> {
        while let Some(trail) = trails.next_trail()? {
            self.backward_extend_trail(&trail, sink, nr_rounds, max_total_weight);
        }
        Ok(())
    }

    /// Prepends states to the given trail prefix or core, emitting every
    /// extension reaching `nr_rounds` rounds with total weight at most
    /// `max_total_weight`. A trail core input yields trail cores, unless
    /// `all_prefixes` is set.
    pub fn backward_extend_trail(
        &mut self,
        trail: &Trail,
        sink: &mut impl TrailSink,
        nr_rounds: usize,
        max_total_weight: u32,
    ) {
        if trail.first_state_specified {
            self.recurse_backward(trail, sink, nr_rounds, max_total_weight, true);
        } else {
            let mut trimmed = Trail::new();
            for i in 1..trail.states.len() {
                trimmed.append(trail.states[i].clone(), trail.weights[i]);
            }
            let all_prefixes = self.all_prefixes;
            self.recurse_backward(&trimmed, sink, nr_rounds, max_total_weight, all_prefixes);
        }
    }

    fn recurse_backward(
        &mut self,
        trail: &Trail,
        sink: &mut impl TrailSink,
        nr_rounds: usize,
        max_total_weight: u32,
        all_prefixes: bool,
    ) {
        let Some(first) = trail.states.first() else {
            return;
        };
        if !all_prefixes && nr_rounds == trail.number_of_rounds() + 1 {
            let state_after_chi = self.propagation.reverse_lambda(first);
            let min_reverse_weight = self.propagation.min_reverse_weight(&state_after_chi);
            let cur_weight = trail.total_weight as i64 + min_reverse_weight as i64;
            let min_trail = self.show_minimal_trails
                && self.is_less_than_min_weight_so_far(nr_rounds, cur_weight);
            if min_trail {
                debug!("{nr_rounds}-round trail of weight {cur_weight} found");
            }
            if cur_weight <= max_total_weight as i64 || min_trail {
                let mut new_trail = Trail::new();
                new_trail.set_first_state_reverse_minimum_weight(
                    min_reverse_weight,
                    self.propagation.lane_size(),
                );
                new_trail.append_trail(trail);
                sink.fetch_trail(&new_trail);
            }
            return;
        }
        let base_weight = trail.total_weight as i64;
        let base_nr_rounds = trail.number_of_rounds();
        if base_nr_rounds >= nr_rounds {
            return;
        }
        let max_weight_out = max_total_weight as i64
            - base_weight
            - self.known_bounds.min_weight(nr_rounds - base_nr_rounds - 1) as i64;
        if max_weight_out < self.known_bounds.min_weight(1) as i64 {
            return;
        }
        let state_after_chi = self.propagation.reverse_lambda(first);
        let cur_nr_rounds = base_nr_rounds + 1;
        trace!(
            "backward: {} active rows towards round -{cur_nr_rounds}, limiting to {max_weight_out}",
            get_nr_active_rows_of_state(&state_after_chi)
        );
        let mut iterator = self
            .propagation
            .reverse_state_iterator(&state_after_chi, max_weight_out as u32);
        if iterator.is_empty() {
            return;
        }
        while !iterator.is_end() {
            let candidate = iterator.current().to_vec();
            let weight_out = iterator.current_weight() as i64;
            let cur_weight = base_weight + weight_out;
            if cur_nr_rounds == nr_rounds {
                let min_trail = self.show_minimal_trails
                    && self.is_less_than_min_weight_so_far(nr_rounds, cur_weight);
                if min_trail {
                    debug!("{nr_rounds}-round trail of weight {cur_weight} found");
                }
                if cur_weight <= max_total_weight as i64 || min_trail {
                    let mut new_trail = trail.clone();
                    new_trail.prepend(candidate, weight_out as u32);
                    sink.fetch_trail(&new_trail);
                }
            } else {
                let min_prev_weight =
                    self.propagation.min_reverse_weight_after_lambda(&candidate) as i64;
                let remaining =
                    self.known_bounds.min_weight(nr_rounds - cur_nr_rounds - 1) as i64;
                if cur_weight + min_prev_weight + remaining <= max_total_weight as i64 {
                    let mut new_trail = trail.clone();
                    new_trail.prepend(candidate, weight_out as u32);
                    self.recurse_backward(&new_trail, sink, nr_rounds, max_total_weight, all_prefixes);
                }
            }
            iterator.advance();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dclc::KeccakFDcLc;
    use crate::parts::get_slice_from_row;

    fn fixture() -> KeccakFDcLc {
        KeccakFDcLc::with_cache_dir(200, &std::env::temp_dir()).unwrap()
    }

    #[test]
    fn low_weight_exclusion_interpolates() {
        let mut bounds = LowWeightExclusion::new();
        bounds.exclude_below_weight(1, 2);
        bounds.exclude_below_weight(2, 8);
        assert_eq!(bounds.min_weight(0), 0);
        assert_eq!(bounds.min_weight(1), 2);
        assert_eq!(bounds.min_weight(2), 8);
        assert_eq!(bounds.min_weight(3), 10);
        assert_eq!(bounds.min_weight(4), 16);
        bounds.exclude_below_weight(3, 32);
        assert_eq!(bounds.min_weight(4), 34);
        assert_eq!(bounds.min_weight(6), 64);
    }

    #[test]
    fn forward_extension_covers_the_affine_base() {
        let parent = fixture();
        let dc = Propagation::new(&parent, DcOrLc::Dc);
        let mut extension = TrailExtension::new(&dc);
        let mut seed_state = vec![0; dc.lane_size()];
        seed_state[0] = get_slice_from_row(0x01, 0);
        let mut seed = Trail::new();
        seed.append(seed_state.clone(), dc.weight(&seed_state));

        let max_total = 60;
        let mut found: Vec<Trail> = Vec::new();
        extension.forward_extend_trail(&seed, &mut found, 2, max_total);

        // Independently enumerate the affine base.
        let base = dc.build_state_base(&seed_state, false);
        let mut expected = 0;
        let mut it = base.iterator();
        while !it.is_end() {
            if dc.weight(it.current()) + seed.total_weight <= max_total {
                expected += 1;
            }
            it.advance();
        }
        assert_eq!(found.len(), expected);
        for trail in &found {
            assert_eq!(trail.number_of_rounds(), 2);
            assert!(trail.total_weight <= max_total);
            trail.check(&dc).unwrap();
        }
    }

    #[test]
    fn forward_extension_prunes_by_bounds() {
        let parent = fixture();
        let dc = Propagation::new(&parent, DcOrLc::Dc);
        let mut extension = TrailExtension::new(&dc);
        let mut seed_state = vec![0; dc.lane_size()];
        seed_state[0] = get_slice_from_row(0x01, 0);
        let mut seed = Trail::new();
        seed.append(seed_state.clone(), dc.weight(&seed_state));
        // Total budget below the 2-round bound: nothing can come out.
        let mut found: Vec<Trail> = Vec::new();
        extension.forward_extend_trail(&seed, &mut found, 2, 3);
        assert!(found.is_empty());
    }

    #[test]
    fn backward_extension_yields_compatible_prefixes() {
        let parent = fixture();
        let dc = Propagation::new(&parent, DcOrLc::Dc);
        let mut extension = TrailExtension::new(&dc);
        // Start from a state that is lambda of a chi output, so that the
        // state after the previous chi stays sparse.
        let mut seed_state = vec![0; dc.lane_size()];
        seed_state[0] = get_slice_from_row(0x01, 0);
        let base = dc.build_state_base(&seed_state, false);
        let last_state = base.iterator().current().to_vec();
        let mut suffix = Trail::new();
        suffix.append(last_state.clone(), dc.weight(&last_state));

        let max_total = suffix.total_weight + 12;
        let mut found: Vec<Trail> = Vec::new();
        extension.backward_extend_trail(&suffix, &mut found, 2, max_total);
        assert!(!found.is_empty());
        for trail in &found {
            assert_eq!(trail.number_of_rounds(), 2);
            assert!(trail.first_state_specified);
            assert!(trail.total_weight <= max_total);
            trail.check(&dc).unwrap();
            assert_eq!(trail.states[1], last_state);
        }
    }

    #[test]
    fn backward_extension_of_a_core_emits_cores() {
        let parent = fixture();
        let dc = Propagation::new(&parent, DcOrLc::Dc);
        let mut extension = TrailExtension::new(&dc);
        let mut state = vec![0; dc.lane_size()];
        state[2] = get_slice_from_row(0x04, 3);
        let mut core = Trail::new();
        core.set_first_state_reverse_minimum_weight(
            dc.min_reverse_weight_after_lambda(&state),
            dc.lane_size(),
        );
        core.append(state.clone(), dc.weight(&state));

        let mut found: Vec<Trail> = Vec::new();
        extension.backward_extend_trail(&core, &mut found, 2, core.total_weight);
        assert_eq!(found.len(), 1);
        let trail = &found[0];
        assert!(!trail.first_state_specified);
        assert_eq!(trail.number_of_rounds(), 2);
        assert_eq!(trail.states[1], state);
        // The core weight accounts for the lightest previous round.
        let after_chi = dc.reverse_lambda(&trail.states[1]);
        assert_eq!(trail.weights[0], dc.min_reverse_weight(&after_chi));
        assert_eq!(trail, &core);
    }

    #[test]
    fn known_small_weight_states_connect() {
        let parent = fixture();
        let dc = Propagation::new(&parent, DcOrLc::Dc);
        let mut seed_state = vec![0; dc.lane_size()];
        seed_state[0] = get_slice_from_row(0x01, 0);
        let base = dc.build_state_base(&seed_state, false);
        let mut it = base.iterator();
        let next_state = it.current().to_vec();
        let weight = dc.weight(&next_state);

        let mut cache = KnownSmallWeightStates::new(weight + 2);
        cache.add_state(&dc, &next_state);
        let mut compatible = Vec::new();
        cache.connect(&dc, &seed_state, weight, &mut compatible);
        assert!(compatible.contains(&next_state));
        for state in &compatible {
            let after_chi = dc.reverse_lambda(state);
            assert!(dc.is_chi_compatible_states(&seed_state, &after_chi));
        }
    }

    #[test]
    fn known_small_weight_states_save_and_reload() {
        let parent = fixture();
        let dc = Propagation::new(&parent, DcOrLc::Dc);
        let mut state = vec![0; dc.lane_size()];
        state[1] = get_slice_from_row(0x02, 2);
        let mut cache = KnownSmallWeightStates::new(24);
        cache.add_state(&dc, &state);
        let dir = std::env::temp_dir().join("keccak-trails-small-weight-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("small.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        cache.save_to_file(&dc, &mut file).unwrap();
        drop(file);
        let reloaded = KnownSmallWeightStates::from_file(&dc, &path, 24).unwrap();
        let mut compatible = Vec::new();
        reloaded.connect(&dc, &state, 24, &mut compatible);
        // The z-translates of the stored state include the original.
        assert!(compatible.contains(&state));
    }
}
