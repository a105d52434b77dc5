//! Differential or linear trails: a sequence of states before χ with their
//! propagation weights, plus the single-line hex file format.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use log::warn;

use crate::parity::get_parity_of_slice;
use crate::parts::{from_slices_to_lanes, get_nr_active_rows_of_state, SliceValue};
use crate::propagation::{DcOrLc, Propagation};
use crate::CoreError;

/// A trail is the sequence of states before χ, round after round:
/// s₀ χλ s₁ χλ … χλ s_{n−1}, with one propagation weight per state.
///
/// When `first_state_specified` is false the trail is a *trail core*:
/// `states[0]` is a placeholder and `weights[0]` holds the minimum reverse
/// weight of λ⁻¹(states[1]).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Trail {
    /// False iff the trail is a trail core.
    pub first_state_specified: bool,
    /// The states before χ, round after round.
    pub states: Vec<Vec<SliceValue>>,
    /// The state after the last χ, when specified. Not serialised.
    pub state_after_last_chi: Option<Vec<SliceValue>>,
    /// `weights[i]` is the propagation weight of `states[i]`.
    pub weights: Vec<u32>,
    /// The sum of all weights.
    pub total_weight: u32,
}

impl Trail {
    pub fn new() -> Self {
        Trail {
            first_state_specified: true,
            ..Trail::default()
        }
    }

    /// The number of rounds the trail represents.
    pub fn number_of_rounds(&self) -> usize {
        self.states.len()
    }

    pub fn clear(&mut self) {
        *self = Trail::new();
    }

    /// Turns an empty trail into a trail core by installing a placeholder
    /// first state whose weight is the given minimum reverse weight.
    pub fn set_first_state_reverse_minimum_weight(&mut self, weight: u32, lane_size: usize) {
        debug_assert!(self.states.is_empty());
        self.states.push(vec![0; lane_size]);
        self.weights.push(weight);
        self.total_weight += weight;
        self.first_state_specified = false;
    }

    /// Appends a state with its weight.
    pub fn append(&mut self, state: Vec<SliceValue>, weight: u32) {
        self.states.push(state);
        self.weights.push(weight);
        self.total_weight += weight;
    }

    /// Appends all states of another trail.
    pub fn append_trail(&mut self, other: &Trail) {
        for (state, &weight) in other.states.iter().zip(&other.weights) {
            self.append(state.clone(), weight);
        }
    }

    /// Inserts a state with its weight at the front.
    pub fn prepend(&mut self, state: Vec<SliceValue>, weight: u32) {
        self.states.insert(0, state);
        self.weights.insert(0, weight);
        self.total_weight += weight;
    }

    /// Verifies the trail invariants against a propagation context: the
    /// per-state weights, the total weight, and the χ-compatibility of
    /// every transition. A total-weight mismatch is reported with `round`
    /// equal to the number of states.
    pub fn check(&self, propagation: &Propagation) -> Result<(), CoreError> {
        let offset = usize::from(!self.first_state_specified);
        let mut total = 0;
        if !self.first_state_specified && !self.weights.is_empty() {
            total += self.weights[0];
        }
        for i in offset..self.weights.len() {
            let expected = propagation.weight(&self.states[i]);
            if expected != self.weights[i] {
                return Err(CoreError::WeightInconsistency {
                    round: i,
                    expected,
                    found: self.weights[i],
                });
            }
            total += expected;
        }
        if total != self.total_weight {
            return Err(CoreError::WeightInconsistency {
                round: self.states.len(),
                expected: total,
                found: self.total_weight,
            });
        }
        for i in (1 + offset)..self.states.len() {
            let state_after_chi = propagation.reverse_lambda(&self.states[i]);
            if !propagation.is_chi_compatible_states(&self.states[i - 1], &state_after_chi) {
                return Err(CoreError::IncompatibleChiTransition { round: i - 1 });
            }
        }
        if let Some(after_last) = &self.state_after_last_chi {
            if let Some(last) = self.states.last() {
                if !propagation.is_chi_compatible_states(last, after_last) {
                    return Err(CoreError::IncompatibleChiTransition {
                        round: self.states.len() - 1,
                    });
                }
            }
        }
        Ok(())
    }

    /// A human-readable profile of the trail: per-round weights, active
    /// rows, θ-gaps and kernel markers.
    pub fn display(&self, propagation: &Propagation) -> String {
        let mut out = String::new();
        if self.states.is_empty() {
            out.push_str("This trail is empty.\n");
            return out;
        }
        let kind = match propagation.kind() {
            DcOrLc::Dc => "differential",
            DcOrLc::Lc => "linear",
        };
        let _ = writeln!(
            out,
            "{}-round {} trail of total weight {}",
            self.states.len(),
            kind,
            self.total_weight
        );
        let mut theta_gaps = Vec::new();
        let mut kernel_markers = String::new();
        let mut active_rows = Vec::new();
        let mut first_after_chi = None;
        for (i, state) in self.states.iter().enumerate() {
            let state_after_chi = propagation.reverse_lambda(state);
            let state_before_theta = propagation.direct_lambda_before_theta(&state_after_chi);
            let kernel = state_before_theta
                .iter()
                .all(|&slice| get_parity_of_slice(slice) == 0);
            kernel_markers.push(if kernel { 'k' } else { 'N' });
            theta_gaps.push(
                propagation
                    .parent
                    .keccak_f
                    .theta_gap(&from_slices_to_lanes(&state_before_theta)),
            );
            active_rows.push(get_nr_active_rows_of_state(state));
            if i == 0 {
                first_after_chi = Some(state_after_chi);
            }
        }
        out.push_str("Profile related to chi:\n");
        out.push_str("Propagation weights:");
        for &w in &self.weights {
            let _ = write!(out, " {w:4}");
        }
        out.push_str("\nActive rows:        ");
        for &r in &active_rows {
            let _ = write!(out, " {r:4}");
        }
        out.push_str("\nProfile related to theta:\n");
        out.push_str("Gaps:  ");
        for &g in &theta_gaps {
            let _ = write!(out, " {g:4}");
        }
        out.push_str("\nKernel:");
        for marker in kernel_markers.chars() {
            let _ = write!(out, "    {marker}");
        }
        out.push('\n');
        if let Some(after_chi) = first_after_chi {
            let _ = writeln!(
                out,
                "Previous round would have weight at least {}",
                propagation.min_reverse_weight(&after_chi)
            );
        }
        out
    }

    /// Writes the trail as one line: lane size, total weight, number of
    /// states, the weights, then the slices of each state, all in hex.
    pub fn save(&self, out: &mut impl Write) -> Result<(), CoreError> {
        let mut line = String::new();
        let lane_size = self.states.first().map_or(0, Vec::len);
        let _ = write!(line, "{:x} {:x} {:x} ", lane_size, self.total_weight, self.states.len());
        for &w in &self.weights {
            let _ = write!(line, "{w:x} ");
        }
        for state in &self.states {
            for &slice in state {
                let _ = write!(line, "{slice:x} ");
            }
        }
        line.push('\n');
        out.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Parses one trail line; `at_byte` is the byte offset of the line,
    /// used in error reports.
    pub fn parse_line(line: &str, at_byte: u64) -> Result<Trail, CoreError> {
        let error = |reason: String| CoreError::TrailParseError { at_byte, reason };
        let mut tokens = line.split_whitespace();
        let mut next_value = |what: &str| -> Result<u64, CoreError> {
            let token = tokens
                .next()
                .ok_or_else(|| error(format!("missing {what}")))?;
            u64::from_str_radix(token, 16)
                .map_err(|e| error(format!("bad {what} token {token:?}: {e}")))
        };
        let lane_size = next_value("lane size")? as usize;
        if lane_size == 0 || lane_size > 64 {
            return Err(error(format!("lane size {lane_size} out of range")));
        }
        let total_weight = next_value("total weight")? as u32;
        let nr_states = next_value("state count")? as usize;
        let mut trail = Trail::new();
        for i in 0..nr_states {
            trail.weights.push(next_value(&format!("weight {i}"))? as u32);
        }
        for i in 0..nr_states {
            let mut state = Vec::with_capacity(lane_size);
            for z in 0..lane_size {
                let raw = next_value(&format!("slice {z} of state {i}"))?;
                if raw > crate::parts::MAX_SLICE_VALUE as u64 {
                    return Err(error(format!("slice value {raw:#x} out of range")));
                }
                state.push(raw as SliceValue);
            }
            trail.states.push(state);
        }
        trail.total_weight = total_weight;
        trail.first_state_specified = match trail.states.first() {
            Some(first) if trail.states.len() >= 2 => first.iter().any(|&s| s != 0),
            _ => true,
        };
        Ok(trail)
    }

    /// Reads the next trail from a buffered reader, or `None` at a clean
    /// end of file. `offset` tracks the byte position for error reports.
    pub fn load(
        reader: &mut impl BufRead,
        offset: &mut u64,
    ) -> Result<Option<Trail>, CoreError> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                return Ok(None);
            }
            let at_byte = *offset;
            *offset += n as u64;
            if line.trim().is_empty() {
                continue;
            }
            return Trail::parse_line(&line, at_byte).map(Some);
        }
    }
}

/// A consumer of trails found by the search services.
pub trait TrailSink {
    fn fetch_trail(&mut self, trail: &Trail);
}

/// A [TrailSink] collecting into a vector; handy for tests and bounded
/// searches.
impl TrailSink for Vec<Trail> {
    fn fetch_trail(&mut self, trail: &Trail) {
        self.push(trail.clone());
    }
}

/// A [TrailSink] writing every trail to a stream in the file format.
pub struct TrailSaveToFile<W: Write> {
    out: W,
    count: u64,
}

impl<W: Write> TrailSaveToFile<W> {
    pub fn new(out: W) -> Self {
        TrailSaveToFile { out, count: 0 }
    }

    /// The number of trails written.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> TrailSink for TrailSaveToFile<W> {
    fn fetch_trail(&mut self, trail: &Trail) {
        if let Err(e) = trail.save(&mut self.out) {
            warn!("could not save trail: {e}");
        } else {
            self.count += 1;
        }
    }
}

/// Iterates over the trails of a file, optionally filtered, with an
/// optional prefetch pass that counts the trails first.
pub struct TrailFileIterator {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    count: Option<u64>,
    unfiltered_count: Option<u64>,
    filter: Option<Box<dyn Fn(&Trail) -> bool>>,
}

impl TrailFileIterator {
    /// Opens a trail file without counting its content.
    pub fn open(path: &Path) -> Result<Self, CoreError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(TrailFileIterator {
            path: path.to_path_buf(),
            reader,
            offset: 0,
            count: None,
            unfiltered_count: None,
            filter: None,
        })
    }

    /// Opens a trail file and keeps only the trails accepted by `filter`.
    pub fn with_filter(
        path: &Path,
        filter: Box<dyn Fn(&Trail) -> bool>,
    ) -> Result<Self, CoreError> {
        let mut iterator = Self::open(path)?;
        iterator.filter = Some(filter);
        Ok(iterator)
    }

    /// Reads the whole file once to count the (filtered) trails; the
    /// iteration itself is unaffected.
    pub fn prefetch(&mut self) -> Result<u64, CoreError> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut offset = 0;
        let mut count = 0;
        let mut unfiltered = 0;
        while let Some(trail) = Trail::load(&mut reader, &mut offset)? {
            unfiltered += 1;
            if self.filter.as_ref().map_or(true, |f| f(&trail)) {
                count += 1;
            }
        }
        self.count = Some(count);
        self.unfiltered_count = Some(unfiltered);
        Ok(count)
    }

    /// The number of matching trails, when [Self::prefetch] has run.
    pub fn count(&self) -> Option<u64> {
        self.count
    }

    /// The number of trails before filtering, when [Self::prefetch] has run.
    pub fn unfiltered_count(&self) -> Option<u64> {
        self.unfiltered_count
    }

    /// The next matching trail, or `None` at end of file.
    pub fn next_trail(&mut self) -> Result<Option<Trail>, CoreError> {
        while let Some(trail) = Trail::load(&mut self.reader, &mut self.offset)? {
            if self.filter.as_ref().map_or(true, |f| f(&trail)) {
                return Ok(Some(trail));
            }
        }
        Ok(None)
    }
}

impl Iterator for TrailFileIterator {
    type Item = Result<Trail, CoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_trail().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dclc::KeccakFDcLc;
    use crate::parts::get_slice_from_row;

    fn propagation_fixture() -> KeccakFDcLc {
        KeccakFDcLc::with_cache_dir(200, &std::env::temp_dir()).unwrap()
    }

    fn two_round_trail(dc: &Propagation) -> Trail {
        let mut s0 = vec![0; dc.lane_size()];
        s0[0] = get_slice_from_row(0x01, 0);
        let base = dc.build_state_base(&s0, false);
        let mut it = base.iterator();
        let s1 = it.current().to_vec();
        let mut trail = Trail::new();
        trail.append(s0.clone(), dc.weight(&s0));
        trail.append(s1.clone(), dc.weight(&s1));
        trail
    }

    #[test]
    fn append_and_prepend_maintain_total_weight() {
        let mut trail = Trail::new();
        trail.append(vec![1, 0], 2);
        trail.append(vec![2, 0], 4);
        trail.prepend(vec![3, 0], 7);
        assert_eq!(trail.total_weight, 13);
        assert_eq!(trail.weights, vec![7, 2, 4]);
        assert_eq!(trail.number_of_rounds(), 3);
    }

    #[test]
    fn save_load_round_trip() {
        let parent = propagation_fixture();
        let dc = Propagation::new(&parent, DcOrLc::Dc);
        let trail = two_round_trail(&dc);
        let mut buffer = Vec::new();
        trail.save(&mut buffer).unwrap();
        let mut offset = 0;
        let loaded = Trail::load(&mut BufReader::new(&buffer[..]), &mut offset)
            .unwrap()
            .unwrap();
        assert_eq!(loaded, trail);
        assert_eq!(offset, buffer.len() as u64);
    }

    #[test]
    fn trail_core_round_trip() {
        let mut core = Trail::new();
        core.set_first_state_reverse_minimum_weight(5, 4);
        core.append(vec![get_slice_from_row(0x0B, 1), 0, 0, 0], 6);
        assert!(!core.first_state_specified);
        let mut buffer = Vec::new();
        core.save(&mut buffer).unwrap();
        let mut offset = 0;
        let loaded = Trail::load(&mut BufReader::new(&buffer[..]), &mut offset)
            .unwrap()
            .unwrap();
        assert!(!loaded.first_state_specified);
        assert_eq!(loaded, core);
    }

    #[test]
    fn load_reports_errors_with_offsets() {
        let data = b"\n4 b 2 5 6 zz\n";
        let mut offset = 0;
        let err = Trail::load(&mut BufReader::new(&data[..]), &mut offset).unwrap_err();
        match err {
            CoreError::TrailParseError { at_byte, reason } => {
                assert_eq!(at_byte, 1);
                assert!(reason.contains("zz"), "{reason}");
            }
            other => panic!("unexpected error {other:?}"),
        }
        // A clean EOF yields None, not an error.
        let mut offset = 0;
        assert!(Trail::load(&mut BufReader::new(&b""[..]), &mut offset)
            .unwrap()
            .is_none());
    }

    #[test]
    fn check_accepts_valid_and_rejects_corrupted() {
        let parent = propagation_fixture();
        let dc = Propagation::new(&parent, DcOrLc::Dc);
        let trail = two_round_trail(&dc);
        trail.check(&dc).unwrap();

        let mut wrong_weight = trail.clone();
        wrong_weight.weights[1] += 2;
        wrong_weight.total_weight += 2;
        assert!(matches!(
            wrong_weight.check(&dc),
            Err(CoreError::WeightInconsistency { round: 1, .. })
        ));

        let mut wrong_total = trail.clone();
        wrong_total.total_weight += 1;
        assert!(matches!(
            wrong_total.check(&dc),
            Err(CoreError::WeightInconsistency { .. })
        ));

        let mut incompatible = trail.clone();
        // A distant single bit cannot be reached from the seed row.
        let mut bad = vec![0; dc.lane_size()];
        bad[dc.lane_size() / 2] = get_slice_from_row(0x04, 4);
        incompatible.states[1] = bad.clone();
        incompatible.weights[1] = dc.weight(&bad);
        incompatible.total_weight = incompatible.weights.iter().sum();
        assert!(matches!(
            incompatible.check(&dc),
            Err(CoreError::IncompatibleChiTransition { round: 0 })
        ));
    }

    #[test]
    fn display_mentions_the_profile() {
        let parent = propagation_fixture();
        let dc = Propagation::new(&parent, DcOrLc::Dc);
        let trail = two_round_trail(&dc);
        let text = trail.display(&dc);
        assert!(text.starts_with(&format!(
            "2-round differential trail of total weight {}",
            trail.total_weight
        )));
        assert!(text.contains("Propagation weights:"));
        assert!(text.contains("Kernel:"));
    }

    #[test]
    fn file_iterator_counts_and_filters() {
        let parent = propagation_fixture();
        let dc = Propagation::new(&parent, DcOrLc::Dc);
        let trail = two_round_trail(&dc);
        let dir = std::env::temp_dir().join("keccak-trails-file-iterator-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("trails.txt");
        {
            let file = std::fs::File::create(&path).unwrap();
            let mut sink = TrailSaveToFile::new(file);
            sink.fetch_trail(&trail);
            let mut heavier = trail.clone();
            heavier.append(trail.states[1].clone(), 50);
            sink.fetch_trail(&heavier);
            assert_eq!(sink.count(), 2);
        }
        let mut all = TrailFileIterator::open(&path).unwrap();
        assert_eq!(all.prefetch().unwrap(), 2);
        assert_eq!(all.by_ref().map(Result::unwrap).count(), 2);
        let limit = trail.total_weight;
        let mut light = TrailFileIterator::with_filter(
            &path,
            Box::new(move |t: &Trail| t.total_weight <= limit),
        )
        .unwrap();
        assert_eq!(light.prefetch().unwrap(), 1);
        assert_eq!(light.unfiltered_count(), Some(2));
        let only = light.next_trail().unwrap().unwrap();
        assert_eq!(only, trail);
        assert!(light.next_trail().unwrap().is_none());
    }
}
