//! Parity patterns as collections of runs, their induced lower bounds on
//! trail weight, and the bounded enumeration of candidate parities.
//!
//! A run is a maximal chain of consecutive odd columns on the (x + 5z) line;
//! the θ-effect of a run survives only at its two ends, so a parity with few
//! short runs leads to few affected columns and a low weight bound.

use std::fmt;

use log::debug;

use crate::parity::{parity_bit, set_parity_bit};
use crate::parts::{symmetric_minimum, RowValue};
use crate::position::{BitPosition, ColumnPosition};
use crate::propagation::Propagation;

/// A lower bound on the total weight around λ (minimum reverse weight
/// before plus weight after) of any state pair with the given total Hamming
/// weight. Putting all the Hamming weight before λ gives the minimum.
pub fn bound_of_total_weight_given_total_hamming_weight(
    propagation: &Propagation,
    total_hamming_weight: u32,
) -> u32 {
    propagation.lower_bound_on_reverse_weight_given_hamming_weight(total_hamming_weight)
}

/// A lower bound on the number of active rows before and after λ, given the
/// affected columns and the unaffected odd columns. Every affected column
/// forces an active row on at least one side unless its rows are already
/// taken; every unaffected odd column has an active bit on both sides.
fn lower_bound_total_active_rows_from_columns(
    propagation: &Propagation,
    affected: &[ColumnPosition],
    unaffected_odd: &[ColumnPosition],
) -> u32 {
    let lane_size = propagation.lane_size();
    let mut active_rows = 0;
    let mut taken_left = vec![[false; 5]; lane_size];
    let mut taken_right = vec![[false; 5]; lane_size];

    for column in affected {
        for y in 0..5 {
            let mut left = BitPosition::new(column.x, y, column.z);
            propagation.reverse_rho_pi_before_theta(&mut left);
            let mut right = BitPosition::new(column.x, y, column.z);
            propagation.direct_rho_pi_after_theta(&mut right);
            if !taken_left[left.z][left.y] && !taken_right[right.z][right.y] {
                active_rows += 1;
                taken_left[left.z][left.y] = true;
                taken_right[right.z][right.y] = true;
            }
        }
    }

    for column in unaffected_odd {
        let mut any_left = false;
        let mut any_right = false;
        for y in 0..5 {
            let mut left = BitPosition::new(column.x, y, column.z);
            propagation.reverse_rho_pi_before_theta(&mut left);
            let mut right = BitPosition::new(column.x, y, column.z);
            propagation.direct_rho_pi_after_theta(&mut right);
            any_left |= taken_left[left.z][left.y];
            any_right |= taken_right[right.z][right.y];
            taken_left[left.z][left.y] = true;
            taken_right[right.z][right.y] = true;
        }
        if !any_left {
            active_rows += 1;
        }
        if !any_right {
            active_rows += 1;
        }
    }

    active_rows
}

/// A lower bound on the total number of active rows before and after λ for
/// any state with parity `c` and θ-effect `d`.
pub fn lower_bound_total_active_rows(
    propagation: &Propagation,
    c: &[RowValue],
    d: &[RowValue],
) -> u32 {
    let mut affected = Vec::new();
    let mut unaffected_odd = Vec::new();
    for x in 0..5 {
        for z in 0..propagation.lane_size() {
            if parity_bit(d, x, z) {
                affected.push(ColumnPosition::new(x, z));
            } else if parity_bit(c, x, z) {
                unaffected_odd.push(ColumnPosition::new(x, z));
            }
        }
    }
    lower_bound_total_active_rows_from_columns(propagation, &affected, &unaffected_odd)
}

/// A run of consecutive odd columns on the (x + 5z) line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Run {
    /// The t coordinate of the first odd column.
    pub t_start: usize,
    /// The number of consecutive odd columns.
    pub length: usize,
}

impl Run {
    pub fn new(t_start: usize, length: usize) -> Self {
        Run { t_start, length }
    }
}

impl fmt::Display for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.length == 1 {
            write!(f, "[{}]", self.t_start)
        } else {
            write!(f, "[{}-{}]", self.t_start, self.t_start + self.length - 1)
        }
    }
}

/// The parity of a state described as a collection of distinct runs.
#[derive(Clone, Debug, Default)]
pub struct ParityAsRuns {
    pub runs: Vec<Run>,
}

impl ParityAsRuns {
    /// Materialises the parity plane and its θ-effect. The effect is active
    /// at the column just before and just after each run, translated along
    /// x.
    pub fn to_parity_and_parity_effect(
        &self,
        propagation: &Propagation,
    ) -> (Vec<RowValue>, Vec<RowValue>) {
        let lane_size = propagation.lane_size();
        let mut c = vec![0; lane_size];
        let mut d = vec![0; lane_size];
        for run in &self.runs {
            let (x, z) = propagation.x_z_from_t(propagation.translate_along_x_in_t(run.t_start));
            set_parity_bit(&mut d, x, z);
            let (x, z) =
                propagation.x_z_from_t(propagation.translate_along_x_in_t(run.t_start + run.length));
            set_parity_bit(&mut d, x, z);
            for t in run.t_start..run.t_start + run.length {
                let (x, z) = propagation.x_z_from_t(t);
                set_parity_bit(&mut c, x, z);
            }
        }
        (c, d)
    }

    /// A lower bound on the total Hamming weight before and after λ: 10 per
    /// affected column (two ends per run) and 2 per unaffected odd column.
    pub fn lower_bound_total_hamming_weight(&self, propagation: &Propagation) -> u32 {
        let n = propagation.lane_size() * 5;
        let mut affected = vec![false; n];
        for run in &self.runs {
            affected[propagation.translate_along_x_in_t(run.t_start)] = true;
            affected[propagation.translate_along_x_in_t(run.t_start + run.length)] = true;
        }
        let mut total = 5 * 2 * self.runs.len() as u32;
        for run in &self.runs {
            for t in run.t_start..run.t_start + run.length {
                if !affected[t % n] {
                    total += 2;
                }
            }
        }
        total
    }

    /// Like [Self::lower_bound_total_active_rows], counting only the
    /// affected columns.
    pub fn lower_bound_total_active_rows_using_only_ac(&self, propagation: &Propagation) -> u32 {
        let mut affected = Vec::new();
        for run in &self.runs {
            let (x, z) = propagation.x_z_from_t(propagation.translate_along_x_in_t(run.t_start));
            affected.push(ColumnPosition::new(x, z));
            let (x, z) =
                propagation.x_z_from_t(propagation.translate_along_x_in_t(run.t_start + run.length));
            affected.push(ColumnPosition::new(x, z));
        }
        lower_bound_total_active_rows_from_columns(propagation, &affected, &[])
    }

    /// A lower bound on the total number of active rows before and after λ
    /// for any state with this parity.
    pub fn lower_bound_total_active_rows(&self, propagation: &Propagation) -> u32 {
        let n = propagation.lane_size() * 5;
        let mut affected_line = vec![false; n];
        let mut affected = Vec::new();
        for run in &self.runs {
            let t0 = propagation.translate_along_x_in_t(run.t_start);
            let t1 = propagation.translate_along_x_in_t(run.t_start + run.length);
            let (x, z) = propagation.x_z_from_t(t0);
            affected.push(ColumnPosition::new(x, z));
            let (x, z) = propagation.x_z_from_t(t1);
            affected.push(ColumnPosition::new(x, z));
            affected_line[t0] = true;
            affected_line[t1] = true;
        }
        let mut unaffected_odd = Vec::new();
        for run in &self.runs {
            for t in run.t_start..run.t_start + run.length {
                if !affected_line[t % n] {
                    let (x, z) = propagation.x_z_from_t(t);
                    unaffected_odd.push(ColumnPosition::new(x, z));
                }
            }
        }
        lower_bound_total_active_rows_from_columns(propagation, &affected, &unaffected_odd)
    }
}

impl fmt::Display for ParityAsRuns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, run) in self.runs.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{run}")?;
        }
        Ok(())
    }
}

fn recurse_runs(
    propagation: &Propagation,
    target_weight: u32,
    parity: &mut ParityAsRuns,
    sink: &mut impl FnMut(&[RowValue]),
) {
    let hamming_bound = bound_of_total_weight_given_total_hamming_weight(
        propagation,
        parity.lower_bound_total_hamming_weight(propagation),
    );
    let lower_bound = if hamming_bound <= target_weight {
        (parity.lower_bound_total_active_rows_using_only_ac(propagation) * 2).max(hamming_bound)
    } else {
        hamming_bound
    };
    if lower_bound > target_weight {
        return;
    }
    if parity.lower_bound_total_active_rows(propagation) * 2 <= target_weight {
        let (c, d) = parity.to_parity_and_parity_effect(propagation);
        if lower_bound_total_active_rows(propagation, &c, &d) * 2 <= target_weight {
            debug!("parity {parity} within target {target_weight}");
            sink(&symmetric_minimum(&c));
        }
    }
    let n = propagation.lane_size() * 5;
    let first_start = parity.runs[0].t_start;
    let last = *parity.runs.last().expect("at least one run");
    for t_start in (last.t_start + last.length + 1)..n {
        let max_length = n - 1 - t_start + first_start;
        for length in 1..=max_length {
            parity.runs.push(Run::new(t_start, length));
            recurse_runs(propagation, target_weight, parity, sink);
            parity.runs.pop();
        }
    }
}

/// Enumerates, up to z-translation, every parity whose lower bound stays at
/// or below `target_weight`, and hands the z-minimal parity plane to the
/// sink. The first run starts in the first five t positions; further runs
/// are added in increasing t order, pruning on the three bounds at each
/// step.
pub fn look_for_runs_below_target_weight(
    propagation: &Propagation,
    target_weight: u32,
    sink: &mut impl FnMut(&[RowValue]),
) {
    let n = propagation.lane_size() * 5;
    for t_start in 0..5.min(n) {
        for length in 1..n {
            let mut parity = ParityAsRuns {
                runs: vec![Run::new(t_start, length)],
            };
            recurse_runs(propagation, target_weight, &mut parity, sink);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dclc::KeccakFDcLc;
    use crate::parts::is_minimal_symmetrically;
    use crate::propagation::DcOrLc;

    fn fixture(width: usize) -> KeccakFDcLc {
        KeccakFDcLc::with_cache_dir(width, &std::env::temp_dir()).unwrap()
    }

    #[test]
    fn runs_materialise_their_theta_effect() {
        let parent = fixture(50);
        for kind in [DcOrLc::Dc, DcOrLc::Lc] {
            let p = Propagation::new(&parent, kind);
            let parity = ParityAsRuns {
                runs: vec![Run::new(1, 3)],
            };
            let (c, d) = parity.to_parity_and_parity_effect(&p);
            assert_eq!(
                c.iter().map(|&r| r.count_ones()).sum::<u32>(),
                3,
                "three odd columns"
            );
            // The materialised effect is exactly the theta effect of the
            // materialised parity.
            assert_eq!(p.direct_theta_effect_from_slice_parities(&c), d, "{kind:?}");
        }
    }

    #[test]
    fn hamming_weight_bound_counts_run_structure() {
        let parent = fixture(50);
        let dc = Propagation::new(&parent, DcOrLc::Dc);
        let single = ParityAsRuns {
            runs: vec![Run::new(0, 1)],
        };
        // One run: two affected columns (10) plus one unaffected odd column
        // if the run column itself is not an end.
        let bound = single.lower_bound_total_hamming_weight(&dc);
        assert!(bound >= 10);
        let double = ParityAsRuns {
            runs: vec![Run::new(0, 1), Run::new(3, 1)],
        };
        assert!(double.lower_bound_total_hamming_weight(&dc) >= bound);
    }

    #[test]
    fn active_row_bounds_are_ordered() {
        let parent = fixture(100);
        for kind in [DcOrLc::Dc, DcOrLc::Lc] {
            let p = Propagation::new(&parent, kind);
            let parity = ParityAsRuns {
                runs: vec![Run::new(2, 2), Run::new(7, 1)],
            };
            // Adding the unaffected odd columns can only raise the bound.
            assert!(
                parity.lower_bound_total_active_rows(&p)
                    >= parity.lower_bound_total_active_rows_using_only_ac(&p)
            );
            let (c, d) = parity.to_parity_and_parity_effect(&p);
            assert_eq!(
                lower_bound_total_active_rows(&p, &c, &d),
                parity.lower_bound_total_active_rows(&p)
            );
        }
    }

    #[test]
    fn enumeration_is_deterministic_and_bounded() {
        let parent = fixture(50);
        let lc = Propagation::new(&parent, DcOrLc::Lc);
        let target = 14;
        let mut first_pass = Vec::new();
        look_for_runs_below_target_weight(&lc, target, &mut |c: &[RowValue]| {
            first_pass.push(c.to_vec());
        });
        assert!(!first_pass.is_empty());
        for c in &first_pass {
            assert!(is_minimal_symmetrically(c));
            let d = lc.direct_theta_effect_from_slice_parities(c);
            assert!(lower_bound_total_active_rows(&lc, c, &d) * 2 <= target);
        }
        let mut second_pass = Vec::new();
        look_for_runs_below_target_weight(&lc, target, &mut |c: &[RowValue]| {
            second_pass.push(c.to_vec());
        });
        assert_eq!(first_pass, second_pass);
    }
}
