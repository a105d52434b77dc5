//! Tools for the differential and linear cryptanalysis of the Keccak-f
//! permutation family.
//!
//! The crate is organised in three layers:
//!
//! 1. [KeccakF], a numeric engine for the seven Keccak-f widths (25 to 1600
//!    bits) and their round functions, including inverses and the
//!    round-reduced Keccak-p and π-conjugated variants.
//! 2. [KeccakFDcLc] and [Propagation], which precompute for every 5-bit row
//!    the output differences (or linear masks) compatible through χ together
//!    with their propagation weights, and expose the linear layer λ between
//!    two χ applications in its four modes.
//! 3. Trail search services: affine-space descriptions of χ envelopes
//!    ([AffineSpaceOfStates]), the [Trail] container with its file format,
//!    forward/backward [TrailExtension], and the parity-directed enumerators
//!    of two-round and three-round trail cores.
//!
//! All precomputed tables belong to a specific Keccak-f instance; there are
//! no globals and no internal threads. Iterators are pull-based and borrow
//! from the propagation context that created them.

use thiserror::Error;

mod affine;
mod dclc;
mod extension;
mod parity;
mod parity_bounds;
mod parity_extension;
mod parts;
mod permutation;
mod position;
mod propagation;
mod three_rounds;
mod trails;

pub use affine::{
    AffineSpaceOfRows, AffineSpaceOfSlices, AffineSpaceOfStates, SlicesAffineSpaceIterator,
};
pub use dclc::{KeccakFDcLc, LambdaMode, ListOfRowPatterns};
pub use extension::{KnownSmallWeightStates, LowWeightExclusion, TrailExtension};
pub use parity::{
    get_packed_parity_of_state, get_parity_of_slice, get_parity_of_state, pack_parity,
    packed_from_parity, parity_from_packed, parity_of_lanes, read_parity,
    sheets_to_slices_parity, slices_to_sheets_parity, unpack_parity, write_parity, PackedParity,
};
pub use parity_bounds::{
    bound_of_total_weight_given_total_hamming_weight, look_for_runs_below_target_weight,
    lower_bound_total_active_rows, ParityAsRuns, Run,
};
pub use parity_extension::{
    basis_after_theta_given_pattern_before_chi, build_basis_before_chi_given_pattern_after_chi,
    build_basis_intersection_with_kernel, intersection_with_kernel, inverse_theta_on_parity,
    inverse_theta_on_parity_sheets, starting_slice, OrbitalPosition,
    TwoRoundTrailCoreWithGivenParityIterator,
};
pub use parts::{
    from_lanes_to_slices, from_slices_to_lanes, get_bit, get_column, get_nr_active_rows,
    get_nr_active_rows_of_state, get_row, get_row_from_slice, get_slice_from_row, get_slice_point,
    get_slice_value, hamming_weight_of_column, hamming_weight_of_row, hamming_weight_of_slice,
    hamming_weight_of_state, invert_bit, is_minimal_symmetrically, set_bit_to_one, set_bit_to_zero,
    set_row, symmetric_minimum, translate_row, translate_row_safely, translate_slice,
    translate_slice_safely, translate_state_along_z, ColumnValue, LaneValue, RowValue, SliceValue,
    MAX_SLICE_VALUE,
};
pub use permutation::{KeccakF, Lane};
pub use position::{BitPosition, ColumnPosition, RowPosition};
pub use propagation::{DcOrLc, Propagation, ReverseStateIterator};
pub use three_rounds::{CoreInfo, InKernelTrailCores, KnotInformation};
pub use trails::{Trail, TrailFileIterator, TrailSaveToFile, TrailSink};

/// The error family shared by the whole crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The requested width is not 25·2^k for 0 ≤ k ≤ 6.
    #[error("invalid Keccak-f width {0}; must be 25 times a power of two up to 1600")]
    InvalidWidth(usize),
    /// A lane size outside the supported range was requested.
    #[error("invalid lane size {0}")]
    InvalidLaneSize(usize),
    /// A rotation or coordinate was out of the supported range.
    #[error("invalid rotation {offset} for lane size {lane_size}")]
    InvalidRotation { offset: i32, lane_size: usize },
    /// Two consecutive trail states are not compatible through χ.
    #[error("states of rounds {round} and {} are not compatible through chi", round + 1)]
    IncompatibleChiTransition { round: usize },
    /// A declared trail weight does not match the recomputed weight.
    #[error("weight of round {round} is {found}, expected {expected}")]
    WeightInconsistency {
        round: usize,
        expected: u32,
        found: u32,
    },
    /// A trail file could not be parsed.
    #[error("malformed trail at byte {at_byte}: {reason}")]
    TrailParseError { at_byte: u64, reason: String },
    /// Reading or writing a cache file failed.
    #[error("cache I/O failed: {0}")]
    CacheIOError(#[from] std::io::Error),
    /// A packed-parity affine space was queried through the unpacked API or
    /// vice versa.
    #[error("affine space was built with packed parities; unpacked parity access is unavailable")]
    UnpackedParityRequired,
}
