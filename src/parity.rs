//! Column parities of a state, in slice-wise, sheet-wise and packed form.

use std::io::{self, BufRead, Write};

use crate::parts::{get_row_from_slice, LaneValue, RowValue, SliceValue};
use crate::CoreError;

/// Up to twelve 5-bit slice parities packed in a 64-bit word; the parity of
/// slice z occupies bits 5z..5z+5.
pub type PackedParity = u64;

/// Returns a packed parity with the given slice parity at height z.
#[inline(always)]
pub fn parity_from_packed(packed: PackedParity, z: usize) -> RowValue {
    ((packed >> (5 * z)) & 0x1F) as RowValue
}

/// Returns a packed parity whose only non-zero slice parity is at height z.
#[inline(always)]
pub fn packed_from_parity(parity: RowValue, z: usize) -> PackedParity {
    (parity as PackedParity) << (5 * z)
}

/// Packs a vector of slice parities.
pub fn pack_parity(parity: &[RowValue]) -> PackedParity {
    parity
        .iter()
        .enumerate()
        .fold(0, |acc, (z, &p)| acc ^ packed_from_parity(p, z))
}

/// Unpacks a packed parity into `lane_size` slice parities.
pub fn unpack_parity(packed: PackedParity, lane_size: usize) -> Vec<RowValue> {
    (0..lane_size).map(|z| parity_from_packed(packed, z)).collect()
}

/// The parity of a single slice: the XOR of its five rows.
pub fn get_parity_of_slice(slice: SliceValue) -> RowValue {
    (0..5).fold(0, |acc, y| acc ^ get_row_from_slice(slice, y))
}

/// The parity of a state as a vector of slice parities.
pub fn get_parity_of_state(state: &[SliceValue]) -> Vec<RowValue> {
    state.iter().map(|&s| get_parity_of_slice(s)).collect()
}

/// The parity of a state packed in a single word. Valid when the state has
/// at most twelve slices.
pub fn get_packed_parity_of_state(state: &[SliceValue]) -> PackedParity {
    state
        .iter()
        .enumerate()
        .fold(0, |acc, (z, &s)| acc ^ packed_from_parity(get_parity_of_slice(s), z))
}

/// The parity of a state given as lanes, as five sheet parities.
pub fn parity_of_lanes(lanes: &[LaneValue; 25]) -> [LaneValue; 5] {
    let mut parity = [0; 5];
    for (x, p) in parity.iter_mut().enumerate() {
        for y in 0..5 {
            *p ^= lanes[x + 5 * y];
        }
    }
    parity
}

/// Converts slice parities into sheet parities.
pub fn slices_to_sheets_parity(slices: &[RowValue]) -> [LaneValue; 5] {
    let mut sheets = [0; 5];
    for (z, &p) in slices.iter().enumerate() {
        for (x, sheet) in sheets.iter_mut().enumerate() {
            if (p >> x) & 1 != 0 {
                *sheet ^= 1 << z;
            }
        }
    }
    sheets
}

/// Converts sheet parities into `lane_size` slice parities.
pub fn sheets_to_slices_parity(sheets: &[LaneValue; 5], lane_size: usize) -> Vec<RowValue> {
    (0..lane_size)
        .map(|z| {
            let mut p = 0;
            for (x, &sheet) in sheets.iter().enumerate() {
                if (sheet >> z) & 1 != 0 {
                    p ^= 1 << x;
                }
            }
            p
        })
        .collect()
}

/// The bit at column (x, z) of a parity plane.
#[inline(always)]
pub(crate) fn parity_bit(parity: &[RowValue], x: usize, z: usize) -> bool {
    (parity[z] >> x) & 1 != 0
}

/// Sets the bit at column (x, z) of a parity plane.
#[inline(always)]
pub(crate) fn set_parity_bit(parity: &mut [RowValue], x: usize, z: usize) {
    parity[z] |= 1 << x;
}

/// Writes a parity as one line of hex row values.
pub fn write_parity(out: &mut impl Write, parity: &[RowValue]) -> Result<(), CoreError> {
    let mut line = String::new();
    for &p in parity {
        line.push_str(&format!("{p:x} "));
    }
    line.push('\n');
    out.write_all(line.as_bytes())?;
    Ok(())
}

/// Reads the next parity line, or `None` at end of file.
pub fn read_parity(input: &mut impl BufRead) -> Result<Option<Vec<RowValue>>, CoreError> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = input.read_line(&mut line).map_err(io::Error::from)?;
        if n == 0 {
            return Ok(None);
        }
        if line.trim().is_empty() {
            continue;
        }
        let mut parity = Vec::new();
        for token in line.split_whitespace() {
            let value = RowValue::from_str_radix(token, 16).map_err(|e| {
                CoreError::TrailParseError {
                    at_byte: 0,
                    reason: format!("bad parity token {token:?}: {e}"),
                }
            })?;
            parity.push(value & 0x1F);
        }
        return Ok(Some(parity));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parts::get_slice_value;

    #[test]
    fn pack_unpack_round_trip() {
        let parity = vec![0x1F, 0x00, 0x11, 0x0A, 0x05, 0x1E, 0x01, 0x10];
        assert_eq!(unpack_parity(pack_parity(&parity), 8), parity);
    }

    #[test]
    fn slice_parity_is_row_xor() {
        let slice = get_slice_value(0x01, 0x03, 0x00, 0x10, 0x10);
        assert_eq!(get_parity_of_slice(slice), 0x01 ^ 0x03);
    }

    #[test]
    fn sheet_and_slice_parities_agree() {
        let state = vec![
            get_slice_value(1, 2, 4, 8, 16),
            0,
            get_slice_value(0x1F, 0, 0, 0, 0),
            get_slice_value(0, 0x11, 0, 0x11, 0),
        ];
        let slices = get_parity_of_state(&state);
        let lanes = crate::parts::from_slices_to_lanes(&state);
        let sheets = parity_of_lanes(&lanes);
        assert_eq!(slices_to_sheets_parity(&slices), sheets);
        assert_eq!(sheets_to_slices_parity(&sheets, 4), slices);
    }

    #[test]
    fn parity_text_round_trip() {
        let parity = vec![0x1Fu8, 0x00, 0x0A, 0x15];
        let mut buffer = Vec::new();
        write_parity(&mut buffer, &parity).unwrap();
        let mut reader = std::io::Cursor::new(buffer);
        assert_eq!(read_parity(&mut reader).unwrap(), Some(parity));
        assert_eq!(read_parity(&mut reader).unwrap(), None);
    }
}
