// This file is part of TRINCI.
//
// Copyright (C) 2021 Affidaty Spa.
//
// TRINCI is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TRINCI is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TRINCI. If not, see <https://www.gnu.org/licenses/>.

//! Positional bit-vectors.
//!
//! A bit at position `i` always refers to the node at position `i` of the
//! ordered node list it travels with. The `Msb0` ordering is part of the wire
//! format and must not change.

use bitvec::prelude::*;

/// Bit-vector indexed positionally against an ordered node list.
pub type BitSet = BitVec<u8, Msb0>;

/// Creates a bitset with `len` cleared bits.
pub fn zeros(len: usize) -> BitSet {
    bitvec![u8, Msb0; 0; len]
}

/// Creates a bitset with `len` set bits.
pub fn ones(len: usize) -> BitSet {
    bitvec![u8, Msb0; 1; len]
}

/// Builds a bitset from a slice of booleans.
pub fn from_bools(bits: &[bool]) -> BitSet {
    bits.iter().copied().collect()
}

/// Checks if the bit at `index` is set. Out of range positions are unset.
pub fn is_set(bitset: &BitSet, index: usize) -> bool {
    bitset.get(index).map(|bit| *bit).unwrap_or(false)
}
