//! Bitmap row filter over three-valued logic.
//!
//! Every row id owns two bits: `00` unknown, `01` true, `10` false. Four
//! rows share a byte, row `r` sitting in byte `r / 4` at bit `2 * (r % 4)`.
//! Binary operators work a whole byte at a time through 64K-entry lookup
//! tables indexed by `(left << 8) | right`; NOT and the true-lane count use
//! 256-entry tables. The code `11` never comes out of any operation and is
//! read as unknown.

use lazy_static::lazy_static;

use crate::row::{Row, RowId};
use crate::expression::{Evaluator, truth};
use crate::error::StrataResult;

const LANES: usize = 4;

/// Tri-state predicate result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TriState {
    Unknown = 0b00,
    True = 0b01,
    False = 0b10,
}

impl TriState {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b01 => TriState::True,
            0b10 => TriState::False,
            _ => TriState::Unknown,
        }
    }

    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn and(self, other: TriState) -> TriState {
        match (self, other) {
            (TriState::False, _) | (_, TriState::False) => TriState::False,
            (TriState::True, TriState::True) => TriState::True,
            _ => TriState::Unknown,
        }
    }

    pub fn or(self, other: TriState) -> TriState {
        match (self, other) {
            (TriState::True, _) | (_, TriState::True) => TriState::True,
            (TriState::False, TriState::False) => TriState::False,
            _ => TriState::Unknown,
        }
    }

    pub fn not(self) -> TriState {
        match self {
            TriState::True => TriState::False,
            TriState::False => TriState::True,
            TriState::Unknown => TriState::Unknown,
        }
    }

    /// All four lanes set to this state
    fn fill_byte(self) -> u8 {
        let b = self.bits();
        b | (b << 2) | (b << 4) | (b << 6)
    }
}

impl From<bool> for TriState {
    fn from(value: bool) -> Self {
        if value { TriState::True } else { TriState::False }
    }
}

impl From<Option<bool>> for TriState {
    fn from(value: Option<bool>) -> Self {
        value.map(TriState::from).unwrap_or(TriState::Unknown)
    }
}

fn lane(byte: u8, index: usize) -> TriState {
    TriState::from_bits(byte >> (2 * index))
}

fn map_lanes(a: u8, b: u8, op: fn(TriState, TriState) -> TriState) -> u8 {
    (0..LANES).fold(0u8, |acc, i| acc | (op(lane(a, i), lane(b, i)).bits() << (2 * i)))
}

pub struct LogicTables {
    and: Vec<u8>,
    or: Vec<u8>,
    not: [u8; 256],
    true_count: [u8; 256],
}

impl LogicTables {
    fn build() -> Self {
        let mut and = vec![0u8; 256 * 256];
        let mut or = vec![0u8; 256 * 256];
        let mut not = [0u8; 256];
        let mut true_count = [0u8; 256];

        for a in 0..=255u8 {
            for b in 0..=255u8 {
                let index = ((a as usize) << 8) | b as usize;
                and[index] = map_lanes(a, b, TriState::and);
                or[index] = map_lanes(a, b, TriState::or);
            }
            not[a as usize] = map_lanes(a, 0, |x, _| x.not());
            true_count[a as usize] =
                (0..LANES).filter(|&i| lane(a, i) == TriState::True).count() as u8;
        }

        Self {
            and,
            or,
            not,
            true_count,
        }
    }

    #[inline]
    pub fn and(&self, a: u8, b: u8) -> u8 {
        self.and[((a as usize) << 8) | b as usize]
    }

    #[inline]
    pub fn or(&self, a: u8, b: u8) -> u8 {
        self.or[((a as usize) << 8) | b as usize]
    }

    #[inline]
    pub fn not(&self, a: u8) -> u8 {
        self.not[a as usize]
    }

    #[inline]
    pub fn true_count(&self, a: u8) -> u8 {
        self.true_count[a as usize]
    }
}

lazy_static! {
    pub static ref LOGIC: LogicTables = LogicTables::build();
}

/// Per-row tri-state map with lazy negation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    bits: Vec<u8>,
    /// Number of row slots, row id 0 included
    capacity: usize,
    /// Logical complement of `bits` not yet applied
    inverted: bool,
}

impl RowFilter {
    /// A filter for row ids `0..capacity`, every row starting in `initial`
    pub fn new(capacity: usize, initial: TriState) -> Self {
        let mut filter = Self {
            bits: vec![initial.fill_byte(); capacity.div_ceil(LANES)],
            capacity,
            inverted: false,
        };
        filter.mask_tail();
        filter
    }

    /// Evaluate `predicate` for each row; rows not listed stay unknown
    pub fn build<'a, I>(capacity: usize, rows: I, predicate: &dyn Evaluator) -> StrataResult<Self>
    where
        I: IntoIterator<Item = &'a Row>,
    {
        let mut filter = Self::new(capacity, TriState::Unknown);
        for row in rows {
            let state = TriState::from(truth(&predicate.exec(row)?)?);
            filter.set(row.row_id(), state);
        }
        Ok(filter)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_inverted(&self) -> bool {
        self.inverted
    }

    /// Physical byte `index` as seen through the inversion flag
    fn logical_byte(&self, index: usize) -> u8 {
        let raw = self.bits.get(index).copied().unwrap_or(0);
        if self.inverted { LOGIC.not(raw) } else { raw }
    }

    /// Clear lanes past the last row slot so they never count
    fn mask_tail(&mut self) {
        let used = self.capacity % LANES;
        if used != 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= (1u8 << (2 * used)) - 1;
            }
        }
    }

    fn grow(&mut self, capacity: usize) {
        if capacity > self.capacity {
            self.capacity = capacity;
            self.bits.resize(capacity.div_ceil(LANES), 0);
        }
    }

    pub fn get(&self, row_id: RowId) -> TriState {
        let row = row_id.0 as usize;
        if row >= self.capacity {
            return TriState::Unknown;
        }
        lane(self.logical_byte(row / LANES), row % LANES)
    }

    /// Set one row, growing the map when the id is past the end
    pub fn set(&mut self, row_id: RowId, state: TriState) {
        let row = row_id.0 as usize;
        self.grow(row + 1);

        let stored = if self.inverted { state.not() } else { state };
        let shift = 2 * (row % LANES);
        let byte = &mut self.bits[row / LANES];
        *byte = (*byte & !(0b11 << shift)) | (stored.bits() << shift);
    }

    /// Out-of-range rows are simply not valid
    pub fn get_valid_status(&self, row_id: RowId) -> bool {
        self.get(row_id) == TriState::True
    }

    pub fn set_valid_status(&mut self, row_id: RowId, valid: bool) {
        self.set(row_id, TriState::from(valid));
    }

    /// Apply a pending inversion to the bytes
    pub fn prepare_attachment(&mut self) {
        if self.inverted {
            for byte in self.bits.iter_mut() {
                *byte = LOGIC.not(*byte);
            }
            self.inverted = false;
        }
    }

    /// Rows currently true
    pub fn count(&self) -> usize {
        (0..self.bits.len())
            .map(|i| LOGIC.true_count(self.logical_byte(i)) as usize)
            .sum()
    }

    fn combine(&mut self, other: &RowFilter, table: fn(&LogicTables, u8, u8) -> u8) -> usize {
        self.prepare_attachment();
        for (i, byte) in self.bits.iter_mut().enumerate() {
            *byte = table(&LOGIC, *byte, other.logical_byte(i));
        }
        self.mask_tail();
        self.count()
    }

    fn combine_value(&mut self, value: TriState, table: fn(&LogicTables, u8, u8) -> u8) -> usize {
        self.prepare_attachment();
        let operand = value.fill_byte();
        for byte in self.bits.iter_mut() {
            *byte = table(&LOGIC, *byte, operand);
        }
        self.mask_tail();
        self.count()
    }

    /// AND with another filter; rows past its end count as unknown.
    /// Returns the number of true rows.
    pub fn conjunction(&mut self, other: &RowFilter) -> usize {
        self.combine(other, LogicTables::and)
    }

    pub fn disjunction(&mut self, other: &RowFilter) -> usize {
        self.combine(other, LogicTables::or)
    }

    pub fn conjunction_value(&mut self, value: TriState) -> usize {
        self.combine_value(value, LogicTables::and)
    }

    pub fn disjunction_value(&mut self, value: TriState) -> usize {
        self.combine_value(value, LogicTables::or)
    }

    /// Negate the whole map. Without `instant` nothing is touched and the
    /// returned count is 0; call `prepare_attachment` or `count` later.
    pub fn invert(&mut self, instant: bool) -> usize {
        self.inverted = !self.inverted;
        if instant {
            self.prepare_attachment();
            self.count()
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, DataType};
    use crate::expression::{BuiltinCompiler, ExpressionCompiler};
    use crate::row::{RowShape, Value};
    use pretty_assertions::assert_eq;

    const STATES: [TriState; 3] = [TriState::Unknown, TriState::True, TriState::False];

    /// Three-valued truth tables, spelled out
    fn and3(a: TriState, b: TriState) -> TriState {
        use TriState::*;
        match (a, b) {
            (True, True) => True,
            (False, _) | (_, False) => False,
            _ => Unknown,
        }
    }

    fn or3(a: TriState, b: TriState) -> TriState {
        use TriState::*;
        match (a, b) {
            (False, False) => False,
            (True, _) | (_, True) => True,
            _ => Unknown,
        }
    }

    fn lanes(byte: u8) -> [TriState; 4] {
        [lane(byte, 0), lane(byte, 1), lane(byte, 2), lane(byte, 3)]
    }

    #[test]
    fn test_scalar_truth_tables() {
        for a in STATES {
            for b in STATES {
                assert_eq!(a.and(b), and3(a, b), "{:?} AND {:?}", a, b);
                assert_eq!(a.or(b), or3(a, b), "{:?} OR {:?}", a, b);
            }
        }
        assert_eq!(TriState::from_bits(0b11), TriState::Unknown);
    }

    #[test]
    fn test_binary_tables_match_lanewise_logic() {
        for a in 0..=255u8 {
            let la = lanes(a);
            for b in 0..=255u8 {
                let lb = lanes(b);
                let and = lanes(LOGIC.and(a, b));
                let or = lanes(LOGIC.or(a, b));
                for i in 0..LANES {
                    assert_eq!(and[i], and3(la[i], lb[i]), "AND {:#04x} {:#04x}", a, b);
                    assert_eq!(or[i], or3(la[i], lb[i]), "OR {:#04x} {:#04x}", a, b);
                }
            }
        }
    }

    #[test]
    fn test_unary_tables() {
        for a in 0..=255u8 {
            let la = lanes(a);
            let not = lanes(LOGIC.not(a));
            for i in 0..LANES {
                assert_eq!(not[i], la[i].not());
            }
            let trues = la.iter().filter(|&&s| s == TriState::True).count();
            assert_eq!(LOGIC.true_count(a) as usize, trues, "count {:#04x}", a);
        }
    }

    #[test]
    fn test_tables_never_produce_reserved_code() {
        for a in 0..=255u8 {
            for i in 0..LANES {
                assert_ne!((LOGIC.not(a) >> (2 * i)) & 0b11, 0b11);
            }
        }
    }

    #[test]
    fn test_valid_status_and_growth() {
        let mut filter = RowFilter::new(6, TriState::False);
        assert_eq!(filter.count(), 0);
        assert!(!filter.get_valid_status(RowId(100)));

        filter.set_valid_status(RowId(2), true);
        filter.set_valid_status(RowId(100), true);
        assert!(filter.get_valid_status(RowId(2)));
        assert!(filter.get_valid_status(RowId(100)));
        assert_eq!(filter.capacity(), 101);
        // Grown rows start unknown
        assert_eq!(filter.get(RowId(50)), TriState::Unknown);
        assert_eq!(filter.count(), 2);
    }

    #[test]
    fn test_lazy_inversion() {
        let mut filter = RowFilter::new(5, TriState::False);
        filter.set_valid_status(RowId(1), true);

        assert_eq!(filter.invert(false), 0);
        assert!(filter.is_inverted());
        assert!(!filter.get_valid_status(RowId(1)));
        assert!(filter.get_valid_status(RowId(4)));
        // Tail lanes of the second byte must not flip into "true"
        assert_eq!(filter.count(), 4);

        // Writes through the flag land correctly once materialized
        filter.set_valid_status(RowId(3), false);
        filter.prepare_attachment();
        assert!(!filter.is_inverted());
        assert_eq!(filter.count(), 3);

        assert_eq!(filter.invert(true), 2);
    }

    #[test]
    fn test_conjunction_and_disjunction() {
        let mut left = RowFilter::new(8, TriState::Unknown);
        let mut right = RowFilter::new(4, TriState::True);
        left.set(RowId(0), TriState::True);
        left.set(RowId(1), TriState::False);
        left.set(RowId(5), TriState::True);
        right.set(RowId(1), TriState::True);

        let snapshot = left.clone();
        assert_eq!(left.conjunction(&right), 1);
        assert_eq!(left.get(RowId(0)), TriState::True);
        assert_eq!(left.get(RowId(1)), TriState::False);
        assert_eq!(left.get(RowId(2)), TriState::Unknown);
        // Past the end of `right`: unknown
        assert_eq!(left.get(RowId(5)), TriState::Unknown);

        // The clone was not touched
        assert_eq!(snapshot.get(RowId(5)), TriState::True);

        let mut either = snapshot.clone();
        assert_eq!(either.disjunction(&right), 5);
        assert_eq!(either.get(RowId(6)), TriState::Unknown);
    }

    #[test]
    fn test_constant_operands_keep_tail_clear() {
        let mut filter = RowFilter::new(3, TriState::Unknown);
        assert_eq!(filter.conjunction_value(TriState::False), 0);
        assert_eq!(filter.invert(true), 3);
        assert_eq!(filter.disjunction_value(TriState::Unknown), 3);
        assert_eq!(filter.conjunction_value(TriState::Unknown), 0);
    }

    #[test]
    fn test_inverted_operand() {
        let mut left = RowFilter::new(4, TriState::True);
        let mut right = RowFilter::new(4, TriState::True);
        right.set_valid_status(RowId(2), false);
        right.invert(false);

        assert_eq!(left.conjunction(&right), 1);
        assert!(left.get_valid_status(RowId(2)));
    }

    #[test]
    fn test_build_from_predicate() {
        let shape = RowShape::new(vec![Column::new("qty", DataType::Integer)]);
        let predicate = BuiltinCompiler.compile("qty > 5", &shape).unwrap();

        let rows: Vec<Row> = [(1, Value::Integer(9)), (2, Value::Integer(1)), (3, Value::Null)]
            .into_iter()
            .map(|(id, v)| {
                let mut row = Row::from_values(vec![v]);
                row.set_row_id(RowId(id));
                row
            })
            .collect();

        let filter = RowFilter::build(4, rows.iter(), predicate.as_ref()).unwrap();
        assert_eq!(filter.get(RowId(1)), TriState::True);
        assert_eq!(filter.get(RowId(2)), TriState::False);
        assert_eq!(filter.get(RowId(3)), TriState::Unknown);
        assert_eq!(filter.count(), 1);
    }
}
