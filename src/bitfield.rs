//! Compact set of bit indices with have-all/have-none shortcut states.
//!
//! Grounded on `libtransmission/bitfield.{h,c}`. The three representations
//! are a tagged enum rather than a C-style struct with boolean flags and a
//! pointer.

/// 256-entry popcount table, used only by [`Bitfield::to_raw`] to assemble
/// the final partial byte of a have-all bitfield without reaching for a
/// loop; every other count uses `u32::count_ones`/`u8::count_ones` directly,
/// since modern CPUs have a native popcount instruction.
const TRUE_BIT_COUNT: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = (i as u8).count_ones() as u8;
        i += 1;
    }
    table
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Repr {
    HaveNone,
    HaveAll,
    Array(Vec<u8>),
}

/// A set of indices in `[0, n)`, represented either as a packed BEP-3 byte
/// array or one of the `have-all`/`have-none` shortcut states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    repr: Repr,
    bit_count: usize,
    true_count: usize,
}

/// A bitfield index was out of `[0, len())`, or a raw blob had the wrong
/// length for `set_from_raw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BitfieldError {
    #[error("index {index} is out of range for a bitfield of length {len}")]
    OutOfRange { index: usize, len: usize },
    #[error("raw bitfield had {got} bytes, expected {expected}")]
    WrongRawLength { got: usize, expected: usize },
    #[error("range [{begin}, {end}) is invalid for a bitfield of length {len}")]
    InvalidRange {
        begin: usize,
        end: usize,
        len: usize,
    },
}

fn byte_count(bit_count: usize) -> usize {
    bit_count.div_ceil(8)
}

impl Bitfield {
    pub fn new(bit_count: usize) -> Self {
        Self {
            repr: Repr::HaveNone,
            bit_count,
            true_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.bit_count
    }

    pub fn is_empty(&self) -> bool {
        self.bit_count == 0
    }

    pub fn has_all(&self) -> bool {
        matches!(self.repr, Repr::HaveAll) || (self.bit_count > 0 && self.true_count == self.bit_count)
    }

    pub fn has_none(&self) -> bool {
        matches!(self.repr, Repr::HaveNone) || (self.bit_count > 0 && self.true_count == 0)
    }

    pub fn count(&self) -> usize {
        self.true_count
    }

    fn array_test(&self, bit: usize) -> bool {
        match &self.repr {
            Repr::Array(flags) => {
                let byte = bit >> 3;
                if byte >= flags.len() {
                    return false;
                }
                (flags[byte] << (bit & 7) & 0x80) != 0
            }
            _ => false,
        }
    }

    pub fn test(&self, bit: usize) -> bool {
        self.has_all() || (!self.has_none() && self.array_test(bit))
    }

    /// Count of set bits in `[begin, end)`. Precondition violation (an
    /// invalid range) is a hard error, not a silent clamp, matching spec
    /// §9's contract for out-of-range preconditions.
    pub fn count_range(&self, begin: usize, end: usize) -> Result<usize, BitfieldError> {
        if begin > end || end > self.bit_count {
            return Err(BitfieldError::InvalidRange {
                begin,
                end,
                len: self.bit_count,
            });
        }
        if begin == end {
            return Ok(0);
        }
        if self.has_all() {
            return Ok(end - begin);
        }
        if self.has_none() {
            return Ok(0);
        }

        let Repr::Array(flags) = &self.repr else {
            unreachable!("true_count > 0 and not have_all implies Array");
        };

        let first_byte = begin >> 3;
        let last_byte = (end - 1) >> 3;

        let mut ret = 0usize;
        if first_byte == last_byte {
            let mut val = flags[first_byte];
            let i = begin - first_byte * 8;
            val <<= i;
            val >>= i;
            let i = (last_byte + 1) * 8 - end;
            val >>= i;
            val <<= i;
            ret += TRUE_BIT_COUNT[val as usize] as usize;
        } else {
            let i = begin - first_byte * 8;
            let mut val = flags[first_byte];
            val <<= i;
            val >>= i;
            ret += TRUE_BIT_COUNT[val as usize] as usize;

            for b in flags.iter().take(last_byte).skip(first_byte + 1) {
                ret += TRUE_BIT_COUNT[*b as usize] as usize;
            }

            let i = (last_byte + 1) * 8 - end;
            let mut val = flags[last_byte];
            val >>= i;
            val <<= i;
            ret += TRUE_BIT_COUNT[val as usize] as usize;
        }

        debug_assert!(ret <= end - begin);
        Ok(ret)
    }

    fn ensure_array(&mut self) {
        if let Repr::Array(_) = self.repr {
            return;
        }
        let nbytes = byte_count(self.bit_count);
        let mut flags = vec![0u8; nbytes];
        if matches!(self.repr, Repr::HaveAll) && self.bit_count > 0 {
            for b in flags.iter_mut().take(nbytes - 1) {
                *b = 0xff;
            }
            let spare = nbytes * 8 - self.bit_count;
            flags[nbytes - 1] = 0xffu8 << spare;
        }
        self.repr = Repr::Array(flags);
    }

    /// Drop the backing array in favour of a shortcut state if the bitfield
    /// is now canonically all-set or all-clear.
    fn canonicalize(&mut self) {
        if self.bit_count == 0 {
            return;
        }
        if self.true_count == self.bit_count {
            self.repr = Repr::HaveAll;
        } else if self.true_count == 0 {
            self.repr = Repr::HaveNone;
        }
    }

    fn check_index(&self, index: usize) -> Result<(), BitfieldError> {
        if index >= self.bit_count {
            return Err(BitfieldError::OutOfRange {
                index,
                len: self.bit_count,
            });
        }
        Ok(())
    }

    pub fn set(&mut self, index: usize) -> Result<(), BitfieldError> {
        self.check_index(index)?;
        if self.test(index) {
            return Ok(());
        }
        self.ensure_array();
        let Repr::Array(flags) = &mut self.repr else {
            unreachable!()
        };
        flags[index >> 3] |= 0x80 >> (index & 7);
        self.true_count += 1;
        self.canonicalize();
        Ok(())
    }

    pub fn clear(&mut self, index: usize) -> Result<(), BitfieldError> {
        self.check_index(index)?;
        if !self.test(index) {
            return Ok(());
        }
        self.ensure_array();
        let Repr::Array(flags) = &mut self.repr else {
            unreachable!()
        };
        flags[index >> 3] &= !(0x80 >> (index & 7));
        self.true_count -= 1;
        self.canonicalize();
        Ok(())
    }

    /// `O((end-begin)/8)`: mask the boundary bytes, `memset` the middle.
    pub fn set_range(&mut self, begin: usize, end: usize) -> Result<(), BitfieldError> {
        self.set_range_to(begin, end, true)
    }

    pub fn clear_range(&mut self, begin: usize, end: usize) -> Result<(), BitfieldError> {
        self.set_range_to(begin, end, false)
    }

    fn set_range_to(&mut self, begin: usize, end: usize, value: bool) -> Result<(), BitfieldError> {
        if begin > end || end > self.bit_count {
            return Err(BitfieldError::InvalidRange {
                begin,
                end,
                len: self.bit_count,
            });
        }
        if begin == end {
            return Ok(());
        }

        let before = self.count_range(begin, end)?;
        let affected = end - begin;
        let diff = if value { affected - before } else { before };
        if diff == 0 {
            return Ok(());
        }

        self.ensure_array();
        let Repr::Array(flags) = &mut self.repr else {
            unreachable!()
        };

        let last = end - 1;
        let sb = begin >> 3;
        let eb = last >> 3;

        if value {
            let sm: u8 = !(0xffu8 << (8 - (begin & 7)));
            let em: u8 = 0xffu8 << (7 - (last & 7));
            if sb == eb {
                flags[sb] |= sm & em;
            } else {
                flags[sb] |= sm;
                flags[eb] |= em;
                if sb + 1 < eb {
                    flags[sb + 1..eb].fill(0xff);
                }
            }
            self.true_count += diff;
        } else {
            let sm: u8 = 0xffu8 << (8 - (begin & 7));
            let em: u8 = !(0xffu8 << (7 - (last & 7)));
            if sb == eb {
                flags[sb] &= sm | em;
            } else {
                flags[sb] &= sm;
                flags[eb] &= em;
                if sb + 1 < eb {
                    flags[sb + 1..eb].fill(0);
                }
            }
            self.true_count -= diff;
        }

        self.canonicalize();
        Ok(())
    }

    pub fn set_has_all(&mut self) {
        self.repr = Repr::HaveAll;
        self.true_count = self.bit_count;
    }

    pub fn set_has_none(&mut self) {
        self.repr = Repr::HaveNone;
        self.true_count = 0;
    }

    /// `ceil(n/8)` bytes, BEP-3 order: byte 0 bit 7 is index 0, spare low
    /// bits of the final byte are zero.
    pub fn to_raw(&self) -> Vec<u8> {
        let nbytes = byte_count(self.bit_count);
        match &self.repr {
            Repr::Array(flags) => flags.clone(),
            Repr::HaveNone => vec![0u8; nbytes],
            Repr::HaveAll => {
                if nbytes == 0 {
                    return Vec::new();
                }
                let mut out = vec![0xffu8; nbytes];
                let spare = nbytes * 8 - self.bit_count;
                if let Some(last) = out.last_mut() {
                    *last = 0xffu8 << spare;
                }
                out
            }
        }
    }

    pub fn set_from_raw(&mut self, raw: &[u8]) -> Result<(), BitfieldError> {
        let expected = byte_count(self.bit_count);
        if raw.len() != expected {
            return Err(BitfieldError::WrongRawLength {
                got: raw.len(),
                expected,
            });
        }
        self.repr = Repr::Array(raw.to_vec());
        self.true_count = self.count_range(0, self.bit_count).unwrap_or(0);
        self.canonicalize();
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        if self.bit_count == 0 {
            return self.true_count == 0;
        }
        match &self.repr {
            Repr::Array(flags) => {
                flags.len() == byte_count(self.bit_count)
                    && self.true_count <= self.bit_count
                    && self.count_range(0, self.bit_count) == Ok(self.true_count)
            }
            Repr::HaveAll => self.true_count == self.bit_count,
            Repr::HaveNone => self.true_count == 0,
        }
    }

    fn for_each_array_op(&mut self, other: &Bitfield, and: bool) {
        assert_eq!(self.bit_count, other.bit_count, "bitfield length mismatch");
        if and {
            if other.has_all() {
                return;
            }
            if other.has_none() {
                self.set_has_none();
                return;
            }
        } else if other.has_none() {
            return;
        } else if other.has_all() {
            self.set_has_all();
            return;
        }

        self.ensure_array();
        let mut rhs = Bitfield::new(other.bit_count);
        rhs.repr = other.repr.clone();
        rhs.true_count = other.true_count;
        rhs.ensure_array();

        let Repr::Array(lhs_flags) = &mut self.repr else {
            unreachable!()
        };
        let Repr::Array(rhs_flags) = &rhs.repr else {
            unreachable!()
        };
        for (l, r) in lhs_flags.iter_mut().zip(rhs_flags.iter()) {
            if and {
                *l &= *r;
            } else {
                *l |= *r;
            }
        }
        self.true_count = self.count_range(0, self.bit_count).unwrap_or(0);
        self.canonicalize();
    }

    pub fn or_assign(&mut self, other: &Bitfield) {
        self.for_each_array_op(other, false);
    }

    pub fn and_assign(&mut self, other: &Bitfield) {
        self.for_each_array_op(other, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear_roundtrip() {
        let n = 40;
        let mut b = Bitfield::new(n);
        for i in 0..n {
            b.set(i).unwrap();
            assert!(b.test(i));
            b.clear(i).unwrap();
            assert!(!b.test(i));
        }
    }

    #[test]
    fn count_matches_popcount_of_raw() {
        let mut b = Bitfield::new(37);
        for i in [1, 2, 5, 9, 30, 36] {
            b.set(i).unwrap();
        }
        let popcount: u32 = b.to_raw().iter().map(|byte| byte.count_ones()).sum();
        assert_eq!(b.count() as u32, popcount);
    }

    #[test]
    fn set_from_raw_of_to_raw_is_identity() {
        let mut b = Bitfield::new(23);
        for i in [0, 3, 4, 7, 22] {
            b.set(i).unwrap();
        }
        let raw = b.to_raw();
        let mut b2 = Bitfield::new(23);
        b2.set_from_raw(&raw).unwrap();
        assert_eq!(b, b2);
    }

    #[test]
    fn count_range_matches_naive_scan() {
        let mut b = Bitfield::new(64);
        for i in [0, 3, 4, 7, 8, 40, 63] {
            b.set(i).unwrap();
        }
        for a in 0..64 {
            for e in a..=64 {
                let naive = (a..e).filter(|&i| b.test(i)).count();
                assert_eq!(b.count_range(a, e).unwrap(), naive);
            }
        }
    }

    #[test]
    fn range_set_scenario() {
        let mut b = Bitfield::new(64);
        b.set_range(4, 21).unwrap();
        b.clear_range(8, 24).unwrap();
        for i in 0..64 {
            assert_eq!(b.test(i), (4..8).contains(&i));
        }
        assert_eq!(b.count(), 4);
    }

    #[test]
    fn have_all_roundtrip_scenario() {
        let mut b = Bitfield::new(100);
        b.set_has_all();
        let raw = b.to_raw();
        let mut b2 = Bitfield::new(100);
        b2.set_from_raw(&raw).unwrap();
        assert_eq!(b2.count(), 100);
        assert!(b2.test(99));
        assert_eq!(raw.len(), 13);
        assert_eq!(*raw.last().unwrap(), 0xF0);
    }

    #[test]
    fn or_and_are_commutative_and_idempotent() {
        let mut a = Bitfield::new(16);
        a.set(1).unwrap();
        a.set(3).unwrap();
        let mut b = Bitfield::new(16);
        b.set(3).unwrap();
        b.set(5).unwrap();

        let mut a_or_b = a.clone();
        a_or_b.or_assign(&b);
        let mut b_or_a = b.clone();
        b_or_a.or_assign(&a);
        assert_eq!(a_or_b, b_or_a);

        let mut idem = a_or_b.clone();
        idem.or_assign(&a_or_b.clone());
        assert_eq!(idem, a_or_b);

        let mut a_and_b = a.clone();
        a_and_b.and_assign(&b);
        let mut b_and_a = b.clone();
        b_and_a.and_assign(&a);
        assert_eq!(a_and_b, b_and_a);
    }

    #[test]
    fn out_of_range_is_an_error_not_a_panic() {
        let mut b = Bitfield::new(8);
        assert!(matches!(
            b.set(8),
            Err(BitfieldError::OutOfRange { index: 8, len: 8 })
        ));
        assert!(matches!(
            b.clear(100),
            Err(BitfieldError::OutOfRange { .. })
        ));
    }

    #[test]
    fn is_valid_on_all_three_representations() {
        let empty = Bitfield::new(10);
        assert!(empty.is_valid());
        let mut all = Bitfield::new(10);
        all.set_has_all();
        assert!(all.is_valid());
        let mut arr = Bitfield::new(10);
        arr.set(2).unwrap();
        assert!(arr.is_valid());
    }
}
