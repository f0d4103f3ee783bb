//! Append-only bit buffer over 64-bit words with snapshot cursors.
//!
//! Bits are packed most-significant first: the first bit written lands in the highest bit of
//! word 0. The backing words sit behind an [`Arc`]; a cursor from [`BitStream::read`] keeps its
//! own handle plus the bit length at the time of the call, and any later write to a shared
//! buffer copies it first. A cursor therefore never observes bits written after it was created.

use crate::error::DbError;

use std::sync::Arc;

/// Word capacity of a stream created with [`BitStream::new`].
pub const DEFAULT_CAPACITY_WORDS: usize = 16;

/// Growable append-only bit buffer.
#[derive(Debug, Clone)]
pub struct BitStream {
    data: Arc<Vec<u64>>,
    /// Index of the word currently being filled.
    index: usize,
    /// Number of bits already used in `data[index]` (0..64).
    shift: u32,
}

impl Default for BitStream {
    fn default() -> Self {
        Self::new()
    }
}

impl BitStream {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY_WORDS)
    }

    /// Creates a stream with room for `words` 64-bit words before the first resize.
    pub fn with_capacity(words: usize) -> Self {
        Self {
            data: Arc::new(vec![0u64; words.max(1)]),
            index: 0,
            shift: 0,
        }
    }

    /// Number of valid bits in the stream.
    pub fn bit_length(&self) -> usize {
        self.index * 64 + self.shift as usize
    }

    /// Current capacity in words.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of words holding at least one valid bit.
    fn valid_word_count(&self) -> usize {
        if self.shift == 0 {
            self.index
        } else {
            self.index + 1
        }
    }

    /// Appends the `n` least-significant bits of `value`.
    pub fn write(&mut self, n: u32, value: u64) -> Result<(), DbError> {
        if !(1..=64).contains(&n) {
            return Err(DbError::InvalidArgument(format!(
                "bit width must be within 1..=64, got {}",
                n
            )));
        }
        self.reserve(n as usize);

        let shift = self.shift;
        let index = self.index;
        let data = Arc::make_mut(&mut self.data);

        data[index] |= (value << (64 - n)) >> shift;
        let end = shift + n;
        if end >= 64 {
            self.index += 1;
            self.shift = end - 64;
            if self.shift != 0 {
                data[self.index] |= value << (64 - self.shift);
            }
        } else {
            self.shift = end;
        }
        Ok(())
    }

    /// Doubles capacity until `bits` more bits fit.
    fn reserve(&mut self, bits: usize) {
        let mut capacity = self.data.len();
        while capacity * 64 < self.bit_length() + bits {
            capacity = (capacity * 2).max(1);
        }
        if capacity != self.data.len() {
            Arc::make_mut(&mut self.data).resize(capacity, 0);
        }
    }

    /// Returns a cursor over the bits written so far.
    pub fn read(&self) -> BitStreamIterator {
        BitStreamIterator {
            data: Arc::clone(&self.data),
            bit_length: self.bit_length(),
            index: 0,
            shift: 0,
        }
    }

    /// Exact number of bytes [`BitStream::serialize`] produces.
    pub fn serialized_byte_size(&self) -> usize {
        4 + 1 + 8 * self.valid_word_count()
    }

    /// Appends `[valid word count: i32][bit offset in last word: u8][words]`, big-endian.
    pub fn serialize(&self, out: &mut Vec<u8>) -> Result<(), DbError> {
        let valid = self.valid_word_count();
        let count = i32::try_from(valid)
            .map_err(|_| DbError::Internal(format!("bit stream too large to serialize: {} words", valid)))?;
        out.reserve(self.serialized_byte_size());
        out.extend_from_slice(&count.to_be_bytes());
        out.push(self.shift as u8);
        for word in &self.data[..valid] {
            out.extend_from_slice(&word.to_be_bytes());
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DbError> {
        let mut out = Vec::with_capacity(self.serialized_byte_size());
        self.serialize(&mut out)?;
        Ok(out)
    }

    /// Reads a stream written by [`BitStream::serialize`], advancing `buf` past it.
    ///
    /// The result accepts further writes, continuing after the last partially filled word.
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, DbError> {
        let count = read_i32(buf)?;
        let shift = read_u8(buf)? as u32;
        if count < 0 {
            return Err(DbError::Parse(format!("negative bit stream word count {}", count)));
        }
        if shift >= 64 {
            return Err(DbError::Parse(format!("bit offset {} out of range", shift)));
        }
        let count = count as usize;
        if count == 0 && shift != 0 {
            return Err(DbError::Parse(
                "bit offset set on an empty bit stream".to_string(),
            ));
        }
        let byte_len = count
            .checked_mul(8)
            .ok_or_else(|| DbError::Parse(format!("bit stream word count {} overflows", count)))?;
        let words = take(buf, byte_len)?;

        let mut data = Vec::with_capacity(count.max(1));
        for chunk in words.chunks_exact(8) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            data.push(u64::from_be_bytes(word));
        }
        if data.is_empty() {
            data.push(0);
        }

        let index = if shift == 0 { count } else { count - 1 };
        Ok(Self {
            data: Arc::new(data),
            index,
            shift,
        })
    }
}

/// Cursor over a snapshot of a [`BitStream`].
#[derive(Debug, Clone)]
pub struct BitStreamIterator {
    data: Arc<Vec<u64>>,
    bit_length: usize,
    index: usize,
    shift: u32,
}

impl BitStreamIterator {
    /// Bits consumed so far.
    pub fn position(&self) -> usize {
        self.index * 64 + self.shift as usize
    }

    pub fn remaining(&self) -> usize {
        self.bit_length - self.position()
    }

    /// Consumes the next `n` bits (0..=64) and returns them right-aligned.
    pub fn read(&mut self, n: u32) -> Result<u64, DbError> {
        if n > 64 {
            return Err(DbError::InvalidArgument(format!(
                "bit width must be within 0..=64, got {}",
                n
            )));
        }
        if n == 0 {
            return Ok(0);
        }
        if self.position() + n as usize > self.bit_length {
            return Err(DbError::Parse(format!(
                "read of {} bits at offset {} exceeds stream length {}",
                n,
                self.position(),
                self.bit_length
            )));
        }

        let word = self.data[self.index];
        let shift = self.shift;
        if 64 - shift > n {
            self.shift += n;
            return Ok((word << shift) >> (64 - n));
        }

        // The field runs to (or past) the end of the current word.
        let mut result = (word << shift) >> shift;
        let carry = shift + n - 64;
        self.index += 1;
        self.shift = carry;
        if carry != 0 {
            result = (result << carry) | (self.data[self.index] >> (64 - carry));
        }
        Ok(result)
    }

    /// Consumes `n` bits only if they equal `expected`.
    pub fn try_read(&mut self, n: u32, expected: u64) -> Result<bool, DbError> {
        let (index, shift) = (self.index, self.shift);
        if self.read(n)? == expected {
            return Ok(true);
        }
        self.index = index;
        self.shift = shift;
        Ok(false)
    }
}

pub(crate) fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], DbError> {
    if buf.len() < n {
        return Err(DbError::Parse(format!(
            "truncated buffer: need {} bytes, have {}",
            n,
            buf.len()
        )));
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

pub(crate) fn read_u8(buf: &mut &[u8]) -> Result<u8, DbError> {
    Ok(take(buf, 1)?[0])
}

pub(crate) fn read_i32(buf: &mut &[u8]) -> Result<i32, DbError> {
    let mut b = [0u8; 4];
    b.copy_from_slice(take(buf, 4)?);
    Ok(i32::from_be_bytes(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_widths() {
        let mut s = BitStream::new();
        assert!(matches!(s.write(0, 1), Err(DbError::InvalidArgument(_))));
        assert!(matches!(s.write(65, 1), Err(DbError::InvalidArgument(_))));
        assert_eq!(s.bit_length(), 0);
    }

    #[test]
    fn write_then_read_across_word_boundaries() {
        let mut s = BitStream::with_capacity(1);
        s.write(60, 0xABC_DEF0_1234_5678).unwrap();
        s.write(8, 0xA5).unwrap();
        s.write(64, u64::MAX).unwrap();
        s.write(1, 1).unwrap();
        s.write(64, 0x0123_4567_89AB_CDEF).unwrap();

        let mut it = s.read();
        assert_eq!(it.read(60).unwrap(), 0xABC_DEF0_1234_5678);
        assert_eq!(it.read(8).unwrap(), 0xA5);
        assert_eq!(it.read(64).unwrap(), u64::MAX);
        assert_eq!(it.read(1).unwrap(), 1);
        assert_eq!(it.read(64).unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(it.remaining(), 0);
        assert!(matches!(it.read(1), Err(DbError::Parse(_))));
    }

    #[test]
    fn only_low_bits_are_written() {
        let mut s = BitStream::new();
        s.write(4, 0xFFFF_FFFF_FFFF_FFF5).unwrap();
        assert_eq!(s.read().read(4).unwrap(), 0x5);
    }

    #[test]
    fn capacity_doubles_on_growth() {
        let mut s = BitStream::with_capacity(1);
        for _ in 0..3 {
            s.write(64, 7).unwrap();
        }
        assert_eq!(s.capacity(), 4);
        assert_eq!(s.bit_length(), 192);
    }

    #[test]
    fn cursor_does_not_see_later_writes() {
        let mut s = BitStream::with_capacity(1);
        s.write(3, 0b101).unwrap();
        let mut snapshot = s.read();
        s.write(61, u64::MAX).unwrap();
        s.write(64, u64::MAX).unwrap();

        assert_eq!(snapshot.remaining(), 3);
        assert_eq!(snapshot.read(3).unwrap(), 0b101);
        assert!(snapshot.read(1).is_err());

        let mut fresh = s.read();
        assert_eq!(fresh.read(3).unwrap(), 0b101);
        assert_eq!(fresh.read(61).unwrap(), (1u64 << 61) - 1);
    }

    #[test]
    fn try_read_rewinds_on_mismatch() {
        let mut s = BitStream::new();
        s.write(4, 0b1101).unwrap();
        let mut it = s.read();
        assert!(!it.try_read(2, 0b10).unwrap());
        assert_eq!(it.position(), 0);
        assert!(it.try_read(2, 0b11).unwrap());
        assert_eq!(it.position(), 2);
        assert_eq!(it.read(2).unwrap(), 0b01);
    }

    #[test]
    fn serialized_size_matches_output() {
        let mut s = BitStream::new();
        assert_eq!(s.to_bytes().unwrap().len(), s.serialized_byte_size());
        s.write(10, 3).unwrap();
        assert_eq!(s.serialized_byte_size(), 4 + 1 + 8);
        s.write(54, 3).unwrap();
        assert_eq!(s.serialized_byte_size(), 4 + 1 + 8);
        s.write(1, 1).unwrap();
        assert_eq!(s.serialized_byte_size(), 4 + 1 + 16);
        assert_eq!(s.to_bytes().unwrap().len(), s.serialized_byte_size());
    }

    #[test]
    fn deserialized_stream_continues_writing() {
        let mut original = BitStream::with_capacity(1);
        original.write(37, 0x1F_0F0F_0F0F).unwrap();
        let bytes = original.to_bytes().unwrap();
        let mut slice = bytes.as_slice();
        let mut restored = BitStream::deserialize(&mut slice).unwrap();
        assert!(slice.is_empty());

        for s in [&mut original, &mut restored] {
            s.write(50, 0x3_FFFF_0000_FFFF).unwrap();
            s.write(9, 0x1AB).unwrap();
        }
        assert_eq!(original.to_bytes().unwrap(), restored.to_bytes().unwrap());
    }

    #[test]
    fn deserialize_rejects_truncated_input() {
        let mut s = BitStream::new();
        s.write(64, 1).unwrap();
        let bytes = s.to_bytes().unwrap();
        let mut short = &bytes[..bytes.len() - 1];
        assert!(matches!(BitStream::deserialize(&mut short), Err(DbError::Parse(_))));

        let mut bad_offset: &[u8] = &[0, 0, 0, 0, 3];
        assert!(matches!(BitStream::deserialize(&mut bad_offset), Err(DbError::Parse(_))));
    }

    #[test]
    fn empty_stream_round_trips_and_grows() {
        let bytes = BitStream::new().to_bytes().unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0, 0]);
        let mut restored = BitStream::deserialize(&mut bytes.as_slice()).unwrap();
        restored.write(64, 42).unwrap();
        restored.write(64, 43).unwrap();
        let mut it = restored.read();
        assert_eq!(it.read(64).unwrap(), 42);
        assert_eq!(it.read(64).unwrap(), 43);
    }
}
