use std::fmt;

mod impls;

/// Represents a primitive that may be written to a bit stream and read back
/// from it using exactly [`AsBits::BITS`] bits.
pub trait AsBits: Sized {
    /// The number of bits of the serialized representation.
    const BITS: u32;

    /// Serializes the type into the low `BITS` bits of an `u64`.
    fn to_bits(&self) -> u64;

    /// Deserializes the type from the low `BITS` bits of an `u64`.
    fn from_bits(src: u64) -> Self;
}

/// Bit stream errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The reader was asked for more bits than the stream holds.
    #[error("not enough bits: requested {requested}, but only {remaining} remain")]
    OutOfBits { requested: usize, remaining: usize },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A growable, MSB-first bit writer.
///
/// Bits are appended to the current byte from the most significant position
/// down. [`BitWriter::into_bytes`] pads the last byte with zero bits.
#[derive(Clone, Default)]
pub struct BitWriter {
    inner: Vec<u8>,
    bits: usize,
}

impl BitWriter {
    /// Creates a new, empty, bit writer.
    pub fn new() -> BitWriter {
        BitWriter::default()
    }

    /// Returns the number of bits written so far.
    pub fn bits_written(&self) -> usize {
        self.bits
    }

    /// Writes a single bit.
    pub fn write_bit(&mut self, bit: bool) {
        let shift = 7 - (self.bits % 8);
        if shift == 7 {
            self.inner.push(0);
        }
        if bit {
            // The byte was pushed above, if needed.
            let last = self.inner.len() - 1;
            self.inner[last] |= 1 << shift;
        }
        self.bits += 1;
    }

    /// Writes the `count` least significant bits of `value`, most significant
    /// bit first.
    ///
    /// # Panics
    ///
    /// Panics if `count` is not in the `1..=64` range.
    pub fn write_bits(&mut self, value: u64, count: u32) {
        assert!((1..=64).contains(&count), "invalid bit count {count}");
        for i in (0..count).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    /// Writes a signed value as a `count`-bit two's complement number.
    ///
    /// Callers must ensure the value fits; extra high bits are dropped.
    pub fn write_signed(&mut self, value: i64, count: u32) {
        self.write_bits(value as u64, count);
    }

    /// Writes the type represented by [`AsBits`].
    pub fn write<T: AsBits>(&mut self, src: T) {
        self.write_bits(src.to_bits(), T::BITS);
    }

    /// Writes the byte sequence, 8 bits per byte.
    pub fn write_slice(&mut self, src: &[u8]) {
        if self.bits % 8 == 0 {
            self.inner.extend_from_slice(src);
            self.bits += src.len() * 8;
        } else {
            for byte in src {
                self.write_bits(u64::from(*byte), 8);
            }
        }
    }

    /// Creates a scope used to compute the written bit delta.
    pub fn delta<F, R>(&mut self, scope: F) -> (usize, R)
    where
        F: FnOnce(&mut Self) -> R,
    {
        let start = self.bits;
        let ret = scope(self);
        (self.bits - start, ret)
    }

    /// Returns the written bytes. The final partial byte, if any, is padded
    /// with zero bits.
    pub fn into_bytes(self) -> Vec<u8> {
        self.inner
    }

    /// Returns a reference to the written bytes (including the partial byte).
    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }
}

impl fmt::Debug for BitWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitWriter")
            .field("bits", &self.bits)
            .field("inner", &"<bytes>")
            .finish()
    }
}

/// A cursor over a byte slice that reads bits MSB-first.
pub struct BitReader<'a> {
    inner: &'a [u8],
    offset: usize,
}

impl<'a> BitReader<'a> {
    /// Creates a new reader positioned at the first bit.
    pub fn new(inner: &'a [u8]) -> BitReader<'a> {
        BitReader { inner, offset: 0 }
    }

    /// Returns the current offset, in bits.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns the number of bits left (including trailing padding).
    pub fn remaining(&self) -> usize {
        (self.inner.len() * 8).saturating_sub(self.offset)
    }

    /// Changes the cursor position, in bits. Offsets past the end move the
    /// cursor to the end.
    pub fn seek(&mut self, offset: usize) {
        self.offset = offset.min(self.inner.len() * 8);
    }

    /// Reads a single bit.
    pub fn read_bit(&mut self) -> Result<bool> {
        self.ensure(1)?;
        let byte = self.inner[self.offset / 8];
        let bit = (byte >> (7 - (self.offset % 8))) & 1 == 1;
        self.offset += 1;
        Ok(bit)
    }

    /// Reads `count` bits (MSB-first) into the low bits of an `u64`.
    ///
    /// # Panics
    ///
    /// Panics if `count` is not in the `1..=64` range.
    pub fn read_bits(&mut self, count: u32) -> Result<u64> {
        assert!((1..=64).contains(&count), "invalid bit count {count}");
        self.ensure(count as usize)?;
        let mut value = 0_u64;
        for _ in 0..count {
            value = (value << 1) | u64::from(self.read_bit()?);
        }
        Ok(value)
    }

    /// Reads a `count`-bit two's complement number, sign extending it.
    pub fn read_signed(&mut self, count: u32) -> Result<i64> {
        let raw = self.read_bits(count)?;
        if count == 64 {
            return Ok(raw as i64);
        }
        let shift = 64 - count;
        Ok(((raw << shift) as i64) >> shift)
    }

    /// Reads the type represented by [`AsBits`].
    pub fn read<T: AsBits>(&mut self) -> Result<T> {
        Ok(T::from_bits(self.read_bits(T::BITS)?))
    }

    /// Reads exactly the amount of bytes necessary to fill the given slice.
    pub fn read_slice(&mut self, dest: &mut [u8]) -> Result<()> {
        self.ensure(dest.len() * 8)?;
        if self.offset % 8 == 0 {
            let lo = self.offset / 8;
            dest.copy_from_slice(&self.inner[lo..lo + dest.len()]);
            self.offset += dest.len() * 8;
        } else {
            for byte in dest.iter_mut() {
                *byte = self.read_bits(8)? as u8;
            }
        }
        Ok(())
    }

    /// Creates a scope used to compute the consumed bit delta.
    pub fn delta<F, R>(&mut self, scope: F) -> (usize, R)
    where
        F: FnOnce(&mut Self) -> R,
    {
        let start = self.offset;
        let ret = scope(self);
        (self.offset - start, ret)
    }

    fn ensure(&self, requested: usize) -> Result<()> {
        let remaining = self.remaining();
        if requested > remaining {
            return Err(Error::OutOfBits {
                requested,
                remaining,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for BitReader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitReader")
            .field("offset", &self.offset)
            .field("remaining", &self.remaining())
            .field("inner", &"<bytes>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write() {
        let mut buf = BitWriter::new();
        assert_eq!(buf.bits_written(), 0);

        buf.write(true);
        buf.write_bits(0b010, 3);
        assert_eq!(buf.bits_written(), 4);
        assert_eq!(buf.as_bytes(), b"\xA0");

        buf.write(0x39C_u16);
        assert_eq!(buf.bits_written(), 20);
        assert_eq!(buf.into_bytes(), b"\xA0\x39\xC0");
    }

    #[test]
    fn test_read() {
        let orig = *b"\xA0\x39\xC0";
        let mut buf = BitReader::new(&orig);

        assert!(buf.read_bit().unwrap());
        assert_eq!(buf.read_bits(3).unwrap(), 0b010);
        let val: u16 = buf.read().unwrap();
        assert_eq!(val, 0x39C);
        assert_eq!(buf.remaining(), 4);
    }

    #[test]
    fn test_signed() {
        let mut buf = BitWriter::new();
        buf.write_signed(-3, 5);
        buf.write_signed(7, 5);
        buf.write_signed(i64::MIN, 64);
        let bytes = buf.into_bytes();

        let mut buf = BitReader::new(&bytes);
        assert_eq!(buf.read_signed(5).unwrap(), -3);
        assert_eq!(buf.read_signed(5).unwrap(), 7);
        assert_eq!(buf.read_signed(64).unwrap(), i64::MIN);
    }

    #[test]
    fn test_floats() {
        let mut buf = BitWriter::new();
        buf.write(false);
        buf.write(-1.5_f32);
        buf.write(std::f64::consts::PI);
        let bytes = buf.into_bytes();

        let mut buf = BitReader::new(&bytes);
        assert!(!buf.read::<bool>().unwrap());
        assert_eq!(buf.read::<f32>().unwrap(), -1.5);
        assert_eq!(buf.read::<f64>().unwrap(), std::f64::consts::PI);
    }

    #[test]
    fn test_unaligned_slice() {
        let mut buf = BitWriter::new();
        buf.write_bit(true);
        buf.write_slice(b"ab");
        assert_eq!(buf.bits_written(), 17);
        let bytes = buf.into_bytes();

        let mut buf = BitReader::new(&bytes);
        assert!(buf.read_bit().unwrap());
        let mut dest = [0_u8; 2];
        buf.read_slice(&mut dest).unwrap();
        assert_eq!(&dest, b"ab");
    }

    #[test]
    fn test_out_of_bits() {
        let orig = [0xFF_u8];
        let mut buf = BitReader::new(&orig);

        buf.read_bits(6).unwrap();
        assert_eq!(
            buf.read_bits(3),
            Err(Error::OutOfBits {
                requested: 3,
                remaining: 2
            })
        );
    }

    #[test]
    #[should_panic(expected = "invalid bit count 65")]
    fn test_invalid_count() {
        let mut buf = BitWriter::new();
        buf.write_bits(1, 65);
    }

    #[test]
    fn test_seek() {
        let orig = [0b1010_0000_u8];
        let mut buf = BitReader::new(&orig);

        let a = buf.read_bits(3).unwrap();
        buf.seek(0);
        let b = buf.read_bits(3).unwrap();
        assert_eq!(a, b);

        buf.seek(100);
        assert_eq!(buf.offset(), 8);
        assert_eq!(buf.remaining(), 0);
        assert!(matches!(
            buf.read_bit(),
            Err(Error::OutOfBits {
                requested: 1,
                remaining: 0
            })
        ));
        buf.seek(7);
        assert!(!buf.read_bit().unwrap());
    }

    #[test]
    fn test_delta() {
        let mut buf = BitWriter::new();
        let (delta, _) = buf.delta(|buf| {
            buf.write(true);
            buf.write(3_u8);
        });
        assert_eq!(delta, 9);

        let bytes = buf.into_bytes();
        let mut buf = BitReader::new(&bytes);
        let (delta, val) = buf.delta(|buf| buf.read_bits(4));
        assert_eq!(delta, 4);
        assert_eq!(val.unwrap(), 0b1000);
    }
}
