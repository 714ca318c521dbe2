//! Unsigned integer codec for the OTRv3 wire format.
//!
//! Fixed-width integers (`BYTE`, `SHORT`, `INT`) are big-endian and must fit
//! their declared width. Multi-precision integers (`MPI`) are written as a
//! 4-byte length followed by the minimal big-endian encoding of the value,
//! so two MPIs with the same value always serialize identically.

use crate::KeyTrustError;
use num_bigint::BigUint;
use num_traits::Zero;

// ---------------------------------------------------------------------------
// Fixed-width integers
// ---------------------------------------------------------------------------

/// Width tag of a fixed-size unsigned integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    /// 1 byte unsigned value.
    Byte,
    /// 2 byte unsigned value, big-endian.
    Short,
    /// 4 byte unsigned value, big-endian.
    Int,
}

impl Width {
    /// Number of bytes a value of this width occupies on the wire.
    pub const fn len(self) -> usize {
        match self {
            Width::Byte => 1,
            Width::Short => 2,
            Width::Int => 4,
        }
    }

    /// Largest value representable in this width.
    pub const fn max(self) -> u64 {
        match self {
            Width::Byte => u8::MAX as u64,
            Width::Short => u16::MAX as u64,
            Width::Int => u32::MAX as u64,
        }
    }
}

/// Minimum number of bytes needed to represent `value` (0 for zero).
fn byte_length(value: u64) -> usize {
    (64 - value.leading_zeros() as usize).div_ceil(8)
}

/// Encode `value` as a big-endian integer of exactly `width` bytes.
///
/// # Errors
/// Returns `KeyTrustError::WidthOverflow` if the value needs more bytes than
/// the width provides.
pub fn encode_fixed(width: Width, value: u64) -> Result<Vec<u8>, KeyTrustError> {
    if value > width.max() {
        return Err(KeyTrustError::WidthOverflow {
            width: width.len(),
            needed: byte_length(value),
        });
    }
    let bytes = value.to_be_bytes();
    Ok(bytes[bytes.len() - width.len()..].to_vec())
}

/// Decode a big-endian integer that occupies the whole of `bytes`.
///
/// # Errors
/// Returns `KeyTrustError::LengthMismatch` if `bytes` is not exactly
/// `width` bytes long.
pub fn decode_fixed(width: Width, bytes: &[u8]) -> Result<u64, KeyTrustError> {
    if bytes.len() != width.len() {
        return Err(KeyTrustError::LengthMismatch {
            offset: 0,
            declared: width.len(),
            actual: bytes.len(),
        });
    }
    Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

// ---------------------------------------------------------------------------
// Multi-precision integers
// ---------------------------------------------------------------------------

/// A multi-precision unsigned integer.
///
/// The value is held as a `BigUint`, so equality is on the integer value and
/// the encoding is always the minimal one regardless of how it was read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Mpi(BigUint);

impl Mpi {
    /// Wrap an integer, checking that its length fits the 4-byte prefix.
    pub fn new(value: BigUint) -> Result<Self, KeyTrustError> {
        let needed = value.bits().div_ceil(8);
        if needed > Width::Int.max() {
            return Err(KeyTrustError::WidthOverflow {
                width: Width::Int.len(),
                needed: byte_length(needed),
            });
        }
        Ok(Mpi(value))
    }

    /// Interpret `bytes` as an unsigned big-endian integer.
    ///
    /// Leading zero bytes are accepted and do not survive re-encoding.
    pub fn from_be_bytes(bytes: &[u8]) -> Result<Self, KeyTrustError> {
        Mpi::new(BigUint::from_bytes_be(bytes))
    }

    /// The integer value.
    pub fn value(&self) -> &BigUint {
        &self.0
    }

    /// Number of bytes in the minimal encoding (0 for zero).
    pub fn byte_len(&self) -> usize {
        self.0.bits().div_ceil(8) as usize
    }

    /// Minimal big-endian bytes of the value, empty for zero.
    pub fn to_be_bytes(&self) -> Vec<u8> {
        if self.0.is_zero() {
            Vec::new()
        } else {
            self.0.to_bytes_be()
        }
    }

    /// Wire encoding: `INT(byte_len) || minimal big-endian bytes`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.byte_len());
        self.write_to(&mut out);
        out
    }

    /// Append the wire encoding to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let body = self.to_be_bytes();
        // `new` guarantees the length fits in four bytes.
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
    }

    /// Decode an MPI that occupies the whole of `bytes`.
    ///
    /// Minimality is not re-verified: a value with leading zero bytes is
    /// accepted as-is.
    pub fn decode(bytes: &[u8]) -> Result<Self, KeyTrustError> {
        let mut reader = Reader::new(bytes);
        let mpi = reader.read_mpi()?;
        reader.finish()?;
        Ok(mpi)
    }
}

impl From<u32> for Mpi {
    fn from(value: u32) -> Self {
        Mpi(BigUint::from(value))
    }
}

impl From<u64> for Mpi {
    fn from(value: u64) -> Self {
        Mpi(BigUint::from(value))
    }
}

impl From<Mpi> for BigUint {
    fn from(mpi: Mpi) -> Self {
        mpi.0
    }
}

impl TryFrom<BigUint> for Mpi {
    type Error = KeyTrustError;

    fn try_from(value: BigUint) -> Result<Self, Self::Error> {
        Mpi::new(value)
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Left-to-right cursor over a wire buffer.
///
/// Errors report the absolute offset into the buffer passed to `new`.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Start reading at offset 0 of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    /// Current offset into the buffer.
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// Number of bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], KeyTrustError> {
        if n > self.remaining() {
            return Err(KeyTrustError::LengthMismatch {
                offset: self.pos,
                declared: n,
                actual: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read one fixed-width integer.
    pub fn read_fixed(&mut self, width: Width) -> Result<u64, KeyTrustError> {
        let bytes = self.take(width.len())?;
        decode_fixed(width, bytes)
    }

    /// Read a big-endian `SHORT`, such as a keytype code.
    ///
    /// # Errors
    /// Returns `KeyTrustError::LengthMismatch` if fewer than 2 bytes remain.
    pub fn read_short(&mut self) -> Result<u16, KeyTrustError> {
        let bytes = self.take(Width::Short.len())?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Read a big-endian `INT`, such as an MPI length prefix.
    ///
    /// # Errors
    /// Returns `KeyTrustError::LengthMismatch` if fewer than 4 bytes remain.
    pub fn read_int(&mut self) -> Result<u32, KeyTrustError> {
        let bytes = self.take(Width::Int.len())?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read one length-prefixed MPI.
    ///
    /// # Errors
    /// Returns `KeyTrustError::LengthMismatch` at the prefix offset if the
    /// declared length runs past the end of the buffer.
    pub fn read_mpi(&mut self) -> Result<Mpi, KeyTrustError> {
        let start = self.pos;
        let len = self.read_int()? as usize;
        if len > self.remaining() {
            return Err(KeyTrustError::LengthMismatch {
                offset: start,
                declared: len,
                actual: self.remaining(),
            });
        }
        let body = self.take(len)?;
        Ok(Mpi(BigUint::from_bytes_be(body)))
    }

    /// Succeed only if the whole buffer has been consumed.
    pub fn finish(self) -> Result<(), KeyTrustError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(KeyTrustError::TrailingData {
                offset: self.pos,
                remaining: self.remaining(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fixed_widths() {
        assert_eq!(encode_fixed(Width::Byte, 0x7f).unwrap(), vec![0x7f]);
        assert_eq!(encode_fixed(Width::Short, 0x0102).unwrap(), vec![0x01, 0x02]);
        assert_eq!(encode_fixed(Width::Int, 1).unwrap(), vec![0, 0, 0, 1]);
        assert_eq!(decode_fixed(Width::Int, &[0, 0, 1, 0]).unwrap(), 256);
    }

    #[test]
    fn test_fixed_overflow() {
        let err = encode_fixed(Width::Byte, 256).unwrap_err();
        assert!(matches!(err, KeyTrustError::WidthOverflow { width: 1, needed: 2 }));
        let err = encode_fixed(Width::Short, 0x1_0000).unwrap_err();
        assert!(matches!(err, KeyTrustError::WidthOverflow { width: 2, needed: 3 }));
        assert!(encode_fixed(Width::Int, u64::from(u32::MAX)).is_ok());
        assert!(encode_fixed(Width::Int, u64::from(u32::MAX) + 1).is_err());
    }

    #[test]
    fn test_decode_fixed_wrong_length() {
        let err = decode_fixed(Width::Short, &[1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            KeyTrustError::LengthMismatch { declared: 2, actual: 3, .. }
        ));
    }

    #[test]
    fn test_mpi_zero_is_empty() {
        assert_eq!(Mpi::from(0u32).encode(), vec![0, 0, 0, 0]);
        assert_eq!(Mpi::decode(&[0, 0, 0, 0]).unwrap(), Mpi::from(0u32));
    }

    #[test]
    fn test_mpi_minimal_encoding() {
        assert_eq!(Mpi::from(511u32).encode(), vec![0, 0, 0, 2, 0x01, 0xff]);
        assert_eq!(
            Mpi::from(u64::from(u32::MAX)).encode(),
            vec![0, 0, 0, 4, 0xff, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn test_mpi_decode_accepts_leading_zero() {
        let mpi = Mpi::decode(&[0, 0, 0, 3, 0x00, 0x01, 0xff]).unwrap();
        assert_eq!(mpi, Mpi::from(511u32));
        assert_eq!(mpi.encode(), vec![0, 0, 0, 2, 0x01, 0xff]);
    }

    #[test]
    fn test_mpi_decode_short_buffer() {
        let err = Mpi::decode(&[0, 0, 0, 4, 0x01]).unwrap_err();
        assert!(matches!(
            err,
            KeyTrustError::LengthMismatch { offset: 0, declared: 4, actual: 1 }
        ));
    }

    #[test]
    fn test_mpi_decode_trailing() {
        let err = Mpi::decode(&[0, 0, 0, 1, 0x01, 0x02]).unwrap_err();
        assert!(matches!(
            err,
            KeyTrustError::TrailingData { offset: 5, remaining: 1 }
        ));
    }

    #[test]
    fn test_reader_sequence() {
        let buf = [0x00, 0x07, 0, 0, 0, 1, 0x2a];
        let mut reader = Reader::new(&buf);
        assert_eq!(reader.read_short().unwrap(), 7);
        assert_eq!(reader.read_mpi().unwrap(), Mpi::from(42u32));
        assert!(reader.finish().is_ok());
    }

    proptest! {
        #[test]
        fn prop_fixed_roundtrip(v in any::<u16>()) {
            let encoded = encode_fixed(Width::Short, u64::from(v)).unwrap();
            prop_assert_eq!(decode_fixed(Width::Short, &encoded).unwrap(), u64::from(v));
        }

        #[test]
        fn prop_int_roundtrip(v in any::<u32>()) {
            let encoded = encode_fixed(Width::Int, u64::from(v)).unwrap();
            prop_assert_eq!(decode_fixed(Width::Int, &encoded).unwrap(), u64::from(v));
        }

        #[test]
        fn prop_mpi_roundtrip(bytes in proptest::collection::vec(any::<u8>(), 0..300)) {
            let mpi = Mpi::from_be_bytes(&bytes).unwrap();
            let encoded = mpi.encode();
            prop_assert_eq!(Mpi::decode(&encoded).unwrap(), mpi);
            if encoded.len() > 4 {
                prop_assert_ne!(encoded[4], 0);
            }
        }
    }
}
