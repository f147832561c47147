//! Byte codec for protocol payloads.
//!
//! Little-endian integers and compact-size prefixed vectors. The network layer
//! owns message framing (command strings, checksums); this module only covers
//! payload bodies so they can be hashed and round-tripped deterministically.

use crate::{Error, Result};

pub(crate) trait WireEncode {
    fn encode_to(&self, out: &mut Vec<u8>);
}

pub(crate) trait WireDecode: Sized {
    fn decode_from(r: &mut SliceReader<'_>) -> Result<Self>;
}

/// Encode a payload into a fresh buffer.
pub(crate) fn encode<T: WireEncode>(value: &T) -> Vec<u8> {
    let mut out = Vec::new();
    value.encode_to(&mut out);
    out
}

/// Decode a payload, requiring the whole buffer to be consumed.
pub(crate) fn decode<T: WireDecode>(bytes: &[u8]) -> Result<T> {
    let mut reader = SliceReader { buf: bytes, pos: 0 };
    let value = T::decode_from(&mut reader)?;
    if reader.pos != bytes.len() {
        return Err(Error::Decode(format!(
            "trailing bytes: {} of {} consumed",
            reader.pos,
            bytes.len()
        )));
    }
    Ok(value)
}

pub(crate) struct SliceReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::Decode(format!(
                "unexpected end of payload: need {n} bytes at offset {}",
                self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.take(N)?;
        let mut array = [0u8; N];
        array.copy_from_slice(slice);
        Ok(array)
    }
}

// ── Integers ────────────────────────────────────────────────────────

macro_rules! impl_le_int {
    ($ty:ty) => {
        impl WireEncode for $ty {
            fn encode_to(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }

        impl WireDecode for $ty {
            fn decode_from(r: &mut SliceReader<'_>) -> Result<$ty> {
                Ok(<$ty>::from_le_bytes(r.take_array()?))
            }
        }
    };
}

impl_le_int!(u16);
impl_le_int!(u32);
impl_le_int!(u64);
impl_le_int!(i32);
impl_le_int!(i64);

impl WireEncode for u8 {
    fn encode_to(&self, out: &mut Vec<u8>) {
        out.push(*self);
    }
}

impl WireDecode for u8 {
    fn decode_from(r: &mut SliceReader<'_>) -> Result<u8> {
        Ok(r.take(1)?[0])
    }
}

impl WireEncode for bool {
    fn encode_to(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }
}

impl WireDecode for bool {
    fn decode_from(r: &mut SliceReader<'_>) -> Result<bool> {
        match r.take(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::Decode(format!("invalid bool byte {other:#04x}"))),
        }
    }
}

// ── Compact size ────────────────────────────────────────────────────

pub(crate) fn write_compact_size(n: u64, out: &mut Vec<u8>) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

pub(crate) fn read_compact_size(r: &mut SliceReader<'_>) -> Result<u64> {
    let first = r.take(1)?[0];
    Ok(match first {
        0xfd => u16::from_le_bytes(r.take_array()?) as u64,
        0xfe => u32::from_le_bytes(r.take_array()?) as u64,
        0xff => u64::from_le_bytes(r.take_array()?),
        n => n as u64,
    })
}

// Payloads are bounded well under this; it only guards against hostile
// length prefixes allocating unbounded memory.
const MAX_VEC_ELEMENTS: u64 = 1 << 22;

impl<T: WireEncode> WireEncode for Vec<T> {
    fn encode_to(&self, out: &mut Vec<u8>) {
        write_compact_size(self.len() as u64, out);
        for item in self {
            item.encode_to(out);
        }
    }
}

impl<T: WireDecode> WireDecode for Vec<T> {
    fn decode_from(r: &mut SliceReader<'_>) -> Result<Vec<T>> {
        let len = read_compact_size(r)?;
        if len > MAX_VEC_ELEMENTS {
            return Err(Error::Decode(format!("vector length {len} too large")));
        }
        let mut items = Vec::with_capacity(len.min(1024) as usize);
        for _ in 0..len {
            items.push(T::decode_from(r)?);
        }
        Ok(items)
    }
}
