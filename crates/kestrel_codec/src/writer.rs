//! Streaming encoder for wire items.

use bytes::{BufMut, BytesMut};

use crate::error::{CodecError, CodecResult};
use crate::num::{decimal_to_magnitude, magnitude_dec, Decimal};
use crate::types::*;

/// Encodes wire items into a growable buffer.
///
/// All multi-byte arguments are big-endian, and each header uses the
/// shortest argument width that fits.
#[derive(Debug, Default)]
pub struct CborWriter {
    buf: BytesMut,
}

impl CborWriter {
    pub fn new() -> CborWriter {
        CborWriter { buf: BytesMut::new() }
    }

    /// Bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> BytesMut {
        self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Take the encoded bytes, leaving the writer empty.
    pub fn take(&mut self) -> BytesMut {
        self.buf.split()
    }

    pub(crate) fn write_header(&mut self, major: u8, value: u64) {
        if value < ARG_U8 as u64 {
            self.buf.put_u8(major | value as u8);
        } else if value <= u8::MAX as u64 {
            self.buf.put_u8(major | ARG_U8);
            self.buf.put_u8(value as u8);
        } else if value <= u16::MAX as u64 {
            self.buf.put_u8(major | ARG_U16);
            self.buf.put_u16(value as u16);
        } else if value <= u32::MAX as u64 {
            self.buf.put_u8(major | ARG_U32);
            self.buf.put_u32(value as u32);
        } else {
            self.buf.put_u8(major | ARG_U64);
            self.buf.put_u64(value);
        }
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_header(UTF, s.len() as u64);
        self.buf.put_slice(s.as_bytes());
    }

    pub fn write_bytes(&mut self, b: &[u8]) {
        self.write_header(BYTES, b.len() as u64);
        self.buf.put_slice(b);
    }

    pub fn write_array_header(&mut self, len: usize) {
        self.write_header(ARRAY, len as u64);
    }

    pub fn write_map_header(&mut self, len: usize) {
        self.write_header(MAP, len as u64);
    }

    pub fn write_int(&mut self, v: i64) {
        if v >= 0 {
            self.write_header(POS_INT, v as u64);
        } else {
            self.write_header(NEG_INT, !(v as u64));
        }
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write_header(POS_INT, v);
    }

    pub fn write_tag(&mut self, tag: u64) {
        self.write_header(TAG, tag);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(if v { TRUE } else { FALSE });
    }

    pub fn write_null(&mut self) {
        self.buf.put_u8(NIL);
    }

    /// Write a big integer given its sign and big-endian magnitude.
    /// Negative values are stored in the `-1 - n` content form.
    pub fn write_big_int(&mut self, negative: bool, magnitude: &[u8]) {
        if negative {
            self.write_tag(TAG_NEG_BIG_INT);
            self.write_bytes(&magnitude_dec(magnitude));
        } else {
            self.write_tag(TAG_POS_BIG_INT);
            self.write_bytes(magnitude);
        }
    }

    /// Write a decimal as `tag(4) [exponent, mantissa]`.
    pub fn write_decimal(&mut self, d: &Decimal) {
        self.write_tag(TAG_DECIMAL);
        self.write_array_header(2);
        self.write_int(d.exponent);
        // Mantissas small enough to fit an integer item use one; everything
        // else goes through the big-integer form.
        let unscaled = d.unscaled();
        match unscaled.parse::<i64>() {
            Ok(v) => self.write_int(v),
            Err(_) => self.write_big_int(d.negative, &d.magnitude),
        }
    }

    /// Write a decimal-string number in its most compact wire form: plain
    /// integer when it fits 64 bits, big integer beyond 18 digits, decimal
    /// when a fraction or exponent marker is present.
    pub fn write_string_number(&mut self, val: &str) -> CodecResult<()> {
        if val.contains(['.', 'e', 'E']) {
            let dec = Decimal::parse(val)?;
            self.write_decimal(&dec);
            return Ok(());
        }
        let (negative, digits) = match val.as_bytes().first() {
            Some(b'-') => (true, &val[1..]),
            Some(b'+') => (false, &val[1..]),
            _ => (false, val),
        };
        if digits.len() > 18 {
            let magnitude = decimal_to_magnitude(digits)
                .ok_or_else(|| CodecError::Serialization(format!("invalid number {val}")))?;
            self.write_big_int(negative && !magnitude.is_empty(), &magnitude);
            return Ok(());
        }
        let v: i64 = val
            .parse()
            .map_err(|_| CodecError::Serialization(format!("invalid number {val}")))?;
        self.write_int(v);
        Ok(())
    }
}
