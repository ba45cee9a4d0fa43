//! Streaming decoder for wire items.

use crate::error::{CodecError, CodecResult};
use crate::num::{format_decimal, magnitude_inc, magnitude_to_decimal};
use crate::types::*;

/// Decodes wire items from a byte slice, tracking an explicit cursor.
///
/// Every read either consumes a complete item or fails without advancing
/// past the end of the buffer; a `Truncated` failure means the caller should
/// refill its buffer and retry the decode from the original position.
#[derive(Debug)]
pub struct CborReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> CborReader<'a> {
    pub fn new(buf: &'a [u8]) -> CborReader<'a> {
        CborReader { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn need(&self, n: usize) -> CodecResult<()> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                expected: n - self.remaining(),
                actual: self.remaining(),
            });
        }
        Ok(())
    }

    /// Look at the next header byte without consuming it.
    pub fn peek_header(&self) -> CodecResult<u8> {
        self.need(1)?;
        Ok(self.buf[self.pos])
    }

    /// Consume a header, returning its major type and argument.
    pub fn read_type_header(&mut self) -> CodecResult<(u8, u64)> {
        let hdr = self.peek_header()?;
        let major = hdr & MAJOR_TYPE_MASK;
        let minor = hdr & MINOR_TYPE_MASK;
        let (value, extra) = match minor {
            m if m < ARG_U8 => (m as u64, 0),
            ARG_U8 => {
                self.need(2)?;
                (self.buf[self.pos + 1] as u64, 1)
            }
            ARG_U16 => {
                self.need(3)?;
                let b = &self.buf[self.pos + 1..self.pos + 3];
                (u16::from_be_bytes([b[0], b[1]]) as u64, 2)
            }
            ARG_U32 => {
                self.need(5)?;
                let b = &self.buf[self.pos + 1..self.pos + 5];
                (u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as u64, 4)
            }
            ARG_U64 => {
                self.need(9)?;
                let b = &self.buf[self.pos + 1..self.pos + 9];
                let mut arr = [0u8; 8];
                arr.copy_from_slice(b);
                (u64::from_be_bytes(arr), 8)
            }
            m => {
                return Err(CodecError::Deserialization(format!(
                    "unsupported additional info {m}"
                )))
            }
        };
        self.pos += 1 + extra;
        Ok((major, value))
    }

    fn expect_type(&mut self, want: u8) -> CodecResult<u64> {
        let hdr = self.peek_header()?;
        if hdr & MAJOR_TYPE_MASK != want {
            return Err(CodecError::Deserialization(format!(
                "unexpected major type {}, want {}",
                hdr >> 5,
                want >> 5
            )));
        }
        let (_, value) = self.read_type_header()?;
        Ok(value)
    }

    fn read_raw(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        self.need(n)?;
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_string(&mut self) -> CodecResult<String> {
        let len = self.expect_type(UTF)? as usize;
        let raw = self.read_raw(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| CodecError::Deserialization(format!("invalid utf-8 in string: {e}")))
    }

    pub fn read_bytes(&mut self) -> CodecResult<Vec<u8>> {
        let len = self.expect_type(BYTES)? as usize;
        Ok(self.read_raw(len)?.to_vec())
    }

    pub fn read_array_len(&mut self) -> CodecResult<usize> {
        Ok(self.expect_type(ARRAY)? as usize)
    }

    pub fn read_map_len(&mut self) -> CodecResult<usize> {
        Ok(self.expect_type(MAP)? as usize)
    }

    pub fn read_tag(&mut self) -> CodecResult<u64> {
        self.expect_type(TAG)
    }

    pub fn read_bool(&mut self) -> CodecResult<bool> {
        let hdr = self.peek_header()?;
        self.read_type_header()?;
        match hdr {
            TRUE => Ok(true),
            FALSE => Ok(false),
            _ => Err(CodecError::Deserialization(format!(
                "expected boolean, got header {hdr:#04x}"
            ))),
        }
    }

    pub fn read_null(&mut self) -> CodecResult<()> {
        let hdr = self.peek_header()?;
        self.read_type_header()?;
        if hdr != NIL {
            return Err(CodecError::Deserialization(format!(
                "expected null, got header {hdr:#04x}"
            )));
        }
        Ok(())
    }

    /// Consume a null if one is next. Returns whether it was consumed.
    pub fn try_read_null(&mut self) -> CodecResult<bool> {
        if self.peek_header()? == NIL {
            self.read_type_header()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Read a signed integer item that must fit 64 bits.
    pub fn read_int(&mut self) -> CodecResult<i64> {
        let (major, value) = self.read_type_header()?;
        match major {
            POS_INT => i64::try_from(value)
                .map_err(|_| CodecError::Deserialization(format!("integer {value} overflows"))),
            NEG_INT => {
                if value > i64::MAX as u64 {
                    return Err(CodecError::Deserialization(format!(
                        "integer -{} overflows",
                        (value as u128) + 1
                    )));
                }
                Ok(-(value as i64) - 1)
            }
            _ => Err(CodecError::Deserialization(format!(
                "unexpected major type {} for integer",
                major >> 5
            ))),
        }
    }

    pub fn read_u64(&mut self) -> CodecResult<u64> {
        self.expect_type(POS_INT)
    }

    /// Read an integer item to its decimal string form, preserving the full
    /// `-2^64 .. 2^64-1` wire range.
    pub fn read_int_to_string(&mut self) -> CodecResult<String> {
        let (major, value) = self.read_type_header()?;
        match major {
            POS_INT => Ok(value.to_string()),
            NEG_INT => Ok(format!("-{}", value as u128 + 1)),
            _ => Err(CodecError::Deserialization(format!(
                "unexpected major type {} for integer",
                major >> 5
            ))),
        }
    }

    /// Read a big-integer tag body (tag already consumed) to its decimal
    /// string form.
    pub fn read_big_int_to_string(&mut self, tag: u64) -> CodecResult<String> {
        let content = self.read_bytes()?;
        match tag {
            TAG_POS_BIG_INT => Ok(magnitude_to_decimal(&content)),
            TAG_NEG_BIG_INT => Ok(format!("-{}", magnitude_to_decimal(&magnitude_inc(&content)))),
            _ => Err(CodecError::Deserialization(format!(
                "tag {tag} is not a big integer"
            ))),
        }
    }

    /// Read a decimal tag body (tag already consumed) to its plain decimal
    /// string form.
    pub fn read_decimal_to_string(&mut self) -> CodecResult<String> {
        let len = self.read_array_len()?;
        if len != 2 {
            return Err(CodecError::Deserialization(format!(
                "decimal must be a 2-element array, got {len}"
            )));
        }
        let exponent = self.read_int()?;
        let mantissa = match self.peek_header()? & MAJOR_TYPE_MASK {
            POS_INT | NEG_INT => self.read_int_to_string()?,
            TAG => {
                let tag = self.read_tag()?;
                self.read_big_int_to_string(tag)?
            }
            other => {
                return Err(CodecError::Deserialization(format!(
                    "unexpected major type {} for decimal mantissa",
                    other >> 5
                )))
            }
        };
        Ok(format_decimal(&mantissa, exponent))
    }
}
