//! Arbitrary-precision number helpers for the big-integer and decimal wire
//! encodings.
//!
//! Magnitudes are big-endian byte strings (the tag 2/3 content form). The
//! conversions here are schoolbook base changes over decimal digit strings;
//! they carry no precision limit.

use crate::error::{CodecError, CodecResult};

/// Convert an unsigned decimal digit string into a big-endian magnitude.
/// Returns `None` if the input contains a non-digit or is empty.
/// Zero converts to an empty magnitude.
pub(crate) fn decimal_to_magnitude(digits: &str) -> Option<Vec<u8>> {
    if digits.is_empty() {
        return None;
    }
    let mut ds: Vec<u32> = Vec::with_capacity(digits.len());
    for c in digits.chars() {
        ds.push(c.to_digit(10)?);
    }
    while ds.first() == Some(&0) {
        ds.remove(0);
    }
    let mut out = Vec::new();
    while !ds.is_empty() {
        let mut rem: u32 = 0;
        let mut next = Vec::with_capacity(ds.len());
        for &d in &ds {
            let v = rem * 10 + d;
            let q = v / 256;
            rem = v % 256;
            if !next.is_empty() || q != 0 {
                next.push(q);
            }
        }
        out.push(rem as u8);
        ds = next;
    }
    out.reverse();
    Some(out)
}

/// Convert a big-endian magnitude into its decimal digit string.
/// An empty magnitude is zero.
pub(crate) fn magnitude_to_decimal(bytes: &[u8]) -> String {
    // little-endian limbs, base 1e9
    let mut limbs: Vec<u64> = vec![0];
    for &b in bytes {
        let mut carry = b as u64;
        for limb in limbs.iter_mut() {
            let v = *limb * 256 + carry;
            *limb = v % 1_000_000_000;
            carry = v / 1_000_000_000;
        }
        while carry > 0 {
            limbs.push(carry % 1_000_000_000);
            carry /= 1_000_000_000;
        }
    }
    let mut s = limbs.last().copied().unwrap_or(0).to_string();
    for limb in limbs.iter().rev().skip(1) {
        s.push_str(&format!("{limb:09}"));
    }
    s
}

/// Subtract one from a non-zero magnitude (for the `-1 - n` negative
/// big-integer content form).
pub(crate) fn magnitude_dec(bytes: &[u8]) -> Vec<u8> {
    let mut out = bytes.to_vec();
    for b in out.iter_mut().rev() {
        if *b > 0 {
            *b -= 1;
            break;
        }
        *b = 0xff;
    }
    while out.first() == Some(&0) {
        out.remove(0);
    }
    out
}

/// Add one to a magnitude.
pub(crate) fn magnitude_inc(bytes: &[u8]) -> Vec<u8> {
    let mut out = bytes.to_vec();
    for b in out.iter_mut().rev() {
        if *b < 0xff {
            *b += 1;
            return out;
        }
        *b = 0;
    }
    out.insert(0, 1);
    out
}

/// Render an unscaled decimal value (`mantissa * 10^exponent`) as a plain
/// decimal string without an exponent marker.
pub(crate) fn format_decimal(mantissa: &str, exponent: i64) -> String {
    let (sign, digits) = match mantissa.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", mantissa),
    };
    if exponent >= 0 {
        let mut s = String::with_capacity(sign.len() + digits.len() + exponent as usize);
        s.push_str(sign);
        s.push_str(digits);
        for _ in 0..exponent {
            s.push('0');
        }
        return s;
    }
    let scale = (-exponent) as usize;
    if scale < digits.len() {
        let split = digits.len() - scale;
        format!("{sign}{}.{}", &digits[..split], &digits[split..])
    } else {
        format!("{sign}0.{}{digits}", "0".repeat(scale - digits.len()))
    }
}

/// An arbitrary-precision decimal: `(-1)^negative * magnitude * 10^exponent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decimal {
    pub(crate) negative: bool,
    pub(crate) magnitude: Vec<u8>,
    pub(crate) exponent: i64,
}

impl Decimal {
    /// Parse a decimal from its textual form: optional sign, digits with an
    /// optional fraction, and an optional `e`/`E` exponent.
    pub fn parse(s: &str) -> CodecResult<Decimal> {
        let invalid = || CodecError::Serialization(format!("invalid number {s}"));

        let (negative, rest) = match s.as_bytes().first() {
            Some(b'-') => (true, &s[1..]),
            Some(b'+') => (false, &s[1..]),
            _ => (false, s),
        };

        let (digits_part, exp_part) = match rest.find(['e', 'E']) {
            Some(i) => (&rest[..i], Some(&rest[i + 1..])),
            None => (rest, None),
        };

        let (int_part, frac_part) = match digits_part.find('.') {
            Some(i) => (&digits_part[..i], &digits_part[i + 1..]),
            None => (digits_part, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        let mut unscaled = String::with_capacity(int_part.len() + frac_part.len());
        unscaled.push_str(int_part);
        unscaled.push_str(frac_part);

        let mut exponent: i64 = -(frac_part.len() as i64);
        if let Some(e) = exp_part {
            let parsed: i64 = e.parse().map_err(|_| invalid())?;
            exponent += parsed;
        }

        let magnitude = decimal_to_magnitude(&unscaled).ok_or_else(invalid)?;
        Ok(Decimal {
            negative: negative && !magnitude.is_empty(),
            magnitude,
            exponent,
        })
    }

    /// The unscaled value as a signed decimal string.
    pub fn unscaled(&self) -> String {
        let digits = magnitude_to_decimal(&self.magnitude);
        if self.negative {
            format!("-{digits}")
        } else {
            digits
        }
    }
}

impl std::fmt::Display for Decimal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format_decimal(&self.unscaled(), self.exponent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_to_magnitude_small() {
        assert_eq!(decimal_to_magnitude("0"), Some(vec![]));
        assert_eq!(decimal_to_magnitude("1"), Some(vec![1]));
        assert_eq!(decimal_to_magnitude("255"), Some(vec![255]));
        assert_eq!(decimal_to_magnitude("256"), Some(vec![1, 0]));
        assert_eq!(decimal_to_magnitude("65536"), Some(vec![1, 0, 0]));
    }

    #[test]
    fn test_decimal_to_magnitude_rejects_garbage() {
        assert_eq!(decimal_to_magnitude(""), None);
        assert_eq!(decimal_to_magnitude("12a3"), None);
        assert_eq!(decimal_to_magnitude("-1"), None);
    }

    #[test]
    fn test_magnitude_round_trip() {
        for s in [
            "0",
            "1",
            "255",
            "256",
            "18446744073709551615",
            "18446744073709551616",
            "340282366920938463463374607431768211456",
            "99999999999999999999999999999999999999999999999999",
        ] {
            let mag = decimal_to_magnitude(s).unwrap();
            assert_eq!(magnitude_to_decimal(&mag), s, "round trip of {s}");
        }
    }

    #[test]
    fn test_magnitude_dec_inc() {
        let m = decimal_to_magnitude("18446744073709551616").unwrap();
        assert_eq!(magnitude_to_decimal(&magnitude_dec(&m)), "18446744073709551615");
        assert_eq!(magnitude_to_decimal(&magnitude_inc(&m)), "18446744073709551617");
        // carry across a limb boundary
        let m = decimal_to_magnitude("256").unwrap();
        assert_eq!(magnitude_to_decimal(&magnitude_dec(&m)), "255");
        let m = decimal_to_magnitude("255").unwrap();
        assert_eq!(magnitude_to_decimal(&magnitude_inc(&m)), "256");
    }

    #[test]
    fn test_parse_plain() {
        let d = Decimal::parse("123.45").unwrap();
        assert_eq!(d.unscaled(), "12345");
        assert_eq!(d.exponent, -2);
        assert_eq!(d.to_string(), "123.45");
    }

    #[test]
    fn test_parse_exponent_forms() {
        assert_eq!(Decimal::parse("1e2").unwrap().to_string(), "100");
        assert_eq!(Decimal::parse("1.5e3").unwrap().to_string(), "1500");
        assert_eq!(Decimal::parse("-2.5E-3").unwrap().to_string(), "-0.0025");
        assert_eq!(Decimal::parse("+0.5").unwrap().to_string(), "0.5");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for s in ["", ".", "e5", "1.2.3", "1e", "abc", "--1"] {
            assert!(Decimal::parse(s).is_err(), "expected parse failure for {s:?}");
        }
    }

    #[test]
    fn test_format_decimal_padding() {
        assert_eq!(format_decimal("5", -3), "0.005");
        assert_eq!(format_decimal("-5", -1), "-0.5");
        assert_eq!(format_decimal("12345", -2), "123.45");
        assert_eq!(format_decimal("7", 4), "70000");
    }
}
