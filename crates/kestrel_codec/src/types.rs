//! Wire format constants.
//!
//! The wire format is a self-describing binary encoding: every item starts
//! with a one-byte header whose top three bits select the major type and
//! whose low five bits carry the argument (or select a wider argument that
//! follows the header).

pub const MAJOR_TYPE_MASK: u8 = 0xe0;
pub const MINOR_TYPE_MASK: u8 = 0x1f;

// ── Major types ──────────────────────────────────────────────────────────

pub const POS_INT: u8 = 0 << 5;
pub const NEG_INT: u8 = 1 << 5;
pub const BYTES: u8 = 2 << 5;
pub const UTF: u8 = 3 << 5;
pub const ARRAY: u8 = 4 << 5;
pub const MAP: u8 = 5 << 5;
pub const TAG: u8 = 6 << 5;
pub const SIMPLE: u8 = 7 << 5;

// ── Simple values ────────────────────────────────────────────────────────

pub const FALSE: u8 = SIMPLE | 20;
pub const TRUE: u8 = SIMPLE | 21;
pub const NIL: u8 = SIMPLE | 22;

// ── Argument width selectors (minor values) ──────────────────────────────

pub const ARG_U8: u8 = 24;
pub const ARG_U16: u8 = 25;
pub const ARG_U32: u8 = 26;
pub const ARG_U64: u8 = 27;

// ── Tags ─────────────────────────────────────────────────────────────────

/// Standard positive big integer: tag content is a byte string holding the
/// big-endian magnitude.
pub const TAG_POS_BIG_INT: u64 = 2;
/// Standard negative big integer: tag content holds `-1 - n`.
pub const TAG_NEG_BIG_INT: u64 = 3;
/// Decimal fraction: tag content is `[exponent, mantissa]`.
pub const TAG_DECIMAL: u64 = 4;

/// String set attribute value.
pub const TAG_STRING_SET: u64 = 3321;
/// Number set attribute value.
pub const TAG_NUMBER_SET: u64 = 3322;
/// Binary set attribute value.
pub const TAG_BINARY_SET: u64 = 3323;
