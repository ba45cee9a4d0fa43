pub mod attrval;
pub mod error;
pub mod num;
pub mod reader;
pub mod types;
pub mod writer;

pub use attrval::{decode_attribute_value, encode_attribute_value, AttributeValue};
pub use error::{CodecError, CodecResult};
pub use num::Decimal;
pub use reader::CborReader;
pub use writer::CborWriter;
