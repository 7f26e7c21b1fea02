mod error;
mod value;
mod decode;
mod encode;
mod de;
mod ser;

pub use error::{Error, Result};
pub use value::Value;
pub use decode::{decode, decode_prefix};
pub use encode::{encode, encode_into};
pub use de::from_bytes;
pub use ser::to_bytes;
