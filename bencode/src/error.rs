use std::fmt::Display;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {

    #[error("unexpected end of input")]
    Eof,

    // Bytes left over after a complete value, when the caller didn't ask for them.
    #[error("trailing bytes after value")]
    TrailingBytes,

    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    #[error("invalid string length: {0}")]
    InvalidLength(String),

    #[error("invalid token: expected {expected}, found {found}")]
    InvalidToken {
        expected: &'static str,
        found: String,
    },

    // Keys must be byte strings in strictly ascending order.
    #[error("dictionary key order violation: {0}")]
    KeyOrder(String),

    #[error("nesting depth limit exceeded")]
    DepthLimit,

    #[error("invalid type: {0}")]
    InvalidType(String),

    #[error("map serialization error: {0}")]
    MapSerialization(String),

    #[error("{0}")]
    Custom(String),

}

impl serde::ser::Error for Error {
    fn custom<T>(msg: T) -> Self where T: Display {
        Error::Custom(msg.to_string())
    }
}

impl serde::de::Error for Error {
    fn custom<T>(msg: T) -> Self where T: Display {
        Error::Custom(msg.to_string())
    }
}
