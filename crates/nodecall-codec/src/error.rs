/// Errors that can occur while encoding or decoding values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The input ended before the value was complete.
    #[error("truncated input (needed {needed} bytes, {remaining} remaining)")]
    Truncated { needed: usize, remaining: usize },

    /// A length prefix was negative.
    #[error("negative length prefix {0}")]
    NegativeLength(i32),

    /// A length does not fit the signed 32-bit prefix.
    #[error("length {0} does not fit the 32-bit length prefix")]
    LengthOverflow(usize),

    /// String bytes are not valid UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    /// A bool byte other than 0 or 1.
    #[error("invalid bool byte {0:#04x}")]
    InvalidBool(u8),

    /// A u32 that is not a Unicode scalar value.
    #[error("invalid char scalar {0:#x}")]
    InvalidChar(u32),

    /// An option tag other than 0 or 1.
    #[error("invalid option tag {0:#04x}")]
    InvalidOptionTag(u8),

    /// A decoded integer does not fit the platform-sized target.
    #[error("value {0} does not fit the target integer type")]
    IntegerOverflow(u64),
}

pub type Result<T> = std::result::Result<T, CodecError>;
