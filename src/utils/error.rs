// src/utils/error.rs

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BinaryError {
    #[error("read past end of stream: need {needed} bits, have {available}")]
    ReadOverflow { needed: usize, available: usize },

    #[error("value {value} outside range {min}..={max}")]
    ValueOutOfRange { value: u64, min: u64, max: u64 },

    #[error("string length {length} exceeds maximum {max}")]
    StringTooLong { length: usize, max: usize },

    #[error("string is not valid utf-8")]
    InvalidString,

    #[error("unknown address type {0}")]
    BadAddressType(u8),
}

pub type Result<T> = std::result::Result<T, BinaryError>;
