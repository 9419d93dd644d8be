//! Error types shared across CoachPay crates

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Date arithmetic out of range: {0}")]
    DateOutOfRange(String),
}
