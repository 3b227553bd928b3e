use std::fmt::{self, Display};

/// Errors produced by model parsing and validation routines.
#[derive(Debug)]
pub enum ModelError {
    /// A textual label did not name a known variant.
    UnknownVariant { kind: &'static str, value: String },
    /// An opaque payload did not have the expected JSON object shape.
    InvalidPayload(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::UnknownVariant { kind, value } => {
                write!(f, "unknown {kind}: {value}")
            }
            ModelError::InvalidPayload(msg) => {
                write!(f, "invalid payload: {msg}")
            }
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
