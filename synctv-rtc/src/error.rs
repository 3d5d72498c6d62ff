use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Bad handle or malformed argument.
    #[error("Invalid: {0}")]
    Invalid(String),

    /// Generic failure reported by the transport engine.
    #[error("Transport failure: {0}")]
    Failure(String),

    #[error("Element not available: {0}")]
    ElementNotAvailable(String),

    /// The buffer handed to a sized read was smaller than the value it had to hold.
    #[error("Buffer too small: {required} bytes required")]
    BufferTooSmall { required: usize },

    #[error("Dynamic payload type range exhausted")]
    Exhausted,

    #[error("Timed out waiting for value")]
    TimedOut,

    #[error("Value reached a rejected state")]
    WrongValue,
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn failure(msg: impl Into<String>) -> Self {
        Self::Failure(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
