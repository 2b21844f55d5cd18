/// Failure kinds reported by the trace driver.
///
/// Every request either succeeds or maps to exactly one of these. None of
/// them is fatal to the host.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum TraceError {
    #[error("invalid arguments")]
    InvalidArgs,
    #[error("operation not permitted in the current state")]
    BadState,
    #[error("not supported by this processor or driver")]
    NotSupported,
    #[error("no free trace slot")]
    NoResources,
    #[error("out of memory")]
    NoMemory,
    #[error("reply buffer too small")]
    BufferTooSmall,
    #[error("internal error")]
    Internal,
    #[error("device is already open")]
    AlreadyBound,
    /// The hardware trace resource could not be released. The session can no
    /// longer be used.
    #[error("trace resources could not be released; device is defunct")]
    Defunct,
}

impl TraceError {
    /// Status code returned on the request surface. Success is `0`.
    #[must_use]
    pub const fn status(self) -> i32 {
        match self {
            Self::Internal => -1,
            Self::NotSupported => -2,
            Self::NoResources => -3,
            Self::NoMemory => -4,
            Self::InvalidArgs => -10,
            Self::BufferTooSmall => -15,
            Self::BadState => -20,
            Self::AlreadyBound => -27,
            Self::Defunct => -28,
        }
    }

    /// Collapse a request outcome into its status code.
    #[must_use]
    pub fn status_of<T>(result: &Result<T, Self>) -> i32 {
        result.as_ref().map_or_else(|e| e.status(), |_| 0)
    }
}
