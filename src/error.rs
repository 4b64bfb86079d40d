//! Error classification shared by every module.
//!
//! Each module keeps its own error enum; `ErrorKind` is the coarse bucket the
//! HTTP boundary uses to pick a status code and decide whether the caller
//! earns a strike.

/// Coarse error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Channel, peer or note absent. Terminal for the call.
    NotFound,
    /// Channel already fully occupied. Terminal for the call.
    Conflict,
    /// Identifier generation retries exhausted.
    ResourceExhausted,
    /// Missing or invalid request fields. Always earns a strike.
    Malformed,
    /// Wrong credential for an existing resource. Always earns a strike.
    Unauthorized,
    /// Receiver not ready; retried internally until the caller's deadline.
    Transient,
    /// Storage or I/O failure inside the relay.
    Internal,
}

impl ErrorKind {
    /// Whether a failure of this kind counts as an abuse signal on its own.
    /// Server faults strike through their 5xx status at the gate instead.
    pub fn strikes(self) -> bool {
        matches!(
            self,
            ErrorKind::NotFound | ErrorKind::Malformed | ErrorKind::Unauthorized
        )
    }
}
