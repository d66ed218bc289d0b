use std::io;

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("address already in use")]
    AddressInUse,

    #[error("address not available")]
    AddressNotAvailable,

    #[error("AIO invariant violation: {0}")]
    AioInvariantViolation(String),

    #[error("zero-copy completion invariant violation: {0}")]
    ZeroCopyInvariantViolation(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl TransportError {
    /// Map a raw bind(2) errno into the named variants spec.md calls out;
    /// anything else passes through as a plain I/O error.
    pub fn from_bind_errno(errno: i32) -> Self {
        match errno {
            libc::EADDRINUSE => TransportError::AddressInUse,
            libc::EADDRNOTAVAIL => TransportError::AddressNotAvailable,
            _ => TransportError::Io(io::Error::from_raw_os_error(errno)),
        }
    }
}
