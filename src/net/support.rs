use std::io;

/// Fatal error classes on a socket channel. Anything fatal transitions the
/// channel to CLOSING; the owner observes a CLOSE event afterwards.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorType {
    Io,
    WriteZero,
    QueueOverflow,
    Closed,
    AddrInvalid,
}

/// Two-level error: `Wait` means "no progress, retry on next readiness",
/// `Fatal` means the channel is done for.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

pub type NetworkResult<T> = Result<T, NetworkError>;

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(err: io::Error) -> NetworkError {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => NetworkError::Wait,
            io::ErrorKind::WriteZero => NetworkError::Fatal(ErrorType::WriteZero),
            _ => NetworkError::Fatal(ErrorType::Io),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    /// True only for fatal outcomes; `Wait` is normal back-pressure.
    #[inline]
    fn has_failed(&self) -> bool {
        match self {
            Err(NetworkError::Fatal(_)) => true,
            _ => false,
        }
    }
}
