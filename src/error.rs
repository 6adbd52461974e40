//! Error taxonomy shared by every layer.
//!
//! | Class | Variants | Connection usable afterwards? |
//! |-------|----------|-------------------------------|
//! | transport | `Transport` | no |
//! | protocol | `InvalidSignature`, `Protocol`, `Unverified` | no |
//! | authorization | `Unauthorized` | no (stream closed) |
//! | capacity | `MessageTooLarge` | yes |
//! | liveness / state | `NotLive`, `EpochBusy` | n/a |

use std::io;

use crate::identity::Identity;

#[derive(Debug)]
pub enum Error {
    /// Underlying I/O failure, including short reads and writes.
    Transport(io::Error),
    /// A frame's signature did not verify against the remote identity.
    InvalidSignature,
    /// The peer sent bytes that break the framing rules.
    Protocol(&'static str),
    /// The handshake could not authenticate the peer. Carries no detail.
    Unverified,
    /// The connection validator declined the claimed identity.
    Unauthorized(Identity),
    /// Payload plus signature would exceed the maximum frame length.
    MessageTooLarge { size: u64, max: u64 },
    /// The component is dead, shut down, or its actor has exited.
    NotLive,
    /// Another reader is already waiting on this epoch.
    EpochBusy(u64),
}

impl Error {
    /// Whether the connection that produced this error must be discarded.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::MessageTooLarge { .. } | Error::EpochBusy(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::InvalidSignature | Error::Protocol(_) | Error::Unverified
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "transport error: {}", e),
            Error::InvalidSignature => write!(f, "frame signature verification failed"),
            Error::Protocol(what) => write!(f, "protocol violation: {}", what),
            Error::Unverified => write!(f, "could not verify communication"),
            Error::Unauthorized(identity) => {
                write!(f, "peer {} is not authorized", identity.short())
            }
            Error::MessageTooLarge { size, max } => {
                write!(f, "message of {} signed bytes exceeds maximum {}", size, max)
            }
            Error::NotLive => write!(f, "connection is not live"),
            Error::EpochBusy(epoch) => write!(f, "epoch {} already has a waiting reader", epoch),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Transport(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_errors_leave_connection_usable() {
        let err = Error::MessageTooLarge { size: 10, max: 5 };
        assert!(!err.is_fatal());
        assert!(!err.is_protocol());
    }

    #[test]
    fn handshake_failure_has_generic_message() {
        assert_eq!(Error::Unverified.to_string(), "could not verify communication");
        assert!(Error::Unverified.is_protocol());
    }

    #[test]
    fn io_errors_map_to_transport() {
        let err: Error = io::Error::new(io::ErrorKind::UnexpectedEof, "short").into();
        assert!(err.is_transport());
        assert!(err.is_fatal());
        assert!(std::error::Error::source(&err).is_some());
    }
}
