//! Error taxonomy.

use thiserror::Error;

use crate::message::RemoteError;

/// Errors surfaced to callers and handler authors.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum RpcError {
    /// The remote handler failed; carries its message and optional stack.
    #[error("(remote) {}", .0.message)]
    Remote(RemoteError),
    /// The local endpoint was destroyed while the channel was still open.
    #[error("communicator destroyed")]
    Destroyed,
    /// No handler is registered under the requested name.
    #[error("unknown method `{0}`")]
    UnknownMethod(String),
    /// The underlying transport failed or went away.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl RpcError {
    /// The bare failure message, without the remote-origin marker.
    pub fn message(&self) -> String {
        match self {
            RpcError::Remote(e) => e.message.clone(),
            other => other.to_string(),
        }
    }

    /// Stack information supplied by the remote side, if any.
    pub fn remote_stack(&self) -> Option<&str> {
        match self {
            RpcError::Remote(e) => e.stack.as_deref(),
            _ => None,
        }
    }

    /// Reduce to the wire representation.
    pub fn to_remote(&self) -> RemoteError {
        match self {
            RpcError::Remote(e) => e.clone(),
            other => RemoteError::new(other.to_string()),
        }
    }
}

impl From<RemoteError> for RpcError {
    fn from(e: RemoteError) -> Self {
        RpcError::Remote(e)
    }
}

/// Errors produced by transport implementations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer went away or the transport was closed locally.
    #[error("transport closed")]
    Closed,
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    /// A frame exceeded the configured size limit.
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
}

/// Errors from building a [`crate::ServiceRegistry`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("method `{0}` is already registered")]
    DuplicateMethod(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_carry_origin_marker() {
        let err = RpcError::Remote(RemoteError::new("boom"));
        assert_eq!(err.to_string(), "(remote) boom");
        assert_eq!(err.message(), "boom");
    }

    #[test]
    fn local_errors_have_no_marker() {
        assert_eq!(RpcError::Destroyed.to_string(), "communicator destroyed");
        assert_eq!(RpcError::Destroyed.message(), "communicator destroyed");
    }

    #[test]
    fn reduction_preserves_stack() {
        let err = RpcError::Remote(RemoteError::with_stack("boom", "frame 0"));
        assert_eq!(err.remote_stack(), Some("frame 0"));
        assert_eq!(err.to_remote().stack.as_deref(), Some("frame 0"));
    }

    #[test]
    fn local_error_reduces_to_its_display() {
        let wire = RpcError::UnknownMethod("frob".into()).to_remote();
        assert_eq!(wire.message, "unknown method `frob`");
        assert_eq!(wire.stack, None);
    }
}
