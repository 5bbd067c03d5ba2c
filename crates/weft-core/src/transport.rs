//! Transport contract.
//!
//! A transport carries whole [`Envelope`]s, in order, exactly once, between
//! two peers. Endpoints own one transport each and drive it from a single
//! writer task and a single reader task, so implementations only need to be
//! safe for one concurrent `send` and one concurrent `recv`.

use std::future::Future;

use crate::error::TransportError;
use crate::message::Envelope;

#[cfg(feature = "mem")]
pub mod mem;
#[cfg(feature = "proc")]
pub mod proc;
#[cfg(feature = "stream")]
pub mod stream;

#[cfg(feature = "mem")]
pub use mem::MemTransport;
#[cfg(feature = "proc")]
pub use proc::ProcTransport;
#[cfg(feature = "stream")]
pub use stream::StreamTransport;

/// A bidirectional, ordered, message-oriented link to one peer.
pub trait Transport: Send + Sync + 'static {
    /// Deliver one envelope to the peer.
    fn send(&self, envelope: Envelope) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next envelope from the peer.
    ///
    /// Resolves to [`TransportError::Closed`] once the peer is gone and all
    /// buffered envelopes have been drained.
    fn recv(&self) -> impl Future<Output = Result<Envelope, TransportError>> + Send;

    /// Tear the link down. Idempotent; pending and future operations fail
    /// with [`TransportError::Closed`].
    fn close(&self);

    fn is_closed(&self) -> bool;
}
