//! Error types for the kvdirect engine.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the client engine.
///
/// Every error is reported to the immediate caller of the failing operation;
/// nothing is retried automatically. A session generally remains usable after
/// a `Send`/`Rpc`/`Write` failure, except where an `Rpc` failure leaves a
/// receive slot unarmed (see [`crate::channel::MessageChannel::recv`]).
#[derive(Debug, Error)]
pub enum Error {
    /// The remote endpoint address/port could not be resolved.
    #[error("failed to resolve {addr}:{port}: {reason}")]
    Resolution {
        addr: String,
        port: u16,
        reason: String,
    },

    /// Memory region registration failed. Fatal to session startup.
    #[error("memory region registration failed: {0}")]
    Registration(String),

    /// Endpoint creation or connection handshake failed. Fatal to the session.
    #[error("connect failed: {0}")]
    Connect(String),

    /// A send could not be posted, or its completion reported a non-success
    /// status.
    #[error("send failed: {0}")]
    Send(String),

    /// The response violated the wire protocol, signaling a desynchronization.
    #[error("rpc protocol violation: {0}")]
    Rpc(String),

    /// A one-sided write could not be posted, or its completion reported a
    /// non-success status. No remote-side error information is available.
    #[error("one-sided write failed: {0}")]
    Write(String),

    /// A completion wait exceeded the configured poll timeout.
    #[error("timed out after {0:?} waiting for a completion")]
    Timeout(Duration),

    /// A fast-path write was attempted before the remote database descriptor
    /// was exchanged.
    #[error("session is not ready: remote database descriptor not yet exchanged")]
    NotReady,
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
