//! Error types for raillib.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport-layer, protocol-layer,
//! store-layer and application-layer errors are all captured here.

/// The error type for all raillib operations.
///
/// Variants cover the failure modes encountered when talking to a command
/// station: physical transport failures, malformed protocol frames,
/// timeouts, rejected commands, and persisted-store failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (TCP socket, serial line).
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error (malformed frame, missing header, bad object id).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Timed out waiting for a reply from the command station.
    #[error("timeout waiting for response")]
    Timeout,

    /// The command station answered our own request with a non-zero
    /// status code.
    ///
    /// `code` is the numeric value of the `<END code (label)>` trailer and
    /// `reason` the label text.
    #[error("command rejected ({code}): {reason}")]
    CommandRejected {
        /// Numeric error code reported by the station.
        code: u32,
        /// Human-readable label reported by the station.
        reason: String,
    },

    /// The object id is not known to the command station or lies outside
    /// every reserved id range.
    #[error("unknown object: {0}")]
    UnknownObject(u32),

    /// The requested operation is not supported by this command station.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// An invalid parameter was passed to a command.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The persisted entity store failed.
    #[error("store error: {0}")]
    Store(String),

    /// No connection to the command station has been established.
    #[error("not connected")]
    NotConnected,

    /// The connection to the command station was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
