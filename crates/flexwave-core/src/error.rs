//! Error types for flexwave.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport-layer, wire-protocol, and
//! user-contract errors are all captured here.

/// The error type for all flexwave operations.
///
/// Variants cover the failure modes encountered when hosting a waveform
/// against a radio: transport failures on the control and data channels,
/// malformed protocol frames, timeouts, and caller contract violations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (TCP control channel, UDP data channel).
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error (malformed control line, bad status field).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A VITA-49 packet whose declared length disagrees with the bytes
    /// actually received.
    #[error("invalid VITA length: declared {declared} bytes, received {actual}")]
    InvalidLength { declared: usize, actual: usize },

    /// A VITA-49 packet whose class OUI is not the radio vendor's.
    #[error("invalid VITA OUI: 0x{0:06X}")]
    InvalidOui(u32),

    /// A VITA-49 packet whose information class is not the radio's.
    #[error("invalid VITA class: 0x{0:04X}")]
    InvalidClass(u16),

    /// Timed out waiting for the radio.
    #[error("timeout waiting for radio")]
    Timeout,

    /// An invalid parameter was passed by the caller (out-of-range meter
    /// value, duplicate meter name, unknown meter, bad short name).
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A payload exceeds what fits in a single wire packet. Nothing is
    /// sent when this is returned.
    #[error("payload too big: {actual} exceeds limit of {limit}")]
    TooBig { limit: usize, actual: usize },

    /// No connection to the radio has been established, or the waveform's
    /// data plane is not active.
    #[error("not connected")]
    NotConnected,

    /// The connection to the radio was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
