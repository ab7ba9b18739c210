//! Error types.
use crate::state::{ConnectionState, Event};
use thiserror::Error;

/// A frame that does not hold a valid segment.
#[derive(Debug, Error)]
pub enum MalformedSegment {
    /// Shorter than the segment header.
    #[error("truncated segment header ({0} bytes)")]
    Truncated(usize),
    /// Reserved byte is not zero.
    #[error("reserved byte is {0:#04x}")]
    Reserved(u8),
    /// Flag byte has undefined bits.
    #[error("undefined flag bits in {0:#04x}")]
    Flags(u8),
    /// Port above `PORT_LIMIT`.
    #[error("port {0} exceeds the port limit")]
    Port(u8),
    /// Payload above `MAX_PAYLOAD`.
    #[error("payload of {0} bytes does not fit a frame")]
    TooLong(usize),
    /// The link frame itself is invalid.
    #[error("invalid frame: {0}")]
    Frame(#[from] std::io::Error),
}

/// Transport error.
#[derive(Debug, Error)]
pub enum Error {
    /// Codec error.
    #[error(transparent)]
    Malformed(#[from] MalformedSegment),
    /// Network event that is illegal in the connection's state.
    #[error("protocol error: {event:?} in state {state:?}")]
    Protocol {
        /// State of the connection.
        state: ConnectionState,
        /// Offending event.
        event: Event,
    },
    /// Both ends opened the connection at the same time.
    #[error("protocol deadlock: simultaneous open")]
    Deadlock,
    /// Application call that is invalid in the connection's state.
    #[error("syscall failed: {0}")]
    FailSyscall(&'static str),
    /// Every local port is in use.
    #[error("out of local ports")]
    NoFreePort,
    /// The handshake did not complete in time.
    #[error("connect timed out")]
    TimedOut,
    /// Link I/O error.
    #[error("link error: {0}")]
    Link(#[from] std::io::Error),
    /// The transport was shut down.
    #[error("transport shut down")]
    Shutdown,
}

/// Result type of the transport.
pub type Result<T> = std::result::Result<T, Error>;
