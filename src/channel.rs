//! Module for the byte level seam between the protocol engine and an adapter
//!
//! [ElmChannel] is the only interface the connection logic talks to. The
//! `serial` feature ships an implementation over a local serial port in
//! [crate::hardware]; tests substitute a scripted channel.

use std::sync::Arc;

/// Communication channel result
pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug, Clone, thiserror::Error)]
/// Error produced by a communication channel
pub enum ChannelError {
    /// Underlying IO error with the channel
    #[error("IO error")]
    IOError(
        #[from]
        #[source]
        Arc<std::io::Error>,
    ),
    /// Timeout when reading from the channel
    #[error("timeout reading from channel")]
    ReadTimeout,
    /// Timeout when writing to the channel
    #[error("timeout writing to channel")]
    WriteTimeout,
    /// The interface is not open
    #[error("channel's interface is not open")]
    InterfaceNotOpen,
    /// A lock guarding the channel was poisoned by a panicking holder
    #[error("channel lock was poisoned")]
    LockPoisoned,
    /// Error reported by the serial port API
    #[error("serial API error: {0}")]
    APIError(String),
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        Self::IOError(Arc::new(err))
    }
}

impl<T> From<std::sync::PoisonError<T>> for ChannelError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::LockPoisoned
    }
}

/// Byte level interface to an ELM327 style adapter.
///
/// The protocol engine only ever needs three things from an adapter: write a
/// complete command line, pull bytes back one at a time until it sees the
/// prompt terminator, and throw away stale input. Implementations are free to
/// buffer however they like as long as those hold.
pub trait ElmChannel: Send + Sync {
    /// Opens the interface. Opening an already open channel is a no-op
    fn open(&mut self) -> ChannelResult<()>;

    /// Closes the interface. Closing an already closed channel is a no-op
    fn close(&mut self) -> ChannelResult<()>;

    /// Writes a complete, already terminated command to the adapter
    ///
    /// ## Parameters
    /// * buffer - The bytes to write
    /// * timeout_ms - Timeout for the write to complete
    fn write_bytes(&mut self, buffer: &[u8], timeout_ms: u32) -> ChannelResult<()>;

    /// Reads a single byte from the adapter, waiting up to `timeout_ms`.
    /// Returns [ChannelError::ReadTimeout] if nothing arrived in time
    fn read_byte(&mut self, timeout_ms: u32) -> ChannelResult<u8>;

    /// Tells the channel to clear its Rx buffer
    fn clear_rx_buffer(&mut self) -> ChannelResult<()>;
}
