#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate for talking to vehicles over ELM327 compatible OBD2 adapters
//!
//! The ELM327 (and its countless clones) exposes the vehicle's diagnostic bus
//! through a plain text serial interface. This crate drives that interface end
//! to end:
//!
//! * [connection] brings the adapter up (reset, echo off, headers on), lets it
//!   negotiate a bus protocol with the vehicle, and serializes every
//!   request/response exchange behind one lock.
//! * [protocol] classifies the negotiated protocol and turns the adapter's raw
//!   response lines into per-ECU messages, including reassembly of multi frame
//!   responses on the CAN variants.
//! * [obd2] holds the table of service 01 commands and decodes response
//!   payloads into typed values with units.
//! * [channel] is the byte level seam an adapter implementation has to
//!   satisfy. With the default `serial` feature, [hardware] provides one on
//!   top of a local serial port.
//!
//! ## Protocol support
//!
//! ISO 9141-2, ISO 14230-4 (KWP2000, slow and fast init) and ISO 15765-4
//! (CAN with 11 bit or 29 bit identifiers). SAE J1850 buses are reported as
//! unsupported rather than misparsed.
//!
//! ## Example
//!
//! ```no_run
//! use elm327_diagnostics::connection::{ConnectionOptions, Elm327Connection};
//!
//! let connection = Elm327Connection::new(ConnectionOptions {
//!     port: Some("/dev/ttyUSB0".into()),
//!     ..Default::default()
//! });
//! connection.connect()?;
//! for reading in connection.query_by_name("EngineSpeed")? {
//!     println!("{}: {}", reading.ecu, reading.value);
//! }
//! connection.close();
//! # Ok::<(), elm327_diagnostics::DiagError>(())
//! ```

use channel::ChannelError;

pub mod channel;
pub mod connection;
#[cfg(feature = "serial")]
pub mod hardware;
pub mod obd2;
pub mod protocol;

/// Diagnostic operation result
pub type DiagResult<T> = Result<T, DiagError>;

#[derive(Clone, Debug, thiserror::Error)]
/// Diagnostic operation error
pub enum DiagError {
    /// No serial device answered the adapter handshake
    #[error("no ELM327 adapter was found on any serial port")]
    NoAdapterFound,
    /// The operation needs an open connection
    #[error("connection is not open")]
    NotConnected,
    /// An adapter configuration command was not acknowledged
    #[error("adapter rejected '{cmd}', reply was {response:?}")]
    HandshakeRejected {
        /// The AT command that was refused
        cmd: &'static str,
        /// What the adapter answered instead of an acknowledgement
        response: String,
    },
    /// The adapter answered but the vehicle did not
    #[error("adapter responded but the vehicle is not reachable")]
    VehicleUnreachable,
    /// The adapter reported a protocol outside the supported set
    #[error("adapter protocol id {0:?} is not supported")]
    UnsupportedProtocol(String),
    /// No bus protocol has been classified for this connection yet
    #[error("no OBD protocol has been classified yet")]
    UnknownProtocol,
    /// Response empty
    #[error("ECU did not respond to the request")]
    EmptyResponse,
    /// Registry lookup for an unknown command name
    #[error("unknown OBD command {0:?}")]
    CommandNotFound(String),
    /// ECU responded with a message, but the length was incorrect
    #[error("ECU response size was not the correct length. Want {want}, got {got}")]
    InvalidResponseLength {
        /// Byte count the command's contract declares
        want: usize,
        /// Byte count the ECU actually sent
        got: usize,
    },
    /// Error with the underlying communication channel
    #[error("communication channel error")]
    Channel(
        #[from]
        #[source]
        ChannelError,
    ),
}
