//! The adapter connection and its lifecycle
//!
//! [Elm327Connection] owns the channel to the adapter and drives the whole
//! session: the configuration handshake, protocol negotiation with the
//! vehicle, and every request afterwards. All methods take `&self` and
//! serialize on an internal lock, so concurrent callers can share one
//! connection without interleaving bytes on the wire.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, error, warn};

use crate::channel::{ChannelError, ElmChannel};
use crate::obd2::{self, ObdCommand, ObdReading};
use crate::protocol::{decode_lines, EcuMap, EcuMessage, ObdProtocol};
use crate::{DiagError, DiagResult};

/// Prompt byte the adapter prints once it is ready for the next command
const PROMPT: u8 = b'>';
/// Read timeouts tolerated in one receive loop before giving up on the prompt
const READ_ATTEMPTS: u32 = 2;
/// The adapter needs about a second after a reset before it listens again
const RESET_SETTLE: Duration = Duration::from_millis(1000);
/// The first vehicle query can trigger a protocol search, including the 5
/// baud K-line init
const SEARCH_SETTLE: Duration = Duration::from_millis(1000);
/// Extra wait for registry commands not flagged as fast
const SLOW_QUERY_SETTLE: Duration = Duration::from_millis(100);

/// Lifecycle state of a connection
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, strum_macros::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// No channel is open
    #[default]
    #[strum(to_string = "not connected")]
    NotConnected,
    /// The adapter accepted its configuration, but no vehicle has
    /// answered yet
    #[strum(to_string = "adapter connected")]
    AdapterConnected,
    /// Vehicle ECUs answered the broadcast probe. Queries are usable
    #[strum(to_string = "vehicle connected")]
    VehicleConnected,
}

/// Settings a connection is created with
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionOptions {
    /// Serial port to use. `None` tries every enumerated port in turn
    pub port: Option<String>,
    /// Baud rate of the adapter's serial side
    pub baud: u32,
    /// Read and write timeout for the channel in milliseconds
    pub timeout_ms: u32,
    /// Bus protocol to force during the handshake. [ObdProtocol::Unknown]
    /// lets the adapter search on its own
    pub protocol: ObdProtocol,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            port: None,
            baud: 38400,
            timeout_ms: 500,
            protocol: ObdProtocol::Unknown,
        }
    }
}

struct ConnectionInner {
    options: ConnectionOptions,
    channel: Option<Box<dyn ElmChannel>>,
    // Caller supplied channels survive close_channel so a later connect
    // can reuse them. Scanned ports are dropped and rescanned instead
    caller_channel: bool,
    state: ConnectionState,
    protocol: ObdProtocol,
    ecu_map: EcuMap,
    ident: Option<String>,
}

/// Synchronous connection to a vehicle through an ELM327 adapter
pub struct Elm327Connection {
    inner: Mutex<ConnectionInner>,
}

impl Elm327Connection {
    fn from_parts(channel: Option<Box<dyn ElmChannel>>, options: ConnectionOptions) -> Self {
        Self {
            inner: Mutex::new(ConnectionInner {
                caller_channel: channel.is_some(),
                options,
                channel,
                state: ConnectionState::NotConnected,
                protocol: ObdProtocol::Unknown,
                ecu_map: EcuMap::default(),
                ident: None,
            }),
        }
    }

    /// Creates a connection that will open a local serial port during
    /// [Elm327Connection::connect]
    #[cfg(feature = "serial")]
    pub fn new(options: ConnectionOptions) -> Self {
        Self::from_parts(None, options)
    }

    /// Creates a connection over a caller supplied channel.
    ///
    /// [ConnectionOptions::port] and [ConnectionOptions::baud] are unused
    /// in this mode. The channel stays with the connection for its whole
    /// life: [Elm327Connection::close] closes it but keeps the handle, so
    /// a later [Elm327Connection::connect] reopens the same channel
    pub fn with_channel<C: ElmChannel + 'static>(channel: C, options: ConnectionOptions) -> Self {
        Self::from_parts(Some(Box::new(channel)), options)
    }

    fn lock(&self) -> DiagResult<MutexGuard<'_, ConnectionInner>> {
        self.inner
            .lock()
            .map_err(|_| DiagError::Channel(ChannelError::LockPoisoned))
    }

    fn snapshot<T>(&self, read: impl FnOnce(&ConnectionInner) -> T) -> T {
        match self.inner.lock() {
            Ok(guard) => read(&guard),
            Err(poisoned) => read(&poisoned.into_inner()),
        }
    }

    /// Brings the adapter up and lets it negotiate a bus protocol with the
    /// vehicle.
    ///
    /// The handshake resets the adapter, disables command echo and
    /// linefeeds, enables headers, selects or searches for a protocol and
    /// probes the vehicle with the universal supported-PIDs query. ECUs
    /// that answer the probe become the connection's [EcuMap].
    ///
    /// On success the state is [ConnectionState::VehicleConnected] and the
    /// call is a no-op while it stays there. When the adapter is fine but
    /// the vehicle does not answer, the channel stays open at
    /// [ConnectionState::AdapterConnected] so a retry with a different
    /// [ConnectionOptions::protocol] does not have to rescan ports
    pub fn connect(&self) -> DiagResult<()> {
        let mut inner = self.lock()?;
        if inner.state == ConnectionState::VehicleConnected {
            debug!("connect() called on a live connection");
            return Ok(());
        }
        if inner.channel.is_some() {
            inner.attempt()
        } else {
            Self::scan_and_attempt(&mut inner)
        }
    }

    #[cfg(feature = "serial")]
    fn scan_and_attempt(inner: &mut ConnectionInner) -> DiagResult<()> {
        let candidates = match &inner.options.port {
            Some(port) => vec![port.clone()],
            None => crate::hardware::list_ports()?,
        };
        if candidates.is_empty() {
            return Err(DiagError::NoAdapterFound);
        }
        let mut last_err = DiagError::NoAdapterFound;
        for name in candidates {
            debug!("Trying adapter on {name:?}");
            inner.channel = Some(Box::new(crate::hardware::SerialElmChannel::new(
                &name,
                inner.options.baud,
                inner.options.timeout_ms,
            )));
            match inner.attempt() {
                Ok(()) => return Ok(()),
                Err(e) if inner.state == ConnectionState::AdapterConnected => {
                    // A real adapter answered on this port. Keep it open so
                    // a retry with another protocol can reuse it
                    return Err(e);
                }
                Err(e) => {
                    inner.channel = None;
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    #[cfg(not(feature = "serial"))]
    fn scan_and_attempt(_inner: &mut ConnectionInner) -> DiagResult<()> {
        Err(DiagError::NoAdapterFound)
    }

    /// Sends one raw command line and returns the cleaned response lines.
    ///
    /// `settle` inserts a wait between write and read for commands whose
    /// processing time exceeds the channel timeout, like resets. Usable
    /// from [ConnectionState::AdapterConnected] onwards, which makes this
    /// the escape hatch for AT commands the crate does not wrap
    pub fn send(&self, cmd: &str, settle: Option<Duration>) -> DiagResult<Vec<String>> {
        let mut inner = self.lock()?;
        if inner.state == ConnectionState::NotConnected {
            debug!("send({cmd:?}) with no open connection");
            return Err(DiagError::NotConnected);
        }
        inner.run_exchange(cmd, settle)
    }

    /// Sends a vehicle request and decodes the response through the active
    /// protocol into one message per responding ECU.
    ///
    /// Refused in [ConnectionState::NotConnected] without touching the
    /// channel
    pub fn send_and_parse(&self, cmd: &str) -> DiagResult<Vec<EcuMessage>> {
        let mut inner = self.lock()?;
        if inner.state == ConnectionState::NotConnected {
            debug!("send_and_parse({cmd:?}) with no open connection");
            return Err(DiagError::NotConnected);
        }
        let lines = inner.run_exchange(cmd, None)?;
        decode_lines(inner.protocol, &lines)
    }

    /// Runs a registry command end to end: request, decode, unit
    /// conversion. Returns one reading per ECU the command applies to
    pub fn query(&self, command: &ObdCommand) -> DiagResult<Vec<ObdReading>> {
        let mut inner = self.lock()?;
        if inner.state == ConnectionState::NotConnected {
            debug!("query({}) with no open connection", command.name());
            return Err(DiagError::NotConnected);
        }
        let settle = if command.is_fast() {
            None
        } else {
            Some(SLOW_QUERY_SETTLE)
        };
        let lines = inner.run_exchange(command.request(), settle)?;
        let messages = decode_lines(inner.protocol, &lines)?;
        command.decode(&messages)
    }

    /// Looks a command up in the registry by name and runs it
    pub fn query_by_name(&self, name: &str) -> DiagResult<Vec<ObdReading>> {
        self.query(obd2::resolve(name)?)
    }

    /// Queries the mode 01 support bitmask and expands it into the PID
    /// numbers the first responding ECU reports as implemented
    pub fn supported_pids(&self) -> DiagResult<Vec<u8>> {
        let messages = self.send_and_parse("0100")?;
        let first = messages.first().ok_or(DiagError::EmptyResponse)?;
        Ok(obd2::decode_pid_support(0x01, first.data()))
    }

    /// Resets the adapter, closes the channel and clears all connection
    /// state. Never fails; closing a closed connection does nothing.
    ///
    /// A caller supplied channel is kept for a later
    /// [Elm327Connection::connect]; a scanned serial port is dropped, so
    /// reconnecting runs the port scan again
    pub fn close(&self) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.close_channel();
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.snapshot(|inner| inner.state)
    }

    /// Protocol classified during the last successful handshake
    pub fn protocol(&self) -> ObdProtocol {
        self.snapshot(|inner| inner.protocol)
    }

    /// ECU map built during the last successful handshake
    pub fn ecu_map(&self) -> EcuMap {
        self.snapshot(|inner| inner.ecu_map.clone())
    }

    /// Identification string the adapter printed on reset, for example
    /// `ELM327 v1.5`
    pub fn adapter_ident(&self) -> Option<String> {
        self.snapshot(|inner| inner.ident.clone())
    }
}

impl ConnectionInner {
    /// One full connect attempt over the current channel
    fn attempt(&mut self) -> DiagResult<()> {
        self.state = ConnectionState::NotConnected;
        self.protocol = ObdProtocol::Unknown;
        self.ecu_map = EcuMap::default();
        match self.handshake() {
            Ok(()) => Ok(()),
            Err(e) => {
                // Transport faults and configuration rejections take the
                // channel down. An adapter whose vehicle side failed stays
                // open at AdapterConnected
                if matches!(e, DiagError::Channel(_) | DiagError::HandshakeRejected { .. })
                    || self.state == ConnectionState::NotConnected
                {
                    self.close_channel();
                }
                Err(e)
            }
        }
    }

    fn handshake(&mut self) -> DiagResult<()> {
        if let Some(channel) = self.channel.as_mut() {
            channel.open()?;
        }

        let reply = self.exchange("ATZ", Some(RESET_SETTLE))?;
        // With echo still on the reset reply repeats the command before the
        // identification line
        self.ident = reply
            .into_iter()
            .rev()
            .find(|line| !line.eq_ignore_ascii_case("ATZ"));
        debug!("Adapter identification: {:?}", self.ident);

        let reply = self.exchange("ATE0", None)?;
        if !reply.iter().any(|line| line.contains("OK")) {
            return Err(DiagError::HandshakeRejected {
                cmd: "ATE0",
                response: reply.join(" "),
            });
        }
        let reply = self.exchange("ATH1", None)?;
        if reply != ["OK"] {
            return Err(DiagError::HandshakeRejected {
                cmd: "ATH1",
                response: reply.join(" "),
            });
        }
        let reply = self.exchange("ATL0", None)?;
        if reply != ["OK"] {
            return Err(DiagError::HandshakeRejected {
                cmd: "ATL0",
                response: reply.join(" "),
            });
        }
        self.state = ConnectionState::AdapterConnected;

        let select = match self.options.protocol.elm_id() {
            Some(id) => format!("ATSP{id}"),
            None => String::from("ATSP0"),
        };
        let reply = self.exchange(&select, None)?;
        if reply != ["OK"] {
            return Err(DiagError::HandshakeRejected {
                cmd: "ATSP",
                response: reply.join(" "),
            });
        }

        let mut lines = self.exchange("0100", Some(SEARCH_SETTLE))?;
        if lines
            .iter()
            .any(|line| line.contains("UNABLE TO CONNECT") || line.contains("NO DATA"))
        {
            warn!("Adapter is up but the vehicle did not answer: {lines:?}");
            return Err(DiagError::VehicleUnreachable);
        }
        lines.retain(|line| !line.contains("SEARCHING"));

        let reply = self.exchange("ATDPN", None)?;
        let id = reply.first().cloned().unwrap_or_default();
        let protocol = ObdProtocol::from_adapter_id(&id);
        if protocol == ObdProtocol::Unknown {
            return Err(DiagError::UnsupportedProtocol(id));
        }

        let messages = decode_lines(protocol, &lines)?;
        if messages.is_empty() {
            warn!("Probe produced no decodable response: {lines:?}");
            return Err(DiagError::VehicleUnreachable);
        }
        self.ecu_map = EcuMap::from_messages(&messages);
        self.protocol = protocol;
        self.state = ConnectionState::VehicleConnected;
        debug!(
            "Vehicle connected over {protocol}, {} ECU(s) responding",
            self.ecu_map.len()
        );
        Ok(())
    }

    /// [ConnectionInner::exchange], plus teardown when the transport itself
    /// failed. Used by everything after the handshake
    fn run_exchange(&mut self, cmd: &str, settle: Option<Duration>) -> DiagResult<Vec<String>> {
        let result = self.exchange(cmd, settle);
        if let Err(e) = &result {
            if matches!(e, DiagError::Channel(_)) {
                error!("Transport failure, closing the connection: {e}");
                self.close_channel();
            }
        }
        result
    }

    /// One command/response cycle on the wire
    fn exchange(&mut self, cmd: &str, settle: Option<Duration>) -> DiagResult<Vec<String>> {
        let timeout = self.options.timeout_ms;
        let channel = self.channel.as_mut().ok_or(DiagError::NotConnected)?;
        debug!("TX {cmd:?}");
        let mut request = Vec::with_capacity(cmd.len() + 2);
        request.extend_from_slice(cmd.as_bytes());
        request.extend_from_slice(b"\r\n");
        channel.clear_rx_buffer()?;
        channel.write_bytes(&request, timeout)?;
        if let Some(delay) = settle {
            std::thread::sleep(delay);
        }
        let raw = read_until_prompt(channel.as_mut(), timeout)?;
        let lines = split_lines(&raw);
        debug!("RX {lines:?}");
        Ok(lines)
    }

    fn close_channel(&mut self) {
        if let Some(channel) = self.channel.as_mut() {
            if self.state != ConnectionState::NotConnected {
                // Put the adapter back to its power-on defaults. Best effort
                let _ = channel.write_bytes(b"ATZ\r\n", self.options.timeout_ms);
            }
            if let Err(e) = channel.close() {
                warn!("Error closing the channel: {e}");
            }
        }
        if !self.caller_channel {
            self.channel = None;
        }
        self.state = ConnectionState::NotConnected;
        self.protocol = ObdProtocol::Unknown;
        self.ecu_map = EcuMap::default();
        self.ident = None;
    }
}

impl Drop for Elm327Connection {
    fn drop(&mut self) {
        let inner = match self.inner.get_mut() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.close_channel();
    }
}

impl std::fmt::Debug for Elm327Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Elm327Connection");
        if let Ok(inner) = self.inner.try_lock() {
            s.field("state", &inner.state)
                .field("protocol", &inner.protocol);
        }
        s.finish_non_exhaustive()
    }
}

/// Reads until the `>` prompt, the retry budget runs out, or the channel
/// fails. NUL filler bytes some clone adapters emit are discarded
fn read_until_prompt(channel: &mut dyn ElmChannel, timeout_ms: u32) -> DiagResult<Vec<u8>> {
    let mut buffer: Vec<u8> = Vec::new();
    let mut timeouts = 0u32;
    loop {
        match channel.read_byte(timeout_ms) {
            Ok(PROMPT) => break,
            Ok(0x00) => continue,
            Ok(byte) => buffer.push(byte),
            Err(ChannelError::ReadTimeout) => {
                timeouts += 1;
                if timeouts >= READ_ATTEMPTS {
                    debug!("Prompt never arrived, keeping {} buffered bytes", buffer.len());
                    break;
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(buffer)
}

/// Splits a raw response on CR and LF, trimming and dropping empty lines
fn split_lines(raw: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(raw)
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_either_terminator() {
        let lines = split_lines(b"41 0D 20\r\n48 6B 10 41 0D 20 61\rOK\r");
        assert_eq!(lines, ["41 0D 20", "48 6B 10 41 0D 20 61", "OK"]);
    }

    #[test]
    fn drops_blank_and_whitespace_lines() {
        assert_eq!(split_lines(b"\r\r   \rOK\r\r"), ["OK"]);
        assert!(split_lines(b"").is_empty());
        assert!(split_lines(b"\r\n\r\n").is_empty());
    }
}
