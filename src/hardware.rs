//! Serial port backed adapter channels
//!
//! ELM327 adapters show up as plain serial devices (USB CDC, RS232, or a
//! Bluetooth SPP binding). [SerialElmChannel] implements [ElmChannel] on top
//! of one, and [list_ports] enumerates candidates for the auto-scan path in
//! [crate::connection].

use std::{
    io::{Read, Write},
    sync::Mutex,
    time::Duration,
};

use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};

use crate::channel::{ChannelError, ChannelResult, ElmChannel};

impl From<serialport::Error> for ChannelError {
    fn from(err: serialport::Error) -> Self {
        Self::APIError(err.to_string())
    }
}

/// Lists the serial port names visible on this machine, in enumeration order
pub fn list_ports() -> ChannelResult<Vec<String>> {
    let ports = serialport::available_ports()?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// [ElmChannel] over a local serial port.
///
/// ELM327 adapters are always 8-N-1 with no flow control, whatever baud rate
/// they run at, so only the port name and baud rate are configurable.
pub struct SerialElmChannel {
    port_name: String,
    baud: u32,
    port: Option<Mutex<Box<dyn SerialPort>>>,
    applied_timeout_ms: u32,
}

impl SerialElmChannel {
    /// Creates an unopened channel for the named port
    pub fn new(port_name: &str, baud: u32, timeout_ms: u32) -> Self {
        Self {
            port_name: port_name.to_string(),
            baud,
            port: None,
            applied_timeout_ms: timeout_ms,
        }
    }

    /// Name of the underlying serial port
    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl std::fmt::Debug for SerialElmChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialElmChannel")
            .field("port_name", &self.port_name)
            .field("baud", &self.baud)
            .field("open", &self.port.is_some())
            .finish()
    }
}

fn apply_timeout(
    port: &mut Box<dyn SerialPort>,
    applied_ms: &mut u32,
    timeout_ms: u32,
) -> ChannelResult<()> {
    if *applied_ms != timeout_ms {
        port.set_timeout(Duration::from_millis(u64::from(timeout_ms)))?;
        *applied_ms = timeout_ms;
    }
    Ok(())
}

impl ElmChannel for SerialElmChannel {
    fn open(&mut self) -> ChannelResult<()> {
        if self.port.is_some() {
            return Ok(());
        }
        log::debug!("Opening {} at {} baud", self.port_name, self.baud);
        let port = serialport::new(&self.port_name, self.baud)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .timeout(Duration::from_millis(u64::from(self.applied_timeout_ms)))
            .open()?;
        self.port = Some(Mutex::new(port));
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        if self.port.take().is_some() {
            log::debug!("Closed {}", self.port_name);
        }
        Ok(())
    }

    fn write_bytes(&mut self, buffer: &[u8], timeout_ms: u32) -> ChannelResult<()> {
        let port = self.port.as_ref().ok_or(ChannelError::InterfaceNotOpen)?;
        let mut guard = port.lock()?;
        apply_timeout(&mut guard, &mut self.applied_timeout_ms, timeout_ms)?;
        match guard.write_all(buffer).and_then(|()| guard.flush()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(ChannelError::WriteTimeout),
            Err(e) => Err(e.into()),
        }
    }

    fn read_byte(&mut self, timeout_ms: u32) -> ChannelResult<u8> {
        let port = self.port.as_ref().ok_or(ChannelError::InterfaceNotOpen)?;
        let mut guard = port.lock()?;
        apply_timeout(&mut guard, &mut self.applied_timeout_ms, timeout_ms)?;
        let mut byte = [0u8; 1];
        match guard.read(&mut byte) {
            Ok(0) => Err(ChannelError::ReadTimeout),
            Ok(_) => Ok(byte[0]),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(ChannelError::ReadTimeout),
            Err(e) => Err(e.into()),
        }
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        let port = self.port.as_ref().ok_or(ChannelError::InterfaceNotOpen)?;
        let guard = port.lock()?;
        guard.clear(ClearBuffer::Input)?;
        Ok(())
    }
}
