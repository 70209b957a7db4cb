// Serial channel abstraction over the device link.
//
// The ingest worker owns exactly one channel for its whole life; nothing else
// touches the handle. The trait seam exists so tests can feed scripted byte
// streams through the same worker code path that drives real hardware.

use std::io::Read;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Driver timeout for reads. Reads only ever drain bytes the driver already
/// buffered, so this bounds how long a misbehaving driver can stall the
/// worker loop.
const DRIVER_TIMEOUT: Duration = Duration::from_millis(10);

/// Errors raised by the serial channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to open {port}: {reason}")]
    Open { port: String, reason: String },
    #[error("serial read failed: {0}")]
    Read(String),
    #[error("failed to enumerate serial ports: {0}")]
    Enumerate(String),
}

/// Exclusive handle to one device link.
///
/// `read_available` drains exactly the bytes the driver reports buffered at
/// call time and never waits for more. `close` is idempotent; dropping the
/// channel releases the handle as well.
pub trait SerialChannel: Send {
    fn bytes_available(&mut self) -> Result<usize, ChannelError>;
    fn read_available(&mut self) -> Result<Vec<u8>, ChannelError>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
}

/// Factory seam for opening channels; the recorder holds one of these so
/// tests can substitute scripted channels for real ports.
pub trait ChannelOpener: Send + Sync {
    fn open(&self, port: &str, baud: u32) -> Result<Box<dyn SerialChannel>, ChannelError>;
}

/// Channel over a real OS serial port.
pub struct UsbChannel {
    port_name: String,
    handle: Option<Box<dyn serialport::SerialPort>>,
}

impl UsbChannel {
    pub fn open(port: &str, baud: u32) -> Result<Self, ChannelError> {
        let handle = serialport::new(port, baud)
            .timeout(DRIVER_TIMEOUT)
            .open()
            .map_err(|e| ChannelError::Open {
                port: port.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            port_name: port.to_string(),
            handle: Some(handle),
        })
    }
}

impl SerialChannel for UsbChannel {
    fn bytes_available(&mut self) -> Result<usize, ChannelError> {
        match &self.handle {
            Some(handle) => handle
                .bytes_to_read()
                .map(|n| n as usize)
                .map_err(|e| ChannelError::Read(format!("{}: {}", self.port_name, e))),
            None => Err(ChannelError::Read(format!(
                "{}: channel is closed",
                self.port_name
            ))),
        }
    }

    fn read_available(&mut self) -> Result<Vec<u8>, ChannelError> {
        let available = self.bytes_available()?;
        if available == 0 {
            return Ok(Vec::new());
        }

        let handle = match &mut self.handle {
            Some(handle) => handle,
            None => {
                return Err(ChannelError::Read(format!(
                    "{}: channel is closed",
                    self.port_name
                )))
            }
        };

        let mut buf = vec![0u8; available];
        handle
            .read_exact(&mut buf)
            .map_err(|e| ChannelError::Read(format!("{}: {}", self.port_name, e)))?;
        Ok(buf)
    }

    fn close(&mut self) {
        // Dropping the boxed port releases the OS handle; taking the Option
        // makes repeated close calls no-ops.
        self.handle.take();
    }

    fn is_open(&self) -> bool {
        self.handle.is_some()
    }
}

/// The real opener: every `open` hands out a fresh [`UsbChannel`].
pub struct SystemPorts;

impl ChannelOpener for SystemPorts {
    fn open(&self, port: &str, baud: u32) -> Result<Box<dyn SerialChannel>, ChannelError> {
        UsbChannel::open(port, baud).map(|c| Box::new(c) as Box<dyn SerialChannel>)
    }
}

/// Information about an available serial port.
#[derive(Debug, Clone, Serialize)]
pub struct PortInfo {
    pub name: String,
    pub kind: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

/// List serial ports that look like capture hardware.
///
/// On macOS the /dev/tty.* devices block on open waiting for carrier detect;
/// only the /dev/cu.* (calling unit) variants are returned.
pub fn list_ports() -> Result<Vec<PortInfo>, ChannelError> {
    let ports =
        serialport::available_ports().map_err(|e| ChannelError::Enumerate(e.to_string()))?;

    Ok(ports
        .into_iter()
        .filter(|_p| {
            #[cfg(target_os = "macos")]
            {
                !_p.port_name.starts_with("/dev/tty.")
            }
            #[cfg(not(target_os = "macos"))]
            {
                true
            }
        })
        .filter(|p| looks_like_device(&p.port_name))
        .map(|p| {
            let (kind, manufacturer, product) = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => {
                    ("USB".to_string(), info.manufacturer, info.product)
                }
                serialport::SerialPortType::BluetoothPort => ("Bluetooth".to_string(), None, None),
                serialport::SerialPortType::PciPort => ("PCI".to_string(), None, None),
                serialport::SerialPortType::Unknown => ("Unknown".to_string(), None, None),
            };
            PortInfo {
                name: p.port_name,
                kind,
                manufacturer,
                product,
            }
        })
        .collect())
}

// The controller boards show up as USB CDC (ttyACM), USB-serial bridges
// (ttyUSB / cu.usbmodem) or the Pi's own UART (ttyS0).
fn looks_like_device(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("usb") || lower.contains("acm") || lower.contains("cu.") || name.contains("S0")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_name_filter() {
        assert!(looks_like_device("/dev/ttyACM0"));
        assert!(looks_like_device("/dev/ttyUSB1"));
        assert!(looks_like_device("/dev/cu.usbmodem14301"));
        assert!(looks_like_device("/dev/ttyS0"));
        assert!(!looks_like_device("/dev/ttyAMA7"));
        assert!(!looks_like_device("/dev/null"));
    }
}
