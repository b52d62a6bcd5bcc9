//! Serial Port Adapter (C1)
//!
//! A thin, typed wrapper over `serialport::SerialPort`. Reads may happen
//! concurrently with modem-line snapshots but never with `close`: readers
//! take a shared lock, `close` takes exclusive — mirrored here with a
//! `parking_lot::RwLock` around the boxed port.

use crate::error::{IngestError, Result};
use crate::model::PortSpec;
use parking_lot::RwLock;
use serialport::{DataBits as SpDataBits, FlowControl as SpFlowControl, Parity as SpParity, StopBits as SpStopBits};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::model::{Parity, StopBits};

pub enum ReadOutcome {
    Bytes(usize),
    Timeout,
    Eof,
    Error(IngestError),
}

pub struct SerialAdapter {
    inner: Arc<RwLock<Option<Box<dyn serialport::SerialPort>>>>,
    device_path: String,
}

fn map_data_bits(n: u8) -> SpDataBits {
    match n {
        5 => SpDataBits::Five,
        6 => SpDataBits::Six,
        7 => SpDataBits::Seven,
        _ => SpDataBits::Eight,
    }
}

fn map_parity(p: Parity) -> SpParity {
    match p {
        Parity::None => SpParity::None,
        Parity::Odd => SpParity::Odd,
        Parity::Even => SpParity::Even,
        // serialport has no mark/space parity; closest safe fallback is none,
        // callers validate against the documented enum at the config layer.
        Parity::Mark | Parity::Space => SpParity::None,
    }
}

fn map_stop_bits(s: StopBits) -> SpStopBits {
    match s {
        StopBits::One | StopBits::OnePointFive => SpStopBits::One,
        StopBits::Two => SpStopBits::Two,
    }
}

fn classify_open_error(device: &str, err: serialport::Error) -> IngestError {
    use serialport::ErrorKind;
    match err.kind() {
        ErrorKind::NoDevice => IngestError::PortMissing {
            device: device.to_string(),
        },
        ErrorKind::Io(io::ErrorKind::PermissionDenied) => IngestError::PermissionDenied {
            device: device.to_string(),
        },
        ErrorKind::Io(io::ErrorKind::AddrInUse) | ErrorKind::Io(io::ErrorKind::WouldBlock) => {
            IngestError::PortBusy {
                device: device.to_string(),
            }
        }
        _ => IngestError::InvalidMode {
            device: device.to_string(),
            reason: err.to_string(),
        },
    }
}

impl SerialAdapter {
    /// Open and configure a port per `spec`, asserting DTR (and RTS when flow
    /// control is requested) before handing the adapter back.
    pub fn open(spec: &PortSpec, baud: u32, flow_control: bool, timeout: Duration) -> Result<Self> {
        let builder = serialport::new(&spec.device_path, baud)
            .data_bits(map_data_bits(spec.data_bits))
            .parity(map_parity(spec.parity))
            .stop_bits(map_stop_bits(spec.stop_bits))
            .flow_control(if flow_control {
                SpFlowControl::Hardware
            } else {
                SpFlowControl::None
            })
            .timeout(timeout);

        let mut port = builder
            .open()
            .map_err(|e| classify_open_error(&spec.device_path, e))?;

        let _ = port.write_data_terminal_ready(true);
        if flow_control {
            let _ = port.write_request_to_send(true);
        }

        Ok(Self {
            inner: Arc::new(RwLock::new(Some(port))),
            device_path: spec.device_path.clone(),
        })
    }

    pub fn read_into(&self, buf: &mut [u8]) -> ReadOutcome {
        let mut guard = self.inner.write();
        let Some(port) = guard.as_mut() else {
            return ReadOutcome::Error(IngestError::PortIo {
                device: self.device_path.clone(),
                source: io::Error::new(io::ErrorKind::NotConnected, "port closed"),
            });
        };
        match port.read(buf) {
            Ok(0) => ReadOutcome::Eof,
            Ok(n) => ReadOutcome::Bytes(n),
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => ReadOutcome::Timeout,
            Err(e) => ReadOutcome::Error(IngestError::PortIo {
                device: self.device_path.clone(),
                source: e,
            }),
        }
    }

    pub fn set_read_timeout(&self, d: Duration) -> Result<()> {
        let mut guard = self.inner.write();
        let port = guard.as_mut().ok_or_else(|| IngestError::PortIo {
            device: self.device_path.clone(),
            source: io::Error::new(io::ErrorKind::NotConnected, "port closed"),
        })?;
        port.set_timeout(d).map_err(|e| IngestError::PortIo {
            device: self.device_path.clone(),
            source: io::Error::other(e.to_string()),
        })
    }

    pub fn reset_input_buffer(&self) -> Result<()> {
        let mut guard = self.inner.write();
        let port = guard.as_mut().ok_or_else(|| IngestError::PortIo {
            device: self.device_path.clone(),
            source: io::Error::new(io::ErrorKind::NotConnected, "port closed"),
        })?;
        port.clear(serialport::ClearBuffer::Input)
            .map_err(|e| IngestError::PortIo {
                device: self.device_path.clone(),
                source: io::Error::other(e.to_string()),
            })
    }

    /// Reconfigure baud in place; no close/reopen required.
    pub fn set_baud(&self, baud: u32) -> Result<()> {
        let mut guard = self.inner.write();
        let port = guard.as_mut().ok_or_else(|| IngestError::PortIo {
            device: self.device_path.clone(),
            source: io::Error::new(io::ErrorKind::NotConnected, "port closed"),
        })?;
        port.set_baud_rate(baud).map_err(|e| IngestError::PortIo {
            device: self.device_path.clone(),
            source: io::Error::other(e.to_string()),
        })
    }

    /// Attempt in-place flow-control reconfiguration. Some platform/driver
    /// combinations reject this on an already-open handle; callers fall back
    /// to close+reopen when this returns an error.
    pub fn set_flow_control(&self, enabled: bool) -> Result<()> {
        let mut guard = self.inner.write();
        let port = guard.as_mut().ok_or_else(|| IngestError::PortIo {
            device: self.device_path.clone(),
            source: io::Error::new(io::ErrorKind::NotConnected, "port closed"),
        })?;
        let fc = if enabled {
            SpFlowControl::Hardware
        } else {
            SpFlowControl::None
        };
        port.set_flow_control(fc).map_err(|e| IngestError::PortIo {
            device: self.device_path.clone(),
            source: io::Error::other(e.to_string()),
        })
    }

    pub fn modem_lines(&self) -> crate::model::ModemLines {
        let guard = self.inner.read();
        let Some(port) = guard.as_ref() else {
            return crate::model::ModemLines::default();
        };
        crate::model::ModemLines {
            cts: port.read_clear_to_send().unwrap_or(false),
            dsr: port.read_data_set_ready().unwrap_or(false),
            dcd: port.read_carrier_detect().unwrap_or(false),
            ri: port.read_ring_indicator().unwrap_or(false),
        }
    }

    /// Drain pending writes and drop the handle. Failures are swallowed —
    /// the device may already be gone.
    pub fn close(&self) {
        let mut guard = self.inner.write();
        if let Some(mut port) = guard.take() {
            let _ = port.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_data_bits() {
        assert!(matches!(map_data_bits(7), SpDataBits::Seven));
        assert!(matches!(map_data_bits(200), SpDataBits::Eight));
    }

    #[test]
    fn maps_stop_bits() {
        assert!(matches!(map_stop_bits(StopBits::OnePointFive), SpStopBits::One));
        assert!(matches!(map_stop_bits(StopBits::Two), SpStopBits::Two));
    }
}
