//! Host serial ports through the `serialport` crate.

use std::io::{ErrorKind, Read, Write};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use serialport::{SerialPort, SerialPortInfo, SerialPortType};

use super::{PeripheralBackend, RxCallback};
use crate::config::UartConfig;
use crate::error::BackendError;
use crate::strategy::TransferStrategy;

const INTERRUPT_CHUNK: usize = 64;
const DMA_BLOCK: usize = 4096;
const ERROR_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ERROR_BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Delay before retrying after a failed read; doubles up to a cap.
fn next_backoff(current: Option<Duration>) -> Duration {
    current.map_or(ERROR_BACKOFF_MIN, |d| (d * 2).min(ERROR_BACKOFF_MAX))
}

/// A port as shown by `uartkit list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub kind: &'static str,
    /// USB vendor and product id.
    pub usb_id: Option<(u16, u16)>,
    pub product: Option<String>,
}

impl PortInfo {
    pub fn label(&self) -> String {
        match (self.usb_id, &self.product) {
            (Some((vid, pid)), Some(product)) => format!("{} ({vid:04X}:{pid:04X}) {product}", self.name),
            (Some((vid, pid)), None) => format!("{} ({vid:04X}:{pid:04X})", self.name),
            (None, _) => format!("{} {}", self.name, self.kind),
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (kind, usb_id, product) = match info.port_type {
            SerialPortType::UsbPort(usb) => ("USB", Some((usb.vid, usb.pid)), usb.product),
            SerialPortType::PciPort => ("PCI", None, None),
            SerialPortType::BluetoothPort => ("Bluetooth", None, None),
            SerialPortType::Unknown => ("Unknown", None, None),
        };
        Self {
            name: info.port_name,
            kind,
            usb_id,
            product,
        }
    }
}

/// Ports on this machine, sorted by name. Enumeration failures yield an empty list.
pub fn list_ports() -> Vec<PortInfo> {
    let mut ports: Vec<PortInfo> = match serialport::available_ports() {
        Ok(found) => found.into_iter().map(PortInfo::from).collect(),
        Err(e) => {
            log::warn!("port enumeration failed: {e}");
            Vec::new()
        }
    };
    ports.sort_by(|a, b| a.name.cmp(&b.name));
    ports
}

fn data_bits(bits: u8) -> Result<serialport::DataBits, BackendError> {
    Ok(match bits {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        8 => serialport::DataBits::Eight,
        _ => return Err(BackendError::Unsupported("data bits other than 5-8")),
    })
}

fn stop_bits(bits: u8) -> Result<serialport::StopBits, BackendError> {
    Ok(match bits {
        1 => serialport::StopBits::One,
        2 => serialport::StopBits::Two,
        _ => return Err(BackendError::Unsupported("stop bits other than 1-2")),
    })
}

/// Backend bound to one named port; every `open` opens that port afresh.
#[derive(Debug, Clone)]
pub struct SerialPortBackend {
    port_name: String,
    io_timeout: Duration,
}

struct Reader {
    stop: Sender<()>,
    join: JoinHandle<()>,
}

pub struct SerialHandle {
    port: Mutex<Box<dyn SerialPort>>,
    strategy: TransferStrategy,
    reader: Mutex<Option<Reader>>,
}

impl SerialPortBackend {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            io_timeout: Duration::from_millis(50),
        }
    }

    /// Timeout of individual port reads/writes. Also bounds how long the
    /// reader thread takes to notice a close.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl PeripheralBackend for SerialPortBackend {
    type Handle = SerialHandle;

    fn open(&self, config: &UartConfig, strategy: TransferStrategy) -> Result<SerialHandle, BackendError> {
        let parity = if config.parity {
            serialport::Parity::Even
        } else {
            serialport::Parity::None
        };
        let port = serialport::new(&self.port_name, config.baud_rate)
            .data_bits(data_bits(config.data_bits)?)
            .parity(parity)
            .stop_bits(stop_bits(config.stop_bits)?)
            .flow_control(serialport::FlowControl::None)
            .timeout(self.io_timeout)
            .open()?;
        log::debug!("opened {} at {} baud ({strategy:?})", self.port_name, config.baud_rate);
        Ok(SerialHandle {
            port: Mutex::new(port),
            strategy,
            reader: Mutex::new(None),
        })
    }

    fn close(&self, handle: &SerialHandle) -> Result<(), BackendError> {
        if let Some(reader) = handle.reader.lock().take() {
            let _ = reader.stop.send(());
            if reader.join.join().is_err() {
                return Err(BackendError::Other("serial reader thread panicked".into()));
            }
        }
        log::debug!("closed {}", self.port_name);
        Ok(())
    }

    fn transmit(&self, handle: &SerialHandle, bytes: &[u8]) -> Result<usize, BackendError> {
        match handle.port.lock().write(bytes) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn poll_receive(&self, handle: &SerialHandle) -> Result<Option<Vec<u8>>, BackendError> {
        let mut port = handle.port.lock();
        let waiting = port.bytes_to_read()? as usize;
        if waiting == 0 {
            return Ok(None);
        }
        let mut buf = vec![0u8; waiting.min(DMA_BLOCK)];
        match port.read(&mut buf) {
            Ok(n) if n > 0 => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn register_receive_callback(&self, handle: &SerialHandle, on_receive: RxCallback) -> Result<(), BackendError> {
        let mut slot = handle.reader.lock();
        if slot.is_some() {
            return Err(BackendError::Other("receive callback already registered".into()));
        }
        let mut port = handle.port.lock().try_clone()?;
        let chunk = match handle.strategy {
            TransferStrategy::Dma => DMA_BLOCK,
            _ => INTERRUPT_CHUNK,
        };
        let (stop, stopped) = bounded::<()>(1);
        let name = self.port_name.clone();

        let join = std::thread::Builder::new()
            .name(format!("uartkit-rx-{name}"))
            .spawn(move || {
                let mut buf = vec![0u8; chunk];
                // Set while reads keep failing; the error is reported once per streak.
                let mut backoff: Option<Duration> = None;
                loop {
                    match stopped.try_recv() {
                        Err(TryRecvError::Empty) => {}
                        _ => return,
                    }
                    match port.read(&mut buf) {
                        Ok(n) if n > 0 => {
                            if backoff.take().is_some() {
                                log::info!("{name}: reads recovered");
                            }
                            on_receive(Ok(&buf[..n]));
                        }
                        Ok(_) => {}
                        Err(e) if e.kind() == ErrorKind::TimedOut => {}
                        Err(e) => {
                            if backoff.is_none() {
                                log::warn!("{name}: read failed: {e}");
                                on_receive(Err(e.into()));
                            }
                            let delay = next_backoff(backoff);
                            backoff = Some(delay);
                            match stopped.recv_timeout(delay) {
                                Err(RecvTimeoutError::Timeout) => {}
                                _ => return,
                            }
                        }
                    }
                }
            })?;

        *slot = Some(Reader { stop, join });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_line_parameters() {
        assert_eq!(data_bits(7).unwrap(), serialport::DataBits::Seven);
        assert!(matches!(data_bits(9), Err(BackendError::Unsupported(_))));
        assert_eq!(stop_bits(2).unwrap(), serialport::StopBits::Two);
        assert!(stop_bits(0).is_err());
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        assert_eq!(next_backoff(None), ERROR_BACKOFF_MIN);
        assert_eq!(next_backoff(Some(Duration::from_millis(5))), Duration::from_millis(10));
        assert_eq!(next_backoff(Some(Duration::from_millis(400))), ERROR_BACKOFF_MAX);
        assert_eq!(next_backoff(Some(ERROR_BACKOFF_MAX)), ERROR_BACKOFF_MAX);
    }

    #[test]
    fn port_labels() {
        let usb = PortInfo {
            name: "/dev/ttyUSB0".into(),
            kind: "USB",
            usb_id: Some((0x0403, 0x6001)),
            product: Some("FT232R".into()),
        };
        assert_eq!(usb.label(), "/dev/ttyUSB0 (0403:6001) FT232R");

        let pci = PortInfo {
            name: "/dev/ttyS0".into(),
            kind: "PCI",
            usb_id: None,
            product: None,
        };
        assert_eq!(pci.label(), "/dev/ttyS0 PCI");
    }

    #[test]
    fn missing_port_fails_to_open() {
        let backend = SerialPortBackend::new("/dev/uartkit-does-not-exist");
        let err = backend
            .open(&UartConfig::default(), TransferStrategy::Polling)
            .err()
            .expect("open should fail");
        assert!(matches!(err, BackendError::Serial(_)));
    }
}
