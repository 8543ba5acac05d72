//! Core functionalities: UART line driver, receive buffering, peripheral backends.

pub mod backend;
pub mod config;
pub mod driver;
pub mod error;
pub mod rx_buffer;
pub mod strategy;

pub use backend::mock::{MockBackend, MockHandle};
pub use backend::serial::{list_ports, PortInfo, SerialHandle, SerialPortBackend};
pub use backend::{PeripheralBackend, RxCallback};
pub use config::{ConfigParam, UartConfig};
pub use driver::{DriverOptions, DriverState, UartDriver};
pub use error::{BackendError, Result, StateError, UartError};
pub use rx_buffer::ReceiveBuffer;
pub use strategy::TransferStrategy;
