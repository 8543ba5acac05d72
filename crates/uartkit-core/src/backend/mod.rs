//! The hardware seam: everything the driver needs from a physical line.

pub mod mock;
pub mod serial;

use crate::config::UartConfig;
use crate::error::BackendError;
use crate::strategy::TransferStrategy;

/// Receive-completion callback. Runs in producer context, concurrently with
/// driver API calls. `Err` reports a receive failure; the line stays open.
pub type RxCallback = Box<dyn Fn(Result<&[u8], BackendError>) + Send + Sync + 'static>;

pub trait PeripheralBackend: Send + Sync + 'static {
    /// Resource acquired by [`open`](Self::open) and released by [`close`](Self::close).
    type Handle: Send + Sync + 'static;

    fn open(&self, config: &UartConfig, strategy: TransferStrategy) -> Result<Self::Handle, BackendError>;

    fn close(&self, handle: &Self::Handle) -> Result<(), BackendError>;

    /// One transmit attempt. Returns how many bytes the line accepted, which
    /// may be fewer than `bytes.len()`.
    fn transmit(&self, handle: &Self::Handle, bytes: &[u8]) -> Result<usize, BackendError>;

    /// Single-shot receive check used by the polling strategy.
    fn poll_receive(&self, handle: &Self::Handle) -> Result<Option<Vec<u8>>, BackendError>;

    /// Installs the callback that interrupt/DMA completion feeds, with received
    /// bytes or with a receive error. The backend must stop calling it once the
    /// handle is closed.
    fn register_receive_callback(&self, handle: &Self::Handle, on_receive: RxCallback) -> Result<(), BackendError>;
}
