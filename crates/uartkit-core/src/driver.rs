//! The line driver: lifecycle state machine and the receive handoff between
//! backend completion and application reads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};

use crate::backend::PeripheralBackend;
use crate::config::{ConfigParam, UartConfig};
use crate::error::{BackendError, Result, StateError};
use crate::rx_buffer::ReceiveBuffer;
use crate::strategy::TransferStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Closed,
    Configured,
    Open,
}

#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Upper bound for `read` when the caller passes no timeout.
    pub read_timeout: Duration,
    /// Delay between backend polls under [`TransferStrategy::Polling`].
    pub poll_interval: Duration,
    /// Receive buffer size in bytes.
    pub rx_capacity: usize,
    /// Completions the backend callback may queue ahead of the receive
    /// worker. Chunks arriving while the queue is full count as overruns.
    pub rx_queue_depth: usize,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(2),
            rx_capacity: 4096,
            rx_queue_depth: 64,
        }
    }
}

struct Line<H> {
    state: DriverState,
    config: UartConfig,
    strategy: Option<TransferStrategy>,
    session: u64,
    handle: Option<Arc<H>>,
    rx: ReceiveBuffer,
    // Last background receive failure, reported by the next read.
    rx_error: Option<BackendError>,
}

impl<H> Line<H> {
    fn is_session_open(&self, session: u64) -> bool {
        self.state == DriverState::Open && self.session == session
    }
}

struct Shared<H> {
    line: Mutex<Line<H>>,
    data_ready: Condvar,
}

/// What the backend callback hands to the receive worker.
enum RxEvent {
    Bytes(Vec<u8>),
    Failed(BackendError),
}

/// Receive-completion task for interrupt and DMA strategies.
struct Worker {
    stop: Sender<()>,
    join: JoinHandle<()>,
}

impl Worker {
    fn spawn<H: Send + Sync + 'static>(
        name: String,
        shared: Arc<Shared<H>>,
        start: Receiver<u64>,
        events: Receiver<RxEvent>,
    ) -> std::io::Result<Self> {
        let (stop, stopped) = bounded::<()>(1);
        let join = std::thread::Builder::new().name(name).spawn(move || {
            // Chunks queue up in the channel until the driver publishes the session.
            let Ok(session) = start.recv() else { return };
            loop {
                select! {
                    recv(events) -> msg => {
                        let Ok(event) = msg else { break };
                        let mut line = shared.line.lock();
                        if !line.is_session_open(session) {
                            break;
                        }
                        match event {
                            RxEvent::Bytes(chunk) => {
                                if line.rx.push(&chunk) > 0 {
                                    log::trace!("rx {} bytes, {} buffered", chunk.len(), line.rx.len());
                                    shared.data_ready.notify_one();
                                }
                            }
                            RxEvent::Failed(e) => {
                                log::debug!("receive failed: {e}");
                                line.rx_error = Some(e);
                                shared.data_ready.notify_all();
                            }
                        }
                    }
                    recv(stopped) -> _ => break,
                }
            }
        })?;
        Ok(Self { stop, join })
    }

    fn stop(self) {
        drop(self.stop);
        if self.join.join().is_err() {
            log::error!("receive worker panicked");
        }
    }
}

/// One physical UART line.
///
/// All methods take `&self`; share the driver between threads with an `Arc`.
pub struct UartDriver<B: PeripheralBackend> {
    id: u32,
    backend: B,
    options: DriverOptions,
    shared: Arc<Shared<B::Handle>>,
    // Bytes the callback dropped because the worker queue was full.
    queue_overruns: Arc<AtomicU64>,
    // Serializes set_config/configure/open/close, which call into the backend
    // without holding the line lock.
    lifecycle: Mutex<Option<Worker>>,
}

impl<B: PeripheralBackend> UartDriver<B> {
    pub fn new(id: u32, backend: B) -> Self {
        Self::with_options(id, backend, DriverOptions::default())
    }

    pub fn with_options(id: u32, backend: B, options: DriverOptions) -> Self {
        let line = Line {
            state: DriverState::Closed,
            config: UartConfig::default(),
            strategy: None,
            session: 0,
            handle: None,
            rx: ReceiveBuffer::new(options.rx_capacity),
            rx_error: None,
        };
        Self {
            id,
            backend,
            options,
            shared: Arc::new(Shared {
                line: Mutex::new(line),
                data_ready: Condvar::new(),
            }),
            queue_overruns: Arc::new(AtomicU64::new(0)),
            lifecycle: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> DriverState {
        self.shared.line.lock().state
    }

    pub fn strategy(&self) -> Option<TransferStrategy> {
        self.shared.line.lock().strategy
    }

    pub fn config(&self) -> UartConfig {
        self.shared.line.lock().config
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    /// Bytes received but not yet read.
    pub fn available(&self) -> usize {
        self.shared.line.lock().rx.len()
    }

    /// Bytes dropped because the receive buffer or the completion queue was full.
    pub fn overrun_count(&self) -> u64 {
        self.shared.line.lock().rx.overruns() + self.queue_overruns.load(Ordering::Relaxed)
    }

    pub fn set_config(&self, param: ConfigParam, value: i64) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let mut line = self.shared.line.lock();
        if line.state == DriverState::Open {
            return Err(StateError::MustBeClosed.into());
        }
        line.config.set(param, value)?;
        self.mark_configured(&mut line);
        Ok(())
    }

    /// Replaces the whole configuration at once.
    pub fn configure(&self, config: UartConfig) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let mut line = self.shared.line.lock();
        if line.state == DriverState::Open {
            return Err(StateError::MustBeClosed.into());
        }
        config.validate()?;
        line.config = config;
        self.mark_configured(&mut line);
        Ok(())
    }

    fn mark_configured(&self, line: &mut Line<B::Handle>) {
        if line.state == DriverState::Closed {
            log::debug!("uart{}: closed -> configured", self.id);
            line.state = DriverState::Configured;
        }
    }

    pub fn open(&self, strategy: TransferStrategy) -> Result<()> {
        let mut worker_slot = self.lifecycle.lock();
        let config = {
            let line = self.shared.line.lock();
            match line.state {
                DriverState::Open => return Err(StateError::AlreadyOpen.into()),
                DriverState::Closed => return Err(StateError::NotConfigured.into()),
                DriverState::Configured => line.config,
            }
        };

        let handle = Arc::new(self.backend.open(&config, strategy)?);

        let started = if strategy.is_async() {
            match self.start_worker(&handle) {
                Ok(started) => Some(started),
                Err(e) => {
                    if let Err(close_err) = self.backend.close(&handle) {
                        log::warn!("uart{}: close after failed open: {close_err}", self.id);
                    }
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let session = {
            let mut line = self.shared.line.lock();
            line.session += 1;
            line.state = DriverState::Open;
            line.strategy = Some(strategy);
            line.handle = Some(handle);
            line.rx.clear();
            line.rx_error = None;
            line.session
        };

        if let Some((worker, start)) = started {
            let _ = start.send(session);
            *worker_slot = Some(worker);
        }
        log::debug!("uart{}: configured -> open ({strategy:?}, {} baud)", self.id, config.baud_rate);
        Ok(())
    }

    fn start_worker(&self, handle: &B::Handle) -> std::result::Result<(Worker, Sender<u64>), BackendError> {
        let (start, started) = bounded::<u64>(1);
        let (event_tx, event_rx) = bounded::<RxEvent>(self.options.rx_queue_depth.max(1));
        let worker = Worker::spawn(format!("uart{}-rx", self.id), self.shared.clone(), started, event_rx)?;

        let overruns = self.queue_overruns.clone();
        let id = self.id;
        let registered = self.backend.register_receive_callback(
            handle,
            Box::new(move |received: std::result::Result<&[u8], BackendError>| {
                let event = match received {
                    Ok([]) => return,
                    Ok(bytes) => RxEvent::Bytes(bytes.to_vec()),
                    Err(e) => RxEvent::Failed(e),
                };
                match event_tx.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(RxEvent::Bytes(lost))) => {
                        overruns.fetch_add(lost.len() as u64, Ordering::Relaxed);
                    }
                    Err(TrySendError::Full(RxEvent::Failed(e))) => {
                        log::warn!("uart{id}: completion queue full, dropped error: {e}");
                    }
                    // The worker is gone once the line is closed.
                    Err(TrySendError::Disconnected(_)) => {}
                }
            }),
        );
        if let Err(e) = registered {
            drop(start);
            worker.stop();
            return Err(e);
        }
        Ok((worker, start))
    }

    /// Closes the line. Unread bytes are discarded.
    ///
    /// The driver ends up closed even when the backend reports a close error;
    /// that error is still returned.
    pub fn close(&self) -> Result<()> {
        let mut worker_slot = self.lifecycle.lock();
        let handle = {
            let mut line = self.shared.line.lock();
            if line.state != DriverState::Open {
                return Err(StateError::NotOpen.into());
            }
            line.state = DriverState::Closed;
            line.strategy = None;
            let dropped = line.rx.len();
            if dropped > 0 {
                log::debug!("uart{}: discarding {dropped} unread bytes", self.id);
            }
            line.rx.clear();
            line.rx_error = None;
            self.shared.data_ready.notify_all();
            line.handle.take()
        };

        if let Some(worker) = worker_slot.take() {
            worker.stop();
        }
        log::debug!("uart{}: open -> closed", self.id);
        match handle {
            Some(handle) => Ok(self.backend.close(&handle)?),
            None => Ok(()),
        }
    }

    /// Reads up to `max_len` bytes.
    ///
    /// Waits at most `timeout` (or [`DriverOptions::read_timeout`] when `None`)
    /// for the first byte; an empty vector means nothing arrived in time.
    pub fn read(&self, max_len: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        Ok(self
            .receive(max_len, timeout, |rx| rx.drain(max_len))?
            .unwrap_or_default())
    }

    /// Like [`read`](Self::read), copying into `buf` and returning the count.
    pub fn read_into(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let max_len = buf.len();
        Ok(self
            .receive(max_len, timeout, |rx| rx.drain_into(buf))?
            .unwrap_or(0))
    }

    fn receive<T>(
        &self,
        max_len: usize,
        timeout: Option<Duration>,
        take: impl FnOnce(&mut ReceiveBuffer) -> T,
    ) -> Result<Option<T>> {
        let deadline = self.deadline(timeout);
        let mut line = self.shared.line.lock();
        let (session, strategy) = match (line.state, line.strategy) {
            (DriverState::Open, Some(strategy)) => (line.session, strategy),
            _ => return Err(StateError::NotOpen.into()),
        };
        if max_len == 0 {
            return Ok(None);
        }
        if !strategy.is_async() {
            drop(line);
            return self.poll_until(session, deadline, take);
        }

        loop {
            if !line.is_session_open(session) {
                return Err(StateError::NotOpen.into());
            }
            if line.rx.is_ready() {
                break;
            }
            if let Some(e) = line.rx_error.take() {
                return Err(e.into());
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            // Releases the lock while parked so the worker can append.
            self.shared.data_ready.wait_until(&mut line, deadline);
        }

        let out = take(&mut line.rx);
        if line.rx.is_ready() {
            self.shared.data_ready.notify_one();
        }
        Ok(Some(out))
    }

    fn poll_until<T>(
        &self,
        session: u64,
        deadline: Instant,
        take: impl FnOnce(&mut ReceiveBuffer) -> T,
    ) -> Result<Option<T>> {
        loop {
            let handle = {
                let mut line = self.shared.line.lock();
                if !line.is_session_open(session) {
                    return Err(StateError::NotOpen.into());
                }
                if line.rx.is_ready() {
                    return Ok(Some(take(&mut line.rx)));
                }
                match line.handle.clone() {
                    Some(handle) => handle,
                    None => return Err(StateError::NotOpen.into()),
                }
            };

            let polled = match self.backend.poll_receive(&handle) {
                Ok(polled) => polled,
                Err(_) if !self.shared.line.lock().is_session_open(session) => {
                    return Err(StateError::NotOpen.into());
                }
                Err(e) => return Err(e.into()),
            };
            if let Some(chunk) = polled {
                let mut line = self.shared.line.lock();
                if !line.is_session_open(session) {
                    return Err(StateError::NotOpen.into());
                }
                if line.rx.push(&chunk) > 0 {
                    continue;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(self.options.poll_interval.min(deadline - now));
        }
    }

    fn deadline(&self, timeout: Option<Duration>) -> Instant {
        let now = Instant::now();
        let timeout = timeout.unwrap_or(self.options.read_timeout);
        now.checked_add(timeout)
            .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
    }

    /// One transmit attempt; returns how many bytes the backend accepted.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let (session, handle) = {
            let line = self.shared.line.lock();
            match (line.state, &line.handle) {
                (DriverState::Open, Some(handle)) => (line.session, handle.clone()),
                _ => return Err(StateError::NotOpen.into()),
            }
        };
        if data.is_empty() {
            return Ok(0);
        }
        match self.backend.transmit(&handle, data) {
            Ok(accepted) => Ok(accepted.min(data.len())),
            // A close that raced this call invalidated the handle.
            Err(_) if !self.shared.line.lock().is_session_open(session) => Err(StateError::NotOpen.into()),
            Err(e) => Err(e.into()),
        }
    }
}

impl<B: PeripheralBackend> Drop for UartDriver<B> {
    fn drop(&mut self) {
        if self.state() != DriverState::Open {
            return;
        }
        if let Err(e) = self.close() {
            log::error!("uart{}: close on drop failed: {e}", self.id);
        }
    }
}
