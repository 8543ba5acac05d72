//! In-memory backend for tests and demos.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{PeripheralBackend, RxCallback};
use crate::config::UartConfig;
use crate::error::BackendError;
use crate::strategy::TransferStrategy;

type SharedCallback = Arc<dyn Fn(Result<&[u8], BackendError>) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MockHandle(u32);

#[derive(Default)]
struct MockState {
    next_handle: u32,
    live: HashSet<u32>,
    opened: Vec<(UartConfig, TransferStrategy)>,
    closes: usize,
    transmitted: Vec<u8>,
    pending: VecDeque<Vec<u8>>,
    poll_error: Option<BackendError>,
    callback: Option<(u32, SharedCallback)>,
    fail_open: bool,
    fail_transmit: bool,
    fail_close: bool,
    fail_register: bool,
    transmit_limit: Option<usize>,
    transmit_delay: Option<Duration>,
}

/// Cloneable test double; clones share the same simulated line.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates bytes arriving on the line.
    ///
    /// With a registered callback the bytes are delivered immediately from the
    /// calling thread; otherwise they wait for the next `poll_receive`.
    /// Returns `true` when the callback was invoked.
    pub fn inject(&self, bytes: &[u8]) -> bool {
        let cb = {
            let mut st = self.state.lock();
            match &st.callback {
                Some((_, cb)) => cb.clone(),
                None => {
                    st.pending.push_back(bytes.to_vec());
                    return false;
                }
            }
        };
        cb(Ok(bytes));
        true
    }

    /// Simulates a receive failure, e.g. a framing error or an unplugged
    /// adapter. Without a callback the error is returned by the next
    /// `poll_receive`.
    pub fn inject_error(&self, err: BackendError) -> bool {
        let cb = {
            let mut st = self.state.lock();
            match &st.callback {
                Some((_, cb)) => cb.clone(),
                None => {
                    st.poll_error = Some(err);
                    return false;
                }
            }
        };
        cb(Err(err));
        true
    }

    pub fn fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    pub fn fail_transmit(&self, fail: bool) {
        self.state.lock().fail_transmit = fail;
    }

    pub fn fail_close(&self, fail: bool) {
        self.state.lock().fail_close = fail;
    }

    pub fn fail_register(&self, fail: bool) {
        self.state.lock().fail_register = fail;
    }

    /// Caps how many bytes one `transmit` accepts.
    pub fn set_transmit_limit(&self, limit: Option<usize>) {
        self.state.lock().transmit_limit = limit;
    }

    /// Makes every `transmit` sleep before touching the line.
    pub fn set_transmit_delay(&self, delay: Option<Duration>) {
        self.state.lock().transmit_delay = delay;
    }

    pub fn opened(&self) -> Vec<(UartConfig, TransferStrategy)> {
        self.state.lock().opened.clone()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    pub fn is_line_open(&self) -> bool {
        !self.state.lock().live.is_empty()
    }

    pub fn has_callback(&self) -> bool {
        self.state.lock().callback.is_some()
    }

    pub fn transmitted(&self) -> Vec<u8> {
        self.state.lock().transmitted.clone()
    }
}

impl MockState {
    fn check_live(&self, handle: &MockHandle) -> Result<(), BackendError> {
        if self.live.contains(&handle.0) {
            Ok(())
        } else {
            Err(BackendError::Closed)
        }
    }
}

impl PeripheralBackend for MockBackend {
    type Handle = MockHandle;

    fn open(&self, config: &UartConfig, strategy: TransferStrategy) -> Result<MockHandle, BackendError> {
        let mut st = self.state.lock();
        if st.fail_open {
            return Err(BackendError::Other("mock open failure".into()));
        }
        st.next_handle += 1;
        let id = st.next_handle;
        st.live.insert(id);
        st.opened.push((*config, strategy));
        Ok(MockHandle(id))
    }

    fn close(&self, handle: &MockHandle) -> Result<(), BackendError> {
        let mut st = self.state.lock();
        st.check_live(handle)?;
        st.live.remove(&handle.0);
        st.closes += 1;
        if matches!(st.callback, Some((owner, _)) if owner == handle.0) {
            st.callback = None;
        }
        st.pending.clear();
        st.poll_error = None;
        if st.fail_close {
            return Err(BackendError::Other("mock close failure".into()));
        }
        Ok(())
    }

    fn transmit(&self, handle: &MockHandle, bytes: &[u8]) -> Result<usize, BackendError> {
        let delay = self.state.lock().transmit_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut st = self.state.lock();
        st.check_live(handle)?;
        if st.fail_transmit {
            return Err(BackendError::Other("mock transmit failure".into()));
        }
        let n = st.transmit_limit.map_or(bytes.len(), |limit| limit.min(bytes.len()));
        st.transmitted.extend_from_slice(&bytes[..n]);
        Ok(n)
    }

    fn poll_receive(&self, handle: &MockHandle) -> Result<Option<Vec<u8>>, BackendError> {
        let mut st = self.state.lock();
        st.check_live(handle)?;
        if let Some(err) = st.poll_error.take() {
            return Err(err);
        }
        Ok(st.pending.pop_front())
    }

    fn register_receive_callback(&self, handle: &MockHandle, on_receive: RxCallback) -> Result<(), BackendError> {
        let mut st = self.state.lock();
        st.check_live(handle)?;
        if st.fail_register {
            return Err(BackendError::Unsupported("receive callbacks"));
        }
        st.callback = Some((handle.0, Arc::from(on_receive)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn inject_queues_until_a_callback_exists() {
        let mock = MockBackend::new();
        let h = mock.open(&UartConfig::default(), TransferStrategy::Polling).unwrap();
        assert!(!mock.inject(&[1, 2]));
        assert_eq!(mock.poll_receive(&h).unwrap(), Some(vec![1, 2]));
        assert_eq!(mock.poll_receive(&h).unwrap(), None);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        mock.register_receive_callback(&h, Box::new(move |rx: Result<&[u8], BackendError>| {
            if let Ok(b) = rx {
                counter.fetch_add(b.len(), Ordering::SeqCst);
            }
        }))
        .unwrap();
        assert!(mock.inject(&[3, 4, 5]));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn closed_handles_are_rejected() {
        let mock = MockBackend::new();
        let h = mock.open(&UartConfig::default(), TransferStrategy::Dma).unwrap();
        mock.close(&h).unwrap();
        assert!(matches!(mock.transmit(&h, b"x"), Err(BackendError::Closed)));
        assert!(matches!(mock.close(&h), Err(BackendError::Closed)));
        assert_eq!(mock.close_count(), 1);
        assert!(!mock.is_line_open());
    }

    #[test]
    fn errors_reach_the_next_poll_once() {
        let mock = MockBackend::new();
        let h = mock.open(&UartConfig::default(), TransferStrategy::Polling).unwrap();
        assert!(!mock.inject_error(BackendError::Other("framing".into())));
        assert!(matches!(mock.poll_receive(&h), Err(BackendError::Other(_))));
        assert_eq!(mock.poll_receive(&h).unwrap(), None);
    }

    #[test]
    fn transmit_limit_produces_partial_writes() {
        let mock = MockBackend::new();
        let h = mock.open(&UartConfig::default(), TransferStrategy::Polling).unwrap();
        mock.set_transmit_limit(Some(2));
        assert_eq!(mock.transmit(&h, b"abcd").unwrap(), 2);
        assert_eq!(mock.transmitted(), b"ab");
    }
}
