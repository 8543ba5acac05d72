use thiserror::Error;

/// Failure reported by a [`PeripheralBackend`](crate::PeripheralBackend).
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),
    #[error("backend handle is closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// Lifecycle precondition that an operation found violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("must be closed before configuration")]
    MustBeClosed,
    #[error("already open")]
    AlreadyOpen,
    #[error("must be configured before opening")]
    NotConfigured,
    #[error("not open")]
    NotOpen,
}

#[derive(Debug, Error)]
pub enum UartError {
    #[error("invalid state: {0}")]
    InvalidState(StateError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

impl UartError {
    pub fn state(&self) -> Option<StateError> {
        match self {
            Self::InvalidState(s) => Some(*s),
            _ => None,
        }
    }

    pub fn is_not_open(&self) -> bool {
        self.state() == Some(StateError::NotOpen)
    }

    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

impl From<StateError> for UartError {
    fn from(e: StateError) -> Self {
        Self::InvalidState(e)
    }
}

pub type Result<T> = std::result::Result<T, UartError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_errors_keep_their_kind() {
        let err: UartError = StateError::NotOpen.into();
        assert!(err.is_not_open());
        assert_eq!(err.to_string(), "invalid state: not open");

        let err: UartError = StateError::MustBeClosed.into();
        assert_eq!(err.state(), Some(StateError::MustBeClosed));
        assert!(!err.is_not_open());
    }

    #[test]
    fn backend_errors_convert() {
        let err: UartError = BackendError::Other("baud generator fault".into()).into();
        assert!(err.is_backend());
        assert_eq!(err.state(), None);
        assert_eq!(err.to_string(), "backend error: baud generator fault");
    }
}
