/// How receive completion is driven while the line is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStrategy {
    /// `read` polls the backend itself.
    Polling,
    Interrupt,
    Dma,
}

impl TransferStrategy {
    /// Whether receive completion arrives through the backend callback.
    pub fn is_async(&self) -> bool {
        !matches!(self, Self::Polling)
    }
}

impl std::str::FromStr for TransferStrategy {
    type Err = crate::UartError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "polling" | "poll" => Self::Polling,
            "interrupt" | "irq" => Self::Interrupt,
            "dma" => Self::Dma,
            _ => return Err(crate::UartError::InvalidArgument(format!("unknown strategy `{s}`"))),
        })
    }
}
