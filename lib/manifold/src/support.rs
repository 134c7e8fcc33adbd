use propar::message::StatusCode;
use propar::support::ProtocolError;

pub type BusResult<T> = Result<T, BusError>;

/// Errors surfaced to users of the bus. The port gate consults
/// `is_retryable` to decide between repeating an operation and giving up.
#[derive(Debug, Clone, PartialEq)]
pub enum BusError {
    /// The DDE number is not in the parameter database.
    UnknownParameter(u16),
    /// The address is outside the assignable range.
    InvalidAddress(u8),
    /// Encoding or decoding failed.
    Protocol(ProtocolError),
    /// The instrument answered with a non-zero status.
    Status(StatusCode),
    /// No response arrived within the response timeout.
    TimeoutAnswer,
    /// The serial handle failed underneath us; the description is kept for
    /// the health classifier.
    PortLost(String),
    /// The address is temporarily excluded from polling.
    Quarantined(u8),
    /// The port name is not registered.
    UnknownPort(String),
}

impl BusError {
    /// Whether the gate may retry the operation. Parse errors on the reply
    /// and transport level failures are worth repeating; everything else is
    /// deterministic and surfaces immediately.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        match self {
            BusError::TimeoutAnswer | BusError::PortLost(_) => true,
            BusError::Protocol(err) => matches!(
                err,
                ProtocolError::MalformedMessage
                    | ProtocolError::TruncatedValue
                    | ProtocolError::Io(_)
            ),
            _ => false,
        }
    }

    /// Whether recovering from this error requires rebuilding the serial
    /// handle.
    #[inline]
    pub fn needs_recreation(&self) -> bool {
        matches!(self, BusError::PortLost(_))
    }
}

impl From<ProtocolError> for BusError {
    #[inline]
    fn from(err: ProtocolError) -> Self {
        BusError::Protocol(err)
    }
}
