//! Connection health bookkeeping: folds opaque transport errors into a small
//! set of classes, tracks consecutive failures per address, quarantines
//! addresses that keep failing and accounts for recoveries.

use crate::support::BusError;
use hashbrown::HashMap;
use propar::logging::{self, Logger};
use std::time::{Duration, Instant};

/// Failures an address racks up before it is taken out of rotation.
pub const QUARANTINE_THRESHOLD: u32 = 10;
/// How long a quarantined address sits out.
pub const QUARANTINE_PERIOD: Duration = Duration::from_secs(60);
/// An address with no errors for this long starts from a clean slate.
pub const QUIET_RESET: Duration = Duration::from_secs(30);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorClass {
    BadFileDescriptor,
    PortClosed,
    SerialConnectionLost,
    DeviceDisconnected,
    Timeout,
    ParseError,
    PermissionDenied,
    Other,
}

impl ErrorClass {
    /// Stable name used in error events.
    pub fn name(self) -> &'static str {
        match self {
            ErrorClass::BadFileDescriptor => "bad_file_descriptor",
            ErrorClass::PortClosed => "port_closed",
            ErrorClass::SerialConnectionLost => "serial_connection_lost",
            ErrorClass::DeviceDisconnected => "device_disconnected",
            ErrorClass::Timeout => "timeout",
            ErrorClass::ParseError => "parse_error",
            ErrorClass::PermissionDenied => "permission_denied",
            ErrorClass::Other => "other",
        }
    }

    /// How long to hold off before touching the port again after a failure
    /// of this class.
    pub fn recovery_delay(self) -> Duration {
        match self {
            ErrorClass::BadFileDescriptor | ErrorClass::DeviceDisconnected => {
                Duration::from_millis(1_000)
            }
            ErrorClass::PortClosed | ErrorClass::SerialConnectionLost => Duration::from_millis(500),
            ErrorClass::Timeout => Duration::from_millis(100),
            _ => Duration::from_millis(50),
        }
    }
}

// Substring tables, checked in order; the first hit wins.
const CLASS_TABLE: &[(ErrorClass, &[&str])] = &[
    (
        ErrorClass::BadFileDescriptor,
        &["bad file descriptor", "errno 9", "write failed", "read failed"],
    ),
    (
        ErrorClass::PortClosed,
        &["port is closed", "file descriptor is none", "port that is not open"],
    ),
    (
        ErrorClass::SerialConnectionLost,
        &["serial connection lost", "connection lost"],
    ),
    (
        ErrorClass::DeviceDisconnected,
        &[
            "device disconnected",
            "device not configured",
            "no such device",
            "no such file or directory",
        ],
    ),
    (ErrorClass::Timeout, &["timeout"]),
    (
        ErrorClass::ParseError,
        &[
            "list index out of range",
            "index out of range",
            "unpack requires",
            "struct.error",
        ],
    ),
    (ErrorClass::PermissionDenied, &["permission denied"]),
];

/// Classify an opaque error description.
pub fn classify(message: &str) -> ErrorClass {
    let lowered = message.to_lowercase();

    for (class, needles) in CLASS_TABLE {
        if needles.iter().any(|needle| lowered.contains(needle)) {
            return *class;
        }
    }

    ErrorClass::Other
}

/// Classify a surfaced bus error.
pub fn classify_bus_error(err: &BusError) -> ErrorClass {
    match err {
        BusError::TimeoutAnswer => ErrorClass::Timeout,
        BusError::PortLost(message) => classify(message),
        BusError::Protocol(_) => ErrorClass::ParseError,
        BusError::Status(status) if matches!(status, propar::message::StatusCode::TimeoutAnswer) => {
            ErrorClass::Timeout
        }
        _ => ErrorClass::Other,
    }
}

#[derive(Debug, Default)]
struct NodeHealth {
    consecutive_errors: u32,
    last_error: Option<Instant>,
    quarantined_until: Option<Instant>,
    recoveries: u64,
    last_recovery: Option<Instant>,
    uptime_origin: Option<Instant>,
    // A failure has been seen since the last success.
    failed: bool,
}

/// Per-port health state, keyed by address.
pub struct HealthBoard {
    nodes: HashMap<u8, NodeHealth>,
    log: Logger,
}

impl HealthBoard {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> HealthBoard {
        HealthBoard {
            nodes: HashMap::new(),
            log: logging::child(log),
        }
    }

    /// Record a classified failure. Returns true if this failure pushed the
    /// address into quarantine.
    pub fn record_failure(&mut self, address: u8, class: ErrorClass, now: Instant) -> bool {
        let node = self.nodes.entry(address).or_default();

        Self::apply_quiet_reset(node, now);

        node.consecutive_errors += 1;
        node.last_error = Some(now);
        node.failed = true;

        if node.consecutive_errors >= QUARANTINE_THRESHOLD && node.quarantined_until.is_none() {
            node.quarantined_until = Some(now + QUARANTINE_PERIOD);

            logging::warn!(self.log, "address quarantined";
                           "context" => "record_failure",
                           "address" => address,
                           "class" => class.name(),
                           "consecutive_errors" => node.consecutive_errors);

            return true;
        }

        logging::debug!(self.log, "failure recorded";
                        "context" => "record_failure",
                        "address" => address,
                        "class" => class.name(),
                        "consecutive_errors" => node.consecutive_errors);

        false
    }

    /// Record a successful exchange. Returns the running recovery total when
    /// this success ended a failure streak.
    pub fn record_success(&mut self, address: u8, now: Instant) -> Option<u64> {
        let node = self.nodes.entry(address).or_default();

        node.consecutive_errors = 0;
        node.quarantined_until = None;

        if node.uptime_origin.is_none() {
            node.uptime_origin = Some(now);
        }

        if node.failed {
            node.failed = false;
            node.recoveries += 1;
            node.last_recovery = Some(now);

            logging::info!(self.log, "address recovered";
                           "context" => "record_success",
                           "address" => address,
                           "recoveries" => node.recoveries);

            return Some(node.recoveries);
        }

        None
    }

    /// Whether the poller should skip this address right now. Expired
    /// quarantines are cleared on the way through.
    pub fn is_quarantined(&mut self, address: u8, now: Instant) -> bool {
        let node = match self.nodes.get_mut(&address) {
            Some(node) => node,
            None => return false,
        };

        Self::apply_quiet_reset(node, now);

        match node.quarantined_until {
            Some(until) if now < until => true,
            Some(_) => {
                node.quarantined_until = None;
                node.consecutive_errors = 0;

                logging::info!(self.log, "quarantine lifted";
                               "context" => "is_quarantined",
                               "address" => address);

                false
            }
            None => false,
        }
    }

    /// Mark an address recovered by an outside action, forced reconnection
    /// in particular. Returns the running recovery total.
    pub fn mark_recovered(&mut self, address: u8, now: Instant) -> u64 {
        let node = self.nodes.entry(address).or_default();

        node.consecutive_errors = 0;
        node.quarantined_until = None;
        node.failed = false;
        node.recoveries += 1;
        node.last_recovery = Some(now);
        node.uptime_origin = Some(now);

        node.recoveries
    }

    /// Monotonic uptime since the address last (re)appeared.
    #[inline]
    pub fn uptime(&self, address: u8, now: Instant) -> Option<Duration> {
        self.nodes
            .get(&address)?
            .uptime_origin
            .map(|origin| now.duration_since(origin))
    }

    #[inline]
    pub fn consecutive_errors(&self, address: u8) -> u32 {
        self.nodes
            .get(&address)
            .map_or(0, |node| node.consecutive_errors)
    }

    #[inline]
    pub fn recoveries(&self, address: u8) -> u64 {
        self.nodes.get(&address).map_or(0, |node| node.recoveries)
    }

    /// All addresses the board has seen.
    #[inline]
    pub fn addresses(&self) -> Vec<u8> {
        let mut addresses: Vec<u8> = self.nodes.keys().copied().collect();
        addresses.sort_unstable();
        addresses
    }

    #[inline]
    fn apply_quiet_reset(node: &mut NodeHealth, now: Instant) {
        if let Some(last) = node.last_error {
            if now.duration_since(last) >= QUIET_RESET {
                node.consecutive_errors = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_table() {
        assert_eq!(classify("OS error: Bad file descriptor"), ErrorClass::BadFileDescriptor);
        assert_eq!(classify("write failed: broken pipe"), ErrorClass::BadFileDescriptor);
        assert_eq!(classify("the port is closed"), ErrorClass::PortClosed);
        assert_eq!(classify("Serial connection lost"), ErrorClass::SerialConnectionLost);
        assert_eq!(classify("No such device (os error 19)"), ErrorClass::DeviceDisconnected);
        assert_eq!(classify("operation timeout"), ErrorClass::Timeout);
        assert_eq!(classify("index out of range"), ErrorClass::ParseError);
        assert_eq!(classify("Permission denied (os error 13)"), ErrorClass::PermissionDenied);
        assert_eq!(classify("something else entirely"), ErrorClass::Other);
    }

    #[test]
    fn test_classify_first_match_wins() {
        // Contains both a bad descriptor and a timeout needle; the earlier
        // class takes it.
        assert_eq!(
            classify("read failed after timeout"),
            ErrorClass::BadFileDescriptor
        );
    }

    #[test]
    fn test_recovery_delays() {
        assert_eq!(
            ErrorClass::BadFileDescriptor.recovery_delay(),
            Duration::from_millis(1_000)
        );
        assert_eq!(ErrorClass::PortClosed.recovery_delay(), Duration::from_millis(500));
        assert_eq!(ErrorClass::Timeout.recovery_delay(), Duration::from_millis(100));
        assert_eq!(ErrorClass::Other.recovery_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_quarantine_after_threshold() {
        let mut board = HealthBoard::new(None);
        let now = Instant::now();

        for i in 0..QUARANTINE_THRESHOLD {
            let quarantined = board.record_failure(5, ErrorClass::BadFileDescriptor, now);
            assert_eq!(quarantined, i == QUARANTINE_THRESHOLD - 1);
        }

        assert!(board.is_quarantined(5, now));
        assert!(board.is_quarantined(5, now + Duration::from_secs(59)));
        // Other addresses are unaffected.
        assert!(!board.is_quarantined(6, now));
        // The quarantine expires on its own.
        assert!(!board.is_quarantined(5, now + Duration::from_secs(61)));
        assert_eq!(board.consecutive_errors(5), 0);
    }

    #[test]
    fn test_success_resets_streak() {
        let mut board = HealthBoard::new(None);
        let now = Instant::now();

        for _ in 0..9 {
            board.record_failure(3, ErrorClass::Timeout, now);
        }
        assert_eq!(board.consecutive_errors(3), 9);

        let recovered = board.record_success(3, now);

        assert_eq!(recovered, Some(1));
        assert_eq!(board.consecutive_errors(3), 0);
    }

    #[test]
    fn test_success_clears_quarantine() {
        let mut board = HealthBoard::new(None);
        let now = Instant::now();

        for _ in 0..QUARANTINE_THRESHOLD {
            board.record_failure(3, ErrorClass::Timeout, now);
        }
        assert!(board.is_quarantined(3, now));

        board.record_success(3, now);

        assert!(!board.is_quarantined(3, now));
    }

    #[test]
    fn test_quiet_reset() {
        let mut board = HealthBoard::new(None);
        let now = Instant::now();

        for _ in 0..9 {
            board.record_failure(3, ErrorClass::Timeout, now);
        }

        // A failure after half a minute of silence starts a fresh streak.
        let later = now + QUIET_RESET + Duration::from_secs(1);
        board.record_failure(3, ErrorClass::Timeout, later);

        assert_eq!(board.consecutive_errors(3), 1);
    }

    #[test]
    fn test_recovery_accounting() {
        let mut board = HealthBoard::new(None);
        let now = Instant::now();

        board.record_failure(3, ErrorClass::Timeout, now);
        assert_eq!(board.record_success(3, now), Some(1));
        // A success with no failure in between is not a recovery.
        assert_eq!(board.record_success(3, now), None);

        board.record_failure(3, ErrorClass::Timeout, now);
        assert_eq!(board.record_success(3, now), Some(2));
        assert_eq!(board.recoveries(3), 2);
    }

    #[test]
    fn test_mark_recovered_and_uptime() {
        let mut board = HealthBoard::new(None);
        let now = Instant::now();

        board.record_failure(3, ErrorClass::DeviceDisconnected, now);

        let total = board.mark_recovered(3, now);

        assert_eq!(total, 1);
        assert_eq!(board.consecutive_errors(3), 0);

        let uptime = board.uptime(3, now + Duration::from_secs(5)).unwrap();
        assert_eq!(uptime, Duration::from_secs(5));
    }

    #[test]
    fn test_uptime_unknown_address() {
        let board = HealthBoard::new(None);

        assert!(board.uptime(9, Instant::now()).is_none());
    }
}
