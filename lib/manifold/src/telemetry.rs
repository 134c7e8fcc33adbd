//! Events pushed to downstream sinks. Subscribers get their own unbounded
//! queue; a slow or dead subscriber never holds up the poller.

use crossbeam_channel as channel;
use serde_derive::Serialize;
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize)]
pub struct Measurement {
    pub ts: u64,
    pub port: String,
    pub address: u8,
    pub fmeasure: f32,
    pub fsetpoint: f32,
    pub measure: u16,
    pub setpoint: u16,
    pub fluid: String,
    pub capacity: f32,
    pub device_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationSkip {
    pub ts: u64,
    pub port: String,
    pub address: u8,
    pub kind: String,
    pub value: f32,
    pub capacity: f32,
    pub threshold: f32,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecovery {
    pub ts: u64,
    pub port: String,
    pub address: u8,
    pub recoveries_total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub ts: u64,
    pub port: String,
    pub address: Option<u8>,
    pub error_type: String,
    pub message: String,
    pub details: String,
}

#[derive(Debug, Clone, Serialize)]
pub enum TelemetryEvent {
    Measurement(Measurement),
    ValidationSkip(ValidationSkip),
    ConnectionRecovery(ConnectionRecovery),
    Error(ErrorEvent),
}

/// Fans events out to every live subscriber.
pub struct TelemetryHub {
    subscribers: Mutex<Vec<channel::Sender<TelemetryEvent>>>,
}

impl TelemetryHub {
    #[inline]
    pub fn new() -> TelemetryHub {
        TelemetryHub {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a new subscriber and returns its event queue.
    pub fn subscribe(&self) -> channel::Receiver<TelemetryEvent> {
        let (tx, rx) = channel::unbounded();
        self.subscribers
            .lock()
            .expect("Telemetry hub lock poisoned")
            .push(tx);
        rx
    }

    /// Delivers an event to all subscribers, dropping the ones that have
    /// gone away.
    pub fn publish(&self, event: TelemetryEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("Telemetry hub lock poisoned");

        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
