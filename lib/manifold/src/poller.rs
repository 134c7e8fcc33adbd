//! The per-port poller. A single cooperative loop interleaves prioritized
//! user commands, one reply-gated asynchronous command at a time and the
//! periodic measurement sweep across every registered address. Producers on
//! other threads only ever touch the channels.

use crate::config::PollSettings;
use crate::gate::PortGate;
use crate::health::{self, HealthBoard};
use crate::instrument::Instrument;
use crate::support::{BusError, BusResult};
use crate::telemetry::{
    ConnectionRecovery, ErrorEvent, Measurement, TelemetryEvent, TelemetryHub, ValidationSkip,
};
use crossbeam_channel as channel;
use indexmap::IndexMap;
use propar::logging::{self, Logger};
use propar::message::Parameter;
use propar::params::{self, dde};
use propar::time::timestamp_secs;
use propar::value::Value;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Commands drained from the priority queue per tick.
const PRIORITY_BATCH: usize = 5;

/// Device identification number of a digital mass flow controller.
const DMFC_IDENT: i8 = 7;
/// A DMFC measurement above this multiple of capacity is noise, not flow.
const DMFC_CAPACITY_FACTOR: f32 = 1.5;

/// The measurement bundle read from every polled node.
const POLL_BUNDLE: [u16; 8] = [
    dde::FMEASURE,
    dde::FLUID_NAME,
    dde::MEASURE,
    dde::SETPOINT,
    dde::FSETPOINT,
    dde::CAPACITY,
    dde::DEVICE_TYPE,
    dde::IDENT_NUMBER,
];

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Priority {
    Critical = 1,
    High = 2,
    Normal = 3,
    Low = 4,
    Background = 5,
}

/// What a queued command does to its instrument.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    SetFlow(f32),
    SetPercent(f32),
    SetFluid(u8),
    SetUserTag(String),
    SetControlMode(u8),
    Stop,
}

impl CommandKind {
    pub fn label(&self) -> &'static str {
        match self {
            CommandKind::SetFlow(_) => "fset_flow",
            CommandKind::SetPercent(_) => "set_pct",
            CommandKind::SetFluid(_) => "set_fluid",
            CommandKind::SetUserTag(_) => "set_usertag",
            CommandKind::SetControlMode(_) => "set_control_mode",
            CommandKind::Stop => "stop",
        }
    }

    /// The write this command boils down to.
    fn dde_value(&self) -> (u16, Value) {
        match self {
            CommandKind::SetFlow(flow) => (dde::FSETPOINT, Value::Float(*flow)),
            CommandKind::SetPercent(pct) => (dde::SETPOINT, Value::Int16(percent_to_counts(*pct))),
            CommandKind::SetFluid(index) => (dde::FLUID_INDEX, Value::Int8(*index as i8)),
            CommandKind::SetUserTag(tag) => (dde::USER_TAG, Value::String(tag.clone())),
            CommandKind::SetControlMode(mode) => (dde::CONTROL_MODE, Value::Int8(*mode as i8)),
            CommandKind::Stop => (dde::SETPOINT, Value::Int16(0)),
        }
    }
}

/// Setpoint counts run 0..=32000 for 0..=100%.
#[inline]
fn percent_to_counts(pct: f32) -> u16 {
    let clamped = if pct < 0.0 {
        0.0
    } else if pct > 100.0 {
        100.0
    } else {
        pct
    };

    (clamped * 320.0).round() as u16
}

#[derive(Debug, Clone)]
pub struct PriorityCommand {
    pub address: u8,
    pub kind: CommandKind,
    pub priority: Priority,
}

#[derive(Debug, Clone)]
pub struct AsyncCommand {
    pub address: u8,
    pub kind: CommandKind,
    /// Reply wait override; the configured default applies otherwise.
    pub timeout: Option<Duration>,
}

enum PollerControl {
    AddNode { address: u8, period: Duration },
    RemoveNode { address: u8 },
    Shutdown,
}

struct QueuedCommand {
    priority: Priority,
    seq: u64,
    address: u8,
    kind: CommandKind,
}

// Heap order: lowest (priority, seq) first.
impl Ord for QueuedCommand {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

impl PartialOrd for QueuedCommand {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedCommand {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedCommand {}

struct NodeEntry {
    period: Duration,
    next_due: Instant,
}

struct InFlight {
    address: u8,
    label: &'static str,
    started_at: Instant,
    timeout: Duration,
    latch: bool,
}

/// Producer side of a poller: everything here is safe to call from any
/// thread.
#[derive(Clone)]
pub struct PollerProducers {
    priority_tx: channel::Sender<PriorityCommand>,
    async_tx: channel::Sender<AsyncCommand>,
    control_tx: channel::Sender<PollerControl>,
}

pub struct Poller {
    port: String,
    gate: Arc<PortGate>,
    health: Arc<Mutex<HealthBoard>>,
    hub: Arc<TelemetryHub>,
    settings: PollSettings,
    nodes: IndexMap<u8, NodeEntry>,
    priority_rx: channel::Receiver<PriorityCommand>,
    async_rx: channel::Receiver<AsyncCommand>,
    control_rx: channel::Receiver<PollerControl>,
    queue: BinaryHeap<QueuedCommand>,
    enqueue_seq: u64,
    in_flight: Option<InFlight>,
    stopping: bool,
    log: Logger,
}

impl Poller {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        port: &str,
        gate: Arc<PortGate>,
        health: Arc<Mutex<HealthBoard>>,
        hub: Arc<TelemetryHub>,
        settings: PollSettings,
        log: L,
    ) -> (Poller, PollerProducers) {
        let (priority_tx, priority_rx) = channel::unbounded();
        let (async_tx, async_rx) = channel::unbounded();
        let (control_tx, control_rx) = channel::unbounded();

        let poller = Poller {
            port: port.to_string(),
            gate,
            health,
            hub,
            settings,
            nodes: IndexMap::new(),
            priority_rx,
            async_rx,
            control_rx,
            queue: BinaryHeap::new(),
            enqueue_seq: 0,
            in_flight: None,
            stopping: false,
            log: logging::child(log),
        };

        let producers = PollerProducers {
            priority_tx,
            async_tx,
            control_tx,
        };

        (poller, producers)
    }

    /// Run the loop until told to stop.
    pub fn run(&mut self) {
        logging::info!(self.log, "poller running"; "context" => "run", "port" => &self.port);

        while !self.stopping {
            self.tick(Instant::now());
            thread::sleep(self.settings.idle_slice());
        }

        logging::info!(self.log, "poller stopped"; "context" => "run", "port" => &self.port);
    }

    /// One scheduler pass: control messages, priority commands, the async
    /// slot, then periodic polling.
    pub fn tick(&mut self, now: Instant) {
        self.apply_control(now);
        self.run_priority(now);
        self.run_async(now);
        self.run_periodic(now);
    }

    fn apply_control(&mut self, now: Instant) {
        while let Ok(control) = self.control_rx.try_recv() {
            match control {
                PollerControl::AddNode { address, period } => {
                    logging::info!(self.log, "node registered";
                                   "context" => "apply_control",
                                   "port" => &self.port,
                                   "address" => address,
                                   "period_ms" => period.as_millis() as u64);

                    self.nodes.insert(
                        address,
                        NodeEntry {
                            period,
                            next_due: now,
                        },
                    );
                }
                PollerControl::RemoveNode { address } => {
                    self.nodes.shift_remove(&address);
                }
                PollerControl::Shutdown => self.stopping = true,
            }
        }
    }

    fn run_priority(&mut self, now: Instant) {
        while let Ok(command) = self.priority_rx.try_recv() {
            self.enqueue_seq += 1;
            self.queue.push(QueuedCommand {
                priority: command.priority,
                seq: self.enqueue_seq,
                address: command.address,
                kind: command.kind,
            });
        }

        for _ in 0..PRIORITY_BATCH {
            let command = match self.queue.pop() {
                Some(command) => command,
                None => break,
            };

            logging::debug!(self.log, "priority command";
                            "context" => "run_priority",
                            "port" => &self.port,
                            "address" => command.address,
                            "kind" => command.kind.label(),
                            "priority" => ?command.priority);

            drop(self.execute(command.address, &command.kind, now));
        }
    }

    fn run_async(&mut self, now: Instant) {
        if let Some(flight) = &self.in_flight {
            if flight.latch {
                logging::debug!(self.log, "async command replied";
                                "context" => "run_async",
                                "port" => &self.port,
                                "address" => flight.address,
                                "kind" => flight.label);
                self.in_flight = None;
            } else if now.duration_since(flight.started_at) >= flight.timeout {
                logging::warn!(self.log, "async command timed out waiting for reply";
                               "context" => "run_async",
                               "port" => &self.port,
                               "address" => flight.address,
                               "kind" => flight.label);
                self.in_flight = None;
            } else {
                return;
            }
        }

        if let Ok(command) = self.async_rx.try_recv() {
            let timeout = command
                .timeout
                .unwrap_or_else(|| self.settings.async_reply_timeout());

            let result = self.execute(command.address, &command.kind, now);

            // A completed wire operation is taken as the reply; the timeout
            // only matters when the operation itself went nowhere.
            self.in_flight = Some(InFlight {
                address: command.address,
                label: command.kind.label(),
                started_at: now,
                timeout,
                latch: result.is_ok(),
            });
        }
    }

    fn run_periodic(&mut self, now: Instant) {
        let due: Vec<u8> = self
            .nodes
            .iter()
            .filter(|(_, entry)| entry.next_due <= now)
            .map(|(address, _)| *address)
            .collect();

        for address in due {
            let quarantined = self
                .health
                .lock()
                .expect("Health board lock poisoned")
                .is_quarantined(address, now);

            if quarantined {
                logging::trace!(self.log, "skipping quarantined node";
                                "context" => "run_periodic",
                                "port" => &self.port,
                                "address" => address);
                continue;
            }

            self.poll_node(address, now);

            if let Some(entry) = self.nodes.get_mut(&address) {
                entry.next_due = now + entry.period;
            }
        }
    }

    fn poll_node(&mut self, address: u8, now: Instant) {
        let bundle: Vec<Parameter> = POLL_BUNDLE
            .iter()
            .map(|&number| {
                params::lookup(number)
                    .expect("Poll bundle parameter missing from the database")
                    .parameter()
            })
            .collect();

        let result = Instrument::new(self.gate.clone(), address, &self.log)
            .and_then(|instrument| instrument.read_parameters(&bundle));

        match result {
            Ok(values) => {
                self.note_success(address, now);
                self.emit_measurement(address, &values);
            }
            Err(err) => self.note_failure(address, &err, now, "poll"),
        }
    }

    fn execute(&mut self, address: u8, kind: &CommandKind, now: Instant) -> BusResult<()> {
        let (number, value) = kind.dde_value();

        let result = Instrument::new(self.gate.clone(), address, &self.log)
            .and_then(|instrument| instrument.write_dde(number, value));

        match &result {
            Ok(()) => self.note_success(address, now),
            Err(err) => self.note_failure(address, err, now, kind.label()),
        }

        result
    }

    fn note_success(&mut self, address: u8, now: Instant) {
        let recovered = self
            .health
            .lock()
            .expect("Health board lock poisoned")
            .record_success(address, now);

        if let Some(recoveries_total) = recovered {
            self.hub
                .publish(TelemetryEvent::ConnectionRecovery(ConnectionRecovery {
                    ts: timestamp_secs(),
                    port: self.port.clone(),
                    address,
                    recoveries_total,
                }));
        }
    }

    fn note_failure(&mut self, address: u8, err: &BusError, now: Instant, context: &str) {
        let class = health::classify_bus_error(err);

        let quarantined = self
            .health
            .lock()
            .expect("Health board lock poisoned")
            .record_failure(address, class, now);

        if quarantined {
            logging::warn!(self.log, "node enters quarantine";
                           "context" => "note_failure",
                           "port" => &self.port,
                           "address" => address);
        }

        self.hub.publish(TelemetryEvent::Error(ErrorEvent {
            ts: timestamp_secs(),
            port: self.port.clone(),
            address: Some(address),
            error_type: class.name().to_string(),
            message: format!("{:?}", err),
            details: context.to_string(),
        }));
    }

    fn emit_measurement(&mut self, address: u8, values: &[propar::message::ParameterValue]) {
        let fmeasure = values[0].value.as_f32().unwrap_or(0.0);
        let fluid = values[1].value.as_str().unwrap_or("").to_string();
        let measure = values[2].value.as_u16().unwrap_or(0);
        let setpoint = values[3].value.as_u16().unwrap_or(0);
        let fsetpoint = values[4].value.as_f32().unwrap_or(0.0);
        let capacity = values[5].value.as_f32().unwrap_or(0.0);
        let device_type = values[6].value.as_str().unwrap_or("").to_string();
        let ident_nr = values[7].value.as_i8().unwrap_or(0);

        // A controller cannot physically flow half again over its capacity;
        // such readings are transients and are withheld from subscribers.
        if ident_nr == DMFC_IDENT && fmeasure > DMFC_CAPACITY_FACTOR * capacity {
            self.hub.publish(TelemetryEvent::ValidationSkip(ValidationSkip {
                ts: timestamp_secs(),
                port: self.port.clone(),
                address,
                kind: "dmfc_capacity_exceeded".to_string(),
                value: fmeasure,
                capacity,
                threshold: DMFC_CAPACITY_FACTOR * capacity,
                reason: format!(
                    "fMeasure {} exceeds {} times capacity {}",
                    fmeasure, DMFC_CAPACITY_FACTOR, capacity
                ),
            }));
            return;
        }

        self.hub.publish(TelemetryEvent::Measurement(Measurement {
            ts: timestamp_secs(),
            port: self.port.clone(),
            address,
            fmeasure,
            fsetpoint,
            measure,
            setpoint,
            fluid,
            capacity,
            device_type,
        }));
    }
}

impl PollerProducers {
    pub fn queue_priority(&self, command: PriorityCommand) -> BusResult<()> {
        self.priority_tx
            .send(command)
            .map_err(|_| BusError::PortLost("poller gone".into()))
    }

    pub fn queue_async(&self, command: AsyncCommand) -> BusResult<()> {
        self.async_tx
            .send(command)
            .map_err(|_| BusError::PortLost("poller gone".into()))
    }

    pub fn add_node(&self, address: u8, period: Duration) -> BusResult<()> {
        self.control_tx
            .send(PollerControl::AddNode { address, period })
            .map_err(|_| BusError::PortLost("poller gone".into()))
    }

    pub fn remove_node(&self, address: u8) -> BusResult<()> {
        self.control_tx
            .send(PollerControl::RemoveNode { address })
            .map_err(|_| BusError::PortLost("poller gone".into()))
    }

    fn shutdown(&self) {
        drop(self.control_tx.send(PollerControl::Shutdown));
    }
}

/// A poller running on its own thread.
pub struct PollerHandle {
    producers: PollerProducers,
    worker: Option<thread::JoinHandle<()>>,
}

impl PollerHandle {
    pub fn spawn<'a, L: Into<Option<&'a Logger>>>(
        port: &str,
        gate: Arc<PortGate>,
        health: Arc<Mutex<HealthBoard>>,
        hub: Arc<TelemetryHub>,
        settings: PollSettings,
        log: L,
    ) -> io::Result<PollerHandle> {
        let (mut poller, producers) = Poller::new(port, gate, health, hub, settings, log);

        let worker = thread::Builder::new()
            .name(format!("{}-poll", port))
            .spawn(move || poller.run())?;

        Ok(PollerHandle {
            producers,
            worker: Some(worker),
        })
    }

    #[inline]
    pub fn producers(&self) -> &PollerProducers {
        &self.producers
    }

    /// Stops the loop and waits for the thread to wind down.
    pub fn shutdown(&mut self) {
        self.producers.shutdown();

        if let Some(worker) = self.worker.take() {
            drop(worker.join());
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
