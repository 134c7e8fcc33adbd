//! The process-wide registry. One `Manifold` owns every open port: its gate,
//! its health board and its poller. There is deliberately no module level
//! state; applications construct a registry at startup and tests build as
//! many private ones as they like.

use crate::config::ManifoldConfig;
use crate::gate::{PortGate, PortStats};
use crate::health::HealthBoard;
use crate::instrument::Instrument;
use crate::link::{LinkFactory, SerialLink};
use crate::poller::{
    AsyncCommand, CommandKind, PollerHandle, PollerProducers, Priority, PriorityCommand,
};
use crate::scanner::{self, ScannedInstrument};
use crate::support::{BusError, BusResult};
use crate::telemetry::{ConnectionRecovery, TelemetryEvent, TelemetryHub};
use crossbeam_channel as channel;
use hashbrown::HashMap;
use propar::logging::{self, Logger};
use propar::message::{Parameter, ParameterValue};
use propar::time::timestamp_secs;
use propar::value::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct PortEntry {
    gate: Arc<PortGate>,
    health: Arc<Mutex<HealthBoard>>,
    poller: PollerHandle,
}

pub struct Manifold {
    config: ManifoldConfig,
    ports: Mutex<HashMap<String, PortEntry>>,
    hub: Arc<TelemetryHub>,
    log: Logger,
}

impl Manifold {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(config: ManifoldConfig, log: L) -> Manifold {
        Manifold {
            config,
            ports: Mutex::new(HashMap::new()),
            hub: Arc::new(TelemetryHub::new()),
            log: logging::child(log),
        }
    }

    /// Registers a port backed by the given link factory and starts its
    /// poller. Opening an already open port is a no-op.
    pub fn open_port(&self, name: &str, factory: LinkFactory) -> BusResult<()> {
        if self.lock_ports().contains_key(name) {
            return Ok(());
        }

        let gate = Arc::new(PortGate::new(
            name,
            factory,
            self.config.timing.clone(),
            &self.log,
        ));
        gate.ensure_open()?;

        let health = Arc::new(Mutex::new(HealthBoard::new(&self.log)));

        let poller = PollerHandle::spawn(
            name,
            gate.clone(),
            health.clone(),
            self.hub.clone(),
            self.config.poll.clone(),
            &self.log,
        )
        .map_err(|err| BusError::PortLost(err.to_string()))?;

        logging::info!(self.log, "port registered"; "context" => "open_port", "port" => name);

        self.lock_ports().insert(
            name.to_string(),
            PortEntry {
                gate,
                health,
                poller,
            },
        );

        Ok(())
    }

    /// Registers a physical serial port using the configured line settings.
    pub fn open_serial_port(&self, path: &str) -> BusResult<()> {
        self.open_port(path, SerialLink::factory(path, &self.config.line))
    }

    /// Stops the port's poller and closes its driver.
    pub fn close_port(&self, name: &str) -> BusResult<()> {
        let entry = self
            .lock_ports()
            .remove(name)
            .ok_or_else(|| BusError::UnknownPort(name.to_string()))?;

        drop(entry.poller);
        entry.gate.close();

        logging::info!(self.log, "port removed"; "context" => "close_port", "port" => name);

        Ok(())
    }

    /// Puts an address into the port's polling rotation.
    pub fn add_instrument(
        &self,
        port: &str,
        address: u8,
        period: Option<Duration>,
    ) -> BusResult<()> {
        let period = period.unwrap_or_else(|| self.config.poll.period());
        self.producers(port)?.add_node(address, period)
    }

    /// Takes an address out of the polling rotation.
    pub fn remove_instrument(&self, port: &str, address: u8) -> BusResult<()> {
        self.producers(port)?.remove_node(address)
    }

    /// An ephemeral facade for one instrument. Handles are cheap; nothing is
    /// cached and nothing needs releasing.
    pub fn instrument(&self, port: &str, address: u8) -> BusResult<Instrument> {
        let gate = self.gate(port)?;
        Instrument::new(gate, address, &self.log)
    }

    pub fn read_dde(&self, port: &str, address: u8, dde: u16) -> BusResult<Value> {
        self.instrument(port, address)?.read_dde(dde)
    }

    pub fn write_dde(&self, port: &str, address: u8, dde: u16, value: Value) -> BusResult<()> {
        self.instrument(port, address)?.write_dde(dde, value)
    }

    pub fn read_parameters(
        &self,
        port: &str,
        address: u8,
        params: &[Parameter],
    ) -> BusResult<Vec<ParameterValue>> {
        self.instrument(port, address)?.read_parameters(params)
    }

    pub fn write_parameters(
        &self,
        port: &str,
        address: u8,
        params: &[ParameterValue],
    ) -> BusResult<()> {
        self.instrument(port, address)?.write_parameters(params)
    }

    /// Hands a command to the port's priority queue.
    pub fn queue_priority(
        &self,
        port: &str,
        address: u8,
        kind: CommandKind,
        priority: Priority,
    ) -> BusResult<()> {
        self.producers(port)?.queue_priority(PriorityCommand {
            address,
            kind,
            priority,
        })
    }

    /// Hands a command to the port's reply-gated asynchronous queue.
    pub fn queue_async(
        &self,
        port: &str,
        address: u8,
        kind: CommandKind,
        timeout: Option<Duration>,
    ) -> BusResult<()> {
        self.producers(port)?.queue_async(AsyncCommand {
            address,
            kind,
            timeout,
        })
    }

    /// Sweeps the full address range of a port.
    pub fn scan(&self, port: &str) -> BusResult<Vec<ScannedInstrument>> {
        self.scan_range(port, scanner::FULL_SWEEP)
    }

    /// Sweeps a chosen address range of a port.
    pub fn scan_range<I: IntoIterator<Item = u8>>(
        &self,
        port: &str,
        addresses: I,
    ) -> BusResult<Vec<ScannedInstrument>> {
        let gate = self.gate(port)?;
        scanner::scan(&gate, addresses, &self.log)
    }

    /// Tears the port's driver down, rebuilds it and reports a recovery for
    /// every address the port has ever talked to.
    pub fn force_reconnect(&self, port: &str) -> BusResult<()> {
        let (gate, health) = {
            let ports = self.lock_ports();
            let entry = ports
                .get(port)
                .ok_or_else(|| BusError::UnknownPort(port.to_string()))?;
            (entry.gate.clone(), entry.health.clone())
        };

        logging::warn!(self.log, "forced reconnection";
                       "context" => "force_reconnect", "port" => port);

        gate.force_recreate()?;

        let now = Instant::now();
        let mut health = health.lock().expect("Health board lock poisoned");

        for address in health.addresses() {
            let recoveries_total = health.mark_recovered(address, now);

            self.hub
                .publish(TelemetryEvent::ConnectionRecovery(ConnectionRecovery {
                    ts: timestamp_secs(),
                    port: port.to_string(),
                    address,
                    recoveries_total,
                }));
        }

        Ok(())
    }

    /// A new subscription to every telemetry event of every port.
    #[inline]
    pub fn subscribe(&self) -> channel::Receiver<TelemetryEvent> {
        self.hub.subscribe()
    }

    pub fn port_stats(&self, port: &str) -> BusResult<PortStats> {
        Ok(self.gate(port)?.stats())
    }

    /// Monotonic uptime of an address, if it has ever been seen healthy.
    pub fn uptime(&self, port: &str, address: u8) -> BusResult<Option<Duration>> {
        let health = {
            let ports = self.lock_ports();
            ports
                .get(port)
                .ok_or_else(|| BusError::UnknownPort(port.to_string()))?
                .health
                .clone()
        };

        let uptime = health
            .lock()
            .expect("Health board lock poisoned")
            .uptime(address, Instant::now());

        Ok(uptime)
    }

    fn gate(&self, port: &str) -> BusResult<Arc<PortGate>> {
        self.lock_ports()
            .get(port)
            .map(|entry| entry.gate.clone())
            .ok_or_else(|| BusError::UnknownPort(port.to_string()))
    }

    fn producers(&self, port: &str) -> BusResult<PollerProducers> {
        self.lock_ports()
            .get(port)
            .map(|entry| entry.poller.producers().clone())
            .ok_or_else(|| BusError::UnknownPort(port.to_string()))
    }

    fn lock_ports(&self) -> MutexGuard<'_, HashMap<String, PortEntry>> {
        self.ports.lock().expect("Port registry lock poisoned")
    }
}

impl Drop for Manifold {
    fn drop(&mut self) {
        let mut ports = self.lock_ports();

        for (_, entry) in ports.drain() {
            drop(entry.poller);
            entry.gate.close();
        }
    }
}
