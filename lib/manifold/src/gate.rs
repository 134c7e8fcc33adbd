//! The per-port exclusive gate. Every wire operation on a port goes through
//! its gate: one owner at a time (re-entrant for the owning thread), a
//! bounded retry schedule for transient failures, and driver recreation when
//! the transport itself dies underneath an operation.

use crate::config::TimingSettings;
use crate::driver::{PortDriver, Request};
use crate::health;
use crate::link::LinkFactory;
use crate::support::{BusError, BusResult};
use propar::logging::{self, Logger};
use propar::message::Response;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Counters kept across the lifetime of a port.
#[derive(Debug, Copy, Clone, Default)]
pub struct PortStats {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub concurrent_attempts_blocked: u64,
    pub longest_operation_ms: u64,
    pub recreation_epoch: u64,
}

struct GateState {
    driver: Option<Arc<PortDriver>>,
    owner: Option<thread::ThreadId>,
    depth: u32,
    acquired_at: Option<Instant>,
    stats: PortStats,
}

pub struct PortGate {
    name: String,
    state: Mutex<GateState>,
    available: Condvar,
    factory: LinkFactory,
    timing: TimingSettings,
    log: Logger,
}

impl PortGate {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        name: &str,
        factory: LinkFactory,
        timing: TimingSettings,
        log: L,
    ) -> PortGate {
        PortGate {
            name: name.to_string(),
            state: Mutex::new(GateState {
                driver: None,
                owner: None,
                depth: 0,
                acquired_at: None,
                stats: PortStats::default(),
            }),
            available: Condvar::new(),
            factory,
            timing,
            log: logging::child(log),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn stats(&self) -> PortStats {
        self.lock_state().stats
    }

    /// Runs a transaction under the gate with the full retry schedule.
    pub fn transact(&self, request: Request) -> BusResult<Response> {
        self.acquire();
        let result = self.run(&request, self.timing.max_attempts());
        self.release();
        result
    }

    /// Runs a transaction under the gate with a single attempt. Used by the
    /// scanner, where an absent address is the common case and the retry
    /// schedule would turn a sweep into a crawl.
    pub fn probe(&self, request: Request) -> BusResult<Response> {
        self.acquire();
        let result = self.run(&request, 1);
        self.release();
        result
    }

    /// Makes sure the underlying driver exists, opening the link if needed.
    pub fn ensure_open(&self) -> BusResult<()> {
        self.acquire();
        let result = self.ensure_driver().map(|_| ());
        self.release();
        result
    }

    /// Tears the driver down without rebuilding it.
    pub fn close(&self) {
        self.acquire();

        let old = self.lock_state().driver.take();
        if let Some(driver) = old {
            driver.shutdown();
            logging::info!(self.log, "port closed"; "context" => "close", "port" => &self.name);
        }

        self.release();
    }

    /// Tears the driver down and rebuilds it, abandoning any stale pending
    /// slots. The recreation epoch goes up by one.
    pub fn force_recreate(&self) -> BusResult<()> {
        self.acquire();
        self.recreate_driver();
        let result = self.ensure_driver().map(|_| ());
        self.release();
        result
    }

    fn run(&self, request: &Request, max_attempts: usize) -> BusResult<Response> {
        let mut last_err: Option<BusError> = None;
        let mut hold_off: Option<Duration> = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let backoff = self.timing.backoff(attempt - 1);
                thread::sleep(hold_off.take().map_or(backoff, |delay| delay.max(backoff)));
            }

            self.lock_state().stats.total_operations += 1;

            let outcome = self
                .ensure_driver()
                .and_then(|driver| driver.transact(request.clone()));

            match outcome {
                Ok(response) => {
                    self.lock_state().stats.successful_operations += 1;
                    return Ok(response);
                }
                Err(err) => {
                    self.lock_state().stats.failed_operations += 1;

                    logging::debug!(self.log, "attempt failed";
                                    "context" => "run",
                                    "port" => &self.name,
                                    "attempt" => attempt + 1,
                                    "error" => ?err,
                                    "retryable" => err.is_retryable());

                    if !err.is_retryable() {
                        return Err(err);
                    }

                    if err.needs_recreation() {
                        // Give the device time to come back before reopening.
                        if let BusError::PortLost(message) = &err {
                            hold_off = Some(health::classify(message).recovery_delay());
                        }

                        self.recreate_driver();
                    }

                    last_err = Some(err);
                }
            }
        }

        Err(last_err.expect("At least one attempt must have run"))
    }

    fn ensure_driver(&self) -> BusResult<Arc<PortDriver>> {
        let mut state = self.lock_state();

        if let Some(driver) = &state.driver {
            return Ok(driver.clone());
        }

        let link = (self.factory)().map_err(|err| BusError::PortLost(err.to_string()))?;

        let driver = PortDriver::new(link, &self.name, self.timing.response_timeout(), &self.log)
            .map_err(|err| BusError::PortLost(err.to_string()))?;

        logging::info!(self.log, "port opened";
                       "context" => "ensure_driver",
                       "port" => &self.name,
                       "epoch" => state.stats.recreation_epoch);

        let driver = Arc::new(driver);
        state.driver = Some(driver.clone());
        Ok(driver)
    }

    fn recreate_driver(&self) {
        let old = {
            let mut state = self.lock_state();
            state.stats.recreation_epoch += 1;
            state.driver.take()
        };

        if let Some(driver) = old {
            driver.shutdown();
        }

        logging::info!(self.log, "port driver torn down for recreation";
                       "context" => "recreate_driver", "port" => &self.name);
    }

    /// Takes ownership of the gate, blocking while another thread holds it.
    /// A thread that already owns the gate passes straight through.
    fn acquire(&self) {
        let me = thread::current().id();
        let mut state = self.lock_state();

        if state.owner == Some(me) {
            state.depth += 1;
            return;
        }

        if state.owner.is_some() {
            state.stats.concurrent_attempts_blocked += 1;

            while state.owner.is_some() {
                state = self.available.wait(state).expect("Gate lock poisoned");
            }
        }

        state.owner = Some(me);
        state.depth = 1;
        state.acquired_at = Some(Instant::now());
    }

    fn release(&self) {
        let mut state = self.lock_state();

        state.depth -= 1;

        if state.depth == 0 {
            state.owner = None;

            if let Some(acquired_at) = state.acquired_at.take() {
                let elapsed_ms = acquired_at.elapsed().as_millis() as u64;
                if elapsed_ms > state.stats.longest_operation_ms {
                    state.stats.longest_operation_ms = elapsed_ms;
                }
            }

            self.available.notify_one();
        }
    }

    #[inline]
    fn lock_state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().expect("Gate lock poisoned")
    }
}
