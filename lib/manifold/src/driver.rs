//! The port driver owns one serial link. Outbound requests get a sequence
//! number and a pending slot; a dedicated receive worker reassembles frames
//! off the wire and completes the matching slot. At most one request is
//! pending per sequence number.

use crate::link::Link;
use crate::support::{BusError, BusResult};
use crossbeam_channel as channel;
use hashbrown::HashMap;
use propar::framing::{self, Decoder};
use propar::logging::{self, Logger};
use propar::message::{self, Command, Parameter, ParameterValue, Response};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// An operation submitted to the driver.
#[derive(Debug, Clone)]
pub enum Request {
    Read(Vec<Parameter>),
    Write(Command, Vec<ParameterValue>),
}

/// Wire level counters, readable without stopping the worker.
#[derive(Debug, Default)]
pub struct DriverCounters {
    pub frames: AtomicU64,
    pub malformed_frames: AtomicU64,
    pub unknown_seq_frames: AtomicU64,
}

struct Pending {
    node: u8,
    broadcast: bool,
    expected: Vec<Parameter>,
    slot: channel::Sender<BusResult<Response>>,
}

struct DriverShared {
    writer: Mutex<Box<dyn Link>>,
    pending: Mutex<HashMap<u8, Pending>>,
    shutdown: AtomicBool,
    counters: DriverCounters,
    log: Logger,
}

pub struct PortDriver {
    shared: Arc<DriverShared>,
    seq: AtomicU8,
    response_timeout: Duration,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PortDriver {
    /// Takes ownership of the link, splits off a read handle and starts the
    /// receive worker.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        link: Box<dyn Link>,
        name: &str,
        response_timeout: Duration,
        log: L,
    ) -> io::Result<PortDriver> {
        let reader = link.try_clone()?;

        let shared = Arc::new(DriverShared {
            writer: Mutex::new(link),
            pending: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            counters: DriverCounters::default(),
            log: logging::child(log),
        });

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name(format!("{}-rx", name))
            .spawn(move || Self::receive_loop(reader, worker_shared))?;

        Ok(PortDriver {
            shared,
            seq: AtomicU8::new(0),
            response_timeout,
            worker: Mutex::new(Some(worker)),
        })
    }

    #[inline]
    pub fn counters(&self) -> &DriverCounters {
        &self.shared.counters
    }

    /// Run one transaction to completion: build, frame, write, wait.
    pub fn transact(&self, request: Request) -> BusResult<Response> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(BusError::PortLost("port driver shut down".into()));
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);

        let (body, expected, broadcast) = match &request {
            Request::Read(params) => {
                let body = message::build_read(seq, params)?;
                (body, params.clone(), false)
            }
            Request::Write(command, values) => {
                let body = message::build_write(seq, *command, values)?;
                (body, Vec::new(), *command == Command::SendParmBroadcast)
            }
        };

        let node = body[1];
        let (slot, reply) = channel::bounded(1);

        {
            let mut pending = self.lock_pending();

            // A stale slot on this sequence number can only mean its owner
            // gave up a full sequence space ago.
            if let Some(stale) = pending.insert(
                seq,
                Pending {
                    node,
                    broadcast,
                    expected,
                    slot,
                },
            ) {
                logging::warn!(self.shared.log, "evicted stale pending slot";
                               "context" => "transact", "seq" => seq, "node" => stale.node);
            }
        }

        logging::trace!(self.shared.log, "request on the wire";
                        "context" => "transact", "seq" => seq, "node" => node,
                        "body_len" => body.len());

        if let Err(err) = self.write_frame(&body) {
            self.lock_pending().remove(&seq);
            return Err(err);
        }

        match reply.recv_timeout(self.response_timeout) {
            Ok(result) => result,
            Err(channel::RecvTimeoutError::Timeout) => {
                let removed = self.lock_pending().remove(&seq).is_some();

                // The worker may have completed the slot at the deadline.
                if !removed {
                    if let Ok(result) = reply.try_recv() {
                        return result;
                    }
                }

                logging::debug!(self.shared.log, "request timed out";
                                "context" => "transact", "seq" => seq, "node" => node);

                Err(BusError::TimeoutAnswer)
            }
            Err(channel::RecvTimeoutError::Disconnected) => {
                Err(BusError::PortLost("pending slot dropped".into()))
            }
        }
    }

    /// Fails every pending request and stops the receive worker.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        Self::fail_all(&self.shared, "port driver shut down");

        if let Some(worker) = self
            .worker
            .lock()
            .expect("Driver worker lock poisoned")
            .take()
        {
            drop(worker.join());
        }
    }

    fn write_frame(&self, body: &[u8]) -> BusResult<()> {
        let frame = framing::encode(body);
        let mut writer = self
            .shared
            .writer
            .lock()
            .expect("Driver writer lock poisoned");

        writer
            .write_all(&frame)
            .and_then(|_| writer.flush())
            .map_err(|err| BusError::PortLost(err.to_string()))
    }

    #[inline]
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u8, Pending>> {
        self.shared
            .pending
            .lock()
            .expect("Driver pending lock poisoned")
    }

    fn receive_loop(mut reader: Box<dyn Link>, shared: Arc<DriverShared>) {
        let mut decoder = Decoder::new();
        let mut frames = Vec::new();
        let mut buf = [0u8; 256];
        let mut noise_seen = 0;

        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }

            match reader.read(&mut buf) {
                Ok(0) => {
                    Self::fail_all(&shared, "serial connection lost");
                    return;
                }
                Ok(count) => {
                    decoder.feed(&buf[..count], &mut frames);

                    if decoder.noise_total() > noise_seen {
                        noise_seen = decoder.noise_total();
                        logging::trace!(shared.log, "discarded non propar bytes";
                                        "context" => "receive_loop",
                                        "total" => noise_seen,
                                        "tail" => format!("{:02x?}", decoder.drain_noise()));
                    }

                    for body in frames.drain(..) {
                        Self::handle_frame(&shared, &body);
                    }
                }
                Err(ref err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(err) => {
                    logging::warn!(shared.log, "receive worker stopping";
                                   "context" => "receive_loop", "error" => %err);
                    Self::fail_all(&shared, &err.to_string());
                    return;
                }
            }
        }
    }

    fn handle_frame(shared: &Arc<DriverShared>, body: &[u8]) {
        shared.counters.frames.fetch_add(1, Ordering::Relaxed);

        let raw = match message::decode_message(body) {
            Ok(raw) => raw,
            Err(err) => {
                shared.counters.malformed_frames.fetch_add(1, Ordering::Relaxed);
                logging::debug!(shared.log, "dropping malformed frame";
                                "context" => "handle_frame", "error" => ?err,
                                "body_len" => body.len());
                return;
            }
        };

        let mut pending = shared
            .pending
            .lock()
            .expect("Driver pending lock poisoned");

        let matches = match pending.get(&raw.seq) {
            Some(entry) => {
                entry.node == raw.node
                    || (entry.broadcast && raw.payload.first() == Some(&u8::from(Command::Status)))
            }
            None => false,
        };

        if !matches {
            shared
                .counters
                .unknown_seq_frames
                .fetch_add(1, Ordering::Relaxed);
            logging::debug!(shared.log, "dropping unmatched frame";
                            "context" => "handle_frame", "seq" => raw.seq, "node" => raw.node);
            return;
        }

        let entry = pending.remove(&raw.seq).expect("Pending entry vanished");
        drop(pending);

        let result = match message::decode_response(&raw.payload, &entry.expected) {
            Ok(Response::Status { status, position }) if !status.is_ok() => {
                logging::debug!(shared.log, "instrument reported an error status";
                                "context" => "handle_frame", "seq" => raw.seq,
                                "status" => ?status, "position" => position);
                Err(BusError::Status(status))
            }
            Ok(response) => Ok(response),
            Err(err) => Err(BusError::Protocol(err)),
        };

        // The requester may have timed out and walked away; that is fine.
        drop(entry.slot.send(result));
    }

    fn fail_all(shared: &Arc<DriverShared>, reason: &str) {
        let mut pending = shared
            .pending
            .lock()
            .expect("Driver pending lock poisoned");

        for (_, entry) in pending.drain() {
            drop(entry.slot.send(Err(BusError::PortLost(reason.into()))));
        }
    }
}

impl Drop for PortDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testlink::SimBus;
    use propar::message::StatusCode;
    use propar::value::{ParameterType, Value};
    use std::time::Instant;

    fn fmeasure(node: u8) -> Parameter {
        Parameter::new(33, 0, ParameterType::Float).for_node(node)
    }

    fn setpoint(node: u8) -> Parameter {
        Parameter::new(1, 1, ParameterType::Int16).for_node(node)
    }

    fn driver_on(bus: &SimBus, timeout_ms: u64) -> PortDriver {
        PortDriver::new(
            bus.link(),
            "sim",
            Duration::from_millis(timeout_ms),
            None,
        )
        .unwrap()
    }

    fn values(response: Response) -> Vec<ParameterValue> {
        match response {
            Response::Values(values) => values,
            other => panic!("Unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_read_float() {
        let bus = SimBus::new();
        bus.add_instrument(3);

        let driver = driver_on(&bus, 500);

        let response = driver.transact(Request::Read(vec![fmeasure(3)])).unwrap();
        let values = values(response);

        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value, Value::Float(45.5));
        assert_eq!(driver.counters().frames.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_write_with_ack() {
        let bus = SimBus::new();
        bus.add_instrument(3);

        let driver = driver_on(&bus, 500);

        let response = driver
            .transact(Request::Write(
                Command::SendParmWithAck,
                vec![ParameterValue {
                    param: setpoint(3),
                    value: Value::Int16(32_000),
                }],
            ))
            .unwrap();

        assert_eq!(
            response,
            Response::Status {
                status: StatusCode::Ok,
                position: 0
            }
        );
        assert_eq!(bus.param(3, 1, 1), Some(Value::Int16(32_000)));
    }

    #[test]
    fn test_status_error_surfaces() {
        let bus = SimBus::new();
        bus.add_bare_instrument(3);

        let driver = driver_on(&bus, 500);

        let result = driver.transact(Request::Write(
            Command::SendParmWithAck,
            vec![ParameterValue {
                param: setpoint(3),
                value: Value::Int16(100),
            }],
        ));

        assert_eq!(result.unwrap_err(), BusError::Status(StatusCode::ParmNumber));
    }

    #[test]
    fn test_timeout_answer() {
        let bus = SimBus::new();
        bus.add_instrument(3);
        bus.drop_replies(1);

        let driver = driver_on(&bus, 100);

        let started = Instant::now();
        let result = driver.transact(Request::Read(vec![fmeasure(3)]));

        assert_eq!(result.unwrap_err(), BusError::TimeoutAnswer);
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(bus.requests_seen(), 1);

        // The slot is gone and the next request is unaffected.
        let response = driver.transact(Request::Read(vec![fmeasure(3)])).unwrap();
        assert_eq!(values(response)[0].value, Value::Float(45.5));
    }

    #[test]
    fn test_sequence_correlation_out_of_order() {
        let bus = SimBus::new();
        bus.add_instrument(3);
        bus.add_instrument(4);
        bus.set_param(4, 33, 0, Value::Float(60.0));
        bus.drop_replies(2);

        let driver = Arc::new(driver_on(&bus, 2_000));

        // First caller takes seq 0, the second seq 1.
        let first = {
            let driver = driver.clone();
            thread::spawn(move || driver.transact(Request::Read(vec![fmeasure(3)])))
        };
        thread::sleep(Duration::from_millis(50));

        let second = {
            let driver = driver.clone();
            thread::spawn(move || driver.transact(Request::Read(vec![fmeasure(4)])))
        };
        thread::sleep(Duration::from_millis(50));

        let reply = |seq: u8, node: u8, value: f32| {
            let payload = message::encode_values(&[ParameterValue {
                param: Parameter::new(33, 0, ParameterType::Float),
                value: Value::Float(value),
            }])
            .unwrap();
            framing::encode(&message::encode_message(seq, node, &payload).unwrap())
        };

        // Answer the second request before the first.
        bus.inject(reply(1, 4, 60.0));
        bus.inject(reply(0, 3, 45.5));

        let first = values(first.join().unwrap().unwrap());
        let second = values(second.join().unwrap().unwrap());

        assert_eq!(first[0].value, Value::Float(45.5));
        assert_eq!(second[0].value, Value::Float(60.0));
    }

    #[test]
    fn test_node_mismatch_is_dropped() {
        let bus = SimBus::new();
        bus.add_instrument(3);
        bus.drop_replies(1);

        let driver = Arc::new(driver_on(&bus, 200));

        let caller = {
            let driver = driver.clone();
            thread::spawn(move || driver.transact(Request::Read(vec![fmeasure(3)])))
        };
        thread::sleep(Duration::from_millis(50));

        // Right sequence number, wrong node.
        let payload = message::encode_values(&[ParameterValue {
            param: Parameter::new(33, 0, ParameterType::Float),
            value: Value::Float(1.0),
        }])
        .unwrap();
        bus.inject(framing::encode(
            &message::encode_message(0, 9, &payload).unwrap(),
        ));

        assert_eq!(caller.join().unwrap().unwrap_err(), BusError::TimeoutAnswer);
        assert_eq!(
            driver.counters().unknown_seq_frames.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_unknown_seq_counted() {
        let bus = SimBus::new();

        let driver = driver_on(&bus, 100);

        let payload = message::encode_status(StatusCode::Ok, 0);
        bus.inject(framing::encode(
            &message::encode_message(77, 3, &payload).unwrap(),
        ));

        thread::sleep(Duration::from_millis(50));

        assert_eq!(
            driver.counters().unknown_seq_frames.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_malformed_reply_counted_and_isolated() {
        let bus = SimBus::new();
        bus.add_instrument(3);
        bus.corrupt_next_reply();

        let driver = driver_on(&bus, 100);

        let result = driver.transact(Request::Read(vec![fmeasure(3)]));

        assert_eq!(result.unwrap_err(), BusError::TimeoutAnswer);
        assert_eq!(
            driver.counters().malformed_frames.load(Ordering::Relaxed),
            1
        );

        // The wire is still usable.
        let response = driver.transact(Request::Read(vec![fmeasure(3)])).unwrap();
        assert_eq!(values(response)[0].value, Value::Float(45.5));
    }

    #[test]
    fn test_write_error_becomes_port_lost() {
        let bus = SimBus::new();
        bus.add_instrument(3);
        bus.fail_writes("bad file descriptor");

        let driver = driver_on(&bus, 100);

        let result = driver.transact(Request::Read(vec![fmeasure(3)]));

        match result.unwrap_err() {
            BusError::PortLost(message) => assert!(message.contains("bad file descriptor")),
            other => panic!("Unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_shutdown_fails_pending() {
        let bus = SimBus::new();
        bus.add_instrument(3);
        bus.drop_replies(1);

        let driver = Arc::new(driver_on(&bus, 2_000));

        let caller = {
            let driver = driver.clone();
            thread::spawn(move || driver.transact(Request::Read(vec![fmeasure(3)])))
        };
        thread::sleep(Duration::from_millis(50));

        driver.shutdown();

        match caller.join().unwrap().unwrap_err() {
            BusError::PortLost(_) => (),
            other => panic!("Unexpected error {:?}", other),
        }
    }
}
