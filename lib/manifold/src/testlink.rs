//! In memory link that behaves like a bus of instruments. Requests written
//! by the driver are decoded and answered in kind, which lets the whole
//! stack run in tests without hardware.

use crate::link::{Link, LinkFactory};
use hashbrown::HashMap;
use propar::framing::{self, Decoder};
use propar::message::{self, Command, Parameter, ParameterValue, StatusCode};
use propar::value::Value;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

struct SimNode {
    params: HashMap<(u8, u8), Value>,
    silent: bool,
    reply_delay: Duration,
}

struct BusState {
    nodes: HashMap<u8, SimNode>,
    decoder: Decoder,
    read_queue: VecDeque<(Instant, Vec<u8>)>,
    fail_writes: Option<String>,
    heal_on_recreate: bool,
    drop_replies: u32,
    corrupt_next_reply: bool,
    requests_seen: u64,
}

/// Handle on the simulated bus shared by every link cloned off it.
#[derive(Clone)]
pub struct SimBus {
    state: Arc<Mutex<BusState>>,
    recreations: Arc<AtomicUsize>,
}

impl SimBus {
    pub fn new() -> SimBus {
        SimBus {
            state: Arc::new(Mutex::new(BusState {
                nodes: HashMap::new(),
                decoder: Decoder::new(),
                read_queue: VecDeque::new(),
                fail_writes: None,
                heal_on_recreate: false,
                drop_replies: 0,
                corrupt_next_reply: false,
                requests_seen: 0,
            })),
            recreations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Adds an instrument with a full complement of the parameters the
    /// runtime cares about.
    pub fn add_instrument(&self, address: u8) {
        let mut params = HashMap::new();

        params.insert((1, 0), Value::Int16(16_000));
        params.insert((1, 1), Value::Int16(8_000));
        params.insert((1, 4), Value::Int8(0));
        params.insert((1, 13), Value::Float(100.0));
        params.insert((1, 16), Value::Int8(0));
        params.insert((1, 17), Value::String("AiR".into()));
        params.insert((1, 31), Value::String("ln/min".into()));
        params.insert((113, 1), Value::String("MFC".into()));
        params.insert((113, 2), Value::String("F-201CV".into()));
        params.insert((113, 6), Value::String(format!("Tag{}", address)));
        params.insert((113, 12), Value::Int8(3));
        params.insert((33, 0), Value::Float(45.5));
        params.insert((33, 3), Value::Float(50.0));

        self.lock().nodes.insert(
            address,
            SimNode {
                params,
                silent: false,
                reply_delay: Duration::from_millis(0),
            },
        );
    }

    /// Adds an instrument that only knows its device type; every other read
    /// comes back as a parameter error.
    pub fn add_bare_instrument(&self, address: u8) {
        let mut params = HashMap::new();
        params.insert((113, 1), Value::String("MFC".into()));

        self.lock().nodes.insert(
            address,
            SimNode {
                params,
                silent: false,
                reply_delay: Duration::from_millis(0),
            },
        );
    }

    pub fn set_param(&self, address: u8, proc_nr: u8, parm_nr: u8, value: Value) {
        self.lock()
            .nodes
            .get_mut(&address)
            .expect("No such simulated node")
            .params
            .insert((proc_nr, parm_nr), value);
    }

    pub fn param(&self, address: u8, proc_nr: u8, parm_nr: u8) -> Option<Value> {
        self.lock()
            .nodes
            .get(&address)?
            .params
            .get(&(proc_nr, parm_nr))
            .cloned()
    }

    pub fn set_silent(&self, address: u8, silent: bool) {
        self.lock()
            .nodes
            .get_mut(&address)
            .expect("No such simulated node")
            .silent = silent;
    }

    pub fn set_reply_delay(&self, address: u8, delay: Duration) {
        self.lock()
            .nodes
            .get_mut(&address)
            .expect("No such simulated node")
            .reply_delay = delay;
    }

    /// Every subsequent write fails with this description.
    pub fn fail_writes(&self, message: &str) {
        self.lock().fail_writes = Some(message.into());
    }

    /// Clears a write failure the next time the factory rebuilds a link,
    /// imitating a device that comes back after replugging.
    pub fn heal_on_recreate(&self) {
        self.lock().heal_on_recreate = true;
    }

    /// Swallow the next `count` requests without answering.
    pub fn drop_replies(&self, count: u32) {
        self.lock().drop_replies = count;
    }

    /// Mangle the next reply so it arrives as a malformed frame.
    pub fn corrupt_next_reply(&self) {
        self.lock().corrupt_next_reply = true;
    }

    /// Push raw bytes into the read direction, bypassing the simulation.
    pub fn inject(&self, bytes: Vec<u8>) {
        self.lock().read_queue.push_back((Instant::now(), bytes));
    }

    pub fn requests_seen(&self) -> u64 {
        self.lock().requests_seen
    }

    pub fn recreations(&self) -> usize {
        self.recreations.load(Ordering::Relaxed)
    }

    pub fn link(&self) -> Box<dyn Link> {
        Box::new(SimLink { bus: self.clone() })
    }

    pub fn factory(&self) -> LinkFactory {
        let bus = self.clone();

        Box::new(move || {
            bus.recreations.fetch_add(1, Ordering::Relaxed);

            {
                let mut state = bus.lock();
                if state.heal_on_recreate {
                    state.fail_writes = None;
                }
            }

            Ok(bus.link())
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().expect("Sim bus lock poisoned")
    }
}

struct SimLink {
    bus: SimBus,
}

impl io::Read for SimLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut served = None;

        {
            let mut state = self.bus.lock();

            if let Some((ready_at, bytes)) = state.read_queue.front_mut() {
                if *ready_at <= Instant::now() {
                    let count = bytes.len().min(buf.len());
                    buf[..count].copy_from_slice(&bytes[..count]);
                    bytes.drain(..count);
                    served = Some((count, bytes.is_empty()));
                }
            }

            if let Some((count, emptied)) = served {
                if emptied {
                    state.read_queue.pop_front();
                }
                return Ok(count);
            }
        }

        thread::sleep(Duration::from_millis(1));
        Err(io::ErrorKind::TimedOut.into())
    }
}

impl io::Write for SimLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.bus.lock();

        if let Some(message) = &state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::Other, message.clone()));
        }

        let mut bodies = Vec::new();
        state.decoder.feed(buf, &mut bodies);

        for body in bodies {
            handle_request(&mut state, &body);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Link for SimLink {
    fn try_clone(&self) -> io::Result<Box<dyn Link>> {
        Ok(Box::new(SimLink {
            bus: self.bus.clone(),
        }))
    }
}

fn handle_request(state: &mut BusState, body: &[u8]) {
    let raw = match message::decode_message(body) {
        Ok(raw) => raw,
        Err(_) => return,
    };

    state.requests_seen += 1;

    if state.drop_replies > 0 {
        state.drop_replies -= 1;
        return;
    }

    let command = match raw.payload.first().and_then(|&code| Command::from_code(code)) {
        Some(command) => command,
        None => return,
    };

    // Nobody answers broadcasts in the simulation.
    if command == Command::SendParmBroadcast {
        return;
    }

    let (silent, delay, snapshot) = match state.nodes.get(&raw.node) {
        Some(node) => (node.silent, node.reply_delay, node.params.clone()),
        None => return,
    };

    if silent {
        return;
    }

    let reply = match command {
        Command::RequestParm => {
            let requested = match message::decode_read_request(&raw.payload) {
                Ok(requested) => requested,
                Err(_) => return,
            };

            let mut values = Vec::new();
            let mut missing = None;

            for (index, request) in requested.iter().enumerate() {
                match snapshot.get(&(request.proc_nr, request.parm_nr)) {
                    Some(value) => values.push(ParameterValue {
                        param: Parameter::new(
                            request.proc_nr,
                            request.parm_nr,
                            value.parameter_type(),
                        ),
                        value: value.clone(),
                    }),
                    None => {
                        missing = Some(index as u8);
                        break;
                    }
                }
            }

            match missing {
                Some(position) => message::encode_status(StatusCode::ParmNumber, position),
                None => message::encode_values(&values).expect("Sim reply encoding failed"),
            }
        }
        Command::SendParmWithAck | Command::SendParm => {
            let resolve = |proc_nr: u8, parm_nr: u8| {
                snapshot
                    .get(&(proc_nr, parm_nr))
                    .map(|value| value.parameter_type())
            };

            let decoded = match message::decode_write(&raw.payload, resolve) {
                Ok((_, values)) => values,
                Err(_) => return,
            };

            let missing = decoded
                .iter()
                .position(|pv| !snapshot.contains_key(&(pv.param.proc_nr, pv.param.parm_nr)));

            let reply = match missing {
                Some(position) => message::encode_status(StatusCode::ParmNumber, position as u8),
                None => {
                    let node = state.nodes.get_mut(&raw.node).expect("Sim node vanished");
                    for pv in decoded {
                        node.params
                            .insert((pv.param.proc_nr, pv.param.parm_nr), pv.value);
                    }
                    message::encode_status(StatusCode::Ok, 0)
                }
            };

            if command == Command::SendParm {
                // Fire and forget.
                return;
            }

            reply
        }
        _ => return,
    };

    let mut reply_body =
        message::encode_message(raw.seq, raw.node, &reply).expect("Sim reply too large");

    if state.corrupt_next_reply {
        state.corrupt_next_reply = false;
        reply_body[2] ^= 0x0F;
    }

    state
        .read_queue
        .push_back((Instant::now() + delay, framing::encode(&reply_body)));
}
