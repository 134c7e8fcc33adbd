//! Frame envelope handling: `DLE STX` body `DLE ETX`, with every `DLE` in the
//! body doubled on the wire.

use crate::{DLE, ETX, STX};

// seq + node + len plus a maximal payload.
const MAX_BODY_SIZE: usize = 3 + 255;

// Recent noise retained for diagnostics.
const NOISE_TAIL_SIZE: usize = 32;

/// Wrap a message body in the frame envelope, doubling body `DLE` bytes.
pub fn encode(body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + 4);

    frame.push(DLE);
    frame.push(STX);

    for &byte in body {
        frame.push(byte);
        if byte == DLE {
            frame.push(DLE);
        }
    }

    frame.push(DLE);
    frame.push(ETX);
    frame
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum State {
    Idle,
    AfterDle,
    InBody,
    InBodyAfterDle,
}

/// Push based frame reassembler. Bytes go in one at a time (or in slices via
/// `feed`), complete message bodies come out. Anything that is not part of a
/// well formed frame is counted as noise or a dropped frame and the decoder
/// resynchronizes on the next `DLE`; it never fails outright.
pub struct Decoder {
    state: State,
    body: Vec<u8>,
    noise_total: u64,
    noise_tail: Vec<u8>,
    dropped_frames: u64,
}

impl Decoder {
    #[inline]
    pub fn new() -> Decoder {
        Decoder {
            state: State::Idle,
            body: Vec::with_capacity(64),
            noise_total: 0,
            noise_tail: Vec::with_capacity(NOISE_TAIL_SIZE),
            dropped_frames: 0,
        }
    }

    /// Total count of inter-frame bytes discarded so far.
    #[inline]
    pub fn noise_total(&self) -> u64 {
        self.noise_total
    }

    /// Count of frames abandoned due to a framing violation.
    #[inline]
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Drains the retained tail of recently discarded bytes.
    #[inline]
    pub fn drain_noise(&mut self) -> Vec<u8> {
        std::mem::replace(&mut self.noise_tail, Vec::with_capacity(NOISE_TAIL_SIZE))
    }

    /// Consume a single byte, returning a complete message body if this byte
    /// finished a frame.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        match self.state {
            State::Idle => {
                if byte == DLE {
                    self.state = State::AfterDle;
                } else {
                    self.record_noise(byte);
                }
                None
            }
            State::AfterDle => {
                if byte == STX {
                    self.state = State::InBody;
                    self.body.clear();
                } else {
                    self.resync(byte);
                }
                None
            }
            State::InBody => {
                if byte == DLE {
                    self.state = State::InBodyAfterDle;
                } else if self.body.len() == MAX_BODY_SIZE {
                    self.abandon(byte);
                } else {
                    self.body.push(byte);
                }
                None
            }
            State::InBodyAfterDle => match byte {
                DLE => {
                    if self.body.len() == MAX_BODY_SIZE {
                        self.abandon(byte);
                        return None;
                    }
                    self.body.push(DLE);
                    self.state = State::InBody;
                    None
                }
                ETX => {
                    self.state = State::Idle;
                    Some(std::mem::replace(&mut self.body, Vec::with_capacity(64)))
                }
                _ => {
                    self.abandon(byte);
                    None
                }
            },
        }
    }

    /// Consume a byte slice, appending any completed bodies to `out`.
    pub fn feed(&mut self, bytes: &[u8], out: &mut Vec<Vec<u8>>) {
        for &byte in bytes {
            if let Some(body) = self.push(byte) {
                out.push(body);
            }
        }
    }

    #[inline]
    fn record_noise(&mut self, byte: u8) {
        self.noise_total += 1;
        if self.noise_tail.len() == NOISE_TAIL_SIZE {
            self.noise_tail.remove(0);
        }
        self.noise_tail.push(byte);
    }

    /// A partially assembled frame turned out to be invalid.
    #[inline]
    fn abandon(&mut self, byte: u8) {
        self.dropped_frames += 1;
        self.body.clear();
        // The offending byte may itself start the next frame.
        self.state = if byte == DLE { State::AfterDle } else { State::Idle };
    }

    /// A frame start never materialized.
    #[inline]
    fn resync(&mut self, byte: u8) {
        self.record_noise(byte);
        self.state = if byte == DLE { State::AfterDle } else { State::Idle };
    }
}
