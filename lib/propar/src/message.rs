//! Message bodies: the `seq | node | len | payload` head, the command and
//! status vocabulary, and the process/parameter chaining that packs several
//! parameters into one request or response.

use crate::support::{ProtocolError, ProtocolResult, SizedRead};
use crate::value::{ParameterType, Value};
use crate::HOST_ADDRESS;
use std::io::Cursor;

/// Chain flag on the process byte: another process group follows.
pub const PROC_CHAIN: u8 = 0x80;
/// Chain flag on the parameter index byte: another parameter follows within
/// the same process group.
pub const PARM_CHAIN: u8 = 0x80;
/// Low bits of the process byte.
pub const PROC_MASK: u8 = 0x7F;
/// Low bits of the parameter index byte.
pub const PARM_MASK: u8 = 0x1F;
/// Type bits of the parameter index byte.
pub const TYPE_MASK: u8 = 0x60;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Command {
    Status = 0x00,
    SendParmWithAck = 0x01,
    SendParm = 0x02,
    SendParmBroadcast = 0x03,
    RequestParm = 0x04,
}

impl Command {
    #[inline]
    pub fn from_code(code: u8) -> Option<Command> {
        match code {
            0x00 => Some(Command::Status),
            0x01 => Some(Command::SendParmWithAck),
            0x02 => Some(Command::SendParm),
            0x03 => Some(Command::SendParmBroadcast),
            0x04 => Some(Command::RequestParm),
            _ => None,
        }
    }
}

impl From<Command> for u8 {
    #[inline]
    fn from(command: Command) -> Self {
        command as u8
    }
}

/// Status codes reported by an instrument. Codes without a name pass through
/// opaquely.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StatusCode {
    Ok,
    ProcessClaimed,
    Command,
    ProcNumber,
    ParmNumber,
    ParmType,
    ParmValue,
    NetworkNotActive,
    TimeoutStartChar,
    TimeoutSerialLine,
    TimeoutAnswer,
    Other(u8),
}

impl StatusCode {
    #[inline]
    pub fn from_code(code: u8) -> StatusCode {
        match code {
            0 => StatusCode::Ok,
            1 => StatusCode::ProcessClaimed,
            2 => StatusCode::Command,
            3 => StatusCode::ProcNumber,
            4 => StatusCode::ParmNumber,
            5 => StatusCode::ParmType,
            6 => StatusCode::ParmValue,
            7 => StatusCode::NetworkNotActive,
            8 => StatusCode::TimeoutStartChar,
            9 => StatusCode::TimeoutSerialLine,
            25 => StatusCode::TimeoutAnswer,
            code => StatusCode::Other(code),
        }
    }

    #[inline]
    pub fn code(self) -> u8 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::ProcessClaimed => 1,
            StatusCode::Command => 2,
            StatusCode::ProcNumber => 3,
            StatusCode::ParmNumber => 4,
            StatusCode::ParmType => 5,
            StatusCode::ParmValue => 6,
            StatusCode::NetworkNotActive => 7,
            StatusCode::TimeoutStartChar => 8,
            StatusCode::TimeoutSerialLine => 9,
            StatusCode::TimeoutAnswer => 25,
            StatusCode::Other(code) => code,
        }
    }

    #[inline]
    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }
}

/// A parameter descriptor. The node is optional at construction time; a
/// chained message cannot be built until every descriptor carries one.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Parameter {
    pub node: Option<u8>,
    pub proc_nr: u8,
    pub parm_nr: u8,
    pub parm_type: ParameterType,
}

impl Parameter {
    #[inline]
    pub fn new(proc_nr: u8, parm_nr: u8, parm_type: ParameterType) -> Parameter {
        Parameter {
            node: None,
            proc_nr,
            parm_nr,
            parm_type,
        }
    }

    /// A copy of the descriptor with the node filled in.
    #[inline]
    pub fn for_node(&self, node: u8) -> Parameter {
        Parameter {
            node: Some(node),
            ..*self
        }
    }
}

/// A descriptor paired with a value, for writes and decoded read replies.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterValue {
    pub param: Parameter,
    pub value: Value,
}

/// A message body split into its head fields and payload. `payload[0]` is the
/// command byte.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RawMessage {
    pub seq: u8,
    pub node: u8,
    pub payload: Vec<u8>,
}

/// A decoded response payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Status { status: StatusCode, position: u8 },
    Values(Vec<ParameterValue>),
}

/// Prepend the head fields to a payload, producing a full message body.
pub fn encode_message(seq: u8, node: u8, payload: &[u8]) -> ProtocolResult<Vec<u8>> {
    if payload.len() > 255 {
        return Err(ProtocolError::ValueTooLarge);
    }

    let mut body = Vec::with_capacity(payload.len() + 3);
    body.push(seq);
    body.push(node);
    body.push(payload.len() as u8);
    body.extend_from_slice(payload);
    Ok(body)
}

/// Split a message body into head fields and payload, verifying the length
/// byte against the actual body size.
pub fn decode_message(body: &[u8]) -> ProtocolResult<RawMessage> {
    if body.len() < 4 {
        return Err(ProtocolError::MalformedMessage);
    }

    let declared = body[2] as usize;

    if declared != body.len() - 3 {
        return Err(ProtocolError::MalformedMessage);
    }

    Ok(RawMessage {
        seq: body[0],
        node: body[1],
        payload: body[3..].to_vec(),
    })
}

/// Build a read request for one or more parameters. All descriptors must
/// carry the same node.
pub fn build_read(seq: u8, params: &[Parameter]) -> ProtocolResult<Vec<u8>> {
    let node = common_node(params.iter().map(|p| p.node))?;

    let mut payload = vec![Command::RequestParm.into()];
    encode_chain(&mut payload, params.iter().map(|p| (*p, None)))?;

    encode_message(seq, node, &payload)
}

/// Build a write for one or more parameter values. `SendParmBroadcast` goes
/// to the host address; the other send variants take the node off the
/// descriptors.
pub fn build_write(seq: u8, command: Command, params: &[ParameterValue]) -> ProtocolResult<Vec<u8>> {
    let node = match command {
        Command::SendParmWithAck | Command::SendParm => {
            common_node(params.iter().map(|pv| pv.param.node))?
        }
        Command::SendParmBroadcast => HOST_ADDRESS,
        _ => return Err(ProtocolError::UnknownCommand(command.into())),
    };

    let mut payload = vec![command.into()];
    encode_chain(&mut payload, params.iter().map(|pv| (pv.param, Some(&pv.value))))?;

    encode_message(seq, node, &payload)
}

/// Build the payload an instrument answers a read with.
pub fn encode_values(params: &[ParameterValue]) -> ProtocolResult<Vec<u8>> {
    let mut payload = vec![Command::SendParm.into()];
    encode_chain(&mut payload, params.iter().map(|pv| (pv.param, Some(&pv.value))))?;
    Ok(payload)
}

/// Build the payload of a status answer.
#[inline]
pub fn encode_status(status: StatusCode, position: u8) -> Vec<u8> {
    vec![Command::Status.into(), status.code(), position]
}

/// Decode a response payload against the request that provoked it. The
/// expected descriptors supply the concrete value types; the wire carries
/// only the width class.
pub fn decode_response(payload: &[u8], expected: &[Parameter]) -> ProtocolResult<Response> {
    if payload.is_empty() {
        return Err(ProtocolError::MalformedMessage);
    }

    let command =
        Command::from_code(payload[0]).ok_or(ProtocolError::UnknownCommand(payload[0]))?;

    match command {
        Command::Status => {
            if payload.len() < 2 {
                return Err(ProtocolError::MalformedMessage);
            }

            Ok(Response::Status {
                status: StatusCode::from_code(payload[1]),
                position: payload.get(2).copied().unwrap_or(0),
            })
        }
        Command::SendParm => decode_values(&payload[1..], expected),
        other => Err(ProtocolError::UnknownCommand(other.into())),
    }
}

/// Decode the descriptor list of an inbound read request. Types are resolved
/// to the canonical type of each width class.
pub fn decode_read_request(payload: &[u8]) -> ProtocolResult<Vec<Parameter>> {
    if payload.first() != Some(&u8::from(Command::RequestParm)) {
        return Err(ProtocolError::UnknownCommand(
            payload.first().copied().unwrap_or(0xFF),
        ));
    }

    let mut cursor = Cursor::new(&payload[1..]);
    let mut params = Vec::new();

    walk_chain(&mut cursor, |_cursor, proc_nr, parm_byte| {
        let parm_type = ParameterType::from_type_bits(parm_byte & TYPE_MASK);
        params.push(Parameter {
            node: None,
            proc_nr,
            parm_nr: parm_byte & PARM_MASK,
            parm_type,
        });
        Ok(())
    })?;

    Ok(params)
}

/// Decode an inbound write. The resolver maps `(proc_nr, parm_nr)` to the
/// concrete parameter type; unresolved parameters fall back to the canonical
/// type of their width class.
pub fn decode_write<F>(payload: &[u8], resolve: F) -> ProtocolResult<(Command, Vec<ParameterValue>)>
where
    F: Fn(u8, u8) -> Option<ParameterType>,
{
    let command = Command::from_code(payload.first().copied().unwrap_or(0xFF))
        .ok_or(ProtocolError::UnknownCommand(payload.first().copied().unwrap_or(0xFF)))?;

    match command {
        Command::SendParmWithAck | Command::SendParm | Command::SendParmBroadcast => (),
        other => return Err(ProtocolError::UnknownCommand(other.into())),
    }

    let mut cursor = Cursor::new(&payload[1..]);
    let mut values = Vec::new();

    walk_chain(&mut cursor, |cursor, proc_nr, parm_byte| {
        let parm_nr = parm_byte & PARM_MASK;
        let parm_type = resolve(proc_nr, parm_nr)
            .unwrap_or_else(|| ParameterType::from_type_bits(parm_byte & TYPE_MASK));

        if parm_type.type_bits() != parm_byte & TYPE_MASK {
            return Err(ProtocolError::UnknownType);
        }

        let value = Value::read(cursor, parm_type)?;
        values.push(ParameterValue {
            param: Parameter {
                node: None,
                proc_nr,
                parm_nr,
                parm_type,
            },
            value,
        });
        Ok(())
    })?;

    Ok((command, values))
}

fn decode_values(data: &[u8], expected: &[Parameter]) -> ProtocolResult<Response> {
    let mut cursor = Cursor::new(data);
    let mut out = Vec::with_capacity(expected.len());
    let mut index = 0;

    walk_chain(&mut cursor, |cursor, proc_nr, parm_byte| {
        let exp = match expected.get(index) {
            Some(exp) => exp,
            None => return Err(ProtocolError::MalformedMessage),
        };

        if exp.parm_type.type_bits() != parm_byte & TYPE_MASK {
            return Err(ProtocolError::UnknownType);
        }

        if exp.proc_nr != proc_nr || exp.parm_nr != parm_byte & PARM_MASK {
            return Err(ProtocolError::MalformedMessage);
        }

        let value = Value::read(cursor, exp.parm_type)?;
        out.push(ParameterValue {
            param: *exp,
            value,
        });
        index += 1;
        Ok(())
    })?;

    if index != expected.len() {
        return Err(ProtocolError::TruncatedValue);
    }

    Ok(Response::Values(out))
}

/// Walk the chained payload structure, invoking the visitor once per
/// parameter with the cursor positioned at the value bytes (if any).
fn walk_chain<F>(cursor: &mut Cursor<&[u8]>, mut visit: F) -> ProtocolResult<()>
where
    F: FnMut(&mut Cursor<&[u8]>, u8, u8) -> ProtocolResult<()>,
{
    loop {
        if cursor.remaining_data() == 0 {
            return Err(ProtocolError::TruncatedValue);
        }

        let proc_byte = read_byte(cursor)?;
        let proc_chained = proc_byte & PROC_CHAIN != 0;
        let proc_nr = proc_byte & PROC_MASK;

        loop {
            let parm_byte = read_byte(cursor)?;
            let parm_chained = parm_byte & PARM_CHAIN != 0;

            visit(cursor, proc_nr, parm_byte & !PARM_CHAIN)?;

            if !parm_chained {
                break;
            }
        }

        if !proc_chained {
            return Ok(());
        }
    }
}

#[inline]
fn read_byte(cursor: &mut Cursor<&[u8]>) -> ProtocolResult<u8> {
    use byteorder::ReadBytesExt;

    if cursor.remaining_data() == 0 {
        return Err(ProtocolError::TruncatedValue);
    }

    cursor.read_u8().map_err(Into::into)
}

/// Append the chained descriptor structure (and values for writes) to a
/// payload, grouping consecutive descriptors by process number.
fn encode_chain<'a, I>(payload: &mut Vec<u8>, items: I) -> ProtocolResult<()>
where
    I: Iterator<Item = (Parameter, Option<&'a Value>)>,
{
    let items: Vec<_> = items.collect();

    if items.is_empty() {
        return Err(ProtocolError::MalformedMessage);
    }

    // Consecutive descriptors with the same process number share one group.
    let mut groups: Vec<Vec<(Parameter, Option<&Value>)>> = Vec::new();

    for item in items {
        match groups.last_mut() {
            Some(group) if group[0].0.proc_nr == item.0.proc_nr => group.push(item),
            _ => groups.push(vec![item]),
        }
    }

    let group_count = groups.len();

    for (group_index, group) in groups.into_iter().enumerate() {
        let mut proc_byte = group[0].0.proc_nr & PROC_MASK;
        if group_index + 1 < group_count {
            proc_byte |= PROC_CHAIN;
        }
        payload.push(proc_byte);

        let parm_count = group.len();

        for (parm_index, (param, value)) in group.into_iter().enumerate() {
            let mut parm_byte = (param.parm_nr & PARM_MASK) | param.parm_type.type_bits();
            if parm_index + 1 < parm_count {
                parm_byte |= PARM_CHAIN;
            }
            payload.push(parm_byte);

            if let Some(value) = value {
                if value.parameter_type() != param.parm_type {
                    return Err(ProtocolError::UnknownType);
                }

                append_value(payload, value)?;
            }
        }
    }

    Ok(())
}

fn append_value(payload: &mut Vec<u8>, value: &Value) -> ProtocolResult<()> {
    let mut raw = [0u8; 64];
    let mut cursor = Cursor::new(&mut raw[..]);
    value.write(&mut cursor)?;
    let len = cursor.position() as usize;
    payload.extend_from_slice(&raw[..len]);
    Ok(())
}

fn common_node<I: Iterator<Item = Option<u8>>>(mut nodes: I) -> ProtocolResult<u8> {
    let first = match nodes.next() {
        Some(Some(node)) => node,
        _ => return Err(ProtocolError::MissingNode),
    };

    for node in nodes {
        if node != Some(first) {
            return Err(ProtocolError::MissingNode);
        }
    }

    Ok(first)
}
